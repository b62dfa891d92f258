//! Canonical side and outcome normalization.
//!
//! Bet placement and result declaration both resolve free-form input through
//! this module, so the sides a user may back and the sides that get paid are
//! always the same set. A side is accepted by full team name, by short code,
//! or by the first three letters of the full name, all compared after
//! trimming and lower-casing. The canonical form of a side is the team's full
//! name in lower case.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inputs that declare a draw regardless of the team names.
pub const DRAW_ALIASES: [&str; 4] = ["draw", "abandoned", "no-result", "nr"];

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TeamError {
    #[error("Title must be in format: 'TeamA vs TeamB', got '{0}'")]
    MalformedTitle(String),

    #[error("team names and short codes must not be empty")]
    EmptyName,

    #[error("team '{0}' clashes with the other team or a reserved draw alias")]
    AliasCollision(String),

    #[error("Invalid side '{given}'. Valid: {valid}")]
    InvalidSide { given: String, valid: String },

    #[error("Invalid result '{given}'. Valid: {valid}")]
    InvalidResult { given: String, valid: String },

    #[error("'{given}' matches both teams, use the full team name")]
    Ambiguous { given: String },
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Team {
    pub full: String,
    pub short: String,
}

impl Team {
    pub fn new(full: impl AsRef<str>, short: impl AsRef<str>) -> Self {
        Self {
            full: full.as_ref().trim().to_string(),
            short: short.as_ref().trim().to_uppercase(),
        }
    }

    /// A team whose short code is derived from its full name.
    pub fn from_full(full: impl AsRef<str>) -> Self {
        let full = full.as_ref().trim();
        Self::new(full, short_code(full))
    }

    pub fn canonical(&self) -> String {
        normalize(&self.full)
    }

    fn aliases(&self) -> [String; 3] {
        [
            self.canonical(),
            normalize(&self.short),
            normalize(&short_code(&self.full)),
        ]
    }

    fn answers_to(&self, normalized: &str) -> bool {
        self.aliases().iter().any(|alias| alias == normalized)
    }

    fn label(&self) -> String {
        format!("{} ({})", self.full.to_uppercase(), self.short.to_uppercase())
    }
}

/// Outcome of a match once declared.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Outcome {
    Draw,
    /// Canonical (lower-cased full) name of the winning team.
    Winner(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Draw => write!(f, "DRAW"),
            Outcome::Winner(team) => write!(f, "{team}"),
        }
    }
}

pub fn normalize(input: &str) -> String {
    input.trim().to_lowercase()
}

/// First three letters of a name, upper-cased.
pub fn short_code(full: &str) -> String {
    full.trim().chars().take(3).collect::<String>().to_uppercase()
}

/// Splits "TeamA vs TeamB" on the standalone word `vs` (any case).
pub fn teams_from_title(title: &str) -> Result<[Team; 2], TeamError> {
    let tokens: Vec<&str> = title.split_whitespace().collect();
    let separators: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, token)| token.eq_ignore_ascii_case("vs") || token.eq_ignore_ascii_case("vs."))
        .map(|(index, _)| index)
        .collect();

    let &[split] = separators.as_slice() else {
        return Err(TeamError::MalformedTitle(title.to_string()));
    };
    let left = tokens[..split].join(" ");
    let right = tokens[split + 1..].join(" ");
    if left.is_empty() || right.is_empty() {
        return Err(TeamError::MalformedTitle(title.to_string()));
    }

    let teams = [Team::from_full(left), Team::from_full(right)];
    validate_teams(&teams)?;
    Ok(teams)
}

/// Both teams must stay individually addressable: neither full name may be an
/// alias of the opponent, short codes must differ, and no alias may shadow a
/// draw keyword.
pub fn validate_teams(teams: &[Team; 2]) -> Result<(), TeamError> {
    for team in teams {
        if team.full.trim().is_empty() || team.short.trim().is_empty() {
            return Err(TeamError::EmptyName);
        }
        if team.aliases().iter().any(|alias| DRAW_ALIASES.contains(&alias.as_str())) {
            return Err(TeamError::AliasCollision(team.full.clone()));
        }
    }

    let [a, b] = teams;
    if normalize(&a.short) == normalize(&b.short) {
        return Err(TeamError::AliasCollision(b.full.clone()));
    }
    if b.answers_to(&a.canonical()) {
        return Err(TeamError::AliasCollision(a.full.clone()));
    }
    if a.answers_to(&b.canonical()) {
        return Err(TeamError::AliasCollision(b.full.clone()));
    }
    Ok(())
}

/// "INDIA (IND) or AUSTRALIA (AUS)"
pub fn valid_sides(teams: &[Team; 2]) -> String {
    teams.iter().map(Team::label).collect::<Vec<_>>().join(" or ")
}

/// Resolves a bettable side. Draw keywords are not sides.
pub fn resolve_side<'a>(teams: &'a [Team; 2], input: &str) -> Result<&'a Team, TeamError> {
    let given = normalize(input);

    if let Some(exact) = teams.iter().find(|team| team.canonical() == given) {
        return Ok(exact);
    }

    let mut candidates = teams.iter().filter(|team| !given.is_empty() && team.answers_to(&given));
    match (candidates.next(), candidates.next()) {
        (Some(team), None) => Ok(team),
        (Some(_), Some(_)) => Err(TeamError::Ambiguous { given }),
        _ => Err(TeamError::InvalidSide {
            given: input.trim().to_string(),
            valid: valid_sides(teams),
        }),
    }
}

/// Resolves a declared result into a draw or a canonical winning team.
pub fn resolve_outcome(teams: &[Team; 2], input: &str) -> Result<Outcome, TeamError> {
    let given = normalize(input);
    if DRAW_ALIASES.contains(&given.as_str()) {
        return Ok(Outcome::Draw);
    }

    match resolve_side(teams, input) {
        Ok(team) => Ok(Outcome::Winner(team.canonical())),
        Err(TeamError::InvalidSide { given, valid }) => Err(TeamError::InvalidResult {
            given,
            valid: format!("{valid} or DRAW"),
        }),
        Err(other) => Err(other),
    }
}
