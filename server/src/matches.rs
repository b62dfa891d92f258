//! Match records: creation, edits, and the status state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::teams::{self, Team};
use common::{MatchResult, MatchStatus, MatchUpdate, NewMatch};
use rust_decimal::Decimal;
use tracing::debug;

use crate::database::{key, new_record_id, DbMatch, MATCH_TABLE};
use crate::error::{LedgerError, Result};

pub fn create(
    input: NewMatch,
    created_by: &str,
    default_odds: Decimal,
    now: DateTime<Utc>,
) -> Result<DbMatch> {
    let teams = match input.teams {
        Some([a, b]) => {
            let teams = [Team::new(a.full, a.short), Team::new(b.full, b.short)];
            teams::validate_teams(&teams)?;
            teams
        }
        None => teams::teams_from_title(&input.title)?,
    };

    validate_schedule(input.start_at, input.last_bet_time)?;
    validate_limits(input.min_bet, input.max_bet)?;

    let odds = match input.odds {
        Some(odds) => normalize_odds(odds)?,
        None => teams
            .iter()
            .map(|team| (team.short.clone(), default_odds))
            .collect(),
    };

    Ok(DbMatch {
        id: new_record_id(MATCH_TABLE),
        title: format!("{} vs {}", teams[0].full, teams[1].full),
        teams,
        odds,
        min_bet: input.min_bet,
        max_bet: input.max_bet,
        start_at: input.start_at,
        last_bet_time: input.last_bet_time,
        status: MatchStatus::Upcoming,
        result: MatchResult::Pending,
        created_by: Some(created_by.to_string()),
        created_at: now,
    })
}

/// Applies an admin edit. Terminal matches are frozen.
pub fn apply_update(record: &mut DbMatch, update: MatchUpdate) -> Result<()> {
    if record.status.is_terminal() {
        return Err(LedgerError::MatchClosed {
            match_id: key(&record.id),
            status: record.status,
        });
    }

    let start_at = update.start_at.unwrap_or(record.start_at);
    let last_bet_time = update.last_bet_time.unwrap_or(record.last_bet_time);
    let min_bet = update.min_bet.or(record.min_bet);
    let max_bet = update.max_bet.or(record.max_bet);
    validate_schedule(start_at, last_bet_time)?;
    validate_limits(min_bet, max_bet)?;

    if let Some(odds) = update.odds {
        record.odds = normalize_odds(odds)?;
    }
    record.start_at = start_at;
    record.last_bet_time = last_bet_time;
    record.min_bet = min_bet;
    record.max_bet = max_bet;
    Ok(())
}

/// Locks a match whose betting window has passed. Returns whether the record
/// changed and needs to be written back.
pub fn refresh(record: &mut DbMatch, now: DateTime<Utc>) -> bool {
    if record.status.accepts_bets() && now >= record.last_bet_time {
        debug!(match_id = %key(&record.id), from = %record.status, "betting window closed, locking match");
        record.status = MatchStatus::Locked;
        return true;
    }
    false
}

/// Admin-driven status change. COMPLETED and CANCELLED are only reached by
/// declaring a result or cancelling the match.
pub fn transition(record: &mut DbMatch, to: MatchStatus) -> Result<()> {
    let allowed = matches!(to, MatchStatus::Upcoming | MatchStatus::Live | MatchStatus::Locked)
        && record.status.can_transition_to(to);
    if !allowed {
        return Err(LedgerError::InvalidTransition {
            match_id: key(&record.id),
            from: record.status,
            to,
        });
    }
    record.status = to;
    Ok(())
}

/// Multiplier for `team`: its short code, then its full name, then the
/// configured default.
pub fn odds_for(record: &DbMatch, team: &Team, default_odds: Decimal) -> Decimal {
    if let Some(odds) = record.odds.get(&team.short.to_uppercase()) {
        return *odds;
    }
    record
        .odds
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(team.full.trim()))
        .map(|(_, odds)| *odds)
        .unwrap_or(default_odds)
}

fn validate_schedule(start_at: DateTime<Utc>, last_bet_time: DateTime<Utc>) -> Result<()> {
    if last_bet_time >= start_at {
        return Err(LedgerError::Validation(
            "last bet time must be before the match start".to_string(),
        ));
    }
    Ok(())
}

fn validate_limits(min_bet: Option<Decimal>, max_bet: Option<Decimal>) -> Result<()> {
    for limit in [min_bet, max_bet].into_iter().flatten() {
        if limit <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!("bet limit must be positive, got {limit}")));
        }
    }
    if let (Some(min), Some(max)) = (min_bet, max_bet) {
        if min > max {
            return Err(LedgerError::Validation(format!(
                "minimum bet {min} exceeds maximum bet {max}"
            )));
        }
    }
    Ok(())
}

fn normalize_odds(odds: BTreeMap<String, Decimal>) -> Result<BTreeMap<String, Decimal>> {
    odds.into_iter()
        .map(|(name, multiplier)| {
            let name = name.trim().to_uppercase();
            if name.is_empty() {
                return Err(LedgerError::Validation("odds key must not be empty".to_string()));
            }
            if multiplier < Decimal::ONE {
                return Err(LedgerError::Validation(format!(
                    "odds for {name} must be at least 1, got {multiplier}"
                )));
            }
            Ok((name, multiplier))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn fixture(title: &str) -> NewMatch {
        let now = Utc::now();
        NewMatch::new(title, now + Duration::hours(2), now + Duration::hours(1))
    }

    #[test]
    fn creation_derives_teams_and_default_odds() {
        let record = create(fixture("  india  VS australia "), "admin", dec!(1.98), Utc::now()).unwrap();
        assert_eq!(record.title, "india vs australia");
        assert_eq!(record.teams[0], Team::new("india", "IND"));
        assert_eq!(record.teams[1].short, "AUS");
        assert_eq!(record.odds.get("IND"), Some(&dec!(1.98)));
        assert_eq!(record.odds.get("AUS"), Some(&dec!(1.98)));
        assert_eq!(record.status, MatchStatus::Upcoming);
        assert_eq!(record.result, MatchResult::Pending);
    }

    #[test]
    fn creation_validates_input() {
        assert!(matches!(
            create(fixture("India Australia"), "admin", dec!(1.98), Utc::now()),
            Err(LedgerError::Validation(_))
        ));

        let mut late = fixture("India vs Australia");
        late.last_bet_time = late.start_at;
        assert!(create(late, "admin", dec!(1.98), Utc::now()).is_err());

        let mut limits = fixture("India vs Australia");
        limits.min_bet = Some(dec!(50));
        limits.max_bet = Some(dec!(10));
        assert!(create(limits, "admin", dec!(1.98), Utc::now()).is_err());

        let mut odds = fixture("India vs Australia");
        odds.odds = Some(BTreeMap::from([("IND".to_string(), dec!(0.9))]));
        assert!(create(odds, "admin", dec!(1.98), Utc::now()).is_err());
    }

    #[test]
    fn odds_lookup_falls_back() {
        let mut input = fixture("India vs Australia");
        input.odds = Some(BTreeMap::from([
            ("ind".to_string(), dec!(1.50)),
            ("Australia".to_string(), dec!(2.40)),
        ]));
        let record = create(input, "admin", dec!(1.98), Utc::now()).unwrap();
        assert_eq!(odds_for(&record, &record.teams[0], dec!(1.98)), dec!(1.50));
        assert_eq!(odds_for(&record, &record.teams[1], dec!(1.98)), dec!(2.40));

        let mut record = record;
        record.odds.clear();
        assert_eq!(odds_for(&record, &record.teams[0], dec!(1.98)), dec!(1.98));
    }

    #[test]
    fn lazy_lock_after_cutoff() {
        let mut record = create(fixture("India vs Australia"), "admin", dec!(1.98), Utc::now()).unwrap();
        assert!(!refresh(&mut record, Utc::now()));
        assert_eq!(record.status, MatchStatus::Upcoming);

        let cutoff = record.last_bet_time;
        assert!(refresh(&mut record, cutoff));
        assert_eq!(record.status, MatchStatus::Locked);
        assert!(!refresh(&mut record, cutoff));
    }

    #[test]
    fn admin_transitions() {
        let mut record = create(fixture("India vs Australia"), "admin", dec!(1.98), Utc::now()).unwrap();
        transition(&mut record, MatchStatus::Live).unwrap();
        transition(&mut record, MatchStatus::Locked).unwrap();
        assert!(matches!(
            transition(&mut record, MatchStatus::Live),
            Err(LedgerError::InvalidTransition { .. })
        ));
        assert!(transition(&mut record, MatchStatus::Completed).is_err());
        assert!(transition(&mut record, MatchStatus::Cancelled).is_err());
    }

    #[test]
    fn terminal_matches_are_frozen() {
        let mut record = create(fixture("India vs Australia"), "admin", dec!(1.98), Utc::now()).unwrap();
        apply_update(
            &mut record,
            MatchUpdate {
                min_bet: Some(dec!(10)),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(record.min_bet, Some(dec!(10)));

        record.status = MatchStatus::Cancelled;
        assert!(matches!(
            apply_update(&mut record, MatchUpdate::default()),
            Err(LedgerError::MatchClosed { .. })
        ));
    }
}
