use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod network;
pub mod teams;

pub use teams::{Outcome, Team, TeamError};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// Display uses the serde spelling.
macro_rules! named_variants {
    ($ty:ident, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

named_variants!(Role, { User => "user", Admin => "admin" });

/// Authenticated caller, supplied by whatever sits in front of the engine.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Upcoming,
    Live,
    Locked,
    #[serde(alias = "RESULT_DECLARED")]
    Completed,
    Cancelled,
}

named_variants!(MatchStatus, {
    Upcoming => "UPCOMING",
    Live => "LIVE",
    Locked => "LOCKED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

impl MatchStatus {
    pub fn accepts_bets(&self) -> bool {
        matches!(self, MatchStatus::Upcoming | MatchStatus::Live)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Cancelled)
    }

    /// UPCOMING -> LIVE -> LOCKED -> COMPLETED, any non-terminal state may be
    /// cancelled. Result corrections on a COMPLETED match are not status
    /// transitions and are not covered here.
    pub fn can_transition_to(&self, next: MatchStatus) -> bool {
        use MatchStatus::*;
        match (self, next) {
            (Upcoming, Live | Locked | Completed | Cancelled) => true,
            (Live, Locked | Completed | Cancelled) => true,
            (Locked, Completed | Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BetStatus {
    Pending,
    Won,
    Lost,
    Refunded,
    Cancelled,
}

named_variants!(BetStatus, {
    Pending => "PENDING",
    Won => "WON",
    Lost => "LOST",
    Refunded => "REFUNDED",
    Cancelled => "CANCELLED",
});

impl BetStatus {
    /// Terminal states produced by settlement, the ones a result correction
    /// has to unwind.
    pub fn is_settled(&self) -> bool {
        matches!(self, BetStatus::Won | BetStatus::Lost | BetStatus::Refunded)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    BetStake,
    BetWin,
    BetLost,
    Reversal,
    AdminCredit,
    AdminDebit,
}

named_variants!(TransactionKind, {
    Deposit => "DEPOSIT",
    Withdraw => "WITHDRAW",
    BetStake => "BET_STAKE",
    BetWin => "BET_WIN",
    BetLost => "BET_LOST",
    Reversal => "REVERSAL",
    AdminCredit => "ADMIN_CREDIT",
    AdminDebit => "ADMIN_DEBIT",
});

/// Declared result of a match: "PENDING", "DRAW", or the canonical name of
/// the winning team.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
#[serde(into = "String", try_from = "String")]
pub enum MatchResult {
    #[default]
    Pending,
    Draw,
    Winner(String),
}

impl MatchResult {
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            MatchResult::Pending => None,
            MatchResult::Draw => Some(Outcome::Draw),
            MatchResult::Winner(team) => Some(Outcome::Winner(team.clone())),
        }
    }

    pub fn is_declared(&self) -> bool {
        !matches!(self, MatchResult::Pending)
    }
}

impl From<Outcome> for MatchResult {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Draw => MatchResult::Draw,
            Outcome::Winner(team) => MatchResult::Winner(team),
        }
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchResult::Pending => write!(f, "PENDING"),
            MatchResult::Draw => write!(f, "DRAW"),
            MatchResult::Winner(team) => write!(f, "{team}"),
        }
    }
}

impl From<MatchResult> for String {
    fn from(value: MatchResult) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for MatchResult {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            "" => Err(UnknownVariant { kind: "match result", value: String::new() }),
            "PENDING" => Ok(MatchResult::Pending),
            "DRAW" => Ok(MatchResult::Draw),
            team => Ok(MatchResult::Winner(teams::normalize(team))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct WalletSnapshot {
    pub balance: Decimal,
    pub exposure: Decimal,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub blocked: bool,
    pub wallet: WalletSnapshot,
    pub created_at: DateTime<Utc>,
}

// A potential, unrealised user. Used by an admin to create a fully realised one
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct NewUser {
    pub name: String,
    pub role: Role,
    pub credential_hash: Option<String>,
}

impl NewUser {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::User,
            credential_hash: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Match {
    pub id: String,
    pub title: String,
    pub teams: [Team; 2],
    pub odds: BTreeMap<String, Decimal>,
    pub min_bet: Option<Decimal>,
    pub max_bet: Option<Decimal>,
    pub start_at: DateTime<Utc>,
    pub last_bet_time: DateTime<Utc>,
    pub status: MatchStatus,
    pub result: MatchResult,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct NewMatch {
    pub title: String,
    /// Derived from the title when absent.
    pub teams: Option<[Team; 2]>,
    pub start_at: DateTime<Utc>,
    pub last_bet_time: DateTime<Utc>,
    pub min_bet: Option<Decimal>,
    pub max_bet: Option<Decimal>,
    /// Defaults to the default multiplier on both short codes.
    pub odds: Option<BTreeMap<String, Decimal>>,
}

impl NewMatch {
    pub fn new(title: impl Into<String>, start_at: DateTime<Utc>, last_bet_time: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            teams: None,
            start_at,
            last_bet_time,
            min_bet: None,
            max_bet: None,
            odds: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct MatchUpdate {
    pub odds: Option<BTreeMap<String, Decimal>>,
    pub min_bet: Option<Decimal>,
    pub max_bet: Option<Decimal>,
    pub start_at: Option<DateTime<Utc>>,
    pub last_bet_time: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Bet {
    pub id: String,
    pub user_id: String,
    pub match_id: String,
    /// Canonical side: the lower-cased full name of the backed team.
    pub side: String,
    pub stake: Decimal,
    pub potential_win: Decimal,
    pub win_amount: Decimal,
    pub status: BetStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct TransactionMeta {
    pub match_id: Option<String>,
    pub bet_id: Option<String>,
    pub side: Option<String>,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub added_by: Option<String>,
    pub withdrawn_by: Option<String>,
    /// Part of a reversal that could not be taken from the free balance.
    pub shortfall: Option<Decimal>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Transaction {
    pub id: String,
    pub seq: u64,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub exposure_after: Decimal,
    pub meta: TransactionMeta,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct TransactionFilter {
    /// Ignored for non-admin callers, who only ever see their own entries.
    pub user_id: Option<String>,
    pub kind: Option<TransactionKind>,
    pub match_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct BetFilter {
    pub user_id: Option<String>,
    pub match_id: Option<String>,
    pub status: Option<BetStatus>,
}

/// 1-based page request. A zero limit means "server default".
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 0 }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct SettlementSummary {
    pub match_id: String,
    pub result: MatchResult,
    pub won: u32,
    pub lost: u32,
    pub refunded: u32,
    /// Bets whose earlier settlement was unwound by a result correction.
    pub reversed: u32,
    /// Bets left untouched: already settled, gone, or owned by a missing user.
    pub skipped: u32,
    pub paid_out: Decimal,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct RefundSummary {
    pub match_id: String,
    pub refunded: u32,
    pub skipped: u32,
    pub total_refunded: Decimal,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct DashboardStats {
    pub users: u64,
    pub matches: u64,
    pub active_bets: u64,
    pub admin_credit_total: Decimal,
}

/// Coarse error classes a caller can act on.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Malformed input, fix the request.
    Validation,
    /// Rejected by the current state of a match or bet.
    StateConflict,
    /// Insufficient funds or blocked wallet.
    Funds,
    NotFound,
    Forbidden,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kinds_are_rejected_not_coerced() {
        let known = rmp_serde::to_vec(&"BET_WIN").unwrap();
        assert_eq!(
            rmp_serde::from_slice::<TransactionKind>(&known).unwrap(),
            TransactionKind::BetWin
        );
        assert_eq!(TransactionKind::BetWin.to_string(), "BET_WIN");

        let bonus = rmp_serde::to_vec(&"BONUS").unwrap();
        assert!(rmp_serde::from_slice::<TransactionKind>(&bonus).is_err());
        let settled = rmp_serde::to_vec(&"SETTLED").unwrap();
        assert!(rmp_serde::from_slice::<BetStatus>(&settled).is_err());
    }

    #[test]
    fn match_state_machine() {
        use MatchStatus::*;
        assert!(Upcoming.can_transition_to(Live));
        assert!(Live.can_transition_to(Locked));
        assert!(Locked.can_transition_to(Completed));
        assert!(Live.can_transition_to(Cancelled));
        assert!(!Locked.can_transition_to(Live));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Upcoming));
        assert!(Upcoming.accepts_bets() && Live.accepts_bets() && !Locked.accepts_bets());
    }

    #[test]
    fn match_result_string_form() {
        assert_eq!(MatchResult::try_from("PENDING".to_string()), Ok(MatchResult::Pending));
        assert_eq!(MatchResult::try_from("DRAW".to_string()), Ok(MatchResult::Draw));
        assert_eq!(
            MatchResult::try_from(" India ".to_string()),
            Ok(MatchResult::Winner("india".into()))
        );
        assert!(MatchResult::try_from(String::new()).is_err());
        assert_eq!(String::from(MatchResult::Winner("india".into())), "india");
    }
}
