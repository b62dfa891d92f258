use common::{ErrorKind, MatchStatus, TeamError};
use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid stake amount: {0}")]
    InvalidStake(String),

    #[error("Invalid side '{given}'. Valid: {valid}")]
    InvalidSide { given: String, valid: String },

    #[error("Stake {stake} outside the allowed range {min}..={max}")]
    StakeOutOfRange {
        stake: Decimal,
        min: String,
        max: String,
    },

    #[error("{0}")]
    Validation(String),

    #[error("Betting closed for match {match_id} ({status})")]
    BettingClosed { match_id: String, status: MatchStatus },

    #[error("Bet {0} is already settled")]
    AlreadySettled(String),

    #[error("Match {match_id} is already {status}")]
    MatchClosed { match_id: String, status: MatchStatus },

    #[error("Match {match_id} cannot move from {from} to {to}")]
    InvalidTransition {
        match_id: String,
        from: MatchStatus,
        to: MatchStatus,
    },

    #[error("Insufficient wallet balance: available {available}, requested {requested}")]
    InsufficientFunds {
        available: Decimal,
        requested: Decimal,
    },

    #[error("User {0} is blocked")]
    UserBlocked(String),

    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("Match {0} not found")]
    MatchNotFound(String),

    #[error("Bet {0} not found")]
    BetNotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("storage error: {0}")]
    Storage(#[from] surrealdb::Error),

    #[error("ledger inconsistency: {0}")]
    Inconsistency(String),

    #[error("betting engine is shutting down")]
    Unavailable,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidStake(_)
            | LedgerError::InvalidSide { .. }
            | LedgerError::StakeOutOfRange { .. }
            | LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::BettingClosed { .. }
            | LedgerError::AlreadySettled(_)
            | LedgerError::MatchClosed { .. }
            | LedgerError::InvalidTransition { .. } => ErrorKind::StateConflict,
            LedgerError::InsufficientFunds { .. } | LedgerError::UserBlocked(_) => ErrorKind::Funds,
            LedgerError::UserNotFound(_)
            | LedgerError::MatchNotFound(_)
            | LedgerError::BetNotFound(_) => ErrorKind::NotFound,
            LedgerError::Forbidden(_) => ErrorKind::Forbidden,
            LedgerError::Storage(_) | LedgerError::Inconsistency(_) | LedgerError::Unavailable => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<TeamError> for LedgerError {
    fn from(error: TeamError) -> Self {
        match error {
            TeamError::InvalidSide { given, valid } => LedgerError::InvalidSide { given, valid },
            other => LedgerError::Validation(other.to_string()),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LedgerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LedgerError::Unavailable
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for LedgerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        LedgerError::Unavailable
    }
}
