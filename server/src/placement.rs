//! Bet placement checks.
//!
//! Each check maps to its own error so callers can tell exactly why a stake
//! was refused. Nothing here touches the store: `stake_bet` mutates the
//! in-memory user and hands back the bet, and the store actor commits both
//! together with the stake's ledger entry.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::teams;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::database::{key, DbBet, DbMatch, DbUser};
use crate::error::{LedgerError, Result};
use crate::matches;

/// Stakes are whole cents.
const STAKE_SCALE: u32 = 2;

pub fn parse_stake(raw: &str) -> Result<Decimal> {
    let stake = Decimal::from_str(raw.trim())
        .map_err(|_| LedgerError::InvalidStake(raw.trim().to_string()))?
        .normalize();
    if stake <= Decimal::ZERO || stake.scale() > STAKE_SCALE {
        return Err(LedgerError::InvalidStake(raw.trim().to_string()));
    }
    Ok(stake)
}

pub fn potential_win(stake: Decimal, odds: Decimal) -> Decimal {
    (stake * odds).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn check_open(record: &DbMatch, now: DateTime<Utc>) -> Result<()> {
    if !record.status.accepts_bets() || now >= record.last_bet_time {
        return Err(LedgerError::BettingClosed {
            match_id: key(&record.id),
            status: record.status,
        });
    }
    Ok(())
}

pub fn check_range(record: &DbMatch, stake: Decimal) -> Result<()> {
    let below = record.min_bet.is_some_and(|min| stake < min);
    let above = record.max_bet.is_some_and(|max| stake > max);
    if below || above {
        return Err(LedgerError::StakeOutOfRange {
            stake,
            min: bound(record.min_bet),
            max: bound(record.max_bet),
        });
    }
    Ok(())
}

fn bound(limit: Option<Decimal>) -> String {
    limit.map_or_else(|| "unbounded".to_string(), |limit| limit.to_string())
}

/// Runs the checks that follow the match lookup, in order, and moves the
/// stake from the user's balance into exposure. On error the user is left
/// untouched.
pub fn stake_bet(
    user: &mut DbUser,
    record: &DbMatch,
    side: &str,
    stake: Decimal,
    default_odds: Decimal,
    now: DateTime<Utc>,
) -> Result<DbBet> {
    check_open(record, now)?;
    check_range(record, stake)?;
    let team = teams::resolve_side(&record.teams, side)?;

    if user.blocked {
        return Err(LedgerError::UserBlocked(key(&user.id)));
    }
    user.wallet.debit_for_stake(stake)?;

    let odds = matches::odds_for(record, team, default_odds);
    Ok(DbBet::new(
        user.id.clone(),
        record.id.clone(),
        team.canonical(),
        stake,
        potential_win(stake, odds),
        now,
    ))
}
