//! Match settlement.
//!
//! The first half of this module is the per-bet arithmetic: what a declared
//! outcome, a refund, or a result correction does to one bet and its owner's
//! wallet. The store actor runs it and commits the bet, the wallet and the
//! ledger entry in one transaction.
//!
//! The second half is the `SettlementManager`, which walks the bets of a
//! match one at a time. Work on the same match is serialized by a per-match
//! lock; different matches settle concurrently. Every per-bet step checks the
//! bet's current status first, so a run that stops halfway can simply be
//! repeated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::teams::{self, Outcome};
use common::{BetStatus, MatchResult, MatchStatus, RefundSummary, SettlementSummary, TransactionKind};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::database::{key, DbBet};
use crate::database_manager::{ask, DatabaseRequest, Responder};
use crate::error::{LedgerError, Result};
use crate::wallet::Wallet;

/// What happened to a single bet during a settlement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetOutcome {
    Won(Decimal),
    Lost,
    Refunded(Decimal),
    Reversed,
    Skipped,
}

/// Ledger side of one applied settlement step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub outcome: BetOutcome,
}

/// Settles a PENDING bet. Exposure for the stake is always released.
pub fn apply_outcome(bet: &mut DbBet, wallet: &mut Wallet, outcome: &Outcome, now: DateTime<Utc>) -> Applied {
    wallet.release_exposure(bet.stake);
    bet.settled_at = Some(now);

    match outcome {
        Outcome::Draw => {
            wallet.credit(bet.stake);
            bet.status = BetStatus::Refunded;
            bet.win_amount = Decimal::ZERO;
            Applied {
                kind: TransactionKind::Reversal,
                amount: bet.stake,
                outcome: BetOutcome::Refunded(bet.stake),
            }
        }
        Outcome::Winner(team) if *team == bet.side => {
            wallet.credit(bet.potential_win);
            bet.status = BetStatus::Won;
            bet.win_amount = bet.potential_win;
            Applied {
                kind: TransactionKind::BetWin,
                amount: bet.potential_win,
                outcome: BetOutcome::Won(bet.potential_win),
            }
        }
        Outcome::Winner(_) => {
            bet.status = BetStatus::Lost;
            bet.win_amount = Decimal::ZERO;
            Applied {
                kind: TransactionKind::BetLost,
                amount: Decimal::ZERO,
                outcome: BetOutcome::Lost,
            }
        }
    }
}

/// Refunds a PENDING bet on a cancelled match.
pub fn refund(bet: &mut DbBet, wallet: &mut Wallet, now: DateTime<Utc>) -> Applied {
    apply_outcome(bet, wallet, &Outcome::Draw, now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reversal {
    /// Signed ledger amount actually taken back.
    pub amount: Decimal,
    /// Part of the earlier credit the free balance could not cover.
    pub shortfall: Decimal,
}

/// Undoes an earlier settlement and puts the bet back to PENDING with its
/// stake locked again, so the next settlement treats it like a fresh bet.
pub fn reverse_settlement(bet: &mut DbBet, wallet: &mut Wallet) -> Reversal {
    let credited = match bet.status {
        BetStatus::Won => bet.win_amount,
        BetStatus::Refunded => bet.stake,
        _ => Decimal::ZERO,
    };
    let taken = wallet.debit_up_to(credited);
    wallet.lock_exposure(bet.stake);

    bet.status = BetStatus::Pending;
    bet.win_amount = Decimal::ZERO;
    bet.settled_at = None;

    Reversal {
        amount: -taken,
        shortfall: credited - taken,
    }
}

/// One mutex per match id, created on first use and dropped again once
/// nobody holds or waits for it.
#[derive(Clone, Default)]
pub struct MatchLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl MatchLocks {
    pub async fn lock(&self, match_id: &str) -> MatchGuard {
        let lock = self.locks.entry(match_id.to_string()).or_default().clone();
        MatchGuard {
            guard: Some(lock.lock_owned().await),
            match_id: match_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.len()
    }
}

pub struct MatchGuard {
    guard: Option<OwnedMutexGuard<()>>,
    match_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for MatchGuard {
    fn drop(&mut self) {
        // unlock first so our own Arc no longer counts
        self.guard.take();
        // the shard lock is held across the check, so no waiter can clone in between
        self.locks
            .remove_if(&self.match_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub enum SettlementRequest {
    DeclareResult {
        match_id: String,
        result: String,
        responder: Responder<SettlementSummary>,
    },
    CancelMatch {
        match_id: String,
        responder: Responder<RefundSummary>,
    },
    CancelBet {
        user_id: String,
        bet_id: String,
        responder: Responder<common::WalletSnapshot>,
    },
}

pub struct SettlementManager {
    work_queue: mpsc::Receiver<SettlementRequest>,
    settler: Settler,
    shutdown: watch::Receiver<bool>,
}

//NOTE: No functions in this impl may crash
impl SettlementManager {
    pub fn new(
        work_queue: mpsc::Receiver<SettlementRequest>,
        database_requester: mpsc::Sender<DatabaseRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            work_queue,
            settler: Settler {
                database: database_requester,
                locks: MatchLocks::default(),
            },
            shutdown,
        }
    }

    pub async fn manage(&mut self) {
        loop {
            let request = tokio::select! {
                request = self.work_queue.recv() => request,
                _ = self.shutdown.changed() => None,
            };
            let Some(request) = request else {
                break;
            };

            let settler = self.settler.clone();
            tokio::spawn(async move {
                // we do not care if the receiver has already disappeared
                match request {
                    SettlementRequest::DeclareResult {
                        match_id,
                        result,
                        responder,
                    } => {
                        responder.send(settler.declare_result(&match_id, &result).await).ok();
                    }
                    SettlementRequest::CancelMatch { match_id, responder } => {
                        responder.send(settler.cancel_match(&match_id).await).ok();
                    }
                    SettlementRequest::CancelBet {
                        user_id,
                        bet_id,
                        responder,
                    } => {
                        responder.send(settler.cancel_bet(&user_id, &bet_id).await).ok();
                    }
                }
            });
        }
        info!("settlement manager stopped");
    }
}

#[derive(Clone)]
struct Settler {
    database: mpsc::Sender<DatabaseRequest>,
    locks: MatchLocks,
}

impl Settler {
    async fn declare_result(&self, match_id: &str, result: &str) -> Result<SettlementSummary> {
        let _guard = self.locks.lock(match_id).await;

        let record = ask(&self.database, |responder| DatabaseRequest::GetMatch {
            id: match_id.to_string(),
            responder,
        })
        .await?
        .ok_or_else(|| LedgerError::MatchNotFound(match_id.to_string()))?;

        if record.status == MatchStatus::Cancelled {
            return Err(LedgerError::MatchClosed {
                match_id: match_id.to_string(),
                status: record.status,
            });
        }

        let outcome = teams::resolve_outcome(&record.teams, result)?;
        let declared = MatchResult::from(outcome.clone());
        let mut summary = SettlementSummary {
            match_id: match_id.to_string(),
            result: declared.clone(),
            ..Default::default()
        };

        if record.result.is_declared() && record.result != declared {
            info!(match_id, from = %record.result, to = %declared, "correcting declared result");
            for bet in self.bets_for(match_id).await? {
                if !bet.status.is_settled() {
                    continue;
                }
                let bet_id = key(&bet.id);
                match ask(&self.database, |responder| DatabaseRequest::ReverseBet { bet_id, responder }).await {
                    Ok(BetOutcome::Reversed) => summary.reversed += 1,
                    Ok(_) => summary.skipped += 1,
                    Err(error) => {
                        error!(match_id, %error, "reversal failed, settlement can be re-run");
                        return Err(error);
                    }
                }
            }
        }

        ask(&self.database, |responder| DatabaseRequest::RecordResult {
            match_id: match_id.to_string(),
            result: declared.clone(),
            responder,
        })
        .await?;

        for bet in self.bets_for(match_id).await? {
            if bet.status != BetStatus::Pending {
                summary.skipped += 1;
                continue;
            }
            let bet_id = key(&bet.id);
            let outcome = outcome.clone();
            match ask(&self.database, |responder| DatabaseRequest::SettleBet {
                bet_id,
                outcome,
                responder,
            })
            .await
            {
                Ok(BetOutcome::Won(amount)) => {
                    summary.won += 1;
                    summary.paid_out += amount;
                }
                Ok(BetOutcome::Refunded(amount)) => {
                    summary.refunded += 1;
                    summary.paid_out += amount;
                }
                Ok(BetOutcome::Lost) => summary.lost += 1,
                Ok(_) => summary.skipped += 1,
                Err(error) => {
                    error!(match_id, %error, "settlement failed, settlement can be re-run");
                    return Err(error);
                }
            }
        }

        info!(
            match_id,
            result = %summary.result,
            won = summary.won,
            lost = summary.lost,
            refunded = summary.refunded,
            reversed = summary.reversed,
            skipped = summary.skipped,
            paid_out = %summary.paid_out,
            "match settled"
        );
        Ok(summary)
    }

    async fn cancel_match(&self, match_id: &str) -> Result<RefundSummary> {
        let _guard = self.locks.lock(match_id).await;

        let record = ask(&self.database, |responder| DatabaseRequest::GetMatch {
            id: match_id.to_string(),
            responder,
        })
        .await?
        .ok_or_else(|| LedgerError::MatchNotFound(match_id.to_string()))?;

        let bets = self.bets_for(match_id).await?;
        let pending = bets.iter().filter(|bet| bet.status == BetStatus::Pending).count();

        match record.status {
            MatchStatus::Completed => {
                return Err(LedgerError::MatchClosed {
                    match_id: match_id.to_string(),
                    status: record.status,
                })
            }
            MatchStatus::Cancelled if pending == 0 => {
                return Err(LedgerError::MatchClosed {
                    match_id: match_id.to_string(),
                    status: record.status,
                })
            }
            MatchStatus::Cancelled => {
                warn!(match_id, pending, "resuming refunds for cancelled match");
            }
            _ => {
                ask(&self.database, |responder| DatabaseRequest::MarkCancelled {
                    match_id: match_id.to_string(),
                    responder,
                })
                .await?;
            }
        }

        let mut summary = RefundSummary {
            match_id: match_id.to_string(),
            ..Default::default()
        };
        for bet in bets {
            if bet.status != BetStatus::Pending {
                summary.skipped += 1;
                continue;
            }
            let bet_id = key(&bet.id);
            match ask(&self.database, |responder| DatabaseRequest::RefundBet { bet_id, responder }).await? {
                BetOutcome::Refunded(amount) => {
                    summary.refunded += 1;
                    summary.total_refunded += amount;
                }
                _ => summary.skipped += 1,
            }
        }

        info!(
            match_id,
            refunded = summary.refunded,
            skipped = summary.skipped,
            total = %summary.total_refunded,
            "match cancelled"
        );
        Ok(summary)
    }

    async fn cancel_bet(&self, user_id: &str, bet_id: &str) -> Result<common::WalletSnapshot> {
        let bet = ask(&self.database, |responder| DatabaseRequest::GetBet {
            id: bet_id.to_string(),
            responder,
        })
        .await?
        .ok_or_else(|| LedgerError::BetNotFound(bet_id.to_string()))?;

        let _guard = self.locks.lock(&key(&bet.match_id)).await;
        ask(&self.database, |responder| DatabaseRequest::CancelBet {
            user_id: user_id.to_string(),
            bet_id: bet_id.to_string(),
            responder,
        })
        .await
    }

    async fn bets_for(&self, match_id: &str) -> Result<Vec<DbBet>> {
        ask(&self.database, |responder| DatabaseRequest::BetsForMatch {
            match_id: match_id.to_string(),
            responder,
        })
        .await
    }
}
