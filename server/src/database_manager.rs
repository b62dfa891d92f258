//! The store actor.
//!
//! One task owns the database connection and executes requests strictly one
//! at a time. Every read-check-write on a wallet therefore happens without
//! interleaving, and every mutation is committed as a single transaction
//! together with its ledger entries.

use chrono::Utc;
use common::teams::Outcome;
use common::{
    BetStatus, DashboardStats, MatchResult, MatchStatus, MatchUpdate, NewMatch, NewUser, Role,
    TransactionKind, TransactionMeta, WalletSnapshot,
};
use rust_decimal::Decimal;
use surrealdb::Connection;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::BettingConfig;
use crate::database::{
    key, record_id, DatabaseConnection, DbBet, DbLedgerEntry, DbMatch, DbUser, UnitOfWork, MATCH_TABLE,
    USER_TABLE,
};
use crate::error::{LedgerError, Result};
use crate::ledger::{self, Postings, Sequence};
use crate::settlement::{self, BetOutcome};
use crate::{matches, placement};

pub type Responder<T> = oneshot::Sender<Result<T>>;

/// Sends a request built around a fresh responder and waits for the answer.
pub async fn ask<T>(
    requester: &mpsc::Sender<DatabaseRequest>,
    request: impl FnOnce(Responder<T>) -> DatabaseRequest,
) -> Result<T> {
    let (resp_tx, resp_rx) = oneshot::channel();
    requester.send(request(resp_tx)).await?;
    resp_rx.await?
}

pub enum DatabaseRequest {
    CreateUser {
        user: NewUser,
        responder: Responder<DbUser>,
    },
    BootstrapAdmin {
        name: String,
        responder: Responder<DbUser>,
    },
    GetUser {
        id: String,
        responder: Responder<Option<DbUser>>,
    },
    GetAllUsers {
        responder: Responder<Vec<DbUser>>,
    },
    SetUserBlocked {
        id: String,
        blocked: bool,
        responder: Responder<DbUser>,
    },
    AdjustWallet {
        user_id: String,
        kind: TransactionKind,
        amount: Decimal,
        meta: TransactionMeta,
        responder: Responder<WalletSnapshot>,
    },
    CreateMatch {
        input: NewMatch,
        created_by: String,
        responder: Responder<DbMatch>,
    },
    UpdateMatch {
        id: String,
        update: MatchUpdate,
        responder: Responder<DbMatch>,
    },
    SetMatchStatus {
        id: String,
        status: MatchStatus,
        responder: Responder<DbMatch>,
    },
    GetMatch {
        id: String,
        responder: Responder<Option<DbMatch>>,
    },
    GetAllMatches {
        responder: Responder<Vec<DbMatch>>,
    },
    PlaceBet {
        user_id: String,
        match_id: String,
        side: String,
        stake: Decimal,
        responder: Responder<(DbBet, WalletSnapshot)>,
    },
    CancelBet {
        user_id: String,
        bet_id: String,
        responder: Responder<WalletSnapshot>,
    },
    GetBet {
        id: String,
        responder: Responder<Option<DbBet>>,
    },
    BetsForMatch {
        match_id: String,
        responder: Responder<Vec<DbBet>>,
    },
    BetsForUser {
        user_id: String,
        responder: Responder<Vec<DbBet>>,
    },
    GetAllBets {
        responder: Responder<Vec<DbBet>>,
    },
    SettleBet {
        bet_id: String,
        outcome: Outcome,
        responder: Responder<BetOutcome>,
    },
    ReverseBet {
        bet_id: String,
        responder: Responder<BetOutcome>,
    },
    RefundBet {
        bet_id: String,
        responder: Responder<BetOutcome>,
    },
    RecordResult {
        match_id: String,
        result: MatchResult,
        responder: Responder<DbMatch>,
    },
    MarkCancelled {
        match_id: String,
        responder: Responder<DbMatch>,
    },
    LedgerEntries {
        user_id: Option<String>,
        responder: Responder<Vec<DbLedgerEntry>>,
    },
    AuditWallet {
        user_id: String,
        responder: Responder<WalletSnapshot>,
    },
    Stats {
        responder: Responder<DashboardStats>,
    },
}

pub struct DatabaseManager<Conn: Connection> {
    db_connection: DatabaseConnection<Conn>,
    work_queue: mpsc::Receiver<DatabaseRequest>,
    sequence: Sequence,
    betting: BettingConfig,
    shutdown: watch::Receiver<bool>,
}

impl<Conn: Connection> DatabaseManager<Conn> {
    /// Picks the ledger sequence up where the store left it.
    pub async fn new(
        db_connection: DatabaseConnection<Conn>,
        work_queue: mpsc::Receiver<DatabaseRequest>,
        betting: BettingConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let last_seq = db_connection.last_ledger_seq().await?;
        debug!(last_seq, "ledger sequence restored");
        Ok(Self {
            db_connection,
            work_queue,
            sequence: Sequence::starting_after(last_seq),
            betting,
            shutdown,
        })
    }

    pub async fn manage(&mut self) {
        loop {
            let request = tokio::select! {
                request = self.work_queue.recv() => request,
                _ = self.shutdown.changed() => None,
            };
            match request {
                Some(request) => self.handle(request).await,
                None => break,
            }
        }
        info!("database manager stopped");
    }

    // responders may have gone away, that is not our problem
    async fn handle(&mut self, request: DatabaseRequest) {
        match request {
            DatabaseRequest::CreateUser { user, responder } => {
                responder.send(self.create_user(user).await).ok();
            }
            DatabaseRequest::BootstrapAdmin { name, responder } => {
                responder.send(self.bootstrap_admin(name).await).ok();
            }
            DatabaseRequest::GetUser { id, responder } => {
                let resp = self.db_connection.get_user(&id).await.map_err(LedgerError::from);
                responder.send(resp).ok();
            }
            DatabaseRequest::GetAllUsers { responder } => {
                let resp = self.db_connection.get_all_users().await.map_err(LedgerError::from);
                responder.send(resp).ok();
            }
            DatabaseRequest::SetUserBlocked { id, blocked, responder } => {
                responder.send(self.set_user_blocked(&id, blocked).await).ok();
            }
            DatabaseRequest::AdjustWallet {
                user_id,
                kind,
                amount,
                meta,
                responder,
            } => {
                responder.send(self.adjust_wallet(&user_id, kind, amount, meta).await).ok();
            }
            DatabaseRequest::CreateMatch {
                input,
                created_by,
                responder,
            } => {
                responder.send(self.create_match(input, &created_by).await).ok();
            }
            DatabaseRequest::UpdateMatch { id, update, responder } => {
                responder.send(self.update_match(&id, update).await).ok();
            }
            DatabaseRequest::SetMatchStatus { id, status, responder } => {
                responder.send(self.set_match_status(&id, status).await).ok();
            }
            DatabaseRequest::GetMatch { id, responder } => {
                responder.send(self.load_match(&id).await).ok();
            }
            DatabaseRequest::GetAllMatches { responder } => {
                responder.send(self.all_matches().await).ok();
            }
            DatabaseRequest::PlaceBet {
                user_id,
                match_id,
                side,
                stake,
                responder,
            } => {
                responder
                    .send(self.place_bet(&user_id, &match_id, &side, stake).await)
                    .ok();
            }
            DatabaseRequest::CancelBet {
                user_id,
                bet_id,
                responder,
            } => {
                responder.send(self.cancel_bet(&user_id, &bet_id).await).ok();
            }
            DatabaseRequest::GetBet { id, responder } => {
                let resp = self.db_connection.get_bet(&id).await.map_err(LedgerError::from);
                responder.send(resp).ok();
            }
            DatabaseRequest::BetsForMatch { match_id, responder } => {
                let resp = self
                    .db_connection
                    .get_bets_for_match(&record_id(MATCH_TABLE, match_id))
                    .await
                    .map_err(LedgerError::from);
                responder.send(resp).ok();
            }
            DatabaseRequest::BetsForUser { user_id, responder } => {
                let resp = self
                    .db_connection
                    .get_bets_by_user(&record_id(USER_TABLE, user_id))
                    .await
                    .map_err(LedgerError::from);
                responder.send(resp).ok();
            }
            DatabaseRequest::GetAllBets { responder } => {
                let resp = self.db_connection.get_all_bets().await.map_err(LedgerError::from);
                responder.send(resp).ok();
            }
            DatabaseRequest::SettleBet {
                bet_id,
                outcome,
                responder,
            } => {
                responder.send(self.settle_bet(&bet_id, &outcome).await).ok();
            }
            DatabaseRequest::ReverseBet { bet_id, responder } => {
                responder.send(self.reverse_bet(&bet_id).await).ok();
            }
            DatabaseRequest::RefundBet { bet_id, responder } => {
                responder.send(self.refund_bet(&bet_id).await).ok();
            }
            DatabaseRequest::RecordResult {
                match_id,
                result,
                responder,
            } => {
                responder.send(self.record_result(&match_id, result).await).ok();
            }
            DatabaseRequest::MarkCancelled { match_id, responder } => {
                responder.send(self.mark_cancelled(&match_id).await).ok();
            }
            DatabaseRequest::LedgerEntries { user_id, responder } => {
                responder.send(self.ledger_entries(user_id).await).ok();
            }
            DatabaseRequest::AuditWallet { user_id, responder } => {
                responder.send(self.audit_wallet(&user_id).await).ok();
            }
            DatabaseRequest::Stats { responder } => {
                responder.send(self.stats().await).ok();
            }
        }
    }

    async fn commit(&mut self, postings: Postings, work: UnitOfWork) -> Result<()> {
        if let Err(err) = self.db_connection.commit(work).await {
            error!(%err, "transaction rolled back");
            return Err(err.into());
        }
        self.sequence.commit(postings);
        Ok(())
    }

    async fn require_user(&self, id: &str) -> Result<DbUser> {
        self.db_connection
            .get_user(id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(id.to_string()))
    }

    async fn require_bet(&self, id: &str) -> Result<DbBet> {
        self.db_connection
            .get_bet(id)
            .await?
            .ok_or_else(|| LedgerError::BetNotFound(id.to_string()))
    }

    async fn require_match(&mut self, id: &str) -> Result<DbMatch> {
        self.load_match(id)
            .await?
            .ok_or_else(|| LedgerError::MatchNotFound(id.to_string()))
    }

    /// Reads a match, persisting the lazy lock if its betting window closed.
    async fn load_match(&mut self, id: &str) -> Result<Option<DbMatch>> {
        let Some(mut record) = self.db_connection.get_match(id).await? else {
            return Ok(None);
        };
        if matches::refresh(&mut record, Utc::now()) {
            let postings = self.sequence.postings(Utc::now());
            self.commit(postings, UnitOfWork::new().update_match(record.clone()))
                .await?;
        }
        Ok(Some(record))
    }

    async fn all_matches(&mut self) -> Result<Vec<DbMatch>> {
        let mut records = self.db_connection.get_all_matches().await?;
        let now = Utc::now();
        let mut work = UnitOfWork::new();
        for record in records.iter_mut() {
            if matches::refresh(record, now) {
                work = work.update_match(record.clone());
            }
        }
        let postings = self.sequence.postings(now);
        self.commit(postings, work).await?;
        records.sort_by(|a, b| a.start_at.cmp(&b.start_at));
        Ok(records)
    }

    async fn create_user(&mut self, new_user: NewUser) -> Result<DbUser> {
        let name = new_user.name.trim();
        if name.is_empty() {
            return Err(LedgerError::Validation("user name must not be empty".to_string()));
        }

        let postings = self.sequence.postings(Utc::now());
        let mut user = DbUser::new(name, new_user.role, postings.now());
        user.credential_hash = new_user.credential_hash;
        self.commit(postings, UnitOfWork::new().create_user(user.clone()))
            .await?;

        info!(user_id = %key(&user.id), name = %user.name, role = %user.role, "user created");
        Ok(user)
    }

    async fn bootstrap_admin(&mut self, name: String) -> Result<DbUser> {
        let admins = self.db_connection.get_users_with_role(Role::Admin).await?;
        if let Some(admin) = admins.into_iter().next() {
            debug!(admin = %admin.name, "admin already present, skipping bootstrap");
            return Ok(admin);
        }
        self.create_user(NewUser {
            name,
            role: Role::Admin,
            credential_hash: None,
        })
        .await
    }

    async fn set_user_blocked(&mut self, id: &str, blocked: bool) -> Result<DbUser> {
        let mut user = self.require_user(id).await?;
        user.blocked = blocked;

        let postings = self.sequence.postings(Utc::now());
        self.commit(postings, UnitOfWork::new().update_user(user.clone()))
            .await?;

        info!(user_id = id, blocked, "user block flag changed");
        Ok(user)
    }

    async fn adjust_wallet(
        &mut self,
        user_id: &str,
        kind: TransactionKind,
        amount: Decimal,
        meta: TransactionMeta,
    ) -> Result<WalletSnapshot> {
        if amount <= Decimal::ZERO || amount.normalize().scale() > 2 {
            return Err(LedgerError::Validation(format!(
                "amount must be a positive number of cents, got {amount}"
            )));
        }
        let mut user = self.require_user(user_id).await?;

        let signed = match kind {
            TransactionKind::Deposit | TransactionKind::AdminCredit => {
                user.wallet.credit(amount);
                amount
            }
            TransactionKind::Withdraw | TransactionKind::AdminDebit => {
                user.wallet.debit(amount)?;
                -amount
            }
            other => {
                return Err(LedgerError::Validation(format!(
                    "{other} is not a wallet adjustment"
                )))
            }
        };

        let mut postings = self.sequence.postings(Utc::now());
        let entry = postings.post(&user, kind, signed, meta);
        let snapshot = user.wallet.snapshot();
        self.commit(postings, UnitOfWork::new().update_user(user).append(entry))
            .await?;

        info!(user_id, %kind, %amount, balance = %snapshot.balance, "wallet adjusted");
        Ok(snapshot)
    }

    async fn create_match(&mut self, input: NewMatch, created_by: &str) -> Result<DbMatch> {
        let postings = self.sequence.postings(Utc::now());
        let record = matches::create(input, created_by, self.betting.default_odds, postings.now())?;
        self.commit(postings, UnitOfWork::new().create_match(record.clone()))
            .await?;

        info!(match_id = %key(&record.id), title = %record.title, "match created");
        Ok(record)
    }

    async fn update_match(&mut self, id: &str, update: MatchUpdate) -> Result<DbMatch> {
        let mut record = self.require_match(id).await?;
        matches::apply_update(&mut record, update)?;
        // a moved cutoff may already have passed
        matches::refresh(&mut record, Utc::now());

        let postings = self.sequence.postings(Utc::now());
        self.commit(postings, UnitOfWork::new().update_match(record.clone()))
            .await?;

        info!(match_id = id, "match updated");
        Ok(record)
    }

    async fn set_match_status(&mut self, id: &str, status: MatchStatus) -> Result<DbMatch> {
        let mut record = self.require_match(id).await?;
        let from = record.status;
        matches::transition(&mut record, status)?;

        let postings = self.sequence.postings(Utc::now());
        self.commit(postings, UnitOfWork::new().update_match(record.clone()))
            .await?;

        info!(match_id = id, %from, to = %status, "match status changed");
        Ok(record)
    }

    async fn place_bet(
        &mut self,
        user_id: &str,
        match_id: &str,
        side: &str,
        stake: Decimal,
    ) -> Result<(DbBet, WalletSnapshot)> {
        let record = self.require_match(match_id).await?;
        let mut user = self.require_user(user_id).await?;

        let mut postings = self.sequence.postings(Utc::now());
        let bet = placement::stake_bet(
            &mut user,
            &record,
            side,
            stake,
            self.betting.default_odds,
            postings.now(),
        )?;

        let meta = TransactionMeta {
            match_id: Some(match_id.to_string()),
            bet_id: Some(key(&bet.id)),
            side: Some(bet.side.clone()),
            ..Default::default()
        };
        let entry = postings.post(&user, TransactionKind::BetStake, -stake, meta);
        let snapshot = user.wallet.snapshot();
        self.commit(
            postings,
            UnitOfWork::new()
                .update_user(user)
                .create_bet(bet.clone())
                .append(entry),
        )
        .await?;

        info!(
            user_id,
            match_id,
            bet_id = %key(&bet.id),
            side = %bet.side,
            %stake,
            potential_win = %bet.potential_win,
            "bet placed"
        );
        Ok((bet, snapshot))
    }

    async fn cancel_bet(&mut self, user_id: &str, bet_id: &str) -> Result<WalletSnapshot> {
        let bet = self.require_bet(bet_id).await?;
        if key(&bet.user_id) != user_id {
            return Err(LedgerError::Forbidden(format!("bet {bet_id} belongs to another user")));
        }
        if bet.status != BetStatus::Pending {
            return Err(LedgerError::AlreadySettled(bet_id.to_string()));
        }

        let match_id = key(&bet.match_id);
        let mut user = self.require_user(user_id).await?;
        user.wallet.credit(bet.stake);
        user.wallet.release_exposure(bet.stake);

        let mut postings = self.sequence.postings(Utc::now());
        let meta = TransactionMeta {
            match_id: Some(match_id.clone()),
            bet_id: Some(bet_id.to_string()),
            side: Some(bet.side.clone()),
            reason: Some("bet cancelled".to_string()),
            ..Default::default()
        };
        let entry = postings.post(&user, TransactionKind::Reversal, bet.stake, meta);
        let snapshot = user.wallet.snapshot();
        self.commit(
            postings,
            UnitOfWork::new()
                .update_user(user)
                .delete_bet(bet.id.clone())
                .append(entry),
        )
        .await?;

        info!(user_id, bet_id, match_id = %match_id, stake = %bet.stake, "bet cancelled");
        Ok(snapshot)
    }

    /// Loads a bet that is about to be settled together with its owner.
    /// Missing bets and orphaned bets are reported as `None`.
    async fn bet_and_owner(&self, bet_id: &str) -> Result<Option<(DbBet, Option<DbUser>)>> {
        let Some(bet) = self.db_connection.get_bet(bet_id).await? else {
            warn!(bet_id, "bet vanished before settlement, skipping");
            return Ok(None);
        };
        let owner = self.db_connection.get_user(&key(&bet.user_id)).await?;
        Ok(Some((bet, owner)))
    }

    async fn settle_bet(&mut self, bet_id: &str, outcome: &Outcome) -> Result<BetOutcome> {
        let Some((mut bet, owner)) = self.bet_and_owner(bet_id).await? else {
            return Ok(BetOutcome::Skipped);
        };
        if bet.status != BetStatus::Pending {
            return Ok(BetOutcome::Skipped);
        }
        let Some(mut user) = owner else {
            warn!(bet_id, user_id = %key(&bet.user_id), "bet owner not found, skipping");
            return Ok(BetOutcome::Skipped);
        };

        let mut postings = self.sequence.postings(Utc::now());
        let applied = settlement::apply_outcome(&mut bet, &mut user.wallet, outcome, postings.now());
        let meta = TransactionMeta {
            match_id: Some(key(&bet.match_id)),
            bet_id: Some(bet_id.to_string()),
            side: Some(bet.side.clone()),
            reason: Some(format!("result {outcome}")),
            ..Default::default()
        };
        let entry = postings.post(&user, applied.kind, applied.amount, meta);
        self.commit(
            postings,
            UnitOfWork::new().update_user(user).update_bet(bet).append(entry),
        )
        .await?;
        Ok(applied.outcome)
    }

    async fn refund_bet(&mut self, bet_id: &str) -> Result<BetOutcome> {
        let Some((mut bet, owner)) = self.bet_and_owner(bet_id).await? else {
            return Ok(BetOutcome::Skipped);
        };
        if bet.status != BetStatus::Pending {
            return Ok(BetOutcome::Skipped);
        }
        let Some(mut user) = owner else {
            warn!(bet_id, user_id = %key(&bet.user_id), "bet owner not found, skipping refund");
            return Ok(BetOutcome::Skipped);
        };

        let mut postings = self.sequence.postings(Utc::now());
        let applied = settlement::refund(&mut bet, &mut user.wallet, postings.now());
        let meta = TransactionMeta {
            match_id: Some(key(&bet.match_id)),
            bet_id: Some(bet_id.to_string()),
            side: Some(bet.side.clone()),
            reason: Some("match cancelled".to_string()),
            ..Default::default()
        };
        let entry = postings.post(&user, applied.kind, applied.amount, meta);
        self.commit(
            postings,
            UnitOfWork::new().update_user(user).update_bet(bet).append(entry),
        )
        .await?;
        Ok(applied.outcome)
    }

    async fn reverse_bet(&mut self, bet_id: &str) -> Result<BetOutcome> {
        let Some((mut bet, owner)) = self.bet_and_owner(bet_id).await? else {
            return Ok(BetOutcome::Skipped);
        };
        if !bet.status.is_settled() {
            return Ok(BetOutcome::Skipped);
        }

        let mut postings = self.sequence.postings(Utc::now());
        let Some(mut user) = owner else {
            // nothing to take back from, the bet still has to be settled again
            warn!(bet_id, user_id = %key(&bet.user_id), "bet owner not found, resetting without reversal");
            bet.status = BetStatus::Pending;
            bet.win_amount = Decimal::ZERO;
            bet.settled_at = None;
            self.commit(postings, UnitOfWork::new().update_bet(bet)).await?;
            return Ok(BetOutcome::Reversed);
        };

        let previous = bet.status;
        let reversal = settlement::reverse_settlement(&mut bet, &mut user.wallet);
        if reversal.shortfall > Decimal::ZERO {
            warn!(
                bet_id,
                user_id = %key(&user.id),
                shortfall = %reversal.shortfall,
                "reversal exceeds free balance, taking what is available"
            );
        }
        let meta = TransactionMeta {
            match_id: Some(key(&bet.match_id)),
            bet_id: Some(bet_id.to_string()),
            side: Some(bet.side.clone()),
            reason: Some(format!("result correction, was {previous}")),
            shortfall: (reversal.shortfall > Decimal::ZERO).then_some(reversal.shortfall),
            ..Default::default()
        };
        let entry = postings.post(&user, TransactionKind::Reversal, reversal.amount, meta);
        self.commit(
            postings,
            UnitOfWork::new().update_user(user).update_bet(bet).append(entry),
        )
        .await?;
        Ok(BetOutcome::Reversed)
    }

    async fn record_result(&mut self, match_id: &str, result: MatchResult) -> Result<DbMatch> {
        let mut record = self.require_match(match_id).await?;
        if record.status == MatchStatus::Cancelled {
            return Err(LedgerError::MatchClosed {
                match_id: match_id.to_string(),
                status: record.status,
            });
        }
        record.result = result;
        record.status = MatchStatus::Completed;

        let postings = self.sequence.postings(Utc::now());
        self.commit(postings, UnitOfWork::new().update_match(record.clone()))
            .await?;
        Ok(record)
    }

    async fn mark_cancelled(&mut self, match_id: &str) -> Result<DbMatch> {
        let mut record = self.require_match(match_id).await?;
        if !record.status.can_transition_to(MatchStatus::Cancelled) {
            return Err(LedgerError::MatchClosed {
                match_id: match_id.to_string(),
                status: record.status,
            });
        }
        record.status = MatchStatus::Cancelled;

        let postings = self.sequence.postings(Utc::now());
        self.commit(postings, UnitOfWork::new().update_match(record.clone()))
            .await?;
        Ok(record)
    }

    async fn ledger_entries(&self, user_id: Option<String>) -> Result<Vec<DbLedgerEntry>> {
        let entries = match user_id {
            Some(id) => {
                self.db_connection
                    .get_ledger_for_user(&record_id(USER_TABLE, id))
                    .await?
            }
            None => self.db_connection.get_all_ledger_entries().await?,
        };
        Ok(entries)
    }

    async fn audit_wallet(&self, user_id: &str) -> Result<WalletSnapshot> {
        let user = self.require_user(user_id).await?;
        let entries = self
            .db_connection
            .get_ledger_for_user(&user.id)
            .await?;
        ledger::reconcile(&user, &entries)?;
        Ok(user.wallet.snapshot())
    }

    async fn stats(&self) -> Result<DashboardStats> {
        let users = self.db_connection.get_all_users().await?;
        let matches = self.db_connection.get_all_matches().await?;
        let bets = self.db_connection.get_all_bets().await?;
        let entries = self.db_connection.get_all_ledger_entries().await?;

        Ok(DashboardStats {
            users: users.len() as u64,
            matches: matches.len() as u64,
            active_bets: bets
                .iter()
                .filter(|bet| bet.status == BetStatus::Pending)
                .count() as u64,
            admin_credit_total: entries
                .iter()
                .filter(|entry| entry.kind == TransactionKind::AdminCredit)
                .map(|entry| entry.amount)
                .sum(),
        })
    }
}
