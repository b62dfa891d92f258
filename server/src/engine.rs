//! The operation surface of the betting ledger.
//!
//! `BettingEngine` is a cheap, cloneable handle. It checks the caller's role,
//! parses raw input, and forwards the work to the store actor or, for
//! anything that has to be serialized per match, to the settlement manager.

use anyhow::Context;
use common::{
    Bet, BetFilter, DashboardStats, Match, MatchStatus, MatchUpdate, NewMatch, NewUser, Page, PageRequest,
    Principal, RefundSummary, SettlementSummary, Transaction, TransactionFilter, TransactionKind,
    TransactionMeta, User, WalletSnapshot,
};
use rust_decimal::Decimal;
use surrealdb::engine::any::Any;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BettingConfig, ServerConfig};
use crate::database::{key, DatabaseConnection, DbBet};
use crate::database_manager::{ask, DatabaseManager, DatabaseRequest, Responder};
use crate::error::{LedgerError, Result};
use crate::ledger;
use crate::placement;
use crate::settlement::{SettlementManager, SettlementRequest};

#[derive(Clone)]
pub struct BettingEngine {
    database: mpsc::Sender<DatabaseRequest>,
    settlement: mpsc::Sender<SettlementRequest>,
    betting: BettingConfig,
}

/// The background actors behind an engine.
pub struct EngineTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl EngineTasks {
    /// Stops both actors and waits for them to finish. Requests still queued
    /// are dropped and their callers see `Unavailable`.
    pub async fn shutdown(self) {
        self.shutdown.send(true).ok();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(%err, "engine task ended abnormally");
            }
        }
    }
}

impl BettingEngine {
    /// Connects to the configured store and spawns the actors.
    pub async fn start(config: &ServerConfig) -> anyhow::Result<(Self, EngineTasks)> {
        let connection = DatabaseConnection::connect(&config.database).await?;
        Self::with_connection(connection, config).await
    }

    pub async fn with_connection(
        connection: DatabaseConnection<Any>,
        config: &ServerConfig,
    ) -> anyhow::Result<(Self, EngineTasks)> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (db_tx, db_rx) = mpsc::channel(config.queue_depth);
        let (settlement_tx, settlement_rx) = mpsc::channel(config.queue_depth);

        let mut database_manager =
            DatabaseManager::new(connection, db_rx, config.betting.clone(), shutdown_rx.clone())
                .await
                .context("Failed to read ledger state")?;
        let mut settlement_manager = SettlementManager::new(settlement_rx, db_tx.clone(), shutdown_rx);

        let handles = vec![
            tokio::spawn(async move { database_manager.manage().await }),
            tokio::spawn(async move { settlement_manager.manage().await }),
        ];
        info!("betting engine started");

        Ok((
            Self {
                database: db_tx,
                settlement: settlement_tx,
                betting: config.betting.clone(),
            },
            EngineTasks {
                shutdown: shutdown_tx,
                handles,
            },
        ))
    }

    async fn db<T>(&self, request: impl FnOnce(Responder<T>) -> DatabaseRequest) -> Result<T> {
        ask(&self.database, request).await
    }

    async fn settle<T>(&self, request: impl FnOnce(Responder<T>) -> SettlementRequest) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.settlement.send(request(resp_tx)).await?;
        resp_rx.await?
    }

    fn require_admin(principal: &Principal) -> Result<()> {
        if !principal.is_admin() {
            return Err(LedgerError::Forbidden(format!(
                "user {} is not an admin",
                principal.user_id
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // users
    // -----------------------------------------------------------------

    /// Binds a session to a stored user and its role.
    pub async fn resolve_principal(&self, user_id: &str) -> Result<Principal> {
        let user = self
            .db(|responder| DatabaseRequest::GetUser {
                id: user_id.to_string(),
                responder,
            })
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;
        Ok(user.principal())
    }

    pub async fn create_user(&self, admin: &Principal, user: NewUser) -> Result<User> {
        Self::require_admin(admin)?;
        let user = self
            .db(|responder| DatabaseRequest::CreateUser { user, responder })
            .await?;
        Ok(user.into())
    }

    /// Creates the first admin. Returns the existing one if there already is
    /// an admin.
    pub async fn bootstrap_admin(&self, name: &str) -> Result<User> {
        let admin = self
            .db(|responder| DatabaseRequest::BootstrapAdmin {
                name: name.to_string(),
                responder,
            })
            .await?;
        Ok(admin.into())
    }

    pub async fn set_user_blocked(&self, admin: &Principal, user_id: &str, blocked: bool) -> Result<User> {
        Self::require_admin(admin)?;
        let user = self
            .db(|responder| DatabaseRequest::SetUserBlocked {
                id: user_id.to_string(),
                blocked,
                responder,
            })
            .await?;
        Ok(user.into())
    }

    /// Case-insensitive substring search on the user name.
    pub async fn list_users(
        &self,
        admin: &Principal,
        name_query: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<User>> {
        Self::require_admin(admin)?;
        let needle = name_query.map(|query| query.trim().to_lowercase());
        let mut users: Vec<User> = self
            .db(|responder| DatabaseRequest::GetAllUsers { responder })
            .await?
            .into_iter()
            .filter(|user| {
                needle
                    .as_ref()
                    .map_or(true, |needle| user.name.to_lowercase().contains(needle.as_str()))
            })
            .map(User::from)
            .collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(ledger::paginate(users, page, self.betting.page_limit(page.limit)))
    }

    // -----------------------------------------------------------------
    // wallets
    // -----------------------------------------------------------------

    pub async fn wallet(&self, principal: &Principal) -> Result<WalletSnapshot> {
        let user = self
            .db(|responder| DatabaseRequest::GetUser {
                id: principal.user_id.clone(),
                responder,
            })
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(principal.user_id.clone()))?;
        Ok(user.wallet.snapshot())
    }

    /// Newest first. Non-admin callers only ever see their own entries.
    pub async fn transactions(
        &self,
        principal: &Principal,
        mut filter: TransactionFilter,
        page: PageRequest,
    ) -> Result<Page<Transaction>> {
        if !principal.is_admin() {
            filter.user_id = Some(principal.user_id.clone());
        }
        let mut entries = self
            .db(|responder| DatabaseRequest::LedgerEntries {
                user_id: filter.user_id.clone(),
                responder,
            })
            .await?;
        entries.retain(|entry| ledger::matches_filter(entry, &filter));
        ledger::sort_newest_first(&mut entries);

        let entries: Vec<Transaction> = entries.into_iter().map(Transaction::from).collect();
        Ok(ledger::paginate(entries, page, self.betting.page_limit(page.limit)))
    }

    pub async fn deposit(
        &self,
        admin: &Principal,
        user_id: &str,
        amount: Decimal,
        note: Option<String>,
    ) -> Result<WalletSnapshot> {
        self.adjust_wallet(admin, user_id, TransactionKind::Deposit, amount, note)
            .await
    }

    pub async fn withdraw(
        &self,
        admin: &Principal,
        user_id: &str,
        amount: Decimal,
        note: Option<String>,
    ) -> Result<WalletSnapshot> {
        self.adjust_wallet(admin, user_id, TransactionKind::Withdraw, amount, note)
            .await
    }

    pub async fn admin_credit(
        &self,
        admin: &Principal,
        user_id: &str,
        amount: Decimal,
        note: Option<String>,
    ) -> Result<WalletSnapshot> {
        self.adjust_wallet(admin, user_id, TransactionKind::AdminCredit, amount, note)
            .await
    }

    pub async fn admin_debit(
        &self,
        admin: &Principal,
        user_id: &str,
        amount: Decimal,
        note: Option<String>,
    ) -> Result<WalletSnapshot> {
        self.adjust_wallet(admin, user_id, TransactionKind::AdminDebit, amount, note)
            .await
    }

    async fn adjust_wallet(
        &self,
        admin: &Principal,
        user_id: &str,
        kind: TransactionKind,
        amount: Decimal,
        note: Option<String>,
    ) -> Result<WalletSnapshot> {
        Self::require_admin(admin)?;
        let actor = Some(admin.user_id.clone());
        let (added_by, withdrawn_by) = match kind {
            TransactionKind::Withdraw | TransactionKind::AdminDebit => (None, actor),
            _ => (actor, None),
        };
        let meta = TransactionMeta {
            note,
            added_by,
            withdrawn_by,
            ..Default::default()
        };
        self.db(|responder| DatabaseRequest::AdjustWallet {
            user_id: user_id.to_string(),
            kind,
            amount,
            meta,
            responder,
        })
        .await
    }

    /// Replays a user's ledger against the stored wallet.
    pub async fn audit_wallet(&self, admin: &Principal, user_id: &str) -> Result<WalletSnapshot> {
        Self::require_admin(admin)?;
        self.db(|responder| DatabaseRequest::AuditWallet {
            user_id: user_id.to_string(),
            responder,
        })
        .await
    }

    // -----------------------------------------------------------------
    // matches
    // -----------------------------------------------------------------

    pub async fn create_match(&self, admin: &Principal, input: NewMatch) -> Result<Match> {
        Self::require_admin(admin)?;
        let record = self
            .db(|responder| DatabaseRequest::CreateMatch {
                input,
                created_by: admin.user_id.clone(),
                responder,
            })
            .await?;
        Ok(record.into())
    }

    pub async fn update_match(&self, admin: &Principal, match_id: &str, update: MatchUpdate) -> Result<Match> {
        Self::require_admin(admin)?;
        let record = self
            .db(|responder| DatabaseRequest::UpdateMatch {
                id: match_id.to_string(),
                update,
                responder,
            })
            .await?;
        Ok(record.into())
    }

    pub async fn set_match_status(&self, admin: &Principal, match_id: &str, status: MatchStatus) -> Result<Match> {
        Self::require_admin(admin)?;
        let record = self
            .db(|responder| DatabaseRequest::SetMatchStatus {
                id: match_id.to_string(),
                status,
                responder,
            })
            .await?;
        Ok(record.into())
    }

    pub async fn get_match(&self, match_id: &str) -> Result<Match> {
        let record = self
            .db(|responder| DatabaseRequest::GetMatch {
                id: match_id.to_string(),
                responder,
            })
            .await?
            .ok_or_else(|| LedgerError::MatchNotFound(match_id.to_string()))?;
        Ok(record.into())
    }

    /// Ordered by start time.
    pub async fn list_matches(&self, status: Option<MatchStatus>) -> Result<Vec<Match>> {
        let records = self
            .db(|responder| DatabaseRequest::GetAllMatches { responder })
            .await?;
        Ok(records
            .into_iter()
            .filter(|record| status.map_or(true, |status| record.status == status))
            .map(Match::from)
            .collect())
    }

    // -----------------------------------------------------------------
    // bets
    // -----------------------------------------------------------------

    pub async fn place_bet(
        &self,
        principal: &Principal,
        match_id: &str,
        side: &str,
        stake: &str,
    ) -> Result<(Bet, WalletSnapshot)> {
        let stake = placement::parse_stake(stake)?;
        let (bet, wallet) = self
            .db(|responder| DatabaseRequest::PlaceBet {
                user_id: principal.user_id.clone(),
                match_id: match_id.to_string(),
                side: side.to_string(),
                stake,
                responder,
            })
            .await?;
        Ok((bet.into(), wallet))
    }

    /// Withdraws a PENDING bet: the stake goes back to the balance and the
    /// bet is removed.
    pub async fn cancel_bet(&self, principal: &Principal, bet_id: &str) -> Result<WalletSnapshot> {
        self.settle(|responder| SettlementRequest::CancelBet {
            user_id: principal.user_id.clone(),
            bet_id: bet_id.to_string(),
            responder,
        })
        .await
    }

    pub async fn declare_result(&self, admin: &Principal, match_id: &str, result: &str) -> Result<SettlementSummary> {
        Self::require_admin(admin)?;
        self.settle(|responder| SettlementRequest::DeclareResult {
            match_id: match_id.to_string(),
            result: result.to_string(),
            responder,
        })
        .await
    }

    pub async fn cancel_match(&self, admin: &Principal, match_id: &str) -> Result<RefundSummary> {
        Self::require_admin(admin)?;
        self.settle(|responder| SettlementRequest::CancelMatch {
            match_id: match_id.to_string(),
            responder,
        })
        .await
    }

    /// The caller's bets, newest first.
    pub async fn my_bets(&self, principal: &Principal) -> Result<Vec<Bet>> {
        let bets = self.bets_of(&principal.user_id).await?;
        Ok(bets.into_iter().map(Bet::from).collect())
    }

    /// The caller's bets on matches that have a declared result.
    pub async fn bet_history(&self, principal: &Principal) -> Result<Vec<Bet>> {
        let completed: Vec<String> = self
            .db(|responder| DatabaseRequest::GetAllMatches { responder })
            .await?
            .iter()
            .filter(|record| record.status == MatchStatus::Completed)
            .map(|record| key(&record.id))
            .collect();

        let bets = self.bets_of(&principal.user_id).await?;
        Ok(bets
            .into_iter()
            .filter(|bet| completed.contains(&key(&bet.match_id)))
            .map(Bet::from)
            .collect())
    }

    pub async fn list_bets(&self, admin: &Principal, filter: BetFilter, page: PageRequest) -> Result<Page<Bet>> {
        Self::require_admin(admin)?;
        let mut bets = match &filter.user_id {
            Some(user_id) => self.bets_of(user_id).await?,
            None => {
                let mut bets = self
                    .db(|responder| DatabaseRequest::GetAllBets { responder })
                    .await?;
                sort_newest_first(&mut bets);
                bets
            }
        };
        bets.retain(|bet| {
            filter
                .match_id
                .as_ref()
                .map_or(true, |match_id| key(&bet.match_id) == *match_id)
                && filter.status.map_or(true, |status| bet.status == status)
        });

        let bets: Vec<Bet> = bets.into_iter().map(Bet::from).collect();
        Ok(ledger::paginate(bets, page, self.betting.page_limit(page.limit)))
    }

    async fn bets_of(&self, user_id: &str) -> Result<Vec<DbBet>> {
        let mut bets = self
            .db(|responder| DatabaseRequest::BetsForUser {
                user_id: user_id.to_string(),
                responder,
            })
            .await?;
        sort_newest_first(&mut bets);
        Ok(bets)
    }

    // -----------------------------------------------------------------
    // reporting
    // -----------------------------------------------------------------

    pub async fn dashboard_stats(&self, admin: &Principal) -> Result<DashboardStats> {
        Self::require_admin(admin)?;
        self.db(|responder| DatabaseRequest::Stats { responder }).await
    }
}

fn sort_newest_first(bets: &mut [DbBet]) {
    bets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
