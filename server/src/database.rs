use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use common::{BetStatus, MatchResult, MatchStatus, Role, Team, TransactionKind, TransactionMeta};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::sql::statements::{BeginStatement, CommitStatement};
use surrealdb::sql::{Id, Thing};
use surrealdb::{Connection, Surreal};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::wallet::Wallet;

pub const USER_TABLE: &str = "user";
pub const MATCH_TABLE: &str = "fixture";
pub const BET_TABLE: &str = "bet";
pub const LEDGER_TABLE: &str = "ledger";

pub fn record_id(table: &str, id: impl Into<String>) -> Thing {
    Thing {
        tb: table.into(),
        id: Id::String(id.into()),
    }
}

pub fn new_record_id(table: &str) -> Thing {
    record_id(table, Uuid::new_v4().simple().to_string())
}

/// The plain key of a record id, as handed out to callers.
pub fn key(thing: &Thing) -> String {
    match &thing.id {
        Id::String(id) => id.clone(),
        other => other.to_string(),
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DbUser {
    pub id: Thing,
    pub name: String,
    pub role: Role,
    pub blocked: bool,
    pub credential_hash: Option<String>,
    pub wallet: Wallet,
    pub created_at: DateTime<Utc>,
}

impl DbUser {
    pub fn new(name: impl Into<String>, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: new_record_id(USER_TABLE),
            name: name.into(),
            role,
            blocked: false,
            credential_hash: None,
            wallet: Wallet::default(),
            created_at: now,
        }
    }

    pub fn principal(&self) -> common::Principal {
        common::Principal {
            user_id: key(&self.id),
            role: self.role,
        }
    }
}

impl From<DbUser> for common::User {
    fn from(user: DbUser) -> Self {
        common::User {
            id: key(&user.id),
            name: user.name,
            role: user.role,
            blocked: user.blocked,
            wallet: user.wallet.snapshot(),
            created_at: user.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DbMatch {
    pub id: Thing,
    pub title: String,
    pub teams: [Team; 2],
    pub odds: BTreeMap<String, Decimal>,
    pub min_bet: Option<Decimal>,
    pub max_bet: Option<Decimal>,
    pub start_at: DateTime<Utc>,
    pub last_bet_time: DateTime<Utc>,
    pub status: MatchStatus,
    pub result: MatchResult,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<DbMatch> for common::Match {
    fn from(record: DbMatch) -> Self {
        common::Match {
            id: key(&record.id),
            title: record.title,
            teams: record.teams,
            odds: record.odds,
            min_bet: record.min_bet,
            max_bet: record.max_bet,
            start_at: record.start_at,
            last_bet_time: record.last_bet_time,
            status: record.status,
            result: record.result,
            created_at: record.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DbBet {
    pub id: Thing,
    pub user_id: Thing,
    pub match_id: Thing,
    pub side: String,
    pub stake: Decimal,
    pub potential_win: Decimal,
    pub win_amount: Decimal,
    pub status: BetStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl DbBet {
    pub fn new(
        user_id: Thing,
        match_id: Thing,
        side: String,
        stake: Decimal,
        potential_win: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_record_id(BET_TABLE),
            user_id,
            match_id,
            side,
            stake,
            potential_win,
            win_amount: Decimal::ZERO,
            status: BetStatus::Pending,
            created_at: now,
            settled_at: None,
        }
    }
}

impl From<DbBet> for common::Bet {
    fn from(bet: DbBet) -> Self {
        common::Bet {
            id: key(&bet.id),
            user_id: key(&bet.user_id),
            match_id: key(&bet.match_id),
            side: bet.side,
            stake: bet.stake,
            potential_win: bet.potential_win,
            win_amount: bet.win_amount,
            status: bet.status,
            created_at: bet.created_at,
            settled_at: bet.settled_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DbLedgerEntry {
    pub id: Thing,
    pub seq: u64,
    pub user_id: Thing,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub exposure_after: Decimal,
    pub meta: TransactionMeta,
    pub created_at: DateTime<Utc>,
}

impl From<DbLedgerEntry> for common::Transaction {
    fn from(entry: DbLedgerEntry) -> Self {
        common::Transaction {
            id: key(&entry.id),
            seq: entry.seq,
            user_id: key(&entry.user_id),
            kind: entry.kind,
            amount: entry.amount,
            balance_after: entry.balance_after,
            exposure_after: entry.exposure_after,
            meta: entry.meta,
            created_at: entry.created_at,
        }
    }
}

#[derive(Deserialize)]
struct SeqRow {
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Create,
    Update,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Create => write!(f, "CREATE"),
            Verb::Update => write!(f, "UPDATE"),
        }
    }
}

/// Writes that must land together or not at all.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    users: Vec<(Verb, DbUser)>,
    matches: Vec<(Verb, DbMatch)>,
    bets: Vec<(Verb, DbBet)>,
    entries: Vec<DbLedgerEntry>,
    deleted_bets: Vec<Thing>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_user(mut self, user: DbUser) -> Self {
        self.users.push((Verb::Create, user));
        self
    }

    pub fn update_user(mut self, user: DbUser) -> Self {
        self.users.push((Verb::Update, user));
        self
    }

    pub fn create_match(mut self, record: DbMatch) -> Self {
        self.matches.push((Verb::Create, record));
        self
    }

    pub fn update_match(mut self, record: DbMatch) -> Self {
        self.matches.push((Verb::Update, record));
        self
    }

    pub fn create_bet(mut self, bet: DbBet) -> Self {
        self.bets.push((Verb::Create, bet));
        self
    }

    pub fn update_bet(mut self, bet: DbBet) -> Self {
        self.bets.push((Verb::Update, bet));
        self
    }

    pub fn delete_bet(mut self, bet_id: Thing) -> Self {
        self.deleted_bets.push(bet_id);
        self
    }

    /// Ledger entries are append-only: always created, never updated.
    pub fn append(mut self, entry: DbLedgerEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.matches.is_empty()
            && self.bets.is_empty()
            && self.entries.is_empty()
            && self.deleted_bets.is_empty()
    }
}

pub struct DatabaseConnection<C: Connection> {
    connection: Surreal<C>,
}

impl DatabaseConnection<Any> {
    /// Opens the configured store, retrying while it is unreachable.
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let mut attempt = 1;
        loop {
            match Self::open(config).await {
                Ok(connection) => {
                    info!(endpoint = %config.endpoint, "connected to store");
                    return Ok(connection);
                }
                Err(error) if attempt < config.connect_retries => {
                    warn!(
                        endpoint = %config.endpoint,
                        attempt,
                        %error,
                        "store connection failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(config.retry_delay()).await;
                }
                Err(error) => {
                    return Err(anyhow::Error::new(error).context(format!(
                        "could not connect to {} after {attempt} attempts",
                        config.endpoint
                    )))
                }
            }
        }
    }

    async fn open(config: &DatabaseConfig) -> surrealdb::Result<Self> {
        let db = any::connect(config.endpoint.as_str()).await?;

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await?;
        }

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await?;

        Ok(Self { connection: db })
    }
}

impl<C: Connection> DatabaseConnection<C> {
    pub fn from_client(connection: Surreal<C>) -> Self {
        Self { connection }
    }

    /// Commits every write in `work` inside one transaction.
    pub async fn commit(&mut self, work: UnitOfWork) -> surrealdb::Result<()> {
        if work.is_empty() {
            return Ok(());
        }

        let mut query = self.connection.query(BeginStatement);

        for (i, (verb, user)) in work.users.into_iter().enumerate() {
            query = query
                .query(format!("{verb} $user_id_{i} CONTENT $user_{i};"))
                .bind((format!("user_id_{i}"), user.id.clone()))
                .bind((format!("user_{i}"), user));
        }
        for (i, (verb, record)) in work.matches.into_iter().enumerate() {
            query = query
                .query(format!("{verb} $match_id_{i} CONTENT $match_{i};"))
                .bind((format!("match_id_{i}"), record.id.clone()))
                .bind((format!("match_{i}"), record));
        }
        for (i, (verb, bet)) in work.bets.into_iter().enumerate() {
            query = query
                .query(format!("{verb} $bet_id_{i} CONTENT $bet_{i};"))
                .bind((format!("bet_id_{i}"), bet.id.clone()))
                .bind((format!("bet_{i}"), bet));
        }
        for (i, bet_id) in work.deleted_bets.into_iter().enumerate() {
            query = query
                .query(format!("DELETE $deleted_bet_{i};"))
                .bind((format!("deleted_bet_{i}"), bet_id));
        }
        for (i, entry) in work.entries.into_iter().enumerate() {
            query = query
                .query(format!("CREATE $entry_id_{i} CONTENT $entry_{i};"))
                .bind((format!("entry_id_{i}"), entry.id.clone()))
                .bind((format!("entry_{i}"), entry));
        }

        query.query(CommitStatement).await?.check()?;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> surrealdb::Result<Option<DbUser>> {
        self.connection.select((USER_TABLE, id)).await
    }

    pub async fn get_all_users(&self) -> surrealdb::Result<Vec<DbUser>> {
        self.connection.select(USER_TABLE).await
    }

    pub async fn get_users_with_role(&self, role: Role) -> surrealdb::Result<Vec<DbUser>> {
        self.connection
            .query("SELECT * FROM type::table($table) WHERE role = $role;")
            .bind(("table", USER_TABLE))
            .bind(("role", role))
            .await?
            .take(0)
    }

    pub async fn get_match(&self, id: &str) -> surrealdb::Result<Option<DbMatch>> {
        self.connection.select((MATCH_TABLE, id)).await
    }

    pub async fn get_all_matches(&self) -> surrealdb::Result<Vec<DbMatch>> {
        self.connection.select(MATCH_TABLE).await
    }

    pub async fn get_bet(&self, id: &str) -> surrealdb::Result<Option<DbBet>> {
        self.connection.select((BET_TABLE, id)).await
    }

    pub async fn get_all_bets(&self) -> surrealdb::Result<Vec<DbBet>> {
        self.connection.select(BET_TABLE).await
    }

    pub async fn get_bets_for_match(&self, match_id: &Thing) -> surrealdb::Result<Vec<DbBet>> {
        self.connection
            .query("SELECT * FROM type::table($table) WHERE match_id = $match_id;")
            .bind(("table", BET_TABLE))
            .bind(("match_id", match_id.clone()))
            .await?
            .take(0)
    }

    pub async fn get_bets_by_user(&self, user_id: &Thing) -> surrealdb::Result<Vec<DbBet>> {
        self.connection
            .query("SELECT * FROM type::table($table) WHERE user_id = $user_id;")
            .bind(("table", BET_TABLE))
            .bind(("user_id", user_id.clone()))
            .await?
            .take(0)
    }

    pub async fn get_ledger_for_user(&self, user_id: &Thing) -> surrealdb::Result<Vec<DbLedgerEntry>> {
        self.connection
            .query("SELECT * FROM type::table($table) WHERE user_id = $user_id;")
            .bind(("table", LEDGER_TABLE))
            .bind(("user_id", user_id.clone()))
            .await?
            .take(0)
    }

    pub async fn get_all_ledger_entries(&self) -> surrealdb::Result<Vec<DbLedgerEntry>> {
        self.connection.select(LEDGER_TABLE).await
    }

    /// Highest ledger sequence number written so far, 0 for an empty ledger.
    pub async fn last_ledger_seq(&self) -> surrealdb::Result<u64> {
        let rows: Vec<SeqRow> = self
            .connection
            .query("SELECT seq FROM type::table($table) ORDER BY seq DESC LIMIT 1;")
            .bind(("table", LEDGER_TABLE))
            .await?
            .take(0)?;
        Ok(rows.first().map(|row| row.seq).unwrap_or(0))
    }
}
