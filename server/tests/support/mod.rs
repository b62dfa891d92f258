//! Shared fixtures: every test gets its own in-memory store.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use common::{Match, MatchStatus, NewMatch, NewUser, Principal};
use rust_decimal::Decimal;

use surrealdb::engine::any::{self, Any};
use surrealdb::Surreal;

use server::config::ServerConfig;
use server::database::{DatabaseConnection, MATCH_TABLE};
use server::{BettingEngine, EngineTasks};

pub struct Harness {
    pub engine: BettingEngine,
    pub tasks: EngineTasks,
    pub admin: Principal,
    /// Same store the engine writes to, for setting up states the public
    /// operations cannot reach.
    pub store: Surreal<Any>,
}

pub async fn harness() -> Harness {
    let config = ServerConfig::default();
    let store = any::connect(config.database.endpoint.as_str()).await.unwrap();
    store
        .use_ns(config.database.namespace.as_str())
        .use_db(config.database.database.as_str())
        .await
        .unwrap();

    let connection = DatabaseConnection::from_client(store.clone());
    let (engine, tasks) = BettingEngine::with_connection(connection, &config).await.unwrap();
    let admin = engine.bootstrap_admin("root").await.unwrap();
    let admin = engine.resolve_principal(&admin.id).await.unwrap();
    Harness {
        engine,
        tasks,
        admin,
        store,
    }
}

impl Harness {
    /// A regular user holding `balance` from a deposit.
    pub async fn user(&self, name: &str, balance: Decimal) -> Principal {
        let user = self.engine.create_user(&self.admin, NewUser::user(name)).await.unwrap();
        if balance > Decimal::ZERO {
            self.engine
                .deposit(&self.admin, &user.id, balance, None)
                .await
                .unwrap();
        }
        self.engine.resolve_principal(&user.id).await.unwrap()
    }

    /// "India vs Australia", open for betting for another hour.
    pub async fn open_match(&self) -> Match {
        self.engine
            .create_match(&self.admin, upcoming("India vs Australia"))
            .await
            .unwrap()
    }

    pub async fn match_with(&self, input: NewMatch) -> Match {
        self.engine.create_match(&self.admin, input).await.unwrap()
    }

    /// Overwrites a match status directly in the store.
    pub async fn force_status(&self, match_id: &str, status: MatchStatus) {
        self.store
            .query("UPDATE type::thing($table, $id) SET status = $status")
            .bind(("table", MATCH_TABLE))
            .bind(("id", match_id.to_string()))
            .bind(("status", status))
            .await
            .unwrap()
            .check()
            .unwrap();
    }
}

pub fn upcoming(title: &str) -> NewMatch {
    let now = Utc::now();
    NewMatch::new(title, now + Duration::hours(2), now + Duration::hours(1))
}
