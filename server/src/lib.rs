pub mod config;
pub mod connection_manager;
pub mod database;
pub mod database_manager;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod matches;
pub mod placement;
pub mod settlement;
pub mod wallet;

pub use engine::{BettingEngine, EngineTasks};
pub use error::{LedgerError, Result};
