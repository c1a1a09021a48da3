//! Lockup Sweeper
//!
//! Waits for time-locked claimable balances on managed wallets to unlock,
//! then claims and forwards them to a fixed recipient using disposable
//! sponsor accounts to pay the fees.

pub mod alert;
pub mod amount;
pub mod assignment;
pub mod config;
pub mod error;
pub mod funding;
pub mod horizon;
pub mod intake;
pub mod keys;
pub mod ledger;
pub mod maintenance;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod sponsor_pool;
pub mod store;
pub mod types;
