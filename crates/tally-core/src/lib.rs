//! tally-core - Tournament score reconciliation library
//!
//! This crate holds the domain logic shared by the tally daemon and any
//! operational tooling built on top of it:
//!
//! - [`schedule`]: Tournament week boundaries and the derived phase clock
//! - [`ledger`]: SQLite-backed off-chain score ledger
//! - [`chain`]: Chain gateway trait, HTTP relay client, and test mock
//! - [`sync`]: Reconciliation pass logic, retry policy, and backoff schedules
//! - [`config`]: TOML configuration for the daemon
//!
//! The crate is transport-agnostic: nothing in here binds sockets or installs
//! signal handlers. The daemon crate wires these pieces to a scheduler loop
//! and a diagnostic HTTP surface.

pub mod chain;
pub mod config;
pub mod ledger;
pub mod schedule;
pub mod sync;
