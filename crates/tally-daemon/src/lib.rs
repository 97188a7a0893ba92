//! tally-daemon - Tournament score reconciliation daemon library
//!
//! The daemon wires the `tally-core` pieces together:
//!
//! - [`state`]: Shared daemon state (per-week outcomes, pass locks, shutdown)
//! - [`scheduler`]: The background reconciliation loop and the manual-trigger
//!   entry point, both funneling into the same pass executor
//! - [`diag`]: Read-only diagnostic HTTP surface plus the forced-resync
//!   trigger
//!
//! # Runtime requirements
//!
//! Ledger access uses `tokio::task::spawn_blocking`, so the daemon expects a
//! multi-threaded tokio runtime. The `tallyd` binary configures one; if you
//! embed this library, do the same.

pub mod diag;
pub mod scheduler;
pub mod state;
