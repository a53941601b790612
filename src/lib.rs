//! Tollgate - Fixed-Window Rate Limiting
//!
//! This crate decides whether a caller identified by a key may proceed with a
//! sensitive operation (login, sign-up, password reset, ...). Counters are kept
//! in Redis when it is configured and reachable, and in process memory
//! otherwise, so an outage of the shared store degrades limiting to
//! per-process instead of blocking requests.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
