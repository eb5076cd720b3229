//! # foreman-ratelimit
//!
//! Per-identity sliding-window throttling.
//!
//! - [`CounterStore`]: the shared counter collaborator (atomic evict, check, record)
//! - [`MemoryCounterStore`]: in-process implementation with idle expiry
//! - [`RateLimiter`]: applies limits with a per-scope failure policy

#![deny(unsafe_code)]

pub mod limiter;
pub mod store;

pub use limiter::{Decision, LimitScope, LimitSettings, RateLimiter};
pub use store::{Admission, CounterStore, CounterStoreError, MemoryCounterStore};
