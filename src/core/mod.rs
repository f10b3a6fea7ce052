//! Core engine components.
//!
//! Leaves first: fingerprint derivation, the counter store, the per-category
//! rate limiter, the blacklist/whitelist manager, the DDoS detector, and the
//! `Gatekeeper` façade that composes them.

pub mod blacklist;
pub mod counter_store;
pub mod ddos_detector;
pub mod engine;
pub mod fingerprint;
pub mod rate_limiter;

pub use blacklist::BlacklistManager;
pub use counter_store::{CounterStore, MemoryCounterStore, RedisCounterStore, StoreError};
pub use ddos_detector::DdosDetector;
pub use engine::Gatekeeper;
pub use rate_limiter::RateLimiter;
