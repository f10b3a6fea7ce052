//! Adaptive rate-limiting and DDoS-mitigation engine.
//!
//! Gates inbound API traffic: per-category request throttling, progressive
//! IP blacklisting with operator whitelisting, and aggregate distributed
//! attack / botnet-pattern detection, all behind the [`core::Gatekeeper`]
//! façade. The HTTP layer in [`api`] exposes the engine and its operator
//! controls.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
