//! Client fingerprint derivation.
//!
//! A fingerprint is the rate-limiting key for a request. It embeds the most
//! trustworthy available network origin (or the authenticated user id for
//! user-scoped categories) and deliberately excludes anything a client can
//! rotate cheaply, such as the User-Agent.

use std::net::IpAddr;

use crate::models::{KeyScope, RequestMeta};

/// Shared bucket for requests whose origin cannot be resolved at all. One
/// fingerprint for all such traffic means it degrades gracefully under the
/// normal category limits instead of failing open.
pub const UNKNOWN_BUCKET: &str = "unknown";

/// Resolve the client IP for a request.
///
/// Precedence: the internally-trusted real-IP header, then the first hop of
/// the forwarded-for header, then the raw connection address. A malformed
/// value falls through to the next source; once a source yields an address
/// no later header can override it, which is what defeats trivial
/// `X-Forwarded-For` spoofing behind a proxy that sets the real-IP header.
pub fn resolve_client_ip(meta: &RequestMeta) -> Option<IpAddr> {
    if let Some(ip) = meta.real_ip.as_deref().and_then(parse_ip) {
        return Some(ip);
    }
    if let Some(ip) = meta.forwarded_for.as_deref().and_then(first_forwarded_hop) {
        return Some(ip);
    }
    meta.peer_addr
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

fn first_forwarded_hop(raw: &str) -> Option<IpAddr> {
    raw.split(',').next().and_then(parse_ip)
}

/// Derive the fingerprint string for a request under a category's key scope.
pub fn fingerprint(meta: &RequestMeta, scope: KeyScope) -> String {
    if scope == KeyScope::User {
        if let Some(user_id) = meta.user_id.as_deref() {
            return format!("user:{}", user_id);
        }
    }
    match resolve_client_ip(meta) {
        Some(ip) => format!("ip:{}", ip),
        None => UNKNOWN_BUCKET.to_string(),
    }
}
