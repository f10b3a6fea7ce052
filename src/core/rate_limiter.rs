//! Per-category rate limiting.
//!
//! The limiter owns no counter state of its own: it derives the fingerprint
//! for the category's key scope, counts the hit through the pluggable store,
//! and compares the post-increment count to the category limit. Exactly
//! `limit` requests pass per window; the `limit + 1`-th is rejected with a
//! 429 and a positive retry-after.

use std::sync::Arc;

use log::debug;

use crate::core::counter_store::{CounterStore, StoreError};
use crate::core::fingerprint::fingerprint;
use crate::models::{RateLimitCategory, RateLimitResult, RateLimitSettings, RequestMeta};
use crate::utils::format_counter_key;

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    /// Check one request against its category window.
    ///
    /// Store failures propagate; the engine decides the explicit
    /// fail-open/fail-closed direction and logs it.
    pub async fn check(
        &self,
        meta: &RequestMeta,
        category: RateLimitCategory,
    ) -> Result<RateLimitResult, StoreError> {
        let limits = self.settings.for_category(category);
        let key = self.counter_key(meta, category);
        let hit = self.store.hit(&key, limits.window_ms).await?;

        if hit.count > limits.limit {
            debug!(
                "rate limit exceeded: key={} count={} limit={}",
                key, hit.count, limits.limit
            );
            return Ok(RateLimitResult::rejected(category, hit.remaining_ms));
        }
        Ok(RateLimitResult::allowed())
    }

    /// Drop the current window for a request's fingerprint in one category.
    /// Operator-facing; pairs with an administrative penalty reset.
    pub async fn reset(
        &self,
        meta: &RequestMeta,
        category: RateLimitCategory,
    ) -> Result<(), StoreError> {
        let key = self.counter_key(meta, category);
        self.store.reset(&key).await
    }

    fn counter_key(&self, meta: &RequestMeta, category: RateLimitCategory) -> String {
        let fp = fingerprint(meta, category.key_scope());
        format_counter_key(category.as_str(), &fp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::counter_store::{MemoryCounterStore, MockCounterStore};
    use crate::models::CategoryLimit;
    use std::net::IpAddr;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCounterStore::new(3)),
            RateLimitSettings::default(),
        )
    }

    fn meta(ip: &str) -> RequestMeta {
        RequestMeta::from_ip(ip.parse::<IpAddr>().unwrap())
    }

    #[tokio::test]
    async fn auth_allows_exactly_ten_per_ip() {
        let limiter = limiter();
        let meta = meta("192.168.1.100");
        for _ in 0..10 {
            let result = limiter
                .check(&meta, RateLimitCategory::Auth)
                .await
                .unwrap();
            assert!(result.allowed);
        }
        let rejected = limiter
            .check(&meta, RateLimitCategory::Auth)
            .await
            .unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.status_code, 429);
        assert!(rejected.message.contains("Rate limit exceeded"));
        assert!(rejected.retry_after_ms > 0);
    }

    #[tokio::test]
    async fn bulk_is_keyed_by_user_not_ip() {
        let limiter = limiter();
        // Same user across two devices shares one 5-request budget.
        let phone = meta("192.168.1.10").with_user("user-7");
        let laptop = meta("10.1.1.10").with_user("user-7");
        for _ in 0..3 {
            assert!(limiter
                .check(&phone, RateLimitCategory::Bulk)
                .await
                .unwrap()
                .allowed);
        }
        for _ in 0..2 {
            assert!(limiter
                .check(&laptop, RateLimitCategory::Bulk)
                .await
                .unwrap()
                .allowed);
        }
        assert!(!limiter
            .check(&laptop, RateLimitCategory::Bulk)
            .await
            .unwrap()
            .allowed);

        // A different user is unaffected.
        let other = meta("192.168.1.10").with_user("user-8");
        assert!(limiter
            .check(&other, RateLimitCategory::Bulk)
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn master_admin_allows_twenty_per_user() {
        let limiter = limiter();
        let meta = meta("10.0.0.1").with_user("admin-1");
        for _ in 0..20 {
            assert!(limiter
                .check(&meta, RateLimitCategory::MasterAdmin)
                .await
                .unwrap()
                .allowed);
        }
        assert!(!limiter
            .check(&meta, RateLimitCategory::MasterAdmin)
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn categories_do_not_share_budgets() {
        let limiter = limiter();
        let meta = meta("10.0.0.2");
        for _ in 0..10 {
            assert!(limiter
                .check(&meta, RateLimitCategory::Auth)
                .await
                .unwrap()
                .allowed);
        }
        assert!(!limiter
            .check(&meta, RateLimitCategory::Auth)
            .await
            .unwrap()
            .allowed);
        // The same IP still has its full search budget.
        assert!(limiter
            .check(&meta, RateLimitCategory::Search)
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn elapsed_window_restores_full_budget() {
        let mut settings = RateLimitSettings::default();
        settings.general = CategoryLimit {
            limit: 3,
            window_ms: 40,
        };
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new(3)), settings);
        let meta = meta("10.0.0.3");

        for _ in 0..3 {
            assert!(limiter
                .check(&meta, RateLimitCategory::General)
                .await
                .unwrap()
                .allowed);
        }
        assert!(!limiter
            .check(&meta, RateLimitCategory::General)
            .await
            .unwrap()
            .allowed);

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        for _ in 0..3 {
            assert!(limiter
                .check(&meta, RateLimitCategory::General)
                .await
                .unwrap()
                .allowed);
        }
    }

    #[tokio::test]
    async fn reset_drops_the_current_window() {
        let limiter = limiter();
        let meta = meta("10.0.0.5");
        for _ in 0..10 {
            limiter.check(&meta, RateLimitCategory::Auth).await.unwrap();
        }
        assert!(!limiter
            .check(&meta, RateLimitCategory::Auth)
            .await
            .unwrap()
            .allowed);

        limiter.reset(&meta, RateLimitCategory::Auth).await.unwrap();
        assert!(limiter
            .check(&meta, RateLimitCategory::Auth)
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let mut store = MockCounterStore::new();
        store.expect_hit().returning(|_, _| {
            Err(StoreError::Unavailable("shard offline".to_string()))
        });
        let limiter = RateLimiter::new(Arc::new(store), RateLimitSettings::default());
        let result = limiter.check(&meta("10.0.0.4"), RateLimitCategory::General).await;
        assert!(result.is_err());
    }
}
