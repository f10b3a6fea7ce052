//! Sliding-window request counters.
//!
//! The store is the one pluggable seam in the engine: the default backend is
//! an in-process sharded map (no I/O on the hot path), with a Redis backend
//! available for deployments that want counters shared across instances.
//!
//! Counting is fixed-window-with-reset: each key carries `(count,
//! window_start)` and the count resets once the window has elapsed. Category
//! windows are short and limits modest, so this stays within one request of
//! a true sliding log at a fraction of the bookkeeping.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::models::StorageSettings;

/// Errors that can occur while counting.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Result of one counted hit.
#[derive(Debug, Clone, Copy)]
pub struct WindowHit {
    /// Post-increment count within the current window.
    pub count: u32,
    /// Time left in the current window, in milliseconds. Always positive,
    /// so it can feed Retry-After directly.
    pub remaining_ms: u64,
}

/// Category-aware request counter keyed by fingerprint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request against `key`, resetting the window first if it has
    /// elapsed. Increments for one key are linearizable: the limit can never
    /// be silently exceeded by concurrent callers.
    async fn hit(&self, key: &str, window_ms: u64) -> Result<WindowHit, StoreError>;

    /// Drop the counter for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Evict counters idle long enough that their window can no longer
    /// matter. Backends with native expiry treat this as a no-op.
    async fn evict_idle(&self);
}

/// Select and construct the configured backend.
pub fn build_store(settings: &StorageSettings) -> anyhow::Result<Arc<dyn CounterStore>> {
    match settings.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryCounterStore::new(settings.idle_windows))),
        "redis" => {
            let store = RedisCounterStore::new(&settings.redis_url)?;
            Ok(Arc::new(store))
        }
        other => Err(anyhow::anyhow!("unknown counter store backend: {}", other)),
    }
}

struct CounterWindow {
    count: u32,
    window_start: Instant,
    window_ms: u64,
    last_hit: Instant,
}

/// In-process store. State is partitioned across `DashMap` shards, so
/// unrelated fingerprints never serialize through one lock; the per-key
/// check-reset-increment runs while the entry's shard lock is held.
pub struct MemoryCounterStore {
    windows: DashMap<String, CounterWindow>,
    idle_windows: u32,
}

impl MemoryCounterStore {
    pub fn new(idle_windows: u32) -> Self {
        Self {
            windows: DashMap::new(),
            idle_windows: idle_windows.max(1),
        }
    }

    /// Number of live counters, for eviction tests and metrics.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(&self, key: &str, window_ms: u64) -> Result<WindowHit, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_owned())
            .or_insert_with(|| CounterWindow {
                count: 0,
                window_start: now,
                window_ms,
                last_hit: now,
            });

        let elapsed = now.duration_since(entry.window_start).as_millis() as u64;
        if elapsed >= entry.window_ms {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        entry.window_ms = window_ms;
        entry.last_hit = now;

        let elapsed = now.duration_since(entry.window_start).as_millis() as u64;
        Ok(WindowHit {
            count: entry.count,
            remaining_ms: entry.window_ms.saturating_sub(elapsed).max(1),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.windows.remove(key);
        Ok(())
    }

    async fn evict_idle(&self) {
        let now = Instant::now();
        let idle_windows = self.idle_windows as u64;
        self.windows.retain(|_, window| {
            let idle = now.duration_since(window.last_hit).as_millis() as u64;
            idle < window.window_ms.saturating_mul(idle_windows)
        });
    }
}

/// Redis-backed store: INCR plus PEXPIRE on first hit, PTTL for the
/// remaining window. Commands go through one shared, reconnecting
/// `ConnectionManager`. Opt-in via `storage.backend = "redis"`.
pub struct RedisCounterStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisCounterStore {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn hit(&self, key: &str, window_ms: u64) -> Result<WindowHit, StoreError> {
        let mut conn = self.connection().await?;

        let count: u32 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = conn.pexpire(key, window_ms as usize).await?;
        }

        let ttl: i64 = conn.pttl(key).await?;
        let remaining_ms = if ttl > 0 {
            ttl as u64
        } else {
            // PTTL of -1 means the expiry write was lost (a crash between
            // INCR and PEXPIRE); re-arm it so the key cannot reject forever.
            let _: () = conn.pexpire(key, window_ms as usize).await?;
            window_ms
        };
        Ok(WindowHit {
            count,
            remaining_ms,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn evict_idle(&self) {
        // Redis expires keys on its own.
    }
}
