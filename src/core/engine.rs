//! The rate-limiting system façade.
//!
//! `Gatekeeper` composes the fingerprint generator, blacklist manager, rate
//! limiter, and DDoS detector behind one `check_limit` entry point. It is an
//! explicit, constructible service object: production wires a single shared
//! `Arc<Gatekeeper>` into the HTTP layer, and every test builds a fresh one.
//!
//! Per-request flow: resolve the fingerprint, fast-reject blacklisted IPs,
//! check the category window, then always feed the detector so it keeps
//! learning even from rejected traffic.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::error;

use crate::core::blacklist::BlacklistManager;
use crate::core::counter_store::{build_store, CounterStore};
use crate::core::ddos_detector::DdosDetector;
use crate::core::fingerprint::resolve_client_ip;
use crate::core::rate_limiter::RateLimiter;
use crate::models::{
    AccessResult, AttackStatus, Config, PenaltyLevel, RateLimitCategory, RateLimitResult,
    RequestMeta, ViolationType,
};

struct RejectionStreak {
    count: u32,
    window_start: Instant,
}

pub struct Gatekeeper {
    limiter: RateLimiter,
    blacklist: Arc<BlacklistManager>,
    detector: DdosDetector,
    store: Arc<dyn CounterStore>,
    /// 429 streaks per IP; persistent abuse feeds the penalty ladder.
    rejections: DashMap<IpAddr, RejectionStreak>,
    fail_open: bool,
    violations_after_rejections: u32,
    rejection_window_ms: u64,
}

impl Gatekeeper {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let store = build_store(&config.storage)?;
        let blacklist = Arc::new(BlacklistManager::new(config.penalties.clone()));
        let detector = DdosDetector::new(config.detection.clone(), blacklist.clone());
        let limiter = RateLimiter::new(store.clone(), config.rate_limit.clone());

        Ok(Self {
            limiter,
            blacklist,
            detector,
            store,
            rejections: DashMap::new(),
            fail_open: config.rate_limit.fail_open,
            violations_after_rejections: config.rate_limit.violations_after_rejections.max(1),
            rejection_window_ms: config.rate_limit.rejection_window_ms,
        })
    }

    /// Full per-request decision.
    pub async fn check_limit(
        &self,
        meta: &RequestMeta,
        category: RateLimitCategory,
    ) -> RateLimitResult {
        let ip = resolve_client_ip(meta);

        // Whitelist membership overrides every check unconditionally: no
        // window is counted and the detector never sees the request.
        if let Some(ip) = ip {
            if self.blacklist.is_whitelisted(ip) {
                metrics::counter!("gatekeeper_requests_allowed_total", 1);
                return RateLimitResult::allowed();
            }
        }

        let access = self.blacklist.check_access(ip);
        if !access.allowed {
            metrics::counter!("gatekeeper_requests_blacklisted_total", 1);
            self.detector.observe(meta);
            return RateLimitResult::blacklisted();
        }

        let result = match self.limiter.check(meta, category).await {
            Ok(result) => result,
            Err(err) => {
                // Never a silent unbounded allow: the direction is
                // configured and every occurrence is logged.
                error!(
                    "counter store failure, failing {}: {}",
                    if self.fail_open { "open" } else { "closed" },
                    err
                );
                metrics::counter!("gatekeeper_store_failures_total", 1);
                self.detector.observe(meta);
                return RateLimitResult::store_failure(self.fail_open);
            }
        };

        if result.allowed {
            metrics::counter!("gatekeeper_requests_allowed_total", 1);
        } else {
            metrics::counter!("gatekeeper_requests_rejected_total", 1);
            if let Some(ip) = ip {
                self.note_rejection(ip);
            }
        }

        self.detector.observe(meta);
        result
    }

    /// Blacklist/whitelist gate alone, for callers that run it separately
    /// ahead of `check_limit`.
    pub fn check_access(&self, meta: &RequestMeta) -> AccessResult {
        self.blacklist.check_access(resolve_client_ip(meta))
    }

    pub fn detect_attack(&self, meta: &RequestMeta) -> bool {
        self.detector.detect_attack(meta)
    }

    pub fn detect_botnet_pattern(&self, meta: &RequestMeta) -> bool {
        self.detector.detect_botnet_pattern(meta)
    }

    pub fn record_violation(&self, ip: IpAddr, kind: ViolationType) -> PenaltyLevel {
        self.blacklist.record_violation(ip, kind)
    }

    pub fn add_to_whitelist(&self, ip: IpAddr) {
        self.blacklist.add_to_whitelist(ip);
    }

    pub fn remove_from_whitelist(&self, ip: IpAddr) -> bool {
        self.blacklist.remove_from_whitelist(ip)
    }

    pub fn reset_penalty(&self, ip: IpAddr) -> bool {
        self.rejections.remove(&ip);
        self.blacklist.reset_penalty(ip)
    }

    pub fn penalty_of(&self, ip: IpAddr) -> PenaltyLevel {
        self.blacklist.penalty_of(ip)
    }

    pub fn attack_status(&self) -> AttackStatus {
        self.detector.attack_status()
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.detector.is_emergency_mode()
    }

    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        self.detector.blocked_ips()
    }

    pub fn reset_attack_state(&self) {
        self.detector.reset_attack_state();
    }

    /// Periodic maintenance: evict idle counters and observation windows,
    /// drop long-expired penalty records. Runs off the request path.
    pub async fn sweep(&self) {
        self.store.evict_idle().await;
        self.blacklist.sweep_expired();
        self.detector.evict_idle();
        let now = Instant::now();
        let window = self.rejection_window_ms;
        self.rejections.retain(|_, streak| {
            (now.duration_since(streak.window_start).as_millis() as u64) < window
        });
    }

    /// A single burst of 429s is not a violation; a sustained streak is.
    fn note_rejection(&self, ip: IpAddr) {
        let now = Instant::now();
        let mut streak = self.rejections.entry(ip).or_insert_with(|| RejectionStreak {
            count: 0,
            window_start: now,
        });
        let elapsed = now.duration_since(streak.window_start).as_millis() as u64;
        if elapsed >= self.rejection_window_ms {
            streak.count = 0;
            streak.window_start = now;
        }
        streak.count += 1;
        if streak.count >= self.violations_after_rejections {
            streak.count = 0;
            drop(streak);
            self.blacklist.record_violation(ip, ViolationType::RateLimit);
        }
    }
}
