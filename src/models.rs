use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Reason string attached to blacklist rejections.
pub const REASON_IP_BLACKLISTED: &str = "IP_BLACKLISTED";

/// Traffic class a request is throttled under.
///
/// Limits and windows are configurable per category; the key scope
/// (per-IP or per-authenticated-user) is intrinsic to the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitCategory {
    General,
    Search,
    Auth,
    MasterAdmin,
    Bulk,
}

/// How a category derives the rate-limiting key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    /// Keyed by resolved client IP.
    Ip,
    /// Keyed by authenticated user id, falling back to IP for
    /// unauthenticated requests.
    User,
}

impl RateLimitCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitCategory::General => "general",
            RateLimitCategory::Search => "search",
            RateLimitCategory::Auth => "auth",
            RateLimitCategory::MasterAdmin => "master-admin",
            RateLimitCategory::Bulk => "bulk",
        }
    }

    /// Admin and bulk traffic share one budget per authenticated user
    /// across devices; everything else is keyed by origin IP.
    pub fn key_scope(&self) -> KeyScope {
        match self {
            RateLimitCategory::MasterAdmin | RateLimitCategory::Bulk => KeyScope::User,
            _ => KeyScope::Ip,
        }
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Violation types accepted by the blacklist manager. Open set: callers
/// detecting abuse elsewhere (payload scanners, auth brute-force guards)
/// record their own types here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    RateLimit,
    DdosAttempt,
    SqlInjection,
    Suspicious,
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationType::RateLimit => "RATE_LIMIT",
            ViolationType::DdosAttempt => "DDOS_ATTEMPT",
            ViolationType::SqlInjection => "SQL_INJECTION",
            ViolationType::Suspicious => "SUSPICIOUS",
        };
        f.write_str(s)
    }
}

/// Escalation stage of an IP's blacklist status. Ordered: a record never
/// moves down except through an administrative reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PenaltyLevel {
    Clean,
    Warning,
    TempBlock,
    ExtendedBlock,
    Permanent,
}

/// Global attack posture, transitioned only by the DDoS detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackState {
    Idle,
    Active,
    Emergency,
}

/// Snapshot of the detector's global state, as exposed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackStatus {
    pub state: AttackState,
    pub flagged_ips: Vec<IpAddr>,
    pub botnet_detected: bool,
}

/// Framework-independent view of an inbound request. The HTTP layer builds
/// one of these per request; the engine never touches framework types.
///
/// `user_agent` is carried for logging only and never participates in the
/// fingerprint, since rotating it must not change a client's identity.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Raw connection peer address.
    pub peer_addr: Option<IpAddr>,
    /// Value of the internally-trusted real-IP header, if present.
    pub real_ip: Option<String>,
    /// Value of the forwarded-for header, if present.
    pub forwarded_for: Option<String>,
    /// Authenticated user id supplied by the identity layer.
    pub user_id: Option<String>,
    /// Path of the protected request (not of the check call itself).
    pub path: String,
    pub accept: Option<String>,
    pub accept_language: Option<String>,
    pub cache_control: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            peer_addr: Some(ip),
            path: "/".to_string(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_user_agent(mut self, ua: &str) -> Self {
        self.user_agent = Some(ua.to_string());
        self
    }
}

/// Outcome of a rate-limit check, shaped for the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub status_code: u16,
    pub message: String,
    /// Remaining time in the current window; positive whenever the request
    /// was rejected by the rate limiter.
    pub retry_after_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RateLimitResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            status_code: 200,
            message: "Request allowed".to_string(),
            retry_after_ms: 0,
            reason: None,
        }
    }

    pub fn rejected(category: RateLimitCategory, retry_after_ms: u64) -> Self {
        let retry_after_ms = retry_after_ms.max(1);
        Self {
            allowed: false,
            status_code: 429,
            message: format!(
                "Rate limit exceeded for {} requests. Try again in {} seconds.",
                category,
                retry_after_ms.div_ceil(1000)
            ),
            retry_after_ms,
            reason: None,
        }
    }

    pub fn blacklisted() -> Self {
        Self {
            allowed: false,
            status_code: 403,
            message: "Access denied".to_string(),
            retry_after_ms: 0,
            reason: Some(REASON_IP_BLACKLISTED.to_string()),
        }
    }

    /// Decision taken when the counter store itself failed. Never a silent
    /// allow: the caller configures the direction and the engine logs it.
    pub fn store_failure(fail_open: bool) -> Self {
        if fail_open {
            Self {
                allowed: true,
                status_code: 200,
                message: "Request allowed (rate limiter degraded)".to_string(),
                retry_after_ms: 0,
                reason: None,
            }
        } else {
            Self {
                allowed: false,
                status_code: 503,
                message: "Rate limiter unavailable".to_string(),
                retry_after_ms: 1_000,
                reason: None,
            }
        }
    }
}

/// Outcome of the blacklist/whitelist gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AccessResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Limit and window for one traffic category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryLimit {
    /// Maximum requests allowed per window.
    pub limit: u32,
    /// Rolling window length in milliseconds.
    pub window_ms: u64,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub general: CategoryLimit,
    pub search: CategoryLimit,
    pub auth: CategoryLimit,
    pub master_admin: CategoryLimit,
    pub bulk: CategoryLimit,
    /// Direction taken when the counter store fails. Defaults to deny.
    pub fail_open: bool,
    /// Number of 429s from one IP within `rejection_window_ms` before a
    /// RATE_LIMIT violation is recorded against it.
    pub violations_after_rejections: u32,
    pub rejection_window_ms: u64,
}

impl RateLimitSettings {
    pub fn for_category(&self, category: RateLimitCategory) -> &CategoryLimit {
        match category {
            RateLimitCategory::General => &self.general,
            RateLimitCategory::Search => &self.search,
            RateLimitCategory::Auth => &self.auth,
            RateLimitCategory::MasterAdmin => &self.master_admin,
            RateLimitCategory::Bulk => &self.bulk,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            general: CategoryLimit {
                limit: 100,
                window_ms: 60_000,
            },
            search: CategoryLimit {
                limit: 50,
                window_ms: 60_000,
            },
            auth: CategoryLimit {
                limit: 10,
                window_ms: 60_000,
            },
            master_admin: CategoryLimit {
                limit: 20,
                window_ms: 60_000,
            },
            bulk: CategoryLimit {
                limit: 5,
                window_ms: 60_000,
            },
            fail_open: false,
            violations_after_rejections: 5,
            rejection_window_ms: 60_000,
        }
    }
}

/// Penalty escalation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltySettings {
    /// TEMP_BLOCK duration in milliseconds.
    pub temp_block_ms: u64,
    /// EXTENDED_BLOCK duration in milliseconds.
    pub extended_block_ms: u64,
    /// How long inactive non-blocking records are retained before the
    /// periodic sweep drops them.
    pub retention_ms: u64,
}

impl Default for PenaltySettings {
    fn default() -> Self {
        Self {
            temp_block_ms: 300_000,
            extended_block_ms: 3_600_000,
            retention_ms: 86_400_000,
        }
    }
}

/// DDoS detection thresholds. These are policy, not mechanism: a starting
/// calibration meant to be tuned against real traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSettings {
    /// Per-IP request count within the observation window past which the IP
    /// counts toward the attacker population.
    pub per_ip_threshold: u32,
    /// Distinct offending IPs required to escalate IDLE -> ACTIVE.
    pub attack_population_threshold: usize,
    pub observation_window_ms: u64,
    /// Aggregate anonymous request volume that escalates to EMERGENCY.
    pub emergency_volume_threshold: u64,
    pub volume_window_ms: u64,
    /// Minimum in-window hits for an IP to be force-blocked during
    /// emergency mitigation.
    pub emergency_offender_min: u32,
    /// Distinct IPs sharing one endpoint + header signature within the
    /// window before the pattern is flagged as a botnet.
    pub botnet_distinct_ip_threshold: usize,
    pub botnet_window_ms: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            per_ip_threshold: 20,
            attack_population_threshold: 50,
            observation_window_ms: 10_000,
            emergency_volume_threshold: 1_000,
            volume_window_ms: 10_000,
            emergency_offender_min: 3,
            botnet_distinct_ip_threshold: 20,
            botnet_window_ms: 10_000,
        }
    }
}

/// Counter-store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// "memory" (default) or "redis".
    pub backend: String,
    pub redis_url: String,
    /// Windows of inactivity before an in-memory counter is evicted.
    pub idle_windows: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            idle_windows: 3,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageSettings,
    pub rate_limit: RateLimitSettings,
    pub penalties: PenaltySettings,
    pub detection: DetectionSettings,
}
