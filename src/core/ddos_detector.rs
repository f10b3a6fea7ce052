//! Distributed-attack and botnet-pattern detection.
//!
//! The detector watches aggregate traffic across many fingerprints and owns
//! the process-wide attack state:
//!
//! - IDLE -> ACTIVE when the number of distinct IPs each exceeding a modest
//!   per-IP threshold crosses the population threshold within the
//!   observation window. Offenders are flagged and fed to the blacklist.
//! - any state -> EMERGENCY when aggregate anonymous volume crosses the
//!   emergency threshold within the volume window. Offending IPs are
//!   force-blocked.
//!
//! Requests carrying an authenticated user id never feed these heuristics:
//! population diversity without stable identity is the attack signal, not
//! raw volume. Whitelisted IPs are likewise exempt end to end. De-escalation
//! happens only through `reset_attack_state`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use crate::core::blacklist::BlacklistManager;
use crate::core::fingerprint::resolve_client_ip;
use crate::models::{AttackState, AttackStatus, DetectionSettings, RequestMeta, ViolationType};

struct IpWindow {
    count: u32,
    window_start: Instant,
}

struct SignatureWindow {
    ips: HashSet<IpAddr>,
    window_start: Instant,
}

struct VolumeWindow {
    count: u64,
    window_start: Instant,
}

struct AttackSnapshot {
    state: AttackState,
    flagged: HashSet<IpAddr>,
    auto_blocked: HashSet<IpAddr>,
    botnet_detected: bool,
}

pub struct DdosDetector {
    settings: DetectionSettings,
    blacklist: Arc<BlacklistManager>,
    /// Per-IP counts for anonymous traffic only.
    ip_windows: DashMap<IpAddr, IpWindow>,
    /// Distinct-IP sets per (endpoint, header signature).
    signatures: DashMap<String, SignatureWindow>,
    /// Aggregate anonymous volume. One short critical section per request.
    volume: Mutex<VolumeWindow>,
    /// Global attack state; written only on escalations.
    status: RwLock<AttackSnapshot>,
}

impl DdosDetector {
    pub fn new(settings: DetectionSettings, blacklist: Arc<BlacklistManager>) -> Self {
        Self {
            settings,
            blacklist,
            ip_windows: DashMap::new(),
            signatures: DashMap::new(),
            volume: Mutex::new(VolumeWindow {
                count: 0,
                window_start: Instant::now(),
            }),
            status: RwLock::new(AttackSnapshot {
                state: AttackState::Idle,
                flagged: HashSet::new(),
                auto_blocked: HashSet::new(),
                botnet_detected: false,
            }),
        }
    }

    /// Feed one request into the aggregate state. Called for every request
    /// after the allow/deny decision; escalation side effects (flagging,
    /// auto-blacklisting) happen here.
    pub fn observe(&self, meta: &RequestMeta) {
        if meta.user_id.is_some() {
            // Stable authenticated identity: legitimate traffic by
            // definition of the diversity heuristic.
            return;
        }
        let Some(ip) = resolve_client_ip(meta) else {
            return;
        };
        if self.blacklist.is_whitelisted(ip) {
            return;
        }
        let now = Instant::now();

        let ip_count = self.bump_ip(ip, now);
        let volume = self.bump_volume(now);
        self.bump_signature(meta, ip, now);

        if ip_count == self.settings.per_ip_threshold {
            self.flag_offender(ip);
        }
        if volume == self.settings.emergency_volume_threshold {
            self.enter_emergency(now);
        } else if self.is_emergency_mode() && ip_count == self.settings.emergency_offender_min {
            self.auto_block(ip);
        }
    }

    /// True when an attack is in progress and this request's IP is
    /// implicated. Authenticated and whitelisted traffic is never
    /// implicated.
    pub fn detect_attack(&self, meta: &RequestMeta) -> bool {
        if meta.user_id.is_some() {
            return false;
        }
        let Some(ip) = resolve_client_ip(meta) else {
            return false;
        };
        if self.blacklist.is_whitelisted(ip) {
            return false;
        }
        let status = self.status.read();
        status.state != AttackState::Idle && status.flagged.contains(&ip)
    }

    /// True when this request's (endpoint, header signature) pair has been
    /// seen from at least the configured number of distinct IPs within the
    /// botnet window. Independent of any per-IP rate limit.
    pub fn detect_botnet_pattern(&self, meta: &RequestMeta) -> bool {
        let key = signature_key(meta);
        let Some(window) = self.signatures.get(&key) else {
            return false;
        };
        let in_window = (window.window_start.elapsed().as_millis() as u64)
            < self.settings.botnet_window_ms;
        in_window && window.ips.len() >= self.settings.botnet_distinct_ip_threshold
    }

    pub fn attack_status(&self) -> AttackStatus {
        let status = self.status.read();
        let mut flagged_ips: Vec<IpAddr> = status.flagged.iter().copied().collect();
        flagged_ips.sort();
        AttackStatus {
            state: status.state,
            flagged_ips,
            botnet_detected: status.botnet_detected,
        }
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.status.read().state == AttackState::Emergency
    }

    /// IPs this detector has proactively fed to the blacklist.
    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        let status = self.status.read();
        let mut ips: Vec<IpAddr> = status.auto_blocked.iter().copied().collect();
        ips.sort();
        ips
    }

    /// Administrative stand-down: the only de-escalation path.
    pub fn reset_attack_state(&self) {
        let mut status = self.status.write();
        status.state = AttackState::Idle;
        status.flagged.clear();
        status.auto_blocked.clear();
        status.botnet_detected = false;
        warn!("attack state administratively reset to IDLE");
    }

    /// Drop observation windows idle past their horizon.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        let obs = self.settings.observation_window_ms;
        self.ip_windows.retain(|_, window| {
            (now.duration_since(window.window_start).as_millis() as u64) < obs * 2
        });
        let bot = self.settings.botnet_window_ms;
        self.signatures.retain(|_, window| {
            (now.duration_since(window.window_start).as_millis() as u64) < bot * 2
        });
    }

    fn bump_ip(&self, ip: IpAddr, now: Instant) -> u32 {
        let mut entry = self.ip_windows.entry(ip).or_insert_with(|| IpWindow {
            count: 0,
            window_start: now,
        });
        let elapsed = now.duration_since(entry.window_start).as_millis() as u64;
        if elapsed >= self.settings.observation_window_ms {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        entry.count
    }

    fn bump_volume(&self, now: Instant) -> u64 {
        let mut volume = self.volume.lock();
        let elapsed = now.duration_since(volume.window_start).as_millis() as u64;
        if elapsed >= self.settings.volume_window_ms {
            volume.count = 0;
            volume.window_start = now;
        }
        volume.count += 1;
        volume.count
    }

    fn bump_signature(&self, meta: &RequestMeta, ip: IpAddr, now: Instant) {
        let key = signature_key(meta);
        let mut entry = self
            .signatures
            .entry(key)
            .or_insert_with(|| SignatureWindow {
                ips: HashSet::new(),
                window_start: now,
            });
        let elapsed = now.duration_since(entry.window_start).as_millis() as u64;
        if elapsed >= self.settings.botnet_window_ms {
            entry.ips.clear();
            entry.window_start = now;
        }
        entry.ips.insert(ip);
        if entry.ips.len() == self.settings.botnet_distinct_ip_threshold {
            let distinct = entry.ips.len();
            drop(entry);
            let mut status = self.status.write();
            if !status.botnet_detected {
                status.botnet_detected = true;
                metrics::counter!("gatekeeper_botnet_patterns_total", 1);
                error!(
                    "botnet pattern: {} distinct IPs sharing one header signature on {}",
                    distinct, meta.path
                );
            }
        }
    }

    /// An IP just crossed the per-IP threshold. Flag it and, if the flagged
    /// population is large enough, escalate IDLE -> ACTIVE.
    fn flag_offender(&self, ip: IpAddr) {
        let mut status = self.status.write();
        if !status.flagged.insert(ip) {
            return;
        }
        let population = status.flagged.len();
        let state = status.state;
        if state == AttackState::Idle {
            if population < self.settings.attack_population_threshold {
                return;
            }
            status.state = AttackState::Active;
            metrics::counter!("gatekeeper_attack_escalations_total", 1);
            error!(
                "distributed attack detected: {} offending IPs, escalating to ACTIVE",
                population
            );
            let offenders: Vec<IpAddr> = status.flagged.iter().copied().collect();
            drop(status);
            for offender in offenders {
                self.blacklist
                    .record_violation(offender, ViolationType::DdosAttempt);
            }
        } else {
            drop(status);
            self.blacklist.record_violation(ip, ViolationType::DdosAttempt);
        }
    }

    /// Aggregate volume just crossed the emergency threshold: escalate and
    /// force-block every IP active enough in the current window.
    fn enter_emergency(&self, now: Instant) {
        let offenders: Vec<IpAddr> = self
            .ip_windows
            .iter()
            .filter(|entry| {
                let window = entry.value();
                let in_window = (now.duration_since(window.window_start).as_millis() as u64)
                    < self.settings.volume_window_ms;
                in_window && window.count >= self.settings.emergency_offender_min
            })
            .map(|entry| *entry.key())
            .collect();

        {
            let mut status = self.status.write();
            if status.state != AttackState::Emergency {
                metrics::counter!("gatekeeper_attack_escalations_total", 1);
                error!(
                    "sustained volume attack: escalating to EMERGENCY, blocking {} IPs",
                    offenders.len()
                );
            }
            status.state = AttackState::Emergency;
            status.flagged.extend(offenders.iter().copied());
            status.auto_blocked.extend(offenders.iter().copied());
        }
        for offender in offenders {
            self.blacklist.enforce_block(offender, ViolationType::DdosAttempt);
        }
    }

    /// Late offender during an ongoing emergency.
    fn auto_block(&self, ip: IpAddr) {
        {
            let mut status = self.status.write();
            if !status.auto_blocked.insert(ip) {
                return;
            }
            status.flagged.insert(ip);
        }
        self.blacklist.enforce_block(ip, ViolationType::DdosAttempt);
    }
}

fn signature_key(meta: &RequestMeta) -> String {
    format!(
        "{}|{}|{}|{}",
        meta.path,
        meta.accept.as_deref().unwrap_or("-"),
        meta.accept_language.as_deref().unwrap_or("-"),
        meta.cache_control.as_deref().unwrap_or("-")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PenaltySettings;

    fn detector(settings: DetectionSettings) -> (DdosDetector, Arc<BlacklistManager>) {
        let blacklist = Arc::new(BlacklistManager::new(PenaltySettings::default()));
        (DdosDetector::new(settings, blacklist.clone()), blacklist)
    }

    fn anon_meta(ip: &str) -> RequestMeta {
        let mut meta = RequestMeta::from_ip(ip.parse().unwrap());
        meta.path = "/api/records".to_string();
        meta
    }

    fn attacker_ip(index: usize) -> String {
        format!("203.0.{}.{}", index / 200, index % 200 + 1)
    }

    #[test]
    fn distributed_attack_escalates_to_active() {
        // Emergency volume pushed out of reach so the population heuristic
        // is what fires.
        let settings = DetectionSettings {
            emergency_volume_threshold: 1_000_000,
            ..DetectionSettings::default()
        };
        let (detector, _) = detector(settings);

        for index in 0..100 {
            let meta = anon_meta(&attacker_ip(index));
            for _ in 0..20 {
                detector.observe(&meta);
            }
        }

        let status = detector.attack_status();
        assert_eq!(status.state, AttackState::Active);
        assert!(
            status.flagged_ips.len() > 50,
            "more than half of the attackers must be flagged, got {}",
            status.flagged_ips.len()
        );
        assert!(detector.detect_attack(&anon_meta(&attacker_ip(0))));
    }

    #[test]
    fn single_noisy_ip_is_not_an_attack() {
        let settings = DetectionSettings {
            emergency_volume_threshold: 1_000_000,
            ..DetectionSettings::default()
        };
        let (detector, _) = detector(settings);

        let meta = anon_meta("192.168.1.100");
        for _ in 0..150 {
            detector.observe(&meta);
        }
        assert_eq!(detector.attack_status().state, AttackState::Idle);
        assert!(!detector.detect_attack(&meta));
    }

    #[test]
    fn sustained_volume_triggers_emergency_and_blocks() {
        let (detector, blacklist) = detector(DetectionSettings::default());

        // ~1,000 requests from rotating IPs, each too quiet to trip the
        // per-IP threshold on its own.
        for index in 0..250 {
            let meta = anon_meta(&attacker_ip(index));
            for _ in 0..4 {
                detector.observe(&meta);
            }
        }

        assert!(detector.is_emergency_mode());
        let blocked = detector.blocked_ips();
        assert!(!blocked.is_empty());
        let denied = blacklist.check_access(Some(blocked[0]));
        assert!(!denied.allowed);
    }

    #[test]
    fn authenticated_volume_is_never_an_attack() {
        let (detector, _) = detector(DetectionSettings::default());

        for user in 0..5 {
            let meta = anon_meta("198.51.100.77").with_user(&format!("user-{}", user));
            for _ in 0..30 {
                detector.observe(&meta);
                assert!(!detector.detect_attack(&meta));
            }
        }
        assert_eq!(detector.attack_status().state, AttackState::Idle);
        assert!(detector.blocked_ips().is_empty());
    }

    #[test]
    fn whitelisted_ips_never_feed_detection() {
        let settings = DetectionSettings {
            emergency_volume_threshold: 1_000_000,
            ..DetectionSettings::default()
        };
        let (detector, blacklist) = detector(settings);
        let partner: IpAddr = "198.51.100.40".parse().unwrap();
        blacklist.add_to_whitelist(partner);

        let meta = anon_meta("198.51.100.40");
        for _ in 0..100 {
            detector.observe(&meta);
        }
        assert!(!detector.detect_attack(&meta));
        assert!(detector.attack_status().flagged_ips.is_empty());
        assert_eq!(detector.attack_status().state, AttackState::Idle);
    }

    #[test]
    fn botnet_pattern_needs_distinct_ips_on_one_signature() {
        let settings = DetectionSettings {
            botnet_distinct_ip_threshold: 20,
            emergency_volume_threshold: 1_000_000,
            ..DetectionSettings::default()
        };
        let (detector, _) = detector(settings);

        let herd_meta = |ip: &str| {
            let mut meta = anon_meta(ip);
            meta.accept = Some("*/*".to_string());
            meta.accept_language = Some("en-US".to_string());
            meta.cache_control = Some("no-cache".to_string());
            meta
        };

        for index in 0..19 {
            detector.observe(&herd_meta(&attacker_ip(index)));
        }
        assert!(!detector.detect_botnet_pattern(&herd_meta("203.0.113.250")));
        assert!(!detector.attack_status().botnet_detected);

        detector.observe(&herd_meta(&attacker_ip(19)));
        assert!(detector.detect_botnet_pattern(&herd_meta("203.0.113.250")));
        assert!(detector.attack_status().botnet_detected);

        // A different endpoint with the same headers is a different herd.
        let mut other = herd_meta("203.0.113.251");
        other.path = "/api/other".to_string();
        assert!(!detector.detect_botnet_pattern(&other));
    }

    #[test]
    fn reset_stands_the_system_down() {
        let settings = DetectionSettings {
            emergency_volume_threshold: 100,
            ..DetectionSettings::default()
        };
        let (detector, _) = detector(settings);
        for index in 0..25 {
            let meta = anon_meta(&attacker_ip(index));
            for _ in 0..4 {
                detector.observe(&meta);
            }
        }
        assert!(detector.is_emergency_mode());

        detector.reset_attack_state();
        let status = detector.attack_status();
        assert_eq!(status.state, AttackState::Idle);
        assert!(status.flagged_ips.is_empty());
        assert!(detector.blocked_ips().is_empty());
    }
}
