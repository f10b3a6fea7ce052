//! Progressive IP blacklisting and operator whitelisting.
//!
//! Violations escalate a per-IP record through an ordered penalty ladder:
//! CLEAN -> WARNING (logged only) -> TEMP_BLOCK (5 min) -> EXTENDED_BLOCK
//! (60 min) -> PERMANENT. The level never moves down; an expired temporary
//! block stops denying access but the record keeps its level and history,
//! so the next violation continues the ladder instead of restarting it.
//! Only an administrative reset clears a record.
//!
//! The whitelist is authoritative: a whitelisted IP passes `check_access`
//! unconditionally and never accumulates violations.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    AccessResult, PenaltyLevel, PenaltySettings, ViolationType, REASON_IP_BLACKLISTED,
};

/// One recorded violation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: ViolationType,
}

/// Per-IP penalty state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub level: PenaltyLevel,
    pub history: Vec<ViolationEvent>,
    /// Expiry of the current temporary block. PERMANENT blocks ignore this.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl ViolationRecord {
    fn new() -> Self {
        Self {
            level: PenaltyLevel::Clean,
            history: Vec::new(),
            blocked_until: None,
        }
    }

    fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        if self.level == PenaltyLevel::Permanent {
            return true;
        }
        matches!(self.blocked_until, Some(until) if until > now)
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|event| event.at)
    }
}

pub struct BlacklistManager {
    settings: PenaltySettings,
    /// Read-mostly; mutated only by operator calls.
    whitelist: RwLock<HashSet<IpAddr>>,
    records: DashMap<IpAddr, ViolationRecord>,
}

impl BlacklistManager {
    pub fn new(settings: PenaltySettings) -> Self {
        Self {
            settings,
            whitelist: RwLock::new(HashSet::new()),
            records: DashMap::new(),
        }
    }

    /// Blacklist/whitelist gate, run before any per-window check.
    ///
    /// Requests with no resolvable IP pass here; the shared "unknown"
    /// fingerprint bucket constrains them downstream instead.
    pub fn check_access(&self, ip: Option<IpAddr>) -> AccessResult {
        let Some(ip) = ip else {
            return AccessResult::allowed();
        };
        if self.is_whitelisted(ip) {
            return AccessResult::allowed();
        }
        if let Some(record) = self.records.get(&ip) {
            if record.is_blocked(Utc::now()) {
                return AccessResult::denied(REASON_IP_BLACKLISTED);
            }
        }
        AccessResult::allowed()
    }

    /// Record one violation and escalate. Best-effort: whitelisted IPs are
    /// exempt and stay CLEAN no matter how often this is called.
    pub fn record_violation(&self, ip: IpAddr, kind: ViolationType) -> PenaltyLevel {
        if self.is_whitelisted(ip) {
            info!("ignoring {} violation from whitelisted IP {}", kind, ip);
            return PenaltyLevel::Clean;
        }

        let now = Utc::now();
        let mut record = self.records.entry(ip).or_insert_with(ViolationRecord::new);
        record.history.push(ViolationEvent {
            id: Uuid::new_v4(),
            at: now,
            kind,
        });

        let next = match record.level {
            PenaltyLevel::Clean => PenaltyLevel::Warning,
            PenaltyLevel::Warning => PenaltyLevel::TempBlock,
            PenaltyLevel::TempBlock => PenaltyLevel::ExtendedBlock,
            PenaltyLevel::ExtendedBlock | PenaltyLevel::Permanent => PenaltyLevel::Permanent,
        };
        record.level = next;
        record.blocked_until = match next {
            PenaltyLevel::TempBlock => {
                Some(now + Duration::milliseconds(self.settings.temp_block_ms as i64))
            }
            PenaltyLevel::ExtendedBlock => {
                Some(now + Duration::milliseconds(self.settings.extended_block_ms as i64))
            }
            _ => record.blocked_until,
        };

        warn!(
            "violation {} from {} (total {}), penalty now {:?}",
            kind,
            ip,
            record.history.len(),
            next
        );
        next
    }

    /// Mitigation entry used by the DDoS detector: puts an IP straight into
    /// at least TEMP_BLOCK without waiting for the warning stage. The
    /// whitelist still wins.
    pub fn enforce_block(&self, ip: IpAddr, kind: ViolationType) -> PenaltyLevel {
        if self.is_whitelisted(ip) {
            return PenaltyLevel::Clean;
        }
        let now = Utc::now();
        let mut record = self.records.entry(ip).or_insert_with(ViolationRecord::new);
        record.history.push(ViolationEvent {
            id: Uuid::new_v4(),
            at: now,
            kind,
        });
        if record.level < PenaltyLevel::TempBlock {
            record.level = PenaltyLevel::TempBlock;
        }
        if !record.is_blocked(now) || record.blocked_until.is_none() {
            record.blocked_until =
                Some(now + Duration::milliseconds(self.settings.temp_block_ms as i64));
        }
        warn!("enforced block on {} ({}), penalty {:?}", ip, kind, record.level);
        record.level
    }

    pub fn add_to_whitelist(&self, ip: IpAddr) {
        self.whitelist.write().insert(ip);
        info!("whitelisted {}", ip);
    }

    pub fn remove_from_whitelist(&self, ip: IpAddr) -> bool {
        let removed = self.whitelist.write().remove(&ip);
        if removed {
            info!("removed {} from whitelist", ip);
        }
        removed
    }

    pub fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.whitelist.read().contains(&ip)
    }

    /// Administrative reset: the only path that de-escalates. Drops the
    /// record entirely, violation history included.
    pub fn reset_penalty(&self, ip: IpAddr) -> bool {
        let removed = self.records.remove(&ip).is_some();
        if removed {
            info!("administrative penalty reset for {}", ip);
        }
        removed
    }

    pub fn penalty_of(&self, ip: IpAddr) -> PenaltyLevel {
        self.records
            .get(&ip)
            .map(|record| record.level)
            .unwrap_or(PenaltyLevel::Clean)
    }

    pub fn violation_record(&self, ip: IpAddr) -> Option<ViolationRecord> {
        self.records.get(&ip).map(|record| record.clone())
    }

    /// IPs currently denied by `check_access`.
    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        let now = Utc::now();
        self.records
            .iter()
            .filter(|entry| entry.value().is_blocked(now))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Periodic sweep: drops records that no longer block and have been
    /// inactive past the retention horizon. Blocking and PERMANENT records
    /// are never swept.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        let retention = Duration::milliseconds(self.settings.retention_ms as i64);
        self.records.retain(|_, record| {
            if record.is_blocked(now) {
                return true;
            }
            match record.last_activity() {
                Some(at) => now - at < retention,
                None => false,
            }
        });
    }
}
