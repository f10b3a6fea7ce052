use std::time::{SystemTime, UNIX_EPOCH};

pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn format_counter_key(category: &str, fingerprint: &str) -> String {
    format!("{}:{}", category, fingerprint)
}
