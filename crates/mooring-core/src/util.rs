//! Shared utility functions used across multiple modules.

use std::hash::{Hash, Hasher};

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Stable-per-process hash of a caller identity, for log fields.
pub fn fingerprint(identity: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    identity.hash(&mut hasher);
    hasher.finish()
}

/// Normalize optional text by trimming whitespace and removing empties.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_millis(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
        assert_eq!(
            normalize_text_option(Some(" key ".to_string())),
            Some("key".to_string())
        );
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint("client-a"), fingerprint("client-a"));
        assert_ne!(fingerprint("client-a"), fingerprint("client-b"));
    }

    #[test]
    fn duration_millis_saturates() {
        assert_eq!(duration_millis(std::time::Duration::from_secs(2)), 2_000);
        assert_eq!(duration_millis(std::time::Duration::MAX), i64::MAX);
    }
}
