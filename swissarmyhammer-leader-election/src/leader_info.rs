//! Leader identity and heartbeat record

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::error::{ClusterError, Result};

/// Width in bytes of the leader id field (the textual length of a UUID)
pub const LEADER_ID_LEN: usize = 36;

/// Who leads a namespace and how fresh their heartbeat is.
///
/// Two records are equal when their ids are equal, regardless of heartbeat.
/// Comparing records therefore answers "did the leader change?" and not
/// "did the heartbeat advance?".
#[derive(Debug, Clone, Serialize)]
pub struct LeaderInfo {
    id: String,
    heartbeat_interval_millis: i64,
    heartbeat_millis: i64,
}

impl LeaderInfo {
    /// Create a record, rejecting ids that do not fit the fixed-width layout
    pub fn new(
        id: impl Into<String>,
        heartbeat_interval_millis: i64,
        heartbeat_millis: i64,
    ) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ClusterError::invalid_leader_info("id must not be empty"));
        }
        if id.len() > LEADER_ID_LEN {
            return Err(ClusterError::invalid_leader_info(format!(
                "id '{}' is {} bytes, at most {} fit",
                id,
                id.len(),
                LEADER_ID_LEN
            )));
        }
        if id.contains('\0') {
            return Err(ClusterError::invalid_leader_info("id must not contain NUL"));
        }
        if heartbeat_interval_millis < 0 || heartbeat_millis < 0 {
            return Err(ClusterError::invalid_leader_info(
                "heartbeat fields must not be negative",
            ));
        }

        Ok(Self {
            id,
            heartbeat_interval_millis,
            heartbeat_millis,
        })
    }

    /// Leader identity
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared heartbeat cadence of the leader, in milliseconds
    pub fn heartbeat_interval_millis(&self) -> i64 {
        self.heartbeat_interval_millis
    }

    /// Last heartbeat timestamp, in milliseconds since the epoch
    pub fn heartbeat_millis(&self) -> i64 {
        self.heartbeat_millis
    }

    /// Same id and interval with a newer heartbeat
    pub fn with_heartbeat(&self, heartbeat_millis: i64) -> Result<Self> {
        Self::new(
            self.id.clone(),
            self.heartbeat_interval_millis,
            heartbeat_millis,
        )
    }
}

impl PartialEq for LeaderInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LeaderInfo {}

impl Hash for LeaderInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for LeaderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (interval {}ms, heartbeat {})",
            self.id, self.heartbeat_interval_millis, self.heartbeat_millis
        )
    }
}

/// Current wall-clock time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "6c9d0a51-93f5-4f6b-a0a3-6ed0e1f1c2a4";

    #[test]
    fn test_new_accepts_uuid_width_id() {
        let info = LeaderInfo::new(UUID, 1000, 42).unwrap();
        assert_eq!(info.id(), UUID);
        assert_eq!(info.heartbeat_interval_millis(), 1000);
        assert_eq!(info.heartbeat_millis(), 42);
    }

    #[test]
    fn test_new_rejects_invalid_ids() {
        assert!(LeaderInfo::new("", 1000, 0).is_err());
        assert!(LeaderInfo::new(format!("{}x", UUID), 1000, 0).is_err());
        assert!(LeaderInfo::new("a\0b", 1000, 0).is_err());
    }

    #[test]
    fn test_new_rejects_negative_fields() {
        assert!(LeaderInfo::new("a", -1, 0).is_err());
        assert!(LeaderInfo::new("a", 1, -1).is_err());
    }

    #[test]
    fn test_multibyte_id_width_is_measured_in_bytes() {
        // 12 three-byte characters fill the field exactly, one more does not fit
        let fits = "\u{20ac}".repeat(12);
        assert!(LeaderInfo::new(fits, 1, 1).is_ok());
        let overflows = "\u{20ac}".repeat(13);
        assert!(LeaderInfo::new(overflows, 1, 1).is_err());
    }

    #[test]
    fn test_equality_ignores_heartbeat() {
        let a = LeaderInfo::new("A", 1000, 1000).unwrap();
        let advanced = a.with_heartbeat(2000).unwrap();
        let b = LeaderInfo::new("B", 1000, 1000).unwrap();

        assert_eq!(a, advanced);
        assert_ne!(a, b);
    }

    #[test]
    fn test_now_millis_is_positive() {
        assert!(now_millis() > 0);
    }
}
