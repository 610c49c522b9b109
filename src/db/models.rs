//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health classification of a monitored target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Online,
    Degraded,
    Offline,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Online => "online",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Some(HealthStatus::Unknown),
            "online" => Some(HealthStatus::Online),
            "degraded" => Some(HealthStatus::Degraded),
            "offline" => Some(HealthStatus::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evidence attached to a target, e.g. a PGP-signed address list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    pub id: i64,
    pub target_id: i64,
    pub proof_type: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Proof {
    /// A proof not yet attached to a stored target.
    pub fn new(proof_type: &str, content: &str) -> Self {
        Self {
            id: 0,
            target_id: 0,
            proof_type: proof_type.trim().to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A monitored .onion/.i2p endpoint, primary or mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorTarget {
    /// Zero until the target has been inserted.
    pub id: i64,
    pub name: String,
    pub canonical_name: String,
    pub normalized_key: String,
    /// Free-text category label.
    pub description: String,
    pub url: String,

    pub status: HealthStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub reachable_attempts: i32,
    pub total_attempts: i32,
    pub average_latency_ms: Option<f64>,

    pub is_mirror: bool,
    pub parent_id: Option<i64>,
    pub mirror_priority: i32,

    pub click_count: i64,
    pub proofs: Vec<Proof>,
}

impl Default for MonitorTarget {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            canonical_name: String::new(),
            normalized_key: String::new(),
            description: "Other".to_string(),
            url: String::new(),
            status: HealthStatus::Unknown,
            last_checked_at: None,
            reachable_attempts: 0,
            total_attempts: 0,
            average_latency_ms: None,
            is_mirror: false,
            parent_id: None,
            mirror_priority: 0,
            click_count: 0,
            proofs: Vec::new(),
        }
    }
}

impl MonitorTarget {
    /// Name shown to people: the canonical form when one exists.
    pub fn display_name(&self) -> &str {
        if self.canonical_name.is_empty() {
            &self.name
        } else {
            &self.canonical_name
        }
    }
}

/// Result of one probe pass for one target. Never stored on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub target_id: i64,
    pub reachable_count: i32,
    pub total_attempts: i32,
    pub average_latency_ms: Option<f64>,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            HealthStatus::Unknown,
            HealthStatus::Online,
            HealthStatus::Degraded,
            HealthStatus::Offline,
        ] {
            assert_eq!(HealthStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(HealthStatus::parse("ONLINE"), Some(HealthStatus::Online));
        assert_eq!(HealthStatus::parse("sideways"), None);
    }
}
