//! Enumerated option values shared by configs and query options.

use serde::{Deserialize, Serialize};

/// Durability requirement for staged and committed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl DurabilityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurabilityLevel::None => "none",
            DurabilityLevel::Majority => "majority",
            DurabilityLevel::MajorityAndPersistToActive => "majority_and_persist_to_active",
            DurabilityLevel::PersistToMajority => "persist_to_majority",
        }
    }
}

/// Query scan consistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanConsistency {
    NotBounded,
    RequestPlus,
}

/// Query profiling mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryProfile {
    #[default]
    Off,
    Phases,
    Timings,
}

impl QueryProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryProfile::Off => "off",
            QueryProfile::Phases => "phases",
            QueryProfile::Timings => "timings",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durability_uses_snake_case_names() {
        let value = serde_json::to_value(DurabilityLevel::MajorityAndPersistToActive).unwrap();
        assert_eq!(value, "majority_and_persist_to_active");
        let parsed: DurabilityLevel = serde_json::from_value("persist_to_majority".into()).unwrap();
        assert_eq!(parsed, DurabilityLevel::PersistToMajority);
        assert_eq!(parsed.as_str(), "persist_to_majority");
    }

    #[test]
    fn unknown_scan_consistency_is_rejected() {
        assert!(serde_json::from_value::<ScanConsistency>("eventual".into()).is_err());
    }
}
