//! Threat levels and classification verdicts

use serde::{Deserialize, Serialize};
use std::fmt;

/// Threat level reported by a classifier for a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    /// Normal operations
    Normal,

    /// Fights, crowding, suspicious activity
    Dangerous,

    /// Weapons, violence, panic
    Critical,
}

impl ThreatLevel {
    /// Parse a level name leniently.
    ///
    /// Matching is case-insensitive and ignores surrounding whitespace.
    /// Anything unrecognised is treated as `Normal`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => ThreatLevel::Critical,
            "DANGEROUS" => ThreatLevel::Dangerous,
            _ => ThreatLevel::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Normal => "NORMAL",
            ThreatLevel::Dangerous => "DANGEROUS",
            ThreatLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one analysed frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Threat level
    pub level: ThreatLevel,

    /// Free-text explanation from the classifier
    pub reason: String,
}

impl Classification {
    pub fn new(level: ThreatLevel, reason: impl Into<String>) -> Self {
        Self {
            level,
            reason: reason.into(),
        }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(ThreatLevel::Normal, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_levels() {
        assert_eq!(ThreatLevel::parse("CRITICAL"), ThreatLevel::Critical);
        assert_eq!(ThreatLevel::parse("dangerous"), ThreatLevel::Dangerous);
        assert_eq!(ThreatLevel::parse("  Normal "), ThreatLevel::Normal);
    }

    #[test]
    fn test_parse_unknown_level_is_normal() {
        assert_eq!(ThreatLevel::parse("SEVERE"), ThreatLevel::Normal);
        assert_eq!(ThreatLevel::parse(""), ThreatLevel::Normal);
    }

    #[test]
    fn test_level_serialization() {
        let json = serde_json::to_string(&ThreatLevel::Dangerous).unwrap();
        assert_eq!(json, "\"DANGEROUS\"");

        let level: ThreatLevel = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(level, ThreatLevel::Critical);
    }
}
