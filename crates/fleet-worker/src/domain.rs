//! Work-item domains.

use std::fmt;

use fleet_store::keys;
use serde::{Deserialize, Serialize};

/// A family of work items sharing one store prefix and one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Metric-driven scaling.
    Scalers,
    /// Per-instance healing.
    Healers,
    /// Cron windows.
    Schedulers,
}

impl Domain {
    /// Every domain, in start order.
    pub const ALL: [Self; 3] = [Self::Scalers, Self::Healers, Self::Schedulers];

    /// Store prefix holding this domain's definitions.
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Scalers => keys::SCALERS_PREFIX,
            Self::Healers => keys::HEALERS_PREFIX,
            Self::Schedulers => keys::SCHEDULERS_PREFIX,
        }
    }

    /// Returns the domain as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scalers => "scalers",
            Self::Healers => "healers",
            Self::Schedulers => "schedulers",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_match_key_layout() {
        assert_eq!(Domain::Scalers.prefix(), "/scalers/");
        assert_eq!(Domain::Healers.prefix(), "/healers/");
        assert_eq!(Domain::Schedulers.prefix(), "/schedulers/");
    }

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(Domain::Healers.to_string(), "healers");
        assert_eq!(serde_json::to_string(&Domain::Scalers).unwrap(), "\"scalers\"");
    }
}
