//! Common types for Mailforge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for campaign owners (chat-level user ids)
pub type OwnerId = i64;

/// Unique identifier for campaigns (owner id + creation timestamp)
pub type CampaignId = String;

/// Sentinel meaning "no limit" for plan windows
pub const UNLIMITED: i64 = -1;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Build a campaign id from its owner and creation time.
///
/// The pair is unique per owner because a single owner never creates two
/// campaigns within the same second (creation is serialized per user).
pub fn campaign_id(owner_id: OwnerId, created_at: Timestamp) -> CampaignId {
    format!("{}-{}", owner_id, created_at.timestamp())
}

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.contains(char::is_whitespace) {
            return None;
        }
        let parts: Vec<&str> = s.splitn(2, '@').collect();
        if parts.len() == 2
            && !parts[0].is_empty()
            && !parts[1].is_empty()
            && parts[1].contains('.')
            && !parts[1].starts_with('.')
            && !parts[1].ends_with('.')
            && !parts[1].contains('@')
        {
            Some(Self::new(parts[0], parts[1]))
        } else {
            None
        }
    }

    /// Whether a string is a syntactically acceptable recipient address
    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_some()
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| crate::Error::Validation(format!("Invalid email address: {}", s)))
    }
}
