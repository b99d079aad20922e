//! Container session and challenge identity types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite identity of a challenge: category, subcategory and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeKey {
    #[serde(rename = "title")]
    pub category: String,
    #[serde(rename = "title_son")]
    pub subcategory: String,
    pub challenge_name: String,
}

impl ChallengeKey {
    pub fn new(
        category: impl Into<String>,
        subcategory: impl Into<String>,
        challenge_name: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            subcategory: subcategory.into(),
            challenge_name: challenge_name.into(),
        }
    }
}

impl fmt::Display for ChallengeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.category, self.subcategory, self.challenge_name)
    }
}

/// A container allocated to the current user for one challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSession {
    pub key: ChallengeKey,
    /// Opaque `host:port` the user connects to.
    pub endpoint: String,
    pub start_time: DateTime<Utc>,
    /// Sole authority for expiry.
    pub end_time: DateTime<Utc>,
}

impl ContainerSession {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.end_time
    }
}

/// Whether a challenge needs a container, as derived from its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Metadata has not been fetched yet.
    #[default]
    Unknown,
    Static,
    Dynamic,
}

impl Classification {
    /// A challenge is dynamic when its runtime image field is present and
    /// not blank.
    pub fn from_docker_field(docker: Option<&str>) -> Self {
        match docker {
            Some(image) if !image.trim().is_empty() => Classification::Dynamic,
            _ => Classification::Static,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Classification::Unknown => "detecting...",
            Classification::Static => "static",
            Classification::Dynamic => "dynamic",
        }
    }
}

/// Lifecycle phase of the tracked container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    NoContainer,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::NoContainer => "no container",
            Phase::Starting => "starting",
            Phase::Active => "active",
            Phase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}
