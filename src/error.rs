//! Error types for the platform client and the container tracker.

use crate::session::Phase;
use thiserror::Error;

/// Failure of a single call against the platform API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a readable response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success HTTP status.
    #[error("server returned HTTP {0}")]
    Status(u16),

    /// The body was not the JSON shape the endpoint promises.
    #[error("unexpected response: {0}")]
    Malformed(String),

    /// The server understood the request and said no (`result: false`).
    #[error("{0}")]
    Denied(String),
}

impl ApiError {
    pub fn malformed(what: impl Into<String>) -> Self {
        ApiError::Malformed(what.into())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Malformed(err.to_string())
    }
}

/// Failure of a tracker action. Every variant leaves the tracker in a
/// well-defined phase.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("this challenge is static and has no container")]
    StaticChallenge,

    #[error("challenge type is still being detected")]
    Undetected,

    #[error("no challenge is loaded")]
    NotLoaded,

    #[error("cannot {action} while {phase}")]
    InvalidPhase { action: &'static str, phase: Phase },

    #[error("the displayed challenge changed while the request was in flight")]
    Superseded,

    #[error("flag must not be empty")]
    EmptyFlag,
}
