//! Client library for a CTF practice platform.
//!
//! The platform's HTTP JSON API is reached through [`HttpClient`]; the
//! [`ContainerTracker`] keeps a per-challenge container session in sync with
//! the server and counts it down to expiry.

pub mod api;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http_client;
pub mod session;
pub mod timestamp;
pub mod tracker;

pub use api::{ChallengeInfo, ContainerReport, FlagVerdict, PlatformApi};
pub use config::{ClientConfig, TrackerSettings};
pub use credentials::Credentials;
pub use error::{ApiError, TrackerError};
pub use http_client::{HttpClient, Registration};
pub use session::{ChallengeKey, Classification, ContainerSession, Phase};
pub use tracker::{ContainerTracker, PollOutcome, TrackerEvent, TrackerSnapshot};
