//! Platform API surface: response records and the `PlatformApi` trait.

use crate::error::ApiError;
use crate::session::{ChallengeKey, Classification};
use crate::timestamp::parse_server_time;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Calls the container tracker and flag submission depend on.
#[async_trait]
pub trait PlatformApi: Send + Sync + 'static {
    /// Challenge metadata, including the runtime image field.
    async fn challenge_info(&self, key: &ChallengeKey) -> Result<ChallengeInfo, ApiError>;

    /// The user's running container, if any. A user holds at most one
    /// container platform-wide.
    async fn container_status(&self) -> Result<Option<ContainerReport>, ApiError>;

    async fn start_container(&self, key: &ChallengeKey) -> Result<ContainerReport, ApiError>;

    async fn stop_container(&self, key: &ChallengeKey) -> Result<(), ApiError>;

    /// Prolong the user's running container. The reply may carry only the
    /// fields that changed.
    async fn extend_container(&self) -> Result<ContainerReport, ApiError>;

    async fn submit_flag(&self, key: &ChallengeKey, flag: &str) -> Result<FlagVerdict, ApiError>;
}

/// Common JSON envelope of every platform reply.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    pub result: bool,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub challenges: Option<Value>,
}

impl Envelope {
    /// Human-readable reason for a `result: false` reply.
    pub fn denial_reason(&self, fallback: &str) -> String {
        let candidates = [
            self.cause.as_deref(),
            self.message.as_str(),
            self.message.get("cause").and_then(Value::as_str),
        ];
        candidates
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|reason| !reason.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }

    pub fn into_denial(self, fallback: &str) -> ApiError {
        ApiError::Denied(self.denial_reason(fallback))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subcategory {
    pub id: String,
    pub name: String,
}

/// One row of a subcategory's challenge list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSummary {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub solved: bool,
    #[serde(default)]
    pub solves: u64,
}

/// Challenge detail as shown on the challenge page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeInfo {
    pub key: ChallengeKey,
    pub description: Option<String>,
    pub hint: Option<String>,
    pub appendix: Option<String>,
    pub solves: u64,
    pub solved: bool,
    pub docker: Option<String>,
}

impl ChallengeInfo {
    pub fn classification(&self) -> Classification {
        Classification::from_docker_field(self.docker.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct WireChallengeInfo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    title_son: Option<String>,
    #[serde(default)]
    challenge_name: Option<String>,
    information: WireInformation,
}

#[derive(Debug, Deserialize)]
struct WireInformation {
    #[serde(default)]
    describe: Option<String>,
    #[serde(default)]
    hit: Option<String>,
    #[serde(default)]
    appendix: Option<String>,
    #[serde(default)]
    challenge_success_number: u64,
    #[serde(default)]
    history: bool,
    #[serde(default)]
    docker: Option<String>,
}

impl ChallengeInfo {
    /// Build from the `message` of a challenge detail reply; key fields the
    /// server leaves out fall back to `requested`.
    pub(crate) fn from_message(message: Value, requested: &ChallengeKey) -> Result<Self, ApiError> {
        let wire: WireChallengeInfo = serde_json::from_value(message)?;
        let info = wire.information;
        Ok(Self {
            key: ChallengeKey {
                category: wire.title.unwrap_or_else(|| requested.category.clone()),
                subcategory: wire.title_son.unwrap_or_else(|| requested.subcategory.clone()),
                challenge_name: wire
                    .challenge_name
                    .unwrap_or_else(|| requested.challenge_name.clone()),
            },
            description: info.describe,
            hint: info.hit,
            appendix: info.appendix,
            solves: info.challenge_success_number,
            solved: info.history,
            docker: info.docker,
        })
    }
}

/// Container details reported by the orchestration service. Every field
/// is optional because extend replies are partial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerReport {
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub challenge_name: Option<String>,
    pub endpoint: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireContainer {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    title_son: Option<String>,
    #[serde(default)]
    challenge_name: Option<String>,
    #[serde(default)]
    container_url: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

impl ContainerReport {
    pub(crate) fn from_message(message: Value) -> Result<Self, ApiError> {
        let wire: WireContainer = serde_json::from_value(message)?;
        let time = |raw: Option<String>| -> Result<Option<DateTime<Utc>>, ApiError> {
            raw.filter(|s| !s.trim().is_empty())
                .map(|s| parse_server_time(&s))
                .transpose()
        };
        Ok(Self {
            category: non_empty(wire.title),
            subcategory: non_empty(wire.title_son),
            challenge_name: non_empty(wire.challenge_name),
            endpoint: non_empty(wire.container_url),
            start_time: time(wire.start_time)?,
            end_time: time(wire.end_time)?,
        })
    }

    /// Whether this report describes a container for `key`. The challenge
    /// name must match; category and subcategory are compared only when
    /// the server includes them.
    pub fn matches(&self, key: &ChallengeKey) -> bool {
        let same = |reported: &Option<String>, ours: &str| {
            reported.as_deref().map_or(true, |r| r == ours)
        };
        self.challenge_name.as_deref() == Some(key.challenge_name.as_str())
            && same(&self.category, &key.category)
            && same(&self.subcategory, &key.subcategory)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Outcome of a flag submission. A wrong flag is a verdict, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagVerdict {
    pub correct: bool,
    pub cause: String,
}

/// Account details returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub identity: Option<String>,
}

/// Turn an `{ "1": "Web", "2": "Pwn" }` map into `(id, name)` pairs ordered
/// by numeric id where possible.
pub(crate) fn ordered_entries(map: &Value) -> Result<Vec<(String, String)>, ApiError> {
    let object = map
        .as_object()
        .ok_or_else(|| ApiError::malformed("expected an id-to-name object"))?;
    let mut entries: Vec<(String, String)> = object
        .iter()
        .filter_map(|(id, name)| name.as_str().map(|n| (id.clone(), n.to_string())))
        .collect();
    entries.sort_by(|(a, _), (b, _)| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn denial_reason_prefers_top_level_cause() {
        let env = envelope(json!({"result": false, "cause": "flag is wrong", "message": "ignored"}));
        assert_eq!(env.denial_reason("fallback"), "flag is wrong");
    }

    #[test]
    fn denial_reason_reads_message_string_and_nested_cause() {
        let env = envelope(json!({"result": false, "message": "container already running"}));
        assert_eq!(env.denial_reason("fallback"), "container already running");

        let env = envelope(json!({"result": false, "message": {"cause": "no such challenge"}}));
        assert_eq!(env.denial_reason("fallback"), "no such challenge");

        let env = envelope(json!({"result": false, "message": {}}));
        assert_eq!(env.denial_reason("fallback"), "fallback");
    }

    #[test]
    fn challenge_info_parses_detail_message() {
        let requested = ChallengeKey::new("Web", "SQLi", "login-bypass");
        let info = ChallengeInfo::from_message(
            json!({
                "challenge_name": "login-bypass",
                "title": "Web",
                "title_son": "SQLi",
                "information": {
                    "describe": "Bypass the login form.",
                    "hit": null,
                    "appendix": null,
                    "challenge_success_number": 12,
                    "history": true,
                    "docker": "ctf/sqli:1"
                }
            }),
            &requested,
        )
        .unwrap();
        assert_eq!(info.key, requested);
        assert_eq!(info.solves, 12);
        assert!(info.solved);
        assert_eq!(info.classification(), Classification::Dynamic);
    }

    #[test]
    fn challenge_info_without_docker_is_static() {
        let requested = ChallengeKey::new("Misc", "Basics", "hello");
        let info = ChallengeInfo::from_message(
            json!({"information": {"describe": "say hi", "docker": ""}}),
            &requested,
        )
        .unwrap();
        assert_eq!(info.key, requested);
        assert_eq!(info.classification(), Classification::Static);
    }

    #[test]
    fn container_report_normalizes_times() {
        let report = ContainerReport::from_message(json!({
            "title": "Web",
            "title_son": "SQLi",
            "challenge_name": "login-bypass",
            "container_url": "10.0.0.5:32768",
            "start_time": "2025-03-14T09:00:00",
            "end_time": "2025-03-14T09:30:00Z"
        }))
        .unwrap();
        let end = report.end_time.unwrap();
        assert_eq!(end - report.start_time.unwrap(), chrono::Duration::minutes(30));
        assert_eq!(report.endpoint.as_deref(), Some("10.0.0.5:32768"));
    }

    #[test]
    fn container_report_matching() {
        let key = ChallengeKey::new("Web", "SQLi", "login-bypass");
        let mut report = ContainerReport {
            challenge_name: Some("login-bypass".into()),
            ..Default::default()
        };
        assert!(report.matches(&key));

        report.subcategory = Some("XSS".into());
        assert!(!report.matches(&key));

        let other = ContainerReport {
            challenge_name: Some("heap-101".into()),
            ..Default::default()
        };
        assert!(!other.matches(&key));
        assert!(!ContainerReport::default().matches(&key));
    }

    #[test]
    fn ordered_entries_sorts_numeric_ids() {
        let entries = ordered_entries(&json!({"10": "Crypto", "2": "Pwn", "1": "Web"})).unwrap();
        let names: Vec<_> = entries.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, ["Web", "Pwn", "Crypto"]);
        assert!(ordered_entries(&json!(["Web"])).is_err());
    }
}
