//! HTTP client for the practice platform using reqwest.
//!
//! Every call is a JSON POST carrying the bearer token in the body. Both the
//! HTTP status and the JSON `result` flag decide success.

use crate::api::{
    ordered_entries, Category, ChallengeInfo, ChallengeSummary, ContainerReport, Envelope,
    FlagVerdict, PlatformApi, Subcategory, UserInfo,
};
use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::error::ApiError;
use crate::session::ChallengeKey;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const LOGIN: &str = "/api/login";
const REGISTER: &str = "/api/register";
const RESET_PASSWORD: &str = "/api/reset_password";
const CATEGORIES: &str = "/api/user/challenge/title";
const SUBCATEGORIES: &str = "/api/user/challenge/son";
const CHALLENGE_LIST: &str = "/api/user/challenge/list";
const CHALLENGE_INFO: &str = "/api/user/challenge/information";
const FLAG_SUBMIT: &str = "/api/user/challenge/submit";
const CONTAINER_STATUS: &str = "/api/dynamic/container/status";
const CONTAINER_ADD: &str = "/api/dynamic/container/add";
const CONTAINER_REDUCE: &str = "/api/dynamic/container/reduce";
const CONTAINER_TIME: &str = "/api/dynamic/container/time";

/// New account details for [`HttpClient::register`].
#[derive(Clone)]
pub struct Registration {
    pub username: String,
    pub password: String,
    pub email: String,
    pub verify_code: String,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("email", &self.email)
            .field("verify_code", &self.verify_code)
            .finish()
    }
}

/// Authenticated client for one user.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    config: ClientConfig,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
struct LoginMessage {
    #[serde(default)]
    start: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user_info: Option<UserInfo>,
    #[serde(default)]
    cause: Option<String>,
}

impl HttpClient {
    pub fn new(config: ClientConfig, credentials: Credentials) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_http(&config)?,
            config,
            credentials,
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Exchange a username and password for a token.
    pub async fn login(
        config: &ClientConfig,
        username: &str,
        password: &str,
    ) -> Result<Credentials, ApiError> {
        let http = build_http(config)?;
        let body = json!({
            "operate": "login",
            "message": { "username": username, "password": password },
        });
        let envelope = post(&http, config, LOGIN, &body).await?;
        let message: LoginMessage = serde_json::from_value(envelope.message)?;
        if !message.start {
            let cause = message
                .cause
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| "login failed, check username and password".to_string());
            return Err(ApiError::Denied(cause));
        }

        let token = message
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::malformed("login reply has no token"))?;
        let user = message.user_info;
        Ok(Credentials {
            token,
            username: Some(
                user.as_ref()
                    .map(|u| u.username.clone())
                    .unwrap_or_else(|| username.to_string()),
            ),
            identity: user.and_then(|u| u.identity),
        })
    }

    /// Ask the platform to mail a registration code to `email`. Returns the
    /// server's confirmation text.
    pub async fn request_register_code(
        config: &ClientConfig,
        email: &str,
    ) -> Result<String, ApiError> {
        let body = json!({
            "operate": "register",
            "message": { "email": email, "request_type": "get_verify_code" },
        });
        account_call(config, REGISTER, &body, "failed to send verification code").await
    }

    /// Create an account with a code from [`Self::request_register_code`].
    pub async fn register(
        config: &ClientConfig,
        registration: &Registration,
    ) -> Result<String, ApiError> {
        let body = json!({
            "operate": "register",
            "message": {
                "username": registration.username,
                "password": registration.password,
                "email": registration.email,
                "verify_code": registration.verify_code,
                "request_type": "register",
            },
        });
        account_call(config, REGISTER, &body, "registration failed").await
    }

    /// Ask the platform to mail a password reset code to `email`.
    pub async fn request_reset_code(config: &ClientConfig, email: &str) -> Result<String, ApiError> {
        let body = json!({
            "operate": "reset_password",
            "message": { "email": email, "request_type": "get_reset_code" },
        });
        account_call(config, RESET_PASSWORD, &body, "failed to send reset code").await
    }

    pub async fn reset_password(
        config: &ClientConfig,
        email: &str,
        new_password: &str,
        verify_code: &str,
    ) -> Result<String, ApiError> {
        let body = json!({
            "operate": "reset_password",
            "message": {
                "email": email,
                "new_password": new_password,
                "verify_code": verify_code,
                "request_type": "reset_password",
            },
        });
        account_call(config, RESET_PASSWORD, &body, "password reset failed").await
    }

    pub async fn categories(&self) -> Result<Vec<Category>, ApiError> {
        let envelope = self.call(CATEGORIES, json!({ "token": self.token() })).await?;
        if !envelope.result {
            return Err(envelope.into_denial("failed to load categories"));
        }
        Ok(ordered_entries(&envelope.message)?
            .into_iter()
            .map(|(id, name)| Category { id, name })
            .collect())
    }

    pub async fn subcategories(&self, category: &str) -> Result<Vec<Subcategory>, ApiError> {
        let body = json!({
            "token": self.token(),
            "message": { "title": category },
        });
        let envelope = self.call(SUBCATEGORIES, body).await?;
        if !envelope.result {
            return Err(envelope.into_denial("failed to load subcategories"));
        }
        match envelope.message.get("son_name") {
            Some(map) => Ok(ordered_entries(map)?
                .into_iter()
                .map(|(id, name)| Subcategory { id, name })
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn challenges(
        &self,
        category: &str,
        subcategory: &str,
    ) -> Result<Vec<ChallengeSummary>, ApiError> {
        let body = json!({
            "token": self.token(),
            "message": { "title": category, "title_son": subcategory },
        });
        let envelope = self.call(CHALLENGE_LIST, body).await?;
        if !envelope.result {
            return Err(envelope.into_denial("failed to load challenges"));
        }
        match envelope.challenges {
            Some(list) => Ok(serde_json::from_value(list)?),
            None => Ok(Vec::new()),
        }
    }

    fn token(&self) -> &str {
        &self.credentials.token
    }

    fn keyed_body(&self, operate: Option<&str>, key: &ChallengeKey) -> Value {
        let mut body = json!({
            "token": self.token(),
            "message": key,
        });
        if let Some(operate) = operate {
            body["operate"] = Value::from(operate);
        }
        body
    }

    async fn call(&self, path: &str, body: Value) -> Result<Envelope, ApiError> {
        post(&self.http, &self.config, path, &body).await
    }
}

#[async_trait]
impl PlatformApi for HttpClient {
    async fn challenge_info(&self, key: &ChallengeKey) -> Result<ChallengeInfo, ApiError> {
        let envelope = self.call(CHALLENGE_INFO, self.keyed_body(None, key)).await?;
        if !envelope.result || envelope.message.get("information").is_none() {
            return Err(envelope.into_denial("challenge does not exist or access is denied"));
        }
        ChallengeInfo::from_message(envelope.message, key)
    }

    async fn container_status(&self) -> Result<Option<ContainerReport>, ApiError> {
        let body = json!({
            "token": self.token(),
            "operate": "user_container_status",
        });
        let envelope = self.call(CONTAINER_STATUS, body).await?;
        if !envelope.result {
            return Ok(None);
        }
        if !envelope.message.is_object() {
            return Err(ApiError::malformed("container status reply has no container object"));
        }
        let report = ContainerReport::from_message(envelope.message)?;
        if report.challenge_name.is_none() {
            return Err(ApiError::malformed("container status reply has no challenge_name"));
        }
        Ok(Some(report))
    }

    async fn start_container(&self, key: &ChallengeKey) -> Result<ContainerReport, ApiError> {
        let body = self.keyed_body(Some("dynamic_container_add"), key);
        let envelope = self.call(CONTAINER_ADD, body).await?;
        if !envelope.result || !envelope.message.is_object() {
            return Err(envelope.into_denial("failed to start container"));
        }
        ContainerReport::from_message(envelope.message)
    }

    async fn stop_container(&self, key: &ChallengeKey) -> Result<(), ApiError> {
        let body = self.keyed_body(Some("dynamic_container_reduce"), key);
        let envelope = self.call(CONTAINER_REDUCE, body).await?;
        if !envelope.result {
            return Err(envelope.into_denial("failed to stop container"));
        }
        Ok(())
    }

    async fn extend_container(&self) -> Result<ContainerReport, ApiError> {
        let body = json!({
            "token": self.token(),
            "operate": "user_container_time",
        });
        let envelope = self.call(CONTAINER_TIME, body).await?;
        if !envelope.result || !envelope.message.is_object() {
            return Err(envelope.into_denial("failed to extend container"));
        }
        ContainerReport::from_message(envelope.message)
    }

    async fn submit_flag(&self, key: &ChallengeKey, flag: &str) -> Result<FlagVerdict, ApiError> {
        let mut body = self.keyed_body(None, key);
        body["message"]["flag"] = Value::from(flag);
        let envelope = self.call(FLAG_SUBMIT, body).await?;
        let fallback = if envelope.result { "correct flag" } else { "wrong flag" };
        Ok(FlagVerdict {
            correct: envelope.result,
            cause: envelope.denial_reason(fallback),
        })
    }
}

/// Unauthenticated account call. A `result: true` reply is success; its
/// text is `message` or `message.info`.
async fn account_call(
    config: &ClientConfig,
    path: &str,
    body: &Value,
    fallback: &str,
) -> Result<String, ApiError> {
    let http = build_http(config)?;
    let envelope = post(&http, config, path, body).await?;
    if !envelope.result {
        return Err(envelope.into_denial(fallback));
    }
    let notice = envelope
        .message
        .as_str()
        .or_else(|| envelope.message.get("info").and_then(Value::as_str))
        .unwrap_or("ok");
    Ok(notice.to_string())
}

fn build_http(config: &ClientConfig) -> Result<reqwest::Client, ApiError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

async fn post(
    http: &reqwest::Client,
    config: &ClientConfig,
    path: &str,
    body: &Value,
) -> Result<Envelope, ApiError> {
    let url = config.endpoint(path);
    debug!(%url, "POST");

    let response = http.post(&url).json(body).send().await.map_err(|e| {
        warn!(%url, error = %e, "request failed");
        ApiError::Transport(e)
    })?;

    let status = response.status();
    if !status.is_success() {
        warn!(%url, status = status.as_u16(), "non-success status");
        return Err(ApiError::Status(status.as_u16()));
    }

    let bytes = response.bytes().await?;
    let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|e| {
        warn!(%url, error = %e, "response is not a platform envelope");
        ApiError::from(e)
    })?;
    debug!(%url, result = envelope.result, "reply");
    Ok(envelope)
}
