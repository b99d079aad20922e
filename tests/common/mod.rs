//! In-process stand-in for the practice platform, served with axum.

#![allow(dead_code)]

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::{DateTime, Duration, Utc};
use ctf_practice::ClientConfig;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

pub const TOKEN: &str = "tok-3f9a";
pub const LIFETIME_MINUTES: i64 = 30;
pub const MAIL_CODE: &str = "424242";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub title: String,
    pub title_son: String,
    pub challenge_name: String,
    pub url: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MockState {
    /// Every request body received, with its path.
    pub requests: Vec<(String, Value)>,
    pub container: Option<RunningContainer>,
    /// Answer every call with HTTP 500.
    pub broken: bool,
    /// Reply to send from the container status endpoint instead of the
    /// real state.
    pub status_reply: Option<Value>,
}

#[derive(Clone, Default)]
pub struct MockPlatform(pub Arc<Mutex<MockState>>);

impl MockPlatform {
    pub fn set_broken(&self, broken: bool) {
        self.0.lock().unwrap().broken = broken;
    }

    pub fn set_status_reply(&self, reply: Option<Value>) {
        self.0.lock().unwrap().status_reply = reply;
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.0.lock().unwrap().requests.clone()
    }

    pub fn container(&self) -> Option<RunningContainer> {
        self.0.lock().unwrap().container.clone()
    }

    /// Record the request and check the token. `Err` carries the reply to
    /// send instead of handling the call.
    fn admit(&self, path: &str, body: &Value) -> Result<(), Result<Json<Value>, StatusCode>> {
        let mut state = self.0.lock().unwrap();
        state.requests.push((path.to_string(), body.clone()));
        if state.broken {
            return Err(Err(StatusCode::INTERNAL_SERVER_ERROR));
        }
        let public = ["/api/login", "/api/register", "/api/reset_password"];
        if !public.contains(&path) && body["token"] != TOKEN {
            return Err(Ok(Json(json!({"result": false, "message": "invalid token"}))));
        }
        Ok(())
    }
}

type Reply = Result<Json<Value>, StatusCode>;

macro_rules! admit {
    ($mock:expr, $path:expr, $body:expr) => {
        if let Err(reply) = $mock.admit($path, &$body) {
            return reply;
        }
    };
}

/// Serve the mock on an ephemeral port and return a config pointing at it.
pub async fn spawn(mock: MockPlatform) -> ClientConfig {
    let app = Router::new()
        .route("/api/login", post(login))
        .route("/api/register", post(register))
        .route("/api/reset_password", post(reset_password))
        .route("/api/user/challenge/title", post(categories))
        .route("/api/user/challenge/son", post(subcategories))
        .route("/api/user/challenge/list", post(challenge_list))
        .route("/api/user/challenge/information", post(information))
        .route("/api/user/challenge/submit", post(submit))
        .route("/api/dynamic/container/status", post(container_status))
        .route("/api/dynamic/container/add", post(container_add))
        .route("/api/dynamic/container/reduce", post(container_reduce))
        .route("/api/dynamic/container/time", post(container_time))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    ClientConfig::new(format!("http://{addr}/"))
}

async fn login(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/login", body);
    let message = &body["message"];
    if body["operate"] == "login" && message["username"] == "alice" && message["password"] == "hunter2" {
        return Ok(Json(json!({
            "result": true,
            "message": {
                "start": true,
                "token": TOKEN,
                "user_info": {"username": "alice", "identity": "user"}
            }
        })));
    }
    Ok(Json(json!({
        "result": true,
        "message": {"start": false, "cause": "wrong username or password"}
    })))
}

async fn register(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/register", body);
    let message = &body["message"];
    let reply = match message["request_type"].as_str() {
        Some("get_verify_code") if message["email"].as_str().is_some_and(|e| e.contains('@')) => {
            json!({"result": true, "message": "verification code sent"})
        }
        Some("get_verify_code") => json!({"result": false, "message": "invalid email"}),
        Some("register") if message["verify_code"] == MAIL_CODE => {
            json!({"result": true, "message": {"info": "registered"}})
        }
        _ => json!({"result": false, "message": {"cause": "wrong verification code"}}),
    };
    Ok(Json(reply))
}

async fn reset_password(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/reset_password", body);
    let message = &body["message"];
    let reply = match message["request_type"].as_str() {
        Some("get_reset_code") => json!({"result": true, "message": "reset code sent"}),
        Some("reset_password") if message["verify_code"] == MAIL_CODE => {
            json!({"result": true, "message": "password reset"})
        }
        _ => json!({"result": false, "message": "wrong reset code"}),
    };
    Ok(Json(reply))
}

async fn categories(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/user/challenge/title", body);
    Ok(Json(json!({
        "result": true,
        "message": {"10": "Crypto", "2": "Pwn", "1": "Web"}
    })))
}

async fn subcategories(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/user/challenge/son", body);
    if body["message"]["title"] != "Web" {
        return Ok(Json(json!({"result": true, "message": {}})));
    }
    Ok(Json(json!({
        "result": true,
        "message": {"son_name": {"2": "XSS", "1": "SQLi"}}
    })))
}

async fn challenge_list(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/user/challenge/list", body);
    Ok(Json(json!({
        "result": true,
        "challenges": [
            {"id": 1, "name": "login-bypass", "solved": false, "solves": 12},
            {"id": 2, "name": "union-select", "solved": true, "solves": 3}
        ]
    })))
}

async fn information(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/user/challenge/information", body);
    let message = &body["message"];
    let docker = match message["challenge_name"].as_str() {
        Some("login-bypass") => "ctf/sqli:1",
        Some("hello") => "",
        _ => return Ok(Json(json!({"result": false, "message": "challenge not found"}))),
    };
    Ok(Json(json!({
        "result": true,
        "message": {
            "title": message["title"],
            "title_son": message["title_son"],
            "challenge_name": message["challenge_name"],
            "information": {
                "describe": "Get past the login form.",
                "hit": "Quotes matter.",
                "appendix": null,
                "challenge_success_number": 12,
                "history": false,
                "docker": docker
            }
        }
    })))
}

async fn submit(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/user/challenge/submit", body);
    if body["message"]["flag"] == "flag{ok}" {
        return Ok(Json(json!({"result": true, "cause": "well done"})));
    }
    Ok(Json(json!({"result": false, "cause": "wrong flag"})))
}

async fn container_status(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/dynamic/container/status", body);
    let scripted = mock.0.lock().unwrap().status_reply.clone();
    if let Some(reply) = scripted {
        return Ok(Json(reply));
    }
    match mock.container() {
        Some(container) => Ok(Json(json!({"result": true, "message": describe(&container)}))),
        None => Ok(Json(json!({"result": false, "message": "no running container"}))),
    }
}

async fn container_add(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/dynamic/container/add", body);
    let message = &body["message"];
    let mut state = mock.0.lock().unwrap();
    if state.container.is_some() {
        return Ok(Json(json!({"result": false, "message": "container already running"})));
    }
    let now = Utc::now();
    let container = RunningContainer {
        title: message["title"].as_str().unwrap_or_default().to_string(),
        title_son: message["title_son"].as_str().unwrap_or_default().to_string(),
        challenge_name: message["challenge_name"].as_str().unwrap_or_default().to_string(),
        url: "10.0.0.5:32768".to_string(),
        start_time: now,
        end_time: now + Duration::minutes(LIFETIME_MINUTES),
    };
    let reply = describe(&container);
    state.container = Some(container);
    Ok(Json(json!({"result": true, "message": reply})))
}

async fn container_reduce(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/dynamic/container/reduce", body);
    match mock.0.lock().unwrap().container.take() {
        Some(_) => Ok(Json(json!({"result": true, "message": "container removed"}))),
        None => Ok(Json(json!({"result": false, "message": "no running container"}))),
    }
}

async fn container_time(State(mock): State<MockPlatform>, Json(body): Json<Value>) -> Reply {
    admit!(mock, "/api/dynamic/container/time", body);
    let mut state = mock.0.lock().unwrap();
    match state.container.as_mut() {
        Some(container) => {
            container.end_time += Duration::minutes(LIFETIME_MINUTES);
            Ok(Json(json!({
                "result": true,
                "message": {"end_time": container.end_time.format(TIME_FORMAT).to_string()}
            })))
        }
        None => Ok(Json(json!({"result": false, "message": "no running container"}))),
    }
}

/// Zone-less timestamps, as the platform sends them.
fn describe(container: &RunningContainer) -> Value {
    json!({
        "title": container.title,
        "title_son": container.title_son,
        "challenge_name": container.challenge_name,
        "container_url": container.url,
        "start_time": container.start_time.format(TIME_FORMAT).to_string(),
        "end_time": container.end_time.format(TIME_FORMAT).to_string()
    })
}
