//! Test doubles shared by the unit tests: a scripted transport that records
//! every call, controllable clocks, and token minting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::api::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::clock::Clock;

pub const BASE_URL: &str = "http://api.test";

pub fn encode_segment(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Unsigned token carrying the given claims.
pub fn mint_token(claims: &Value) -> String {
    format!(
        "{}.{}.signature",
        encode_segment(br#"{"alg":"HS256","typ":"JWT"}"#),
        encode_segment(claims.to_string().as_bytes())
    )
}

pub fn token_expiring_at(expires_at: DateTime<Utc>, subject: &str) -> String {
    mint_token(&json!({
        "sub": subject,
        "role": "user",
        "exp": expires_at.timestamp(),
    }))
}

/// JSON body the identity server sends on login, register and refresh.
pub fn auth_body(token: &str) -> String {
    json!({
        "token": token,
        "username": "sage",
        "email": "sage@example.com",
        "role": "user",
    })
    .to_string()
}

pub fn fixed_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Clock that follows tokio's (pausable) time from a fixed starting instant.
pub struct TokioClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now() - self.started;
        self.base + Duration::from_std(elapsed).unwrap()
    }
}

struct Scripted {
    result: Result<HttpResponse, TransportError>,
    gate: Option<Arc<Notify>>,
}

/// Transport answering from per-path queues and recording every request.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_entry(&self, path: &str, entry: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(entry);
    }

    pub fn respond(&self, path: &str, status: u16, body: impl Into<String>) {
        self.push_entry(
            path,
            Scripted {
                result: Ok(HttpResponse::new(status, body)),
                gate: None,
            },
        );
    }

    pub fn fail(&self, path: &str, error: TransportError) {
        self.push_entry(
            path,
            Scripted {
                result: Err(error),
                gate: None,
            },
        );
    }

    /// Queue a response that is held back until the returned gate is notified.
    pub fn respond_gated(&self, path: &str, status: u16, body: impl Into<String>) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.push_entry(
            path,
            Scripted {
                result: Ok(HttpResponse::new(status, body)),
                gate: Some(gate.clone()),
            },
        );
        gate
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<HttpRequest> {
        self.calls()
            .into_iter()
            .filter(|r| path_of(&r.url) == path)
            .collect()
    }
}

fn path_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = path_of(&request.url).to_string();
        self.calls.lock().unwrap().push(request);

        let next = self
            .routes
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(|queue| queue.pop_front());

        match next {
            Some(entry) => {
                if let Some(gate) = entry.gate {
                    gate.notified().await;
                }
                entry.result
            }
            None => Ok(HttpResponse::new(404, format!("no scripted response for {}", path))),
        }
    }
}

/// Let spawned tasks run on the current-thread test runtime.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
