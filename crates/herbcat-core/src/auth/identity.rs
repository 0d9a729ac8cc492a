//! Calls to the identity server: `/login`, `/register`, `/refresh-token`, `/logout`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AuthError;
use crate::api::{HttpRequest, HttpResponse, Method, Transport};

pub const LOGIN_PATH: &str = "/login";
pub const REGISTER_PATH: &str = "/register";
pub const REFRESH_PATH: &str = "/refresh-token";
pub const LOGOUT_PATH: &str = "/logout";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    remember_me: bool,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

/// Body returned by login, register and refresh.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    /// Epoch milliseconds; absent on most servers, which leave expiry to the token
    #[serde(default)]
    pub expires_at: Option<i64>,
}

pub struct IdentityApi {
    transport: Arc<dyn Transport>,
    base_url: String,
    timeout: Duration,
}

impl IdentityApi {
    pub fn new(transport: Arc<dyn Transport>, base_url: &str, timeout: Duration) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<AuthResponse, AuthError> {
        let body = serde_json::to_string(&LoginRequest {
            email,
            password,
            remember_me,
        })
        .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        let request = self.request(LOGIN_PATH).json_body(body);
        Self::parse(self.transport.send(request).await?)
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, AuthError> {
        let body = serde_json::to_string(&RegisterRequest {
            username,
            email,
            password,
        })
        .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        let request = self.request(REGISTER_PATH).json_body(body);
        Self::parse(self.transport.send(request).await?)
    }

    pub async fn refresh(&self, token: &str) -> Result<AuthResponse, AuthError> {
        let mut request = self.request(REFRESH_PATH);
        request.set_bearer(token);
        Self::parse(self.transport.send(request).await?)
    }

    /// Tell the server the token is done with. The response body is ignored.
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let mut request = self.request(LOGOUT_PATH);
        request.set_bearer(token);
        let response = self.transport.send(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Self::rejection(response))
        }
    }

    fn request(&self, path: &str) -> HttpRequest {
        HttpRequest::new(Method::Post, format!("{}{}", self.base_url, path))
            .header("Accept", "application/json")
            .timeout(self.timeout)
    }

    fn parse(response: HttpResponse) -> Result<AuthResponse, AuthError> {
        if !response.is_success() {
            return Err(Self::rejection(response));
        }
        let parsed: AuthResponse = serde_json::from_str(&response.body)
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse auth response: {}", e)))?;
        if parsed.token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "auth response carried an empty token".to_string(),
            ));
        }
        Ok(parsed)
    }

    /// The server's payload is surfaced as-is; an empty one becomes `LoginFailed`.
    fn rejection(response: HttpResponse) -> AuthError {
        debug!(status = response.status, "Identity server rejected request");
        if response.body.trim().is_empty() {
            AuthError::LoginFailed
        } else {
            AuthError::Server {
                status: response.status,
                payload: response.body,
            }
        }
    }
}
