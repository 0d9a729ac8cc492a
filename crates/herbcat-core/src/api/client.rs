//! API client for the herbcat catalog REST API.
//!
//! Every outgoing request goes through [`ApiClient::send`], which:
//! - attaches `Authorization: Bearer <token>` when the session is signed in
//! - on a 401, asks the session for a silent refresh and re-sends the
//!   request once with the new token
//!
//! Other statuses are returned untouched; the typed helpers (`get`, `post`,
//! ...) turn them into [`ApiError`]s.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use super::ApiError;
use crate::auth::SessionManager;

/// HTTP request timeout for catalog calls.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A domain request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Set once the request has been re-sent after a refresh
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_json<B: Serialize + ?Sized>(
        method: Method,
        path: impl Into<String>,
        body: &B,
    ) -> Result<Self, ApiError> {
        let body = serde_json::to_string(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        let mut request = Self::new(method, path);
        request.body = Some(body);
        Ok(request)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

/// Clone is cheap - the transport and session are shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    session: SessionManager,
    base_url: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, session: SessionManager, base_url: &str) -> Self {
        Self {
            transport,
            session,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send a request, attaching the bearer token and retrying once after a
    /// successful refresh if the server answers 401.
    ///
    /// If the refresh fails, or the retried request is rejected again, the
    /// 401 response is returned to the caller.
    pub async fn send(&self, mut request: ApiRequest) -> Result<HttpResponse, ApiError> {
        loop {
            let (http, token) = self.prepare(&request);
            let response = self.transport.send(http).await?;

            if !response.is_unauthorized() || request.retried {
                return Ok(response);
            }
            request.retried = true;

            debug!(path = %request.path, "Unauthorized, attempting silent refresh");
            if let Err(e) = self.session.refresh_from(token.as_deref()).await {
                debug!(path = %request.path, error = %e, "Refresh failed, returning 401");
                return Ok(response);
            }
        }
    }

    fn prepare(&self, request: &ApiRequest) -> (HttpRequest, Option<String>) {
        let mut http = HttpRequest::new(request.method, self.url(&request.path))
            .header("Accept", "application/json")
            .timeout(self.timeout);
        for (name, value) in &request.headers {
            http = http.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            http = http.json_body(body.clone());
        }

        let token = self.session.bearer_token();
        if let Some(ref token) = token {
            http.set_bearer(token);
        }
        (http, token)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: HttpResponse) -> Result<HttpResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    fn parse_json<T: DeserializeOwned>(response: HttpResponse, path: &str) -> Result<T, ApiError> {
        serde_json::from_str(&response.body).map_err(|e| {
            warn!(path = path, error = %e, "Failed to parse JSON response");
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let path = request.path.clone();
        let response = Self::check_response(self.send(request).await?)?;
        Self::parse_json(response, &path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::with_json(Method::Post, path, body)?)
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::with_json(Method::Put, path, body)?)
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        Self::check_response(self.send(ApiRequest::delete(path)).await?)?;
        Ok(())
    }
}
