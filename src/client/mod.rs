pub mod gate;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::gate::{RefreshGate, Ticket};
use crate::client::transport::Transport;
use crate::error::{NO_TOKEN_PROVIDED, NOT_LOGGED_IN, StatusError, TOKEN_EXPIRED};
use crate::session::LogoutHandler;

/// One outbound call. `retried` travels with the request so that concurrent,
/// unrelated requests are each eligible for exactly one replay.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Absolute, or relative to the transport's base URL.
    pub url: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Overrides the transport's default timeout.
    pub timeout: Option<Duration>,
    pub retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
            timeout: None,
            retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// What to do after a failed attempt.
#[derive(Debug, PartialEq, Eq)]
enum Recovery {
    Refresh,
    Logout,
    Propagate,
}

/// Authenticated client that hides recoverable session expiry from callers.
///
/// A 401 "Token expired" triggers at most one refresh across every concurrent
/// caller sharing the gate; each failing request is replayed once afterwards.
/// Other 401s force logout, except "Not logged in" / "No token provided",
/// which pass through untouched like every non-401 failure.
pub struct ApiClient<T> {
    transport: T,
    refresh_url: String,
    gate: Arc<RefreshGate>,
    on_logout: LogoutHandler,
}

impl<T: Transport> ApiClient<T> {
    pub fn new(transport: T, refresh_url: impl Into<String>, on_logout: LogoutHandler) -> Self {
        Self {
            transport,
            refresh_url: refresh_url.into(),
            gate: Arc::new(RefreshGate::new()),
            on_logout,
        }
    }

    /// Share one refresh gate between clients that share a session.
    pub fn with_gate(mut self, gate: Arc<RefreshGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn gate(&self) -> &Arc<RefreshGate> {
        &self.gate
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }

    /// Send a request, transparently recovering from an expired session.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<Value, StatusError> {
        loop {
            let err = match self.transport.send(&request).await {
                Ok(response) => return Ok(response.body),
                Err(err) => err,
            };

            match self.recovery_for(&request, &err) {
                Recovery::Propagate => return Err(err),
                Recovery::Logout => {
                    tracing::warn!(url = %request.url, "session rejected, logging out: {err}");
                    self.logout();
                    return Err(err);
                }
                Recovery::Refresh => {
                    request.retried = true;
                    if let Err(refresh_err) = self.await_session_refresh().await {
                        tracing::warn!(
                            url = %request.url,
                            "session refresh failed, logging out: {refresh_err}"
                        );
                        self.logout();
                        return Err(refresh_err);
                    }
                    tracing::debug!(url = %request.url, "replaying request after refresh");
                }
            }
        }
    }

    /// Renew the session. Any failure, network errors included, means the
    /// session cannot be refreshed.
    pub async fn refresh(&self) -> Result<(), StatusError> {
        let request = ApiRequest::get(self.refresh_url.clone());
        self.transport.send(&request).await.map(|_| ())
    }

    pub async fn get(&self, path: &str) -> Result<Value, StatusError> {
        self.execute(ApiRequest::new(Method::GET, path)).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, StatusError> {
        self.execute(with_optional_body(ApiRequest::new(Method::POST, path), body))
            .await
    }

    pub async fn put(&self, path: &str, body: Option<Value>) -> Result<Value, StatusError> {
        self.execute(with_optional_body(ApiRequest::new(Method::PUT, path), body))
            .await
    }

    pub async fn patch(&self, path: &str, body: Option<Value>) -> Result<Value, StatusError> {
        self.execute(with_optional_body(ApiRequest::new(Method::PATCH, path), body))
            .await
    }

    pub async fn delete(&self, path: &str, body: Option<Value>) -> Result<Value, StatusError> {
        self.execute(with_optional_body(ApiRequest::new(Method::DELETE, path), body))
            .await
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, StatusError> {
        decode(path, self.get(path).await?)
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, StatusError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| {
            StatusError::InvalidArgument(format!("unserializable body for {path}: {e}"))
        })?;
        decode(path, self.post(path, Some(body)).await?)
    }

    fn recovery_for(&self, request: &ApiRequest, err: &StatusError) -> Recovery {
        let StatusError::Http(api) = err else {
            return Recovery::Propagate;
        };
        if api.status != 401 {
            return Recovery::Propagate;
        }
        match api.message() {
            Some(TOKEN_EXPIRED) if !request.retried && !self.is_refresh_request(request) => {
                Recovery::Refresh
            }
            Some(NOT_LOGGED_IN | NO_TOKEN_PROVIDED) => Recovery::Propagate,
            _ => Recovery::Logout,
        }
    }

    async fn await_session_refresh(&self) -> Result<(), StatusError> {
        match self.gate.begin() {
            Ticket::Waiter(rx) => rx.await.unwrap_or(Err(StatusError::RefreshAbandoned)),
            Ticket::Leader(guard) => {
                let outcome = self.refresh().await;
                // Waiters are released before the leader replays its own request.
                guard.settle(outcome.clone());
                outcome
            }
        }
    }

    fn is_refresh_request(&self, request: &ApiRequest) -> bool {
        url_path(&request.url) == url_path(&self.refresh_url)
    }

    fn logout(&self) {
        (self.on_logout)();
    }
}

fn with_optional_body(request: ApiRequest, body: Option<Value>) -> ApiRequest {
    match body {
        Some(body) => request.with_body(body),
        None => request,
    }
}

fn decode<R: DeserializeOwned>(path: &str, value: Value) -> Result<R, StatusError> {
    serde_json::from_value(value).map_err(|e| StatusError::Decode(format!("{path}: {e}")))
}

/// Path component of an absolute or relative URL, without query or trailing slash.
fn url_path(url: &str) -> String {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
