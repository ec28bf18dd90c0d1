use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::client::{ApiRequest, ApiResponse};
use crate::config::join_url;
use crate::error::{ApiError, StatusError};

const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024; // 8MB

/// Anything that can put an `ApiRequest` on the wire.
///
/// Implementations return non-2xx responses as `StatusError::Http` with the
/// decoded error body, so the client can classify auth failures uniformly.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, StatusError>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn send(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, StatusError>> + Send {
        (**self).send(request)
    }
}

/// Production transport on reqwest. Cloning shares the connection pool and
/// the cookie jar, which is how both backends see the same session cookie.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    default_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(
        base_url: impl Into<String>,
        default_timeout: Duration,
    ) -> Result<Self, StatusError> {
        Ok(Self::with_client(
            Self::build_client()?,
            base_url,
            default_timeout,
        ))
    }

    /// Reuse an existing client (and its cookie jar) against another base URL.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            default_timeout,
        }
    }

    /// Client with credential cookies enabled: the refresh endpoint renews the
    /// session through `Set-Cookie`.
    pub fn build_client() -> Result<Client, StatusError> {
        Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| StatusError::Transport(format!("failed to build HTTP client: {e}")))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn resolve(&self, url: &str) -> String {
        join_url(&self.base_url, url)
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, StatusError> {
        let url = self.resolve(&request.url);
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(timeout)
            .header("Accept", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| StatusError::from_reqwest(e, timeout))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StatusError::from_reqwest(e, timeout))?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(StatusError::Decode(format!(
                "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                bytes.len()
            )));
        }

        if !status.is_success() {
            tracing::debug!(%url, status = status.as_u16(), "request failed");
            return Err(StatusError::Http(ApiError::from_body(status.as_u16(), &bytes)));
        }

        Ok(ApiResponse {
            status: status.as_u16(),
            body: success_body(&bytes),
        })
    }
}

/// Payload of a 2xx response: JSON when it parses, otherwise the raw text.
/// Typed decoding failures surface later, in `get_json`/`post_json`.
fn success_body(bytes: &[u8]) -> serde_json::Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_joins_relative_paths() {
        let transport =
            ReqwestTransport::new("http://localhost:3000/", Duration::from_secs(1)).unwrap();
        assert_eq!(transport.resolve("/controls"), "http://localhost:3000/controls");
        assert_eq!(transport.resolve("catalogs/7"), "http://localhost:3000/catalogs/7");
    }

    #[test]
    fn resolve_keeps_absolute_urls() {
        let transport =
            ReqwestTransport::new("http://localhost:3000", Duration::from_secs(1)).unwrap();
        assert_eq!(
            transport.resolve("http://localhost:1880/mashups"),
            "http://localhost:1880/mashups"
        );
    }

    #[test]
    fn shared_client_keeps_each_base_url() {
        let api = ReqwestTransport::new("http://api", Duration::from_secs(1)).unwrap();
        let flow = ReqwestTransport::with_client(
            api.client().clone(),
            "http://flow",
            Duration::from_secs(1),
        );
        assert_eq!(flow.resolve("/x"), "http://flow/x");
        assert_eq!(api.base_url(), "http://api");
    }

    #[test]
    fn success_body_falls_back_to_text() {
        assert_eq!(success_body(br#"{"id":1}"#), serde_json::json!({"id": 1}));
        assert_eq!(success_body(b"OK"), serde_json::Value::String("OK".into()));
        assert_eq!(success_body(b" \n"), serde_json::Value::Null);
    }
}
