//! Thin wrappers over the two backends the console talks to.

pub mod auth;
pub mod mashups;

use std::sync::Arc;

use crate::client::ApiClient;
use crate::client::gate::RefreshGate;
use crate::client::transport::{ReqwestTransport, Transport};
use crate::config::Config;
use crate::error::StatusError;
use crate::session::SessionState;

pub use auth::{AuthService, Credentials};
pub use mashups::{MashupService, TestExecution};

/// Primary API and flow-execution clients over one session.
///
/// Both clients share the cookie jar, the refresh gate and the session state:
/// an expiry seen by either one triggers a single refresh against the primary
/// backend, and a forced logout clears the session for both.
pub struct Backends<T = ReqwestTransport> {
    pub api: ApiClient<T>,
    pub flow: ApiClient<T>,
    pub session: Arc<SessionState>,
}

impl Backends<ReqwestTransport> {
    pub fn from_config(config: &Config) -> Result<Self, StatusError> {
        config.validate()?;
        let timeout = config.request_timeout();
        let client = ReqwestTransport::build_client()?;
        let api = ReqwestTransport::with_client(client.clone(), config.api_url.clone(), timeout);
        let flow = ReqwestTransport::with_client(client, config.flow_url.clone(), timeout);

        tracing::debug!(
            api = %config.api_url,
            flow = %config.flow_url,
            refresh = %config.refresh_url(),
            "backends configured"
        );
        Ok(Self::new(api, flow, config.refresh_url()))
    }
}

impl<T: Transport> Backends<T> {
    /// `refresh_url` should be absolute: the flow client resolves relative
    /// paths against its own base URL.
    pub fn new(api: T, flow: T, refresh_url: impl Into<String>) -> Self {
        let refresh_url = refresh_url.into();
        let session = Arc::new(SessionState::new());
        let gate = Arc::new(RefreshGate::new());
        let api = ApiClient::new(api, refresh_url.clone(), session.logout_handler())
            .with_gate(Arc::clone(&gate));
        let flow = ApiClient::new(flow, refresh_url, session.logout_handler()).with_gate(gate);
        Self { api, flow, session }
    }

    pub fn auth(&self) -> AuthService<'_, T> {
        AuthService::new(&self.api, &self.session)
    }

    pub fn mashups(&self) -> MashupService<'_, T> {
        MashupService::new(&self.flow)
    }
}
