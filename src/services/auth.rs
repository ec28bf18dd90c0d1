use serde::Serialize;
use serde_json::Value;

use crate::client::ApiClient;
use crate::client::transport::Transport;
use crate::error::{StatusError, require_id};
use crate::session::{SessionState, UserProfile};

pub const LOGIN_PATH: &str = "/auth/login";
pub const ME_PATH: &str = "/auth/me";
pub const LOGOUT_PATH: &str = "/auth/logout";

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    /// Second factor, when the account has one enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            otp: None,
        }
    }

    pub fn with_otp(mut self, otp: impl Into<String>) -> Self {
        self.otp = Some(otp.into());
        self
    }
}

pub struct AuthService<'a, T> {
    client: &'a ApiClient<T>,
    session: &'a SessionState,
}

impl<'a, T: Transport> AuthService<'a, T> {
    pub fn new(client: &'a ApiClient<T>, session: &'a SessionState) -> Self {
        Self { client, session }
    }

    /// Sign in, then load the profile the server associates with the new session.
    pub async fn login(&self, credentials: &Credentials) -> Result<UserProfile, StatusError> {
        require_id("email", &credentials.email)?;
        let _: Value = self.client.post_json(LOGIN_PATH, credentials).await?;
        self.me().await
    }

    /// Current user. Records it in the session on success.
    pub async fn me(&self) -> Result<UserProfile, StatusError> {
        let user: UserProfile = self.client.get_json(ME_PATH).await?;
        self.session.sign_in(user.clone());
        Ok(user)
    }

    /// End the session server-side. Local state is cleared even when the
    /// server call fails.
    pub async fn logout(&self) -> Result<(), StatusError> {
        let result = self.client.post(LOGOUT_PATH, None).await;
        self.session.logout();
        if let Err(e) = &result {
            tracing::warn!("server logout failed: {e}");
        }
        result.map(|_| ())
    }
}
