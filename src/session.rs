use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Invoked by the HTTP client when a session cannot be recovered. Concurrent
/// failures may each call it, so implementations must tolerate repeats.
pub type LogoutHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub two_factor_enabled: bool,
}

/// Local session state: who is signed in, and how often the session was torn down.
#[derive(Default)]
pub struct SessionState {
    user: Mutex<Option<UserProfile>>,
    logged_in: AtomicBool,
    logouts: AtomicU64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user: UserProfile) {
        tracing::info!(user = %user.email, "signed in");
        *self.user.lock().unwrap_or_else(PoisonError::into_inner) = Some(user);
        self.logged_in.store(true, Ordering::SeqCst);
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// Clear local session state. Idempotent: only the first call after a
    /// sign-in actually tears anything down.
    pub fn logout(&self) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        let was_logged_in = self.logged_in.swap(false, Ordering::SeqCst);
        self.user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if was_logged_in {
            tracing::info!("session cleared");
        } else {
            tracing::debug!("logout requested on an already cleared session");
        }
    }

    /// Total logout invocations, repeats included.
    pub fn logout_count(&self) -> u64 {
        self.logouts.load(Ordering::SeqCst)
    }

    /// Handler to wire into `ApiClient`.
    pub fn logout_handler(self: &Arc<Self>) -> LogoutHandler {
        let session = Arc::clone(self);
        Arc::new(move || session.logout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserProfile {
        UserProfile {
            id: "u1".into(),
            email: "alice@example.com".into(),
            name: Some("Alice".into()),
            roles: vec!["admin".into()],
            two_factor_enabled: true,
        }
    }

    #[test]
    fn logout_clears_user() {
        let session = SessionState::new();
        session.sign_in(alice());
        assert!(session.is_logged_in());

        session.logout();
        assert!(!session.is_logged_in());
        assert!(session.user().is_none());
    }

    #[test]
    fn repeated_logout_is_harmless() {
        let session = Arc::new(SessionState::new());
        session.sign_in(alice());
        let handler = session.logout_handler();

        handler();
        handler();
        handler();

        assert!(!session.is_logged_in());
        assert_eq!(session.logout_count(), 3);
    }

    #[test]
    fn profile_uses_camel_case() {
        let user: UserProfile = serde_json::from_str(
            r#"{"id":"u2","email":"bob@example.com","twoFactorEnabled":true}"#,
        )
        .unwrap();
        assert!(user.two_factor_enabled);
        assert!(user.roles.is_empty());
    }
}
