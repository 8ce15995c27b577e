use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

/// Injected bearer-token holder shared by everything that calls the API.
///
/// Cloning is cheap; clones observe the same token and revocation state.
/// A 401/403 from the backend revokes the session, after which authorized
/// calls fail with [`crate::ClientError::AuthExpired`] until a new token is
/// installed.
#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug, Default)]
struct SessionInner {
    token: RwLock<Option<String>>,
    revoked: AtomicBool,
}

impl Session {
    /// Anonymous session; only `login`/`register` calls will succeed.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let session = Self::default();
        session.set_token(token);
        session
    }

    /// Installs a fresh token and clears any prior revocation.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut guard = self.inner.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(token.into());
        self.inner.revoked.store(false, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        let mut guard = self.inner.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        self.inner.revoked.store(false, Ordering::SeqCst);
    }

    pub fn token(&self) -> Option<String> {
        self.inner
            .token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        !self.is_revoked() && self.token().is_some()
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::SeqCst)
    }

    /// Marks the session dead after the server rejected its token.
    pub(crate) fn revoke(&self) {
        let mut guard = self.inner.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        self.inner.revoked.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_clears_revocation() {
        let session = Session::with_token("t1");
        session.revoke();
        assert!(session.is_revoked());
        assert!(!session.is_authenticated());

        session.set_token("t2");
        assert!(session.is_authenticated());
        assert_eq!(session.token().as_deref(), Some("t2"));
    }

    #[test]
    fn clones_share_state() {
        let session = Session::anonymous();
        let other = session.clone();
        session.set_token("shared");
        assert_eq!(other.token().as_deref(), Some("shared"));
    }
}
