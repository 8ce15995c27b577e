use thiserror::Error;

/// Failures surfaced by [`crate::CrmClient`] and the collaborator traits.
///
/// Authentication failure is a distinct variant rather than a global
/// callback: callers decide whether to drop to a login flow.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not logged in: no bearer token in session")]
    AuthRequired,
    #[error("authentication failed; please login again")]
    AuthExpired,
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid api base url: {0}")]
    InvalidBaseUrl(String),
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
}

impl ClientError {
    /// True when the session must be re-established before retrying.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRequired | Self::AuthExpired)
    }
}
