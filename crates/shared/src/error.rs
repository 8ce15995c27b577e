use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plain `{ "message": … }` body every endpoint falls back to on non-2xx.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
