//! Error type shared by every Labeler crate, plus the `{success, data, error}`
//! envelope handed to callers at the outer boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no taxonomy present")]
    EmptySource,

    #[error("could not parse model answer: {0}")]
    Parse(String),

    #[error("no usable content received")]
    EmptyStream,

    #[error("article not relevant (model returned no labels)")]
    NotRelevant,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not signed in to the chat backend; log in there first, then reconnect")]
    NotAuthenticated,

    #[error("session was rejected by the chat backend; please reconnect")]
    Unauthorized,

    #[error("{}", transport_message(.status, .message))]
    Transport { status: Option<u16>, message: String },

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn transport_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("transport error (HTTP {code}): {message}"),
        None => format!("transport error: {message}"),
    }
}

impl Error {
    /// Authentication failures invalidate the stored session.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::NotAuthenticated | Error::Unauthorized)
    }

    /// Failures a caller may reasonably retry as a whole run.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Transport { .. })
    }
}

/// Result shape exposed at the boundary. `success == false` always carries `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// A failure that still carries a payload (e.g. a rejected verdict).
    pub fn fail_with(data: T, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(error.into()),
        }
    }

    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::fail(e.to_string()),
        }
    }
}
