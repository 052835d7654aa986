//! Error types for block execution across documents, frames and sandboxes.
//!
//! Every failure that can cross a context boundary has a stable wire message and
//! converts to and from the structured `{message, data}` payload, so a rejection
//! relayed through several frames arrives at the top-level caller intact.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Wire message for a consumed or missing message token.
pub const EMPTY_MESSAGE_ID: &str = "Block id is empty";

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid token record: {0}")]
    InvalidRecord(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Errors raised while resolving, relaying or executing a block.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("no-tab")]
    NoTab,

    #[error("iframe-not-found")]
    IframeNotFound { selector: String },

    #[error("not-iframe")]
    NotIframe { selector: String },

    #[error("element-not-found")]
    ElementNotFound { selector: String },

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("{}", EMPTY_MESSAGE_ID)]
    EmptyMessageId,

    #[error("{0}")]
    ScriptExecution(String),

    #[error("The \"type\" must be \"text\" or \"json\"")]
    FetchTypeValidation(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Invalid block data: {0}")]
    InvalidBlock(String),

    #[error("\"{0}\" doesn't have a handler")]
    UnknownBlockHandler(String),

    #[error("Unknown condition type: {0}")]
    UnknownCondition(String),

    #[error("Can't find block with \"{0}\" id")]
    UnknownBlock(String),

    #[error("Condition code did not settle within {0}ms")]
    EvaluationTimeout(u64),

    #[error("Frame relay timed out after {0}ms")]
    RelayTimeout(u64),

    #[error("A request with id {0} is already in flight")]
    DuplicateCorrelation(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A failure relayed from another context that matches no local kind.
    #[error("{message}")]
    Relayed { message: String, data: Value },
}

impl From<config::ConfigError> for BlockError {
    fn from(err: config::ConfigError) -> Self {
        BlockError::Config(err.to_string())
    }
}

/// Structured error carried across context boundaries.
///
/// Serializes as `{"$isError": true, "message": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "$isError")]
    pub is_error: bool,
    pub message: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>, data: Value) -> Self {
        Self {
            is_error: true,
            message: message.into(),
            data,
        }
    }

    /// Returns the payload if `value` is a structured error, `None` otherwise.
    pub fn detect(value: &Value) -> Option<Self> {
        let flagged = value
            .get("$isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !flagged {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl BlockError {
    /// Data attached to the structured payload (the offending selector for chain errors).
    pub fn data(&self) -> Value {
        match self {
            BlockError::IframeNotFound { selector }
            | BlockError::NotIframe { selector }
            | BlockError::ElementNotFound { selector } => json!({ "selector": selector }),
            BlockError::FetchTypeValidation(kind) => json!({ "type": kind }),
            BlockError::Relayed { data, .. } => data.clone(),
            _ => empty_object(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.to_string(), self.data())
    }

    /// Rebuilds the typed error from a relayed payload where the message is a known kind.
    pub fn from_payload(payload: ErrorPayload) -> Self {
        let selector = || {
            payload
                .data
                .get("selector")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match payload.message.as_str() {
            "no-tab" => BlockError::NoTab,
            "iframe-not-found" => BlockError::IframeNotFound {
                selector: selector(),
            },
            "not-iframe" => BlockError::NotIframe {
                selector: selector(),
            },
            "element-not-found" => BlockError::ElementNotFound {
                selector: selector(),
            },
            EMPTY_MESSAGE_ID => BlockError::EmptyMessageId,
            _ => BlockError::Relayed {
                message: payload.message,
                data: payload.data,
            },
        }
    }

    pub fn is_element_not_found(&self) -> bool {
        matches!(self, BlockError::ElementNotFound { .. })
    }
}
