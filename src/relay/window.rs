//! Window handles: the cross-document messaging primitive.
//!
//! Each runtime owns one inbox. Handles are cheap clones of the sending half and
//! carry the window's identity, which is how the top-level window recognizes which
//! frame a `get-frame` request came from.

use super::message::RelayMessage;
use crate::error::BlockError;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowId(String);

impl WindowId {
    pub fn new() -> Self {
        WindowId(format!("window:{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WindowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivered message. `data` is the serialized payload as posted.
#[derive(Debug, Clone)]
pub struct WindowMessage {
    pub source: Option<WindowHandle>,
    pub data: String,
}

impl WindowMessage {
    /// Decodes the payload. Foreign or malformed payloads yield `None`.
    pub fn decode(&self) -> Option<RelayMessage> {
        match serde_json::from_str(&self.data) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "Ignoring unrecognized window message");
                None
            }
        }
    }
}

pub type WindowInbox = mpsc::UnboundedReceiver<WindowMessage>;

#[derive(Clone)]
pub struct WindowHandle {
    id: WindowId,
    tx: mpsc::UnboundedSender<WindowMessage>,
}

impl std::fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WindowHandle").field(&self.id.0).finish()
    }
}

impl WindowHandle {
    /// Creates a window and the inbox its runtime drains.
    pub fn channel() -> (WindowHandle, WindowInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            WindowHandle {
                id: WindowId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> &WindowId {
        &self.id
    }

    pub fn same_window(&self, other: &WindowHandle) -> bool {
        self.id == other.id
    }

    /// Serializes and posts `message`, stamping `source` as the sender.
    pub fn post(
        &self,
        message: &RelayMessage,
        source: Option<&WindowHandle>,
    ) -> Result<(), BlockError> {
        let data = serde_json::to_string(message)
            .map_err(|e| BlockError::ChannelClosed(format!("encode {}: {}", message.kind(), e)))?;
        self.post_raw(data, source)
    }

    /// Posts an already-serialized payload.
    pub fn post_raw(&self, data: String, source: Option<&WindowHandle>) -> Result<(), BlockError> {
        self.tx
            .send(WindowMessage {
                source: source.cloned(),
                data,
            })
            .map_err(|_| BlockError::ChannelClosed(self.id.to_string()))
    }
}
