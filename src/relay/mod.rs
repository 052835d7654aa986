//! Frame Relay
//!
//! Carries a block into a frame that cannot be entered in-process. The sender
//! strips the resolved part of the chain, folds the frame's offset into the
//! request, writes a message token and posts `turium:execute-block` to the frame's
//! window. The receiver must consume the token before acting.
//!
//! Results never travel back hop by hop: the frame that finally executes the block
//! posts `turium:block-execute-result` straight to the top-level window, tagged with
//! the correlation id the originating caller registered (`$originId`). Intermediate
//! frames forward and return immediately.

pub mod message;
pub mod token;
pub mod window;

use crate::block::{BlockReply, BlockRequest};
use crate::dispatch::Dispatcher;
use crate::error::{BlockError, ErrorPayload};
use crate::selector::resolver::FrameOffset;
use message::RelayMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use token::TokenStore;
use tracing::{debug, info, warn};
use window::WindowHandle;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// How long the originating caller waits for a relayed result (milliseconds)
    #[serde(default = "default_relay_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_relay_timeout_ms() -> u64 {
    30000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_relay_timeout_ms(),
        }
    }
}

pub fn new_message_id() -> String {
    format!("message:{}", uuid::Uuid::new_v4().simple())
}

/// Sends blocks into remote frames and correlates their results.
#[derive(Clone)]
pub struct FrameRelay {
    tokens: Arc<dyn TokenStore>,
    results: Dispatcher<Value>,
    config: RelayConfig,
}

impl FrameRelay {
    pub fn new(tokens: Arc<dyn TokenStore>, config: RelayConfig) -> Self {
        Self {
            tokens,
            results: Dispatcher::new(),
            config,
        }
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    /// Results awaiting delivery, keyed by originating correlation id.
    pub fn results(&self) -> &Dispatcher<Value> {
        &self.results
    }

    /// Relays `block` into `window`.
    ///
    /// `remaining` replaces the block's selector; `offset` becomes its frame rect.
    /// A block that already carries an origin id is forwarded without waiting.
    pub async fn send(
        &self,
        window: &WindowHandle,
        mut block: BlockRequest,
        remaining: &str,
        offset: FrameOffset,
        source: Option<&WindowHandle>,
    ) -> Result<BlockReply, BlockError> {
        let message_id = new_message_id();
        let pending = match &block.origin_id {
            Some(origin) => {
                debug!(origin_id = %origin, message_id = %message_id, "Forwarding block to nested frame");
                None
            }
            None => {
                block.origin_id = Some(message_id.clone());
                Some(self.results.register(&message_id)?)
            }
        };

        block.set_selector(remaining);
        block.frame_selector = String::new();
        block.frame_rect = offset;
        let block_data = serde_json::to_value(&block)
            .map_err(|e| BlockError::ChannelClosed(format!("encode block {}: {}", block.id, e)))?;

        self.tokens.put(&message_id)?;
        window.post(
            &RelayMessage::ExecuteBlock {
                message_id: message_id.clone(),
                block_data,
            },
            source,
        )?;
        debug!(message_id = %message_id, window = %window.id(), "Posted block to frame");

        let Some(pending) = pending else {
            return Ok(BlockReply::Forwarded);
        };
        let timeout = Duration::from_millis(self.config.timeout_ms);
        match pending.wait(timeout).await? {
            Some(result) => match ErrorPayload::detect(&result) {
                Some(payload) => Err(BlockError::from_payload(payload)),
                None => {
                    info!(message_id = %message_id, "Relayed block completed");
                    Ok(BlockReply::Done(result))
                }
            },
            None => {
                warn!(message_id = %message_id, "Relayed block timed out");
                Err(BlockError::RelayTimeout(self.config.timeout_ms))
            }
        }
    }

    /// Receiver side: consumes the token for `message_id`.
    ///
    /// A missing or already-consumed token is `EmptyMessageId`.
    pub fn accept(&self, message_id: &str) -> Result<(), BlockError> {
        if message_id.is_empty() {
            return Err(BlockError::EmptyMessageId);
        }
        match self.tokens.consume(message_id)? {
            Some(_) => Ok(()),
            None => {
                warn!(message_id, "Message token missing; rejecting delivery");
                Err(BlockError::EmptyMessageId)
            }
        }
    }

    /// Top-level side: a result arrived for `message_id`.
    pub fn deliver(&self, message_id: &str, result: Value) -> bool {
        self.results.resolve(message_id, result)
    }
}

/// Builds the result message a frame posts to the top-level window.
pub fn result_message(message_id: &str, outcome: Result<Value, BlockError>) -> RelayMessage {
    let result = match outcome {
        Ok(value) => value,
        Err(err) => serde_json::to_value(err.to_payload()).unwrap_or(Value::Null),
    };
    RelayMessage::BlockExecuteResult {
        message_id: message_id.to_string(),
        result,
    }
}
