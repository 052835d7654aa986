//! Cross-document wire messages.

use crate::dom::Rect;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages exchanged between windows, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    /// Run `blockData` in the receiving frame. Gated by the token at `messageId`.
    #[serde(rename = "turium:execute-block", rename_all = "camelCase")]
    ExecuteBlock {
        #[serde(default)]
        message_id: String,
        block_data: Value,
    },

    /// Outcome of a relayed block, posted to the top-level window. `messageId` is the
    /// id the originating caller registered.
    #[serde(rename = "turium:block-execute-result", rename_all = "camelCase")]
    BlockExecuteResult {
        #[serde(default)]
        message_id: String,
        result: Value,
    },

    /// Asks the top-level window for the sender's frame box.
    #[serde(rename = "turium:get-frame")]
    GetFrame,

    #[serde(rename = "turium:the-frame-rect", rename_all = "camelCase")]
    TheFrameRect { frame_rect: Rect },
}

impl RelayMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::ExecuteBlock { .. } => "turium:execute-block",
            RelayMessage::BlockExecuteResult { .. } => "turium:block-execute-result",
            RelayMessage::GetFrame => "turium:get-frame",
            RelayMessage::TheFrameRect { .. } => "turium:the-frame-rect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        let msg = RelayMessage::ExecuteBlock {
            message_id: "message:1".into(),
            block_data: json!({ "name": "get-text" }),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "turium:execute-block",
                "messageId": "message:1",
                "blockData": { "name": "get-text" }
            })
        );
        assert_eq!(
            serde_json::to_value(RelayMessage::GetFrame).unwrap(),
            json!({ "type": "turium:get-frame" })
        );
    }

    #[test]
    fn test_missing_message_id_defaults_empty() {
        let msg: RelayMessage = serde_json::from_value(json!({
            "type": "turium:execute-block",
            "blockData": {}
        }))
        .unwrap();
        assert!(matches!(msg, RelayMessage::ExecuteBlock { ref message_id, .. } if message_id.is_empty()));
    }
}
