//! Block execution requests as they travel between contexts.

use crate::selector::resolver::FrameOffset;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One block handed to a content runtime, either by the scheduler or by a parent
/// frame through the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequest {
    #[serde(default)]
    pub id: String,

    /// Handler name (`get-text`, `conditions`, ...).
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Block payload; `data.selector` is the target chain.
    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub ref_data: Value,

    /// Chain prefix already resolved in-process.
    #[serde(default)]
    pub frame_selector: String,

    #[serde(rename = "$frameRect", default)]
    pub frame_rect: FrameOffset,

    /// Correlation id registered by the caller that awaits the result.
    #[serde(rename = "$originId", default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Loop list sources used to regenerate loop data after a miss.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loop_els: Vec<LoopElement>,
}

/// A loop list source, matched against the page url.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopElement {
    pub url: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// What executing a block produced in this context.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockReply {
    Done(Value),
    /// Handed to a deeper frame, which reports to the top-level window directly.
    Forwarded,
}

impl BlockRequest {
    pub fn new(name: &str, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            data,
            ..Self::default()
        }
    }

    pub fn selector(&self) -> Option<&str> {
        self.data.get("selector").and_then(Value::as_str)
    }

    pub fn set_selector(&mut self, selector: &str) {
        self.data_mut()
            .insert("selector".to_string(), Value::String(selector.to_string()));
    }

    pub fn multiple(&self) -> bool {
        self.data
            .get("multiple")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn data_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    pub fn data_mut(&mut self) -> &mut Map<String, Value> {
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        match &mut self.data {
            Value::Object(map) => map,
            _ => unreachable!("data was just made an object"),
        }
    }

    /// Handler lookup key: `name`, falling back to `label`, in camelCase.
    pub fn handler_key(&self) -> String {
        let raw = if self.name.is_empty() {
            self.label.as_deref().unwrap_or_default()
        } else {
            self.name.as_str()
        };
        to_camel_case(raw)
    }

    pub fn display_name(&self) -> &str {
        self.label
            .as_deref()
            .filter(|label| !label.is_empty())
            .unwrap_or(&self.name)
    }
}

pub fn to_camel_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut upper = false;
    for ch in raw.chars() {
        if ch == '-' || ch == '_' || ch.is_whitespace() {
            upper = !out.is_empty();
            continue;
        }
        if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else if out.is_empty() {
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
