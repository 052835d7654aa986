//! Execution Protocol (Sandbox Bridge)
//!
//! Runs caller-authored code in an isolated script context and returns one
//! structured result. The code sees a small bridge (`turiumNextBlock`,
//! `turiumSetVariable`, `turiumFetch`, `turiumResetTimeout`, `turiumRefData`);
//! everything it produces comes back through that bridge.

pub mod bridge;
pub mod context;
pub mod fetch;
pub mod host;
pub mod protocol;
pub mod quickjs;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use bridge::Bridge;
pub use context::{ContextRegistry, IsolatedExecutionContext};
pub use fetch::{FetchRelay, FetchType, Fetcher, HttpFetcher};
pub use host::{BridgeSurface, ScriptHost, ScriptSource};
pub use protocol::{ExecutionProtocol, ExecutionRequest};
pub use quickjs::QuickJsHost;

/// Page event carrying a page-scoped completion.
pub const NEXT_BLOCK_EVENT: &str = "__turium-next-block__";

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Teardown timer when a block sets none (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Per-script limit when loading preload scripts (milliseconds)
    #[serde(default = "default_preload_fetch_timeout_ms")]
    pub preload_fetch_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    20000
}

fn default_preload_fetch_timeout_ms() -> u64 {
    10000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            preload_fetch_timeout_ms: default_preload_fetch_timeout_ms(),
        }
    }
}

/// Data handed to the table by `turiumNextBlock(data, insert)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Columns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<Value>,
}

/// Outcome of one execution: `{variables, columns: {data, insert}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default = "empty_object")]
    pub variables: Value,
    #[serde(default)]
    pub columns: Columns,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self::empty()
    }
}

impl ExecutionResult {
    /// `{variables: {}, columns: {}}`: the timeout and duplicate-guard outcome.
    pub fn empty() -> Self {
        Self {
            variables: empty_object(),
            columns: Columns::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns == Columns::default()
            && self.variables.as_object().map(Map::is_empty).unwrap_or(true)
    }

    /// The `{$error: true, message}` column payload, if the code threw.
    pub fn script_error(&self) -> Option<String> {
        let data = self.columns.data.as_ref()?;
        if data.get("$error").and_then(Value::as_bool) == Some(true) {
            Some(
                data.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )
        } else {
            None
        }
    }
}

/// Completion message for a page-scoped execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "sandbox")]
pub struct SandboxMessage {
    pub id: String,
    pub result: ExecutionResult,
}

/// A preload script as configured on a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadScript {
    pub src: String,
    #[serde(default)]
    pub remove_after_exec: bool,
}

/// A preload script fetched and ready to inject.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPreload {
    pub id: String,
    pub script: String,
    pub remove_after_exec: bool,
}
