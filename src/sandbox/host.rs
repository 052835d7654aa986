//! Script host seam.

use super::bridge::Bridge;
use crate::error::BlockError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Which bridge names the code sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSurface {
    /// `turiumNextBlock`, `turiumSetVariable`, `turiumFetch`, `turiumResetTimeout`
    /// and `turiumRefData`.
    Full,
    /// `turiumRefData` only (every-new-tab and condition code).
    RefDataOnly,
}

#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub code: String,
    /// Preload script bodies, evaluated in order before `code`.
    pub preloads: Vec<String>,
    pub surface: BridgeSurface,
}

/// Runs code in an isolated script context wired to a bridge.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Runs `source` until its job queue drains or the bridge is torn down.
    /// The outcome travels through the bridge; `Err` means the context could
    /// not be set up at all.
    async fn run(&self, source: ScriptSource, bridge: Arc<Bridge>) -> Result<(), BlockError>;

    /// Runs `source` as an async function body and returns its value.
    ///
    /// `Ok(None)` when the code never settled. A thrown error is `ScriptExecution`.
    async fn evaluate(&self, source: ScriptSource, bridge: Arc<Bridge>) -> Result<Option<Value>, BlockError>;
}
