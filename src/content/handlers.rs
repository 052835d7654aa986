//! Block handlers available inside a content runtime.

use super::ContentRuntime;
use crate::block::BlockRequest;
use crate::condition::{ConditionEvaluator, ConditionRequest};
use crate::dom::Document;
use crate::error::BlockError;
use crate::sandbox::{ExecutionRequest, PreloadScript};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Attribute naming the loop an element belongs to.
pub const LOOP_ATTR: &str = "turium-loop";

/// Attribute holding the element's position within its loop.
pub const LOOP_INDEX_ATTR: &str = "turium-loop-index";

/// What a handler can reach while it runs.
pub struct HandlerContext<'a> {
    pub runtime: &'a ContentRuntime,
    /// Document the block's selector is local to (a frame document after
    /// in-process traversal).
    pub document: &'a Document,
}

#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext<'_>, block: &BlockRequest) -> Result<Value, BlockError>;
}

/// Handlers keyed by camelCase block name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn BlockHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `conditions`, `javascriptCode`, `getText` and `loopData`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("conditions", Arc::new(ConditionsHandler));
        registry.register("javascriptCode", Arc::new(JavascriptCodeHandler));
        registry.register("getText", Arc::new(GetTextHandler));
        registry.register("loopData", Arc::new(LoopDataHandler));
        registry
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn BlockHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn BlockHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

fn parse_data<T: for<'de> Deserialize<'de>>(block: &BlockRequest) -> Result<T, BlockError> {
    serde_json::from_value(block.data.clone()).map_err(|e| BlockError::InvalidBlock(e.to_string()))
}

fn required_selector(block: &BlockRequest) -> Result<&str, BlockError> {
    block
        .selector()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BlockError::InvalidBlock("missing selector".to_string()))
}

/// Evaluates element and code conditions.
pub struct ConditionsHandler;

#[async_trait]
impl BlockHandler for ConditionsHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, block: &BlockRequest) -> Result<Value, BlockError> {
        let request: ConditionRequest = parse_data(block)?;
        let services = ctx.runtime.services();
        let evaluator = ConditionEvaluator::new(services.resolver.clone(), services.protocol.clone());
        let result = evaluator
            .evaluate(Some(ctx.document), &request, &block.ref_data)
            .await?;
        Ok(result.into())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JavascriptCodeData {
    #[serde(default)]
    code: String,
    #[serde(default)]
    preload_scripts: Vec<PreloadScript>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    every_new_tab: bool,
    #[serde(default)]
    context: Option<String>,
}

/// Runs block code in the document through the execution protocol.
pub struct JavascriptCodeHandler;

#[async_trait]
impl BlockHandler for JavascriptCodeHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, block: &BlockRequest) -> Result<Value, BlockError> {
        let data: JavascriptCodeData = parse_data(block)?;
        let protocol = &ctx.runtime.services().protocol;
        let preloads = protocol.load_preloads(&data.preload_scripts).await;
        let request = ExecutionRequest {
            block_id: block.id.clone(),
            code: data.code,
            ref_data: block.ref_data.clone(),
            preloads,
            timeout_ms: data.timeout.or(block.timeout_ms),
            every_new_tab: data.every_new_tab,
            background: data.context.as_deref() == Some("background"),
        };
        let result = protocol.execute(Some(ctx.document), request).await?;
        serde_json::to_value(result).map_err(|e| BlockError::ScriptExecution(e.to_string()))
    }
}

/// Rendered text of the target (an array when `multiple`).
pub struct GetTextHandler;

#[async_trait]
impl BlockHandler for GetTextHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, block: &BlockRequest) -> Result<Value, BlockError> {
        let selector = required_selector(block)?;
        let elements = ctx
            .runtime
            .services()
            .resolver
            .wait_for(ctx.document, selector, block.multiple(), block.data_u64("waitSelectorTimeout"))
            .await?;
        if elements.is_empty() {
            return Err(BlockError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        if block.multiple() {
            Ok(Value::Array(
                elements.iter().map(|el| Value::String(el.inner_text())).collect(),
            ))
        } else {
            Ok(Value::String(elements[0].inner_text()))
        }
    }
}

/// Marks the elements of a loop list and returns a selector per item.
///
/// With `onlyGenerate` the marks are refreshed and nothing is returned.
pub struct LoopDataHandler;

#[async_trait]
impl BlockHandler for LoopDataHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, block: &BlockRequest) -> Result<Value, BlockError> {
        let selector = required_selector(block)?;
        let loop_id = block.data_str("loopId").unwrap_or(&block.id);
        let max = block.data_u64("maxLoop").filter(|max| *max > 0).unwrap_or(u64::MAX);

        let elements = ctx
            .runtime
            .services()
            .resolver
            .wait_for(ctx.document, selector, true, block.data_u64("waitSelectorTimeout"))
            .await?;
        if elements.is_empty() {
            return Err(BlockError::ElementNotFound {
                selector: selector.to_string(),
            });
        }

        let items: Vec<Value> = elements
            .iter()
            .take(usize::try_from(max).unwrap_or(usize::MAX))
            .enumerate()
            .map(|(index, element)| {
                element.set_attribute(LOOP_ATTR, loop_id);
                element.set_attribute(LOOP_INDEX_ATTR, &index.to_string());
                Value::String(format!(
                    "[{}=\"{}\"][{}=\"{}\"]",
                    LOOP_ATTR, loop_id, LOOP_INDEX_ATTR, index
                ))
            })
            .collect();
        debug!(loop_id, count = items.len(), "Loop elements marked");

        if block.data.get("onlyGenerate").and_then(Value::as_bool) == Some(true) {
            return Ok(Value::Null);
        }
        Ok(Value::Array(items))
    }
}
