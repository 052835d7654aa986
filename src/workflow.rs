//! Workflow-side handling of code blocks.
//!
//! Prepares the reference-data snapshot a code block sees, runs the block
//! through the execution protocol and folds the result back into workflow state
//! as the `{nextBlockId, data}` outcome the scheduler consumes.

use crate::dom::Document;
use crate::error::BlockError;
use crate::sandbox::{ExecutionProtocol, ExecutionRequest, ExecutionResult, PreloadScript};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

const REF_DATA_ACCESSOR: &str = "turiumRefData";
const SECRETS: &str = "secrets";

/// State of one workflow run that code blocks read and write.
#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    /// `{variables, table, loopData, globalData, googleSheets, workflow, secrets}`
    pub reference_data: Map<String, Value>,
    /// Outgoing connections: block id to the ids it leads to.
    pub connections: HashMap<String, Vec<String>>,
    /// Every block id in the workflow.
    pub blocks: HashSet<String>,
    /// Code blocks re-run on every new tab, by block id.
    pub every_new_tab: Vec<(String, JavascriptCodeData)>,
}

impl WorkflowState {
    pub fn new() -> Self {
        let mut reference_data = Map::new();
        reference_data.insert("variables".to_string(), Value::Object(Map::new()));
        reference_data.insert("table".to_string(), Value::Array(Vec::new()));
        Self {
            reference_data,
            ..Self::default()
        }
    }

    pub fn connect(&mut self, from: &str, to: &str) {
        self.blocks.insert(from.to_string());
        self.blocks.insert(to.to_string());
        self.connections
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.reference_data.get("variables")?.get(name)
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        let variables = self
            .reference_data
            .entry("variables")
            .or_insert_with(|| Value::Object(Map::new()));
        if !variables.is_object() {
            *variables = Value::Object(Map::new());
        }
        if let Value::Object(variables) = variables {
            variables.insert(name.to_string(), value);
        }
    }

    pub fn table(&self) -> &[Value] {
        self.reference_data
            .get("table")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn table_mut(&mut self) -> &mut Vec<Value> {
        let table = self
            .reference_data
            .entry("table")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !table.is_array() {
            *table = Value::Array(Vec::new());
        }
        match table {
            Value::Array(rows) => rows,
            _ => unreachable!("table was just made an array"),
        }
    }

    fn next_blocks(&self, block_id: &str) -> Vec<String> {
        self.connections.get(block_id).cloned().unwrap_or_default()
    }
}

/// Payload of a `javascript-code` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavascriptCodeData {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub preload_scripts: Vec<PreloadScript>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub every_new_tab: bool,
    /// `website` (default) or `background`.
    #[serde(default)]
    pub context: Option<String>,
}

impl JavascriptCodeData {
    pub fn is_background(&self) -> bool {
        self.context.as_deref() == Some("background")
    }
}

/// `{nextBlockId, data}` handed back to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOutcome {
    pub next_block_id: Vec<String>,
    pub data: Value,
}

/// Reference data the code gets to see.
///
/// Code that never calls the accessor sees only empty variables. Otherwise only
/// keywords the code mentions are kept, and secrets stay out unless referenced.
pub fn snapshot_ref_data(reference_data: &Map<String, Value>, code: &str) -> Value {
    let mut snapshot = Map::new();
    if !code.contains(REF_DATA_ACCESSOR) {
        snapshot.insert("variables".to_string(), Value::Object(Map::new()));
        return Value::Object(snapshot);
    }
    for (keyword, value) in reference_data {
        if code.contains(keyword.as_str()) {
            snapshot.insert(keyword.clone(), value.clone());
        }
    }
    if !code.contains(SECRETS) {
        snapshot.insert(SECRETS.to_string(), Value::Object(Map::new()));
    }
    Value::Object(snapshot)
}

fn parse_rows(data: &Value) -> Option<Vec<Value>> {
    let parsed = match data {
        Value::String(raw) => serde_json::from_str::<Value>(raw).ok()?,
        other => other.clone(),
    };
    match parsed {
        Value::Array(rows) => Some(rows),
        Value::Object(_) => Some(vec![parsed]),
        _ => None,
    }
}

/// Folds an execution result into `state`.
pub fn apply_execution_result(
    state: &mut WorkflowState,
    block_id: &str,
    result: &ExecutionResult,
) -> Result<BlockOutcome, BlockError> {
    if let Some(message) = result.script_error() {
        return Err(BlockError::ScriptExecution(message));
    }

    if let Some(variables) = result.variables.as_object() {
        for (name, value) in variables {
            state.set_variable(name, value.clone());
        }
    }

    let mut next_block_id = state.next_blocks(block_id);
    let mut insert = true;
    let mut replace_table = false;
    match &result.columns.insert {
        Some(Value::Object(options)) => {
            replace_table = options
                .get("replaceTable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            insert = options.get("insert").and_then(Value::as_bool).unwrap_or(true);
            if let Some(target) = options
                .get("nextBlockId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
            {
                next_block_id = match state.connections.get(target) {
                    Some(connections) if !connections.is_empty() => connections.clone(),
                    _ if state.blocks.contains(target) => vec![target.to_string()],
                    _ => return Err(BlockError::UnknownBlock(target.to_string())),
                };
                debug!(block_id, next = target, "Code block chose the next block");
            }
        }
        Some(Value::Bool(flag)) => insert = *flag,
        Some(Value::Null) | None => {}
        Some(_) => insert = true,
    }

    let data = result.columns.data.clone();
    if insert {
        if let Some(rows) = data.as_ref().and_then(parse_rows) {
            let table = state.table_mut();
            if replace_table {
                table.clear();
            }
            table.extend(rows);
        }
    }

    Ok(BlockOutcome {
        next_block_id,
        data: data
            .filter(|d| !d.is_null())
            .unwrap_or_else(|| Value::Object(Map::new())),
    })
}

/// Runs `javascript-code` blocks for the scheduler.
#[derive(Clone)]
pub struct CodeBlockRunner {
    protocol: ExecutionProtocol,
}

impl CodeBlockRunner {
    pub fn new(protocol: ExecutionProtocol) -> Self {
        Self { protocol }
    }

    /// Executes the block against `tab` (the active tab's document, if any).
    pub async fn run(
        &self,
        state: &mut WorkflowState,
        tab: Option<&Document>,
        block_id: &str,
        data: &JavascriptCodeData,
    ) -> Result<BlockOutcome, BlockError> {
        if data.every_new_tab {
            if !state.every_new_tab.iter().any(|(id, _)| id == block_id) {
                state.every_new_tab.push((block_id.to_string(), data.clone()));
            }
            if tab.is_none() {
                return Ok(BlockOutcome {
                    next_block_id: state.next_blocks(block_id),
                    data: Value::String(String::new()),
                });
            }
        } else if tab.is_none() && !data.is_background() {
            return Err(BlockError::NoTab);
        }

        let preloads = self.protocol.load_preloads(&data.preload_scripts).await;
        let request = ExecutionRequest {
            block_id: block_id.to_string(),
            code: data.code.clone(),
            ref_data: snapshot_ref_data(&state.reference_data, &data.code),
            preloads,
            timeout_ms: data.timeout,
            every_new_tab: data.every_new_tab,
            background: data.is_background(),
        };
        let result = self.protocol.execute(tab, request).await?;
        let outcome = apply_execution_result(state, block_id, &result)?;
        info!(block_id, next = ?outcome.next_block_id, "Code block finished");
        Ok(outcome)
    }
}
