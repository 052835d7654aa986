//! The capability surface handed to sandboxed code.
//!
//! One `Bridge` per execution. It owns the reference data snapshot, routes the
//! single completion either through the page (`__turium-next-block__`) or straight
//! into the orchestrator's dispatch table, and exposes the teardown flag the
//! script host polls to interrupt runaway code.

use super::fetch::FetchRelay;
use super::{Columns, ExecutionResult, SandboxMessage, NEXT_BLOCK_EVENT};
use crate::dispatch::Dispatcher;
use crate::dom::Document;
use crate::error::BlockError;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Where a completion goes.
#[derive(Clone)]
pub enum CompletionRoute {
    /// Dispatched as a page event; the page listener forwards it to the orchestrator.
    Page(Document),
    /// Resolved directly in the orchestrator's dispatch table.
    Privileged(Dispatcher<ExecutionResult>),
}

pub struct Bridge {
    id: String,
    ref_data: Mutex<Value>,
    completing: AtomicBool,
    torn_down: Arc<AtomicBool>,
    timer_reset: Notify,
    route: CompletionRoute,
    fetch: Option<FetchRelay>,
}

impl Bridge {
    pub fn new(id: impl Into<String>, ref_data: Value, route: CompletionRoute, fetch: Option<FetchRelay>) -> Self {
        Self {
            id: id.into(),
            ref_data: Mutex::new(ref_data),
            completing: AtomicBool::new(false),
            torn_down: Arc::new(AtomicBool::new(false)),
            timer_reset: Notify::new(),
            route,
            fetch,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `turiumRefData(keyword, path)`
    pub fn ref_data(&self, keyword: &str, path: &str) -> Value {
        let ref_data = self.ref_data.lock();
        let Some(root) = ref_data.get(keyword) else {
            return Value::Null;
        };
        if path.is_empty() {
            return root.clone();
        }
        lookup_path(root, path).cloned().unwrap_or(Value::Null)
    }

    /// `turiumSetVariable(name, value)`: visible in this execution's result.
    pub fn set_variable(&self, name: &str, value: Value) {
        let mut ref_data = self.ref_data.lock();
        if !ref_data.is_object() {
            *ref_data = Value::Object(Map::new());
        }
        if let Value::Object(root) = &mut *ref_data {
            let variables = root
                .entry("variables")
                .or_insert_with(|| Value::Object(Map::new()));
            if !variables.is_object() {
                *variables = Value::Object(Map::new());
            }
            if let Value::Object(variables) = variables {
                variables.insert(name.to_string(), value);
            }
        }
        trace!(context_id = %self.id, variable = name, "Variable set");
    }

    fn variables(&self) -> Value {
        self.ref_data
            .lock()
            .get("variables")
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// `turiumNextBlock(data, insert)`. Only the first call completes the
    /// execution; later ones return false and do nothing.
    pub fn next_block(&self, data: Value, insert: Value) -> bool {
        let result = ExecutionResult {
            variables: self.variables(),
            columns: Columns {
                data: Some(data),
                insert: Some(insert),
            },
        };
        self.complete(result)
    }

    /// Completes with `result` unless a completion already happened.
    pub fn complete(&self, result: ExecutionResult) -> bool {
        if self.completing.swap(true, Ordering::SeqCst) {
            debug!(context_id = %self.id, "Context already completing; ignoring");
            return false;
        }
        match &self.route {
            CompletionRoute::Page(document) => {
                let message = SandboxMessage {
                    id: self.id.clone(),
                    result,
                };
                match serde_json::to_value(&message) {
                    Ok(detail) => document.dispatch_event(NEXT_BLOCK_EVENT, detail),
                    Err(err) => debug!(context_id = %self.id, error = %err, "Failed to encode completion"),
                }
            }
            CompletionRoute::Privileged(completions) => {
                completions.resolve(&self.id, result);
            }
        }
        true
    }

    pub fn is_completing(&self) -> bool {
        self.completing.load(Ordering::SeqCst)
    }

    /// `turiumResetTimeout()`
    pub fn reset_timeout(&self) {
        self.timer_reset.notify_one();
    }

    pub fn timer_reset(&self) -> &Notify {
        &self.timer_reset
    }

    /// `turiumFetch(type, resource)`
    pub async fn fetch(&self, kind: &str, resource: Value) -> Result<Value, BlockError> {
        match &self.fetch {
            Some(relay) => relay.request(kind, resource).await,
            None => Err(BlockError::Fetch("network access is not available here".to_string())),
        }
    }

    /// Marks the bridge dead. Returns whether this call did it.
    pub fn tear_down(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Shared flag for interrupt handlers that must not hold the bridge.
    pub fn torn_down_flag(&self) -> Arc<AtomicBool> {
        self.torn_down.clone()
    }
}

/// Walks `a.b.0.c` (or `a.b[0].c`) through objects and arrays.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = path.replace('[', ".").replace(']', "");
    normalized
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
