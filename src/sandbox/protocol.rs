//! Request/response protocol around one sandboxed execution.

use super::bridge::{Bridge, CompletionRoute};
use super::context::{ContextRegistry, InjectionHandle, IsolatedExecutionContext};
use super::fetch::{load_preloads, FetchRelay, Fetcher, HttpFetcher};
use super::host::{BridgeSurface, ScriptHost, ScriptSource};
use super::quickjs::QuickJsHost;
use super::{ExecutionResult, LoadedPreload, PreloadScript, SandboxConfig, SandboxMessage, NEXT_BLOCK_EVENT};
use crate::dispatch::{Dispatcher, PendingReply};
use crate::dom::Document;
use crate::error::BlockError;
use crate::policy::PolicyFallbackCoordinator;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NEXT_BLOCK_CALL: &str = "turiumNextBlock";

/// One code execution, owned by the protocol once handed over.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// Block the code belongs to; names the page artifact `script<block_id>`.
    pub block_id: String,
    pub code: String,
    pub ref_data: Value,
    pub preloads: Vec<LoadedPreload>,
    pub timeout_ms: Option<u64>,
    /// Only `turiumRefData` is exposed; completes when evaluation ends.
    pub every_new_tab: bool,
    /// Run in the privileged context; no tab is required.
    pub background: bool,
}

impl ExecutionRequest {
    pub fn new(block_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            code: code.into(),
            ref_data: json!({}),
            ..Self::default()
        }
    }

    pub fn with_ref_data(mut self, ref_data: Value) -> Self {
        self.ref_data = ref_data;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

fn new_context_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Runs code in isolated contexts and correlates their single results.
#[derive(Clone)]
pub struct ExecutionProtocol {
    /// Owner key of this protocol's completion listener on each page.
    id: String,
    host: Arc<dyn ScriptHost>,
    fetcher: Arc<dyn Fetcher>,
    fetch_relay: FetchRelay,
    registry: ContextRegistry,
    completions: Dispatcher<ExecutionResult>,
    policy: PolicyFallbackCoordinator,
    config: SandboxConfig,
}

impl ExecutionProtocol {
    /// Must be called inside a tokio runtime; the fetch relay starts serving here.
    pub fn new(host: Arc<dyn ScriptHost>, fetcher: Arc<dyn Fetcher>, config: SandboxConfig) -> Self {
        Self {
            id: new_context_id(),
            host,
            fetch_relay: FetchRelay::spawn(fetcher.clone()),
            fetcher,
            registry: ContextRegistry::new(),
            completions: Dispatcher::new(),
            policy: PolicyFallbackCoordinator::new(),
            config,
        }
    }

    /// QuickJS host with the reqwest fetcher.
    pub fn with_defaults(config: SandboxConfig) -> Self {
        Self::new(Arc::new(QuickJsHost::new()), Arc::new(HttpFetcher::new()), config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn completions(&self) -> &Dispatcher<ExecutionResult> {
        &self.completions
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub async fn load_preloads(&self, scripts: &[PreloadScript]) -> Vec<LoadedPreload> {
        let timeout = Duration::from_millis(self.config.preload_fetch_timeout_ms);
        load_preloads(self.fetcher.as_ref(), scripts, timeout).await
    }

    fn timeout(&self, request: &ExecutionRequest) -> Duration {
        Duration::from_millis(request.timeout_ms.unwrap_or(self.config.default_timeout_ms))
    }

    /// Executes `request` against `document` and returns its single result.
    ///
    /// Without a document only background requests may run (`NoTab` otherwise).
    /// A document whose policy blocks inline scripts runs in the privileged context.
    pub async fn execute(
        &self,
        document: Option<&Document>,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, BlockError> {
        let Some(document) = document else {
            if !request.background {
                return Err(BlockError::NoTab);
            }
            return self.run_privileged(request).await;
        };
        if request.background {
            return self.run_privileged(request).await;
        }

        let outcome = self
            .policy
            .check_and_inject(document, || self.run_privileged(request.clone()))
            .await?;
        if outcome.is_blocked {
            return Ok(outcome.value.unwrap_or_else(ExecutionResult::empty));
        }
        self.run_page(document, request).await
    }

    fn ensure_completion_listener(&self, document: &Document) {
        let completions = self.completions.clone();
        let installed = document.ensure_listener(NEXT_BLOCK_EVENT, &self.id, move |event| {
            match serde_json::from_value::<SandboxMessage>(event.detail.clone()) {
                Ok(message) => {
                    // Other protocols listening on the same page ignore ids they never issued.
                    completions.resolve(&message.id, message.result);
                }
                Err(err) => warn!(error = %err, "Malformed sandbox completion"),
            }
        });
        if installed {
            debug!(url = %document.url(), protocol_id = %self.id, "Installed sandbox completion listener");
        }
    }

    fn source(request: &ExecutionRequest) -> ScriptSource {
        let surface = if request.every_new_tab {
            BridgeSurface::RefDataOnly
        } else {
            BridgeSurface::Full
        };
        let mut code = request.code.clone();
        if surface == BridgeSurface::Full && !code.contains(NEXT_BLOCK_CALL) {
            code.push_str("\nturiumNextBlock();");
        }
        ScriptSource {
            code,
            preloads: request.preloads.iter().map(|p| p.script.clone()).collect(),
            surface,
        }
    }

    async fn run_page(&self, document: &Document, request: ExecutionRequest) -> Result<ExecutionResult, BlockError> {
        let id = new_context_id();
        let block_id = if request.block_id.is_empty() {
            id.as_str()
        } else {
            request.block_id.as_str()
        };
        let artifact_id = format!("script{}", block_id);
        if document.element_by_id(&artifact_id).is_some() {
            debug!(artifact_id = %artifact_id, "Code already injected for block; skipping");
            return Ok(ExecutionResult::empty());
        }

        self.ensure_completion_listener(document);
        let source = Self::source(&request);
        let injection = InjectionHandle::inject(document, &artifact_id, &source.code, &request.preloads);
        let bridge = Arc::new(Bridge::new(
            id,
            request.ref_data.clone(),
            CompletionRoute::Page(document.clone()),
            Some(self.fetch_relay.clone()),
        ));
        debug!(context_id = %bridge.id(), artifact_id = %artifact_id, "Injected code into page");
        self.run_context(bridge, Some(injection), source, &request).await
    }

    async fn run_privileged(&self, request: ExecutionRequest) -> Result<ExecutionResult, BlockError> {
        let bridge = Arc::new(Bridge::new(
            new_context_id(),
            request.ref_data.clone(),
            CompletionRoute::Privileged(self.completions.clone()),
            Some(self.fetch_relay.clone()),
        ));
        debug!(context_id = %bridge.id(), "Running code in privileged context");
        let source = Self::source(&request);
        self.run_context(bridge, None, source, &request).await
    }

    async fn run_context(
        &self,
        bridge: Arc<Bridge>,
        injection: Option<InjectionHandle>,
        source: ScriptSource,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, BlockError> {
        let pending = self.completions.register(bridge.id())?;
        let context = Arc::new(IsolatedExecutionContext::new(bridge.clone(), injection));
        self.registry.insert(context);

        let host = self.host.clone();
        let task_bridge = bridge.clone();
        let every_new_tab = request.every_new_tab;
        tokio::spawn(async move {
            match host.run(source, task_bridge.clone()).await {
                Ok(()) if every_new_tab => {
                    task_bridge.complete(ExecutionResult::empty());
                }
                Ok(()) => {}
                Err(err) => {
                    warn!(context_id = %task_bridge.id(), error = %err, "Script host failed");
                    task_bridge.next_block(json!({ "$error": true, "message": err.to_string() }), json!(true));
                }
            }
        });

        let timeout = self.timeout(request);
        let result = self.await_completion(pending, &bridge, timeout).await;
        self.registry.remove(bridge.id());
        Ok(result)
    }

    async fn await_completion(
        &self,
        mut pending: PendingReply<ExecutionResult>,
        bridge: &Bridge,
        timeout: Duration,
    ) -> ExecutionResult {
        let mut deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                received = pending.receiver() => {
                    return match received {
                        Ok(result) => {
                            info!(context_id = %bridge.id(), "Execution completed");
                            result
                        }
                        Err(_) => ExecutionResult::empty(),
                    };
                }
                _ = bridge.timer_reset().notified() => {
                    debug!(context_id = %bridge.id(), "Teardown timer reset");
                    deadline = Instant::now() + timeout;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    info!(context_id = %bridge.id(), timeout_ms = timeout.as_millis() as u64, "Execution timed out; tearing down");
                    return ExecutionResult::empty();
                }
            }
        }
    }

    /// Runs condition code and returns its value.
    ///
    /// A thrown error is `ScriptExecution`; code that does not settle before the
    /// timeout is `EvaluationTimeout`.
    pub async fn evaluate(&self, document: Option<&Document>, request: ExecutionRequest) -> Result<Value, BlockError> {
        if request.background {
            return self.evaluate_in(None, request).await;
        }
        let Some(document) = document else {
            return Err(BlockError::NoTab);
        };

        let outcome = self
            .policy
            .check_and_inject(document, || self.evaluate_in(None, request.clone()))
            .await?;
        if outcome.is_blocked {
            return Ok(outcome.value.unwrap_or(Value::Null));
        }
        self.evaluate_in(Some(document), request).await
    }

    async fn evaluate_in(&self, document: Option<&Document>, request: ExecutionRequest) -> Result<Value, BlockError> {
        let id = new_context_id();
        let injection = document.map(|doc| {
            InjectionHandle::inject(doc, &format!("turium-condition-{}", id), &request.code, &[])
        });
        let bridge = Arc::new(Bridge::new(
            id,
            request.ref_data.clone(),
            CompletionRoute::Privileged(self.completions.clone()),
            None,
        ));
        self.registry
            .insert(Arc::new(IsolatedExecutionContext::new(bridge.clone(), injection)));

        let source = ScriptSource {
            code: request.code.clone(),
            preloads: Vec::new(),
            surface: BridgeSurface::RefDataOnly,
        };
        let timeout_ms = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.host.evaluate(source, bridge.clone()),
        )
        .await;
        self.registry.remove(bridge.id());

        match outcome {
            Ok(Ok(Some(value))) => Ok(value),
            Ok(Ok(None)) | Err(_) => {
                warn!(context_id = %bridge.id(), timeout_ms, "Condition code did not settle");
                Err(BlockError::EvaluationTimeout(timeout_ms))
            }
            Ok(Err(err)) => Err(err),
        }
    }
}
