//! QuickJS script host.
//!
//! Each execution gets a fresh runtime and context on a blocking thread. The
//! bridge is exposed as a handful of `__turium_*` native functions that exchange
//! JSON strings; a small prelude wraps them in the public `turium*` names. An
//! interrupt handler stops the code as soon as the bridge is torn down.

use super::bridge::Bridge;
use super::host::{BridgeSurface, ScriptHost, ScriptSource};
use crate::error::BlockError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rquickjs::{Context, Ctx, Function, Runtime};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

type Settled = Arc<Mutex<Option<Result<Value, String>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Evaluate,
}

/// Runs code in QuickJS
#[derive(Debug, Clone, Default)]
pub struct QuickJsHost;

impl QuickJsHost {
    pub fn new() -> Self {
        Self
    }

    async fn spawn(
        &self,
        source: ScriptSource,
        bridge: Arc<Bridge>,
        mode: Mode,
    ) -> Result<Option<Value>, BlockError> {
        let handle = Handle::current();
        let settled: Settled = Arc::new(Mutex::new(None));
        let cell = settled.clone();
        tokio::task::spawn_blocking(move || execute(source, bridge, handle, mode, cell))
            .await
            .map_err(|e| BlockError::ScriptExecution(format!("script host panicked: {}", e)))??;

        let outcome = settled.lock().take();
        match outcome {
            None => Ok(None),
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(message)) => Err(BlockError::ScriptExecution(message)),
        }
    }
}

#[async_trait]
impl ScriptHost for QuickJsHost {
    async fn run(&self, source: ScriptSource, bridge: Arc<Bridge>) -> Result<(), BlockError> {
        self.spawn(source, bridge, Mode::Run).await.map(|_| ())
    }

    async fn evaluate(&self, source: ScriptSource, bridge: Arc<Bridge>) -> Result<Option<Value>, BlockError> {
        self.spawn(source, bridge, Mode::Evaluate).await
    }
}

fn js_error(err: rquickjs::Error) -> BlockError {
    BlockError::ScriptExecution(err.to_string())
}

/// Message of a pending exception, falling back to the error's own text.
fn describe(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }
    let caught = ctx.catch();
    if let Some(exception) = caught.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "Uncaught exception".to_string());
    }
    caught
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "Uncaught exception".to_string())
}

fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

fn execute(
    source: ScriptSource,
    bridge: Arc<Bridge>,
    handle: Handle,
    mode: Mode,
    settled: Settled,
) -> Result<(), BlockError> {
    if bridge.is_torn_down() {
        return Ok(());
    }
    let runtime = Runtime::new().map_err(js_error)?;
    let flag = bridge.torn_down_flag();
    runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::SeqCst))));
    let context = Context::full(&runtime).map_err(js_error)?;

    context.with(|ctx| -> Result<(), BlockError> {
        install_bridge(&ctx, &bridge, &handle, &source, settled).map_err(js_error)?;

        for (index, preload) in source.preloads.iter().enumerate() {
            if let Err(err) = ctx.eval::<(), _>(preload.as_bytes()) {
                warn!(context_id = %bridge.id(), index, error = %describe(&ctx, err), "Preload script threw");
            }
        }

        ctx.eval::<(), _>(HELPERS.as_bytes())
            .map_err(|e| BlockError::ScriptExecution(describe(&ctx, e)))?;
        let surface = match source.surface {
            BridgeSurface::Full => FULL_SURFACE,
            BridgeSurface::RefDataOnly => REF_DATA_SURFACE,
        };
        ctx.eval::<(), _>(surface.as_bytes())
            .map_err(|e| BlockError::ScriptExecution(describe(&ctx, e)))?;

        let runner = match mode {
            Mode::Run => RUN_WRAPPER,
            Mode::Evaluate => EVALUATE_WRAPPER,
        };
        if let Err(err) = ctx.eval::<(), _>(runner.as_bytes()) {
            let message = describe(&ctx, err);
            debug!(context_id = %bridge.id(), error = %message, "Runner stopped");
        }
        Ok(())
    })?;

    loop {
        if bridge.is_torn_down() {
            debug!(context_id = %bridge.id(), "Bridge torn down; abandoning job queue");
            break;
        }
        match runtime.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(_) => debug!(context_id = %bridge.id(), "Pending job threw"),
        }
    }
    Ok(())
}

fn install_bridge<'js>(
    ctx: &Ctx<'js>,
    bridge: &Arc<Bridge>,
    handle: &Handle,
    source: &ScriptSource,
    settled: Settled,
) -> rquickjs::Result<()> {
    let global = ctx.globals();

    {
        let code = source.code.clone();
        let f = Function::new(ctx.clone(), move || -> rquickjs::Result<String> { Ok(code.clone()) })?
            .with_name("__turium_code")?;
        global.set("__turium_code", f)?;
    }

    {
        let bridge = bridge.clone();
        let f = Function::new(
            ctx.clone(),
            move |keyword: String, path: String| -> rquickjs::Result<String> {
                Ok(bridge.ref_data(&keyword, &path).to_string())
            },
        )?
        .with_name("__turium_ref_data")?;
        global.set("__turium_ref_data", f)?;
    }

    {
        let bridge = bridge.clone();
        let f = Function::new(
            ctx.clone(),
            move |name: String, value: String| -> rquickjs::Result<()> {
                bridge.set_variable(&name, parse_json(&value));
                Ok(())
            },
        )?
        .with_name("__turium_set_variable")?;
        global.set("__turium_set_variable", f)?;
    }

    {
        let bridge = bridge.clone();
        let f = Function::new(
            ctx.clone(),
            move |data: String, insert: String| -> rquickjs::Result<bool> {
                Ok(bridge.next_block(parse_json(&data), parse_json(&insert)))
            },
        )?
        .with_name("__turium_next_block")?;
        global.set("__turium_next_block", f)?;
    }

    {
        let bridge = bridge.clone();
        let f = Function::new(ctx.clone(), move || -> rquickjs::Result<()> {
            bridge.reset_timeout();
            Ok(())
        })?
        .with_name("__turium_reset_timeout")?;
        global.set("__turium_reset_timeout", f)?;
    }

    {
        let bridge = bridge.clone();
        let handle = handle.clone();
        let f = Function::new(
            ctx.clone(),
            move |kind: String, resource: String| -> rquickjs::Result<String> {
                let reply = match handle.block_on(bridge.fetch(&kind, parse_json(&resource))) {
                    Ok(result) => json!({ "isError": false, "result": result }),
                    Err(err) => json!({ "isError": true, "result": err.to_string() }),
                };
                Ok(reply.to_string())
            },
        )?
        .with_name("__turium_fetch")?;
        global.set("__turium_fetch", f)?;
    }

    {
        let f = Function::new(
            ctx.clone(),
            move |is_error: bool, payload: String| -> rquickjs::Result<()> {
                let mut cell = settled.lock();
                if cell.is_none() {
                    *cell = Some(if is_error { Err(payload) } else { Ok(parse_json(&payload)) });
                }
                Ok(())
            },
        )?
        .with_name("__turium_settle")?;
        global.set("__turium_settle", f)?;
    }

    Ok(())
}

const HELPERS: &str = r#"
(() => {
    const global = globalThis;
    global.__turium_encode = (value) => {
        const encoded = JSON.stringify(value === undefined ? null : value);
        return encoded === undefined ? 'null' : encoded;
    };
    global.__turium_message = (error) => {
        if (error && error.message !== undefined) return String(error.message);
        return String(error);
    };
    global.__turium_async = Object.getPrototypeOf(async function () {}).constructor;
})();
"#;

const REF_DATA_SURFACE: &str = r#"
(() => {
    globalThis.turiumRefData = (keyword, path) => {
        if (keyword === undefined || keyword === null) return null;
        const key = path === undefined || path === null ? '' : String(path);
        return JSON.parse(__turium_ref_data(String(keyword), key));
    };
})();
"#;

const FULL_SURFACE: &str = r#"
(() => {
    const global = globalThis;
    global.turiumRefData = (keyword, path) => {
        if (keyword === undefined || keyword === null) return null;
        const key = path === undefined || path === null ? '' : String(path);
        return JSON.parse(__turium_ref_data(String(keyword), key));
    };
    global.turiumSetVariable = (name, value) => {
        __turium_set_variable(String(name), __turium_encode(value));
    };
    global.turiumNextBlock = (data, insert) => {
        __turium_next_block(
            __turium_encode(data === undefined ? {} : data),
            __turium_encode(insert === undefined ? true : insert)
        );
    };
    global.turiumResetTimeout = () => {
        __turium_reset_timeout();
    };
    global.turiumFetch = (type, resource) => new Promise((resolve, reject) => {
        if (type !== 'json' && type !== 'text') {
            reject(new Error('The "type" must be "text" or "json"'));
            return;
        }
        const reply = JSON.parse(__turium_fetch(type, __turium_encode(resource)));
        if (reply.isError) reject(new Error(reply.result));
        else resolve(reply.result);
    });
})();
"#;

const RUN_WRAPPER: &str = r#"
(async () => {
    const report = (error) => {
        __turium_next_block(
            __turium_encode({ $error: true, message: __turium_message(error) }),
            'true'
        );
    };
    let body;
    try {
        body = new __turium_async(__turium_code());
    } catch (error) {
        report(error);
        return;
    }
    try {
        await body();
    } catch (error) {
        report(error);
    }
})();
"#;

const EVALUATE_WRAPPER: &str = r#"
(async () => {
    try {
        const body = new __turium_async(__turium_code());
        const value = await body();
        __turium_settle(false, __turium_encode(value));
    } catch (error) {
        __turium_settle(true, __turium_message(error));
    }
})();
"#;
