//! Shared test utilities for integration tests
//!
//! Environment isolation for config loading, and a content stack with short waits,
//! an in-memory token store and a recording fetcher.

use async_trait::async_trait;
use parking_lot::Mutex as CallLog;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use turium::content::ContentServices;
use turium::error::BlockError;
use turium::relay::token::{MemoryTokenStore, TokenStore};
use turium::relay::{FrameRelay, RelayConfig};
use turium::sandbox::fetch::FetchResource;
use turium::sandbox::{ExecutionProtocol, FetchType, Fetcher, QuickJsHost, SandboxConfig};
use turium::selector::{ResolverConfig, SelectorResolver};

/// Global mutex to serialize environment variable access across all tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Environment variable state to restore after test
struct EnvState {
    home: Option<String>,
    xdg_config_home: Option<String>,
    turium_env: Option<String>,
}

impl EnvState {
    fn capture() -> Self {
        Self {
            home: std::env::var("HOME").ok(),
            xdg_config_home: std::env::var("XDG_CONFIG_HOME").ok(),
            turium_env: std::env::var("TURIUM_ENV").ok(),
        }
    }

    fn restore(self) {
        restore_var("HOME", self.home);
        restore_var("XDG_CONFIG_HOME", self.xdg_config_home);
        restore_var("TURIUM_ENV", self.turium_env);
    }
}

fn restore_var(name: &str, value: Option<String>) {
    match value {
        Some(orig) => std::env::set_var(name, orig),
        None => std::env::remove_var(name),
    }
}

/// Runs `f` with `XDG_CONFIG_HOME` and `HOME` inside `test_dir`, restoring the
/// environment afterwards. Serialized across tests.
pub fn with_xdg_env<F, R>(test_dir: &TempDir, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let env_state = EnvState::capture();

    let test_home = test_dir.path().join("home");
    std::fs::create_dir_all(&test_home).unwrap();

    std::env::set_var("HOME", test_home.to_str().unwrap());
    std::env::set_var("XDG_CONFIG_HOME", test_dir.path().to_str().unwrap());
    std::env::remove_var("TURIUM_ENV");

    let result = f();

    env_state.restore();

    result
}

/// Records requested urls and answers from a fixed table.
#[derive(Default)]
pub struct RecordingFetcher {
    pub calls: CallLog<Vec<String>>,
    pub bodies: HashMap<String, String>,
}

impl RecordingFetcher {
    pub fn with_body(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(&self, kind: FetchType, resource: &FetchResource) -> Result<Value, BlockError> {
        self.calls.lock().push(resource.url().to_string());
        let body = self
            .bodies
            .get(resource.url())
            .ok_or_else(|| BlockError::Fetch("404 Not Found".into()))?;
        match kind {
            FetchType::Json => {
                serde_json::from_str(body).map_err(|e| BlockError::Fetch(e.to_string()))
            }
            FetchType::Text => Ok(Value::String(body.clone())),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, BlockError> {
        self.calls.lock().push(url.to_string());
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| BlockError::Fetch("404 Not Found".into()))
    }
}

pub fn fast_resolver() -> SelectorResolver {
    SelectorResolver::new(ResolverConfig {
        wait_ms: 50,
        poll_interval_ms: 10,
    })
}

/// Protocol backed by QuickJS and `fetcher`. Must be called inside a runtime.
pub fn protocol_with(fetcher: Arc<RecordingFetcher>) -> ExecutionProtocol {
    ExecutionProtocol::new(Arc::new(QuickJsHost::new()), fetcher, SandboxConfig::default())
}

/// Content stack for one tab. Must be called inside a runtime.
pub fn services_with(tokens: Arc<dyn TokenStore>) -> ContentServices {
    ContentServices::new(
        fast_resolver(),
        protocol_with(Arc::new(RecordingFetcher::default())),
        FrameRelay::new(tokens, RelayConfig { timeout_ms: 2000 }),
    )
}

pub fn services() -> ContentServices {
    services_with(Arc::new(MemoryTokenStore::new()))
}
