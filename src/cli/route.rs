//! CLI route: single route table and run context. Dispatches to the content
//! runtime, sandbox and token store, then to presentation.

use crate::block::{BlockReply, BlockRequest};
use crate::cli::parse::{Commands, TokenCommands};
use crate::cli::presentation::{
    format_condition_result, format_execution_result, format_purge_result, format_resolve_json,
    format_resolve_text, MatchRow, ResolveReport,
};
use crate::condition::ConditionResult;
use crate::config::{ConfigLoader, TuriumConfig};
use crate::content::{ContentServices, Tab};
use crate::dom::fixture::PageFixture;
use crate::dom::Element;
use crate::error::BlockError;
use crate::relay::token::open_token_store;
use crate::sandbox::ExecutionRequest;
use crate::selector::resolver::FrameOffset;
use crate::selector::{query, ChainResolution, SelectorChain};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Runtime context for CLI execution: workspace and resolved configuration.
/// Built from workspace path and optional config path using ConfigLoader only.
pub struct RunContext {
    config: TuriumConfig,
    workspace_root: PathBuf,
}

impl RunContext {
    /// Create run context from workspace root and optional config path.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, BlockError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&workspace_root)?
        };
        Ok(Self::with_config(workspace_root, config))
    }

    pub fn with_config(workspace_root: PathBuf, config: TuriumConfig) -> Self {
        Self {
            config,
            workspace_root,
        }
    }

    pub fn config(&self) -> &TuriumConfig {
        &self.config
    }

    /// Execute a command and return its rendered output.
    pub fn execute(&self, command: &Commands) -> Result<String, BlockError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| BlockError::Config(format!("Failed to create runtime: {}", e)))?;
        runtime.block_on(self.execute_async(command))
    }

    async fn execute_async(&self, command: &Commands) -> Result<String, BlockError> {
        match command {
            Commands::Resolve {
                page,
                selector,
                multiple,
                format,
            } => self.handle_resolve(page, selector, *multiple, format).await,
            Commands::Check {
                page,
                kind,
                selector,
                attr,
                code,
            } => {
                self.handle_check(page, kind, selector.as_deref(), attr.as_deref(), code.as_deref())
                    .await
            }
            Commands::Run {
                page,
                code,
                file,
                timeout_ms,
                ref_data,
            } => {
                self.handle_run(
                    page.as_deref(),
                    code.as_deref(),
                    file.as_deref(),
                    *timeout_ms,
                    ref_data.as_deref(),
                )
                .await
            }
            Commands::Tokens { command } => self.handle_tokens(command),
        }
    }

    fn workspace_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    fn load_page(&self, path: &Path) -> Result<PageFixture, BlockError> {
        let path = self.workspace_path(path);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            BlockError::Config(format!("Failed to read page fixture {}: {}", path.display(), e))
        })?;
        let fixture = PageFixture::from_json(&raw).map_err(|e| {
            BlockError::Config(format!("Invalid page fixture {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), url = %fixture.url, "Page fixture loaded");
        Ok(fixture)
    }

    fn open_tab(&self, page: &Path) -> Result<Tab, BlockError> {
        let fixture = self.load_page(page)?;
        let services = ContentServices::from_config(&self.config)?;
        Ok(Tab::open(&fixture, services))
    }

    async fn handle_resolve(
        &self,
        page: &Path,
        selector: &str,
        multiple: bool,
        format: &str,
    ) -> Result<String, BlockError> {
        let tab = self.open_tab(page)?;
        let chain = SelectorChain::parse(selector)?;
        let resolver = &tab.main().services().resolver;
        let resolution = resolver
            .resolve_chain(tab.document(), &chain, FrameOffset::default(), true)
            .await?;

        let report = match resolution {
            ChainResolution::Local {
                document,
                target,
                hops,
                ..
            } => {
                let mut found = query(&document, &target)?;
                if !multiple {
                    found.truncate(1);
                }
                ResolveReport {
                    selector: selector.to_string(),
                    frame_hops: hops,
                    relayed: false,
                    matches: found.iter().map(match_row).collect(),
                }
            }
            ChainResolution::Remote { hops, .. } => {
                // Elements behind a message-only frame can't be read here; ask the
                // frame's runtime for their text instead.
                let mut block = BlockRequest::new("getText", json!({ "multiple": multiple }));
                block.set_selector(selector);
                let texts = match tab.run_block(block).await {
                    Ok(BlockReply::Done(value)) => value,
                    Ok(BlockReply::Forwarded) => Value::Null,
                    Err(e) if e.is_element_not_found() => Value::Null,
                    Err(e) => return Err(e),
                };
                let matches = match texts {
                    Value::Array(items) => items.iter().map(relayed_row).collect(),
                    Value::Null => Vec::new(),
                    other => vec![relayed_row(&other)],
                };
                ResolveReport {
                    selector: selector.to_string(),
                    frame_hops: hops,
                    relayed: true,
                    matches,
                }
            }
        };
        info!(selector, matches = report.matches.len(), "Selector resolved");

        match format {
            "json" => Ok(format_resolve_json(&report)),
            "text" => Ok(format_resolve_text(&report)),
            other => Err(BlockError::Config(format!(
                "Invalid format: {} (must be 'text' or 'json')",
                other
            ))),
        }
    }

    async fn handle_check(
        &self,
        page: &Path,
        kind: &str,
        selector: Option<&str>,
        attr: Option<&str>,
        code: Option<&str>,
    ) -> Result<String, BlockError> {
        let tab = self.open_tab(page)?;
        let mut data = json!({ "type": kind });
        if let Some(attr) = attr {
            data["attrName"] = json!(attr);
        }
        if let Some(code) = code {
            data["code"] = json!(code);
        }
        let mut block = BlockRequest::new("conditions", data);
        if let Some(selector) = selector {
            block.set_selector(selector);
        }
        let value = match tab.run_block(block).await? {
            BlockReply::Done(value) => value,
            BlockReply::Forwarded => Value::Null,
        };
        Ok(format_condition_result(kind, &ConditionResult::from(value)))
    }

    async fn handle_run(
        &self,
        page: Option<&Path>,
        code: Option<&str>,
        file: Option<&Path>,
        timeout_ms: Option<u64>,
        ref_data: Option<&str>,
    ) -> Result<String, BlockError> {
        let code = match (code, file) {
            (Some(code), _) => code.to_string(),
            (None, Some(file)) => {
                let path = self.workspace_path(file);
                std::fs::read_to_string(&path).map_err(|e| {
                    BlockError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?
            }
            (None, None) => {
                return Err(BlockError::InvalidBlock(
                    "either --code or --file is required".to_string(),
                ))
            }
        };
        let ref_data = match ref_data {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| BlockError::InvalidBlock(format!("ref data: {}", e)))?,
            None => json!({}),
        };

        let mut request = ExecutionRequest::new(uuid::Uuid::new_v4().simple().to_string(), code)
            .with_ref_data(ref_data);
        request.timeout_ms = timeout_ms;
        request.background = page.is_none();

        let result = match page {
            Some(page) => {
                let tab = self.open_tab(page)?;
                let protocol = tab.main().services().protocol.clone();
                protocol.execute(Some(tab.document()), request).await?
            }
            None => {
                let services = ContentServices::from_config(&self.config)?;
                services.protocol.execute(None, request).await?
            }
        };
        Ok(format_execution_result(&result))
    }

    fn handle_tokens(&self, command: &TokenCommands) -> Result<String, BlockError> {
        let store = open_token_store(&self.config.storage)?;
        match command {
            TokenCommands::Purge { older_than_secs } => {
                let purged = store.purge_older_than(Duration::from_secs(*older_than_secs))?;
                let remaining = store.len()?;
                info!(purged, remaining, "Message tokens purged");
                Ok(format_purge_result(purged, remaining))
            }
            TokenCommands::Count => Ok(store.len()?.to_string()),
        }
    }
}

fn match_row(element: &Element) -> MatchRow {
    MatchRow {
        tag: element.tag_name(),
        id: element.attribute("id"),
        text: element.inner_text(),
    }
}

fn relayed_row(text: &Value) -> MatchRow {
    MatchRow {
        tag: "-".to_string(),
        id: None,
        text: text.as_str().map(str::to_string).unwrap_or_else(|| text.to_string()),
    }
}
