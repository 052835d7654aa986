//! Network access for sandboxed code.
//!
//! Code never fetches directly. `turiumFetch(type, resource)` becomes a
//! `turium-fetch` message to the orchestrator, which performs the request and
//! answers through the `fetch-response-<id>` completion.

use super::{LoadedPreload, PreloadScript};
use crate::dispatch::Dispatcher;
use crate::error::BlockError;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchType {
    Json,
    Text,
}

impl FetchType {
    /// Only `json` and `text` are accepted; anything else fails before any I/O.
    pub fn parse(raw: &str) -> Result<Self, BlockError> {
        match raw {
            "json" => Ok(FetchType::Json),
            "text" => Ok(FetchType::Text),
            other => Err(BlockError::FetchTypeValidation(other.to_string())),
        }
    }
}

/// A URL or a request description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchResource {
    Url(String),
    Request {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl FetchResource {
    pub fn url(&self) -> &str {
        match self {
            FetchResource::Url(url) => url,
            FetchResource::Request { url, .. } => url,
        }
    }
}

/// Performs network requests on behalf of sandboxed code.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, kind: FetchType, resource: &FetchResource) -> Result<Value, BlockError>;

    /// Fetches a script body.
    async fn fetch_text(&self, url: &str) -> Result<String, BlockError>;
}

/// reqwest-backed fetcher
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

fn fetch_error(err: reqwest::Error) -> BlockError {
    BlockError::Fetch(err.to_string())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, kind: FetchType, resource: &FetchResource) -> Result<Value, BlockError> {
        let request = match resource {
            FetchResource::Url(url) => self.client.get(url),
            FetchResource::Request {
                url,
                method,
                headers,
                body,
            } => {
                let method = method
                    .as_deref()
                    .unwrap_or("GET")
                    .to_ascii_uppercase()
                    .parse::<reqwest::Method>()
                    .map_err(|e| BlockError::Fetch(e.to_string()))?;
                let mut request = self.client.request(method, url);
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                match body {
                    Some(Value::String(text)) => request.body(text.clone()),
                    Some(other) => request.body(other.to_string()),
                    None => request,
                }
            }
        };

        let response = request
            .send()
            .await
            .map_err(fetch_error)?
            .error_for_status()
            .map_err(fetch_error)?;
        match kind {
            FetchType::Json => response.json::<Value>().await.map_err(fetch_error),
            FetchType::Text => Ok(Value::String(response.text().await.map_err(fetch_error)?)),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, BlockError> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(fetch_error)?
            .error_for_status()
            .map_err(fetch_error)?
            .text()
            .await
            .map_err(fetch_error)
    }
}

/// `{type: "turium-fetch", data: {id, type, resource}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "turium-fetch")]
pub struct FetchMessage {
    pub data: FetchRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub resource: Value,
}

/// `{id, isError, result}`; `result` is the error message when `isError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub id: String,
    pub is_error: bool,
    pub result: Value,
}

fn response_key(id: &str) -> String {
    format!("fetch-response-{}", id)
}

/// Orchestrator-side fetch service plus the client half used by bridges.
#[derive(Clone)]
pub struct FetchRelay {
    tx: mpsc::UnboundedSender<FetchMessage>,
    responses: Dispatcher<FetchResponse>,
}

impl FetchRelay {
    /// Starts serving `turium-fetch` messages with `fetcher`.
    pub fn spawn(fetcher: Arc<dyn Fetcher>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<FetchMessage>();
        let responses: Dispatcher<FetchResponse> = Dispatcher::new();
        let completions = responses.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let fetcher = fetcher.clone();
                let completions = completions.clone();
                tokio::spawn(async move {
                    let id = message.data.id.clone();
                    let response = match serve(fetcher.as_ref(), &message.data).await {
                        Ok(result) => FetchResponse {
                            id: id.clone(),
                            is_error: false,
                            result,
                        },
                        Err(err) => FetchResponse {
                            id: id.clone(),
                            is_error: true,
                            result: Value::String(err.to_string()),
                        },
                    };
                    completions.resolve(&response_key(&id), response);
                });
            }
        });
        Self { tx, responses }
    }

    /// Client half: validates `kind`, posts the request and waits for its response.
    pub async fn request(&self, kind: &str, resource: Value) -> Result<Value, BlockError> {
        FetchType::parse(kind)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let pending = self.responses.register(&response_key(&id))?;
        self.tx
            .send(FetchMessage {
                data: FetchRequest {
                    id: id.clone(),
                    kind: kind.to_string(),
                    resource,
                },
            })
            .map_err(|_| BlockError::ChannelClosed("fetch relay".to_string()))?;
        debug!(fetch_id = %id, kind, "Posted turium-fetch");

        let response = pending.recv().await?;
        if response.is_error {
            let message = match response.result {
                Value::String(message) => message,
                other => other.to_string(),
            };
            return Err(BlockError::Fetch(message));
        }
        Ok(response.result)
    }
}

async fn serve(fetcher: &dyn Fetcher, request: &FetchRequest) -> Result<Value, BlockError> {
    let kind = FetchType::parse(&request.kind)?;
    let resource: FetchResource = serde_json::from_value(request.resource.clone())
        .map_err(|e| BlockError::Fetch(format!("invalid resource: {}", e)))?;
    fetcher.fetch(kind, &resource).await
}

fn is_http_url(src: &str) -> bool {
    reqwest::Url::parse(src)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Loads preload scripts concurrently. Failed and non-http scripts are skipped; the
/// rest keep their configured order.
pub async fn load_preloads(
    fetcher: &dyn Fetcher,
    scripts: &[PreloadScript],
    timeout: Duration,
) -> Vec<LoadedPreload> {
    let loads = scripts.iter().map(|script| async move {
        if !is_http_url(&script.src) {
            debug!(src = %script.src, "Skipping non-http preload script");
            return None;
        }
        match tokio::time::timeout(timeout, fetcher.fetch_text(&script.src)).await {
            Ok(Ok(body)) => Some(LoadedPreload {
                id: format!("turium-script-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
                script: body,
                remove_after_exec: script.remove_after_exec,
            }),
            Ok(Err(err)) => {
                warn!(src = %script.src, error = %err, "Preload script failed to load; skipping");
                None
            }
            Err(_) => {
                warn!(src = %script.src, "Preload script timed out; skipping");
                None
            }
        }
    });
    join_all(loads).await.into_iter().flatten().collect()
}
