//! Content runtime
//!
//! One runtime per document (the top-level page and every frame that can only be
//! reached through messages). It owns the document's single message listener,
//! executes blocks against its document, relays blocks into remote frames and,
//! in the top-level runtime, collects relayed results and answers frame-rect
//! requests.

pub mod handlers;

use crate::block::{BlockReply, BlockRequest};
use crate::config::TuriumConfig;
use crate::dispatch::Dispatcher;
use crate::dom::fixture::PageFixture;
use crate::dom::{Document, FrameContent, Rect};
use crate::error::BlockError;
use crate::relay::message::RelayMessage;
use crate::relay::token::open_token_store;
use crate::relay::window::{WindowHandle, WindowInbox, WindowMessage};
use crate::relay::{result_message, FrameRelay};
use crate::sandbox::ExecutionProtocol;
use crate::selector::{ChainResolution, SelectorChain, SelectorResolver, FRAME_DELIMITER};
use handlers::{HandlerContext, HandlerRegistry, LOOP_ATTR};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use handlers::BlockHandler;

const FRAME_RECT_REQUEST: &str = "frame-rect";

/// Collaborators shared by every runtime of a tab.
#[derive(Clone)]
pub struct ContentServices {
    pub resolver: SelectorResolver,
    pub protocol: ExecutionProtocol,
    pub relay: FrameRelay,
}

impl ContentServices {
    pub fn new(resolver: SelectorResolver, protocol: ExecutionProtocol, relay: FrameRelay) -> Self {
        Self {
            resolver,
            protocol,
            relay,
        }
    }

    /// Builds the default stack (QuickJS host, reqwest fetcher, configured token store).
    pub fn from_config(config: &TuriumConfig) -> Result<Self, BlockError> {
        let tokens = open_token_store(&config.storage)?;
        Ok(Self {
            resolver: SelectorResolver::new(config.resolver.clone()),
            protocol: ExecutionProtocol::with_defaults(config.sandbox.clone()),
            relay: FrameRelay::new(tokens, config.relay.clone()),
        })
    }
}

pub struct ContentRuntime {
    window: WindowHandle,
    /// Top-level window; `None` in the top-level runtime itself.
    top: Option<WindowHandle>,
    document: Document,
    services: ContentServices,
    handlers: HandlerRegistry,
    frame_rects: Dispatcher<Rect>,
    listening: AtomicBool,
}

impl ContentRuntime {
    pub fn new(
        window: WindowHandle,
        top: Option<WindowHandle>,
        document: Document,
        services: ContentServices,
    ) -> Self {
        Self {
            window,
            top,
            document,
            services,
            handlers: HandlerRegistry::with_builtins(),
            frame_rects: Dispatcher::new(),
            listening: AtomicBool::new(false),
        }
    }

    pub fn with_handler(mut self, name: &str, handler: Arc<dyn BlockHandler>) -> Self {
        self.handlers.register(name, handler);
        self
    }

    pub fn window(&self) -> &WindowHandle {
        &self.window
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn services(&self) -> &ContentServices {
        &self.services
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn is_main_frame(&self) -> bool {
        self.top.is_none()
    }

    fn top_window(&self) -> &WindowHandle {
        self.top.as_ref().unwrap_or(&self.window)
    }

    /// Installs the runtime's message listener on `inbox`. Only the first call
    /// installs anything; later calls return false.
    pub fn start(self: &Arc<Self>, mut inbox: WindowInbox) -> bool {
        if self.listening.swap(true, Ordering::SeqCst) {
            warn!(window = %self.window.id(), "Message listener already installed");
            return false;
        }
        let runtime = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let runtime = runtime.clone();
                tokio::spawn(async move { runtime.handle_message(message).await });
            }
            debug!(window = %runtime.window.id(), "Window inbox closed");
        });
        true
    }

    async fn handle_message(&self, raw: WindowMessage) {
        let Some(message) = raw.decode() else {
            return;
        };
        debug!(window = %self.window.id(), kind = message.kind(), "Message received");
        match message {
            RelayMessage::ExecuteBlock {
                message_id,
                block_data,
            } => self.handle_execute(message_id, block_data).await,
            RelayMessage::BlockExecuteResult { message_id, result } => {
                if self.is_main_frame() && !self.services.relay.deliver(&message_id, result) {
                    debug!(message_id = %message_id, "Result for unknown or settled request; dropping");
                }
            }
            RelayMessage::GetFrame => {
                if self.is_main_frame() {
                    self.answer_frame_rect(raw.source.as_ref());
                }
            }
            RelayMessage::TheFrameRect { frame_rect } => {
                self.frame_rects.resolve(FRAME_RECT_REQUEST, frame_rect);
            }
        }
    }

    async fn handle_execute(&self, message_id: String, block_data: Value) {
        let block = serde_json::from_value::<BlockRequest>(block_data)
            .map_err(|e| BlockError::InvalidBlock(e.to_string()));
        let origin = block
            .as_ref()
            .ok()
            .and_then(|b| b.origin_id.clone())
            .unwrap_or_else(|| message_id.clone());

        if let Err(err) = self.services.relay.accept(&message_id) {
            error!(message_id = %message_id, error = %err, "Rejected relayed block");
            self.post_to_top(result_message(&origin, Err(err)));
            return;
        }

        let outcome = match block {
            Ok(block) => self.execute_block(block).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(BlockReply::Forwarded) => {}
            Ok(BlockReply::Done(value)) => self.post_to_top(result_message(&origin, Ok(value))),
            Err(err) => {
                error!(origin_id = %origin, error = %err, "Relayed block failed");
                self.post_to_top(result_message(&origin, Err(err)));
            }
        }
    }

    fn post_to_top(&self, message: RelayMessage) {
        if let Err(err) = self.top_window().post(&message, Some(&self.window)) {
            warn!(error = %err, "Failed to post to top-level window");
        }
    }

    fn answer_frame_rect(&self, source: Option<&WindowHandle>) {
        let Some(source) = source else {
            return;
        };
        let frame_rect = self
            .document
            .elements()
            .into_iter()
            .filter(|el| el.is_frame())
            .find(|el| matches!(el.content_frame(), Some(FrameContent::Remote(w)) if w.same_window(source)))
            .map(|el| el.bounding_rect())
            .unwrap_or_default();
        if let Err(err) = source.post(&RelayMessage::TheFrameRect { frame_rect }, Some(&self.window)) {
            warn!(error = %err, "Failed to answer frame rect");
        }
    }

    /// This frame's box relative to the top-level document; zero in the top-level runtime.
    pub async fn request_frame_rect(&self, timeout: Duration) -> Result<Rect, BlockError> {
        let Some(top) = &self.top else {
            return Ok(Rect::default());
        };
        let pending = self.frame_rects.register(FRAME_RECT_REQUEST)?;
        top.post(&RelayMessage::GetFrame, Some(&self.window))?;
        match pending.wait(timeout).await? {
            Some(rect) => Ok(rect),
            None => Err(BlockError::RelayTimeout(timeout.as_millis() as u64)),
        }
    }

    /// Executes `block` in this document, walking or relaying its frame chain.
    pub async fn execute_block(&self, mut block: BlockRequest) -> Result<BlockReply, BlockError> {
        let mut document = self.document.clone();

        let framed = block
            .selector()
            .filter(|s| s.contains(FRAME_DELIMITER))
            .map(str::to_string);
        if let Some(selector) = framed {
            let chain = SelectorChain::parse(&selector)?;
            let resolution = self
                .services
                .resolver
                .resolve_chain(&self.document, &chain, block.frame_rect, self.is_main_frame())
                .await?;
            match resolution {
                ChainResolution::Local {
                    document: inner,
                    target,
                    hops,
                    offset,
                } => {
                    debug!(block_id = %block.id, hops, "Chain resolved in-process");
                    block.set_selector(&target);
                    block.frame_selector = chain.prefix(chain.frames().len());
                    block.frame_rect = offset;
                    document = inner;
                }
                ChainResolution::Remote {
                    window,
                    frame_selector,
                    remaining,
                    offset,
                    ..
                } => {
                    debug!(block_id = %block.id, frame = %frame_selector, "Relaying block");
                    return self
                        .services
                        .relay
                        .send(&window, block, &remaining, offset, Some(&self.window))
                        .await;
                }
            }
        }

        let Some(handler) = self.handlers.get(&block.handler_key()) else {
            let err = BlockError::UnknownBlockHandler(block.display_name().to_string());
            error!(error = %err, "No handler for block");
            return Err(err);
        };
        let ctx = HandlerContext {
            runtime: self,
            document: &document,
        };
        let value = handler.handle(&ctx, &block).await?;
        info!(block_id = %block.id, name = %block.name, "Block executed");
        Ok(BlockReply::Done(value))
    }

    /// Scheduler entrypoint. A loop item whose element vanished gets its loop
    /// marks regenerated once, then the block is retried.
    pub async fn run_block(&self, block: BlockRequest) -> Result<BlockReply, BlockError> {
        let err = match self.execute_block(block.clone()).await {
            Err(err) if err.is_element_not_found() => err,
            other => return other,
        };
        let is_loop_item = block.selector().map_or(false, |s| s.contains(LOOP_ATTR));
        let Some(loop_handler) = self.handlers.get("loopData").filter(|_| is_loop_item) else {
            return Err(err);
        };

        warn!(block_id = %block.id, "Loop element missing; regenerating loop data");
        let url = self.document.url();
        let mut loop_block = block.clone();
        {
            let data = loop_block.data_mut();
            if let Some(loop_el) = block.loop_els.iter().find(|el| url.contains(&el.url)) {
                data.insert("url".to_string(), Value::String(loop_el.url.clone()));
                for (key, value) in &loop_el.fields {
                    data.insert(key.clone(), value.clone());
                }
            }
            data.insert("multiple".to_string(), Value::Bool(true));
            data.insert("onlyGenerate".to_string(), Value::Bool(true));
        }
        let ctx = HandlerContext {
            runtime: self,
            document: &self.document,
        };
        loop_handler.handle(&ctx, &loop_block).await?;
        self.execute_block(block).await
    }
}

/// A page and the runtimes of its message-only frames.
pub struct Tab {
    main: Arc<ContentRuntime>,
    frames: Vec<Arc<ContentRuntime>>,
}

fn spawn_frames(
    fixture: &PageFixture,
    top: &WindowHandle,
    services: &ContentServices,
    runtimes: &mut Vec<Arc<ContentRuntime>>,
) -> Document {
    fixture.build_remote(&mut |child: &PageFixture| {
        let (window, inbox) = WindowHandle::channel();
        let document = spawn_frames(child, top, services, runtimes);
        let runtime = Arc::new(ContentRuntime::new(
            window.clone(),
            Some(top.clone()),
            document,
            services.clone(),
        ));
        runtime.start(inbox);
        runtimes.push(runtime);
        window
    })
}

impl Tab {
    /// Builds the page and starts a runtime for it and for every remote frame.
    pub fn open(fixture: &PageFixture, services: ContentServices) -> Self {
        let (window, inbox) = WindowHandle::channel();
        let mut frames = Vec::new();
        let document = spawn_frames(fixture, &window, &services, &mut frames);
        let main = Arc::new(ContentRuntime::new(window, None, document, services));
        main.start(inbox);
        info!(url = %fixture.url, frames = frames.len(), "Tab opened");
        Self { main, frames }
    }

    pub fn main(&self) -> &Arc<ContentRuntime> {
        &self.main
    }

    pub fn frames(&self) -> &[Arc<ContentRuntime>] {
        &self.frames
    }

    pub fn document(&self) -> &Document {
        self.main.document()
    }

    pub async fn run_block(&self, block: BlockRequest) -> Result<BlockReply, BlockError> {
        self.main.run_block(block).await
    }
}
