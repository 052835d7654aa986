//! Selector resolution with bounded waiting and frame traversal.

use super::{query, SelectorChain};
use crate::dom::{Document, Element, FrameContent};
use crate::error::BlockError;
use crate::relay::window::WindowHandle;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Resolver timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// How long to wait for a selector to match (milliseconds)
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,

    /// Delay between attempts while waiting (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_wait_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            wait_ms: default_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Position of the innermost frame relative to the top-level viewport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameOffset {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_height: Option<f64>,
}

/// Where a chain's target lives after the in-process part of the chain is walked.
#[derive(Debug, Clone)]
pub enum ChainResolution {
    /// Every frame was readable in-process; `target` is queried in `document`.
    Local {
        document: Document,
        target: String,
        hops: usize,
        offset: FrameOffset,
    },
    /// A frame is only reachable through messages. `remaining` is the unresolved
    /// part of the chain to hand to `window`.
    Remote {
        window: WindowHandle,
        frame_selector: String,
        remaining: String,
        hops: usize,
        offset: FrameOffset,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SelectorResolver {
    config: ResolverConfig,
}

impl SelectorResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Polls `selector` until it matches or the wait elapses.
    ///
    /// Returns the first match, every match when `multiple`, or nothing after the
    /// wait. Invalid selectors fail immediately.
    pub async fn wait_for(
        &self,
        document: &Document,
        selector: &str,
        multiple: bool,
        wait_ms: Option<u64>,
    ) -> Result<Vec<Element>, BlockError> {
        let wait = Duration::from_millis(wait_ms.unwrap_or(self.config.wait_ms));
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let deadline = Instant::now() + wait;

        loop {
            let mut found = query(document, selector)?;
            if !found.is_empty() {
                if !multiple {
                    found.truncate(1);
                }
                return Ok(found);
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(selector, "Selector wait elapsed without a match");
                return Ok(Vec::new());
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    pub async fn find_one(
        &self,
        document: &Document,
        selector: &str,
        wait_ms: Option<u64>,
    ) -> Result<Option<Element>, BlockError> {
        Ok(self
            .wait_for(document, selector, false, wait_ms)
            .await?
            .into_iter()
            .next())
    }

    /// Walks the frame segments of `chain` starting at `document`.
    ///
    /// `base` is the offset already accumulated by outer contexts. The top-level
    /// context stamps its window size into the offset.
    pub async fn resolve_chain(
        &self,
        document: &Document,
        chain: &SelectorChain,
        base: FrameOffset,
        is_main_frame: bool,
    ) -> Result<ChainResolution, BlockError> {
        let mut current = document.clone();
        let mut offset = base;
        let mut hops = 0;
        if is_main_frame && chain.is_framed() {
            let viewport = document.viewport();
            offset.window_width = Some(viewport.width);
            offset.window_height = Some(viewport.height);
        }

        for (index, segment) in chain.frames().iter().enumerate() {
            let frame_selector = chain.prefix(index + 1);
            let Some(frame_el) = self.find_one(&current, segment, None).await? else {
                return Err(BlockError::IframeNotFound {
                    selector: frame_selector,
                });
            };
            if !frame_el.is_frame() {
                return Err(BlockError::NotIframe {
                    selector: frame_selector,
                });
            }

            let rect = frame_el.bounding_rect();
            offset.x += rect.x;
            offset.y += rect.y;

            match frame_el.content_frame() {
                Some(FrameContent::Local(inner)) => {
                    debug!(frame = %frame_selector, "Entering same-context frame");
                    current = inner;
                    hops += 1;
                }
                Some(FrameContent::Remote(window)) => {
                    debug!(frame = %frame_selector, window = %window.id(), "Frame requires relay");
                    return Ok(ChainResolution::Remote {
                        window,
                        frame_selector,
                        remaining: chain.remainder(index + 1),
                        hops: index + 1,
                        offset,
                    });
                }
                None => {
                    return Err(BlockError::IframeNotFound {
                        selector: frame_selector,
                    })
                }
            }
        }

        Ok(ChainResolution::Local {
            document: current,
            target: chain.target().to_string(),
            hops,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fixture::{ElementFixture, PageFixture};
    use crate::dom::ROOT;

    fn fast() -> SelectorResolver {
        SelectorResolver::new(ResolverConfig {
            wait_ms: 50,
            poll_interval_ms: 10,
        })
    }

    #[tokio::test]
    async fn test_wait_returns_empty_after_deadline() {
        let doc = PageFixture::new("https://r.test/").build();
        let started = std::time::Instant::now();
        let found = fast().wait_for(&doc, "#missing", false, None).await.unwrap();
        assert!(found.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_sees_late_element() {
        let doc = PageFixture::new("https://r.test/").build();
        let writer = doc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let id = writer.append_child(ROOT, "div");
            writer.set_attribute(id, "id", "late");
        });
        let found = fast().wait_for(&doc, "#late", false, Some(1000)).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_keeps_document_order() {
        let doc = PageFixture::new("https://r.test/")
            .element(ElementFixture::new("p").text("a"))
            .element(ElementFixture::new("p").text("b"))
            .build();
        let resolver = fast();
        let all = resolver.wait_for(&doc, "p", true, None).await.unwrap();
        assert_eq!(all.iter().map(|e| e.own_text()).collect::<Vec<_>>(), vec!["a", "b"]);
        let one = resolver.wait_for(&doc, "p", false, None).await.unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn test_offset_accumulates_across_frames() {
        let doc = PageFixture::new("https://r.test/")
            .viewport(800.0, 600.0)
            .element(
                ElementFixture::new("iframe")
                    .id("a")
                    .rect(10.0, 20.0, 400.0, 300.0)
                    .local_frame(
                        PageFixture::new("https://r.test/a").element(
                            ElementFixture::new("frame")
                                .id("b")
                                .rect(5.0, 7.0, 100.0, 100.0)
                                .local_frame(PageFixture::new("https://r.test/b")),
                        ),
                    ),
            )
            .build();
        let chain = SelectorChain::parse("#a|>#b|>span").unwrap();
        match fast()
            .resolve_chain(&doc, &chain, FrameOffset::default(), true)
            .await
            .unwrap()
        {
            ChainResolution::Local {
                document,
                hops,
                offset,
                target,
            } => {
                assert_eq!(document.url(), "https://r.test/b");
                assert_eq!(hops, 2);
                assert_eq!(target, "span");
                assert_eq!(offset.x, 15.0);
                assert_eq!(offset.y, 27.0);
                assert_eq!(offset.window_width, Some(800.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_frame_reports_prefix() {
        let doc = PageFixture::new("https://r.test/")
            .element(ElementFixture::new("iframe").id("a").local_frame(PageFixture::new("x")))
            .build();
        let chain = SelectorChain::parse("#a|>#nope|>span").unwrap();
        let err = fast()
            .resolve_chain(&doc, &chain, FrameOffset::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::IframeNotFound { ref selector } if selector == "#a|>#nope"));
    }
}
