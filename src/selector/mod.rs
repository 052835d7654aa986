//! Selector chains
//!
//! A chain is a `|>`-delimited sequence of selectors. Every segment but the last
//! addresses a frame element; the last addresses the target inside the innermost
//! frame. Each segment is either a structural (CSS subset) or path-style (XPath
//! subset) query, detected from its leading characters.

pub mod css;
pub mod resolver;
pub mod xpath;

use crate::dom::{Document, Element};
use crate::error::BlockError;
use serde::{Deserialize, Serialize};

pub use css::CssSelector;
pub use resolver::{ChainResolution, ResolverConfig, SelectorResolver};
pub use xpath::XPath;

/// Delimiter between frame segments of a chain.
pub const FRAME_DELIMITER: &str = "|>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectorKind {
    CssSelector,
    Xpath,
}

impl SelectorKind {
    /// Leading `/`, `//`, `(/` or `(//` means a path expression.
    pub fn detect(selector: &str) -> Self {
        let trimmed = selector.trim_start();
        if trimmed.starts_with('/') || trimmed.starts_with("(/") {
            SelectorKind::Xpath
        } else {
            SelectorKind::CssSelector
        }
    }
}

/// Runs one selector segment against a document, in document order.
pub fn query(document: &Document, selector: &str) -> Result<Vec<Element>, BlockError> {
    match SelectorKind::detect(selector) {
        SelectorKind::Xpath => Ok(XPath::parse(selector)?.evaluate(document)),
        SelectorKind::CssSelector => Ok(CssSelector::parse(selector)?.query_all(document)),
    }
}

/// A parsed, non-empty selector chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorChain {
    segments: Vec<String>,
}

impl SelectorChain {
    pub fn parse(raw: &str) -> Result<Self, BlockError> {
        let segments: Vec<String> = raw
            .split(FRAME_DELIMITER)
            .map(|segment| segment.trim().to_string())
            .collect();
        if segments.iter().any(String::is_empty) {
            return Err(BlockError::InvalidSelector(raw.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Segments addressing frame elements, outermost first.
    pub fn frames(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    pub fn target(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Number of frame boundaries the chain crosses.
    pub fn hops(&self) -> usize {
        self.segments.len() - 1
    }

    pub fn is_framed(&self) -> bool {
        self.hops() > 0
    }

    /// The first `count` segments joined back into chain form.
    pub fn prefix(&self, count: usize) -> String {
        self.segments[..count.min(self.segments.len())].join(FRAME_DELIMITER)
    }

    /// Segments from `start` onward joined back into chain form.
    pub fn remainder(&self, start: usize) -> String {
        self.segments[start.min(self.segments.len())..].join(FRAME_DELIMITER)
    }
}

impl std::fmt::Display for SelectorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join(FRAME_DELIMITER))
    }
}
