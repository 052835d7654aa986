//! Policy Fallback Coordinator
//!
//! Decides per document whether inline script injection is permitted by its
//! content policy. When it is not, the caller's privileged path runs instead and
//! its value comes back as `{isBlocked: true, value}`.

use crate::dom::Document;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::debug;

/// Parsed content policy: directive name to source list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentPolicy {
    directives: Vec<(String, Vec<String>)>,
}

impl ContentPolicy {
    pub fn parse(raw: &str) -> Self {
        let directives = raw
            .split(';')
            .filter_map(|directive| {
                let mut parts = directive.split_whitespace();
                let name = parts.next()?.to_ascii_lowercase();
                let sources = parts.map(|s| s.to_ascii_lowercase()).collect();
                Some((name, sources))
            })
            .collect();
        Self { directives }
    }

    /// First occurrence wins, as browsers ignore repeated directives.
    pub fn directive(&self, name: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(directive, _)| directive == name)
            .map(|(_, sources)| sources.as_slice())
    }

    /// `script-src` (or `default-src` when absent) without `'unsafe-inline'`.
    ///
    /// `'unsafe-inline'` is ignored when a nonce or hash source is present.
    pub fn blocks_inline_scripts(&self) -> bool {
        let Some(sources) = self
            .directive("script-src")
            .or_else(|| self.directive("default-src"))
        else {
            return false;
        };
        let allows_inline = sources.iter().any(|s| s == "'unsafe-inline'");
        let has_nonce_or_hash = sources.iter().any(|s| {
            s.starts_with("'nonce-")
                || s.starts_with("'sha256-")
                || s.starts_with("'sha384-")
                || s.starts_with("'sha512-")
        });
        !allows_inline || has_nonce_or_hash
    }
}

/// `{isBlocked, value}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOutcome<T> {
    pub is_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
}

impl<T> PolicyOutcome<T> {
    pub fn allowed() -> Self {
        Self {
            is_blocked: false,
            value: None,
        }
    }

    pub fn blocked(value: T) -> Self {
        Self {
            is_blocked: true,
            value: Some(value),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyFallbackCoordinator;

impl PolicyFallbackCoordinator {
    pub fn new() -> Self {
        Self
    }

    pub fn blocks_injection(&self, document: &Document) -> bool {
        document
            .content_policy()
            .map(|raw| ContentPolicy::parse(&raw).blocks_inline_scripts())
            .unwrap_or(false)
    }

    /// Runs `fallback` only when the document blocks injection. Exactly one of
    /// the two paths executes: the fallback here, or normal injection by the
    /// caller after an `allowed` outcome.
    pub async fn check_and_inject<T, E, F, Fut>(
        &self,
        document: &Document,
        fallback: F,
    ) -> Result<PolicyOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.blocks_injection(document) {
            return Ok(PolicyOutcome::allowed());
        }
        debug!(url = %document.url(), "Inline scripts blocked by content policy; using privileged path");
        let value = fallback().await?;
        Ok(PolicyOutcome::blocked(value))
    }
}
