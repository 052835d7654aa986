//! Execution contexts and their page artifacts.

use super::bridge::Bridge;
use super::LoadedPreload;
use crate::dom::{Document, NodeId, ROOT};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Script elements added to the page for one execution.
#[derive(Debug)]
pub struct InjectionHandle {
    document: Document,
    code: NodeId,
    preloads: Vec<(NodeId, bool)>,
}

impl InjectionHandle {
    /// Appends preload scripts and then the code artifact `artifact_id` to the
    /// body (or the document root when there is none).
    pub fn inject(document: &Document, artifact_id: &str, code: &str, preloads: &[LoadedPreload]) -> Self {
        let parent = document
            .top_level()
            .into_iter()
            .flat_map(|el| {
                let mut found = vec![el.clone()];
                found.extend(el.children());
                found
            })
            .find(|el| el.tag_name() == "body")
            .map(|el| el.node_id())
            .unwrap_or(ROOT);

        let preloads = preloads
            .iter()
            .map(|preload| {
                let node = document.append_child(parent, "script");
                document.set_attribute(node, "id", &preload.id);
                document.set_text(node, &preload.script);
                (node, preload.remove_after_exec)
            })
            .collect();

        let code_node = document.append_child(parent, "script");
        document.set_attribute(code_node, "id", artifact_id);
        document.set_text(code_node, code);

        Self {
            document: document.clone(),
            code: code_node,
            preloads,
        }
    }

    /// Removes the code artifact and the preloads flagged for removal.
    fn remove(&self) {
        self.document.remove(self.code);
        for (node, remove_after_exec) in &self.preloads {
            if *remove_after_exec {
                self.document.remove(*node);
            }
        }
    }
}

/// A sandbox plus the bridge wired to it, alive for one execution.
pub struct IsolatedExecutionContext {
    bridge: Arc<Bridge>,
    injection: Option<InjectionHandle>,
    torn_down: AtomicBool,
}

impl IsolatedExecutionContext {
    pub fn new(bridge: Arc<Bridge>, injection: Option<InjectionHandle>) -> Self {
        Self {
            bridge,
            injection,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        self.bridge.id()
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Removes artifacts and kills the bridge. Safe to call more than once;
    /// returns whether this call did the work.
    pub fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(injection) = &self.injection {
            injection.remove();
        }
        self.bridge.tear_down();
        debug!(context_id = %self.id(), "Execution context torn down");
        true
    }
}

/// Live execution contexts keyed by id.
#[derive(Clone, Default)]
pub struct ContextRegistry {
    contexts: Arc<Mutex<HashMap<String, Arc<IsolatedExecutionContext>>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, context: Arc<IsolatedExecutionContext>) {
        self.contexts.lock().insert(context.id().to_string(), context);
    }

    pub fn get(&self, id: &str) -> Option<Arc<IsolatedExecutionContext>> {
        self.contexts.lock().get(id).cloned()
    }

    /// Tears down and forgets `id`.
    pub fn remove(&self, id: &str) -> bool {
        let context = self.contexts.lock().remove(id);
        match context {
            Some(context) => {
                context.teardown();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::dom::fixture::{ElementFixture, PageFixture};
    use crate::sandbox::bridge::CompletionRoute;
    use serde_json::json;

    fn preload(id: &str, remove_after_exec: bool) -> LoadedPreload {
        LoadedPreload {
            id: id.to_string(),
            script: "var x = 1;".to_string(),
            remove_after_exec,
        }
    }

    #[test]
    fn test_teardown_removes_flagged_artifacts_once() {
        let document = PageFixture::new("https://a.test/")
            .element(ElementFixture::new("html").child(ElementFixture::new("body")))
            .build();
        let injection = InjectionHandle::inject(
            &document,
            "scriptb1",
            "turiumNextBlock()",
            &[preload("turium-script-keep", false), preload("turium-script-drop", true)],
        );
        let body = document.element_by_id("scriptb1").unwrap().parent().unwrap();
        assert_eq!(body.tag_name(), "body");

        let bridge = Arc::new(Bridge::new(
            "b1",
            json!({}),
            CompletionRoute::Privileged(Dispatcher::new()),
            None,
        ));
        let context = IsolatedExecutionContext::new(bridge.clone(), Some(injection));
        assert!(context.teardown());
        assert!(!context.teardown());
        assert!(bridge.is_torn_down());

        assert!(document.element_by_id("scriptb1").is_none());
        assert!(document.element_by_id("turium-script-drop").is_none());
        assert!(document.element_by_id("turium-script-keep").is_some());
    }

    #[test]
    fn test_inject_without_body_uses_root() {
        let document = Document::new("about:blank", Default::default());
        InjectionHandle::inject(&document, "scriptx", "1", &[]);
        let script = document.element_by_id("scriptx").unwrap();
        assert!(script.parent().is_none());
    }

    #[test]
    fn test_registry_remove_tears_down() {
        let registry = ContextRegistry::new();
        let bridge = Arc::new(Bridge::new(
            "c1",
            json!({}),
            CompletionRoute::Privileged(Dispatcher::new()),
            None,
        ));
        registry.insert(Arc::new(IsolatedExecutionContext::new(bridge.clone(), None)));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("c1").is_some());
        assert!(registry.remove("c1"));
        assert!(!registry.remove("c1"));
        assert!(bridge.is_torn_down());
        assert!(registry.is_empty());
    }
}
