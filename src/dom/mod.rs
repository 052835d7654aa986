//! In-memory document model
//!
//! A `Document` is a shared node arena describing one host page or frame: element
//! tree, declared style, layout boxes, the viewport and the page's content policy.
//! Frame elements carry their content either in-process (`FrameContent::Local`) or
//! behind a message channel (`FrameContent::Remote`). The model also keeps the
//! page-scoped event log and listener table used by injected code.

pub mod fixture;

use crate::relay::window::WindowHandle;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Index of a node in its document's arena.
pub type NodeId = usize;

/// Axis-aligned layout box relative to the document's viewport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    /// True when any part of the box overlaps the viewport.
    pub fn intersects(&self, viewport: &Viewport) -> bool {
        self.has_area()
            && self.x < viewport.width
            && self.y < viewport.height
            && self.x + self.width > 0.0
            && self.y + self.height > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280.0,
            height: 720.0,
        }
    }
}

/// Style properties set on the element itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclaredStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

/// Resolved style after inheritance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedStyle {
    pub display: String,
    pub visibility: String,
}

impl ComputedStyle {
    pub fn is_hidden(&self) -> bool {
        self.visibility == "hidden" || self.display == "none"
    }
}

/// Content behind a frame element.
#[derive(Clone, Debug)]
pub enum FrameContent {
    /// Same-context document, readable in-process.
    Local(Document),
    /// Cross-boundary window, reachable only through messages.
    Remote(WindowHandle),
}

/// Event dispatched on the page (e.g. a completion signal from injected code).
#[derive(Debug, Clone, PartialEq)]
pub struct PageEvent {
    pub name: String,
    pub detail: Value,
}

type Listener = Arc<dyn Fn(&PageEvent) + Send + Sync>;

/// Most recent page events kept for inspection; older ones are dropped.
pub const EVENT_LOG_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Node {
    tag: String,
    attributes: Vec<(String, String)>,
    text: String,
    style: DeclaredStyle,
    rect: Rect,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    frame: Option<FrameContent>,
}

impl Node {
    fn new(tag: &str, parent: Option<NodeId>) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
            text: String::new(),
            style: DeclaredStyle::default(),
            rect: Rect::default(),
            parent,
            children: Vec::new(),
            frame: None,
        }
    }
}

struct DocumentState {
    url: String,
    viewport: Viewport,
    content_policy: Option<String>,
    nodes: Vec<Node>,
    events: VecDeque<PageEvent>,
    /// Event name to `(owner, listener)` pairs.
    listeners: HashMap<String, Vec<(String, Listener)>>,
}

/// Shared handle to one document. Clones refer to the same document.
#[derive(Clone)]
pub struct Document {
    state: Arc<RwLock<DocumentState>>,
    content_reads: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Document")
            .field("url", &state.url)
            .field("nodes", &state.nodes.len())
            .finish()
    }
}

/// Id of the synthetic document root; top-level elements are its children.
pub const ROOT: NodeId = 0;

impl Document {
    pub fn new(url: impl Into<String>, viewport: Viewport) -> Self {
        Self {
            state: Arc::new(RwLock::new(DocumentState {
                url: url.into(),
                viewport,
                content_policy: None,
                nodes: vec![Node::new("#document", None)],
                events: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
                listeners: HashMap::new(),
            })),
            content_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ptr_eq(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn url(&self) -> String {
        self.state.read().url.clone()
    }

    pub fn viewport(&self) -> Viewport {
        self.state.read().viewport
    }

    pub fn content_policy(&self) -> Option<String> {
        self.state.read().content_policy.clone()
    }

    pub fn set_content_policy(&self, policy: Option<String>) {
        self.state.write().content_policy = policy;
    }

    /// Number of times a frame element's content document was read.
    pub fn content_reads(&self) -> usize {
        self.content_reads.load(Ordering::SeqCst)
    }

    pub fn append_child(&self, parent: NodeId, tag: &str) -> NodeId {
        let mut state = self.state.write();
        let id = state.nodes.len();
        state.nodes.push(Node::new(tag, Some(parent)));
        if let Some(node) = state.nodes.get_mut(parent) {
            node.children.push(id);
        }
        id
    }

    /// Detaches a node from the tree. The arena slot is kept so handles stay valid.
    pub fn remove(&self, id: NodeId) -> bool {
        let mut state = self.state.write();
        let Some(parent) = state.nodes.get(id).and_then(|n| n.parent) else {
            return false;
        };
        if let Some(parent_node) = state.nodes.get_mut(parent) {
            parent_node.children.retain(|child| *child != id);
        }
        if let Some(node) = state.nodes.get_mut(id) {
            node.parent = None;
        }
        true
    }

    pub fn set_attribute(&self, id: NodeId, name: &str, value: &str) {
        let mut state = self.state.write();
        if let Some(node) = state.nodes.get_mut(id) {
            let name = name.to_ascii_lowercase();
            match node.attributes.iter_mut().find(|(k, _)| *k == name) {
                Some(entry) => entry.1 = value.to_string(),
                None => node.attributes.push((name, value.to_string())),
            }
        }
    }

    pub fn set_text(&self, id: NodeId, text: &str) {
        if let Some(node) = self.state.write().nodes.get_mut(id) {
            node.text = text.to_string();
        }
    }

    pub fn set_style(&self, id: NodeId, style: DeclaredStyle) {
        if let Some(node) = self.state.write().nodes.get_mut(id) {
            node.style = style;
        }
    }

    pub fn set_rect(&self, id: NodeId, rect: Rect) {
        if let Some(node) = self.state.write().nodes.get_mut(id) {
            node.rect = rect;
        }
    }

    pub fn set_frame(&self, id: NodeId, content: FrameContent) {
        if let Some(node) = self.state.write().nodes.get_mut(id) {
            node.frame = Some(content);
        }
    }

    pub fn element(&self, id: NodeId) -> Element {
        Element {
            document: self.clone(),
            id,
        }
    }

    /// All attached elements in document order.
    pub fn elements(&self) -> Vec<Element> {
        let state = self.state.read();
        let mut order = Vec::new();
        let mut stack: Vec<NodeId> = state.nodes[ROOT].children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(state.nodes[id].children.iter().rev().copied());
        }
        drop(state);
        order.into_iter().map(|id| self.element(id)).collect()
    }

    pub fn element_by_id(&self, id_attr: &str) -> Option<Element> {
        self.elements()
            .into_iter()
            .find(|el| el.attribute("id").as_deref() == Some(id_attr))
    }

    pub fn top_level(&self) -> Vec<Element> {
        self.children_of(ROOT)
    }

    fn children_of(&self, id: NodeId) -> Vec<Element> {
        let ids = self
            .state
            .read()
            .nodes
            .get(id)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        ids.into_iter().map(|id| self.element(id)).collect()
    }

    /// Registers `handler` for `name` on behalf of `owner` unless that owner
    /// already has one. Returns whether this call installed it.
    pub fn ensure_listener(
        &self,
        name: &str,
        owner: &str,
        handler: impl Fn(&PageEvent) + Send + Sync + 'static,
    ) -> bool {
        let mut state = self.state.write();
        let entries = state.listeners.entry(name.to_string()).or_default();
        if entries.iter().any(|(existing, _)| existing == owner) {
            return false;
        }
        entries.push((owner.to_string(), Arc::new(handler)));
        true
    }

    pub fn remove_listener(&self, name: &str, owner: &str) -> bool {
        let mut state = self.state.write();
        let Some(entries) = state.listeners.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| existing != owner);
        let removed = entries.len() != before;
        if entries.is_empty() {
            state.listeners.remove(name);
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.state.read().listeners.values().map(Vec::len).sum()
    }

    /// Records the event and runs every listener registered for it.
    pub fn dispatch_event(&self, name: &str, detail: Value) {
        let event = PageEvent {
            name: name.to_string(),
            detail,
        };
        let listeners: Vec<Listener> = {
            let mut state = self.state.write();
            if state.events.len() == EVENT_LOG_CAPACITY {
                state.events.pop_front();
            }
            state.events.push_back(event.clone());
            state
                .listeners
                .get(name)
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(&event);
        }
    }

    /// The most recent events, oldest first.
    pub fn events(&self) -> Vec<PageEvent> {
        self.state.read().events.iter().cloned().collect()
    }
}

/// Handle to one element of a document.
#[derive(Clone, Debug)]
pub struct Element {
    document: Document,
    id: NodeId,
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.document.ptr_eq(&other.document)
    }
}

impl Element {
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.document.state.read().nodes.get(self.id).map(f)
    }

    pub fn tag_name(&self) -> String {
        self.with_node(|n| n.tag.clone()).unwrap_or_default()
    }

    pub fn is_frame(&self) -> bool {
        matches!(self.tag_name().as_str(), "iframe" | "frame")
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        self.with_node(|n| {
            n.attributes
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
        })
        .flatten()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn attributes(&self) -> Vec<(String, String)> {
        self.with_node(|n| n.attributes.clone()).unwrap_or_default()
    }

    pub fn set_attribute(&self, name: &str, value: &str) {
        self.document.set_attribute(self.id, name, value);
    }

    pub fn classes(&self) -> Vec<String> {
        self.attribute("class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Text set directly on this element, excluding descendants.
    pub fn own_text(&self) -> String {
        self.with_node(|n| n.text.clone()).unwrap_or_default()
    }

    /// Rendered text: own and descendant text, skipping `display: none` subtrees.
    pub fn inner_text(&self) -> String {
        let mut parts = Vec::new();
        self.collect_text(&mut parts);
        parts.join(" ")
    }

    fn collect_text(&self, parts: &mut Vec<String>) {
        let (text, display_none) = self
            .with_node(|n| (n.text.clone(), n.style.display.as_deref() == Some("none")))
            .unwrap_or_default();
        if display_none {
            return;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
        for child in self.children() {
            child.collect_text(parts);
        }
    }

    pub fn parent(&self) -> Option<Element> {
        let parent = self.with_node(|n| n.parent).flatten()?;
        if parent == ROOT {
            None
        } else {
            Some(self.document.element(parent))
        }
    }

    pub fn is_attached(&self) -> bool {
        let mut current = self.id;
        let state = self.document.state.read();
        while let Some(parent) = state.nodes.get(current).and_then(|n| n.parent) {
            if parent == ROOT {
                return true;
            }
            current = parent;
        }
        false
    }

    pub fn children(&self) -> Vec<Element> {
        self.document.children_of(self.id)
    }

    /// Siblings in document order, including this element.
    pub fn siblings(&self) -> Vec<Element> {
        let parent = self.with_node(|n| n.parent).flatten().unwrap_or(ROOT);
        self.document.children_of(parent)
    }

    pub fn computed_style(&self) -> ComputedStyle {
        let (style, parent) = self
            .with_node(|n| (n.style.clone(), n.parent))
            .unwrap_or_default();
        let inherited_visibility = parent
            .filter(|p| *p != ROOT)
            .map(|p| self.document.element(p).computed_style().visibility);
        ComputedStyle {
            display: style.display.unwrap_or_else(|| "block".to_string()),
            visibility: style
                .visibility
                .or(inherited_visibility)
                .unwrap_or_else(|| "visible".to_string()),
        }
    }

    pub fn bounding_rect(&self) -> Rect {
        self.with_node(|n| n.rect).unwrap_or_default()
    }

    /// Reads the frame's content. Only frame elements have content.
    pub fn content_frame(&self) -> Option<FrameContent> {
        self.document.content_reads.fetch_add(1, Ordering::SeqCst);
        self.with_node(|n| n.frame.clone()).flatten()
    }
}
