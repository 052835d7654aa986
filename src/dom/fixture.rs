//! Serializable page descriptions.
//!
//! Fixtures describe a page (and its frames) as JSON so the CLI and tests can build
//! documents without a browser. Remote frames are materialized by the caller,
//! which owns the runtime that serves them.

use super::{DeclaredStyle, Document, FrameContent, NodeId, Rect, Viewport, ROOT};
use crate::relay::window::WindowHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageFixture {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_policy: Option<String>,
    #[serde(default)]
    pub elements: Vec<ElementFixture>,
}

fn default_url() -> String {
    "about:blank".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementFixture {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub style: DeclaredStyle,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default)]
    pub children: Vec<ElementFixture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameFixture>,
}

/// Content of a frame element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameFixture {
    /// Cross-boundary frames are only reachable through the relay.
    #[serde(default)]
    pub remote: bool,
    pub page: Box<PageFixture>,
}

impl PageFixture {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn viewport(mut self, width: f64, height: f64) -> Self {
        self.viewport = Viewport { width, height };
        self
    }

    pub fn content_policy(mut self, policy: impl Into<String>) -> Self {
        self.content_policy = Some(policy.into());
        self
    }

    pub fn element(mut self, element: ElementFixture) -> Self {
        self.elements.push(element);
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Builds a document whose frames are all local. Remote frames are built local too.
    pub fn build(&self) -> Document {
        self.build_with(&mut |page| FrameContent::Local(page.build()))
    }

    /// Builds a document, delegating remote frames to `remote`.
    pub fn build_remote(&self, remote: &mut dyn FnMut(&PageFixture) -> WindowHandle) -> Document {
        self.build_with(&mut |page| FrameContent::Remote(remote(page)))
    }

    fn build_with(&self, remote: &mut dyn FnMut(&PageFixture) -> FrameContent) -> Document {
        let document = Document::new(self.url.clone(), self.viewport);
        document.set_content_policy(self.content_policy.clone());
        for element in &self.elements {
            element.attach(&document, ROOT, remote);
        }
        document
    }
}

impl ElementFixture {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn id(self, id: &str) -> Self {
        self.attr("id", id)
    }

    pub fn class(self, class: &str) -> Self {
        self.attr("class", class)
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn rect(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.rect = Rect::new(x, y, width, height);
        self
    }

    pub fn display(mut self, display: &str) -> Self {
        self.style.display = Some(display.to_string());
        self
    }

    pub fn visibility(mut self, visibility: &str) -> Self {
        self.style.visibility = Some(visibility.to_string());
        self
    }

    pub fn child(mut self, child: ElementFixture) -> Self {
        self.children.push(child);
        self
    }

    pub fn local_frame(mut self, page: PageFixture) -> Self {
        self.frame = Some(FrameFixture {
            remote: false,
            page: Box::new(page),
        });
        self
    }

    pub fn remote_frame(mut self, page: PageFixture) -> Self {
        self.frame = Some(FrameFixture {
            remote: true,
            page: Box::new(page),
        });
        self
    }

    fn attach(
        &self,
        document: &Document,
        parent: NodeId,
        remote: &mut dyn FnMut(&PageFixture) -> FrameContent,
    ) -> NodeId {
        let id = document.append_child(parent, &self.tag);
        for (name, value) in &self.attributes {
            document.set_attribute(id, name, value);
        }
        document.set_text(id, &self.text);
        document.set_style(id, self.style.clone());
        document.set_rect(id, self.rect);
        if let Some(frame) = &self.frame {
            let content = if frame.remote {
                remote(&frame.page)
            } else {
                FrameContent::Local(frame.page.build_with(remote))
            };
            document.set_frame(id, content);
        }
        for child in &self.children {
            child.attach(document, id, remote);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_local_frames_build() {
        let page = PageFixture::new("https://top.test/").element(
            ElementFixture::new("iframe")
                .id("outer")
                .rect(10.0, 20.0, 300.0, 200.0)
                .local_frame(
                    PageFixture::new("https://top.test/outer")
                        .element(ElementFixture::new("button").class("submit").text("Go")),
                ),
        );
        let doc = page.build();
        let outer = doc.element_by_id("outer").unwrap();
        assert!(outer.is_frame());
        match outer.content_frame() {
            Some(FrameContent::Local(inner)) => {
                assert_eq!(inner.url(), "https://top.test/outer");
                assert_eq!(inner.elements()[0].inner_text(), "Go");
            }
            other => panic!("unexpected frame content {other:?}"),
        }
    }

    #[test]
    fn test_fixture_from_json() {
        let raw = r#"{
            "url": "https://json.test/",
            "contentPolicy": "script-src 'self'",
            "elements": [
                {"tag": "div", "attributes": {"id": "box"}, "style": {"visibility": "hidden"},
                 "rect": {"x": 1, "y": 2, "width": 3, "height": 4}}
            ]
        }"#;
        let page = PageFixture::from_json(raw).unwrap();
        let doc = page.build();
        let el = doc.element_by_id("box").unwrap();
        assert_eq!(el.bounding_rect(), Rect::new(1.0, 2.0, 3.0, 4.0));
        assert!(el.computed_style().is_hidden());
        assert_eq!(doc.content_policy().as_deref(), Some("script-src 'self'"));
    }
}
