//! Condition Evaluator
//!
//! Element conditions look at one element (whose absence is a valid answer, not
//! an error). Code conditions run caller code once through the execution
//! protocol and use its return value.

use crate::dom::{Document, Element};
use crate::error::BlockError;
use crate::sandbox::{ExecutionProtocol, ExecutionRequest};
use crate::selector::SelectorResolver;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementCondition {
    Exists,
    NotExists,
    Text,
    VisibleScreen,
    Visible,
    Invisible,
    Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    Element(ElementCondition),
    Code,
    /// Any other namespace; evaluates to `null` without looking at the page.
    Unsupported,
}

impl ConditionType {
    /// Parses `element#<op>` or `code` / `code#<anything>`.
    ///
    /// An unknown `element` operation is `UnknownCondition`; an unknown namespace
    /// parses as `Unsupported`.
    pub fn parse(tag: &str) -> Result<Self, BlockError> {
        let (namespace, op) = match tag.split_once('#') {
            Some((namespace, op)) => (namespace, Some(op)),
            None => (tag, None),
        };
        let unknown = || BlockError::UnknownCondition(tag.to_string());
        match namespace {
            "code" => Ok(ConditionType::Code),
            "element" => {
                let op = match op.ok_or_else(unknown)? {
                    "exists" => ElementCondition::Exists,
                    "notExists" => ElementCondition::NotExists,
                    "text" => ElementCondition::Text,
                    "visibleScreen" => ElementCondition::VisibleScreen,
                    "visible" => ElementCondition::Visible,
                    "invisible" => ElementCondition::Invisible,
                    "attribute" => ElementCondition::Attribute,
                    _ => return Err(unknown()),
                };
                Ok(ConditionType::Element(op))
            }
            _ => Ok(ConditionType::Unsupported),
        }
    }
}

/// `boolean | text | null`, plus any other JSON a code condition returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionResult {
    Bool(bool),
    Text(String),
    Null,
    Value(Value),
}

impl From<Value> for ConditionResult {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => ConditionResult::Bool(b),
            Value::String(s) => ConditionResult::Text(s),
            Value::Null => ConditionResult::Null,
            other => ConditionResult::Value(other),
        }
    }
}

impl From<ConditionResult> for Value {
    fn from(result: ConditionResult) -> Self {
        match result {
            ConditionResult::Bool(b) => Value::Bool(b),
            ConditionResult::Text(s) => Value::String(s),
            ConditionResult::Null => Value::Null,
            ConditionResult::Value(v) => v,
        }
    }
}

fn on_screen(element: &Element) -> bool {
    let rect = element.bounding_rect();
    rect.has_area() && rect.intersects(&element.document().viewport())
}

impl ElementCondition {
    pub fn evaluate(&self, element: Option<&Element>, attr_name: Option<&str>) -> ConditionResult {
        match self {
            ElementCondition::Exists => ConditionResult::Bool(element.is_some()),
            ElementCondition::NotExists => ConditionResult::Bool(element.is_none()),
            ElementCondition::Text => match element {
                Some(el) => ConditionResult::Text(el.inner_text()),
                None => ConditionResult::Null,
            },
            ElementCondition::VisibleScreen => ConditionResult::Bool(element.map(on_screen).unwrap_or(false)),
            ElementCondition::Visible => ConditionResult::Bool(
                element
                    .map(|el| !el.computed_style().is_hidden() && on_screen(el))
                    .unwrap_or(false),
            ),
            ElementCondition::Invisible => ConditionResult::Bool(
                element
                    .map(|el| el.computed_style().is_hidden() || !on_screen(el))
                    .unwrap_or(false),
            ),
            ElementCondition::Attribute => element
                .zip(attr_name)
                .and_then(|(el, name)| el.attribute(name))
                .map(ConditionResult::Text)
                .unwrap_or(ConditionResult::Null),
        }
    }
}

/// Payload of a `conditions` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub attr_name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    /// `website` (default) or `background`.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub wait_for_selector: bool,
    #[serde(default)]
    pub wait_selector_timeout: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone)]
pub struct ConditionEvaluator {
    resolver: SelectorResolver,
    protocol: ExecutionProtocol,
}

impl ConditionEvaluator {
    pub fn new(resolver: SelectorResolver, protocol: ExecutionProtocol) -> Self {
        Self { resolver, protocol }
    }

    /// Evaluates `request` against `document`, where `request.selector` is already
    /// local to it. Only code conditions can fail with a script error.
    pub async fn evaluate(
        &self,
        document: Option<&Document>,
        request: &ConditionRequest,
        ref_data: &Value,
    ) -> Result<ConditionResult, BlockError> {
        match ConditionType::parse(&request.kind)? {
            ConditionType::Element(op) => {
                let document = document.ok_or(BlockError::NoTab)?;
                let selector = request.selector.as_deref().unwrap_or_default();
                let wait_ms = if request.wait_for_selector {
                    request.wait_selector_timeout
                } else {
                    Some(0)
                };
                let element = self.resolver.find_one(document, selector, wait_ms).await?;
                let result = op.evaluate(element.as_ref(), request.attr_name.as_deref());
                debug!(condition = %request.kind, selector, result = ?result, "Element condition evaluated");
                Ok(result)
            }
            ConditionType::Code => {
                let code = request.code.clone().unwrap_or_default();
                let execution = ExecutionRequest {
                    code,
                    ref_data: ref_data.clone(),
                    timeout_ms: request.timeout_ms,
                    background: request.context.as_deref() == Some("background"),
                    ..ExecutionRequest::default()
                };
                let value = self.protocol.evaluate(document, execution).await?;
                Ok(ConditionResult::from(value))
            }
            ConditionType::Unsupported => {
                debug!(condition = %request.kind, "Unsupported condition namespace; answering null");
                Ok(ConditionResult::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fixture::{ElementFixture, PageFixture};
    use crate::sandbox::SandboxConfig;
    use crate::selector::ResolverConfig;
    use serde_json::json;

    fn page() -> Document {
        PageFixture::new("https://c.test/")
            .viewport(800.0, 600.0)
            .element(ElementFixture::new("div").id("shown").text("Hello").rect(10.0, 10.0, 100.0, 20.0))
            .element(
                ElementFixture::new("div")
                    .id("hidden")
                    .attr("data-state", "off")
                    .visibility("hidden")
                    .rect(10.0, 40.0, 100.0, 20.0),
            )
            .element(ElementFixture::new("div").id("below").rect(0.0, 900.0, 100.0, 20.0))
            .build()
    }

    #[test]
    fn test_parse_condition_types() {
        assert_eq!(
            ConditionType::parse("element#visibleScreen").unwrap(),
            ConditionType::Element(ElementCondition::VisibleScreen)
        );
        assert_eq!(ConditionType::parse("code#js").unwrap(), ConditionType::Code);
        assert!(matches!(
            ConditionType::parse("element#glows"),
            Err(BlockError::UnknownCondition(_))
        ));
        assert_eq!(ConditionType::parse("data#x").unwrap(), ConditionType::Unsupported);
    }

    #[test]
    fn test_missing_element_answers() {
        use ElementCondition::*;
        assert_eq!(Exists.evaluate(None, None), ConditionResult::Bool(false));
        assert_eq!(NotExists.evaluate(None, None), ConditionResult::Bool(true));
        assert_eq!(Text.evaluate(None, None), ConditionResult::Null);
        assert_eq!(Visible.evaluate(None, None), ConditionResult::Bool(false));
        assert_eq!(Invisible.evaluate(None, None), ConditionResult::Bool(false));
        assert_eq!(VisibleScreen.evaluate(None, None), ConditionResult::Bool(false));
        assert_eq!(Attribute.evaluate(None, Some("id")), ConditionResult::Null);
    }

    #[test]
    fn test_visibility_rules() {
        use ElementCondition::*;
        let doc = page();
        let shown = doc.element_by_id("shown").unwrap();
        let hidden = doc.element_by_id("hidden").unwrap();
        let below = doc.element_by_id("below").unwrap();

        assert_eq!(Visible.evaluate(Some(&shown), None), ConditionResult::Bool(true));
        assert_eq!(Invisible.evaluate(Some(&shown), None), ConditionResult::Bool(false));
        assert_eq!(Visible.evaluate(Some(&hidden), None), ConditionResult::Bool(false));
        assert_eq!(Invisible.evaluate(Some(&hidden), None), ConditionResult::Bool(true));
        assert_eq!(VisibleScreen.evaluate(Some(&below), None), ConditionResult::Bool(false));
        assert_eq!(Invisible.evaluate(Some(&below), None), ConditionResult::Bool(true));
    }

    #[test]
    fn test_attribute_null_causes() {
        let doc = page();
        let hidden = doc.element_by_id("hidden").unwrap();
        assert_eq!(
            ElementCondition::Attribute.evaluate(Some(&hidden), Some("data-state")),
            ConditionResult::Text("off".into())
        );
        assert_eq!(
            ElementCondition::Attribute.evaluate(Some(&hidden), Some("data-missing")),
            ConditionResult::Null
        );
    }

    #[test]
    fn test_result_serializes_untagged() {
        assert_eq!(serde_json::to_value(ConditionResult::Null).unwrap(), Value::Null);
        assert_eq!(serde_json::to_value(ConditionResult::Bool(true)).unwrap(), json!(true));
        assert_eq!(ConditionResult::from(json!([1])), ConditionResult::Value(json!([1])));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_evaluator_element_and_code() {
        let evaluator = ConditionEvaluator::new(
            SelectorResolver::new(ResolverConfig::default()),
            ExecutionProtocol::with_defaults(SandboxConfig::default()),
        );
        let doc = page();

        let text = ConditionRequest {
            kind: "element#text".into(),
            selector: Some("#shown".into()),
            ..ConditionRequest::default()
        };
        assert_eq!(
            evaluator.evaluate(Some(&doc), &text, &json!({})).await.unwrap(),
            ConditionResult::Text("Hello".into())
        );

        let code = ConditionRequest {
            kind: "code".into(),
            code: Some("throw new Error('condition exploded')".into()),
            ..ConditionRequest::default()
        };
        let err = evaluator.evaluate(Some(&doc), &code, &json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "condition exploded");
    }
}
