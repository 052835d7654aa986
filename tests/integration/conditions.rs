//! Condition blocks run through a tab

use serde_json::{json, Value};
use turium::block::{BlockReply, BlockRequest};
use turium::condition::{ConditionResult, ElementCondition};
use turium::content::Tab;
use turium::dom::fixture::{ElementFixture, PageFixture};
use turium::error::BlockError;

use super::test_utils::services;

fn storefront() -> PageFixture {
    PageFixture::new("https://shop.test/")
        .viewport(1024.0, 768.0)
        .element(
            ElementFixture::new("div")
                .id("banner")
                .attr("data-sale", "spring")
                .rect(0.0, 0.0, 1024.0, 80.0)
                .text("Spring sale"),
        )
        .element(
            ElementFixture::new("div")
                .id("modal")
                .display("none")
                .rect(100.0, 100.0, 400.0, 300.0),
        )
        .element(
            ElementFixture::new("footer")
                .id("footer")
                .rect(0.0, 2000.0, 1024.0, 100.0),
        )
        .element(
            ElementFixture::new("iframe")
                .id("cart")
                .rect(700.0, 100.0, 300.0, 400.0)
                .local_frame(
                    PageFixture::new("https://shop.test/cart")
                        .element(ElementFixture::new("span").id("count").text("3").rect(
                            0.0, 0.0, 20.0, 20.0,
                        )),
                ),
        )
}

async fn check(tab: &Tab, data: Value) -> Result<ConditionResult, BlockError> {
    match tab.run_block(BlockRequest::new("conditions", data)).await? {
        BlockReply::Done(value) => Ok(ConditionResult::from(value)),
        BlockReply::Forwarded => panic!("local conditions never forward"),
    }
}

#[tokio::test]
async fn test_element_conditions() {
    let tab = Tab::open(&storefront(), services());

    let cases = [
        (json!({ "type": "element#exists", "selector": "#banner" }), json!(true)),
        (json!({ "type": "element#notExists", "selector": "#ghost" }), json!(true)),
        (json!({ "type": "element#text", "selector": "#banner" }), json!("Spring sale")),
        (json!({ "type": "element#visible", "selector": "#banner" }), json!(true)),
        (json!({ "type": "element#invisible", "selector": "#modal" }), json!(true)),
        (json!({ "type": "element#visibleScreen", "selector": "#footer" }), json!(false)),
        (json!({ "type": "element#invisible", "selector": "#footer" }), json!(true)),
        (
            json!({ "type": "element#attribute", "selector": "#banner", "attrName": "data-sale" }),
            json!("spring"),
        ),
        (json!({ "type": "element#text", "selector": "#cart|>#count" }), json!("3")),
    ];
    for (request, expected) in cases {
        let result = check(&tab, request.clone()).await.unwrap();
        assert_eq!(Value::from(result), expected, "condition {}", request);
    }
}

#[tokio::test]
async fn test_missing_element_answers() {
    let tab = Tab::open(&storefront(), services());
    for kind in ["element#visible", "element#invisible", "element#visibleScreen"] {
        let result = check(&tab, json!({ "type": kind, "selector": "#ghost" }))
            .await
            .unwrap();
        assert_eq!(result, ConditionResult::Bool(false), "{}", kind);
    }
    let missing_el = check(
        &tab,
        json!({ "type": "element#attribute", "selector": "#ghost", "attrName": "id" }),
    )
    .await
    .unwrap();
    assert_eq!(missing_el, ConditionResult::Null);
    let missing_attr = check(
        &tab,
        json!({ "type": "element#attribute", "selector": "#banner", "attrName": "data-none" }),
    )
    .await
    .unwrap();
    assert_eq!(missing_attr, ConditionResult::Null);
    assert_eq!(
        ElementCondition::Attribute.evaluate(None, Some("id")),
        ConditionResult::Null
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_code_condition_reads_reference_data() {
    let tab = Tab::open(&storefront(), services());
    let mut block = BlockRequest::new(
        "conditions",
        json!({
            "type": "code",
            "code": "return turiumRefData('variables', 'stock') > 5;",
            "timeoutMs": 2000
        }),
    );
    block.ref_data = json!({ "variables": { "stock": 9 } });
    let value = match tab.run_block(block).await.unwrap() {
        BlockReply::Done(value) => value,
        BlockReply::Forwarded => Value::Null,
    };
    assert_eq!(value, json!(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_code_condition_failures() {
    let tab = Tab::open(&storefront(), services());

    let err = check(
        &tab,
        json!({ "type": "code", "code": "throw new Error('bad math');", "timeoutMs": 2000 }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "bad math");

    let err = check(
        &tab,
        json!({ "type": "code", "code": "await new Promise(() => {});", "timeoutMs": 200 }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BlockError::EvaluationTimeout(200)));
}

#[tokio::test]
async fn test_unknown_condition_type() {
    let tab = Tab::open(&storefront(), services());
    let err = check(&tab, json!({ "type": "element#sparkles", "selector": "#banner" }))
        .await
        .unwrap_err();
    assert!(matches!(err, BlockError::UnknownCondition(_)));

    let result = check(&tab, json!({ "type": "data#x", "selector": "#banner" }))
        .await
        .unwrap();
    assert_eq!(result, ConditionResult::Null);
}
