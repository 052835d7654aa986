//! Isolated code execution through the request/response protocol

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use turium::dispatch::Dispatcher;
use turium::dom::fixture::{ElementFixture, PageFixture};
use turium::dom::Document;
use turium::error::BlockError;
use turium::sandbox::bridge::CompletionRoute;
use turium::sandbox::context::InjectionHandle;
use turium::sandbox::{
    Bridge, ExecutionRequest, ExecutionResult, FetchRelay, IsolatedExecutionContext,
};

use super::test_utils::{protocol_with, RecordingFetcher};

fn page() -> Document {
    PageFixture::new("https://app.test/")
        .element(ElementFixture::new("html").child(ElementFixture::new("body")))
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_next_block_sum() {
    let protocol = protocol_with(Arc::new(RecordingFetcher::default()));
    let document = page();
    let result = protocol
        .execute(
            Some(&document),
            ExecutionRequest::new("sum", "turiumNextBlock(1 + 1)").with_timeout_ms(1000),
        )
        .await
        .unwrap();
    assert_eq!(result.columns.data, Some(json!(2)));
    assert_eq!(result.columns.insert, Some(json!(true)));
    assert!(document.element_by_id("scriptsum").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_protocols_share_one_page() {
    let first = protocol_with(Arc::new(RecordingFetcher::default()));
    let second = protocol_with(Arc::new(RecordingFetcher::default()));
    assert_ne!(first.id(), second.id());
    let document = page();

    let result = first
        .execute(
            Some(&document),
            ExecutionRequest::new("first", "turiumNextBlock('one')").with_timeout_ms(1000),
        )
        .await
        .unwrap();
    assert_eq!(result.columns.data, Some(json!("one")));

    let result = second
        .execute(
            Some(&document),
            ExecutionRequest::new("second", "turiumNextBlock('two')").with_timeout_ms(1000),
        )
        .await
        .unwrap();
    assert_eq!(result.columns.data, Some(json!("two")));
    assert_eq!(document.listener_count(), 2);
    assert!(first.completions().is_empty());
    assert!(second.completions().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_timeout_extends_deadline() {
    let protocol = protocol_with(Arc::new(RecordingFetcher::default()));
    let started = Instant::now();
    let result = protocol
        .execute(
            Some(&page()),
            ExecutionRequest::new(
                "slow",
                "const spin = (ms) => { const t = Date.now(); while (Date.now() - t < ms) {} };\n\
                 spin(250);\n\
                 turiumResetTimeout();\n\
                 spin(250);\n\
                 turiumNextBlock('late');",
            )
            .with_timeout_ms(400),
        )
        .await
        .unwrap();
    assert_eq!(result.columns.data, Some(json!("late")));
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_new_tab_completes_empty() {
    let protocol = protocol_with(Arc::new(RecordingFetcher::default()));
    let document = page();
    let mut request = ExecutionRequest::new(
        "tab",
        "if (typeof turiumNextBlock !== 'undefined') { throw new Error('full surface'); }\n\
         globalThis.seen = turiumRefData('variables', 'n');",
    )
    .with_ref_data(json!({ "variables": { "n": 1 } }))
    .with_timeout_ms(5000);
    request.every_new_tab = true;

    let started = Instant::now();
    let result = protocol.execute(Some(&document), request).await.unwrap();
    assert_eq!(result, ExecutionResult::empty());
    assert!(started.elapsed() < Duration::from_millis(5000));
    assert!(protocol.registry().is_empty());
    assert!(document.element_by_id("scripttab").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_yields_empty_result() {
    let protocol = protocol_with(Arc::new(RecordingFetcher::default()));
    let document = page();
    let started = Instant::now();
    let result = protocol
        .execute(
            Some(&document),
            ExecutionRequest::new(
                "stall",
                "await new Promise(() => {}); turiumNextBlock('never');",
            )
            .with_timeout_ms(200),
        )
        .await
        .unwrap();
    assert_eq!(result, ExecutionResult::empty());
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({ "variables": {}, "columns": {} })
    );
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(protocol.registry().is_empty());
    assert!(document.element_by_id("scriptstall").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_thrown_error_becomes_error_column() {
    let protocol = protocol_with(Arc::new(RecordingFetcher::default()));
    let result = protocol
        .execute(
            Some(&page()),
            ExecutionRequest::new("boom", "throw new Error('boom');").with_timeout_ms(1000),
        )
        .await
        .unwrap();
    assert_eq!(result.script_error().as_deref(), Some("boom"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reference_data_and_variables() {
    let protocol = protocol_with(Arc::new(RecordingFetcher::default()));
    let request = ExecutionRequest::new(
        "refs",
        "const name = turiumRefData('variables', 'user.name');\n\
         turiumSetVariable('greeting', 'hi ' + name);\n\
         turiumNextBlock({ rows: turiumRefData('table', '0.price') });",
    )
    .with_ref_data(json!({
        "variables": { "user": { "name": "Ada" } },
        "table": [{ "price": 12 }]
    }))
    .with_timeout_ms(1000);
    let result = protocol.execute(Some(&page()), request).await.unwrap();
    assert_eq!(result.variables["greeting"], json!("hi Ada"));
    assert_eq!(result.variables["user"]["name"], json!("Ada"));
    assert_eq!(result.columns.data, Some(json!({ "rows": 12 })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_background_runs_without_tab() {
    let protocol = protocol_with(Arc::new(RecordingFetcher::default()));
    let mut request = ExecutionRequest::new("bg", "turiumNextBlock('bg')").with_timeout_ms(1000);
    request.background = true;
    let result = protocol.execute(None, request).await.unwrap();
    assert_eq!(result.columns.data, Some(json!("bg")));
    assert!(protocol.completions().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_from_code() {
    let fetcher = Arc::new(
        RecordingFetcher::default().with_body("https://api.test/stock", r#"{"count": 7}"#),
    );
    let protocol = protocol_with(fetcher.clone());
    let result = protocol
        .execute(
            Some(&page()),
            ExecutionRequest::new(
                "fetch",
                "const stock = await turiumFetch('json', 'https://api.test/stock');\n\
                 turiumNextBlock(stock.count);",
            )
            .with_timeout_ms(2000),
        )
        .await
        .unwrap();
    assert_eq!(result.columns.data, Some(json!(7)));
    assert_eq!(fetcher.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_xml_fetch_rejected_without_network() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let protocol = protocol_with(fetcher.clone());
    let result = protocol
        .execute(
            Some(&page()),
            ExecutionRequest::new(
                "xml",
                "try { await turiumFetch('xml', 'https://api.test/feed'); }\n\
                 catch (error) { turiumNextBlock(error.message); }",
            )
            .with_timeout_ms(1000),
        )
        .await
        .unwrap();
    assert_eq!(
        result.columns.data,
        Some(json!("The \"type\" must be \"text\" or \"json\""))
    );

    let relay = FetchRelay::spawn(fetcher.clone());
    let err = relay.request("xml", json!("https://api.test/feed")).await.unwrap_err();
    assert!(matches!(err, BlockError::FetchTypeValidation(_)));
    assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn test_duplicate_completion_sends_one_result() {
    let completions: Dispatcher<ExecutionResult> = Dispatcher::new();
    let pending = completions.register("ctx-1").unwrap();
    let bridge = Arc::new(Bridge::new(
        "ctx-1",
        json!({}),
        CompletionRoute::Privileged(completions.clone()),
        None,
    ));

    assert!(bridge.next_block(json!("first"), json!(true)));
    assert!(!bridge.next_block(json!("second"), json!(true)));
    let result = pending.recv().await.unwrap();
    assert_eq!(result.columns.data, Some(json!("first")));
    assert!(completions.is_empty());
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let document = page();
    let injection = InjectionHandle::inject(&document, "scriptctx", "turiumNextBlock()", &[]);
    assert!(document.element_by_id("scriptctx").is_some());

    let bridge = Arc::new(Bridge::new(
        "ctx-2",
        json!({}),
        CompletionRoute::Page(document.clone()),
        None,
    ));
    let context = IsolatedExecutionContext::new(bridge.clone(), Some(injection));
    assert!(context.teardown());
    assert!(!context.teardown());
    assert!(bridge.is_torn_down());
    assert!(document.element_by_id("scriptctx").is_none());
}
