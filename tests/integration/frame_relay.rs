//! Blocks relayed into frames that are only reachable through messages

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use turium::block::{BlockReply, BlockRequest};
use turium::content::{ContentRuntime, Tab};
use turium::dom::fixture::{ElementFixture, PageFixture};
use turium::error::{BlockError, ErrorPayload, EMPTY_MESSAGE_ID};
use turium::relay::message::RelayMessage;
use turium::relay::token::{MemoryTokenStore, TokenStore};
use turium::relay::window::WindowHandle;
use turium::relay::{FrameRelay, RelayConfig};
use turium::selector::resolver::FrameOffset;

use super::test_utils::{services, services_with};

fn done(reply: BlockReply) -> Value {
    match reply {
        BlockReply::Done(value) => value,
        BlockReply::Forwarded => panic!("originating caller must receive the result"),
    }
}

fn nested_remote_page() -> PageFixture {
    PageFixture::new("https://news.test/").element(
        ElementFixture::new("iframe")
            .id("a")
            .rect(10.0, 10.0, 600.0, 400.0)
            .remote_frame(
                PageFixture::new("https://widgets.test/").element(
                    ElementFixture::new("iframe")
                        .id("b")
                        .rect(5.0, 5.0, 300.0, 200.0)
                        .remote_frame(
                            PageFixture::new("https://ads.test/").element(
                                ElementFixture::new("p").class("msg").text("deepest"),
                            ),
                        ),
                ),
            ),
    )
}

#[tokio::test]
async fn test_nested_remote_frames_report_to_top() {
    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
    let tab = Tab::open(&nested_remote_page(), services_with(tokens.clone()));
    assert_eq!(tab.frames().len(), 2);

    let block = BlockRequest::new("getText", json!({ "selector": "#a|>#b|>p.msg" }));
    assert_eq!(done(tab.run_block(block).await.unwrap()), json!("deepest"));

    // Every hop consumed its token and nothing is left awaiting a result.
    assert_eq!(tokens.len().unwrap(), 0);
    assert!(tab.main().services().relay.results().is_empty());
}

#[tokio::test]
async fn test_relayed_failure_keeps_its_kind() {
    let tab = Tab::open(&nested_remote_page(), services());
    let block = BlockRequest::new("getText", json!({ "selector": "#a|>#b|>p.gone" }));
    let err = tab.run_block(block).await.unwrap_err();
    assert!(matches!(err, BlockError::ElementNotFound { ref selector } if selector == "p.gone"));

    let block = BlockRequest::new("getText", json!({ "selector": "#a|>#missing|>p" }));
    let err = tab.run_block(block).await.unwrap_err();
    assert!(matches!(err, BlockError::IframeNotFound { .. }));
}

#[tokio::test]
async fn test_duplicate_delivery_is_rejected() {
    let services = services();
    let (top, mut top_inbox) = WindowHandle::channel();
    let (frame_window, frame_inbox) = WindowHandle::channel();
    let document = PageFixture::new("https://frame.test/")
        .element(ElementFixture::new("h1").text("Title"))
        .build();
    let frame = Arc::new(ContentRuntime::new(
        frame_window.clone(),
        Some(top.clone()),
        document,
        services.clone(),
    ));
    assert!(frame.start(frame_inbox));
    assert!(!frame.start(WindowHandle::channel().1), "one listener per runtime");

    let message_id = "message:dup";
    services.relay.tokens().put(message_id).unwrap();
    let mut block = BlockRequest::new("getText", json!({ "selector": "h1" }));
    block.origin_id = Some(message_id.to_string());
    let execute = RelayMessage::ExecuteBlock {
        message_id: message_id.to_string(),
        block_data: serde_json::to_value(&block).unwrap(),
    };
    frame_window.post(&execute, Some(&top)).unwrap();
    frame_window.post(&execute, Some(&top)).unwrap();

    let mut successes = 0;
    let mut rejections = 0;
    for _ in 0..2 {
        let raw = tokio::time::timeout(Duration::from_secs(2), top_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        match raw.decode().unwrap() {
            RelayMessage::BlockExecuteResult { message_id: id, result } => {
                assert_eq!(id, message_id);
                match ErrorPayload::detect(&result) {
                    Some(payload) => {
                        assert_eq!(payload.message, EMPTY_MESSAGE_ID);
                        rejections += 1;
                    }
                    None => {
                        assert_eq!(result, json!("Title"));
                        successes += 1;
                    }
                }
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    assert_eq!((successes, rejections), (1, 1));
}

#[tokio::test]
async fn test_unanswered_relay_times_out() {
    let relay = FrameRelay::new(Arc::new(MemoryTokenStore::new()), RelayConfig { timeout_ms: 100 });
    let (silent, _inbox) = WindowHandle::channel();
    let block = BlockRequest::new("getText", json!({ "selector": "#x|>p" }));
    let err = relay
        .send(&silent, block, "p", FrameOffset::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BlockError::RelayTimeout(100)));
    assert!(relay.results().is_empty());
    // The token stays until the frame consumes it or it is purged.
    assert_eq!(relay.tokens().len().unwrap(), 1);
}

#[tokio::test]
async fn test_empty_message_id_is_rejected() {
    let relay = FrameRelay::new(Arc::new(MemoryTokenStore::new()), RelayConfig::default());
    let err = relay.accept("").unwrap_err();
    assert_eq!(err.to_string(), EMPTY_MESSAGE_ID);
}
