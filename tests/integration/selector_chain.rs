//! Selector chain resolution through nested frames

use proptest::prelude::*;
use turium::dom::fixture::{ElementFixture, PageFixture};
use turium::error::BlockError;
use turium::selector::resolver::FrameOffset;
use turium::selector::{ChainResolution, SelectorChain, FRAME_DELIMITER};

use super::test_utils::fast_resolver;

fn checkout_page() -> PageFixture {
    PageFixture::new("https://shop.test/").element(
        ElementFixture::new("iframe")
            .id("outer")
            .rect(100.0, 50.0, 800.0, 600.0)
            .local_frame(
                PageFixture::new("https://shop.test/outer").element(
                    ElementFixture::new("iframe")
                        .id("inner")
                        .rect(20.0, 30.0, 400.0, 300.0)
                        .local_frame(
                            PageFixture::new("https://shop.test/inner").element(
                                ElementFixture::new("button")
                                    .class("submit")
                                    .rect(5.0, 5.0, 80.0, 24.0)
                                    .text("Pay"),
                            ),
                        ),
                ),
            ),
    )
}

#[tokio::test]
async fn test_two_local_frames_resolve_without_relay() {
    let document = checkout_page().build();
    let chain = SelectorChain::parse("#outer|>#inner|>button.submit").unwrap();
    assert_eq!(chain.hops(), 2);

    let resolution = fast_resolver()
        .resolve_chain(&document, &chain, FrameOffset::default(), true)
        .await
        .unwrap();
    match resolution {
        ChainResolution::Local {
            document: inner,
            target,
            hops,
            offset,
        } => {
            assert_eq!(hops, 2);
            // One content read per frame boundary crossed, none in the target document.
            let top_reads = document.content_reads();
            let outer = match document.element_by_id("outer").and_then(|el| el.content_frame()) {
                Some(turium::dom::FrameContent::Local(outer)) => outer,
                _ => panic!("outer frame is local"),
            };
            assert_eq!(top_reads, 1);
            assert_eq!(outer.content_reads(), 1);
            assert_eq!(inner.content_reads(), 0);
            assert_eq!(top_reads + outer.content_reads() + inner.content_reads(), hops);
            assert_eq!(target, "button.submit");
            assert_eq!(inner.url(), "https://shop.test/inner");
            assert_eq!((offset.x, offset.y), (120.0, 80.0));
            let found = turium::selector::query(&inner, &target).unwrap();
            assert_eq!(found[0].inner_text(), "Pay");
        }
        ChainResolution::Remote { .. } => panic!("every frame is readable in-process"),
    }
}

#[tokio::test]
async fn test_non_frame_intermediate_is_rejected_unread() {
    let document = PageFixture::new("https://shop.test/")
        .element(ElementFixture::new("div").id("outer").rect(0.0, 0.0, 10.0, 10.0))
        .build();
    let chain = SelectorChain::parse("#outer|>button").unwrap();
    let err = fast_resolver()
        .resolve_chain(&document, &chain, FrameOffset::default(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, BlockError::NotIframe { ref selector } if selector == "#outer"));
    assert_eq!(document.content_reads(), 0);
}

#[tokio::test]
async fn test_missing_frame_names_the_prefix() {
    let document = checkout_page().build();
    let chain = SelectorChain::parse("#outer|>#nope|>button").unwrap();
    let err = fast_resolver()
        .resolve_chain(&document, &chain, FrameOffset::default(), true)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "iframe-not-found");
    assert!(matches!(err, BlockError::IframeNotFound { ref selector } if selector == "#outer|>#nope"));
}

#[tokio::test]
async fn test_remote_frame_stops_local_walk() {
    let document = PageFixture::new("https://shop.test/")
        .element(
            ElementFixture::new("iframe")
                .id("ad")
                .rect(10.0, 10.0, 300.0, 250.0)
                .remote_frame(PageFixture::new("https://ads.test/")),
        )
        .build_remote(&mut |_| turium::relay::window::WindowHandle::channel().0);
    let chain = SelectorChain::parse("#ad|>a.cta").unwrap();
    match fast_resolver()
        .resolve_chain(&document, &chain, FrameOffset::default(), true)
        .await
        .unwrap()
    {
        ChainResolution::Remote {
            frame_selector,
            remaining,
            offset,
            ..
        } => {
            assert_eq!(frame_selector, "#ad");
            assert_eq!(remaining, "a.cta");
            assert_eq!(offset.window_width, Some(1280.0));
        }
        ChainResolution::Local { .. } => panic!("remote frame must be relayed"),
    }
}

proptest! {
    #[test]
    fn prop_hops_match_delimiters(segments in prop::collection::vec("[a-z][a-z0-9]{0,6}", 1..6)) {
        let raw = segments.join(FRAME_DELIMITER);
        let chain = SelectorChain::parse(&raw).unwrap();
        prop_assert_eq!(chain.hops(), segments.len() - 1);
        prop_assert_eq!(chain.target(), segments.last().unwrap().as_str());
    }

    #[test]
    fn prop_empty_segment_is_invalid(prefix in "[a-z]{1,5}") {
        let raw = format!("{}{}{}", prefix, FRAME_DELIMITER, FRAME_DELIMITER);
        prop_assert!(SelectorChain::parse(&raw).is_err());
    }
}
