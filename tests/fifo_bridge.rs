#![cfg(unix)]

mod support;

use std::{collections::HashSet, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{StreamExt, future::join_all, stream};
use pdfrasterizer::{
    application::rasterize::{
        FifoBroker, GhostscriptRenderer, InputStream, RenderError, Renderer, StreamBridge,
        StreamError,
    },
    domain::format::{JPEG, PNG},
};
use support::{
    Behavior, FakeRenderer, JPEG_SIGNATURE, PNG_SIGNATURE, failing_ghostscript, fake_ghostscript,
    leftover_entries,
};
use tempfile::TempDir;

const BOUND: Duration = Duration::from_secs(10);

fn pdf() -> InputStream {
    stream::iter([
        Ok(Bytes::from_static(b"%PDF-1.4\n")),
        Ok(Bytes::from_static(b"%%EOF\n")),
    ])
    .boxed()
}

fn bridge(dir: &TempDir, renderer: Arc<dyn Renderer>) -> StreamBridge {
    StreamBridge::new(Arc::new(FifoBroker::new(dir.path())), renderer)
}

#[tokio::test]
async fn success_streams_bytes_and_removes_fifo() {
    let dir = TempDir::new().expect("temp dir");
    let renderer = Arc::new(FakeRenderer::new(Behavior::Emit(PNG_SIGNATURE)));
    let bridge = bridge(&dir, renderer.clone());

    let mut sink = Vec::new();
    let outcome = tokio::time::timeout(BOUND, bridge.bridge(pdf(), &mut sink, &PNG))
        .await
        .expect("bridge finishes")
        .expect("channel");

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(sink, PNG_SIGNATURE);
    let paths = renderer.paths();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].starts_with(dir.path()));
    assert!(leftover_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn producer_failing_before_open_does_not_hang_consumer() {
    let dir = TempDir::new().expect("temp dir");
    let bridge = bridge(&dir, Arc::new(FakeRenderer::new(Behavior::FailBeforeOpen)));

    let mut sink = Vec::new();
    let outcome = tokio::time::timeout(BOUND, bridge.bridge(pdf(), &mut sink, &PNG))
        .await
        .expect("consumer must observe end-of-stream")
        .expect("channel");

    assert!(matches!(outcome.render, Err(RenderError::Exit { .. })));
    assert_eq!(outcome.stream.expect("stream"), 0);
    assert!(sink.is_empty());
    assert!(leftover_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn partial_output_is_delivered_when_producer_fails_late() {
    let dir = TempDir::new().expect("temp dir");
    let bridge = bridge(&dir, Arc::new(FakeRenderer::new(Behavior::FailAfter(b"\x89PN"))));

    let mut sink = Vec::new();
    let outcome = tokio::time::timeout(BOUND, bridge.bridge(pdf(), &mut sink, &PNG))
        .await
        .expect("bridge finishes")
        .expect("channel");

    assert!(outcome.render.is_err());
    assert_eq!(sink, b"\x89PN");
    assert!(leftover_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn consumer_failure_still_awaits_producer_and_cleans_up() {
    static LARGE: [u8; 1 << 20] = [0x42; 1 << 20];

    let dir = TempDir::new().expect("temp dir");
    let bridge = bridge(&dir, Arc::new(FakeRenderer::new(Behavior::Emit(&LARGE))));

    let (mut sink, peer) = tokio::io::duplex(64);
    drop(peer);

    let outcome = tokio::time::timeout(BOUND, bridge.bridge(pdf(), &mut sink, &PNG))
        .await
        .expect("bridge finishes")
        .expect("channel");

    assert!(matches!(outcome.stream, Err(StreamError::Write { .. })));
    // Reader gone: the producer hit a broken pipe instead of blocking.
    assert!(outcome.render.is_err());
    assert!(leftover_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn concurrent_requests_use_distinct_channels() {
    const REQUESTS: usize = 16;

    let dir = TempDir::new().expect("temp dir");
    let renderer = Arc::new(FakeRenderer::new(Behavior::Echo));
    let bridge = bridge(&dir, renderer.clone());

    let runs = (0..REQUESTS).map(|i| {
        let bridge = bridge.clone();
        async move {
            let document = format!("%PDF-1.4 document {i}");
            let input = stream::iter([Ok(Bytes::from(document.clone()))]).boxed();
            let mut sink = Vec::new();
            let outcome = bridge
                .bridge(input, &mut sink, &PNG)
                .await
                .expect("channel");
            assert!(outcome.is_success(), "{outcome:?}");
            (document.into_bytes(), sink)
        }
    });

    let results = tokio::time::timeout(BOUND, join_all(runs))
        .await
        .expect("all requests finish");

    for (document, sink) in results {
        assert_eq!(sink, document, "responses must not mix");
    }
    let paths: HashSet<_> = renderer.paths().into_iter().collect();
    assert_eq!(paths.len(), REQUESTS);
    assert!(leftover_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn ghostscript_process_writes_through_fifo() {
    let scripts = TempDir::new().expect("script dir");
    let fifos = TempDir::new().expect("fifo dir");
    let renderer = GhostscriptRenderer::new(fake_ghostscript(scripts.path()), BOUND);
    let bridge = bridge(&fifos, Arc::new(renderer));

    let mut png = Vec::new();
    let outcome = tokio::time::timeout(BOUND, bridge.bridge(pdf(), &mut png, &PNG))
        .await
        .expect("bridge finishes")
        .expect("channel");
    assert!(outcome.is_success(), "{outcome:?}");
    assert!(png.starts_with(PNG_SIGNATURE));

    let mut jpeg = Vec::new();
    let outcome = tokio::time::timeout(BOUND, bridge.bridge(pdf(), &mut jpeg, &JPEG))
        .await
        .expect("bridge finishes")
        .expect("channel");
    assert!(outcome.is_success(), "{outcome:?}");
    assert!(jpeg.starts_with(JPEG_SIGNATURE));

    assert!(leftover_entries(fifos.path()).is_empty());
}

#[tokio::test]
async fn ghostscript_rejecting_input_ends_stream_empty() {
    let scripts = TempDir::new().expect("script dir");
    let fifos = TempDir::new().expect("fifo dir");
    let renderer = GhostscriptRenderer::new(failing_ghostscript(scripts.path()), BOUND);
    let bridge = bridge(&fifos, Arc::new(renderer));

    let mut sink = Vec::new();
    let input = stream::iter([Ok(Bytes::from_static(b"0123456789"))]).boxed();
    let outcome = tokio::time::timeout(BOUND, bridge.bridge(input, &mut sink, &PNG))
        .await
        .expect("bridge finishes")
        .expect("channel");

    match outcome.render {
        Err(RenderError::Exit {
            exit_code,
            diagnostics,
        }) => {
            assert_eq!(exit_code, Some(1));
            assert!(diagnostics.contains("syntaxerror"), "{diagnostics}");
        }
        other => panic!("unexpected render outcome: {other:?}"),
    }
    assert!(sink.is_empty());
    assert!(leftover_entries(fifos.path()).is_empty());
}
