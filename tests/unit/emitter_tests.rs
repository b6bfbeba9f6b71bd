//! Unit tests for inline versus chunked result delivery.

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Map, Value};

use datagate::config::StreamingConfig;
use datagate::engine::emitter::{Emission, Emitter, Frame, ItemStream, ToolOutput};
use datagate::AppError;

fn emitter(threshold: usize, chunk_items: usize) -> Emitter {
    Emitter::new(&StreamingConfig {
        inline_threshold_bytes: threshold,
        chunk_items,
    })
}

fn items(values: Vec<datagate::Result<Value>>) -> ItemStream {
    stream::iter(values).boxed()
}

fn numbers(n: u64) -> ItemStream {
    items((0..n).map(|i| Ok(json!(i))).collect())
}

async fn frames(emission: Emission) -> Vec<Frame> {
    let Emission::Chunked(frames) = emission else {
        panic!("expected chunked delivery");
    };
    frames.collect().await
}

#[tokio::test]
async fn plain_values_are_always_inline() {
    let emission = emitter(0, 1)
        .plan(ToolOutput::Value(json!({ "size": 12 })))
        .await
        .expect("plan");
    assert!(matches!(emission, Emission::Inline(v) if v["size"] == 12));
}

#[tokio::test]
async fn inline_result_merges_trailer() {
    let mut trailer = Map::new();
    trailer.insert("path".into(), json!("a.txt"));
    let emission = emitter(1024, 4)
        .plan(ToolOutput::Items {
            items: numbers(2),
            trailer,
        })
        .await
        .expect("plan");
    let value = emission.into_value().await.expect("value");
    assert_eq!(value, json!({ "path": "a.txt", "items": [0, 1], "totalItems": 2 }));
}

#[tokio::test]
async fn large_results_are_chunked_in_order_then_ended() {
    let emission = emitter(16, 3)
        .plan(ToolOutput::items(numbers(10)))
        .await
        .expect("plan");
    let frames = frames(emission).await;

    let mut seen = Vec::new();
    for (expected_index, frame) in frames.iter().take(frames.len() - 1).enumerate() {
        let Frame::Chunk { index, items } = frame else {
            panic!("expected chunk, got {frame:?}");
        };
        assert_eq!(*index, expected_index);
        assert!(items.len() <= 3);
        seen.extend(items.iter().cloned());
    }
    assert_eq!(seen, (0..10).map(|i| json!(i)).collect::<Vec<_>>());

    let Some(Frame::End {
        total_items,
        chunks,
        ..
    }) = frames.last()
    else {
        panic!("expected end frame");
    };
    assert_eq!(*total_items, 10);
    assert_eq!(*chunks, frames.len() - 1);
}

#[tokio::test]
async fn item_error_after_threshold_ends_with_failed_frame() {
    let source = items(vec![
        Ok(json!(0)),
        Ok(json!(1)),
        Ok(json!(2)),
        Ok(json!(3)),
        Err(AppError::Upstream("read failed".into())),
        Ok(json!(99)),
    ]);
    let frames = frames(emitter(8, 3).plan(ToolOutput::items(source)).await.expect("plan")).await;

    assert!(matches!(
        frames.last(),
        Some(Frame::Failed(AppError::Upstream(_)))
    ));
    assert!(!frames.iter().any(|f| matches!(f, Frame::End { .. })));
    let delivered: usize = frames
        .iter()
        .map(|f| match f {
            Frame::Chunk { items, .. } => items.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(delivered, 4);
}

#[tokio::test]
async fn item_error_before_threshold_fails_the_call() {
    let source = items(vec![Ok(json!(0)), Err(AppError::Upstream("early".into()))]);
    let outcome = emitter(1024, 3).plan(ToolOutput::items(source)).await;
    assert!(matches!(outcome, Err(AppError::Upstream(_))));
}

#[tokio::test]
async fn chunked_emission_collapses_to_the_inline_shape() {
    let emission = emitter(16, 2)
        .plan(ToolOutput::items(numbers(7)))
        .await
        .expect("plan");
    let value = emission.into_value().await.expect("collapse");
    assert_eq!(value["totalItems"], 7);
    assert_eq!(value["items"].as_array().map(Vec::len), Some(7));
}
