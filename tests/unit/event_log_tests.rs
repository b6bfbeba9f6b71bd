//! Unit tests for the per-session event log.

use serde_json::json;

use datagate::models::event::{EventKind, EventOrigin};
use datagate::session::event_log::EventLog;
use datagate::AppError;

fn log_with(capacity: usize, count: u64) -> EventLog {
    let log = EventLog::new(capacity);
    for n in 1..=count {
        log.append(EventKind::Message, EventOrigin::Push, json!({ "n": n }));
    }
    log
}

#[test]
fn sequence_numbers_start_at_one_and_increase() {
    let log = log_with(10, 3);
    let seqs: Vec<u64> = log.since(0).expect("replay").iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(log.latest_seq(), 3);
}

#[test]
fn replay_is_contiguous_and_strictly_after_last_seen() {
    let log = log_with(100, 5);
    let replay = log.since(3).expect("replay");
    let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![4, 5]);
    assert_eq!(replay[0].payload, json!({ "n": 4 }));
}

#[test]
fn replay_from_latest_is_empty() {
    let log = log_with(10, 4);
    assert!(log.since(4).expect("replay").is_empty());
}

#[test]
fn retention_evicts_oldest_first() {
    let log = log_with(3, 10);
    assert_eq!(log.len(), 3);
    assert_eq!(log.oldest_seq(), Some(8));
    let seqs: Vec<u64> = log.since(7).expect("replay").iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![8, 9, 10]);
}

#[test]
fn replay_below_retained_window_is_a_gap() {
    let log = log_with(3, 10);
    let err = log.since(2).expect_err("gap");
    assert_eq!(
        err,
        AppError::ResumptionGap {
            last_seen: 2,
            oldest: 8
        }
    );
}

#[test]
fn last_seen_ahead_of_log_is_malformed() {
    let log = log_with(10, 2);
    assert!(matches!(log.since(5), Err(AppError::InvalidRequest(_))));
}

#[tokio::test]
async fn watermark_follows_appends() {
    let log = log_with(10, 1);
    let mut watermark = log.subscribe();
    log.append(EventKind::Chunk, EventOrigin::Request, json!({}));
    watermark.changed().await.expect("changed");
    assert_eq!(*watermark.borrow(), 2);
}
