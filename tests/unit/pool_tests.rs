//! Unit tests for the bounded worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use datagate::config::{PoolConfig, Saturation};
use datagate::engine::pool::{TaskState, WorkerPool};
use datagate::AppError;

fn pool(workers: usize, queue_depth: usize, saturation: Saturation, timeout: u64) -> WorkerPool {
    WorkerPool::new(&PoolConfig {
        workers,
        queue_depth,
        saturation,
        queue_timeout_seconds: timeout,
    })
}

/// A job that blocks its worker until the returned sender fires.
fn gate() -> (
    mpsc::Sender<()>,
    impl FnOnce(&CancellationToken) -> datagate::Result<&'static str> + Send + 'static,
) {
    let (tx, rx) = mpsc::channel::<()>();
    let job = move |_: &CancellationToken| {
        let _ = rx.recv_timeout(Duration::from_secs(5));
        Ok("released")
    };
    (tx, job)
}

#[tokio::test]
async fn run_keyed_returns_results_in_submission_order() {
    let pool = pool(4, 8, Saturation::Block, 0);
    let jobs: Vec<(u64, _)> = (0..4_u64)
        .map(|i| {
            let delay = (4 - i) * 20;
            let job = move |_: &CancellationToken| {
                std::thread::sleep(Duration::from_millis(delay));
                Ok(i * 10)
            };
            (i, job)
        })
        .collect();

    let results = pool.run_keyed(jobs, &CancellationToken::new()).await;

    let keys: Vec<u64> = results.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![0, 1, 2, 3]);
    for (key, outcome) in results {
        assert_eq!(outcome.expect("job ok"), key * 10);
    }
    assert_eq!(pool.stats().completed, 4);
}

#[tokio::test]
async fn reject_policy_fails_fast_when_full() {
    let pool = pool(1, 0, Saturation::Reject, 0);
    let (release, job) = gate();
    let first = pool
        .submit("first", CancellationToken::new(), job)
        .await
        .expect("admitted");

    let second = pool
        .submit("second", CancellationToken::new(), |_: &CancellationToken| Ok("never"))
        .await;
    assert!(matches!(second, Err(AppError::CapacityExceeded(_))));
    assert_eq!(pool.stats().rejected, 1);

    release.send(()).expect("release");
    let (_, outcome) = first.join().await;
    assert_eq!(outcome.expect("first ok"), "released");
}

#[tokio::test]
async fn block_policy_waits_instead_of_dropping() {
    let pool = Arc::new(pool(1, 0, Saturation::Block, 0));
    let (release, job) = gate();
    let first = pool
        .submit("first", CancellationToken::new(), job)
        .await
        .expect("admitted");

    let waiting = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let handle = pool
                .submit("second", CancellationToken::new(), |_: &CancellationToken| {
                    Ok("second ran")
                })
                .await?;
            handle.join().await.1
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished(), "second submission must wait");

    release.send(()).expect("release");
    first.join().await.1.expect("first ok");
    let outcome = waiting.await.expect("join");
    assert_eq!(outcome.expect("second ok"), "second ran");
    assert_eq!(pool.stats().rejected, 0);
}

#[tokio::test]
async fn queued_task_cancelled_before_start_never_runs() {
    let pool = pool(1, 4, Saturation::Block, 0);
    let (release, job) = gate();
    let blocker = pool
        .submit("blocker", CancellationToken::new(), job)
        .await
        .expect("admitted");

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let queued = pool
        .submit("queued", CancellationToken::new(), move |_: &CancellationToken| {
            flag.store(true, Ordering::SeqCst);
            Ok("ran")
        })
        .await
        .expect("admitted");
    assert_eq!(queued.state(), TaskState::Queued);
    queued.cancel();

    let (key, outcome) = queued.join().await;
    assert_eq!(key, "queued");
    assert!(matches!(outcome, Err(AppError::Cancelled(_))));

    release.send(()).expect("release");
    blocker.join().await.1.expect("blocker ok");
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(pool.stats().cancelled, 1);
}

#[tokio::test]
async fn running_task_sees_cancellation_at_safe_points() {
    let pool = pool(1, 0, Saturation::Block, 0);
    let token = CancellationToken::new();
    let handle = pool
        .submit("spin", token.clone(), |ct: &CancellationToken| {
            for _ in 0..500 {
                if ct.is_cancelled() {
                    return Err(AppError::Cancelled("stopped".into()));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        })
        .await
        .expect("admitted");

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    let (_, outcome) = handle.join().await;
    assert!(matches!(outcome, Err(AppError::Cancelled(_))));
}

#[tokio::test]
async fn long_queued_task_times_out() {
    let pool = pool(1, 1, Saturation::Block, 1);
    let (release, job) = gate();
    let blocker = pool
        .submit("blocker", CancellationToken::new(), job)
        .await
        .expect("admitted");

    let late = pool
        .submit("late", CancellationToken::new(), |_: &CancellationToken| Ok("late"))
        .await
        .expect("admitted");
    let (_, outcome) = late.join().await;
    assert!(matches!(outcome, Err(AppError::CapacityExceeded(_))));

    release.send(()).expect("release");
    blocker.join().await.1.expect("blocker ok");
    assert_eq!(pool.stats().failed, 1);
}
