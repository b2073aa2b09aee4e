//! Operation timeouts, gate waits, and fallbacks

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bindq_queue::{QueueSettings, Resolution};
use tokio::sync::oneshot;

use crate::common::{fast_settings, started_queue};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overrunning_operation_returns_fallback_near_budget() {
    let (queue, _hooks) = started_queue(fast_settings());
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_cancel);

    let started = Instant::now();
    let handle = queue
        .submission("conn1", move |_, cancel| {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if cancel.is_cancelled() {
                    flag.store(true, Ordering::SeqCst);
                    anyhow::bail!("cancelled");
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok("too late".to_string())
        })
        .timeout(Duration::from_millis(100))
        .on_timeout(|_| "fallback".to_string())
        .submit();

    let outcome = handle.wait().await;
    let elapsed = started.elapsed();
    assert_eq!(outcome.resolution(), Resolution::TimedOut);
    assert_eq!(outcome.into_value().as_deref(), Some("fallback"));
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(saw_cancel.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_without_fallback_yields_no_value() {
    let (queue, _hooks) = started_queue(fast_settings());

    let handle = queue
        .submission("conn1", |conn, _| {
            Ok(conn.run("slow", Duration::from_millis(200)))
        })
        .timeout(Duration::from_millis(30))
        .submit();

    let outcome = handle.wait().await;
    assert_eq!(outcome.resolution(), Resolution::TimedOut);
    assert_eq!(outcome.into_value_or_default(), String::new());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_operation_holds_the_gate_until_it_returns() {
    let (queue, hooks) = started_queue(fast_settings());

    let stalled = queue
        .submission("conn1", |conn, _| {
            // Ignores cancellation.
            Ok(conn.run("stalled", Duration::from_millis(250)))
        })
        .timeout(Duration::from_millis(50))
        .on_timeout(|_| "fallback".to_string())
        .submit();
    let next = queue.submit("conn1", |conn, _| {
        Ok(conn.run("next", Duration::from_millis(1)))
    });

    assert_eq!(stalled.wait().await.resolution(), Resolution::TimedOut);
    assert_eq!(next.wait().await.resolution(), Resolution::Completed);

    let spans = hooks.spans();
    assert_eq!(hooks.labels(), ["stalled", "next"]);
    assert!(spans[0].end <= spans[1].start);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn next_item_falls_back_when_stalled_operation_outlives_grace() {
    let settings = QueueSettings::new(
        Duration::from_millis(500),
        Duration::ZERO,
        Duration::from_millis(100),
        Duration::from_millis(500),
    )
    .unwrap();
    let (queue, hooks) = started_queue(settings);

    let stalled = queue
        .submission("conn1", |conn, _| {
            Ok(conn.run("stalled", Duration::from_millis(600)))
        })
        .timeout(Duration::from_millis(50))
        .submit();
    let next = queue
        .submission("conn1", |conn, _| {
            Ok(conn.run("next", Duration::from_millis(1)))
        })
        .on_timeout(|ctx| format!("{} busy", ctx.key()))
        .submit();

    assert_eq!(stalled.wait().await.resolution(), Resolution::TimedOut);
    let outcome = next.wait().await;
    assert_eq!(outcome.resolution(), Resolution::LockTimedOut);
    assert_eq!(outcome.into_value().as_deref(), Some("conn1 busy"));

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(hooks.labels(), ["stalled"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_wait_outlasts_a_short_owner_hold() {
    let (queue, _hooks) = started_queue(fast_settings());
    let context = queue.add_context("conn1");

    let (held_tx, held_rx) = oneshot::channel();
    let owner = tokio::spawn(async move {
        let guard = context.payload().await;
        let _ = held_tx.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
    });
    held_rx.await.unwrap();

    let handle = queue
        .submission("conn1", |conn, _| {
            Ok(conn.run("after-owner", Duration::from_millis(1)))
        })
        .lock_wait(Duration::from_millis(300))
        .submit();

    assert_eq!(handle.wait().await.resolution(), Resolution::Completed);
    owner.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_lock_wait_falls_back_while_owner_holds_gate() {
    let (queue, hooks) = started_queue(fast_settings());
    let context = queue.add_context("conn1");
    let guard = context.payload().await;

    let started = Instant::now();
    let handle = queue
        .submission("conn1", |conn, _| {
            Ok(conn.run("never", Duration::from_millis(1)))
        })
        .on_timeout(|_| "fallback".to_string())
        .submit();

    let outcome = handle.wait().await;
    assert_eq!(outcome.resolution(), Resolution::LockTimedOut);
    assert_eq!(outcome.into_value().as_deref(), Some("fallback"));
    assert!(started.elapsed() < Duration::from_millis(200));
    drop(guard);
    assert!(hooks.labels().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operation_ignoring_cancellation_still_yields_fallback_on_time() {
    let (queue, _hooks) = started_queue(fast_settings());

    let started = Instant::now();
    let handle = queue
        .submission("conn1", |_, _| {
            std::thread::sleep(Duration::from_millis(1_000));
            Ok("done".to_string())
        })
        .timeout(Duration::from_millis(100))
        .on_timeout(|_| "fallback".to_string())
        .submit();

    let outcome = handle.wait().await;
    let elapsed = started.elapsed();
    assert_eq!(outcome.resolution(), Resolution::TimedOut);
    assert_eq!(outcome.into_value().as_deref(), Some("fallback"));
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
}
