//! Error handlers, fatal-fault eviction, and panics

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use bindq_queue::{BindingQueue, ConnectionLost, ContextHooks, ContextKey, Resolution};

use crate::common::{fast_settings, init_tracing, started_queue};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn error_handler_supplies_value_and_context_survives() {
    let (queue, hooks) = started_queue(fast_settings());
    queue.add_context("conn1");

    let handle = queue
        .submission("conn1", |_, _| -> anyhow::Result<String> {
            anyhow::bail!("malformed statement")
        })
        .on_error(|err| format!("handled: {err}"))
        .submit();

    let outcome = handle.wait().await;
    assert_eq!(outcome.resolution(), Resolution::Faulted { fatal: false });
    assert_eq!(
        outcome.into_value().as_deref(),
        Some("handled: malformed statement")
    );
    assert!(queue.is_context_connected("conn1"));
    assert!(hooks.fatal_notifications().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fault_without_handler_yields_no_value() {
    let (queue, _hooks) = started_queue(fast_settings());

    let handle = queue.submit("conn1", |_, _| -> anyhow::Result<u32> {
        Err(anyhow::anyhow!("nope"))
    });

    let outcome = handle.wait().await;
    assert!(matches!(outcome.resolution(), Resolution::Faulted { .. }));
    assert!(outcome.value().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_reset_evicts_context_and_notifies_once() {
    let (queue, hooks) = started_queue(fast_settings());
    let first = queue.add_context("server1|db1");

    let handle = queue
        .submission("server1|db1", |_, _| -> anyhow::Result<String> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"))
                .context("fetching binding metadata")
        })
        .on_error(|_| "error value".to_string())
        .submit();

    let outcome = handle.wait().await;
    assert_eq!(outcome.resolution(), Resolution::Faulted { fatal: true });
    assert_eq!(outcome.into_value().as_deref(), Some("error value"));

    assert!(!queue.is_context_connected("server1|db1"));
    assert!(queue.context("server1|db1").is_none());
    assert!(!first.is_connected());

    let notifications = hooks.fatal_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].0.as_str(), "server1|db1");
    assert!(notifications[0].1.contains("peer reset"));

    // The owner reconnects; a fresh context replaces the evicted one.
    let second = queue.add_context("server1|db1");
    assert!(queue.is_context_connected("server1|db1"));
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(hooks.created(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submission_after_eviction_gets_fresh_context() {
    let (queue, hooks) = started_queue(fast_settings());

    let fatal = queue.submit("conn1", |_, _| -> anyhow::Result<()> {
        Err(ConnectionLost::new("server went away").into())
    });
    assert_eq!(
        fatal.wait().await.resolution(),
        Resolution::Faulted { fatal: true }
    );

    let next = queue.submit("conn1", |conn, _| {
        Ok(conn.run("after", Duration::from_millis(1)))
    });
    assert_eq!(next.wait().await.resolution(), Resolution::Completed);
    assert_eq!(hooks.created(), 2);
    assert_eq!(hooks.fatal_notifications().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_operation_is_contained() {
    let (queue, hooks) = started_queue(fast_settings());

    let panicked = queue
        .submission("conn1", |_, _| -> anyhow::Result<u32> {
            panic!("driver bug");
        })
        .on_error(|err| u32::from(err.to_string().contains("driver bug")))
        .submit();
    let next = queue.submit("conn1", |conn, _| {
        Ok(conn.run("after-panic", Duration::from_millis(1)))
    });

    let outcome = panicked.wait().await;
    assert_eq!(outcome.resolution(), Resolution::Faulted { fatal: false });
    assert_eq!(outcome.into_value(), Some(1));
    assert_eq!(next.wait().await.resolution(), Resolution::Completed);
    assert!(queue.registry().exists("conn1"));
    assert!(hooks.fatal_notifications().is_empty());
}

/// Classifies by message instead of by transport error kind.
struct MessageClassifier {
    fatal: Arc<Mutex<Vec<ContextKey>>>,
}

impl ContextHooks<()> for MessageClassifier {
    fn create_payload(&self, _key: &ContextKey) {}

    fn is_connection_fatal(&self, err: &anyhow::Error) -> bool {
        err.to_string().contains("session expired")
    }

    fn on_connection_fatal(&self, key: &ContextKey, _err: &anyhow::Error) {
        self.fatal.lock().unwrap().push(key.clone());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn custom_classifier_decides_fatality() {
    init_tracing();
    let fatal = Arc::new(Mutex::new(Vec::new()));
    let queue = BindingQueue::new(
        fast_settings(),
        MessageClassifier {
            fatal: Arc::clone(&fatal),
        },
    );
    queue.start().unwrap();

    let reset = queue.submit("conn1", |_: &mut (), _| -> anyhow::Result<()> {
        Err(io::Error::from(io::ErrorKind::ConnectionReset).into())
    });
    assert_eq!(
        reset.wait().await.resolution(),
        Resolution::Faulted { fatal: false }
    );

    let expired = queue.submit("conn1", |_: &mut (), _| -> anyhow::Result<()> {
        anyhow::bail!("session expired")
    });
    assert_eq!(
        expired.wait().await.resolution(),
        Resolution::Faulted { fatal: true }
    );
    assert_eq!(fatal.lock().unwrap().as_slice(), [ContextKey::new("conn1")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_payload_factory_does_not_stall_the_queue() {
    init_tracing();
    let queue = BindingQueue::new(fast_settings(), |key: &ContextKey| -> Vec<u8> {
        assert_ne!(key.as_str(), "bad", "cannot open a connection for this key");
        Vec::new()
    });
    queue.start().unwrap();

    let bad = queue.submit("bad", |payload: &mut Vec<u8>, _| Ok(payload.len()));
    assert_eq!(bad.wait().await.resolution(), Resolution::Discarded);
    assert!(queue.is_running());
    assert!(!queue.registry().exists("bad"));

    let good = queue.submit("good", |payload: &mut Vec<u8>, _| {
        payload.push(1);
        Ok(payload.len())
    });
    let outcome = good
        .wait_timeout(Duration::from_secs(2))
        .await
        .expect("other keys are still served");
    assert_eq!(outcome.into_value(), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn items_queued_behind_a_fatal_fault_are_discarded() {
    let (queue, hooks) = started_queue(fast_settings());

    let fatal = queue.submit("conn1", |conn, _| -> anyhow::Result<String> {
        conn.run("fatal", Duration::from_millis(50));
        Err(ConnectionLost::new("server went away").into())
    });
    let second = queue.submit("conn1", |conn, _| {
        Ok(conn.run("second", Duration::from_millis(200)))
    });
    assert_eq!(
        fatal.wait().await.resolution(),
        Resolution::Faulted { fatal: true }
    );

    let third = queue.submit("conn1", |conn, _| {
        Ok(conn.run("third", Duration::from_millis(1)))
    });
    assert_eq!(second.wait().await.resolution(), Resolution::Discarded);
    assert_eq!(third.wait().await.resolution(), Resolution::Completed);

    // Nothing ran against the dead connection after the fault.
    assert_eq!(hooks.labels(), ["fatal", "third"]);
    assert_eq!(hooks.created(), 2);
}
