mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_test::assert_ok;
use warden::config::Config;
use warden::generation::StreamOutcome;
use warden::poller::{Classification, PollerState};
use warden::service::Warden;
use warden::supervisor::{ProcessSupervisor, StaticLocator};

use common::{Reply, chunk, collect, done, ollama};

fn warden(url: &str, poll: bool) -> Warden {
    let config = Config {
        api_url: url.to_string(),
        default_model: "llama3".to_string(),
        auto_start_server: false,
        status_poll_enabled: poll,
        ..Config::default()
    };
    Warden::assemble(config, |t| ProcessSupervisor::new(t, "ollama").with_locator(StaticLocator(None))).unwrap()
}

#[tokio::test]
async fn reusing_an_id_cancels_the_earlier_request() {
    let server = ollama(|_, index| {
        if index == 0 {
            Reply::NdjsonHang(vec![(0, chunk("one"))])
        } else {
            Reply::Ndjson(vec![(0, chunk("two")), (0, done())])
        }
    })
    .await;
    let w = Arc::new(warden(&server.url, false));

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let first = {
        let w = w.clone();
        tokio::spawn(async move { w.generate(Some("chat"), None, "first", tx1).await })
    };
    assert_eq!(rx1.recv().await.as_deref(), Some("one"));

    let (tx2, rx2) = mpsc::unbounded_channel();
    let second = assert_ok!(w.generate(Some("chat"), None, "second", tx2).await);

    assert_eq!(assert_ok!(first.await.unwrap()), StreamOutcome::Cancelled);
    assert_eq!(rx1.recv().await, None, "first request got nothing after being superseded");
    assert!(matches!(second, StreamOutcome::Completed(_)));
    assert_eq!(collect(rx2).await.concat(), "two");
    assert!(w.tracker().is_empty());
}

#[tokio::test]
async fn cancel_by_id() {
    let server = ollama(|_, _| Reply::NdjsonHang(vec![(0, chunk("partial"))])).await;
    let w = Arc::new(warden(&server.url, false));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let running = {
        let w = w.clone();
        tokio::spawn(async move { w.generate(Some("job"), None, "go", tx).await })
    };
    assert_eq!(rx.recv().await.as_deref(), Some("partial"));

    assert!(w.cancel("job"));
    assert!(!w.cancel("job"), "second cancel is a no-op");
    assert!(!w.cancel("unknown"));
    assert_eq!(assert_ok!(running.await.unwrap()), StreamOutcome::Cancelled);
}

#[tokio::test]
async fn empty_model_falls_back_to_default() {
    let server = ollama(|_, _| Reply::Json(200, r#"{"response":"hi"}"#.to_string())).await;
    let w = warden(&server.url, false);

    assert_eq!(assert_ok!(w.generate_once(Some("  "), "x").await), "hi");
    assert_eq!(server.requests("/api/generate")[0].json()["model"], "llama3");
}

#[tokio::test]
async fn reconfigure_disposes_old_instance() {
    let server = ollama(|_, _| Reply::Json(200, "{}".to_string())).await;
    let w = warden(&server.url, true);
    let handle = w.tracker().create_request("orphan");
    let mut status = w.subscribe_status().unwrap();

    let new_config = Config {
        api_url: server.url.clone(),
        default_model: "mistral".to_string(),
        status_poll_enabled: false,
        ..Config::default()
    };
    let w = assert_ok!(w.reconfigure(new_config).await);

    assert!(handle.is_cancelled());
    assert_eq!(w.config().default_model, "mistral");
    assert!(w.subscribe_status().is_none());
    // Old poller is gone: its channel closes.
    while status.changed().await.is_ok() {}
}

#[tokio::test]
async fn poller_publishes_running_status() {
    let server = ollama(|_, _| Reply::Json(200, "{}".to_string())).await;
    let w = warden(&server.url, true);
    let mut rx = w.subscribe_status().unwrap();

    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .expect("first poll within 5s")
        .unwrap();
    let status = rx.borrow().clone();
    assert_eq!(status.classification, Some(Classification::Running));
    assert_eq!(status.state, PollerState::StableHealthy);
    w.shutdown().await;
}

#[tokio::test]
async fn status_reports_health_and_requests() {
    let server = ollama(|_, _| Reply::Json(200, "{}".to_string())).await;
    let w = warden(&server.url, false);
    let _live = w.tracker().create_request("x");

    let status = w.status(Some("llama3")).await;
    let health = status.health.as_ref().expect("server is up");
    assert!(health.is_healthy());
    assert_eq!(health.model_present, Some(true));
    assert_eq!(status.live_requests, 1);
    assert!(status.unreachable.is_none());
    assert_eq!(status.spawned_pid, None);
    assert!(!status.starting);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["health"]["state"], "healthy");
}
