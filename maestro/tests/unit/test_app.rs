//! Application run loop tests

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use maestro::app::options::AppOptions;
use maestro::app::run::run_with_coordinator;
use maestro::config::FleetConfig;
use maestro::deploy::coordinator::Coordinator;
use maestro::notifier::link;

use crate::mocks::{Behavior, CountingBuilder, FakeConnector, FakeHost};

const WAIT: Duration = Duration::from_secs(10);

fn fleet(notifier: &str) -> FleetConfig {
    fleet_of(&["10.0.0.1"], notifier, "")
}

fn fleet_of(addresses: &[&str], notifier: &str, extra: &str) -> FleetConfig {
    let hosts: Vec<String> = addresses
        .iter()
        .map(|a| format!(r#"{{ address = "{a}", username = "ops", auth_method = {{ Password = "x" }} }}"#))
        .collect();
    FleetConfig::from_toml(&format!(
        r#"
[deployment]
skip_build = true
hosts = [{hosts}]

[docker]
image_name = "horizon-server:latest"
container_name = "horizon"

[notifier]
{notifier}

{extra}
"#,
        hosts = hosts.join(", ")
    ))
    .unwrap()
}

fn link_to(dashboard: &TcpListener) -> link::Options {
    link::Options {
        url: Url::parse(&format!("ws://{}/", dashboard.local_addr().unwrap())).unwrap(),
        ..link::Options::for_port(1).unwrap()
    }
}

fn coordinator(host: Arc<FakeHost>) -> Coordinator {
    let connector = FakeConnector::new().with("10.0.0.1", Behavior::Accept(host));
    Coordinator::new(Arc::new(connector), Arc::new(CountingBuilder::new()))
}

#[tokio::test]
async fn test_once_returns_first_summary() {
    let host = Arc::new(FakeHost::new());
    let options = AppOptions::new(fleet("enabled = false"), true).unwrap();

    let summary = tokio::time::timeout(
        WAIT,
        run_with_coordinator(options, coordinator(host.clone()), std::future::pending()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.succeeded, vec!["10.0.0.1"]);
    assert_eq!(host.container("horizon").as_deref(), Some("running"));
}

#[tokio::test]
async fn test_scale_request_from_dashboard_redeploys_fleet() {
    let dashboard = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut options = AppOptions::new(fleet("listen_port = 0"), false).unwrap();
    options.notifier.dashboard_link = Some(link_to(&dashboard));

    let host = Arc::new(FakeHost::new());
    let (stop, stopped) = oneshot::channel::<()>();
    let app = tokio::spawn(run_with_coordinator(options, coordinator(host.clone()), async move {
        let _ = stopped.await;
    }));

    let (stream, _) = tokio::time::timeout(WAIT, dashboard.accept()).await.unwrap().unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    ws.send(Message::Text(r#"{"v":1,"type":"ScaleRequest","count":2}"#.into()))
        .await
        .unwrap();

    // The scaled run is the second to list containers; wait for its summary
    tokio::time::timeout(WAIT, async {
        let mut last_run = Value::Null;
        loop {
            let text = match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(_)) => continue,
                other => panic!("dashboard link closed: {other:?}"),
            };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] == "TargetStateChanged" && frame["state"] == "connecting" {
                last_run = frame["run_id"].clone();
            }
            let listings = host.docker_verbs().iter().filter(|v| *v == "ps").count();
            if frame["type"] == "SummaryReady" && frame["run_id"] == last_run && listings >= 2 {
                break;
            }
        }
    })
    .await
    .expect("no summary for the scaled run");

    let _ = stop.send(());
    let summary = tokio::time::timeout(WAIT, app).await.unwrap().unwrap().unwrap();

    assert!(summary.is_success());
    assert_eq!(host.container_names(), vec!["horizon", "horizon-1"]);
}

async fn next_summary<S>(ws: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(_)) => continue,
            other => panic!("dashboard link closed: {other:?}"),
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        if frame["type"] == "SummaryReady" {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_redeploy_keeps_other_hosts_in_summary() {
    let dashboard = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut options = AppOptions::new(fleet_of(&["10.0.0.1", "10.0.0.9"], "listen_port = 0", ""), false).unwrap();
    options.notifier.dashboard_link = Some(link_to(&dashboard));

    let healthy = Arc::new(FakeHost::new());
    let connector = Arc::new(
        FakeConnector::new()
            .with("10.0.0.1", Behavior::Accept(healthy.clone()))
            .with("10.0.0.9", Behavior::Refuse),
    );
    let coordinator = Coordinator::new(connector.clone(), Arc::new(CountingBuilder::new()));
    let (stop, stopped) = oneshot::channel::<()>();
    let app = tokio::spawn(run_with_coordinator(options, coordinator, async move {
        let _ = stopped.await;
    }));

    // Let the first run finish before the link subscribes, so every frame belongs to the redeploy
    tokio::time::timeout(WAIT, async {
        while connector.attempts().len() < 2 || !healthy.docker_verbs().iter().any(|v| v == "ps") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first run never finished");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (stream, _) = tokio::time::timeout(WAIT, dashboard.accept()).await.unwrap().unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    ws.send(Message::Text(r#"{"v":1,"type":"RedeployHost","address":"10.0.0.1"}"#.into()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(WAIT, next_summary(&mut ws))
        .await
        .expect("no summary for the redeploy");
    assert_eq!(frame["total"], 2);
    assert_eq!(frame["succeeded"], serde_json::json!(["10.0.0.1"]));
    assert_eq!(frame["failed"][0]["address"], "10.0.0.9");

    let _ = stop.send(());
    let summary = tokio::time::timeout(WAIT, app).await.unwrap().unwrap().unwrap();

    let redeploys = connector.attempts().iter().filter(|a| *a == "10.0.0.1").count();
    assert_eq!(redeploys, 2);
    assert_eq!(summary.total, 2);
    assert!(!summary.is_success());
    assert_eq!(summary.failed[0].0, "10.0.0.9");
    let order: Vec<&str> = summary.entries.iter().map(|e| e.address.as_str()).collect();
    assert_eq!(order, ["10.0.0.1", "10.0.0.9"]);
}

#[tokio::test]
async fn test_failing_dashboard_does_not_affect_deployment() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("install"), "echo install >> calls.log\nexit 1\n").unwrap();
    let npm = format!("[npm]\ndashboard_path = {:?}\n", dir.path().to_str().unwrap());
    let mut options = AppOptions::new(fleet_of(&["10.0.0.1"], "enabled = false", &npm), true).unwrap();
    if let Some(dashboard) = options.dashboard.as_mut() {
        dashboard.program = "sh".to_string();
    }

    let host = Arc::new(FakeHost::new().with_exec_delay(Duration::from_millis(50)));
    let summary = tokio::time::timeout(
        WAIT,
        run_with_coordinator(options, coordinator(host.clone()), std::future::pending()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(summary.is_success());
    assert_eq!(host.container("horizon").as_deref(), Some("running"));
    assert_eq!(fs::read_to_string(dir.path().join("calls.log")).unwrap(), "install\n");
}
