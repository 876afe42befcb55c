//! Engine API runtime tests against a mock daemon

use std::time::Duration;

use mockito::Matcher;
use url::Url;

use maestro::config::{ImageSpec, VerifyPolicy};
use maestro::deploy::builder::BuildArtifact;
use maestro::deploy::deployer::{ContainerDeployer, Options};
use maestro::deploy::engine::EngineApiRuntime;
use maestro::deploy::runtime::{ContainerRequest, ContainerRuntime, StopOutcome};
use maestro::errors::DeployStage;

fn runtime(server: &mockito::ServerGuard) -> EngineApiRuntime {
    EngineApiRuntime::new(Url::parse(&server.url()).unwrap(), Duration::from_secs(5)).unwrap()
}

fn request() -> ContainerRequest {
    ContainerRequest {
        name: "horizon".to_string(),
        image: "horizon-server:latest".to_string(),
        ports: vec!["7777:7777/udp".to_string()],
        restart_policy: None,
    }
}

#[tokio::test]
async fn test_status_of_missing_and_running_containers() {
    let mut server = mockito::Server::new_async().await;
    let _missing = server
        .mock("GET", "/containers/ghost/json")
        .with_status(404)
        .with_body(r#"{"message":"No such container: ghost"}"#)
        .create_async()
        .await;
    let _running = server
        .mock("GET", "/containers/horizon/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"Id":"4f1c","State":{"Status":"running","Running":true}}"#)
        .create_async()
        .await;

    let runtime = runtime(&server);
    assert_eq!(runtime.status("ghost").await.unwrap(), None);
    assert_eq!(runtime.status("horizon").await.unwrap().as_deref(), Some("running"));
}

#[tokio::test]
async fn test_create_conflict_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    let _conflict = server
        .mock("POST", "/containers/create")
        .match_query(Matcher::UrlEncoded("name".into(), "horizon".into()))
        .with_status(409)
        .with_body(r#"{"message":"Conflict. The container name \"/horizon\" is already in use"}"#)
        .create_async()
        .await;

    let err = runtime(&server).create(&request()).await.unwrap_err();
    assert!(err.0.contains("HTTP 409"));
    assert!(err.0.contains("already in use"));
}

#[tokio::test]
async fn test_create_sends_port_bindings() {
    let mut server = mockito::Server::new_async().await;
    let created = server
        .mock("POST", "/containers/create")
        .match_query(Matcher::UrlEncoded("name".into(), "horizon".into()))
        .match_body(Matcher::PartialJsonString(
            r#"{"Image":"horizon-server:latest","HostConfig":{"PortBindings":{"7777/udp":[{"HostPort":"7777"}]}}}"#
                .to_string(),
        ))
        .with_status(201)
        .with_body(r#"{"Id":"4f1c","Warnings":[]}"#)
        .create_async()
        .await;

    runtime(&server).create(&request()).await.unwrap();
    created.assert_async().await;
}

#[tokio::test]
async fn test_stop_of_stopped_container() {
    let mut server = mockito::Server::new_async().await;
    let _not_modified = server
        .mock("POST", "/containers/horizon/stop")
        .with_status(304)
        .create_async()
        .await;
    let _missing = server
        .mock("POST", "/containers/ghost/stop")
        .with_status(404)
        .create_async()
        .await;

    let runtime = runtime(&server);
    assert_eq!(runtime.stop("horizon").await.unwrap(), StopOutcome::AlreadyStopped);
    assert_eq!(runtime.stop("ghost").await.unwrap(), StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_list_strips_leading_slash() {
    let mut server = mockito::Server::new_async().await;
    let _list = server
        .mock("GET", "/containers/json")
        .match_query(Matcher::UrlEncoded("all".into(), "true".into()))
        .with_status(200)
        .with_body(r#"[{"Names":["/horizon"]},{"Names":["/horizon-1"]},{"Names":["/other"]}]"#)
        .create_async()
        .await;

    let names = runtime(&server).list("horizon").await.unwrap();
    assert_eq!(names, vec!["horizon", "horizon-1"]);
}

#[tokio::test]
async fn test_deploy_through_engine_api() {
    let mut server = mockito::Server::new_async().await;
    let _inspect_old = server
        .mock("GET", "/containers/horizon/json")
        .with_status(200)
        .with_body(r#"{"State":{"Status":"running"}}"#)
        .expect_at_least(2)
        .create_async()
        .await;
    let stop = server
        .mock("POST", "/containers/horizon/stop")
        .with_status(204)
        .create_async()
        .await;
    let remove = server
        .mock("DELETE", "/containers/horizon")
        .with_status(204)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/containers/create")
        .match_query(Matcher::Any)
        .with_status(201)
        .with_body(r#"{"Id":"9a0b"}"#)
        .create_async()
        .await;
    let start = server
        .mock("POST", "/containers/horizon/start")
        .with_status(204)
        .create_async()
        .await;
    let _list = server
        .mock("GET", "/containers/json")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"[{"Names":["/horizon"]}]"#)
        .create_async()
        .await;

    let deployer = ContainerDeployer::new(Options {
        verify: VerifyPolicy {
            attempts: 2,
            interval: Duration::from_millis(5),
        },
        ..Options::default()
    });
    let deployed = deployer
        .deploy(
            &runtime(&server),
            &ImageSpec::new("horizon-server:latest", "horizon"),
            &BuildArtifact::existing("horizon-server:latest"),
        )
        .await
        .unwrap();

    assert_eq!(deployed.containers, vec!["horizon"]);
    stop.assert_async().await;
    remove.assert_async().await;
    create.assert_async().await;
    start.assert_async().await;
}

#[tokio::test]
async fn test_pull_error_in_progress_stream_fails_the_pull_stage() {
    let mut server = mockito::Server::new_async().await;
    let _pull = server
        .mock("POST", "/images/create")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("fromImage".into(), "horizon-server".into()),
            Matcher::UrlEncoded("tag".into(), "nope".into()),
        ]))
        .with_status(200)
        .with_body(concat!(
            r#"{"status":"Pulling from library/horizon-server","id":"nope"}"#,
            "\n",
            r#"{"errorDetail":{"message":"manifest unknown"},"error":"manifest unknown"}"#,
            "\n",
        ))
        .create_async()
        .await;
    let create = server
        .mock("POST", "/containers/create")
        .match_query(Matcher::Any)
        .with_status(201)
        .expect(0)
        .create_async()
        .await;

    let err = runtime(&server).pull("horizon-server:nope").await.unwrap_err();
    assert!(err.0.contains("manifest unknown"));

    let deployer = ContainerDeployer::new(Options {
        pull: true,
        ..Options::default()
    });
    let err = deployer
        .deploy(
            &runtime(&server),
            &ImageSpec::new("horizon-server:nope", "horizon"),
            &BuildArtifact::existing("horizon-server:nope"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.stage, DeployStage::Pull);
    assert!(err.detail.contains("manifest unknown"));
    create.assert_async().await;
}

#[tokio::test]
async fn test_completed_pull_is_ok() {
    let mut server = mockito::Server::new_async().await;
    let _pull = server
        .mock("POST", "/images/create")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(concat!(
            r#"{"status":"Pulling fs layer","id":"a1b2"}"#,
            "\n",
            r#"{"status":"Status: Downloaded newer image for horizon-server:latest"}"#,
            "\n",
        ))
        .create_async()
        .await;

    runtime(&server).pull("horizon-server:latest").await.unwrap();
}
