//! Prerequisite installer tests

use std::sync::Arc;

use maestro::deploy::installer::PrerequisiteInstaller;

use crate::mocks::{FakeConnection, FakeHost};

#[tokio::test]
async fn test_present_runtime_is_left_alone() {
    let host = Arc::new(FakeHost::new());
    let conn = FakeConnection::new("10.0.0.3", host.clone());

    let ready = PrerequisiteInstaller::default().ensure_runtime(&conn).await.unwrap();

    assert!(!ready.installed);
    assert!(ready.version.starts_with("Docker version 27"));
    assert_eq!(host.installs(), 0);
    assert_eq!(host.commands(), vec!["docker --version"]);
}

#[tokio::test]
async fn test_install_happens_at_most_once() {
    let host = Arc::new(FakeHost::new().without_docker());
    let conn = FakeConnection::new("10.0.0.3", host.clone());
    let installer = PrerequisiteInstaller::default();

    let first = installer.ensure_runtime(&conn).await.unwrap();
    assert!(first.installed);
    assert_eq!(host.installs(), 1);
    assert!(host.docker_installed());

    let second = installer.ensure_runtime(&conn).await.unwrap();
    assert!(!second.installed);
    assert_eq!(second.version, first.version);
    assert_eq!(host.installs(), 1);
}

#[tokio::test]
async fn test_install_downloads_from_configured_url() {
    let host = Arc::new(FakeHost::new().without_docker());
    let conn = FakeConnection::new("10.0.0.3", host.clone());

    PrerequisiteInstaller::new("https://mirror.example.net/docker.sh")
        .ensure_runtime(&conn)
        .await
        .unwrap();

    assert!(host
        .commands()
        .iter()
        .any(|c| c == "curl -fsSL https://mirror.example.net/docker.sh -o /tmp/maestro-get-docker.sh"));
}

#[tokio::test]
async fn test_failed_install_script_reports_exit_code() {
    let host = Arc::new(
        FakeHost::new()
            .without_docker()
            .with_failing_install(100, "E: Unable to locate package docker-ce"),
    );
    let conn = FakeConnection::new("10.0.0.3", host.clone());

    let err = PrerequisiteInstaller::default().ensure_runtime(&conn).await.unwrap_err();

    assert_eq!(err.stage, "install");
    assert_eq!(err.exit_code, Some(100));
    assert!(err.detail.contains("docker-ce"));
    assert!(!host.docker_installed());
}

#[tokio::test]
async fn test_runtime_still_missing_after_install_fails_confirmation() {
    let host = Arc::new(FakeHost::new().without_docker().with_noop_install());
    let conn = FakeConnection::new("10.0.0.3", host.clone());

    let err = PrerequisiteInstaller::default().ensure_runtime(&conn).await.unwrap_err();

    assert_eq!(err.stage, "confirm");
    assert_eq!(err.exit_code, None);
    assert_eq!(host.installs(), 1);
}

#[tokio::test]
async fn test_refused_group_add_does_not_fail_install() {
    let host = Arc::new(FakeHost::new().without_docker().with_failing_group_add());
    let conn = FakeConnection::new("10.0.0.3", host.clone());

    let ready = PrerequisiteInstaller::default().ensure_runtime(&conn).await.unwrap();

    assert!(ready.installed);
    assert!(host.commands().iter().any(|c| c.contains("usermod -aG docker")));
}
