//! FSM unit tests

use maestro::deploy::fsm::{TargetEvent, TargetFsm, TargetState, TargetStateKind};
use maestro::errors::{ConnectionError, FailureReason, InstallError};

#[test]
fn test_fsm_initial_state() {
    let fsm = TargetFsm::new();
    assert_eq!(fsm.state(), &TargetState::Pending);
    assert!(!fsm.state().is_terminal());
    assert!(fsm.state().failure().is_none());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = TargetFsm::new();

    fsm.process(TargetEvent::Connect).unwrap();
    assert_eq!(fsm.state(), &TargetState::Connecting);

    fsm.process(TargetEvent::Install).unwrap();
    assert_eq!(fsm.state(), &TargetState::Installing);

    fsm.process(TargetEvent::Build).unwrap();
    assert_eq!(fsm.state(), &TargetState::Building);

    fsm.process(TargetEvent::Deploy).unwrap();
    assert_eq!(fsm.state(), &TargetState::Deploying);

    fsm.process(TargetEvent::Succeed).unwrap();
    assert_eq!(fsm.state().kind(), TargetStateKind::Succeeded);
    assert!(fsm.state().is_terminal());
}

#[test]
fn test_fsm_failure_keeps_reason() {
    let mut fsm = TargetFsm::new();
    fsm.process(TargetEvent::Connect).unwrap();
    fsm.process(TargetEvent::Install).unwrap();

    let reason = FailureReason::Install(InstallError::new("script", Some(100), "E: Unable to locate package"));
    fsm.process(TargetEvent::Fail(reason.clone())).unwrap();

    assert_eq!(fsm.state().kind(), TargetStateKind::Failed);
    assert_eq!(fsm.state().failure(), Some(&reason));
}

#[test]
fn test_fsm_terminal_states_reject_events() {
    let mut fsm = TargetFsm::new();
    fsm.process(TargetEvent::Connect).unwrap();
    fsm.process(TargetEvent::Fail(FailureReason::Connection(ConnectionError::Unreachable {
        address: "10.0.0.9".to_string(),
        reason: "No route to host".to_string(),
    })))
    .unwrap();

    // No retry within a run
    assert!(fsm.process(TargetEvent::Connect).is_err());
    assert!(fsm.process(TargetEvent::Fail(FailureReason::Cancelled)).is_err());
    assert_eq!(fsm.state().kind(), TargetStateKind::Failed);
}

#[test]
fn test_fsm_rejects_skipped_stages() {
    let mut fsm = TargetFsm::new();
    assert!(fsm.process(TargetEvent::Deploy).is_err());
    assert!(fsm.process(TargetEvent::Succeed).is_err());
    assert_eq!(fsm.state(), &TargetState::Pending);

    fsm.process(TargetEvent::Connect).unwrap();
    assert!(fsm.process(TargetEvent::Build).is_err());
    assert_eq!(fsm.state(), &TargetState::Connecting);
}

#[test]
fn test_fsm_pending_target_can_be_cancelled() {
    let mut fsm = TargetFsm::new();
    fsm.process(TargetEvent::Fail(FailureReason::Cancelled)).unwrap();
    assert_eq!(fsm.state().failure(), Some(&FailureReason::Cancelled));
}

#[test]
fn test_state_kind_wire_names() {
    assert_eq!(serde_json::to_string(&TargetStateKind::Installing).unwrap(), "\"installing\"");
    assert_eq!(serde_json::to_string(&TargetStateKind::Succeeded).unwrap(), "\"succeeded\"");
}
