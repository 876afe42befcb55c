//! Side-channel wire format
//!
//! Every frame is a JSON text message carrying an envelope
//! `{ "v": <version>, "type": <name>, ... }`. Readers ignore unknown fields
//! and unknown message types so both ends can evolve independently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deploy::coordinator::TargetUpdate;
use crate::deploy::fsm::TargetStateKind;
use crate::deploy::summary::DeploymentSummary;
use crate::errors::ProtocolError;

/// Version written on every outgoing frame
pub const PROTOCOL_VERSION: u64 = 1;

/// Oldest version still accepted
pub const MIN_PROTOCOL_VERSION: u64 = 1;

/// Host that failed in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedHost {
    pub address: String,
    pub stage: String,
    pub reason: String,
}

/// Orchestrator to dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    TargetStateChanged {
        run_id: String,
        address: String,
        state: TargetStateKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SummaryReady {
        run_id: String,
        total: usize,
        succeeded: Vec<String>,
        failed: Vec<FailedHost>,
    },
}

impl From<&TargetUpdate> for StatusEvent {
    fn from(update: &TargetUpdate) -> Self {
        StatusEvent::TargetStateChanged {
            run_id: update.run_id.clone(),
            address: update.address.clone(),
            state: update.state,
            stage: update.failure.as_ref().map(|f| f.stage()),
            reason: update.failure.as_ref().map(|f| f.to_string()),
        }
    }
}

impl From<&DeploymentSummary> for StatusEvent {
    fn from(summary: &DeploymentSummary) -> Self {
        StatusEvent::SummaryReady {
            run_id: summary.run_id.clone(),
            total: summary.total,
            succeeded: summary.succeeded.clone(),
            failed: summary
                .failed
                .iter()
                .map(|(address, reason)| FailedHost {
                    address: address.clone(),
                    stage: reason.stage(),
                    reason: reason.to_string(),
                })
                .collect(),
        }
    }
}

/// Dashboard to orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    RedeployHost { address: String },
    ScaleRequest { count: u32 },
    #[serde(other)]
    Unknown,
}

/// Serialize a message inside a versioned envelope
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(message).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    match value.as_object_mut() {
        Some(object) => {
            object.insert("v".to_string(), Value::from(PROTOCOL_VERSION));
        }
        None => return Err(ProtocolError::Malformed("message is not an object".to_string())),
    }
    Ok(value.to_string())
}

/// Parse an enveloped message
///
/// A missing `v` counts as version 1.
pub fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed("message is not an object".to_string()));
    }

    let version = match value.get("v") {
        None => 1,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| ProtocolError::Malformed(format!("invalid version {}", v)))?,
    };
    if version < MIN_PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            found: version,
            minimum: MIN_PROTOCOL_VERSION,
        });
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
