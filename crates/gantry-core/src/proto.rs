//! Worker ↔ manager wire protocol.
//!
//! Length-delimited frames carrying JSON-serialized typed messages, over
//! any ordered byte stream (TCP in production, a duplex pipe in tests).
//! Messages are bit-stable within a protocol version; a version mismatch
//! at handshake makes the worker exit so its supervisor can replace it.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use gantry_db::defs::{HardwareConfig, OsConfig, TestDefinition};

/// Bump on any incompatible message change.
pub const PROTOCOL_VERSION: u32 = 3;

/// A build dependency the worker must download before running:
/// `(build test hash, exposed name, artifact name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDependencyRef {
    pub build_hash: String,
    pub expose_as: String,
    pub artifact: String,
}

/// Work handed to a worker at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAssignment {
    pub run_id: Uuid,
    pub test_hash: String,
    pub definition: TestDefinition,
    pub build_dependencies: Vec<BuildDependencyRef>,
}

/// An interactive deployment handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentAssignment {
    pub deployment_id: Uuid,
    pub test_hash: String,
    pub definition: TestDefinition,
    pub build_dependencies: Vec<BuildDependencyRef>,
}

/// Per-sub-test outcome reported at finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualTestResult {
    pub name: String,
    pub success: bool,
    pub has_logs: bool,
}

/// Messages sent by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Handshake {
        machine_id: String,
        hardware: HardwareConfig,
        os: OsConfig,
        protocol_version: u32,
    },
    Heartbeat {
        machine_id: String,
        #[serde(default)]
        message: Option<String>,
    },
    RequestWork {
        machine_id: String,
    },
    ReportArtifactUploaded {
        run_id: Uuid,
        artifact_name: String,
    },
    ReportTestRunResult {
        run_id: Uuid,
        success: bool,
        individual_tests: Vec<IndividualTestResult>,
        started_ts: f64,
        ended_ts: f64,
    },
    TerminalOutput {
        deployment_id: Uuid,
        bytes: Vec<u8>,
    },
}

/// Terminal input pushed to a worker running a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalInput {
    KeyboardInput {
        bytes: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
}

/// Messages sent by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    HandshakeAccepted,
    ProtocolMismatch {
        expected: u32,
    },
    Ack,
    CancelTestRun {
        run_id: Uuid,
    },
    NoWork,
    Test(TestAssignment),
    Deployment(DeploymentAssignment),
    TerminalInput {
        deployment_id: Uuid,
        input: TerminalInput,
    },
}

/// Frame a byte stream for protocol messages.
pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> Framed<S, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .max_frame_length(64 * 1024 * 1024)
        .new_framed(stream)
}

/// Encode a message to a frame payload.
pub fn encode<M: Serialize>(message: &M) -> Result<bytes_shim::Bytes, serde_json::Error> {
    serde_json::to_vec(message).map(bytes_shim::Bytes::from)
}

/// Decode a frame payload.
pub fn decode<'de, M: Deserialize<'de>>(payload: &'de [u8]) -> Result<M, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Re-export of the `bytes` types tokio-util's codec hands us.
pub mod bytes_shim {
    pub use tokio_util::bytes::{Bytes, BytesMut};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_messages_round_trip() {
        let msg = WorkerMessage::Heartbeat {
            machine_id: "m-1".into(),
            message: Some("running stage 2".into()),
        };
        let bytes = encode(&msg).unwrap();
        let back: WorkerMessage = decode(&bytes).unwrap();
        match back {
            WorkerMessage::Heartbeat {
                machine_id,
                message,
            } => {
                assert_eq!(machine_id, "m-1");
                assert_eq!(message.as_deref(), Some("running stage 2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminal_bytes_round_trip() {
        for payload in [b"".to_vec(), b"x".to_vec(), b"ab".to_vec(), vec![0, 255, 7, 42]] {
            let msg = TerminalInput::KeyboardInput {
                bytes: payload.clone(),
            };
            let bytes = encode(&msg).unwrap();
            let back: TerminalInput = decode(&bytes).unwrap();
            assert_eq!(
                back,
                TerminalInput::KeyboardInput { bytes: payload }
            );
        }
    }

    #[test]
    fn manager_message_tags_are_stable() {
        let json = serde_json::to_string(&ManagerMessage::NoWork).unwrap();
        assert_eq!(json, r#"{"type":"no_work"}"#);
        let json = serde_json::to_string(&ManagerMessage::ProtocolMismatch { expected: 3 }).unwrap();
        assert!(json.contains(r#""type":"protocol_mismatch""#));
    }
}
