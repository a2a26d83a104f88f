//! The worker's view of the manager.
//!
//! The execution engine talks through [`ManagerLink`] so it runs the same
//! against a TCP connection or an in-process manager (single-binary
//! deployments and tests).

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use gantry_db::defs::{HardwareConfig, OsConfig};

use crate::manager::dispatch::{Assignment, HeartbeatResponse};
use crate::manager::TestManager;
use crate::proto::{
    self, DeploymentAssignment, IndividualTestResult, ManagerMessage, TerminalInput,
    TestAssignment, WorkerMessage, PROTOCOL_VERSION,
};

/// One piece of work from the manager.
#[derive(Debug, Clone)]
pub enum WorkItem {
    Test(TestAssignment),
    Deployment(DeploymentAssignment),
}

/// What the engine needs from the manager.
#[async_trait]
pub trait ManagerLink: Send + Sync {
    async fn request_work(&self) -> Result<Option<WorkItem>>;

    async fn heartbeat(&self, message: Option<String>) -> Result<HeartbeatResponse>;

    async fn report_artifact_uploaded(&self, run_id: Uuid, artifact_name: &str) -> Result<()>;

    async fn report_test_run_result(
        &self,
        run_id: Uuid,
        success: bool,
        individual_tests: Vec<IndividualTestResult>,
        started_ts: f64,
        ended_ts: f64,
    ) -> Result<()>;

    async fn terminal_output(&self, deployment_id: Uuid, bytes: Vec<u8>) -> Result<()>;

    /// Next keyboard/resize input for a deployment, if any arrived.
    async fn poll_terminal_input(&self, deployment_id: Uuid) -> Result<Option<TerminalInput>>;
}

// ---------------------------------------------------------------------------
// TCP link
// ---------------------------------------------------------------------------

/// Strict request/response over one framed TCP stream; pushed terminal
/// input arriving between responses is stashed and polled separately.
pub struct TcpManagerLink {
    machine_id: String,
    framed: Mutex<Framed<TcpStream, LengthDelimitedCodec>>,
    stashed_inputs: Mutex<VecDeque<(Uuid, TerminalInput)>>,
}

impl TcpManagerLink {
    /// Connect and handshake. A protocol mismatch is fatal: the worker
    /// process exits and its supervisor restarts it with matching code.
    pub async fn connect(
        addr: &str,
        machine_id: &str,
        hardware: HardwareConfig,
        os: OsConfig,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to manager at {addr}"))?;
        let mut framed = proto::framed(stream);

        let handshake = WorkerMessage::Handshake {
            machine_id: machine_id.to_string(),
            hardware,
            os,
            protocol_version: PROTOCOL_VERSION,
        };
        framed
            .send(proto::encode(&handshake)?)
            .await
            .context("sending handshake")?;

        let frame = framed
            .next()
            .await
            .context("manager closed during handshake")?
            .context("reading handshake response")?;
        match proto::decode::<ManagerMessage>(&frame)? {
            ManagerMessage::HandshakeAccepted => {}
            ManagerMessage::ProtocolMismatch { expected } => {
                bail!(
                    "protocol mismatch: manager speaks version {expected}, we speak {PROTOCOL_VERSION}"
                );
            }
            other => bail!("unexpected handshake response: {other:?}"),
        }

        Ok(TcpManagerLink {
            machine_id: machine_id.to_string(),
            framed: Mutex::new(framed),
            stashed_inputs: Mutex::new(VecDeque::new()),
        })
    }

    /// Send one message and wait for its response, stashing pushes.
    async fn call(&self, message: WorkerMessage) -> Result<ManagerMessage> {
        let mut framed = self.framed.lock().await;
        framed
            .send(proto::encode(&message)?)
            .await
            .context("sending worker message")?;
        loop {
            let frame = framed
                .next()
                .await
                .context("manager closed connection")?
                .context("reading manager response")?;
            match proto::decode::<ManagerMessage>(&frame)? {
                ManagerMessage::TerminalInput {
                    deployment_id,
                    input,
                } => {
                    self.stashed_inputs
                        .lock()
                        .await
                        .push_back((deployment_id, input));
                }
                response => return Ok(response),
            }
        }
    }
}

#[async_trait]
impl ManagerLink for TcpManagerLink {
    async fn request_work(&self) -> Result<Option<WorkItem>> {
        let response = self
            .call(WorkerMessage::RequestWork {
                machine_id: self.machine_id.clone(),
            })
            .await?;
        match response {
            ManagerMessage::NoWork => Ok(None),
            ManagerMessage::Test(assignment) => Ok(Some(WorkItem::Test(assignment))),
            ManagerMessage::Deployment(assignment) => Ok(Some(WorkItem::Deployment(assignment))),
            other => bail!("unexpected response to work request: {other:?}"),
        }
    }

    async fn heartbeat(&self, message: Option<String>) -> Result<HeartbeatResponse> {
        let response = self
            .call(WorkerMessage::Heartbeat {
                machine_id: self.machine_id.clone(),
                message,
            })
            .await?;
        match response {
            ManagerMessage::Ack => Ok(HeartbeatResponse::Ack),
            ManagerMessage::CancelTestRun { run_id } => {
                Ok(HeartbeatResponse::CancelTestRun(run_id))
            }
            other => bail!("unexpected response to heartbeat: {other:?}"),
        }
    }

    async fn report_artifact_uploaded(&self, run_id: Uuid, artifact_name: &str) -> Result<()> {
        self.call(WorkerMessage::ReportArtifactUploaded {
            run_id,
            artifact_name: artifact_name.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn report_test_run_result(
        &self,
        run_id: Uuid,
        success: bool,
        individual_tests: Vec<IndividualTestResult>,
        started_ts: f64,
        ended_ts: f64,
    ) -> Result<()> {
        self.call(WorkerMessage::ReportTestRunResult {
            run_id,
            success,
            individual_tests,
            started_ts,
            ended_ts,
        })
        .await?;
        Ok(())
    }

    async fn terminal_output(&self, deployment_id: Uuid, bytes: Vec<u8>) -> Result<()> {
        // Fire-and-forget: no response frame for terminal output.
        let mut framed = self.framed.lock().await;
        framed
            .send(proto::encode(&WorkerMessage::TerminalOutput {
                deployment_id,
                bytes,
            })?)
            .await
            .context("sending terminal output")?;
        Ok(())
    }

    async fn poll_terminal_input(&self, deployment_id: Uuid) -> Result<Option<TerminalInput>> {
        let mut stash = self.stashed_inputs.lock().await;
        if let Some(pos) = stash.iter().position(|(id, _)| *id == deployment_id) {
            return Ok(stash.remove(pos).map(|(_, input)| input));
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// In-process link
// ---------------------------------------------------------------------------

/// Direct calls into a co-located manager. Used by tests and by
/// single-process deployments that run a worker thread beside the
/// scheduler.
pub struct InProcessLink {
    manager: Arc<TestManager>,
    machine_id: String,
    input_receivers: Mutex<std::collections::HashMap<Uuid, tokio::sync::mpsc::Receiver<TerminalInput>>>,
}

impl InProcessLink {
    pub async fn new(
        manager: Arc<TestManager>,
        machine_id: &str,
        hardware: HardwareConfig,
        os: OsConfig,
    ) -> Result<Self> {
        manager.register_machine(machine_id, hardware, os).await?;
        Ok(InProcessLink {
            manager,
            machine_id: machine_id.to_string(),
            input_receivers: Mutex::new(std::collections::HashMap::new()),
        })
    }
}

#[async_trait]
impl ManagerLink for InProcessLink {
    async fn request_work(&self) -> Result<Option<WorkItem>> {
        match self.manager.check_out_test(&self.machine_id).await? {
            Assignment::None => Ok(None),
            Assignment::Test(assignment) => Ok(Some(WorkItem::Test(assignment))),
            Assignment::Deployment(assignment) => {
                if let Some(rx) = self
                    .manager
                    .deployments()
                    .take_input_receiver(assignment.deployment_id)
                {
                    self.input_receivers
                        .lock()
                        .await
                        .insert(assignment.deployment_id, rx);
                }
                Ok(Some(WorkItem::Deployment(assignment)))
            }
        }
    }

    async fn heartbeat(&self, message: Option<String>) -> Result<HeartbeatResponse> {
        self.manager.heartbeat(&self.machine_id, message).await
    }

    async fn report_artifact_uploaded(&self, run_id: Uuid, artifact_name: &str) -> Result<()> {
        self.manager
            .record_artifact_uploaded(run_id, artifact_name)
            .await
    }

    async fn report_test_run_result(
        &self,
        run_id: Uuid,
        success: bool,
        individual_tests: Vec<IndividualTestResult>,
        _started_ts: f64,
        ended_ts: f64,
    ) -> Result<()> {
        self.manager
            .record_test_results(run_id, success, individual_tests, ended_ts)
            .await
    }

    async fn terminal_output(&self, deployment_id: Uuid, bytes: Vec<u8>) -> Result<()> {
        let now = self.manager.clock().now();
        self.manager
            .deployments()
            .publish_output(deployment_id, bytes, now);
        Ok(())
    }

    async fn poll_terminal_input(&self, deployment_id: Uuid) -> Result<Option<TerminalInput>> {
        let mut receivers = self.input_receivers.lock().await;
        let Some(rx) = receivers.get_mut(&deployment_id) else {
            return Ok(None);
        };
        Ok(rx.try_recv().ok())
    }
}
