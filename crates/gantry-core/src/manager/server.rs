//! Protocol server: accepts worker connections and translates frames into
//! manager calls.
//!
//! One writer task per connection serializes all outbound frames; the
//! reader loop and any deployment input forwarders hand it messages
//! through a channel, so pushes and responses never interleave mid-frame.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::proto::{self, ManagerMessage, WorkerMessage, PROTOCOL_VERSION};

use super::dispatch::{Assignment, HeartbeatResponse};
use super::TestManager;

/// Accept loop. Runs until cancelled.
pub async fn serve(
    manager: Arc<TestManager>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("accepting worker connection")?,
        };
        tracing::info!(peer = %peer, "worker connected");
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(manager, stream, cancel).await {
                tracing::warn!(peer = %peer, error = %e, "worker connection ended with error");
            } else {
                tracing::info!(peer = %peer, "worker disconnected");
            }
        });
    }
}

/// Serve one worker over any ordered byte stream.
pub async fn handle_connection<S>(
    manager: Arc<TestManager>,
    stream: S,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let framed = proto::framed(Box::pin(stream));
    let (mut sink, mut source) = framed.split();

    // Single writer: everything outbound goes through this channel.
    let (out_tx, mut out_rx) = mpsc::channel::<ManagerMessage>(64);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let payload = match proto::encode(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode manager message");
                    continue;
                }
            };
            if sink.send(payload).await.is_err() {
                return;
            }
        }
    });

    // Handshake first.
    let machine_id = {
        let Some(first) = source.next().await else {
            return Ok(());
        };
        let frame = first.context("reading handshake frame")?;
        let message: WorkerMessage = proto::decode(&frame).context("decoding handshake")?;
        let WorkerMessage::Handshake {
            machine_id,
            hardware,
            os,
            protocol_version,
        } = message
        else {
            anyhow::bail!("first frame was not a handshake");
        };

        if protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                machine_id = %machine_id,
                theirs = protocol_version,
                ours = PROTOCOL_VERSION,
                "protocol mismatch"
            );
            let _ = out_tx
                .send(ManagerMessage::ProtocolMismatch {
                    expected: PROTOCOL_VERSION,
                })
                .await;
            drop(out_tx);
            let _ = writer.await;
            return Ok(());
        }

        manager.register_machine(&machine_id, hardware, os).await?;
        out_tx
            .send(ManagerMessage::HandshakeAccepted)
            .await
            .context("sending handshake ack")?;
        machine_id
    };

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next() => match frame {
                Some(frame) => frame.context("reading worker frame")?,
                None => break,
            },
        };
        let message: WorkerMessage = proto::decode(&frame).context("decoding worker frame")?;

        match message {
            WorkerMessage::Handshake { .. } => {
                anyhow::bail!("unexpected second handshake from {machine_id}");
            }
            WorkerMessage::Heartbeat {
                machine_id,
                message,
            } => {
                let response = match manager.heartbeat(&machine_id, message).await? {
                    HeartbeatResponse::Ack => ManagerMessage::Ack,
                    HeartbeatResponse::CancelTestRun(run_id) => {
                        ManagerMessage::CancelTestRun { run_id }
                    }
                };
                out_tx.send(response).await.ok();
            }
            WorkerMessage::RequestWork { machine_id } => {
                let response = match manager.check_out_test(&machine_id).await? {
                    Assignment::None => ManagerMessage::NoWork,
                    Assignment::Test(assignment) => ManagerMessage::Test(assignment),
                    Assignment::Deployment(assignment) => {
                        spawn_input_forwarder(&manager, assignment.deployment_id, out_tx.clone());
                        ManagerMessage::Deployment(assignment)
                    }
                };
                out_tx.send(response).await.ok();
            }
            WorkerMessage::ReportArtifactUploaded {
                run_id,
                artifact_name,
            } => {
                manager
                    .record_artifact_uploaded(run_id, &artifact_name)
                    .await?;
                out_tx.send(ManagerMessage::Ack).await.ok();
            }
            WorkerMessage::ReportTestRunResult {
                run_id,
                success,
                individual_tests,
                started_ts: _,
                ended_ts,
            } => {
                manager
                    .record_test_results(run_id, success, individual_tests, ended_ts)
                    .await?;
                out_tx.send(ManagerMessage::Ack).await.ok();
            }
            WorkerMessage::TerminalOutput {
                deployment_id,
                bytes,
            } => {
                let now = manager.clock().now();
                manager.deployments().publish_output(deployment_id, bytes, now);
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Forward subscriber terminal input to the worker as push frames.
fn spawn_input_forwarder(
    manager: &Arc<TestManager>,
    deployment_id: uuid::Uuid,
    out_tx: mpsc::Sender<ManagerMessage>,
) {
    let Some(mut input_rx) = manager.deployments().take_input_receiver(deployment_id) else {
        tracing::warn!(deployment_id = %deployment_id, "deployment input already taken");
        return;
    };
    tokio::spawn(async move {
        while let Some(input) = input_rx.recv().await {
            let pushed = out_tx
                .send(ManagerMessage::TerminalInput {
                    deployment_id,
                    input,
                })
                .await;
            if pushed.is_err() {
                return;
            }
        }
    });
}
