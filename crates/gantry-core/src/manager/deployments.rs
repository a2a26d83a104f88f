//! Interactive deployments: long-lived sessions of one test on one
//! machine with a pub/sub terminal stream.
//!
//! Terminal plumbing is live connection state, not object-graph state, so
//! it lives beside the store: output fans out on a broadcast channel,
//! input funnels through an mpsc the executing worker drains.

use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use gantry_db::models::{BackgroundTask, Deployment, TaskLevel};

use crate::proto::TerminalInput;

use super::TestManager;

const OUTPUT_BUFFER: usize = 1024;
const INPUT_BUFFER: usize = 64;

struct DeploymentChannel {
    output: broadcast::Sender<Vec<u8>>,
    input: mpsc::Sender<TerminalInput>,
    /// Taken once by the worker connection executing the deployment.
    input_rx: Option<mpsc::Receiver<TerminalInput>>,
    last_activity: f64,
}

/// Registry of live terminal streams, keyed by deployment id.
#[derive(Default)]
pub struct DeploymentStreams {
    channels: Mutex<HashMap<Uuid, DeploymentChannel>>,
}

impl DeploymentStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, deployment_id: Uuid, now: f64) {
        let (output, _) = broadcast::channel(OUTPUT_BUFFER);
        let (input, input_rx) = mpsc::channel(INPUT_BUFFER);
        self.channels.lock().insert(
            deployment_id,
            DeploymentChannel {
                output,
                input,
                input_rx: Some(input_rx),
                last_activity: now,
            },
        );
    }

    fn close(&self, deployment_id: Uuid) {
        self.channels.lock().remove(&deployment_id);
    }

    /// Subscribe to terminal output.
    pub fn subscribe_output(&self, deployment_id: Uuid) -> Option<broadcast::Receiver<Vec<u8>>> {
        self.channels
            .lock()
            .get(&deployment_id)
            .map(|c| c.output.subscribe())
    }

    /// Worker side: take the input receiver (once).
    pub fn take_input_receiver(&self, deployment_id: Uuid) -> Option<mpsc::Receiver<TerminalInput>> {
        self.channels
            .lock()
            .get_mut(&deployment_id)
            .and_then(|c| c.input_rx.take())
    }

    /// Publish worker terminal output to every subscriber.
    pub fn publish_output(&self, deployment_id: Uuid, bytes: Vec<u8>, now: f64) {
        if let Some(channel) = self.channels.lock().get_mut(&deployment_id) {
            channel.last_activity = now;
            let _ = channel.output.send(bytes);
        }
    }

    /// Send keyboard input or a resize to the worker.
    pub fn send_input(&self, deployment_id: Uuid, input: TerminalInput, now: f64) -> bool {
        let sender = {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get_mut(&deployment_id) else {
                return false;
            };
            channel.last_activity = now;
            channel.input.clone()
        };
        sender.try_send(input).is_ok()
    }

    /// Deployments idle (no subscribers, no output) past the timeout.
    fn idle_since(&self, now: f64, timeout: f64) -> Vec<Uuid> {
        self.channels
            .lock()
            .iter()
            .filter(|(_, c)| c.output.receiver_count() == 0 && now - c.last_activity > timeout)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl TestManager {
    /// Schedule an interactive deployment of a test.
    pub async fn create_deployment(&self, test_hash: &str) -> Result<Uuid> {
        let now = self.clock.now();
        let deployment_id = Uuid::new_v4();
        self.transaction_and_lock(|db| {
            let test_ref = db
                .tests
                .lookup_any("hash", test_hash)
                .with_context(|| format!("unknown test {test_hash}"))?;
            db.deployments.insert(Deployment {
                deployment_id,
                created_timestamp: now,
                machine: None,
                test: test_ref,
                is_alive: true,
            });
            // Demand for a machine in the test's category.
            if let Some(test) = db.tests.get(test_ref) {
                if let Some(category) = test.machine_category {
                    db.machine_categories.update(category, |c| {
                        c.desired = (c.desired + 1).max(1);
                    });
                }
            }
            Self::enqueue(db, BackgroundTask::BootMachineCheck, TaskLevel::High, now);
            Ok(())
        })
        .await?;

        self.deployments().open(deployment_id, now);
        tracing::info!(deployment_id = %deployment_id, test_hash = test_hash, "created deployment");
        Ok(deployment_id)
    }

    /// Stop a deployment. Idempotent.
    pub async fn shutdown_deployment(&self, deployment_id: Uuid) -> Result<()> {
        self.transaction_and_lock(|db| {
            if let Some(dep_ref) = db
                .deployments
                .lookup_any("deployment_id", deployment_id.to_string())
            {
                db.deployments.update(dep_ref, |d| d.is_alive = false);
            }
            Ok(())
        })
        .await?;
        self.deployments().close(deployment_id);
        tracing::info!(deployment_id = %deployment_id, "deployment shut down");
        Ok(())
    }

    /// Shut down deployments nobody is watching.
    pub(crate) async fn reap_idle_deployments(&self, now: f64) -> Result<()> {
        let idle = self
            .deployments()
            .idle_since(now, self.config.deployment_idle_timeout);
        for deployment_id in idle {
            tracing::info!(deployment_id = %deployment_id, "shutting down idle deployment");
            self.shutdown_deployment(deployment_id).await?;
        }
        Ok(())
    }
}
