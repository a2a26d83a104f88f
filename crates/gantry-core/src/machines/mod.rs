//! Machine provisioning: the driver contract and the category controller
//! that reconciles booted machines with test demand.

pub mod controller;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use gantry_db::defs::{HardwareConfig, OsConfig};

pub use controller::{MachineCategoryController, MachineLimits};

/// Driver failure modes. `Refused` marks the hardware/os combination
/// unbootable until a later boot succeeds.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("boot refused: {reason}")]
    Refused { reason: String },

    #[error("{0}")]
    Other(String),
}

/// The machine-management backend: boot, terminate, list. Everything else
/// (pricing, spot handling, image baking) is the driver's business.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    async fn boot(
        &self,
        hardware: &HardwareConfig,
        os: &OsConfig,
    ) -> Result<String, DriverError>;

    async fn terminate(&self, machine_id: &str) -> Result<(), DriverError>;

    async fn list(&self) -> Result<Vec<String>, DriverError>;
}

/// A driver that books machines in memory and never talks to a cloud.
/// Useful for single-host deployments where workers are started by hand,
/// and for tests, which can script refusals per OS/hardware combo.
#[derive(Default)]
pub struct InMemoryMachineDriver {
    state: Mutex<InMemoryDriverState>,
}

#[derive(Default)]
struct InMemoryDriverState {
    counter: u64,
    alive: Vec<String>,
    refuse: Vec<(HardwareConfig, OsConfig, String)>,
    booted_log: Vec<(String, HardwareConfig, OsConfig)>,
    terminated_log: Vec<String>,
}

impl InMemoryMachineDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent boots of this combination fail with `reason`.
    pub async fn refuse(&self, hardware: HardwareConfig, os: OsConfig, reason: &str) {
        self.state
            .lock()
            .await
            .refuse
            .push((hardware, os, reason.to_string()));
    }

    /// Clear scripted refusals.
    pub async fn allow_all(&self) {
        self.state.lock().await.refuse.clear();
    }

    pub async fn booted(&self) -> Vec<(String, HardwareConfig, OsConfig)> {
        self.state.lock().await.booted_log.clone()
    }

    pub async fn terminated(&self) -> Vec<String> {
        self.state.lock().await.terminated_log.clone()
    }
}

#[async_trait]
impl MachineDriver for InMemoryMachineDriver {
    async fn boot(
        &self,
        hardware: &HardwareConfig,
        os: &OsConfig,
    ) -> Result<String, DriverError> {
        let mut state = self.state.lock().await;
        if let Some((_, _, reason)) = state
            .refuse
            .iter()
            .find(|(hw, o, _)| hw == hardware && o == os)
        {
            return Err(DriverError::Refused {
                reason: reason.clone(),
            });
        }
        state.counter += 1;
        let id = format!("machine-{}", state.counter);
        state.alive.push(id.clone());
        state.booted_log.push((id.clone(), *hardware, os.clone()));
        Ok(id)
    }

    async fn terminate(&self, machine_id: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        state.alive.retain(|id| id != machine_id);
        state.terminated_log.push(machine_id.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.state.lock().await.alive.clone())
    }
}
