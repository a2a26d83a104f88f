//! The machine-category controller.
//!
//! Each `BootMachineCheck` pass reconciles every category: boot
//! `desired - booted` machines where demand is unmet, terminate the oldest
//! idle machines where supply exceeds demand. Driver refusals mark the
//! combination unbootable; the next successful boot clears the flag.

use std::sync::Arc;

use anyhow::Result;

use gantry_db::models::{Machine, MachineCategory, Test};
use gantry_db::schema::{hardware_and_os_key, GantryStore};
use gantry_db::store::{Id, IndexKey};

use crate::clock::Clock;

use super::{DriverError, MachineDriver};

/// Provisioning limits.
#[derive(Debug, Clone)]
pub struct MachineLimits {
    /// Hard cap on `desired` per category.
    pub max_machines_per_category: i64,
    /// Machines with no heartbeat for this many seconds are not
    /// candidates for graceful termination (the sweep will reap them).
    pub heartbeat_fresh_seconds: f64,
}

impl Default for MachineLimits {
    fn default() -> Self {
        MachineLimits {
            max_machines_per_category: 8,
            heartbeat_fresh_seconds: 30.0,
        }
    }
}

pub struct MachineCategoryController {
    driver: Arc<dyn MachineDriver>,
    clock: Arc<dyn Clock>,
    limits: MachineLimits,
}

/// What a boot-check pass touched; the scheduler re-prioritizes these.
#[derive(Debug, Default)]
pub struct BootCheckOutcome {
    /// Tests whose category became unbootable or bootable again.
    pub tests_to_reprioritize: Vec<Id<Test>>,
    pub machines_booted: usize,
    pub machines_terminated: usize,
}

impl MachineCategoryController {
    pub fn new(
        driver: Arc<dyn MachineDriver>,
        clock: Arc<dyn Clock>,
        limits: MachineLimits,
    ) -> Self {
        MachineCategoryController {
            driver,
            clock,
            limits,
        }
    }

    pub fn limits(&self) -> &MachineLimits {
        &self.limits
    }

    /// One reconciliation pass over every category.
    ///
    /// Driver calls happen outside any store lock; the store is only
    /// touched in short transactions before and after each call.
    pub async fn boot_check(&self, store: &GantryStore) -> Result<BootCheckOutcome> {
        let mut outcome = BootCheckOutcome::default();

        // Boot where demand is unmet.
        let want_more: Vec<Id<MachineCategory>> =
            store.view(|db| db.machine_categories.lookup_all("want_more", true));

        for category_id in want_more {
            let Some((hardware, os, deficit)) = store.view(|db| {
                db.machine_categories.get(category_id).map(|c| {
                    (
                        c.hardware,
                        c.os.clone(),
                        (c.desired - c.booted).max(0),
                    )
                })
            }) else {
                continue;
            };

            for _ in 0..deficit {
                match self.driver.boot(&hardware, &os).await {
                    Ok(machine_id) => {
                        let now = self.clock.now();
                        let affected = store.transaction(|db| {
                            db.machines.insert(Machine {
                                machine_id: machine_id.clone(),
                                hardware,
                                os: os.clone(),
                                boot_time: now,
                                first_heartbeat: 0.0,
                                last_heartbeat: now,
                                last_test_completed: 0.0,
                                is_alive: true,
                                last_heartbeat_msg: None,
                            });
                            let mut affected = Vec::new();
                            db.machine_categories.update(category_id, |c| {
                                c.booted += 1;
                                if c.hardware_combo_unbootable {
                                    c.hardware_combo_unbootable = false;
                                    c.unbootable_reason = None;
                                }
                            });
                            // A successful boot clears the unbootable flag;
                            // let the affected tests leave that state.
                            affected.extend(tests_in_category(db, category_id));
                            Ok::<_, anyhow::Error>(affected)
                        })?;
                        outcome.machines_booted += 1;
                        outcome.tests_to_reprioritize.extend(affected);
                        tracing::info!(
                            machine_id = %machine_id,
                            os = %os,
                            cores = hardware.cores,
                            "booted machine"
                        );
                    }
                    Err(DriverError::Refused { reason }) => {
                        let affected = store.transaction(|db| {
                            db.machine_categories.update(category_id, |c| {
                                c.hardware_combo_unbootable = true;
                                c.unbootable_reason = Some(reason.clone());
                            });
                            Ok::<_, anyhow::Error>(tests_in_category(db, category_id))
                        })?;
                        outcome.tests_to_reprioritize.extend(affected);
                        tracing::warn!(
                            os = %os,
                            cores = hardware.cores,
                            reason = %reason,
                            "hardware/os combination unbootable"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "machine boot failed, will retry next pass");
                        break;
                    }
                }
            }
        }

        // Probe categories stuck unbootable with no live demand, so the
        // flag can clear once the driver recovers. A probe machine that
        // turns out unneeded is terminated by the want_less pass.
        let stuck: Vec<Id<MachineCategory>> = store.view(|db| {
            db.machine_categories
                .iter()
                .filter(|(_, c)| c.hardware_combo_unbootable && c.desired <= c.booted)
                .map(|(id, _)| id)
                .collect()
        });
        for category_id in stuck {
            let Some((hardware, os)) = store.view(|db| {
                db.machine_categories
                    .get(category_id)
                    .map(|c| (c.hardware, c.os.clone()))
            }) else {
                continue;
            };
            match self.driver.boot(&hardware, &os).await {
                Ok(machine_id) => {
                    let now = self.clock.now();
                    let affected = store.transaction(|db| {
                        db.machines.insert(Machine {
                            machine_id: machine_id.clone(),
                            hardware,
                            os: os.clone(),
                            boot_time: now,
                            first_heartbeat: 0.0,
                            last_heartbeat: now,
                            last_test_completed: 0.0,
                            is_alive: true,
                            last_heartbeat_msg: None,
                        });
                        db.machine_categories.update(category_id, |c| {
                            c.booted += 1;
                            c.hardware_combo_unbootable = false;
                            c.unbootable_reason = None;
                        });
                        Ok::<_, anyhow::Error>(tests_in_category(db, category_id))
                    })?;
                    outcome.machines_booted += 1;
                    outcome.tests_to_reprioritize.extend(affected);
                    tracing::info!(machine_id = %machine_id, os = %os, "probe boot cleared unbootable flag");
                }
                Err(DriverError::Refused { reason }) => {
                    tracing::debug!(os = %os, reason = %reason, "probe boot still refused");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "probe boot failed");
                }
            }
        }

        // Terminate idle machines where supply exceeds demand. Only
        // machines the driver actually owns are candidates; hand-started
        // workers that handshook on their own are left alone.
        let want_less: Vec<Id<MachineCategory>> =
            store.view(|db| db.machine_categories.lookup_all("want_less", true));
        let driver_owned = match self.driver.list().await {
            Ok(owned) => owned,
            Err(e) => {
                tracing::warn!(error = %e, "driver list failed, skipping terminations");
                vec![]
            }
        };

        for category_id in want_less {
            loop {
                let excess = store.view(|db| {
                    db.machine_categories
                        .get(category_id)
                        .map(|c| c.booted - c.desired)
                        .unwrap_or(0)
                });
                if excess <= 0 {
                    break;
                }

                let Some((machine_ref, machine_id)) =
                    store.view(|db| self.oldest_idle_machine(db, category_id, &driver_owned))
                else {
                    break;
                };

                if let Err(e) = self.driver.terminate(&machine_id).await {
                    tracing::warn!(machine_id = %machine_id, error = %e, "terminate failed");
                    break;
                }

                store.transaction(|db| {
                    db.machines.update(machine_ref, |m| m.is_alive = false);
                    db.machine_categories.update(category_id, |c| c.booted -= 1);
                    Ok::<_, anyhow::Error>(())
                })?;
                outcome.machines_terminated += 1;
                tracing::info!(machine_id = %machine_id, "terminated idle machine");
            }
        }

        Ok(outcome)
    }

    /// The oldest driver-owned alive machine in the category with no live
    /// run, no live deployment, and a fresh heartbeat.
    fn oldest_idle_machine(
        &self,
        db: &gantry_db::Database,
        category_id: Id<MachineCategory>,
        driver_owned: &[String],
    ) -> Option<(Id<Machine>, String)> {
        let category = db.machine_categories.get(category_id)?;
        let key: IndexKey = hardware_and_os_key(&category.hardware, &category.os);
        let now = self.clock.now();

        db.machines
            .lookup_all("hardware_and_os", key)
            .into_iter()
            .filter_map(|id| db.machines.get(id).map(|m| (id, m)))
            .filter(|(id, m)| {
                driver_owned.contains(&m.machine_id)
                    && db.test_runs.lookup_all("running_on_machine", *id).is_empty()
                    && db.deployments.lookup_all("running_on_machine", *id).is_empty()
                    && now - m.last_heartbeat <= self.limits.heartbeat_fresh_seconds
            })
            .min_by(|(_, a), (_, b)| {
                a.boot_time
                    .partial_cmp(&b.boot_time)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, m)| (id, m.machine_id.clone()))
    }
}

/// Every test currently assigned to a category (schedulable or not).
fn tests_in_category(
    db: &gantry_db::Database,
    category_id: Id<MachineCategory>,
) -> Vec<Id<Test>> {
    db.tests
        .iter()
        .filter(|(_, t)| t.machine_category == Some(category_id))
        .map(|(id, _)| id)
        .collect()
}

/// `target_machine_boot` for a test given its unmet demand, capped by the
/// category limit. Zero for non-schedulable priorities.
pub fn target_machine_boot(test: &Test, limits: &MachineLimits) -> i64 {
    if !test.priority.is_schedulable() {
        return 0;
    }
    let unmet = test.runs_desired - test.successes - test.active_runs;
    unmet.clamp(0, limits.max_machines_per_category)
}
