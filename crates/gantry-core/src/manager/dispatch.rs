//! Worker-facing scheduling operations: work checkout, heartbeats, result
//! recording, cancellation, and the dead-run sweep.
//!
//! Every live→terminal transition of a run goes through [`finalize_run`],
//! which performs exactly one `active_runs` decrement. Cancellation of an
//! already-terminal run is a no-op, so cancelling any number of times
//! equals cancelling once.

use anyhow::{Context, Result};
use uuid::Uuid;

use gantry_db::bitstring::Bitstring;
use gantry_db::defs::{TestDependency, TestKind};
use gantry_db::models::{BackgroundTask, Machine, TaskLevel, Test, TestRun};
use gantry_db::schema::hardware_and_os_key;
use gantry_db::store::Id;
use gantry_db::Database;

use crate::proto::{
    BuildDependencyRef, DeploymentAssignment, IndividualTestResult, TestAssignment,
};

use super::TestManager;

/// Work returned from a checkout request.
#[derive(Debug, Clone)]
pub enum Assignment {
    None,
    Test(TestAssignment),
    Deployment(DeploymentAssignment),
}

/// Response to a worker heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResponse {
    Ack,
    CancelTestRun(Uuid),
}

/// How a live run reached a terminal state.
enum RunOutcome {
    Completed {
        success: bool,
        individual_tests: Vec<IndividualTestResult>,
        ended_ts: f64,
    },
    Canceled,
}

impl TestManager {
    /// Hand the highest-priority runnable piece of work to a machine.
    ///
    /// Scans schedulable tests in the machine's category ordered by
    /// (priority, earliest defining-commit timestamp), skipping tests whose
    /// build dependencies have no successful run yet. Pending deployments
    /// for the category win over tests.
    pub async fn check_out_test(&self, machine_id: &str) -> Result<Assignment> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            let Some(machine_ref) = db.machines.lookup_any("machine_id", machine_id) else {
                return Ok(Assignment::None);
            };
            let machine = db.machines.get(machine_ref).cloned().expect("machine row");
            if !machine.is_alive {
                return Ok(Assignment::None);
            }
            db.machines.update(machine_ref, |m| {
                m.last_heartbeat = now;
                if m.first_heartbeat == 0.0 {
                    m.first_heartbeat = now;
                }
            });

            let Some(category_id) = db
                .machine_categories
                .lookup_any(
                    "hardware_and_os",
                    hardware_and_os_key(&machine.hardware, &machine.os),
                )
            else {
                return Ok(Assignment::None);
            };

            // Pending deployments first.
            for deployment_id in db.deployments.lookup_all("is_alive_and_pending", true) {
                let Some(deployment) = db.deployments.get(deployment_id).cloned() else {
                    continue;
                };
                let Some(test) = db.tests.get(deployment.test).cloned() else {
                    continue;
                };
                if test.machine_category != Some(category_id) {
                    continue;
                }
                db.deployments
                    .update(deployment_id, |d| d.machine = Some(machine_ref));
                return Ok(Assignment::Deployment(DeploymentAssignment {
                    deployment_id: deployment.deployment_id,
                    test_hash: test.hash.clone(),
                    definition: test.definition.clone(),
                    build_dependencies: build_dependency_refs(&test),
                }));
            }

            // Schedulable tests, best first.
            let mut candidates: Vec<(Id<Test>, (i64, i64), i64)> = db
                .tests
                .lookup_all("machine_category_and_prioritized", category_id)
                .into_iter()
                .filter_map(|id| {
                    let test = db.tests.get(id)?;
                    let rank = test.priority.dispatch_rank()?;
                    Some((id, rank, earliest_commit_timestamp(db, id)))
                })
                .collect();
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));

            for (test_id, _, _) in candidates {
                let test = db.tests.get(test_id).cloned().expect("test row");
                // The priority index can lag behind a checkout made before
                // its UpdateTestPriority task ran; re-check demand here so
                // a test is never dispatched twice for one desired run.
                if test.successes + test.active_runs >= test.runs_desired {
                    continue;
                }
                if !build_dependencies_satisfied(db, test_id) {
                    continue;
                }

                let run_id = Uuid::new_v4();
                db.test_runs.insert(TestRun {
                    run_id,
                    test: test_id,
                    started_timestamp: now,
                    last_heartbeat: now,
                    end_timestamp: 0.0,
                    success: false,
                    canceled: false,
                    machine: Some(machine_ref),
                    artifacts_completed: vec![],
                    test_names: vec![],
                    test_failures: Bitstring::new(),
                    test_has_logs: Bitstring::new(),
                    total_test_count: 0,
                    total_failed_test_count: 0,
                });
                db.tests.update(test_id, |t| t.active_runs += 1);
                Self::enqueue(
                    db,
                    BackgroundTask::UpdateTestPriority(test_id),
                    TaskLevel::Medium,
                    now,
                );

                tracing::info!(
                    machine_id = machine_id,
                    test = %test.summary.name,
                    test_hash = %test.hash,
                    run_id = %run_id,
                    "checked out test"
                );

                return Ok(Assignment::Test(TestAssignment {
                    run_id,
                    test_hash: test.hash.clone(),
                    definition: test.definition.clone(),
                    build_dependencies: build_dependency_refs(&test),
                }));
            }

            Ok(Assignment::None)
        })
        .await
    }

    /// Refresh a machine's heartbeat (and its live runs'), delivering at
    /// most one pending cancellation.
    pub async fn heartbeat(
        &self,
        machine_id: &str,
        message: Option<String>,
    ) -> Result<HeartbeatResponse> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            let Some(machine_ref) = db.machines.lookup_any("machine_id", machine_id) else {
                return Ok(());
            };
            db.machines.update(machine_ref, |m| {
                m.last_heartbeat = now;
                if m.first_heartbeat == 0.0 {
                    m.first_heartbeat = now;
                }
                m.last_heartbeat_msg = message.clone();
            });
            for run_id in db.test_runs.lookup_all("running_on_machine", machine_ref) {
                db.test_runs.update(run_id, |r| r.last_heartbeat = now);
            }
            Ok(())
        })
        .await?;

        Ok(match self.take_cancel_notification(machine_id) {
            Some(run) => HeartbeatResponse::CancelTestRun(run),
            None => HeartbeatResponse::Ack,
        })
    }

    /// Record an artifact upload for a live run, in order.
    pub async fn record_artifact_uploaded(&self, run_id: Uuid, artifact_name: &str) -> Result<()> {
        self.transaction_and_lock(|db| {
            let Some(run_ref) = db.test_runs.lookup_any("run_id", run_id.to_string()) else {
                return Ok(());
            };
            let Some(run) = db.test_runs.get(run_ref) else {
                return Ok(());
            };
            if !run.is_running() {
                return Ok(());
            }
            db.test_runs.update(run_ref, |r| {
                if !r.artifacts_completed.iter().any(|a| a == artifact_name) {
                    r.artifacts_completed.push(artifact_name.to_string());
                }
            });
            Ok(())
        })
        .await
    }

    /// Finalize a run with the worker's verdict. Results for runs that are
    /// no longer live (canceled, already finalized) are discarded.
    pub async fn record_test_results(
        &self,
        run_id: Uuid,
        success: bool,
        individual_tests: Vec<IndividualTestResult>,
        ended_ts: f64,
    ) -> Result<()> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            let Some(run_ref) = db.test_runs.lookup_any("run_id", run_id.to_string()) else {
                tracing::warn!(run_id = %run_id, "result for unknown run discarded");
                return Ok(());
            };
            let run = db.test_runs.get(run_ref).cloned().context("run row")?;
            if !run.is_running() {
                tracing::info!(run_id = %run_id, "result for finalized run discarded");
                return Ok(());
            }
            finalize_run(
                db,
                run_ref,
                RunOutcome::Completed {
                    success,
                    individual_tests,
                    ended_ts,
                },
                now,
            );
            Ok(())
        })
        .await
    }

    /// Cancel a run. Idempotent: a terminal run is left untouched.
    pub async fn cancel_test_run(&self, run_id: Uuid) -> Result<()> {
        let now = self.clock.now();
        let machine = self
            .transaction_and_lock(|db| {
                let Some(run_ref) = db.test_runs.lookup_any("run_id", run_id.to_string()) else {
                    return Ok(None);
                };
                let run = db.test_runs.get(run_ref).cloned().context("run row")?;
                if !run.is_running() {
                    return Ok(None);
                }
                finalize_run(db, run_ref, RunOutcome::Canceled, now);
                Ok(run
                    .machine
                    .and_then(|m| db.machines.get(m))
                    .map(|m| m.machine_id.clone()))
            })
            .await?;

        if let Some(machine_id) = machine {
            self.queue_cancel_notification(&machine_id, run_id);
        }
        Ok(())
    }

    /// Periodic pass: evict heartbeat-silent runs and machines, wake tests
    /// out of expired retry windows, re-check machine demand, reap idle
    /// deployments.
    pub async fn sweep(&self) -> Result<()> {
        let now = self.clock.now();
        let deadline = self.config.heartbeat_deadline();

        let stale_runs: Vec<(Uuid, Option<String>)> = self
            .transaction_and_lock(|db| {
                let mut canceled = Vec::new();
                for run_ref in db.test_runs.lookup_all("is_running", true) {
                    let Some(run) = db.test_runs.get(run_ref).cloned() else {
                        continue;
                    };
                    if now - run.last_heartbeat <= deadline {
                        continue;
                    }
                    finalize_run(db, run_ref, RunOutcome::Canceled, now);
                    let machine_id = run
                        .machine
                        .and_then(|m| db.machines.get(m))
                        .map(|m| m.machine_id.clone());
                    tracing::warn!(
                        run_id = %run.run_id,
                        age = now - run.last_heartbeat,
                        "evicted heartbeat-silent run"
                    );
                    canceled.push((run.run_id, machine_id));
                }

                // Machines that went silent die; their category count drops
                // so the controller can boot replacements.
                let alive: Vec<Id<Machine>> = db.machines.lookup_all("is_alive", true);
                for machine_ref in alive {
                    let Some(machine) = db.machines.get(machine_ref).cloned() else {
                        continue;
                    };
                    if machine.last_heartbeat == 0.0 || now - machine.last_heartbeat <= deadline {
                        continue;
                    }
                    db.machines.update(machine_ref, |m| m.is_alive = false);
                    if let Some(category) = db.machine_categories.lookup_any(
                        "hardware_and_os",
                        hardware_and_os_key(&machine.hardware, &machine.os),
                    ) {
                        db.machine_categories.update(category, |c| c.booted -= 1);
                    }
                    for deployment in db.deployments.lookup_all("running_on_machine", machine_ref)
                    {
                        db.deployments.update(deployment, |d| d.is_alive = false);
                    }
                    tracing::warn!(machine_id = %machine.machine_id, "machine heartbeat lost, marked dead");
                }

                // Retry windows that have expired need a priority pass.
                for test_ref in db.tests.lookup_all("waiting_to_retry", true) {
                    let Some(test) = db.tests.get(test_ref) else {
                        continue;
                    };
                    let window =
                        test.last_test_end_timestamp + test.summary.retry_wait_seconds as f64;
                    if now >= window {
                        Self::enqueue(
                            db,
                            BackgroundTask::UpdateTestPriority(test_ref),
                            TaskLevel::Medium,
                            now,
                        );
                    }
                }

                Self::enqueue(db, BackgroundTask::BootMachineCheck, TaskLevel::Low, now);
                Ok(canceled)
            })
            .await?;

        for (run_id, machine_id) in stale_runs {
            if let Some(machine_id) = machine_id {
                self.queue_cancel_notification(&machine_id, run_id);
            }
        }

        self.reap_idle_deployments(now).await?;
        Ok(())
    }
}

/// The single place a run goes from live to terminal.
fn finalize_run(db: &mut Database, run_ref: Id<TestRun>, outcome: RunOutcome, now: f64) {
    let Some(run) = db.test_runs.get(run_ref).cloned() else {
        return;
    };
    debug_assert!(run.is_running(), "finalize_run on a terminal run");

    let test_id = run.test;
    let test = db.tests.get(test_id).cloned();

    match outcome {
        RunOutcome::Completed {
            success,
            individual_tests,
            ended_ts,
        } => {
            // Builds succeed only once every declared artifact landed.
            let success = match &test {
                Some(t) if t.summary.kind == TestKind::Build => {
                    success
                        && t.summary
                            .artifacts
                            .iter()
                            .all(|a| run.artifacts_completed.iter().any(|c| c == a))
                }
                _ => success,
            };

            let failed = individual_tests.iter().filter(|t| !t.success).count() as i64;
            db.test_runs.update(run_ref, |r| {
                r.end_timestamp = if ended_ts > 0.0 { ended_ts } else { now };
                r.success = success;
                r.test_names = individual_tests.iter().map(|t| t.name.clone()).collect();
                r.test_failures =
                    Bitstring::from_bools(individual_tests.iter().map(|t| t.success));
                r.test_has_logs =
                    Bitstring::from_bools(individual_tests.iter().map(|t| t.has_logs));
                r.total_test_count = individual_tests.len() as i64;
                r.total_failed_test_count = failed;
            });
            db.tests.update(test_id, |t| {
                t.active_runs -= 1;
                t.total_runs += 1;
                if success {
                    t.successes += 1;
                }
                t.last_test_end_timestamp = now;
            });
            if let Some(machine_ref) = run.machine {
                db.machines
                    .update(machine_ref, |m| m.last_test_completed = now);
            }
        }
        RunOutcome::Canceled => {
            db.test_runs.update(run_ref, |r| {
                r.canceled = true;
                r.end_timestamp = now;
            });
            // Cancellation is not a failure: no total_runs increment.
            db.tests.update(test_id, |t| t.active_runs -= 1);
        }
    }

    TestManager::enqueue(
        db,
        BackgroundTask::UpdateTestPriority(test_id),
        TaskLevel::High,
        now,
    );
    // Dependents may become runnable (or DependencyFailed).
    for edge_ref in db.test_dependencies.lookup_all("depends_on", test_id) {
        if let Some(edge) = db.test_dependencies.get(edge_ref) {
            TestManager::enqueue(
                db,
                BackgroundTask::UpdateTestPriority(edge.test),
                TaskLevel::Medium,
                now,
            );
        }
    }
}

/// All of a test's build dependencies as wire references.
fn build_dependency_refs(test: &Test) -> Vec<BuildDependencyRef> {
    test.definition
        .dependencies
        .iter()
        .filter_map(|(expose_as, dep)| match dep {
            TestDependency::Build {
                build_hash,
                artifact,
                ..
            } => Some(BuildDependencyRef {
                build_hash: build_hash.clone(),
                expose_as: expose_as.clone(),
                artifact: artifact.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Every build edge must point at a test with at least one success.
fn build_dependencies_satisfied(db: &Database, test_id: Id<Test>) -> bool {
    db.test_dependencies
        .lookup_all("test", test_id)
        .into_iter()
        .filter_map(|id| db.test_dependencies.get(id))
        .all(|edge| {
            db.tests
                .get(edge.depends_on)
                .map(|dep| {
                    dep.summary.kind != TestKind::Build || dep.successes > 0
                })
                .unwrap_or(false)
        })
}

/// FIFO key for dispatch: the earliest timestamp among commits defining
/// the test. Commits without data sort last.
fn earliest_commit_timestamp(db: &Database, test_id: Id<Test>) -> i64 {
    db.commit_test_dependencies
        .lookup_all("test", test_id)
        .into_iter()
        .filter_map(|id| db.commit_test_dependencies.get(id))
        .filter_map(|row| db.commits.get(row.commit))
        .filter_map(|commit| commit.data)
        .filter_map(|data_id| db.commit_datas.get(data_id))
        .map(|data| data.timestamp)
        .min()
        .unwrap_or(i64::MAX)
}
