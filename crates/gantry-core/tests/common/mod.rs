//! Shared harness for scheduler and worker integration tests: a manager
//! wired to scripted git repos, a manual clock, and a recording driver.
#![allow(dead_code)]

use std::sync::Arc;

use gantry_core::clock::ManualClock;
use gantry_core::git::pool::GitTaskPool;
use gantry_core::git::RepoCacheSet;
use gantry_core::machines::controller::{MachineCategoryController, MachineLimits};
use gantry_core::machines::InMemoryMachineDriver;
use gantry_core::manager::{ManagerConfig, TestManager};
use gantry_core::scm::StaticSourceControl;
use gantry_db::defs::{HardwareConfig, OsConfig};
use gantry_db::models::{BackgroundTask, TaskLevel, Test};
use gantry_db::store::Id;
use gantry_test_utils::GitFixture;

/// The bare-linux environment every fixture definitions file uses; tests
/// on it execute through plain `/bin/sh`.
pub const LINUX_ENV: &str = r#"
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-test" }
"#;

/// Hardware of the category fixture tests land in (min_cores defaults
/// floor to 1 core / 1 gb).
pub fn fixture_hardware() -> HardwareConfig {
    HardwareConfig { cores: 1, ram_gb: 1 }
}

pub fn fixture_os() -> OsConfig {
    OsConfig::LinuxOneshot {
        ami: "ami-test".into(),
    }
}

pub struct Harness {
    pub fixture: GitFixture,
    pub manager: Arc<TestManager>,
    pub clock: Arc<ManualClock>,
    pub driver: Arc<InMemoryMachineDriver>,
}

/// Build a manager over the fixture's repos. The manager's background
/// loops are not started; tests drive the queue with [`Harness::settle`].
pub fn harness(fixture: GitFixture) -> Harness {
    let store = Arc::new(gantry_db::schema::new_store());
    let clock = ManualClock::new(1_000_000.0);
    let scm = Arc::new(StaticSourceControl::new(fixture.repo_urls()));
    let repo_caches = Arc::new(RepoCacheSet::new(fixture.scratch_dir("git-cache")));
    let git_pool = GitTaskPool::new(4);
    let driver = Arc::new(InMemoryMachineDriver::new());
    let driver_dyn: Arc<dyn gantry_core::machines::MachineDriver> =
        Arc::clone(&driver) as Arc<dyn gantry_core::machines::MachineDriver>;
    let controller =
        MachineCategoryController::new(driver_dyn, clock.clone(), MachineLimits::default());

    let manager = TestManager::new(
        store,
        clock.clone(),
        scm,
        repo_caches,
        git_pool,
        controller,
        ManagerConfig::default(),
    );

    Harness {
        fixture,
        manager,
        clock,
        driver,
    }
}

impl Harness {
    /// Refresh source control and drain the task queue to quiescence,
    /// advancing the clock through missing-dependency retry delays.
    pub async fn settle(&self) {
        self.manager
            .enqueue_now(BackgroundTask::RefreshRepos, TaskLevel::Medium)
            .await
            .expect("enqueue refresh");
        self.drain().await;
    }

    /// Drain already-enqueued tasks to quiescence.
    pub async fn drain(&self) {
        for _ in 0..50 {
            self.manager.run_until_idle().await.expect("task execution");
            let pending = self.manager.store().view(|db| db.data_tasks.len());
            if pending == 0 {
                return;
            }
            // Remaining tasks are delayed retries; jump past the delay.
            self.clock.advance(30.0);
        }
        panic!("task queue failed to quiesce");
    }

    /// Register a hand-started machine matching the fixture category.
    /// Advances the clock first so driver-booted machines are strictly
    /// older and get picked for idle termination instead of this one.
    pub async fn register_fixture_machine(&self, machine_id: &str) {
        self.clock.advance(1.0);
        self.manager
            .register_machine(machine_id, fixture_hardware(), fixture_os())
            .await
            .expect("register machine");
    }

    /// Find a materialized test by its definition name.
    pub fn test_by_name(&self, name: &str) -> Option<(Id<Test>, Test)> {
        self.manager.store().view(|db| {
            db.tests
                .iter()
                .find(|(_, t)| t.summary.name == name)
                .map(|(id, t)| (id, t.clone()))
        })
    }

    /// The test entity for `name`, panicking if it never materialized.
    pub fn expect_test(&self, name: &str) -> (Id<Test>, Test) {
        self.test_by_name(name)
            .unwrap_or_else(|| panic!("test {name:?} was not materialized"))
    }
}

/// A definitions file with one build and one dependent test.
pub fn build_and_test_definitions(build_cmd: &str, test_cmd: &str) -> String {
    format!(
        r#"{LINUX_ENV}
builds:
  build/core:
    environment: linux
    command: "{build_cmd}"
tests:
  test/core:
    environment: linux
    command: "{test_cmd}"
    dependencies:
      build: {{ build: build/core }}
"#
    )
}
