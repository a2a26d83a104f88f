//! Scheduler integration tests: commit ingestion, dispatch, retries,
//! cancellation, heartbeat eviction, and machine-category handling.
//!
//! The manager's background loops are not started; tests drive the task
//! queue explicitly through the harness so every step is deterministic.

mod common;

use common::{build_and_test_definitions, harness, Harness, LINUX_ENV};

use gantry_core::manager::dispatch::Assignment;
use gantry_core::Clock;
use gantry_db::models::{BackgroundTask, TaskLevel, TestPriority};
use gantry_test_utils::GitFixture;

/// Check out work for a machine, expecting a test assignment.
async fn expect_checkout(h: &Harness, machine: &str) -> gantry_core::proto::TestAssignment {
    match h.manager.check_out_test(machine).await.expect("checkout") {
        Assignment::Test(assignment) => assignment,
        other => panic!("expected a test assignment, got {other:?}"),
    }
}

async fn expect_no_work(h: &Harness, machine: &str) {
    match h.manager.check_out_test(machine).await.expect("checkout") {
        Assignment::None => {}
        other => panic!("expected no work, got {other:?}"),
    }
}

/// Report a finished run, uploading the named artifacts first.
async fn finish_run(
    h: &Harness,
    assignment: &gantry_core::proto::TestAssignment,
    success: bool,
    artifacts: &[&str],
) {
    for artifact in artifacts {
        h.manager
            .record_artifact_uploaded(assignment.run_id, artifact)
            .await
            .expect("record artifact");
    }
    let now = h.clock.now();
    h.manager
        .record_test_results(assignment.run_id, success, vec![], now)
        .await
        .expect("record results");
}

fn fixture_with_build_and_test() -> GitFixture {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    fixture.repo("core").commit(
        &[(
            "testDefinitions.yml",
            Some(build_and_test_definitions("./build.sh", "./test.sh").as_str()),
        )],
        "add build and test",
    );
    fixture
}

#[tokio::test]
async fn fresh_repo_runs_build_then_test() {
    let h = harness(fixture_with_build_and_test());
    h.settle().await;
    h.register_fixture_machine("m1").await;
    h.drain().await;

    // The build is schedulable first; the test waits on it.
    let (_, build) = h.expect_test("build/core");
    assert!(matches!(build.priority, TestPriority::FirstBuild(_)));
    let (_, test) = h.expect_test("test/core");
    assert_eq!(test.priority, TestPriority::WaitingOnBuilds);

    let assignment = expect_checkout(&h, "m1").await;
    assert_eq!(assignment.definition.name, "build/core");
    // The naked build command declares the unnamed whole-output artifact.
    finish_run(&h, &assignment, true, &[""]).await;
    h.drain().await;

    let (_, build) = h.expect_test("build/core");
    assert_eq!((build.successes, build.total_runs), (1, 1));
    let (_, test) = h.expect_test("test/core");
    assert!(matches!(test.priority, TestPriority::FirstTest(_)));

    let assignment = expect_checkout(&h, "m1").await;
    assert_eq!(assignment.definition.name, "test/core");
    // The descriptor carries the dependency reference for the worker.
    assert_eq!(assignment.build_dependencies.len(), 1);
    assert_eq!(assignment.build_dependencies[0].expose_as, "build");
    finish_run(&h, &assignment, true, &[]).await;
    h.drain().await;

    let (_, test) = h.expect_test("test/core");
    assert_eq!((test.successes, test.total_runs), (1, 1));
    assert_eq!(test.priority, TestPriority::NoMoreTests);

    expect_no_work(&h, "m1").await;
}

#[tokio::test]
async fn build_failure_propagates_to_dependents() {
    let h = harness(fixture_with_build_and_test());
    h.settle().await;
    h.register_fixture_machine("m1").await;
    h.drain().await;

    let assignment = expect_checkout(&h, "m1").await;
    assert_eq!(assignment.definition.name, "build/core");
    finish_run(&h, &assignment, false, &[]).await;
    h.drain().await;

    let (_, build) = h.expect_test("build/core");
    assert_eq!((build.successes, build.total_runs), (0, 1));
    assert_eq!(build.priority, TestPriority::NoMoreTests);

    let (_, test) = h.expect_test("test/core");
    assert_eq!(test.priority, TestPriority::DependencyFailed);
    assert_eq!(test.total_runs, 0);

    expect_no_work(&h, "m1").await;
}

#[tokio::test]
async fn failed_build_retries_up_to_the_bound() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = format!(
        r#"{LINUX_ENV}
builds:
  build/flaky:
    environment: linux
    command: ./build.sh
    max_retries: 2
    retry_wait_seconds: 60
tests:
  test/core:
    environment: linux
    command: ./test.sh
    dependencies:
      build: {{ build: build/flaky }}
"#
    );
    fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(&defs))], "flaky build");

    let h = harness(fixture);
    h.settle().await;
    h.register_fixture_machine("m1").await;
    h.drain().await;

    // Attempt 1 fails; the build sits out its retry window.
    let assignment = expect_checkout(&h, "m1").await;
    finish_run(&h, &assignment, false, &[]).await;
    h.drain().await;
    let (_, build) = h.expect_test("build/flaky");
    assert_eq!(build.priority, TestPriority::WaitingToRetry);
    expect_no_work(&h, "m1").await;

    // Window passes: schedulable again. Two more failures exhaust it.
    for _ in 0..2 {
        h.clock.advance(61.0);
        // Keep the machine's heartbeat fresh across the jump so the sweep
        // only wakes the retry window.
        h.manager.heartbeat("m1", None).await.expect("heartbeat");
        h.manager.sweep().await.expect("sweep");
        h.drain().await;
        let assignment = expect_checkout(&h, "m1").await;
        assert_eq!(assignment.definition.name, "build/flaky");
        finish_run(&h, &assignment, false, &[]).await;
        h.drain().await;
    }

    let (_, build) = h.expect_test("build/flaky");
    // max_retries = 2 allows at most 3 failed attempts.
    assert_eq!((build.successes, build.total_runs), (0, 3));
    assert_eq!(build.priority, TestPriority::NoMoreTests);

    h.clock.advance(61.0);
    h.manager.heartbeat("m1", None).await.expect("heartbeat");
    h.manager.sweep().await.expect("sweep");
    h.drain().await;
    expect_no_work(&h, "m1").await;

    let (_, test) = h.expect_test("test/core");
    assert_eq!(test.priority, TestPriority::DependencyFailed);
}

#[tokio::test]
async fn heartbeat_silence_evicts_the_run() {
    let h = harness(fixture_with_build_and_test());
    h.settle().await;
    h.register_fixture_machine("m1").await;
    h.drain().await;

    let assignment = expect_checkout(&h, "m1").await;
    let (build_id, build) = h.expect_test("build/core");
    assert_eq!(build.active_runs, 1);

    // H * K with defaults is 30 seconds; jump past it and sweep.
    h.clock.advance(31.0);
    h.manager.sweep().await.expect("sweep");
    h.drain().await;

    let (_, build) = h.expect_test("build/core");
    assert_eq!(build.active_runs, 0);
    assert_eq!(build.total_runs, 0, "canceled runs are not attempts");
    assert!(matches!(build.priority, TestPriority::FirstBuild(_)));

    h.manager.store().view(|db| {
        let run_ref = db
            .test_runs
            .lookup_any("run_id", assignment.run_id.to_string())
            .expect("run exists");
        let run = db.test_runs.get(run_ref).unwrap();
        assert!(run.canceled);
        assert!(run.end_timestamp > 0.0);
        assert!(db.test_runs.lookup_all("is_running", true).is_empty());
        let _ = build_id;
    });

    // A late result from the dead worker is discarded.
    h.manager
        .record_test_results(assignment.run_id, true, vec![], h.clock.now())
        .await
        .expect("late result");
    let (_, build) = h.expect_test("build/core");
    assert_eq!(build.successes, 0);
}

#[tokio::test]
async fn cancellation_is_idempotent() {
    let h = harness(fixture_with_build_and_test());
    h.settle().await;
    h.register_fixture_machine("m1").await;
    h.drain().await;

    let assignment = expect_checkout(&h, "m1").await;
    for _ in 0..3 {
        h.manager
            .cancel_test_run(assignment.run_id)
            .await
            .expect("cancel");
    }
    h.drain().await;

    let (_, build) = h.expect_test("build/core");
    assert_eq!(build.active_runs, 0);
    assert_eq!(build.total_runs, 0);

    // The machine learns about the cancellation on its next heartbeat.
    use gantry_core::manager::dispatch::HeartbeatResponse;
    let response = h.manager.heartbeat("m1", None).await.expect("heartbeat");
    assert_eq!(
        response,
        HeartbeatResponse::CancelTestRun(assignment.run_id)
    );
}

#[tokio::test]
async fn no_double_dispatch_for_a_single_desired_run() {
    let h = harness(fixture_with_build_and_test());
    h.settle().await;
    h.register_fixture_machine("m1").await;
    h.register_fixture_machine("m2").await;
    h.drain().await;

    let assignment = expect_checkout(&h, "m1").await;
    assert_eq!(assignment.definition.name, "build/core");
    // Without draining the priority-update queue, a second machine asks
    // for work: it must not receive the same build.
    expect_no_work(&h, "m2").await;

    h.manager.store().view(|db| {
        let live = db.test_runs.lookup_all("is_running", true);
        assert_eq!(live.len(), 1);
        for (_, test) in db.tests.iter() {
            let runs = db
                .test_runs
                .lookup_all("test", db.tests.lookup_any("hash", test.hash.as_str()).unwrap())
                .into_iter()
                .filter(|r| db.test_runs.get(*r).unwrap().is_running())
                .count() as i64;
            assert_eq!(test.active_runs, runs);
        }
    });
}

#[tokio::test]
async fn unbootable_category_cascades_and_recovers() {
    let h = harness(fixture_with_build_and_test());
    h.driver
        .refuse(common::fixture_hardware(), common::fixture_os(), "no capacity")
        .await;
    h.settle().await;

    let (_, build) = h.expect_test("build/core");
    assert_eq!(build.priority, TestPriority::HardwareComboUnbootable);
    let (_, test) = h.expect_test("test/core");
    assert_eq!(test.priority, TestPriority::HardwareComboUnbootable);

    h.manager.store().view(|db| {
        let (_, category) = db.machine_categories.iter().next().expect("category");
        assert!(category.hardware_combo_unbootable);
        assert_eq!(category.unbootable_reason.as_deref(), Some("no capacity"));
    });

    // Driver recovers; the next boot check clears the flag and the tests
    // leave the unbootable state.
    h.driver.allow_all().await;
    h.manager
        .enqueue_now(BackgroundTask::BootMachineCheck, TaskLevel::High)
        .await
        .expect("enqueue boot check");
    h.drain().await;

    let (_, build) = h.expect_test("build/core");
    assert!(matches!(build.priority, TestPriority::FirstBuild(_)));
    h.manager.store().view(|db| {
        let (_, category) = db.machine_categories.iter().next().expect("category");
        assert!(!category.hardware_combo_unbootable);
    });
}

#[tokio::test]
async fn booted_machines_track_desired_demand() {
    let h = harness(fixture_with_build_and_test());
    h.settle().await;

    // Demand for the build's category is one machine; the driver booted
    // exactly one.
    assert_eq!(h.driver.booted().await.len(), 1);
    h.manager.store().view(|db| {
        let (_, category) = db.machine_categories.iter().next().expect("category");
        assert!(category.booted <= category.desired.max(1));
        assert_eq!(category.booted, 1);
    });
}

#[tokio::test]
async fn include_cycle_is_stored_as_definitions_error() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("broken");
    fixture.repo("broken").commit(
        &[
            (
                "testDefinitions.yml",
                Some("includes:\n  - { path: \"/ci/a.yml\", variables: { n: \"0\" } }\n"),
            ),
            (
                "ci/a.yml",
                Some("includes:\n  - { path: \"./b.yml\", variables: { n: \"${n}x\" } }\n"),
            ),
            (
                "ci/b.yml",
                Some("includes:\n  - { path: \"./a.yml\", variables: { n: \"${n}y\" } }\n"),
            ),
        ],
        "cyclic includes",
    );
    fixture.create_repo("healthy");
    fixture.repo("healthy").commit(
        &[(
            "testDefinitions.yml",
            Some(build_and_test_definitions("./build.sh", "./test.sh").as_str()),
        )],
        "healthy defs",
    );

    let h = harness(fixture);
    h.settle().await;

    h.manager.store().view(|db| {
        let broken = db
            .commit_datas
            .iter()
            .find(|(_, d)| d.test_definitions_error.is_some())
            .map(|(_, d)| d.clone())
            .expect("broken commit has an error");
        let message = broken.test_definitions_error.unwrap();
        assert!(
            message.contains("Exceeded the maximum number of file includes: 128"),
            "unexpected message: {message}"
        );
        assert!(broken.tests_parsed);
    });

    // The unrelated repo still materialized its tests.
    assert!(h.test_by_name("build/core").is_some());
}

#[tokio::test]
async fn commit_priority_propagates_to_ancestors() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let repo = fixture.repo("core");
    repo.commit(
        &[(
            "testDefinitions.yml",
            Some(build_and_test_definitions("./build.sh", "./test.sh").as_str()),
        )],
        "first",
    );
    repo.commit(&[("file.txt", Some("v2"))], "second");
    let head = repo.commit(&[("file.txt", Some("v3"))], "third");

    let h = harness(fixture);
    h.settle().await;

    h.manager
        .set_commit_user_priority("core", &head, 10)
        .await
        .expect("set priority");
    h.drain().await;

    h.manager.store().view(|db| {
        for (_, commit) in db.commits.iter() {
            assert!(commit.calculated_priority >= commit.user_priority);
            // Every parent is at least as hot as its children.
            for rel_ref in db.commit_relationships.lookup_all("parent", db.commits.lookup_any("repo_and_hash", (commit.repo, commit.hash.clone())).unwrap()) {
                let rel = db.commit_relationships.get(rel_ref).unwrap();
                let child = db.commits.get(rel.child).unwrap();
                assert!(commit.calculated_priority >= child.calculated_priority);
            }
        }
        let head_commit = db
            .commits
            .iter()
            .find(|(_, c)| c.hash == head)
            .map(|(_, c)| c.clone())
            .expect("head commit");
        assert_eq!(head_commit.calculated_priority, 10);
        // Ancestors inherit the head's priority.
        assert!(
            db.commits
                .iter()
                .all(|(_, c)| c.calculated_priority == 10),
            "all commits on the branch should inherit the head priority"
        );
    });
}
