//! End-to-end worker engine test: a real build producing a real artifact
//! consumed by a real dependent test, on a bare (no-docker) machine, with
//! an in-process manager link.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{fixture_hardware, fixture_os, harness, LINUX_ENV};
use gantry_core::artifacts::{ArtifactStorage, InMemoryArtifactStorage};
use gantry_core::git::pool::GitTaskPool;
use gantry_core::git::RepoCacheSet;
use gantry_core::worker::link::InProcessLink;
use gantry_core::worker::{WorkerConfig, WorkerEngine};
use gantry_test_utils::GitFixture;

#[tokio::test]
async fn worker_executes_build_then_dependent_test() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = format!(
        r#"{LINUX_ENV}
builds:
  build/core:
    environment: linux
    command: "echo payload > $TEST_BUILD_OUTPUT_DIR/out.txt"
tests:
  test/core:
    environment: linux
    command: "grep payload $TEST_INPUTS/build/out.txt"
    dependencies:
      build: {{ build: build/core }}
"#
    );
    fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(&defs))], "real commands");

    let h = harness(fixture);
    h.settle().await;

    let artifacts = Arc::new(InMemoryArtifactStorage::new());
    let link = InProcessLink::new(
        Arc::clone(&h.manager),
        "w1",
        fixture_hardware(),
        fixture_os(),
    )
    .await
    .expect("register in-process worker");
    h.drain().await;

    let engine = WorkerEngine::new(
        Arc::new(link),
        Arc::clone(&artifacts) as Arc<dyn ArtifactStorage>,
        Arc::new(RepoCacheSet::new(h.fixture.scratch_dir("worker-repos"))),
        None,
        h.clock.clone(),
        GitTaskPool::new(2),
        WorkerConfig {
            machine_id: "w1".into(),
            hardware: fixture_hardware(),
            os: fixture_os(),
            scratch_root: h.fixture.scratch_dir("worker-scratch"),
            build_cache_limit_bytes: 0,
            heartbeat_interval: 0.5,
            poll_interval: 0.05,
            run_cleanup_commands: true,
            passthrough_env: vec![],
        },
    );

    let cancel = CancellationToken::new();
    let engine_task = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run(cancel).await })
    };

    // Pump manager tasks while the worker grinds through both runs.
    let mut done = false;
    for _ in 0..400 {
        h.manager.run_until_idle().await.expect("manager tasks");
        let build_green = h
            .test_by_name("build/core")
            .map(|(_, t)| t.successes == 1)
            .unwrap_or(false);
        let test_green = h
            .test_by_name("test/core")
            .map(|(_, t)| t.successes == 1)
            .unwrap_or(false);
        if build_green && test_green {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    let _ = engine_task.await;

    assert!(done, "build and test should both pass end to end");

    let (_, build) = h.expect_test("build/core");
    assert_eq!((build.successes, build.total_runs), (1, 1));
    let (_, test) = h.expect_test("test/core");
    assert_eq!((test.successes, test.total_runs), (1, 1));

    // The build artifact landed in storage under its content key.
    assert!(
        artifacts
            .build_exists(&build.hash, ".tar.gz")
            .await
            .expect("storage reachable"),
        "unnamed build artifact uploaded under the test hash"
    );
    // Logs and the result document landed under the run namespace.
    let run_id = h.manager.store().view(|db| {
        let run_ref = db
            .test_runs
            .lookup_all("test", db.tests.lookup_any("hash", test.hash.as_str()).unwrap())
            .into_iter()
            .next()
            .expect("test run recorded");
        db.test_runs.get(run_ref).unwrap().run_id.to_string()
    });
    let keys = artifacts
        .test_result_keys_with_sizes(&test.hash, &run_id)
        .await
        .expect("list run keys");
    let names: Vec<&str> = keys.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"test_result.json"));
    assert!(names.contains(&"log.txt"));
}

#[tokio::test]
async fn worker_reuses_existing_build_artifacts() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = format!(
        r#"{LINUX_ENV}
builds:
  build/core:
    environment: linux
    command: "exit 1"
"#
    );
    fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(&defs))], "failing build");

    let h = harness(fixture);
    h.settle().await;

    // Pre-seed the artifact store with the build's output so the (broken)
    // command never needs to run.
    let (_, build) = h.expect_test("build/core");
    let artifacts = Arc::new(InMemoryArtifactStorage::new());
    let seed = h.fixture.scratch_dir("seed").join("out.tar.gz");
    std::fs::write(&seed, b"prebuilt").expect("write seed tarball");
    artifacts
        .upload_build(&build.hash, ".tar.gz", &seed)
        .await
        .expect("seed artifact");

    let link = InProcessLink::new(
        Arc::clone(&h.manager),
        "w1",
        fixture_hardware(),
        fixture_os(),
    )
    .await
    .expect("register worker");
    h.drain().await;

    let engine = WorkerEngine::new(
        Arc::new(link),
        Arc::clone(&artifacts) as Arc<dyn ArtifactStorage>,
        Arc::new(RepoCacheSet::new(h.fixture.scratch_dir("worker-repos"))),
        None,
        h.clock.clone(),
        GitTaskPool::new(2),
        WorkerConfig {
            machine_id: "w1".into(),
            hardware: fixture_hardware(),
            os: fixture_os(),
            scratch_root: h.fixture.scratch_dir("worker-scratch"),
            build_cache_limit_bytes: 0,
            heartbeat_interval: 0.5,
            poll_interval: 0.05,
            run_cleanup_commands: true,
            passthrough_env: vec![],
        },
    );

    let cancel = CancellationToken::new();
    let engine_task = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run(cancel).await })
    };

    let mut reused = false;
    for _ in 0..200 {
        h.manager.run_until_idle().await.expect("manager tasks");
        if h
            .test_by_name("build/core")
            .map(|(_, t)| t.successes == 1)
            .unwrap_or(false)
        {
            reused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    let _ = engine_task.await;

    assert!(reused, "build should succeed by artifact reuse, not execution");
}
