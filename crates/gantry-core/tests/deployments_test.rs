//! Deployment lifecycle: creation, checkout, terminal pub/sub, shutdown.

mod common;

use common::{harness, LINUX_ENV};

use gantry_core::manager::dispatch::Assignment;
use gantry_core::proto::TerminalInput;
use gantry_core::Clock;
use gantry_test_utils::GitFixture;

fn fixture_with_deployment() -> GitFixture {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = format!(
        r#"{LINUX_ENV}
deployments:
  deploy/shell:
    environment: linux
    command: /bin/sh
"#
    );
    fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(&defs))], "deployment defs");
    fixture
}

#[tokio::test]
async fn deployment_checkout_and_terminal_streams() {
    let h = harness(fixture_with_deployment());
    h.settle().await;

    let (_, deploy_test) = h.expect_test("deploy/shell");
    // Deployments never self-schedule.
    assert_eq!(deploy_test.runs_desired, 0);

    let deployment_id = h
        .manager
        .create_deployment(&deploy_test.hash)
        .await
        .expect("create deployment");
    h.register_fixture_machine("m1").await;
    h.drain().await;

    let assignment = match h.manager.check_out_test("m1").await.expect("checkout") {
        Assignment::Deployment(assignment) => assignment,
        other => panic!("expected deployment assignment, got {other:?}"),
    };
    assert_eq!(assignment.deployment_id, deployment_id);
    assert_eq!(assignment.definition.name, "deploy/shell");

    // Subscriber <-> worker terminal plumbing.
    let streams = h.manager.deployments();
    let mut output_rx = streams
        .subscribe_output(deployment_id)
        .expect("subscribe output");
    let mut input_rx = streams
        .take_input_receiver(deployment_id)
        .expect("worker takes input once");
    assert!(
        streams.take_input_receiver(deployment_id).is_none(),
        "input receiver is single-consumer"
    );

    let now = h.clock.now();
    assert!(streams.send_input(
        deployment_id,
        TerminalInput::KeyboardInput {
            bytes: b"ls\n".to_vec()
        },
        now,
    ));
    match input_rx.recv().await {
        Some(TerminalInput::KeyboardInput { bytes }) => assert_eq!(bytes, b"ls\n"),
        other => panic!("expected keyboard input, got {other:?}"),
    }

    streams.publish_output(deployment_id, b"total 0\n".to_vec(), now);
    assert_eq!(output_rx.recv().await.expect("output"), b"total 0\n");

    // Shutdown is idempotent and kills the streams.
    h.manager
        .shutdown_deployment(deployment_id)
        .await
        .expect("shutdown");
    h.manager
        .shutdown_deployment(deployment_id)
        .await
        .expect("second shutdown is a no-op");

    h.manager.store().view(|db| {
        let dep_ref = db
            .deployments
            .lookup_any("deployment_id", deployment_id.to_string())
            .expect("deployment row");
        assert!(!db.deployments.get(dep_ref).unwrap().is_alive);
        assert!(db.deployments.lookup_all("is_alive", true).is_empty());
    });
    assert!(streams.subscribe_output(deployment_id).is_none());
}

#[tokio::test]
async fn idle_deployments_are_reaped() {
    let h = harness(fixture_with_deployment());
    h.settle().await;

    let (_, deploy_test) = h.expect_test("deploy/shell");
    let deployment_id = h
        .manager
        .create_deployment(&deploy_test.hash)
        .await
        .expect("create deployment");

    // No subscribers and no activity: past the idle timeout the sweep
    // shuts it down.
    h.clock
        .advance(h.manager.config().deployment_idle_timeout + 1.0);
    h.manager.sweep().await.expect("sweep");

    h.manager.store().view(|db| {
        let dep_ref = db
            .deployments
            .lookup_any("deployment_id", deployment_id.to_string())
            .expect("deployment row");
        assert!(!db.deployments.get(dep_ref).unwrap().is_alive);
    });
}
