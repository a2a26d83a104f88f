//! Wire-protocol round trip over real TCP: handshake, work requests,
//! heartbeats, artifact and result reporting.

mod common;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use common::{fixture_hardware, fixture_os, harness};
use gantry_core::manager::dispatch::HeartbeatResponse;
use gantry_core::manager::server;
use gantry_core::Clock;
use gantry_core::worker::link::{ManagerLink, TcpManagerLink, WorkItem};
use gantry_test_utils::GitFixture;

#[tokio::test]
async fn tcp_link_checks_out_and_reports_work() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    fixture.repo("core").commit(
        &[(
            "testDefinitions.yml",
            Some(common::build_and_test_definitions("./build.sh", "./test.sh").as_str()),
        )],
        "defs",
    );

    let h = harness(fixture);
    h.settle().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let cancel = CancellationToken::new();
    let server_task = {
        let manager = Arc::clone(&h.manager);
        let cancel = cancel.clone();
        tokio::spawn(async move { server::serve(manager, listener, cancel).await })
    };

    let link = TcpManagerLink::connect(&addr, "tcp-worker", fixture_hardware(), fixture_os())
        .await
        .expect("handshake succeeds");

    // The handshake registered the machine with the scheduler.
    h.drain().await;
    h.manager.store().view(|db| {
        assert!(db.machines.lookup_any("machine_id", "tcp-worker").is_some());
    });

    assert_eq!(
        link.heartbeat(Some("idle".into())).await.expect("heartbeat"),
        HeartbeatResponse::Ack
    );

    let assignment = match link.request_work().await.expect("request work") {
        Some(WorkItem::Test(assignment)) => assignment,
        other => panic!("expected the build assignment, got {other:?}"),
    };
    assert_eq!(assignment.definition.name, "build/core");

    link.report_artifact_uploaded(assignment.run_id, "")
        .await
        .expect("report artifact");
    link.report_test_run_result(assignment.run_id, true, vec![], 0.0, h.clock.now())
        .await
        .expect("report result");

    h.drain().await;
    let (_, build) = h.expect_test("build/core");
    assert_eq!((build.successes, build.total_runs), (1, 1));

    cancel.cancel();
    drop(link);
    let _ = server_task.await;
}

#[tokio::test]
async fn heartbeat_delivers_cancellation_over_tcp() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    fixture.repo("core").commit(
        &[(
            "testDefinitions.yml",
            Some(common::build_and_test_definitions("./build.sh", "./test.sh").as_str()),
        )],
        "defs",
    );

    let h = harness(fixture);
    h.settle().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let cancel = CancellationToken::new();
    let server_task = {
        let manager = Arc::clone(&h.manager);
        let cancel = cancel.clone();
        tokio::spawn(async move { server::serve(manager, listener, cancel).await })
    };

    let link = TcpManagerLink::connect(&addr, "tcp-worker", fixture_hardware(), fixture_os())
        .await
        .expect("handshake");
    h.drain().await;

    let assignment = match link.request_work().await.expect("request work") {
        Some(WorkItem::Test(assignment)) => assignment,
        other => panic!("expected an assignment, got {other:?}"),
    };

    h.manager
        .cancel_test_run(assignment.run_id)
        .await
        .expect("cancel");

    assert_eq!(
        link.heartbeat(None).await.expect("heartbeat"),
        HeartbeatResponse::CancelTestRun(assignment.run_id)
    );
    assert_eq!(
        link.heartbeat(None).await.expect("second heartbeat"),
        HeartbeatResponse::Ack
    );

    cancel.cancel();
    drop(link);
    let _ = server_task.await;
}
