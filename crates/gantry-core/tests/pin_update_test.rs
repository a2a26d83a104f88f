//! Automatic pin updates: when a tracked branch advances, the scheduler
//! pushes a synthetic commit that moves the pin and the new head's tests
//! materialize.

mod common;

use common::{harness, LINUX_ENV};
use gantry_test_utils::GitFixture;

fn dep_definitions() -> String {
    format!(
        r#"{LINUX_ENV}
builds:
  build/core:
    environment: linux
    command: ./build.sh
"#
    )
}

#[tokio::test]
async fn auto_pin_advances_with_the_tracked_branch() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("dep");
    let dep_v1 = fixture
        .repo("dep")
        .commit(&[("testDefinitions.yml", Some(&dep_definitions()))], "dep v1");

    fixture.create_repo("app");
    let app_defs = format!(
        r#"
repos:
  dep:
    reference: "dep/{dep_v1}"
    branch: master
    auto: true
{LINUX_ENV}
tests:
  test/app:
    environment: linux
    command: ./app.sh
    dependencies:
      tool: {{ build: "build/core", repo: dep }}
"#
    );
    fixture
        .repo("app")
        .commit(&[("testDefinitions.yml", Some(&app_defs))], "app v1");

    let h = harness(fixture);
    h.settle().await;

    // The pin relationship is recorded off the app branch head.
    h.manager.store().view(|db| {
        let pins: Vec<_> = db.branch_pins.iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].repo_def, "dep");
        assert_eq!(pins[0].pinned_to_repo, "dep");
        assert_eq!(pins[0].pinned_to_branch, "master");
        assert!(pins[0].auto);
    });

    let app_head_before = h.fixture.repo("app").head("master");

    // dep's master advances; the next pass pushes a pin-update commit.
    let dep_v2 = h
        .fixture
        .repo("dep")
        .commit(&[("src.txt", Some("v2"))], "dep v2");
    h.settle().await;

    let app_head_after = h.fixture.repo("app").head("master");
    assert_ne!(app_head_before, app_head_after, "a pin commit was pushed");

    let contents = h
        .fixture
        .repo("app")
        .file_at(&app_head_after, "testDefinitions.yml");
    assert!(contents.contains(&dep_v2), "pin points at dep's new head");
    assert!(!contents.contains(&dep_v1), "old pin hash rewritten");

    // The synthetic commit parsed and its tests are live.
    h.manager.store().view(|db| {
        let head = db
            .commits
            .iter()
            .find(|(_, c)| c.hash == app_head_after)
            .map(|(_, c)| c.clone())
            .expect("synthetic commit ingested");
        let data = db.commit_datas.get(head.data.expect("commit data")).unwrap();
        assert!(data.subject.contains("Updating pin dep"));
        assert!(data.tests_parsed);
        assert!(data.tests.contains_key("test/app"));
        assert!(data.test_definitions_error.is_none());
    });

    // A second pass with nothing moved pushes nothing.
    h.settle().await;
    assert_eq!(h.fixture.repo("app").head("master"), app_head_after);
}
