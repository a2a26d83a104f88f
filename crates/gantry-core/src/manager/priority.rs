//! Priority computation: the test-priority state machine and commit
//! priority propagation.
//!
//! The state machine decides whether a test is schedulable and how
//! urgently, from the dependency graph and run history:
//!
//! ```text
//! unresolved refs          -> UnresolvedDependencies
//! category unbootable      -> HardwareComboUnbootable
//! dep build out of retries -> DependencyFailed
//! dep build not green yet  -> WaitingOnBuilds
//! build, never ran         -> FirstBuild(p)
//! test, never ran          -> FirstTest(p)
//! failed, in retry window  -> WaitingToRetry
//! unmet desired runs       -> WantsMoreTests(p)
//! otherwise                -> NoMoreTests
//! ```

use gantry_db::defs::TestKind;
use gantry_db::models::{Commit, Test, TestPriority};
use gantry_db::store::Id;
use gantry_db::Database;

/// A test that failed every attempt and has neither retries nor raised
/// demand left. Dependents treat it as terminally failed.
pub fn is_failed_out(test: &Test) -> bool {
    test.successes == 0
        && test.total_runs > test.summary.max_retries as i64
        && test.total_runs >= test.runs_desired
}

/// Recompute a test's priority. Pure over the database snapshot and `now`.
pub fn compute_test_priority(db: &Database, test_id: Id<Test>, now: f64) -> TestPriority {
    let Some(test) = db.tests.get(test_id) else {
        return TestPriority::NoMoreTests;
    };

    // 1. References to builds that have no materialized Test entity yet.
    if !db
        .unresolved_test_dependencies
        .lookup_all("test", test_id)
        .is_empty()
    {
        return TestPriority::UnresolvedDependencies;
    }

    // 2. Machine category marked unbootable.
    if let Some(category_id) = test.machine_category {
        if let Some(category) = db.machine_categories.get(category_id) {
            if category.hardware_combo_unbootable {
                return TestPriority::HardwareComboUnbootable;
            }
        }
    }

    // 3/4. Build dependencies.
    let mut waiting_on_builds = false;
    for edge_id in db.test_dependencies.lookup_all("test", test_id) {
        let Some(edge) = db.test_dependencies.get(edge_id) else {
            continue;
        };
        let Some(dep) = db.tests.get(edge.depends_on) else {
            continue;
        };
        if dep.summary.kind != TestKind::Build {
            continue;
        }
        if dep.successes > 0 {
            continue;
        }
        if is_failed_out(dep) {
            return TestPriority::DependencyFailed;
        }
        waiting_on_builds = true;
    }
    if waiting_on_builds {
        return TestPriority::WaitingOnBuilds;
    }

    let p = test.calculated_priority;

    // 5/6. Never ran. Deployments are never auto-scheduled; they run only
    // through explicit Deployment entities.
    if test.total_runs == 0 && test.active_runs == 0 {
        match test.summary.kind {
            TestKind::Build => return TestPriority::FirstBuild(p),
            TestKind::Test => return TestPriority::FirstTest(p),
            TestKind::Deployment => return TestPriority::NoMoreTests,
        }
    }
    if test.summary.kind == TestKind::Deployment {
        return TestPriority::NoMoreTests;
    }

    // 7. Failed and still inside the retry wait.
    let failed_so_far = test.total_runs > 0 && test.successes == 0;
    if failed_so_far
        && test.total_runs <= test.summary.max_retries as i64
        && now < test.last_test_end_timestamp + test.summary.retry_wait_seconds as f64
    {
        return TestPriority::WaitingToRetry;
    }

    // 8. Unmet demand.
    if test.successes + test.active_runs < test.runs_desired && !is_failed_out(test) {
        return TestPriority::WantsMoreTests(p);
    }

    TestPriority::NoMoreTests
}

/// Recompute a commit's calculated priority:
/// `max(user_priority, max over child commits of calculated_priority)`.
pub fn compute_commit_priority(db: &Database, commit_id: Id<Commit>) -> i64 {
    let Some(commit) = db.commits.get(commit_id) else {
        return 0;
    };
    let mut priority = commit.user_priority;
    for rel_id in db.commit_relationships.lookup_all("parent", commit_id) {
        if let Some(rel) = db.commit_relationships.get(rel_id) {
            if let Some(child) = db.commits.get(rel.child) {
                priority = priority.max(child.calculated_priority);
            }
        }
    }
    priority
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_db::defs::*;
    use gantry_db::models::*;
    use std::collections::BTreeMap;

    fn minimal_definition(name: &str, kind: TestKind) -> TestDefinition {
        TestDefinition {
            name: name.into(),
            kind,
            environment_name: "env".into(),
            environment_mixins: vec![],
            environment: ResolvedEnvironment {
                platform: Platform::Linux,
                image: Image::DockerfileInline {
                    contents: "FROM x".into(),
                },
                variables: BTreeMap::new(),
                dependencies: BTreeMap::new(),
                setup_script_contents: String::new(),
                test_configuration: String::new(),
                test_stages: vec![],
                test_timeout: 0,
                test_min_cores: 0,
                test_max_cores: 0,
                test_min_ram_gb: 0,
                test_min_disk_gb: 0,
                test_max_retries: 0,
                test_retry_wait_seconds: 0,
            },
            dependencies: BTreeMap::new(),
            variables: BTreeMap::new(),
            stages: vec![],
            configuration: "linux".into(),
            project: String::new(),
            disabled: false,
            timeout: 0,
            min_cores: 0,
            max_cores: 0,
            min_ram_gb: 0,
            min_disk_gb: 0,
            max_retries: 0,
            retry_wait_seconds: 0,
            hash: String::new(),
        }
    }

    fn insert_test(db: &mut Database, name: &str, kind: TestKind) -> Id<Test> {
        let mut definition = minimal_definition(name, kind);
        definition.hash = definition.content_hash();
        let summary = definition.summary();
        db.tests.insert(Test {
            hash: definition.hash.clone(),
            summary,
            definition,
            machine_category: None,
            successes: 0,
            total_runs: 0,
            active_runs: 0,
            last_test_end_timestamp: 0.0,
            calculated_priority: 0,
            priority: TestPriority::NoMoreTests,
            target_machine_boot: 0,
            runs_desired: 1,
        })
    }

    #[test]
    fn fresh_build_is_first_build() {
        let mut db = Database::new();
        let id = insert_test(&mut db, "b", TestKind::Build);
        assert_eq!(compute_test_priority(&db, id, 0.0), TestPriority::FirstBuild(0));
    }

    #[test]
    fn dependency_failed_when_build_out_of_retries() {
        let mut db = Database::new();
        let build = insert_test(&mut db, "b", TestKind::Build);
        let test = insert_test(&mut db, "t", TestKind::Test);
        db.test_dependencies.insert(TestDependencyEdge {
            test,
            depends_on: build,
            artifact: String::new(),
        });
        db.tests.update(build, |b| {
            b.total_runs = 1;
            b.successes = 0;
        });
        assert_eq!(
            compute_test_priority(&db, test, 0.0),
            TestPriority::DependencyFailed
        );
    }

    #[test]
    fn waiting_on_builds_while_dep_can_retry() {
        let mut db = Database::new();
        let build = insert_test(&mut db, "b", TestKind::Build);
        let test = insert_test(&mut db, "t", TestKind::Test);
        db.test_dependencies.insert(TestDependencyEdge {
            test,
            depends_on: build,
            artifact: String::new(),
        });
        db.tests.update(build, |b| {
            b.total_runs = 1;
            b.successes = 0;
            b.summary.max_retries = 2;
        });
        assert_eq!(
            compute_test_priority(&db, test, 0.0),
            TestPriority::WaitingOnBuilds
        );
    }

    #[test]
    fn retry_window_gates_rescheduling() {
        let mut db = Database::new();
        let build = insert_test(&mut db, "b", TestKind::Build);
        db.tests.update(build, |b| {
            b.total_runs = 1;
            b.successes = 0;
            b.summary.max_retries = 2;
            b.summary.retry_wait_seconds = 60;
            b.last_test_end_timestamp = 100.0;
        });
        assert_eq!(
            compute_test_priority(&db, build, 130.0),
            TestPriority::WaitingToRetry
        );
        assert_eq!(
            compute_test_priority(&db, build, 161.0),
            TestPriority::WantsMoreTests(0)
        );
    }

    #[test]
    fn unresolved_dependencies_win() {
        let mut db = Database::new();
        let test = insert_test(&mut db, "t", TestKind::Test);
        db.unresolved_test_dependencies
            .insert(UnresolvedTestDependency {
                test,
                depends_on_hash: "f".repeat(64),
                artifact: String::new(),
            });
        assert_eq!(
            compute_test_priority(&db, test, 0.0),
            TestPriority::UnresolvedDependencies
        );
    }

    #[test]
    fn satisfied_test_has_no_more_runs() {
        let mut db = Database::new();
        let test = insert_test(&mut db, "t", TestKind::Test);
        db.tests.update(test, |t| {
            t.total_runs = 1;
            t.successes = 1;
        });
        assert_eq!(compute_test_priority(&db, test, 0.0), TestPriority::NoMoreTests);
    }
}
