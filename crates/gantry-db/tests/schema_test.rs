//! Schema-level tests: the registered indexes answer the scheduler's
//! queries and stay consistent through transactions.

use std::collections::BTreeMap;

use uuid::Uuid;

use gantry_db::bitstring::Bitstring;
use gantry_db::defs::*;
use gantry_db::models::*;
use gantry_db::schema::{hardware_and_os_key, new_store, pending_key};
use gantry_db::store::Id;
use gantry_db::Database;

fn minimal_definition(name: &str, kind: TestKind) -> TestDefinition {
    let mut definition = TestDefinition {
        name: name.into(),
        kind,
        environment_name: "env".into(),
        environment_mixins: vec![],
        environment: ResolvedEnvironment {
            platform: Platform::Linux,
            image: Image::Ami {
                base_ami: "ami-1".into(),
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
    };
    definition.hash = definition.content_hash();
    definition
}

fn insert_test(db: &mut Database, name: &str, priority: TestPriority) -> Id<Test> {
    let definition = minimal_definition(name, TestKind::Test);
    let summary = definition.summary();
    let category = db.machine_categories.insert(MachineCategory {
        hardware: HardwareConfig { cores: 1, ram_gb: 1 },
        os: summary.machine_os.clone(),
        booted: 0,
        desired: 0,
        hardware_combo_unbootable: false,
        unbootable_reason: None,
    });
    db.tests.insert(Test {
        hash: definition.hash.clone(),
        summary,
        definition,
        machine_category: Some(category),
        successes: 0,
        total_runs: 0,
        active_runs: 0,
        last_test_end_timestamp: 0.0,
        calculated_priority: 0,
        priority,
        target_machine_boot: 0,
        runs_desired: 1,
    })
}

#[test]
fn prioritized_index_tracks_schedulability() {
    let store = new_store();
    let test_id = store
        .transaction(|db| {
            Ok::<_, ()>(insert_test(db, "t", TestPriority::FirstTest(3)))
        })
        .unwrap();

    store.view(|db| {
        let category = db.tests.get(test_id).unwrap().machine_category.unwrap();
        assert_eq!(
            db.tests
                .lookup_all("machine_category_and_prioritized", category),
            vec![test_id]
        );
    });

    store
        .transaction(|db| {
            db.tests
                .update(test_id, |t| t.priority = TestPriority::WaitingOnBuilds);
            Ok::<_, ()>(())
        })
        .unwrap();

    store.view(|db| {
        let category = db.tests.get(test_id).unwrap().machine_category.unwrap();
        assert!(db
            .tests
            .lookup_all("machine_category_and_prioritized", category)
            .is_empty());
        assert!(db.tests.lookup_all("waiting_to_retry", true).is_empty());
    });
}

#[test]
fn run_indexes_follow_liveness() {
    let store = new_store();
    let run_uuid = Uuid::new_v4();
    let (test_id, run_ref, machine_ref) = store
        .transaction(|db| {
            let test_id = insert_test(db, "t", TestPriority::FirstTest(0));
            let machine_ref = db.machines.insert(Machine {
                machine_id: "m1".into(),
                hardware: HardwareConfig { cores: 1, ram_gb: 1 },
                os: OsConfig::LinuxOneshot {
                    ami: "ami-1".into(),
                },
                boot_time: 1.0,
                first_heartbeat: 1.0,
                last_heartbeat: 1.0,
                last_test_completed: 0.0,
                is_alive: true,
                last_heartbeat_msg: None,
            });
            let run_ref = db.test_runs.insert(TestRun {
                run_id: run_uuid,
                test: test_id,
                started_timestamp: 1.0,
                last_heartbeat: 1.0,
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
            Ok::<_, ()>((test_id, run_ref, machine_ref))
        })
        .unwrap();

    store.view(|db| {
        assert_eq!(
            db.test_runs.lookup_any("run_id", run_uuid.to_string()),
            Some(run_ref)
        );
        assert_eq!(db.test_runs.lookup_all("is_running", true), vec![run_ref]);
        assert_eq!(
            db.test_runs.lookup_all("running_on_machine", machine_ref),
            vec![run_ref]
        );
        assert_eq!(db.test_runs.lookup_all("test", test_id), vec![run_ref]);
    });

    store
        .transaction(|db| {
            db.test_runs.update(run_ref, |r| {
                r.canceled = true;
                r.end_timestamp = 2.0;
            });
            Ok::<_, ()>(())
        })
        .unwrap();

    store.view(|db| {
        assert!(db.test_runs.lookup_all("is_running", true).is_empty());
        assert!(db
            .test_runs
            .lookup_all("running_on_machine", machine_ref)
            .is_empty());
        // Identity indexes survive the transition.
        assert_eq!(
            db.test_runs.lookup_any("run_id", run_uuid.to_string()),
            Some(run_ref)
        );
    });
}

#[test]
fn machine_category_demand_indexes() {
    let store = new_store();
    let category = store
        .transaction(|db| {
            Ok::<_, ()>(db.machine_categories.insert(MachineCategory {
                hardware: HardwareConfig { cores: 4, ram_gb: 16 },
                os: OsConfig::LinuxWithDocker,
                booted: 0,
                desired: 2,
                hardware_combo_unbootable: false,
                unbootable_reason: None,
            }))
        })
        .unwrap();

    store.view(|db| {
        assert_eq!(db.machine_categories.lookup_all("want_more", true), vec![category]);
        assert!(db.machine_categories.lookup_all("want_less", true).is_empty());
        let key = hardware_and_os_key(
            &HardwareConfig { cores: 4, ram_gb: 16 },
            &OsConfig::LinuxWithDocker,
        );
        assert_eq!(
            db.machine_categories.lookup_any("hardware_and_os", key),
            Some(category)
        );
    });

    store
        .transaction(|db| {
            db.machine_categories.update(category, |c| c.booted = 3);
            Ok::<_, ()>(())
        })
        .unwrap();

    store.view(|db| {
        assert!(db.machine_categories.lookup_all("want_more", true).is_empty());
        assert_eq!(db.machine_categories.lookup_all("want_less", true), vec![category]);
    });
}

#[test]
fn data_task_queue_indexes() {
    let store = new_store();
    store
        .transaction(|db| {
            db.data_tasks.insert(DataTask {
                task: BackgroundTask::RefreshRepos,
                status: TaskStatus::Pending(TaskLevel::Low),
                attempts: 0,
                not_before: 0.0,
            });
            db.data_tasks.insert(DataTask {
                task: BackgroundTask::BootMachineCheck,
                status: TaskStatus::Pending(TaskLevel::High),
                attempts: 0,
                not_before: 0.0,
            });
            Ok::<_, ()>(())
        })
        .unwrap();

    store.view(|db| {
        assert_eq!(db.data_tasks.lookup_all("status", pending_key(TaskLevel::High)).len(), 1);
        assert_eq!(db.data_tasks.lookup_all("status", pending_key(TaskLevel::Low)).len(), 1);
        assert!(db
            .data_tasks
            .lookup_any("pending_boot_machine_check", true)
            .is_some());
    });

    // Marking the boot check running removes it from the pending index.
    store
        .transaction(|db| {
            let id = db
                .data_tasks
                .lookup_any("pending_boot_machine_check", true)
                .unwrap();
            db.data_tasks.update(id, |t| t.status = TaskStatus::Running);
            Ok::<_, ()>(())
        })
        .unwrap();

    store.view(|db| {
        assert!(db
            .data_tasks
            .lookup_any("pending_boot_machine_check", true)
            .is_none());
        assert_eq!(db.data_tasks.lookup_all("status", gantry_db::schema::running_key()).len(), 1);
    });
}
