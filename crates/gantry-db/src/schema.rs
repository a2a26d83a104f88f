//! The concrete database: one table per entity plus every secondary index
//! the scheduler's queries rely on.

use crate::defs::{HardwareConfig, OsConfig};
use crate::models::*;
use crate::store::{
    commit_table, key3, rollback_table, IndexKey, Store, Table, Transactional,
};

/// Index key for a hardware config.
pub fn hardware_key(hw: &HardwareConfig) -> IndexKey {
    IndexKey::Tuple(vec![
        IndexKey::Int(hw.cores as i64),
        IndexKey::Int(hw.ram_gb as i64),
    ])
}

/// Index key for an OS config.
pub fn os_key(os: &OsConfig) -> IndexKey {
    IndexKey::Str(os.to_string())
}

/// Composite key for `(hardware, os)` indexes.
pub fn hardware_and_os_key(hw: &HardwareConfig, os: &OsConfig) -> IndexKey {
    IndexKey::Tuple(vec![hardware_key(hw), os_key(os)])
}

fn task_status_key(status: &TaskStatus) -> IndexKey {
    match status {
        TaskStatus::Pending(level) => IndexKey::Tuple(vec![
            IndexKey::Str("pending".into()),
            IndexKey::Int(*level as i64),
        ]),
        TaskStatus::Running => IndexKey::Str("running".into()),
    }
}

/// Key for looking up pending tasks at one level.
pub fn pending_key(level: TaskLevel) -> IndexKey {
    task_status_key(&TaskStatus::Pending(level))
}

/// Key for looking up running tasks.
pub fn running_key() -> IndexKey {
    task_status_key(&TaskStatus::Running)
}

/// All entity tables. Obtain one through [`Store::view`] or
/// [`Store::transaction`]; never hold references across transactions.
pub struct Database {
    pub repos: Table<Repo>,
    pub branches: Table<Branch>,
    pub branch_pins: Table<BranchPin>,
    pub commits: Table<Commit>,
    pub commit_datas: Table<CommitData>,
    pub commit_relationships: Table<CommitRelationship>,
    pub commit_test_dependencies: Table<CommitTestDependency>,
    pub tests: Table<Test>,
    pub test_runs: Table<TestRun>,
    pub test_dependencies: Table<TestDependencyEdge>,
    pub unresolved_test_dependencies: Table<UnresolvedTestDependency>,
    pub unresolved_commit_source_dependencies: Table<UnresolvedCommitSourceDependency>,
    pub unresolved_commit_repo_dependencies: Table<UnresolvedCommitRepoDependency>,
    pub machines: Table<Machine>,
    pub machine_categories: Table<MachineCategory>,
    pub deployments: Table<Deployment>,
    pub data_tasks: Table<DataTask>,
}

impl Database {
    pub fn new() -> Self {
        let mut repos = Table::new();
        repos.add_index("name", |r: &Repo| Some(IndexKey::Str(r.name.clone())));
        repos.add_index("is_active", |r: &Repo| {
            if r.is_active {
                Some(IndexKey::Bool(true))
            } else {
                None
            }
        });

        let mut branches = Table::new();
        branches.add_index("repo", |b: &Branch| Some(b.repo.into()));
        branches.add_index("head", |b: &Branch| b.head.map(Into::into));
        branches.add_index("repo_and_branchname", |b: &Branch| {
            Some((b.repo, b.branchname.clone()).into())
        });

        let mut branch_pins = Table::new();
        branch_pins.add_index("branch", |p: &BranchPin| Some(p.branch.into()));
        branch_pins.add_index("pinned_to", |p: &BranchPin| {
            Some((p.pinned_to_repo.clone(), p.pinned_to_branch.clone()).into())
        });

        let mut commits = Table::new();
        commits.add_index("repo_and_hash", |c: &Commit| {
            Some((c.repo, c.hash.clone()).into())
        });

        let commit_datas = Table::new();

        let mut commit_relationships = Table::new();
        commit_relationships.add_index("parent", |r: &CommitRelationship| Some(r.parent.into()));
        commit_relationships.add_index("child", |r: &CommitRelationship| Some(r.child.into()));

        let mut commit_test_dependencies = Table::new();
        commit_test_dependencies
            .add_index("commit", |d: &CommitTestDependency| Some(d.commit.into()));
        commit_test_dependencies.add_index("test", |d: &CommitTestDependency| Some(d.test.into()));

        let mut tests = Table::new();
        tests.add_index("hash", |t: &Test| Some(IndexKey::Str(t.hash.clone())));
        tests.add_index("waiting_to_retry", |t: &Test| {
            if t.priority == TestPriority::WaitingToRetry {
                Some(IndexKey::Bool(true))
            } else {
                None
            }
        });
        tests.add_index("machine_category_and_prioritized", |t: &Test| {
            match (t.priority.is_schedulable(), t.machine_category) {
                (true, Some(cat)) => Some(cat.into()),
                _ => None,
            }
        });
        tests.add_index("priority", |t: &Test| {
            t.priority
                .dispatch_rank()
                .map(|(p, rank)| (p, rank).into())
        });

        let mut test_runs = Table::new();
        test_runs.add_index("run_id", |r: &TestRun| {
            Some(IndexKey::Str(r.run_id.to_string()))
        });
        test_runs.add_index("test", |r: &TestRun| Some(r.test.into()));
        test_runs.add_index("is_running", |r: &TestRun| {
            if r.is_running() {
                Some(IndexKey::Bool(true))
            } else {
                None
            }
        });
        test_runs.add_index("running_on_machine", |r: &TestRun| {
            match (r.is_running(), r.machine) {
                (true, Some(m)) => Some(m.into()),
                _ => None,
            }
        });

        let mut test_dependencies = Table::new();
        test_dependencies.add_index("test", |d: &TestDependencyEdge| Some(d.test.into()));
        test_dependencies
            .add_index("depends_on", |d: &TestDependencyEdge| Some(d.depends_on.into()));
        test_dependencies.add_index("test_and_depends", |d: &TestDependencyEdge| {
            Some(key3(d.test, d.depends_on, d.artifact.clone()))
        });

        let mut unresolved_test_dependencies = Table::new();
        unresolved_test_dependencies
            .add_index("test", |d: &UnresolvedTestDependency| Some(d.test.into()));
        unresolved_test_dependencies.add_index("depends_on_hash", |d: &UnresolvedTestDependency| {
            Some(IndexKey::Str(d.depends_on_hash.clone()))
        });
        unresolved_test_dependencies.add_index(
            "test_and_depends",
            |d: &UnresolvedTestDependency| {
                Some(key3(d.test, d.depends_on_hash.clone(), d.artifact.clone()))
            },
        );

        let mut unresolved_commit_source_dependencies = Table::new();
        unresolved_commit_source_dependencies.add_index(
            "commit",
            |d: &UnresolvedCommitSourceDependency| Some(d.commit.into()),
        );
        unresolved_commit_source_dependencies.add_index(
            "repo_and_hash",
            |d: &UnresolvedCommitSourceDependency| {
                Some((d.repo, d.commit_hash.clone()).into())
            },
        );
        unresolved_commit_source_dependencies.add_index(
            "commit_and_repo_and_hash",
            |d: &UnresolvedCommitSourceDependency| {
                Some(key3(d.commit, d.repo, d.commit_hash.clone()))
            },
        );

        let mut unresolved_commit_repo_dependencies = Table::new();
        unresolved_commit_repo_dependencies.add_index(
            "commit",
            |d: &UnresolvedCommitRepoDependency| Some(d.commit.into()),
        );
        unresolved_commit_repo_dependencies.add_index(
            "reponame",
            |d: &UnresolvedCommitRepoDependency| Some(IndexKey::Str(d.reponame.clone())),
        );
        unresolved_commit_repo_dependencies.add_index(
            "commit_and_reponame",
            |d: &UnresolvedCommitRepoDependency| {
                Some((d.commit, d.reponame.clone()).into())
            },
        );

        let mut machines = Table::new();
        machines.add_index("machine_id", |m: &Machine| {
            Some(IndexKey::Str(m.machine_id.clone()))
        });
        machines.add_index("is_alive", |m: &Machine| {
            if m.is_alive {
                Some(IndexKey::Bool(true))
            } else {
                None
            }
        });
        machines.add_index("hardware_and_os", |m: &Machine| {
            if m.is_alive {
                Some(hardware_and_os_key(&m.hardware, &m.os))
            } else {
                None
            }
        });

        let mut machine_categories = Table::new();
        machine_categories.add_index("hardware_and_os", |c: &MachineCategory| {
            Some(hardware_and_os_key(&c.hardware, &c.os))
        });
        machine_categories.add_index("want_more", |c: &MachineCategory| {
            if c.desired > c.booted {
                Some(IndexKey::Bool(true))
            } else {
                None
            }
        });
        machine_categories.add_index("want_less", |c: &MachineCategory| {
            if c.desired < c.booted {
                Some(IndexKey::Bool(true))
            } else {
                None
            }
        });

        let mut deployments = Table::new();
        deployments.add_index("deployment_id", |d: &Deployment| {
            Some(IndexKey::Str(d.deployment_id.to_string()))
        });
        deployments.add_index("is_alive", |d: &Deployment| {
            if d.is_alive {
                Some(IndexKey::Bool(true))
            } else {
                None
            }
        });
        deployments.add_index("is_alive_and_pending", |d: &Deployment| {
            if d.is_alive && d.machine.is_none() {
                Some(IndexKey::Bool(true))
            } else {
                None
            }
        });
        deployments.add_index("running_on_machine", |d: &Deployment| {
            match (d.is_alive, d.machine) {
                (true, Some(m)) => Some(m.into()),
                _ => None,
            }
        });

        let mut data_tasks = Table::new();
        data_tasks.add_index("status", |t: &DataTask| Some(task_status_key(&t.status)));
        data_tasks.add_index("pending_boot_machine_check", |t: &DataTask| {
            match (&t.status, &t.task) {
                (TaskStatus::Pending(_), BackgroundTask::BootMachineCheck) => {
                    Some(IndexKey::Bool(true))
                }
                _ => None,
            }
        });
        data_tasks.add_index("update_commit_priority", |t: &DataTask| match t.task {
            BackgroundTask::UpdateCommitPriority(commit) => Some(commit.into()),
            _ => None,
        });
        data_tasks.add_index("update_test_priority", |t: &DataTask| match t.task {
            BackgroundTask::UpdateTestPriority(test) => Some(test.into()),
            _ => None,
        });

        Database {
            repos,
            branches,
            branch_pins,
            commits,
            commit_datas,
            commit_relationships,
            commit_test_dependencies,
            tests,
            test_runs,
            test_dependencies,
            unresolved_test_dependencies,
            unresolved_commit_source_dependencies,
            unresolved_commit_repo_dependencies,
            machines,
            machine_categories,
            deployments,
            data_tasks,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! for_each_table {
    ($self:ident, $f:ident) => {
        $f(&mut $self.repos);
        $f(&mut $self.branches);
        $f(&mut $self.branch_pins);
        $f(&mut $self.commits);
        $f(&mut $self.commit_datas);
        $f(&mut $self.commit_relationships);
        $f(&mut $self.commit_test_dependencies);
        $f(&mut $self.tests);
        $f(&mut $self.test_runs);
        $f(&mut $self.test_dependencies);
        $f(&mut $self.unresolved_test_dependencies);
        $f(&mut $self.unresolved_commit_source_dependencies);
        $f(&mut $self.unresolved_commit_repo_dependencies);
        $f(&mut $self.machines);
        $f(&mut $self.machine_categories);
        $f(&mut $self.deployments);
        $f(&mut $self.data_tasks);
    };
}

impl Transactional for Database {
    fn commit_all(&mut self) {
        for_each_table!(self, commit_table);
    }

    fn rollback_all(&mut self) {
        for_each_table!(self, rollback_table);
    }
}

/// The object store specialized to the gantry schema.
pub type GantryStore = Store<Database>;

/// Convenience constructor.
pub fn new_store() -> GantryStore {
    Store::new(Database::new())
}
