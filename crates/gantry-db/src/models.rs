//! Entity definitions for the object graph.
//!
//! Every entity is a plain struct stored in its own arena table; all
//! cross-entity references are [`Id`]s. Mutation happens only inside store
//! transactions, and the secondary indexes registered in
//! [`crate::schema::Database::new`] are maintained automatically.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::bitstring::Bitstring;
use crate::defs::{
    HardwareConfig, OsConfig, RepoReference, TestDefinition, TestDefinitionSummary,
};
use crate::store::Id;

// ---------------------------------------------------------------------------
// Repos and branches
// ---------------------------------------------------------------------------

/// A source repository known to the control plane. Created on discovery,
/// never deleted (deactivated instead).
#[derive(Debug, Clone)]
pub struct Repo {
    pub name: String,
    pub is_active: bool,
    pub commits: i64,
    pub commits_with_tests: i64,
    pub branch_create_templates: Vec<BranchCreateTemplate>,
}

/// Template driving automatic creation of tracking branches when new
/// branches matching the globs appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchCreateTemplate {
    pub globs_to_include: Vec<String>,
    pub globs_to_exclude: Vec<String>,
    pub suffix: String,
    pub branch_to_copy_from: String,
    pub def_to_replace: String,
    pub disable_other_autos: bool,
    pub autoprioritize_branch: bool,
    pub delete_on_underlying_removal: bool,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub branchname: String,
    pub repo: Id<Repo>,
    pub head: Option<Id<Commit>>,
    pub is_under_test: bool,
    pub autocreate_tracking_branch_name: Option<String>,
}

/// Explicit pin relationship extracted from a branch head's definitions.
#[derive(Debug, Clone)]
pub struct BranchPin {
    pub branch: Id<Branch>,
    pub repo_def: String,
    pub pinned_to_repo: String,
    pub pinned_to_branch: String,
    pub auto: bool,
    pub prioritize: bool,
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Commit {
    /// 40-hex git hash.
    pub hash: String,
    pub repo: Id<Repo>,
    pub data: Option<Id<CommitData>>,
    /// Set by users; never decreased by the system.
    pub user_priority: i64,
    /// `max(user_priority, max over children of calculated_priority)` at
    /// quiescence.
    pub calculated_priority: i64,
    /// Best-effort back-reference; not used for lifetime control.
    pub any_branch: Option<Id<Branch>>,
}

/// Parsed, resolved per-commit payload. Created on demand; re-resolution
/// for a given commit is idempotent.
#[derive(Debug, Clone)]
pub struct CommitData {
    pub commit: Id<Commit>,
    pub parents: Vec<Id<Commit>>,
    pub subject: String,
    pub timestamp: i64,
    pub commit_message: String,
    pub author: String,
    pub author_email: String,
    pub tests: BTreeMap<String, Id<Test>>,
    pub repos: BTreeMap<String, RepoReference>,
    pub test_definitions_error: Option<String>,
    pub tests_parsed: bool,
    pub no_tests_found: bool,
}

/// Child/parent edge in the commit graph.
#[derive(Debug, Clone)]
pub struct CommitRelationship {
    pub child: Id<Commit>,
    pub parent: Id<Commit>,
}

/// Which commits define a given test (many-to-many via hash dedup).
#[derive(Debug, Clone)]
pub struct CommitTestDependency {
    pub commit: Id<Commit>,
    pub test: Id<Test>,
}

// ---------------------------------------------------------------------------
// Tests and runs
// ---------------------------------------------------------------------------

/// Scheduling state of a test. The first six variants are not
/// schedulable; the last three are, ordered by their carried priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPriority {
    NoMoreTests,
    WaitingToRetry,
    DependencyFailed,
    WaitingOnBuilds,
    UnresolvedDependencies,
    HardwareComboUnbootable,
    FirstBuild(i64),
    FirstTest(i64),
    WantsMoreTests(i64),
}

impl TestPriority {
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self,
            TestPriority::FirstBuild(_)
                | TestPriority::FirstTest(_)
                | TestPriority::WantsMoreTests(_)
        )
    }

    /// Sort key for dispatch: higher is scheduled first. Builds outrank
    /// first tests outrank additional runs at equal commit priority.
    pub fn dispatch_rank(&self) -> Option<(i64, i64)> {
        match self {
            TestPriority::FirstBuild(p) => Some((*p, 2)),
            TestPriority::FirstTest(p) => Some((*p, 1)),
            TestPriority::WantsMoreTests(p) => Some((*p, 0)),
            _ => None,
        }
    }
}

impl fmt::Display for TestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMoreTests => write!(f, "no_more_tests"),
            Self::WaitingToRetry => write!(f, "waiting_to_retry"),
            Self::DependencyFailed => write!(f, "dependency_failed"),
            Self::WaitingOnBuilds => write!(f, "waiting_on_builds"),
            Self::UnresolvedDependencies => write!(f, "unresolved_dependencies"),
            Self::HardwareComboUnbootable => write!(f, "hardware_combo_unbootable"),
            Self::FirstBuild(p) => write!(f, "first_build({p})"),
            Self::FirstTest(p) => write!(f, "first_test({p})"),
            Self::WantsMoreTests(p) => write!(f, "wants_more_tests({p})"),
        }
    }
}

/// A deduplicated, fully resolved test. Identity is the content hash of
/// the resolved definition: the same definition reached from different
/// commits or repos is one entity.
#[derive(Debug, Clone)]
pub struct Test {
    pub hash: String,
    pub summary: TestDefinitionSummary,
    pub definition: TestDefinition,
    pub machine_category: Option<Id<MachineCategory>>,
    pub successes: i64,
    pub total_runs: i64,
    pub active_runs: i64,
    pub last_test_end_timestamp: f64,
    pub calculated_priority: i64,
    pub priority: TestPriority,
    /// Number of machines to boot to satisfy this test's unmet demand.
    pub target_machine_boot: i64,
    /// The number of runs the user asked for.
    pub runs_desired: i64,
}

/// A single attempted execution of a test on a machine.
///
/// Live iff `!canceled && end_timestamp <= 0`.
#[derive(Debug, Clone)]
pub struct TestRun {
    /// External identity used on the wire.
    pub run_id: Uuid,
    pub test: Id<Test>,
    pub started_timestamp: f64,
    pub last_heartbeat: f64,
    pub end_timestamp: f64,
    pub success: bool,
    pub canceled: bool,
    pub machine: Option<Id<Machine>>,
    /// Artifact names in upload order.
    pub artifacts_completed: Vec<String>,
    pub test_names: Vec<String>,
    /// One bit per entry of `test_names`: set iff the sub-test passed.
    pub test_failures: Bitstring,
    /// One bit per entry of `test_names`: set iff logs were uploaded.
    pub test_has_logs: Bitstring,
    pub total_test_count: i64,
    pub total_failed_test_count: i64,
}

impl TestRun {
    pub fn is_running(&self) -> bool {
        !self.canceled && self.end_timestamp <= 0.0
    }
}

// ---------------------------------------------------------------------------
// Dependency edges
// ---------------------------------------------------------------------------

/// Resolved edge: `test` consumes an artifact of `depends_on`.
#[derive(Debug, Clone)]
pub struct TestDependencyEdge {
    pub test: Id<Test>,
    pub depends_on: Id<Test>,
    pub artifact: String,
}

/// `test` depends on a build hash for which no Test entity exists yet.
#[derive(Debug, Clone)]
pub struct UnresolvedTestDependency {
    pub test: Id<Test>,
    pub depends_on_hash: String,
    pub artifact: String,
}

/// `commit` could not parse because a referenced commit is not fetched.
#[derive(Debug, Clone)]
pub struct UnresolvedCommitSourceDependency {
    pub commit: Id<Commit>,
    pub repo: Id<Repo>,
    pub commit_hash: String,
}

/// `commit` could not parse because a referenced repo is unknown.
#[derive(Debug, Clone)]
pub struct UnresolvedCommitRepoDependency {
    pub commit: Id<Commit>,
    pub reponame: String,
}

// ---------------------------------------------------------------------------
// Machines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Machine {
    /// External machine id handed out by the driver.
    pub machine_id: String,
    pub hardware: HardwareConfig,
    pub os: OsConfig,
    pub boot_time: f64,
    pub first_heartbeat: f64,
    pub last_heartbeat: f64,
    pub last_test_completed: f64,
    pub is_alive: bool,
    pub last_heartbeat_msg: Option<String>,
}

/// A `(hardware, os)` tuple: the unit of provisioning.
///
/// Invariant: `booted == count(alive machines with matching hw+os)`.
#[derive(Debug, Clone)]
pub struct MachineCategory {
    pub hardware: HardwareConfig,
    pub os: OsConfig,
    pub booted: i64,
    pub desired: i64,
    pub hardware_combo_unbootable: bool,
    pub unbootable_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

/// An interactive, long-lived session of one test on one machine with a
/// pub/sub terminal stream.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub deployment_id: Uuid,
    pub created_timestamp: f64,
    pub machine: Option<Id<Machine>>,
    pub test: Id<Test>,
    pub is_alive: bool,
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Priority level of a pending background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskLevel {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}

impl TaskLevel {
    pub const ALL: [TaskLevel; 5] = [
        TaskLevel::VeryHigh,
        TaskLevel::High,
        TaskLevel::Medium,
        TaskLevel::Low,
        TaskLevel::VeryLow,
    ];

    /// The next-lower level, used when requeueing after a missing
    /// dependency.
    pub fn demoted(self) -> TaskLevel {
        match self {
            TaskLevel::VeryHigh => TaskLevel::High,
            TaskLevel::High => TaskLevel::Medium,
            TaskLevel::Medium => TaskLevel::Low,
            TaskLevel::Low | TaskLevel::VeryLow => TaskLevel::VeryLow,
        }
    }
}

impl fmt::Display for TaskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::VeryHigh => "very_high",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::VeryLow => "very_low",
        };
        f.write_str(s)
    }
}

/// Execution status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending(TaskLevel),
    Running,
}

/// Tagged background-task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    RefreshRepos,
    BootMachineCheck,
    RefreshBranches(Id<Repo>),
    UpdateBranchPins(Id<Branch>),
    UpdateBranchTopCommit(Id<Branch>),
    UpdateCommitData(Id<Commit>),
    CommitTestParse(Id<Commit>),
    UpdateTestPriority(Id<Test>),
    UpdateCommitPriority(Id<Commit>),
    CheckBranchAutocreate(Id<Branch>),
}

impl BackgroundTask {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RefreshRepos => "refresh_repos",
            Self::BootMachineCheck => "boot_machine_check",
            Self::RefreshBranches(_) => "refresh_branches",
            Self::UpdateBranchPins(_) => "update_branch_pins",
            Self::UpdateBranchTopCommit(_) => "update_branch_top_commit",
            Self::UpdateCommitData(_) => "update_commit_data",
            Self::CommitTestParse(_) => "commit_test_parse",
            Self::UpdateTestPriority(_) => "update_test_priority",
            Self::UpdateCommitPriority(_) => "update_commit_priority",
            Self::CheckBranchAutocreate(_) => "check_branch_autocreate",
        }
    }
}

/// A work item in the background priority queue.
#[derive(Debug, Clone)]
pub struct DataTask {
    pub task: BackgroundTask,
    pub status: TaskStatus,
    /// How many times this task has been requeued.
    pub attempts: i64,
    /// Earliest wall-clock time the task may run (requeue delays).
    pub not_before: f64,
}
