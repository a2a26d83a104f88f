//! The test manager: owner of the object graph and the background-task
//! queue.
//!
//! Everything state-changing goes through `transaction_and_lock`: the
//! scheduler mutex sequences cross-transaction operations (source-control
//! polling, worker handshakes), the store transaction makes each step
//! atomic. The mutex is never held across git, driver, or network calls;
//! those happen before or after the transaction, on the bounded git pool.

pub mod deployments;
pub mod dispatch;
pub mod priority;
pub mod server;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gantry_db::defs::{HardwareConfig, OsConfig, TestDefinition, TestDependency, TestKind};
use gantry_db::models::{
    BackgroundTask, Branch, BranchPin, Commit, CommitData, CommitRelationship,
    CommitTestDependency, DataTask, Machine, MachineCategory, Repo, TaskLevel, TaskStatus, Test,
    TestDependencyEdge, TestPriority, UnresolvedCommitRepoDependency,
    UnresolvedCommitSourceDependency, UnresolvedTestDependency,
};
use gantry_db::schema::{hardware_and_os_key, pending_key, GantryStore};
use gantry_db::store::Id;
use gantry_db::Database;

use crate::clock::Clock;
use crate::git::pool::GitTaskPool;
use crate::git::RepoCacheSet;
use crate::glob::matches_any_or_empty;
use crate::machines::controller::{target_machine_boot, MachineCategoryController};
use crate::resolve::{DefinitionResolver, ResolveError};
use crate::scm::SourceControl;

use deployments::DeploymentStreams;

/// Author used for synthetic commits (pin updates, autocreated branches).
const SYNTHETIC_COMMIT_AUTHOR: &str = "gantry <gantry@localhost>";

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Worker heartbeat interval H, seconds.
    pub heartbeat_interval: f64,
    /// A run is dead after `H * heartbeat_timeout_factor` silent seconds.
    pub heartbeat_timeout_factor: f64,
    /// Background task executor concurrency.
    pub task_workers: usize,
    /// Delay before retrying a task that hit a missing dependency.
    pub missing_dep_retry_seconds: f64,
    /// How many commits deep to walk each branch from its head.
    pub max_branch_depth: usize,
    /// Seconds between sweep passes (heartbeat eviction, retry wakeups).
    pub sweep_interval: f64,
    /// Seconds between full source-control refreshes.
    pub refresh_interval: f64,
    /// Shut down deployments idle with no subscribers for this long.
    pub deployment_idle_timeout: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            heartbeat_interval: 3.0,
            heartbeat_timeout_factor: 10.0,
            task_workers: 4,
            missing_dep_retry_seconds: 10.0,
            max_branch_depth: 1000,
            sweep_interval: 2.0,
            refresh_interval: 60.0,
            deployment_idle_timeout: 300.0,
        }
    }
}

impl ManagerConfig {
    /// Age past which a silent run or machine is declared dead.
    pub fn heartbeat_deadline(&self) -> f64 {
        self.heartbeat_interval * self.heartbeat_timeout_factor
    }
}

/// Why a background task did not complete.
#[derive(Debug)]
pub enum TaskError {
    /// A referenced repo or commit is not available yet; requeue lower.
    MissingDependency,
    /// Unexpected failure; logged and dropped.
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::Fatal(e)
    }
}

pub struct TestManager {
    store: Arc<GantryStore>,
    scheduler_lock: AsyncMutex<()>,
    clock: Arc<dyn Clock>,
    scm: Arc<dyn SourceControl>,
    repo_caches: Arc<RepoCacheSet>,
    git_pool: GitTaskPool,
    controller: MachineCategoryController,
    resolver: Arc<std::sync::Mutex<DefinitionResolver>>,
    config: ManagerConfig,
    queue_notify: Notify,
    /// Cancellations to deliver on the next heartbeat, per machine id.
    pending_cancels: parking_lot::Mutex<HashMap<String, Vec<Uuid>>>,
    deployments: DeploymentStreams,
}

impl TestManager {
    pub fn new(
        store: Arc<GantryStore>,
        clock: Arc<dyn Clock>,
        scm: Arc<dyn SourceControl>,
        repo_caches: Arc<RepoCacheSet>,
        git_pool: GitTaskPool,
        controller: MachineCategoryController,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let lookup_caches = Arc::clone(&repo_caches);
        let resolver = DefinitionResolver::new(Arc::new(move |name: &str| {
            lookup_caches.get_initialized(name)
        }));

        Arc::new(TestManager {
            store,
            scheduler_lock: AsyncMutex::new(()),
            clock,
            scm,
            repo_caches,
            git_pool,
            controller,
            resolver: Arc::new(std::sync::Mutex::new(resolver)),
            config,
            queue_notify: Notify::new(),
            pending_cancels: parking_lot::Mutex::new(HashMap::new()),
            deployments: DeploymentStreams::new(),
        })
    }

    pub fn store(&self) -> &Arc<GantryStore> {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn deployments(&self) -> &DeploymentStreams {
        &self.deployments
    }

    /// Acquire the scheduler mutex, then run a store transaction.
    pub async fn transaction_and_lock<R>(
        &self,
        f: impl FnOnce(&mut Database) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.scheduler_lock.lock().await;
        let result = self.store.transaction(f);
        self.queue_notify.notify_waiters();
        result
    }

    // -----------------------------------------------------------------
    // Task queue
    // -----------------------------------------------------------------

    /// Enqueue a background task, deduplicating per `(kind, target)` for
    /// the kinds the filtered indexes track.
    pub fn enqueue(db: &mut Database, task: BackgroundTask, level: TaskLevel, now: f64) {
        let duplicate = match task {
            BackgroundTask::BootMachineCheck => db
                .data_tasks
                .lookup_any("pending_boot_machine_check", true)
                .is_some(),
            BackgroundTask::UpdateCommitPriority(commit) => db
                .data_tasks
                .lookup_any("update_commit_priority", commit)
                .is_some(),
            BackgroundTask::UpdateTestPriority(test) => db
                .data_tasks
                .lookup_any("update_test_priority", test)
                .is_some(),
            _ => false,
        };
        if duplicate {
            return;
        }
        db.data_tasks.insert(DataTask {
            task,
            status: TaskStatus::Pending(level),
            attempts: 0,
            not_before: now,
        });
    }

    /// Enqueue from outside a transaction.
    pub async fn enqueue_now(&self, task: BackgroundTask, level: TaskLevel) -> Result<()> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            Self::enqueue(db, task, level, now);
            Ok(())
        })
        .await
    }

    /// Pop the highest-priority runnable task and mark it running.
    fn pop_task(&self) -> Option<(Id<DataTask>, BackgroundTask)> {
        let now = self.clock.now();
        self.store
            .transaction(|db| {
                for level in TaskLevel::ALL {
                    for id in db.data_tasks.lookup_all("status", pending_key(level)) {
                        let Some(task) = db.data_tasks.get(id).cloned() else {
                            continue;
                        };
                        if task.not_before > now {
                            continue;
                        }
                        db.data_tasks
                            .update(id, |t| t.status = TaskStatus::Running);
                        return Ok(Some((id, task.task)));
                    }
                }
                Ok::<_, anyhow::Error>(None)
            })
            .unwrap_or(None)
    }

    async fn finish_task(&self, task_id: Id<DataTask>, result: Result<(), TaskError>) {
        let now = self.clock.now();
        let retry_delay = self.config.missing_dep_retry_seconds;
        let outcome = self.store.transaction(|db| {
            match &result {
                Ok(()) | Err(TaskError::Fatal(_)) => {
                    db.data_tasks.delete(task_id);
                }
                Err(TaskError::MissingDependency) => {
                    // Jitter the retry so a burst of blocked parses does
                    // not thunder back in lockstep.
                    let delay = retry_delay * (1.0 + rand::random::<f64>() * 0.5);
                    db.data_tasks.update(task_id, |t| {
                        let level = match t.status {
                            TaskStatus::Pending(level) => level,
                            TaskStatus::Running => TaskLevel::Medium,
                        };
                        t.status = TaskStatus::Pending(level.demoted());
                        t.attempts += 1;
                        t.not_before = now + delay;
                    });
                }
            }
            Ok::<_, anyhow::Error>(())
        });
        if let Err(e) = outcome {
            tracing::error!(error = %e, "failed to finalize background task");
        }
        if let Err(TaskError::Fatal(e)) = result {
            tracing::error!(error = %e, "background task failed");
        }
    }

    async fn execute_task(&self, task: BackgroundTask) -> Result<(), TaskError> {
        match task {
            BackgroundTask::RefreshRepos => self.refresh_repos().await,
            BackgroundTask::RefreshBranches(repo) => self.refresh_branches(repo).await,
            BackgroundTask::UpdateBranchTopCommit(branch) => {
                self.update_branch_top_commit(branch).await
            }
            BackgroundTask::UpdateCommitData(commit) => self.update_commit_data(commit).await,
            BackgroundTask::CommitTestParse(commit) => self.commit_test_parse(commit).await,
            BackgroundTask::UpdateCommitPriority(commit) => {
                self.update_commit_priority(commit).await
            }
            BackgroundTask::UpdateTestPriority(test) => self.update_test_priority(test).await,
            BackgroundTask::UpdateBranchPins(branch) => self.update_branch_pins(branch).await,
            BackgroundTask::CheckBranchAutocreate(branch) => {
                self.check_branch_autocreate(branch).await
            }
            BackgroundTask::BootMachineCheck => self.boot_machine_check().await,
        }
    }

    /// Run task workers, the sweep loop, and periodic refreshes until
    /// cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut workers = Vec::new();
        for worker in 0..self.config.task_workers.max(1) {
            let manager = Arc::clone(&self);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                manager.task_worker_loop(worker, cancel).await;
            }));
        }

        let sweeper = {
            let manager = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let interval = Duration::from_secs_f64(manager.config.sweep_interval.max(0.1));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = manager.sweep().await {
                        tracing::warn!(error = %e, "sweep pass failed");
                    }
                }
            })
        };

        let refresher = {
            let manager = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let interval = Duration::from_secs_f64(manager.config.refresh_interval.max(1.0));
                loop {
                    let _ = manager
                        .enqueue_now(BackgroundTask::RefreshRepos, TaskLevel::Medium)
                        .await;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            })
        };

        for handle in workers {
            let _ = handle.await;
        }
        let _ = sweeper.await;
        let _ = refresher.await;
    }

    async fn task_worker_loop(&self, worker: usize, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.queue_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }

            while let Some((task_id, task)) = self.pop_task() {
                tracing::debug!(worker = worker, task = task.kind(), "executing task");
                let result = self.execute_task(task).await;
                self.finish_task(task_id, result).await;
                if cancel.is_cancelled() {
                    return;
                }
            }
        }
    }

    /// Drain the queue until empty; used by tests to reach quiescence.
    pub async fn run_until_idle(&self) -> Result<()> {
        loop {
            let Some((task_id, task)) = self.pop_task() else {
                return Ok(());
            };
            let result = self.execute_task(task).await;
            self.finish_task(task_id, result).await;
        }
    }

    // -----------------------------------------------------------------
    // Repo / branch reconciliation
    // -----------------------------------------------------------------

    async fn refresh_repos(&self) -> Result<(), TaskError> {
        let names = self
            .scm
            .list_repos()
            .await
            .context("listing repos from source control")?;
        let now = self.clock.now();

        self.transaction_and_lock(|db| {
            for name in &names {
                let repo_id = match db.repos.lookup_any("name", name.as_str()) {
                    Some(id) => {
                        db.repos.update(id, |r| r.is_active = true);
                        id
                    }
                    None => db.repos.insert(Repo {
                        name: name.clone(),
                        is_active: true,
                        commits: 0,
                        commits_with_tests: 0,
                        branch_create_templates: vec![],
                    }),
                };
                Self::enqueue(
                    db,
                    BackgroundTask::RefreshBranches(repo_id),
                    TaskLevel::Medium,
                    now,
                );
            }

            // Repos gone from source control are deactivated, never deleted.
            let known: Vec<(Id<Repo>, String)> = db
                .repos
                .lookup_all("is_active", true)
                .into_iter()
                .filter_map(|id| db.repos.get(id).map(|r| (id, r.name.clone())))
                .collect();
            for (id, name) in known {
                if !names.contains(&name) {
                    db.repos.update(id, |r| r.is_active = false);
                    tracing::info!(repo = %name, "repo disappeared from source control, deactivated");
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn refresh_branches(&self, repo_id: Id<Repo>) -> Result<(), TaskError> {
        let Some(name) = self
            .store
            .view(|db| db.repos.get(repo_id).map(|r| r.name.clone()))
        else {
            return Ok(());
        };

        let url = self
            .scm
            .clone_url(&name)
            .await
            .context("looking up clone url")?
            .with_context(|| format!("no clone url for repo {name}"))?;

        let git = self.repo_caches.get(&name);
        let branches = self
            .git_pool
            .run(move || -> Result<BTreeMap<String, String>, crate::git::GitError> {
                crate::git::GitCache::clone_from(&git, &url)?;
                git.fetch_origin()?;
                git.list_branches_for_remote("origin")
            })
            .await
            .with_context(|| format!("refreshing branches of {name}"))?;

        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            for branchname in branches.keys() {
                let key = (repo_id, branchname.clone());
                let branch_id = match db.branches.lookup_any("repo_and_branchname", key) {
                    Some(id) => id,
                    None => db.branches.insert(Branch {
                        branchname: branchname.clone(),
                        repo: repo_id,
                        head: None,
                        is_under_test: false,
                        autocreate_tracking_branch_name: None,
                    }),
                };
                Self::enqueue(
                    db,
                    BackgroundTask::UpdateBranchTopCommit(branch_id),
                    TaskLevel::Medium,
                    now,
                );
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn update_branch_top_commit(&self, branch_id: Id<Branch>) -> Result<(), TaskError> {
        let Some((repo_id, repo_name, branchname)) = self.store.view(|db| {
            let branch = db.branches.get(branch_id)?;
            let repo = db.repos.get(branch.repo)?;
            Some((branch.repo, repo.name.clone(), branch.branchname.clone()))
        }) else {
            return Ok(());
        };

        let git = self.repo_caches.get(&repo_name);
        let depth = self.config.max_branch_depth;
        let branchname_for_git = branchname.clone();
        let walked = self
            .git_pool
            .run(move || -> Result<Vec<crate::git::CommitInfo>, crate::git::GitError> {
                let branches = git.list_branches_for_remote("origin")?;
                let Some(tip) = branches.get(&branchname_for_git) else {
                    return Ok(vec![]);
                };
                git.commit_data_multi(tip, depth)
            })
            .await;

        let walked = match walked {
            Ok(walked) => walked,
            Err(e) => {
                tracing::warn!(repo = %repo_name, branch = %branchname, error = %e, "branch walk failed");
                return Err(TaskError::MissingDependency);
            }
        };
        if walked.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            // Bottom-up: create parents before children so commit data
            // tasks find their parents in place.
            for info in walked.iter().rev() {
                let commit_id = Self::lookup_or_create_commit(db, repo_id, &info.hash);
                if db
                    .commits
                    .get(commit_id)
                    .map(|c| c.data.is_none())
                    .unwrap_or(false)
                {
                    Self::enqueue(
                        db,
                        BackgroundTask::UpdateCommitData(commit_id),
                        TaskLevel::High,
                        now,
                    );
                }
            }

            let head_hash = &walked[0].hash;
            let head_id = Self::lookup_or_create_commit(db, repo_id, head_hash);
            let is_under_test = db
                .branches
                .get(branch_id)
                .map(|b| b.is_under_test)
                .unwrap_or(false);

            db.branches.update(branch_id, |b| b.head = Some(head_id));
            db.commits.update(head_id, |c| {
                c.any_branch = Some(branch_id);
                if is_under_test && c.user_priority == 0 {
                    c.user_priority = 1;
                }
            });
            Self::enqueue(
                db,
                BackgroundTask::UpdateCommitPriority(head_id),
                TaskLevel::Medium,
                now,
            );
            Self::enqueue(
                db,
                BackgroundTask::UpdateBranchPins(branch_id),
                TaskLevel::Low,
                now,
            );
            Self::enqueue(
                db,
                BackgroundTask::CheckBranchAutocreate(branch_id),
                TaskLevel::Low,
                now,
            );
            Ok(())
        })
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Commit data and parsing
    // -----------------------------------------------------------------

    async fn update_commit_data(&self, commit_id: Id<Commit>) -> Result<(), TaskError> {
        let Some((repo_id, repo_name, hash, has_data)) = self.store.view(|db| {
            let commit = db.commits.get(commit_id)?;
            let repo = db.repos.get(commit.repo)?;
            Some((
                commit.repo,
                repo.name.clone(),
                commit.hash.clone(),
                commit.data.is_some(),
            ))
        }) else {
            return Ok(());
        };
        if has_data {
            return Ok(());
        }

        let git = self.repo_caches.get(&repo_name);
        let hash_for_git = hash.clone();
        let info = self
            .git_pool
            .run(move || -> Result<Option<crate::git::CommitInfo>, crate::git::GitError> {
                if !git.commit_exists(&hash_for_git) {
                    return Ok(None);
                }
                git.commit_data(&hash_for_git).map(Some)
            })
            .await
            .with_context(|| format!("reading commit data {repo_name}/{hash}"))?;

        let Some(info) = info else {
            // Not fetched yet; retry after the next refresh.
            return Err(TaskError::MissingDependency);
        };

        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            if db
                .commits
                .get(commit_id)
                .map(|c| c.data.is_some())
                .unwrap_or(true)
            {
                return Ok(());
            }

            let mut parent_ids = Vec::new();
            for parent_hash in &info.parents {
                // Only crawl into parents the branch walk already created;
                // creating them here (for the relationship edge) must not
                // pull the whole history in.
                let seen_before = db
                    .commits
                    .lookup_any("repo_and_hash", (repo_id, parent_hash.clone()))
                    .is_some();
                let parent_id = Self::lookup_or_create_commit(db, repo_id, parent_hash);
                parent_ids.push(parent_id);
                db.commit_relationships.insert(CommitRelationship {
                    child: commit_id,
                    parent: parent_id,
                });
                if seen_before
                    && db
                        .commits
                        .get(parent_id)
                        .map(|c| c.data.is_none())
                        .unwrap_or(false)
                {
                    Self::enqueue(
                        db,
                        BackgroundTask::UpdateCommitData(parent_id),
                        TaskLevel::High,
                        now,
                    );
                }
            }

            let data_id = db.commit_datas.insert(CommitData {
                commit: commit_id,
                parents: parent_ids,
                subject: info.subject.clone(),
                timestamp: info.timestamp,
                commit_message: info.message.clone(),
                author: info.author.clone(),
                author_email: info.author_email.clone(),
                tests: BTreeMap::new(),
                repos: BTreeMap::new(),
                test_definitions_error: None,
                tests_parsed: false,
                no_tests_found: false,
            });
            db.commits.update(commit_id, |c| c.data = Some(data_id));
            db.repos.update(repo_id, |r| r.commits += 1);

            Self::enqueue(
                db,
                BackgroundTask::CommitTestParse(commit_id),
                TaskLevel::Medium,
                now,
            );
            Self::enqueue(
                db,
                BackgroundTask::UpdateCommitPriority(commit_id),
                TaskLevel::Medium,
                now,
            );
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn commit_test_parse(&self, commit_id: Id<Commit>) -> Result<(), TaskError> {
        let Some((repo_name, hash, data_id, parsed)) = self.store.view(|db| {
            let commit = db.commits.get(commit_id)?;
            let repo = db.repos.get(commit.repo)?;
            let data_id = commit.data?;
            let data = db.commit_datas.get(data_id)?;
            Some((
                repo.name.clone(),
                commit.hash.clone(),
                data_id,
                data.tests_parsed,
            ))
        }) else {
            return Ok(());
        };
        if parsed {
            return Ok(());
        }

        let resolver = Arc::clone(&self.resolver);
        let repo_for_resolve = repo_name.clone();
        let hash_for_resolve = hash.clone();
        let outcome = self
            .git_pool
            .run(move || {
                let mut resolver = resolver.lock().expect("resolver lock poisoned");
                resolver
                    .test_environment_and_repo_definitions_for(&repo_for_resolve, &hash_for_resolve)
            })
            .await;

        match outcome {
            Ok((tests, _environments, repos)) => {
                self.materialize_parsed_commit(commit_id, data_id, tests, repos)
                    .await?;
                Ok(())
            }
            Err(ResolveError::MissingDependency {
                reponame,
                commit_hash,
            }) => {
                let now = self.clock.now();
                self.transaction_and_lock(|db| {
                    match (&commit_hash, db.repos.lookup_any("name", reponame.as_str())) {
                        (Some(dep_hash), Some(dep_repo)) => {
                            let key = gantry_db::store::key3(
                                commit_id,
                                dep_repo,
                                dep_hash.clone(),
                            );
                            if db
                                .unresolved_commit_source_dependencies
                                .lookup_any("commit_and_repo_and_hash", key)
                                .is_none()
                            {
                                db.unresolved_commit_source_dependencies.insert(
                                    UnresolvedCommitSourceDependency {
                                        commit: commit_id,
                                        repo: dep_repo,
                                        commit_hash: dep_hash.clone(),
                                    },
                                );
                            }
                            Self::enqueue(
                                db,
                                BackgroundTask::RefreshBranches(dep_repo),
                                TaskLevel::Low,
                                now,
                            );
                        }
                        _ => {
                            let key = (commit_id, reponame.clone());
                            if db
                                .unresolved_commit_repo_dependencies
                                .lookup_any("commit_and_reponame", key)
                                .is_none()
                            {
                                db.unresolved_commit_repo_dependencies.insert(
                                    UnresolvedCommitRepoDependency {
                                        commit: commit_id,
                                        reponame: reponame.clone(),
                                    },
                                );
                            }
                        }
                    }
                    Ok(())
                })
                .await?;
                tracing::info!(
                    repo = %repo_name,
                    commit = %hash,
                    dep_repo = %reponame,
                    "commit parse blocked on missing dependency"
                );
                Err(TaskError::MissingDependency)
            }
            Err(ResolveError::Resolution(message)) => {
                self.transaction_and_lock(|db| {
                    db.commit_datas.update(data_id, |d| {
                        d.test_definitions_error = Some(message.clone());
                        d.tests_parsed = true;
                        d.no_tests_found = false;
                    });
                    Ok(())
                })
                .await?;
                tracing::warn!(repo = %repo_name, commit = %hash, error = %message, "test definitions error");
                Ok(())
            }
        }
    }

    /// Store the resolved output of a successful parse: deduplicated test
    /// entities, dependency edges, and follow-up priority work.
    async fn materialize_parsed_commit(
        &self,
        commit_id: Id<Commit>,
        data_id: Id<CommitData>,
        tests: BTreeMap<String, TestDefinition>,
        repos: BTreeMap<String, gantry_db::defs::RepoReference>,
    ) -> Result<()> {
        let now = self.clock.now();

        self.transaction_and_lock(|db| {
            let commit = db
                .commits
                .get(commit_id)
                .cloned()
                .context("commit vanished during parse")?;

            let mut test_ids: BTreeMap<String, Id<Test>> = BTreeMap::new();
            let mut any_tests = false;

            for (name, definition) in &tests {
                if definition.disabled {
                    continue;
                }
                any_tests = true;

                let test_id = match db.tests.lookup_any("hash", definition.hash.as_str()) {
                    Some(existing) => existing,
                    None => {
                        let summary = definition.summary();
                        let hardware = HardwareConfig {
                            cores: summary.min_cores.max(1),
                            ram_gb: summary.min_ram_gb.max(1),
                        };
                        let os = summary.machine_os.clone();
                        let category = Self::ensure_category(db, hardware, os);
                        let runs_desired = match summary.kind {
                            TestKind::Deployment => 0,
                            _ => 1,
                        };
                        let new_id = db.tests.insert(Test {
                            hash: definition.hash.clone(),
                            summary,
                            definition: definition.clone(),
                            machine_category: Some(category),
                            successes: 0,
                            total_runs: 0,
                            active_runs: 0,
                            last_test_end_timestamp: 0.0,
                            calculated_priority: commit.calculated_priority,
                            priority: TestPriority::NoMoreTests,
                            target_machine_boot: 0,
                            runs_desired,
                        });

                        // Dependency edges: linked if the build test is
                        // already materialized, recorded unresolved if not.
                        for dep in definition.dependencies.values() {
                            if let TestDependency::Build {
                                build_hash,
                                artifact,
                                ..
                            } = dep
                            {
                                match db.tests.lookup_any("hash", build_hash.as_str()) {
                                    Some(dep_test) => {
                                        db.test_dependencies.insert(TestDependencyEdge {
                                            test: new_id,
                                            depends_on: dep_test,
                                            artifact: artifact.clone(),
                                        });
                                    }
                                    None => {
                                        db.unresolved_test_dependencies.insert(
                                            UnresolvedTestDependency {
                                                test: new_id,
                                                depends_on_hash: build_hash.clone(),
                                                artifact: artifact.clone(),
                                            },
                                        );
                                    }
                                }
                            }
                        }

                        // Anyone waiting on this hash gets linked now.
                        let waiters = db
                            .unresolved_test_dependencies
                            .lookup_all("depends_on_hash", definition.hash.as_str());
                        for waiter_id in waiters {
                            let Some(waiter) =
                                db.unresolved_test_dependencies.get(waiter_id).cloned()
                            else {
                                continue;
                            };
                            db.unresolved_test_dependencies.delete(waiter_id);
                            db.test_dependencies.insert(TestDependencyEdge {
                                test: waiter.test,
                                depends_on: new_id,
                                artifact: waiter.artifact,
                            });
                            Self::enqueue(
                                db,
                                BackgroundTask::UpdateTestPriority(waiter.test),
                                TaskLevel::Medium,
                                now,
                            );
                        }

                        new_id
                    }
                };

                let already_linked = db
                    .commit_test_dependencies
                    .lookup_all("commit", commit_id)
                    .into_iter()
                    .filter_map(|id| db.commit_test_dependencies.get(id))
                    .any(|row| row.test == test_id);
                if !already_linked {
                    db.commit_test_dependencies.insert(CommitTestDependency {
                        commit: commit_id,
                        test: test_id,
                    });
                }

                test_ids.insert(name.clone(), test_id);
                Self::enqueue(
                    db,
                    BackgroundTask::UpdateTestPriority(test_id),
                    TaskLevel::Medium,
                    now,
                );
            }

            db.commit_datas.update(data_id, |d| {
                d.tests = test_ids.clone();
                d.repos = repos.clone();
                d.tests_parsed = true;
                d.no_tests_found = !any_tests;
                d.test_definitions_error = None;
            });
            if any_tests {
                db.repos
                    .update(commit.repo, |r| r.commits_with_tests += 1);
            }

            // This commit resolved; clear its own missing-dependency rows.
            for row in db
                .unresolved_commit_source_dependencies
                .lookup_all("commit", commit_id)
            {
                db.unresolved_commit_source_dependencies.delete(row);
            }
            for row in db
                .unresolved_commit_repo_dependencies
                .lookup_all("commit", commit_id)
            {
                db.unresolved_commit_repo_dependencies.delete(row);
            }

            // And wake any commit that was blocked waiting for this one.
            let waiters = db
                .unresolved_commit_source_dependencies
                .lookup_all("repo_and_hash", (commit.repo, commit.hash.clone()));
            for waiter_id in waiters {
                let Some(waiter) = db
                    .unresolved_commit_source_dependencies
                    .get(waiter_id)
                    .cloned()
                else {
                    continue;
                };
                db.unresolved_commit_source_dependencies.delete(waiter_id);
                Self::enqueue(
                    db,
                    BackgroundTask::CommitTestParse(waiter.commit),
                    TaskLevel::Medium,
                    now,
                );
            }

            Self::enqueue(
                db,
                BackgroundTask::UpdateCommitPriority(commit_id),
                TaskLevel::Medium,
                now,
            );
            Ok(())
        })
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Priorities
    // -----------------------------------------------------------------

    async fn update_commit_priority(&self, commit_id: Id<Commit>) -> Result<(), TaskError> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            let Some(commit) = db.commits.get(commit_id).cloned() else {
                return Ok(());
            };
            let new_priority = priority::compute_commit_priority(db, commit_id);
            if new_priority == commit.calculated_priority {
                return Ok(());
            }
            db.commits
                .update(commit_id, |c| c.calculated_priority = new_priority);

            if let Some(data_id) = commit.data {
                if let Some(data) = db.commit_datas.get(data_id).cloned() {
                    for test_id in data.tests.values() {
                        Self::enqueue(
                            db,
                            BackgroundTask::UpdateTestPriority(*test_id),
                            TaskLevel::Medium,
                            now,
                        );
                    }
                    for parent in &data.parents {
                        Self::enqueue(
                            db,
                            BackgroundTask::UpdateCommitPriority(*parent),
                            TaskLevel::Low,
                            now,
                        );
                    }
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn update_test_priority(&self, test_id: Id<Test>) -> Result<(), TaskError> {
        let now = self.clock.now();
        let limits = self.controller.limits().clone();
        self.transaction_and_lock(|db| {
            if db.tests.get(test_id).is_none() {
                return Ok(());
            }

            // The test's priority is the max across every commit that
            // names it.
            let mut calculated = 0;
            for link_id in db.commit_test_dependencies.lookup_all("test", test_id) {
                if let Some(link) = db.commit_test_dependencies.get(link_id) {
                    if let Some(commit) = db.commits.get(link.commit) {
                        calculated = calculated.max(commit.calculated_priority);
                    }
                }
            }
            db.tests
                .update(test_id, |t| t.calculated_priority = calculated);

            let new_priority = priority::compute_test_priority(db, test_id, now);
            db.tests.update(test_id, |t| {
                t.priority = new_priority;
            });
            let target = {
                let test = db.tests.get(test_id).expect("test exists");
                target_machine_boot(test, &limits)
            };
            db.tests.update(test_id, |t| t.target_machine_boot = target);

            // Recompute category demand from every schedulable test in it.
            let Some(category_id) = db.tests.get(test_id).and_then(|t| t.machine_category) else {
                return Ok(());
            };
            let mut desired: i64 = db
                .tests
                .lookup_all("machine_category_and_prioritized", category_id)
                .into_iter()
                .filter_map(|id| db.tests.get(id))
                .map(|t| t.target_machine_boot)
                .sum();
            // Pending deployments hold a machine's worth of demand each.
            desired += db
                .deployments
                .lookup_all("is_alive_and_pending", true)
                .into_iter()
                .filter_map(|id| db.deployments.get(id))
                .filter(|d| {
                    db.tests
                        .get(d.test)
                        .map(|t| t.machine_category == Some(category_id))
                        .unwrap_or(false)
                })
                .count() as i64;
            let desired = desired.min(limits.max_machines_per_category);
            let mut needs_boot_check = false;
            db.machine_categories.update(category_id, |c| {
                c.desired = desired;
                needs_boot_check = c.desired != c.booted;
            });
            if needs_boot_check {
                Self::enqueue(db, BackgroundTask::BootMachineCheck, TaskLevel::High, now);
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn boot_machine_check(&self) -> Result<(), TaskError> {
        let outcome = self
            .controller
            .boot_check(&self.store)
            .await
            .context("boot machine check")?;
        if !outcome.tests_to_reprioritize.is_empty() {
            let now = self.clock.now();
            self.transaction_and_lock(|db| {
                for test_id in &outcome.tests_to_reprioritize {
                    Self::enqueue(
                        db,
                        BackgroundTask::UpdateTestPriority(*test_id),
                        TaskLevel::Medium,
                        now,
                    );
                }
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pins and autocreate
    // -----------------------------------------------------------------

    async fn update_branch_pins(&self, branch_id: Id<Branch>) -> Result<(), TaskError> {
        let Some((repo_name, branchname, head_hash)) = self.store.view(|db| {
            let branch = db.branches.get(branch_id)?;
            let repo = db.repos.get(branch.repo)?;
            let head = db.commits.get(branch.head?)?;
            Some((repo.name.clone(), branch.branchname.clone(), head.hash.clone()))
        }) else {
            return Ok(());
        };

        let resolver = Arc::clone(&self.resolver);
        let repo_for_resolve = repo_name.clone();
        let hash_for_resolve = head_hash.clone();
        let pins = self
            .git_pool
            .run(move || {
                let mut resolver = resolver.lock().expect("resolver lock poisoned");
                resolver.unprocessed_repo_pins_for(&repo_for_resolve, &hash_for_resolve)
            })
            .await;

        let pins = match pins {
            Ok(pins) => pins,
            Err(ResolveError::MissingDependency { .. }) => {
                return Err(TaskError::MissingDependency)
            }
            Err(ResolveError::Resolution(message)) => {
                tracing::warn!(repo = %repo_name, branch = %branchname, error = %message, "pin scan failed");
                return Ok(());
            }
        };

        // Reconcile BranchPin rows with what the head defines.
        self.transaction_and_lock(|db| {
            for row in db.branch_pins.lookup_all("branch", branch_id) {
                db.branch_pins.delete(row);
            }
            for (repo_def, pin) in &pins {
                let gantry_db::defs::RepoReference::Pin {
                    branch: pinned_branch,
                    auto,
                    prioritize,
                    ..
                } = pin
                else {
                    continue;
                };
                db.branch_pins.insert(BranchPin {
                    branch: branch_id,
                    repo_def: repo_def.clone(),
                    pinned_to_repo: pin.reponame().to_string(),
                    pinned_to_branch: pinned_branch.clone(),
                    auto: *auto,
                    prioritize: *prioritize,
                });
            }
            Ok(())
        })
        .await?;

        // Advance auto pins whose tracked branch moved.
        for (repo_def, pin) in &pins {
            let gantry_db::defs::RepoReference::Pin {
                branch: pinned_branch,
                auto: true,
                ..
            } = pin
            else {
                continue;
            };
            let pinned_repo = pin.reponame().to_string();
            let pinned_hash = pin.commit_hash().to_string();

            let target_git = self.repo_caches.get(&pinned_repo);
            let pinned_branch_clone = pinned_branch.clone();
            let tip = self
                .git_pool
                .run(move || -> Result<Option<String>, crate::git::GitError> {
                    if !target_git.is_initialized() {
                        return Ok(None);
                    }
                    target_git.fetch_origin()?;
                    Ok(target_git
                        .list_branches_for_remote("origin")?
                        .get(&pinned_branch_clone)
                        .cloned())
                })
                .await
                .unwrap_or(None);

            let Some(tip) = tip else { continue };
            if tip == pinned_hash {
                continue;
            }

            if let Err(e) = self
                .push_pin_update(
                    &repo_name,
                    &branchname,
                    &head_hash,
                    repo_def,
                    &pinned_repo,
                    &pinned_hash,
                    &tip,
                )
                .await
            {
                tracing::warn!(
                    repo = %repo_name,
                    branch = %branchname,
                    pin = %repo_def,
                    error = %e,
                    "pin update failed"
                );
            }
        }

        Ok(())
    }

    /// Create and push a synthetic commit that moves one pin forward.
    #[allow(clippy::too_many_arguments)]
    async fn push_pin_update(
        &self,
        repo_name: &str,
        branchname: &str,
        head_hash: &str,
        repo_def: &str,
        pinned_repo: &str,
        old_hash: &str,
        new_hash: &str,
    ) -> Result<()> {
        let git = self.repo_caches.get(repo_name);
        let target_git = self.repo_caches.get(pinned_repo);

        let repo_def = repo_def.to_string();
        let branchname = branchname.to_string();
        let head_hash = head_hash.to_string();
        let old_hash = old_hash.to_string();
        let new_hash = new_hash.to_string();
        let repo_name = repo_name.to_string();
        let repo_def_for_log = repo_def.clone();
        let new_hash_for_log = new_hash.clone();

        let pushed = self
            .git_pool
            .run(move || -> Result<bool> {
                let Some(path) = git.test_definitions_path(&head_hash) else {
                    return Ok(false);
                };
                let Some(contents) = git.file_contents(&head_hash, &path) else {
                    return Ok(false);
                };
                if !contents.contains(&old_hash) {
                    tracing::warn!(
                        repo = %repo_name,
                        pin = %repo_def,
                        "definitions no longer contain pinned hash, skipping update"
                    );
                    return Ok(false);
                }
                let updated = contents.replace(&old_hash, &new_hash);

                let summary = target_git
                    .standard_commit_message_for(&new_hash)
                    .unwrap_or_default();
                let message = format!(
                    "Updating pin {repo_def} from {} to {}\n\n{summary}",
                    &old_hash[..8],
                    &new_hash[..8]
                );

                let mut files = BTreeMap::new();
                files.insert(path, Some(updated));
                let new_commit =
                    git.create_commit(&head_hash, &files, &message, SYNTHETIC_COMMIT_AUTHOR, None)?;
                Ok(git.push_commit(&new_commit, &branchname, false, false)?)
            })
            .await?;

        if pushed {
            tracing::info!(pin = %repo_def_for_log, new_hash = %new_hash_for_log, "pushed pin update");
            self.enqueue_now(BackgroundTask::RefreshRepos, TaskLevel::High)
                .await?;
        }
        Ok(())
    }

    async fn check_branch_autocreate(&self, branch_id: Id<Branch>) -> Result<(), TaskError> {
        let Some((repo_id, repo_name, branchname, templates)) = self.store.view(|db| {
            let branch = db.branches.get(branch_id)?;
            let repo = db.repos.get(branch.repo)?;
            Some((
                branch.repo,
                repo.name.clone(),
                branch.branchname.clone(),
                repo.branch_create_templates.clone(),
            ))
        }) else {
            return Ok(());
        };

        for template in templates {
            if !matches_any_or_empty(&template.globs_to_include, &branchname)
                || template
                    .globs_to_exclude
                    .iter()
                    .any(|g| crate::glob::glob_match(g, &branchname))
            {
                continue;
            }
            if branchname.ends_with(&template.suffix) {
                continue;
            }
            let tracking_name = format!("{branchname}{}", template.suffix);

            let exists = self.store.view(|db| {
                db.branches
                    .lookup_any("repo_and_branchname", (repo_id, tracking_name.clone()))
                    .is_some()
            });
            if exists {
                continue;
            }

            let Some(copy_head) = self.store.view(|db| {
                let source = db.branches.lookup_any(
                    "repo_and_branchname",
                    (repo_id, template.branch_to_copy_from.clone()),
                )?;
                let head = db.branches.get(source)?.head?;
                db.commits.get(head).map(|c| c.hash.clone())
            }) else {
                continue;
            };

            let Some(branch_head) = self.store.view(|db| {
                let head = db.branches.get(branch_id)?.head?;
                db.commits.get(head).map(|c| c.hash.clone())
            }) else {
                continue;
            };

            let git = self.repo_caches.get(&repo_name);
            let resolver = Arc::clone(&self.resolver);
            let def_to_replace = template.def_to_replace.clone();
            let repo_for_resolve = repo_name.clone();
            let copy_head_clone = copy_head.clone();
            let tracking_clone = tracking_name.clone();
            let branchname_clone = branchname.clone();

            let created = self
                .git_pool
                .run(move || -> Result<bool> {
                    let pins = {
                        let mut resolver = resolver.lock().expect("resolver lock poisoned");
                        match resolver.unprocessed_repo_pins_for(&repo_for_resolve, &copy_head_clone)
                        {
                            Ok(pins) => pins,
                            Err(_) => return Ok(false),
                        }
                    };
                    let Some(pin) = pins.get(&def_to_replace) else {
                        return Ok(false);
                    };
                    let old_hash = pin.commit_hash().to_string();

                    let Some(path) = git.test_definitions_path(&copy_head_clone) else {
                        return Ok(false);
                    };
                    let Some(contents) = git.file_contents(&copy_head_clone, &path) else {
                        return Ok(false);
                    };
                    if !contents.contains(&old_hash) {
                        return Ok(false);
                    }
                    let updated = contents.replace(&old_hash, &branch_head);

                    let message = format!(
                        "Tracking branch for {branchname_clone}: pin {def_to_replace} to {}",
                        &branch_head[..8]
                    );
                    let mut files = BTreeMap::new();
                    files.insert(path, Some(updated));
                    let new_commit = git.create_commit(
                        &copy_head_clone,
                        &files,
                        &message,
                        SYNTHETIC_COMMIT_AUTHOR,
                        None,
                    )?;
                    Ok(git.push_commit(&new_commit, &tracking_clone, false, true)?)
                })
                .await
                .unwrap_or(false);

            if created {
                tracing::info!(
                    repo = %repo_name,
                    branch = %branchname,
                    tracking = %tracking_name,
                    "autocreated tracking branch"
                );
                self.transaction_and_lock(|db| {
                    db.branches.update(branch_id, |b| {
                        b.autocreate_tracking_branch_name = Some(tracking_name.clone());
                    });
                    Ok(())
                })
                .await?;
                self.enqueue_now(BackgroundTask::RefreshBranches(repo_id), TaskLevel::Medium)
                    .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // User-facing operations
    // -----------------------------------------------------------------

    /// Set a commit's user priority and ripple the recalculation.
    pub async fn set_commit_user_priority(
        &self,
        repo: &str,
        hash: &str,
        priority: i64,
    ) -> Result<()> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            let repo_id = db
                .repos
                .lookup_any("name", repo)
                .with_context(|| format!("unknown repo {repo}"))?;
            let commit_id = db
                .commits
                .lookup_any("repo_and_hash", (repo_id, hash.to_string()))
                .with_context(|| format!("unknown commit {repo}/{hash}"))?;
            db.commits
                .update(commit_id, |c| c.user_priority = priority.max(0));
            Self::enqueue(
                db,
                BackgroundTask::UpdateCommitPriority(commit_id),
                TaskLevel::High,
                now,
            );
            Ok(())
        })
        .await
    }

    /// Toggle whether a branch's commits are prioritized for testing.
    pub async fn set_branch_under_test(
        &self,
        repo: &str,
        branchname: &str,
        under_test: bool,
    ) -> Result<()> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            let repo_id = db
                .repos
                .lookup_any("name", repo)
                .with_context(|| format!("unknown repo {repo}"))?;
            let branch_id = db
                .branches
                .lookup_any("repo_and_branchname", (repo_id, branchname.to_string()))
                .with_context(|| format!("unknown branch {repo}/{branchname}"))?;
            db.branches
                .update(branch_id, |b| b.is_under_test = under_test);
            Self::enqueue(
                db,
                BackgroundTask::UpdateBranchTopCommit(branch_id),
                TaskLevel::High,
                now,
            );
            Ok(())
        })
        .await
    }

    /// Install branch-create templates on a repo; matching branches get
    /// tracking branches forked on the next autocreate check.
    pub async fn set_branch_create_templates(
        &self,
        repo: &str,
        templates: Vec<gantry_db::models::BranchCreateTemplate>,
    ) -> Result<()> {
        self.transaction_and_lock(|db| {
            let repo_id = db
                .repos
                .lookup_any("name", repo)
                .with_context(|| format!("unknown repo {repo}"))?;
            db.repos
                .update(repo_id, |r| r.branch_create_templates = templates.clone());
            Ok(())
        })
        .await
    }

    /// Raise how many runs of a test the user wants.
    pub async fn set_test_runs_desired(&self, test_hash: &str, runs: i64) -> Result<()> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            let test_id = db
                .tests
                .lookup_any("hash", test_hash)
                .with_context(|| format!("unknown test {test_hash}"))?;
            db.tests.update(test_id, |t| t.runs_desired = runs.max(0));
            Self::enqueue(
                db,
                BackgroundTask::UpdateTestPriority(test_id),
                TaskLevel::High,
                now,
            );
            Ok(())
        })
        .await
    }

    // -----------------------------------------------------------------
    // Shared entity helpers
    // -----------------------------------------------------------------

    pub(crate) fn lookup_or_create_commit(
        db: &mut Database,
        repo_id: Id<Repo>,
        hash: &str,
    ) -> Id<Commit> {
        if let Some(id) = db
            .commits
            .lookup_any("repo_and_hash", (repo_id, hash.to_string()))
        {
            return id;
        }
        db.commits.insert(Commit {
            hash: hash.to_string(),
            repo: repo_id,
            data: None,
            user_priority: 0,
            calculated_priority: 0,
            any_branch: None,
        })
    }

    pub(crate) fn ensure_category(
        db: &mut Database,
        hardware: HardwareConfig,
        os: OsConfig,
    ) -> Id<MachineCategory> {
        if let Some(id) = db
            .machine_categories
            .lookup_any("hardware_and_os", hardware_and_os_key(&hardware, &os))
        {
            return id;
        }
        db.machine_categories.insert(MachineCategory {
            hardware,
            os,
            booted: 0,
            desired: 0,
            hardware_combo_unbootable: false,
            unbootable_reason: None,
        })
    }

    /// Record that a machine must cancel a run; delivered with the next
    /// heartbeat response.
    pub(crate) fn queue_cancel_notification(&self, machine_id: &str, run_id: Uuid) {
        self.pending_cancels
            .lock()
            .entry(machine_id.to_string())
            .or_default()
            .push(run_id);
    }

    pub(crate) fn take_cancel_notification(&self, machine_id: &str) -> Option<Uuid> {
        let mut cancels = self.pending_cancels.lock();
        let queue = cancels.get_mut(machine_id)?;
        let run = queue.pop();
        if queue.is_empty() {
            cancels.remove(machine_id);
        }
        run
    }

    /// Register a machine that contacted us without having been booted by
    /// the driver (hand-started workers). Keeps `booted` consistent.
    pub async fn register_machine(
        &self,
        machine_id: &str,
        hardware: HardwareConfig,
        os: OsConfig,
    ) -> Result<()> {
        let now = self.clock.now();
        self.transaction_and_lock(|db| {
            if let Some(existing) = db.machines.lookup_any("machine_id", machine_id) {
                let was_dead = db
                    .machines
                    .get(existing)
                    .map(|m| !m.is_alive)
                    .unwrap_or(false);
                db.machines.update(existing, |m| {
                    m.is_alive = true;
                    m.last_heartbeat = now;
                });
                if was_dead {
                    // A worker came back after being declared dead.
                    let category = Self::ensure_category(db, hardware, os.clone());
                    db.machine_categories.update(category, |c| c.booted += 1);
                }
                return Ok(());
            }
            let category = Self::ensure_category(db, hardware, os.clone());
            db.machines.insert(Machine {
                machine_id: machine_id.to_string(),
                hardware,
                os,
                boot_time: now,
                first_heartbeat: now,
                last_heartbeat: now,
                last_test_completed: 0.0,
                is_alive: true,
                last_heartbeat_msg: None,
            });
            db.machine_categories.update(category, |c| c.booted += 1);
            Ok(())
        })
        .await
    }
}
