//! The per-worker execution engine.
//!
//! One long-lived loop: request work, materialize the environment (image,
//! build inputs, source trees), run stages with streamed output and
//! per-stage timeouts, upload artifacts, report results. Builds whose
//! artifacts all exist already are declared successful without running.

pub mod cache;
pub mod container;
pub mod link;
pub mod process;
pub mod summary;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gantry_db::defs::{HardwareConfig, Image, OsConfig, TestDefinition, TestDependency, TestKind};

use crate::artifacts::{artifact_key, ArtifactStorage};
use crate::clock::Clock;
use crate::git::pool::GitTaskPool;
use crate::git::RepoCacheSet;
use crate::manager::dispatch::HeartbeatResponse;
use crate::proto::{DeploymentAssignment, IndividualTestResult, TerminalInput, TestAssignment};
use crate::scm::SourceControl;

use cache::BuildCache;
use link::{ManagerLink, WorkItem};
use process::CommandOutcome;

/// Cleanup commands get a fixed budget; they must not hang a worker.
const CLEANUP_TIMEOUT_SECONDS: u64 = 600;

/// Worker daemon settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub machine_id: String,
    pub hardware: HardwareConfig,
    pub os: OsConfig,
    /// Everything mutable lives under here.
    pub scratch_root: PathBuf,
    pub build_cache_limit_bytes: u64,
    /// Heartbeat interval H, seconds.
    pub heartbeat_interval: f64,
    /// Idle sleep between work requests.
    pub poll_interval: f64,
    pub run_cleanup_commands: bool,
    /// Environment variables passed through from the worker's own
    /// environment (credentials etc.).
    pub passthrough_env: Vec<String>,
}

struct RunDirs {
    src: PathBuf,
    inputs: PathBuf,
    scratch: PathBuf,
    output: PathBuf,
    build_output: PathBuf,
    ccache: PathBuf,
    log_path: PathBuf,
}

pub struct WorkerEngine {
    link: Arc<dyn ManagerLink>,
    artifacts: Arc<dyn ArtifactStorage>,
    repo_caches: Arc<RepoCacheSet>,
    scm: Option<Arc<dyn SourceControl>>,
    clock: Arc<dyn Clock>,
    git_pool: GitTaskPool,
    build_cache: BuildCache,
    config: WorkerConfig,
    /// The live run (or deployment) and its cancellation token, for
    /// heartbeat-delivered cancellations.
    current_run: Mutex<Option<(Uuid, CancellationToken)>>,
}

impl WorkerEngine {
    pub fn new(
        link: Arc<dyn ManagerLink>,
        artifacts: Arc<dyn ArtifactStorage>,
        repo_caches: Arc<RepoCacheSet>,
        scm: Option<Arc<dyn SourceControl>>,
        clock: Arc<dyn Clock>,
        git_pool: GitTaskPool,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let build_cache = BuildCache::new(
            config.scratch_root.join("build_cache"),
            config.build_cache_limit_bytes,
        );
        Arc::new(WorkerEngine {
            link,
            artifacts,
            repo_caches,
            scm,
            clock,
            git_pool,
            build_cache,
            config,
            current_run: Mutex::new(None),
        })
    }

    /// Main loop: heartbeats in the background, work in the foreground.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let heartbeats = {
            let engine = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.heartbeat_loop(cancel).await })
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.link.request_work().await {
                Ok(Some(WorkItem::Test(assignment))) => {
                    if let Err(e) = self.run_test(assignment, cancel.child_token()).await {
                        tracing::error!(error = %e, "test run failed in the engine");
                    }
                }
                Ok(Some(WorkItem::Deployment(assignment))) => {
                    if let Err(e) = self.run_deployment(assignment, cancel.child_token()).await {
                        tracing::error!(error = %e, "deployment failed in the engine");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs_f64(self.config.poll_interval)) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "work request failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs_f64(self.config.poll_interval)) => {}
                    }
                }
            }
        }
        let _ = heartbeats.await;
    }

    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs_f64(self.config.heartbeat_interval.max(0.5));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.link.heartbeat(None).await {
                Ok(HeartbeatResponse::Ack) => {}
                Ok(HeartbeatResponse::CancelTestRun(run_id)) => {
                    let current = self.current_run.lock().await;
                    if let Some((active, token)) = current.as_ref() {
                        if *active == run_id {
                            tracing::info!(run_id = %run_id, "manager canceled the active run");
                            token.cancel();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "heartbeat failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------

    async fn run_test(&self, assignment: TestAssignment, cancel: CancellationToken) -> Result<()> {
        let run_id = assignment.run_id;
        let definition = &assignment.definition;
        let started = self.clock.now();

        tracing::info!(
            run_id = %run_id,
            test = %definition.name,
            test_hash = %assignment.test_hash,
            "starting test run"
        );

        *self.current_run.lock().await = Some((run_id, cancel.clone()));
        let result = self
            .run_test_inner(&assignment, definition, started, &cancel)
            .await;
        *self.current_run.lock().await = None;
        result
    }

    async fn run_test_inner(
        &self,
        assignment: &TestAssignment,
        definition: &TestDefinition,
        started: f64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let run_id = assignment.run_id;

        // 1. Clean scratch, kill strays, prune containers.
        let dirs = self.prepare_run_dirs(&run_id.to_string()).await?;
        process::kill_leftover_session_processes();
        if self.config.os.uses_docker() {
            let _ = container::prune_dangling(&self.config.machine_id).await;
        }

        // 2. Build reuse: if every artifact already exists, report success
        // without executing anything.
        if definition.kind == TestKind::Build {
            let artifact_names = definition.artifact_names();
            let mut all_present = !artifact_names.is_empty();
            for name in &artifact_names {
                if !self
                    .artifacts
                    .build_exists(&assignment.test_hash, &artifact_key(name))
                    .await?
                {
                    all_present = false;
                    break;
                }
            }
            if all_present {
                tracing::info!(run_id = %run_id, "build artifacts already exist, reusing");
                for name in &artifact_names {
                    self.link.report_artifact_uploaded(run_id, name).await?;
                }
                let now = self.clock.now();
                self.link
                    .report_test_run_result(run_id, true, vec![], started, now)
                    .await?;
                return Ok(());
            }
        }

        // 3. Materialize environment.
        let image = self.resolve_image(definition, &dirs).await?;
        self.materialize_dependencies(assignment, definition, &dirs)
            .await?;

        // 4. Run stages; collect output into the accumulated log.
        let (log_tx, mut log_rx) = mpsc::channel::<String>(256);
        let log_path = dirs.log_path.clone();
        let log_task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let Ok(mut file) = tokio::fs::File::create(&log_path).await else {
                return;
            };
            while let Some(line) = log_rx.recv().await {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            let _ = file.flush().await;
        });

        let run_outcome = self
            .run_stages(assignment, definition, &dirs, image.as_deref(), &log_tx, cancel)
            .await;
        drop(log_tx);
        let _ = log_task.await;

        let (success, _early_stopped) = match run_outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "stage execution errored");
                (false, false)
            }
        };

        if cancel.is_cancelled() {
            // The manager already finalized this run as canceled; any
            // result we report would be discarded anyway.
            tracing::info!(run_id = %run_id, "run canceled, skipping finalization");
            return Ok(());
        }

        // 5. Finalize: sub-test summary, artifact and log uploads, report.
        let individual = self
            .finalize_run(assignment, definition, &dirs, success, started)
            .await
            .unwrap_or_default();

        let now = self.clock.now();
        self.link
            .report_test_run_result(run_id, success, individual, started, now)
            .await?;

        tracing::info!(run_id = %run_id, success = success, "test run reported");
        Ok(())
    }

    /// Run every stage in order. Returns `(success, early_stopped)`.
    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        assignment: &TestAssignment,
        definition: &TestDefinition,
        dirs: &RunDirs,
        image: Option<&str>,
        log_tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<(bool, bool)> {
        let run_id = assignment.run_id;
        let declared: BTreeSet<String> = definition.artifact_names().into_iter().collect();
        let mut uploaded: BTreeSet<String> = BTreeSet::new();

        for (index, stage) in definition.stages.iter().enumerate() {
            self.emit_preamble(log_tx, definition, image, index, &stage.command)
                .await;

            let outcome = self
                .run_stage_command(
                    &stage.command,
                    definition,
                    dirs,
                    image,
                    &run_id.to_string(),
                    definition.timeout,
                    log_tx.clone(),
                    cancel.clone(),
                )
                .await?;

            if !stage.cleanup.is_empty() && self.config.run_cleanup_commands {
                let _ = self
                    .run_stage_command(
                        &stage.cleanup,
                        definition,
                        dirs,
                        image,
                        &format!("{run_id}-cleanup"),
                        CLEANUP_TIMEOUT_SECONDS,
                        log_tx.clone(),
                        cancel.clone(),
                    )
                    .await;
            }

            match outcome {
                CommandOutcome::Success => {}
                CommandOutcome::Failed { exit_code } => {
                    let _ = log_tx
                        .send(format!("stage {index} failed with exit code {exit_code}"))
                        .await;
                    return Ok((false, false));
                }
                CommandOutcome::TimedOut => {
                    let _ = log_tx
                        .send(format!(
                            "stage {index} timed out after {} seconds",
                            definition.timeout
                        ))
                        .await;
                    return Ok((false, false));
                }
                CommandOutcome::Canceled => return Ok((false, false)),
            }

            // Upload this stage's artifacts.
            for artifact in &stage.artifacts {
                if definition.kind == TestKind::Build {
                    self.upload_build_artifact(assignment, dirs, &artifact.name, &artifact.directory)
                        .await?;
                    uploaded.insert(artifact.name.clone());
                } else {
                    self.upload_test_artifact(assignment, dirs, &artifact.name, &artifact.directory)
                        .await?;
                }
            }

            // A build can stop early once everything it promised exists.
            if definition.kind == TestKind::Build
                && !declared.is_empty()
                && uploaded == declared
                && index + 1 < definition.stages.len()
            {
                let _ = log_tx
                    .send("all artifacts uploaded, skipping remaining stages".into())
                    .await;
                return Ok((true, true));
            }
        }

        Ok((true, false))
    }

    async fn emit_preamble(
        &self,
        log_tx: &mpsc::Sender<String>,
        definition: &TestDefinition,
        image: Option<&str>,
        stage_index: usize,
        command: &str,
    ) {
        let image_desc = image.unwrap_or("bare machine");
        for line in [
            format!("==== stage {stage_index} of {} ====", definition.name),
            format!("image: {image_desc}"),
            format!("command: {command}"),
        ] {
            let _ = log_tx.send(line).await;
        }
    }

    /// Execute one command in the right place: a container on docker
    /// hosts, the machine itself otherwise.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage_command(
        &self,
        command: &str,
        definition: &TestDefinition,
        dirs: &RunDirs,
        image: Option<&str>,
        run_token: &str,
        timeout: u64,
        log_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<CommandOutcome> {
        let env = self.stage_environment(definition, dirs, run_token, image.is_some());

        if let Some(image) = image {
            let spec = container::ContainerCommand {
                image: image.to_string(),
                machine_id: self.config.machine_id.clone(),
                run_token: run_token.to_string(),
                command: command.to_string(),
                env,
                volumes: self.container_volumes(dirs),
                working_dir: "/test_looper/src".to_string(),
                interactive: false,
            };
            let name = spec.container_name();
            let outcome =
                process::run_streamed(spec.build(), timeout, log_tx, cancel).await;
            // The container must not outlive the stage on any exit path.
            container::remove_container(&name).await;
            outcome
        } else {
            let mut cmd = tokio::process::Command::new("/bin/sh");
            cmd.args(["-lc", command]);
            cmd.current_dir(&dirs.src);
            cmd.env_clear();
            if let Ok(path) = std::env::var("PATH") {
                cmd.env("PATH", path);
            }
            for (key, value) in env {
                cmd.env(key, value);
            }
            process::run_streamed(cmd, timeout, log_tx, cancel).await
        }
    }

    fn container_volumes(&self, dirs: &RunDirs) -> Vec<(PathBuf, String)> {
        vec![
            (dirs.src.clone(), "/test_looper/src".to_string()),
            (dirs.inputs.clone(), "/test_looper/inputs".to_string()),
            (dirs.scratch.clone(), "/test_looper/scratch".to_string()),
            (dirs.output.clone(), "/test_looper/output".to_string()),
            (
                dirs.build_output.clone(),
                "/test_looper/build_output".to_string(),
            ),
            (dirs.ccache.clone(), "/test_looper/ccache".to_string()),
        ]
    }

    fn stage_environment(
        &self,
        definition: &TestDefinition,
        dirs: &RunDirs,
        run_token: &str,
        in_container: bool,
    ) -> BTreeMap<String, String> {
        let path_of = |host: &Path, container: &str| {
            if in_container {
                container.to_string()
            } else {
                host.to_string_lossy().into_owned()
            }
        };

        let mut env = BTreeMap::new();
        env.insert(
            "TEST_CORES_AVAILABLE".into(),
            self.config.hardware.cores.to_string(),
        );
        env.insert(
            "TEST_RAM_GB_AVAILABLE".into(),
            self.config.hardware.ram_gb.to_string(),
        );
        env.insert("TEST_SRC_DIR".into(), path_of(&dirs.src, "/test_looper/src"));
        env.insert(
            "TEST_INPUTS".into(),
            path_of(&dirs.inputs, "/test_looper/inputs"),
        );
        env.insert(
            "TEST_SCRATCH_DIR".into(),
            path_of(&dirs.scratch, "/test_looper/scratch"),
        );
        env.insert(
            "TEST_OUTPUT_DIR".into(),
            path_of(&dirs.output, "/test_looper/output"),
        );
        env.insert(
            "TEST_BUILD_OUTPUT_DIR".into(),
            path_of(&dirs.build_output, "/test_looper/build_output"),
        );
        env.insert(
            "TEST_CCACHE_DIR".into(),
            path_of(&dirs.ccache, "/test_looper/ccache"),
        );
        env.insert("TEST_LOOPER_TEST_ID".into(), run_token.to_string());

        for (key, value) in &definition.environment.variables {
            env.insert(key.clone(), value.clone());
        }
        for (key, value) in &definition.variables {
            env.insert(key.clone(), value.clone());
        }
        for key in &self.config.passthrough_env {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.clone(), value);
            }
        }
        env
    }

    // -----------------------------------------------------------------
    // Environment materialization
    // -----------------------------------------------------------------

    async fn resolve_image(
        &self,
        definition: &TestDefinition,
        dirs: &RunDirs,
    ) -> Result<Option<String>> {
        match &definition.environment.image {
            Image::DockerfileInline { contents } => {
                if !self.config.os.uses_docker() {
                    bail!("dockerfile environment on a bare machine");
                }
                let tag = container::build_image(contents, &dirs.scratch).await?;
                Ok(Some(tag))
            }
            Image::Ami { .. } => Ok(None),
            Image::Dockerfile { repo, path, .. } => {
                bail!("unresolved dockerfile image {repo}/{path}; resolver should have inlined it")
            }
        }
    }

    /// Download build inputs and source trees, bounded by core count.
    async fn materialize_dependencies(
        &self,
        assignment: &TestAssignment,
        definition: &TestDefinition,
        dirs: &RunDirs,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.hardware.cores.max(1) as usize));
        let mut tasks: Vec<tokio::task::JoinHandle<Result<()>>> = Vec::new();

        for dep in &assignment.build_dependencies {
            let permits = Arc::clone(&permits);
            let artifacts = Arc::clone(&self.artifacts);
            let target = dirs.inputs.join(&dep.expose_as);
            let scratch = dirs.scratch.clone();
            let build_hash = dep.build_hash.clone();
            let key = artifact_key(&dep.artifact);
            let cached = self.build_cache.get(&build_hash, &key);
            let cache_root = self.config.scratch_root.join("build_cache");
            let cache_limit = self.config.build_cache_limit_bytes;

            tasks.push(tokio::spawn(async move {
                let _permit = permits.acquire().await.expect("semaphore open");
                let tarball = match cached {
                    Some(path) => path,
                    None => {
                        let tmp = scratch.join(format!("dep-{}.tar.gz", Uuid::new_v4().simple()));
                        artifacts.download_build(&build_hash, &key, &tmp).await?;
                        let cache = BuildCache::new(cache_root, cache_limit);
                        cache.put(&build_hash, &key, &tmp).unwrap_or(tmp)
                    }
                };
                extract_tarball(&tarball, &target).await
            }));
        }

        // Source dependencies come from the resolved definition, which
        // already carries the environment's dependencies merged in.
        for (expose_as, dep) in definition.dependencies.iter() {
            let TestDependency::Source {
                repo,
                commit_hash,
                path,
            } = dep
            else {
                continue;
            };
            let permit = permits.acquire().await.expect("semaphore open");
            let target = dirs.inputs.join(expose_as);
            self.materialize_source(repo, commit_hash, path.as_deref(), &target, &dirs.scratch)
                .await
                .with_context(|| format!("materializing source dependency {expose_as}"))?;
            drop(permit);
        }

        for task in tasks {
            task.await.expect("dependency task panicked")?;
        }
        Ok(())
    }

    /// Fetch a cached source tarball, or build one from a worktree and
    /// upload it for the next worker.
    async fn materialize_source(
        &self,
        repo: &str,
        commit_hash: &str,
        subpath: Option<&str>,
        target: &Path,
        scratch: &Path,
    ) -> Result<()> {
        let content_key = format!("source-{repo}-{commit_hash}");
        let key = artifact_key(subpath.unwrap_or("src"));

        let tarball = scratch.join(format!("src-{}.tar.gz", Uuid::new_v4().simple()));
        if self.artifacts.build_exists(&content_key, &key).await? {
            self.artifacts
                .download_build(&content_key, &key, &tarball)
                .await?;
        } else {
            let git = self.repo_caches.get(repo);
            if !git.is_initialized() {
                let Some(scm) = &self.scm else {
                    bail!("repo {repo} not cached and no source control configured");
                };
                let url = scm
                    .clone_url(repo)
                    .await?
                    .with_context(|| format!("no clone url for {repo}"))?;
                let git = self.repo_caches.get(repo);
                self.git_pool
                    .run(move || crate::git::GitCache::clone_from(&git, &url))
                    .await
                    .context("cloning repo for source dependency")?;
            }

            let git = self.repo_caches.get(repo);
            let worktree = scratch.join(format!("srctree-{}", Uuid::new_v4().simple()));
            let hash = commit_hash.to_string();
            let worktree_for_git = worktree.clone();
            self.git_pool
                .run(move || git.reset_to_commit_in_directory(&hash, &worktree_for_git))
                .await
                .with_context(|| format!("materializing {repo}/{commit_hash}"))?;

            let tar_root = match subpath {
                Some(sub) => worktree.join(sub),
                None => worktree.clone(),
            };
            create_tarball(&tar_root, &tarball).await?;
            self.artifacts
                .upload_build(&content_key, &key, &tarball)
                .await?;

            let git = self.repo_caches.get(repo);
            let worktree_for_cleanup = worktree.clone();
            let _ = self
                .git_pool
                .run(move || git.remove_worktree(&worktree_for_cleanup))
                .await;
        }

        extract_tarball(&tarball, target).await
    }

    // -----------------------------------------------------------------
    // Artifact uploads and finalization
    // -----------------------------------------------------------------

    async fn upload_build_artifact(
        &self,
        assignment: &TestAssignment,
        dirs: &RunDirs,
        name: &str,
        directory: &str,
    ) -> Result<()> {
        let source = if directory.is_empty() {
            dirs.build_output.clone()
        } else {
            dirs.build_output.join(directory)
        };
        let tarball = dirs
            .scratch
            .join(format!("artifact-{}.tar.gz", Uuid::new_v4().simple()));
        create_tarball(&source, &tarball).await?;

        let key = artifact_key(name);
        self.artifacts
            .upload_build(&assignment.test_hash, &key, &tarball)
            .await?;
        let _ = self.build_cache.put(&assignment.test_hash, &key, &tarball);
        self.link
            .report_artifact_uploaded(assignment.run_id, name)
            .await?;
        tracing::info!(
            run_id = %assignment.run_id,
            artifact = name,
            "uploaded build artifact"
        );
        Ok(())
    }

    async fn upload_test_artifact(
        &self,
        assignment: &TestAssignment,
        dirs: &RunDirs,
        name: &str,
        directory: &str,
    ) -> Result<()> {
        let source = if directory.is_empty() {
            dirs.output.clone()
        } else {
            dirs.output.join(directory)
        };
        let tarball = dirs
            .scratch
            .join(format!("artifact-{}.tar.gz", Uuid::new_v4().simple()));
        create_tarball(&source, &tarball).await?;
        self.artifacts
            .upload_single_test_artifact(
                &assignment.test_hash,
                &assignment.run_id.to_string(),
                &artifact_key(name),
                &tarball,
            )
            .await?;
        self.link
            .report_artifact_uploaded(assignment.run_id, name)
            .await?;
        Ok(())
    }

    async fn finalize_run(
        &self,
        assignment: &TestAssignment,
        definition: &TestDefinition,
        dirs: &RunDirs,
        success: bool,
        started: f64,
    ) -> Result<Vec<IndividualTestResult>> {
        let run_id = assignment.run_id.to_string();
        let mut individual = Vec::new();

        let summary_path = dirs.output.join(summary::SUMMARY_FILENAME);
        if let Ok(text) = tokio::fs::read_to_string(&summary_path).await {
            match summary::parse_summary(&text, &dirs.output) {
                Ok(parsed) => {
                    let mut logs: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
                    for (name, result) in &parsed {
                        individual.push(IndividualTestResult {
                            name: name.clone(),
                            success: result.success,
                            has_logs: !result.logs.is_empty(),
                        });
                        if !result.logs.is_empty() {
                            logs.insert(name.clone(), result.logs.clone());
                        }
                    }
                    if !logs.is_empty() {
                        self.artifacts
                            .upload_individual_test_artifacts(
                                &assignment.test_hash,
                                &run_id,
                                &logs,
                            )
                            .await?;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable testSummary.json");
                }
            }
        }

        // test_result.json plus the accumulated log.
        let now = self.clock.now();
        let result_json = serde_json::json!({
            "success": success,
            "started": started,
            "ended": now,
            "test": definition.name,
            "machine": self.config.machine_id,
        });
        let result_path = dirs.scratch.join("test_result.json");
        tokio::fs::write(&result_path, serde_json::to_vec_pretty(&result_json)?).await?;
        self.artifacts
            .upload_single_test_artifact(
                &assignment.test_hash,
                &run_id,
                "test_result.json",
                &result_path,
            )
            .await?;
        if dirs.log_path.is_file() {
            self.artifacts
                .upload_single_test_artifact(&assignment.test_hash, &run_id, "log.txt", &dirs.log_path)
                .await?;
        }

        Ok(individual)
    }

    // -----------------------------------------------------------------
    // Deployments
    // -----------------------------------------------------------------

    /// Run a deployment: same materialization as a test, then the deploy
    /// command wired to the terminal stream instead of the log.
    async fn run_deployment(
        &self,
        assignment: DeploymentAssignment,
        cancel: CancellationToken,
    ) -> Result<()> {
        let deployment_id = assignment.deployment_id;
        let definition = &assignment.definition;
        tracing::info!(deployment_id = %deployment_id, test = %definition.name, "starting deployment");

        *self.current_run.lock().await = Some((deployment_id, cancel.clone()));

        let dirs = self.prepare_run_dirs(&deployment_id.to_string()).await?;
        let image = self.resolve_image(definition, &dirs).await?;
        let test_assignment = TestAssignment {
            run_id: deployment_id,
            test_hash: assignment.test_hash.clone(),
            definition: definition.clone(),
            build_dependencies: assignment.build_dependencies.clone(),
        };
        self.materialize_dependencies(&test_assignment, definition, &dirs)
            .await?;

        let Some(stage) = definition.stages.first() else {
            bail!("deployment {} has no command", definition.name);
        };
        let env = self.stage_environment(
            definition,
            &dirs,
            &deployment_id.to_string(),
            image.is_some(),
        );

        let mut command = match image.as_deref() {
            Some(image) => {
                let spec = container::ContainerCommand {
                    image: image.to_string(),
                    machine_id: self.config.machine_id.clone(),
                    run_token: deployment_id.to_string(),
                    command: stage.command.clone(),
                    env,
                    volumes: self.container_volumes(&dirs),
                    working_dir: "/test_looper/src".to_string(),
                    interactive: true,
                };
                spec.build()
            }
            None => {
                let mut cmd = tokio::process::Command::new("/bin/sh");
                cmd.args(["-lc", &stage.command]);
                cmd.current_dir(&dirs.src);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                cmd
            }
        };

        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn().context("spawning deployment command")?;
        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take().context("deployment stdout")?;
        let stderr = child.stderr.take().context("deployment stderr")?;

        // Output pump: child -> terminal subscribers.
        let link = Arc::clone(&self.link);
        let out_pump = tokio::spawn(pump_output(stdout, link.clone(), deployment_id));
        let err_pump = tokio::spawn(pump_output(stderr, link.clone(), deployment_id));

        // Input pump: subscribers -> child stdin.
        let input_link = Arc::clone(&self.link);
        let input_cancel = cancel.clone();
        let input_pump = tokio::spawn(async move {
            loop {
                if input_cancel.is_cancelled() {
                    return;
                }
                match input_link.poll_terminal_input(deployment_id).await {
                    Ok(Some(TerminalInput::KeyboardInput { bytes })) => {
                        if let Some(stdin) = stdin.as_mut() {
                            if process::write_stdin(stdin, &bytes).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Some(TerminalInput::Resize { cols, rows })) => {
                        tracing::debug!(cols = cols, rows = rows, "resize ignored (no pty)");
                    }
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(_) => return,
                }
            }
        });

        tokio::select! {
            status = child.wait() => {
                tracing::info!(
                    deployment_id = %deployment_id,
                    status = ?status.ok().and_then(|s| s.code()),
                    "deployment command exited"
                );
            }
            _ = cancel.cancelled() => {
                tracing::info!(deployment_id = %deployment_id, "deployment canceled");
                let _ = child.kill().await;
            }
        }

        input_pump.abort();
        let _ = out_pump.await;
        let _ = err_pump.await;
        *self.current_run.lock().await = None;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------

    /// Per-run directory layout under the scratch root. Everything except
    /// ccache and the build cache starts empty.
    async fn prepare_run_dirs(&self, run_token: &str) -> Result<RunDirs> {
        let root = self.config.scratch_root.join("runs").join(run_token);
        if root.exists() {
            tokio::fs::remove_dir_all(&root)
                .await
                .with_context(|| format!("clearing {}", root.display()))?;
        }

        let dirs = RunDirs {
            src: root.join("src"),
            inputs: root.join("inputs"),
            scratch: root.join("scratch"),
            output: root.join("output"),
            build_output: root.join("build_output"),
            ccache: self.config.scratch_root.join("ccache"),
            log_path: root.join("log.txt"),
        };
        for dir in [
            &dirs.src,
            &dirs.inputs,
            &dirs.scratch,
            &dirs.output,
            &dirs.build_output,
            &dirs.ccache,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(dirs)
    }
}

async fn pump_output<R>(reader: R, link: Arc<dyn ManagerLink>, deployment_id: Uuid)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;
    let mut reader = reader;
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if link
                    .terminal_output(deployment_id, buf[..n].to_vec())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// `tar -czf` wrapper; creates the tarball from the directory's contents.
async fn create_tarball(source_dir: &Path, tarball: &Path) -> Result<()> {
    if !source_dir.exists() {
        tokio::fs::create_dir_all(source_dir).await?;
    }
    if let Some(parent) = tarball.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let output = tokio::process::Command::new("tar")
        .arg("-czf")
        .arg(tarball)
        .arg("-C")
        .arg(source_dir)
        .arg(".")
        .output()
        .await
        .context("running tar -czf")?;
    if !output.status.success() {
        bail!(
            "tar create failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// `tar -xzf` wrapper; extracts into the target directory.
async fn extract_tarball(tarball: &Path, target_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(target_dir).await?;
    let output = tokio::process::Command::new("tar")
        .arg("-xzf")
        .arg(tarball)
        .arg("-C")
        .arg(target_dir)
        .output()
        .await
        .context("running tar -xzf")?;
    if !output.status.success() {
        bail!(
            "tar extract failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}
