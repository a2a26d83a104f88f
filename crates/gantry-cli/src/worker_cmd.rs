//! The `gantry worker` command: a worker daemon connected to a manager.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use gantry_core::artifacts::LocalArtifactStorage;
use gantry_core::clock::SystemClock;
use gantry_core::config;
use gantry_core::git::pool::GitTaskPool;
use gantry_core::git::RepoCacheSet;
use gantry_core::scm::StaticSourceControl;
use gantry_core::worker::link::TcpManagerLink;
use gantry_core::worker::WorkerEngine;

pub async fn run(manager: Option<String>, machine_id: Option<String>) -> Result<()> {
    let file = config::load_config_or_default();
    let manager_addr = manager.unwrap_or_else(|| file.manager.listen_addr.clone());
    let machine_id =
        machine_id.unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));

    let worker_config = file.worker_config(&machine_id)?;
    tracing::info!(
        machine_id = %machine_id,
        manager = %manager_addr,
        cores = worker_config.hardware.cores,
        os = %worker_config.os,
        "starting worker"
    );

    // A protocol mismatch error here exits the process; the supervisor
    // restarts us with matching code.
    let link = TcpManagerLink::connect(
        &manager_addr,
        &machine_id,
        worker_config.hardware,
        worker_config.os.clone(),
    )
    .await?;

    let engine = WorkerEngine::new(
        Arc::new(link),
        Arc::new(LocalArtifactStorage::new(&file.artifacts.root)),
        Arc::new(RepoCacheSet::new(
            worker_config.scratch_root.join("repos"),
        )),
        Some(Arc::new(StaticSourceControl::new(file.repo_list()))),
        Arc::new(SystemClock),
        GitTaskPool::new(file.git.command_pool),
        worker_config,
    );

    let cancel = CancellationToken::new();
    let runner = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run(cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("worker shutting down");
    cancel.cancel();
    let _ = runner.await;
    Ok(())
}
