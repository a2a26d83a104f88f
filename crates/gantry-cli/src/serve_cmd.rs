//! The `gantry serve` command: run the scheduler and the worker protocol
//! listener until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use gantry_core::clock::SystemClock;
use gantry_core::config;
use gantry_core::git::pool::GitTaskPool;
use gantry_core::git::RepoCacheSet;
use gantry_core::machines::controller::{MachineCategoryController, MachineLimits};
use gantry_core::machines::InMemoryMachineDriver;
use gantry_core::manager::{server, TestManager};
use gantry_core::scm::StaticSourceControl;

pub async fn run(listen: Option<String>) -> Result<()> {
    let file = config::load_config_or_default();
    let listen_addr = listen.unwrap_or_else(|| file.manager.listen_addr.clone());

    if file.repos.is_empty() {
        tracing::warn!("no [[repos]] configured; the scheduler will sit idle");
    }

    let store = Arc::new(gantry_db::schema::new_store());
    let clock = Arc::new(SystemClock);
    let scm = Arc::new(StaticSourceControl::new(file.repo_list()));
    let repo_caches = Arc::new(RepoCacheSet::new(&file.git.cache_root));
    let git_pool = GitTaskPool::new(file.git.command_pool);

    // Machines register themselves at handshake; the in-memory driver
    // only books capacity. A cloud driver slots in here.
    let driver = Arc::new(InMemoryMachineDriver::new());
    let controller = MachineCategoryController::new(
        driver,
        clock.clone(),
        MachineLimits {
            max_machines_per_category: file.machines.max_per_category,
            ..MachineLimits::default()
        },
    );

    let manager = TestManager::new(
        store,
        clock,
        scm,
        repo_caches,
        git_pool,
        controller,
        file.manager_config(),
    );

    let cancel = CancellationToken::new();
    let scheduler = {
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "manager listening for workers");

    let protocol = {
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        tokio::spawn(async move { server::serve(manager, listener, cancel).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();
    let _ = scheduler.await;
    let _ = protocol.await;
    Ok(())
}
