//! The `gantry status` command: where the config lives and what it says.

use anyhow::Result;

use gantry_core::config;

pub fn run() -> Result<()> {
    let path = config::config_path();
    println!("config: {}", path.display());
    if !path.exists() {
        println!("  (not found; run `gantry init`)");
        return Ok(());
    }

    let file = config::load_config()?;
    println!("manager listen addr: {}", file.manager.listen_addr);
    println!("git cache root:      {}", file.git.cache_root.display());
    println!("artifact root:       {}", file.artifacts.root.display());
    println!("worker scratch root: {}", file.worker.scratch_root.display());
    println!("tracked repos:       {}", file.repos.len());
    for repo in &file.repos {
        println!("  {} -> {}", repo.name, repo.url);
    }
    Ok(())
}
