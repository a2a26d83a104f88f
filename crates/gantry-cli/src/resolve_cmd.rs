//! The `gantry resolve` command: resolve one commit's definitions and
//! print the result. Handy for debugging definitions files without a
//! running scheduler.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use gantry_core::config;
use gantry_core::git::{is_commit_hash, RepoCacheSet};
use gantry_core::resolve::DefinitionResolver;
use gantry_core::scm::{SourceControl, StaticSourceControl};

pub async fn run(repo: &str, commit: &str) -> Result<()> {
    if !is_commit_hash(commit) {
        bail!("{commit:?} is not a 40-hex commit hash");
    }

    let file = config::load_config_or_default();
    let scm = StaticSourceControl::new(file.repo_list());
    let caches = Arc::new(RepoCacheSet::new(&file.git.cache_root));

    // Make sure the target repo (at least) is cloned and fresh.
    let url = scm
        .clone_url(repo)
        .await?
        .with_context(|| format!("repo {repo:?} is not in the config's repo list"))?;
    let git = caches.get(repo);
    tokio::task::spawn_blocking(move || -> Result<(), gantry_core::git::GitError> {
        gantry_core::git::GitCache::clone_from(&git, &url)?;
        git.fetch_origin()
    })
    .await
    .expect("git task panicked")
    .context("preparing repo clone")?;

    let lookup_caches = Arc::clone(&caches);
    let repo_name = repo.to_string();
    let commit_hash = commit.to_string();
    let output = tokio::task::spawn_blocking(move || {
        let mut resolver = DefinitionResolver::new(Arc::new(move |name: &str| {
            lookup_caches.get_initialized(name)
        }));
        resolver.test_environment_and_repo_definitions_for(&repo_name, &commit_hash)
    })
    .await
    .expect("resolver task panicked");

    match output {
        Ok((tests, environments, repos)) => {
            let doc = serde_json::json!({
                "tests": tests,
                "environments": environments,
                "repos": repos,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        }
        Err(e) => bail!("resolution failed: {e}"),
    }
}
