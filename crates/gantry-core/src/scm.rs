//! Source-control adapter contract.
//!
//! The control plane only needs to discover repositories and their clone
//! URLs; webhooks, OAuth, and provider specifics live outside the core.

use async_trait::async_trait;

/// Minimal surface consumed from a source-control provider.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Names of every repository the control plane should track.
    async fn list_repos(&self) -> anyhow::Result<Vec<String>>;

    /// Clone URL for a repository, or `None` if it is unknown.
    async fn clone_url(&self, repo: &str) -> anyhow::Result<Option<String>>;
}

/// A fixed repo list, e.g. from the config file. Also the shape tests use.
pub struct StaticSourceControl {
    repos: Vec<(String, String)>,
}

impl StaticSourceControl {
    pub fn new(repos: Vec<(String, String)>) -> Self {
        StaticSourceControl { repos }
    }
}

#[async_trait]
impl SourceControl for StaticSourceControl {
    async fn list_repos(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.repos.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn clone_url(&self, repo: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .repos
            .iter()
            .find(|(name, _)| name == repo)
            .map(|(_, url)| url.clone()))
    }
}
