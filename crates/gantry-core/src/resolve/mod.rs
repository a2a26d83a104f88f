//! Per-commit test-definition resolution.
//!
//! Input: a `(repo, commit)` pair and a way to look up git caches. Output:
//! the commit's fully resolved repo references, environments, and test
//! definitions, each test carrying its content hash. Resolution is pure
//! with respect to `(repo, hash)` and the git contents: the same inputs
//! always produce byte-identical outputs.

pub mod resolver;
pub mod script;

use thiserror::Error;

pub use resolver::DefinitionResolver;
pub use script::{ParsedDefinitions, ParsedEnvironment, ParsedTest};

/// Cap on include expansions per commit; a cyclic include graph hits this
/// instead of looping forever.
pub const MAX_INCLUDE_ATTEMPTS: usize = 128;

/// Resolution failure modes.
///
/// `Resolution` is a user-facing misconfiguration, terminal for the
/// commit and stored on its `CommitData`. `MissingDependency` is
/// transient: a referenced repo or commit is not fetched yet, and the
/// scheduler should retry once it is.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("{0}")]
    Resolution(String),

    #[error("missing dependency: repo={reponame} commit={commit_hash:?}")]
    MissingDependency {
        reponame: String,
        commit_hash: Option<String>,
    },
}

impl ResolveError {
    pub fn resolution(msg: impl Into<String>) -> Self {
        ResolveError::Resolution(msg.into())
    }

    pub fn missing_repo(reponame: impl Into<String>) -> Self {
        ResolveError::MissingDependency {
            reponame: reponame.into(),
            commit_hash: None,
        }
    }

    pub fn missing_commit(reponame: impl Into<String>, hash: impl Into<String>) -> Self {
        ResolveError::MissingDependency {
            reponame: reponame.into(),
            commit_hash: Some(hash.into()),
        }
    }
}
