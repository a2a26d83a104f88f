//! Per-repository git cache.
//!
//! Each tracked repository gets one local clone under the cache root. All
//! queries (commit data, file contents, branch listing) and mutations
//! (fetch, synthetic commits, pushes) shell out to `git` under the repo's
//! reentrant lock, because git serializes worktree operations through a
//! lock file on the shared object store.
//!
//! Everything here is synchronous; callers on the async side go through
//! [`pool::GitTaskPool`] so expensive fetches cannot starve the scheduler.

pub mod pool;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;

/// Errors from git cache operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git: {message}")]
    Command {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    #[error("failed to parse git output: {0}")]
    Parse(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parsed commit metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub parents: Vec<String>,
    pub timestamp: i64,
    pub subject: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
}

/// True for a full 40-hex commit hash.
pub fn is_commit_hash(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

const FIELD_SEP: char = '\x01';
const RECORD_SEP: char = '\x02';

/// A single local clone plus its lock.
pub struct GitCache {
    path: PathBuf,
    lock: ReentrantMutex<()>,
}

impl GitCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        GitCache {
            path: path.into(),
            lock: ReentrantMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a clone exists at the cache path yet.
    pub fn is_initialized(&self) -> bool {
        self.path.join(".git").exists()
    }

    /// Clone `url` into the cache path. No-op if already initialized.
    pub fn clone_from(&self, url: &str) -> Result<(), GitError> {
        let _guard = self.lock.lock();
        if self.is_initialized() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GitError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let target = self.path.to_string_lossy().to_string();
        run_git_in(Path::new("."), &["clone", url, &target])?;
        // Synthetic commits (pin updates) need a committer identity.
        self.run(&["config", "user.name", "gantry"])?;
        self.run(&["config", "user.email", "gantry@localhost"])?;
        tracing::info!(url = url, path = %self.path.display(), "cloned repository");
        Ok(())
    }

    /// Fetch and prune from origin.
    pub fn fetch_origin(&self) -> Result<(), GitError> {
        let _guard = self.lock.lock();
        self.run(&["fetch", "origin", "-p"])?;
        Ok(())
    }

    /// Branch tips as `{branchname -> hash}` for a remote.
    pub fn list_branches_for_remote(
        &self,
        remote: &str,
    ) -> Result<BTreeMap<String, String>, GitError> {
        let _guard = self.lock.lock();
        let prefix = format!("refs/remotes/{remote}/");
        let out = self.run(&[
            "for-each-ref",
            &prefix,
            "--format=%(refname) %(objectname)",
        ])?;
        let mut branches = BTreeMap::new();
        for line in out.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (refname, hash) = line
                .rsplit_once(' ')
                .ok_or_else(|| GitError::Parse(format!("bad for-each-ref line: {line:?}")))?;
            let Some(name) = refname.strip_prefix(&prefix) else {
                continue;
            };
            if name == "HEAD" {
                continue;
            }
            branches.insert(name.to_string(), hash.to_string());
        }
        Ok(branches)
    }

    pub fn commit_exists(&self, hash: &str) -> bool {
        if !is_commit_hash(hash) {
            return false;
        }
        let _guard = self.lock.lock();
        let spec = format!("{hash}^{{commit}}");
        self.run(&["cat-file", "-e", &spec]).is_ok()
    }

    /// Metadata for one commit.
    pub fn commit_data(&self, hash: &str) -> Result<CommitInfo, GitError> {
        let mut commits = self.commit_data_multi(hash, 1)?;
        commits
            .pop()
            .ok_or_else(|| GitError::Parse(format!("no commit data for {hash}")))
    }

    /// Metadata for `depth` commits starting at `hash`, following first
    /// parents and ancestors in log order.
    pub fn commit_data_multi(&self, hash: &str, depth: usize) -> Result<Vec<CommitInfo>, GitError> {
        let _guard = self.lock.lock();
        let format = format!(
            "--format={RECORD_SEP}%H{FIELD_SEP}%P{FIELD_SEP}%ct{FIELD_SEP}%an{FIELD_SEP}%ae{FIELD_SEP}%s{FIELD_SEP}%B"
        );
        let count = format!("-n{depth}");
        let out = self.run(&["log", &count, &format, hash])?;
        parse_commit_records(&out)
    }

    /// Contents of `path` at `hash`, or `None` if the path does not exist
    /// in that tree.
    pub fn file_contents(&self, hash: &str, path: &str) -> Option<String> {
        if !is_commit_hash(hash) {
            return None;
        }
        let _guard = self.lock.lock();
        let spec = format!("{hash}:{path}");
        self.run(&["show", &spec]).ok()
    }

    /// Locate the test-definitions file in a commit: any of the recognized
    /// names, shallowest path first, lexicographically first among ties.
    pub fn test_definitions_path(&self, hash: &str) -> Option<String> {
        let _guard = self.lock.lock();
        let out = self.run(&["ls-tree", "-r", "--name-only", hash]).ok()?;
        out.lines()
            .map(str::trim)
            .filter(|p| is_definitions_filename(p))
            .min_by_key(|p| (p.matches('/').count(), p.to_string()))
            .map(|p| p.to_string())
    }

    /// Materialize `hash` into `directory` as a detached worktree.
    pub fn reset_to_commit_in_directory(
        &self,
        hash: &str,
        directory: &Path,
    ) -> Result<(), GitError> {
        let _guard = self.lock.lock();
        if let Some(parent) = directory.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GitError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        tracing::info!(hash = hash, dir = %directory.display(), "resetting to commit");
        let dir = directory.to_string_lossy().to_string();
        self.run(&["worktree", "add", "--force", "--detach", &dir, hash])?;
        run_git_in(directory, &["reset", "--hard", hash])?;
        Ok(())
    }

    /// Remove a worktree created by [`Self::reset_to_commit_in_directory`].
    pub fn remove_worktree(&self, directory: &Path) -> Result<(), GitError> {
        let _guard = self.lock.lock();
        let dir = directory.to_string_lossy().to_string();
        self.run(&["worktree", "remove", "--force", &dir])?;
        Ok(())
    }

    /// Create a commit on top of `base_hash` from a map of path -> contents
    /// (`None` deletes the path). Works in a throwaway worktree so the main
    /// clone is never touched. Returns the new commit hash.
    pub fn create_commit(
        &self,
        base_hash: &str,
        file_contents: &BTreeMap<String, Option<String>>,
        message: &str,
        author: &str,
        timestamp: Option<i64>,
    ) -> Result<String, GitError> {
        let _guard = self.lock.lock();

        let scratch = std::env::temp_dir().join(format!(
            "gantry-commit-{}",
            uuid::Uuid::new_v4().simple()
        ));
        self.reset_to_commit_in_directory(base_hash, &scratch)?;

        let result = (|| {
            for (file, contents) in file_contents {
                let path = scratch.join(file);
                match contents {
                    None => {
                        if path.is_dir() {
                            std::fs::remove_dir_all(&path).map_err(|e| GitError::Io {
                                path: path.clone(),
                                source: e,
                            })?;
                        } else if path.exists() {
                            std::fs::remove_file(&path).map_err(|e| GitError::Io {
                                path: path.clone(),
                                source: e,
                            })?;
                        }
                    }
                    Some(text) => {
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent).map_err(|e| GitError::Io {
                                path: parent.to_path_buf(),
                                source: e,
                            })?;
                        }
                        std::fs::write(&path, text).map_err(|e| GitError::Io {
                            path: path.clone(),
                            source: e,
                        })?;
                    }
                }
            }

            run_git_in(&scratch, &["add", "-A"])?;

            let mut commit_args: Vec<String> = vec![
                "commit".into(),
                "--allow-empty".into(),
                "-m".into(),
                message.into(),
                format!("--author={author}"),
            ];
            if let Some(ts) = timestamp {
                commit_args.push(format!("--date={ts} +0000"));
            }
            let args: Vec<&str> = commit_args.iter().map(String::as_str).collect();
            run_git_in(&scratch, &args)?;

            let hash = run_git_in(&scratch, &["rev-parse", "HEAD"])?;
            Ok(hash.trim().to_string())
        })();

        let _ = self.run(&["worktree", "remove", "--force", &scratch.to_string_lossy()]);
        result
    }

    /// Push `hash` to `branch` on origin. Returns `false` (without error)
    /// when the push is rejected, e.g. a non-fast-forward.
    pub fn push_commit(
        &self,
        hash: &str,
        branch: &str,
        force: bool,
        create_branch: bool,
    ) -> Result<bool, GitError> {
        let _guard = self.lock.lock();

        if !create_branch {
            let branches = self.list_branches_for_remote("origin")?;
            if !branches.contains_key(branch) {
                tracing::warn!(branch = branch, "refusing to create branch on push");
                return Ok(false);
            }
        }

        let refspec = format!("{hash}:refs/heads/{branch}");
        let mut args = vec!["push", "origin", &refspec];
        if force {
            args.push("--force");
        }
        match self.run(&args) {
            Ok(_) => Ok(true),
            Err(GitError::Exit { stderr, .. }) => {
                tracing::warn!(branch = branch, stderr = %stderr, "push rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// The most recent commit at or before `base_hash` that touched `path`.
    pub fn most_recent_hash_for_subpath(
        &self,
        base_hash: &str,
        path: &str,
    ) -> Result<String, GitError> {
        let _guard = self.lock.lock();
        let out = self.run(&["log", "-1", "--format=%H", base_hash, "--", path])?;
        let hash = out.trim().to_string();
        if hash.is_empty() {
            return Err(GitError::Parse(format!(
                "no commit touching {path:?} at or before {base_hash}"
            )));
        }
        Ok(hash)
    }

    /// A short human-readable summary of a commit, used in synthetic
    /// pin-update commit messages.
    pub fn standard_commit_message_for(&self, hash: &str) -> Result<String, GitError> {
        let info = self.commit_data(hash)?;
        Ok(format!(
            "{} - {} <{}>\n\n{}",
            &info.hash[..10.min(info.hash.len())],
            info.author,
            info.author_email,
            indent(&info.message, "    ")
        ))
    }

    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        run_git_in(&self.path, args)
    }
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|l| format!("{prefix}{l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_definitions_filename(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name == "testDefinitions.json"
        || name == "testDefinitions.yml"
        || name.ends_with(".testlooper.yml")
}

fn parse_commit_records(out: &str) -> Result<Vec<CommitInfo>, GitError> {
    let mut commits = Vec::new();
    for record in out.split(RECORD_SEP) {
        let record = record.trim_matches(['\n', '\r']);
        if record.is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(7, FIELD_SEP).collect();
        if fields.len() != 7 {
            return Err(GitError::Parse(format!(
                "expected 7 commit fields, got {}",
                fields.len()
            )));
        }
        commits.push(CommitInfo {
            hash: fields[0].to_string(),
            parents: fields[1]
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            timestamp: fields[2]
                .trim()
                .parse()
                .map_err(|_| GitError::Parse(format!("bad timestamp {:?}", fields[2])))?,
            author: fields[3].to_string(),
            author_email: fields[4].to_string(),
            subject: fields[5].to_string(),
            message: fields[6].trim_end().to_string(),
        });
    }
    Ok(commits)
}

fn run_git_in(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| GitError::Command {
            message: format!("git {}", args.join(" ")),
            source: e,
        })?;

    if !output.status.success() {
        return Err(GitError::Exit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

// ---------------------------------------------------------------------------
// Cache set
// ---------------------------------------------------------------------------

/// All repo caches under one root directory, keyed by repo name.
pub struct RepoCacheSet {
    root: PathBuf,
    caches: Mutex<HashMap<String, Arc<GitCache>>>,
}

impl RepoCacheSet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RepoCacheSet {
            root: root.into(),
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The cache for `name`, creating the handle (not the clone) if needed.
    pub fn get(&self, name: &str) -> Arc<GitCache> {
        let mut caches = self.caches.lock();
        caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(GitCache::new(self.root.join(name))))
            .clone()
    }

    /// The cache for `name` only if its clone already exists on disk.
    pub fn get_initialized(&self, name: &str) -> Option<Arc<GitCache>> {
        let cache = self.get(name);
        if cache.is_initialized() {
            Some(cache)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_hash_validation() {
        assert!(is_commit_hash(&"a".repeat(40)));
        assert!(is_commit_hash(&"0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_commit_hash("HEAD"));
        assert!(!is_commit_hash(&"A".repeat(40)));
        assert!(!is_commit_hash(&"a".repeat(39)));
    }

    #[test]
    fn definitions_filename_recognition() {
        assert!(is_definitions_filename("testDefinitions.yml"));
        assert!(is_definitions_filename("sub/dir/testDefinitions.json"));
        assert!(is_definitions_filename("ci/gantry.testlooper.yml"));
        assert!(!is_definitions_filename("testDefinitions.yaml"));
        assert!(!is_definitions_filename("readme.md"));
    }

    #[test]
    fn parse_commit_record_fields() {
        let out = format!(
            "{RECORD_SEP}{hash}{FIELD_SEP}{parents}{FIELD_SEP}1700000000{FIELD_SEP}Ann{FIELD_SEP}ann@x.dev{FIELD_SEP}subject line{FIELD_SEP}subject line\n\nbody\n",
            hash = "a".repeat(40),
            parents = format!("{} {}", "b".repeat(40), "c".repeat(40)),
        );
        let commits = parse_commit_records(&out).unwrap();
        assert_eq!(commits.len(), 1);
        let c = &commits[0];
        assert_eq!(c.hash, "a".repeat(40));
        assert_eq!(c.parents.len(), 2);
        assert_eq!(c.timestamp, 1_700_000_000);
        assert_eq!(c.subject, "subject line");
        assert!(c.message.contains("body"));
    }
}
