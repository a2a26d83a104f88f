//! Shared test fixtures: scripted git repositories in tempdirs.
//!
//! Each fixture repo is a bare "origin" (the clone URL the system sees)
//! plus a working clone used to author commits, so fixtures exercise the
//! same fetch/push paths as production.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Run git in `dir`, panicking with full output on failure. Test-only.
pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_DATE", "2024-01-01T00:00:00 +0000")
        .env("GIT_COMMITTER_DATE", "2024-01-01T00:00:00 +0000")
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} in {} failed:\nstdout: {}\nstderr: {}",
        dir.display(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// One scripted repository: bare origin plus an authoring clone.
pub struct FixtureRepo {
    pub name: String,
    origin: PathBuf,
    work: PathBuf,
}

impl FixtureRepo {
    fn create(root: &Path, name: &str) -> Self {
        let origin = root.join(format!("{name}-origin.git"));
        let work = root.join(format!("{name}-work"));
        std::fs::create_dir_all(&origin).expect("create origin dir");
        std::fs::create_dir_all(&work).expect("create work dir");

        run_git(&origin, &["init", "--bare", "--initial-branch=master", "."]);
        run_git(&work, &["init", "--initial-branch=master", "."]);
        run_git(&work, &["config", "user.email", "fixtures@gantry.dev"]);
        run_git(&work, &["config", "user.name", "Gantry Fixtures"]);
        run_git(
            &work,
            &["remote", "add", "origin", origin.to_str().expect("utf8 path")],
        );

        FixtureRepo {
            name: name.to_string(),
            origin,
            work,
        }
    }

    /// The clone URL (a filesystem path) the system under test should use.
    pub fn url(&self) -> String {
        self.origin.to_string_lossy().into_owned()
    }

    /// Commit files on a branch (created from the current head if new) and
    /// push. `None` content deletes the path. Returns the commit hash.
    pub fn commit_on_branch(
        &self,
        branch: &str,
        files: &[(&str, Option<&str>)],
        message: &str,
    ) -> String {
        let branches = run_git(&self.work, &["branch", "--list", branch]);
        if branches.trim().is_empty() {
            run_git(&self.work, &["checkout", "-b", branch]);
        } else {
            run_git(&self.work, &["checkout", branch]);
        }

        for (path, contents) in files {
            let full = self.work.join(path);
            match contents {
                Some(text) => {
                    if let Some(parent) = full.parent() {
                        std::fs::create_dir_all(parent).expect("create parent dirs");
                    }
                    std::fs::write(&full, text).expect("write fixture file");
                }
                None => {
                    let _ = std::fs::remove_file(&full);
                }
            }
        }

        run_git(&self.work, &["add", "-A"]);
        run_git(&self.work, &["commit", "--allow-empty", "-m", message]);
        run_git(&self.work, &["push", "origin", branch]);
        run_git(&self.work, &["rev-parse", "HEAD"])
            .trim()
            .to_string()
    }

    /// Commit files on master.
    pub fn commit(&self, files: &[(&str, Option<&str>)], message: &str) -> String {
        self.commit_on_branch("master", files, message)
    }

    /// Current head of a branch, from the origin's point of view.
    pub fn head(&self, branch: &str) -> String {
        run_git(&self.origin, &["rev-parse", branch]).trim().to_string()
    }

    /// Fetch origin into the working clone (after the system under test
    /// pushed something).
    pub fn refresh(&self) {
        run_git(&self.work, &["fetch", "origin"]);
        let _ = Command::new("git")
            .args(["reset", "--hard", "origin/master"])
            .current_dir(&self.work)
            .output();
    }

    /// Contents of a path at a commit, from origin.
    pub fn file_at(&self, commitish: &str, path: &str) -> String {
        run_git(&self.origin, &["show", &format!("{commitish}:{path}")])
    }
}

/// A set of fixture repos sharing one tempdir.
pub struct GitFixture {
    _temp: TempDir,
    root: PathBuf,
    repos: HashMap<String, FixtureRepo>,
}

impl GitFixture {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create fixture tempdir");
        let root = temp.path().to_path_buf();
        GitFixture {
            _temp: temp,
            root,
            repos: HashMap::new(),
        }
    }

    /// A scratch directory inside the fixture's tempdir.
    pub fn scratch_dir(&self, name: &str) -> PathBuf {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    pub fn create_repo(&mut self, name: &str) -> &FixtureRepo {
        let repo = FixtureRepo::create(&self.root, name);
        self.repos.insert(name.to_string(), repo);
        &self.repos[name]
    }

    pub fn repo(&self, name: &str) -> &FixtureRepo {
        &self.repos[name]
    }

    /// `(name, clone_url)` pairs for every created repo.
    pub fn repo_urls(&self) -> Vec<(String, String)> {
        self.repos
            .values()
            .map(|r| (r.name.clone(), r.url()))
            .collect()
    }
}

impl Default for GitFixture {
    fn default() -> Self {
        Self::new()
    }
}
