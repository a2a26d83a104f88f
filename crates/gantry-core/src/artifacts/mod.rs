//! Build/test artifact storage.
//!
//! Artifacts are tarballs addressed by `(content_key, artifact_key)`:
//! builds under their test hash, per-run uploads under
//! `<test_hash>/<run_id>`, sub-test logs one level deeper. Key derivation
//! and name sanitization live here so every backend agrees byte-for-byte.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Derive the storage key for a named artifact: `sanitize(name) + ".tar.gz"`.
pub fn artifact_key(full_artifact_name: &str) -> String {
    format!("{}.tar.gz", sanitize_name(full_artifact_name))
}

/// Escape a name into a filesystem- and URL-safe token. Reversible via
/// [`unsanitize_name`].
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("_{other:02x}")),
        }
    }
    out
}

/// Reverse [`sanitize_name`]. Malformed escapes are kept verbatim.
pub fn unsanitize_name(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Artifact storage backend.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Whether a build artifact exists for `(content_key, artifact_key)`.
    async fn build_exists(&self, content_key: &str, artifact_key: &str) -> Result<bool>;

    /// Upload the file at `path` as a build artifact.
    async fn upload_build(
        &self,
        content_key: &str,
        artifact_key: &str,
        path: &Path,
    ) -> Result<()>;

    /// Download a build artifact to `dst_path`.
    async fn download_build(
        &self,
        content_key: &str,
        artifact_key: &str,
        dst_path: &Path,
    ) -> Result<()>;

    /// Upload one file into a test run's namespace.
    async fn upload_single_test_artifact(
        &self,
        test_hash: &str,
        run_id: &str,
        name: &str,
        path: &Path,
    ) -> Result<()>;

    /// Upload per-sub-test log files, keyed one level under the run.
    async fn upload_individual_test_artifacts(
        &self,
        test_hash: &str,
        run_id: &str,
        files: &BTreeMap<String, Vec<PathBuf>>,
    ) -> Result<()>;

    /// `(name, bytes)` of every artifact stored for a run.
    async fn test_result_keys_with_sizes(
        &self,
        test_hash: &str,
        run_id: &str,
    ) -> Result<Vec<(String, u64)>>;
}

// ---------------------------------------------------------------------------
// Local disk backend
// ---------------------------------------------------------------------------

/// Stores artifacts under a root directory:
/// `builds/<content_key>/<artifact_key>` and
/// `runs/<test_hash>/<run_id>/<name>`.
pub struct LocalArtifactStorage {
    root: PathBuf,
}

impl LocalArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalArtifactStorage { root: root.into() }
    }

    fn build_path(&self, content_key: &str, artifact_key: &str) -> PathBuf {
        self.root
            .join("builds")
            .join(sanitize_name(content_key))
            .join(artifact_key)
    }

    fn run_dir(&self, test_hash: &str, run_id: &str) -> PathBuf {
        self.root
            .join("runs")
            .join(sanitize_name(test_hash))
            .join(sanitize_name(run_id))
    }
}

#[async_trait]
impl ArtifactStorage for LocalArtifactStorage {
    async fn build_exists(&self, content_key: &str, artifact_key: &str) -> Result<bool> {
        Ok(self.build_path(content_key, artifact_key).exists())
    }

    async fn upload_build(
        &self,
        content_key: &str,
        artifact_key: &str,
        path: &Path,
    ) -> Result<()> {
        let dst = self.build_path(content_key, artifact_key);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &dst)
            .await
            .with_context(|| format!("uploading build artifact to {}", dst.display()))?;
        Ok(())
    }

    async fn download_build(
        &self,
        content_key: &str,
        artifact_key: &str,
        dst_path: &Path,
    ) -> Result<()> {
        let src = self.build_path(content_key, artifact_key);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dst_path)
            .await
            .with_context(|| format!("downloading build artifact {}", src.display()))?;
        Ok(())
    }

    async fn upload_single_test_artifact(
        &self,
        test_hash: &str,
        run_id: &str,
        name: &str,
        path: &Path,
    ) -> Result<()> {
        let dst = self.run_dir(test_hash, run_id).join(sanitize_name(name));
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &dst)
            .await
            .with_context(|| format!("uploading test artifact to {}", dst.display()))?;
        Ok(())
    }

    async fn upload_individual_test_artifacts(
        &self,
        test_hash: &str,
        run_id: &str,
        files: &BTreeMap<String, Vec<PathBuf>>,
    ) -> Result<()> {
        for (sub_test, paths) in files {
            for (index, path) in paths.iter().enumerate() {
                let name = format!("{}/{index}", sanitize_name(sub_test));
                let dst = self.run_dir(test_hash, run_id).join(&name);
                if let Some(parent) = dst.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(path, &dst).await.with_context(|| {
                    format!("uploading sub-test log to {}", dst.display())
                })?;
            }
        }
        Ok(())
    }

    async fn test_result_keys_with_sizes(
        &self,
        test_hash: &str,
        run_id: &str,
    ) -> Result<Vec<(String, u64)>> {
        let dir = self.run_dir(test_hash, run_id);
        let mut out = Vec::new();
        let mut stack = vec![(dir.clone(), String::new())];
        while let Some((path, prefix)) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&path).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let joined = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push((entry.path(), joined));
                } else {
                    out.push((unsanitize_name(&joined), meta.len()));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Keeps everything in maps. Used by tests and single-process setups.
#[derive(Default)]
pub struct InMemoryArtifactStorage {
    builds: Mutex<HashMap<(String, String), Vec<u8>>>,
    runs: Mutex<HashMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryArtifactStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored build artifacts; test helper.
    pub async fn build_count(&self) -> usize {
        self.builds.lock().await.len()
    }
}

#[async_trait]
impl ArtifactStorage for InMemoryArtifactStorage {
    async fn build_exists(&self, content_key: &str, artifact_key: &str) -> Result<bool> {
        Ok(self
            .builds
            .lock()
            .await
            .contains_key(&(content_key.to_string(), artifact_key.to_string())))
    }

    async fn upload_build(
        &self,
        content_key: &str,
        artifact_key: &str,
        path: &Path,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        self.builds
            .lock()
            .await
            .insert((content_key.to_string(), artifact_key.to_string()), bytes);
        Ok(())
    }

    async fn download_build(
        &self,
        content_key: &str,
        artifact_key: &str,
        dst_path: &Path,
    ) -> Result<()> {
        let bytes = self
            .builds
            .lock()
            .await
            .get(&(content_key.to_string(), artifact_key.to_string()))
            .cloned()
            .with_context(|| format!("no build artifact {content_key}/{artifact_key}"))?;
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dst_path, bytes).await?;
        Ok(())
    }

    async fn upload_single_test_artifact(
        &self,
        test_hash: &str,
        run_id: &str,
        name: &str,
        path: &Path,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path).await.unwrap_or_default();
        self.runs
            .lock()
            .await
            .entry((test_hash.to_string(), run_id.to_string()))
            .or_default()
            .insert(name.to_string(), bytes);
        Ok(())
    }

    async fn upload_individual_test_artifacts(
        &self,
        test_hash: &str,
        run_id: &str,
        files: &BTreeMap<String, Vec<PathBuf>>,
    ) -> Result<()> {
        for (sub_test, paths) in files {
            for (index, path) in paths.iter().enumerate() {
                self.upload_single_test_artifact(
                    test_hash,
                    run_id,
                    &format!("{sub_test}/{index}"),
                    path,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn test_result_keys_with_sizes(
        &self,
        test_hash: &str,
        run_id: &str,
    ) -> Result<Vec<(String, u64)>> {
        Ok(self
            .runs
            .lock()
            .await
            .get(&(test_hash.to_string(), run_id.to_string()))
            .map(|files| {
                files
                    .iter()
                    .map(|(name, bytes)| (name.clone(), bytes.len() as u64))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_round_trips() {
        for name in ["build/linux", "a b+c", "plain-name.tar", "_under_score_"] {
            assert_eq!(unsanitize_name(&sanitize_name(name)), name, "{name}");
        }
    }

    #[test]
    fn artifact_key_shape() {
        assert_eq!(artifact_key("out"), "out.tar.gz");
        assert_eq!(artifact_key("build/linux"), "build_2flinux.tar.gz");
    }
}
