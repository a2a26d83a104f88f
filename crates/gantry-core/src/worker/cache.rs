//! Worker-local build cache.
//!
//! Downloaded and freshly built artifacts are kept on disk so repeated
//! runs on the same machine skip the artifact store. When the cache grows
//! past its budget the oldest entries go first.

use std::path::{Path, PathBuf};

use anyhow::Result;

pub struct BuildCache {
    root: PathBuf,
    limit_bytes: u64,
}

impl BuildCache {
    pub fn new(root: impl Into<PathBuf>, limit_bytes: u64) -> Self {
        BuildCache {
            root: root.into(),
            limit_bytes,
        }
    }

    fn entry_path(&self, content_key: &str, artifact_key: &str) -> PathBuf {
        self.root
            .join(crate::artifacts::sanitize_name(content_key))
            .join(artifact_key)
    }

    /// Cached tarball path if present. Touches mtime so it counts as
    /// recently used.
    pub fn get(&self, content_key: &str, artifact_key: &str) -> Option<PathBuf> {
        let path = self.entry_path(content_key, artifact_key);
        if !path.is_file() {
            return None;
        }
        let _ = filetime_touch(&path);
        Some(path)
    }

    /// Store a tarball in the cache, then purge if over budget.
    pub fn put(&self, content_key: &str, artifact_key: &str, tarball: &Path) -> Result<PathBuf> {
        let path = self.entry_path(content_key, artifact_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(tarball, &path)?;
        self.purge()?;
        Ok(path)
    }

    /// Delete oldest entries until under the size budget.
    pub fn purge(&self) -> Result<()> {
        if self.limit_bytes == 0 {
            return Ok(());
        }
        let mut entries = Vec::new();
        collect_files(&self.root, &mut entries);
        let mut total: u64 = entries.iter().map(|(_, size, _)| *size).sum();
        if total <= self.limit_bytes {
            return Ok(());
        }

        entries.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, size, _) in entries {
            if total <= self.limit_bytes {
                break;
            }
            tracing::info!(path = %path.display(), "purging cached build");
            if std::fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(size);
            }
        }
        Ok(())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, u64, std::time::SystemTime)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else if let Ok(meta) = entry.metadata() {
            let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            out.push((path, meta.len(), mtime));
        }
    }
}

fn filetime_touch(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().append(true).open(path)?;
    file.set_modified(std::time::SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_and_purge_oldest() {
        let dir = TempDir::new().unwrap();
        let cache = BuildCache::new(dir.path().join("cache"), 10);

        let tarball = dir.path().join("artifact.tar.gz");
        std::fs::write(&tarball, b"eightby!").unwrap();

        cache.put("hash-a", "out.tar.gz", &tarball).unwrap();
        assert!(cache.get("hash-a", "out.tar.gz").is_some());

        std::thread::sleep(std::time::Duration::from_millis(20));
        // Second entry pushes the total past the 10-byte budget; the
        // older entry goes.
        cache.put("hash-b", "out.tar.gz", &tarball).unwrap();
        assert!(cache.get("hash-a", "out.tar.gz").is_none());
        assert!(cache.get("hash-b", "out.tar.gz").is_some());
    }
}
