//! Configuration file management.
//!
//! TOML config at `~/.config/gantry/gantry.toml` (XDG layout), overridable
//! with `GANTRY_CONFIG`. Resolution chain for each value: CLI flag > env
//! var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gantry_db::defs::{HardwareConfig, OsConfig};

use crate::manager::ManagerConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub manager: ManagerSection,
    pub git: GitSection,
    pub artifacts: ArtifactsSection,
    pub machines: MachinesSection,
    pub worker: WorkerSection,
    pub repos: Vec<RepoEntry>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        ConfigFile {
            manager: ManagerSection::default(),
            git: GitSection::default(),
            artifacts: ArtifactsSection::default(),
            machines: MachinesSection::default(),
            worker: WorkerSection::default(),
            repos: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSection {
    pub listen_addr: String,
    pub task_workers: usize,
    pub heartbeat_interval: f64,
    pub heartbeat_timeout_factor: f64,
    pub refresh_interval: f64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        ManagerSection {
            listen_addr: "127.0.0.1:7451".to_string(),
            task_workers: 4,
            heartbeat_interval: 3.0,
            heartbeat_timeout_factor: 10.0,
            refresh_interval: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSection {
    pub cache_root: PathBuf,
    pub command_pool: usize,
}

impl Default for GitSection {
    fn default() -> Self {
        GitSection {
            cache_root: data_dir().join("repos"),
            command_pool: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub root: PathBuf,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        ArtifactsSection {
            root: data_dir().join("artifacts"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachinesSection {
    pub max_per_category: i64,
}

impl Default for MachinesSection {
    fn default() -> Self {
        MachinesSection {
            max_per_category: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub scratch_root: PathBuf,
    pub cores: u32,
    pub ram_gb: u32,
    pub os: String,
    pub build_cache_gb: u64,
    pub passthrough_env: Vec<String>,
    pub run_cleanup_commands: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        WorkerSection {
            scratch_root: data_dir().join("worker"),
            cores: 4,
            ram_gb: 8,
            os: "linux-docker".to_string(),
            build_cache_gb: 10,
            passthrough_env: vec![],
            run_cleanup_commands: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    pub url: String,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Config directory, always XDG-shaped (`~/.config/gantry`), ignoring the
/// platform-specific dir on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gantry");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("gantry")
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("GANTRY_CONFIG") {
        return PathBuf::from(path);
    }
    config_dir().join("gantry.toml")
}

fn data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("gantry");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("gantry")
}

// ---------------------------------------------------------------------------
// Read / write
// ---------------------------------------------------------------------------

/// Load and parse the config file; errors if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse config file")
}

/// Load the config file, falling back to defaults if it is absent.
pub fn load_config_or_default() -> ConfigFile {
    load_config().unwrap_or_default()
}

/// Serialize and write the config file, creating parent dirs.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Derived runtime configs
// ---------------------------------------------------------------------------

impl ConfigFile {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            heartbeat_interval: self.manager.heartbeat_interval,
            heartbeat_timeout_factor: self.manager.heartbeat_timeout_factor,
            task_workers: self.manager.task_workers,
            refresh_interval: self.manager.refresh_interval,
            ..ManagerConfig::default()
        }
    }

    pub fn worker_config(&self, machine_id: &str) -> Result<WorkerConfig> {
        Ok(WorkerConfig {
            machine_id: machine_id.to_string(),
            hardware: HardwareConfig {
                cores: self.worker.cores,
                ram_gb: self.worker.ram_gb,
            },
            os: parse_os(&self.worker.os)?,
            scratch_root: self.worker.scratch_root.clone(),
            build_cache_limit_bytes: self.worker.build_cache_gb * 1024 * 1024 * 1024,
            heartbeat_interval: self.manager.heartbeat_interval,
            poll_interval: 2.0,
            run_cleanup_commands: self.worker.run_cleanup_commands,
            passthrough_env: self.worker.passthrough_env.clone(),
        })
    }

    pub fn repo_list(&self) -> Vec<(String, String)> {
        self.repos
            .iter()
            .map(|r| (r.name.clone(), r.url.clone()))
            .collect()
    }
}

fn parse_os(text: &str) -> Result<OsConfig> {
    match text {
        "linux-docker" => Ok(OsConfig::LinuxWithDocker),
        "windows-docker" => Ok(OsConfig::WindowsWithDocker),
        other => {
            if let Some(ami) = other.strip_prefix("linux-oneshot/") {
                Ok(OsConfig::LinuxOneshot {
                    ami: ami.to_string(),
                })
            } else if let Some(ami) = other.strip_prefix("windows-oneshot/") {
                Ok(OsConfig::WindowsOneshot {
                    ami: ami.to_string(),
                })
            } else {
                anyhow::bail!("unknown worker os {other:?}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_back() {
        let config = ConfigFile::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: ConfigFile = toml::from_str(&text).unwrap();
        assert_eq!(back.manager.listen_addr, config.manager.listen_addr);
        assert_eq!(back.machines.max_per_category, 8);
    }

    #[test]
    fn os_round_trip() {
        assert_eq!(parse_os("linux-docker").unwrap(), OsConfig::LinuxWithDocker);
        assert_eq!(
            parse_os("linux-oneshot/ami-42").unwrap(),
            OsConfig::LinuxOneshot {
                ami: "ami-42".into()
            }
        );
        assert!(parse_os("beos").is_err());
    }
}
