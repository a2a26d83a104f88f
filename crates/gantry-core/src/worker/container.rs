//! Docker plumbing for the worker: image builds from inlined dockerfile
//! contents, stage execution inside containers, and cleanup that
//! guarantees no container outlives its stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tokio::process::Command;

/// Name prefix for everything we create, so pruning can find strays.
const CONTAINER_PREFIX: &str = "gantry-run";
const IMAGE_PREFIX: &str = "gantry-env";

/// Build (or reuse) an image from inlined dockerfile contents. The tag is
/// derived from the contents hash, so identical environments share one
/// image.
pub async fn build_image(dockerfile_contents: &str, scratch: &Path) -> Result<String> {
    let digest = hex::encode(Sha256::digest(dockerfile_contents.as_bytes()));
    let tag = format!("{IMAGE_PREFIX}:{}", &digest[..16]);

    // Already built?
    let inspect = Command::new("docker")
        .args(["image", "inspect", &tag])
        .output()
        .await
        .context("running docker image inspect")?;
    if inspect.status.success() {
        return Ok(tag);
    }

    let context_dir = scratch.join("docker-build");
    tokio::fs::create_dir_all(&context_dir).await?;
    tokio::fs::write(context_dir.join("Dockerfile"), dockerfile_contents).await?;

    tracing::info!(tag = %tag, "building docker image");
    let output = Command::new("docker")
        .args(["build", "-t", &tag, "."])
        .current_dir(&context_dir)
        .output()
        .await
        .context("running docker build")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("docker build failed: {stderr}");
    }
    Ok(tag)
}

/// Remove leftover containers from previous runs on this machine.
pub async fn prune_dangling(machine_id: &str) -> Result<()> {
    let filter = format!("name={CONTAINER_PREFIX}-{machine_id}");
    let output = Command::new("docker")
        .args(["ps", "-aq", "--filter", &filter])
        .output()
        .await
        .context("listing dangling containers")?;
    for container in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        tracing::warn!(container = container, "removing dangling container");
        let _ = Command::new("docker")
            .args(["rm", "-f", container])
            .output()
            .await;
    }
    Ok(())
}

/// A stage command prepared for container execution.
pub struct ContainerCommand {
    pub image: String,
    pub machine_id: String,
    pub run_token: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
    /// `(host_path, container_path)` mounts.
    pub volumes: Vec<(PathBuf, String)>,
    pub working_dir: String,
    /// Keep stdin open (`docker run -i`); deployments need it.
    pub interactive: bool,
}

impl ContainerCommand {
    pub fn container_name(&self) -> String {
        format!(
            "{CONTAINER_PREFIX}-{}-{}",
            sanitize_token(&self.machine_id),
            sanitize_token(&self.run_token)
        )
    }

    /// Assemble the `docker run` invocation. `--rm` plus an explicit
    /// `docker rm -f` in [`remove_container`] covers every exit path.
    pub fn build(&self) -> Command {
        let mut command = Command::new("docker");
        command.arg("run");
        command.arg("--rm");
        if self.interactive {
            command.arg("-i");
        }
        command.args(["--name", &self.container_name()]);
        command.args(["-w", &self.working_dir]);
        for (key, value) in &self.env {
            command.args(["-e", &format!("{key}={value}")]);
        }
        for (host, container) in &self.volumes {
            command.args(["-v", &format!("{}:{container}", host.display())]);
        }
        command.arg(&self.image);
        command.args(["/bin/sh", "-lc", &self.command]);
        command
    }
}

/// Force-remove a stage container; no error if it is already gone.
pub async fn remove_container(name: &str) {
    let _ = Command::new("docker")
        .args(["rm", "-f", name])
        .output()
        .await;
}

fn sanitize_token(token: &str) -> String {
    token
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_docker_safe() {
        let cmd = ContainerCommand {
            image: "img".into(),
            machine_id: "host/1".into(),
            run_token: "abc 123".into(),
            command: "true".into(),
            env: BTreeMap::new(),
            volumes: vec![],
            working_dir: "/".into(),
            interactive: false,
        };
        assert_eq!(cmd.container_name(), "gantry-run-host-1-abc-123");
    }
}
