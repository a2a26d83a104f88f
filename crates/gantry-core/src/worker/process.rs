//! Stage process execution: process-group management, output streaming,
//! timeouts, and leftover-process cleanup on bare machines.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of one streamed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    Failed { exit_code: i32 },
    TimedOut,
    Canceled,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success)
    }
}

/// Run a prepared command, streaming interleaved stdout/stderr lines to
/// `output`, enforcing `timeout` (zero = unlimited), and honoring
/// cancellation. On timeout or cancel the whole process group dies, not
/// just the direct child.
pub async fn run_streamed(
    mut command: Command,
    timeout_seconds: u64,
    output: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<CommandOutcome> {
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.stdin(Stdio::null());
    command.kill_on_drop(true);
    new_process_group(&mut command);

    let mut child = command.spawn().context("spawning stage command")?;
    let pid = child.id();

    let stdout = child.stdout.take().context("stage stdout")?;
    let stderr = child.stderr.take().context("stage stderr")?;

    let out_task = stream_lines(stdout, output.clone());
    let err_task = stream_lines(stderr, output.clone());

    let deadline = if timeout_seconds == 0 {
        None
    } else {
        Some(Duration::from_secs(timeout_seconds))
    };

    let status = async {
        let waited = child.wait().await;
        let _ = out_task.await;
        let _ = err_task.await;
        waited
    };

    let outcome = tokio::select! {
        status = status => match status {
            Ok(status) if status.success() => CommandOutcome::Success,
            Ok(status) => CommandOutcome::Failed {
                exit_code: status.code().unwrap_or(-1),
            },
            Err(e) => {
                tracing::warn!(error = %e, "stage wait failed");
                CommandOutcome::Failed { exit_code: -1 }
            }
        },
        _ = sleep_opt(deadline) => {
            kill_process_group(pid);
            let _ = child.kill().await;
            CommandOutcome::TimedOut
        }
        _ = cancel.cancelled() => {
            kill_process_group(pid);
            let _ = child.kill().await;
            CommandOutcome::Canceled
        }
    };

    Ok(outcome)
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

fn stream_lines<R>(reader: R, output: mpsc::Sender<String>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if output.send(line).await.is_err() {
                return;
            }
        }
    })
}

#[cfg(unix)]
fn new_process_group(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
fn new_process_group(_command: &mut Command) {}

/// Kill every process in the child's group.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Kill processes sharing our session but outside our own ancestry; these
/// are strays left by a previous run on a bare machine.
#[cfg(unix)]
pub fn kill_leftover_session_processes() {
    let our_pid = std::process::id() as libc::pid_t;
    let our_sid = unsafe { libc::getsid(0) };
    if our_sid < 0 {
        return;
    }

    let mut ancestors = Vec::new();
    let mut cursor = our_pid;
    while cursor > 1 && ancestors.len() < 64 {
        ancestors.push(cursor);
        cursor = parent_of(cursor).unwrap_or(0);
    }

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<libc::pid_t>().ok())
        else {
            continue;
        };
        if ancestors.contains(&pid) {
            continue;
        }
        let sid = unsafe { libc::getsid(pid) };
        if sid != our_sid {
            continue;
        }
        let pgid = unsafe { libc::getpgid(pid) };
        if ancestors.iter().any(|a| unsafe { libc::getpgid(*a) } == pgid) {
            continue;
        }
        tracing::warn!(pid = pid, "killing leftover process from previous run");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
pub fn kill_leftover_session_processes() {}

#[cfg(unix)]
fn parent_of(pid: libc::pid_t) -> Option<libc::pid_t> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // PPID is field 4, after the parenthesized comm (which may itself
    // contain spaces and parens).
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// Write accumulated lines into a child's stdin (deployment keyboard
/// input path).
pub async fn write_stdin(stdin: &mut tokio::process::ChildStdin, bytes: &[u8]) -> Result<()> {
    stdin.write_all(bytes).await.context("writing to stdin")?;
    stdin.flush().await.context("flushing stdin")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_and_failure_exit_codes() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut ok_cmd = Command::new("sh");
        ok_cmd.args(["-c", "echo hello"]);
        let outcome = run_streamed(ok_cmd, 10, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Success);
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        let (tx, _rx) = mpsc::channel(16);
        let mut bad_cmd = Command::new("sh");
        bad_cmd.args(["-c", "exit 3"]);
        let outcome = run_streamed(bad_cmd, 10, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Failed { exit_code: 3 });
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let (tx, _rx) = mpsc::channel(16);
        let mut slow = Command::new("sh");
        slow.args(["-c", "sleep 30"]);
        let started = std::time::Instant::now();
        let outcome = run_streamed(slow, 1, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let mut slow = Command::new("sh");
        slow.args(["-c", "sleep 30"]);
        let outcome = run_streamed(slow, 0, tx, cancel).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Canceled);
    }
}
