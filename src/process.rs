//! Child-process runner shared by the yt-dlp and ffmpeg capabilities.

use std::{collections::VecDeque, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    time::Instant,
};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ExtractError, ExtractResult};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug)]
pub struct ProcessOutcome {
    pub success: bool,
    pub code: Option<i32>,
    pub stderr_tail: String,
}

/// Spawns `command`, feeds each stdout line to `on_line`, and waits for exit.
///
/// The child is killed when `cancel` fires or `timeout` elapses. A missing
/// executable maps to [`ExtractError::DependencyUnavailable`].
pub async fn run_streaming<F>(
    mut command: Command,
    program: &str,
    operation: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    mut on_line: F,
) -> ExtractResult<ProcessOutcome>
where
    F: FnMut(&str) + Send,
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ExtractError::DependencyUnavailable {
                missing: vec![program.to_string()],
            }
        } else {
            ExtractError::Unexpected(anyhow::anyhow!("Failed to spawn {program}: {err}"))
        }
    })?;

    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stderr).lines());
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Some(Ok(line)) = lines.next().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        })
    });

    let deadline = Instant::now() + timeout;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = LinesStream::new(BufReader::new(stdout).lines());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    debug!(program, "Child process killed on cancellation");
                    return Err(ExtractError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return Err(ExtractError::Timeout { operation, seconds: timeout.as_secs() });
                }
                line = lines.next() => {
                    match line {
                        Some(Ok(line)) => on_line(&line),
                        Some(Err(err)) => {
                            debug!(program, "Stopped reading stdout: {err}");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(ExtractError::Cancelled);
        }
        _ = tokio::time::sleep_until(deadline) => {
            let _ = child.kill().await;
            return Err(ExtractError::Timeout { operation, seconds: timeout.as_secs() });
        }
        status = child.wait() => status
            .map_err(|err| ExtractError::Unexpected(anyhow::anyhow!("Failed to wait for {program}: {err}")))?,
    };

    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    Ok(ProcessOutcome {
        success: status.success(),
        code: status.code(),
        stderr_tail,
    })
}

/// Runs `program args...` briefly and reports whether it exited cleanly.
pub async fn probe_executable(program: &str, args: &[&str]) -> bool {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(Duration::from_secs(5), command.status()).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}
