//! Subprocess supervision with line-streamed output.
//!
//! Spawns the diagnostic tool with piped stdout/stderr, forwards each
//! complete line as a `Running` output frame (stderr lines also carry
//! the raw line in `error_message`), and emits exactly one terminal
//! frame when the process exits, times out, or is cancelled.
//!
//! Lines are read through [`LinesCodec`] with a maximum length so a
//! tool emitting an enormous line cannot block or exhaust memory; an
//! oversized line is replaced by an explicit truncation marker.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use spyglass_core::protocol::{Task, TaskOutput, TaskStatus};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LineFormatter;
use crate::runtime::args::format_line;

/// Maximum length of one output line before truncation (64 KiB).
const MAX_LINE_LEN: usize = 64 * 1024;

/// Marker emitted in place of a line that exceeded [`MAX_LINE_LEN`].
const TRUNCATION_MARKER: &str = "[line truncated]";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn running_frame(task_id: &str, line: String, stderr: bool) -> TaskOutput {
    TaskOutput {
        task_id: task_id.to_string(),
        error_message: if stderr { line.clone() } else { String::new() },
        line,
        timestamp_ms: now_ms(),
        status: TaskStatus::Running as i32,
    }
}

fn terminal_frame(task_id: &str, status: TaskStatus, error_message: &str) -> TaskOutput {
    TaskOutput {
        task_id: task_id.to_string(),
        line: String::new(),
        error_message: error_message.to_string(),
        timestamp_ms: now_ms(),
        status: status as i32,
    }
}

/// Forward the lines of one pipe into the sink until EOF.
async fn pump_lines<R>(
    reader: R,
    task_id: String,
    formatter: LineFormatter,
    stderr: bool,
    sink: mpsc::Sender<TaskOutput>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(item) = lines.next().await {
        let frame = match item {
            Ok(line) => running_frame(&task_id, format_line(line, formatter), stderr),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(task_id = %task_id, "output line exceeded limit, truncating");
                running_frame(&task_id, TRUNCATION_MARKER.to_string(), stderr)
            }
            Err(LinesCodecError::Io(err)) => {
                debug!(task_id = %task_id, error = %err, "output pipe read error");
                break;
            }
        };
        if sink.send(frame).await.is_err() {
            // Receiver gone (stream client dropped the task); output
            // loss on disconnect is acceptable.
            break;
        }
    }
}

/// Run one subprocess to completion, streaming its output.
///
/// Always emits exactly one terminal frame into `sink` and returns the
/// terminal status:
///
/// - exit code 0 → `Completed`
/// - non-zero exit, spawn failure, or overall timeout → `Failed`
/// - `cancel` fired → process killed (SIGKILL), `Cancelled`
pub async fn run_command(
    task: &Task,
    path: &Path,
    args: Vec<String>,
    formatter: LineFormatter,
    overall_timeout: Duration,
    cancel: &CancellationToken,
    sink: &mpsc::Sender<TaskOutput>,
) -> TaskStatus {
    let task_id = task.task_id.clone();

    info!(task_id = %task_id, command = %path.display(), ?args, "starting command");

    let mut child = match Command::new(path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            let message = format!("failed to start command: {err}");
            warn!(task_id = %task_id, error = %err, "spawn failed");
            let _ = sink
                .send(terminal_frame(&task_id, TaskStatus::Failed, &message))
                .await;
            return TaskStatus::Failed;
        }
    };

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let stdout_pump = tokio::spawn(pump_lines(
        stdout,
        task_id.clone(),
        formatter,
        false,
        sink.clone(),
    ));
    let stderr_pump = tokio::spawn(pump_lines(
        stderr,
        task_id.clone(),
        formatter,
        true,
        sink.clone(),
    ));

    let (status, message) = tokio::select! {
        () = cancel.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!(task_id = %task_id, error = %err, "failed to kill cancelled task");
            }
            (TaskStatus::Cancelled, "Task cancelled".to_string())
        }
        waited = tokio::time::timeout(overall_timeout, child.wait()) => match waited {
            Ok(Ok(exit)) if exit.success() => (TaskStatus::Completed, String::new()),
            Ok(Ok(exit)) => (TaskStatus::Failed, format!("command exited with {exit}")),
            Ok(Err(err)) => (TaskStatus::Failed, format!("failed to wait for command: {err}")),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!(task_id = %task_id, error = %err, "failed to kill timed-out task");
                }
                (
                    TaskStatus::Failed,
                    format!("task timed out after {}s", overall_timeout.as_secs()),
                )
            }
        },
    };

    // Drain the pipes (including a final partial line) before the
    // terminal frame so the client sees output in order.
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;

    let _ = sink.send(terminal_frame(&task_id, status, &message)).await;

    info!(task_id = %task_id, status = ?status, "command finished");
    status
}
