//! Subprocess supervision for the external code-generation CLI.
//!
//! Launches the executor binary, streams its stdout line-by-line into the
//! run log, watches a wall-clock and an idle-output timeout, and extracts a
//! session-id marker for resumption. The marker grammar is deliberately
//! isolated behind [`extract_session_id`] since it is the one part of the
//! executor contract the engine treats as an opaque, refreshable regex.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::ExecutorError;

static SESSION_ID_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""session_id"\s*:\s*"([^"]+)""#).unwrap());
static SESSION_ID_KV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"session_id=(\S+)").unwrap());

/// Find the executor's session-id marker in a single line of stdout, if
/// present. Tries the structured JSON shape first, falls back to a plain
/// `session_id=<token>` marker.
pub fn extract_session_id(line: &str) -> Option<String> {
    if let Some(caps) = SESSION_ID_JSON_RE.captures(line) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = SESSION_ID_KV_RE.captures(line) {
        return Some(caps[1].to_string());
    }
    None
}

/// Exit codes the executor contract reserves for transient (network/auth)
/// failures, distinct from a logical non-zero failure.
const TRANSIENT_EXIT_CODES: &[i32] = &[2, 3];

pub struct ExecutorInvocation<'a> {
    pub executor_bin: &'a str,
    pub prompt: &'a str,
    pub model: &'a str,
    pub working_dir: &'a Path,
    pub session_id: Option<&'a str>,
    pub aux_config_path: Option<&'a Path>,
    pub stage_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug)]
pub struct ExecutorOutcome {
    pub success: bool,
    pub session_id: Option<String>,
}

/// Run the executor to completion once, with no retry. Writes every
/// streamed line to `log_lines`. Returns an error classified as transient,
/// fatal, timeout, or cancelled per §7.
pub async fn run_once(
    invocation: &ExecutorInvocation<'_>,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str),
) -> Result<ExecutorOutcome, ExecutorError> {
    if which(invocation.executor_bin).is_none() {
        return Err(ExecutorError::BinaryMissing(invocation.executor_bin.to_string()));
    }

    let mut cmd = Command::new(invocation.executor_bin);
    cmd.arg("--model").arg(invocation.model);
    if let Some(session_id) = invocation.session_id {
        cmd.arg("--resume").arg(session_id);
    }
    if let Some(aux) = invocation.aux_config_path {
        cmd.arg("--mcp-config").arg(aux);
    }
    cmd.current_dir(invocation.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // The child may exit without reading stdin at all; a broken pipe
        // here just means it didn't want the prompt, not that the
        // invocation failed. The process's actual exit status still governs
        // the outcome below.
        let _ = stdin.write_all(invocation.prompt.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let stdout = child.stdout.take().expect("piped stdout");
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let reader_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut session_id = None;
    let result = supervise(
        &mut child,
        &mut line_rx,
        cancel,
        invocation.stage_timeout,
        invocation.idle_timeout,
        |line| {
            if let Some(sid) = extract_session_id(line) {
                session_id = Some(sid);
            }
            on_line(line);
        },
    )
    .await;

    let _ = reader_task.await;

    match result {
        SuperviseResult::Exited(status) => {
            let code = status.code().unwrap_or(-1);
            if status.success() {
                Ok(ExecutorOutcome {
                    success: true,
                    session_id,
                })
            } else if TRANSIENT_EXIT_CODES.contains(&code) {
                Err(ExecutorError::TransientExit(code))
            } else {
                Err(ExecutorError::NonZeroExit(code))
            }
        }
        SuperviseResult::TimedOut => {
            kill_with_grace(&mut child, Duration::from_secs(5)).await;
            Err(ExecutorError::Timeout(invocation.stage_timeout))
        }
        SuperviseResult::IdleTimedOut => {
            kill_with_grace(&mut child, Duration::from_secs(5)).await;
            Err(ExecutorError::IdleTimeout(invocation.idle_timeout))
        }
        SuperviseResult::Cancelled => {
            kill_with_grace(&mut child, Duration::from_secs(30)).await;
            Err(ExecutorError::Cancelled)
        }
    }
}

/// Run with the retry policy for transient failures: up to 2 retries with
/// exponential backoff (30s, 90s). Any non-transient outcome is terminal.
pub async fn run_with_retry(
    invocation: &ExecutorInvocation<'_>,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str),
) -> Result<ExecutorOutcome, ExecutorError> {
    const BACKOFFS: [Duration; 2] = [Duration::from_secs(30), Duration::from_secs(90)];
    let mut attempt = 0;
    loop {
        match run_once(invocation, cancel, &mut on_line).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_transient() && attempt < BACKOFFS.len() => {
                tokio::select! {
                    _ = tokio::time::sleep(BACKOFFS[attempt]) => {}
                    _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

enum SuperviseResult {
    Exited(std::process::ExitStatus),
    TimedOut,
    IdleTimedOut,
    Cancelled,
}

async fn supervise(
    child: &mut Child,
    line_rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
    stage_timeout: Duration,
    idle_timeout: Duration,
    mut on_line: impl FnMut(&str),
) -> SuperviseResult {
    let deadline = tokio::time::sleep(stage_timeout);
    tokio::pin!(deadline);

    loop {
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        tokio::select! {
            status = child.wait() => {
                // Drain any remaining buffered lines before returning.
                while let Ok(line) = line_rx.try_recv() {
                    on_line(&line);
                }
                return SuperviseResult::Exited(status.expect("wait on child failed"));
            }
            line = line_rx.recv() => {
                match line {
                    Some(line) => { on_line(&line); continue; }
                    None => continue,
                }
            }
            _ = &mut deadline => return SuperviseResult::TimedOut,
            _ = &mut idle => return SuperviseResult::IdleTimedOut,
            _ = cancel.cancelled() => return SuperviseResult::Cancelled,
        }
    }
}

async fn kill_with_grace(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        unsafe {
            libc_kill(pid as i32, 15); // SIGTERM
        }
    }
    let _ = tokio::time::timeout(grace, child.wait()).await;
    let _ = child.kill().await;
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    unsafe extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    unsafe {
        kill(pid, sig);
    }
}

fn which(bin: &str) -> Option<PathBuf> {
    if bin.contains('/') {
        let p = PathBuf::from(bin);
        return if p.is_file() { Some(p) } else { None };
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(bin);
        candidate.is_file().then_some(candidate)
    })
}
