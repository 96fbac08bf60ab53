// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines preserved from each end when output exceeds the ceiling.  Errors
/// and summaries cluster at the end of build output, so the tail matters
/// as much as the head.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

pub struct ShellTool {
    pub timeout_secs: u64,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Execute
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         command: the complete one-liner. workdir: optional working directory.\n\
         timeout_secs: optional override of the default timeout.\n\
         Output streams live and is capped at ~20 KB; when larger, the first\n\
         100 and last 100 lines are preserved with an omission marker.\n\
         Prefer non-interactive commands; avoid anything that needs a TTY.\n\
         Do NOT use shell for file operations:\n\
         - Read files  → read   (not cat / head / tail)\n\
         - Search text → grep   (not grep / rg)\n\
         - Find files  → glob or find (not find / ls -R)\n\
         - Edit files  → edit   (not sed / awk / patch)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (default: workspace root)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn signature_content(&self, args: &Value) -> Option<String> {
        args.get("command").and_then(|v| v.as_str()).map(str::to_string)
    }

    fn abstract_rule(&self, args: &Value) -> Option<String> {
        let command = args.get("command").and_then(|v| v.as_str())?;
        let program = command.split_whitespace().next()?;
        Some(format!("shell({program} *)"))
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let Some(command) = call.args.get("command").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'command'");
        };
        let workdir = call
            .args
            .get("workdir")
            .and_then(|v| v.as_str())
            .map(|p| super::resolve_path(&ctx.workspace_root, p))
            .unwrap_or_else(|| ctx.workspace_root.clone());
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, workdir = %workdir.display(), "shell tool");

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ExecutionError,
                    format!("failed to spawn: {e}"),
                );
            }
        };

        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, line_tx);
        }

        let deadline = tokio::time::sleep(Duration::from_secs(timeout));
        tokio::pin!(deadline);

        let mut lines: Vec<String> = Vec::new();
        let status = loop {
            tokio::select! {
                biased;
                _ = ctx.signal.cancelled() => {
                    terminate(&mut child).await;
                    let partial = truncate_output(&lines);
                    return ToolOutput::err(
                        &call.id,
                        ToolErrorKind::Aborted,
                        format!("command aborted\n\n{partial}"),
                    );
                }
                _ = &mut deadline => {
                    terminate(&mut child).await;
                    let partial = truncate_output(&lines);
                    return ToolOutput::err(
                        &call.id,
                        ToolErrorKind::ExecutionError,
                        format!("command timed out after {timeout}s\n\n{partial}"),
                    )
                    .with_metadata(json!({ "timed_out": true }));
                }
                line = line_rx.recv() => match line {
                    Some(l) => {
                        ctx.push_output(&l).await;
                        lines.push(l);
                    }
                    // Both pipes hit EOF — collect the exit status.
                    None => match child.wait().await {
                        Ok(s) => break s,
                        Err(e) => {
                            return ToolOutput::err(
                                &call.id,
                                ToolErrorKind::ExecutionError,
                                format!("wait failed: {e}"),
                            );
                        }
                    }
                }
            }
        };

        let output = truncate_output(&lines);
        let code = status.code().unwrap_or(-1);
        let metadata = json!({ "exit_code": code, "lines": lines.len() });

        if status.success() {
            let body = if output.is_empty() { "(no output)".to_string() } else { output };
            ToolOutput::ok(&call.id, body).with_metadata(metadata)
        } else {
            ToolOutput::err(
                &call.id,
                ToolErrorKind::ExecutionError,
                format!("command exited with code {code}\n\n{output}"),
            )
            .with_metadata(metadata)
        }
    }
}

fn spawn_line_reader(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// SIGTERM first so the process can clean up; escalate to SIGKILL when it
/// ignores the request.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(Duration::from_secs(2), child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Keep the head and tail of oversized output with an omission marker.
fn truncate_output(lines: &[String]) -> String {
    let total_bytes: usize = lines.iter().map(|l| l.len() + 1).sum();
    if total_bytes <= OUTPUT_LIMIT_BYTES && lines.len() <= HEAD_LINES + TAIL_LINES {
        return lines.join("\n");
    }
    let head = &lines[..HEAD_LINES.min(lines.len())];
    let tail_start = lines.len().saturating_sub(TAIL_LINES).max(head.len());
    let tail = &lines[tail_start..];
    format!(
        "{}\n... [{} lines omitted] ...\n{}",
        head.join("\n"),
        lines.len() - head.len() - tail.len(),
        tail.join("\n"),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
