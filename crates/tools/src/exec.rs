//! The `exec` built-in: run a granted command with captured output.
//!
//! Execution requires a command grant (`can_run_command`) or an exact
//! resolved-binary grant (`can_run_path`). The timeout is the declared
//! value clamped to the remaining run deadline, and the outer cancel
//! signal aborts the child.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;

use gambit_domain::error::{HostUnsupported, Result, RunError};
use gambit_domain::{CancelToken, ToolEnvelope};
use gambit_permissions::EffectivePermissions;

/// Cap on captured stdout/stderr, each.
const OUTPUT_CAP_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Host context for one exec dispatch.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Time left until the run deadline; the effective timeout never
    /// exceeds it.
    pub remaining: Duration,
    pub cancel: CancelToken,
    /// False when the embedding host forbids subprocess launch.
    pub subprocess_supported: bool,
}

fn cap_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    if text.len() <= OUTPUT_CAP_BYTES {
        return text.into_owned();
    }
    let mut end = OUTPUT_CAP_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

pub async fn exec(
    perms: &EffectivePermissions,
    req: ExecRequest,
    opts: &ExecOptions,
) -> Result<ToolEnvelope> {
    if !opts.subprocess_supported {
        return Ok(ToolEnvelope::error(
            501,
            "exec_unsupported_host",
            HostUnsupported::Exec.to_string(),
        ));
    }

    if !perms.can_run_command(&req.command) && !perms.can_run_path(&req.command) {
        return Ok(ToolEnvelope::permission_denied(format!(
            "no run grant covers '{}'",
            req.command
        )));
    }

    let cwd = req.cwd.as_ref().map_or_else(
        || perms.base_dir().to_path_buf(),
        |c| {
            let p = Path::new(c);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                perms.base_dir().join(p)
            }
        },
    );

    let timeout = req
        .timeout_ms
        .map_or(opts.remaining, Duration::from_millis)
        .min(opts.remaining);

    let mut command = Command::new(&req.command);
    command
        .args(&req.args)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let cwd_display = cwd.to_string_lossy().into_owned();

    tokio::select! {
        _ = opts.cancel.cancelled() => Err(RunError::Canceled),
        outcome = tokio::time::timeout(timeout, command.output()) => match outcome {
            Err(_) => Ok(ToolEnvelope::error(
                408,
                "exec_timeout",
                format!("'{}' exceeded its {}ms timeout", req.command, timeout.as_millis()),
            )),
            Ok(Err(e)) => Ok(ToolEnvelope::error(
                500,
                "spawn_failed",
                format!("spawning '{}': {e}", req.command),
            )),
            Ok(Ok(output)) => {
                let code = output.status.code();
                tracing::debug!(
                    command = %req.command,
                    code = ?code,
                    success = output.status.success(),
                    "exec completed"
                );
                Ok(ToolEnvelope::ok(json!({
                    "command": req.command,
                    "args": req.args,
                    "cwd": cwd_display,
                    "code": code,
                    "success": output.status.success(),
                    "stdout": cap_output(&output.stdout),
                    "stderr": cap_output(&output.stderr),
                })))
            }
        },
    }
}
