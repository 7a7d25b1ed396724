//! Child process helpers

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use veren_domain::EnvVar;

use crate::errors::PlatformError;

/// Bytes of stderr kept in error messages
const STDERR_TAIL: usize = 2048;

/// Variables inherited from the daemon by every user command
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR"];

/// A `sh -c` command that sees only `env` plus a minimal base environment.
pub fn shell(script: &str, cwd: &Path, env: &[EnvVar]) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(cwd).env_clear();
    for key in INHERITED_ENV {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    for var in env {
        cmd.env(&var.key, &var.value);
    }
    cmd
}

/// Run `cmd` to completion and return its stdout.
///
/// The child is killed if the returned future is dropped, so stage timeouts
/// do not leak processes. A non-zero exit becomes a `CommandError` carrying
/// the tail of stderr.
pub async fn run(cmd: &mut Command, what: &str) -> Result<String, PlatformError> {
    run_with_input(cmd, what, None).await
}

/// Like [`run`], writing `input` to the child's stdin first
pub async fn run_with_input(
    cmd: &mut Command,
    what: &str,
    input: Option<&str>,
) -> Result<String, PlatformError> {
    debug!("Running {}", what);
    cmd.kill_on_drop(true)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| PlatformError::CommandError(format!("Failed to start {}: {}", what, e)))?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(input.as_bytes()).await?;
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::CommandError(format!(
            "{} exited with {}: {}",
            what,
            output.status,
            tail(stderr.trim(), STDERR_TAIL)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
