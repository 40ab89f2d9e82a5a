//! External tool invocation with "not installed" detection and a timeout.
//!
//! Every optional tool in the metadata pipeline goes through [`run_tool`].
//! A binary missing from `PATH` is not an error: it maps to
//! [`ToolOutcome::NotInstalled`] so the caller can fall through to the next
//! stage. Only unexpected launch failures (permissions, resource limits)
//! surface as [`MarkPdfError::ToolSpawn`].

use crate::error::{MarkPdfError, ToolOutcome};
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Run `program` with `args`, waiting at most `timeout` for it to exit.
///
/// stdout/stderr are captured and logged; a timed-out tool is killed.
pub async fn run_tool<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
) -> Result<ToolOutcome, MarkPdfError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(tool = program, "Tool not installed");
            return Ok(ToolOutcome::NotInstalled);
        }
        Err(e) => {
            return Err(MarkPdfError::ToolSpawn {
                tool: program.to_string(),
                source: e,
            })
        }
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(MarkPdfError::ToolSpawn {
                tool: program.to_string(),
                source: e,
            })
        }
        Err(_) => {
            // Dropping the future drops the child, which kills it.
            warn!(tool = program, "Tool timed out after {:?}", timeout);
            return Ok(ToolOutcome::TimedOut);
        }
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(tool = program, "{}", line);
    }
    let failed = !output.status.success();
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if failed {
            warn!(tool = program, "{}", line);
        } else {
            debug!(tool = program, "{}", line);
        }
    }

    if failed {
        Ok(ToolOutcome::Failed(output.status.code()))
    } else {
        Ok(ToolOutcome::Succeeded)
    }
}
