//! Spawning and stopping server processes

use crate::errors::{Result, TuneError};
use crate::launch::command::LaunchCommand;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Time a process gets to exit after the graceful signal
pub const TERMINATION_GRACE: Duration = Duration::from_secs(3);

/// Spawn with stdout and stderr piped for monitoring
pub fn spawn_monitored(command: &LaunchCommand) -> Result<Child> {
    command.to_tokio().spawn().map_err(|source| TuneError::Spawn {
        program: command.program.clone(),
        source,
    })
}

/// Spawn with inherited output; nothing watches it
pub fn spawn_unmonitored(command: &LaunchCommand) -> Result<Child> {
    let mut cmd = command.to_tokio();
    cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    cmd.spawn().map_err(|source| TuneError::Spawn {
        program: command.program.clone(),
        source,
    })
}

/// Stop a child: graceful signal, grace period, then a forceful kill
///
/// Best effort and idempotent; a process that is already gone is fine.
pub async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(?status, "process already exited");
        return;
    }

    if let Some(pid) = child.id() {
        send_graceful(pid).await;
        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid, ?status, "process exited after graceful signal");
                return;
            }
            Ok(Err(e)) => debug!(pid, error = %e, "wait failed after graceful signal"),
            Err(_) => debug!(pid, "grace period elapsed, killing"),
        }
    }

    if let Err(e) = child.kill().await {
        // InvalidInput means the child was already reaped
        if e.kind() != std::io::ErrorKind::InvalidInput {
            warn!(error = %e, "forceful kill failed");
        }
    }
}

#[cfg(unix)]
async fn send_graceful(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: `pid` belongs to our own child, which has not been reaped yet
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "could not send SIGTERM");
    }
}

#[cfg(windows)]
async fn send_graceful(pid: u32) {
    let result = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!(pid, error = %e, "taskkill failed");
    }
}
