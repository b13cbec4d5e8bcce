//! Child process shutdown shared by the watch process and transfers.

use std::time::Duration;

use tokio::process::Child;

/// Ask `child` to exit with SIGTERM, then SIGKILL it if it is still running
/// after `grace`. Returns the exit code if one was observed.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }

    send_term(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed waiting for child after SIGTERM");
            None
        }
        Err(_) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "child ignored SIGTERM; killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill child");
            }
            None
        }
    }
}

#[cfg(unix)]
fn send_term(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) {
    // No graceful signal available; fall through to the forced kill.
    let _ = child.start_kill();
}
