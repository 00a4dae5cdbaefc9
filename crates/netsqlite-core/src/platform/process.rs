//! Stopping spawned server processes.

use crate::error::{NetSqliteError, Result};
use std::process::Child;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Ask a child process to stop without waiting for it.
///
/// Sends SIGTERM on Unix and kills elsewhere. The child still has to be
/// reaped, normally by [`terminate_child`].
pub fn request_stop(child: &mut Child) {
    let pid = child.id();

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!("Failed to send SIGTERM to {}: {}", pid, e),
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = child.kill() {
        debug!("Failed to kill process {}: {}", pid, e);
    }
}

/// Stop a child process gracefully, then forcefully if needed, and reap it.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sends SIGTERM, waits up to `grace`, then SIGKILL
/// - **Other**: Kills immediately
///
/// A child that has already exited is only reaped.
pub fn terminate_child(
    child: &mut Child,
    #[cfg_attr(not(unix), allow(unused_variables))] grace: Duration,
) -> Result<()> {
    let pid = child.id();

    if let Some(status) = child.try_wait()? {
        debug!("Process {} already exited ({})", pid, status);
        return Ok(());
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        use std::time::Instant;

        debug!("Sending SIGTERM to process {}", pid);
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                let deadline = Instant::now() + grace;
                while Instant::now() < deadline {
                    if let Some(status) = child.try_wait()? {
                        debug!("Process {} terminated gracefully ({})", pid, status);
                        return Ok(());
                    }
                    sleep(POLL_INTERVAL);
                }
                debug!("Process {} still running, sending SIGKILL", pid);
            }
            Err(nix::errno::Errno::ESRCH) => {
                // Exited between try_wait and kill
                child.wait()?;
                return Ok(());
            }
            Err(e) => warn!("Failed to send SIGTERM to {}: {}", pid, e),
        }
    }

    if let Err(e) = child.kill() {
        // InvalidInput means the child has already been reaped
        if e.kind() != std::io::ErrorKind::InvalidInput {
            return Err(NetSqliteError::Io {
                message: format!("Failed to kill process {}: {}", pid, e),
                source: Some(e),
            });
        }
    }
    child.wait()?;
    debug!("Process {} killed", pid);
    Ok(())
}
