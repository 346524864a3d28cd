//! Downloader termination with SIGTERM → SIGKILL escalation.
//!
//! Cancellation and timeouts both end here. The downloader gets a grace
//! period to flush partial fragments and remove its temp files before the
//! hard kill.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

#[cfg(unix)]
use tokio::time::timeout;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Terminate a downloader child process.
///
/// 1. Send SIGTERM and wait up to [`TERM_GRACE`] for a graceful exit
/// 2. If still running, SIGKILL
/// 3. Wait for reaping (required to avoid zombies)
///
/// On non-Unix platforms there is no graceful phase; the child is killed
/// outright.
pub async fn terminate_child(mut child: Child) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        terminate_unix(&mut child).await
    }

    #[cfg(not(unix))]
    {
        child.kill().await?;
        child.wait().await
    }
}

#[cfg(unix)]
async fn terminate_unix(child: &mut Child) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await;
    };

    #[allow(clippy::cast_possible_wrap)]
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        // ESRCH: the process exited between id() and kill().
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        return Err(io::Error::other(e));
    }

    if let Ok(result) = timeout(TERM_GRACE, child.wait()).await {
        return result;
    }

    // Grace expired; escalate.
    child.kill().await?;
    child.wait().await
}
