//! Scoped helper processes for subprocess-backed drivers.
//!
//! Some drivers wrap a long-running external helper (a video streamer, a
//! protocol bridge). [`ScopedProcess`] owns such a process for the driver's
//! lifetime and guarantees termination on every exit path: a graceful stop
//! request first, then a forced kill after a bounded grace period.

use crate::error::{BenchError, BenchResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Default grace period between the stop request and the forced kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

pub struct ScopedProcess {
    child: Child,
    command: String,
    grace: Duration,
}

impl ScopedProcess {
    /// Spawn a helper process with inherited stdio discarded.
    pub fn spawn(program: &str, args: &[&str]) -> BenchResult<Self> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        debug!(program, pid = child.id(), "helper process started");

        Ok(Self {
            child,
            command: program.to_string(),
            grace: DEFAULT_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Terminate the helper: graceful stop request, then a forced kill if it
    /// has not exited within the grace period.
    pub async fn terminate(mut self) -> BenchResult<()> {
        // SIGKILL via start_kill only as a fallback; first give the process
        // a chance to exit on its own after closing stdin and signalling.
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SIGTERM is the graceful stop request on unix.
            let status = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
            if let Err(e) = status {
                warn!(pid, error = %e, "failed to deliver stop request");
            }
        }

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(command = %self.command, %status, "helper process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(BenchError::Io(e)),
            Err(_) => {
                warn!(
                    command = %self.command,
                    grace = ?self.grace,
                    "helper process ignored stop request, killing"
                );
                self.child.start_kill()?;
                self.child.wait().await?;
                Ok(())
            }
        }
    }
}
