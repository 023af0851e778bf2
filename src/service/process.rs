//! Child process plumbing for services
//!
//! - Building the command
//! - Draining stdout/stderr into the log
//! - Graceful, then forced, termination

use super::ServiceId;
use crate::protocol::{line_reader, LineReader};
use futures::StreamExt;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Time given to a child after SIGTERM before it is killed
const TERM_GRACE: Duration = Duration::from_secs(1);

/// Build the command for a transport process with all three pipes wired.
pub(crate) fn build_command<I, S>(
    program: &Path,
    args: I,
    env: Vec<(String, String)>,
) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Log every remaining line of a pipe until it closes.
pub(crate) fn spawn_drain<R>(id: ServiceId, stream: &'static str, mut lines: LineReader<R>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => info!("{} {}: {}", id, stream, line),
                Err(e) => {
                    warn!("service {} {}: {}", id, stream, e);
                    break;
                }
            }
        }
        debug!("service {} {} closed", id, stream);
    })
}

/// Convenience for stderr, which carries no protocol at all
pub(crate) fn spawn_stderr_drain<R>(id: ServiceId, stderr: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    spawn_drain(id, "stderr", line_reader(stderr))
}

/// Wait for the child to exit on its own, then escalate to SIGTERM and
/// finally SIGKILL.
pub(crate) async fn shutdown_child(id: &ServiceId, child: &mut Child, grace: Duration) {
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("service {} exited with status: {}", id, status);
            return;
        }
        Ok(Err(e)) => {
            warn!("Error waiting for service {}: {}", id, e);
            return;
        }
        Err(_) => {}
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            debug!("sending SIGTERM to service {} ({})", id, pid);
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if let Ok(Ok(status)) = timeout(TERM_GRACE, child.wait()).await {
                debug!("service {} exited with status: {}", id, status);
                return;
            }
        }
    }

    warn!("service {} didn't exit gracefully, forcing kill", id);
    if let Err(e) = child.kill().await {
        warn!("could not kill service {}: {}", id, e);
    }
}
