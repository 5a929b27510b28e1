//! Subprocess plumbing shared by the compiler and the run sandbox.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Time a terminated process group gets before SIGKILL
const KILL_GRACE: Duration = Duration::from_millis(200);
/// Time allowed for pipe readers to hit EOF after the process is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Puts the child in its own process group so helpers it spawns die with it
pub(super) fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.kill_on_drop(true);
}

/// Reads a child pipe to EOF, keeping at most `limit` bytes
///
/// The remainder is drained and dropped so the child never blocks on a full pipe.
pub(super) fn capture_pipe<R>(pipe: Option<R>, limit: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return String::new();
        };
        let mut kept = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(kept.len());
                    kept.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
        String::from_utf8_lossy(&kept).into_owned()
    })
}

/// Collects a pipe reader started by [`capture_pipe`]
pub(super) async fn collect_pipe(handle: JoinHandle<String>) -> String {
    let abort = handle.abort_handle();
    match timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            log::warn!("Pipe reader failed: {e}");
            String::new()
        }
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

/// SIGTERM to the whole process group, then SIGKILL if it lingers
pub(super) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
    }

    if timeout(KILL_GRACE, child.wait()).await.is_err() {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            signal_group(pid, libc::SIGKILL);
        }
        if let Err(e) = child.kill().await {
            log::warn!("Failed to kill child process: {e}");
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this child.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        log::debug!(
            "killpg({pgid}, {signal}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Maps an exit status to a shell-style code; signals become 128 + signal
pub(super) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
