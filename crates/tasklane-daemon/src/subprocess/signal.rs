//! Process-group signalling.
//!
//! Agents are spawned as process-group leaders so that a signal reaches every
//! helper process they start.

use std::time::Duration;

use tokio::process::Child;
use tracing::warn;

/// Grace period after SIGTERM before SIGKILL.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Send SIGTERM to the process group led by `pid`.
#[cfg(unix)]
pub fn terminate_group(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group we created for this child.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(-(pid as i32), signal) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, signal, error = %err, "Failed to signal process group");
    }
}

#[cfg(not(unix))]
pub fn terminate_group(_pid: u32) {}

/// Stop a process: SIGTERM to its group, wait `grace`, then SIGKILL.
pub async fn shutdown_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        terminate_group(pid);
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid = child.id(), "Grace period expired, sending SIGKILL");
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            signal_group(pid, libc::SIGKILL);
        }
        let _ = child.kill().await;
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn group_leader(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn sigterm_stops_cooperative_process() {
        let mut child = group_leader("sleep 30");
        let started = std::time::Instant::now();
        shutdown_child(&mut child, GRACE_PERIOD).await;
        assert!(child.try_wait().unwrap().is_some());
        assert!(started.elapsed() < GRACE_PERIOD);
    }

    #[tokio::test]
    async fn sigkill_after_grace() {
        let mut child = group_leader("trap '' TERM; while :; do sleep 1; done");
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_child(&mut child, Duration::from_millis(300)).await;
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
