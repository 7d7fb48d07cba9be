//! SIGKILL-based termination of REPL and export subprocesses.
//!
//! Every function here is best-effort and idempotent: a process that is
//! already gone counts as terminated, and a process that is not reaped within
//! the timeout is logged rather than reported as an error.
//!
//! Termination is a single SIGKILL with no SIGTERM phase. Callers only
//! terminate a process once its state can no longer be trusted.

use std::io;
use std::time::Duration;

use tokio::process::Child;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::{self, Pid};

/// Kill a child and its whole process group with SIGKILL, then reap it.
///
/// Falls back to killing only the child when it shares the supervisor's
/// group or when the group signal is refused with `EPERM`.
pub async fn kill_process_group(child: &mut Child, timeout: Duration) -> io::Result<()> {
    let Some(pid) = live_pid(child) else {
        return Ok(());
    };

    #[cfg(unix)]
    {
        match group_of(pid) {
            GroupTarget::Gone => {
                tracing::debug!(pid, "Process not found, may already be terminated");
                return Ok(());
            }
            GroupTarget::Shared => {
                tracing::debug!(pid, "Process has no dedicated group, killing it alone");
                if !signal_child(child)? {
                    return Ok(());
                }
            }
            GroupTarget::Group(pgid) => {
                tracing::debug!(pid, pgid = pgid.as_raw(), "Killing process group");
                match signal::killpg(pgid, Signal::SIGKILL) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => {
                        tracing::debug!(pid, "Process group already gone");
                        return Ok(());
                    }
                    Err(Errno::EPERM) => {
                        tracing::warn!(
                            pid,
                            "Permission denied killing process group, falling back to process kill"
                        );
                        if !signal_child(child)? {
                            return Ok(());
                        }
                    }
                    Err(e) => return Err(io::Error::other(e)),
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        if !signal_child(child)? {
            return Ok(());
        }
    }

    wait_reaped(child, timeout).await;
    Ok(())
}

/// Kill a single process with SIGKILL (its group is left alone), then reap it.
pub async fn kill_process(child: &mut Child, timeout: Duration) -> io::Result<()> {
    let Some(pid) = live_pid(child) else {
        return Ok(());
    };

    tracing::debug!(pid, "Killing process");
    if !signal_child(child)? {
        return Ok(());
    }
    wait_reaped(child, timeout).await;
    Ok(())
}

/// Kill a process, preferring its whole group and falling back to the
/// process alone if the group kill fails for any reason.
///
/// Safe to call any number of times on the same child.
pub async fn kill_process_safely(
    child: &mut Child,
    use_process_group: bool,
    timeout: Duration,
) -> io::Result<()> {
    if live_pid(child).is_none() {
        return Ok(());
    }

    if use_process_group {
        match kill_process_group(child, timeout).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    pid = child.id(),
                    error = %e,
                    "Process group kill failed, falling back to process kill"
                );
            }
        }
    }

    kill_process(child, timeout).await
}

/// Deliver SIGKILL to the group led by `pid` without owning its handle.
///
/// Used to interrupt an exchange that holds the child; the owner reaps it.
#[cfg(unix)]
pub fn signal_process_group(pid: u32) -> io::Result<()> {
    let result = match group_of(pid) {
        GroupTarget::Gone => return Ok(()),
        GroupTarget::Shared => signal::kill(to_pid(pid), Signal::SIGKILL),
        GroupTarget::Group(pgid) => match signal::killpg(pgid, Signal::SIGKILL) {
            Err(Errno::EPERM) => signal::kill(to_pid(pid), Signal::SIGKILL),
            other => other,
        },
    };
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

#[cfg(not(unix))]
pub fn signal_process_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

/// The pid of a child that has not exited yet, or `None`.
fn live_pid(child: &mut Child) -> Option<u32> {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::debug!(?status, "Process already terminated");
            None
        }
        // `id()` is `None` once tokio has reaped the child.
        _ => child.id(),
    }
}

/// Send SIGKILL to the child alone. Returns `false` if it was already gone.
fn signal_child(child: &mut Child) -> io::Result<bool> {
    match child.start_kill() {
        Ok(()) => Ok(true),
        Err(e) if is_already_gone(&e) => {
            tracing::debug!("Process not found during kill, may already be terminated");
            Ok(false)
        }
        Err(e) => {
            tracing::error!(error = %e, "Error during process kill");
            Err(e)
        }
    }
}

fn is_already_gone(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(Errno::ESRCH as i32) {
        return true;
    }
    // tokio refuses to signal a child it has already reaped.
    e.kind() == io::ErrorKind::InvalidInput
}

async fn wait_reaped(child: &mut Child, timeout: Duration) {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(?status, "Process terminated"),
        Ok(Err(e)) => tracing::error!(error = %e, "Error waiting for process termination"),
        Err(_) => tracing::warn!(
            timeout_secs = timeout.as_secs_f64(),
            "Process did not terminate within timeout after SIGKILL"
        ),
    }
}

#[cfg(unix)]
enum GroupTarget {
    Gone,
    /// The process lives in the supervisor's own group.
    Shared,
    Group(Pid),
}

#[cfg(unix)]
fn group_of(pid: u32) -> GroupTarget {
    match unistd::getpgid(Some(to_pid(pid))) {
        Err(_) => GroupTarget::Gone,
        Ok(pgid) if pgid == unistd::getpgrp() => GroupTarget::Shared,
        Ok(pgid) => GroupTarget::Group(pgid),
    }
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::process::Command;

    const WAIT: Duration = Duration::from_secs(2);

    fn sleeper_in_own_group() -> Child {
        Command::new("sh")
            .args(["-c", "sleep 60"])
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn sh")
    }

    #[tokio::test]
    async fn already_terminated_is_noop() {
        let mut child = Command::new("true").spawn().expect("failed to spawn true");
        child.wait().await.unwrap();

        kill_process(&mut child, WAIT).await.unwrap();
        kill_process_group(&mut child, WAIT).await.unwrap();
        kill_process_safely(&mut child, true, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn kill_process_terminates_sleep() {
        let mut child = Command::new("sleep")
            .arg("60")
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn sleep");

        kill_process(&mut child, WAIT).await.unwrap();

        let status = child.try_wait().unwrap().expect("process should be reaped");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn kill_process_group_terminates_group_leader() {
        let mut child = sleeper_in_own_group();

        kill_process_group(&mut child, WAIT).await.unwrap();

        let status = child.try_wait().unwrap().expect("process should be reaped");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn group_kill_without_dedicated_group_spares_supervisor() {
        // Same group as the test runner: must fall back to a single kill.
        let mut child = Command::new("sleep")
            .arg("60")
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn sleep");

        kill_process_group(&mut child, WAIT).await.unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn safely_with_and_without_group() {
        let mut grouped = sleeper_in_own_group();
        kill_process_safely(&mut grouped, true, WAIT).await.unwrap();
        assert!(grouped.try_wait().unwrap().is_some());

        let mut single = Command::new("sleep")
            .arg("60")
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn sleep");
        kill_process_safely(&mut single, false, WAIT).await.unwrap();
        assert!(single.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let mut child = sleeper_in_own_group();
        for _ in 0..3 {
            kill_process_safely(&mut child, true, WAIT).await.unwrap();
        }
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn short_reap_timeout_does_not_hang() {
        let mut child = Command::new("sleep")
            .arg("60")
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn sleep");

        let start = Instant::now();
        kill_process(&mut child, Duration::from_millis(100)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn signal_process_group_by_pid() {
        let mut child = sleeper_in_own_group();
        let pid = child.id().unwrap();

        signal_process_group(pid).unwrap();

        let status = tokio::time::timeout(WAIT, child.wait())
            .await
            .expect("group leader should exit after SIGKILL")
            .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn signal_missing_pid_is_ok() {
        // Above PID_MAX_LIMIT on Linux, so never a live process.
        assert!(signal_process_group(4_194_305).is_ok());
    }
}
