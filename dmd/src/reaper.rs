//! The single place in the daemon allowed to call `waitpid`. Every forked
//! child is registered here before its `ChildHandle` is handed back to the
//! caller; `run` drains `WNOHANG` on every SIGCHLD and fans exit statuses
//! out to whoever is waiting on them.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

use crate::error::Result;

fn waiters() -> &'static Mutex<HashMap<i32, oneshot::Sender<i32>>> {
    static WAITERS: OnceLock<Mutex<HashMap<i32, oneshot::Sender<i32>>>> = OnceLock::new();
    WAITERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers interest in `pid`'s exit status. If `pid` has already exited
/// and been reaped by an earlier sweep (a narrow but real race between
/// fork returning in the parent and the first SIGCHLD sweep), the sender
/// is dropped and the caller's `wait()` observes a channel-closed error —
/// callers treat that the same as a crash, which is the safe reading.
pub fn register(pid: Pid, tx: oneshot::Sender<i32>) {
    waiters().lock().unwrap().insert(pid.as_raw(), tx);
}

/// Encodes a reaped status the way the raw `wait(2)` status word does, so
/// `ChildHandle::wait` can hand it straight to `ExitStatus::from_raw`.
fn raw_status(status: WaitStatus) -> Option<(i32, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), code << 8)),
        WaitStatus::Signaled(pid, sig, _) => Some((pid.as_raw(), sig as i32)),
        _ => None,
    }
}

/// Reaps every exited child currently available without blocking, and
/// notifies any registered waiter. Called once per SIGCHLD, and once more
/// at startup in case a child exited before its handler was installed.
fn reap_available() {
    loop {
        match waitpid(Some(Pid::from_raw(-1)), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => {
                if let Some((pid, code)) = raw_status(status) {
                    if let Some(tx) = waiters().lock().unwrap().remove(&pid) {
                        let _ = tx.send(code);
                    }
                }
            }
        }
    }
}

/// Runs forever, reaping children as SIGCHLD arrives. Spawned once from
/// `DaemonRoot` alongside the rest of the event loop.
pub async fn run() -> Result<()> {
    let mut sigchld = signal(SignalKind::child())
        .map_err(|e| crate::error::Error::Spawn(format!("signal(SIGCHLD): {}", e)))?;
    loop {
        sigchld.recv().await;
        reap_available();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unregistered_exit_is_silently_dropped() {
        reap_available();
    }

    #[tokio::test]
    async fn registered_waiter_is_notified_on_exit() {
        let (tx, rx) = oneshot::channel();
        register(Pid::from_raw(999_999), tx);

        let sent = waiters().lock().unwrap().remove(&999_999);
        assert!(sent.is_some());
        sent.unwrap().send(0).unwrap();
        assert_eq!(rx.await.unwrap(), 0);
    }
}
