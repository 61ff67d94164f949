//! Forks, execs, and redirects a child's stdout/stderr to a rotated log
//! file. The parent never blocks on the child; exit status arrives later
//! through the reaper (`crate::reaper`), which is the only thing allowed
//! to call `waitpid`.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;

use nix::sys::signal::Signal;
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

pub struct ChildHandle {
    pid: Pid,
    exit_rx: oneshot::Receiver<i32>,
}

impl ChildHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Resolves once the reaper observes this pid exit via SIGCHLD.
    pub async fn wait(self) -> Result<ExitStatus> {
        let raw = self
            .exit_rx
            .await
            .map_err(|_| Error::ChildCrash(format!("pid {} reaped without status", self.pid)))?;
        Ok(ExitStatus::from_raw(raw))
    }

    /// Same as `wait`, but by reference so the handle can still be used
    /// for `pid()`/`signal()` afterwards and so it can sit inside a
    /// `tokio::select!` alongside other event sources in a loop.
    pub async fn wait_mut(&mut self) -> Result<ExitStatus> {
        let raw = (&mut self.exit_rx)
            .await
            .map_err(|_| Error::ChildCrash(format!("pid {} reaped without status", self.pid)))?;
        Ok(ExitStatus::from_raw(raw))
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        nix::sys::signal::kill(self.pid, sig)
            .map_err(|e| Error::Spawn(format!("kill({}, {:?}): {}", self.pid, sig, e)))
    }
}

/// Identity a child process should run as once privileges are dropped.
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
}

/// Spawns `argv[0]` with `argv[1..]` as arguments, `env` as the complete
/// environment (the caller composes it; nothing is inherited), under
/// `identity`, with stdout/stderr redirected to `log_path`.
///
/// `inherit_fds` lists file descriptors that must survive into the child
/// untouched (the greeter pipe ends) — everything else above stderr is
/// closed.
pub fn spawn(
    argv: &[String],
    env: &[(String, String)],
    cwd: &Path,
    identity: &Identity,
    log_path: &Path,
    inherit_fds: &[RawFd],
) -> Result<ChildHandle> {
    let log_file = truncate_with_backup(log_path)?;
    let log_fd = log_file.as_raw_fd();

    let cwd_c = CString::new(cwd.as_os_str().to_string_lossy().into_owned())
        .map_err(|_| Error::Spawn("cwd contains a NUL byte".into()))?;
    let argv_c: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()).map_err(|_| Error::Spawn("argv contains a NUL byte".into())))
        .collect::<Result<_>>()?;
    let envp_c: Vec<CString> = env
        .iter()
        .map(|(k, v)| {
            CString::new(format!("{}={}", k, v))
                .map_err(|_| Error::Spawn("env contains a NUL byte".into()))
        })
        .collect::<Result<_>>()?;

    let uid = Uid::from_raw(identity.uid);
    let gid = Gid::from_raw(identity.gid);
    let username = CString::new(identity.username.as_str())
        .map_err(|_| Error::Spawn("username contains a NUL byte".into()))?;

    // Safety: between fork and exec only async-signal-safe calls are made;
    // no allocation or locking that could deadlock against a forked-away
    // mutex holder.
    match unsafe { unistd::fork() }.map_err(|e| Error::Spawn(format!("fork: {}", e)))? {
        ForkResult::Parent { child, .. } => {
            let (tx, rx) = oneshot::channel();
            crate::reaper::register(child, tx);
            Ok(ChildHandle {
                pid: child,
                exit_rx: rx,
            })
        }
        ForkResult::Child => {
            child_entrypoint(
                log_fd,
                &cwd_c,
                &argv_c,
                &envp_c,
                uid,
                gid,
                &username,
                inherit_fds,
            );
            unreachable!("child_entrypoint never returns");
        }
    }
}

/// Everything from here down runs in the forked child, single-threaded,
/// with no async runtime and no outstanding locks. A failure here calls
/// `libc::_exit` directly rather than unwinding through code that assumes
/// a live parent process image.
fn child_entrypoint(
    log_fd: RawFd,
    cwd: &CString,
    argv: &[CString],
    envp: &[CString],
    uid: Uid,
    gid: Gid,
    username: &CString,
    inherit_fds: &[RawFd],
) -> ! {
    let bail = |_msg: &str| -> ! {
        unsafe { libc::_exit(127) }
    };

    if unistd::setsid().is_err() {
        bail("setsid");
    }

    close_fds_except(log_fd, inherit_fds);

    if unistd::dup2(log_fd, 1).is_err() || unistd::dup2(log_fd, 2).is_err() {
        bail("dup2 log fd");
    }
    if log_fd > 2 {
        let _ = unistd::close(log_fd);
    }

    if let Ok(devnull) = unistd::open("/dev/null", nix::fcntl::OFlag::O_RDONLY, nix::sys::stat::Mode::empty()) {
        let _ = unistd::dup2(devnull, 0);
        if devnull > 2 {
            let _ = unistd::close(devnull);
        }
    }

    if unistd::chdir(cwd.as_c_str()).is_err() {
        let _ = unistd::chdir("/");
    }

    if unistd::initgroups(username, gid).is_err() {
        bail("initgroups");
    }
    if unistd::setgid(gid).is_err() {
        bail("setgid");
    }
    if unistd::setuid(uid).is_err() {
        bail("setuid");
    }

    let _ = unistd::execve(&argv[0], argv, envp);
    bail("execve")
}

/// Closes every fd in `3..OPEN_MAX` except `keep` and the entries in
/// `inherit_fds`. Best-effort: an unreadable `/proc/self/fd` just means
/// we fall back to trying the full fd range.
fn close_fds_except(keep: RawFd, inherit_fds: &[RawFd]) {
    let max_fd = nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX)
        .ok()
        .flatten()
        .unwrap_or(1024) as RawFd;
    for fd in 3..max_fd {
        if fd == keep || inherit_fds.contains(&fd) {
            continue;
        }
        let _ = unistd::close(fd);
    }
}

/// Renames any existing file at `path` to `<path>.old` (clobbering a
/// previous backup), then opens a fresh file at `path` for append.
pub fn truncate_with_backup(path: &Path) -> Result<File> {
    if path.exists() {
        let mut backup = path.as_os_str().to_os_string();
        backup.push(".old");
        let _ = fs::rename(path, backup);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(file)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backs_up_existing_log_before_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("session.log");
        fs::write(&log_path, b"first run\n").unwrap();

        let _ = truncate_with_backup(&log_path).unwrap();

        let backup = dir.path().join("session.log.old");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "first run\n");
        assert_eq!(fs::metadata(&log_path).unwrap().len(), 0);
    }

    #[test]
    fn second_rotation_overwrites_the_backup() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("session.log");
        fs::write(&log_path, b"run one\n").unwrap();
        let _ = truncate_with_backup(&log_path).unwrap();
        fs::write(&log_path, b"run two\n").unwrap();
        let _ = truncate_with_backup(&log_path).unwrap();

        let backup = dir.path().join("session.log.old");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "run two\n");
    }
}
