//! A `Session` is one authenticated run of a child process: the greeter UI
//! or a user's desktop. The two kinds share everything except what
//! identity they run as and what happens at teardown, so they are two
//! structs built on the same helpers rather than a `Session` base class —
//! the behavior differences don't warrant virtual dispatch.

pub mod greeter;
pub mod user;

use std::collections::BTreeMap;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::child::ChildHandle;
use crate::error::{Error, Result};

pub use greeter::GreeterSession;
pub use user::UserSession;

pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The identity a Session's child process runs as. `uid == 0` is never a
/// valid target — the daemon is the only thing that runs as root.
#[derive(Clone, Debug)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub home: std::path::PathBuf,
    pub shell: String,
}

impl Identity {
    pub fn validate(self) -> Result<Identity> {
        if self.uid == 0 {
            return Err(Error::Spawn(format!(
                "refusing to run a session as uid 0 ({})",
                self.name
            )));
        }
        Ok(self)
    }
}

/// Builds the process environment for a child, enforcing the invariants
/// every Session's env must carry (`USER`, `HOME`, `SHELL`, and for X
/// displays `DISPLAY`/`XAUTHORITY`/`XDG_VTNR`).
#[derive(Clone, Debug, Default)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Environment {
        Environment::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn base_for(identity: &Identity, session_class: &str, seat: &str) -> Environment {
        let mut env = Environment::new();
        env.set("USER", &identity.name)
            .set("LOGNAME", &identity.name)
            .set("HOME", identity.home.to_string_lossy().into_owned())
            .set("SHELL", &identity.shell)
            .set("XDG_SESSION_CLASS", session_class)
            .set("XDG_SEAT", seat)
            .set("PATH", std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into()));
        env
    }

    pub fn set_x_display(&mut self, display: &str, xauthority: &std::path::Path, vt: u32) -> &mut Self {
        self.set("DISPLAY", display)
            .set("XAUTHORITY", xauthority.to_string_lossy().into_owned())
            .set("XDG_VTNR", vt.to_string())
            .set("XDG_SESSION_TYPE", "x11")
    }

    pub fn into_vec(self) -> Vec<(String, String)> {
        self.0.into_iter().collect()
    }
}

/// Sends SIGTERM, waits up to `STOP_GRACE_PERIOD` for the reaper to see it
/// exit, then escalates to SIGKILL. Shared by both Session kinds and the
/// display server so the 5s grace policy lives in exactly one place.
pub async fn stop_with_grace(child: &mut ChildHandle) -> Result<()> {
    child.signal(Signal::SIGTERM)?;
    if tokio::time::timeout(STOP_GRACE_PERIOD, child.wait_mut()).await.is_err() {
        tracing::warn!(pid = %child.pid(), "child ignored SIGTERM, escalating to SIGKILL");
        escalate_to_kill(child)?;
    }
    Ok(())
}

/// Escalates to SIGKILL; called by `stop_with_grace` once the grace timer
/// elapses without the child's exit future resolving.
pub fn escalate_to_kill(child: &ChildHandle) -> Result<()> {
    child.signal(Signal::SIGKILL)
}
