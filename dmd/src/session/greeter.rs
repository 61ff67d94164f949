//! The greeter runs as a fixed low-privilege system user (conventionally
//! `lightdm`) and talks to the daemon two ways: the UNIX socket every
//! greeter connects to, and a legacy pipe pair whose FD numbers are
//! exported as `LIGHTDM_TO_SERVER_FD`/`LIGHTDM_FROM_SERVER_FD` for
//! greeters that predate the socket protocol.

use std::os::unix::io::RawFd;
use std::path::Path;

use nix::unistd;

use super::{Environment, Identity};
use crate::child::{self, ChildHandle};
use crate::error::Result;

pub struct GreeterSession {
    pub identity: Identity,
    child: Option<ChildHandle>,
    to_greeter_write: Option<RawFd>,
    from_greeter_read: Option<RawFd>,
}

impl GreeterSession {
    pub fn new(identity: Identity) -> GreeterSession {
        GreeterSession {
            identity,
            child: None,
            to_greeter_write: None,
            from_greeter_read: None,
        }
    }

    /// Forks the greeter binary with both the socket path and the legacy
    /// pipe FDs in its environment.
    pub fn start(
        &mut self,
        argv: &[String],
        socket_path: &Path,
        seat: &str,
        log_path: &Path,
    ) -> Result<()> {
        let (to_greeter_read, to_greeter_write) = unistd::pipe()?;
        let (from_greeter_read, from_greeter_write) = unistd::pipe()?;

        let mut env = Environment::base_for(&self.identity, "greeter", seat);
        env.set("LIGHTDM_GREETER_SOCKET", socket_path.to_string_lossy().into_owned())
            .set("LIGHTDM_TO_SERVER_FD", to_greeter_read.to_string())
            .set("LIGHTDM_FROM_SERVER_FD", from_greeter_write.to_string());

        let handle = child::spawn(
            argv,
            &env.into_vec(),
            &self.identity.home,
            &child::Identity {
                uid: self.identity.uid,
                gid: self.identity.gid,
                username: self.identity.name.clone(),
            },
            log_path,
            &[to_greeter_read, from_greeter_write],
        )?;

        // The daemon's ends stay open; the child's ends were duplicated
        // across fork and must be closed here once the child exists.
        let _ = unistd::close(to_greeter_read);
        let _ = unistd::close(from_greeter_write);

        self.to_greeter_write = Some(to_greeter_write);
        self.from_greeter_read = Some(from_greeter_read);
        self.child = Some(handle);
        Ok(())
    }

    pub fn child(&self) -> Option<&ChildHandle> {
        self.child.as_ref()
    }

    pub fn child_mut(&mut self) -> Option<&mut ChildHandle> {
        self.child.as_mut()
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(child) = &mut self.child {
            super::stop_with_grace(child).await?;
        }
        if let Some(fd) = self.to_greeter_write.take() {
            let _ = unistd::close(fd);
        }
        if let Some(fd) = self.from_greeter_read.take() {
            let _ = unistd::close(fd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn construction_does_not_open_any_fd() {
        let identity = Identity {
            uid: 1000,
            gid: 1000,
            name: "lightdm".into(),
            home: "/var/lib/lightdm".into(),
            shell: "/bin/false".into(),
        };
        let session = GreeterSession::new(identity);
        assert!(session.child().is_none());
    }
}
