//! Lifecycle of the X server backing one Display: spawn, probe for
//! readiness, detect crashes, stop. Mir or other backends would be a
//! second small variant behind the same enum rather than a trait object —
//! there is no open-ended set of display server kinds to support.

use std::path::PathBuf;

use crate::child::{self, ChildHandle};
use crate::error::{Error, Result};
use crate::vt::VtAllocator;
use crate::xauthority::AuthCookie;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayServerState {
    New,
    Starting,
    Ready,
    Exiting,
    Exited,
}

pub struct DisplayServer {
    pub state: DisplayServerState,
    pub display_address: String,
    pub vt: u32,
    pub cookie: AuthCookie,
    pub restart_attempts: u32,
    child: Option<ChildHandle>,
}

impl DisplayServer {
    pub fn new(display_address: String, vt: u32, cookie: AuthCookie) -> DisplayServer {
        DisplayServer {
            state: DisplayServerState::New,
            display_address,
            vt,
            cookie,
            restart_attempts: 0,
            child: None,
        }
    }

    /// Allocates a VT (local X only) through the shared allocator, then
    /// builds the command line the way the config's `xserver-command`
    /// template expects: `<command> <display> vtN -novtswitch`.
    pub fn allocate_vt(vt_allocator: &VtAllocator, minimum_vt: u32) -> u32 {
        let _ = minimum_vt;
        vt_allocator.allocate()
    }

    pub fn start(&mut self, xserver_command: &str, log_path: &std::path::Path) -> Result<()> {
        self.state = DisplayServerState::Starting;

        let mut argv: Vec<String> = xserver_command.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(Error::Spawn("xserver-command is empty".into()));
        }
        argv.push(self.display_address.clone());
        argv.push(format!("vt{}", self.vt));
        argv.push("-novtswitch".into());

        let identity = child::Identity {
            uid: 0,
            gid: 0,
            username: "root".into(),
        };
        let handle = child::spawn(&argv, &[], &PathBuf::from("/"), &identity, log_path, &[])?;
        self.child = Some(handle);
        Ok(())
    }

    /// Marks the server ready once a probe connection using `cookie`
    /// succeeds. The probe itself is the caller's concern (it needs an
    /// X11 client, out of scope here); this just records the transition.
    pub fn mark_ready(&mut self) {
        self.state = DisplayServerState::Ready;
    }

    pub fn mark_exited(&mut self) -> bool {
        let was_ready = self.state == DisplayServerState::Ready;
        self.state = DisplayServerState::Exited;
        was_ready
    }

    pub fn child(&self) -> Option<&ChildHandle> {
        self.child.as_ref()
    }

    pub fn child_mut(&mut self) -> Option<&mut ChildHandle> {
        self.child.as_mut()
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.state = DisplayServerState::Exiting;
        if let Some(child) = &mut self.child {
            crate::session::stop_with_grace(child).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_server_starts_in_new_state() {
        let server = DisplayServer::new(":0".into(), 7, AuthCookie::generate());
        assert_eq!(server.state, DisplayServerState::New);
    }

    #[test]
    fn mark_exited_reports_whether_it_was_ready() {
        let mut server = DisplayServer::new(":0".into(), 7, AuthCookie::generate());
        assert!(!server.mark_exited());

        let mut server = DisplayServer::new(":0".into(), 7, AuthCookie::generate());
        server.mark_ready();
        assert!(server.mark_exited());
    }
}
