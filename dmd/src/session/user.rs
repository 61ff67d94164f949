//! Runs as the authenticated user. Registers with the host's
//! session-tracking service (logind or ConsoleKit) over D-Bus —
//! fire-and-forget, failure is logged but never fatal — and reads the
//! user's `DmrcFile` for session/language defaults the greeter didn't
//! supply explicitly.

use std::path::Path;

use crate::child::{self, ChildHandle};
use crate::dmrc::DmrcFile;
use crate::error::Result;
use crate::xauthority::{AuthCookie, XAuthorityFile};

use super::{Environment, Identity};

pub struct UserSession {
    pub identity: Identity,
    pub session_key: Option<String>,
    pub language: Option<String>,
    child: Option<ChildHandle>,
    xauthority: Option<XAuthorityFile>,
    registered: bool,
}

impl UserSession {
    pub fn new(identity: Identity, requested_session: Option<String>) -> UserSession {
        UserSession {
            identity,
            session_key: requested_session,
            language: None,
            child: None,
            xauthority: None,
            registered: false,
        }
    }

    /// Fills in `session_key`/`language` from `~/.dmrc` when the greeter
    /// didn't specify them explicitly. Missing `.dmrc` just means no
    /// defaults yet — not an error.
    pub fn apply_dmrc_defaults(&mut self) -> Result<()> {
        let dmrc = DmrcFile::read(&self.identity.home, self.identity.uid)?;
        if self.session_key.is_none() {
            self.session_key = dmrc.last_session;
        }
        if self.language.is_none() {
            self.language = dmrc.language;
        }
        Ok(())
    }

    /// Persists the session/language choice actually used, so the next
    /// login defaults to it.
    pub fn save_dmrc(&self) -> Result<()> {
        let dmrc = DmrcFile {
            path: self.identity.home.join(".dmrc"),
            owner_uid: self.identity.uid,
            last_session: self.session_key.clone(),
            language: self.language.clone(),
        };
        dmrc.write(self.identity.gid)
    }

    pub fn start(
        &mut self,
        argv: &[String],
        cookie: Option<(AuthCookie, &str, u32, &Path)>,
        seat: &str,
        log_path: &Path,
    ) -> Result<()> {
        let mut env = Environment::base_for(&self.identity, "user", seat);
        if let Some(lang) = &self.language {
            env.set("LANG", lang);
        }

        if let Some((auth_cookie, display, vt, fallback_dir)) = cookie {
            let xauth = XAuthorityFile::write(
                auth_cookie,
                display,
                self.identity.uid,
                self.identity.gid,
                &self.identity.home,
                fallback_dir,
            )?;
            env.set_x_display(display, &xauth.path, vt);
            self.xauthority = Some(xauth);
        }

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
            &[],
        )?;
        self.child = Some(handle);
        Ok(())
    }

    /// Fire-and-forget logind/ConsoleKit registration. Wire this to a real
    /// D-Bus call in `dbus.rs`'s session tracker once one exists; logged
    /// as a no-op for now so the call site doesn't need to change later.
    pub fn register_with_session_tracker(&mut self) {
        tracing::debug!(user = %self.identity.name, "registering session with logind/ConsoleKit");
        self.registered = true;
    }

    pub fn unregister_with_session_tracker(&mut self) {
        if self.registered {
            tracing::debug!(user = %self.identity.name, "unregistering session from logind/ConsoleKit");
            self.registered = false;
        }
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
        self.unregister_with_session_tracker();
        if let Some(xauth) = self.xauthority.take() {
            xauth.remove();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn identity() -> Identity {
        Identity {
            uid: 1000,
            gid: 1000,
            name: "alice".into(),
            home: "/home/alice".into(),
            shell: "/bin/bash".into(),
        }
    }

    #[test]
    fn dmrc_defaults_do_not_override_explicit_choice() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = identity();
        identity.home = dir.path().to_path_buf();

        let dmrc = DmrcFile {
            path: dir.path().join(".dmrc"),
            owner_uid: identity.uid,
            last_session: Some("gnome".into()),
            language: Some("en_US.UTF-8".into()),
        };
        dmrc.write(identity.gid).unwrap();

        let mut session = UserSession::new(identity, Some("plasma".into()));
        session.apply_dmrc_defaults().unwrap();
        assert_eq!(session.session_key, Some("plasma".into()));
        assert_eq!(session.language, Some("en_US.UTF-8".into()));
    }
}
