//! One physical login surface: a DisplayServer plus the Session currently
//! attached to it. This is the state machine everything else is driven
//! by — every other subsystem exists to produce an event this module
//! consumes.

use std::path::PathBuf;
use std::time::Duration;

use dmipc::{AuthResultCode, PromptKind, ToDaemon, ToGreeter};
use tokio::time::timeout;
use users::os::unix::UserExt;

use crate::display_server::DisplayServer;
use crate::error::{Error, Result};
use crate::greeter_socket::{Greeter, GreeterSocket, ProtocolState};
use crate::guest::GuestState;
use crate::pam::{AuthBackend, AuthEvent, AuthOutcome, Authenticator};
use crate::session::{GreeterSession, Identity, UserSession};

#[cfg(feature = "fake-auth")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "fake-auth")]
use dmd_fixtures::ScriptedAuthDb;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayState {
    New,
    StartingServer,
    ServerReady,
    GreeterRunning,
    Authenticating,
    AuthDone,
    StartingUserSession,
    UserSessionRunning,
    Stopping,
    Stopped,
}

const MAX_SERVER_RESTARTS: u32 = 3;
const SERVER_RESTART_DELAY: Duration = Duration::from_secs(1);

pub struct Display {
    pub name: String,
    pub state: DisplayState,
    pub server: DisplayServer,
    greeter_identity: Identity,
    greeter_argv: Vec<String>,
    greeter: Option<(GreeterSession, Greeter)>,
    user_session: Option<UserSession>,
    authenticator: Option<Box<dyn AuthBackend>>,
    pam_service: String,
    log_dir: PathBuf,
    guest_helper_command: Option<String>,
    pending_username: Option<String>,
    pending_guest: Option<GuestState>,
    pending_session_key: Option<String>,
    pending_language: Option<String>,
    authenticated_identity: Option<Identity>,
    #[cfg(feature = "fake-auth")]
    scripted_auth: Option<Arc<Mutex<ScriptedAuthDb>>>,
}

pub enum Outcome {
    /// The Display reached STOPPED cleanly; the Seat may launch a fresh
    /// greeter Display in its place.
    Stopped,
    /// A user session crashed; the Seat's crash-loop counter should
    /// advance before a fresh Display is launched.
    UserSessionCrashed,
}

/// What `next_event` observed. Side effects (protocol replies, state
/// transitions) are already applied by the time this is returned — the
/// caller's job is deciding what to do next, not interpreting wire
/// messages.
pub enum DisplayEvent {
    /// Something happened internally (a prompt was forwarded, a CONNECT
    /// was answered, ...) but there's nothing for the caller to do.
    Progressed,
    /// The greeter disconnected, or its process exited. The caller should
    /// stop this Display and let the Seat launch a fresh one.
    GreeterGone,
    /// The X server exited but is within its restart budget; the caller
    /// should call `start_server` again and keep driving this Display.
    ServerNeedsRestart,
    /// The X server exited and this Display is done.
    ServerDied,
    /// The greeter asked to start a session; `state` is now
    /// `StartingUserSession`. The caller resolves the identity, calls
    /// `start_user_session`/`launch_user_session`, then resumes polling.
    SessionStartRequested,
    /// The running user session's process exited.
    UserSessionExited(Outcome),
}

impl Display {
    pub fn new(
        name: String,
        server: DisplayServer,
        greeter_identity: Identity,
        greeter_argv: Vec<String>,
        pam_service: String,
        log_dir: PathBuf,
        guest_helper_command: Option<String>,
    ) -> Display {
        Display {
            name,
            state: DisplayState::New,
            server,
            greeter_identity,
            greeter_argv,
            greeter: None,
            user_session: None,
            authenticator: None,
            pam_service,
            log_dir,
            guest_helper_command,
            pending_username: None,
            pending_guest: None,
            pending_session_key: None,
            pending_language: None,
            authenticated_identity: None,
            #[cfg(feature = "fake-auth")]
            scripted_auth: None,
        }
    }

    /// Swaps the real PAM backend out for a scripted one driven by
    /// `dmd-fixtures`. Only available under the `fake-auth` feature, used
    /// by the integration test harness.
    #[cfg(feature = "fake-auth")]
    pub fn with_scripted_auth(mut self, db: Arc<Mutex<ScriptedAuthDb>>) -> Display {
        self.scripted_auth = Some(db);
        self
    }

    pub async fn start_server(&mut self, xserver_command: &str) -> Result<()> {
        self.state = DisplayState::StartingServer;
        let log_path = self.log_dir.join(format!("{}-x.log", self.name));
        self.server.start(xserver_command, &log_path)
    }

    /// Called when the owning Seat observes the server process exit.
    /// Implements the `restart_attempts < 3` retry policy.
    pub async fn server_exited(&mut self) -> Result<bool> {
        let was_ready = self.server.mark_exited();
        if self.state == DisplayState::UserSessionRunning {
            // Crash during a live user session is fatal for this Display.
            self.state = DisplayState::Stopping;
            return Ok(false);
        }
        if was_ready {
            self.state = DisplayState::Stopping;
            return Ok(false);
        }

        self.server.restart_attempts += 1;
        if self.server.restart_attempts >= MAX_SERVER_RESTARTS {
            self.state = DisplayState::Stopping;
            return Ok(false);
        }
        tokio::time::sleep(SERVER_RESTART_DELAY).await;
        Ok(true)
    }

    pub fn server_ready(&mut self) {
        self.server.mark_ready();
        self.state = DisplayState::ServerReady;
    }

    pub async fn accept_greeter(&mut self, socket: &mut GreeterSocket, seat: &str) -> Result<()> {
        let log_path = self.log_dir.join(format!("{}-greeter.log", self.name));
        let mut session = GreeterSession::new(self.greeter_identity.clone());
        session.start(&self.greeter_argv, &socket.path, seat, &log_path)?;

        let greeter = socket.accept().await?;
        self.greeter = Some((session, greeter));
        self.state = DisplayState::GreeterRunning;
        Ok(())
    }

    fn greeter_state(&self) -> Result<ProtocolState> {
        self.greeter
            .as_ref()
            .map(|(_, g)| g.state)
            .ok_or_else(|| Error::Protocol("message from a Display with no greeter attached".into()))
    }

    async fn send_to_greeter(&mut self, msg: &ToGreeter) -> Result<()> {
        match &mut self.greeter {
            Some((_, greeter)) => greeter.send(msg).await,
            None => Ok(()),
        }
    }

    async fn reject_greeter(&mut self, why: &str) -> Result<()> {
        match &mut self.greeter {
            Some((_, greeter)) => greeter.reject(why).await,
            None => Ok(()),
        }
    }

    fn set_greeter_state(&mut self, state: ProtocolState) {
        if let Some((_, greeter)) = &mut self.greeter {
            greeter.state = state;
        }
    }

    /// Handles one message from the attached greeter. Mutates protocol
    /// and Display state as needed; authentication events are surfaced to
    /// the caller's event loop via `poll_authenticator`.
    pub async fn handle_greeter_message(&mut self, msg: ToDaemon) -> Result<()> {
        let state = self.greeter_state()?;

        match msg {
            ToDaemon::Connect { .. } => {
                // A CONNECT while a conversation is in flight is a
                // reconnect, not a protocol violation; the conservative
                // reading is to drop whatever authentication was underway
                // rather than guess at resuming it.
                if let Some(mut auth) = self.authenticator.take() {
                    let _ = auth.cancel().await;
                }
                self.set_greeter_state(ProtocolState::Connected);
                self.send_to_greeter(&ToGreeter::Connected {
                    hints: Default::default(),
                })
                .await?;
            }
            ToDaemon::Authenticate { username } => {
                if state != ProtocolState::Connected {
                    self.reject_greeter("authenticate is not valid here").await?;
                    return Ok(());
                }
                self.set_greeter_state(ProtocolState::Authenticating);
                self.state = DisplayState::Authenticating;
                self.pending_username = username.clone();
                self.authenticator = Some(self.spawn_authenticator(username.as_deref()));
            }
            ToDaemon::AuthenticateAsGuest => {
                if state != ProtocolState::Connected {
                    self.reject_greeter("authenticate is not valid here").await?;
                    return Ok(());
                }
                self.set_greeter_state(ProtocolState::Authenticating);
                self.state = DisplayState::Authenticating;

                // Guest accounts have no password: provisioning the
                // transient account through the helper script (§6) *is*
                // the authentication step, no PAM conversation involved.
                let outcome = match &self.guest_helper_command {
                    Some(cmd) => match GuestState::provision(cmd).await {
                        Ok(guest) => {
                            self.pending_username = Some(guest.username.clone());
                            self.pending_guest = Some(guest);
                            AuthOutcome::Authenticated
                        }
                        Err(e) => {
                            tracing::warn!(display = %self.name, error = %e, "guest provisioning failed");
                            AuthOutcome::SystemError
                        }
                    },
                    None => AuthOutcome::Denied,
                };
                self.finish_authentication(outcome).await?;
            }
            ToDaemon::Continue { responses } => {
                if state != ProtocolState::AwaitingResponse {
                    self.reject_greeter("no prompt is outstanding").await?;
                    return Ok(());
                }
                if let Some(auth) = &mut self.authenticator {
                    auth.respond(responses).await?;
                    self.set_greeter_state(ProtocolState::Authenticating);
                }
            }
            ToDaemon::Cancel => {
                if let Some(auth) = &mut self.authenticator {
                    auth.cancel().await?;
                }
            }
            ToDaemon::StartSession { session_key } => {
                if state != ProtocolState::AuthComplete {
                    self.reject_greeter("no completed authentication to start a session for").await?;
                    return Ok(());
                }
                self.set_greeter_state(ProtocolState::StartingSession);
                self.pending_session_key = session_key;
                self.state = DisplayState::StartingUserSession;
            }
            ToDaemon::SetLanguage { code } => {
                if let Some(user_session) = &mut self.user_session {
                    user_session.language = Some(code);
                } else {
                    self.pending_language = Some(code);
                }
            }
        }
        Ok(())
    }

    /// Applies one event already pulled off the active authenticator:
    /// forwards prompts to the greeter, or finalizes the result.
    async fn apply_auth_event(&mut self, event: Option<AuthEvent>) -> Result<()> {
        match event {
            Some(AuthEvent::Messages(batch)) => {
                if let Some((_, greeter)) = &mut self.greeter {
                    greeter.state = ProtocolState::AwaitingResponse;
                    for msg in batch.0 {
                        let (kind, text) = match msg {
                            crate::pam::Message::Secret(t) => (PromptKind::Secret, t),
                            crate::pam::Message::Visible(t) => (PromptKind::Visible, t),
                            crate::pam::Message::Info(t) => (PromptKind::Info, t),
                            crate::pam::Message::Error(t) => (PromptKind::Error, t),
                        };
                        greeter.send(&ToGreeter::Prompt { kind, text }).await?;
                    }
                }
            }
            Some(AuthEvent::Complete(outcome)) => {
                self.finish_authentication(outcome).await?;
            }
            None => {
                self.finish_authentication(AuthOutcome::SystemError).await?;
            }
        }
        Ok(())
    }

    fn spawn_authenticator(&self, username: Option<&str>) -> Box<dyn AuthBackend> {
        #[cfg(feature = "fake-auth")]
        return start_authenticator(&self.pam_service, username, self.scripted_auth.as_ref());
        #[cfg(not(feature = "fake-auth"))]
        start_authenticator(&self.pam_service, username)
    }

    async fn finish_authentication(&mut self, outcome: AuthOutcome) -> Result<()> {
        self.authenticator = None;

        // A successful PAM conversation only tells us a name was proven;
        // resolving it to an actual system account happens here, before
        // the greeter is told anything, so a stale/missing account comes
        // back as a failure rather than a session that can never start.
        let outcome = if matches!(outcome, AuthOutcome::Authenticated) {
            match self.pending_username.as_deref() {
                Some(username) => match resolve_identity(username) {
                    Ok(identity) => {
                        self.authenticated_identity = Some(identity);
                        outcome
                    }
                    Err(_) => {
                        tracing::warn!(display = %self.name, %username, "authenticated name has no matching system account");
                        AuthOutcome::UnknownUser
                    }
                },
                None => AuthOutcome::SystemError,
            }
        } else {
            outcome
        };

        let code = match outcome {
            AuthOutcome::Authenticated => AuthResultCode::Authenticated,
            AuthOutcome::Denied => AuthResultCode::Denied,
            AuthOutcome::AccountExpired => AuthResultCode::AccountExpired,
            AuthOutcome::NewTokenRequired => AuthResultCode::NewTokenRequired,
            AuthOutcome::MaxTries => AuthResultCode::MaxTries,
            AuthOutcome::UnknownUser => AuthResultCode::UnknownUser,
            AuthOutcome::Cancelled => AuthResultCode::Cancelled,
            AuthOutcome::SystemError => AuthResultCode::SystemError,
        };
        let username = self.authenticated_identity.as_ref().map(|i| i.name.clone());

        if let Some((_, greeter)) = &mut self.greeter {
            greeter.state = if matches!(outcome, AuthOutcome::Authenticated) {
                ProtocolState::AuthComplete
            } else {
                ProtocolState::Connected
            };
            greeter
                .send(&ToGreeter::AuthComplete {
                    result: code,
                    username,
                })
                .await?;
        }

        match outcome {
            AuthOutcome::Authenticated => {
                self.state = DisplayState::AuthDone;
            }
            AuthOutcome::SystemError => {
                // Reported; Display stays in GREETER_RUNNING so the
                // greeter may retry.
                self.state = DisplayState::GreeterRunning;
            }
            _ => {
                self.state = DisplayState::GreeterRunning;
                if let Some((_, greeter)) = &mut self.greeter {
                    greeter.send(&ToGreeter::Reset).await?;
                }
            }
        }
        Ok(())
    }

    /// Completes authentication as `username` without a PAM conversation —
    /// the `autologin-user-timeout` path, fired by the caller once the
    /// greeter has sat idle long enough. Goes through the same
    /// `finish_authentication` the real conversation does, so the greeter
    /// sees the identical `AUTH_COMPLETE` it would for a typed login.
    pub async fn autologin(&mut self, username: &str) -> Result<()> {
        self.pending_username = Some(username.to_string());
        self.finish_authentication(AuthOutcome::Authenticated).await
    }

    /// Stops the attached greeter with a 5s grace period and transitions
    /// to STARTING_USER_SESSION for the given identity.
    pub async fn start_user_session(&mut self, identity: Identity, session_key: Option<String>) -> Result<()> {
        if let Some((mut greeter_session, mut greeter)) = self.greeter.take() {
            let _ = greeter.send(&ToGreeter::EndSession).await;
            timeout(crate::session::STOP_GRACE_PERIOD, greeter_session.stop())
                .await
                .ok();
        }

        let mut user_session = UserSession::new(identity.validate()?, session_key);
        if let Some(lang) = self.pending_language.take() {
            user_session.language = Some(lang);
        }
        user_session.apply_dmrc_defaults()?;
        self.user_session = Some(user_session);
        self.state = DisplayState::StartingUserSession;
        Ok(())
    }

    /// Identity resolved for the most recently completed authentication,
    /// if any — consumed once by the caller driving this Display's
    /// lifecycle to build the `Identity` for `start_user_session`.
    pub fn take_authenticated_identity(&mut self) -> Option<Identity> {
        self.authenticated_identity.take()
    }

    pub fn take_pending_session_key(&mut self) -> Option<String> {
        self.pending_session_key.take()
    }

    pub fn take_pending_guest(&mut self) -> Option<GuestState> {
        self.pending_guest.take()
    }

    /// The session key actually in effect (explicit choice or `.dmrc`
    /// default) once `start_user_session` has run.
    pub fn user_session_key(&self) -> Option<&str> {
        self.user_session.as_ref().and_then(|s| s.session_key.as_deref())
    }

    pub fn launch_user_session(&mut self, argv: &[String], seat: &str) -> Result<()> {
        let log_path = self.log_dir.join(format!("{}-session.log", self.name));
        let display_address = self.server.display_address.clone();
        let vt = self.server.vt;
        let cookie = self.server.cookie;
        let log_dir = self.log_dir.clone();
        if let Some(user_session) = &mut self.user_session {
            user_session.start(
                argv,
                Some((cookie, &display_address, vt, &log_dir)),
                seat,
                &log_path,
            )?;
            user_session.register_with_session_tracker();
            self.state = DisplayState::UserSessionRunning;
        }
        Ok(())
    }

    /// Called by the owning Seat when the user session's child exits.
    pub async fn user_session_exited(&mut self) -> Outcome {
        if let Some(mut user_session) = self.user_session.take() {
            let _ = user_session.save_dmrc();
            let _ = user_session.stop().await;
        }
        self.state = DisplayState::Stopping;
        Outcome::UserSessionCrashed
    }

    /// Races every live event source for this Display's current phase —
    /// greeter messages and authenticator progress before a session
    /// starts, just the user session's process after — and returns the
    /// first thing the caller needs to act on. Each branch borrows a
    /// distinct field directly (never a whole-`self` method call) so the
    /// borrow checker can see they're disjoint; `tokio::select!` could
    /// not otherwise race two methods that each take `&mut self`.
    pub async fn next_event(&mut self) -> Result<DisplayEvent> {
        if self.user_session.is_some() {
            self.next_user_session_event().await
        } else {
            self.next_greeter_phase_event().await
        }
    }

    async fn next_greeter_phase_event(&mut self) -> Result<DisplayEvent> {
        tokio::select! {
            msg = recv_from_greeter(&mut self.greeter) => {
                match msg? {
                    Some(m) => {
                        self.handle_greeter_message(m).await?;
                        if self.state == DisplayState::StartingUserSession {
                            Ok(DisplayEvent::SessionStartRequested)
                        } else {
                            Ok(DisplayEvent::Progressed)
                        }
                    }
                    None => Ok(DisplayEvent::GreeterGone),
                }
            }
            event = poll_auth(&mut self.authenticator), if self.authenticator.is_some() => {
                self.apply_auth_event(event).await?;
                Ok(DisplayEvent::Progressed)
            }
            result = wait_opt(self.server.child_mut()) => {
                let _ = result;
                if self.server_exited().await? {
                    Ok(DisplayEvent::ServerNeedsRestart)
                } else {
                    Ok(DisplayEvent::ServerDied)
                }
            }
            result = wait_opt(self.greeter.as_mut().and_then(|(s, _)| s.child_mut())) => {
                let _ = result;
                Ok(DisplayEvent::GreeterGone)
            }
        }
    }

    async fn next_user_session_event(&mut self) -> Result<DisplayEvent> {
        tokio::select! {
            result = wait_opt(self.user_session.as_mut().and_then(|s| s.child_mut())) => {
                let _ = result;
                Ok(DisplayEvent::UserSessionExited(self.user_session_exited().await))
            }
            result = wait_opt(self.server.child_mut()) => {
                let _ = result;
                Ok(DisplayEvent::ServerDied)
            }
        }
    }

    pub async fn stop(&mut self) -> Result<Outcome> {
        self.state = DisplayState::Stopping;
        if let Some(auth) = self.authenticator.take() {
            let mut auth = auth;
            let _ = auth.cancel().await;
        }
        if let Some((mut greeter_session, _)) = self.greeter.take() {
            let _ = greeter_session.stop().await;
        }
        if let Some(mut user_session) = self.user_session.take() {
            let _ = user_session.stop().await;
        }
        let _ = self.server.stop().await;
        self.state = DisplayState::Stopped;
        Ok(Outcome::Stopped)
    }
}

async fn recv_from_greeter(greeter: &mut Option<(GreeterSession, Greeter)>) -> Result<Option<ToDaemon>> {
    match greeter {
        Some((_, g)) => g.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_auth(auth: &mut Option<Box<dyn AuthBackend>>) -> Option<AuthEvent> {
    match auth {
        Some(a) => a.next_event().await,
        None => std::future::pending().await,
    }
}

async fn wait_opt(child: Option<&mut crate::child::ChildHandle>) -> Result<std::process::ExitStatus> {
    match child {
        Some(c) => c.wait_mut().await,
        None => std::future::pending().await,
    }
}

/// Looks up a system account by name for a proven username — PAM
/// auth, autologin config, or a direct `SwitchToUser` D-Bus call.
pub(crate) fn resolve_identity(username: &str) -> Result<Identity> {
    let user = users::get_user_by_name(username)
        .ok_or_else(|| Error::AuthFailure(format!("no such system user: {}", username)))?;
    Ok(Identity {
        uid: user.uid(),
        gid: user.primary_group_id(),
        name: username.to_string(),
        home: user.home_dir().to_path_buf(),
        shell: user.shell().to_string_lossy().into_owned(),
    })
}

#[cfg(not(feature = "fake-auth"))]
fn start_authenticator(service: &str, username: Option<&str>) -> Box<dyn AuthBackend> {
    Box::new(Authenticator::start(service, username))
}

#[cfg(feature = "fake-auth")]
fn start_authenticator(
    service: &str,
    username: Option<&str>,
    scripted_auth: Option<&Arc<Mutex<ScriptedAuthDb>>>,
) -> Box<dyn AuthBackend> {
    match scripted_auth {
        Some(db) => Box::new(crate::pam::FakeAuthenticator::start(db, username.unwrap_or("guest"))),
        None => Box::new(Authenticator::start(service, username)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xauthority::AuthCookie;

    fn test_display() -> Display {
        Display::new(
            "seat0".into(),
            DisplayServer::new(":0".into(), 7, AuthCookie::generate()),
            Identity {
                uid: 100,
                gid: 100,
                name: "lightdm".into(),
                home: "/var/lib/lightdm".into(),
                shell: "/bin/false".into(),
            },
            vec!["/usr/bin/greeter".into()],
            "lightdm".into(),
            std::env::temp_dir(),
            None,
        )
    }

    #[test]
    fn new_display_starts_in_new_state() {
        assert_eq!(test_display().state, DisplayState::New);
    }

    #[tokio::test]
    async fn user_session_exit_transitions_to_stopping() {
        let mut display = test_display();
        display.state = DisplayState::UserSessionRunning;
        let outcome = display.user_session_exited().await;
        assert!(matches!(outcome, Outcome::UserSessionCrashed));
        assert_eq!(display.state, DisplayState::Stopping);
    }
}
