//! `DaemonRoot`: the top of the ownership tree. Loads configuration,
//! binds the greeter socket, spawns one task per configured seat, and
//! runs until SIGTERM/SIGINT. Each seat task owns its `Seat` and the
//! `Display` currently attached to it directly — nothing about a running
//! session sits behind a lock a D-Bus call could starve. The D-Bus
//! surface instead talks to a seat through a small command channel,
//! which is also what replaces what used to be global singletons (see
//! the REDESIGN FLAGS note carried into DESIGN.md).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Mutex};

#[cfg(feature = "fake-auth")]
use dmd_fixtures::ScriptedAuthDb;

use crate::config::{Config, SeatDefaultsConfig};
use crate::display::{self, Display, Outcome as DisplayOutcome};
use crate::display_server::DisplayServer;
use crate::error::{Error, Result};
use crate::greeter_socket::GreeterSocket;
use crate::guest::GuestState;
use crate::seat::Seat;
use crate::session::Identity;
use crate::session_descriptor::SessionDescriptor;
use crate::vt::VtAllocator;
use crate::xauthority::AuthCookie;

const GREETER_LOG_DIR: &str = "/var/log/dmd";

/// A request made against one seat from outside its driving task — the
/// D-Bus surface, or `dmd-tool` indirectly through it.
#[derive(Clone, Debug)]
pub enum SeatCommand {
    SwitchToGreeter,
    SwitchToUser(String, Option<String>),
    SwitchToGuest(Option<String>),
    Lock,
}

/// Cheap, frequently-read snapshot of a seat's state, published by its
/// driving task after every transition. This is what `dmd-tool list-seats`
/// and the D-Bus `Seats`/`Sessions` properties actually read — never the
/// live `Seat`/`Display`, which stays inside the task that owns it.
#[derive(Clone, Debug, Default)]
pub struct SeatSummary {
    pub active_user: Option<String>,
    pub stopped: bool,
}

struct SeatHandle {
    commands: mpsc::Sender<SeatCommand>,
    task: tokio::task::JoinHandle<()>,
}

/// Shared, read-mostly state the D-Bus surface resolves its method calls
/// against. Construction order (load config, drop startup-only
/// privileges, build this, bind the socket, publish the D-Bus object,
/// start seats, run) lives in `DaemonRoot::run`.
pub struct DaemonContext {
    pub config: Config,
    vt_allocator: VtAllocator,
    greeter_socket: Mutex<GreeterSocket>,
    next_display_number: AtomicU32,
    next_dynamic_seat: AtomicU32,
    seats: Mutex<HashMap<String, SeatHandle>>,
    /// Per-seat config layered over `config` for seats provisioned at
    /// runtime through `AddSeat`/`AddLocalXSeat` rather than
    /// `lightdm.conf`. Checked before falling back to `config.seat_config`.
    dynamic_overrides: Mutex<HashMap<String, SeatDefaultsConfig>>,
    pub summaries: Mutex<HashMap<String, SeatSummary>>,
    #[cfg(feature = "fake-auth")]
    scripted_auth: Option<Arc<std::sync::Mutex<ScriptedAuthDb>>>,
}

impl DaemonContext {
    /// Sends `cmd` to `seat`, or `NoSuchSeat` if it isn't configured.
    /// This is the only way the D-Bus surface ever reaches into a
    /// running seat.
    pub async fn dispatch(&self, seat: &str, cmd: SeatCommand) -> Result<()> {
        let seats = self.seats.lock().await;
        let handle = seats
            .get(seat)
            .ok_or_else(|| Error::Spawn(format!("no such seat: {}", seat)))?;
        handle
            .commands
            .send(cmd)
            .await
            .map_err(|_| Error::Spawn(format!("seat {} is no longer running", seat)))
    }

    pub async fn seat_names(&self) -> Vec<String> {
        self.seats.lock().await.keys().cloned().collect()
    }

    /// Resolves the effective config for `name`: a runtime override from
    /// `AddSeat`/`AddLocalXSeat` if one was registered, otherwise whatever
    /// `lightdm.conf` says (defaults if the seat isn't named there either).
    async fn effective_seat_config(&self, name: &str) -> SeatDefaultsConfig {
        if let Some(overrides) = self.dynamic_overrides.lock().await.get(name) {
            return overrides.clone();
        }
        self.config.seat_config(name)
    }

    /// Provisions and starts a new seat at runtime, the D-Bus-reachable
    /// counterpart to the seats `run()` starts from `lightdm.conf` at
    /// startup. Fails if `name` is already running.
    pub async fn add_seat(self: &Arc<Self>, name: String, overrides: SeatDefaultsConfig) -> Result<()> {
        {
            let seats = self.seats.lock().await;
            if seats.contains_key(&name) {
                return Err(Error::Spawn(format!("seat {} already exists", name)));
            }
        }
        self.dynamic_overrides.lock().await.insert(name.clone(), overrides);
        spawn_seat(self.clone(), name).await;
        Ok(())
    }

    /// `AddLocalXSeat(n)`: a bare local X seat with no overrides beyond
    /// `SeatDefaults`, named after the next free dynamic seat slot.
    pub async fn add_local_x_seat(self: &Arc<Self>, _vt: u32) -> Result<String> {
        let n = self.next_dynamic_seat.fetch_add(1, Ordering::SeqCst);
        let name = format!("seat-local-{}", n);
        self.add_seat(name.clone(), SeatDefaultsConfig::default()).await?;
        Ok(name)
    }
}

/// Parses the `KEY=VALUE` pairs `AddSeat`/`dmd-tool add-seat` take into a
/// `SeatDefaultsConfig`, using the same keys as `[Seat:<name>]` sections.
pub fn parse_seat_overrides(pairs: &[(String, String)]) -> SeatDefaultsConfig {
    let mut cfg = SeatDefaultsConfig::default();
    for (key, value) in pairs {
        match key.as_str() {
            "xserver-command" => cfg.xserver_command = Some(value.clone()),
            "xserver-layout" => cfg.xserver_layout = Some(value.clone()),
            "session-wrapper" => cfg.session_wrapper = Some(value.clone()),
            "greeter-session" => cfg.greeter_session = Some(value.clone()),
            "autologin-user" => cfg.autologin_user = Some(value.clone()),
            "autologin-user-timeout" => cfg.autologin_user_timeout = value.parse().ok(),
            "allow-guest" => cfg.allow_guest = Some(matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")),
            other => tracing::warn!(key = %other, "ignoring unknown seat override key"),
        }
    }
    cfg
}

/// Spawns the task driving `name` and registers its command channel
/// before returning, so a `dispatch` issued immediately after this
/// resolves rather than racing the new task's startup.
async fn spawn_seat(ctx: Arc<DaemonContext>, name: String) {
    let (tx, rx) = mpsc::channel(8);
    let seat_name = name.clone();
    let task_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = run_seat(task_ctx, seat_name.clone(), rx).await {
            tracing::error!(seat = %seat_name, error = %e, "seat task exited");
        }
    });
    let mut seats = ctx.seats.lock().await;
    seats.insert(name, SeatHandle { commands: tx, task });
}

pub struct DaemonRoot {
    ctx: Arc<DaemonContext>,
}

impl DaemonRoot {
    pub fn new(config_path: &Path) -> Result<DaemonRoot> {
        Self::build(
            config_path,
            #[cfg(feature = "fake-auth")]
            None,
        )
    }

    /// Only available under `fake-auth`: every seat this daemon spawns
    /// authenticates against `db` instead of PAM.
    #[cfg(feature = "fake-auth")]
    pub fn new_with_scripted_auth(
        config_path: &Path,
        db: Arc<std::sync::Mutex<ScriptedAuthDb>>,
    ) -> Result<DaemonRoot> {
        Self::build(config_path, Some(db))
    }

    fn build(
        config_path: &Path,
        #[cfg(feature = "fake-auth")] scripted_auth: Option<Arc<std::sync::Mutex<ScriptedAuthDb>>>,
    ) -> Result<DaemonRoot> {
        let config = Config::load(config_path)?;
        let vt_allocator = VtAllocator::new(config.lightdm.minimum_vt);
        let socket_path = PathBuf::from("/run/dmd/dmd.sock");
        let greeter_socket = GreeterSocket::bind(&socket_path)?;

        let ctx = DaemonContext {
            config,
            vt_allocator,
            greeter_socket: Mutex::new(greeter_socket),
            next_display_number: AtomicU32::new(0),
            next_dynamic_seat: AtomicU32::new(0),
            seats: Mutex::new(HashMap::new()),
            dynamic_overrides: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
            #[cfg(feature = "fake-auth")]
            scripted_auth,
        };
        Ok(DaemonRoot { ctx: Arc::new(ctx) })
    }

    pub fn context(&self) -> Arc<DaemonContext> {
        self.ctx.clone()
    }

    /// Starts every configured seat and blocks until SIGTERM/SIGINT, then
    /// stops every seat in turn before returning.
    pub async fn run(self) -> Result<()> {
        tokio::spawn(crate::reaper::run());

        let names = seat_names(&self.ctx.config);
        for name in &names {
            spawn_seat(self.ctx.clone(), name.clone()).await;
        }

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| Error::Spawn(format!("signal(SIGTERM): {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| Error::Spawn(format!("signal(SIGINT): {}", e)))?;

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }

        for (_, handle) in self.ctx.seats.lock().await.drain() {
            handle.task.abort();
        }
        Ok(())
    }
}

fn seat_names(config: &Config) -> Vec<String> {
    let mut names: Vec<String> = config.seat_overrides.iter().map(|(n, _)| n.clone()).collect();
    if names.is_empty() {
        names.push("seat0".to_string());
    }
    names
}

/// What the seat's loop should bring up next: the greeter, a specific
/// user's session directly (autologin or `SwitchToUser`), or a freshly
/// provisioned guest.
#[derive(Clone, Debug)]
enum Target {
    Greeter,
    User(String, Option<String>),
    Guest(Option<String>),
}

enum DriveOutcome {
    Finished(DisplayOutcome),
    SwitchRequested(Target),
}

fn target_from_command(cmd: SeatCommand) -> Option<Target> {
    match cmd {
        SeatCommand::SwitchToGreeter => Some(Target::Greeter),
        SeatCommand::SwitchToUser(user, session) => Some(Target::User(user, session)),
        SeatCommand::SwitchToGuest(session) => Some(Target::Guest(session)),
        SeatCommand::Lock => None,
    }
}

async fn run_seat(ctx: Arc<DaemonContext>, name: String, mut commands: mpsc::Receiver<SeatCommand>) -> Result<()> {
    let seat_config = ctx.effective_seat_config(&name).await;
    let greeter_identity = resolve_greeter_identity(&seat_config)?;
    let greeter_argv = resolve_greeter_argv(&ctx, &seat_config)?;
    let xserver_command = seat_config
        .xserver_command
        .clone()
        .unwrap_or_else(|| "/usr/bin/X".to_string());
    let log_dir = PathBuf::from(GREETER_LOG_DIR);

    let mut seat = Seat::new(name.clone());
    publish_summary(&ctx, &name, &seat, None).await;

    // A timeout turns autologin into "show the greeter, but log the
    // configured user in after N seconds of inactivity" rather than
    // skipping the greeter outright — the greeter still gets a chance to
    // offer a different user the opportunity to log in first.
    let mut target = match (&seat_config.autologin_user, seat_config.autologin_user_timeout) {
        (Some(user), None) => Target::User(user.clone(), None),
        _ => Target::Greeter,
    };
    let autologin = seat_config
        .autologin_user
        .clone()
        .zip(seat_config.autologin_user_timeout);

    loop {
        if seat.is_stopped() {
            break;
        }
        seat.clear_displays();

        // A guest target is provisioned up front, not inside the display
        // loop, so a provisioning failure falls straight back to a fresh
        // greeter without ever spawning a server for it.
        let (resolved_target, pending_guest) = match target.clone() {
            Target::Guest(session) => match &seat_config.allow_guest {
                Some(true) => match &ctx.config.lightdm.guest_account_script {
                    Some(script) => match GuestState::provision(script).await {
                        Ok(guest) => {
                            let username = guest.username.clone();
                            (Target::User(username, session), Some(guest))
                        }
                        Err(e) => {
                            tracing::warn!(seat = %name, error = %e, "guest provisioning failed, falling back to greeter");
                            (Target::Greeter, None)
                        }
                    },
                    None => (Target::Greeter, None),
                },
                _ => {
                    tracing::warn!(seat = %name, "guest login requested but not allowed on this seat");
                    (Target::Greeter, None)
                }
            },
            other => (other, None),
        };

        let vt = DisplayServer::allocate_vt(&ctx.vt_allocator, ctx.config.lightdm.minimum_vt);
        let display_address = format!(":{}", ctx.next_display_number.fetch_add(1, Ordering::SeqCst));
        let cookie = AuthCookie::generate();
        let server = DisplayServer::new(display_address, vt, cookie);

        let mut display = Display::new(
            name.clone(),
            server,
            greeter_identity.clone(),
            greeter_argv.clone(),
            ctx.config.lightdm.pam_service.clone(),
            log_dir.clone(),
            ctx.config.lightdm.guest_account_script.clone(),
        );
        #[cfg(feature = "fake-auth")]
        let mut display = match &ctx.scripted_auth {
            Some(db) => display.with_scripted_auth(db.clone()),
            None => display,
        };

        if let Err(e) = display.start_server(&xserver_command).await {
            tracing::error!(seat = %name, error = %e, "failed to start display server, retrying");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            continue;
        }
        display.server_ready();

        let idx = seat.push_display(display);
        seat.set_active(idx)?;

        let outcome = match resolved_target {
            Target::Greeter => drive_greeter(&ctx, &mut seat, &seat_config, &name, autologin.clone(), &mut commands).await,
            Target::User(username, session_key) => match display::resolve_identity(&username) {
                Ok(identity) => drive_direct_login(&ctx, &mut seat, &seat_config, &name, identity, session_key, &mut commands).await,
                Err(e) => {
                    tracing::error!(seat = %name, %username, error = %e, "cannot start a session for an unknown user, falling back to greeter");
                    let display = active_display(&mut seat)?;
                    let outcome = display.stop().await?;
                    Ok(DriveOutcome::Finished(outcome))
                }
            },
            Target::Guest(_) => unreachable!("guest targets are resolved to a user target above"),
        };

        if let Some(guest) = pending_guest {
            guest.teardown().await;
        }

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(seat = %name, error = %e, "seat event loop error");
                DriveOutcome::Finished(DisplayOutcome::Stopped)
            }
        };

        target = match outcome {
            DriveOutcome::SwitchRequested(next) => next,
            DriveOutcome::Finished(display_outcome) => {
                let stopped = seat.handle_display_outcome(idx, display_outcome).await;
                publish_summary(&ctx, &name, &seat, None).await;
                if stopped {
                    break;
                }
                Target::Greeter
            }
        };
    }

    publish_summary(&ctx, &name, &seat, None).await;
    Ok(())
}

async fn publish_summary(ctx: &DaemonContext, name: &str, seat: &Seat, active_user: Option<String>) {
    let summary = SeatSummary {
        active_user,
        stopped: seat.is_stopped(),
    };
    ctx.summaries.lock().await.insert(name.to_string(), summary);
}

async fn drive_greeter(
    ctx: &Arc<DaemonContext>,
    seat: &mut Seat,
    seat_config: &SeatDefaultsConfig,
    seat_name: &str,
    autologin: Option<(String, u64)>,
    commands: &mut mpsc::Receiver<SeatCommand>,
) -> Result<DriveOutcome> {
    {
        let mut socket = ctx.greeter_socket.lock().await;
        let display = active_display(seat)?;
        display.accept_greeter(&mut socket, seat_name).await?;
    }

    loop {
        let display = active_display(seat)?;
        let autologin_armed = autologin.is_some() && display.state == crate::display::DisplayState::GreeterRunning;
        let idle_secs = autologin.as_ref().map(|(_, secs)| *secs).unwrap_or(0);
        tokio::select! {
            event = display.next_event() => {
                match event? {
                    display::DisplayEvent::Progressed => {}
                    display::DisplayEvent::SessionStartRequested => break,
                    display::DisplayEvent::GreeterGone | display::DisplayEvent::ServerDied => {
                        let outcome = display.stop().await?;
                        ctx.greeter_socket.lock().await.release();
                        return Ok(DriveOutcome::Finished(outcome));
                    }
                    display::DisplayEvent::ServerNeedsRestart => {
                        let cmd = seat_config.xserver_command.clone().unwrap_or_else(|| "/usr/bin/X".into());
                        display.start_server(&cmd).await?;
                        display.server_ready();
                    }
                    display::DisplayEvent::UserSessionExited(_) => unreachable!("no user session exists before SessionStartRequested"),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(idle_secs)), if autologin_armed => {
                // Any other branch firing first rebuilds this sleep with a
                // fresh deadline next iteration, which is what makes this a
                // rolling inactivity timer rather than a one-shot delay.
                let (user, _) = autologin.as_ref().expect("autologin_armed implies autologin is Some");
                display.autologin(user).await?;
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(SeatCommand::Lock) => {
                        tracing::debug!(seat = %seat_name, "lock requested with no session running yet, ignored");
                    }
                    Some(other) => {
                        let outcome = display.stop().await?;
                        ctx.greeter_socket.lock().await.release();
                        if let Some(target) = target_from_command(other) {
                            return Ok(DriveOutcome::SwitchRequested(target));
                        }
                        return Ok(DriveOutcome::Finished(outcome));
                    }
                    None => {
                        let outcome = display.stop().await?;
                        return Ok(DriveOutcome::Finished(outcome));
                    }
                }
            }
        }
    }

    ctx.greeter_socket.lock().await.release();

    let display = active_display(seat)?;
    let identity = display
        .take_authenticated_identity()
        .ok_or_else(|| Error::Protocol("session start requested with no authenticated identity".into()))?;
    let session_key = display.take_pending_session_key();
    let username = identity.name.clone();
    display.start_user_session(identity, session_key).await?;

    let argv = resolve_session_argv(ctx, seat_config, display.user_session_key())?;
    display.launch_user_session(&argv, seat_name)?;
    publish_summary(ctx, seat_name, seat, Some(username)).await;

    watch_user_session(active_display(seat)?, commands).await
}

async fn drive_direct_login(
    ctx: &Arc<DaemonContext>,
    seat: &mut Seat,
    seat_config: &SeatDefaultsConfig,
    seat_name: &str,
    identity: Identity,
    session_key: Option<String>,
    commands: &mut mpsc::Receiver<SeatCommand>,
) -> Result<DriveOutcome> {
    let username = identity.name.clone();
    let display = active_display(seat)?;
    display.start_user_session(identity, session_key).await?;
    let argv = resolve_session_argv(ctx, seat_config, display.user_session_key())?;
    display.launch_user_session(&argv, seat_name)?;
    publish_summary(ctx, seat_name, seat, Some(username)).await;

    watch_user_session(active_display(seat)?, commands).await
}

async fn watch_user_session(display: &mut Display, commands: &mut mpsc::Receiver<SeatCommand>) -> Result<DriveOutcome> {
    loop {
        tokio::select! {
            event = display.next_event() => {
                match event? {
                    display::DisplayEvent::UserSessionExited(outcome) => return Ok(DriveOutcome::Finished(outcome)),
                    display::DisplayEvent::ServerDied => {
                        let outcome = display.stop().await?;
                        return Ok(DriveOutcome::Finished(outcome));
                    }
                    _ => unreachable!("only server/session exit events fire once a user session is running"),
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(SeatCommand::Lock) => {
                        tracing::info!(display = %display.name, "lock requested (no session-lock integration yet)");
                    }
                    Some(other) => {
                        let outcome = display.stop().await?;
                        if let Some(target) = target_from_command(other) {
                            return Ok(DriveOutcome::SwitchRequested(target));
                        }
                        return Ok(DriveOutcome::Finished(outcome));
                    }
                    None => {
                        let outcome = display.stop().await?;
                        return Ok(DriveOutcome::Finished(outcome));
                    }
                }
            }
        }
    }
}

fn active_display(seat: &mut Seat) -> Result<&mut Display> {
    seat.active_display_mut()
        .ok_or_else(|| Error::Spawn("seat has no active display".into()))
}

fn resolve_greeter_identity(seat_config: &SeatDefaultsConfig) -> Result<Identity> {
    let _ = seat_config;
    display::resolve_identity("lightdm").or_else(|_| {
        Ok(Identity {
            uid: 0,
            gid: 0,
            name: "lightdm".to_string(),
            home: PathBuf::from("/var/lib/lightdm"),
            shell: "/bin/false".to_string(),
        })
    })
}

fn resolve_greeter_argv(ctx: &DaemonContext, seat_config: &SeatDefaultsConfig) -> Result<Vec<String>> {
    let greeters = SessionDescriptor::load_directory(&ctx.config.lightdm.greeters_directory);
    let descriptor = seat_config
        .greeter_session
        .as_deref()
        .and_then(|key| greeters.iter().find(|d| d.key == key))
        .or_else(|| greeters.first())
        .ok_or_else(|| Error::Config("no greeter sessions available".into()))?;
    Ok(descriptor.argv())
}

fn resolve_session_argv(ctx: &DaemonContext, seat_config: &SeatDefaultsConfig, session_key: Option<&str>) -> Result<Vec<String>> {
    let sessions = SessionDescriptor::load_directory(&ctx.config.lightdm.sessions_directory);
    let descriptor = session_key
        .and_then(|key| sessions.iter().find(|d| d.key == key))
        .or_else(|| sessions.first())
        .ok_or_else(|| Error::Spawn("no session descriptors available".into()))?;

    let mut argv = Vec::new();
    if let Some(wrapper) = &seat_config.session_wrapper {
        argv.push(wrapper.clone());
    }
    argv.extend(descriptor.argv());
    Ok(argv)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seat_names_defaults_to_seat0_when_unconfigured() {
        let config = Config::parse("[LightDM]\nminimum-vt=7\n").unwrap();
        assert_eq!(seat_names(&config), vec!["seat0".to_string()]);
    }

    #[test]
    fn seat_names_reflects_configured_overrides() {
        let config = Config::parse("[Seat:seat1]\nautologin-user=bob\n").unwrap();
        assert_eq!(seat_names(&config), vec!["seat1".to_string()]);
    }

    #[test]
    fn target_from_lock_command_is_none() {
        assert!(target_from_command(SeatCommand::Lock).is_none());
    }

    #[test]
    fn target_from_switch_to_user_carries_the_session_choice() {
        let target = target_from_command(SeatCommand::SwitchToUser("bob".into(), Some("gnome".into())));
        assert!(matches!(target, Some(Target::User(u, Some(s))) if u == "bob" && s == "gnome"));
    }
}
