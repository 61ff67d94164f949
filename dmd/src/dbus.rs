//! The `org.freedesktop.DisplayManager` object. Every method here does
//! nothing but translate a D-Bus call into a `SeatCommand` sent down the
//! target seat's channel, or a read of `DaemonContext::summaries` — the
//! replacement for what used to be reached through global singletons.

use std::sync::Arc;

use zbus::dbus_interface;

use crate::daemon::{self, DaemonContext, SeatCommand};
use crate::error::Error;

pub struct DisplayManager {
    ctx: Arc<DaemonContext>,
}

impl DisplayManager {
    pub fn new(ctx: Arc<DaemonContext>) -> DisplayManager {
        DisplayManager { ctx }
    }
}

fn to_dbus_error(e: Error) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[dbus_interface(name = "org.freedesktop.DisplayManager")]
impl DisplayManager {
    /// Tears down whatever is running on `seat` and brings the greeter
    /// back up.
    async fn switch_to_greeter(&self, seat: &str) -> zbus::fdo::Result<()> {
        self.ctx
            .dispatch(seat, SeatCommand::SwitchToGreeter)
            .await
            .map_err(to_dbus_error)
    }

    /// Switches `seat` directly to `username`'s session, bypassing the
    /// greeter. `session` selects a session key; empty means "use the
    /// user's saved default".
    async fn switch_to_user(&self, seat: &str, username: &str, session: &str) -> zbus::fdo::Result<()> {
        let session = if session.is_empty() { None } else { Some(session.to_string()) };
        self.ctx
            .dispatch(seat, SeatCommand::SwitchToUser(username.to_string(), session))
            .await
            .map_err(to_dbus_error)
    }

    /// Provisions a fresh guest account and switches `seat` to it.
    async fn switch_to_guest(&self, seat: &str, session: &str) -> zbus::fdo::Result<()> {
        let session = if session.is_empty() { None } else { Some(session.to_string()) };
        self.ctx
            .dispatch(seat, SeatCommand::SwitchToGuest(session))
            .await
            .map_err(to_dbus_error)
    }

    /// Requests the running session on `seat` lock its screen. Forwarded
    /// as-is; actually locking is the session's own responsibility.
    async fn lock(&self, seat: &str) -> zbus::fdo::Result<()> {
        self.ctx.dispatch(seat, SeatCommand::Lock).await.map_err(to_dbus_error)
    }

    /// Provisions a local X seat beyond what `lightdm.conf` declares,
    /// named after the next free dynamic slot. `vt` is advisory only —
    /// VT assignment is still arbitrated by the shared allocator.
    async fn add_local_x_seat(&self, vt: i32) -> zbus::fdo::Result<()> {
        self.ctx.add_local_x_seat(vt as u32).await.map(|_| ()).map_err(to_dbus_error)
    }

    /// Provisions a new seat named `type` with `properties` as
    /// `[Seat:<name>]`-style `key=value` overrides.
    async fn add_seat(&self, seat_type: &str, properties: Vec<(String, String)>) -> zbus::fdo::Result<()> {
        let overrides = daemon::parse_seat_overrides(&properties);
        self.ctx
            .add_seat(seat_type.to_string(), overrides)
            .await
            .map_err(to_dbus_error)
    }

    /// Names of every configured seat.
    #[dbus_interface(property)]
    async fn seats(&self) -> Vec<String> {
        self.ctx.seat_names().await
    }

    /// `seat=username` for every seat with an active user session, in
    /// the format `dmd-tool list-seats` and external tools both expect.
    #[dbus_interface(property)]
    async fn sessions(&self) -> Vec<String> {
        let summaries = self.ctx.summaries.lock().await;
        summaries
            .iter()
            .filter_map(|(seat, summary)| summary.active_user.as_ref().map(|user| format!("{}={}", seat, user)))
            .collect()
    }
}

/// Publishes the `DisplayManager` object on the system bus at
/// `/org/freedesktop/DisplayManager` and keeps the connection alive for
/// as long as the returned value is held.
pub async fn publish(ctx: Arc<DaemonContext>) -> zbus::Result<zbus::Connection> {
    let manager = DisplayManager::new(ctx);
    zbus::ConnectionBuilder::system()?
        .name("org.freedesktop.DisplayManager")?
        .serve_at("/org/freedesktop/DisplayManager", manager)?
        .build()
        .await
}
