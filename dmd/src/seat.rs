//! A Seat is one workstation: an ordered list of Displays, at most one of
//! them active, plus the switching policy between them. Crash-loop
//! protection lives here because it's a property of the seat's history,
//! not of any single Display.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::display::{Display, Outcome as DisplayOutcome};
use crate::error::{Error, Result};

const CRASH_WINDOW: Duration = Duration::from_secs(60);
const CRASH_LIMIT: usize = 3;

pub struct Seat {
    pub name: String,
    displays: Vec<Display>,
    active: Option<usize>,
    switching: bool,
    crash_times: VecDeque<Instant>,
    stopped: bool,
}

impl Seat {
    pub fn new(name: String) -> Seat {
        Seat {
            name,
            displays: Vec::new(),
            active: None,
            switching: false,
            crash_times: VecDeque::new(),
            stopped: false,
        }
    }

    pub fn push_display(&mut self, display: Display) -> usize {
        self.displays.push(display);
        self.displays.len() - 1
    }

    /// Drops every previously tracked Display once its lifecycle is over.
    /// Only one Display is ever live at a time in the current driving
    /// loop, so without this the Vec would grow for as long as the seat
    /// keeps cycling greeters and sessions.
    pub fn clear_displays(&mut self) {
        self.displays.clear();
        self.active = None;
    }

    pub fn active_display(&self) -> Option<&Display> {
        self.active.and_then(|i| self.displays.get(i))
    }

    pub fn active_display_mut(&mut self) -> Option<&mut Display> {
        self.active.and_then(move |i| self.displays.get_mut(i))
    }

    pub fn set_active(&mut self, index: usize) -> Result<()> {
        if index >= self.displays.len() {
            return Err(Error::Spawn(format!("no such display index {}", index)));
        }
        self.active = Some(index);
        Ok(())
    }

    /// Begins a switch operation. Concurrent switches are rejected rather
    /// than queued here — the caller (DaemonRoot's D-Bus handler) is
    /// expected to serialize requests per seat itself via a FIFO queue;
    /// this just enforces "only one in flight" as a last line of defense.
    pub fn begin_switch(&mut self) -> Result<()> {
        if self.switching {
            return Err(Error::Spawn(format!("seat {} is already mid-switch", self.name)));
        }
        self.switching = true;
        Ok(())
    }

    pub fn end_switch(&mut self) {
        self.switching = false;
    }

    /// Records a user-session crash and reports whether the seat should
    /// now be stopped entirely (3 crashes within 60s).
    pub fn record_user_session_crash(&mut self) -> bool {
        let now = Instant::now();
        self.crash_times.push_back(now);
        while let Some(&front) = self.crash_times.front() {
            if now.duration_since(front) > CRASH_WINDOW {
                self.crash_times.pop_front();
            } else {
                break;
            }
        }
        if self.crash_times.len() >= CRASH_LIMIT {
            self.stopped = true;
            tracing::error!(seat = %self.name, "crash-loop detected, stopping seat");
            true
        } else {
            false
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Handles a user session exit reported by the owning Display: tears
    /// down the Display, records the crash, and decides whether the seat
    /// should launch a fresh greeter or stop outright.
    pub async fn handle_display_outcome(&mut self, index: usize, outcome: DisplayOutcome) -> bool {
        match outcome {
            DisplayOutcome::UserSessionCrashed => self.record_user_session_crash(),
            DisplayOutcome::Stopped => false,
        }
        .then(|| {
            tracing::warn!(seat = %self.name, display = index, "seat stopped after repeated crashes");
        });
        self.is_stopped()
    }

    pub async fn stop(&mut self) -> Result<()> {
        for display in &mut self.displays {
            let _ = display.stop().await;
        }
        self.stopped = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn third_crash_within_window_stops_the_seat() {
        let mut seat = Seat::new("seat0".into());
        assert!(!seat.record_user_session_crash());
        assert!(!seat.record_user_session_crash());
        assert!(seat.record_user_session_crash());
        assert!(seat.is_stopped());
    }

    #[test]
    fn only_one_switch_may_be_in_flight() {
        let mut seat = Seat::new("seat0".into());
        seat.begin_switch().unwrap();
        assert!(seat.begin_switch().is_err());
        seat.end_switch();
        seat.begin_switch().unwrap();
    }
}
