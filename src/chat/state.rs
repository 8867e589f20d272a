//! Device session state machine.
//!
//! ```text
//! initial → connected → active ↔ idle → closing → closed
//! ```
//!
//! Any state can jump to closing: goodbye, transport error, manager kick,
//! or replacement by a duplicate registration.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initial,
    Connected,
    Active,
    Idle,
    Closing,
    Closed,
}

/// Outcome of a periodic tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    WentIdle,
    ShouldClose,
}

#[derive(Debug)]
pub struct PhaseTracker {
    phase: SessionPhase,
    last_activity: Instant,
    idle_window: Duration,
    close_window: Duration,
}

impl PhaseTracker {
    pub fn new(idle_window: Duration, close_window: Duration) -> Self {
        Self {
            phase: SessionPhase::Initial,
            last_activity: Instant::now(),
            idle_window,
            close_window,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Transport accepted and session registered.
    pub fn on_transport_accepted(&mut self) {
        if self.phase == SessionPhase::Initial {
            self.phase = SessionPhase::Connected;
        }
    }

    /// First successfully parsed command activates the session; later
    /// commands refresh activity and pull an idle session back.
    pub fn on_command(&mut self) {
        self.last_activity = Instant::now();
        match self.phase {
            SessionPhase::Connected | SessionPhase::Idle => self.phase = SessionPhase::Active,
            _ => {}
        }
    }

    /// Audio refreshes activity and wakes an idle session.
    pub fn on_audio(&mut self) {
        self.last_activity = Instant::now();
        match self.phase {
            SessionPhase::Connected | SessionPhase::Idle => self.phase = SessionPhase::Active,
            _ => {}
        }
    }

    /// Periodic idle accounting.
    pub fn tick(&mut self) -> TickOutcome {
        let quiet = self.last_activity.elapsed();
        match self.phase {
            SessionPhase::Active if quiet >= self.idle_window => {
                self.phase = SessionPhase::Idle;
                TickOutcome::WentIdle
            }
            SessionPhase::Idle | SessionPhase::Connected if quiet >= self.close_window => {
                TickOutcome::ShouldClose
            }
            _ => TickOutcome::Unchanged,
        }
    }

    /// Enter teardown. Idempotent; a closed session stays closed.
    pub fn begin_close(&mut self) {
        if self.phase != SessionPhase::Closed {
            self.phase = SessionPhase::Closing;
        }
    }

    /// Observers drained, transport released.
    pub fn finish_close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed)
    }

    #[cfg(test)]
    fn force_quiet_for(&mut self, quiet: Duration) {
        self.last_activity = Instant::now() - quiet;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PhaseTracker {
        PhaseTracker::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = tracker();
        assert_eq!(t.phase(), SessionPhase::Initial);
        t.on_transport_accepted();
        assert_eq!(t.phase(), SessionPhase::Connected);
        t.on_command();
        assert_eq!(t.phase(), SessionPhase::Active);
        t.begin_close();
        assert_eq!(t.phase(), SessionPhase::Closing);
        t.finish_close();
        assert_eq!(t.phase(), SessionPhase::Closed);
    }

    #[test]
    fn active_goes_idle_and_back() {
        let mut t = tracker();
        t.on_transport_accepted();
        t.on_command();
        t.force_quiet_for(Duration::from_secs(61));
        assert_eq!(t.tick(), TickOutcome::WentIdle);
        assert_eq!(t.phase(), SessionPhase::Idle);

        t.on_audio();
        assert_eq!(t.phase(), SessionPhase::Active);
    }

    #[test]
    fn long_idle_requests_close() {
        let mut t = tracker();
        t.on_transport_accepted();
        t.on_command();
        t.force_quiet_for(Duration::from_secs(61));
        assert_eq!(t.tick(), TickOutcome::WentIdle);
        t.force_quiet_for(Duration::from_secs(301));
        assert_eq!(t.tick(), TickOutcome::ShouldClose);
    }

    #[test]
    fn close_from_any_state() {
        let mut t = tracker();
        t.begin_close();
        assert!(t.is_terminal());
        t.finish_close();
        t.begin_close();
        assert_eq!(t.phase(), SessionPhase::Closed);
    }
}
