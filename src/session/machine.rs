//! Session state machine pieces
//!
//! The mode ladder, the per-tick phase, and the counter bookkeeping the
//! runner consults. Decision helpers are pure so the escalation policy is
//! testable without timers.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Capture mode ladder. Trust in automation only ever walks down
/// (Auto -> Hybrid -> Manual); climbing back up requires a fresh probe via
/// `start_auto_assist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// The user scrolls; the session only observes and commits frames
    Manual,
    /// Automation is advisory: no stepping, observation still runs
    Hybrid,
    /// The session drives scroll steps itself. `synthetic` is set when
    /// motion comes from injected input events rather than API scrolling.
    Auto { synthetic: bool },
}

impl Mode {
    pub fn is_auto(&self) -> bool {
        matches!(self, Mode::Auto { .. })
    }

    /// One rung down the escalation ladder. Manual is the floor.
    pub fn demoted(self) -> Mode {
        match self {
            Mode::Auto { .. } => Mode::Hybrid,
            Mode::Hybrid => Mode::Manual,
            Mode::Manual => Mode::Manual,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Mode::Manual => "manual",
            Mode::Hybrid => "hybrid",
            Mode::Auto { synthetic: false } => "auto",
            Mode::Auto { synthetic: true } => "auto_synthetic",
        }
    }
}

/// What the session loop is doing between events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Observing ticks only (Manual/Hybrid, or Auto right after a demotion)
    Idle,
    /// Auto: a step is scheduled
    AwaitingStep { due_at: Instant },
    /// Auto: a step went out, waiting for frames to stop moving
    Settling {
        deadline: Instant,
        /// Consecutive good tick-to-tick comparisons so far
        stable: u32,
        /// The one allowed settle-timeout retry has been used
        retried: bool,
    },
}

/// Session counters. Reset rules follow the frame-quality invariants:
/// a Good/Partial observation always clears the bad streak.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    /// Accepted frames (the session's frame_count)
    pub frames_committed: u32,
    pub consecutive_bad: u32,
    pub consecutive_stable: u32,
    pub consecutive_no_change: u32,
    pub consecutive_end_reached: u32,
    pub scroll_attempts: u32,
    /// Capture ticks handled since start (drives the startup window)
    pub ticks_observed: u32,
}

impl Counters {
    /// A Good/Partial frame was observed or committed
    pub fn record_good(&mut self) {
        self.consecutive_bad = 0;
    }

    pub fn record_bad(&mut self) -> u32 {
        self.consecutive_bad += 1;
        self.consecutive_stable = 0;
        self.consecutive_bad
    }

    pub fn record_commit(&mut self) {
        self.frames_committed += 1;
        self.consecutive_bad = 0;
        self.consecutive_no_change = 0;
        self.consecutive_end_reached = 0;
    }

    pub fn reset_motion_tracking(&mut self) {
        self.consecutive_no_change = 0;
        self.consecutive_end_reached = 0;
    }
}

/// First N tick frames form the startup window in which two Bad frames
/// mean the capture itself is garbage
pub(crate) const STARTUP_WINDOW_TICKS: u32 = 2;

/// Consecutive bad signals that trigger the escalation ladder
pub(crate) const BAD_SIGNAL_LIMIT: u32 = 2;

/// What a bad signal (Bad frame or failed step) should do to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BadSignalOutcome {
    /// Keep going; discard the frame
    Tolerate,
    /// Walk one rung down the ladder
    Demote(Mode),
    /// The capture is garbage; abort the session
    Fail,
}

/// Escalation policy for accumulated bad signals.
///
/// Inside the startup window a double-bad means the capture itself cannot
/// be trusted: fatal in Manual, one-rung demotion when automation still has
/// a say (Auto keeps the session alive as Hybrid; Hybrid surrenders to
/// Manual). Past startup, Manual bad frames are merely discarded while
/// Auto/Hybrid still demote.
pub(crate) fn decide_bad_signal(
    mode: Mode,
    ticks_observed: u32,
    consecutive_bad: u32,
) -> BadSignalOutcome {
    if consecutive_bad < BAD_SIGNAL_LIMIT {
        return BadSignalOutcome::Tolerate;
    }
    if ticks_observed <= STARTUP_WINDOW_TICKS && mode == Mode::Manual {
        return BadSignalOutcome::Fail;
    }
    match mode {
        Mode::Manual => BadSignalOutcome::Tolerate,
        other => BadSignalOutcome::Demote(other.demoted()),
    }
}

/// Whether the capture-tick timer has stalled past the watchdog bound
pub(crate) fn tick_timer_stalled(last_tick: Instant, now: Instant, bound: Duration) -> bool {
    now.saturating_duration_since(last_tick) > bound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_walks_down_and_stops() {
        let auto = Mode::Auto { synthetic: false };
        assert_eq!(auto.demoted(), Mode::Hybrid);
        assert_eq!(Mode::Hybrid.demoted(), Mode::Manual);
        assert_eq!(Mode::Manual.demoted(), Mode::Manual);
        assert_eq!(Mode::Auto { synthetic: true }.demoted(), Mode::Hybrid);
    }

    #[test]
    fn test_single_bad_signal_tolerated_everywhere() {
        for mode in [
            Mode::Manual,
            Mode::Hybrid,
            Mode::Auto { synthetic: false },
        ] {
            assert_eq!(decide_bad_signal(mode, 1, 1), BadSignalOutcome::Tolerate);
        }
    }

    #[test]
    fn test_startup_double_bad_fails_manual() {
        assert_eq!(decide_bad_signal(Mode::Manual, 2, 2), BadSignalOutcome::Fail);
    }

    #[test]
    fn test_startup_double_bad_demotes_auto_to_hybrid() {
        assert_eq!(
            decide_bad_signal(Mode::Auto { synthetic: false }, 2, 2),
            BadSignalOutcome::Demote(Mode::Hybrid)
        );
    }

    #[test]
    fn test_startup_double_bad_demotes_hybrid_to_manual() {
        assert_eq!(
            decide_bad_signal(Mode::Hybrid, 2, 2),
            BadSignalOutcome::Demote(Mode::Manual)
        );
    }

    #[test]
    fn test_late_double_bad_tolerated_in_manual() {
        assert_eq!(
            decide_bad_signal(Mode::Manual, 40, 2),
            BadSignalOutcome::Tolerate
        );
    }

    #[test]
    fn test_late_double_bad_still_demotes_auto() {
        assert_eq!(
            decide_bad_signal(Mode::Auto { synthetic: true }, 40, 3),
            BadSignalOutcome::Demote(Mode::Hybrid)
        );
    }

    #[test]
    fn test_counter_reset_rules() {
        let mut c = Counters::default();
        c.record_bad();
        c.record_bad();
        assert_eq!(c.consecutive_bad, 2);
        c.record_good();
        assert_eq!(c.consecutive_bad, 0);

        c.consecutive_no_change = 3;
        c.consecutive_end_reached = 2;
        c.record_commit();
        assert_eq!(c.frames_committed, 1);
        assert_eq!(c.consecutive_no_change, 0);
        assert_eq!(c.consecutive_end_reached, 0);
    }

    #[test]
    fn test_mode_serde_shape() {
        let json = serde_json::to_string(&Mode::Auto { synthetic: true }).unwrap();
        assert_eq!(json, "{\"auto\":{\"synthetic\":true}}");
        assert_eq!(serde_json::to_string(&Mode::Manual).unwrap(), "\"manual\"");
    }

    #[test]
    fn test_tick_timer_stall_detection() {
        let start = Instant::now();
        assert!(!tick_timer_stalled(start, start, Duration::from_millis(100)));
        assert!(tick_timer_stalled(
            start,
            start + Duration::from_millis(101),
            Duration::from_millis(100)
        ));
    }
}
