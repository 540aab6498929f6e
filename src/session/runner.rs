//! The session control task
//!
//! One tokio task owns the engine, the driver, and every timer. All
//! stimuli (caller commands, capture ticks, watchdog ticks, probe sweep
//! results) arrive through one `select!`, so step calls are never
//! concurrent and tick routing (settle counting vs. new-step logic) is
//! deterministic. Cancellation is a token raced ahead of everything else.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::machine::{
    decide_bad_signal, tick_timer_stalled, BadSignalOutcome, Counters, Mode, Phase,
};
use super::probe::{probe_grid, run_probe_sweep, ProbeSweepOutcome};
use super::{CaptureTarget, Command, FailureReason, SharedState};
use crate::config::Config;
use crate::driver::{AutomationDriver, ProbeMode, StepStatus};
use crate::engine::CaptureEngine;
use crate::events::{record_timeline, record_timeline_detailed, SessionNotification, TimelineKind};
use crate::frame::Frame;
use crate::stability::{StabilityDetector, Verdict};
use crate::utils::current_timestamp;

/// Pause between first-frame retry attempts during startup
const STARTUP_RETRY_MS: u64 = 20;

/// Whether the event loop should keep going after a handler
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Ended,
}

pub(crate) struct SessionRunner {
    config: Config,
    target: CaptureTarget,
    engine: Box<dyn CaptureEngine>,
    driver: Arc<dyn AutomationDriver>,
    detector: StabilityDetector,
    notifications: mpsc::UnboundedSender<SessionNotification>,
    cancel: CancellationToken,
    shared: Arc<SharedState>,

    mode: Mode,
    phase: Phase,
    counters: Counters,
    accepted: Vec<Frame>,
    last_committed: Option<Frame>,
    /// Previous settle-phase tick frame (pairwise comparison anchor)
    settle_anchor: Option<Frame>,
    /// Last time the capture tick handler ran (watchdog observation)
    last_tick_at: Instant,
    probe_in_flight: bool,
    /// Unix seconds when startup completed
    started_at: u64,
}

impl SessionRunner {
    pub(crate) fn new(
        config: Config,
        target: CaptureTarget,
        engine: Box<dyn CaptureEngine>,
        driver: Arc<dyn AutomationDriver>,
        notifications: mpsc::UnboundedSender<SessionNotification>,
        cancel: CancellationToken,
        shared: Arc<SharedState>,
    ) -> Self {
        let detector = StabilityDetector::new(&config);
        Self {
            config,
            target,
            engine,
            driver,
            detector,
            notifications,
            cancel,
            shared,
            mode: Mode::Manual,
            phase: Phase::Idle,
            counters: Counters::default(),
            accepted: Vec::new(),
            last_committed: None,
            settle_anchor: None,
            last_tick_at: Instant::now(),
            probe_in_flight: false,
            started_at: 0,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let cancel = self.cancel.clone();

        // Wait for start() before touching the engine
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.teardown_cancelled().await;
                    return;
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Start) => break,
                    Some(other) => debug!("Ignoring {:?} before start", other),
                    None => {
                        self.teardown_cancelled().await;
                        return;
                    }
                }
            }
        }

        if self.startup().await == Flow::Ended {
            return;
        }

        let tick_period = Duration::from_millis(self.config.capture_tick_ms);
        let mut tick = time::interval_at(Instant::now() + tick_period, tick_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let watchdog_period = Duration::from_millis(self.config.watchdog_timeout_ms);
        let mut watchdog = time::interval_at(Instant::now() + watchdog_period, watchdog_period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
        self.last_tick_at = Instant::now();

        loop {
            let flow = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.teardown_cancelled().await;
                    return;
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd, &probe_tx).await,
                    None => {
                        // Every handle is gone; nobody can finish us anymore
                        self.teardown_cancelled().await;
                        return;
                    }
                },
                Some(outcome) = probe_rx.recv() => self.on_probe_outcome(outcome).await,
                _ = tick.tick() => self.on_capture_tick().await,
                _ = watchdog.tick() => self.on_watchdog_tick(&mut tick),
            };
            if flow == Flow::Ended {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Configure the engine and acquire the first frame within the startup
    /// bound. The first frame seeds the accepted sequence.
    async fn startup(&mut self) -> Flow {
        if !self.engine.set_region(self.target.region, self.target.screen) {
            return self.fail(FailureReason::RegionRejected).await;
        }
        self.engine
            .set_excluded_windows(&self.target.excluded_windows);
        if !self.engine.start() {
            return self.fail(FailureReason::EngineStartFailed).await;
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.started_at = current_timestamp();
        record_timeline(
            TimelineKind::Lifecycle,
            "Session started",
            Some(format!("region {:?}", self.target.region)),
            None,
        );

        let deadline = Instant::now() + Duration::from_millis(self.config.startup_timeout_ms);
        let first = loop {
            match self.engine.capture_frame() {
                Ok(frame) => break frame,
                Err(e) => {
                    if Instant::now() >= deadline {
                        warn!("No first frame within startup bound: {}", e);
                        return self.fail(FailureReason::StartupTimeout).await;
                    }
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            self.teardown_cancelled().await;
                            return Flow::Ended;
                        }
                        _ = time::sleep(Duration::from_millis(STARTUP_RETRY_MS)) => {}
                    }
                }
            }
        };

        info!(
            "First frame acquired ({}x{})",
            first.width(),
            first.height()
        );
        self.accepted.push(first.clone());
        self.last_committed = Some(first);
        self.counters.frames_committed = 1;
        self.set_mode(Mode::Manual, true);
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    async fn on_command(
        &mut self,
        cmd: Command,
        probe_tx: &mpsc::UnboundedSender<ProbeSweepOutcome>,
    ) -> Flow {
        match cmd {
            Command::Start => {
                debug!("start() on an already-running session, ignoring");
                Flow::Continue
            }
            Command::StartAutoAssist => {
                self.begin_probe(probe_tx);
                Flow::Continue
            }
            Command::InterruptAuto => {
                if self.mode == Mode::Manual {
                    debug!("interrupt_auto() in Manual is a no-op");
                    return Flow::Continue;
                }
                let next = self.mode.demoted();
                info!("Automation interrupted: {} -> {}", self.mode.label(), next.label());
                record_timeline(
                    TimelineKind::Escalation,
                    format!("Interrupted to {}", next.label()),
                    None,
                    None,
                );
                self.set_mode(next, false);
                self.phase = Phase::Idle;
                self.settle_anchor = None;
                Flow::Continue
            }
            Command::Finish => self.finish().await,
        }
    }

    fn begin_probe(&mut self, probe_tx: &mpsc::UnboundedSender<ProbeSweepOutcome>) {
        if self.probe_in_flight {
            debug!("Probe sweep already in flight, ignoring");
            return;
        }
        if self.mode.is_auto() {
            debug!("start_auto_assist() while already in Auto, ignoring");
            return;
        }

        let points = probe_grid(
            self.target.region,
            self.config.probe_grid_density,
            self.config.ignore_bottom_edge,
        );
        info!("Starting capability sweep over {} points", points.len());
        record_timeline(
            TimelineKind::Probe,
            format!("Capability sweep started ({} points)", points.len()),
            None,
            None,
        );

        self.probe_in_flight = true;
        tokio::spawn(run_probe_sweep(
            self.driver.clone(),
            points,
            self.target.screen,
            self.cancel.clone(),
            probe_tx.clone(),
        ));
    }

    async fn on_probe_outcome(&mut self, outcome: ProbeSweepOutcome) -> Flow {
        self.probe_in_flight = false;
        match outcome {
            ProbeSweepOutcome::Usable(result) if result.mode == ProbeMode::Auto => {
                record_timeline(
                    TimelineKind::Probe,
                    "Probe reported full automation",
                    Some(result.reason.clone()),
                    None,
                );
                // Fresh driver tracking on every transition into Auto
                self.driver.reset().await;
                if result.focus_recommended && !self.driver.focus_target().await {
                    warn!("Focus recommendation could not be honored");
                }
                self.counters.reset_motion_tracking();
                self.set_mode(Mode::Auto { synthetic: false }, false);
                self.phase = Phase::AwaitingStep {
                    due_at: Instant::now() + Duration::from_millis(self.config.auto_step_delay_ms),
                };
                Flow::Continue
            }
            ProbeSweepOutcome::Usable(result) => {
                // Injection-only capability is advisory, never trusted with
                // the step loop
                record_timeline(
                    TimelineKind::Probe,
                    "Probe reported synthetic-only automation",
                    Some(result.reason.clone()),
                    None,
                );
                self.set_mode(Mode::Hybrid, false);
                Flow::Continue
            }
            ProbeSweepOutcome::Exhausted {
                attempts,
                last_reason,
            } => {
                info!(
                    "Capability sweep exhausted after {} probes: {}",
                    attempts, last_reason
                );
                record_timeline(
                    TimelineKind::Probe,
                    "Capability sweep exhausted",
                    Some(last_reason),
                    None,
                );
                Flow::Continue
            }
            ProbeSweepOutcome::Cancelled => Flow::Continue,
        }
    }

    async fn on_capture_tick(&mut self) -> Flow {
        self.last_tick_at = Instant::now();
        match self.phase {
            Phase::Settling { .. } => self.settle_tick().await,
            Phase::AwaitingStep { due_at } if self.mode.is_auto() && Instant::now() >= due_at => {
                self.step_tick().await
            }
            _ => self.observe_tick().await,
        }
    }

    fn on_watchdog_tick(&mut self, tick: &mut Interval) -> Flow {
        let bound = Duration::from_millis(self.config.watchdog_timeout_ms);
        if tick_timer_stalled(self.last_tick_at, Instant::now(), bound) {
            warn!(
                "Capture tick stalled for more than {:?}, restarting timer",
                bound
            );
            *tick = time::interval(Duration::from_millis(self.config.capture_tick_ms));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            record_timeline(
                TimelineKind::Watchdog,
                "Capture tick timer restarted",
                None,
                Some("watchdog_restart".to_string()),
            );
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Tick routing
    // ------------------------------------------------------------------

    /// Manual/Hybrid observation (and Auto between steps): classify the
    /// frame against the last committed one and commit real motion.
    async fn observe_tick(&mut self) -> Flow {
        let frame = match self.engine.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Capture failed on tick: {}", e);
                self.counters.record_bad();
                return self.apply_bad_signal().await;
            }
        };
        self.counters.ticks_observed += 1;

        let previous = self
            .last_committed
            .clone()
            .expect("observation requires a committed frame");
        let c = self.detector.classify(&previous, &frame);

        if c.is_no_change(self.config.no_change_epsilon) {
            // Steady content; nothing to commit, nothing to worry about
            self.counters.record_good();
            return Flow::Continue;
        }

        match c.verdict {
            Verdict::Good | Verdict::Partial => self.commit_frame(frame, c.score).await,
            Verdict::Bad => {
                debug!("Bad tick frame (score {:.3}), discarding", c.score);
                self.counters.record_bad();
                self.apply_bad_signal().await
            }
        }
    }

    /// Auto: fire one scroll step and route its result.
    async fn step_tick(&mut self) -> Flow {
        if self.counters.scroll_attempts >= self.config.max_scroll_attempts {
            info!(
                "Scroll attempt cap ({}) reached, finishing",
                self.config.max_scroll_attempts
            );
            return self.finish().await;
        }
        self.counters.scroll_attempts += 1;

        let result = match self.driver.step().await {
            Ok(result) => result,
            Err(e) => {
                warn!("Scroll step failed: {}", e);
                self.counters.record_bad();
                let flow = self.apply_bad_signal().await;
                self.schedule_next_step();
                return flow;
            }
        };

        match result.status {
            StepStatus::Stepped => {
                if !result.target_locked {
                    warn!("Injected input landed on the wrong window, refocusing");
                    if !self.driver.focus_target().await {
                        debug!("focus_target() reported failure");
                    }
                    self.counters.record_bad();
                    let flow = self.apply_bad_signal().await;
                    self.schedule_next_step();
                    return flow;
                }
                if result.input_injected && self.mode == (Mode::Auto { synthetic: false }) {
                    // The driver degraded to injection on its own; surface it
                    self.set_mode(Mode::Auto { synthetic: true }, false);
                }
                self.settle_anchor = None;
                self.phase = Phase::Settling {
                    deadline: Instant::now()
                        + Duration::from_millis(self.config.settle_timeout_ms),
                    stable: 0,
                    retried: false,
                };
                Flow::Continue
            }
            StepStatus::EndReached => {
                self.counters.consecutive_end_reached += 1;
                debug!(
                    "Driver reported end of content ({}/{})",
                    self.counters.consecutive_end_reached, self.config.end_detection_threshold
                );
                if let Ok(frame) = self.engine.capture_frame() {
                    let previous = self.last_committed.clone().expect("committed frame");
                    let c = self.detector.classify(&previous, &frame);
                    if !c.is_no_change(self.config.no_change_epsilon) {
                        // Content still moved; the driver's end signal is
                        // not trustworthy yet
                        self.counters.consecutive_end_reached = 0;
                    }
                }
                if self.counters.consecutive_end_reached >= self.config.end_detection_threshold {
                    info!("End of content confirmed, finishing");
                    return self.finish().await;
                }
                self.schedule_next_step();
                Flow::Continue
            }
            StepStatus::Failed => {
                warn!("Driver could not deliver the step");
                self.counters.record_bad();
                let flow = self.apply_bad_signal().await;
                self.schedule_next_step();
                flow
            }
        }
    }

    /// Auto: a step is out; wait for consecutive near-identical tick
    /// frames before trusting one. Settle-timeout is evaluated before any
    /// no-motion accounting (fixed precedence).
    async fn settle_tick(&mut self) -> Flow {
        let Phase::Settling {
            deadline,
            stable,
            retried,
        } = self.phase
        else {
            return Flow::Continue;
        };

        if Instant::now() >= deadline {
            if !retried {
                info!("Settle window expired, retrying the step once");
                record_timeline(
                    TimelineKind::Escalation,
                    "Settle timeout, step retried",
                    None,
                    Some("settle_retry".to_string()),
                );
                self.counters.scroll_attempts += 1;
                let retry_ok = matches!(
                    self.driver.step().await,
                    Ok(r) if r.status == StepStatus::Stepped
                );
                if retry_ok {
                    self.settle_anchor = None;
                    self.phase = Phase::Settling {
                        deadline: Instant::now()
                            + Duration::from_millis(self.config.settle_timeout_ms),
                        stable: 0,
                        retried: true,
                    };
                    return Flow::Continue;
                }
                warn!("Settle retry step failed");
            } else {
                warn!("Still unsettled after retry");
            }
            self.counters.record_bad();
            let flow = self.apply_bad_signal().await;
            self.schedule_next_step();
            return flow;
        }

        let frame = match self.engine.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Capture failed during settle: {}", e);
                return Flow::Continue;
            }
        };
        self.counters.ticks_observed += 1;

        match self.settle_anchor.take() {
            None => {
                self.settle_anchor = Some(frame);
            }
            Some(previous) => {
                let c = self.detector.classify(&previous, &frame);
                if c.verdict == Verdict::Good {
                    let stable = stable + 1;
                    self.counters.consecutive_stable = stable;
                    self.settle_anchor = Some(frame.clone());
                    if stable >= self.config.settle_stable_frames {
                        return self.commit_settled(frame).await;
                    }
                    self.phase = Phase::Settling {
                        deadline,
                        stable,
                        retried,
                    };
                } else {
                    // Still rendering; start the stability count over
                    self.counters.consecutive_stable = 0;
                    self.settle_anchor = Some(frame);
                    self.phase = Phase::Settling {
                        deadline,
                        stable: 0,
                        retried,
                    };
                }
            }
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Commit & escalation
    // ------------------------------------------------------------------

    /// A settled frame: compare against the committed sequence tail and
    /// either commit it or feed the no-motion bookkeeping.
    async fn commit_settled(&mut self, frame: Frame) -> Flow {
        debug!(
            "Settled after {} stable comparisons",
            self.counters.consecutive_stable
        );
        self.counters.consecutive_stable = 0;
        self.settle_anchor = None;

        let previous = self.last_committed.clone().expect("committed frame");
        let c = self.detector.classify(&previous, &frame);

        if c.is_no_change(self.config.no_change_epsilon) {
            self.counters.record_good();
            self.counters.consecutive_no_change += 1;
            debug!(
                "Step produced no motion ({}/{})",
                self.counters.consecutive_no_change, self.config.end_detection_threshold
            );
            if self.counters.consecutive_no_change >= self.config.end_detection_threshold {
                return self.no_motion_escalation().await;
            }
            self.schedule_next_step();
            return Flow::Continue;
        }

        match c.verdict {
            Verdict::Good | Verdict::Partial => {
                let flow = self.commit_frame(frame, c.score).await;
                if flow == Flow::Ended {
                    return flow;
                }
                self.schedule_next_step();
                flow
            }
            Verdict::Bad => {
                debug!(
                    "Settled frame dissimilar from sequence tail (score {:.3}), discarding",
                    c.score
                );
                self.counters.record_bad();
                let flow = self.apply_bad_signal().await;
                self.schedule_next_step();
                flow
            }
        }
    }

    async fn commit_frame(&mut self, frame: Frame, score: f64) -> Flow {
        self.accepted.push(frame.clone());
        self.last_committed = Some(frame);
        self.counters.record_commit();
        debug!(
            "Committed frame #{} (score {:.3})",
            self.counters.frames_committed, score
        );
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("score".to_string(), serde_json::json!(score));
        record_timeline_detailed(
            TimelineKind::Commit,
            format!("Frame {} accepted", self.counters.frames_committed),
            None,
            None,
            metadata,
        );

        if self.counters.frames_committed >= self.config.max_frames {
            info!("Frame cap ({}) reached, finishing", self.config.max_frames);
            return self.finish().await;
        }
        Flow::Continue
    }

    /// Persistent no-motion in Auto: try the synthetic fallback first,
    /// then surrender one rung of trust.
    async fn no_motion_escalation(&mut self) -> Flow {
        self.counters.reset_motion_tracking();
        match self.mode {
            Mode::Auto { synthetic: false } => {
                if self.driver.force_synthetic_fallback().await {
                    info!("No motion observed; switched to synthetic injection");
                    record_timeline(
                        TimelineKind::Escalation,
                        "Synthetic fallback engaged",
                        None,
                        None,
                    );
                    self.set_mode(Mode::Auto { synthetic: true }, false);
                    self.schedule_next_step();
                } else {
                    warn!("No synthetic fallback available, demoting to Hybrid");
                    record_timeline(
                        TimelineKind::Escalation,
                        "No motion and no fallback, demoted to Hybrid",
                        None,
                        None,
                    );
                    self.set_mode(Mode::Hybrid, false);
                    self.phase = Phase::Idle;
                }
            }
            Mode::Auto { synthetic: true } => {
                warn!("Synthetic injection also produced no motion, demoting to Hybrid");
                record_timeline(
                    TimelineKind::Escalation,
                    "Synthetic injection ineffective, demoted to Hybrid",
                    None,
                    None,
                );
                self.set_mode(Mode::Hybrid, false);
                self.phase = Phase::Idle;
            }
            _ => {}
        }
        Flow::Continue
    }

    async fn apply_bad_signal(&mut self) -> Flow {
        match decide_bad_signal(
            self.mode,
            self.counters.ticks_observed,
            self.counters.consecutive_bad,
        ) {
            BadSignalOutcome::Tolerate => Flow::Continue,
            BadSignalOutcome::Demote(next) => {
                warn!(
                    "Repeated bad signals: {} -> {}",
                    self.mode.label(),
                    next.label()
                );
                record_timeline(
                    TimelineKind::Escalation,
                    format!("Bad signals demoted mode to {}", next.label()),
                    None,
                    None,
                );
                self.counters.consecutive_bad = 0;
                self.set_mode(next, false);
                if !next.is_auto() {
                    self.phase = Phase::Idle;
                    self.settle_anchor = None;
                }
                Flow::Continue
            }
            BadSignalOutcome::Fail => {
                warn!("First capture ticks are garbage, aborting");
                self.fail(FailureReason::UnusableCapture).await
            }
        }
    }

    fn schedule_next_step(&mut self) {
        if self.mode.is_auto() {
            self.phase = Phase::AwaitingStep {
                due_at: Instant::now() + Duration::from_millis(self.config.auto_step_delay_ms),
            };
        } else {
            self.phase = Phase::Idle;
        }
    }

    fn set_mode(&mut self, mode: Mode, force_notify: bool) {
        if self.mode == mode && !force_notify {
            return;
        }
        self.mode = mode;
        if let Ok(mut shared) = self.shared.mode.write() {
            *shared = mode;
        }
        record_timeline(
            TimelineKind::Mode,
            format!("Mode: {}", mode.label()),
            None,
            None,
        );
        let _ = self
            .notifications
            .send(SessionNotification::ModeChanged { mode });
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Single cleanup routine every exit path funnels through
    async fn release_resources(&mut self) {
        self.engine.stop();
        self.driver.reset().await;
        self.shared.running.store(false, Ordering::SeqCst);
    }

    async fn finish(&mut self) -> Flow {
        let frames = std::mem::take(&mut self.accepted);
        info!(
            "Session finished with {} accepted frames after {}s",
            frames.len(),
            current_timestamp().saturating_sub(self.started_at)
        );
        record_timeline(
            TimelineKind::Lifecycle,
            format!("Finished ({} frames)", frames.len()),
            None,
            None,
        );
        self.release_resources().await;
        let _ = self.notifications.send(SessionNotification::CaptureReady {
            frames,
            origin: self.target.region.origin(),
            region: self.target.region,
        });
        Flow::Ended
    }

    async fn fail(&mut self, reason: FailureReason) -> Flow {
        warn!("Session failed: {:?}", reason);
        record_timeline(
            TimelineKind::Lifecycle,
            format!("Failed: {:?}", reason),
            None,
            None,
        );
        self.release_resources().await;
        let _ = self
            .notifications
            .send(SessionNotification::Failed { reason });
        Flow::Ended
    }

    async fn teardown_cancelled(&mut self) {
        info!("Session cancelled");
        record_timeline(TimelineKind::Lifecycle, "Cancelled", None, None);
        self.release_resources().await;
        let _ = self.notifications.send(SessionNotification::Cancelled);
    }
}
