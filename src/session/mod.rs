//! Scroll capture session
//!
//! The orchestrator behind scrolling capture: owns the mode ladder, the
//! capture/settle/watchdog timers, the escalation policy, and the accepted
//! frame sequence. Spawn one with `spawn_session`, drive it through the
//! returned `SessionHandle`, and read outcomes off the notification
//! channel.

pub(crate) mod machine;
pub(crate) mod probe;
mod runner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Config, ConfigError};
use crate::driver::AutomationDriver;
use crate::engine::CaptureEngine;
use crate::events::SessionNotification;
use crate::geometry::{Rect, ScreenId};

pub use machine::Mode;
pub use probe::probe_grid;

/// Why a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No first frame arrived within the startup bound
    StartupTimeout,
    /// The engine rejected the capture region
    RegionRejected,
    /// The engine could not start
    EngineStartFailed,
    /// The very first capture ticks were garbage
    UnusableCapture,
}

/// What to capture: the region, the screen it lives on, and windows the
/// engine must keep out of frame (typically the caller's own control bar)
#[derive(Debug, Clone)]
pub struct CaptureTarget {
    pub region: Rect,
    pub screen: ScreenId,
    pub excluded_windows: Vec<String>,
}

impl CaptureTarget {
    pub fn new(region: Rect, screen: ScreenId) -> Self {
        Self {
            region,
            screen,
            excluded_windows: Vec::new(),
        }
    }
}

/// Commands the handle forwards into the control task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    StartAutoAssist,
    InterruptAuto,
    Finish,
}

/// State shared between the control task and handle queries
pub(crate) struct SharedState {
    pub(crate) mode: RwLock<Mode>,
    pub(crate) running: AtomicBool,
}

/// Caller-side handle to a running session. Cloneable; commands are
/// fire-and-forget and outcomes arrive on the notification channel.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    shared: Arc<SharedState>,
}

impl SessionHandle {
    /// Begin capturing: configure the engine and acquire the first frame.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Probe the region for automation capability and enter Auto/Hybrid
    /// when the driver reports something usable.
    pub fn start_auto_assist(&self) {
        self.send(Command::StartAutoAssist);
    }

    /// Walk one rung down the mode ladder without ending the session.
    pub fn interrupt_auto(&self) {
        self.send(Command::InterruptAuto);
    }

    /// Stop and emit the accepted frames. The only success path.
    pub fn finish(&self) {
        self.send(Command::Finish);
    }

    /// Tear the session down immediately, even mid-probe. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn mode(&self) -> Mode {
        self.shared
            .mode
            .read()
            .map(|m| *m)
            .unwrap_or(Mode::Manual)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn send(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!("Session is gone, dropping {:?}", cmd);
        }
    }
}

/// Validate the config and spawn the session control task. The session
/// waits for `start()`; every outcome arrives on the returned channel.
pub fn spawn_session(
    config: Config,
    target: CaptureTarget,
    engine: Box<dyn CaptureEngine>,
    driver: Arc<dyn AutomationDriver>,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionNotification>), ConfigError> {
    config.validate()?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let shared = Arc::new(SharedState {
        mode: RwLock::new(Mode::Manual),
        running: AtomicBool::new(false),
    });

    let runner = runner::SessionRunner::new(
        config,
        target,
        engine,
        driver,
        notify_tx,
        cancel.clone(),
        shared.clone(),
    );
    tokio::spawn(runner.run(command_rx));

    Ok((
        SessionHandle {
            commands: command_tx,
            cancel,
            shared,
        },
        notify_rx,
    ))
}
