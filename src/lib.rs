//! scrollshot - Closed-loop scrolling screenshot capture
//!
//! Drives an "infinite scroll" capture of a scrollable screen region by
//! alternating automated scroll steps with frame-stability analysis,
//! degrading gracefully from full automation down to user-driven scrolling
//! when the automation cannot be trusted.

// Core modules
pub mod config;
pub mod driver;
pub mod engine;
pub mod events;
pub mod frame;
pub mod geometry;
pub mod session;
pub mod stability;
pub mod utils;

// Re-export the surface most callers need
pub use config::{load_config, save_config, Config, ConfigError};
pub use driver::{
    AutomationDriver, DriverError, ProbeMode, ScrollProbeResult, ScrollStepResult, StepStatus,
};
pub use engine::{CaptureEngine, EngineError, ScreensEngine};
pub use events::{SessionNotification, TimelineEntry, TimelineKind};
pub use frame::Frame;
pub use geometry::{Point, Rect, ScreenId};
pub use session::{
    probe_grid, spawn_session, CaptureTarget, FailureReason, Mode, SessionHandle,
};
pub use stability::{Classification, StabilityDetector, Verdict};

/// Initialize logging for binaries embedding the controller.
/// `RUST_LOG` wins when set.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scrollshot=debug"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
