//! Capture engine boundary
//!
//! The session owns one `CaptureEngine` for its whole lifetime and is the
//! only component allowed to start/stop it. The trait mirrors what the
//! controller needs from a pixel source and nothing more; `screens`
//! provides the production adapter.

pub mod screens;

use thiserror::Error;

use crate::frame::Frame;
use crate::geometry::{Rect, ScreenId};

pub use screens::ScreensEngine;

/// Capture engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("capture region not configured")]
    NotConfigured,

    #[error("engine not running")]
    NotRunning,

    #[error("screen {0:?} not found")]
    ScreenNotFound(ScreenId),

    #[error("capture failed: {0}")]
    Capture(String),
}

/// Contract for the pixel source the session drives.
///
/// All methods are called from the session's control task only; the grab in
/// `capture_frame` is expected to return promptly (the probe is the only
/// operation in the system allowed to block for a while).
pub trait CaptureEngine: Send {
    /// Configure the region to capture. Returns false when the region is
    /// unusable (empty, off-screen).
    fn set_region(&mut self, region: Rect, screen: ScreenId) -> bool;

    /// Begin capturing. Returns false when the backend cannot start.
    fn start(&mut self) -> bool;

    /// Stop capturing and release backend resources. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Windows that must not appear in captured frames (typically the
    /// controlling app's own UI).
    fn set_excluded_windows(&mut self, ids: &[String]);

    /// Grab one frame of the configured region.
    fn capture_frame(&mut self) -> Result<Frame, EngineError>;
}
