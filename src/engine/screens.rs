//! Screen capture engine using the screenshots crate

use screenshots::Screen;
use tracing::{debug, warn};

use super::{CaptureEngine, EngineError};
use crate::frame::Frame;
use crate::geometry::{Rect, ScreenId};

/// Region-capture engine backed by `screenshots::Screen`.
///
/// This backend cannot mask third-party windows out of the framebuffer;
/// `set_excluded_windows` is recorded so callers can hide their own UI for
/// the session's duration (the usual excluded window is the control bar of
/// the capturing app itself).
pub struct ScreensEngine {
    target: Option<(Rect, ScreenId)>,
    running: bool,
    excluded_windows: Vec<String>,
}

impl ScreensEngine {
    pub fn new() -> Self {
        Self {
            target: None,
            running: false,
            excluded_windows: Vec::new(),
        }
    }

    fn find_screen(id: ScreenId) -> Result<Screen, EngineError> {
        let screens = Screen::all().map_err(|e| EngineError::Capture(e.to_string()))?;
        screens
            .into_iter()
            .find(|s| s.display_info.id == id.0)
            .ok_or(EngineError::ScreenNotFound(id))
    }
}

impl Default for ScreensEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureEngine for ScreensEngine {
    fn set_region(&mut self, region: Rect, screen: ScreenId) -> bool {
        if region.is_empty() {
            warn!("Rejecting empty capture region {:?}", region);
            return false;
        }
        self.target = Some((region, screen));
        true
    }

    fn start(&mut self) -> bool {
        if self.target.is_none() {
            return false;
        }
        self.running = true;
        true
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn set_excluded_windows(&mut self, ids: &[String]) {
        if !ids.is_empty() {
            debug!("Excluded windows recorded (caller-side hiding): {:?}", ids);
        }
        self.excluded_windows = ids.to_vec();
    }

    fn capture_frame(&mut self) -> Result<Frame, EngineError> {
        let (region, screen_id) = self.target.ok_or(EngineError::NotConfigured)?;
        if !self.running {
            return Err(EngineError::NotRunning);
        }

        let screen = Self::find_screen(screen_id)?;

        // capture_area takes coordinates relative to the screen origin
        let rel_x = region.x - screen.display_info.x;
        let rel_y = region.y - screen.display_info.y;
        let image = screen
            .capture_area(rel_x, rel_y, region.width, region.height)
            .map_err(|e| EngineError::Capture(e.to_string()))?;

        let (width, height) = (image.width(), image.height());
        Frame::from_rgba(width, height, image.into_raw())
            .ok_or_else(|| EngineError::Capture("backend returned a malformed buffer".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_region() {
        let mut engine = ScreensEngine::new();
        assert!(!engine.set_region(Rect::new(0, 0, 0, 100), ScreenId(0)));
        assert!(engine.set_region(Rect::new(0, 0, 10, 10), ScreenId(0)));
    }

    #[test]
    fn test_start_requires_region() {
        let mut engine = ScreensEngine::new();
        assert!(!engine.start());
        engine.set_region(Rect::new(0, 0, 10, 10), ScreenId(0));
        assert!(engine.start());
        assert!(engine.is_running());
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_capture_without_start_errors() {
        let mut engine = ScreensEngine::new();
        engine.set_region(Rect::new(0, 0, 10, 10), ScreenId(0));
        assert!(matches!(
            engine.capture_frame(),
            Err(EngineError::NotRunning)
        ));
    }
}
