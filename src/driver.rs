//! Automation driver contract
//!
//! The capability boundary a platform-specific scroller implements:
//! probing a point for scrollability, executing one scroll increment,
//! focus recovery, and the degraded synthetic-injection fallback. The
//! session only ever talks to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::geometry::{Point, ScreenId};

/// How the driver can move the target, as reported by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// API/accessibility-driven scrolling is available
    Auto,
    /// Only injected input events would move the target
    AutoSynthetic,
    /// The point is not scrollable by any means the driver knows
    Unsupported,
}

/// Result of a capability probe at one point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollProbeResult {
    pub mode: ProbeMode,
    /// The point the driver anchored its scroll target to
    pub anchor: Point,
    /// Whether the target should be given input focus before stepping
    pub focus_recommended: bool,
    /// Free-text diagnostic for logs and the session timeline
    pub reason: String,
}

/// Outcome of one scroll step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step was delivered
    Stepped,
    /// The driver believes the content cannot scroll further
    EndReached,
    /// The step could not be delivered
    Failed,
}

/// Result of `AutomationDriver::step`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollStepResult {
    pub status: StepStatus,
    /// Driver's estimate of vertical content movement in pixels
    pub estimated_delta_y: i32,
    /// True when the motion came from injected input events rather than
    /// an observed API-driven scroll
    pub input_injected: bool,
    /// False when the injected input landed on the wrong window
    pub target_locked: bool,
}

impl ScrollStepResult {
    pub fn stepped(estimated_delta_y: i32) -> Self {
        Self {
            status: StepStatus::Stepped,
            estimated_delta_y,
            input_injected: false,
            target_locked: true,
        }
    }

    pub fn end_reached() -> Self {
        Self {
            status: StepStatus::EndReached,
            estimated_delta_y: 0,
            input_injected: false,
            target_locked: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            status: StepStatus::Failed,
            estimated_delta_y: 0,
            input_injected: false,
            target_locked: true,
        }
    }
}

/// Driver error types
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("probe failed: {0}")]
    Probe(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("automation not available: {0}")]
    Unavailable(String),
}

/// Capability contract for a platform scroller.
///
/// `probe_at` may block on accessibility queries; the session dispatches it
/// on its own task and drops the result if cancellation wins the race, so
/// implementations should still run blocking platform calls via
/// `spawn_blocking` to keep the runtime healthy. `step` is never invoked
/// concurrently with itself.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Ask whether the given point on the given screen supports automated
    /// scrolling, and by what means.
    async fn probe_at(&self, point: Point, screen: ScreenId)
        -> Result<ScrollProbeResult, DriverError>;

    /// Perform exactly one logical scroll increment.
    async fn step(&self) -> Result<ScrollStepResult, DriverError>;

    /// Try to give the scroll target input focus. Returns success.
    async fn focus_target(&self) -> bool;

    /// Switch to synthetic input injection. Returns false when no fallback
    /// strategy exists on this platform.
    async fn force_synthetic_fallback(&self) -> bool;

    /// Clear internal tracking so the next probe starts fresh.
    async fn reset(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_result_constructors() {
        let s = ScrollStepResult::stepped(-120);
        assert_eq!(s.status, StepStatus::Stepped);
        assert_eq!(s.estimated_delta_y, -120);
        assert!(s.target_locked);
        assert!(!s.input_injected);

        assert_eq!(ScrollStepResult::end_reached().status, StepStatus::EndReached);
        assert_eq!(ScrollStepResult::failed().status, StepStatus::Failed);
    }

    #[test]
    fn test_probe_mode_serde_names() {
        let json = serde_json::to_string(&ProbeMode::AutoSynthetic).unwrap();
        assert_eq!(json, "\"auto_synthetic\"");
    }
}
