//! Capability probing
//!
//! A single probe point can land on a non-scrollable sub-element of the
//! target window, so the session probes an NxN grid of interior points,
//! center first, until the driver reports something usable. The sweep runs
//! on its own task and checks for cancellation between points, so a slow
//! platform query never holds up session teardown.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::driver::{AutomationDriver, ProbeMode, ScrollProbeResult};
use crate::geometry::{Point, Rect, ScreenId};

/// Outcome of a full grid sweep
#[derive(Debug)]
pub(crate) enum ProbeSweepOutcome {
    /// A point reported Auto or AutoSynthetic
    Usable(ScrollProbeResult),
    /// Every point was unsupported or errored
    Exhausted { attempts: usize, last_reason: String },
    /// The session was cancelled mid-sweep
    Cancelled,
}

/// Candidate probe points for the region: an NxN grid strictly inside the
/// region (1-pixel border excluded), ordered center-outward. With
/// `ignore_bottom_edge` the rows are laid out over the top three quarters
/// of the region so no candidate lands in overlay territory.
pub fn probe_grid(region: Rect, density: u32, ignore_bottom_edge: bool) -> Vec<Point> {
    let n = density.max(1) as i64;
    let width = region.width as i64;
    let height = region.height as i64;
    if width <= 2 || height <= 2 {
        return vec![region.center()];
    }

    let usable_height = if ignore_bottom_edge {
        (height * 3 / 4).max(3)
    } else {
        height
    };

    let mut points = Vec::with_capacity((n * n) as usize);
    for row in 0..n {
        for col in 0..n {
            // Interior fractions (i+1)/(n+1) keep every point at least one
            // pixel away from each edge
            let x = region.x as i64 + 1 + (col + 1) * (width - 2) / (n + 1);
            let y = region.y as i64 + 1 + (row + 1) * (usable_height - 2) / (n + 1);
            points.push(Point::new(x as i32, y as i32));
        }
    }

    let center = region.center();
    points.sort_by_key(|p| p.distance_sq(center));
    points
}

/// Walk the grid until a usable probe result or exhaustion, reporting the
/// outcome on `results`. Dropped silently if the session is gone by then.
pub(crate) async fn run_probe_sweep(
    driver: Arc<dyn AutomationDriver>,
    points: Vec<Point>,
    screen: ScreenId,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<ProbeSweepOutcome>,
) {
    let mut attempts = 0usize;
    let mut last_reason = String::from("no probe points");

    for point in points {
        if cancel.is_cancelled() {
            let _ = results.send(ProbeSweepOutcome::Cancelled);
            return;
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = results.send(ProbeSweepOutcome::Cancelled);
                return;
            }
            res = driver.probe_at(point, screen) => res,
        };

        match outcome {
            Ok(result) if result.mode != ProbeMode::Unsupported => {
                info!(
                    "Probe at ({}, {}) usable: {:?} ({})",
                    point.x, point.y, result.mode, result.reason
                );
                let _ = results.send(ProbeSweepOutcome::Usable(result));
                return;
            }
            Ok(result) => {
                debug!(
                    "Probe at ({}, {}) unsupported: {}",
                    point.x, point.y, result.reason
                );
                last_reason = result.reason;
            }
            Err(e) => {
                debug!("Probe at ({}, {}) failed: {}", point.x, point.y, e);
                last_reason = e.to_string();
            }
        }
    }

    let _ = results.send(ProbeSweepOutcome::Exhausted {
        attempts,
        last_reason,
    });
}
