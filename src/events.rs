//! Session notifications and the diagnostics timeline
//!
//! Notifications flow over the session's mpsc channel to whoever spawned
//! it. The timeline is a bounded in-memory log with dedup keys so a UI can
//! render recent session activity without tailing tracing output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::frame::Frame;
use crate::geometry::{Point, Rect};
use crate::session::{FailureReason, Mode};

const DEFAULT_MAX_ENTRIES: usize = 300;
const DEDUP_WINDOW: usize = 50;
const DEDUP_TTL_SECS: i64 = 600;

/// Notifications emitted by a running session
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// The mode ladder moved (includes the initial Manual on start)
    ModeChanged { mode: Mode },
    /// Terminal success: the ordered accepted-frame sequence plus the
    /// metadata a stitcher needs
    CaptureReady {
        frames: Vec<Frame>,
        origin: Point,
        region: Rect,
    },
    /// Terminal: the session was cancelled
    Cancelled,
    /// Terminal failure
    Failed { reason: FailureReason },
}

/// Category of a timeline entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Lifecycle,
    Mode,
    Commit,
    Escalation,
    Probe,
    Watchdog,
}

/// One entry in the session timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: TimelineKind,
    pub summary: String,
    pub detail: Option<String>,
    pub dedup_key: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Bounded timeline with dedup-key suppression
struct Timeline {
    entries: Vec<Arc<TimelineEntry>>,
    max_entries: usize,
}

impl Timeline {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_entries),
            max_entries,
        }
    }

    fn push(&mut self, entry: TimelineEntry) {
        // Suppress duplicates within the TTL window (only scan recent
        // entries, not the whole history)
        if let Some(key) = entry.dedup_key.as_ref() {
            let cutoff = entry.timestamp - chrono::Duration::seconds(DEDUP_TTL_SECS);
            let is_duplicate = self
                .entries
                .iter()
                .rev()
                .take(DEDUP_WINDOW)
                .any(|e| e.dedup_key.as_ref() == Some(key) && e.timestamp >= cutoff);
            if is_duplicate {
                return;
            }
        }

        self.entries.push(Arc::new(entry));

        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(0..excess);
        }
    }

    fn list(&self, limit: usize) -> Vec<Arc<TimelineEntry>> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

lazy_static::lazy_static! {
    static ref TIMELINE: RwLock<Timeline> = RwLock::new(Timeline::new(DEFAULT_MAX_ENTRIES));
}

/// Record a timeline entry. Best-effort; never blocks the session loop.
pub fn record_timeline(
    kind: TimelineKind,
    summary: impl Into<String>,
    detail: Option<String>,
    dedup_key: Option<String>,
) {
    record_timeline_detailed(kind, summary, detail, dedup_key, HashMap::new());
}

/// Record a timeline entry carrying structured metadata
pub fn record_timeline_detailed(
    kind: TimelineKind,
    summary: impl Into<String>,
    detail: Option<String>,
    dedup_key: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
) {
    let entry = TimelineEntry {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        kind,
        summary: summary.into(),
        detail,
        dedup_key,
        metadata,
    };

    if let Ok(mut timeline) = TIMELINE.write() {
        timeline.push(entry);
    } else {
        tracing::warn!("Timeline lock contested, dropping entry");
    }
}

/// Most recent timeline entries, newest first
pub fn recent_timeline(limit: usize) -> Vec<Arc<TimelineEntry>> {
    TIMELINE
        .read()
        .ok()
        .map(|t| t.list(limit))
        .unwrap_or_default()
}

/// Drop all timeline entries
pub fn clear_timeline() {
    if let Ok(mut timeline) = TIMELINE.write() {
        timeline.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(summary: &str, dedup_key: Option<&str>) -> TimelineEntry {
        TimelineEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind: TimelineKind::Lifecycle,
            summary: summary.to_string(),
            detail: None,
            dedup_key: dedup_key.map(|s| s.to_string()),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_push_and_list_newest_first() {
        let mut t = Timeline::new(10);
        t.push(entry("first", None));
        t.push(entry("second", None));
        let listed = t.list(10);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].summary, "second");
        assert_eq!(listed[1].summary, "first");
    }

    #[test]
    fn test_dedup_key_suppresses_repeats() {
        let mut t = Timeline::new(10);
        t.push(entry("settle retry", Some("settle_retry")));
        t.push(entry("settle retry", Some("settle_retry")));
        t.push(entry("other", None));
        assert_eq!(t.list(10).len(), 2);
    }

    #[test]
    fn test_bounded_size() {
        let mut t = Timeline::new(5);
        for i in 0..12 {
            t.push(entry(&format!("e{}", i), None));
        }
        let listed = t.list(100);
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[0].summary, "e11");
        assert_eq!(listed[4].summary, "e7");
    }
}
