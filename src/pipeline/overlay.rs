//! Per-frame overlay captions

use std::fmt;
use std::time::{Duration, Instant};

use crate::vision::{BoundingBox, Frame};

/// Minimum overlap for a recognized caption to follow a box across frames
const TRACK_IOU: f32 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub enum Caption {
    Recognized { label: String, distance: f32 },
    Unknown,
}

impl fmt::Display for Caption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recognized { label, .. } => write!(f, "recognized: {}", label),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub bbox: BoundingBox,
    pub caption: Caption,
}

/// Where overlays go
pub trait OverlaySink {
    fn render(&mut self, frame: &Frame, overlays: &[Overlay]);
}

/// Logs overlays whenever they change
#[derive(Default)]
pub struct LogOverlaySink {
    last: Vec<String>,
}

impl LogOverlaySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverlaySink for LogOverlaySink {
    fn render(&mut self, frame: &Frame, overlays: &[Overlay]) {
        let current: Vec<String> = overlays
            .iter()
            .map(|o| format!("{} {}", o.bbox, o.caption))
            .collect();
        if current != self.last {
            log::debug!("frame {}: [{}]", frame.index(), current.join(", "));
            self.last = current;
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedLabel {
    bbox: BoundingBox,
    label: String,
    distance: f32,
    seen: Instant,
}

/// Keeps recent recognitions attached to overlapping boxes
///
/// Recognition is rate limited, so most frames carry no fresh result; a
/// recognized label sticks to boxes overlapping where it was seen until
/// it is older than the TTL.
pub struct LabelTracker {
    ttl: Duration,
    tracked: Vec<TrackedLabel>,
}

impl LabelTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tracked: Vec::new(),
        }
    }

    pub fn observe(&mut self, bbox: BoundingBox, label: String, distance: f32, now: Instant) {
        self.tracked.retain(|t| t.label != label && t.bbox.iou(&bbox) < TRACK_IOU);
        self.tracked.push(TrackedLabel {
            bbox,
            label,
            distance,
            seen: now,
        });
    }

    /// Drop whatever was tracked at `bbox` (it turned out unknown)
    pub fn forget(&mut self, bbox: &BoundingBox) {
        self.tracked.retain(|t| t.bbox.iou(bbox) < TRACK_IOU);
    }

    pub fn caption_for(&mut self, bbox: &BoundingBox, now: Instant) -> Caption {
        let ttl = self.ttl;
        self.tracked
            .retain(|t| now.saturating_duration_since(t.seen) <= ttl);

        self.tracked
            .iter()
            .map(|t| (t, t.bbox.iou(bbox)))
            .filter(|(_, iou)| *iou >= TRACK_IOU)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, _)| Caption::Recognized {
                label: t.label.clone(),
                distance: t.distance,
            })
            .unwrap_or(Caption::Unknown)
    }
}
