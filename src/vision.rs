//! Camera and detector collaborators consumed by the scan step.
//!
//! Frame capture, encoding and inference live outside this crate. The patrol
//! engine only needs to start the stream, grab the latest frame at a bounded
//! sub-interval, and classify what the detector saw.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const DEFAULT_FRAME_WIDTH: u32 = 960;
const DEFAULT_FRAME_HEIGHT: u32 = 720;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub threat_level: ThreatLevel,
}

impl Detection {
    pub fn is_threat(&self) -> bool {
        self.threat_level == ThreatLevel::High
    }
}

/// Video stream from the aircraft camera.
pub trait VideoSource: Send + Sync {
    /// Start streaming over the named link. Returns false if the stream could not start.
    fn start_streaming(&self, link: &str) -> bool;

    fn stop_streaming(&self);

    fn is_streaming(&self) -> bool;

    /// Most recent decoded frame, if any.
    fn latest_frame(&self) -> Option<Frame>;
}

/// Object detector run against individual frames.
pub trait Detector: Send + Sync {
    fn detect_objects(&self, frame: &Frame) -> Vec<Detection>;
}

/// Video source producing blank frames while "streaming".
#[derive(Debug, Default)]
pub struct BlankVideoSource {
    streaming: AtomicBool,
    sequence: AtomicU64,
}

impl BlankVideoSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoSource for BlankVideoSource {
    fn start_streaming(&self, link: &str) -> bool {
        tracing::debug!("Video stream started on link {}", link);
        self.streaming.store(true, Ordering::SeqCst);
        true
    }

    fn stop_streaming(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn latest_frame(&self) -> Option<Frame> {
        if !self.is_streaming() {
            return None;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Some(Frame {
            sequence,
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
            data: Vec::new(),
        })
    }
}

/// Detector that never sees anything.
#[derive(Debug, Default)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect_objects(&self, _frame: &Frame) -> Vec<Detection> {
        Vec::new()
    }
}

/// Detector returning the same detections for every frame. Used by the
/// simulator to exercise threat alerts.
#[derive(Debug, Default)]
pub struct FixedDetector {
    detections: Vec<Detection>,
}

impl FixedDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }
}

impl Detector for FixedDetector {
    fn detect_objects(&self, _frame: &Frame) -> Vec<Detection> {
        self.detections.clone()
    }
}
