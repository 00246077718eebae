//! JSON messages sent to live WebSocket clients.
//!
//! Every outgoing message is one JSON object of exactly one of these shapes:
//!
//! - `{"info": {"fps": .., "frame_count": ..}}`
//! - `{"frame": "data:image/jpeg;base64,..", "detections": [..], ...}`
//! - `{"status": "completed", "message": .., "progress": 1.0}`
//! - `{"error": ".."}`

use ml_core::Detection;
use serde::{Deserialize, Serialize};
use video_io::SourceProperties;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub fps: f64,
    /// `null` when the source cannot tell (cameras).
    pub frame_count: Option<u64>,
}

impl From<&SourceProperties> for StreamInfo {
    fn from(properties: &SourceProperties) -> Self {
        Self {
            fps: properties.fps,
            frame_count: properties.frame_count.known(),
        }
    }
}

/// Detection as exposed to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireDetection {
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in pixels of the streamed frame.
    pub bbox: [f32; 4],
}

impl From<&Detection> for WireDetection {
    fn from(detection: &Detection) -> Self {
        Self {
            class_name: detection.label.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Info {
        info: StreamInfo,
    },
    Frame {
        frame: String,
        detections: Vec<WireDetection>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame_index: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },
    Status {
        status: String,
        message: String,
        progress: f64,
    },
    Error {
        error: String,
    },
}

impl Envelope {
    pub fn info(properties: &SourceProperties) -> Self {
        Envelope::Info {
            info: properties.into(),
        }
    }

    /// Reply to a single relayed image.
    pub fn detections(frame: String, detections: &[Detection]) -> Self {
        Envelope::Frame {
            frame,
            detections: detections.iter().map(WireDetection::from).collect(),
            frame_index: None,
            progress: None,
        }
    }

    /// One processed frame of an ingested video.
    pub fn video_frame(frame: String, detections: &[Detection], frame_index: u64, progress: f64) -> Self {
        Envelope::Frame {
            frame,
            detections: detections.iter().map(WireDetection::from).collect(),
            frame_index: Some(frame_index),
            progress: Some(progress),
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Envelope::Status {
            status: "completed".into(),
            message: message.into(),
            progress: 1.0,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            error: message.into(),
        }
    }
}
