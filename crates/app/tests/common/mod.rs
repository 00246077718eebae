#![allow(dead_code)]

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use anyhow::bail;
use ml_core::{Detection, DetectionSettings, Detector, Inference, SettingsUpdate, SharedSettings, annotation::annotate};
use serde_json::Value;
use tokio::time::Instant;
use video_io::{Frame, FrameCount, FrameReader, MediaError, MediaSink, MediaSource, SourceLocator, SourceProperties};
use vision_app::vision::{
    envelope::Envelope,
    live::{ChannelError, Inbound, LiveChannel},
};

/// Write `frames` solid-colour frames into a Y4M file.
pub fn write_solid_y4m(path: &Path, frames: u64, width: u32, height: u32, rgb: [u8; 3]) {
    let mut sink = MediaSink::open(path, width, height, 25.0).unwrap();
    for _ in 0..frames {
        sink.write_frame(&Frame::solid(width, height, rgb)).unwrap();
    }
    sink.close().unwrap();
}

/// Decode every frame of a file.
pub fn read_all(path: &Path) -> Vec<Frame> {
    let mut source = MediaSource::open(&SourceLocator::file(path)).unwrap();
    let mut frames = Vec::new();
    while let Some(frame) = source.read_next_frame().unwrap() {
        frames.push(frame);
    }
    frames
}

/// In-memory source of solid frames that counts how often it is released.
pub struct CountingReader {
    pub remaining: u64,
    pub width: u32,
    pub height: u32,
    pub closes: Arc<AtomicUsize>,
}

impl CountingReader {
    pub fn source(frames: u64, width: u32, height: u32, closes: &Arc<AtomicUsize>) -> MediaSource {
        MediaSource::from_reader(
            "memory",
            Box::new(CountingReader {
                remaining: frames,
                width,
                height,
                closes: closes.clone(),
            }),
        )
    }
}

impl FrameReader for CountingReader {
    fn properties(&self) -> SourceProperties {
        SourceProperties {
            width: self.width,
            height: self.height,
            fps: 25.0,
            frame_count: FrameCount::Known(self.remaining),
        }
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, MediaError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(Frame::solid(self.width, self.height, [50, 50, 50])))
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Returns frames untouched with no detections; counts calls.
#[derive(Default)]
pub struct NullDetector {
    pub calls: AtomicU64,
}

impl Detector for NullDetector {
    fn infer(&self, frame: &Frame, _settings: &DetectionSettings) -> anyhow::Result<Inference> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Inference {
            annotated: frame.clone(),
            detections: Vec::new(),
        })
    }
}

impl NullDetector {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Reports one fixed box per frame and draws it.
pub struct BoxDetector;

impl Detector for BoxDetector {
    fn infer(&self, frame: &Frame, settings: &DetectionSettings) -> anyhow::Result<Inference> {
        let detections = vec![Detection {
            label: "person".into(),
            confidence: settings.confidence_threshold.max(0.9),
            bbox: [1.0, 1.0, 6.0, 6.0],
        }];
        Ok(Inference {
            annotated: annotate(frame, &detections),
            detections,
        })
    }
}

/// Returns an annotated frame half the width of its input.
pub struct ShrinkingDetector;

impl Detector for ShrinkingDetector {
    fn infer(&self, frame: &Frame, _settings: &DetectionSettings) -> anyhow::Result<Inference> {
        Ok(Inference {
            annotated: Frame::solid(frame.width / 2, frame.height, [0, 0, 0]),
            detections: Vec::new(),
        })
    }
}

/// Fails on the call with the given zero-based index.
pub struct FailingDetector {
    pub fail_on_call: u64,
    pub calls: AtomicU64,
}

impl FailingDetector {
    pub fn new(fail_on_call: u64) -> Self {
        Self {
            fail_on_call,
            calls: AtomicU64::new(0),
        }
    }
}

impl Detector for FailingDetector {
    fn infer(&self, frame: &Frame, _settings: &DetectionSettings) -> anyhow::Result<Inference> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_on_call {
            bail!("inference backend crashed");
        }
        Ok(Inference {
            annotated: frame.clone(),
            detections: Vec::new(),
        })
    }
}

/// Records the confidence threshold seen by each call and pushes an update
/// into the shared settings during call `update_on_call`.
pub struct SettingsProbe {
    pub shared: SharedSettings,
    pub update_on_call: usize,
    pub seen: Mutex<Vec<f32>>,
}

impl Detector for SettingsProbe {
    fn infer(&self, frame: &Frame, settings: &DetectionSettings) -> anyhow::Result<Inference> {
        let mut seen = self.seen.lock().unwrap();
        if seen.len() == self.update_on_call {
            self.shared.apply(&SettingsUpdate {
                confidence: Some(0.6),
                ..SettingsUpdate::default()
            })?;
        }
        seen.push(settings.confidence_threshold);
        Ok(Inference {
            annotated: frame.clone(),
            detections: Vec::new(),
        })
    }
}

/// In-memory channel: replays scripted inbound messages, records outgoing
/// envelopes as JSON, and can simulate the peer vanishing.
#[derive(Default)]
pub struct MemoryChannel {
    pub inbound: VecDeque<Inbound>,
    pub sent: Vec<Value>,
    pub sent_at: Vec<Instant>,
    /// Fail every send once this many envelopes were delivered.
    pub disconnect_after: Option<usize>,
}

impl MemoryChannel {
    pub fn with_inbound(messages: impl IntoIterator<Item = Inbound>) -> Self {
        Self {
            inbound: messages.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Envelopes carrying a frame.
    pub fn frames(&self) -> Vec<&Value> {
        self.sent.iter().filter(|value| value.get("frame").is_some()).collect()
    }
}

impl LiveChannel for MemoryChannel {
    async fn recv(&mut self) -> Result<Option<Inbound>, ChannelError> {
        Ok(self.inbound.pop_front())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        if self.disconnect_after.is_some_and(|limit| self.sent.len() >= limit) {
            return Err(ChannelError::Disconnected);
        }
        self.sent.push(serde_json::to_value(envelope).unwrap());
        self.sent_at.push(Instant::now());
        Ok(())
    }
}
