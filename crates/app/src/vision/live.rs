//! Live detection sessions over a bidirectional message channel.
//!
//! Two session shapes share this module:
//!
//! - relay: every inbound message is one image (base64 JSON or raw bytes);
//!   each gets exactly one reply, either detections or an error.
//! - ingest: the first inbound message is a whole video. It is staged to a
//!   per-session temp file and streamed back as an info message, one frame
//!   message per sampled frame, and a completion (or error) message.
//!
//! Detection runs on blocking workers so the channel stays responsive. A lost
//! peer ends the session quietly and stops the worker at the next frame.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use ml_core::{Detection, Detector, SharedSettings};
use serde_json::Value;
use tempfile::TempPath;
use thiserror::Error;
use tokio::{sync::mpsc, task, time::Instant};
use tracing::{Instrument, Span, debug, info, info_span, warn};
use uuid::Uuid;
use video_io::{Frame, MediaSource, SourceLocator, SourceProperties};

use crate::vision::{
    config::LiveConfig,
    encoding::{decode_base64_image, decode_image_bytes, encode_jpeg, jpeg_data_url},
    envelope::Envelope,
    pipeline::{FrameOutcome, FrameOutput, PipelineError, VideoPipeline},
    sampler::FixedStride,
};

/// One inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Bidirectional message channel a session runs over.
#[allow(async_fn_in_trait)]
pub trait LiveChannel {
    /// Next inbound message, or `None` once the peer has closed the channel.
    async fn recv(&mut self) -> Result<Option<Inbound>, ChannelError>;

    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError>;
}

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("{0}")]
    MalformedPayload(String),
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to stage upload: {0}")]
    Staging(#[source] io::Error),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl From<ChannelError> for LiveError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Disconnected => LiveError::PeerDisconnected,
            ChannelError::Transport(reason) => LiveError::Transport(reason),
        }
    }
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Completed,
    PeerDisconnected,
    Failed(String),
}

/// Processed frame handed from the worker to the sending side.
#[derive(Clone, Debug)]
pub struct FrameResult {
    pub frame_index: u64,
    pub detections: Vec<Detection>,
    /// Annotated frame, JPEG encoded.
    pub annotated_frame: Vec<u8>,
    pub progress: f64,
}

enum WorkerEvent {
    Info(SourceProperties),
    Frame(FrameResult),
}

/// Enforces a minimum delay between consecutive outgoing frame messages.
pub struct Pacer {
    interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            tokio::time::sleep_until(last + self.interval).await;
            metrics::histogram!("live_envelope_interval_seconds").record(last.elapsed().as_secs_f64());
        }
        self.last = Some(Instant::now());
    }
}

/// Shared entry point for both session shapes.
#[derive(Clone)]
pub struct LiveSession {
    detector: Arc<dyn Detector>,
    settings: SharedSettings,
    config: LiveConfig,
    scratch_dir: PathBuf,
}

impl LiveSession {
    /// `scratch_dir` receives the per-session temp files of ingested videos.
    pub fn new(
        detector: Arc<dyn Detector>,
        settings: SharedSettings,
        config: LiveConfig,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            detector,
            settings,
            config,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Answer every inbound image with detections or an error until the peer leaves.
    pub async fn relay<C: LiveChannel>(&self, channel: &mut C) -> SessionEnd {
        metrics::counter!("live_sessions_total", "shape" => "relay").increment(1);
        let span = info_span!("live.relay", session = %Uuid::new_v4());
        async move {
            info!("relay session opened");
            let mut answered: u64 = 0;
            loop {
                let inbound = match channel.recv().await {
                    Ok(Some(inbound)) => inbound,
                    Ok(None) | Err(ChannelError::Disconnected) => {
                        info!(answered, "relay session closed by peer");
                        return SessionEnd::PeerDisconnected;
                    }
                    Err(ChannelError::Transport(reason)) => {
                        warn!("relay transport failed: {reason}");
                        return SessionEnd::Failed(reason);
                    }
                };

                let envelope = match self.relay_frame(inbound).await {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        if matches!(err, LiveError::MalformedPayload(_)) {
                            metrics::counter!("live_malformed_payloads_total").increment(1);
                        }
                        warn!("relay frame rejected: {err}");
                        Envelope::error(err.to_string())
                    }
                };
                answered += 1;

                match channel.send(&envelope).await {
                    Ok(()) => {}
                    Err(ChannelError::Disconnected) => {
                        info!(answered, "relay session closed by peer");
                        return SessionEnd::PeerDisconnected;
                    }
                    Err(ChannelError::Transport(reason)) => {
                        warn!("relay transport failed: {reason}");
                        return SessionEnd::Failed(reason);
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn relay_frame(&self, inbound: Inbound) -> Result<Envelope, LiveError> {
        let frame = match inbound {
            Inbound::Text(text) => parse_relay_request(&text)?,
            Inbound::Binary(bytes) => decode_image_bytes(&bytes).map_err(LiveError::MalformedPayload)?,
        };

        let detector = self.detector.clone();
        let settings = self.settings.snapshot();
        let quality = self.config.jpeg_quality;
        let (jpeg, detections) = task::spawn_blocking(move || -> Result<_, PipelineError> {
            let inference = detector
                .infer(&frame, &settings)
                .map_err(|cause| PipelineError::DetectorFailure { frame_index: 0, cause })?;
            let jpeg = encode_jpeg(&inference.annotated, quality)
                .map_err(|cause| PipelineError::Media { frame_index: 0, cause })?;
            Ok((jpeg, inference.detections))
        })
        .await
        .map_err(|err| LiveError::Worker(err.to_string()))??;

        Ok(Envelope::detections(jpeg_data_url(&jpeg), &detections))
    }

    /// Receive one video, stream its sampled frames back, then report completion.
    pub async fn ingest<C: LiveChannel>(&self, channel: &mut C) -> SessionEnd {
        metrics::counter!("live_sessions_total", "shape" => "ingest").increment(1);
        let span = info_span!("live.ingest", session = %Uuid::new_v4());
        async move {
            match self.ingest_video(channel).await {
                Ok(frames) => {
                    info!(frames, "ingest session completed");
                    SessionEnd::Completed
                }
                Err(LiveError::PeerDisconnected) => {
                    info!("ingest session closed by peer");
                    SessionEnd::PeerDisconnected
                }
                Err(err) => {
                    warn!("ingest session failed: {err}");
                    if !matches!(err, LiveError::Transport(_)) {
                        let _ = channel.send(&Envelope::error(err.to_string())).await;
                    }
                    SessionEnd::Failed(err.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn ingest_video<C: LiveChannel>(&self, channel: &mut C) -> Result<u64, LiveError> {
        let payload = match channel.recv().await? {
            Some(Inbound::Binary(bytes)) => bytes,
            Some(Inbound::Text(_)) => {
                metrics::counter!("live_malformed_payloads_total").increment(1);
                return Err(LiveError::MalformedPayload("expected a binary video payload".into()));
            }
            None => return Err(LiveError::PeerDisconnected),
        };
        debug!(bytes = payload.len(), "video payload received");

        let scratch_dir = self.scratch_dir.clone();
        // Deleted when this function returns, after the worker has released it.
        let (_staged, source) = task::spawn_blocking(move || stage_upload(&scratch_dir, &payload))
            .await
            .map_err(|err| LiveError::Worker(err.to_string()))??;

        let (tx, mut rx) = mpsc::channel::<WorkerEvent>(1);
        let mut pipeline = VideoPipeline::new(self.settings.view(self.config.settings_refresh_frames))
            .with_sampler(FixedStride::new(self.config.stride))
            .with_mode("live");
        let detector = self.detector.clone();
        let jpeg_quality = self.config.jpeg_quality;
        let span = Span::current();
        let worker = task::spawn_blocking(move || {
            let _guard = span.enter();
            let mut output = ChannelOutput { tx, jpeg_quality };
            pipeline.run_source(source, &mut output, detector.as_ref())
        });

        let mut pacer = Pacer::new(self.config.pacing);
        let mut delivery = Ok(());
        while let Some(event) = rx.recv().await {
            let envelope = match event {
                WorkerEvent::Info(properties) => Envelope::info(&properties),
                WorkerEvent::Frame(result) => {
                    pacer.wait().await;
                    Envelope::video_frame(
                        jpeg_data_url(&result.annotated_frame),
                        &result.detections,
                        result.frame_index,
                        result.progress,
                    )
                }
            };
            if let Err(err) = channel.send(&envelope).await {
                delivery = Err(err);
                break;
            }
        }
        // Closing the receiver makes the worker's next send fail, which ends its job.
        drop(rx);

        let outcome = worker.await.map_err(|err| LiveError::Worker(err.to_string()))?;
        delivery?;
        let frames = outcome?;

        channel.send(&Envelope::completed("video processing completed")).await?;
        Ok(frames)
    }
}

/// Extract the image from a relay text message: `{"frame": "<base64 or data URL>"}`.
fn parse_relay_request(text: &str) -> Result<Frame, LiveError> {
    let request: Value =
        serde_json::from_str(text).map_err(|_| LiveError::MalformedPayload("invalid JSON".into()))?;
    let payload = request
        .get("frame")
        .and_then(Value::as_str)
        .filter(|payload| !payload.is_empty())
        .ok_or_else(|| LiveError::MalformedPayload("invalid frame data".into()))?;
    decode_base64_image(payload).map_err(LiveError::MalformedPayload)
}

/// Write an uploaded video to its own temp file and open it.
fn stage_upload(dir: &Path, payload: &[u8]) -> Result<(TempPath, MediaSource), LiveError> {
    let suffix = if payload.starts_with(b"YUV4MPEG2") {
        ".y4m"
    } else {
        ".mp4"
    };
    let mut file = tempfile::Builder::new()
        .prefix("live-")
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(LiveError::Staging)?;
    file.write_all(payload)
        .and_then(|()| file.flush())
        .map_err(LiveError::Staging)?;
    let path = file.into_temp_path();
    let source = MediaSource::open(&SourceLocator::file(&path)).map_err(PipelineError::SourceUnavailable)?;
    Ok((path, source))
}

/// Forwards processed frames to the async side. Skipped frames are dropped.
struct ChannelOutput {
    tx: mpsc::Sender<WorkerEvent>,
    jpeg_quality: u8,
}

impl ChannelOutput {
    fn deliver(&self, event: WorkerEvent, frame_index: u64) -> Result<(), PipelineError> {
        self.tx
            .blocking_send(event)
            .map_err(|_| PipelineError::Cancelled { frames: frame_index })
    }
}

impl FrameOutput for ChannelOutput {
    type Summary = u64;

    fn open(&mut self, properties: &SourceProperties) -> Result<(), PipelineError> {
        self.deliver(WorkerEvent::Info(*properties), 0)
    }

    fn write(&mut self, frame_index: u64, outcome: FrameOutcome, progress: f64) -> Result<(), PipelineError> {
        let FrameOutcome::Processed(inference) = outcome else {
            return Ok(());
        };
        let annotated_frame = encode_jpeg(&inference.annotated, self.jpeg_quality)
            .map_err(|cause| PipelineError::Media { frame_index, cause })?;
        self.deliver(
            WorkerEvent::Frame(FrameResult {
                frame_index,
                detections: inference.detections,
                annotated_frame,
                progress,
            }),
            frame_index,
        )
    }

    fn finalize(&mut self, frames: u64) -> Result<u64, PipelineError> {
        Ok(frames)
    }

    fn abort(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_request_errors_are_specific() {
        let err = parse_relay_request("{not json").unwrap_err();
        assert_eq!(err.to_string(), "invalid JSON");

        let err = parse_relay_request(r#"{"image": "abc"}"#).unwrap_err();
        assert_eq!(err.to_string(), "invalid frame data");

        let err = parse_relay_request(r#"{"frame": ""}"#).unwrap_err();
        assert_eq!(err.to_string(), "invalid frame data");

        let err = parse_relay_request(r#"{"frame": "data:image/jpeg;base64,????"}"#).unwrap_err();
        assert!(matches!(err, LiveError::MalformedPayload(_)));
    }

    #[test]
    fn staged_uploads_get_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = tempfile::Builder::new().tempfile_in(dir.path()).unwrap();
        let err = stage_upload(dir.path(), b"definitely not a video").err().expect("staging should fail");
        assert!(matches!(err, LiveError::Pipeline(PipelineError::SourceUnavailable(_))));
        // The failed staging file is cleaned up; the unrelated one survives.
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(remaining.len(), 1);
        drop(first);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_waits() {
        let mut pacer = Pacer::new(Duration::from_millis(50));
        let start = Instant::now();
        pacer.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_does_not_delay_slow_producers() {
        let mut pacer = Pacer::new(Duration::from_millis(50));
        pacer.wait().await;
        tokio::time::advance(Duration::from_millis(80)).await;
        let before = Instant::now();
        pacer.wait().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
