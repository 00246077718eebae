//! Frame pipeline: source → sampler → detector → output.
//!
//! [`VideoPipeline`] drives one job through `Opening → Streaming →
//! Finalizing → Completed | Failed`. Where frames end up is decided by a
//! [`FrameOutput`]: [`FileOutput`] re-encodes them into a video file (batch
//! mode) while the live session forwards them over a WebSocket.
//!
//! Both the source and the output are released exactly once, at a single
//! point after the job leaves the streaming loop, whatever the outcome.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use ml_core::{Detector, Inference, SettingsView};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;
use video_io::{Frame, MediaError, MediaSink, MediaSource, SourceLocator, SourceProperties};

use crate::vision::sampler::{FixedStride, FrameSampler};

/// Heartbeat interval for frame-level debug logs.
const HEARTBEAT_FRAMES: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Opening,
    Streaming,
    Finalizing,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    SourceUnavailable(MediaError),
    #[error(transparent)]
    SinkUnavailable(MediaError),
    #[error("frame {frame_index}: {cause}")]
    FrameGeometryMismatch { frame_index: u64, cause: MediaError },
    #[error("detector failed on frame {frame_index}: {cause:#}")]
    DetectorFailure {
        frame_index: u64,
        cause: anyhow::Error,
    },
    #[error("media error at frame {frame_index}: {cause}")]
    Media { frame_index: u64, cause: MediaError },
    #[error("output {} is missing or empty", path.display())]
    EmptyOutput { path: PathBuf },
    #[error("job cancelled after {frames} frames")]
    Cancelled { frames: u64 },
}

impl PipelineError {
    /// Short label used for the `outcome` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "source_unavailable",
            PipelineError::SinkUnavailable(_) => "sink_unavailable",
            PipelineError::FrameGeometryMismatch { .. } => "geometry_mismatch",
            PipelineError::DetectorFailure { .. } => "detector_failure",
            PipelineError::Media { .. } => "media",
            PipelineError::EmptyOutput { .. } => "empty_output",
            PipelineError::Cancelled { .. } => "cancelled",
        }
    }
}

/// What happened to one frame on its way through the pipeline.
pub enum FrameOutcome {
    /// The sampler selected the frame and the detector ran on it.
    Processed(Inference),
    /// The sampler skipped the frame; it is passed through untouched.
    Skipped(Frame),
}

/// Destination of the frames produced by a [`VideoPipeline`].
pub trait FrameOutput {
    type Summary;

    /// Called once the source is open, before the first frame is read.
    fn open(&mut self, properties: &SourceProperties) -> Result<(), PipelineError>;

    /// `progress` lies in `[0, 1)` and never decreases across calls.
    fn write(&mut self, frame_index: u64, outcome: FrameOutcome, progress: f64) -> Result<(), PipelineError>;

    /// Flush everything. Only called after the source is exhausted.
    fn finalize(&mut self, frames: u64) -> Result<Self::Summary, PipelineError>;

    /// Release after a failure, discarding partial output.
    fn abort(&mut self);
}

/// Fraction of the job done before `frame_index`, kept strictly below 1 so
/// that only a completed job reports 1.0.
pub fn progress_fraction(frame_index: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => (frame_index as f64 / total as f64).min(1.0 - f64::EPSILON),
        _ => 0.0,
    }
}

/// Drives frames from one source through the sampler and detector into a
/// [`FrameOutput`].
pub struct VideoPipeline {
    sampler: Box<dyn FrameSampler>,
    settings: SettingsView,
    frame_limit: Option<u64>,
    cancel: Option<Arc<AtomicBool>>,
    mode: &'static str,
    state: PipelineState,
}

impl VideoPipeline {
    /// Pipeline processing every frame with settings from `settings`.
    pub fn new(settings: SettingsView) -> Self {
        Self {
            sampler: Box::new(FixedStride::every_frame()),
            settings,
            frame_limit: None,
            cancel: None,
            mode: "batch",
            state: PipelineState::Idle,
        }
    }

    pub fn with_sampler(mut self, sampler: impl FrameSampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Stop after `limit` frames. Needed for cameras, which never end.
    pub fn with_frame_limit(mut self, limit: Option<u64>) -> Self {
        self.frame_limit = limit;
        self
    }

    /// Abort the job at the next frame boundary once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Label attached to frame metrics (`batch` or `live`).
    pub fn with_mode(mut self, mode: &'static str) -> Self {
        self.mode = mode;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Open `locator` and run the job. If the source cannot be opened the
    /// output is never opened.
    pub fn run<O: FrameOutput>(
        &mut self,
        locator: &SourceLocator,
        output: &mut O,
        detector: &dyn Detector,
    ) -> Result<O::Summary, PipelineError> {
        self.enter(PipelineState::Opening);
        match MediaSource::open(locator) {
            Ok(source) => self.run_source(source, output, detector),
            Err(err) => {
                self.enter(PipelineState::Failed);
                Err(PipelineError::SourceUnavailable(err))
            }
        }
    }

    /// Run the job over an already opened source.
    pub fn run_source<O: FrameOutput>(
        &mut self,
        mut source: MediaSource,
        output: &mut O,
        detector: &dyn Detector,
    ) -> Result<O::Summary, PipelineError> {
        self.enter(PipelineState::Opening);
        let outcome = self.drive(&mut source, output, detector);

        source.close();
        match outcome {
            Ok(summary) => {
                self.enter(PipelineState::Completed);
                Ok(summary)
            }
            Err(err) => {
                output.abort();
                self.enter(PipelineState::Failed);
                Err(err)
            }
        }
    }

    fn drive<O: FrameOutput>(
        &mut self,
        source: &mut MediaSource,
        output: &mut O,
        detector: &dyn Detector,
    ) -> Result<O::Summary, PipelineError> {
        let properties = source.properties();
        output.open(&properties)?;

        let total = match (properties.frame_count.known(), self.frame_limit) {
            (Some(count), Some(limit)) => Some(count.min(limit)),
            (count, limit) => count.or(limit),
        };

        self.enter(PipelineState::Streaming);
        let mut frame_index: u64 = 0;
        let mut processed: u64 = 0;
        loop {
            if self.cancelled() {
                return Err(PipelineError::Cancelled {
                    frames: frame_index,
                });
            }
            if self.frame_limit.is_some_and(|limit| frame_index >= limit) {
                break;
            }
            let Some(frame) = source
                .read_next_frame()
                .map_err(|cause| PipelineError::Media { frame_index, cause })?
            else {
                break;
            };

            let _frame_span = info_span!("pipeline.frame", frame_index).entered();
            let outcome = if self.sampler.should_process(frame_index) {
                let settings = self.settings.next_frame().clone();
                let started = Instant::now();
                let inference = detector
                    .infer(&frame, &settings)
                    .map_err(|cause| PipelineError::DetectorFailure { frame_index, cause })?;
                metrics::histogram!("pipeline_detect_seconds").record(started.elapsed().as_secs_f64());
                metrics::counter!("pipeline_frames_total", "mode" => self.mode, "kind" => "processed")
                    .increment(1);
                processed += 1;
                FrameOutcome::Processed(inference)
            } else {
                metrics::counter!("pipeline_frames_total", "mode" => self.mode, "kind" => "skipped")
                    .increment(1);
                FrameOutcome::Skipped(frame)
            };

            output.write(frame_index, outcome, progress_fraction(frame_index, total))?;
            frame_index += 1;

            if frame_index % HEARTBEAT_FRAMES == 0 {
                debug!(frames = frame_index, processed, "pipeline heartbeat");
            }
        }

        self.enter(PipelineState::Finalizing);
        output.finalize(frame_index)
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn enter(&mut self, state: PipelineState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "pipeline state");
            self.state = state;
        }
    }
}

/// Result of a successful batch job.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BatchSummary {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    pub frames_written: u64,
    pub frames_processed: u64,
    pub detections: u64,
}

/// Batch output: annotated and passed-through frames are encoded into a file.
pub struct FileOutput {
    path: PathBuf,
    sink: Option<MediaSink>,
    frames_processed: u64,
    detections: u64,
    last_percent: Option<u64>,
}

impl FileOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sink: None,
            frames_processed: 0,
            detections: 0,
            last_percent: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sink(&mut self) -> Result<&mut MediaSink, PipelineError> {
        self.sink.as_mut().ok_or_else(|| {
            PipelineError::SinkUnavailable(MediaError::SinkUnavailable {
                path: self.path.clone(),
                reason: "sink is not open".into(),
            })
        })
    }

    fn report_progress(&mut self, progress: f64) {
        let percent = (progress * 100.0) as u64;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            info!(output = %self.path.display(), "progress {percent}%");
        }
    }
}

impl FrameOutput for FileOutput {
    type Summary = BatchSummary;

    fn open(&mut self, properties: &SourceProperties) -> Result<(), PipelineError> {
        let sink = MediaSink::open(&self.path, properties.width, properties.height, properties.fps)
            .map_err(PipelineError::SinkUnavailable)?;
        self.sink = Some(sink);
        Ok(())
    }

    fn write(&mut self, frame_index: u64, outcome: FrameOutcome, progress: f64) -> Result<(), PipelineError> {
        let frame = match outcome {
            FrameOutcome::Processed(inference) => {
                self.frames_processed += 1;
                self.detections += inference.detections.len() as u64;
                inference.annotated
            }
            FrameOutcome::Skipped(frame) => frame,
        };
        self.sink()?.write_frame(&frame).map_err(|cause| match cause {
            MediaError::FrameGeometryMismatch { .. } => PipelineError::FrameGeometryMismatch { frame_index, cause },
            cause => PipelineError::Media { frame_index, cause },
        })?;
        self.report_progress(progress);
        Ok(())
    }

    fn finalize(&mut self, frames: u64) -> Result<BatchSummary, PipelineError> {
        let mut sink = self.sink.take().ok_or_else(|| PipelineError::EmptyOutput {
            path: self.path.clone(),
        })?;
        let frames_written = sink.frames_written();
        sink.close().map_err(|cause| PipelineError::Media {
            frame_index: frames,
            cause,
        })?;
        let size_bytes = match fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => {
                let _ = fs::remove_file(&self.path);
                return Err(PipelineError::EmptyOutput {
                    path: self.path.clone(),
                });
            }
        };
        self.report_progress(1.0);
        Ok(BatchSummary {
            output_path: self.path.clone(),
            size_bytes,
            frames_written,
            frames_processed: self.frames_processed,
            detections: self.detections,
        })
    }

    fn abort(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.abort();
        }
    }
}

/// One batch job: a source, a destination file, a sampler and a settings view.
pub struct PipelineJob {
    id: Uuid,
    source: SourceLocator,
    output: FileOutput,
    pipeline: VideoPipeline,
    status: JobStatus,
}

impl PipelineJob {
    pub fn new(source: SourceLocator, output_path: impl Into<PathBuf>, settings: SettingsView) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            output: FileOutput::new(output_path),
            pipeline: VideoPipeline::new(settings),
            status: JobStatus::Running,
        }
    }

    pub fn with_sampler(mut self, sampler: impl FrameSampler + 'static) -> Self {
        self.pipeline = self.pipeline.with_sampler(sampler);
        self
    }

    pub fn with_frame_limit(mut self, limit: Option<u64>) -> Self {
        self.pipeline = self.pipeline.with_frame_limit(limit);
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.pipeline = self.pipeline.with_cancel_flag(flag);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    /// Run to completion. On failure the destination file does not exist.
    pub fn run(&mut self, detector: &dyn Detector) -> Result<BatchSummary, PipelineError> {
        let span = info_span!(
            "pipeline.job",
            job = %self.id,
            source = %self.source,
            output = %self.output.path().display()
        );
        let _guard = span.enter();
        let started = Instant::now();

        let result = self.pipeline.run(&self.source, &mut self.output, detector);
        metrics::histogram!("pipeline_job_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(summary) => {
                self.status = JobStatus::Completed;
                metrics::counter!("pipeline_jobs_total", "outcome" => "completed").increment(1);
                info!(
                    frames = summary.frames_written,
                    processed = summary.frames_processed,
                    detections = summary.detections,
                    size_bytes = summary.size_bytes,
                    "job completed"
                );
            }
            Err(err) => {
                self.status = JobStatus::Failed;
                metrics::counter!("pipeline_jobs_total", "outcome" => err.kind()).increment(1);
                match err {
                    PipelineError::Cancelled { .. } => warn!("job cancelled: {err}"),
                    _ => error!("job failed: {err}"),
                }
            }
        }
        result
    }
}
