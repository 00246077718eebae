use anyhow::Result;
use video_io::Frame;

use crate::{detection::Detection, settings::DetectionSettings};

/// Output of one inference pass.
#[derive(Clone, Debug)]
pub struct Inference {
    /// Copy of the input frame with boxes and labels drawn on it.
    pub annotated: Frame,
    pub detections: Vec<Detection>,
}

/// Object detector invoked by the pipelines.
///
/// Calls are synchronous and may block for the duration of a model forward
/// pass; callers on an async runtime must dispatch them to a blocking worker.
pub trait Detector: Send + Sync {
    /// React to a settings change (e.g. move the model to another device).
    fn configure(&self, _settings: &DetectionSettings) -> Result<()> {
        Ok(())
    }

    fn infer(&self, frame: &Frame, settings: &DetectionSettings) -> Result<Inference>;
}
