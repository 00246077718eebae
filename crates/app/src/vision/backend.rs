//! Detector construction for the configured backend.

use std::sync::Arc;

use anyhow::Result;
use ml_core::Detector;

use crate::vision::config::DetectorConfig;

#[cfg(feature = "with-tch")]
pub fn load_detector(config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    use anyhow::Context;
    use ml_core::torch::TorchDetector;

    let model_path = config
        .model_path
        .as_ref()
        .context("--model (or YOLO_MODEL) is required")?;
    let class_names = match config.class_names_path.as_ref() {
        Some(path) => TorchDetector::read_class_names(path)?,
        None => Vec::new(),
    };
    let detector = TorchDetector::load(model_path, config.input_size, class_names, &config.settings)?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "with-tch"))]
pub fn load_detector(_config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    anyhow::bail!("no detector backend in this build; rebuild with `--features with-tch`")
}
