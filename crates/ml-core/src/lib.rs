//! Detection model abstractions shared by the pipelines.
//!
//! - `detection`: the labelled box type.
//! - `settings`: thresholds, device selection and the shared settings cell.
//! - `detector`: the [`Detector`] contract pipelines call into.
//! - `annotation`: CPU drawing of boxes and labels.
//! - `nms`: IoU and non-maximum suppression helpers.
//! - `torch` (feature `with-tch`): TorchScript YOLO backend.

pub mod annotation;
pub mod detection;
pub mod detector;
pub mod nms;
pub mod settings;

#[cfg(feature = "with-tch")]
mod runtime;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detection::Detection;
pub use detector::{Detector, Inference};
pub use settings::{Device, DetectionSettings, SettingsError, SettingsUpdate, SettingsView, SharedSettings};

#[cfg(feature = "with-tch")]
pub use tch;
