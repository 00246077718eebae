//! Detection thresholds and the shared, reloadable settings cell.

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIDENCE: f32 = 0.25;
pub const DEFAULT_IOU: f32 = 0.45;

/// Compute device requested for inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl FromStr for Device {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => {
                let index = other.strip_prefix("cuda:").unwrap_or(other);
                index
                    .parse::<usize>()
                    .map(Device::Cuda)
                    .map_err(|_| SettingsError::Device(value.clone()))
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f32 },
    #[error("unknown device {0:?}; expected cpu, cuda, cuda:N or N")]
    Device(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionSettings {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub device: Device,
    pub half: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
            device: Device::Cpu,
            half: false,
        }
    }
}

impl DetectionSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_unit("confidence", self.confidence_threshold)?;
        check_unit("iou", self.iou_threshold)
    }

    /// Apply the fields present in `update`, leaving the others untouched.
    pub fn merged(&self, update: &SettingsUpdate) -> Result<Self, SettingsError> {
        let mut next = self.clone();
        if let Some(confidence) = update.confidence {
            next.confidence_threshold = confidence;
        }
        if let Some(iou) = update.iou {
            next.iou_threshold = iou;
        }
        if let Some(device) = update.device.as_deref() {
            next.device = device.parse()?;
        }
        if let Some(half) = update.half {
            next.half = half;
        }
        next.validate()?;
        Ok(next)
    }
}

fn check_unit(name: &'static str, value: f32) -> Result<(), SettingsError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::OutOfRange { name, value })
    }
}

/// Partial update accepted by the settings endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub confidence: Option<f32>,
    pub iou: Option<f32>,
    pub device: Option<String>,
    pub half: Option<bool>,
}

/// Process-wide settings cell. Writers replace the whole value (last write
/// wins); readers take snapshots.
#[derive(Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<DetectionSettings>>,
    version: Arc<AtomicU64>,
}

impl SharedSettings {
    pub fn new(initial: DetectionSettings) -> Result<Self, SettingsError> {
        initial.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(initial)),
            version: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn snapshot(&self) -> DetectionSettings {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Bumped on every successful update.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn apply(&self, update: &SettingsUpdate) -> Result<DetectionSettings, SettingsError> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = guard.merged(update)?;
        *guard = next.clone();
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            version,
            confidence = next.confidence_threshold,
            iou = next.iou_threshold,
            device = %next.device,
            half = next.half,
            "detection settings updated"
        );
        Ok(next)
    }

    /// Per-job view refreshing from this cell every `refresh_every` frames.
    pub fn view(&self, refresh_every: u32) -> SettingsView {
        SettingsView {
            shared: self.clone(),
            current: self.snapshot(),
            seen_version: self.version(),
            refresh_every: refresh_every.max(1),
            since_refresh: 0,
        }
    }
}

/// Settings as seen by one running job: captured at start, then re-read from
/// the shared cell at most once every `refresh_every` processed frames.
pub struct SettingsView {
    shared: SharedSettings,
    current: DetectionSettings,
    seen_version: u64,
    refresh_every: u32,
    since_refresh: u32,
}

impl SettingsView {
    /// Settings for the next processed frame.
    pub fn next_frame(&mut self) -> &DetectionSettings {
        if self.since_refresh >= self.refresh_every {
            self.since_refresh = 0;
            let version = self.shared.version();
            if version != self.seen_version {
                self.current = self.shared.snapshot();
                self.seen_version = version;
                debug!(version, "job picked up new detection settings");
            }
        }
        self.since_refresh += 1;
        &self.current
    }

    pub fn current(&self) -> &DetectionSettings {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_parse_in_every_accepted_spelling() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn partial_update_keeps_unspecified_fields() {
        let shared = SharedSettings::default();
        let next = shared
            .apply(&SettingsUpdate {
                confidence: Some(0.6),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert_eq!(next.confidence_threshold, 0.6);
        assert_eq!(next.iou_threshold, DEFAULT_IOU);
        assert_eq!(shared.version(), 1);
    }

    #[test]
    fn invalid_update_is_rejected_and_not_applied() {
        let shared = SharedSettings::default();
        let err = shared
            .apply(&SettingsUpdate {
                iou: Some(1.5),
                confidence: Some(0.9),
                ..SettingsUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, SettingsError::OutOfRange { name: "iou", .. }));
        assert_eq!(shared.snapshot(), DetectionSettings::default());
        assert_eq!(shared.version(), 0);
    }

    #[test]
    fn view_picks_up_updates_only_at_refresh_points() {
        let shared = SharedSettings::default();
        let mut view = shared.view(3);
        assert_eq!(view.next_frame().confidence_threshold, DEFAULT_CONFIDENCE);

        shared
            .apply(&SettingsUpdate {
                confidence: Some(0.8),
                ..SettingsUpdate::default()
            })
            .unwrap();

        assert_eq!(view.next_frame().confidence_threshold, DEFAULT_CONFIDENCE);
        assert_eq!(view.next_frame().confidence_threshold, DEFAULT_CONFIDENCE);
        assert_eq!(view.next_frame().confidence_threshold, 0.8);
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = DetectionSettings {
            device: Device::Cuda(1),
            ..DetectionSettings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"cuda:1\""));
        let back: DetectionSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }
}
