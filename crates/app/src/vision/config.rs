//! Configuration parsing for the server and the one-shot batch command.
//!
//! CLI arguments (and their `YOLO_*` environment fallbacks) are translated into
//! validated config structs here so downstream code never re-checks flags.

use std::{net::IpAddr, num::NonZeroU64, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Args;
use ml_core::{DetectionSettings, Device, SettingsUpdate};
use video_io::SourceLocator;

const MIB: usize = 1024 * 1024;

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
/// Everything needed to load a detector and seed the shared settings cell.
pub struct DetectorConfig {
    pub model_path: Option<PathBuf>,
    pub class_names_path: Option<PathBuf>,
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub settings: DetectionSettings,
}

#[derive(Clone, Debug)]
/// Knobs for the live WebSocket sessions.
pub struct LiveConfig {
    /// Run detection on every n-th frame of an ingested video.
    pub stride: NonZeroU64,
    /// Minimum delay between two outgoing frame envelopes.
    pub pacing: Duration,
    pub jpeg_quality: u8,
    pub settings_refresh_frames: u32,
    /// Largest single WebSocket message accepted, in bytes.
    pub max_message_bytes: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            stride: NonZeroU64::new(3).unwrap_or(NonZeroU64::MIN),
            pacing: Duration::from_millis(50),
            jpeg_quality: 85,
            settings_refresh_frames: 30,
            max_message_bytes: 64 * MIB,
        }
    }
}

#[derive(Clone, Debug)]
/// Canonical configuration of the HTTP/WebSocket server.
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Uploads land here; annotated outputs go to `<upload_dir>/results`.
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Frames between two reads of the shared settings in batch jobs.
    pub settings_refresh_frames: u32,
    /// Camera jobs stop after this many frames.
    pub camera_frame_limit: u64,
    pub live: LiveConfig,
    pub detector: DetectorConfig,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
/// One batch job run from the command line.
pub struct ProcessConfig {
    pub source: SourceLocator,
    pub output: PathBuf,
    pub stride: NonZeroU64,
    pub frame_limit: Option<u64>,
    pub settings_refresh_frames: u32,
    pub detector: DetectorConfig,
    pub telemetry: TelemetryOptions,
}

/// Detector arguments shared by `serve` and `process`.
#[derive(Debug, Args)]
pub struct DetectorArgs {
    /// TorchScript YOLO model path.
    #[arg(long = "model", value_name = "PATH", env = "YOLO_MODEL")]
    pub model: Option<PathBuf>,
    /// Newline separated class names, one per model output class.
    #[arg(long = "class-names", value_name = "PATH", env = "YOLO_CLASS_NAMES")]
    pub class_names: Option<PathBuf>,
    /// Model input size in pixels.
    #[arg(long = "input-size", value_name = "PX", env = "YOLO_INPUT_SIZE", default_value_t = 640)]
    pub input_size: u32,
    /// Minimum confidence for a detection to be kept (0-1).
    #[arg(long = "confidence", value_name = "SCORE", env = "YOLO_CONFIDENCE", default_value_t = ml_core::settings::DEFAULT_CONFIDENCE)]
    pub confidence: f32,
    /// IoU threshold used by non-maximum suppression (0-1).
    #[arg(long = "iou", value_name = "SCORE", env = "YOLO_IOU", default_value_t = ml_core::settings::DEFAULT_IOU)]
    pub iou: f32,
    /// Inference device: cpu, cuda, cuda:N or N.
    #[arg(long = "device", value_name = "DEVICE", env = "YOLO_DEVICE", default_value = "cpu")]
    pub device: String,
    /// Run the model in half precision (CUDA only).
    #[arg(long = "half", env = "YOLO_HALF", action = clap::ArgAction::SetTrue)]
    pub half: bool,
}

impl TryFrom<DetectorArgs> for DetectorConfig {
    type Error = anyhow::Error;

    fn try_from(args: DetectorArgs) -> Result<Self> {
        if args.input_size == 0 || args.input_size % 32 != 0 {
            bail!("--input-size must be a positive multiple of 32");
        }
        let device: Device = args
            .device
            .parse()
            .with_context(|| format!("invalid --device {}", args.device))?;
        let settings = DetectionSettings::default().merged(&SettingsUpdate {
            confidence: Some(args.confidence),
            iou: Some(args.iou),
            device: Some(device.to_string()),
            half: Some(args.half),
        })?;
        if settings.half && settings.device == Device::Cpu {
            bail!("--half requires a CUDA device");
        }
        if let Some(path) = args.model.as_ref() {
            if !path.exists() {
                bail!("model not found at {}", path.display());
            }
        }
        Ok(Self {
            model_path: args.model,
            class_names_path: args.class_names,
            input_size: args.input_size,
            settings,
        })
    }
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long = "bind", value_name = "ADDR", env = "YOLO_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,
    /// TCP port to listen on.
    #[arg(long = "port", value_name = "PORT", env = "YOLO_PORT", default_value_t = 8000)]
    pub port: u16,
    /// Directory for uploads and annotated results.
    #[arg(long = "upload-dir", value_name = "DIR", env = "YOLO_UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,
    /// Largest accepted upload, in MiB.
    #[arg(long = "max-upload-mib", value_name = "MIB", env = "YOLO_MAX_UPLOAD_MIB", default_value_t = 10)]
    pub max_upload_mib: usize,
    /// Run detection on every n-th frame of live uploads.
    #[arg(long = "live-stride", value_name = "N", env = "YOLO_LIVE_STRIDE", default_value_t = 3)]
    pub live_stride: u64,
    /// Minimum milliseconds between two live frame messages.
    #[arg(long = "live-pacing-ms", value_name = "MS", env = "YOLO_LIVE_PACING_MS", default_value_t = 50)]
    pub live_pacing_ms: u64,
    /// JPEG quality of streamed frames (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", env = "YOLO_JPEG_QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Frames between two reads of the shared detection settings.
    #[arg(long = "settings-refresh", value_name = "FRAMES", env = "YOLO_SETTINGS_REFRESH", default_value_t = 30)]
    pub settings_refresh: u32,
    /// Frames captured by one camera job.
    #[arg(long = "camera-frames", value_name = "N", env = "YOLO_CAMERA_FRAMES", default_value_t = 300)]
    pub camera_frames: u64,
    #[command(flatten)]
    pub detector: DetectorArgs,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        if args.max_upload_mib == 0 {
            bail!("--max-upload-mib must be at least 1");
        }
        let Some(stride) = NonZeroU64::new(args.live_stride) else {
            bail!("--live-stride must be at least 1");
        };
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.settings_refresh == 0 {
            bail!("--settings-refresh must be at least 1");
        }
        if args.camera_frames == 0 {
            bail!("--camera-frames must be at least 1");
        }
        let max_upload_bytes = args
            .max_upload_mib
            .checked_mul(MIB)
            .context("--max-upload-mib is too large")?;

        Ok(Self {
            bind: args.bind,
            port: args.port,
            upload_dir: args.upload_dir,
            max_upload_bytes,
            settings_refresh_frames: args.settings_refresh,
            camera_frame_limit: args.camera_frames,
            live: LiveConfig {
                stride,
                pacing: Duration::from_millis(args.live_pacing_ms),
                jpeg_quality: args.jpeg_quality,
                settings_refresh_frames: args.settings_refresh,
                max_message_bytes: max_upload_bytes.max(LiveConfig::default().max_message_bytes),
            },
            detector: args.detector.try_into()?,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

/// CLI arguments accepted by the `process` subcommand.
#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Video file or camera (`/dev/videoN` or a bare index).
    #[arg(value_name = "SOURCE")]
    pub source: String,
    /// Annotated output path (`.mp4`, or `.y4m` for raw output).
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,
    /// Run detection on every n-th frame, copying the others through.
    #[arg(long = "stride", value_name = "N", default_value_t = 1)]
    pub stride: u64,
    /// Stop after this many frames. Required for cameras.
    #[arg(long = "max-frames", value_name = "N")]
    pub max_frames: Option<u64>,
    /// Frames between two reads of the shared detection settings.
    #[arg(long = "settings-refresh", value_name = "FRAMES", default_value_t = 30)]
    pub settings_refresh: u32,
    #[command(flatten)]
    pub detector: DetectorArgs,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<ProcessArgs> for ProcessConfig {
    type Error = anyhow::Error;

    fn try_from(args: ProcessArgs) -> Result<Self> {
        let source = SourceLocator::parse(&args.source);
        let Some(stride) = NonZeroU64::new(args.stride) else {
            bail!("--stride must be at least 1");
        };
        if args.max_frames == Some(0) {
            bail!("--max-frames must be at least 1");
        }
        if source.is_camera() && args.max_frames.is_none() {
            bail!("--max-frames is required when reading from a camera");
        }
        if args.settings_refresh == 0 {
            bail!("--settings-refresh must be at least 1");
        }
        Ok(Self {
            source,
            output: args.output,
            stride,
            frame_limit: args.max_frames,
            settings_refresh_frames: args.settings_refresh,
            detector: args.detector.try_into()?,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct ServeHarness {
        #[command(flatten)]
        args: ServeArgs,
    }

    #[derive(Parser)]
    struct ProcessHarness {
        #[command(flatten)]
        args: ProcessArgs,
    }

    fn serve(argv: &[&str]) -> Result<ServerConfig> {
        let mut full = vec!["serve"];
        full.extend_from_slice(argv);
        ServeHarness::try_parse_from(full)?.args.try_into()
    }

    fn process(argv: &[&str]) -> Result<ProcessConfig> {
        let mut full = vec!["process"];
        full.extend_from_slice(argv);
        ProcessHarness::try_parse_from(full)?.args.try_into()
    }

    #[test]
    fn serve_defaults_match_documented_values() {
        let config = serve(&[]).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_upload_bytes, 10 * MIB);
        assert_eq!(config.live.stride.get(), 3);
        assert_eq!(config.live.pacing, Duration::from_millis(50));
        assert_eq!(config.detector.settings, DetectionSettings::default());
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
    }

    #[test]
    fn serve_rejects_out_of_range_values() {
        assert!(serve(&["--live-stride", "0"]).is_err());
        assert!(serve(&["--jpeg-quality", "0"]).is_err());
        assert!(serve(&["--confidence", "1.5"]).is_err());
        assert!(serve(&["--device", "tpu"]).is_err());
        assert!(serve(&["--half"]).is_err());
        assert!(serve(&["--input-size", "100"]).is_err());
    }

    #[test]
    fn serve_accepts_cuda_half() {
        let config = serve(&["--device", "cuda:1", "--half"]).unwrap();
        assert_eq!(config.detector.settings.device, Device::Cuda(1));
        assert!(config.detector.settings.half);
    }

    #[test]
    fn process_requires_frame_limit_for_cameras() {
        assert!(process(&["/dev/video0", "out.mp4"]).is_err());
        let config = process(&["0", "out.mp4", "--max-frames", "10"]).unwrap();
        assert_eq!(config.source, SourceLocator::Camera(0));
        assert_eq!(config.frame_limit, Some(10));
    }

    #[test]
    fn process_rejects_zero_stride() {
        assert!(process(&["in.mp4", "out.mp4", "--stride", "0"]).is_err());
        let config = process(&["in.mp4", "out.mp4", "--stride", "2"]).unwrap();
        assert_eq!(config.stride.get(), 2);
    }
}
