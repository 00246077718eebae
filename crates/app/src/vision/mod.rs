//! Object detection over video files, cameras and live WebSocket streams.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing and validation.
//! - `sampler`: which frames of a stream reach the detector.
//! - `pipeline`: source → sampler → detector → output job driver.
//! - `live`: WebSocket-style sessions (frame relay and video ingestion).
//! - `envelope`: JSON messages sent to live clients.
//! - `encoding`: JPEG and base64 conversions.
//! - `uploads`: on-disk layout of uploads and results.
//! - `server`: Actix Web routes.
//! - `backend`: detector construction.
//! - `telemetry`: tracing subscriber and Prometheus recorder.

pub mod backend;
pub mod config;
pub mod encoding;
pub mod envelope;
pub mod live;
pub mod pipeline;
pub mod sampler;
pub mod server;
pub mod telemetry;
pub mod uploads;

pub use config::{ProcessArgs, ProcessConfig, ServeArgs, ServerConfig};
pub use pipeline::{BatchSummary, PipelineError, PipelineJob, VideoPipeline};
