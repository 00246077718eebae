use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Raw RGB frame decoded from a video source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Rgb8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Rgb8 => 3,
        }
    }
}

impl Frame {
    /// Wrap an RGB8 buffer, validating its length against the declared geometry.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, MediaError> {
        let expected = rgb_frame_len(width, height);
        if data.len() != expected {
            return Err(MediaError::Decode(format!(
                "rgb buffer holds {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format: FrameFormat::Rgb8,
        })
    }

    /// Frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(rgb_frame_len(width, height))
            .collect();
        Self {
            data,
            width,
            height,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format: FrameFormat::Rgb8,
        }
    }

    pub fn geometry(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

pub(crate) fn rgb_frame_len(width: u32, height: u32) -> usize {
    (width as usize) * (height as usize) * FrameFormat::Rgb8.bytes_per_pixel()
}

/// Number of frames a source will yield. Live cameras never know it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameCount {
    Known(u64),
    Unknown,
}

impl FrameCount {
    pub fn known(self) -> Option<u64> {
        match self {
            FrameCount::Known(count) => Some(count),
            FrameCount::Unknown => None,
        }
    }
}

/// Native stream properties reported by a source after opening.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceProperties {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: FrameCount,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("video source {locator} unavailable: {reason}")]
    SourceUnavailable { locator: String, reason: String },
    #[error("cannot open sink {}: {reason}", path.display())]
    SinkUnavailable { path: PathBuf, reason: String },
    #[error("frame is {actual} but the sink was opened for {expected}")]
    FrameGeometryMismatch { expected: Geometry, actual: Geometry },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
