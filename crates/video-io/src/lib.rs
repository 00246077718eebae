//! Frame-level video input and output.
//!
//! [`MediaSource`] pulls decoded RGB frames from files or cameras and
//! [`MediaSink`] encodes frames back into a container. Both own their OS
//! handles exclusively and release them on `close()` or drop.

mod ffmpeg;
mod locator;
mod sink;
mod source;
mod types;
mod y4m;

pub use locator::SourceLocator;
pub use sink::{FrameWriter, MediaSink};
pub use source::{FrameReader, MediaSource};
pub use types::{Frame, FrameCount, FrameFormat, Geometry, MediaError, SourceProperties};
