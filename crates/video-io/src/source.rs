use tracing::debug;

use crate::{
    ffmpeg::FfmpegReader,
    locator::{SourceLocator, has_extension},
    types::{Frame, MediaError, SourceProperties},
    y4m::Y4mReader,
};

/// Decoder backend behind a [`MediaSource`].
pub trait FrameReader: Send {
    fn properties(&self) -> SourceProperties;
    /// Next frame in decode order, `None` once the stream is exhausted.
    fn read_frame(&mut self) -> Result<Option<Frame>, MediaError>;
    /// Release the decode handle. Called at most once by [`MediaSource`].
    fn close(&mut self);
}

/// An opened video input. Owns its decoder until [`MediaSource::close`] or drop.
pub struct MediaSource {
    locator: String,
    props: SourceProperties,
    reader: Option<Box<dyn FrameReader>>,
}

impl MediaSource {
    /// Open a file or camera. Fails with [`MediaError::SourceUnavailable`] without
    /// leaving any handle behind.
    pub fn open(locator: &SourceLocator) -> Result<Self, MediaError> {
        let unavailable = |reason: String| MediaError::SourceUnavailable {
            locator: locator.to_string(),
            reason,
        };

        let reader: Box<dyn FrameReader> = match locator {
            SourceLocator::File(path) => {
                if !path.is_file() {
                    return Err(unavailable("no such file".into()));
                }
                if has_extension(path, "y4m") {
                    Box::new(Y4mReader::open(path).map_err(unavailable)?)
                } else {
                    Box::new(FfmpegReader::spawn(locator).map_err(unavailable)?)
                }
            }
            SourceLocator::Camera(_) => {
                Box::new(FfmpegReader::spawn(locator).map_err(unavailable)?)
            }
        };

        Ok(Self::from_reader(locator.to_string(), reader))
    }

    /// Wrap an already opened backend.
    pub fn from_reader(locator: impl Into<String>, reader: Box<dyn FrameReader>) -> Self {
        let props = reader.properties();
        let locator = locator.into();
        debug!(
            source = %locator,
            width = props.width,
            height = props.height,
            fps = props.fps,
            "opened video source"
        );
        Self {
            locator,
            props,
            reader: Some(reader),
        }
    }

    pub fn properties(&self) -> SourceProperties {
        self.props
    }

    /// Returns `Ok(None)` at end of stream, and after [`close`](Self::close).
    pub fn read_next_frame(&mut self) -> Result<Option<Frame>, MediaError> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_frame(),
            None => Ok(None),
        }
    }

    /// Release the decoder. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
            debug!(source = %self.locator, "closed video source");
        }
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.close();
    }
}
