use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    ffmpeg::FfmpegWriter,
    locator::has_extension,
    types::{Frame, Geometry, MediaError},
    y4m::Y4mWriter,
};

/// Encoder backend behind a [`MediaSink`].
pub trait FrameWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), MediaError>;
    /// Flush buffered frames and the container trailer.
    fn finish(&mut self) -> Result<(), MediaError>;
    /// Stop encoding without finalising the container.
    fn abort(&mut self);
}

/// An output video file being written.
///
/// The destination either ends up as a complete stream or does not exist:
/// closing a sink that never received a frame, aborting it, or dropping it
/// without a successful [`close`](Self::close) removes the file.
pub struct MediaSink {
    path: PathBuf,
    geometry: Geometry,
    frames_written: u64,
    writer: Option<Box<dyn FrameWriter>>,
}

impl MediaSink {
    /// Create the destination (and its parent directories) and start an encoder.
    /// `.y4m` destinations are written natively, anything else through ffmpeg.
    pub fn open(path: impl AsRef<Path>, width: u32, height: u32, fps: f64) -> Result<Self, MediaError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |reason: String| MediaError::SinkUnavailable {
            path: path.clone(),
            reason,
        };

        if width == 0 || height == 0 {
            return Err(unavailable(format!("invalid geometry {width}x{height}")));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| unavailable(err.to_string()))?;
        }

        let opened: Result<Box<dyn FrameWriter>, String> = if has_extension(&path, "y4m") {
            Y4mWriter::create(&path, width, height, fps).map(|w| Box::new(w) as Box<dyn FrameWriter>)
        } else {
            // ffmpeg only opens its output after the first input frame arrives.
            fs::File::create(&path).map_err(|err| unavailable(err.to_string()))?;
            FfmpegWriter::spawn(&path, width, height, fps).map(|w| Box::new(w) as Box<dyn FrameWriter>)
        };
        let writer = match opened {
            Ok(writer) => writer,
            Err(reason) => {
                remove_quietly(&path);
                return Err(unavailable(reason));
            }
        };

        Ok(Self::from_writer(path, width, height, writer))
    }

    /// Wrap an already opened backend writing to `path`.
    pub fn from_writer(
        path: impl Into<PathBuf>,
        width: u32,
        height: u32,
        writer: Box<dyn FrameWriter>,
    ) -> Self {
        let path = path.into();
        debug!(sink = %path.display(), width, height, "opened video sink");
        Self {
            path,
            geometry: Geometry { width, height },
            frames_written: 0,
            writer: Some(writer),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Append one frame. Its geometry must match the one declared at open.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), MediaError> {
        let actual = Geometry {
            width: frame.width,
            height: frame.height,
        };
        if actual != self.geometry {
            return Err(MediaError::FrameGeometryMismatch {
                expected: self.geometry,
                actual,
            });
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| MediaError::Encode("sink already closed".into()))?;
        writer.write_frame(frame)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Finalise the container. A sink that never received a frame is deleted
    /// instead. Calling `close` again is a no-op.
    pub fn close(&mut self) -> Result<(), MediaError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        if self.frames_written == 0 {
            writer.abort();
            remove_quietly(&self.path);
            debug!(sink = %self.path.display(), "closed empty sink, destination removed");
            return Ok(());
        }
        match writer.finish() {
            Ok(()) => {
                debug!(
                    sink = %self.path.display(),
                    frames = self.frames_written,
                    "closed video sink"
                );
                Ok(())
            }
            Err(err) => {
                remove_quietly(&self.path);
                Err(err)
            }
        }
    }

    /// Stop encoding and delete the destination. Used on failure paths.
    pub fn abort(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.abort();
            remove_quietly(&self.path);
            debug!(sink = %self.path.display(), "aborted video sink, destination removed");
        }
    }
}

impl Drop for MediaSink {
    fn drop(&mut self) {
        self.abort();
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MediaSource, SourceLocator, types::FrameCount};

    #[test]
    fn close_without_frames_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/empty.y4m");
        let mut sink = MediaSink::open(&path, 8, 8, 30.0).unwrap();
        assert!(path.exists());
        sink.close().unwrap();
        assert!(!path.exists());
        sink.close().unwrap();
    }

    #[test]
    fn uncreatable_encoded_destination_fails_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.mp4");
        fs::create_dir(&path).unwrap();
        let err = MediaSink::open(&path, 8, 8, 30.0).err().unwrap();
        assert!(matches!(err, MediaError::SinkUnavailable { .. }));
        assert!(path.is_dir());
    }

    #[test]
    fn parent_directories_are_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c/clip.y4m");
        let mut sink = MediaSink::open(&path, 4, 4, 25.0).unwrap();
        sink.write_frame(&Frame::solid(4, 4, [1, 2, 3])).unwrap();
        sink.close().unwrap();
        assert!(path.metadata().unwrap().len() > 0);
    }

    #[test]
    fn mismatched_geometry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = MediaSink::open(dir.path().join("geom.y4m"), 4, 4, 25.0).unwrap();
        let err = sink.write_frame(&Frame::solid(8, 4, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, MediaError::FrameGeometryMismatch { .. }));
        assert_eq!(sink.frames_written(), 0);
    }

    #[test]
    fn dropping_an_unclosed_sink_deletes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.y4m");
        {
            let mut sink = MediaSink::open(&path, 4, 4, 25.0).unwrap();
            sink.write_frame(&Frame::solid(4, 4, [9, 9, 9])).unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn written_stream_reads_back_frame_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.y4m");
        let mut sink = MediaSink::open(&path, 6, 4, 30.0).unwrap();
        for _ in 0..7 {
            sink.write_frame(&Frame::solid(6, 4, [40, 80, 120])).unwrap();
        }
        sink.close().unwrap();

        let source = MediaSource::open(&SourceLocator::file(&path)).unwrap();
        let props = source.properties();
        assert_eq!(props.frame_count, FrameCount::Known(7));
        assert_eq!((props.width, props.height), (6, 4));
        assert_eq!(props.fps, 30.0);
    }

    #[test]
    fn closing_one_sink_leaves_another_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = MediaSink::open(dir.path().join("a.y4m"), 4, 4, 25.0).unwrap();
        let mut second = MediaSink::open(dir.path().join("b.y4m"), 4, 4, 25.0).unwrap();
        first.write_frame(&Frame::solid(4, 4, [0, 0, 0])).unwrap();
        second.write_frame(&Frame::solid(4, 4, [0, 0, 0])).unwrap();
        first.abort();
        second.write_frame(&Frame::solid(4, 4, [0, 0, 0])).unwrap();
        second.close().unwrap();
        assert!(!dir.path().join("a.y4m").exists());
        assert_eq!(second.frames_written(), 2);
    }
}
