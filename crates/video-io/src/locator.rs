use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Where a [`MediaSource`](crate::MediaSource) reads its frames from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocator {
    File(PathBuf),
    Camera(u32),
}

impl SourceLocator {
    /// Interpret a user supplied string. Bare integers and `/dev/videoN` name a camera,
    /// everything else is treated as a file path.
    pub fn parse(uri: &str) -> Self {
        match parse_device_index(uri) {
            Some(index) => SourceLocator::Camera(index),
            None => SourceLocator::File(PathBuf::from(uri)),
        }
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        SourceLocator::File(path.as_ref().to_path_buf())
    }

    pub fn is_camera(&self) -> bool {
        matches!(self, SourceLocator::Camera(_))
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::File(path) => write!(f, "{}", path.display()),
            SourceLocator::Camera(index) => write!(f, "/dev/video{index}"),
        }
    }
}

pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<u32>().ok();
        }
    }
    None
}

/// True when the path carries the given extension, ignoring case.
pub(crate) fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_indices_become_cameras() {
        assert_eq!(SourceLocator::parse("0"), SourceLocator::Camera(0));
        assert_eq!(SourceLocator::parse("/dev/video2"), SourceLocator::Camera(2));
    }

    #[test]
    fn other_strings_are_files() {
        assert_eq!(
            SourceLocator::parse("/dev/videox"),
            SourceLocator::File(PathBuf::from("/dev/videox"))
        );
        assert_eq!(
            SourceLocator::parse("uploads/clip.mp4"),
            SourceLocator::File(PathBuf::from("uploads/clip.mp4"))
        );
        assert!(!SourceLocator::parse("/dev/video").is_camera());
    }

    #[test]
    fn camera_display_uses_v4l_path() {
        assert_eq!(SourceLocator::Camera(3).to_string(), "/dev/video3");
    }
}
