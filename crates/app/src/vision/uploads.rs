//! On-disk layout for uploaded media and annotated results.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::warn;
use uuid::Uuid;

const RESULTS_DIR: &str = "results";

/// `<root>` holds uploads, `<root>/results` holds annotated outputs.
#[derive(Clone, Debug)]
pub struct UploadStore {
    root: PathBuf,
    results: PathBuf,
}

/// An upload persisted to disk.
#[derive(Clone, Debug)]
pub struct StoredUpload {
    pub path: PathBuf,
    /// Unique file name shared by the upload and its result.
    pub name: String,
}

impl UploadStore {
    /// Create both directories if needed.
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let results = root.join(RESULTS_DIR);
        fs::create_dir_all(&results)?;
        Ok(Self { root, results })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist `bytes` under a unique name derived from the client's file name.
    pub fn save(&self, client_name: Option<&str>, fallback: &str, bytes: &[u8]) -> io::Result<StoredUpload> {
        let name = unique_name(client_name, fallback);
        let path = self.root.join(&name);
        fs::write(&path, bytes)?;
        Ok(StoredUpload { path, name })
    }

    /// Absolute path of a result file.
    pub fn result_path(&self, name: &str) -> PathBuf {
        self.results.join(name)
    }

    /// Path of a result relative to the store root, as reported to clients.
    pub fn result_ref(name: &str) -> String {
        format!("{RESULTS_DIR}/{name}")
    }

    pub fn discard(&self, upload: &StoredUpload) {
        match fs::remove_file(&upload.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove upload {}: {err}", upload.path.display()),
        }
    }
}

/// Keep only the final path component and a conservative character set, then
/// prefix a random tag so concurrent uploads of the same file never collide.
pub fn unique_name(client_name: Option<&str>, fallback: &str) -> String {
    let base = client_name
        .and_then(|raw| Path::new(raw).file_name())
        .and_then(|name| name.to_str())
        .map(|name| {
            name.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        })
        .filter(|name| !name.trim_matches('.').is_empty())
        .unwrap_or_else(|| fallback.to_string());
    let tag = Uuid::new_v4().simple().to_string();
    format!("{}-{base}", &tag[..8])
}

/// Replace the extension of `name`.
pub fn with_extension(name: &str, ext: &str) -> String {
    Path::new(name)
        .with_extension(ext)
        .to_string_lossy()
        .into_owned()
}
