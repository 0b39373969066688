//! Upload staging: file name hygiene, image type check, scoped temp file.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Extensions accepted by `/recognize`.
const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tiff", "tif", "bmp"];

/// Strip path components and anything outside `[A-Za-z0-9._-]`.
pub fn sanitize_filename(name: &str) -> String {
    // Keep only the last path component, whichever separator the client used
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = base
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.replace("..", "");
    let cleaned: String = cleaned.trim_start_matches('.').chars().take(100).collect();

    if cleaned.is_empty() {
        "upload".into()
    } else {
        cleaned
    }
}

/// True when the name has an allowed extension and guesses as an image type.
pub fn is_supported_image(filename: &str) -> bool {
    let extension_ok = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false);

    extension_ok
        && mime_guess::from_path(filename)
            .first()
            .map(|mime| mime.type_() == mime_guess::mime::IMAGE)
            .unwrap_or(false)
}

/// An uploaded file on disk, deleted when dropped.
pub struct StagedUpload {
    path: PathBuf,
}

impl StagedUpload {
    /// Write `bytes` under `dir` as `<uuid>_<sanitized name>`.
    pub async fn write(dir: &Path, filename: &str, bytes: &[u8]) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}_{}", Uuid::new_v4(), sanitize_filename(filename)));
        tokio::fs::write(&path, bytes).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove upload: {e}");
            }
        }
    }
}
