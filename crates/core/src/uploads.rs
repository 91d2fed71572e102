use crate::error::{IngestError, PipelineError};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;
use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["pdf", "png", "jpg", "jpeg", "tiff", "tif", "txt"];

const MAX_FILENAME_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Image,
    PlainText,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(SourceKind::Pdf),
            "png" | "jpg" | "jpeg" | "tiff" | "tif" => Ok(SourceKind::Image),
            "txt" => Ok(SourceKind::PlainText),
            _ => Err(IngestError::UnsupportedFileType(format!(
                "{} ({})",
                path.display(),
                if extension.is_empty() { "no extension" } else { extension.as_str() }
            ))),
        }
    }

    pub fn media_type(self, path: &Path) -> &'static str {
        match self {
            SourceKind::Pdf => "application/pdf",
            SourceKind::PlainText => "text/plain",
            SourceKind::Image => {
                let extension = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.to_ascii_lowercase());
                match extension.as_deref() {
                    Some("png") => "image/png",
                    Some("tiff") | Some("tif") => "image/tiff",
                    _ => "image/jpeg",
                }
            }
        }
    }
}

pub fn is_supported(path: &Path) -> bool {
    SourceKind::from_path(path).is_ok()
}

fn unsafe_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static pattern is valid"))
}

/// Keeps only the final path component, replaces unsafe runs with `_` and
/// caps the length. Never returns an empty name.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let replaced = unsafe_chars().replace_all(base, "_");
    let trimmed = replaced.trim_matches(|c| c == '.' || c == '_');

    if trimmed.is_empty() {
        return "upload".to_string();
    }
    trimmed.chars().take(MAX_FILENAME_CHARS).collect()
}

/// Rejects anything that is not a bare filename.
pub fn validate_filename(filename: &str) -> Result<&str, PipelineError> {
    let is_bare = !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains('/')
        && !filename.contains('\\');
    if is_bare {
        Ok(filename)
    } else {
        Err(PipelineError::InvalidFilename(filename.to_string()))
    }
}

/// Source uploads, kept apart from derived outputs.
#[derive(Debug, Clone)]
pub struct UploadStore {
    data_dir: PathBuf,
}

impl UploadStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    /// Writes `bytes` under the sanitized name and returns that name.
    pub fn save(&self, filename: &str, bytes: &[u8]) -> Result<String, IngestError> {
        let safe_name = sanitize_filename(filename);
        SourceKind::from_path(Path::new(&safe_name))?;

        fs::create_dir_all(&self.data_dir)?;
        fs::write(self.path_for(&safe_name), bytes)?;
        info!(filename = %safe_name, bytes = bytes.len(), "stored upload");
        Ok(safe_name)
    }

    pub fn remove(&self, filename: &str) -> Result<bool, IngestError> {
        let path = self.path_for(filename);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    /// Supported files directly inside the data dir, sorted by name.
    pub fn discover(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.data_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|item| item.ok())
            .filter(|entry| entry.file_type().is_file() && is_supported(entry.path()))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();

        files.sort_unstable();
        files
    }
}
