//! Text extraction stage: uploaded source file -> `<output_dir>/<filename>.txt`.
//!
//! PDFs with enough embedded text skip OCR entirely. Scanned PDFs and images
//! go to the configured [`OcrEngine`]; plain text is read as-is.

use crate::error::{CollaboratorError, IngestError};
use crate::models::{Document, Stage};
use crate::retry::RetryPolicy;
use crate::traits::{OcrEngine, StageAdapter};
use crate::uploads::{SourceKind, UploadStore};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document as PdfDocument;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Pages with at most this many trimmed characters count as image-only.
pub const MIN_CHARS_PER_PAGE: usize = 50;
/// Share of text-bearing pages above which embedded text is trusted.
pub const DIGITAL_CONFIDENCE_THRESHOLD: f64 = 0.85;
pub const PAGE_BREAK: &str = "\n\n--- PAGE BREAK ---\n\n";

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Embedded text per page, empty pages included.
pub fn extract_pdf_pages(path: &Path) -> Result<Vec<String>, IngestError> {
    let document =
        PdfDocument::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for page_no in document.get_pages().keys() {
        let text = document.extract_text(&[*page_no]).unwrap_or_default();
        pages.push(text);
    }
    Ok(pages)
}

pub fn digital_confidence(pages: &[String]) -> f64 {
    if pages.is_empty() {
        return 0.0;
    }
    let digital = pages
        .iter()
        .filter(|text| text.trim().chars().count() > MIN_CHARS_PER_PAGE)
        .count();
    digital as f64 / pages.len() as f64
}

/// Joined embedded text when the PDF is digital enough, otherwise `None`.
pub fn embedded_text_if_digital(pages: &[String]) -> Option<String> {
    if digital_confidence(pages) > DIGITAL_CONFIDENCE_THRESHOLD {
        Some(pages.join("\n\n"))
    } else {
        None
    }
}

pub fn text_artifact_path(output_dir: &Path, filename: &str) -> PathBuf {
    output_dir.join(format!("{filename}.txt"))
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    file_base64: String,
    source_path: String,
    media_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

/// OCR over HTTP: posts the file base64-encoded, reads back page texts.
pub struct HttpOcrEngine {
    config: OcrEndpointConfig,
    client: Client,
}

impl HttpOcrEngine {
    pub fn new(config: OcrEndpointConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn recognize(&self, path: &Path) -> Result<String, IngestError> {
        let kind = SourceKind::from_path(path)?;
        let bytes = tokio::fs::read(path).await?;
        let payload = OcrRequest {
            file_base64: STANDARD.encode(bytes),
            source_path: path.to_string_lossy().to_string(),
            media_type: kind.media_type(path).to_string(),
        };

        let mut request = self.client.post(&self.config.endpoint).json(&payload);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(IngestError::OcrStatus {
                status: status.as_u16(),
                details,
            });
        }

        let payload: OcrResponse = response.json().await?;
        let pages = payload_to_pages(&payload, path)?;
        Ok(join_pages(&pages))
    }
}

fn join_pages(pages: &[PageText]) -> String {
    pages
        .iter()
        .map(|page| page.text.as_str())
        .collect::<Vec<_>>()
        .join(PAGE_BREAK)
}

fn payload_to_pages(payload: &OcrResponse, path: &Path) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let mut listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: page.page.unwrap_or(1),
                        text: text.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            listed.sort_by_key(|page| page.number);
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let normalized = chunk.trim();
                if normalized.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: normalized.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(format!(
        "OCR response was empty for {}",
        path.display()
    )))
}

pub struct OcrAdapter {
    uploads: UploadStore,
    output_dir: PathBuf,
    engine: Option<Arc<dyn OcrEngine>>,
    retry: RetryPolicy,
}

impl OcrAdapter {
    pub fn new(
        uploads: UploadStore,
        output_dir: impl Into<PathBuf>,
        engine: Option<Arc<dyn OcrEngine>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            uploads,
            output_dir: output_dir.into(),
            engine,
            retry,
        }
    }

    pub fn artifact_path(&self, filename: &str) -> PathBuf {
        text_artifact_path(&self.output_dir, filename)
    }

    async fn extract(&self, source: &Path, kind: SourceKind) -> Result<String, CollaboratorError> {
        match kind {
            SourceKind::PlainText => tokio::fs::read_to_string(source)
                .await
                .map_err(|error| CollaboratorError::from(IngestError::Io(error))),
            SourceKind::Image => self.recognize(source).await,
            SourceKind::Pdf => {
                let owned = source.to_path_buf();
                let parsed = tokio::task::spawn_blocking(move || extract_pdf_pages(&owned))
                    .await
                    .map_err(|error| CollaboratorError::permanent("ocr", error.to_string()))?;

                match parsed {
                    Ok(pages) => match embedded_text_if_digital(&pages) {
                        Some(text) => {
                            info!(source = %source.display(), "digital pdf, skipping OCR");
                            Ok(text)
                        }
                        None => {
                            info!(source = %source.display(), "low embedded text, running OCR");
                            self.recognize(source).await
                        }
                    },
                    Err(error) => {
                        debug!(source = %source.display(), error = %error, "pdf text check failed, running OCR");
                        self.recognize(source).await
                    }
                }
            }
        }
    }

    async fn recognize(&self, source: &Path) -> Result<String, CollaboratorError> {
        let engine = self.engine.as_ref().ok_or_else(|| {
            CollaboratorError::from(IngestError::OcrUnavailable(source.display().to_string()))
        })?;

        self.retry
            .run("ocr", || async move {
                engine.recognize(source).await.map_err(CollaboratorError::from)
            })
            .await
    }
}

#[async_trait]
impl StageAdapter for OcrAdapter {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn input_stage(&self) -> Stage {
        Stage::Uploaded
    }

    fn output_stage(&self) -> Stage {
        Stage::OcrComplete
    }

    async fn process(&self, document: &Document, force: bool) -> Result<(), CollaboratorError> {
        let source = self.uploads.path_for(&document.filename);
        if !source.is_file() {
            return Err(IngestError::SourceMissing(source.display().to_string()).into());
        }
        let kind = SourceKind::from_path(&source)?;

        let artifact = self.artifact_path(&document.filename);
        if !force && tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            info!(filename = %document.filename, "reusing extracted text");
            return Ok(());
        }

        let text = self.extract(&source, kind).await?;
        if text.trim().is_empty() {
            return Err(IngestError::OcrFailed(format!(
                "no text could be extracted from {}",
                document.filename
            ))
            .into());
        }

        write_artifact(&artifact, &text)
            .await
            .map_err(|error| CollaboratorError::from(IngestError::Io(error)))?;
        info!(filename = %document.filename, chars = text.len(), "text extracted");
        Ok(())
    }

    async fn purge(&self, filename: &str) -> Result<(), CollaboratorError> {
        match tokio::fs::remove_file(self.artifact_path(filename)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(IngestError::Io(error).into()),
        }
    }
}

async fn write_artifact(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("txt.tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await
}
