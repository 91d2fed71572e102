use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("source file not found: {0}")]
    SourceMissing(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCR endpoint returned {status}: {details}")]
    OcrStatus { status: u16, details: String },

    #[error("OCR failed: {0}")]
    OcrFailed(String),

    #[error("OCR engine not configured for {0}")]
    OcrUnavailable(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend} ({status}): {details}")]
    BackendResponse {
        backend: String,
        status: u16,
        details: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Request(String),

    #[error("store not available yet: {0}")]
    NotReady(String),

    #[error("store unreachable: {0}")]
    Unavailable(String),
}

/// Outcome classification for any call into an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Rate limiting, timeouts and 5xx answers. Retried with backoff.
    #[error("transient failure in {collaborator}: {message}")]
    Transient {
        collaborator: String,
        message: String,
    },

    /// Fails this document only; the next run tries it again.
    #[error("{collaborator} failed: {message}")]
    Permanent {
        collaborator: String,
        message: String,
    },

    /// The input can never succeed (unsupported type, missing source).
    /// Only a forced run retries it.
    #[error("{collaborator} rejected input: {message}")]
    Rejected {
        collaborator: String,
        message: String,
    },

    /// Aborts the whole run.
    #[error("systemic failure in {collaborator}: {message}")]
    Systemic {
        collaborator: String,
        message: String,
    },
}

impl CollaboratorError {
    pub fn transient(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn permanent(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn rejected(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn systemic(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Systemic {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Systemic { .. })
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    pub fn collaborator(&self) -> &str {
        match self {
            Self::Transient { collaborator, .. }
            | Self::Permanent { collaborator, .. }
            | Self::Rejected { collaborator, .. }
            | Self::Systemic { collaborator, .. } => collaborator,
        }
    }

    /// Classifies an HTTP status code answered by a collaborator.
    pub fn from_status(collaborator: &str, status: u16, details: impl Into<String>) -> Self {
        let message = format!("status {status}: {}", details.into());
        if status == 429 || status == 408 || (500..600).contains(&status) {
            Self::transient(collaborator, message)
        } else if status == 401 || status == 403 {
            Self::systemic(collaborator, message)
        } else {
            Self::permanent(collaborator, message)
        }
    }

    /// Classifies a transport error: timeouts are retried, refused
    /// connections mean the collaborator is down.
    pub fn from_reqwest(collaborator: &str, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::transient(collaborator, error.to_string())
        } else if error.is_connect() {
            Self::systemic(collaborator, error.to_string())
        } else if let Some(status) = error.status() {
            Self::from_status(collaborator, status.as_u16(), error.to_string())
        } else {
            Self::transient(collaborator, error.to_string())
        }
    }
}

impl From<IngestError> for CollaboratorError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::Http(inner) => Self::from_reqwest("ocr", &inner),
            IngestError::OcrStatus { status, details } => Self::from_status("ocr", status, details),
            other @ (IngestError::UnsupportedFileType(_) | IngestError::SourceMissing(_)) => {
                Self::rejected("ocr", other.to_string())
            }
            other => Self::permanent("ocr", other.to_string()),
        }
    }
}

impl From<SearchError> for CollaboratorError {
    fn from(error: SearchError) -> Self {
        match error {
            SearchError::Http(inner) => Self::from_reqwest("graph", &inner),
            SearchError::BackendResponse {
                backend,
                status,
                details,
            } => Self::from_status(&backend, status, details),
            other @ (SearchError::NotReady(_) | SearchError::Unavailable(_)) => {
                Self::systemic("graph", other.to_string())
            }
            other => Self::permanent("graph", other.to_string()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("document already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid transition for {filename}: {from} -> {to}")]
    InvalidTransition {
        filename: String,
        from: String,
        to: String,
    },

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("registry persistence failed: {0}")]
    Persistence(String),

    #[error("document is being processed by a running task: {0}")]
    InFlight(String),

    #[error("upload rejected: {0}")]
    Upload(String),

    #[error("could not remove derived data for {filename}: {message}")]
    Cleanup { filename: String, message: String },
}

impl PipelineError {
    pub fn document_not_found(filename: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "document",
            id: filename.into(),
        }
    }

    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "task",
            id: task_id.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("vector index {0} is missing; create it before querying")]
    IndexMissing(String),

    #[error("embedding has {actual} dimensions but index {index} expects {expected}")]
    EmbeddingDimensionMismatch {
        index: String,
        expected: usize,
        actual: usize,
    },

    #[error("chunk {chunk_id} was embedded with {indexed} but queries use {query}")]
    EmbeddingModelMismatch {
        chunk_id: String,
        indexed: String,
        query: String,
    },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Backend(#[from] SearchError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert!(CollaboratorError::from_status("llm", 429, "slow down").is_transient());
        assert!(CollaboratorError::from_status("llm", 503, "busy").is_transient());
        assert!(!CollaboratorError::from_status("llm", 400, "bad input").is_transient());
    }

    #[test]
    fn missing_index_is_systemic() {
        let error: CollaboratorError = SearchError::NotReady("chunkEmbedding".to_string()).into();
        assert!(error.is_systemic());
    }

    #[test]
    fn unsupported_file_is_rejected_not_retried() {
        let error: CollaboratorError = IngestError::UnsupportedFileType(".exe".to_string()).into();
        assert!(!error.is_recoverable());
        assert!(!error.is_systemic());
    }

    #[test]
    fn pdf_parse_errors_are_recoverable_document_failures() {
        let error: CollaboratorError = IngestError::PdfParse("bad xref".to_string()).into();
        assert!(matches!(error, CollaboratorError::Permanent { .. }));
        assert!(error.is_recoverable());
    }
}
