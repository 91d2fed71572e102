use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label carried by every chunk node.
pub const CHUNK_LABEL: &str = "Chunk";
/// Catch-all label carried by every extracted entity node.
pub const ENTITY_MARKER_LABEL: &str = "__Entity__";
pub const DOCUMENT_LABEL: &str = "Document";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Uploaded,
    OcrComplete,
    Indexed,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Uploaded => "uploaded",
            Stage::OcrComplete => "ocr_complete",
            Stage::Indexed => "indexed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a document ended up in [`Stage::Failed`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentError {
    /// Adapter that was running when the failure happened.
    pub step: String,
    pub message: String,
    /// Unrecoverable failures are only retried by a forced run.
    pub recoverable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub filename: String,
    pub stage: Stage,
    pub error: Option<DocumentError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            filename: filename.into(),
            stage: Stage::Uploaded,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DocumentOutcome {
    Pending,
    InProgress,
    Succeeded,
    Skipped { reason: String },
    Failed { reason: String },
    /// Left untouched because the run hit a systemic failure.
    Aborted { reason: String },
}

impl DocumentOutcome {
    pub fn is_finished(&self) -> bool {
        !matches!(self, DocumentOutcome::Pending | DocumentOutcome::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentProgress {
    pub stage: Stage,
    #[serde(flatten)]
    pub outcome: DocumentOutcome,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub force_reprocess: bool,
    pub documents: BTreeMap<String, DocumentProgress>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, force_reprocess: bool) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            force_reprocess,
            documents: BTreeMap::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn outcome(&self, filename: &str) -> Option<&DocumentOutcome> {
        self.documents.get(filename).map(|progress| &progress.outcome)
    }

    /// `processed/total files`, counting every document with a final outcome.
    pub fn progress_label(&self) -> String {
        let finished = self
            .documents
            .values()
            .filter(|progress| progress.outcome.is_finished())
            .count();
        format!("{}/{} files", finished, self.documents.len())
    }
}

/// A bounded slice of a document's extracted text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextChunk {
    pub chunk_id: String,
    pub document_path: String,
    pub index: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedEntity {
    pub name: String,
    pub label: String,
    #[serde(default, rename = "type")]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedGraph {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub chunk: TextChunk,
    pub embedding: Vec<f32>,
    pub graph: ExtractedGraph,
}

/// Everything the graph-build stage writes for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentGraph {
    pub filename: String,
    pub document_path: String,
    pub embedding_model: String,
    pub chunks: Vec<IndexedChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorIndexInfo {
    pub name: String,
    pub dimensions: usize,
}

/// An entity as read back from the graph. Labels come in whatever order the
/// store hands them out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GraphEntity {
    pub labels: Vec<String>,
    pub name: Option<String>,
    pub entity_type: Option<String>,
    pub description: Option<String>,
}

/// `(entity)-[relationship]->(other)` where `entity` is chunk-adjacent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityFact {
    pub entity: GraphEntity,
    pub relationship: String,
    pub other: GraphEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
    pub document_path: String,
    pub embedding_model: Option<String>,
    pub facts: Vec<EntityFact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub document_path: String,
    pub chunk_id: String,
    pub excerpt: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub query: String,
    pub answer: String,
    pub citations: Vec<Citation>,
}
