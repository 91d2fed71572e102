use crate::error::{CollaboratorError, IngestError, SearchError};
use crate::models::{
    Document, DocumentGraph, ExtractedGraph, RetrievedChunk, Stage, TextChunk, VectorIndexInfo,
};
use async_trait::async_trait;
use std::path::Path;

/// Turns text into vectors. Indexing and querying must share one instance
/// (or at least one `model`), otherwise similarity scores mean nothing.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError>;
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, chunk: &TextChunk) -> Result<ExtractedGraph, CollaboratorError>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, query: &str, context: &str) -> Result<String, CollaboratorError>;
}

/// Recognizes text in scanned images and image-only PDFs.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, path: &Path) -> Result<String, IngestError>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// `None` when no vector index with that name exists.
    async fn vector_index(&self, name: &str) -> Result<Option<VectorIndexInfo>, SearchError>;

    async fn ensure_vector_index(
        &self,
        name: &str,
        dimensions: usize,
    ) -> Result<VectorIndexInfo, SearchError>;

    /// Replaces everything previously written for `graph.document_path`.
    async fn write_document(&self, graph: &DocumentGraph) -> Result<(), SearchError>;

    async fn delete_document(&self, document_path: &str) -> Result<(), SearchError>;

    /// Nearest chunks by cosine similarity, each with its chunk-adjacent
    /// entity facts.
    async fn search_chunks(
        &self,
        index: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError>;
}

/// One pipeline stage: moves a document from `input_stage` to `output_stage`.
#[async_trait]
pub trait StageAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn input_stage(&self) -> Stage;

    fn output_stage(&self) -> Stage;

    /// Checked once before a run touches any document. A systemic error here
    /// fails the run without changing document state.
    async fn preflight(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn process(&self, document: &Document, force: bool) -> Result<(), CollaboratorError>;

    /// Removes whatever this stage derived from `filename`. Missing artifacts
    /// are not an error.
    async fn purge(&self, filename: &str) -> Result<(), CollaboratorError>;
}
