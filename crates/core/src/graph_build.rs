//! Graph-build stage: extracted text -> chunks, embeddings, entities and
//! relationships written to the graph store.

use crate::chunking::{build_chunks, ChunkingConfig};
use crate::error::CollaboratorError;
use crate::models::{Document, DocumentGraph, IndexedChunk, Stage};
use crate::ocr::text_artifact_path;
use crate::retry::RetryPolicy;
use crate::traits::{Embedder, EntityExtractor, GraphStore, StageAdapter};
use crate::uploads::UploadStore;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const EMBED_BATCH: usize = 64;

pub struct GraphBuildAdapter {
    uploads: UploadStore,
    output_dir: PathBuf,
    chunking: ChunkingConfig,
    index_name: String,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn EntityExtractor>,
    graph: Arc<dyn GraphStore>,
    retry: RetryPolicy,
}

impl GraphBuildAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uploads: UploadStore,
        output_dir: impl Into<PathBuf>,
        chunking: ChunkingConfig,
        index_name: impl Into<String>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn EntityExtractor>,
        graph: Arc<dyn GraphStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            uploads,
            output_dir: output_dir.into(),
            chunking,
            index_name: index_name.into(),
            embedder,
            extractor,
            graph,
            retry,
        }
    }

    /// Provenance recorded on the document node and carried into citations.
    pub fn document_path(&self, filename: &str) -> String {
        self.uploads.path_for(filename).to_string_lossy().to_string()
    }

    async fn embed_all(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let embedder = &self.embedder;
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(EMBED_BATCH) {
            let embedded = self
                .retry
                .run("embed chunks", || async move { embedder.embed(batch).await })
                .await?;
            if embedded.len() != batch.len() {
                return Err(CollaboratorError::permanent(
                    "embedder",
                    format!("got {} embeddings for {} chunks", embedded.len(), batch.len()),
                ));
            }
            vectors.extend(embedded);
        }

        let expected = self.embedder.dimensions();
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != expected) {
            return Err(CollaboratorError::permanent(
                "embedder",
                format!("embedding has {} dimensions, expected {expected}", bad.len()),
            ));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl StageAdapter for GraphBuildAdapter {
    fn name(&self) -> &'static str {
        "graph_build"
    }

    fn input_stage(&self) -> Stage {
        Stage::OcrComplete
    }

    fn output_stage(&self) -> Stage {
        Stage::Indexed
    }

    /// The vector index must exist and match the embedder before anything is
    /// written.
    async fn preflight(&self) -> Result<(), CollaboratorError> {
        let graph = &self.graph;
        let name = self.index_name.as_str();
        let index = self
            .retry
            .run("check vector index", || async move {
                graph.vector_index(name).await.map_err(CollaboratorError::from)
            })
            .await?;

        match index {
            None => Err(CollaboratorError::systemic(
                "graph",
                format!("vector index {name} is missing"),
            )),
            Some(info) if info.dimensions != self.embedder.dimensions() => {
                Err(CollaboratorError::systemic(
                    "graph",
                    format!(
                        "vector index {name} has {} dimensions but embedder {} produces {}",
                        info.dimensions,
                        self.embedder.model(),
                        self.embedder.dimensions()
                    ),
                ))
            }
            Some(_) => Ok(()),
        }
    }

    async fn process(&self, document: &Document, _force: bool) -> Result<(), CollaboratorError> {
        let artifact = text_artifact_path(&self.output_dir, &document.filename);
        let text = match tokio::fs::read_to_string(&artifact).await {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(CollaboratorError::permanent(
                    "graph_build",
                    format!("extracted text missing for {}", document.filename),
                ))
            }
            Err(error) => return Err(CollaboratorError::permanent("graph_build", error.to_string())),
        };

        let document_path = self.document_path(&document.filename);
        let chunks = build_chunks(&document_path, &text, self.chunking)
            .map_err(|error| CollaboratorError::permanent("graph_build", error.to_string()))?;
        let vectors = self
            .embed_all(chunks.iter().map(|chunk| chunk.text.clone()).collect())
            .await?;

        let extractor = &self.extractor;
        let mut indexed = Vec::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.into_iter().zip(vectors) {
            let chunk_ref = &chunk;
            let graph = self
                .retry
                .run("extract entities", || async move {
                    extractor.extract(chunk_ref).await
                })
                .await?;
            indexed.push(IndexedChunk {
                chunk,
                embedding,
                graph,
            });
        }

        let payload = DocumentGraph {
            filename: document.filename.clone(),
            document_path,
            embedding_model: self.embedder.model().to_string(),
            chunks: indexed,
        };
        let store = &self.graph;
        let payload_ref = &payload;
        self.retry
            .run("write document graph", || async move {
                store
                    .write_document(payload_ref)
                    .await
                    .map_err(CollaboratorError::from)
            })
            .await?;

        info!(
            filename = %document.filename,
            chunks = payload.chunks.len(),
            "document written to graph"
        );
        Ok(())
    }

    async fn purge(&self, filename: &str) -> Result<(), CollaboratorError> {
        let store = &self.graph;
        let document_path = self.document_path(filename);
        let path_ref = document_path.as_str();
        self.retry
            .run("delete document graph", || async move {
                store
                    .delete_document(path_ref)
                    .await
                    .map_err(CollaboratorError::from)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{ExtractedEntity, ExtractedGraph, TextChunk};
    use crate::stores::InMemoryGraphStore;
    use tempfile::tempdir;

    /// Treats every capitalised word as a `Thing` entity.
    struct CapitalisedWords;

    #[async_trait]
    impl EntityExtractor for CapitalisedWords {
        async fn extract(&self, chunk: &TextChunk) -> Result<ExtractedGraph, CollaboratorError> {
            let entities = chunk
                .text
                .split_whitespace()
                .filter(|word| word.chars().next().is_some_and(char::is_uppercase))
                .map(|word| ExtractedEntity {
                    name: word.trim_matches(|c: char| !c.is_alphanumeric()).to_string(),
                    label: "Thing".to_string(),
                    ..Default::default()
                })
                .collect();
            Ok(ExtractedGraph {
                entities,
                relationships: Vec::new(),
            })
        }
    }

    /// Drops every vector after the first.
    struct ShortEmbedder(CharacterNgramEmbedder);

    #[async_trait]
    impl Embedder for ShortEmbedder {
        fn model(&self) -> &str {
            self.0.model()
        }

        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
            let mut vectors = self.0.embed(texts).await?;
            vectors.truncate(1);
            Ok(vectors)
        }
    }

    fn adapter(
        dir: &std::path::Path,
        graph: Arc<InMemoryGraphStore>,
    ) -> GraphBuildAdapter {
        adapter_with(dir, graph, Arc::new(CharacterNgramEmbedder::default()))
    }

    fn adapter_with(
        dir: &std::path::Path,
        graph: Arc<InMemoryGraphStore>,
        embedder: Arc<dyn Embedder>,
    ) -> GraphBuildAdapter {
        GraphBuildAdapter::new(
            UploadStore::new(dir.join("data")),
            dir.join("output"),
            ChunkingConfig {
                chunk_size: 40,
                overlap: 10,
            },
            "chunkEmbedding",
            embedder,
            Arc::new(CapitalisedWords),
            graph,
            RetryPolicy::immediate(2),
        )
    }

    fn ocr_complete(dir: &std::path::Path, filename: &str, text: &str) -> Document {
        let output = dir.join("output");
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(text_artifact_path(&output, filename), text).unwrap();
        let mut document = Document::new(filename);
        document.stage = Stage::OcrComplete;
        document
    }

    #[tokio::test]
    async fn preflight_requires_a_matching_index() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(InMemoryGraphStore::new());
        let adapter = adapter(dir.path(), graph.clone());

        let missing = adapter.preflight().await.unwrap_err();
        assert!(missing.is_systemic());

        graph.ensure_vector_index("chunkEmbedding", 1536).await.unwrap();
        let mismatched = adapter.preflight().await.unwrap_err();
        assert!(mismatched.is_systemic());
        assert!(mismatched.to_string().contains("1536"));
    }

    #[tokio::test]
    async fn process_writes_chunks_with_provenance() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(InMemoryGraphStore::new());
        graph.ensure_vector_index("chunkEmbedding", 128).await.unwrap();
        let adapter = adapter(dir.path(), graph.clone());
        adapter.preflight().await.unwrap();

        let document = ocr_complete(
            dir.path(),
            "acme.txt",
            "Alice founded Acme Corp in 1999. Bob joined Acme Corp later as its first engineer.",
        );
        adapter.process(&document, false).await.unwrap();

        let path = adapter.document_path("acme.txt");
        let written = graph.chunk_count(&path);
        assert!(written > 1);

        let query = CharacterNgramEmbedder::default().embed_one("Alice founded Acme Corp");
        let hits = graph.search_chunks("chunkEmbedding", &query, 1).await.unwrap();
        assert_eq!(hits[0].document_path, path);
        assert_eq!(hits[0].embedding_model.as_deref(), Some("char-trigram-128"));

        adapter.process(&document, true).await.unwrap();
        assert_eq!(graph.chunk_count(&path), written);
    }

    #[tokio::test]
    async fn missing_embeddings_fail_the_document() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(InMemoryGraphStore::new());
        graph.ensure_vector_index("chunkEmbedding", 128).await.unwrap();
        let adapter = adapter_with(
            dir.path(),
            graph.clone(),
            Arc::new(ShortEmbedder(CharacterNgramEmbedder::default())),
        );

        let document = ocr_complete(
            dir.path(),
            "long.txt",
            "Alice founded Acme Corp in 1999. Bob joined Acme Corp later as its first engineer.",
        );
        let error = adapter.process(&document, false).await.unwrap_err();

        assert!(matches!(error, CollaboratorError::Permanent { .. }));
        assert!(error.to_string().contains("embeddings for"));
        assert_eq!(graph.chunk_count(&adapter.document_path("long.txt")), 0);
    }

    #[tokio::test]
    async fn missing_text_artifact_fails_the_document() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(InMemoryGraphStore::new());
        let adapter = adapter(dir.path(), graph);

        let mut document = Document::new("ghost.pdf");
        document.stage = Stage::OcrComplete;
        let error = adapter.process(&document, false).await.unwrap_err();
        assert!(matches!(error, CollaboratorError::Permanent { .. }));
    }

    #[tokio::test]
    async fn purge_removes_the_document_graph() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(InMemoryGraphStore::new());
        graph.ensure_vector_index("chunkEmbedding", 128).await.unwrap();
        let adapter = adapter(dir.path(), graph.clone());

        let document = ocr_complete(dir.path(), "a.txt", "Some text about Pumps.");
        adapter.process(&document, false).await.unwrap();
        assert_eq!(graph.document_count(), 1);

        adapter.purge("a.txt").await.unwrap();
        adapter.purge("a.txt").await.unwrap();
        assert_eq!(graph.document_count(), 0);
    }
}
