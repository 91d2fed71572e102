pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod graph_build;
pub mod labels;
pub mod llm;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod registry;
pub mod retrieval;
pub mod retry;
pub mod stores;
pub mod traits;
pub mod uploads;

pub use chunking::{build_chunks, normalize_whitespace, split_fixed, ChunkingConfig};
pub use config::{
    PipelineSettings, DEFAULT_EMBEDDING_MODEL, DEFAULT_LLM_MODEL, DEFAULT_TOP_K,
    DEFAULT_VECTOR_INDEX, MAX_TOP_K,
};
pub use embeddings::{cosine_similarity, CharacterNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{CollaboratorError, IngestError, PipelineError, RetrievalError, SearchError};
pub use graph_build::GraphBuildAdapter;
pub use labels::{resolve_label, sanitize_label, sanitize_relationship_type};
pub use llm::{OpenAiClient, OpenAiConfig};
pub use models::{
    Citation, Document, DocumentError, DocumentGraph, DocumentOutcome, DocumentProgress,
    EntityFact, ExtractedEntity, ExtractedGraph, ExtractedRelationship, GraphEntity,
    IndexedChunk, RetrievalResult, RetrievedChunk, Stage, Task, TaskStatus, TextChunk,
    VectorIndexInfo, CHUNK_LABEL, ENTITY_MARKER_LABEL,
};
pub use ocr::{HttpOcrEngine, OcrAdapter, OcrEndpointConfig};
pub use pipeline::PipelineOrchestrator;
pub use registry::{DocumentClaim, DocumentRegistry};
pub use retrieval::GraphRetriever;
pub use retry::RetryPolicy;
pub use stores::{InMemoryGraphStore, Neo4jStore};
pub use traits::{AnswerGenerator, Embedder, EntityExtractor, GraphStore, OcrEngine, StageAdapter};
pub use uploads::{sanitize_filename, validate_filename, SourceKind, UploadStore};
