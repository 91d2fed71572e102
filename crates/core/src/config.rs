use crate::chunking::ChunkingConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_VECTOR_INDEX: &str = "chunkEmbedding";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o";
pub const DEFAULT_TOP_K: usize = 5;
pub const MAX_TOP_K: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Source uploads.
    pub data_dir: PathBuf,
    /// Derived text, one `<filename>.txt` per source.
    pub output_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Documents processed at once within one run.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub vector_index: String,
    pub embedding_model: String,
    pub llm_model: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("pipeline/data"),
            output_dir: PathBuf::from("pipeline/output"),
            chunk_size: 500,
            chunk_overlap: 100,
            concurrency: 2,
            retry: RetryPolicy::default(),
            vector_index: DEFAULT_VECTOR_INDEX.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunk_size,
            overlap: self.chunk_overlap,
        }
    }

    /// Registry snapshot location, next to the derived outputs.
    pub fn registry_path(&self) -> PathBuf {
        self.output_dir.join("registry.json")
    }
}
