use crate::config::MAX_TOP_K;
use crate::error::{CollaboratorError, RetrievalError};
use crate::labels::resolve_label;
use crate::models::{Citation, EntityFact, GraphEntity, RetrievalResult, RetrievedChunk};
use crate::retry::RetryPolicy;
use crate::traits::{AnswerGenerator, Embedder, GraphStore};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

const EXCERPT_CHARS: usize = 240;
const EMPTY_CONTEXT: &str = "No relevant context was found in the knowledge graph.";

/// Answers questions from the knowledge graph: vector search over chunks,
/// expansion to chunk-adjacent entity facts, then answer generation over the
/// assembled context.
pub struct GraphRetriever {
    graph: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn AnswerGenerator>,
    retry: RetryPolicy,
    index_name: String,
}

impl GraphRetriever {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn AnswerGenerator>,
        retry: RetryPolicy,
        index_name: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            embedder,
            generator,
            retry,
            index_name: index_name.into(),
        }
    }

    pub async fn query(&self, text: &str, top_k: usize) -> Result<RetrievalResult, RetrievalError> {
        let query = text.trim();
        if query.is_empty() {
            return Err(RetrievalError::InvalidQuery("query is empty".to_string()));
        }
        if top_k == 0 || top_k > MAX_TOP_K {
            return Err(RetrievalError::InvalidQuery(format!(
                "top_k must be between 1 and {MAX_TOP_K}, got {top_k}"
            )));
        }

        let graph = &self.graph;
        let index_name = self.index_name.as_str();
        let index = self
            .retry
            .run("check vector index", || async move {
                graph
                    .vector_index(index_name)
                    .await
                    .map_err(CollaboratorError::from)
            })
            .await?
            .ok_or_else(|| RetrievalError::IndexMissing(self.index_name.clone()))?;

        let embedding = self.embed_query(query).await?;
        if embedding.len() != index.dimensions {
            return Err(RetrievalError::EmbeddingDimensionMismatch {
                index: index.name,
                expected: index.dimensions,
                actual: embedding.len(),
            });
        }

        let embedding_ref = embedding.as_slice();
        let chunks = self
            .retry
            .run("vector search", || async move {
                graph
                    .search_chunks(index_name, embedding_ref, top_k)
                    .await
                    .map_err(CollaboratorError::from)
            })
            .await?;
        self.check_models(&chunks)?;
        debug!(query, hits = chunks.len(), "retrieved chunks");

        let context = build_context(&chunks);
        let generator = &self.generator;
        let context_ref = context.as_str();
        let answer = self
            .retry
            .run("generate answer", || async move {
                generator.generate(query, context_ref).await
            })
            .await?;

        info!(query, citations = chunks.len(), "query answered");
        Ok(RetrievalResult {
            query: query.to_string(),
            answer,
            citations: chunks.iter().map(citation).collect(),
        })
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, RetrievalError> {
        let embedder = &self.embedder;
        let input = [query.to_string()];
        let input_ref = &input;
        let mut vectors = self
            .retry
            .run("embed query", || async move { embedder.embed(input_ref).await })
            .await?;

        if vectors.is_empty() {
            return Err(CollaboratorError::permanent("embedder", "no embedding returned for query").into());
        }
        Ok(vectors.swap_remove(0))
    }

    /// Chunks embedded by another model would be compared in a different
    /// vector space.
    fn check_models(&self, chunks: &[RetrievedChunk]) -> Result<(), RetrievalError> {
        let query_model = self.embedder.model();
        for chunk in chunks {
            if let Some(indexed) = &chunk.embedding_model {
                if indexed != query_model {
                    return Err(RetrievalError::EmbeddingModelMismatch {
                        chunk_id: chunk.chunk_id.clone(),
                        indexed: indexed.clone(),
                        query: query_model.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// `Label name (type) "description"`. The label is left out when the entity
/// has no meaningful one; type and description only when present.
pub fn render_entity(entity: &GraphEntity) -> String {
    let name = entity.name.as_deref().unwrap_or("unknown");
    let mut rendered = match resolve_label(&entity.labels) {
        Some(label) => format!("{label} {name}"),
        None => name.to_string(),
    };
    if let Some(kind) = entity.entity_type.as_deref().filter(|kind| !kind.is_empty()) {
        let _ = write!(rendered, " ({kind})");
    }
    if let Some(description) = entity
        .description
        .as_deref()
        .map(str::trim)
        .filter(|description| !description.is_empty())
    {
        let _ = write!(rendered, " \"{description}\"");
    }
    rendered
}

pub fn render_fact(fact: &EntityFact) -> String {
    format!(
        "{} -[{}]-> {}",
        render_entity(&fact.entity),
        fact.relationship,
        render_entity(&fact.other)
    )
}

pub fn build_context(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return EMPTY_CONTEXT.to_string();
    }

    let mut context = String::new();
    for (position, chunk) in chunks.iter().enumerate() {
        if position > 0 {
            context.push('\n');
        }
        let _ = writeln!(context, "[{}] source: {}", position + 1, chunk.document_path);
        let _ = writeln!(context, "{}", chunk.text.trim());
        if !chunk.facts.is_empty() {
            context.push_str("Entities:\n");
            for fact in &chunk.facts {
                let _ = writeln!(context, "- {}", render_fact(fact));
            }
        }
    }
    context
}

fn citation(chunk: &RetrievedChunk) -> Citation {
    Citation {
        document_path: chunk.document_path.clone(),
        chunk_id: chunk.chunk_id.clone(),
        excerpt: chunk.text.chars().take(EXCERPT_CHARS).collect(),
        score: chunk.score,
    }
}
