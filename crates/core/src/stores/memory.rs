//! In-process [`GraphStore`] for tests and for running without Neo4j.
//!
//! Mirrors the Neo4j schema: entities are shared across documents by name and
//! keep every label they were ever written with, chunks belong to exactly one
//! document. Vector search is brute-force cosine similarity.

use crate::embeddings::cosine_similarity;
use crate::error::SearchError;
use crate::labels::{sanitize_label, sanitize_relationship_type};
use crate::models::{
    DocumentGraph, EntityFact, ExtractedGraph, GraphEntity, RetrievedChunk, TextChunk,
    VectorIndexInfo, ENTITY_MARKER_LABEL,
};
use crate::traits::GraphStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

struct StoredChunk {
    chunk: TextChunk,
    embedding: Vec<f32>,
    graph: ExtractedGraph,
}

struct StoredDocument {
    embedding_model: String,
    chunks: Vec<StoredChunk>,
}

#[derive(Default)]
struct MemoryGraph {
    indexes: HashMap<String, usize>,
    documents: BTreeMap<String, StoredDocument>,
}

impl MemoryGraph {
    /// Entity nodes as they would exist after every stored write: merged by
    /// name, labels accumulated in write order.
    fn entities(&self) -> HashMap<&str, GraphEntity> {
        let mut entities: HashMap<&str, GraphEntity> = HashMap::new();
        for stored in self.documents.values().flat_map(|doc| doc.chunks.iter()) {
            for extracted in &stored.graph.entities {
                let name = extracted.name.trim();
                if name.is_empty() {
                    continue;
                }
                let entity = entities.entry(name).or_insert_with(|| GraphEntity {
                    labels: vec![ENTITY_MARKER_LABEL.to_string()],
                    name: Some(name.to_string()),
                    ..Default::default()
                });
                let label = sanitize_label(&extracted.label);
                if !entity.labels.contains(&label) {
                    entity.labels.push(label);
                }
                if extracted.entity_type.is_some() {
                    entity.entity_type = extracted.entity_type.clone();
                }
                if extracted.description.is_some() {
                    entity.description = extracted.description.clone();
                }
            }
        }
        entities
    }

    fn relationships(&self) -> BTreeSet<(String, String, String)> {
        self.documents
            .values()
            .flat_map(|doc| doc.chunks.iter())
            .flat_map(|stored| stored.graph.relationships.iter())
            .map(|relationship| {
                (
                    relationship.source.trim().to_string(),
                    sanitize_relationship_type(&relationship.relationship_type),
                    relationship.target.trim().to_string(),
                )
            })
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryGraphStore {
    state: RwLock<MemoryGraph>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        self.state.read().documents.len()
    }

    pub fn chunk_count(&self, document_path: &str) -> usize {
        self.state
            .read()
            .documents
            .get(document_path)
            .map(|doc| doc.chunks.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn vector_index(&self, name: &str) -> Result<Option<VectorIndexInfo>, SearchError> {
        Ok(self
            .state
            .read()
            .indexes
            .get(name)
            .map(|dimensions| VectorIndexInfo {
                name: name.to_string(),
                dimensions: *dimensions,
            }))
    }

    async fn ensure_vector_index(
        &self,
        name: &str,
        dimensions: usize,
    ) -> Result<VectorIndexInfo, SearchError> {
        let mut state = self.state.write();
        let dimensions = *state.indexes.entry(name.to_string()).or_insert(dimensions);
        Ok(VectorIndexInfo {
            name: name.to_string(),
            dimensions,
        })
    }

    async fn write_document(&self, graph: &DocumentGraph) -> Result<(), SearchError> {
        let chunks = graph
            .chunks
            .iter()
            .map(|indexed| StoredChunk {
                chunk: indexed.chunk.clone(),
                embedding: indexed.embedding.clone(),
                graph: indexed.graph.clone(),
            })
            .collect();

        self.state.write().documents.insert(
            graph.document_path.clone(),
            StoredDocument {
                embedding_model: graph.embedding_model.clone(),
                chunks,
            },
        );
        Ok(())
    }

    async fn delete_document(&self, document_path: &str) -> Result<(), SearchError> {
        self.state.write().documents.remove(document_path);
        Ok(())
    }

    async fn search_chunks(
        &self,
        index: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        let state = self.state.read();
        let Some(dimensions) = state.indexes.get(index) else {
            return Err(SearchError::NotReady(format!(
                "no such vector schema index: {index}"
            )));
        };
        if *dimensions != embedding.len() {
            return Err(SearchError::Request(format!(
                "index {index} expects {dimensions} dimensions, query has {}",
                embedding.len()
            )));
        }

        let entities = state.entities();
        let relationships = state.relationships();

        let mut scored: Vec<(f32, &str, &StoredDocument, &StoredChunk)> = state
            .documents
            .iter()
            .flat_map(|(path, doc)| {
                doc.chunks.iter().map(move |stored| {
                    (
                        cosine_similarity(embedding, &stored.embedding),
                        path.as_str(),
                        doc,
                        stored,
                    )
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.3.chunk.chunk_id.cmp(&b.3.chunk.chunk_id))
        });

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, path, doc, stored)| {
                let adjacent: BTreeSet<&str> = stored
                    .graph
                    .entities
                    .iter()
                    .map(|entity| entity.name.trim())
                    .collect();
                let facts = relationships
                    .iter()
                    .filter(|(source, _, _)| adjacent.contains(source.as_str()))
                    .filter_map(|(source, kind, target)| {
                        Some(EntityFact {
                            entity: entities.get(source.as_str())?.clone(),
                            relationship: kind.clone(),
                            other: entities.get(target.as_str())?.clone(),
                        })
                    })
                    .collect();

                RetrievedChunk {
                    chunk_id: stored.chunk.chunk_id.clone(),
                    text: stored.chunk.text.clone(),
                    score: f64::from(score),
                    document_path: path.to_string(),
                    embedding_model: Some(doc.embedding_model.clone()),
                    facts,
                }
            })
            .collect())
    }
}
