//! OpenAI-compatible HTTP client used for embeddings, entity extraction and
//! answer generation.
//!
//! Every method makes exactly one request and classifies failures into
//! [`CollaboratorError`]; callers wrap calls in a [`crate::RetryPolicy`].

use crate::config::{DEFAULT_EMBEDDING_MODEL, DEFAULT_LLM_MODEL};
use crate::error::CollaboratorError;
use crate::models::{ExtractedGraph, TextChunk};
use crate::traits::{AnswerGenerator, Embedder, EntityExtractor};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

const EXTRACTION_PROMPT: &str = "You extract a knowledge graph from text. \
Return a JSON object with two arrays. \
\"entities\": objects with \"name\", \"label\" (a single PascalCase type such as Person, Company, Location), \
optional \"type\" and optional \"description\". \
\"relationships\": objects with \"source\" and \"target\" (entity names), \"type\" (UPPER_SNAKE_CASE) \
and optional \"description\". \
Only use entities that appear in the text. Return {\"entities\": [], \"relationships\": []} when nothing applies.";

const ANSWER_PROMPT: &str = "Answer the user question using the provided context. \
Only use facts from the context. If the context does not contain the answer, say you do not know.";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub chat_model: String,
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: 1536,
            chat_model: DEFAULT_LLM_MODEL.to_string(),
            timeout_secs: 60,
        }
    }
}

pub struct OpenAiClient {
    config: OpenAiConfig,
    base_url: Url,
    client: Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, CollaboratorError> {
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base).map_err(|error| {
            CollaboratorError::systemic("llm", format!("invalid base url {base}: {error}"))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| CollaboratorError::systemic("llm", error.to_string()))?;

        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    async fn post(
        &self,
        collaborator: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value, CollaboratorError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|error| CollaboratorError::systemic(collaborator, error.to_string()))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|error| CollaboratorError::from_reqwest(collaborator, &error))?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::from_status(
                collaborator,
                status.as_u16(),
                details,
            ));
        }

        response
            .json()
            .await
            .map_err(|error| CollaboratorError::from_reqwest(collaborator, &error))
    }

    async fn chat(
        &self,
        collaborator: &str,
        system: &str,
        user: &str,
        json_mode: bool,
    ) -> Result<String, CollaboratorError> {
        let mut body = json!({
            "model": self.config.chat_model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self.post(collaborator, "chat/completions", &body).await?;
        parse_chat_content(&response)
            .ok_or_else(|| CollaboratorError::permanent(collaborator, "response had no message content"))
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    fn model(&self) -> &str {
        &self.config.embedding_model
    }

    fn dimensions(&self) -> usize {
        self.config.embedding_dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.config.embedding_model,
            "input": texts,
        });
        let response = self.post("embedder", "embeddings", &body).await?;
        let vectors = parse_embeddings(&response)
            .ok_or_else(|| CollaboratorError::permanent("embedder", "missing data[].embedding"))?;

        if vectors.len() != texts.len() {
            return Err(CollaboratorError::permanent(
                "embedder",
                format!("asked for {} embeddings, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EntityExtractor for OpenAiClient {
    async fn extract(&self, chunk: &TextChunk) -> Result<ExtractedGraph, CollaboratorError> {
        let content = self
            .chat("extractor", EXTRACTION_PROMPT, &chunk.text, true)
            .await?;
        let graph: ExtractedGraph = serde_json::from_str(&content).map_err(|error| {
            CollaboratorError::permanent("extractor", format!("invalid extraction json: {error}"))
        })?;
        debug!(
            chunk_id = %chunk.chunk_id,
            entities = graph.entities.len(),
            relationships = graph.relationships.len(),
            "extracted graph"
        );
        Ok(graph)
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiClient {
    async fn generate(&self, query: &str, context: &str) -> Result<String, CollaboratorError> {
        let prompt = format!("Context:\n{context}\n\nQuestion:\n{query}\n\nAnswer:");
        self.chat("generator", ANSWER_PROMPT, &prompt, false).await
    }
}

fn parse_embeddings(payload: &Value) -> Option<Vec<Vec<f32>>> {
    let data = payload.get("data")?.as_array()?;
    let mut indexed = data
        .iter()
        .map(|item| {
            let index = item.get("index").and_then(Value::as_u64).unwrap_or(0);
            let vector = item
                .get("embedding")?
                .as_array()?
                .iter()
                .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                .collect::<Vec<_>>();
            Some((index, vector))
        })
        .collect::<Option<Vec<_>>>()?;

    indexed.sort_by_key(|(index, _)| *index);
    Some(indexed.into_iter().map(|(_, vector)| vector).collect())
}

fn parse_chat_content(payload: &Value) -> Option<String> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}
