use crate::error::SearchError;
use crate::labels::{sanitize_label, sanitize_relationship_type};
use crate::models::{DocumentGraph, EntityFact, GraphEntity, RetrievedChunk, VectorIndexInfo};
use crate::traits::GraphStore;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

const DELETE_CHUNKS: &str = r#"
    MATCH (d:Document {path: $path})<-[:FROM_DOCUMENT]-(c:Chunk)
    DETACH DELETE c
"#;

const DELETE_ORPHAN_ENTITIES: &str = r#"
    MATCH (e:__Entity__)
    WHERE NOT (e)-[:FROM_CHUNK]->(:Chunk)
    DETACH DELETE e
"#;

const DELETE_DOCUMENT: &str = r#"
    MATCH (d:Document {path: $path})
    DETACH DELETE d
"#;

const MERGE_DOCUMENT: &str = r#"
    MERGE (d:Document {path: $path})
    SET d.filename = $filename
"#;

const WRITE_CHUNKS: &str = r#"
    MATCH (d:Document {path: $path})
    UNWIND $rows AS row
    MERGE (c:Chunk {id: row.id})
    SET c.text = row.text,
        c.index = row.index,
        c.embedding = row.embedding,
        c.embedding_model = $model
    MERGE (c)-[:FROM_DOCUMENT]->(d)
"#;

const SEARCH_CHUNKS: &str = r#"
    CALL db.index.vector.queryNodes($index, $top_k, $embedding) YIELD node, score
    MATCH (node)-[:FROM_DOCUMENT]->(d:Document)
    RETURN node.id AS chunk_id,
           node.text AS text,
           score,
           d.path AS document_path,
           node.embedding_model AS embedding_model,
           COLLECT {
               MATCH (node)<-[:FROM_CHUNK]-(entity:__Entity__)-[r]->(other:__Entity__)-[:FROM_CHUNK]->(:Chunk)
               RETURN DISTINCT [
                   labels(entity), entity.name, entity.type, entity.description,
                   type(r),
                   labels(other), other.name, other.type, other.description
               ]
           } AS facts
    ORDER BY score DESC
"#;

const SHOW_VECTOR_INDEX: &str = r#"
    SHOW VECTOR INDEXES YIELD name, options
    WHERE name = $name
    RETURN name, options.indexConfig['vector.dimensions'] AS dimensions
"#;

/// Graph store backed by Neo4j's HTTP transaction endpoint.
///
/// Every call is a single `tx/commit` request, so the statements of one call
/// either all apply or none do.
pub struct Neo4jStore {
    endpoint: Url,
    database: String,
    username: String,
    password: String,
    client: Client,
}

impl Neo4jStore {
    pub fn new(
        endpoint: &str,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, SearchError> {
        let endpoint = Url::parse(endpoint.trim_end_matches('/'))?;
        Ok(Self {
            endpoint,
            database: database.into(),
            username: username.into(),
            password: password.into(),
            client: Client::new(),
        })
    }

    fn tx_url(&self) -> String {
        format!(
            "{}/db/{}/tx/commit",
            self.endpoint.as_str().trim_end_matches('/'),
            self.database
        )
    }

    async fn commit(&self, statements: Vec<Value>) -> Result<Value, SearchError> {
        let response = self
            .client
            .post(self.tx_url())
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({ "statements": statements }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: "neo4j".to_string(),
                status: status.as_u16(),
                details,
            });
        }

        let body: Value = response.json().await?;
        check_errors(&body)?;
        Ok(body)
    }
}

fn statement(cypher: &str, parameters: Value) -> Value {
    json!({ "statement": cypher, "parameters": parameters })
}

/// The transaction endpoint answers 200 even when a statement fails; the
/// failures are listed under `errors`.
fn check_errors(body: &Value) -> Result<(), SearchError> {
    let Some(error) = body
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
    else {
        return Ok(());
    };

    let code = error.get("code").and_then(Value::as_str).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let details = format!("{code}: {message}");

    if message.contains("no such vector schema index") {
        return Err(SearchError::NotReady(details));
    }
    if code.starts_with("Neo.TransientError") {
        return Err(SearchError::BackendResponse {
            backend: "neo4j".to_string(),
            status: 503,
            details,
        });
    }
    if code.starts_with("Neo.ClientError.Security") {
        return Err(SearchError::BackendResponse {
            backend: "neo4j".to_string(),
            status: 401,
            details,
        });
    }
    Err(SearchError::Request(details))
}

/// Cypher identifiers cannot be parameters; names are quoted after stripping
/// anything that could close the quote.
fn quote_identifier(raw: &str) -> String {
    format!("`{}`", raw.replace('`', ""))
}

fn entity_statements(graph: &DocumentGraph) -> Vec<Value> {
    let mut by_label: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut by_type: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for indexed in &graph.chunks {
        for entity in &indexed.graph.entities {
            if entity.name.trim().is_empty() {
                continue;
            }
            by_label
                .entry(sanitize_label(&entity.label))
                .or_default()
                .push(json!({
                    "chunk_id": indexed.chunk.chunk_id,
                    "name": entity.name.trim(),
                    "type": entity.entity_type,
                    "description": entity.description,
                }));
        }
        for relationship in &indexed.graph.relationships {
            by_type
                .entry(sanitize_relationship_type(&relationship.relationship_type))
                .or_default()
                .push(json!({
                    "source": relationship.source.trim(),
                    "target": relationship.target.trim(),
                    "description": relationship.description,
                }));
        }
    }

    let mut statements = Vec::new();
    for (label, rows) in by_label {
        let cypher = format!(
            r#"
            UNWIND $rows AS row
            MATCH (c:Chunk {{id: row.chunk_id}})
            MERGE (e:__Entity__ {{name: row.name}})
            SET e:{label},
                e.type = coalesce(row.type, e.type),
                e.description = coalesce(row.description, e.description)
            MERGE (e)-[:FROM_CHUNK]->(c)
            "#,
            label = quote_identifier(&label)
        );
        statements.push(statement(&cypher, json!({ "rows": rows })));
    }
    for (kind, rows) in by_type {
        let cypher = format!(
            r#"
            UNWIND $rows AS row
            MATCH (s:__Entity__ {{name: row.source}}), (t:__Entity__ {{name: row.target}})
            MERGE (s)-[r:{kind}]->(t)
            SET r.description = coalesce(row.description, r.description)
            "#,
            kind = quote_identifier(&kind)
        );
        statements.push(statement(&cypher, json!({ "rows": rows })));
    }
    statements
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn vector_index(&self, name: &str) -> Result<Option<VectorIndexInfo>, SearchError> {
        let body = self
            .commit(vec![statement(SHOW_VECTOR_INDEX, json!({ "name": name }))])
            .await?;

        Ok(extract_rows(&body).into_iter().find_map(|row| {
            let values = row.as_array()?;
            let name = values.first()?.as_str()?.to_string();
            let dimensions = values.get(1)?.as_u64()? as usize;
            Some(VectorIndexInfo { name, dimensions })
        }))
    }

    async fn ensure_vector_index(
        &self,
        name: &str,
        dimensions: usize,
    ) -> Result<VectorIndexInfo, SearchError> {
        let cypher = format!(
            "CREATE VECTOR INDEX {} IF NOT EXISTS FOR (c:Chunk) ON (c.embedding) \
             OPTIONS {{indexConfig: {{`vector.dimensions`: {dimensions}, `vector.similarity_function`: 'cosine'}}}}",
            quote_identifier(name)
        );
        self.commit(vec![statement(&cypher, json!({}))]).await?;

        self.vector_index(name)
            .await?
            .ok_or_else(|| SearchError::NotReady(format!("vector index {name} was not created")))
    }

    async fn write_document(&self, graph: &DocumentGraph) -> Result<(), SearchError> {
        let path = json!({ "path": graph.document_path });
        let rows: Vec<Value> = graph
            .chunks
            .iter()
            .map(|indexed| {
                json!({
                    "id": indexed.chunk.chunk_id,
                    "text": indexed.chunk.text,
                    "index": indexed.chunk.index,
                    "embedding": indexed.embedding,
                })
            })
            .collect();

        let mut statements = vec![
            statement(DELETE_CHUNKS, path.clone()),
            statement(DELETE_ORPHAN_ENTITIES, json!({})),
            statement(
                MERGE_DOCUMENT,
                json!({ "path": graph.document_path, "filename": graph.filename }),
            ),
            statement(
                WRITE_CHUNKS,
                json!({
                    "path": graph.document_path,
                    "model": graph.embedding_model,
                    "rows": rows,
                }),
            ),
        ];
        statements.extend(entity_statements(graph));

        debug!(
            document = %graph.document_path,
            statements = statements.len(),
            "writing document graph"
        );
        self.commit(statements).await?;
        Ok(())
    }

    async fn delete_document(&self, document_path: &str) -> Result<(), SearchError> {
        let path = json!({ "path": document_path });
        self.commit(vec![
            statement(DELETE_CHUNKS, path.clone()),
            statement(DELETE_ORPHAN_ENTITIES, json!({})),
            statement(DELETE_DOCUMENT, path),
        ])
        .await?;
        Ok(())
    }

    async fn search_chunks(
        &self,
        index: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        let body = self
            .commit(vec![statement(
                SEARCH_CHUNKS,
                json!({ "index": index, "top_k": top_k, "embedding": embedding }),
            )])
            .await?;

        Ok(extract_rows(&body)
            .into_iter()
            .filter_map(parse_chunk_row)
            .collect())
    }
}

fn parse_chunk_row(row: &Value) -> Option<RetrievedChunk> {
    let values = row.as_array()?;
    if values.len() < 6 {
        return None;
    }

    let facts = values
        .get(5)
        .and_then(Value::as_array)
        .map(|facts| facts.iter().filter_map(parse_fact).collect())
        .unwrap_or_default();

    Some(RetrievedChunk {
        chunk_id: values.first()?.as_str()?.to_string(),
        text: values
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        score: values.get(2).and_then(Value::as_f64).unwrap_or_default(),
        document_path: values
            .get(3)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        embedding_model: values.get(4).and_then(Value::as_str).map(str::to_string),
        facts,
    })
}

fn parse_fact(value: &Value) -> Option<EntityFact> {
    let values = value.as_array()?;
    if values.len() < 9 {
        return None;
    }
    Some(EntityFact {
        entity: parse_entity(&values[0..4]),
        relationship: values[4].as_str()?.to_string(),
        other: parse_entity(&values[5..9]),
    })
}

fn parse_entity(values: &[Value]) -> GraphEntity {
    let text = |index: usize| {
        values
            .get(index)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    GraphEntity {
        labels: values
            .first()
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        name: text(1),
        entity_type: text(2),
        description: text(3),
    }
}

fn extract_rows(payload: &Value) -> Vec<&Value> {
    let data = payload.pointer("/results").and_then(Value::as_array);
    match data {
        Some(results) => results
            .iter()
            .filter_map(|result| result.pointer("/data").and_then(Value::as_array))
            .flat_map(|result_rows| result_rows.iter().filter_map(row_values))
            .collect(),
        None => payload
            .pointer("/data")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(row_values).collect())
            .unwrap_or_default(),
    }
}

fn row_values(entry: &Value) -> Option<&Value> {
    entry
        .pointer("/row")
        .or(Some(entry))
        .filter(|candidate| candidate.is_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ExtractedEntity, ExtractedGraph, ExtractedRelationship, IndexedChunk, TextChunk,
    };

    #[test]
    fn tx_url_targets_database() {
        let store = Neo4jStore::new("http://localhost:7474/", "neo4j", "neo4j", "secret").unwrap();
        assert_eq!(store.tx_url(), "http://localhost:7474/db/neo4j/tx/commit");
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        assert!(Neo4jStore::new("not a url", "neo4j", "u", "p").is_err());
    }

    #[test]
    fn rows_are_read_from_results() {
        let payload = json!({
            "results": [{
                "columns": ["name", "dimensions"],
                "data": [{"row": ["chunkEmbedding", 1536], "meta": [null, null]}]
            }],
            "errors": []
        });
        let rows = extract_rows(&payload);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], json!(1536));
    }

    #[test]
    fn statement_errors_are_classified() {
        let missing = json!({"results": [], "errors": [{
            "code": "Neo.ClientError.Procedure.ProcedureCallFailed",
            "message": "Failed to invoke procedure: There is no such vector schema index: chunkEmbedding"
        }]});
        assert!(matches!(check_errors(&missing), Err(SearchError::NotReady(_))));

        let transient = json!({"errors": [{
            "code": "Neo.TransientError.Transaction.DeadlockDetected",
            "message": "deadlock"
        }]});
        assert!(matches!(
            check_errors(&transient),
            Err(SearchError::BackendResponse { status: 503, .. })
        ));

        assert!(check_errors(&json!({"results": [], "errors": []})).is_ok());
    }

    #[test]
    fn chunk_rows_keep_raw_label_order() {
        let row = json!([
            "c1",
            "Alice founded Acme Corp.",
            0.91,
            "pipeline/data/acme.pdf",
            "text-embedding-ada-002",
            [[
                ["__Entity__", "Person"], "Alice", null, "founder",
                "FOUNDED",
                ["Company", "__Entity__"], "Acme Corp", "startup", null
            ]]
        ]);
        let chunk = parse_chunk_row(&row).unwrap();
        assert_eq!(chunk.chunk_id, "c1");
        assert_eq!(chunk.facts.len(), 1);
        let fact = &chunk.facts[0];
        assert_eq!(fact.entity.labels, vec!["__Entity__", "Person"]);
        assert_eq!(fact.other.labels, vec!["Company", "__Entity__"]);
        assert_eq!(fact.relationship, "FOUNDED");
        assert_eq!(fact.other.entity_type.as_deref(), Some("startup"));
    }

    #[test]
    fn entity_statements_group_by_sanitized_label_and_type() {
        let graph = DocumentGraph {
            filename: "acme.pdf".to_string(),
            document_path: "pipeline/data/acme.pdf".to_string(),
            embedding_model: "m".to_string(),
            chunks: vec![IndexedChunk {
                chunk: TextChunk {
                    chunk_id: "c1".to_string(),
                    document_path: "pipeline/data/acme.pdf".to_string(),
                    index: 0,
                    text: "Alice founded Acme Corp.".to_string(),
                },
                embedding: vec![1.0],
                graph: ExtractedGraph {
                    entities: vec![
                        ExtractedEntity {
                            name: "Alice".to_string(),
                            label: "Person".to_string(),
                            ..Default::default()
                        },
                        ExtractedEntity {
                            name: "Acme Corp".to_string(),
                            label: "Company`) DELETE".to_string(),
                            ..Default::default()
                        },
                    ],
                    relationships: vec![ExtractedRelationship {
                        source: "Alice".to_string(),
                        target: "Acme Corp".to_string(),
                        relationship_type: "founded".to_string(),
                        description: None,
                    }],
                },
            }],
        };

        let statements = entity_statements(&graph);
        assert_eq!(statements.len(), 3);
        let cypher: Vec<&str> = statements
            .iter()
            .filter_map(|statement| statement["statement"].as_str())
            .collect();
        assert!(cypher[0].contains("SET e:`CompanyDELETE`"));
        assert!(cypher[1].contains("SET e:`Person`"));
        assert!(cypher[2].contains("[r:`FOUNDED`]"));
    }
}
