//! Ground truth for which stage every known source file has reached.
//!
//! All stage changes go through [`DocumentRegistry::transition`]. A document
//! can be claimed by at most one run at a time via
//! [`DocumentRegistry::try_claim`]; the claim is released when the returned
//! guard is dropped.

use crate::error::PipelineError;
use crate::models::{Document, DocumentError, Stage};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    documents: BTreeMap<String, Document>,
    in_flight: HashSet<String>,
}

type Documents = BTreeMap<String, Document>;

#[derive(Default)]
pub struct DocumentRegistry {
    state: Mutex<RegistryState>,
    /// Serializes mutations. Held while the snapshot is written so readers
    /// only ever wait on `state`.
    writer: Mutex<()>,
    snapshot_path: Option<PathBuf>,
}

/// Edges a document may take. Rewinds to `Uploaded` exist for forced
/// reprocessing and for retrying a failed document.
pub fn is_allowed_transition(from: Stage, to: Stage) -> bool {
    use Stage::*;
    matches!(
        (from, to),
        (Uploaded, OcrComplete)
            | (OcrComplete, Indexed)
            | (Uploaded | OcrComplete | Indexed, Failed)
            | (OcrComplete | Indexed | Failed, Uploaded)
    )
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by a JSON snapshot, loaded if it already exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let mut documents = BTreeMap::new();

        if path.exists() {
            let bytes =
                fs::read(&path).map_err(|error| PipelineError::Persistence(error.to_string()))?;
            let stored: Vec<Document> = serde_json::from_slice(&bytes)
                .map_err(|error| PipelineError::Persistence(error.to_string()))?;
            for document in stored {
                documents.insert(document.filename.clone(), document);
            }
            debug!(path = %path.display(), count = documents.len(), "loaded registry snapshot");
        }

        Ok(Self {
            state: Mutex::new(RegistryState {
                documents,
                in_flight: HashSet::new(),
            }),
            writer: Mutex::new(()),
            snapshot_path: Some(path),
        })
    }

    /// Tracks `filename` at `uploaded`. An existing entry is only reset when
    /// `replace` is set.
    pub fn register(&self, filename: &str, replace: bool) -> Result<Document, PipelineError> {
        let document = self.commit(|documents| {
            let document = match documents.get_mut(filename) {
                Some(_) if !replace => {
                    return Err(PipelineError::AlreadyExists(filename.to_string()))
                }
                Some(existing) => {
                    existing.stage = Stage::Uploaded;
                    existing.error = None;
                    existing.updated_at = Utc::now();
                    existing.clone()
                }
                None => {
                    let document = Document::new(filename);
                    documents.insert(filename.to_string(), document.clone());
                    document
                }
            };
            Ok((document, true))
        })?;

        info!(filename, replace, "registered document");
        Ok(document)
    }

    pub fn get(&self, filename: &str) -> Result<Document, PipelineError> {
        self.state
            .lock()
            .documents
            .get(filename)
            .cloned()
            .ok_or_else(|| PipelineError::document_not_found(filename))
    }

    /// Sorted by filename.
    pub fn list(&self) -> Vec<Document> {
        self.state.lock().documents.values().cloned().collect()
    }

    pub fn transition(
        &self,
        filename: &str,
        new_stage: Stage,
        error: Option<DocumentError>,
    ) -> Result<Document, PipelineError> {
        let (previous, updated) = self.commit(|documents| {
            let document = documents
                .get_mut(filename)
                .ok_or_else(|| PipelineError::document_not_found(filename))?;

            if !is_allowed_transition(document.stage, new_stage) {
                return Err(PipelineError::InvalidTransition {
                    filename: filename.to_string(),
                    from: document.stage.to_string(),
                    to: new_stage.to_string(),
                });
            }

            let previous = document.stage;
            document.stage = new_stage;
            document.error = if new_stage == Stage::Failed { error } else { None };
            document.updated_at = Utc::now();
            Ok(((previous, document.clone()), true))
        })?;

        info!(filename, from = %previous, to = %new_stage, "stage transition");
        Ok(updated)
    }

    /// Drops the entry. Untracked names are a no-op.
    pub fn remove(&self, filename: &str) -> Result<Option<Document>, PipelineError> {
        let removed = self.commit(|documents| {
            let removed = documents.remove(filename);
            let changed = removed.is_some();
            Ok((removed, changed))
        })?;
        if removed.is_some() {
            info!(filename, "removed document");
        }
        Ok(removed)
    }

    /// Registers every name not tracked yet; returns how many were added.
    pub fn reconcile<I>(&self, filenames: I) -> Result<usize, PipelineError>
    where
        I: IntoIterator<Item = String>,
    {
        let added = self.commit(|documents| {
            let mut added = 0;
            for filename in filenames {
                if !documents.contains_key(&filename) {
                    documents.insert(filename.clone(), Document::new(filename));
                    added += 1;
                }
            }
            Ok((added, added > 0))
        })?;
        if added > 0 {
            info!(added, "registered untracked uploads");
        }
        Ok(added)
    }

    /// Claims `filename` for one run. `None` when another run holds it.
    pub fn try_claim(self: &Arc<Self>, filename: &str) -> Option<DocumentClaim> {
        let mut state = self.state.lock();
        if !state.in_flight.insert(filename.to_string()) {
            return None;
        }
        Some(DocumentClaim {
            registry: Arc::clone(self),
            filename: filename.to_string(),
        })
    }

    pub fn is_in_flight(&self, filename: &str) -> bool {
        self.state.lock().in_flight.contains(filename)
    }

    fn release(&self, filename: &str) {
        self.state.lock().in_flight.remove(filename);
    }

    /// Applies `mutate` to a copy of the documents, writes the snapshot and
    /// only then publishes the copy. A failed write leaves memory as it was.
    /// `mutate` reports whether anything changed; unchanged copies are
    /// neither written nor published.
    fn commit<T>(
        &self,
        mutate: impl FnOnce(&mut Documents) -> Result<(T, bool), PipelineError>,
    ) -> Result<T, PipelineError> {
        let _writer = self.writer.lock();
        let mut documents = self.state.lock().documents.clone();

        let (outcome, changed) = mutate(&mut documents)?;
        if changed {
            self.persist(&documents)?;
            self.state.lock().documents = documents;
        }
        Ok(outcome)
    }

    fn persist(&self, documents: &Documents) -> Result<(), PipelineError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let documents: Vec<&Document> = documents.values().collect();
        let bytes = serde_json::to_vec_pretty(&documents)
            .map_err(|error| PipelineError::Persistence(error.to_string()))?;
        write_atomically(path, &bytes).map_err(|error| {
            warn!(path = %path.display(), error = %error, "failed to write registry snapshot");
            PipelineError::Persistence(error.to_string())
        })
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Exclusive hold on one document for the duration of a run.
pub struct DocumentClaim {
    registry: Arc<DocumentRegistry>,
    filename: String,
}

impl DocumentClaim {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl Drop for DocumentClaim {
    fn drop(&mut self) {
        self.registry.release(&self.filename);
    }
}
