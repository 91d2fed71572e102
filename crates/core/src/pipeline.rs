//! Background pipeline runs.
//!
//! A run walks every eligible document through the stage adapters in order
//! (`uploaded -> ocr_complete -> indexed`). Documents are independent: one
//! document's failure is recorded on the document and on the task, and the
//! run carries on. A systemic failure stops the run; documents not finished
//! yet keep whatever stage they last recorded.

use crate::error::{CollaboratorError, PipelineError};
use crate::models::{
    Document, DocumentError, DocumentOutcome, DocumentProgress, Stage, Task, TaskStatus,
};
use crate::registry::DocumentRegistry;
use crate::traits::StageAdapter;
use crate::uploads::{sanitize_filename, validate_filename, UploadStore};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const SKIP_ALREADY_INDEXED: &str = "already indexed";
pub const SKIP_IN_FLIGHT: &str = "in flight in another run";

#[derive(Default)]
struct TaskBoard {
    tasks: Mutex<HashMap<String, Task>>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskBoard {
    fn insert(&self, task: Task) {
        self.tasks.lock().insert(task.task_id.clone(), task);
    }

    fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().get(task_id).cloned()
    }

    /// Terminal tasks are frozen; late updates are dropped.
    fn update(&self, task_id: &str, apply: impl FnOnce(&mut Task)) {
        if let Some(task) = self.tasks.lock().get_mut(task_id) {
            if !task.status.is_terminal() {
                apply(task);
            }
        }
    }

    fn progress(&self, task_id: &str, filename: &str, stage: Stage, outcome: DocumentOutcome) {
        self.update(task_id, |task| {
            task.documents.insert(
                filename.to_string(),
                DocumentProgress {
                    stage,
                    outcome,
                    updated_at: Utc::now(),
                },
            );
        });
    }

    fn finish(&self, task_id: &str, status: TaskStatus, error: Option<String>) {
        self.update(task_id, |task| {
            task.status = status;
            task.error = error;
            task.finished_at = Some(Utc::now());
        });
    }
}

/// How one document's walk through the stages ended.
enum Walk {
    Indexed,
    Failed(String),
    Skipped(String),
    Aborted(String),
}

struct PipelineInner {
    registry: Arc<DocumentRegistry>,
    uploads: UploadStore,
    stages: Vec<Arc<dyn StageAdapter>>,
    tasks: TaskBoard,
    concurrency: usize,
}

/// Drives documents through OCR and graph build as background tasks.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<PipelineInner>,
}

impl PipelineOrchestrator {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        uploads: UploadStore,
        ocr: Arc<dyn StageAdapter>,
        graph_build: Arc<dyn StageAdapter>,
        concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                registry,
                uploads,
                stages: vec![ocr, graph_build],
                tasks: TaskBoard::default(),
                concurrency: concurrency.max(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.inner.registry
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.inner.uploads
    }

    /// Queues a run and returns its id right away. Must be called from
    /// inside a tokio runtime.
    pub fn start_run(&self, force_reprocess: bool) -> String {
        let task_id = Uuid::new_v4().simple().to_string();
        self.inner.tasks.insert(Task::new(&task_id, force_reprocess));

        // The run drops its own handle when it ends, so callers that only
        // poll `get_status` do not accumulate handles. Holding the lock
        // across the spawn keeps that removal after the insert.
        let mut handles = self.inner.tasks.handles.lock();
        let inner = Arc::clone(&self.inner);
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            inner.run(&id, force_reprocess).await;
            inner.tasks.handles.lock().remove(&id);
        });
        handles.insert(task_id.clone(), handle);
        drop(handles);

        info!(task_id = %task_id, force_reprocess, "pipeline run queued");
        task_id
    }

    /// Current snapshot; never waits on the run.
    pub fn get_status(&self, task_id: &str) -> Result<Task, PipelineError> {
        self.inner
            .tasks
            .get(task_id)
            .ok_or_else(|| PipelineError::task_not_found(task_id))
    }

    /// Waits for the run to end and returns its final snapshot.
    pub async fn join(&self, task_id: &str) -> Result<Task, PipelineError> {
        let handle = self.inner.tasks.handles.lock().remove(task_id);
        if let Some(handle) = handle {
            if let Err(join_error) = handle.await {
                error!(task_id, error = %join_error, "pipeline run did not finish");
                self.inner.tasks.finish(
                    task_id,
                    TaskStatus::Failed,
                    Some(format!("run stopped unexpectedly: {join_error}")),
                );
            }
        }
        self.get_status(task_id)
    }

    /// Stores an upload and tracks it at `uploaded`. With `replace`, an
    /// existing document of the same name is reset and its derived data
    /// dropped so the new content is processed from scratch.
    pub async fn upload(
        &self,
        filename: &str,
        bytes: &[u8],
        replace: bool,
    ) -> Result<Document, PipelineError> {
        let safe_name = sanitize_filename(filename);
        let exists = self.inner.registry.get(&safe_name).is_ok();
        if exists && !replace {
            return Err(PipelineError::AlreadyExists(safe_name));
        }

        let _claim = self
            .inner
            .registry
            .try_claim(&safe_name)
            .ok_or_else(|| PipelineError::InFlight(safe_name.clone()))?;

        if exists {
            self.inner.purge(&safe_name).await?;
        }
        let stored = self
            .inner
            .uploads
            .save(&safe_name, bytes)
            .map_err(|error| PipelineError::Upload(error.to_string()))?;
        self.inner.registry.register(&stored, replace)
    }

    /// Deletes the document, its source upload and everything derived from
    /// it. Unknown names are a no-op.
    pub async fn delete_document(&self, filename: &str) -> Result<Option<Document>, PipelineError> {
        let filename = validate_filename(filename)?;
        if self.inner.registry.get(filename).is_err() {
            return Ok(None);
        }

        let _claim = self
            .inner
            .registry
            .try_claim(filename)
            .ok_or_else(|| PipelineError::InFlight(filename.to_string()))?;

        self.inner.purge(filename).await?;
        self.inner
            .uploads
            .remove(filename)
            .map_err(|error| PipelineError::Cleanup {
                filename: filename.to_string(),
                message: error.to_string(),
            })?;
        self.inner.registry.remove(filename)
    }

    /// Tracks files that exist in the data dir but were never registered.
    pub fn reconcile_uploads(&self) -> Result<usize, PipelineError> {
        self.inner
            .registry
            .reconcile(self.inner.uploads.discover())
    }
}

impl PipelineInner {
    async fn purge(&self, filename: &str) -> Result<(), PipelineError> {
        for stage in &self.stages {
            stage
                .purge(filename)
                .await
                .map_err(|error| PipelineError::Cleanup {
                    filename: filename.to_string(),
                    message: error.to_string(),
                })?;
        }
        Ok(())
    }

    async fn run(&self, task_id: &str, force: bool) {
        self.tasks.update(task_id, |task| {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
        });

        let snapshot = self.registry.list();
        let mut eligible = Vec::new();
        for document in snapshot {
            match skip_reason(&document, force) {
                Some(reason) => self.tasks.progress(
                    task_id,
                    &document.filename,
                    document.stage,
                    DocumentOutcome::Skipped { reason },
                ),
                None => {
                    self.tasks.progress(
                        task_id,
                        &document.filename,
                        document.stage,
                        DocumentOutcome::Pending,
                    );
                    eligible.push(document);
                }
            }
        }

        info!(task_id, eligible = eligible.len(), force, "pipeline run started");

        if !eligible.is_empty() {
            if let Err(failure) = self.preflight().await {
                let reason = failure.to_string();
                error!(task_id, error = %reason, "pipeline preflight failed");
                for document in &eligible {
                    self.tasks.progress(
                        task_id,
                        &document.filename,
                        document.stage,
                        DocumentOutcome::Aborted {
                            reason: reason.clone(),
                        },
                    );
                }
                self.tasks.finish(task_id, TaskStatus::Failed, Some(reason));
                return;
            }
        }

        let abort: Mutex<Option<String>> = Mutex::new(None);
        let abort_ref = &abort;
        stream::iter(eligible)
            .map(|document| async move {
                let filename = document.filename.clone();
                let walk = self.walk(task_id, document, force, abort_ref).await;
                (filename, walk)
            })
            .buffer_unordered(self.concurrency)
            .for_each(|(filename, walk)| async move {
                self.record_walk(task_id, &filename, walk, abort_ref);
            })
            .await;

        let systemic = abort.lock().take();
        match systemic {
            Some(reason) => {
                error!(task_id, error = %reason, "pipeline run aborted");
                self.tasks.finish(task_id, TaskStatus::Failed, Some(reason));
            }
            None => {
                if let Some(task) = self.tasks.get(task_id) {
                    info!(task_id, progress = %task.progress_label(), "pipeline run completed");
                }
                self.tasks.finish(task_id, TaskStatus::Completed, None);
            }
        }
    }

    async fn preflight(&self) -> Result<(), CollaboratorError> {
        for stage in &self.stages {
            stage.preflight().await?;
        }
        Ok(())
    }

    fn record_walk(&self, task_id: &str, filename: &str, walk: Walk, abort: &Mutex<Option<String>>) {
        let stage = self
            .registry
            .get(filename)
            .map(|document| document.stage)
            .unwrap_or(Stage::Uploaded);

        let outcome = match walk {
            Walk::Indexed => DocumentOutcome::Succeeded,
            Walk::Failed(reason) => DocumentOutcome::Failed { reason },
            Walk::Skipped(reason) => DocumentOutcome::Skipped { reason },
            Walk::Aborted(reason) => {
                let mut systemic = abort.lock();
                if systemic.is_none() {
                    *systemic = Some(reason.clone());
                }
                DocumentOutcome::Aborted { reason }
            }
        };
        self.tasks.progress(task_id, filename, stage, outcome);
    }

    /// Takes one document as far as it goes in this run.
    async fn walk(
        &self,
        task_id: &str,
        snapshot: Document,
        force: bool,
        abort: &Mutex<Option<String>>,
    ) -> Walk {
        let filename = snapshot.filename.as_str();
        if let Some(reason) = abort.lock().clone() {
            return Walk::Aborted(reason);
        }

        let Some(_claim) = self.registry.try_claim(filename) else {
            info!(task_id, filename, "document claimed by another run, skipping");
            return Walk::Skipped(SKIP_IN_FLIGHT.to_string());
        };

        // Re-read under the claim; another run may have moved it since the
        // snapshot was taken, or it may have been deleted.
        let document = match self.registry.get(filename) {
            Ok(document) => document,
            Err(_) => return Walk::Skipped("removed before processing".to_string()),
        };
        if let Some(reason) = skip_reason(&document, force) {
            return Walk::Skipped(reason);
        }

        let mut recorded = document.stage;
        let mut stage = match recorded {
            Stage::Failed => Stage::Uploaded,
            _ if force => Stage::Uploaded,
            current => current,
        };

        for adapter in &self.stages {
            if adapter.input_stage() != stage {
                continue;
            }
            if let Some(reason) = abort.lock().clone() {
                return Walk::Aborted(reason);
            }

            self.tasks
                .progress(task_id, filename, recorded, DocumentOutcome::InProgress);
            info!(task_id, filename, stage = adapter.name(), "running stage");

            let current = match self.registry.get(filename) {
                Ok(current) => current,
                Err(error) => return Walk::Aborted(format!("registry: {error}")),
            };
            if let Err(failure) = adapter.process(&current, force).await {
                return self.fail(task_id, filename, recorded, adapter.name(), failure);
            }

            // A rewound document only leaves its old stage once the first
            // stage has succeeded again.
            if recorded != stage {
                if let Err(error) = self.registry.transition(filename, stage, None) {
                    return Walk::Aborted(format!("registry: {error}"));
                }
            }
            stage = adapter.output_stage();
            if let Err(error) = self.registry.transition(filename, stage, None) {
                return Walk::Aborted(format!("registry: {error}"));
            }
            recorded = stage;
            self.tasks
                .progress(task_id, filename, recorded, DocumentOutcome::InProgress);
        }

        if stage == Stage::Indexed {
            Walk::Indexed
        } else {
            Walk::Failed(format!("stopped at {stage}"))
        }
    }

    fn fail(
        &self,
        task_id: &str,
        filename: &str,
        recorded: Stage,
        step: &str,
        failure: CollaboratorError,
    ) -> Walk {
        if failure.is_systemic() {
            error!(
                task_id,
                filename,
                step,
                collaborator = failure.collaborator(),
                error = %failure,
                "systemic failure"
            );
            return Walk::Aborted(failure.to_string());
        }

        warn!(
            task_id,
            filename,
            step,
            collaborator = failure.collaborator(),
            error = %failure,
            "document failed"
        );
        let record = DocumentError {
            step: step.to_string(),
            message: failure.to_string(),
            recoverable: failure.is_recoverable(),
        };

        // failed -> failed is not an edge; a retried document is rewound first.
        if recorded == Stage::Failed {
            if let Err(error) = self.registry.transition(filename, Stage::Uploaded, None) {
                return Walk::Aborted(format!("registry: {error}"));
            }
        }
        match self.registry.transition(filename, Stage::Failed, Some(record)) {
            Ok(_) => Walk::Failed(failure.to_string()),
            Err(error) => Walk::Aborted(format!("registry: {error}")),
        }
    }
}

/// `None` when the document should be processed in a run with the given
/// `force` flag.
fn skip_reason(document: &Document, force: bool) -> Option<String> {
    if force {
        return None;
    }
    match (&document.stage, &document.error) {
        (Stage::Indexed, _) => Some(SKIP_ALREADY_INDEXED.to_string()),
        (Stage::Failed, Some(error)) if !error.recoverable => Some(format!(
            "failed permanently in {}: {}; force reprocessing to retry",
            error.step, error.message
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    /// Stage adapter driven entirely by the test.
    struct ScriptedStage {
        name: &'static str,
        input: Stage,
        output: Stage,
        failures: Mutex<HashMap<String, CollaboratorError>>,
        systemic_preflight: AtomicBool,
        calls: AtomicUsize,
        processed: Mutex<Vec<String>>,
        purged: Mutex<HashSet<String>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedStage {
        fn new(name: &'static str, input: Stage, output: Stage) -> Self {
            Self {
                name,
                input,
                output,
                failures: Mutex::new(HashMap::new()),
                systemic_preflight: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                processed: Mutex::new(Vec::new()),
                purged: Mutex::new(HashSet::new()),
                gate: None,
            }
        }

        fn ocr() -> Self {
            Self::new("ocr", Stage::Uploaded, Stage::OcrComplete)
        }

        fn graph() -> Self {
            Self::new("graph_build", Stage::OcrComplete, Stage::Indexed)
        }

        fn fail_on(self, filename: &str, error: CollaboratorError) -> Self {
            self.failures.lock().insert(filename.to_string(), error);
            self
        }

        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl StageAdapter for ScriptedStage {
        fn name(&self) -> &'static str {
            self.name
        }

        fn input_stage(&self) -> Stage {
            self.input
        }

        fn output_stage(&self) -> Stage {
            self.output
        }

        async fn preflight(&self) -> Result<(), CollaboratorError> {
            if self.systemic_preflight.load(Ordering::SeqCst) {
                return Err(CollaboratorError::systemic("graph", "connection refused"));
            }
            Ok(())
        }

        async fn process(&self, document: &Document, _force: bool) -> Result<(), CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(error) = self.failures.lock().get(&document.filename) {
                return Err(error.clone());
            }
            self.processed.lock().push(document.filename.clone());
            Ok(())
        }

        async fn purge(&self, filename: &str) -> Result<(), CollaboratorError> {
            self.purged.lock().insert(filename.to_string());
            Ok(())
        }
    }

    struct Harness {
        orchestrator: PipelineOrchestrator,
        ocr: Arc<ScriptedStage>,
        graph: Arc<ScriptedStage>,
        _dir: tempfile::TempDir,
    }

    fn harness(files: &[&str], ocr: ScriptedStage, graph: ScriptedStage) -> Harness {
        let dir = tempdir().unwrap();
        let registry = Arc::new(DocumentRegistry::new());
        for file in files {
            registry.register(file, false).unwrap();
        }
        let ocr = Arc::new(ocr);
        let graph = Arc::new(graph);
        let orchestrator = PipelineOrchestrator::new(
            registry,
            UploadStore::new(dir.path()),
            ocr.clone(),
            graph.clone(),
            2,
        );
        Harness {
            orchestrator,
            ocr,
            graph,
            _dir: dir,
        }
    }

    fn stage_of(harness: &Harness, filename: &str) -> Stage {
        harness.orchestrator.registry().get(filename).unwrap().stage
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let h = harness(&[], ScriptedStage::ocr(), ScriptedStage::graph());
        assert_eq!(
            h.orchestrator.get_status("nope").unwrap_err(),
            PipelineError::task_not_found("nope")
        );
    }

    #[tokio::test]
    async fn run_indexes_every_document() {
        let h = harness(&["a.pdf", "b.png"], ScriptedStage::ocr(), ScriptedStage::graph());
        let task_id = h.orchestrator.start_run(false);
        let task = h.orchestrator.join(&task_id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress_label(), "2/2 files");
        for name in ["a.pdf", "b.png"] {
            assert_eq!(stage_of(&h, name), Stage::Indexed);
            assert_eq!(task.outcome(name), Some(&DocumentOutcome::Succeeded));
            assert_eq!(task.documents[name].stage, Stage::Indexed);
        }
    }

    #[tokio::test]
    async fn polled_runs_do_not_keep_their_handles() {
        let h = harness(&["a.pdf"], ScriptedStage::ocr(), ScriptedStage::graph());
        let task_id = h.orchestrator.start_run(false);

        for _ in 0..200 {
            if h.orchestrator.inner.tasks.handles.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(h.orchestrator.inner.tasks.handles.lock().is_empty());
        let task = h.orchestrator.get_status(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let joined = h.orchestrator.join(&task_id).await.unwrap();
        assert_eq!(joined.status, task.status);
        assert_eq!(joined.documents, task.documents);
    }

    #[tokio::test]
    async fn indexed_documents_are_skipped_without_force() {
        let h = harness(&["a.pdf", "b.png"], ScriptedStage::ocr(), ScriptedStage::graph());
        let first = h.orchestrator.start_run(false);
        h.orchestrator.join(&first).await.unwrap();
        let calls = h.ocr.calls.load(Ordering::SeqCst);

        let second = h.orchestrator.start_run(false);
        let task = h.orchestrator.join(&second).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        for progress in task.documents.values() {
            assert_eq!(
                progress.outcome,
                DocumentOutcome::Skipped {
                    reason: SKIP_ALREADY_INDEXED.to_string()
                }
            );
        }
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), calls);
        assert_eq!(stage_of(&h, "a.pdf"), Stage::Indexed);
    }

    #[tokio::test]
    async fn forced_run_repeats_both_stages() {
        let h = harness(&["a.pdf"], ScriptedStage::ocr(), ScriptedStage::graph());
        let first = h.orchestrator.start_run(false);
        h.orchestrator.join(&first).await.unwrap();

        let forced = h.orchestrator.start_run(true);
        let task = h.orchestrator.join(&forced).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.force_reprocess);
        assert_eq!(h.ocr.processed.lock().len(), 2);
        assert_eq!(h.graph.processed.lock().len(), 2);
        assert_eq!(stage_of(&h, "a.pdf"), Stage::Indexed);
    }

    #[tokio::test]
    async fn one_failing_document_does_not_fail_the_batch() {
        let ocr = ScriptedStage::ocr().fail_on(
            "2.pdf",
            CollaboratorError::permanent("ocr", "no text found"),
        );
        let h = harness(&["1.pdf", "2.pdf", "3.pdf"], ocr, ScriptedStage::graph());
        let task_id = h.orchestrator.start_run(false);
        let task = h.orchestrator.join(&task_id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(stage_of(&h, "1.pdf"), Stage::Indexed);
        assert_eq!(stage_of(&h, "3.pdf"), Stage::Indexed);

        let failed = h.orchestrator.registry().get("2.pdf").unwrap();
        assert_eq!(failed.stage, Stage::Failed);
        let error = failed.error.unwrap();
        assert_eq!(error.step, "ocr");
        assert!(error.message.contains("no text found"));
        assert!(matches!(task.outcome("2.pdf"), Some(DocumentOutcome::Failed { .. })));
    }

    #[tokio::test]
    async fn recoverable_failure_is_retried_by_next_run() {
        let graph = ScriptedStage::graph().fail_on(
            "a.pdf",
            CollaboratorError::permanent("extractor", "invalid json"),
        );
        let h = harness(&["a.pdf"], ScriptedStage::ocr(), graph);
        let first = h.orchestrator.start_run(false);
        h.orchestrator.join(&first).await.unwrap();
        assert_eq!(stage_of(&h, "a.pdf"), Stage::Failed);

        h.graph.failures.lock().clear();
        let second = h.orchestrator.start_run(false);
        let task = h.orchestrator.join(&second).await.unwrap();

        assert_eq!(task.outcome("a.pdf"), Some(&DocumentOutcome::Succeeded));
        let document = h.orchestrator.registry().get("a.pdf").unwrap();
        assert_eq!(document.stage, Stage::Indexed);
        assert!(document.error.is_none());
    }

    #[tokio::test]
    async fn failing_twice_keeps_the_latest_error() {
        let ocr = ScriptedStage::ocr().fail_on("a.pdf", CollaboratorError::permanent("ocr", "first"));
        let h = harness(&["a.pdf"], ocr, ScriptedStage::graph());
        let first = h.orchestrator.start_run(false);
        h.orchestrator.join(&first).await.unwrap();

        h.ocr
            .failures
            .lock()
            .insert("a.pdf".to_string(), CollaboratorError::permanent("ocr", "second"));
        let second = h.orchestrator.start_run(false);
        h.orchestrator.join(&second).await.unwrap();

        let document = h.orchestrator.registry().get("a.pdf").unwrap();
        assert_eq!(document.stage, Stage::Failed);
        assert!(document.error.unwrap().message.contains("second"));
    }

    #[tokio::test]
    async fn rejected_documents_wait_for_a_forced_run() {
        let ocr = ScriptedStage::ocr().fail_on(
            "a.pdf",
            CollaboratorError::rejected("ocr", "source file missing"),
        );
        let h = harness(&["a.pdf"], ocr, ScriptedStage::graph());
        let first = h.orchestrator.start_run(false);
        h.orchestrator.join(&first).await.unwrap();

        let second = h.orchestrator.start_run(false);
        let task = h.orchestrator.join(&second).await.unwrap();
        assert!(matches!(task.outcome("a.pdf"), Some(DocumentOutcome::Skipped { .. })));
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 1);

        h.ocr.failures.lock().clear();
        let forced = h.orchestrator.start_run(true);
        h.orchestrator.join(&forced).await.unwrap();
        assert_eq!(stage_of(&h, "a.pdf"), Stage::Indexed);
    }

    #[tokio::test]
    async fn systemic_preflight_failure_leaves_documents_untouched() {
        let graph = ScriptedStage::graph();
        graph.systemic_preflight.store(true, Ordering::SeqCst);
        let h = harness(&["a.pdf", "b.pdf"], ScriptedStage::ocr(), graph);

        let task_id = h.orchestrator.start_run(false);
        let task = h.orchestrator.join(&task_id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("connection refused"));
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 0);
        for name in ["a.pdf", "b.pdf"] {
            assert_eq!(stage_of(&h, name), Stage::Uploaded);
            assert!(matches!(task.outcome(name), Some(DocumentOutcome::Aborted { .. })));
        }
    }

    #[tokio::test]
    async fn systemic_failure_mid_run_stops_the_run() {
        let graph = ScriptedStage::graph().fail_on(
            "a.pdf",
            CollaboratorError::systemic("graph", "database unreachable"),
        );
        let h = harness(&["a.pdf"], ScriptedStage::ocr(), graph);

        let task_id = h.orchestrator.start_run(false);
        let task = h.orchestrator.join(&task_id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        // The last recorded stage stays; nothing is marked failed.
        let document = h.orchestrator.registry().get("a.pdf").unwrap();
        assert_eq!(document.stage, Stage::OcrComplete);
        assert!(document.error.is_none());
        assert!(!h.orchestrator.registry().is_in_flight("a.pdf"));
    }

    #[tokio::test]
    async fn terminal_tasks_do_not_change() {
        let h = harness(&["a.pdf"], ScriptedStage::ocr(), ScriptedStage::graph());
        let task_id = h.orchestrator.start_run(false);
        let done = h.orchestrator.join(&task_id).await.unwrap();

        h.orchestrator.inner.tasks.progress(
            &task_id,
            "a.pdf",
            Stage::Uploaded,
            DocumentOutcome::InProgress,
        );
        let later = h.orchestrator.get_status(&task_id).unwrap();
        assert_eq!(later.documents, done.documents);
        assert_eq!(later.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_run_skips_documents_in_flight() {
        let gate = Arc::new(Notify::new());
        let ocr = ScriptedStage::ocr().gated(gate.clone());
        let h = harness(&["a.pdf"], ocr, ScriptedStage::graph());

        let first = h.orchestrator.start_run(false);
        while h.ocr.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let running = h.orchestrator.get_status(&first).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.outcome("a.pdf"), Some(&DocumentOutcome::InProgress));

        let second = h.orchestrator.start_run(false);
        let skipped = h.orchestrator.join(&second).await.unwrap();
        assert_eq!(
            skipped.outcome("a.pdf"),
            Some(&DocumentOutcome::Skipped {
                reason: SKIP_IN_FLIGHT.to_string()
            })
        );

        gate.notify_one();
        let task = h.orchestrator.join(&first).await.unwrap();
        assert_eq!(task.outcome("a.pdf"), Some(&DocumentOutcome::Succeeded));
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleting_untracked_document_is_a_noop() {
        let h = harness(&[], ScriptedStage::ocr(), ScriptedStage::graph());
        assert_eq!(h.orchestrator.delete_document("ghost.pdf").await, Ok(None));
        assert!(h.ocr.purged.lock().is_empty());
    }

    #[tokio::test]
    async fn delete_purges_every_stage() {
        let h = harness(&[], ScriptedStage::ocr(), ScriptedStage::graph());
        h.orchestrator
            .upload("notes.txt", b"Alice founded Acme Corp.", false)
            .await
            .unwrap();

        let removed = h.orchestrator.delete_document("notes.txt").await.unwrap();
        assert_eq!(removed.map(|doc| doc.filename), Some("notes.txt".to_string()));
        assert!(h.ocr.purged.lock().contains("notes.txt"));
        assert!(h.graph.purged.lock().contains("notes.txt"));
        assert!(!h.orchestrator.uploads().path_for("notes.txt").exists());
        assert!(h.orchestrator.registry().list().is_empty());
    }

    #[tokio::test]
    async fn delete_rejects_paths() {
        let h = harness(&[], ScriptedStage::ocr(), ScriptedStage::graph());
        assert!(matches!(
            h.orchestrator.delete_document("../secret.txt").await,
            Err(PipelineError::InvalidFilename(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_upload_needs_replace() {
        let h = harness(&[], ScriptedStage::ocr(), ScriptedStage::graph());
        h.orchestrator.upload("a.txt", b"one", false).await.unwrap();
        assert_eq!(
            h.orchestrator.upload("a.txt", b"two", false).await,
            Err(PipelineError::AlreadyExists("a.txt".to_string()))
        );

        let run = h.orchestrator.start_run(false);
        h.orchestrator.join(&run).await.unwrap();
        assert_eq!(stage_of(&h, "a.txt"), Stage::Indexed);

        let replaced = h.orchestrator.upload("a.txt", b"two", true).await.unwrap();
        assert_eq!(replaced.stage, Stage::Uploaded);
        assert!(h.ocr.purged.lock().contains("a.txt"));
    }

    #[tokio::test]
    async fn unsupported_upload_is_rejected() {
        let h = harness(&[], ScriptedStage::ocr(), ScriptedStage::graph());
        assert!(matches!(
            h.orchestrator.upload("tool.exe", b"MZ", false).await,
            Err(PipelineError::Upload(_))
        ));
        assert!(h.orchestrator.registry().list().is_empty());
    }

    #[tokio::test]
    async fn reconcile_registers_untracked_uploads() {
        let h = harness(&["a.pdf"], ScriptedStage::ocr(), ScriptedStage::graph());
        let data_dir = h.orchestrator.uploads().data_dir().to_path_buf();
        std::fs::write(data_dir.join("b.txt"), b"hello").unwrap();
        std::fs::write(data_dir.join("ignored.exe"), b"MZ").unwrap();

        assert_eq!(h.orchestrator.reconcile_uploads().unwrap(), 1);
        assert_eq!(stage_of(&h, "b.txt"), Stage::Uploaded);
    }
}
