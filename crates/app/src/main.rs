use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use docgraph_core::{
    DocumentOutcome, DocumentRegistry, Embedder, GraphBuildAdapter, GraphRetriever, GraphStore,
    HttpOcrEngine, Neo4jStore, OcrAdapter, OcrEndpointConfig, OcrEngine, OpenAiClient,
    OpenAiConfig, PipelineOrchestrator, PipelineSettings, TaskStatus, UploadStore,
    DEFAULT_TOP_K,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docgraph", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding source uploads.
    #[arg(long, env = "DOCGRAPH_DATA_DIR", default_value = "pipeline/data")]
    data_dir: PathBuf,

    /// Directory holding extracted text and the registry snapshot.
    #[arg(long, env = "DOCGRAPH_OUTPUT_DIR", default_value = "pipeline/output")]
    output_dir: PathBuf,

    /// Neo4j HTTP endpoint
    #[arg(long, env = "NEO4J_URI", default_value = "http://localhost:7474")]
    neo4j_uri: String,

    #[arg(long, env = "NEO4J_DATABASE", default_value = "neo4j")]
    neo4j_database: String,

    #[arg(long, env = "NEO4J_USERNAME", default_value = "neo4j")]
    neo4j_username: String,

    #[arg(long, env = "NEO4J_PASSWORD", default_value = "password", hide_env_values = true)]
    neo4j_password: String,

    /// Vector index over chunk embeddings.
    #[arg(long, default_value = docgraph_core::DEFAULT_VECTOR_INDEX)]
    vector_index: String,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    openai_api_key: String,

    #[arg(long, default_value = docgraph_core::DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Must match the vector index dimensionality.
    #[arg(long, default_value = "1536")]
    embedding_dimensions: usize,

    #[arg(long, default_value = docgraph_core::DEFAULT_LLM_MODEL)]
    llm_model: String,

    /// OCR endpoint for images and scanned PDFs.
    #[arg(long, env = "LLM_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    #[arg(long, env = "LLM_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,

    /// Documents processed at once within one run.
    #[arg(long, default_value = "2")]
    concurrency: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Create the vector index over chunk embeddings (one-time setup).
    InitIndex,
    /// Copy a file into the data dir and track it.
    Upload {
        #[arg(long)]
        file: PathBuf,
        /// Overwrite a document that is already tracked.
        #[arg(long, default_value_t = false)]
        replace: bool,
    },
    /// List tracked documents and their stages.
    List,
    /// Delete a document with its upload, extracted text and graph data.
    Delete {
        #[arg(long)]
        filename: String,
    },
    /// Run the pipeline over every eligible document and wait for it.
    Process {
        /// Re-run both stages even for indexed documents.
        #[arg(long, default_value_t = false)]
        force_reprocess: bool,
        /// Status polling interval in milliseconds.
        #[arg(long, default_value = "500")]
        poll_ms: u64,
    },
    /// Ask a question against the knowledge graph.
    Query {
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
    },
}

struct Services {
    settings: PipelineSettings,
    ocr: Option<OcrEndpointConfig>,
    graph: Arc<dyn GraphStore>,
    llm: Arc<OpenAiClient>,
}

impl Services {
    fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let settings = PipelineSettings {
            data_dir: cli.data_dir.clone(),
            output_dir: cli.output_dir.clone(),
            concurrency: cli.concurrency,
            vector_index: cli.vector_index.clone(),
            embedding_model: cli.embedding_model.clone(),
            llm_model: cli.llm_model.clone(),
            ..PipelineSettings::default()
        };

        let graph = Neo4jStore::new(
            &cli.neo4j_uri,
            &cli.neo4j_database,
            &cli.neo4j_username,
            &cli.neo4j_password,
        )
        .with_context(|| format!("invalid neo4j uri {}", cli.neo4j_uri))?;

        let mut llm_config = OpenAiConfig::new(&cli.openai_api_key);
        llm_config.base_url = cli.openai_base_url.clone();
        llm_config.embedding_model = settings.embedding_model.clone();
        llm_config.embedding_dimensions = cli.embedding_dimensions;
        llm_config.chat_model = settings.llm_model.clone();
        let llm = OpenAiClient::new(llm_config)?;

        let ocr = cli
            .ocr_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(|endpoint| OcrEndpointConfig {
                endpoint: endpoint.to_string(),
                api_key: cli.ocr_api_key.clone().filter(|key| !key.is_empty()),
            });

        Ok(Self {
            settings,
            ocr,
            graph: Arc::new(graph),
            llm: Arc::new(llm),
        })
    }

    fn orchestrator(&self) -> anyhow::Result<PipelineOrchestrator> {
        let settings = &self.settings;
        let registry = Arc::new(DocumentRegistry::open(settings.registry_path())?);
        let uploads = UploadStore::new(&settings.data_dir);

        let engine = self
            .ocr
            .clone()
            .map(|config| Arc::new(HttpOcrEngine::new(config)) as Arc<dyn OcrEngine>);
        if engine.is_none() {
            warn!("LLM_OCR_ENDPOINT not set; images and scanned PDFs will fail OCR");
        }

        let ocr = OcrAdapter::new(
            uploads.clone(),
            &settings.output_dir,
            engine,
            settings.retry.clone(),
        );
        let graph_build = GraphBuildAdapter::new(
            uploads.clone(),
            &settings.output_dir,
            settings.chunking(),
            &settings.vector_index,
            self.llm.clone(),
            self.llm.clone(),
            self.graph.clone(),
            settings.retry.clone(),
        );

        Ok(PipelineOrchestrator::new(
            registry,
            uploads,
            Arc::new(ocr),
            Arc::new(graph_build),
            settings.concurrency,
        ))
    }

    fn retriever(&self) -> GraphRetriever {
        GraphRetriever::new(
            self.graph.clone(),
            self.llm.clone(),
            self.llm.clone(),
            self.settings.retry.clone(),
            &self.settings.vector_index,
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let services = Services::from_cli(&cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "docgraph boot"
    );

    match cli.command {
        Command::InitIndex => {
            let dimensions = services.llm.dimensions();
            let index = services
                .graph
                .ensure_vector_index(&services.settings.vector_index, dimensions)
                .await?;
            if index.dimensions != dimensions {
                bail!(
                    "index {} already exists with {} dimensions; embedder produces {}",
                    index.name,
                    index.dimensions,
                    dimensions
                );
            }
            println!("vector index {} ready ({} dimensions)", index.name, index.dimensions);
        }
        Command::Upload { file, replace } => {
            let orchestrator = services.orchestrator()?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("cannot read {}", file.display()))?;
            let name = file_name(&file)?;
            let document = orchestrator.upload(name, &bytes, replace).await?;
            println!("uploaded {} ({})", document.filename, document.stage);
        }
        Command::List => {
            let orchestrator = services.orchestrator()?;
            orchestrator.reconcile_uploads()?;
            let documents = orchestrator.registry().list();
            if documents.is_empty() {
                println!("no documents");
            }
            for document in documents {
                println!(
                    "{}\t{}\t{}",
                    document.filename,
                    document.stage,
                    document.updated_at.to_rfc3339()
                );
                if let Some(error) = document.error {
                    println!("  error[{}]: {}", error.step, error.message);
                }
            }
        }
        Command::Delete { filename } => {
            let orchestrator = services.orchestrator()?;
            match orchestrator.delete_document(&filename).await? {
                Some(document) => println!("deleted {}", document.filename),
                None => println!("{filename} is not tracked; nothing to delete"),
            }
        }
        Command::Process {
            force_reprocess,
            poll_ms,
        } => {
            let orchestrator = services.orchestrator()?;
            let added = orchestrator.reconcile_uploads()?;
            if added > 0 {
                info!(added, "tracked new uploads");
            }

            let task_id = orchestrator.start_run(force_reprocess);
            println!("task {task_id} started");

            let mut last_label = String::new();
            loop {
                tokio::time::sleep(Duration::from_millis(poll_ms.max(50))).await;
                let task = orchestrator.get_status(&task_id)?;
                let label = task.progress_label();
                if label != last_label {
                    println!("{} {}", task.status.as_str(), label);
                    last_label = label;
                }
                if task.status.is_terminal() {
                    break;
                }
            }

            let task = orchestrator.join(&task_id).await?;
            for (filename, progress) in &task.documents {
                println!("{filename}\t{}\t{}", progress.stage, describe(&progress.outcome));
            }
            if task.status == TaskStatus::Failed {
                return Err(anyhow!(
                    "pipeline run failed: {}",
                    task.error.unwrap_or_else(|| "unknown error".to_string())
                ));
            }
        }
        Command::Query { query, top_k } => {
            let result = services.retriever().query(&query, top_k).await?;
            println!("{}", result.answer);
            if !result.citations.is_empty() {
                println!();
                println!("sources:");
            }
            for (position, citation) in result.citations.iter().enumerate() {
                println!(
                    "[{}] {} score={:.4} chunk={}",
                    position + 1,
                    citation.document_path,
                    citation.score,
                    citation.chunk_id
                );
                println!("    {}", citation.excerpt.replace('\n', " "));
            }
        }
    }

    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))
}

fn describe(outcome: &DocumentOutcome) -> String {
    match outcome {
        DocumentOutcome::Pending => "pending".to_string(),
        DocumentOutcome::InProgress => "in progress".to_string(),
        DocumentOutcome::Succeeded => "succeeded".to_string(),
        DocumentOutcome::Skipped { reason } => format!("skipped: {reason}"),
        DocumentOutcome::Failed { reason } => format!("failed: {reason}"),
        DocumentOutcome::Aborted { reason } => format!("aborted: {reason}"),
    }
}
