//! Wires configuration into a ready pipeline.

use anyhow::Context;
use colloquy_config::{AppConfig, MemoryBackendKind, MemoryConfig};
use colloquy_core::event::EventBus;
use colloquy_core::memory::ConversationRepository;
use colloquy_core::model::ChatModel;
use colloquy_core::pipeline::{PipelineRequest, PipelineResponse};
use colloquy_core::retrieval::VectorIndex;
use colloquy_memory::{ConversationMemory, FileRepository, InMemoryRepository, InMemoryVectorIndex};
use colloquy_pipeline::{AdvisorRegistry, ChatPipeline, ValidatingPipeline};
use colloquy_telemetry::TelemetryEngine;
use colloquy_tools::TicketRepository;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Runtime {
    pub pipeline: ChatPipeline,
    pub validating: Option<ValidatingPipeline>,
    pub telemetry: Arc<TelemetryEngine>,
    pub backend: String,
}

impl Runtime {
    /// Assemble the chain named in `config` around `model`.
    pub async fn build(config: &AppConfig, model: Arc<dyn ChatModel>) -> anyhow::Result<Self> {
        let events = EventBus::default();
        let telemetry = Arc::new(TelemetryEngine::new());
        telemetry.spawn(&events);

        let repository = repository(&config.memory).await?;
        let memory = Arc::new(
            ConversationMemory::new(repository)
                .with_window(config.memory.window)
                .with_timeout(Duration::from_millis(config.memory.timeout_ms)),
        );
        let backend = memory.backend_name().to_string();

        let index = if config.retrieval.enabled {
            Some(vector_index(config, model.clone())?)
        } else {
            None
        };

        let tickets = Arc::new(TicketRepository::new());
        let tools = Arc::new(colloquy_tools::default_registry(&config.tools.enabled, tickets)?);

        let registry = AdvisorRegistry::standard(config, Some(memory.clone()), index, tools, &events);
        let pipeline = ChatPipeline::from_config(config, model.clone(), &registry, Some(memory), events)?;
        info!(advisors = ?pipeline.advisor_names(), backend = %backend, "Pipeline ready");

        let validating = config
            .validation
            .enabled
            .then(|| ValidatingPipeline::from_config(pipeline.clone(), model, &config.validation));

        Ok(Self {
            pipeline,
            validating,
            telemetry,
            backend,
        })
    }

    /// One request through the validator when enabled, else the bare chain.
    pub async fn call(&self, request: PipelineRequest) -> colloquy_core::error::Result<PipelineResponse> {
        match &self.validating {
            Some(validating) => validating.call(request).await,
            None => self.pipeline.call(request).await,
        }
    }
}

async fn repository(config: &MemoryConfig) -> anyhow::Result<Arc<dyn ConversationRepository>> {
    Ok(match config.backend {
        MemoryBackendKind::Memory => Arc::new(InMemoryRepository::new()),
        MemoryBackendKind::File => Arc::new(FileRepository::new(config.resolved_path())),
        MemoryBackendKind::Sqlite => sqlite_repository(config).await?,
    })
}

#[cfg(feature = "sqlite")]
async fn sqlite_repository(config: &MemoryConfig) -> anyhow::Result<Arc<dyn ConversationRepository>> {
    let path = config.resolved_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let repository = colloquy_memory::SqliteRepository::new(&path.to_string_lossy()).await?;
    Ok(Arc::new(repository))
}

#[cfg(not(feature = "sqlite"))]
async fn sqlite_repository(_config: &MemoryConfig) -> anyhow::Result<Arc<dyn ConversationRepository>> {
    anyhow::bail!("memory.backend = \"sqlite\" requires the `sqlite` feature")
}

fn vector_index(config: &AppConfig, embedder: Arc<dyn ChatModel>) -> anyhow::Result<Arc<dyn VectorIndex>> {
    let mut index = InMemoryVectorIndex::new(embedder).with_embedding_model(config.model.embedding_model.clone());
    match &config.retrieval.documents_path {
        Some(path) => {
            let documents = InMemoryVectorIndex::load_documents(path)
                .with_context(|| format!("Failed to load retrieval documents from {}", path.display()))?;
            info!(count = documents.len(), "Loaded retrieval documents");
            index = index.with_documents(documents);
        }
        None => warn!("Retrieval enabled without retrieval.documents_path, the index is empty"),
    }
    Ok(Arc::new(index))
}
