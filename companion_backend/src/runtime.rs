use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::BackendConfig;
use crate::llm_client::{CompletionService, LlmClient};
use crate::pipeline::TurnPipeline;
use crate::relationship::{LlmSignalClassifier, SignalClassifier};
use crate::store::{DocumentStore, MemoryDocumentStore, SqliteDocumentStore};

/// `database_path` value that selects the in-process store
pub const IN_MEMORY_DATABASE: &str = ":memory:";

pub struct BackendRuntime {
    pub config: BackendConfig,
    pub pipeline: Arc<TurnPipeline>,
    pub store: Arc<dyn DocumentStore>,
}

pub struct BackendRuntimeBuilder {
    config: BackendConfig,
    completion: Option<Arc<dyn CompletionService>>,
    classifier: Option<Arc<dyn SignalClassifier>>,
    store: Option<Arc<dyn DocumentStore>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            completion: None,
            classifier: None,
            store: None,
        }
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SignalClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let completion: Arc<dyn CompletionService> = match self.completion {
            Some(completion) => completion,
            None => {
                if config.llm_api_key.is_none() {
                    tracing::warn!("LLM_API_KEY is unset; requests may be rejected by {}", config.llm_api_url);
                }
                let client = LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone(),
                    config.llm_model.clone(),
                );
                tracing::info!("Using completion model '{}' at {}", client.model(), config.llm_api_url);
                Arc::new(client)
            }
        };

        let classifier: Arc<dyn SignalClassifier> = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(LlmSignalClassifier::new(completion.clone())),
        };

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.database_path)?,
        };

        let pipeline = Arc::new(TurnPipeline::new(
            config.clone(),
            completion,
            classifier,
            store.clone(),
        ));

        tracing::info!(
            "Backend ready: {} persona(s), analysis mode {:?}, two-stage generation {}",
            pipeline.personas().len() + 1,
            config.analysis_mode,
            config.two_stage_generation
        );

        Ok(BackendRuntime {
            config,
            pipeline,
            store,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: BackendConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }
}

pub fn open_store(database_path: &str) -> Result<Arc<dyn DocumentStore>> {
    if database_path.trim() == IN_MEMORY_DATABASE {
        tracing::info!("Using in-memory document store");
        return Ok(Arc::new(MemoryDocumentStore::new()));
    }
    let store = SqliteDocumentStore::new(database_path)
        .with_context(|| format!("Failed to open state database {}", database_path))?;
    tracing::info!("Using SQLite document store at {}", database_path);
    Ok(Arc::new(store))
}
