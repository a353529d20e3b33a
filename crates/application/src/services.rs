//! Explicit session object wiring the core components together.
//!
//! Presentation layers hold one `AssistantServices` and pass it by reference;
//! there is no global state.

use crate::completion::CompletionController;
use crate::orchestrator::ChatOrchestrator;
use crate::profile::ProfileService;
use crate::{AppConfig, CONVERSATIONS_KEY, CUSTOM_MODELS_KEY, PARAMS_KEY};
use ndis_conversation::{ConversationSnapshot, ConversationStore};
use ndis_engine::{EngineManager, EngineRegistry, InferenceParameters};
use ndis_events::EventBusRef;
use ndis_models::{
    default_catalog, ArtifactFetcher, Downloader, HttpFetcher, ModelCatalog, ModelDescriptor,
    ModelError,
};
use ndis_storage::{Database, KeyValueStore, KeyValueStoreExt, StorageError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct AssistantServices {
    pub config: AppConfig,
    pub persistence: Arc<dyn KeyValueStore>,
    pub events: EventBusRef,
    pub catalog: Arc<ModelCatalog>,
    pub downloader: Downloader,
    pub engine: Arc<EngineManager>,
    pub completion: Arc<CompletionController>,
    pub conversations: Arc<ConversationStore>,
    pub profile: ProfileService,
    pub chat: ChatOrchestrator,
}

impl AssistantServices {
    /// Open the SQLite store under `config` and fetch artifacts over HTTP.
    pub fn open(
        config: AppConfig,
        events: EventBusRef,
        registry: EngineRegistry,
    ) -> Result<Self, StorageError> {
        let database = Database::open(&config.database_path())?;
        tracing::info!(data_dir = ?config.data_dir, "Opened assistant data");
        Ok(Self::new(
            config,
            Arc::new(database),
            events,
            Arc::new(HttpFetcher::new()),
            registry,
        ))
    }

    /// Hydrate every component from `persistence`.
    pub fn new(
        config: AppConfig,
        persistence: Arc<dyn KeyValueStore>,
        events: EventBusRef,
        fetcher: Arc<dyn ArtifactFetcher>,
        registry: EngineRegistry,
    ) -> Self {
        let mut models = default_catalog();
        let custom: Vec<ModelDescriptor> = persistence.load(CUSTOM_MODELS_KEY, Vec::new());
        models.extend(custom.into_iter().map(|mut m| {
            m.custom = true;
            m
        }));
        let catalog = Arc::new(ModelCatalog::new(config.models_dir(), models, events.clone()));
        let downloader = Downloader::new(catalog.clone(), fetcher);

        let params = persistence.load(PARAMS_KEY, InferenceParameters::default());
        let engine = Arc::new(EngineManager::new(catalog.clone(), registry, params));
        let completion = Arc::new(CompletionController::new(engine.clone()));

        let snapshot = persistence.load(CONVERSATIONS_KEY, ConversationSnapshot::default());
        let conversations = Arc::new(ConversationStore::from_snapshot(snapshot));

        let profile = ProfileService::load(persistence.clone());
        let chat = ChatOrchestrator::new(
            conversations.clone(),
            engine.clone(),
            completion.clone(),
            persistence.clone(),
            events.clone(),
        );

        Self {
            config,
            persistence,
            events,
            catalog,
            downloader,
            engine,
            completion,
            conversations,
            profile,
            chat,
        }
    }

    /// Add a model from a download link and remember it across restarts.
    pub fn add_custom_model(&self, url: &str) -> Result<ModelDescriptor, ServiceError> {
        let descriptor = self.catalog.add_custom_model(ModelDescriptor::from_url(url)?)?;
        self.persistence
            .save(CUSTOM_MODELS_KEY, &self.catalog.custom_models())?;
        Ok(descriptor)
    }

    /// Persist and apply new inference parameters.
    pub fn set_params(&self, params: InferenceParameters) -> Result<(), StorageError> {
        self.persistence.save(PARAMS_KEY, &params)?;
        self.engine.set_params(params);
        Ok(())
    }
}
