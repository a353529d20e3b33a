//! Owner of the single active inference engine.
//!
//! Lock order is session, then catalog. Neither lock is held across an await.

use crate::{EngineError, EngineRegistry, InferenceEngine, InferenceParameters, Result};
use ndis_models::{ModelCatalog, ModelError};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct EngineSession {
    model_id: Option<String>,
    instance: Option<Arc<dyn InferenceEngine>>,
    generating: bool,
    cancel: Option<CancellationToken>,
}

pub struct EngineManager {
    catalog: Arc<ModelCatalog>,
    registry: EngineRegistry,
    params: Mutex<InferenceParameters>,
    session: Mutex<EngineSession>,
    idle: Notify,
}

impl EngineManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        registry: EngineRegistry,
        params: InferenceParameters,
    ) -> Self {
        Self {
            catalog,
            registry,
            params: Mutex::new(params),
            session: Mutex::new(EngineSession::default()),
            idle: Notify::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn params(&self) -> InferenceParameters {
        self.params.lock().expect("params mutex poisoned").clone()
    }

    /// Replace the parameters used by the next load and the next generation.
    pub fn set_params(&self, params: InferenceParameters) {
        *self.params.lock().expect("params mutex poisoned") = params;
    }

    /// Load a READY model.
    ///
    /// Fails without touching any state if another model is loading or
    /// loaded. If construction fails the model goes back to READY.
    pub async fn load_model(&self, model_id: &str) -> Result<()> {
        let descriptor = self
            .catalog
            .get(model_id)
            .ok_or_else(|| EngineError::Catalog(ModelError::NotFound(model_id.to_string())))?;
        let path = self.catalog.local_path(model_id)?;

        self.catalog.begin_load(model_id)?;
        let guard = LoadingGuard::new(&self.catalog, model_id);

        let loader = self
            .registry
            .find_loader(&descriptor)
            .ok_or_else(|| EngineError::NoLoaderFound(model_id.to_string()))?;
        let params = self.params();

        tracing::info!(model_id, loader = loader.name(), path = ?path, "Loading model");

        let loaded = tokio::task::spawn_blocking(move || loader.load(&descriptor, &path, &params))
            .await
            .map_err(|e| EngineError::LoadFailed(format!("loader task failed: {e}")))
            .and_then(|result| result);

        let instance: Arc<dyn InferenceEngine> = match loaded {
            Ok(engine) => Arc::from(engine),
            Err(e) => {
                tracing::error!(model_id, "Model load failed: {}", e);
                return Err(e);
            }
        };

        {
            let mut session = self.lock_session();
            self.catalog.finish_load(model_id)?;
            session.model_id = Some(model_id.to_string());
            session.instance = Some(instance);
        }
        guard.disarm();

        tracing::info!(model_id, "Model loaded");
        Ok(())
    }

    /// Unload the active model. A no-op when nothing is loaded.
    ///
    /// An in-flight generation is cancelled first and the unload waits for it
    /// to settle. A failing engine release is logged and the session is
    /// cleared regardless.
    pub async fn unload_model(&self) -> Result<()> {
        let (model_id, instance) = loop {
            let settled = self.idle.notified();
            {
                let mut session = self.lock_session();
                let Some(instance) = session.instance.clone() else {
                    return Ok(());
                };
                if !session.generating {
                    session.instance = None;
                    let model_id = session.model_id.take().unwrap_or_default();
                    break (model_id, instance);
                }
                if let Some(token) = &session.cancel {
                    tracing::info!("Cancelling generation before unload");
                    token.cancel();
                }
            }
            settled.await;
        };

        if let Err(e) = instance.release() {
            tracing::warn!(model_id = %model_id, "Engine release failed: {}", e);
        }
        drop(instance);

        self.catalog.finish_unload(&model_id)?;
        tracing::info!(model_id = %model_id, "Model unloaded");
        Ok(())
    }

    /// Shared handle to the loaded engine.
    pub fn get_instance(&self) -> Result<Arc<dyn InferenceEngine>> {
        self.lock_session()
            .instance
            .clone()
            .ok_or(EngineError::NoModelLoaded)
    }

    pub fn loaded_model(&self) -> Option<String> {
        self.lock_session().model_id.clone()
    }

    pub fn is_generating(&self) -> bool {
        self.lock_session().generating
    }

    /// Claim the engine for one generation.
    ///
    /// `cancel` is kept so that `request_stop` and `unload_model` can reach
    /// the running generation. The claim ends when the guard is dropped.
    pub fn begin_generation(&self, cancel: CancellationToken) -> Result<GenerationGuard<'_>> {
        let mut session = self.lock_session();
        let instance = session.instance.clone().ok_or(EngineError::NoModelLoaded)?;
        if session.generating {
            return Err(EngineError::Generating);
        }
        session.generating = true;
        session.cancel = Some(cancel.clone());
        drop(session);

        Ok(GenerationGuard {
            manager: self,
            instance,
            cancel,
            params: self.params(),
        })
    }

    /// Cancel the running generation. Returns false if none was running.
    pub fn request_stop(&self) -> bool {
        let session = self.lock_session();
        match (&session.cancel, session.generating) {
            (Some(token), true) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    fn end_generation(&self) {
        {
            let mut session = self.lock_session();
            session.generating = false;
            session.cancel = None;
        }
        self.idle.notify_waiters();
    }

    fn lock_session(&self) -> MutexGuard<'_, EngineSession> {
        self.session.lock().expect("engine session mutex poisoned")
    }
}

/// Exclusive claim on the engine for one generation.
pub struct GenerationGuard<'a> {
    manager: &'a EngineManager,
    instance: Arc<dyn InferenceEngine>,
    cancel: CancellationToken,
    params: InferenceParameters,
}

impl GenerationGuard<'_> {
    pub fn instance(&self) -> &Arc<dyn InferenceEngine> {
        &self.instance
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn params(&self) -> &InferenceParameters {
        &self.params
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.manager.end_generation();
    }
}

/// Rolls a LOADING model back to READY unless disarmed.
struct LoadingGuard<'a> {
    catalog: &'a ModelCatalog,
    model_id: &'a str,
    armed: bool,
}

impl<'a> LoadingGuard<'a> {
    fn new(catalog: &'a ModelCatalog, model_id: &'a str) -> Self {
        Self {
            catalog,
            model_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.catalog.fail_load(self.model_id) {
            tracing::error!(model_id = self.model_id, "Failed to roll back load: {}", e);
        }
    }
}
