//! Model catalog: descriptors plus the only functions allowed to move them
//! between lifecycle states.
//!
//! Every transition runs under one lock, so the catalog-wide rules (one
//! download slot, at most one LOADING or LOADED descriptor) are checked and
//! applied atomically. Events are emitted after the lock is released.

use crate::{ModelDescriptor, ModelError, ModelState, Result};
use ndis_events::{AssistantEvent, EventBusRef};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Result of feeding a progress value into the catalog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressUpdate {
    /// Percent advanced to the contained value.
    Progressed(f64),
    /// Value was not above the current percent and was dropped.
    Unchanged,
    /// Percent reached 1.0 and the descriptor is now READY.
    Completed,
}

struct CatalogState {
    models: Vec<ModelDescriptor>,
    active_download: Option<String>,
}

impl CatalogState {
    fn find_mut(&mut self, id: &str) -> Result<&mut ModelDescriptor> {
        self.models
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| ModelError::NotFound(id.to_string()))
    }

    fn find_in(&self, state: ModelState) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.state == state)
    }
}

pub struct ModelCatalog {
    models_dir: PathBuf,
    state: Mutex<CatalogState>,
    events: EventBusRef,
}

impl ModelCatalog {
    /// Build a catalog; descriptors whose artifact is already on disk start READY.
    pub fn new(models_dir: impl Into<PathBuf>, models: Vec<ModelDescriptor>, events: EventBusRef) -> Self {
        let models_dir = models_dir.into();
        let mut unique: Vec<ModelDescriptor> = Vec::with_capacity(models.len());
        for mut model in models {
            if let Err(e) = model.validate() {
                tracing::warn!("Skipping catalog entry: {}", e);
                continue;
            }
            if unique.iter().any(|m| m.id == model.id) {
                tracing::warn!(model_id = %model.id, "Skipping duplicate catalog entry");
                continue;
            }
            reset_from_disk(&models_dir, &mut model);
            unique.push(model);
        }

        Self {
            models_dir,
            state: Mutex::new(CatalogState {
                models: unique,
                active_download: None,
            }),
            events,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Snapshot of every descriptor, in catalog order.
    pub fn list_models(&self) -> Vec<ModelDescriptor> {
        self.lock().models.clone()
    }

    pub fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.lock().models.iter().find(|m| m.id == id).cloned()
    }

    pub fn loaded_model(&self) -> Option<ModelDescriptor> {
        self.lock().find_in(ModelState::Loaded).cloned()
    }

    pub fn active_download(&self) -> Option<String> {
        self.lock().active_download.clone()
    }

    /// User-added entries, for persistence.
    pub fn custom_models(&self) -> Vec<ModelDescriptor> {
        self.lock().models.iter().filter(|m| m.custom).cloned().collect()
    }

    /// Where the artifact for `id` lives once downloaded.
    pub fn local_path(&self, id: &str) -> Result<PathBuf> {
        let guard = self.lock();
        let model = guard
            .models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| ModelError::NotFound(id.to_string()))?;
        Ok(artifact_path(&self.models_dir, model))
    }

    /// Add a user-supplied descriptor. Its lifecycle follows the same rules
    /// as the built-in entries.
    pub fn add_custom_model(&self, mut model: ModelDescriptor) -> Result<ModelDescriptor> {
        model.validate()?;
        model.custom = true;
        reset_from_disk(&self.models_dir, &mut model);
        let event = state_event(&model);
        {
            let mut guard = self.lock();
            if guard.models.iter().any(|m| m.id == model.id) {
                return Err(ModelError::Duplicate(model.id));
            }
            guard.models.push(model.clone());
        }
        tracing::info!(model_id = %model.id, "Added custom model");
        self.events.emit(event);
        Ok(model)
    }

    /// NOT_DOWNLOADED -> DOWNLOADING, claiming the single download slot.
    pub fn begin_download(&self, id: &str) -> Result<()> {
        self.transition(|state, events| {
            if let Some(active) = &state.active_download {
                return Err(ModelError::Busy(active.clone()));
            }
            let model = state.find_mut(id)?;
            expect_state(model, ModelState::NotDownloaded, ModelState::Downloading)?;
            model.state = ModelState::Downloading;
            model.download_percent = 0.0;
            events.push(state_event(model));
            state.active_download = Some(id.to_string());
            Ok(())
        })
    }

    /// Apply a progress value to a downloading descriptor.
    ///
    /// Values are clamped to `[0, 1]`; anything not above the current percent
    /// is dropped so the observed sequence never decreases. Reaching 1.0 moves
    /// the descriptor to READY and frees the download slot.
    pub fn record_progress(&self, id: &str, percent: f64) -> Result<ProgressUpdate> {
        self.transition(|state, events| {
            let model = state.find_mut(id)?;
            if model.state != ModelState::Downloading {
                return Err(ModelError::InvalidTransition {
                    id: id.to_string(),
                    from: model.state,
                    to: ModelState::Downloading,
                });
            }
            if percent.is_nan() {
                return Ok(ProgressUpdate::Unchanged);
            }
            let percent = percent.clamp(0.0, 1.0);
            if percent <= model.download_percent {
                return Ok(ProgressUpdate::Unchanged);
            }

            model.download_percent = percent;
            events.push(AssistantEvent::DownloadProgress {
                model_id: id.to_string(),
                percent,
            });
            if percent < 1.0 {
                return Ok(ProgressUpdate::Progressed(percent));
            }

            model.state = ModelState::Ready;
            events.push(state_event(model));
            state.active_download = None;
            Ok(ProgressUpdate::Completed)
        })
    }

    /// DOWNLOADING -> NOT_DOWNLOADED after a failed or cancelled transfer.
    pub fn fail_download(&self, id: &str) -> Result<()> {
        self.transition(|state, events| {
            let model = state.find_mut(id)?;
            expect_state(model, ModelState::Downloading, ModelState::NotDownloaded)?;
            model.state = ModelState::NotDownloaded;
            model.download_percent = 0.0;
            events.push(state_event(model));
            if state.active_download.as_deref() == Some(id) {
                state.active_download = None;
            }
            Ok(())
        })
    }

    /// READY -> LOADING, provided nothing else in the catalog is loading or loaded.
    ///
    /// Rejections leave every descriptor untouched.
    pub fn begin_load(&self, id: &str) -> Result<()> {
        self.transition(|state, events| {
            if let Some(loading) = state.find_in(ModelState::Loading) {
                return Err(ModelError::AlreadyLoading(loading.id.clone()));
            }
            if let Some(loaded) = state.find_in(ModelState::Loaded) {
                return Err(ModelError::AlreadyLoaded(loaded.id.clone()));
            }
            let model = state.find_mut(id)?;
            expect_state(model, ModelState::Ready, ModelState::Loading)?;
            model.state = ModelState::Loading;
            events.push(state_event(model));
            Ok(())
        })
    }

    /// LOADING -> LOADED.
    pub fn finish_load(&self, id: &str) -> Result<()> {
        self.simple_transition(id, ModelState::Loading, ModelState::Loaded)
    }

    /// LOADING -> READY after the engine failed to come up.
    pub fn fail_load(&self, id: &str) -> Result<()> {
        self.simple_transition(id, ModelState::Loading, ModelState::Ready)
    }

    /// LOADED -> READY.
    pub fn finish_unload(&self, id: &str) -> Result<()> {
        self.simple_transition(id, ModelState::Loaded, ModelState::Ready)
    }

    /// Remove a READY artifact from disk (READY -> NOT_DOWNLOADED).
    pub fn delete_model(&self, id: &str) -> Result<()> {
        let models_dir = self.models_dir.clone();
        self.transition(|state, events| {
            let model = state.find_mut(id)?;
            expect_state(model, ModelState::Ready, ModelState::NotDownloaded)?;
            let path = artifact_path(&models_dir, model);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ModelError::Io(e)),
            }
            model.state = ModelState::NotDownloaded;
            model.download_percent = 0.0;
            events.push(state_event(model));
            tracing::info!(model_id = %id, path = ?path, "Deleted model artifact");
            Ok(())
        })
    }

    fn simple_transition(&self, id: &str, from: ModelState, to: ModelState) -> Result<()> {
        self.transition(|state, events| {
            let model = state.find_mut(id)?;
            expect_state(model, from, to)?;
            model.state = to;
            events.push(state_event(model));
            Ok(())
        })
    }

    fn transition<R>(
        &self,
        apply: impl FnOnce(&mut CatalogState, &mut Vec<AssistantEvent>) -> Result<R>,
    ) -> Result<R> {
        let mut events = Vec::new();
        let result = {
            let mut guard = self.lock();
            apply(&mut guard, &mut events)
        };
        if result.is_ok() {
            for event in events {
                self.events.emit(event);
            }
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CatalogState> {
        self.state.lock().expect("catalog mutex poisoned")
    }
}

fn artifact_path(models_dir: &Path, model: &ModelDescriptor) -> PathBuf {
    models_dir.join(&model.id).join(model.filename())
}

fn reset_from_disk(models_dir: &Path, model: &mut ModelDescriptor) {
    if artifact_path(models_dir, model).is_file() {
        model.state = ModelState::Ready;
        model.download_percent = 1.0;
    } else {
        model.state = ModelState::NotDownloaded;
        model.download_percent = 0.0;
    }
}

fn expect_state(model: &ModelDescriptor, from: ModelState, to: ModelState) -> Result<()> {
    if model.state == from {
        Ok(())
    } else {
        Err(ModelError::InvalidTransition {
            id: model.id.clone(),
            from: model.state,
            to,
        })
    }
}

fn state_event(model: &ModelDescriptor) -> AssistantEvent {
    AssistantEvent::ModelStateChanged {
        model_id: model.id.clone(),
        state: model.state.signal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelSource;
    use ndis_events::{event_names, InMemoryEventBus, ModelStateSignal};
    use std::sync::Arc;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor::new(id, id, ModelSource::huggingface("org/repo", format!("{id}.gguf")), 100)
    }

    fn catalog_with(ids: &[&str]) -> (ModelCatalog, Arc<InMemoryEventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(InMemoryEventBus::new());
        let catalog = ModelCatalog::new(
            dir.path(),
            ids.iter().map(|id| descriptor(id)).collect(),
            bus.clone(),
        );
        (catalog, bus, dir)
    }

    fn make_ready(catalog: &ModelCatalog, id: &str) {
        catalog.begin_download(id).unwrap();
        assert_eq!(catalog.record_progress(id, 1.0).unwrap(), ProgressUpdate::Completed);
    }

    fn assert_load_exclusive(catalog: &ModelCatalog) {
        let models = catalog.list_models();
        let loaded = models.iter().filter(|m| m.state() == ModelState::Loaded).count();
        let loading = models.iter().filter(|m| m.state() == ModelState::Loading).count();
        assert!(loaded + loading <= 1, "loaded={loaded} loading={loading}");
    }

    #[test]
    fn test_download_reaches_ready_at_full_percent() {
        let (catalog, bus, _dir) = catalog_with(&["a"]);
        catalog.begin_download("a").unwrap();

        for p in [0.1, 0.4, 0.4, 0.2, 0.9] {
            catalog.record_progress("a", p).unwrap();
            assert_eq!(catalog.get("a").unwrap().state(), ModelState::Downloading);
        }
        assert_eq!(catalog.get("a").unwrap().download_percent(), 0.9);

        assert_eq!(catalog.record_progress("a", 1.0).unwrap(), ProgressUpdate::Completed);
        let model = catalog.get("a").unwrap();
        assert_eq!(model.state(), ModelState::Ready);
        assert_eq!(model.download_percent(), 1.0);
        assert!(catalog.active_download().is_none());

        let percents: Vec<f64> = bus
            .events_for(event_names::DOWNLOAD_PROGRESS)
            .into_iter()
            .map(|e| match e {
                AssistantEvent::DownloadProgress { percent, .. } => percent,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(percents, vec![0.1, 0.4, 0.9, 1.0]);

        let readies = bus
            .events_for(event_names::MODEL_STATE_CHANGED)
            .into_iter()
            .filter(|e| matches!(e, AssistantEvent::ModelStateChanged { state: ModelStateSignal::Ready, .. }))
            .count();
        assert_eq!(readies, 1);
    }

    #[test]
    fn test_progress_is_clamped() {
        let (catalog, _bus, _dir) = catalog_with(&["a"]);
        catalog.begin_download("a").unwrap();

        assert_eq!(catalog.record_progress("a", -3.0).unwrap(), ProgressUpdate::Unchanged);
        assert_eq!(catalog.record_progress("a", f64::NAN).unwrap(), ProgressUpdate::Unchanged);
        assert_eq!(catalog.record_progress("a", 7.5).unwrap(), ProgressUpdate::Completed);
        assert_eq!(catalog.get("a").unwrap().download_percent(), 1.0);
    }

    #[test]
    fn test_progress_after_ready_is_rejected() {
        let (catalog, _bus, _dir) = catalog_with(&["a"]);
        make_ready(&catalog, "a");
        assert!(matches!(
            catalog.record_progress("a", 1.0),
            Err(ModelError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_single_download_slot() {
        let (catalog, _bus, _dir) = catalog_with(&["a", "b"]);
        catalog.begin_download("a").unwrap();

        let err = catalog.begin_download("b").unwrap_err();
        assert!(matches!(err, ModelError::Busy(ref id) if id == "a"));
        assert_eq!(catalog.get("b").unwrap().state(), ModelState::NotDownloaded);

        catalog.fail_download("a").unwrap();
        catalog.begin_download("b").unwrap();
    }

    #[test]
    fn test_download_requires_not_downloaded() {
        let (catalog, _bus, _dir) = catalog_with(&["a"]);
        make_ready(&catalog, "a");
        assert!(matches!(
            catalog.begin_download("a"),
            Err(ModelError::InvalidTransition { from: ModelState::Ready, .. })
        ));
        assert!(matches!(catalog.begin_download("zzz"), Err(ModelError::NotFound(_))));
    }

    #[test]
    fn test_failed_download_rolls_back() {
        let (catalog, _bus, _dir) = catalog_with(&["a"]);
        catalog.begin_download("a").unwrap();
        catalog.record_progress("a", 0.6).unwrap();

        catalog.fail_download("a").unwrap();
        let model = catalog.get("a").unwrap();
        assert_eq!(model.state(), ModelState::NotDownloaded);
        assert_eq!(model.download_percent(), 0.0);
        assert!(catalog.active_download().is_none());
    }

    #[test]
    fn test_load_is_exclusive_across_catalog() {
        let (catalog, _bus, _dir) = catalog_with(&["x", "y"]);
        make_ready(&catalog, "x");
        make_ready(&catalog, "y");

        catalog.begin_load("x").unwrap();
        assert_load_exclusive(&catalog);
        assert!(matches!(catalog.begin_load("y"), Err(ModelError::AlreadyLoading(ref id)) if id == "x"));

        catalog.finish_load("x").unwrap();
        assert_load_exclusive(&catalog);
        assert!(matches!(catalog.begin_load("y"), Err(ModelError::AlreadyLoaded(ref id)) if id == "x"));
        assert_eq!(catalog.get("y").unwrap().state(), ModelState::Ready);
        assert_eq!(catalog.loaded_model().unwrap().id, "x");

        catalog.finish_unload("x").unwrap();
        catalog.begin_load("y").unwrap();
        assert_load_exclusive(&catalog);
    }

    #[test]
    fn test_load_requires_ready() {
        let (catalog, bus, _dir) = catalog_with(&["a"]);
        bus.clear();
        assert!(matches!(
            catalog.begin_load("a"),
            Err(ModelError::InvalidTransition { from: ModelState::NotDownloaded, .. })
        ));
        assert!(bus.is_empty());
    }

    #[test]
    fn test_failed_load_returns_to_ready() {
        let (catalog, _bus, _dir) = catalog_with(&["a"]);
        make_ready(&catalog, "a");
        catalog.begin_load("a").unwrap();
        catalog.fail_load("a").unwrap();
        assert_eq!(catalog.get("a").unwrap().state(), ModelState::Ready);
        assert!(catalog.loaded_model().is_none());
    }

    #[test]
    fn test_artifact_on_disk_starts_ready() {
        let dir = tempfile::tempdir().unwrap();
        let model = descriptor("a");
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a").join("a.gguf"), b"weights").unwrap();

        let catalog = ModelCatalog::new(dir.path(), vec![model, descriptor("b")], Arc::new(InMemoryEventBus::new()));
        let a = catalog.get("a").unwrap();
        assert_eq!(a.state(), ModelState::Ready);
        assert_eq!(a.download_percent(), 1.0);
        assert_eq!(catalog.get("b").unwrap().state(), ModelState::NotDownloaded);
    }

    #[test]
    fn test_custom_models_follow_same_rules() {
        let (catalog, _bus, _dir) = catalog_with(&["a"]);
        let custom = ModelDescriptor::from_url("https://example.com/custom.gguf").unwrap();
        catalog.add_custom_model(custom.clone()).unwrap();
        assert!(matches!(catalog.add_custom_model(custom), Err(ModelError::Duplicate(_))));

        make_ready(&catalog, "a");
        make_ready(&catalog, "custom");
        catalog.begin_load("custom").unwrap();
        catalog.finish_load("custom").unwrap();
        assert!(matches!(catalog.begin_load("a"), Err(ModelError::AlreadyLoaded(_))));
        assert_eq!(catalog.custom_models().len(), 1);
    }

    #[test]
    fn test_unsafe_entries_never_reach_the_catalog() {
        let (catalog, bus, dir) = catalog_with(&["a"]);
        let mut escaping = descriptor("..");
        escaping.custom = true;
        assert!(matches!(
            catalog.add_custom_model(escaping.clone()),
            Err(ModelError::InvalidDescriptor(_))
        ));
        assert!(catalog.get("..").is_none());
        assert!(bus.is_empty());

        // Entries restored from storage go through the same check.
        let restored = ModelCatalog::new(dir.path(), vec![descriptor("a"), escaping], bus.clone());
        assert_eq!(restored.list_models().len(), 1);
        assert!(matches!(restored.local_path(".."), Err(ModelError::NotFound(_))));
    }

    #[test]
    fn test_local_path_stays_inside_models_dir() {
        let (catalog, _bus, dir) = catalog_with(&["a"]);
        let custom = ModelDescriptor::from_url("https://example.com/files/tiny.gguf?dl=1").unwrap();
        catalog.add_custom_model(custom).unwrap();
        for model in catalog.list_models() {
            let path = catalog.local_path(&model.id).unwrap();
            assert_eq!(path.parent().unwrap().parent().unwrap(), dir.path());
        }
    }

    #[test]
    fn test_delete_model_removes_artifact() {
        let (catalog, _bus, _dir) = catalog_with(&["a"]);
        make_ready(&catalog, "a");
        let path = catalog.local_path("a").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"weights").unwrap();

        catalog.delete_model("a").unwrap();
        assert!(!path.exists());
        assert_eq!(catalog.get("a").unwrap().state(), ModelState::NotDownloaded);
    }

    #[test]
    fn test_delete_loaded_model_is_rejected() {
        let (catalog, _bus, _dir) = catalog_with(&["a"]);
        make_ready(&catalog, "a");
        catalog.begin_load("a").unwrap();
        catalog.finish_load("a").unwrap();
        assert!(catalog.delete_model("a").is_err());
        assert_eq!(catalog.get("a").unwrap().state(), ModelState::Loaded);
    }
}
