use crate::EngineLoader;
use ndis_models::ModelDescriptor;
use std::sync::Arc;

/// Registry of engine loaders, searched in registration order.
#[derive(Default)]
pub struct EngineRegistry {
    loaders: Vec<Arc<dyn EngineLoader>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, loader: Arc<dyn EngineLoader>) {
        tracing::debug!("Registering engine loader: {}", loader.name());
        self.loaders.push(loader);
    }

    /// First loader that accepts the model.
    pub fn find_loader(&self, model: &ModelDescriptor) -> Option<Arc<dyn EngineLoader>> {
        self.loaders.iter().find(|l| l.can_load(model)).cloned()
    }

    /// True when no runtime has registered a loader.
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedLoader;
    use ndis_models::{ModelDescriptor, ModelSource};

    fn model(file: &str) -> ModelDescriptor {
        ModelDescriptor::new("m", "M", ModelSource::huggingface("org/repo", file), 1)
    }

    #[test]
    fn test_find_loader_in_order() {
        let mut registry = EngineRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.find_loader(&model("a.gguf")).is_none());

        registry.register(Arc::new(ScriptedLoader::chars("").named("first").accepting(".bin")));
        registry.register(Arc::new(ScriptedLoader::chars("").named("second")));

        assert_eq!(registry.find_loader(&model("a.bin")).unwrap().name(), "first");
        assert_eq!(registry.find_loader(&model("a.gguf")).unwrap().name(), "second");
        assert!(registry.find_loader(&model("a.onnx")).is_some());
    }
}
