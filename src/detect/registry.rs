use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::backend::DetectorBackend;
use super::backends::StubBackend;
use super::result::InferenceOutcome;
use crate::config::{BackendKind, BackendSettings};

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<Mutex<dyn DetectorBackend>>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Build the registry described by `settings`.
    ///
    /// A model that fails to load is logged and leaves the registry empty, so
    /// the service still starts and reports `model_loaded = false`.
    pub fn load(settings: &BackendSettings, confidence_floor: f32) -> Self {
        let mut registry = Self::new();
        match settings.kind {
            BackendKind::Stub => {
                log::warn!("stub backend selected; no model inference will run");
                registry.register(StubBackend::new());
            }
            BackendKind::Tract => registry.register_tract(settings, confidence_floor),
        }
        registry
    }

    #[cfg(feature = "backend-tract")]
    fn register_tract(&mut self, settings: &BackendSettings, confidence_floor: f32) {
        use super::backends::TractBackend;

        match TractBackend::new(&settings.model_path, settings.input_size) {
            Ok(backend) => {
                let mut backend = backend.with_threshold(confidence_floor);
                if let Err(err) = backend.warm_up() {
                    log::warn!("model warm-up failed: {:#}", err);
                }
                log::info!("model loaded from {}", settings.model_path.display());
                self.register(backend);
            }
            Err(err) => log::error!("error loading model: {:#}", err),
        }
    }

    #[cfg(not(feature = "backend-tract"))]
    fn register_tract(&mut self, _settings: &BackendSettings, _confidence_floor: f32) {
        log::error!("backend 'tract' requested but this build lacks the backend-tract feature");
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.default_name
            .as_ref()
            .and_then(|name| self.backends.get(name))
            .cloned()
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Run the default backend on a frame.
    ///
    /// Never returns an error: a missing backend, a poisoned lock or a failing
    /// `detect` call all come back as `InferenceOutcome::BackendFailed`.
    pub fn detect(&self, pixels: &[u8], width: u32, height: u32) -> InferenceOutcome {
        let Some(backend) = self.default_backend() else {
            return InferenceOutcome::BackendFailed("no detection backend loaded".to_string());
        };
        let mut guard = match backend.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return InferenceOutcome::BackendFailed("backend lock poisoned".to_string());
            }
        };
        match guard.detect(pixels, width, height) {
            Ok(detections) => InferenceOutcome::Detections(detections),
            Err(err) => InferenceOutcome::BackendFailed(format!("{}: {:#}", guard.name(), err)),
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectApiConfig;
    use crate::detect::RawDetection;
    use crate::geometry::BoundingBox;
    use anyhow::{anyhow, Result};

    struct BrokenBackend;

    impl DetectorBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<RawDetection>> {
            Err(anyhow!("inference exploded"))
        }
    }

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        assert!(registry.default_backend().is_none());
        registry.register(StubBackend::default());
        registry.register(BrokenBackend);
        let name = registry.default_backend().unwrap().lock().unwrap().name();
        assert_eq!(name, "stub");
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn failing_default_backend_reports_failure() {
        let mut registry = BackendRegistry::new();
        registry.register(BrokenBackend);
        registry.register(StubBackend::default());
        assert!(registry.detect(&[0; 3], 1, 1).is_failure());
    }

    #[test]
    fn empty_registry_reports_backend_failure() {
        let registry = BackendRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.detect(&[0; 3], 1, 1).is_failure());
    }

    #[test]
    fn detect_uses_default_backend() {
        let det = RawDetection::new(0, 0.9, BoundingBox::new(1.0, 1.0, 2.0, 2.0));
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::with_detections(vec![det]));
        assert_eq!(
            registry.detect(&[0; 3], 1, 1),
            InferenceOutcome::Detections(vec![det])
        );
    }

    #[test]
    fn default_settings_without_model_file_load_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = DetectApiConfig::default().backend;
        assert_eq!(settings.kind, BackendKind::Tract);
        settings.model_path = dir.path().join("yolov5m.onnx");

        let registry = BackendRegistry::load(&settings, 0.1);
        assert!(registry.is_empty());
        assert!(registry.default_backend().is_none());
    }

    #[test]
    fn stub_kind_registers_the_stub() {
        let mut settings = DetectApiConfig::default().backend;
        settings.kind = BackendKind::Stub;
        let registry = BackendRegistry::load(&settings, 0.1);
        assert_eq!(registry.list(), vec!["stub".to_string()]);
    }
}
