//! Single-shot inference seam.
//!
//! Model execution is an external concern; the extension worker only sees
//! the `SingleShot` trait. Backends register themselves in a process-wide
//! registry and are picked by the `framework` hint from the configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use axon_core::{Result, ServiceError, TensorsData, TensorsInfo};

/// Default per-inference timeout at handle open; zero disables the limit.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Options handed to a backend when opening a model.
#[derive(Clone)]
pub struct SingleShotOptions {
    pub models: Vec<PathBuf>,
    pub framework: Option<String>,
    pub input_info: Option<TensorsInfo>,
    pub output_info: Option<TensorsInfo>,
    pub custom: Option<String>,
    pub timeout: Duration,
}

impl SingleShotOptions {
    pub fn new(models: Vec<PathBuf>) -> Self {
        Self {
            models,
            framework: None,
            input_info: None,
            output_info: None,
            custom: None,
            timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

/// An opened model.
#[async_trait]
pub trait SingleShot: Send + Sync {
    async fn invoke(&self, input: &TensorsData) -> Result<TensorsData>;
    fn input_info(&self) -> Result<TensorsInfo>;
    fn output_info(&self) -> Result<TensorsInfo>;
}

/// A model-execution engine that can open single-shot handles.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self, options: &SingleShotOptions) -> Result<Arc<dyn SingleShot>>;
}

/// Registered engines, looked up by the `framework` configuration hint.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<dyn InferenceBackend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backend: Arc<dyn InferenceBackend>) {
        self.backends.write().push(backend);
    }

    /// Open a model: by framework name when hinted, otherwise on the first
    /// registered backend.
    pub fn open(&self, options: &SingleShotOptions) -> Result<Arc<dyn SingleShot>> {
        let backends = self.backends.read();
        match &options.framework {
            Some(framework) => backends
                .iter()
                .find(|b| b.name().eq_ignore_ascii_case(framework))
                .ok_or_else(|| {
                    ServiceError::NotSupported(format!(
                        "no inference backend registered for framework '{framework}'"
                    ))
                })?
                .open(options),
            None => backends
                .first()
                .ok_or_else(|| {
                    ServiceError::NotSupported("no inference backend registered".into())
                })?
                .open(options),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedBackend(&'static str);

    struct Nop;

    #[async_trait]
    impl SingleShot for Nop {
        async fn invoke(&self, input: &TensorsData) -> Result<TensorsData> {
            Ok(input.clone())
        }
        fn input_info(&self) -> Result<TensorsInfo> {
            Err(ServiceError::NotSupported("no declared info".into()))
        }
        fn output_info(&self) -> Result<TensorsInfo> {
            Err(ServiceError::NotSupported("no declared info".into()))
        }
    }

    impl InferenceBackend for NamedBackend {
        fn name(&self) -> &str {
            self.0
        }
        fn open(&self, _options: &SingleShotOptions) -> Result<Arc<dyn SingleShot>> {
            Ok(Arc::new(Nop))
        }
    }

    #[test]
    fn framework_hint_selects_the_backend() {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(NamedBackend("tensorflow-lite")));
        registry.register(Arc::new(NamedBackend("onnxruntime")));

        let mut options = SingleShotOptions::new(vec![]);
        options.framework = Some("ONNXRuntime".into());
        assert!(registry.open(&options).is_ok());

        options.framework = Some("missing".into());
        assert!(matches!(
            registry.open(&options),
            Err(ServiceError::NotSupported(_))
        ));
    }

    #[test]
    fn empty_registry_is_not_supported() {
        let registry = BackendRegistry::new();
        let options = SingleShotOptions::new(vec![]);
        assert!(matches!(
            registry.open(&options),
            Err(ServiceError::NotSupported(_))
        ));
    }
}
