//! Service handles over the Axon ML runtime.
//!
//! A handle is opened from a JSON configuration and backs one of three
//! variants: an extension (single model or pipeline behind a worker queue),
//! a catalog-hosted pipeline, or an offloading endpoint talking to a peer
//! over an edge link. External collaborators (catalog, pipeline runtime,
//! edge transport, inference backends) are injected through a
//! `ServiceContext`.

use std::path::PathBuf;
use std::sync::Arc;

use axon_catalog::Catalog;
use axon_edge::EdgeFactory;
use axon_pipeline::{PipelineHost, PipelineRuntime};

pub mod config;
mod extension;
pub mod handle;
mod offloading;
pub mod single;
mod training;

pub use config::{OffloadServiceType, ServiceConfig, ServiceDescriptor, VariantConfig};
pub use handle::{Service, ServiceKind};
pub use single::{BackendRegistry, InferenceBackend, SingleShot, SingleShotOptions};

/// External collaborators shared by every handle a process opens.
#[derive(Clone)]
pub struct ServiceContext {
    pub catalog: Arc<dyn Catalog>,
    pub runtime: Arc<dyn PipelineRuntime>,
    pub edges: Arc<dyn EdgeFactory>,
    pub backends: Arc<BackendRegistry>,
    /// Process-wide table of hosted pipelines.
    pub host: Arc<PipelineHost>,
    /// Application-writable directory; replaces `@APP_RW_PATH@` templates
    /// and backs default save locations.
    pub rw_path: PathBuf,
}

impl ServiceContext {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        runtime: Arc<dyn PipelineRuntime>,
        edges: Arc<dyn EdgeFactory>,
        backends: Arc<BackendRegistry>,
        rw_path: impl Into<PathBuf>,
    ) -> Self {
        let host = Arc::new(PipelineHost::new(runtime.clone()));
        Self {
            catalog,
            runtime,
            edges,
            backends,
            host,
            rw_path: rw_path.into(),
        }
    }
}
