//! The service handle: one front object dispatching to its active variant.

use std::path::Path;

use parking_lot::Mutex;
use tracing::debug;

use axon_catalog::Catalog;
use axon_core::{
    EventCallback, EventSink, InformationMap, Result, ServiceError, TensorsData, TensorsInfo,
};

use crate::config::{ServiceConfig, VariantConfig};
use crate::extension::ExtensionService;
use crate::offloading::OffloadingService;
use crate::ServiceContext;

/// Which variant a handle is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Extension,
    HostedPipeline,
    Offloading,
}

enum Variant {
    Extension(ExtensionService),
    Hosted { id: i64 },
    Offloading(OffloadingService),
}

/// A machine-learning service handle.
///
/// Built from a JSON configuration (`new`) or by launching a catalog
/// pipeline (`launch_pipeline`). All public operations validate their
/// arguments first and fail without side effects.
pub struct Service {
    ctx: ServiceContext,
    information: Mutex<InformationMap>,
    events: EventSink,
    variant: Variant,
}

impl Service {
    /// Open a handle from a configuration file.
    pub async fn new(config_path: impl AsRef<Path>, ctx: &ServiceContext) -> Result<Service> {
        let config = ServiceConfig::from_file(config_path)?;
        Self::from_config(config, ctx).await
    }

    /// Open a handle from configuration text.
    pub async fn from_config_str(text: &str, ctx: &ServiceContext) -> Result<Service> {
        Self::from_config(ServiceConfig::parse(text)?, ctx).await
    }

    async fn from_config(config: ServiceConfig, ctx: &ServiceContext) -> Result<Service> {
        let events = EventSink::new();
        let variant = match config.variant {
            VariantConfig::Single(single) => Variant::Extension(
                ExtensionService::open_single(single, ctx, events.clone()).await?,
            ),
            VariantConfig::Pipeline(pipeline) => Variant::Extension(
                ExtensionService::open_pipeline(pipeline, ctx, events.clone()).await?,
            ),
            VariantConfig::Offloading(offloading) => Variant::Offloading(
                OffloadingService::create(offloading, ctx, events.clone()).await?,
            ),
        };
        let service = Service {
            ctx: ctx.clone(),
            information: Mutex::new(InformationMap::information()),
            events,
            variant,
        };
        for (key, value) in &config.information {
            service.set_information(key, value)?;
        }
        Ok(service)
    }

    /// Launch a pipeline registered in the catalog and keep it on the host.
    pub async fn launch_pipeline(name: &str, ctx: &ServiceContext) -> Result<Service> {
        if name.is_empty() {
            return Err(ServiceError::invalid("pipeline name must not be empty"));
        }
        let description = ctx.catalog.pipeline(name).await?;
        let id = ctx.host.launch(name, &description).await?;
        Ok(Service {
            ctx: ctx.clone(),
            information: Mutex::new(InformationMap::information()),
            events: EventSink::new(),
            variant: Variant::Hosted { id },
        })
    }

    pub fn kind(&self) -> ServiceKind {
        match &self.variant {
            Variant::Extension(_) => ServiceKind::Extension,
            Variant::Hosted { .. } => ServiceKind::HostedPipeline,
            Variant::Offloading(_) => ServiceKind::Offloading,
        }
    }

    /// Host-table id of a hosted pipeline.
    pub fn pipeline_id(&self) -> Option<i64> {
        match &self.variant {
            Variant::Hosted { id } => Some(*id),
            _ => None,
        }
    }

    /// Bound port of an offloading receiver, once it is listening.
    pub fn local_port(&self) -> Option<u16> {
        match &self.variant {
            Variant::Offloading(off) => off.local_port(),
            _ => None,
        }
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        self.events.set(callback);
    }

    pub fn clear_event_callback(&self) {
        self.events.clear();
    }

    pub async fn start(&self) -> Result<()> {
        match &self.variant {
            Variant::Extension(ext) => ext.start().await,
            Variant::Hosted { id } => self.ctx.host.start(*id).await,
            Variant::Offloading(off) => off.start().await,
        }
    }

    pub async fn stop(&self) -> Result<()> {
        match &self.variant {
            Variant::Extension(ext) => ext.stop().await,
            Variant::Hosted { id } => self.ctx.host.stop(*id).await,
            Variant::Offloading(off) => off.stop().await,
        }
    }

    /// Feed data in: enqueue on an extension, send to the peer on an
    /// offloading handle. Meaningless for hosted pipelines.
    pub async fn request(&self, name: Option<&str>, data: &TensorsData) -> Result<()> {
        match &self.variant {
            Variant::Extension(ext) => ext.request(name, data),
            Variant::Hosted { .. } => Err(ServiceError::NotSupported(
                "hosted pipelines do not take requests".into(),
            )),
            Variant::Offloading(off) => {
                let key = name.ok_or_else(|| {
                    ServiceError::invalid("offloading requests need a service key")
                })?;
                off.request(key, data).await
            }
        }
    }

    pub fn get_input_information(&self, name: Option<&str>) -> Result<TensorsInfo> {
        match &self.variant {
            Variant::Extension(ext) => ext.input_information(name),
            _ => Err(ServiceError::NotSupported(
                "input introspection is only available on extension handles".into(),
            )),
        }
    }

    pub fn get_output_information(&self, name: Option<&str>) -> Result<TensorsInfo> {
        match &self.variant {
            Variant::Extension(ext) => ext.output_information(name),
            _ => Err(ServiceError::NotSupported(
                "output introspection is only available on extension handles".into(),
            )),
        }
    }

    /// Store a key/value on the handle. Recognized keys are consumed by the
    /// active variant as well; unknown keys are kept for the application.
    pub fn set_information(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ServiceError::invalid("information key must not be empty"));
        }
        let consumed = match &self.variant {
            Variant::Extension(ext) => ext.set_information(key, value)?,
            Variant::Hosted { .. } => false,
            Variant::Offloading(off) => off.set_information(key, value)?,
        };
        if consumed {
            debug!("information '{key}' consumed by the active variant");
        }
        self.information.lock().set(key, value)?;
        Ok(())
    }

    pub fn get_information(&self, key: &str) -> Result<String> {
        self.information
            .lock()
            .get_text(key)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::invalid(format!("no information stored under '{key}'")))
    }

    /// Number of queued extension requests; diagnostics only.
    pub fn pending_requests(&self) -> usize {
        match &self.variant {
            Variant::Extension(ext) => ext.pending(),
            _ => 0,
        }
    }

    /// Tear the handle down: the callback slot is cleared first so no event
    /// fires mid-teardown, then the variant is released.
    pub async fn destroy(&self) -> Result<()> {
        self.events.clear();
        match &self.variant {
            Variant::Extension(ext) => ext.shutdown().await,
            Variant::Hosted { id } => self.ctx.host.destroy(*id).await?,
            Variant::Offloading(off) => off.shutdown().await,
        }
        Ok(())
    }
}
