//! Offloading endpoint: typed messages over an edge link.
//!
//! Senders look a user key up in the services table and ship tensors as
//! blobs; receivers dispatch on the `service-type` info field, staging
//! files, registering catalog entries and surfacing replies as events.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use axon_catalog::Catalog;
use axon_core::{
    EventSink, InfoValue, InformationMap, Result, ServiceError, ServiceEvent, ServiceEventKind,
};
use axon_edge::{EdgeData, EdgeEvent, EdgeFactory, EdgeLink, EdgeRole};

use crate::config::{OffloadServiceType, OffloadingConfig, ServiceDescriptor};
use crate::training::TrainingState;
use crate::ServiceContext;

pub(crate) struct OffloadingInner {
    edge: Arc<dyn EdgeLink>,
    services: DashMap<String, ServiceDescriptor>,
    save_path: RwLock<Option<PathBuf>>,
    rw_path: PathBuf,
    catalog: Arc<dyn Catalog>,
    events: EventSink,
    training: Option<Arc<TrainingState>>,
}

pub(crate) struct OffloadingService {
    inner: Arc<OffloadingInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl OffloadingService {
    pub(crate) async fn create(
        config: OffloadingConfig,
        ctx: &ServiceContext,
        events: EventSink,
    ) -> Result<OffloadingService> {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("axon-{}", &uuid::Uuid::new_v4().to_string()[..8]));
        let edge = ctx.edges.create(&id, config.connect_type, config.node_type)?;

        if let Some(host) = &config.host {
            edge.set_info("HOST", host)?;
        }
        if let Some(port) = config.port {
            edge.set_info("PORT", &port.to_string())?;
        }
        if let Some(topic) = &config.topic {
            edge.set_info("TOPIC", topic)?;
        }

        let training = config
            .training
            .map(|t| TrainingState::new(t, ctx.runtime.clone(), events.clone()));

        let inner = Arc::new(OffloadingInner {
            edge: edge.clone(),
            services: config.services.into_iter().collect(),
            save_path: RwLock::new(config.path),
            rw_path: ctx.rw_path.clone(),
            catalog: ctx.catalog.clone(),
            events,
            training,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        edge.set_event_callback(Arc::new(move |event| {
            // Runs on the transport task: enqueue and return.
            let _ = tx.send(event);
        }));
        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), rx));

        edge.start().await?;
        if config.node_type == EdgeRole::Sender {
            let host = config
                .dest_host
                .as_deref()
                .expect("config validation guarantees a destination host");
            let port = config
                .dest_port
                .expect("config validation guarantees a destination port");
            edge.connect(host, port).await?;
        }

        Ok(OffloadingService {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub(crate) fn local_port(&self) -> Option<u16> {
        self.inner.edge.local_port()
    }

    /// Ship a tensors bundle under a configured service key.
    pub(crate) async fn request(
        &self,
        key: &str,
        data: &axon_core::TensorsData,
    ) -> Result<()> {
        let descriptor = self
            .inner
            .services
            .get(key)
            .map(|d| d.value().clone())
            .ok_or_else(|| {
                ServiceError::invalid(format!("no offloading service registered under '{key}'"))
            })?;
        let mut message = self.inner.message_for(&descriptor)?;
        for i in 0..data.count() {
            message.add_blob(data.tensor_bytes(i)?);
        }
        self.inner.edge.send(message).await
    }

    /// Consume a recognized information key (`path` sets the save dir).
    pub(crate) fn set_information(&self, key: &str, value: &str) -> Result<bool> {
        if key.eq_ignore_ascii_case("path") {
            if value.is_empty() {
                return Err(ServiceError::invalid("'path' must not be empty"));
            }
            *self.inner.save_path.write() = Some(PathBuf::from(value));
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) async fn start(&self) -> Result<()> {
        match &self.inner.training {
            Some(training) => training.start(&self.inner).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        match &self.inner.training {
            Some(training) => training.stop().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn shutdown(&self) {
        if let Some(training) = &self.inner.training {
            training.finish(&self.inner).await;
        }
        let _ = self.inner.edge.release().await;
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }
}

impl Drop for OffloadingService {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }
}

async fn dispatch_loop(
    inner: Arc<OffloadingInner>,
    mut rx: mpsc::UnboundedReceiver<EdgeEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            EdgeEvent::Connected { peer } => debug!("offloading peer {peer} connected"),
            EdgeEvent::Disconnected { peer } => debug!("offloading peer {peer} disconnected"),
            EdgeEvent::Received { peer, data } => inner.handle_message(peer, data).await,
        }
    }
}

impl OffloadingInner {
    /// Base directory for staged files and template substitution.
    pub(crate) fn base_path(&self) -> PathBuf {
        self.save_path
            .read()
            .clone()
            .unwrap_or_else(|| self.rw_path.clone())
    }

    fn message_for(&self, descriptor: &ServiceDescriptor) -> Result<EdgeData> {
        if descriptor.service_type == OffloadServiceType::Launch {
            return Err(ServiceError::NotSupported(
                "the 'launch' service type has no consumer yet".into(),
            ));
        }
        let mut message = EdgeData::new();
        message.set_info("service-type", descriptor.service_type.as_str());
        message.set_info("service-key", &descriptor.service_key);
        if let Some(description) = &descriptor.description {
            message.set_info("description", description);
        }
        if let Some(name) = &descriptor.name {
            message.set_info("name", name);
        }
        message.set_info("activate", if descriptor.activate { "true" } else { "false" });
        Ok(message)
    }

    /// Ship raw bytes under a configured service key (training staging).
    pub(crate) async fn request_bytes(
        &self,
        key: &str,
        payload: Bytes,
        name: Option<&str>,
    ) -> Result<()> {
        let descriptor = self.services.get(key).map(|d| d.value().clone()).ok_or_else(|| {
            ServiceError::invalid(format!("no offloading service registered under '{key}'"))
        })?;
        let mut message = self.message_for(&descriptor)?;
        if let Some(name) = name {
            message.set_info("name", name);
        }
        message.add_blob(payload);
        self.edge.send(message).await
    }

    async fn handle_message(&self, peer: u64, data: EdgeData) {
        let Some(service_type) = data.info("service-type") else {
            warn!("offloading message from peer {peer} has no service-type");
            return;
        };
        let service_type = match OffloadServiceType::parse(service_type) {
            Ok(t) => t,
            Err(err) => {
                warn!("offloading message from peer {peer}: {err}");
                return;
            }
        };
        let Some(service_key) = data.info("service-key").map(str::to_string) else {
            warn!("offloading message from peer {peer} has no service-key");
            return;
        };

        // Training mode sees every message first.
        if let Some(training) = &self.training {
            if training.intercept(self, service_type, &data).await {
                return;
            }
        }

        if let Err(err) = self.dispatch(service_type, &service_key, &data).await {
            error!("offloading dispatch failed for '{service_key}': {err}");
        }
    }

    async fn dispatch(
        &self,
        service_type: OffloadServiceType,
        service_key: &str,
        data: &EdgeData,
    ) -> Result<()> {
        match service_type {
            OffloadServiceType::ModelRaw => {
                self.register_model_bytes(service_key, data.blob(0)?, data)
                    .await
            }
            OffloadServiceType::ModelUri => {
                let uri = blob_utf8(data)?;
                let bytes = fetch_uri(&uri).await?;
                self.register_model_bytes(service_key, bytes, data).await
            }
            OffloadServiceType::PipelineRaw => {
                let description = blob_utf8(data)?;
                self.register_pipeline(service_key, &description).await
            }
            OffloadServiceType::PipelineUri => {
                let uri = blob_utf8(data)?;
                let bytes = fetch_uri(&uri).await?;
                let description = String::from_utf8(bytes.to_vec()).map_err(|_| {
                    ServiceError::invalid("fetched pipeline description is not UTF-8")
                })?;
                self.register_pipeline(service_key, &description).await
            }
            OffloadServiceType::Reply => {
                let mut info = InformationMap::information();
                info.set("data", InfoValue::Bytes(data.blob(0)?.to_vec()))?;
                self.events
                    .emit(&ServiceEvent::new(ServiceEventKind::Reply, info));
                Ok(())
            }
            OffloadServiceType::Launch => Err(ServiceError::NotSupported(
                "the 'launch' service type has no consumer yet".into(),
            )),
        }
    }

    /// Stage a model blob under the save directory and register it.
    async fn register_model_bytes(
        &self,
        service_key: &str,
        payload: Bytes,
        data: &EdgeData,
    ) -> Result<()> {
        let file_name = match data.info("name") {
            Some(name) => validated_file_name(name)?,
            None => format!("{service_key}.model"),
        };
        let dir = self.resolve_save_dir(service_key)?;
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &payload).await?;

        let activate = data
            .info("activate")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let description = data.info("description");
        let version = self
            .catalog
            .register_model(service_key, &path, activate, description, None)
            .await?;
        info!("📦 registered offloaded model '{service_key}' version {version}");

        let mut info = InformationMap::information();
        info.set("name", service_key)?;
        info.set("version", version.to_string())?;
        info.set("path", path.to_string_lossy().as_ref())?;
        self.events
            .emit(&ServiceEvent::new(ServiceEventKind::ModelRegistered, info));
        Ok(())
    }

    async fn register_pipeline(&self, service_key: &str, description: &str) -> Result<()> {
        self.catalog.set_pipeline(service_key, description).await?;
        let mut info = InformationMap::information();
        info.set("name", service_key)?;
        self.events.emit(&ServiceEvent::new(
            ServiceEventKind::PipelineRegistered,
            info,
        ));
        Ok(())
    }

    /// The handle's `path` information wins; otherwise a per-service-key
    /// directory under the working directory, created `0755`.
    fn resolve_save_dir(&self, service_key: &str) -> Result<PathBuf> {
        let dir = match self.save_path.read().clone() {
            Some(path) => path,
            None => std::env::current_dir()?.join(validated_file_name(service_key)?),
        };
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(dir)
    }
}

fn blob_utf8(data: &EdgeData) -> Result<String> {
    let blob = data.blob(0)?;
    String::from_utf8(blob.to_vec())
        .map_err(|_| ServiceError::invalid("blob payload is not UTF-8"))
}

/// Received names become file system entries; keep them to one component.
fn validated_file_name(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('/') || name.contains("..") {
        return Err(ServiceError::invalid(format!(
            "unsafe file name '{name}' in offloading message"
        )));
    }
    Ok(name.to_string())
}

/// Fetch a model or pipeline description by URI. `file://` reads locally,
/// anything else goes through HTTP(S) with redirects followed.
async fn fetch_uri(uri: &str) -> Result<Bytes> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Bytes::from(tokio::fs::read(path).await?));
    }
    let response = reqwest::get(uri)
        .await
        .map_err(|e| ServiceError::Io(format!("fetching '{uri}' failed: {e}")))?;
    if !response.status().is_success() {
        return Err(ServiceError::Io(format!(
            "fetching '{uri}' returned status {}",
            response.status()
        )));
    }
    response
        .bytes()
        .await
        .map_err(|e| ServiceError::Io(format!("reading '{uri}' body failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_stay_single_component() {
        assert!(validated_file_name("model.bin").is_ok());
        assert!(validated_file_name("../etc/passwd").is_err());
        assert!(validated_file_name("a/b").is_err());
        assert!(validated_file_name("").is_err());
    }

    #[tokio::test]
    async fn file_uri_fetch_reads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"content").unwrap();

        let uri = format!("file://{}", path.display());
        assert_eq!(fetch_uri(&uri).await.unwrap(), Bytes::from_static(b"content"));
        assert!(fetch_uri("file:///nope/missing").await.is_err());
    }
}
