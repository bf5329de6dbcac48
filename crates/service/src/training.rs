//! Training offloading.
//!
//! The sender stages every transfer-data file on the receiver and sends the
//! pipeline description last, as the all-files-sent marker. The receiver
//! stages files until the description arrives (bounded by a watchdog),
//! launches the training pipeline, and ships the trained model back as a
//! reply when it is torn down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use axon_core::{
    EventSink, InfoValue, InformationMap, Result, ServiceError, ServiceEvent, ServiceEventKind,
    TensorsData,
};
use axon_edge::EdgeRole;
use axon_pipeline::{PipelineControl, PipelineRuntime};

use crate::config::{OffloadServiceType, TrainingConfig};
use crate::offloading::OffloadingInner;

const APP_RW_PATH: &str = "@APP_RW_PATH@";
const REMOTE_APP_RW_PATH: &str = "@REMOTE_APP_RW_PATH@";
const TRAINED_MODEL_FILE: &str = "@TRAINED_MODEL_FILE@";

const TRAINED_MODEL_NAME: &str = "trained-model.bin";
const WATCHDOG_POLL: Duration = Duration::from_millis(100);
/// How long `stop` waits for the training element to flush its model file.
const COMPLETION_WAIT: Duration = Duration::from_secs(36);

pub(crate) struct TrainingState {
    role: EdgeRole,
    time_limit: Duration,
    sender_pipeline: Option<String>,
    transfer_data: Vec<(String, String)>,
    runtime: Arc<dyn PipelineRuntime>,
    events: EventSink,

    pipeline_json: Arc<RwLock<Option<String>>>,
    received_tx: watch::Sender<Option<bool>>,
    control: Mutex<Option<Arc<dyn PipelineControl>>>,
    trained_model_path: RwLock<Option<PathBuf>>,
    watchdog: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TrainingState {
    pub(crate) fn new(
        config: TrainingConfig,
        runtime: Arc<dyn PipelineRuntime>,
        events: EventSink,
    ) -> Arc<TrainingState> {
        let (received_tx, _) = watch::channel(None);
        let state = Arc::new(TrainingState {
            role: config.node_type,
            time_limit: Duration::from_secs(config.time_limit_s as u64),
            sender_pipeline: config.sender_pipeline,
            transfer_data: config.transfer_data,
            runtime,
            events,
            pipeline_json: Arc::new(RwLock::new(None)),
            received_tx,
            control: Mutex::new(None),
            trained_model_path: RwLock::new(None),
            watchdog: parking_lot::Mutex::new(None),
        });

        // The receiver's watchdog runs from construction: the sender may
        // start streaming files before our own start() is called.
        if state.role == EdgeRole::Receiver {
            let handle = tokio::spawn(watchdog_loop(
                state.pipeline_json.clone(),
                state.received_tx.clone(),
                state.time_limit,
            ));
            *state.watchdog.lock() = Some(handle);
        }
        state
    }

    /// First look at every incoming message while training mode is active.
    /// Returns true when the message was consumed here.
    pub(crate) async fn intercept(
        &self,
        inner: &OffloadingInner,
        service_type: OffloadServiceType,
        data: &axon_edge::EdgeData,
    ) -> bool {
        match self.role {
            EdgeRole::Receiver => {
                // The pipeline description is a JSON string; everything else
                // falls through to the normal staging dispatch.
                let Ok(blob) = data.blob(0) else {
                    return false;
                };
                let Ok(text) = std::str::from_utf8(&blob) else {
                    return false;
                };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
                    return false;
                };
                if value.get("pipeline").is_none() {
                    return false;
                }
                info!("🎓 training pipeline description arrived");
                *self.pipeline_json.write() = Some(text.to_string());
                true
            }
            EdgeRole::Sender => {
                if service_type != OffloadServiceType::Reply {
                    return false;
                }
                // The trained model comes back as a reply carrying its file
                // name.
                let Ok(blob) = data.blob(0) else {
                    return false;
                };
                let name = data.info("name").unwrap_or(TRAINED_MODEL_NAME);
                let path = inner.base_path().join(name);
                if let Err(err) = tokio::fs::write(&path, &blob).await {
                    error!("failed to save trained model to {}: {err}", path.display());
                    return true;
                }
                *self.trained_model_path.write() = Some(path);

                let mut info = InformationMap::information();
                let _ = info.set("data", InfoValue::Bytes(blob.to_vec()));
                self.events
                    .emit(&ServiceEvent::new(ServiceEventKind::Reply, info));
                true
            }
        }
    }

    pub(crate) async fn start(&self, inner: &OffloadingInner) -> Result<()> {
        match self.role {
            EdgeRole::Sender => self.start_sender(inner).await,
            EdgeRole::Receiver => self.start_receiver(inner).await,
        }
    }

    async fn start_sender(&self, inner: &OffloadingInner) -> Result<()> {
        let base = inner.base_path();
        let base_str = base.to_string_lossy();

        // Data files first, in table order; the entry holding the pipeline
        // JSON is the completion marker and must go out last.
        let mut pipeline_entry: Option<(&str, &str)> = None;
        for (name, value) in &self.transfer_data {
            if value.contains("pipeline") {
                pipeline_entry = Some((name.as_str(), value.as_str()));
                continue;
            }
            let path = value.replace(APP_RW_PATH, &base_str);
            let payload = Bytes::from(tokio::fs::read(&path).await.map_err(|e| {
                ServiceError::invalid(format!("cannot read transfer-data file '{path}': {e}"))
            })?);
            let file_name = PathBuf::from(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            debug!("training sender staging '{name}' from {path}");
            inner
                .request_bytes(name, payload, file_name.as_deref())
                .await?;
        }

        let (name, json) = pipeline_entry.ok_or_else(|| {
            ServiceError::invalid("transfer-data has no pipeline description entry")
        })?;
        inner
            .request_bytes(name, Bytes::from(json.to_string()), None)
            .await?;

        let description = self
            .sender_pipeline
            .as_ref()
            .expect("config validation guarantees a sender pipeline")
            .replace(APP_RW_PATH, &base_str);
        let control = self.runtime.construct(&description, None).await?;
        control.start().await?;
        *self.control.lock().await = Some(control);
        Ok(())
    }

    async fn start_receiver(&self, inner: &OffloadingInner) -> Result<()> {
        // Block until the watchdog resolves; it flips exactly once.
        let mut rx = self.received_tx.subscribe();
        let received = loop {
            if let Some(received) = *rx.borrow() {
                break received;
            }
            if rx.changed().await.is_err() {
                break false;
            }
        };
        if !received {
            return Err(ServiceError::invalid(
                "training pipeline description did not arrive within the time limit",
            ));
        }

        let json = self
            .pipeline_json
            .read()
            .clone()
            .expect("watchdog only resolves after the description arrived");
        let value: serde_json::Value = serde_json::from_str(&json)
            .map_err(|e| ServiceError::invalid(format!("training pipeline JSON is bad: {e}")))?;
        let pipeline = value
            .get("pipeline")
            .and_then(|p| p.as_object())
            .ok_or_else(|| ServiceError::invalid("training JSON has no 'pipeline' object"))?;
        let description = pipeline
            .get("description")
            .and_then(|d| d.as_str())
            .ok_or_else(|| ServiceError::invalid("training pipeline has no 'description'"))?;

        let base = inner.base_path();
        std::fs::create_dir_all(&base)?;
        let trained = base.join(TRAINED_MODEL_NAME);
        let description = description
            .replace(REMOTE_APP_RW_PATH, &base.to_string_lossy())
            .replace(TRAINED_MODEL_FILE, &trained.to_string_lossy());
        *self.trained_model_path.write() = Some(trained);

        let control = self.runtime.construct(&description, None).await?;
        if let Some(nodes) = pipeline.get("output_node").and_then(|n| n.as_array()) {
            for node in nodes {
                let Some(name) = node.get("name").and_then(|n| n.as_str()) else {
                    continue;
                };
                let sink_events = self.events.clone();
                let sink_name = name.to_string();
                control
                    .register_sink(
                        name,
                        Arc::new(move |data: &TensorsData| {
                            let mut info = InformationMap::information();
                            let _ = info.set("name", sink_name.as_str());
                            let _ = info.set("data", data.clone());
                            sink_events
                                .emit(&ServiceEvent::new(ServiceEventKind::NewData, info));
                        }),
                    )
                    .await?;
            }
        }
        control.start().await?;
        *self.control.lock().await = Some(control);
        info!("🎓 training pipeline is running");
        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        let control = self.control.lock().await.clone();
        let Some(control) = control else {
            return Ok(());
        };

        if self.role == EdgeRole::Receiver {
            let trained = self.trained_model_path.read().clone();
            if let Some(trained) = trained {
                if !trained.exists() {
                    // Ask the training element to wrap up, then wait for the
                    // model file to land.
                    control
                        .set_property("training", "ready-to-complete", "true")
                        .await?;
                    let deadline = tokio::time::Instant::now() + COMPLETION_WAIT;
                    while !trained.exists() {
                        if tokio::time::Instant::now() >= deadline {
                            return Err(ServiceError::TimedOut);
                        }
                        tokio::time::sleep(WATCHDOG_POLL).await;
                    }
                }
            }
        }
        control.stop().await
    }

    /// Teardown: the receiver ships the trained model to every transfer-data
    /// destination as a reply, then the pipeline is released.
    pub(crate) async fn finish(&self, inner: &OffloadingInner) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }

        if self.role == EdgeRole::Receiver {
            let trained = self.trained_model_path.read().clone();
            if let Some(trained) = trained {
                match tokio::fs::read(&trained).await {
                    Ok(bytes) => {
                        let payload = Bytes::from(bytes);
                        let file_name = trained
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned());
                        for (name, _) in &self.transfer_data {
                            if let Err(err) = inner
                                .request_bytes(name, payload.clone(), file_name.as_deref())
                                .await
                            {
                                warn!("failed to send trained model to '{name}': {err}");
                            }
                        }
                    }
                    Err(err) => {
                        debug!("no trained model to send back: {err}");
                    }
                }
            }
        }

        let control = self.control.lock().await.take();
        if let Some(control) = control {
            let _ = control.stop().await;
            let _ = control.shutdown().await;
        }
    }
}

async fn watchdog_loop(
    pipeline_json: Arc<RwLock<Option<String>>>,
    received_tx: watch::Sender<Option<bool>>,
    time_limit: Duration,
) {
    let deadline = tokio::time::Instant::now() + time_limit;
    loop {
        if pipeline_json.read().is_some() {
            let _ = received_tx.send(Some(true));
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("training watchdog expired after {time_limit:?} without a pipeline description");
            let _ = received_tx.send(Some(false));
            return;
        }
        tokio::time::sleep(WATCHDOG_POLL).await;
    }
}
