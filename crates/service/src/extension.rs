//! Extension worker: a single model or a described pipeline behind a
//! bounded request queue and one worker task.
//!
//! Requests are processed strictly in FIFO order; each produced result is
//! emitted as a `NewData` event. A full queue rejects the request instead
//! of blocking the caller.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use axon_catalog::Catalog;
use axon_core::{
    EventSink, InformationMap, Result, ServiceError, ServiceEvent, ServiceEventKind, TensorsData,
    TensorsInfo,
};
use axon_pipeline::{PipelineControl, PipelineRuntime, PushPolicy};

use crate::config::{PipelineExtConfig, SingleConfig};
use crate::single::{SingleShot, SingleShotOptions};
use crate::ServiceContext;

pub(crate) const DEFAULT_TIMEOUT_MS: u32 = 200;
pub(crate) const DEFAULT_MAX_INPUT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRole {
    Input,
    Output,
}

pub(crate) struct NodeInfo {
    pub role: NodeRole,
    pub info: TensorsInfo,
}

struct ExtensionMsg {
    node: Option<String>,
    data: TensorsData,
}

/// Bounded FIFO between `request` and the worker. The capacity is read per
/// push so it can be retuned through `set_information` at any time.
struct RequestQueue {
    items: Mutex<VecDeque<ExtensionMsg>>,
    notify: Notify,
}

impl RequestQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// `max == 0` means unbounded.
    fn push(&self, msg: ExtensionMsg, max: u32) -> Result<()> {
        {
            let mut items = self.items.lock();
            if max > 0 && items.len() >= max as usize {
                return Err(ServiceError::StreamsPipe(format!(
                    "request queue is full ({max} pending)"
                )));
            }
            items.push_back(msg);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<ExtensionMsg> {
        self.items.lock().pop_front()
    }

    /// Pop with a timeout; `None` lets the worker re-check its running flag.
    async fn pop(&self, timeout: Duration) -> Option<ExtensionMsg> {
        if let Some(msg) = self.try_pop() {
            return Some(msg);
        }
        tokio::select! {
            _ = self.notify.notified() => self.try_pop(),
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

#[derive(Clone)]
enum Invoker {
    Single {
        single: Arc<dyn SingleShot>,
        invoke_timeout: Duration,
    },
    Pipeline {
        control: Arc<dyn PipelineControl>,
    },
}

pub(crate) struct ExtensionService {
    invoker: Invoker,
    nodes: HashMap<String, NodeInfo>,
    running: Arc<AtomicBool>,
    queue: Arc<RequestQueue>,
    timeout_ms: Arc<AtomicU32>,
    max_input: Arc<AtomicU32>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: EventSink,
}

impl ExtensionService {
    pub(crate) async fn open_single(
        config: SingleConfig,
        ctx: &ServiceContext,
        events: EventSink,
    ) -> Result<ExtensionService> {
        let models = match &config.key {
            Some(key) => {
                let row = ctx.catalog.model_activated(key).await?;
                vec![std::path::PathBuf::from(row.path)]
            }
            None => config.models.clone(),
        };

        let mut options = SingleShotOptions::new(models);
        options.framework = config.framework.clone();
        options.input_info = config.input_info.clone();
        options.output_info = config.output_info.clone();
        options.custom = config.custom.clone();
        let invoke_timeout = options.timeout;

        let single = ctx.backends.open(&options)?;
        Ok(Self::spawn(
            Invoker::Single {
                single,
                invoke_timeout,
            },
            HashMap::new(),
            events,
        ))
    }

    pub(crate) async fn open_pipeline(
        config: PipelineExtConfig,
        ctx: &ServiceContext,
        events: EventSink,
    ) -> Result<ExtensionService> {
        let description = match &config.key {
            Some(key) => ctx.catalog.pipeline(key).await?,
            None => config
                .description
                .clone()
                .expect("config validation guarantees a description"),
        };

        let mut nodes = HashMap::new();
        for node in &config.input_nodes {
            if nodes
                .insert(
                    node.name.clone(),
                    NodeInfo {
                        role: NodeRole::Input,
                        info: node.info.clone(),
                    },
                )
                .is_some()
            {
                return Err(duplicate_node(&node.name));
            }
        }

        let control = ctx.runtime.construct(&description, None).await?;
        for node in &config.output_nodes {
            if nodes.contains_key(&node.name) {
                let _ = control.shutdown().await;
                return Err(duplicate_node(&node.name));
            }
            let sink_events = events.clone();
            let sink_name = node.name.clone();
            control
                .register_sink(
                    &node.name,
                    Arc::new(move |data: &TensorsData| {
                        let mut info = InformationMap::information();
                        let _ = info.set("name", sink_name.as_str());
                        let _ = info.set("data", data.clone());
                        sink_events.emit(&ServiceEvent::new(ServiceEventKind::NewData, info));
                    }),
                )
                .await?;
            nodes.insert(
                node.name.clone(),
                NodeInfo {
                    role: NodeRole::Output,
                    info: node.info.clone(),
                },
            );
        }

        // Start at creation so invalid descriptions fail here, not on the
        // first request.
        control.start().await?;

        Ok(Self::spawn(Invoker::Pipeline { control }, nodes, events))
    }

    fn spawn(invoker: Invoker, nodes: HashMap<String, NodeInfo>, events: EventSink) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(RequestQueue::new());
        let timeout_ms = Arc::new(AtomicU32::new(DEFAULT_TIMEOUT_MS));
        let max_input = Arc::new(AtomicU32::new(DEFAULT_MAX_INPUT));

        let worker = tokio::spawn(worker_loop(
            invoker.clone(),
            running.clone(),
            queue.clone(),
            timeout_ms.clone(),
            events.clone(),
        ));

        ExtensionService {
            invoker,
            nodes,
            running,
            queue,
            timeout_ms,
            max_input,
            worker: Mutex::new(Some(worker)),
            events,
        }
    }

    /// Clone the input and enqueue it; a full queue is back-pressure.
    pub(crate) fn request(&self, name: Option<&str>, data: &TensorsData) -> Result<()> {
        if !data.is_complete() {
            return Err(ServiceError::invalid(
                "request data has unattached or short buffers",
            ));
        }
        let node = match &self.invoker {
            Invoker::Single { .. } => None,
            Invoker::Pipeline { .. } => {
                let name = name.ok_or_else(|| {
                    ServiceError::invalid("pipeline requests need an input node name")
                })?;
                let node = self
                    .nodes
                    .get(name)
                    .ok_or_else(|| unknown_node(name))?;
                if node.role != NodeRole::Input {
                    return Err(ServiceError::invalid(format!(
                        "node '{name}' is not an input node"
                    )));
                }
                Some(name.to_string())
            }
        };
        self.queue.push(
            ExtensionMsg {
                node,
                data: data.clone(),
            },
            self.max_input.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn input_information(&self, name: Option<&str>) -> Result<TensorsInfo> {
        self.node_information(name, NodeRole::Input)
    }

    pub(crate) fn output_information(&self, name: Option<&str>) -> Result<TensorsInfo> {
        self.node_information(name, NodeRole::Output)
    }

    fn node_information(&self, name: Option<&str>, role: NodeRole) -> Result<TensorsInfo> {
        match &self.invoker {
            Invoker::Single { single, .. } => match role {
                NodeRole::Input => single.input_info(),
                NodeRole::Output => single.output_info(),
            },
            Invoker::Pipeline { .. } => {
                let name = name.ok_or_else(|| {
                    ServiceError::invalid("pipeline introspection needs a node name")
                })?;
                let node = self.nodes.get(name).ok_or_else(|| unknown_node(name))?;
                if node.role != role {
                    return Err(ServiceError::invalid(format!(
                        "node '{name}' has the wrong direction"
                    )));
                }
                node.info.try_clone()
            }
        }
    }

    /// Consume a recognized tuning key; unknown keys return `false` and are
    /// kept in the handle's information map only.
    pub(crate) fn set_information(&self, key: &str, value: &str) -> Result<bool> {
        if key.eq_ignore_ascii_case("input_queue_size") || key.eq_ignore_ascii_case("max_input") {
            self.max_input.store(parse_u32(key, value)?, Ordering::Relaxed);
            return Ok(true);
        }
        if key.eq_ignore_ascii_case("timeout") {
            self.timeout_ms
                .store(parse_u32(key, value)?, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) async fn start(&self) -> Result<()> {
        match &self.invoker {
            Invoker::Single { .. } => Ok(()),
            Invoker::Pipeline { control } => control.start().await,
        }
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        match &self.invoker {
            Invoker::Single { .. } => Ok(()),
            Invoker::Pipeline { control } => control.stop().await,
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stop the worker, then tear the underlying engine down. The worker is
    /// joined without holding any handle lock.
    pub(crate) async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.notify.notify_one();

        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            let grace =
                Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed) as u64 * 2 + 100);
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                worker.abort();
            }
        }

        if let Invoker::Pipeline { control } = &self.invoker {
            for (name, node) in &self.nodes {
                if node.role == NodeRole::Output {
                    let _ = control.unregister_sink(name).await;
                }
            }
            let _ = control.stop().await;
            let _ = control.shutdown().await;
        }
        self.events.clear();
    }
}

impl Drop for ExtensionService {
    fn drop(&mut self) {
        // destroy() is the documented teardown; this is the safety net for
        // handles dropped without it.
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

async fn worker_loop(
    invoker: Invoker,
    running: Arc<AtomicBool>,
    queue: Arc<RequestQueue>,
    timeout_ms: Arc<AtomicU32>,
    events: EventSink,
) {
    debug!("extension worker started");
    while running.load(Ordering::SeqCst) {
        let timeout = Duration::from_millis(timeout_ms.load(Ordering::Relaxed).max(1) as u64);
        let Some(msg) = queue.pop(timeout).await else {
            continue;
        };
        match &invoker {
            Invoker::Single {
                single,
                invoke_timeout,
            } => {
                let result = if invoke_timeout.is_zero() {
                    single.invoke(&msg.data).await
                } else {
                    match tokio::time::timeout(*invoke_timeout, single.invoke(&msg.data)).await {
                        Ok(result) => result,
                        Err(_) => Err(ServiceError::TimedOut),
                    }
                };
                match result {
                    Ok(output) => {
                        let mut info = InformationMap::information();
                        let _ = info.set("data", output);
                        events.emit(&ServiceEvent::new(ServiceEventKind::NewData, info));
                    }
                    // Worker faults do not kill the handle; the item simply
                    // produces no event.
                    Err(err) => error!("single-shot invoke failed: {err}"),
                }
            }
            Invoker::Pipeline { control } => {
                let node = msg.node.as_deref().unwrap_or_default();
                if let Err(err) = control
                    .push_source(node, msg.data, PushPolicy::AutoFree)
                    .await
                {
                    error!("push into source '{node}' failed: {err}");
                }
            }
        }
    }
    debug!("extension worker stopped");
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ServiceError::invalid(format!("'{key}' needs an unsigned integer, got '{value}'")))
}

fn duplicate_node(name: &str) -> ServiceError {
    ServiceError::invalid(format!("duplicate pipeline node '{name}'"))
}

fn unknown_node(name: &str) -> ServiceError {
    ServiceError::invalid(format!("no pipeline node named '{name}'"))
}
