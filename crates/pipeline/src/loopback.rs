//! In-process pipeline runtime.
//!
//! Wires every source push straight to the registered sinks, optionally
//! through a node transform. Used by the test suites and by deployments
//! that run without an external streaming runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use axon_core::{Result, ServiceError, TensorsData};

use crate::runtime::{
    CustomFilter, PipelineControl, PipelineRuntime, PipelineState, PushPolicy, SinkCallback,
    StateCallback,
};

/// Maps a pushed buffer to the sink outputs it should produce.
pub type NodeTransform =
    Arc<dyn Fn(&str, &TensorsData) -> Vec<(String, TensorsData)> + Send + Sync>;

#[derive(Default)]
pub struct LoopbackRuntime {
    transform: RwLock<Option<NodeTransform>>,
    filters: RwLock<HashMap<String, CustomFilter>>,
}

impl LoopbackRuntime {
    /// Echo runtime: every push is delivered unchanged to every sink.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transform(transform: NodeTransform) -> Self {
        let rt = Self::default();
        *rt.transform.write() = Some(transform);
        rt
    }

    pub fn set_transform(&self, transform: NodeTransform) {
        *self.transform.write() = Some(transform);
    }
}

#[async_trait]
impl PipelineRuntime for LoopbackRuntime {
    async fn construct(
        &self,
        description: &str,
        state_cb: Option<StateCallback>,
    ) -> Result<Arc<dyn PipelineControl>> {
        if description.trim().is_empty() {
            return Err(ServiceError::StreamsPipe(
                "cannot construct a pipeline from an empty description".into(),
            ));
        }
        let control = Arc::new(LoopbackControl {
            state: RwLock::new(PipelineState::Paused),
            state_cb,
            sinks: RwLock::new(HashMap::new()),
            properties: RwLock::new(HashMap::new()),
            transform: self.transform.read().clone(),
            eos: AtomicBool::new(false),
        });
        control.notify_state(PipelineState::Paused);
        Ok(control)
    }

    async fn register_custom_filter(&self, name: &str, filter: CustomFilter) -> Result<()> {
        if name.is_empty() {
            return Err(ServiceError::invalid("filter name must not be empty"));
        }
        self.filters.write().insert(name.to_string(), filter);
        Ok(())
    }
}

struct LoopbackControl {
    state: RwLock<PipelineState>,
    state_cb: Option<StateCallback>,
    sinks: RwLock<HashMap<String, SinkCallback>>,
    properties: RwLock<HashMap<String, String>>,
    transform: Option<NodeTransform>,
    eos: AtomicBool,
}

impl LoopbackControl {
    fn set_state(&self, state: PipelineState) {
        *self.state.write() = state;
        self.notify_state(state);
    }

    fn notify_state(&self, state: PipelineState) {
        if let Some(cb) = &self.state_cb {
            cb(state);
        }
    }
}

#[async_trait]
impl PipelineControl for LoopbackControl {
    async fn start(&self) -> Result<()> {
        self.set_state(PipelineState::Playing);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.set_state(PipelineState::Paused);
        Ok(())
    }

    fn state(&self) -> PipelineState {
        *self.state.read()
    }

    async fn push_source(&self, node: &str, data: TensorsData, policy: PushPolicy) -> Result<()> {
        if *self.state.read() == PipelineState::Null {
            return Err(ServiceError::StreamsPipe(
                "pipeline has been shut down".into(),
            ));
        }
        if self.eos.load(Ordering::SeqCst) {
            return Err(ServiceError::StreamsPipe(
                "pipeline source is past end of stream".into(),
            ));
        }
        let sinks: Vec<(String, SinkCallback)> = self
            .sinks
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        match &self.transform {
            Some(transform) => {
                for (sink, out) in transform(node, &data) {
                    if let Some((_, cb)) = sinks.iter().find(|(name, _)| *name == sink) {
                        cb(&out);
                    }
                }
            }
            None => {
                for (_, cb) in &sinks {
                    cb(&data);
                }
            }
        }
        if policy == PushPolicy::EosEvent {
            self.eos.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn register_sink(&self, node: &str, callback: SinkCallback) -> Result<()> {
        let mut sinks = self.sinks.write();
        if sinks.contains_key(node) {
            return Err(ServiceError::invalid(format!(
                "sink '{node}' is already registered"
            )));
        }
        sinks.insert(node.to_string(), callback);
        Ok(())
    }

    async fn unregister_sink(&self, node: &str) -> Result<()> {
        self.sinks
            .write()
            .remove(node)
            .map(|_| ())
            .ok_or_else(|| ServiceError::invalid(format!("sink '{node}' is not registered")))
    }

    async fn set_property(&self, element: &str, name: &str, value: &str) -> Result<()> {
        self.properties
            .write()
            .insert(format!("{element}.{name}"), value.to_string());
        Ok(())
    }

    async fn get_property(&self, element: &str, name: &str) -> Result<String> {
        self.properties
            .read()
            .get(&format!("{element}.{name}"))
            .cloned()
            .ok_or_else(|| {
                ServiceError::invalid(format!("element '{element}' has no property '{name}'"))
            })
    }

    async fn set_valve_open(&self, valve: &str, open: bool) -> Result<()> {
        self.set_property(valve, "open", if open { "true" } else { "false" })
            .await
    }

    async fn select_switch(&self, switch: &str, pad: &str) -> Result<()> {
        self.set_property(switch, "active-pad", pad).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.sinks.write().clear();
        self.set_state(PipelineState::Null);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::{ElementType, TensorsInfo};
    use std::sync::Mutex;

    fn one_byte(value: u8) -> TensorsData {
        let mut info = TensorsInfo::with_count(1).unwrap();
        info.set_type(0, ElementType::UInt8).unwrap();
        info.set_dimension(0, &[1]).unwrap();
        let mut data = TensorsData::from_info(&info).unwrap();
        data.set_tensor(0, &[value]).unwrap();
        data
    }

    #[tokio::test]
    async fn echo_delivers_to_sinks() {
        let rt = LoopbackRuntime::new();
        let pipe = rt.construct("loop ! sink", None).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        pipe.register_sink(
            "out",
            Arc::new(move |data: &TensorsData| {
                sink_seen.lock().unwrap().push(data.tensor(0).unwrap()[0]);
            }),
        )
        .await
        .unwrap();

        pipe.start().await.unwrap();
        pipe.push_source("in", one_byte(7), PushPolicy::AutoFree)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), [7]);
    }

    #[tokio::test]
    async fn transform_routes_by_sink_name() {
        let rt = LoopbackRuntime::with_transform(Arc::new(|node: &str, data: &TensorsData| {
            assert_eq!(node, "in");
            let byte = data.tensor(0).unwrap()[0];
            let mut out = data.clone();
            out.set_tensor(0, &[byte + 1]).unwrap();
            vec![("out".to_string(), out)]
        }));
        let pipe = rt.construct("loop", None).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        pipe.register_sink(
            "out",
            Arc::new(move |data: &TensorsData| {
                sink_seen.lock().unwrap().push(data.tensor(0).unwrap()[0]);
            }),
        )
        .await
        .unwrap();

        pipe.start().await.unwrap();
        pipe.push_source("in", one_byte(1), PushPolicy::AutoFree)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), [2]);
    }

    #[tokio::test]
    async fn eos_stops_the_source() {
        let rt = LoopbackRuntime::new();
        let pipe = rt.construct("loop", None).await.unwrap();
        pipe.start().await.unwrap();
        pipe.push_source("in", one_byte(1), PushPolicy::EosEvent)
            .await
            .unwrap();
        assert!(pipe
            .push_source("in", one_byte(2), PushPolicy::AutoFree)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn properties_round_trip() {
        let rt = LoopbackRuntime::new();
        let pipe = rt.construct("loop", None).await.unwrap();
        pipe.set_property("trainer", "ready-to-complete", "true")
            .await
            .unwrap();
        assert_eq!(
            pipe.get_property("trainer", "ready-to-complete").await.unwrap(),
            "true"
        );
        assert!(pipe.get_property("trainer", "missing").await.is_err());
    }
}
