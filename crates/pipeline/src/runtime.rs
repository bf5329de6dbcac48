//! The seam to the streaming pipeline runtime.

use std::sync::Arc;

use async_trait::async_trait;

use axon_core::{Result, TensorsData};

/// Pipeline lifecycle states, mirroring the underlying runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unknown,
    Null,
    Ready,
    Paused,
    Playing,
}

/// Ownership policy for buffers pushed into a source node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPolicy {
    /// The pipeline takes the buffer and releases it after use.
    AutoFree,
    /// The caller keeps ownership and guarantees the buffer outlives all
    /// in-flight consumers.
    DoNotFree,
    /// Push an end-of-stream marker after the buffer.
    EosEvent,
}

pub type StateCallback = Arc<dyn Fn(PipelineState) + Send + Sync>;

/// Invoked on a runtime thread for every buffer a sink produces. Handlers
/// must be non-blocking; the payload is borrowed for the call.
pub type SinkCallback = Arc<dyn Fn(&TensorsData) + Send + Sync>;

/// A user-supplied tensor transform registered as a pipeline filter.
pub type CustomFilter = Arc<dyn Fn(&TensorsData) -> Result<TensorsData> + Send + Sync>;

/// Factory side of the runtime.
#[async_trait]
pub trait PipelineRuntime: Send + Sync {
    /// Parse and construct a pipeline and drive it to `Paused`, failing fast
    /// on descriptions the runtime cannot realize.
    async fn construct(
        &self,
        description: &str,
        state_cb: Option<StateCallback>,
    ) -> Result<Arc<dyn PipelineControl>>;

    /// Register a named custom filter usable from pipeline descriptions.
    async fn register_custom_filter(&self, name: &str, filter: CustomFilter) -> Result<()>;
}

/// Per-pipeline control surface.
#[async_trait]
pub trait PipelineControl: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn state(&self) -> PipelineState;

    async fn push_source(&self, node: &str, data: TensorsData, policy: PushPolicy) -> Result<()>;
    async fn register_sink(&self, node: &str, callback: SinkCallback) -> Result<()>;
    async fn unregister_sink(&self, node: &str) -> Result<()>;

    async fn set_property(&self, element: &str, name: &str, value: &str) -> Result<()>;
    async fn get_property(&self, element: &str, name: &str) -> Result<String>;
    async fn set_valve_open(&self, valve: &str, open: bool) -> Result<()>;
    async fn select_switch(&self, switch: &str, pad: &str) -> Result<()>;

    /// Release the underlying pipeline. Whether this walks the state machine
    /// down to `Null` is the runtime's own business.
    async fn shutdown(&self) -> Result<()>;
}
