//! Interface to the streaming pipeline runtime, plus the process-wide host
//! table that keeps launched pipelines alive.
//!
//! The runtime itself is an external collaborator; everything here talks to
//! it through the `PipelineRuntime`/`PipelineControl` seam. The `loopback`
//! module provides an in-process runtime for tests and self-contained
//! deployments.

pub mod host;
pub mod loopback;
pub mod runtime;

pub use host::PipelineHost;
pub use loopback::LoopbackRuntime;
pub use runtime::{
    CustomFilter, PipelineControl, PipelineRuntime, PipelineState, PushPolicy, SinkCallback,
    StateCallback,
};
