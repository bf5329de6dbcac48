//! The seam to the edge transport.

use std::sync::Arc;

use async_trait::async_trait;

use axon_core::{Result, ServiceError};

use crate::data::EdgeData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRole {
    Sender,
    Receiver,
}

/// Transport flavor requested by the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectType {
    Tcp,
    Hybrid,
    Mqtt,
    Aitt,
}

impl ConnectType {
    pub fn parse(s: &str) -> Result<ConnectType> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(ConnectType::Tcp),
            "HYBRID" => Ok(ConnectType::Hybrid),
            "MQTT" => Ok(ConnectType::Mqtt),
            "AITT" => Ok(ConnectType::Aitt),
            other => Err(ServiceError::invalid(format!(
                "unknown connect type '{other}'"
            ))),
        }
    }
}

/// What a link reports to its owner. `Received` payloads have passed their
/// integrity checks.
#[derive(Debug)]
pub enum EdgeEvent {
    Connected { peer: u64 },
    Disconnected { peer: u64 },
    Received { peer: u64, data: EdgeData },
}

/// Runs on the transport's own task; handlers snapshot what they need and
/// hand heavy work off.
pub type EdgeCallback = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

#[async_trait]
pub trait EdgeLink: Send + Sync {
    fn set_event_callback(&self, callback: EdgeCallback);
    fn set_info(&self, key: &str, value: &str) -> Result<()>;
    fn info(&self, key: &str) -> Option<String>;

    /// Receivers bind and listen; senders treat this as a no-op.
    async fn start(&self) -> Result<()>;
    async fn connect(&self, host: &str, port: u16) -> Result<()>;

    /// Send to every connected peer.
    async fn send(&self, data: EdgeData) -> Result<()>;
    /// Send to one peer, addressed by the id events reported.
    async fn send_to(&self, peer: u64, data: EdgeData) -> Result<()>;

    /// Bound port after `start`, for receivers on ephemeral ports.
    fn local_port(&self) -> Option<u16>;

    async fn release(&self) -> Result<()>;
}

/// Creates links for offloading handles.
pub trait EdgeFactory: Send + Sync {
    fn create(&self, id: &str, connect_type: ConnectType, role: EdgeRole)
        -> Result<Arc<dyn EdgeLink>>;
}
