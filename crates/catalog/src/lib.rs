//! System-wide catalog of pipelines, model versions and resources.
//!
//! The store is a single SQLite file shared between the daemon and client
//! processes. All mutations run inside transactions through a single writer;
//! client libraries either open the store directly or go through the daemon
//! over the Unix-socket IPC in `ipc`/`client`.

pub mod client;
pub mod ipc;
pub mod store;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use axon_core::Result;

pub use client::CatalogClient;
pub use store::CatalogStore;

/// One version row of a registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRow {
    pub key: String,
    pub version: u32,
    pub active: bool,
    pub valid: bool,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque application payload, stored and returned verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_info: Option<String>,
}

/// One resource row; many rows may share a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRow {
    pub key: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_info: Option<String>,
}

/// Catalog operations as seen by service handles.
///
/// Implemented by `CatalogStore` (direct file access) and `CatalogClient`
/// (daemon pass-through); service code only holds the trait object.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn set_pipeline(&self, name: &str, description: &str) -> Result<()>;
    async fn pipeline(&self, name: &str) -> Result<String>;
    async fn delete_pipeline(&self, name: &str) -> Result<()>;

    async fn register_model(
        &self,
        name: &str,
        path: &Path,
        activate: bool,
        description: Option<&str>,
        app_info: Option<&str>,
    ) -> Result<u32>;
    async fn update_model_description(
        &self,
        name: &str,
        version: u32,
        description: &str,
    ) -> Result<()>;
    async fn activate_model(&self, name: &str, version: u32) -> Result<()>;
    async fn model(&self, name: &str, version: u32) -> Result<ModelRow>;
    async fn model_activated(&self, name: &str) -> Result<ModelRow>;
    async fn model_all(&self, name: &str) -> Result<Vec<ModelRow>>;
    /// `version == 0` deletes every version of the name.
    async fn delete_model(&self, name: &str, version: u32) -> Result<()>;

    async fn add_resource(
        &self,
        name: &str,
        path: &str,
        description: Option<&str>,
        app_info: Option<&str>,
    ) -> Result<()>;
    async fn resource(&self, name: &str) -> Result<Vec<ResourceRow>>;
    async fn delete_resource(&self, name: &str) -> Result<()>;
}
