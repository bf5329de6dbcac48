//! Pass-through catalog client talking to the daemon socket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

use axon_core::{Result, ServiceError};

use crate::ipc::{self, read_frame, write_frame, Reply, Request};
use crate::{Catalog, ModelRow, ResourceRow};

/// Client side of the catalog IPC. Calls are serialized over one stream;
/// the daemon answers frames in order.
pub struct CatalogClient {
    stream: Mutex<UnixStream>,
}

impl CatalogClient {
    /// Connect to the daemon: system socket first, session socket next.
    pub async fn connect() -> Result<CatalogClient> {
        let system = ipc::system_socket_path();
        match Self::connect_to(&system).await {
            Ok(client) => Ok(client),
            Err(_) => {
                let session = ipc::session_socket_path();
                debug!(
                    "system catalog socket {} unavailable, trying {}",
                    system.display(),
                    session.display()
                );
                Self::connect_to(&session).await
            }
        }
    }

    pub async fn connect_to(path: &PathBuf) -> Result<CatalogClient> {
        let stream = UnixStream::connect(path).await?;
        Ok(CatalogClient {
            stream: Mutex::new(stream),
        })
    }

    pub async fn call(&self, request: Request) -> Result<Option<Value>> {
        let body = serde_json::to_vec(&request).map_err(|e| ServiceError::Io(e.to_string()))?;
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &body).await?;
        let reply = read_frame(&mut *stream)
            .await?
            .ok_or_else(|| ServiceError::Io("daemon closed the connection".into()))?;
        let reply: Reply =
            serde_json::from_slice(&reply).map_err(|e| ServiceError::Io(e.to_string()))?;
        reply.into_result()
    }

    /// Launch a catalog pipeline on the daemon's host, returning its id.
    pub async fn launch_pipeline(&self, name: &str) -> Result<i64> {
        let payload = self
            .call(Request::LaunchPipeline {
                name: name.to_string(),
            })
            .await?;
        payload
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| ServiceError::Io("daemon reply is missing the pipeline id".into()))
    }

    pub async fn start_pipeline(&self, id: i64) -> Result<()> {
        self.call(Request::StartPipeline { id }).await.map(|_| ())
    }

    pub async fn stop_pipeline(&self, id: i64) -> Result<()> {
        self.call(Request::StopPipeline { id }).await.map(|_| ())
    }

    pub async fn destroy_pipeline(&self, id: i64) -> Result<()> {
        self.call(Request::DestroyPipeline { id }).await.map(|_| ())
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: Option<Value>, what: &str) -> Result<T> {
    let value =
        payload.ok_or_else(|| ServiceError::Io(format!("daemon reply is missing {what}")))?;
    serde_json::from_value(value).map_err(|e| ServiceError::Io(e.to_string()))
}

#[async_trait]
impl Catalog for CatalogClient {
    async fn set_pipeline(&self, name: &str, description: &str) -> Result<()> {
        self.call(Request::SetPipeline {
            name: name.to_string(),
            description: description.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn pipeline(&self, name: &str) -> Result<String> {
        let payload = self
            .call(Request::GetPipeline {
                name: name.to_string(),
            })
            .await?;
        match payload {
            Some(Value::String(desc)) => Ok(desc),
            _ => Err(ServiceError::Io(
                "daemon reply is missing the pipeline description".into(),
            )),
        }
    }

    async fn delete_pipeline(&self, name: &str) -> Result<()> {
        self.call(Request::DeletePipeline {
            name: name.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn register_model(
        &self,
        name: &str,
        path: &Path,
        activate: bool,
        description: Option<&str>,
        app_info: Option<&str>,
    ) -> Result<u32> {
        let payload = self
            .call(Request::RegisterModel {
                name: name.to_string(),
                path: path.to_string_lossy().into_owned(),
                activate,
                description: description.map(str::to_string),
                app_info: app_info.map(str::to_string),
            })
            .await?;
        payload
            .as_ref()
            .and_then(|p| p.get("version"))
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .ok_or_else(|| ServiceError::Io("daemon reply is missing the model version".into()))
    }

    async fn update_model_description(
        &self,
        name: &str,
        version: u32,
        description: &str,
    ) -> Result<()> {
        self.call(Request::UpdateModelDescription {
            name: name.to_string(),
            version,
            description: description.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn activate_model(&self, name: &str, version: u32) -> Result<()> {
        self.call(Request::ActivateModel {
            name: name.to_string(),
            version,
        })
        .await
        .map(|_| ())
    }

    async fn model(&self, name: &str, version: u32) -> Result<ModelRow> {
        let payload = self
            .call(Request::GetModel {
                name: name.to_string(),
                version,
            })
            .await?;
        decode(payload, "the model row")
    }

    async fn model_activated(&self, name: &str) -> Result<ModelRow> {
        let payload = self
            .call(Request::GetModelActivated {
                name: name.to_string(),
            })
            .await?;
        decode(payload, "the model row")
    }

    async fn model_all(&self, name: &str) -> Result<Vec<ModelRow>> {
        let payload = self
            .call(Request::GetModelAll {
                name: name.to_string(),
            })
            .await?;
        decode(payload, "the model rows")
    }

    async fn delete_model(&self, name: &str, version: u32) -> Result<()> {
        self.call(Request::DeleteModel {
            name: name.to_string(),
            version,
        })
        .await
        .map(|_| ())
    }

    async fn add_resource(
        &self,
        name: &str,
        path: &str,
        description: Option<&str>,
        app_info: Option<&str>,
    ) -> Result<()> {
        self.call(Request::AddResource {
            name: name.to_string(),
            path: path.to_string(),
            description: description.map(str::to_string),
            app_info: app_info.map(str::to_string),
        })
        .await
        .map(|_| ())
    }

    async fn resource(&self, name: &str) -> Result<Vec<ResourceRow>> {
        let payload = self
            .call(Request::GetResource {
                name: name.to_string(),
            })
            .await?;
        decode(payload, "the resource rows")
    }

    async fn delete_resource(&self, name: &str) -> Result<()> {
        self.call(Request::DeleteResource {
            name: name.to_string(),
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CatalogStore;
    use std::sync::Arc;
    use tokio::net::UnixListener;

    async fn spawn_daemon(dir: &tempfile::TempDir) -> PathBuf {
        let socket = dir.path().join("catalog.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let store = Arc::new(CatalogStore::open_in_memory().unwrap());
        tokio::spawn(async move {
            let _ = ipc::serve(listener, store, None).await;
        });
        socket
    }

    #[tokio::test]
    async fn pipeline_methods_over_ipc() {
        let dir = tempfile::tempdir().unwrap();
        let socket = spawn_daemon(&dir).await;
        let client = CatalogClient::connect_to(&socket).await.unwrap();

        client.set_pipeline("p1", "fakesrc ! fakesink").await.unwrap();
        assert_eq!(client.pipeline("p1").await.unwrap(), "fakesrc ! fakesink");

        client.delete_pipeline("p1").await.unwrap();
        let err = client.pipeline("p1").await.unwrap_err();
        assert_eq!(err.code(), -22);
    }

    #[tokio::test]
    async fn model_methods_over_ipc() {
        let dir = tempfile::tempdir().unwrap();
        let socket = spawn_daemon(&dir).await;
        let client = CatalogClient::connect_to(&socket).await.unwrap();

        let model = dir.path().join("m.bin");
        std::fs::write(&model, b"weights").unwrap();

        let v1 = client
            .register_model("m", &model, true, Some("first"), None)
            .await
            .unwrap();
        let v2 = client
            .register_model("m", &model, true, None, None)
            .await
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        let active = client.model_activated("m").await.unwrap();
        assert_eq!(active.version, 2);

        let all = client.model_all("m").await.unwrap();
        assert_eq!(all.len(), 2);

        client.delete_model("m", 0).await.unwrap();
        assert!(client.model_all("m").await.is_err());
    }

    #[tokio::test]
    async fn pipeline_hosting_without_a_host_is_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let socket = spawn_daemon(&dir).await;
        let client = CatalogClient::connect_to(&socket).await.unwrap();

        let err = client.launch_pipeline("p").await.unwrap_err();
        assert_eq!(err.code(), -95);
    }
}
