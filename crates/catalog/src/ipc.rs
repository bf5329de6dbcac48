//! Daemon IPC: named methods over a Unix-socket stream.
//!
//! Frames are a little-endian u32 length followed by a JSON envelope. Each
//! request names a method and carries its parameters; each reply carries the
//! boundary status code and an optional JSON payload. Methods not handled by
//! the catalog (pipeline hosting) fall through to the daemon's own handler.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use axon_core::{Result, ServiceError};

use crate::store::CatalogStore;
use crate::Catalog;

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Well-known system socket; clients fall back to the session socket.
pub fn system_socket_path() -> PathBuf {
    PathBuf::from("/run/axond/catalog.sock")
}

pub fn session_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("axond").join("catalog.sock"),
        None => PathBuf::from("/tmp/axond/catalog.sock"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    SetPipeline {
        name: String,
        description: String,
    },
    GetPipeline {
        name: String,
    },
    DeletePipeline {
        name: String,
    },
    RegisterModel {
        name: String,
        path: String,
        activate: bool,
        description: Option<String>,
        app_info: Option<String>,
    },
    UpdateModelDescription {
        name: String,
        version: u32,
        description: String,
    },
    ActivateModel {
        name: String,
        version: u32,
    },
    GetModel {
        name: String,
        version: u32,
    },
    GetModelActivated {
        name: String,
    },
    GetModelAll {
        name: String,
    },
    DeleteModel {
        name: String,
        version: u32,
    },
    AddResource {
        name: String,
        path: String,
        description: Option<String>,
        app_info: Option<String>,
    },
    GetResource {
        name: String,
    },
    DeleteResource {
        name: String,
    },

    // Pipeline hosting, answered by the daemon's host table.
    LaunchPipeline {
        name: String,
    },
    StartPipeline {
        id: i64,
    },
    StopPipeline {
        id: i64,
    },
    DestroyPipeline {
        id: i64,
    },
    GetPipelineState {
        id: i64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Reply {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Reply {
    pub fn ok(payload: Option<Value>) -> Reply {
        Reply { status: 0, payload }
    }

    pub fn error(err: &ServiceError) -> Reply {
        Reply {
            status: err.code(),
            payload: Some(serde_json::json!({ "message": err.to_string() })),
        }
    }

    /// Turn a reply back into a typed result on the client side.
    pub fn into_result(self) -> Result<Option<Value>> {
        if self.status == 0 {
            return Ok(self.payload);
        }
        let message = self
            .payload
            .as_ref()
            .and_then(|p| p.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("daemon call failed")
            .to_string();
        Err(ServiceError::from_code(self.status, &message))
    }
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ServiceError::invalid(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ServiceError::invalid(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Answer a catalog method against the store. Returns `None` for methods
/// that belong to the daemon (pipeline hosting).
pub async fn dispatch_store(store: &CatalogStore, request: &Request) -> Option<Reply> {
    let reply = match request {
        Request::SetPipeline { name, description } => {
            store.set_pipeline(name, description).await.map(|_| None)
        }
        Request::GetPipeline { name } => store
            .pipeline(name)
            .await
            .map(|desc| Some(Value::String(desc))),
        Request::DeletePipeline { name } => store.delete_pipeline(name).await.map(|_| None),
        Request::RegisterModel {
            name,
            path,
            activate,
            description,
            app_info,
        } => store
            .register_model(
                name,
                std::path::Path::new(path),
                *activate,
                description.as_deref(),
                app_info.as_deref(),
            )
            .await
            .map(|version| Some(serde_json::json!({ "version": version }))),
        Request::UpdateModelDescription {
            name,
            version,
            description,
        } => store
            .update_model_description(name, *version, description)
            .await
            .map(|_| None),
        Request::ActivateModel { name, version } => {
            store.activate_model(name, *version).await.map(|_| None)
        }
        Request::GetModel { name, version } => store
            .model(name, *version)
            .await
            .and_then(|row| to_payload(&row)),
        Request::GetModelActivated { name } => store
            .model_activated(name)
            .await
            .and_then(|row| to_payload(&row)),
        Request::GetModelAll { name } => store
            .model_all(name)
            .await
            .and_then(|rows| to_payload(&rows)),
        Request::DeleteModel { name, version } => {
            store.delete_model(name, *version).await.map(|_| None)
        }
        Request::AddResource {
            name,
            path,
            description,
            app_info,
        } => store
            .add_resource(name, path, description.as_deref(), app_info.as_deref())
            .await
            .map(|_| None),
        Request::GetResource { name } => store
            .resource(name)
            .await
            .and_then(|rows| to_payload(&rows)),
        Request::DeleteResource { name } => store.delete_resource(name).await.map(|_| None),

        Request::LaunchPipeline { .. }
        | Request::StartPipeline { .. }
        | Request::StopPipeline { .. }
        | Request::DestroyPipeline { .. }
        | Request::GetPipelineState { .. } => return None,
    };
    Some(match reply {
        Ok(payload) => Reply::ok(payload),
        Err(err) => Reply::error(&err),
    })
}

fn to_payload<T: Serialize>(value: &T) -> Result<Option<Value>> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| ServiceError::Io(e.to_string()))
}

/// Handler for methods the catalog does not answer itself.
pub type MethodHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Accept loop: one task per connection, frames answered in order.
pub async fn serve(
    listener: UnixListener,
    store: Arc<CatalogStore>,
    fallback: Option<MethodHandler>,
) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let store = store.clone();
        let fallback = fallback.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, store, fallback).await {
                warn!("catalog ipc connection failed: {err}");
            }
        });
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    store: Arc<CatalogStore>,
    fallback: Option<MethodHandler>,
) -> Result<()> {
    while let Some(body) = read_frame(&mut stream).await? {
        let reply = match serde_json::from_slice::<Request>(&body) {
            Ok(request) => {
                debug!("catalog ipc request: {request:?}");
                match dispatch_store(&store, &request).await {
                    Some(reply) => reply,
                    None => match &fallback {
                        Some(handler) => handler(request).await,
                        None => Reply::error(&ServiceError::NotSupported(
                            "pipeline hosting is not available on this daemon".into(),
                        )),
                    },
                }
            }
            Err(err) => Reply::error(&ServiceError::invalid(format!(
                "malformed request envelope: {err}"
            ))),
        };
        let body = serde_json::to_vec(&reply).map_err(|e| ServiceError::Io(e.to_string()))?;
        write_frame(&mut stream, &body).await?;
    }
    Ok(())
}
