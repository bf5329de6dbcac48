//! Pipeline-hosting side of the daemon IPC.
//!
//! Catalog methods are answered by the store itself; the launch/start/stop/
//! destroy methods land here, against the daemon's pipeline host.

use std::sync::Arc;

use futures::FutureExt;
use tracing::info;

use axon_catalog::ipc::{MethodHandler, Reply, Request};
use axon_catalog::{Catalog, CatalogStore};
use axon_core::ServiceError;
use axon_pipeline::{PipelineHost, PipelineState};

fn state_name(state: PipelineState) -> &'static str {
    match state {
        PipelineState::Unknown => "unknown",
        PipelineState::Null => "null",
        PipelineState::Ready => "ready",
        PipelineState::Paused => "paused",
        PipelineState::Playing => "playing",
    }
}

pub fn pipeline_handler(store: Arc<CatalogStore>, host: Arc<PipelineHost>) -> MethodHandler {
    Arc::new(move |request: Request| {
        let store = store.clone();
        let host = host.clone();
        async move {
            let result = match request {
                Request::LaunchPipeline { name } => {
                    match store.pipeline(&name).await {
                        Ok(description) => host.launch(&name, &description).await.map(|id| {
                            info!("client launched pipeline '{name}' as id {id}");
                            Some(serde_json::json!({ "id": id }))
                        }),
                        Err(err) => Err(err),
                    }
                }
                Request::StartPipeline { id } => host.start(id).await.map(|_| None),
                Request::StopPipeline { id } => host.stop(id).await.map(|_| None),
                Request::DestroyPipeline { id } => host.destroy(id).await.map(|_| None),
                Request::GetPipelineState { id } => host
                    .state(id)
                    .map(|state| Some(serde_json::json!({ "state": state_name(state) }))),
                other => Err(ServiceError::invalid(format!(
                    "method {other:?} is not a pipeline method"
                ))),
            };
            match result {
                Ok(payload) => Reply::ok(payload),
                Err(err) => Reply::error(&err),
            }
        }
        .boxed()
    })
}
