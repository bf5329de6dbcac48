//! Process-wide table of launched pipelines.
//!
//! Each launched pipeline gets a monotonic 64-bit id derived from the
//! high-resolution clock. Entries stay alive until explicitly destroyed;
//! they are never garbage-collected with the handle that launched them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use axon_core::{Result, ServiceError};

use crate::runtime::{PipelineControl, PipelineRuntime, PipelineState};

struct HostEntry {
    service_name: String,
    description: String,
    control: Arc<dyn PipelineControl>,
}

/// Keeps launched pipelines alive and addressable by id.
pub struct PipelineHost {
    runtime: Arc<dyn PipelineRuntime>,
    entries: RwLock<HashMap<i64, HostEntry>>,
    last_id: Mutex<i64>,
}

impl PipelineHost {
    pub fn new(runtime: Arc<dyn PipelineRuntime>) -> Self {
        Self {
            runtime,
            entries: RwLock::new(HashMap::new()),
            last_id: Mutex::new(0),
        }
    }

    /// Construct `description`, drive it to `Paused` and insert it into the
    /// table. A description the runtime cannot realize is destroyed
    /// immediately and surfaces as a streams-pipe error.
    pub async fn launch(&self, service_name: &str, description: &str) -> Result<i64> {
        if service_name.is_empty() || description.is_empty() {
            return Err(ServiceError::invalid(
                "pipeline name and description must not be empty",
            ));
        }
        let control = self.runtime.construct(description, None).await?;
        if control.state() != PipelineState::Paused {
            let _ = control.shutdown().await;
            return Err(ServiceError::StreamsPipe(format!(
                "pipeline '{service_name}' did not reach the paused state"
            )));
        }

        let id = self.next_id();
        self.entries.write().insert(
            id,
            HostEntry {
                service_name: service_name.to_string(),
                description: description.to_string(),
                control,
            },
        );
        info!("🚀 launched pipeline '{service_name}' as id {id}");
        Ok(id)
    }

    /// Issue the transition and return; confirmation comes through the
    /// pipeline's own state callback.
    pub async fn start(&self, id: i64) -> Result<()> {
        self.control(id)?.start().await
    }

    pub async fn stop(&self, id: i64) -> Result<()> {
        self.control(id)?.stop().await
    }

    pub fn state(&self, id: i64) -> Result<PipelineState> {
        Ok(self.control(id)?.state())
    }

    pub fn description(&self, id: i64) -> Result<String> {
        let entries = self.entries.read();
        entries
            .get(&id)
            .map(|e| e.description.clone())
            .ok_or_else(|| unknown_id(id))
    }

    /// Remove the entry and release the underlying pipeline.
    pub async fn destroy(&self, id: i64) -> Result<()> {
        let entry = self
            .entries
            .write()
            .remove(&id)
            .ok_or_else(|| unknown_id(id))?;
        debug!("destroying pipeline '{}' (id {id})", entry.service_name);
        entry.control.shutdown().await
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn control(&self, id: i64) -> Result<Arc<dyn PipelineControl>> {
        let entries = self.entries.read();
        entries
            .get(&id)
            .map(|e| e.control.clone())
            .ok_or_else(|| unknown_id(id))
    }

    /// Clock-derived id, forced strictly monotonic under the table clock
    /// mutex so two launches in the same microsecond stay distinct.
    fn next_id(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        let mut last = self.last_id.lock();
        let id = now.max(*last + 1);
        *last = id;
        id
    }
}

fn unknown_id(id: i64) -> ServiceError {
    ServiceError::invalid(format!("no launched pipeline with id {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackRuntime;

    fn host() -> PipelineHost {
        PipelineHost::new(Arc::new(LoopbackRuntime::new()))
    }

    #[tokio::test]
    async fn launch_start_stop_destroy() {
        let host = host();
        let id = host.launch("svc", "loop ! sink").await.unwrap();
        assert_eq!(host.state(id).unwrap(), PipelineState::Paused);

        host.start(id).await.unwrap();
        assert_eq!(host.state(id).unwrap(), PipelineState::Playing);

        host.stop(id).await.unwrap();
        assert_eq!(host.state(id).unwrap(), PipelineState::Paused);

        host.destroy(id).await.unwrap();
        assert!(host.state(id).is_err());
        assert!(host.is_empty());
    }

    #[tokio::test]
    async fn ids_are_strictly_monotonic() {
        let host = host();
        let a = host.launch("a", "loop").await.unwrap();
        let b = host.launch("b", "loop").await.unwrap();
        let c = host.launch("c", "loop").await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn entries_outlive_nothing_implicitly() {
        let host = host();
        let id = host.launch("svc", "loop").await.unwrap();
        // Still present until an explicit destroy.
        assert_eq!(host.len(), 1);
        host.destroy(id).await.unwrap();
        assert!(host.destroy(id).await.is_err());
    }

    #[tokio::test]
    async fn empty_description_is_rejected() {
        let host = host();
        assert!(host.launch("svc", "").await.is_err());
    }
}
