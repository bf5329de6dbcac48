//! TCP edge link: length-prefixed bincode frames over tokio streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use axon_core::{Result, ServiceError};

use crate::data::{EdgeData, MAX_MESSAGE_SIZE};
use crate::transport::{ConnectType, EdgeCallback, EdgeEvent, EdgeFactory, EdgeLink, EdgeRole};

/// Creates TCP links; other connect types are not available in this build.
#[derive(Default)]
pub struct TcpEdgeFactory;

impl EdgeFactory for TcpEdgeFactory {
    fn create(
        &self,
        id: &str,
        connect_type: ConnectType,
        role: EdgeRole,
    ) -> Result<Arc<dyn EdgeLink>> {
        if connect_type != ConnectType::Tcp {
            return Err(ServiceError::NotSupported(format!(
                "connect type {connect_type:?} is not available, use TCP"
            )));
        }
        Ok(Arc::new(TcpEdge::new(id, role)))
    }
}

struct Inner {
    id: String,
    role: EdgeRole,
    callback: RwLock<Option<EdgeCallback>>,
    info: RwLock<HashMap<String, String>>,
    peers: RwLock<HashMap<u64, mpsc::Sender<EdgeData>>>,
    next_peer: AtomicU64,
    local_port: RwLock<Option<u16>>,
    /// Accept loop and per-peer readers; aborted on release.
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Per-peer writers; drained on release so queued frames still go out.
    writer_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn emit(&self, event: EdgeEvent) {
        let snapshot = self.callback.read().clone();
        if let Some(cb) = snapshot {
            cb(event);
        }
    }
}

/// Wire a connected stream into the peer table and spawn its IO tasks.
fn adopt_stream(inner: &Arc<Inner>, stream: TcpStream) -> Result<u64> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(&stream);
    sock.set_keepalive(true)?;

    let peer = inner.next_peer.fetch_add(1, Ordering::SeqCst);
    let (read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::channel::<EdgeData>(16);
    inner.peers.write().insert(peer, tx);

    let writer = tokio::spawn(write_loop(write_half, rx));
    let reader = {
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(err) = read_loop(&inner, peer, read_half).await {
                debug!("edge '{}' peer {peer} read loop ended: {err}", inner.id);
            }
            inner.peers.write().remove(&peer);
            inner.emit(EdgeEvent::Disconnected { peer });
        })
    };
    inner.writer_tasks.lock().push(writer);
    inner.io_tasks.lock().push(reader);

    inner.emit(EdgeEvent::Connected { peer });
    Ok(peer)
}

async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<EdgeData>) {
    while let Some(data) = rx.recv().await {
        let body = match data.encode() {
            Ok(body) => body,
            Err(err) => {
                warn!("dropping unencodable edge message: {err}");
                continue;
            }
        };
        let len = (body.len() as u32).to_le_bytes();
        if half.write_all(&len).await.is_err() || half.write_all(&body).await.is_err() {
            break;
        }
        let _ = half.flush().await;
    }
}

async fn read_loop(inner: &Arc<Inner>, peer: u64, mut half: OwnedReadHalf) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match half.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ServiceError::Io(format!(
                "incoming frame of {len} bytes exceeds the message size limit"
            )));
        }
        let mut body = vec![0u8; len];
        half.read_exact(&mut body).await?;
        match EdgeData::decode(&body) {
            Ok(data) => inner.emit(EdgeEvent::Received { peer, data }),
            Err(err) => warn!(
                "edge '{}' dropping bad frame from peer {peer}: {err}",
                inner.id
            ),
        }
    }
}

/// One edge endpoint. Receivers listen after `start`; senders `connect`.
pub struct TcpEdge {
    inner: Arc<Inner>,
}

impl TcpEdge {
    pub fn new(id: &str, role: EdgeRole) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                role,
                callback: RwLock::new(None),
                info: RwLock::new(HashMap::new()),
                peers: RwLock::new(HashMap::new()),
                next_peer: AtomicU64::new(1),
                local_port: RwLock::new(None),
                io_tasks: Mutex::new(Vec::new()),
                writer_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn role(&self) -> EdgeRole {
        self.inner.role
    }
}

#[async_trait]
impl EdgeLink for TcpEdge {
    fn set_event_callback(&self, callback: EdgeCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    fn set_info(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ServiceError::invalid("edge info key must not be empty"));
        }
        self.inner
            .info
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn info(&self, key: &str) -> Option<String> {
        self.inner.info.read().get(key).cloned()
    }

    async fn start(&self) -> Result<()> {
        if self.inner.role != EdgeRole::Receiver {
            return Ok(());
        }
        let host = self
            .info("HOST")
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = self
            .info("PORT")
            .map(|p| {
                p.parse()
                    .map_err(|_| ServiceError::invalid(format!("invalid edge port '{p}'")))
            })
            .transpose()?
            .unwrap_or(0);

        let listener = TcpListener::bind((host.as_str(), port)).await?;
        let bound = listener.local_addr()?.port();
        *self.inner.local_port.write() = Some(bound);
        debug!("edge '{}' listening on {host}:{bound}", self.inner.id);

        let inner = self.inner.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("edge '{}' accepted {addr}", inner.id);
                        if let Err(err) = adopt_stream(&inner, stream) {
                            warn!("edge '{}' failed to adopt {addr}: {err}", inner.id);
                        }
                    }
                    Err(err) => {
                        warn!("edge '{}' accept failed: {err}", inner.id);
                        break;
                    }
                }
            }
        });
        self.inner.io_tasks.lock().push(accept);
        Ok(())
    }

    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let stream = TcpStream::connect((host, port)).await?;
        adopt_stream(&self.inner, stream)?;
        Ok(())
    }

    async fn send(&self, data: EdgeData) -> Result<()> {
        let peers: Vec<mpsc::Sender<EdgeData>> =
            self.inner.peers.read().values().cloned().collect();
        if peers.is_empty() {
            return Err(ServiceError::Io("edge link has no connected peer".into()));
        }
        for tx in peers {
            tx.send(data.clone())
                .await
                .map_err(|_| ServiceError::Io("edge peer connection is gone".into()))?;
        }
        Ok(())
    }

    async fn send_to(&self, peer: u64, data: EdgeData) -> Result<()> {
        let tx = self
            .inner
            .peers
            .read()
            .get(&peer)
            .cloned()
            .ok_or_else(|| ServiceError::invalid(format!("no connected peer {peer}")))?;
        tx.send(data)
            .await
            .map_err(|_| ServiceError::Io("edge peer connection is gone".into()))
    }

    fn local_port(&self) -> Option<u16> {
        *self.inner.local_port.read()
    }

    async fn release(&self) -> Result<()> {
        // Dropping the peer senders lets each writer drain its queue and
        // exit; only the readers and the accept loop are cut short.
        self.inner.peers.write().clear();
        let writers: Vec<JoinHandle<()>> = self.inner.writer_tasks.lock().drain(..).collect();
        for mut writer in writers {
            if tokio::time::timeout(Duration::from_secs(1), &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }
        for task in self.inner.io_tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc as test_mpsc;

    #[tokio::test]
    async fn loopback_round_trip() {
        let receiver = TcpEdge::new("rx", EdgeRole::Receiver);
        receiver.set_info("HOST", "127.0.0.1").unwrap();

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        receiver.set_event_callback(Arc::new(move |event| {
            if let EdgeEvent::Received { data, .. } = event {
                let _ = tx.send(data);
            }
        }));
        receiver.start().await.unwrap();
        let port = receiver.local_port().unwrap();

        let sender = TcpEdge::new("tx", EdgeRole::Sender);
        sender.connect("127.0.0.1", port).await.unwrap();

        let mut message = EdgeData::new();
        message.set_info("service-type", "model_raw");
        message.set_info("service-key", "mobilenet");
        message.add_blob(Bytes::from_static(b"weights"));
        sender.send(message).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.info("service-type"), Some("model_raw"));
        assert_eq!(received.info("service-key"), Some("mobilenet"));
        assert_eq!(received.blob(0).unwrap(), Bytes::from_static(b"weights"));

        sender.release().await.unwrap();
        receiver.release().await.unwrap();
    }

    #[tokio::test]
    async fn send_without_peers_is_an_io_error() {
        let sender = TcpEdge::new("tx", EdgeRole::Sender);
        let err = sender.send(EdgeData::new()).await.unwrap_err();
        assert_eq!(err.code(), -5);
    }

    #[tokio::test]
    async fn receiver_can_reply_to_a_peer() {
        let receiver = TcpEdge::new("rx", EdgeRole::Receiver);
        receiver.set_info("HOST", "127.0.0.1").unwrap();
        receiver.start().await.unwrap();
        let port = receiver.local_port().unwrap();

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        let sender = TcpEdge::new("tx", EdgeRole::Sender);
        sender.set_event_callback(Arc::new(move |event| {
            if let EdgeEvent::Received { data, .. } = event {
                let _ = tx.send(data);
            }
        }));
        sender.connect("127.0.0.1", port).await.unwrap();

        // Wait for the receiver to see the connection, then push back.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut reply = EdgeData::new();
        reply.set_info("service-type", "reply");
        reply.add_blob(Bytes::from_static(b"result"));
        receiver.send(reply).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.info("service-type"), Some("reply"));

        sender.release().await.unwrap();
        receiver.release().await.unwrap();
    }
}
