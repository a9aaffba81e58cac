//! TCP transfer channel.
//!
//! Each provider owns one listener on its configured address, bound the
//! first time a channel takes the server role. Accepted streams are routed
//! to the waiting channel by the device id in their opening Hello, so one
//! device can serve several peers at once. The client side dials the
//! address the peer announced. Frames use [`crate::codec`].

use crate::codec::{encode_frame, read_frame};
use crate::error::{SyncError, SyncResult};
use crate::protocol::TransferMessage;
use crate::role::Role;
use crate::transport::{ChannelProvider, TransferChannel};
use async_trait::async_trait;
use folio_types::{DeviceId, DeviceInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default port the server side listens on.
pub const DEFAULT_PORT: u16 = 8963;

/// Bytes written between progress updates.
const PROGRESS_CHUNK: usize = 64 * 1024;

/// How long an accepted stream has to send its Hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// An accepted stream plus the Hello that identified it.
struct Accepted {
    stream: TcpStream,
    hello: TransferMessage,
}

#[derive(Default)]
struct Routes {
    /// Server channels waiting for a given peer.
    waiting: HashMap<DeviceId, oneshot::Sender<Accepted>>,
    /// Peers that dialed before their channel was waiting. Newest wins.
    unclaimed: HashMap<DeviceId, Accepted>,
}

fn lock_routes(m: &std::sync::Mutex<Routes>) -> MutexGuard<'_, Routes> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Routes {
    fn deliver(&mut self, device_id: DeviceId, accepted: Accepted) {
        let accepted = match self.waiting.remove(&device_id) {
            Some(waiter) => match waiter.send(accepted) {
                Ok(()) => return,
                Err(accepted) => accepted,
            },
            None => accepted,
        };
        debug!("[SYNC] Holding connection from {} until it is claimed", device_id);
        self.unclaimed.insert(device_id, accepted);
    }
}

/// The provider's listener and the streams it has accepted.
struct Acceptor {
    listen_addr: SocketAddr,
    routes: Arc<std::sync::Mutex<Routes>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Binds the listener and starts the accept loop unless it is running.
    async fn ensure_listening(&self) -> SyncResult<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("[SYNC] Listening for peers on {}", self.listen_addr);
        let routes = Arc::clone(&self.routes);
        *task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("[SYNC] Accepted connection from {}", addr);
                        tokio::spawn(route(Arc::clone(&routes), stream, addr));
                    }
                    Err(e) => {
                        warn!("[SYNC] Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Waits up to `timeout` for `device` to dial in.
    async fn accept_from(&self, device: &DeviceId, timeout: Duration) -> SyncResult<Accepted> {
        self.ensure_listening().await?;

        let waiter = {
            let mut routes = lock_routes(&self.routes);
            if let Some(accepted) = routes.unclaimed.remove(device) {
                return Ok(accepted);
            }
            let (tx, rx) = oneshot::channel();
            routes.waiting.insert(device.clone(), tx);
            rx
        };
        info!(
            "[SYNC] Waiting for {} on {} (timeout {:?})",
            device, self.listen_addr, timeout
        );

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(accepted)) => Ok(accepted),
            _ => {
                lock_routes(&self.routes).waiting.remove(device);
                Err(SyncError::ConnectionFailed(format!(
                    "no connection from {} within {:?}",
                    device, timeout
                )))
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Reads the opening Hello of an accepted stream and hands the stream to
/// the channel waiting for that device.
async fn route(routes: Arc<std::sync::Mutex<Routes>>, mut stream: TcpStream, addr: SocketAddr) {
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut stream)).await {
        Ok(Ok(TransferMessage::Hello(hello))) => hello,
        Ok(Ok(other)) => {
            debug!("[SYNC] Dropping {}: expected Hello, got {}", addr, other.kind());
            return;
        }
        Ok(Err(e)) => {
            debug!("[SYNC] Dropping {}: {}", addr, e);
            return;
        }
        Err(_) => {
            debug!("[SYNC] Dropping {}: no Hello within {:?}", addr, HELLO_TIMEOUT);
            return;
        }
    };

    let device_id = hello.device.device_id.clone();
    debug!("[SYNC] Connection from {} is {}", addr, device_id);
    lock_routes(&routes).deliver(
        device_id,
        Accepted {
            stream,
            hello: TransferMessage::Hello(hello),
        },
    );
}

/// Hands out [`TcpChannel`]s. Clones share one listener.
#[derive(Clone)]
pub struct TcpChannelProvider {
    acceptor: Arc<Acceptor>,
    accept_timeout: Duration,
    connect_timeout: Duration,
}

impl TcpChannelProvider {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            acceptor: Arc::new(Acceptor {
                listen_addr,
                routes: Arc::default(),
                task: Mutex::new(None),
            }),
            accept_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// How long a server waits for its client.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.acceptor.listen_addr
    }
}

impl ChannelProvider for TcpChannelProvider {
    fn open_channel(&self, _remote: &DeviceInfo) -> Arc<dyn TransferChannel> {
        Arc::new(TcpChannel {
            acceptor: Arc::clone(&self.acceptor),
            accept_timeout: self.accept_timeout,
            connect_timeout: self.connect_timeout,
            pending: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: watch::channel(false).0,
            progress: watch::channel(0.0).0,
        })
    }
}

/// One TCP connection to a peer.
pub struct TcpChannel {
    acceptor: Arc<Acceptor>,
    accept_timeout: Duration,
    connect_timeout: Duration,
    /// The Hello read while routing an accepted stream.
    pending: Mutex<Option<TransferMessage>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
    progress: watch::Sender<f32>,
}

impl TcpChannel {
    async fn dial(&self, remote: &DeviceInfo) -> SyncResult<TcpStream> {
        let addr = remote.socket_addr();
        debug!("[SYNC] Dialing {} at {}", remote.device_id, addr);
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::ConnectionFailed(format!("timed out dialing {addr}")))?
            .map_err(SyncError::from)
    }

    async fn write_frame(&self, writer: &mut OwnedWriteHalf, frame: &[u8]) -> SyncResult<()> {
        let total = frame.len();
        let mut written = 0;
        for chunk in frame.chunks(PROGRESS_CHUNK) {
            writer.write_all(chunk).await?;
            written += chunk.len();
            self.progress.send_replace(written as f32 / total as f32);
        }
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl TransferChannel for TcpChannel {
    async fn connect(&self, remote: &DeviceInfo, role: Role) -> SyncResult<()> {
        let (stream, hello) = match role {
            Role::Server => {
                let accepted = self
                    .acceptor
                    .accept_from(&remote.device_id, self.accept_timeout)
                    .await?;
                (accepted.stream, Some(accepted.hello))
            }
            Role::Client => (self.dial(remote).await?, None),
        };
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        *self.pending.lock().await = hello;
        *self.reader.lock().await = Some(read);
        *self.writer.lock().await = Some(write);
        self.closed.send_replace(false);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: TransferMessage) -> SyncResult<()> {
        let frame = encode_frame(&message)?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| SyncError::TransferFailed("channel not connected".into()))?;

        self.progress.send_replace(0.0);
        if let Err(e) = self.write_frame(writer, &frame).await {
            // Part of the frame may be on the wire; the stream is unusable.
            guard.take();
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn receive(&self) -> SyncResult<TransferMessage> {
        if let Some(hello) = self.pending.lock().await.take() {
            return Ok(hello);
        }
        let mut closed = self.closed.subscribe();
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| SyncError::TransferFailed("channel not connected".into()))?;
        tokio::select! {
            message = read_frame(reader) => message,
            _ = closed.wait_for(|c| *c) => {
                Err(SyncError::TransferFailed("channel disconnected".into()))
            }
        }
    }

    fn progress(&self) -> watch::Receiver<f32> {
        self.progress.subscribe()
    }

    async fn disconnect(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Peer may already be gone.
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        self.pending.lock().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
