//! TCP transport and server
//!
//! Frames are a big-endian u32 length followed by a bincode body. Calls on a
//! connection are multiplexed by request id, so a long-held node-state poll
//! does not block a state push to the same node.

use super::{ErrorCode, Request, RpcError, RpcResult, RpcTarget, RpcTransport, Value};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const ADDRESS_PREFIX: &str = "tcp/";

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Request {
        id: u64,
        method: String,
        params: Vec<Value>,
        timeout_ms: u64,
    },
    Response {
        id: u64,
        outcome: WireOutcome,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum WireOutcome {
    Ok(Vec<Value>),
    Err { code: u32, message: String },
}

impl From<RpcResult> for WireOutcome {
    fn from(result: RpcResult) -> Self {
        match result {
            Ok(values) => WireOutcome::Ok(values),
            Err(e) => WireOutcome::Err {
                code: e.code.code(),
                message: e.message,
            },
        }
    }
}

impl From<WireOutcome> for RpcResult {
    fn from(outcome: WireOutcome) -> Self {
        match outcome {
            WireOutcome::Ok(values) => Ok(values),
            WireOutcome::Err { code, message } => {
                Err(RpcError::new(ErrorCode::from_code(code), message))
            }
        }
    }
}

/// Strip the optional `tcp/` prefix and validate `host:port`.
pub fn parse_address(address: &str) -> Result<String> {
    let host_port = address.strip_prefix(ADDRESS_PREFIX).unwrap_or(address);
    let (host, port) = host_port.rsplit_once(':').ok_or_else(|| Error::Connection {
        address: address.to_string(),
        reason: "expected tcp/<host>:<port>".to_string(),
    })?;
    if host.is_empty() {
        return Err(Error::Connection {
            address: address.to_string(),
            reason: "empty host".to_string(),
        });
    }
    port.parse::<u16>().map_err(|_| Error::Connection {
        address: address.to_string(),
        reason: format!("invalid port '{}'", port),
    })?;
    Ok(host_port.to_string())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Transport(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Transport(format!(
            "peer announced frame of {} bytes, limit is {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

/// Transport creating lazily connected TCP targets.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl RpcTransport for TcpTransport {
    fn connect(&self, address: &str) -> Result<Arc<dyn RpcTarget>> {
        let socket_addr = parse_address(address)?;
        Ok(Arc::new(TcpTarget {
            address: address.to_string(),
            socket_addr,
            connect_timeout: self.connect_timeout,
            channel: Mutex::new(None),
            failed: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
        }))
    }
}

type PendingCalls = Arc<DashMap<u64, oneshot::Sender<RpcResult>>>;

struct Channel {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: PendingCalls,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Channel {
    fn start(stream: TcpStream, failed: Arc<AtomicBool>, address: String) -> Arc<Self> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let pending: PendingCalls = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let writer_pending = pending.clone();
        let writer_closed = closed.clone();
        let writer_failed = failed.clone();
        let writer_shutdown = shutdown.clone();
        let writer_address = address.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    warn!(address = %writer_address, error = %e, "Failed to write RPC frame");
                    writer_closed.store(true, Ordering::Release);
                    writer_failed.store(true, Ordering::Release);
                    fail_pending(&writer_pending, &writer_address);
                    writer_shutdown.cancel();
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    frame = read_frame(&mut read_half) => frame,
                };
                match frame {
                    Ok(Some(Frame::Response { id, outcome })) => {
                        if let Some((_, waiter)) = reader_pending.remove(&id) {
                            let _ = waiter.send(outcome.into());
                        } else {
                            debug!(address = %address, id, "Dropping reply for unknown call");
                        }
                    }
                    Ok(Some(Frame::Request { method, .. })) => {
                        warn!(address = %address, method = %method, "Ignoring request frame on client channel");
                    }
                    Ok(None) => {
                        debug!(address = %address, "Peer closed RPC channel");
                        break;
                    }
                    Err(e) => {
                        warn!(address = %address, error = %e, "RPC channel read failed");
                        break;
                    }
                }
            }

            reader_closed.store(true, Ordering::Release);
            failed.store(true, Ordering::Release);
            fail_pending(&reader_pending, &address);
        });

        Arc::new(Self {
            outbound,
            pending,
            closed,
            shutdown,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Complete every in-flight call with a connection error.
fn fail_pending(pending: &PendingCalls, address: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, waiter)) = pending.remove(&id) {
            let _ = waiter.send(Err(RpcError::new(
                ErrorCode::Connection,
                format!("connection to {} lost", address),
            )));
        }
    }
}

/// Removes a call from the pending table when its future is dropped, so an
/// abandoned call does not linger until the peer replies.
struct PendingGuard {
    pending: PendingCalls,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct TcpTarget {
    address: String,
    socket_addr: String,
    connect_timeout: Duration,
    channel: Mutex<Option<Arc<Channel>>>,
    failed: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl TcpTarget {
    async fn channel(&self) -> std::result::Result<Arc<Channel>, RpcError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
        }

        let connect = TcpStream::connect(&self.socket_addr);
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.failed.store(true, Ordering::Release);
                return Err(RpcError::new(
                    ErrorCode::Connection,
                    format!("connect to {} failed: {}", self.address, e),
                ));
            }
            Err(_) => {
                self.failed.store(true, Ordering::Release);
                return Err(RpcError::new(
                    ErrorCode::Connection,
                    format!("connect to {} timed out", self.address),
                ));
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(address = %self.address, "Established RPC channel");

        let channel = Channel::start(stream, self.failed.clone(), self.address.clone());
        *slot = Some(channel.clone());
        Ok(channel)
    }

    async fn call(
        &self,
        id: u64,
        request: Request,
        timeout: Duration,
        reply_tx: oneshot::Sender<RpcResult>,
        reply_rx: oneshot::Receiver<RpcResult>,
    ) -> RpcResult {
        let channel = self.channel().await?;
        channel.pending.insert(id, reply_tx);
        let _guard = PendingGuard {
            pending: channel.pending.clone(),
            id,
        };
        let frame = Frame::Request {
            id,
            method: request.method,
            params: request.params,
            timeout_ms: timeout.as_millis() as u64,
        };
        if channel.outbound.send(frame).is_err() || channel.is_closed() {
            return Err(RpcError::new(
                ErrorCode::Connection,
                format!("connection to {} closed", self.address),
            ));
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::new(
                ErrorCode::Connection,
                format!("connection to {} closed before reply", self.address),
            )),
        }
    }
}

#[async_trait]
impl RpcTarget for TcpTarget {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_valid(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    async fn invoke(&self, request: Request, timeout: Duration) -> RpcResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        match tokio::time::timeout(timeout, self.call(id, request, timeout, reply_tx, reply_rx)).await
        {
            Ok(result) => result,
            Err(_) => Err(RpcError::new(
                ErrorCode::Timeout,
                format!("no reply from {} within {:?}", self.address, timeout),
            )),
        }
    }
}

/// Server-side method dispatch.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one call. Unknown methods should fail with
    /// [`ErrorCode::NoSuchMethod`].
    async fn handle(&self, method: &str, params: Vec<Value>) -> RpcResult;
}

/// TCP listener dispatching request frames to an [`RpcHandler`].
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RpcServer {
    /// Bind to `addr` (e.g. `127.0.0.1:0`) and start serving.
    pub async fn bind(addr: &str, handler: Arc<dyn RpcHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let accept_shutdown = shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted RPC connection");
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(serve_connection(
                            stream,
                            handler.clone(),
                            accept_shutdown.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept RPC connection"),
                }
            }
        });

        info!(%local_addr, "RPC server listening");
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address in the form accepted by [`TcpTransport`].
    pub fn spec(&self) -> String {
        format!("{}{}", ADDRESS_PREFIX, self.local_addr)
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn RpcHandler>, shutdown: CancellationToken) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (responses, mut responses_rx) = mpsc::unbounded_channel::<Frame>();

    let writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                frame = responses_rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                warn!(error = %e, "Failed to write RPC response");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut read_half) => frame,
        };
        match frame {
            Ok(Some(Frame::Request {
                id,
                method,
                params,
                timeout_ms,
            })) => {
                let handler = handler.clone();
                let responses = responses.clone();
                tokio::spawn(async move {
                    let limit = Duration::from_millis(timeout_ms);
                    let result = match tokio::time::timeout(limit, handler.handle(&method, params)).await {
                        Ok(result) => result,
                        Err(_) => Err(RpcError::new(
                            ErrorCode::Timeout,
                            format!("{} did not complete within {:?}", method, limit),
                        )),
                    };
                    let _ = responses.send(Frame::Response {
                        id,
                        outcome: result.into(),
                    });
                });
            }
            Ok(Some(Frame::Response { id, .. })) => {
                debug!(id, "Ignoring response frame on server connection");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "RPC connection read failed");
                break;
            }
        }
    }

    shutdown.cancel();
    let _ = writer.await;
}
