//! Framed TCP sockets for the control plane
//!
//! Frames are a big-endian `u32` length followed by the payload. A multipart
//! message is a big-endian `u32` part count followed by that many frames, and
//! is delivered whole or not at all.
//!
//! * [`PushSocket`] / [`PullSocket`]: one-way, many pushers to one puller.
//! * [`RequestSocket`] / [`ReplySocket`]: strict request then reply; the
//!   reply side hands out one request at a time and every request must be
//!   answered before the connection carries the next one.

use mtds_types::{MtdsError, Result};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum size of a single frame (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum parts in one multipart message
pub const MAX_PARTS: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default bound on one push write
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const CHANNEL_DEPTH: usize = 64;

/// Write one length-prefixed frame
pub async fn write_frame<T>(io: &mut T, payload: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", payload.len(), MAX_FRAME_SIZE),
        ));
    }
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(payload).await
}

/// Read one length-prefixed frame
pub async fn read_frame<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", len, MAX_FRAME_SIZE),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a multipart message as one unit and flush it
pub async fn write_multipart<T>(io: &mut T, parts: &[Vec<u8>]) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    if parts.len() > MAX_PARTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} parts exceed limit {}", parts.len(), MAX_PARTS),
        ));
    }
    let mut buf = Vec::with_capacity(4 + parts.iter().map(|p| p.len() + 4).sum::<usize>());
    buf.extend_from_slice(&(parts.len() as u32).to_be_bytes());
    for part in parts {
        write_frame(&mut buf, part).await?;
    }
    io.write_all(&buf).await?;
    io.flush().await
}

/// Read a multipart message
pub async fn read_multipart<T>(io: &mut T) -> io::Result<Vec<Vec<u8>>>
where
    T: AsyncRead + Unpin,
{
    let mut count_buf = [0u8; 4];
    io.read_exact(&mut count_buf).await?;
    let count = u32::from_be_bytes(count_buf) as usize;
    if count > MAX_PARTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} parts exceed limit {}", count, MAX_PARTS),
        ));
    }
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        parts.push(read_frame(io).await?);
    }
    Ok(parts)
}

/// Strip an optional `tcp://` scheme from an endpoint
pub fn endpoint_addr(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}

fn network_error(context: &str, e: io::Error) -> MtdsError {
    MtdsError::network(format!("{}: {}", context, e))
}

/// Sending side of a one-way channel.
///
/// Connects lazily and reconnects on the next send after any failure, so a
/// controller that is briefly unreachable only costs the messages sent while
/// it was down.
#[derive(Debug)]
pub struct PushSocket {
    endpoint: String,
    stream: Option<TcpStream>,
    send_timeout: Duration,
}

impl PushSocket {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_send_timeout(endpoint, SEND_TIMEOUT)
    }

    /// A send that cannot finish within `send_timeout` fails and drops the
    /// connection, so a stalled controller cannot block the caller forever
    pub fn with_send_timeout(endpoint: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            stream: None,
            send_timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            let addr = endpoint_addr(&self.endpoint);
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    MtdsError::network(format!("Timed out connecting to {}", self.endpoint))
                })?
                .map_err(|e| network_error(&format!("Failed to connect to {}", self.endpoint), e))?;
            stream.set_nodelay(true)?;
            debug!("Push socket connected to {}", self.endpoint);
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| MtdsError::internal("push stream missing after connect"))
    }

    pub async fn send_multipart(&mut self, parts: &[Vec<u8>]) -> Result<()> {
        let endpoint = self.endpoint.clone();
        let send_timeout = self.send_timeout;
        let stream = self.connect().await?;
        let result = match tokio::time::timeout(send_timeout, write_multipart(stream, parts)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => network_error(&format!("Failed to push to {}", endpoint), e),
            Err(_) => MtdsError::network(format!(
                "Timed out pushing to {} after {:?}",
                endpoint, send_timeout
            )),
        };
        // A partial write leaves the stream out of frame
        self.stream = None;
        Err(result)
    }
}

/// Receiving side of a one-way channel; accepts any number of pushers
#[derive(Debug)]
pub struct PullSocket {
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Vec<Vec<u8>>>,
    acceptor: JoinHandle<()>,
}

impl PullSocket {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(endpoint_addr(addr))
            .await
            .map_err(|e| network_error(&format!("Failed to bind pull socket {}", addr), e))?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        let acceptor = tokio::spawn(async move {
            loop {
                let (mut stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Pull socket accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match read_multipart(&mut stream).await {
                            Ok(parts) => {
                                if tx.send(parts).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                                debug!("Pusher {} disconnected", peer);
                                return;
                            }
                            Err(e) => {
                                warn!("Dropping pusher {}: {}", peer, e);
                                return;
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            rx,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next multipart message from any pusher
    pub async fn recv_multipart(&mut self) -> Option<Vec<Vec<u8>>> {
        self.rx.recv().await
    }
}

impl Drop for PullSocket {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

/// Sending side of a request/reply exchange
#[derive(Debug)]
pub struct RequestSocket {
    stream: TcpStream,
}

impl RequestSocket {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint_addr(endpoint)))
            .await
            .map_err(|_| MtdsError::network(format!("Timed out connecting to {}", endpoint)))?
            .map_err(|e| network_error(&format!("Failed to connect to {}", endpoint), e))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send one request and wait for its reply
    pub async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        write_frame(&mut self.stream, payload)
            .await
            .map_err(|e| network_error("Failed to send request", e))?;
        read_frame(&mut self.stream)
            .await
            .map_err(|e| network_error("Failed to read reply", e))
    }
}

/// A received request awaiting its reply
#[derive(Debug)]
pub struct PendingRequest {
    payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl PendingRequest {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Answer the request; a vanished requester is not an error
    pub fn respond(self, reply: Vec<u8>) {
        if self.reply.send(reply).is_err() {
            debug!("Requester went away before the reply was sent");
        }
    }
}

/// Receiving side of a request/reply exchange
#[derive(Debug)]
pub struct ReplySocket {
    local_addr: SocketAddr,
    rx: mpsc::Receiver<PendingRequest>,
    acceptor: JoinHandle<()>,
}

impl ReplySocket {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(endpoint_addr(addr))
            .await
            .map_err(|e| network_error(&format!("Failed to bind reply socket {}", addr), e))?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel::<PendingRequest>(CHANNEL_DEPTH);

        let acceptor = tokio::spawn(async move {
            loop {
                let (mut stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Reply socket accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        let payload = match read_frame(&mut stream).await {
                            Ok(payload) => payload,
                            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
                            Err(e) => {
                                warn!("Dropping requester {}: {}", peer, e);
                                return;
                            }
                        };
                        let (reply_tx, reply_rx) = oneshot::channel();
                        let pending = PendingRequest {
                            payload,
                            reply: reply_tx,
                        };
                        if tx.send(pending).await.is_err() {
                            return;
                        }
                        let Ok(reply) = reply_rx.await else {
                            return;
                        };
                        if let Err(e) = write_frame(&mut stream, &reply).await {
                            warn!("Failed to reply to {}: {}", peer, e);
                            return;
                        }
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            rx,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next request from any connection
    pub async fn recv(&mut self) -> Option<PendingRequest> {
        self.rx.recv().await
    }
}

impl Drop for ReplySocket {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

/// Address of the local interface that routes to `endpoint`.
///
/// Connecting a UDP socket sends nothing but makes the kernel pick a route.
/// Falls back to loopback when there is no route.
pub fn local_ip_for(endpoint: &str) -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let target = match endpoint_addr(endpoint).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => return fallback,
        },
        Err(_) => return fallback,
    };
    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    UdpSocket::bind(bind_addr)
        .and_then(|socket| {
            socket.connect(target)?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(fallback)
}
