//! Transport connections for RainTree hops.
//!
//! The engine only sees [`TransportConnection`]: a duplex channel to one
//! peer whose `write` returns once the peer acknowledged the frame, and
//! whose `read` yields the next complete frame. Connections are opened
//! lazily through a [`Connector`] and kept one per peer in a
//! [`ConnectionPool`].
//!
//! The TCP implementation frames every payload as
//!
//! ```text
//! [4 bytes: request nonce (u32-le)] [4 bytes: payload length (u32-le)] [N bytes: payload]
//! ```
//!
//! and the receiver echoes the nonce back once the frame is queued for
//! handling. A frame that has started arriving must complete within the
//! request timeout; an idle connection may wait for its next frame forever.

use {
    crate::{
        address_book::{Peer, PeerId},
        codec::{frame, read_frame_header, FRAME_HEADER_LEN},
        config::RainTreeConfig,
        error::{RainTreeError, Result},
    },
    async_trait::async_trait,
    dashmap::DashMap,
    log::{debug, error, info, warn},
    std::{
        io::ErrorKind,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::{mpsc, watch, Mutex},
    },
};

/// Direction of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Accepts frames from many peers.
    Inbound,
    /// Dialed to a single peer.
    Outbound,
}

/// Duplex frame channel to a peer.
///
/// Implementations serialize concurrent writers themselves.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Direction of the underlying socket.
    fn kind(&self) -> SocketKind;

    /// Block until a full frame is available.
    async fn read(&self) -> Result<Vec<u8>>;

    /// Send one frame and wait for the peer to acknowledge it.
    async fn write(&self, payload: &[u8]) -> Result<()>;

    /// Whether the connection can still carry frames. A pool drops
    /// connections that report `false` and dials again.
    fn is_open(&self) -> bool {
        true
    }

    /// Stop accepting frames. Frames already queued stay readable.
    fn close(&self) {}
}

/// Opens outbound connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `peer`.
    async fn connect(&self, peer: &Peer) -> Result<Arc<dyn TransportConnection>>;
}

/// One connection per peer identity, reused across hops and originations.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    connections: DashMap<PeerId, Arc<dyn TransportConnection>>,
}

impl ConnectionPool {
    /// Create an empty pool that dials through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: DashMap::new(),
        }
    }

    /// Reuse the open connection to `peer` or dial a new one.
    pub async fn get_or_connect(&self, peer: &Peer) -> Result<Arc<dyn TransportConnection>> {
        let existing = self
            .connections
            .get(&peer.id)
            .map(|conn| Arc::clone(conn.value()));
        if let Some(conn) = existing {
            if conn.is_open() {
                return Ok(conn);
            }
            debug!("dropping closed connection to {}", peer.id);
            self.connections
                .remove_if(&peer.id, |_, pooled| Arc::ptr_eq(pooled, &conn));
        }
        let conn = self.connector.connect(peer).await?;
        debug!("opened connection to {} ({})", peer.id, peer.addr);
        // Two hops may race to dial the same peer; keep whichever landed first.
        Ok(Arc::clone(
            self.connections
                .entry(peer.id.clone())
                .or_insert(conn)
                .value(),
        ))
    }

    /// Forget the connection to `id` so the next write re-dials.
    pub fn evict(&self, id: &PeerId) {
        if self.connections.remove(id).is_some() {
            debug!("evicted connection to {}", id);
        }
    }

    /// Number of pooled connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// ── TCP ─────────────────────────────────────────────────────────────────────

/// A frame received by the listener together with the address it came from.
#[derive(Debug)]
pub struct InboundFrame {
    /// Encoded envelope.
    pub payload: Vec<u8>,
    /// Remote address of the connection the frame arrived on.
    pub from: SocketAddr,
}

/// Handle returned by [`TransportListener::start`].
pub struct TransportHandle {
    /// Every acknowledged inbound frame, as a readable connection.
    pub inbound: Arc<InboundConnection>,
    /// The local address the listener is bound to (useful when port = 0).
    pub local_addr: SocketAddr,
}

/// Listens for inbound TCP connections, acknowledges and queues frames.
pub struct TransportListener {
    bind_addr: SocketAddr,
    max_message_size: usize,
    channel_buffer_size: usize,
    request_timeout: Duration,
}

impl TransportListener {
    /// Listener on `config.bind_addr`; nothing is bound until [`Self::start`].
    pub fn new(config: &RainTreeConfig) -> Self {
        Self {
            bind_addr: config.bind_addr,
            max_message_size: config.max_message_size,
            channel_buffer_size: config.channel_buffer_size,
            request_timeout: config.request_timeout(),
        }
    }

    /// Bind and start accepting connections.
    ///
    /// Spawns a Tokio task per accepted connection. Everything stops when
    /// the returned [`InboundConnection`] is closed or dropped.
    pub async fn start(self) -> Result<TransportHandle> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("raintree transport listening on {}", local_addr);

        let (tx, rx) = mpsc::channel::<InboundFrame>(self.channel_buffer_size);
        let (shutdown, closed) = watch::channel(false);
        let max_msg = self.max_message_size;
        let timeout = self.request_timeout;

        let mut stop = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!("accepted raintree connection from {}", addr);
                            tokio::spawn(Self::handle_connection(
                                stream,
                                addr,
                                tx.clone(),
                                closed.clone(),
                                max_msg,
                                timeout,
                            ));
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    },
                    _ = stop.changed() => {
                        info!("stopping raintree listener on {}", local_addr);
                        break;
                    }
                }
            }
        });

        Ok(TransportHandle {
            inbound: Arc::new(InboundConnection {
                rx: Mutex::new(rx),
                shutdown,
            }),
            local_addr,
        })
    }

    /// Read frames from `stream` until EOF, error or shutdown, queueing and
    /// then acknowledging each one.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx: mpsc::Sender<InboundFrame>,
        mut closed: watch::Receiver<bool>,
        max_message_size: usize,
        timeout: Duration,
    ) {
        loop {
            let read = tokio::select! {
                read = read_frame(&mut stream, addr, max_message_size, timeout) => read,
                _ = closed.changed() => break,
            };
            let (nonce, payload) = match read {
                Ok(frame) => frame,
                Err(RainTreeError::PeerHangUp { .. }) => break,
                Err(e) => {
                    warn!("dropping connection from {}: {}", addr, e);
                    break;
                }
            };

            // Frames that arrive while closing are left unacknowledged.
            if *closed.borrow() {
                break;
            }
            let queued = tokio::select! {
                sent = tx.send(InboundFrame { payload, from: addr }) => sent.is_ok(),
                _ = closed.changed() => false,
            };
            if !queued {
                info!("inbound channel closed, stopping reader for {}", addr);
                break;
            }

            if let Err(e) = stream.write_all(&nonce.to_le_bytes()).await {
                warn!("ack write error to {}: {}", addr, e);
                break;
            }
        }

        debug!("connection from {} closed", addr);
    }
}

/// Read side of the listener.
pub struct InboundConnection {
    rx: Mutex<mpsc::Receiver<InboundFrame>>,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl TransportConnection for InboundConnection {
    fn kind(&self) -> SocketKind {
        SocketKind::Inbound
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let frame = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(RainTreeError::ChannelClosed)?;
        Ok(frame.payload)
    }

    async fn write(&self, _payload: &[u8]) -> Result<()> {
        Err(RainTreeError::UnsupportedOperation {
            kind: SocketKind::Inbound,
            op: "write",
        })
    }

    fn is_open(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Stop the accept loop, releasing the port, and drop every accepted
    /// connection without acknowledging further frames.
    fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Outbound TCP connection to one peer.
///
/// Writers take turns on the stream, each waiting for its own ack. A write
/// that fails or is cancelled between sending its frame and reading the ack
/// poisons the connection: the next ack on the stream would belong to it.
pub struct TcpConnection {
    addr: SocketAddr,
    max_message_size: usize,
    request_timeout: Duration,
    stream: Mutex<TcpStream>,
    next_nonce: AtomicU32,
    poisoned: AtomicBool,
}

/// Poisons its connection unless the write completes.
struct InFlight<'a> {
    poisoned: &'a AtomicBool,
    acked: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.acked {
            self.poisoned.store(true, Ordering::Release);
        }
    }
}

impl TcpConnection {
    /// Dial `addr`. `request_timeout` bounds reading a frame once it started.
    pub async fn connect(
        addr: SocketAddr,
        max_message_size: usize,
        request_timeout: Duration,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RainTreeError::Unexpected { addr, source })?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr,
            max_message_size,
            request_timeout,
            stream: Mutex::new(stream),
            next_nonce: AtomicU32::new(0),
            poisoned: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(RainTreeError::ConnectionPoisoned { addr: self.addr });
        }
        Ok(())
    }
}

#[async_trait]
impl TransportConnection for TcpConnection {
    fn kind(&self) -> SocketKind {
        SocketKind::Outbound
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        let (_nonce, payload) = read_frame(
            &mut *stream,
            self.addr,
            self.max_message_size,
            self.request_timeout,
        )
        .await?;
        Ok(payload)
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_message_size {
            return Err(RainTreeError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }
        self.check_open()?;
        let addr = self.addr;
        let mut stream = self.stream.lock().await;
        // The writer ahead of us may have been cancelled while we waited.
        self.check_open()?;

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let mut in_flight = InFlight {
            poisoned: &self.poisoned,
            acked: false,
        };
        stream
            .write_all(&frame(nonce, payload))
            .await
            .map_err(|source| classify(addr, source))?;
        stream
            .flush()
            .await
            .map_err(|source| classify(addr, source))?;

        let mut ack = [0u8; 4];
        stream
            .read_exact(&mut ack)
            .await
            .map_err(|source| classify(addr, source))?;
        let acked = u32::from_le_bytes(ack);
        if acked != nonce {
            return Err(RainTreeError::Unexpected {
                addr,
                source: std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("ack for nonce {acked}, expected {nonce}"),
                ),
            });
        }
        in_flight.acked = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.poisoned.load(Ordering::Acquire)
    }
}

/// Dials peers over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    max_message_size: usize,
    request_timeout: Duration,
}

impl TcpConnector {
    /// Connector applying the size limit and request timeout from `config`.
    pub fn new(config: &RainTreeConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            request_timeout: config.request_timeout(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: &Peer) -> Result<Arc<dyn TransportConnection>> {
        let conn =
            TcpConnection::connect(peer.addr, self.max_message_size, self.request_timeout).await?;
        Ok(Arc::new(conn))
    }
}

/// Read one frame. EOF before the header maps to `PeerHangUp`.
///
/// Waiting for the first byte is unbounded; the rest of the frame must
/// arrive within `timeout`.
async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    addr: SocketAddr,
    max_message_size: usize,
    timeout: Duration,
) -> Result<(u32, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream
        .read_exact(&mut header[..1])
        .await
        .map_err(|source| classify(addr, source))?;

    let rest = async {
        stream
            .read_exact(&mut header[1..])
            .await
            .map_err(|source| classify(addr, source))?;
        let (nonce, len) = read_frame_header(&header);
        if len > max_message_size {
            return Err(RainTreeError::MessageTooLarge {
                size: len,
                max: max_message_size,
            });
        }

        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|source| classify(addr, source))?;
        Ok((nonce, payload))
    };
    tokio::time::timeout(timeout, rest)
        .await
        .map_err(|_| RainTreeError::ReadTimedOut { addr })?
}

fn classify(addr: SocketAddr, source: std::io::Error) -> RainTreeError {
    match source.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            RainTreeError::PeerHangUp { addr, source }
        }
        _ => RainTreeError::Unexpected { addr, source },
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
