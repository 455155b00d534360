//! Test doubles for the transport layer.
//!
//! Each validator gets one [`MockConnection`]. Peers writing to a validator
//! push frames into its connection, and the validator's listener loop reads
//! them back out, so reads and writes on one connection both count the
//! envelopes that validator received.

use {
    crate::{
        address_book::{AddressBook, Peer, PeerId},
        error::{RainTreeError, Result},
        transport::{Connector, SocketKind, TransportConnection},
    },
    async_trait::async_trait,
    dashmap::DashMap,
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio::sync::{mpsc, Mutex},
};

/// Identity of the `n`th validator (1-based), zero padded so string order
/// matches numeric order.
pub fn validator_id(n: usize) -> PeerId {
    PeerId::from(format!("val_{n:02}"))
}

/// Address book of `n` validators `val_01..val_n`.
pub fn book_of(n: usize) -> AddressBook {
    let peers = (1..=n)
        .map(|i| {
            let port = u16::try_from(i).map_or(0, |p| p.saturating_add(10_000));
            Peer::new(validator_id(i), SocketAddr::from(([127, 0, 0, 1], port)))
        })
        .collect();
    AddressBook::new(peers).expect("generated identities are unique")
}

/// In-memory connection that counts every read and write.
pub struct MockConnection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for MockConnection {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }
}

impl MockConnection {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnection for MockConnection {
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
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(payload.to_vec())
            .map_err(|_| RainTreeError::ChannelClosed)
    }
}

/// Connection whose writes are never acknowledged.
#[derive(Default)]
pub struct HangingConnection {
    writes: AtomicUsize,
}

impl HangingConnection {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnection for HangingConnection {
    fn kind(&self) -> SocketKind {
        SocketKind::Outbound
    }

    async fn read(&self) -> Result<Vec<u8>> {
        std::future::pending().await
    }

    async fn write(&self, _payload: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Connection whose peer always hangs up.
pub struct FailingConnection {
    addr: SocketAddr,
}

impl FailingConnection {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl TransportConnection for FailingConnection {
    fn kind(&self) -> SocketKind {
        SocketKind::Outbound
    }

    async fn read(&self) -> Result<Vec<u8>> {
        Err(RainTreeError::PeerHangUp {
            addr: self.addr,
            source: std::io::ErrorKind::ConnectionReset.into(),
        })
    }

    async fn write(&self, _payload: &[u8]) -> Result<()> {
        Err(RainTreeError::PeerHangUp {
            addr: self.addr,
            source: std::io::ErrorKind::ConnectionReset.into(),
        })
    }
}

/// A whole simulated network: one [`MockConnection`] per validator, plus
/// optional replacements for the outbound side of particular peers.
pub struct MockNetwork {
    connections: DashMap<PeerId, Arc<MockConnection>>,
    overrides: DashMap<PeerId, Arc<dyn TransportConnection>>,
}

impl MockNetwork {
    pub fn new(book: &AddressBook) -> Arc<Self> {
        let connections = book
            .iter()
            .map(|peer| (peer.id.clone(), Arc::new(MockConnection::default())))
            .collect();
        Arc::new(Self {
            connections,
            overrides: DashMap::new(),
        })
    }

    /// The connection validator `id` listens on.
    pub fn connection(&self, id: &PeerId) -> Arc<MockConnection> {
        Arc::clone(
            self.connections
                .get(id)
                .expect("peer is part of the mock network")
                .value(),
        )
    }

    /// Make writes to `id` go through `conn` instead of its mock.
    pub fn replace_outbound(&self, id: &PeerId, conn: Arc<dyn TransportConnection>) {
        self.overrides.insert(id.clone(), conn);
    }

    pub fn reads(&self, id: &PeerId) -> usize {
        self.connection(id).reads()
    }

    pub fn writes(&self, id: &PeerId) -> usize {
        self.connection(id).writes()
    }

    pub fn total_writes(&self) -> usize {
        self.connections.iter().map(|c| c.value().writes()).sum()
    }

    /// Poll until `peer` has received at least `expected` writes.
    pub async fn wait_for_writes(&self, peer: &Peer, expected: usize, timeout: Duration) {
        let started = Instant::now();
        while self.writes(&peer.id) < expected {
            assert!(
                started.elapsed() < timeout,
                "timed out waiting for {expected} writes to {}, saw {}",
                peer.id,
                self.writes(&peer.id)
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Connector for MockNetwork {
    async fn connect(&self, peer: &Peer) -> Result<Arc<dyn TransportConnection>> {
        if let Some(conn) = self.overrides.get(&peer.id) {
            return Ok(Arc::clone(conn.value()));
        }
        let conn = self
            .connections
            .get(&peer.id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| RainTreeError::UnknownPeer(peer.id.clone()))?;
        Ok(conn)
    }
}
