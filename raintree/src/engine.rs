//! RainTree broadcast engine.
//!
//! Originates envelopes, handles envelopes read off the listener, and
//! dispatches every write on its own task so a slow or dead peer never
//! holds up another target or another broadcast.
//!
//! Forwarding is driven purely by the envelope level: a node forwards every
//! envelope it reads, duplicates included. Only local delivery is
//! deduplicated, by `(origin, nonce)`.

use {
    crate::{
        address_book::{AddressBook, Peer, PeerId, SharedAddressBook},
        codec::Codec,
        config::RainTreeConfig,
        demotion::Demotion,
        envelope::{DeliveredMessage, Envelope, MessageId, RedundancySlot, Topic},
        error::{RainTreeError, Result},
        plan::{Edge, PropagationPlan},
        seen::SeenCache,
        selector::max_depth,
        transport::{ConnectionPool, Connector},
    },
    crossbeam_channel::Sender,
    dashmap::DashMap,
    log::{debug, info, trace, warn},
    std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::runtime::Handle,
};

/// What happened to an envelope handed to [`BroadcastEngine::handle_incoming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// First copy: forwarded and delivered to the module layer.
    Delivered,
    /// Already delivered: forwarded only.
    Duplicate,
}

/// Counters for the engine's observable behaviour.
#[derive(Debug, Default)]
pub struct BroadcastStats {
    originated: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`BroadcastStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages this node authored.
    pub originated: u64,
    /// Writes acknowledged by their target.
    pub sent: u64,
    /// Writes that failed, timed out or could not be encoded.
    pub send_failures: u64,
    /// Frames handed to `handle_incoming`, malformed ones included.
    pub received: u64,
    /// Messages handed to the module layer.
    pub delivered: u64,
    /// Copies of already delivered messages; still forwarded.
    pub duplicates: u64,
    /// Frames dropped as undecodable or carrying an impossible level.
    pub malformed: u64,
}

impl BroadcastStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            originated: self.originated.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Drives RainTree propagation for one node.
pub struct BroadcastEngine {
    identity: PeerId,
    address_book: SharedAddressBook,
    pool: ConnectionPool,
    codec: Arc<dyn Codec>,
    seen: SeenCache,
    delivered_sender: Sender<DeliveredMessage>,
    request_timeout: Duration,
    runtime: Handle,
    /// Straggler edges keyed by `(book length, origin index)`.
    stragglers: DashMap<(usize, usize), Arc<[Edge]>>,
    stats: BroadcastStats,
}

impl BroadcastEngine {
    /// Create an engine. Must be called from within a Tokio runtime; later
    /// calls may come from any thread.
    pub fn new(
        config: &RainTreeConfig,
        address_book: SharedAddressBook,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn Codec>,
        delivered_sender: Sender<DeliveredMessage>,
    ) -> Result<Arc<Self>> {
        let runtime =
            Handle::try_current().map_err(|_| RainTreeError::EmptyContextValue("tokio runtime"))?;
        let identity = config.local_id();
        if address_book.snapshot().index_of(&identity).is_none() {
            return Err(RainTreeError::SelfNotInAddressBook(identity));
        }
        Ok(Arc::new(Self {
            identity,
            address_book,
            pool: ConnectionPool::new(connector),
            codec,
            seen: SeenCache::new(config.seen_cache_capacity),
            delivered_sender,
            request_timeout: config.request_timeout(),
            runtime,
            stragglers: DashMap::new(),
            stats: BroadcastStats::default(),
        }))
    }

    /// Identity this engine originates and relays as.
    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// Handle to the book every decision is taken against; replace the
    /// book through it on membership changes.
    pub fn address_book(&self) -> &SharedAddressBook {
        &self.address_book
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Originate a new message.
    ///
    /// Returns as soon as the writes to the first hop are issued; it does
    /// not wait for any acknowledgement. The originator does not deliver its
    /// own message to the module layer.
    pub fn broadcast(self: &Arc<Self>, topic: Topic, payload: Vec<u8>) -> Result<MessageId> {
        let book = self.address_book.snapshot();
        let self_index = self.self_index(&book)?;

        let envelope = Envelope {
            nonce: rand::random(),
            origin: self.identity.clone(),
            level: 0,
            slot: RedundancySlot::First,
            topic,
            payload,
        };
        // Surface an unencodable payload to the caller rather than per target.
        self.codec.encode(&envelope)?;

        let id = envelope.id();
        self.seen.insert(id.clone());
        BroadcastStats::bump(&self.stats.originated);
        info!(
            "{} originating {:?} message nonce={} to {} peers",
            self.identity,
            topic,
            envelope.nonce,
            book.len().saturating_sub(1)
        );

        self.dispatch_tree(&book, Demotion::originate(book.len(), self_index), self_index, &envelope);
        self.dispatch_stragglers(&book, self_index, self_index, &envelope);
        Ok(id)
    }

    /// Handle one frame read off the listener.
    ///
    /// Malformed envelopes are dropped without forwarding or delivery and
    /// returned as protocol errors.
    pub fn handle_incoming(self: &Arc<Self>, bytes: &[u8]) -> Result<HandleOutcome> {
        BroadcastStats::bump(&self.stats.received);
        let envelope = self.codec.decode(bytes).inspect_err(|e| {
            BroadcastStats::bump(&self.stats.malformed);
            warn!("{} dropping undecodable envelope: {}", self.identity, e);
        })?;

        let book = self.address_book.snapshot();
        let depth = max_depth(book.len());
        // Level 0 is only ever acted on by the originator; nothing on the
        // wire carries it.
        if envelope.level == 0 || envelope.level > depth {
            BroadcastStats::bump(&self.stats.malformed);
            warn!(
                "{} dropping envelope from {} with level {} (max {})",
                self.identity, envelope.origin, envelope.level, depth
            );
            return Err(RainTreeError::InvalidLevel {
                level: envelope.level,
                max: depth,
            });
        }
        let self_index = self.self_index(&book)?;

        trace!(
            "{} read {:?} envelope nonce={} level={} from lineage of {}",
            self.identity,
            envelope.slot,
            envelope.nonce,
            envelope.level,
            envelope.origin
        );
        self.dispatch_tree(
            &book,
            Demotion::relay(book.len(), self_index, envelope.level),
            self_index,
            &envelope,
        );

        if !self.seen.insert(envelope.id()) {
            BroadcastStats::bump(&self.stats.duplicates);
            debug!(
                "{} suppressing duplicate nonce={} from {}",
                self.identity, envelope.nonce, envelope.origin
            );
            return Ok(HandleOutcome::Duplicate);
        }

        if let Some(origin_index) = book.index_of(&envelope.origin) {
            self.dispatch_stragglers(&book, origin_index, self_index, &envelope);
        }

        self.delivered_sender
            .send(DeliveredMessage::from(envelope))
            .map_err(|_| RainTreeError::ChannelClosed)?;
        BroadcastStats::bump(&self.stats.delivered);
        Ok(HandleOutcome::Delivered)
    }

    fn self_index(&self, book: &AddressBook) -> Result<usize> {
        book.index_of(&self.identity)
            .ok_or_else(|| RainTreeError::SelfNotInAddressBook(self.identity.clone()))
    }

    /// Issue the writes of every remaining hop of `demotion`.
    fn dispatch_tree(
        self: &Arc<Self>,
        book: &AddressBook,
        demotion: Demotion,
        self_index: usize,
        envelope: &Envelope,
    ) {
        for hop in demotion {
            for (slot, index) in hop.targets.iter() {
                let Some(peer) = book.get(index) else {
                    continue;
                };
                trace!(
                    "{} (#{}) level {} → {} {:?}",
                    self.identity,
                    self_index,
                    hop.level,
                    peer.id,
                    slot
                );
                self.spawn_write(peer.clone(), envelope.forwarded(hop.envelope_level(), slot));
            }
        }
    }

    /// Cover the peers the tree rooted at `origin_index` never reaches and
    /// that fall to `self_index`.
    fn dispatch_stragglers(
        self: &Arc<Self>,
        book: &AddressBook,
        origin_index: usize,
        self_index: usize,
        envelope: &Envelope,
    ) {
        let key = (book.len(), origin_index);
        let cached = self.stragglers.get(&key).map(|edges| Arc::clone(edges.value()));
        let edges = match cached {
            Some(edges) => edges,
            None => {
                let plan = PropagationPlan::compute(book.len(), origin_index);
                let edges: Arc<[Edge]> = plan.straggler_edges().into();
                self.stragglers.insert(key, Arc::clone(&edges));
                edges
            }
        };
        for edge in edges.iter().filter(|e| e.from == self_index) {
            if let Some(peer) = book.get(edge.to) {
                debug!("{} covering straggler {}", self.identity, peer.id);
                self.spawn_write(peer.clone(), envelope.forwarded(edge.level, edge.slot));
            }
        }
    }

    fn spawn_write(self: &Arc<Self>, peer: Peer, envelope: Envelope) {
        let bytes = match self.codec.encode(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                BroadcastStats::bump(&self.stats.send_failures);
                warn!("{} cannot encode envelope for {}: {}", self.identity, peer.id, e);
                return;
            }
        };
        let engine = Arc::clone(self);
        self.runtime.spawn(async move {
            match engine.write_to(&peer, &bytes, envelope.nonce).await {
                Ok(()) => BroadcastStats::bump(&engine.stats.sent),
                Err(e) => {
                    BroadcastStats::bump(&engine.stats.send_failures);
                    engine.pool.evict(&peer.id);
                    warn!(
                        "{} write to {} ({}) failed: {}",
                        engine.identity, peer.id, peer.addr, e
                    );
                }
            }
        });
    }

    async fn write_to(&self, peer: &Peer, bytes: &[u8], nonce: u64) -> Result<()> {
        let write = async {
            let conn = self.pool.get_or_connect(peer).await?;
            conn.write(bytes).await
        };
        tokio::time::timeout(self.request_timeout, write)
            .await
            .map_err(|_| RainTreeError::RequestTimedOut {
                addr: peer.addr,
                nonce,
            })?
    }
}
