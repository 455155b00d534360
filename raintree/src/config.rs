//! Configuration for the RainTree networking layer.

use {
    crate::{
        address_book::{AddressBook, Peer, PeerId},
        error::{RainTreeError, Result},
    },
    serde::Deserialize,
    std::{
        net::{SocketAddr, ToSocketAddrs},
        time::Duration,
    },
};

/// A statically configured peer, resolved when the address book is built.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Stable network identity used to order the address book.
    pub identity: String,
    /// `host:port` the peer's listener is reachable on.
    pub address: String,
}

/// Configuration for a RainTree node.
///
/// Controls the local identity, listener, peer set, and the limits applied
/// to every read and write on a transport connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RainTreeConfig {
    /// Identity of the local node. Must appear in `peers`.
    pub identity: String,

    /// Local address to bind the listener on.
    /// Default: `0.0.0.0:8901`
    pub bind_addr: SocketAddr,

    /// Every validator taking part in broadcast, the local node included.
    pub peers: Vec<PeerConfig>,

    /// Upper bound on a single write, acknowledgement included (ms).
    pub request_timeout_ms: u64,

    /// Maximum size of a single encoded envelope in bytes.
    pub max_message_size: usize,

    /// Size of the inbound frame channel buffer.
    pub channel_buffer_size: usize,

    /// How many message ids are remembered for duplicate suppression.
    pub seen_cache_capacity: usize,
}

impl Default for RainTreeConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8901)),
            peers: Vec::new(),
            request_timeout_ms: 5_000,
            max_message_size: 1_048_576, // 1 MB
            channel_buffer_size: 10_000,
            seen_cache_capacity: 100_000,
        }
    }
}

impl RainTreeConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            identity: String::new(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            peers: Vec::new(),
            request_timeout_ms: 1_000,
            max_message_size: 1_048_576,
            channel_buffer_size: 1_000,
            seen_cache_capacity: 1_000,
        }
    }

    /// Parse a config from TOML. Missing fields take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RainTreeError::InvalidConfig(e.to_string()))
    }

    /// Bound on one write and its ack, and on reading one started frame.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The configured identity as a [`PeerId`].
    pub fn local_id(&self) -> PeerId {
        PeerId::from(self.identity.as_str())
    }

    /// Resolve every configured peer and build the sorted address book.
    ///
    /// Fails if an address cannot be resolved, if two records disagree on
    /// an identity, or if the local identity is missing.
    pub fn build_address_book(&self) -> Result<AddressBook> {
        if self.identity.is_empty() {
            return Err(RainTreeError::EmptyContextValue("identity"));
        }
        let peers = self
            .peers
            .iter()
            .map(resolve_peer)
            .collect::<Result<Vec<_>>>()?;
        let book = AddressBook::new(peers)?;
        let local = self.local_id();
        if book.index_of(&local).is_none() {
            return Err(RainTreeError::SelfNotInAddressBook(local));
        }
        Ok(book)
    }
}

fn resolve_peer(peer: &PeerConfig) -> Result<Peer> {
    let unresolvable = || RainTreeError::UnresolvablePeer {
        identity: peer.identity.clone(),
        address: peer.address.clone(),
    };
    let addr = peer
        .address
        .to_socket_addrs()
        .map_err(|_| unresolvable())?
        .next()
        .ok_or_else(unresolvable)?;
    Ok(Peer::new(peer.identity.as_str(), addr))
}
