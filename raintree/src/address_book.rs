//! Peer identities and the sorted address book.
//!
//! Every node orders the peer set by identity, so any two nodes holding the
//! same set of peers agree on every index. Target selection works purely on
//! those indices.
//!
//! The book is never mutated in place. Membership changes build a new book
//! and swap it into the [`SharedAddressBook`]; a broadcast decision holds on
//! to the snapshot it started with.

use {
    crate::error::{RainTreeError, Result},
    arc_swap::ArcSwap,
    log::info,
    serde::{Deserialize, Serialize},
    std::{fmt, net::SocketAddr, sync::Arc},
};

/// Stable, totally ordered network identity of a validator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// The identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A known peer: identity plus the address its listener is reachable on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Identity that fixes the peer's position in the book.
    pub id: PeerId,
    /// Address of the peer's listener.
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addr,
        }
    }
}

/// Ordered, deduplicated registry of known peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressBook {
    peers: Vec<Peer>,
}

impl AddressBook {
    /// Build a book from an unordered peer list.
    ///
    /// Exact duplicates collapse into one record. Two records with the same
    /// identity and different addresses are rejected.
    pub fn new(mut peers: Vec<Peer>) -> Result<Self> {
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        let mut deduped: Vec<Peer> = Vec::with_capacity(peers.len());
        for peer in peers {
            match deduped.last() {
                Some(last) if last.id == peer.id => {
                    if last.addr != peer.addr {
                        return Err(RainTreeError::DuplicatePeer(peer.id));
                    }
                }
                _ => deduped.push(peer),
            }
        }
        Ok(Self { peers: deduped })
    }

    /// Number of peers, the local node included.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peer at `index` in identity order.
    pub fn get(&self, index: usize) -> Option<&Peer> {
        self.peers.get(index)
    }

    /// Position of `id` in the sorted book.
    pub fn index_of(&self, id: &PeerId) -> Option<usize> {
        self.peers.binary_search_by(|p| p.id.cmp(id)).ok()
    }

    /// Look up a peer by identity.
    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.index_of(id).and_then(|i| self.peers.get(i))
    }

    /// Peers in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }
}

/// Shared handle to the current address book.
///
/// Readers take a snapshot and keep it for the whole of one forwarding
/// decision; writers replace the book wholesale.
#[derive(Debug, Clone)]
pub struct SharedAddressBook {
    inner: Arc<ArcSwap<AddressBook>>,
}

impl SharedAddressBook {
    pub fn new(book: AddressBook) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(book)),
        }
    }

    /// The book as of now. Later replacements do not affect the snapshot.
    pub fn snapshot(&self) -> Arc<AddressBook> {
        self.inner.load_full()
    }

    /// Swap in a rebuilt book after a membership change.
    pub fn replace(&self, book: AddressBook) {
        info!(
            "address book update: {} → {} peers",
            self.inner.load().len(),
            book.len()
        );
        self.inner.store(Arc::new(book));
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    fn peer(id: &str, port: u16) -> Peer {
        Peer::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_ordering_is_independent_of_input_order() {
        let a = AddressBook::new(vec![peer("val_03", 3), peer("val_01", 1), peer("val_02", 2)])
            .unwrap();
        let b = AddressBook::new(vec![peer("val_02", 2), peer("val_03", 3), peer("val_01", 1)])
            .unwrap();
        assert_eq!(a, b);
        let ids: Vec<_> = a.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["val_01", "val_02", "val_03"]);
    }

    #[test]
    fn test_exact_duplicates_collapse() {
        let book = AddressBook::new(vec![peer("val_01", 1), peer("val_01", 1)]).unwrap();
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_conflicting_duplicate_rejected() {
        assert_matches!(
            AddressBook::new(vec![peer("val_01", 1), peer("val_01", 2)]),
            Err(RainTreeError::DuplicatePeer(id)) if id.as_str() == "val_01"
        );
    }

    #[test]
    fn test_lookup() {
        let book = AddressBook::new(vec![peer("b", 2), peer("a", 1)]).unwrap();
        assert_eq!(book.index_of(&PeerId::from("b")), Some(1));
        assert_eq!(book.peer(&PeerId::from("a")).unwrap().addr.port(), 1);
        assert!(book.index_of(&PeerId::from("c")).is_none());
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let shared = SharedAddressBook::new(AddressBook::new(vec![peer("a", 1)]).unwrap());
        let before = shared.snapshot();
        shared.replace(AddressBook::new(vec![peer("a", 1), peer("b", 2)]).unwrap());
        assert_eq!(before.len(), 1);
        assert_eq!(shared.snapshot().len(), 2);
    }
}
