//! Error types for the RainTree networking layer.
//!
//! Errors fall into three families: transport errors (isolated to a single
//! target of a single hop), protocol errors (the envelope is dropped), and
//! configuration errors (fatal at startup only).

use {
    crate::{address_book::PeerId, transport::SocketKind},
    std::net::SocketAddr,
    thiserror::Error,
};

/// Errors that can occur in the RainTree networking layer.
#[derive(Error, Debug)]
pub enum RainTreeError {
    /// Failed to encode or decode an envelope.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Encoded envelope exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The envelope carries a demotion level the address book cannot produce.
    #[error("invalid demotion level {level} (max {max})")]
    InvalidLevel {
        /// Level found on the envelope.
        level: u32,
        /// Maximum depth of the current address book.
        max: u32,
    },

    /// The peer is not present in the address book.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Two peer records share an identity but disagree on the address.
    #[error("duplicate peer identity: {0}")]
    DuplicatePeer(PeerId),

    /// The local identity does not appear in the address book.
    #[error("local identity {0} is not in the address book")]
    SelfNotInAddressBook(PeerId),

    /// A configured peer address could not be resolved.
    #[error("unresolvable address {address} for peer {identity}")]
    UnresolvablePeer {
        /// Configured identity.
        identity: String,
        /// Configured address string.
        address: String,
    },

    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A write was not acknowledged in time.
    #[error("socket error: request timed out while waiting on ACK. nonce={nonce}, addr={addr}")]
    RequestTimedOut {
        /// Remote address.
        addr: SocketAddr,
        /// Nonce of the unacknowledged request.
        nonce: u64,
    },

    /// A frame started arriving but did not complete in time.
    #[error("socket error: timed out reading a frame from {addr}")]
    ReadTimedOut {
        /// Remote address.
        addr: SocketAddr,
    },

    /// An earlier write on this connection failed or was cancelled before
    /// its ack was read, so acks on the stream can no longer be matched.
    #[error("socket error: connection to {addr} lost track of its acks")]
    ConnectionPoisoned {
        /// Remote address.
        addr: SocketAddr,
    },

    /// The remote closed the stream.
    #[error("socket error: peer {addr} hung up: {source}")]
    PeerHangUp {
        /// Remote address.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The remote misbehaved or the stream failed in an unexpected way.
    #[error("socket error: unexpected error from {addr}: {source}")]
    Unexpected {
        /// Remote address.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The operation is not defined for this kind of socket.
    #[error("socket error: {op} is undefined for {kind:?} sockets")]
    UnsupportedOperation {
        /// Socket kind the operation was attempted on.
        kind: SocketKind,
        /// Name of the attempted operation.
        op: &'static str,
    },

    /// A required value was missing from a module context.
    #[error("context does not have the value: {0}")]
    EmptyContextValue(&'static str),

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An internal channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// A module failed to start.
    #[error("module {module} failed to start: {reason}")]
    ModuleStart {
        /// Module name.
        module: &'static str,
        /// Failure description.
        reason: String,
    },
}

impl RainTreeError {
    /// Errors that only affect the target they were raised for.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::RequestTimedOut { .. }
                | Self::ReadTimedOut { .. }
                | Self::ConnectionPoisoned { .. }
                | Self::PeerHangUp { .. }
                | Self::Unexpected { .. }
                | Self::UnsupportedOperation { .. }
                | Self::Transport(_)
                | Self::ChannelClosed
        )
    }

    /// Errors that cause an envelope to be dropped.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Serialization(_) | Self::MessageTooLarge { .. } | Self::InvalidLevel { .. }
        )
    }

    /// Errors that can only be raised while building a node.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::DuplicatePeer(_)
                | Self::SelfNotInAddressBook(_)
                | Self::UnresolvablePeer { .. }
                | Self::InvalidConfig(_)
                | Self::EmptyContextValue(_)
        )
    }
}

/// Convenience result type for RainTree operations.
pub type Result<T> = std::result::Result<T, RainTreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_carries_fields() {
        let err = RainTreeError::RequestTimedOut {
            addr: "127.0.0.1:8900".parse().unwrap(),
            nonce: 7,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("nonce=7"));
        assert!(rendered.contains("127.0.0.1:8900"));
        assert!(err.is_transport());
        assert!(!err.is_protocol());
    }

    #[test]
    fn test_error_families() {
        assert!(RainTreeError::InvalidLevel { level: 9, max: 2 }.is_protocol());
        assert!(RainTreeError::DuplicatePeer(PeerId::from("val_01")).is_config());
        let addr: SocketAddr = "127.0.0.1:8900".parse().unwrap();
        assert!(RainTreeError::ReadTimedOut { addr }.is_transport());
        assert!(RainTreeError::ConnectionPoisoned { addr }.is_transport());
        assert!(RainTreeError::UnsupportedOperation {
            kind: SocketKind::Inbound,
            op: "write",
        }
        .is_transport());
    }
}
