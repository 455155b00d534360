//! TRv1 RainTree Broadcast
//!
//! This crate propagates a message from any validator to every other
//! validator with a deterministic, tree-shaped fan-out instead of a flood:
//!
//! - **Target selection**: each hop forwards to the peers one third and two
//!   thirds of the way into a window of the sorted address book. The window
//!   starts at the forwarding node and shrinks to two thirds of its size on
//!   every level.
//! - **Demotion**: after forwarding at one level a node repeats the
//!   selection one level deeper. The depth is bounded by `ceil(log3(N))`,
//!   which guarantees termination.
//! - **Straggler cleanup**: peers the shrinking windows never land on are
//!   covered directly by their nearest covered predecessor.
//! - **Delivery**: every node hands a message to the module layer at most
//!   once, keyed by original sender and nonce.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────┐
//!  │  Consensus / Utility modules                    │
//!  │  ← DeliveredMessage          → broadcast()      │
//!  └──────────────▲────────────────────┬─────────────┘
//!                 │  EventRouter       │
//!  ┌──────────────┴────────────────────▼─────────────┐
//!  │  BroadcastEngine                                │
//!  │  • Demotion / selector: who to write to         │
//!  │  • SeenCache: deliver once                      │
//!  └──────┬───────────────────────────────▲──────────┘
//!         │ ConnectionPool                │ listener loop
//!  ┌──────▼───────────────────────────────┴──────────┐
//!  │  Transport (TCP, framed + acknowledged)         │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`address_book`] | Peer identities, sorted book, snapshot handle |
//! | [`selector`]     | Per-level target selection |
//! | [`demotion`]     | Per-envelope level walk |
//! | [`plan`]         | Whole-tree plan and straggler assignment |
//! | [`engine`]       | Broadcast origination, forwarding, delivery |
//! | [`envelope`]     | Wire envelope and topics |
//! | [`codec`]        | Envelope encoding and stream framing |
//! | [`transport`]    | Connection trait, pool, TCP implementation |
//! | [`module`]       | Module lifecycle and the p2p module |
//! | [`node`]         | Node context, ordered startup, event routing |
//! | [`config`]       | `RainTreeConfig` defaults and TOML loading |
//! | [`error`]        | Crate-wide error enum |

pub mod address_book;
pub mod codec;
pub mod config;
pub mod demotion;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod module;
pub mod node;
pub mod plan;
pub mod seen;
pub mod selector;
#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod test_utils;
pub mod transport;

pub use {
    address_book::{AddressBook, Peer, PeerId, SharedAddressBook},
    config::RainTreeConfig,
    engine::{BroadcastEngine, HandleOutcome},
    envelope::{DeliveredMessage, Envelope, MessageId, RedundancySlot, Topic},
    error::{RainTreeError, Result},
};
