//! Per-envelope demotion state machine.
//!
//! After writing to its targets at level `L`, a node demotes itself to
//! `L + 1` and writes again to the targets of the smaller window, until it
//! runs out of depth. The walk is the same whether the node authored the
//! message or received it; only the starting level differs.
//!
//! ```text
//! Originating ──▶ Relaying(1) ──▶ Relaying(2) ──▶ … ──▶ Terminal
//!                 Relaying(L) ──────────────────────────▶ Terminal
//! ```

use crate::selector::{max_depth, select_target_indices, TargetSelection};

/// Where a node is in its walk for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemotionState {
    /// Author of the message, about to act at level 0.
    Originating,
    /// About to act at `level`.
    Relaying { level: u32 },
    /// No level left to act at. The node only delivers locally.
    Terminal,
}

/// Writes issued at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    /// Level the node acted at.
    pub level: u32,
    /// Peers written to at `level`.
    pub targets: TargetSelection,
}

impl Hop {
    /// Level carried by the envelopes written at this hop.
    pub fn envelope_level(&self) -> u32 {
        self.level.saturating_add(1)
    }
}

/// Iterator over the hops one node performs for one envelope.
///
/// Created fresh for every envelope and discarded once exhausted.
#[derive(Debug, Clone)]
pub struct Demotion {
    book_len: usize,
    self_index: usize,
    max_depth: u32,
    state: DemotionState,
}

impl Demotion {
    /// Walk for the author of a new message.
    pub fn originate(book_len: usize, self_index: usize) -> Self {
        let mut demotion = Self {
            book_len,
            self_index,
            max_depth: max_depth(book_len),
            state: DemotionState::Originating,
        };
        if demotion.max_depth == 0 {
            demotion.state = DemotionState::Terminal;
        }
        demotion
    }

    /// Walk for a node that received an envelope carrying `level`.
    pub fn relay(book_len: usize, self_index: usize, level: u32) -> Self {
        let depth = max_depth(book_len);
        let state = if level < depth {
            DemotionState::Relaying { level }
        } else {
            DemotionState::Terminal
        };
        Self {
            book_len,
            self_index,
            max_depth: depth,
            state,
        }
    }

    /// State the next call to `next` acts on.
    pub fn state(&self) -> DemotionState {
        self.state
    }

    /// Depth of the book this walk was created for.
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }
}

impl Iterator for Demotion {
    type Item = Hop;

    fn next(&mut self) -> Option<Hop> {
        let level = match self.state {
            DemotionState::Originating => 0,
            DemotionState::Relaying { level } => level,
            DemotionState::Terminal => return None,
        };
        let targets = select_target_indices(self.book_len, self.self_index, level);
        self.state = if targets.should_shrink_further {
            DemotionState::Relaying {
                level: level.saturating_add(1),
            }
        } else {
            DemotionState::Terminal
        };
        Some(Hop { level, targets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_is_terminal_immediately() {
        let mut demotion = Demotion::originate(1, 0);
        assert_eq!(demotion.state(), DemotionState::Terminal);
        assert!(demotion.next().is_none());
    }

    #[test]
    fn test_originator_walks_every_level() {
        let demotion = Demotion::originate(27, 0);
        let levels: Vec<_> = demotion.map(|hop| hop.level).collect();
        assert_eq!(levels, [0, 1, 2]);
    }

    #[test]
    fn test_transitions() {
        let mut demotion = Demotion::originate(9, 0);
        assert_eq!(demotion.state(), DemotionState::Originating);
        let hop = demotion.next().unwrap();
        assert_eq!(hop.envelope_level(), 1);
        assert_eq!(demotion.state(), DemotionState::Relaying { level: 1 });
        demotion.next().unwrap();
        assert_eq!(demotion.state(), DemotionState::Terminal);
        assert!(demotion.next().is_none());
    }

    #[test]
    fn test_relay_resumes_at_received_level() {
        let hops: Vec<_> = Demotion::relay(9, 3, 1).collect();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].targets.first, Some(5));
        assert_eq!(hops[0].targets.second, Some(7));
    }

    #[test]
    fn test_relay_at_max_depth_is_terminal() {
        let demotion = Demotion::relay(9, 3, 2);
        assert_eq!(demotion.state(), DemotionState::Terminal);
        assert_eq!(demotion.count(), 0);
    }
}
