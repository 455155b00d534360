//! Whole-tree propagation plan.
//!
//! The tree is a pure function of the book size and the originator's
//! position, so any node can rebuild it. The engine uses the plan to find
//! stragglers: peers the shrinking windows never land on for a given book
//! size. Each straggler is assigned to the closest covered peer before it
//! on the ring, which writes to it once, at the terminal level, when it
//! first accepts the message.

use {
    crate::{demotion::Demotion, envelope::RedundancySlot, selector::max_depth},
    std::collections::VecDeque,
};

/// One write in the propagation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    /// Level carried by the envelope.
    pub level: u32,
    pub slot: RedundancySlot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationPlan {
    edges: Vec<Edge>,
    stragglers: Vec<Edge>,
}

impl PropagationPlan {
    /// Rebuild the tree rooted at `origin` over a book of `book_len` peers.
    pub fn compute(book_len: usize, origin: usize) -> Self {
        if origin >= book_len {
            return Self {
                edges: Vec::new(),
                stragglers: Vec::new(),
            };
        }

        let mut covered = vec![false; book_len];
        covered[origin] = true;
        let mut edges = Vec::new();
        let mut pending = VecDeque::from([(origin, Demotion::originate(book_len, origin))]);

        while let Some((from, demotion)) = pending.pop_front() {
            for hop in demotion {
                let level = hop.envelope_level();
                for (slot, to) in hop.targets.iter() {
                    edges.push(Edge {
                        from,
                        to,
                        level,
                        slot,
                    });
                    covered[to] = true;
                    pending.push_back((to, Demotion::relay(book_len, to, level)));
                }
            }
        }

        let terminal = max_depth(book_len);
        let stragglers = (0..book_len)
            .filter(|&to| !covered[to])
            .filter_map(|to| {
                let from = (1..book_len)
                    .filter_map(|back| to.checked_add(book_len)?.checked_sub(back)?.checked_rem(book_len))
                    .find(|&i| covered[i])?;
                Some(Edge {
                    from,
                    to,
                    level: terminal,
                    slot: RedundancySlot::Straggler,
                })
            })
            .collect();

        Self {
            edges,
            stragglers,
        }
    }

    /// Writes issued by the shrinking-window walk.
    pub fn tree_edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Direct writes covering peers the walk misses.
    pub fn straggler_edges(&self) -> &[Edge] {
        &self.stragglers
    }

    /// Inbound envelope count per peer, stragglers included.
    pub fn inbound_counts(&self, book_len: usize) -> Vec<usize> {
        let mut counts = vec![0usize; book_len];
        for edge in self.edges.iter().chain(&self.stragglers) {
            if let Some(count) = counts.get_mut(edge.to) {
                *count = count.saturating_add(1);
            }
        }
        counts
    }
}
