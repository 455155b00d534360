//! RainTree target selection.
//!
//! A node acting at level `L` looks at a window of the sorted address book
//! that starts at its own position and spans `floor(N * (2/3)^L)` peers. It
//! forwards to the peers sitting one third and two thirds of the way into
//! that window. Each target receives the envelope at `L + 1` and repeats the
//! computation from its own position, so no routing table is ever shared.
//!
//! Offsets are taken modulo the full book, not the window: windows wrap
//! around the ring, which is how deep branches can land back on the
//! originator.
//!
//! Propagation stops once a node reaches `max_depth(N) = ceil(log3(N))`.

use crate::envelope::RedundancySlot;

/// Number of levels a message descends before every hop is terminal.
pub fn max_depth(book_len: usize) -> u32 {
    let mut depth = 0u32;
    let mut reach = 1usize;
    while reach < book_len {
        reach = reach.saturating_mul(3);
        depth = depth.saturating_add(1);
    }
    depth
}

/// Size of the window a node covers at `level`: `floor(N * 2^level / 3^level)`.
pub fn view_len(book_len: usize, level: u32) -> usize {
    let (Some(num), Some(den)) = (2u128.checked_pow(level), 3u128.checked_pow(level)) else {
        return 0;
    };
    (book_len as u128)
        .checked_mul(num)
        .and_then(|n| n.checked_div(den))
        .map_or(0, |v| v as usize)
}

/// Targets a node must write to at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetSelection {
    /// Index of the one-third target, if it is not the acting node.
    pub first: Option<usize>,
    /// Index of the two-thirds target, if distinct from the acting node and `first`.
    pub second: Option<usize>,
    /// Whether the acting node still has a deeper level to act at.
    pub should_shrink_further: bool,
}

impl TargetSelection {
    /// Targets in slot order.
    pub fn iter(self) -> impl Iterator<Item = (RedundancySlot, usize)> {
        let first = self.first.map(|i| (RedundancySlot::First, i));
        let second = self.second.map(|i| (RedundancySlot::Second, i));
        first.into_iter().chain(second)
    }

    /// Whether the acting node has nobody to write to at this level.
    pub fn is_empty(&self) -> bool {
        self.first.is_none() && self.second.is_none()
    }
}

/// Compute the targets for the node at `origin_index` acting at `level`.
///
/// Never fails: an out-of-range index or a level at or past the maximum
/// depth yields an empty, terminal selection.
pub fn select_target_indices(book_len: usize, origin_index: usize, level: u32) -> TargetSelection {
    let depth = max_depth(book_len);
    if origin_index >= book_len || level >= depth {
        return TargetSelection::default();
    }

    let view = view_len(book_len, level);
    let offset = |numerator: usize| {
        let shift = view.saturating_mul(numerator) / 3;
        origin_index
            .checked_add(shift)
            .and_then(|i| i.checked_rem(book_len))
            .filter(|&i| i != origin_index)
    };

    let first = offset(1);
    let second = offset(2).filter(|&i| Some(i) != first);
    TargetSelection {
        first,
        second,
        should_shrink_further: level.saturating_add(1) < depth,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test_case(0, 0)]
    #[test_case(1, 0)]
    #[test_case(2, 1)]
    #[test_case(3, 1)]
    #[test_case(4, 2)]
    #[test_case(9, 2)]
    #[test_case(10, 3)]
    #[test_case(18, 3)]
    #[test_case(27, 3)]
    #[test_case(28, 4)]
    fn test_max_depth(len: usize, depth: u32) {
        assert_eq!(max_depth(len), depth);
    }

    #[test]
    fn test_view_len_is_exact() {
        assert_eq!(view_len(18, 0), 18);
        assert_eq!(view_len(18, 1), 12);
        // 18 * 4 / 9 is exactly 8; a float pow can land on 7.999...
        assert_eq!(view_len(18, 2), 8);
        assert_eq!(view_len(27, 2), 12);
        assert_eq!(view_len(4, 1), 2);
        assert_eq!(view_len(7, 2), 3);
    }

    #[test]
    fn test_single_node_never_forwards() {
        let sel = select_target_indices(1, 0, 0);
        assert!(sel.is_empty());
        assert!(!sel.should_shrink_further);
    }

    #[test]
    fn test_two_nodes_skip_self() {
        let sel = select_target_indices(2, 0, 0);
        assert_eq!(sel.first, None);
        assert_eq!(sel.second, Some(1));
        assert!(!sel.should_shrink_further);
    }

    #[test]
    fn test_nine_nodes_root() {
        let sel = select_target_indices(9, 0, 0);
        assert_eq!((sel.first, sel.second), (Some(3), Some(6)));
        assert!(sel.should_shrink_further);

        let sel = select_target_indices(9, 0, 1);
        assert_eq!((sel.first, sel.second), (Some(2), Some(4)));
        assert!(!sel.should_shrink_further);
    }

    #[test]
    fn test_wraps_around_ring() {
        // val_17 at level 2 of an 18 node book reaches back to val_01.
        let sel = select_target_indices(18, 16, 2);
        assert_eq!((sel.first, sel.second), (Some(0), Some(3)));
    }

    #[test]
    fn test_past_depth_is_terminal() {
        assert!(select_target_indices(9, 4, 2).is_empty());
        assert!(select_target_indices(9, 12, 0).is_empty());
    }

    #[test]
    fn test_iter_slots() {
        let sel = select_target_indices(9, 0, 0);
        let got: Vec<_> = sel.iter().collect();
        assert_eq!(
            got,
            [(RedundancySlot::First, 3), (RedundancySlot::Second, 6)]
        );
    }
}
