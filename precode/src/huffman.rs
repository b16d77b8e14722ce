use co_sort::{co_sort, Permutation};

/// Canonical code shape built from value frequencies: the order of values
/// (most frequent first) and the number of internal nodes of each tree level
/// (the root is not counted; the last entry is zero).
///
/// The maximum codeword length equals `internal_counts.len()`.
pub(crate) struct Canonical {
    /// Indices of the input entries, from the most frequent to the least.
    pub order: Box<[u32]>,
    pub internal_counts: Box<[u32]>,
}

/// Builds the canonical Huffman shape for the given frequencies,
/// using the in-place two-pass algorithm: the first pass pairs the two
/// lightest items and stores parent pointers in the consumed slots,
/// the second pass turns parent pointers into depths.
pub(crate) fn canonical_from_freqs(freqs: &[u64]) -> Canonical {
    let len = freqs.len();
    let mut freq: Vec<u64> = freqs.to_vec();
    let mut order: Vec<u32> = (0..len as u32).collect();
    co_sort!(freq, order);
    order.reverse();

    if len <= 2 {
        return Canonical {
            order: order.into_boxed_slice(),
            internal_counts: vec![0u32].into_boxed_slice(),
        };
    }

    let internal_nodes_size = len - 1;
    let mut internals_begin = 0usize; // first internal node = next parent node to be used
    let mut leafs_begin = 0usize;     // next leaf to be used
    for next in 0..internal_nodes_size {
        // first child
        if leafs_begin >= len || (internals_begin < next && freq[internals_begin] < freq[leafs_begin]) {
            freq[next] = freq[internals_begin];
            freq[internals_begin] = next as u64;
            internals_begin += 1;
        } else {
            freq[next] = freq[leafs_begin];
            leafs_begin += 1;
        }
        // second child
        if leafs_begin >= len || (internals_begin < next && freq[internals_begin] < freq[leafs_begin]) {
            freq[next] += freq[internals_begin];
            freq[internals_begin] = next as u64;
            internals_begin += 1;
        } else {
            freq[next] += freq[leafs_begin];
            leafs_begin += 1;
        }
    }

    // second pass, right to left, setting internal depths; also find the maximum depth
    let mut max_depth = 0u8;
    freq[internal_nodes_size - 1] = 0; // the root
    for next in (0..internal_nodes_size - 1).rev() {
        freq[next] = freq[freq[next] as usize] + 1;
        if freq[next] as u8 > max_depth { max_depth = freq[next] as u8; }
    }

    let mut internal_counts = vec![0u32; max_depth as usize + 1].into_boxed_slice();
    for i in 0..internal_nodes_size - 1 {
        internal_counts[freq[i] as usize - 1] += 1; // only the root is at level 0, it is skipped
    }   // no internal nodes at the last level, internal_counts[max_depth] stays 0

    Canonical { order: order.into_boxed_slice(), internal_counts }
}

/// Calls `f` for each leaf of the canonical tree, in canonical order.
/// Arguments of `f` are: leaf sequence number, level (counting from 0),
/// number of internal nodes at the level, and index of the leaf at the level.
pub(crate) fn for_each_leaf<F>(internal_counts: &[u32], leaf_count: usize, mut f: F)
    where F: FnMut(usize, u8, u32, u32)
{
    let mut level_size = 2u32;
    let mut leaf_seq = 0usize;
    for level in 0..internal_counts.len() as u8 {
        let internal = internal_counts[level as usize];
        for leaf_index in 0..level_size - internal {
            if leaf_seq >= leaf_count { return; }
            f(leaf_seq, level, internal, leaf_index);
            leaf_seq += 1;
        }
        level_size = internal << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_3_values() {
        //  /  \
        // /\  a
        // bc
        let c = canonical_from_freqs(&[100, 50, 10]); // a, b, c
        assert_eq!(c.order.as_ref(), [0, 1, 2]);
        assert_eq!(c.internal_counts.as_ref(), [1, 0]);
    }

    #[test]
    fn shape_6_values() {
        //     /   \
        //   /  \  /\
        //  / \ d  ef
        // /\ a
        // bc
        let c = canonical_from_freqs(&[3, 2, 1, 12, 11, 10]); // a, b, c, d, e, f
        assert_eq!(c.order.as_ref(), [3, 4, 5, 0, 1, 2]);
        assert_eq!(c.internal_counts.as_ref(), [2, 1, 1, 0]);
    }

    #[test]
    fn leaf_walk() {
        let c = canonical_from_freqs(&[3, 2, 1, 12, 11, 10]);
        let mut lens = Vec::new();
        for_each_leaf(&c.internal_counts, c.order.len(), |_, level, _, _| lens.push(level + 1));
        assert_eq!(lens, [2, 2, 2, 3, 4, 4]);
    }
}
