//! Hinge assignment for residual 3-hyperedges.
//!
//! Each residual edge must receive a distinct vertex among its three (the
//! *hinge*); the hinge's position becomes the known term of the edge's F₃
//! equation. Finding such an assignment is a bipartite matching that must
//! saturate all edges; augmenting paths find one whenever it exists.

/// Returns the hinge position (0..3) per edge, with all hinge vertices
/// distinct, or [`None`] if no such assignment exists.
pub(crate) fn orient(edges: &[[u32; 3]], var_count: usize) -> Option<Vec<u8>> {
    let mut matched: Vec<u32> = vec![u32::MAX; var_count]; // vertex -> edge
    let mut hinge = vec![0u8; edges.len()];
    let mut stamp = vec![0u32; var_count];
    for e in 0..edges.len() {
        if !augment(e as u32, edges, &mut matched, &mut hinge, &mut stamp, e as u32 + 1) {
            return None;
        }
    }
    Some(hinge)
}

fn augment(
    e: u32,
    edges: &[[u32; 3]],
    matched: &mut [u32],
    hinge: &mut [u8],
    stamp: &mut [u32],
    round: u32,
) -> bool {
    for p in 0..3 {
        let v = edges[e as usize][p] as usize;
        if stamp[v] == round { continue; }
        stamp[v] = round;
        let owner = matched[v];
        if owner == u32::MAX || augment(owner, edges, matched, hinge, stamp, round) {
            matched[v] = e;
            hinge[e as usize] = p as u8;
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_injective(edges: &[[u32; 3]], hinge: &[u8]) {
        let mut seen = std::collections::HashSet::new();
        for (e, &p) in hinge.iter().enumerate() {
            assert!(seen.insert(edges[e][p as usize]), "hinge vertex reused");
        }
    }

    #[test]
    fn orients_when_possible() {
        let edges = [[0u32, 1, 2], [0, 1, 2], [0, 1, 2]];
        let hinge = orient(&edges, 3).expect("three edges over three vertices");
        check_injective(&edges, &hinge);
    }

    #[test]
    fn requires_augmenting() {
        // edge 2 only fits on vertex 3, forcing reassignment down the chain
        let edges = [[0u32, 1, 2], [1, 2, 3], [2, 3, 3], [0, 1, 2]];
        let hinge = orient(&edges, 4).expect("a perfect assignment exists");
        check_injective(&edges, &hinge);
    }

    #[test]
    fn detects_impossible() {
        // four edges over three vertices
        let edges = [[0u32, 1, 2], [0, 1, 2], [0, 1, 2], [0, 1, 2]];
        assert!(orient(&edges, 3).is_none());
    }

    #[test]
    fn duplicated_vertices() {
        let edges = [[0u32, 0, 0], [1, 1, 0]];
        let hinge = orient(&edges, 2).expect("vertex per edge exists");
        check_injective(&edges, &hinge);
    }
}
