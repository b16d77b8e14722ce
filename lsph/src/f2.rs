//! Lazy Gaussian elimination over F₂.
//!
//! Equations are bitset rows over the bucket's variable space with a 64-bit
//! known term; xor-ing two equations xors both. Elimination defers dense work:
//! variables stay *idle* until no equation with at most one idle variable is
//! left, then the heaviest idle variable is committed to the dense core.

use std::collections::VecDeque;

use bitwords::{BitAccess, BitVec, ceiling_div};

pub(crate) struct F2Row {
    bits: Box<[u64]>,
    pub c: u64,
}

impl F2Row {
    pub fn new(var_count: usize) -> Self {
        Self { bits: Box::with_zeroed_bits(var_count.max(1)), c: 0 }
    }

    /// Flips the coefficient of `v`; adding a variable twice removes it.
    #[inline] pub fn toggle(&mut self, v: u32) {
        self.bits[v as usize / 64] ^= 1u64 << (v % 64);
    }

    #[inline] fn xor_in(&mut self, other_bits: &[u64], other_c: u64) {
        for (a, b) in self.bits.iter_mut().zip(other_bits) { *a ^= *b; }
        self.c ^= other_c;
    }

    #[inline] fn idle_count(&self, idle: &[u64]) -> u32 {
        self.bits.iter().zip(idle).map(|(b, i)| (b & i).count_ones()).sum()
    }

    #[inline] fn first_idle(&self, idle: &[u64]) -> Option<u32> {
        for (w, (b, i)) in self.bits.iter().zip(idle).enumerate() {
            let x = b & i;
            if x != 0 { return Some((w * 64) as u32 + x.trailing_zeros()); }
        }
        None
    }

    #[inline] fn is_zero(&self) -> bool { self.bits.iter().all(|w| *w == 0) }

    #[inline] fn first_var(&self) -> Option<u32> {
        for (w, b) in self.bits.iter().enumerate() {
            if *b != 0 { return Some((w * 64) as u32 + b.trailing_zeros()); }
        }
        None
    }

    fn for_each_var(&self, mut f: impl FnMut(u32)) {
        for (w, bits) in self.bits.iter().enumerate() {
            let mut b = *bits;
            while b != 0 {
                f((w * 64) as u32 + b.trailing_zeros());
                b &= b - 1;
            }
        }
    }
}

const ACTIVE: u8 = 0;
const QUEUED: u8 = 1;
const DONE: u8 = 2;

/// Solves the system, returning a value per variable (unconstrained variables
/// get 0), or [`None`] if the system is unsolvable.
pub(crate) fn solve_f2(mut rows: Vec<F2Row>, var_count: usize) -> Option<Vec<u64>> {
    let words = ceiling_div(var_count.max(1), 64);
    let mut weight = vec![0u32; var_count];
    for r in &rows { r.for_each_var(|v| weight[v as usize] += 1); }

    // heavy candidates: by descending initial weight, index as the tie-break
    let mut by_weight: Vec<u32> = (0..var_count as u32).filter(|&v| weight[v as usize] > 0).collect();
    by_weight.sort_unstable_by_key(|&v| (std::cmp::Reverse(weight[v as usize]), v));
    let mut heavy_scan = 0usize;

    let mut idle = vec![0u64; words];
    for &v in &by_weight { idle.set_bit(v as usize); }

    let mut state = vec![ACTIVE; rows.len()];
    let mut queue: VecDeque<usize> = VecDeque::new();
    for (r, row) in rows.iter().enumerate() {
        if row.idle_count(&idle) <= 1 {
            state[r] = QUEUED;
            queue.push_back(r);
        }
    }

    let mut solved: Vec<(u32, usize)> = Vec::new();
    let mut dense: Vec<usize> = Vec::new();

    loop {
        if let Some(r) = queue.pop_front() {
            state[r] = DONE;
            match rows[r].first_idle(&idle) {
                None => {
                    if rows[r].is_zero() {
                        if rows[r].c != 0 { return None; }
                        // trivial equation, drop it
                    } else {
                        dense.push(r);
                    }
                }
                Some(x) => {
                    // x becomes a pivot; eliminate it from every other equation
                    idle[x as usize / 64] &= !(1u64 << (x % 64));
                    solved.push((x, r));
                    let pivot_bits = rows[r].bits.clone();
                    let pivot_c = rows[r].c;
                    for r2 in 0..rows.len() {
                        if state[r2] == DONE || !rows[r2].bits.get_bit(x as usize) { continue; }
                        rows[r2].xor_in(&pivot_bits, pivot_c);
                        if state[r2] == ACTIVE && rows[r2].idle_count(&idle) <= 1 {
                            state[r2] = QUEUED;
                            queue.push_back(r2);
                        }
                    }
                }
            }
        } else {
            // no equation with at most one idle variable: commit the heaviest
            // idle variable to the dense core
            while heavy_scan < by_weight.len()
                && !idle.get_bit(by_weight[heavy_scan] as usize) { heavy_scan += 1; }
            let Some(&x) = by_weight.get(heavy_scan) else { break };
            heavy_scan += 1;
            idle[x as usize / 64] &= !(1u64 << (x % 64));
            for r2 in 0..rows.len() {
                if state[r2] == ACTIVE && rows[r2].bits.get_bit(x as usize)
                    && rows[r2].idle_count(&idle) <= 1
                {
                    state[r2] = QUEUED;
                    queue.push_back(r2);
                }
            }
        }
    }

    let mut sol = vec![0u64; var_count];

    // plain Gaussian elimination on the dense core (all its variables are heavy)
    let mut dense_solved: Vec<(u32, usize)> = Vec::new();
    for i in 0..dense.len() {
        let r = dense[i];
        let Some(pivot) = rows[r].first_var() else {
            if rows[r].c != 0 { return None; }
            continue;
        };
        dense_solved.push((pivot, r));
        let pivot_bits = rows[r].bits.clone();
        let pivot_c = rows[r].c;
        for &r2 in &dense[i+1..] {
            if rows[r2].bits.get_bit(pivot as usize) {
                rows[r2].xor_in(&pivot_bits, pivot_c);
            }
        }
    }
    for &(x, r) in dense_solved.iter().rev() {
        let mut v = rows[r].c;
        rows[r].for_each_var(|u| if u != x { v ^= sol[u as usize] });
        sol[x as usize] = v;
    }

    // back-substitute the lazily solved equations in reverse order
    for &(x, r) in solved.iter().rev() {
        let mut v = rows[r].c;
        rows[r].for_each_var(|u| if u != x { v ^= sol[u as usize] });
        sol[x as usize] = v;
    }

    Some(sol)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solve(eqs: &[(&[u32], u64)], var_count: usize) -> Option<Vec<u64>> {
        let rows = eqs.iter().map(|(vars, c)| {
            let mut r = F2Row::new(var_count);
            for &v in *vars { r.toggle(v); }
            r.c = *c;
            r
        }).collect();
        solve_f2(rows, var_count)
    }

    fn check(eqs: &[(&[u32], u64)], var_count: usize) {
        let sol = solve(eqs, var_count).expect("system should be solvable");
        for (vars, c) in eqs {
            let mut v = 0;
            for &x in *vars { v ^= sol[x as usize]; }
            assert_eq!(v, *c, "equation {:?} = {} violated", vars, c);
        }
    }

    #[test]
    fn small_systems() {
        check(&[(&[0], 7)], 1);
        check(&[(&[0, 1], 1), (&[1, 2], 2), (&[0, 2], 3)], 3);
        check(&[(&[0, 1, 2], 5), (&[1, 2, 3], 6), (&[0, 2, 3], 7), (&[0, 1, 3], 1)], 4);
    }

    #[test]
    fn unsolvable() {
        // x0 ^ x1 both 1 and 2 at once
        assert!(solve(&[(&[0, 1], 1), (&[0, 1], 2)], 2).is_none());
        // empty equation with nonzero term
        assert!(solve(&[(&[], 1)], 1).is_none());
        // duplicated variable cancels, leaving 0 = 1
        assert!(solve(&[(&[0, 0], 1)], 1).is_none());
    }

    #[test]
    fn redundant_equations() {
        check(&[(&[0, 1], 3), (&[0, 1], 3)], 2);
        check(&[(&[], 0), (&[0], 9)], 1);
    }

    #[test]
    fn forces_dense_core() {
        // a cycle structure whose 2-core is nonempty: every variable has degree 2
        let eqs: Vec<(Vec<u32>, u64)> = (0..16u32)
            .map(|i| (vec![i, (i + 1) % 16, (i + 5) % 16], (i as u64 * 37) & 0xFF))
            .collect();
        let eqs: Vec<(&[u32], u64)> = eqs.iter().map(|(v, c)| (v.as_slice(), *c)).collect();
        if let Some(sol) = solve_f2(
            eqs.iter().map(|(vars, c)| {
                let mut r = F2Row::new(16);
                for &v in *vars { r.toggle(v); }
                r.c = *c;
                r
            }).collect(), 16)
        {
            for (vars, c) in &eqs {
                let mut v = 0;
                for &x in *vars { v ^= sol[x as usize]; }
                assert_eq!(v, *c);
            }
        }
    }

    #[test]
    fn random_sparse_systems() {
        let mut w = 12345u64;
        let mut rnd = move || { w = w.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407); w >> 33 };
        for trial in 0..50 {
            let vars = 50 + (trial % 7) * 13;
            let eq_count = vars * 9 / 10;
            // start from a known assignment so the system is solvable by construction
            let assignment: Vec<u64> = (0..vars).map(|_| rnd()).collect();
            let mut rows = Vec::new();
            let mut eqs = Vec::new();
            for _ in 0..eq_count {
                let e: Vec<u32> = (0..3).map(|_| (rnd() as usize % vars) as u32).collect();
                let mut c = 0;
                let mut r = F2Row::new(vars);
                for &v in &e {
                    r.toggle(v);
                }
                // the effective constant respects duplicate cancellation
                let mut seen = std::collections::HashMap::new();
                for &v in &e { *seen.entry(v).or_insert(0u32) += 1; }
                for (&v, &cnt) in &seen { if cnt % 2 == 1 { c ^= assignment[v as usize]; } }
                r.c = c;
                rows.push(r);
                eqs.push((e, c));
            }
            let sol = solve_f2(rows, vars).expect("consistent by construction");
            for (e, c) in eqs {
                let mut v = 0;
                for &x in &e { v ^= sol[x as usize]; }
                assert_eq!(v, c);
            }
        }
    }
}
