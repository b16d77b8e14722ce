//! Lazy Gaussian elimination over F₃.
//!
//! The analogue of [`crate::f2`] with coefficients in {1, 2} packed two bits
//! per variable; row addition is field-wise broadword arithmetic modulo 3 and
//! elimination scales the pivot row so coefficients cancel.

use std::collections::VecDeque;

use bitwords::ceiling_div;
use bitwords::mod3::{add_mod3, times2_mod3, count_nonzero_pairs};

pub(crate) struct F3Row {
    /// 2-bit coefficient per variable.
    coeffs: Box<[u64]>,
    pub c: u8,
}

impl F3Row {
    pub fn new(var_count: usize) -> Self {
        Self { coeffs: vec![0u64; ceiling_div(var_count.max(1), 32)].into_boxed_slice(), c: 0 }
    }

    #[inline] pub fn coeff(&self, v: u32) -> u8 {
        ((self.coeffs[v as usize / 32] >> (2 * (v % 32))) & 0b11) as u8
    }

    #[inline] fn set_coeff(&mut self, v: u32, value: u8) {
        let w = &mut self.coeffs[v as usize / 32];
        let shift = 2 * (v % 32);
        *w = (*w & !(0b11 << shift)) | ((value as u64) << shift);
    }

    /// Adds 1 to the coefficient of `v`, modulo 3.
    #[inline] pub fn add_var(&mut self, v: u32) {
        self.set_coeff(v, (self.coeff(v) + 1) % 3);
    }

    /// `self += factor * other`, field-wise modulo 3. `factor` is 1 or 2.
    fn add_scaled(&mut self, other: &F3Row, factor: u8) {
        debug_assert!(factor == 1 || factor == 2);
        if factor == 1 {
            for (a, b) in self.coeffs.iter_mut().zip(other.coeffs.iter()) { *a = add_mod3(*a, *b); }
            self.c = (self.c + other.c) % 3;
        } else {
            for (a, b) in self.coeffs.iter_mut().zip(other.coeffs.iter()) { *a = add_mod3(*a, times2_mod3(*b)); }
            self.c = (self.c + 2 * other.c) % 3;
        }
    }

    /// Multiplies the whole row by 2 (the only nontrivial scaling in F₃).
    fn scale2(&mut self) {
        for a in self.coeffs.iter_mut() { *a = times2_mod3(*a); }
        self.c = (2 * self.c) % 3;
    }

    #[inline] fn idle_count(&self, idle_pairs: &[u64]) -> u32 {
        self.coeffs.iter().zip(idle_pairs).map(|(a, i)| count_nonzero_pairs(a & i)).sum()
    }

    #[inline] fn first_idle(&self, idle_pairs: &[u64]) -> Option<u32> {
        for (w, (a, i)) in self.coeffs.iter().zip(idle_pairs).enumerate() {
            let x = a & i;
            if x != 0 { return Some((w * 32) as u32 + (x.trailing_zeros() & !1) / 2); }
        }
        None
    }

    #[inline] fn first_var(&self) -> Option<u32> {
        for (w, a) in self.coeffs.iter().enumerate() {
            if *a != 0 { return Some((w * 32) as u32 + (a.trailing_zeros() & !1) / 2); }
        }
        None
    }

    #[inline] fn is_zero(&self) -> bool { self.coeffs.iter().all(|w| *w == 0) }

    fn for_each_var(&self, mut f: impl FnMut(u32, u8)) {
        for (w, coeffs) in self.coeffs.iter().enumerate() {
            let mut a = *coeffs;
            while a != 0 {
                let shift = a.trailing_zeros() & !1;
                f((w * 32) as u32 + shift / 2, ((a >> shift) & 0b11) as u8);
                a &= !(0b11 << shift);
            }
        }
    }
}

const ACTIVE: u8 = 0;
const QUEUED: u8 = 1;
const DONE: u8 = 2;

/// Solves the system, returning a value in {0, 1, 2} per variable
/// (unconstrained variables get 0), or [`None`] if the system is unsolvable.
pub(crate) fn solve_f3(mut rows: Vec<F3Row>, var_count: usize) -> Option<Vec<u8>> {
    let words = ceiling_div(var_count.max(1), 32);
    let mut weight = vec![0u32; var_count];
    for r in &rows { r.for_each_var(|v, _| weight[v as usize] += 1); }

    let mut by_weight: Vec<u32> = (0..var_count as u32).filter(|&v| weight[v as usize] > 0).collect();
    by_weight.sort_unstable_by_key(|&v| (std::cmp::Reverse(weight[v as usize]), v));
    let mut heavy_scan = 0usize;

    // 0b11 per idle variable
    let mut idle = vec![0u64; words];
    for &v in &by_weight { idle[v as usize / 32] |= 0b11 << (2 * (v % 32)); }
    let clear_idle = |idle: &mut Vec<u64>, v: u32| idle[v as usize / 32] &= !(0b11 << (2 * (v % 32)));

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
                    } else {
                        dense.push(r);
                    }
                }
                Some(x) => {
                    if rows[r].coeff(x) == 2 { rows[r].scale2(); }  // make the pivot coefficient 1
                    clear_idle(&mut idle, x);
                    solved.push((x, r));
                    let pivot = F3Row { coeffs: rows[r].coeffs.clone(), c: rows[r].c };
                    for r2 in 0..rows.len() {
                        if state[r2] == DONE { continue; }
                        let b = rows[r2].coeff(x);
                        if b == 0 { continue; }
                        rows[r2].add_scaled(&pivot, 3 - b);  // cancel: b + (3-b) ≡ 0
                        if state[r2] == ACTIVE && rows[r2].idle_count(&idle) <= 1 {
                            state[r2] = QUEUED;
                            queue.push_back(r2);
                        }
                    }
                }
            }
        } else {
            while heavy_scan < by_weight.len()
                && idle[by_weight[heavy_scan] as usize / 32] >> (2 * (by_weight[heavy_scan] % 32)) & 0b11 == 0
            { heavy_scan += 1; }
            let Some(&x) = by_weight.get(heavy_scan) else { break };
            heavy_scan += 1;
            clear_idle(&mut idle, x);
            for r2 in 0..rows.len() {
                if state[r2] == ACTIVE && rows[r2].coeff(x) != 0
                    && rows[r2].idle_count(&idle) <= 1
                {
                    state[r2] = QUEUED;
                    queue.push_back(r2);
                }
            }
        }
    }

    let mut sol = vec![0u8; var_count];

    // plain Gaussian elimination on the dense core
    let mut dense_solved: Vec<(u32, usize)> = Vec::new();
    for i in 0..dense.len() {
        let r = dense[i];
        let Some(pivot_var) = rows[r].first_var() else {
            if rows[r].c != 0 { return None; }
            continue;
        };
        if rows[r].coeff(pivot_var) == 2 { rows[r].scale2(); }
        dense_solved.push((pivot_var, r));
        let pivot = F3Row { coeffs: rows[r].coeffs.clone(), c: rows[r].c };
        for &r2 in &dense[i+1..] {
            let b = rows[r2].coeff(pivot_var);
            if b != 0 { rows[r2].add_scaled(&pivot, 3 - b); }
        }
    }
    for &(x, r) in dense_solved.iter().rev() {
        sol[x as usize] = substitute(&rows[r], x, &sol);
    }
    for &(x, r) in solved.iter().rev() {
        sol[x as usize] = substitute(&rows[r], x, &sol);
    }

    Some(sol)
}

/// Value of `x` making `row` hold, given all its other variables are assigned.
/// The coefficient of `x` in `row` is 1.
fn substitute(row: &F3Row, x: u32, sol: &[u8]) -> u8 {
    debug_assert_eq!(row.coeff(x), 1);
    let mut s = row.c as u32;
    row.for_each_var(|v, b| if v != x { s += (3 - (b * sol[v as usize]) % 3) as u32; });
    (s % 3) as u8
}
