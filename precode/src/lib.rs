#![doc = include_str!("../README.md")]

use std::collections::HashMap;

mod huffman;
use huffman::{canonical_from_freqs, for_each_leaf};

mod decoder;
pub use decoder::{Decoder, Tree};
use decoder::rev_bits;

/// Returns the largest `how_many`-bit number; `how_many` must be in range [0, 64].
#[inline(always)] pub(crate) const fn n_lowest_bits_0_64(how_many: u8) -> u64 {
    if how_many >= 64 { return u64::MAX; }
    (1u64 << how_many).wrapping_sub(1)
}

/// Minimal number of bits needed to store values from `0` to `max_value`.
#[inline] fn bits_to_store(max_value: u64) -> u8 {
    max_value.checked_ilog2().map_or(0, |v| v as u8 + 1)
}

/// A codeword: `len` bits, with bit `j` of `bits` being the `j`-th transmitted bit.
#[derive(Default, Copy, Clone, PartialEq, Eq, Debug)]
pub struct Code {
    pub bits: u64,
    pub len: u8,
}

impl Code {
    /// Returns the `j`-th bit of the codeword.
    #[inline(always)] pub fn bit(&self, j: u8) -> u64 { (self.bits >> j) & 1 }
}

enum Repr {
    Unary { max: u64 },
    Binary { width: u8 },
    Gamma { max: u64 },
    /// Both plain and length-limited canonical Huffman; `esc` is the escape
    /// codeword and the raw width of escaped values, if any.
    Huffman { codes: HashMap<u64, Code>, esc: Option<(Code, u8)> },
}

/// A prefix-free binary code over `u64` values.
///
/// Built once, from a bound on the values or from a frequency histogram;
/// maps values to codewords and produces a compact [`Decoder`].
pub struct Codec {
    repr: Repr,
    decoder: Decoder,
}

impl Codec {
    /// Unary code for values up to `max_value`: `v` ones followed by a zero.
    /// Panics if `max_value > 62`.
    pub fn unary(max_value: u64) -> Self {
        assert!(max_value <= 62, "unary codewords would exceed 63 bits");
        Self { repr: Repr::Unary { max: max_value }, decoder: Decoder::Unary { max_len: max_value as u8 + 1 } }
    }

    /// Fixed-width binary code for values up to `max_value`, lowest bit first.
    pub fn binary(max_value: u64) -> Self {
        let width = bits_to_store(max_value);
        Self { repr: Repr::Binary { width }, decoder: Decoder::Binary { width } }
    }

    /// Elias gamma code for values up to `max_value`:
    /// for `n = v+1` of `b` bits, `b-1` zeros followed by `n`, highest bit first.
    /// Panics if `max_value >= 2^32 - 1`.
    pub fn gamma(max_value: u64) -> Self {
        assert!(max_value < u32::MAX as u64, "gamma codewords would exceed 63 bits");
        let max_len = 2*(bits_to_store(max_value + 1) - 1) + 1;
        Self { repr: Repr::Gamma { max: max_value }, decoder: Decoder::Gamma { max_len } }
    }

    /// Canonical Huffman code for the given `(value, frequency)` histogram.
    /// All values must be distinct and frequencies positive; the histogram must be nonempty.
    ///
    /// # Example
    ///
    /// ```
    /// use precode::Codec;
    ///
    /// let codec = Codec::huffman(&[(1, 90), (2, 7), (3, 3)]);
    /// let code = codec.encode(1).unwrap();
    /// assert_eq!(code.len, 1);
    /// assert_eq!(codec.decoder().decode(code.bits), Some((1, 1)));
    /// ```
    pub fn huffman(histogram: &[(u64, u64)]) -> Self {
        assert!(!histogram.is_empty(), "empty histogram");
        let mut histogram = histogram.to_vec();
        histogram.sort_unstable();  // canonical order must not depend on the histogram order
        let freqs: Vec<u64> = histogram.iter().map(|(_, f)| *f).collect();
        let shape = canonical_from_freqs(&freqs);
        assert!(shape.internal_counts.len() <= 64, "codeword length exceeds 64 bits; limit the length");
        let mut codes = HashMap::with_capacity(histogram.len());
        let mut values = vec![0u64; histogram.len()];
        for_each_leaf(&shape.internal_counts, shape.order.len(), |leaf_seq, level, internal, leaf_index| {
            let value = histogram[shape.order[leaf_seq] as usize].0;
            values[leaf_seq] = value;
            codes.insert(value, Code { bits: rev_bits((internal + leaf_index) as u64, level + 1), len: level + 1 });
        });
        Self {
            repr: Repr::Huffman { codes, esc: None },
            decoder: Decoder::Huffman(Tree {
                values: values.into_boxed_slice(),
                internal_counts: shape.internal_counts,
            }),
        }
    }

    /// Canonical Huffman code whose tree depth is limited to `limit` bits.
    ///
    /// Rare values are moved out of the tree until the depth bound holds;
    /// they are coded as an escape codeword followed by the value itself,
    /// raw, on `bits_to_store(max value)` bits.
    /// Panics if the histogram is empty or `limit` is not in range [2, 64].
    pub fn length_limited(histogram: &[(u64, u64)], limit: u8) -> Self {
        assert!((2..=64).contains(&limit), "invalid codeword length limit");
        assert!(!histogram.is_empty(), "empty histogram");
        let mut histogram = histogram.to_vec();
        histogram.sort_unstable();
        let plain = Self::huffman(&histogram);
        if plain.max_codeword_length() <= limit { return plain; }

        let esc_width = bits_to_store(histogram.iter().map(|(v, _)| *v).max().unwrap_or(0));
        assert!(esc_width < 64, "escaped values must fit 63 bits");
        // entries ordered by ascending frequency; a growing prefix gets escaped
        let mut by_freq: Vec<(u64, u64)> = histogram.clone();
        by_freq.sort_unstable_by_key(|&(v, f)| (f, v));
        let mut cut = 1;
        loop {
            let escaped_freq: u64 = by_freq[..cut].iter().map(|(_, f)| *f).sum();
            // index entries.len() stands for the escape leaf
            let mut entries: Vec<(u64, u64)> = by_freq[cut..].to_vec();
            entries.sort_unstable();
            let mut freqs: Vec<u64> = entries.iter().map(|(_, f)| *f).collect();
            freqs.push(escaped_freq);
            let esc_id = entries.len() as u32;
            let shape = canonical_from_freqs(&freqs);
            let depth = shape.internal_counts.len() as u8;
            if depth > limit || depth as u32 + esc_width as u32 > 64 {
                cut += 1;
                continue;
            }
            let mut leaves = Vec::with_capacity(shape.order.len());
            for_each_leaf(&shape.internal_counts, shape.order.len(), |leaf_seq, level, internal, leaf_index| {
                debug_assert_eq!(leaf_seq, leaves.len());
                leaves.push(Code { bits: rev_bits((internal + leaf_index) as u64, level + 1), len: level + 1 });
            });
            let esc_index = shape.order.iter().position(|&id| id == esc_id)
                .expect("the escape leaf is always present") as u32;
            let esc_code = leaves[esc_index as usize];
            let mut codes = HashMap::with_capacity(histogram.len());
            let mut values = Vec::with_capacity(entries.len());
            for (leaf_seq, &id) in shape.order.iter().enumerate() {
                if id != esc_id {
                    values.push(entries[id as usize].0);
                    codes.insert(entries[id as usize].0, leaves[leaf_seq]);
                }
            }
            for &(v, _) in &by_freq[..cut] {
                codes.insert(v, Code {
                    bits: esc_code.bits | (v << esc_code.len),
                    len: esc_code.len + esc_width,
                });
            }
            return Self {
                repr: Repr::Huffman { codes, esc: Some((esc_code, esc_width)) },
                decoder: Decoder::Limited {
                    tree: Tree { values: values.into_boxed_slice(), internal_counts: shape.internal_counts },
                    esc_index,
                    esc_width,
                },
            };
        }
    }

    /// Returns the codeword of `value`, or [`None`] if the codec cannot encode it.
    pub fn encode(&self, value: u64) -> Option<Code> {
        match &self.repr {
            Repr::Unary { max } => (value <= *max).then(||
                Code { bits: n_lowest_bits_0_64(value as u8), len: value as u8 + 1 }),
            Repr::Binary { width } => (value <= n_lowest_bits_0_64(*width)).then(||
                Code { bits: value, len: *width }),
            Repr::Gamma { max } => (value <= *max).then(|| {
                let n = value + 1;
                let b = bits_to_store(n);   // n has b bits, the leading one included
                Code { bits: rev_bits(n, b) << (b - 1), len: 2*b - 1 }
            }),
            Repr::Huffman { codes, .. } => codes.get(&value).copied(),
        }
    }

    /// Returns the length of the codeword of `value`, in bits.
    #[inline] pub fn codeword_len(&self, value: u64) -> Option<u8> {
        self.encode(value).map(|c| c.len)
    }

    /// Returns the escape codeword, if the codec uses escape coding.
    pub fn escape(&self) -> Option<Code> {
        match &self.repr {
            Repr::Huffman { esc: Some((code, _)), .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns the length of the longest codeword, in bits.
    #[inline] pub fn max_codeword_length(&self) -> u8 { self.decoder.max_codeword_length() }

    /// Returns the decoder of this code.
    #[inline] pub fn decoder(&self) -> Decoder { self.decoder.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    /// Checks that `v` encodes to `len` bits and decodes back, also with garbage above the codeword.
    fn check_roundtrip(codec: &Codec, v: u64) {
        let code = codec.encode(v).expect("value must be encodable");
        assert_eq!(codec.codeword_len(v), Some(code.len));
        assert!(code.len <= codec.max_codeword_length());
        let decoder = codec.decoder();
        for garbage in [0u64, u64::MAX, 0xDEAD_BEEF_DEAD_BEEF] {
            let window = if code.len == 64 { code.bits } else { code.bits | (garbage << code.len) };
            assert_eq!(decoder.decode(window), Some((v, code.len)), "value {} with garbage {:x}", v, garbage);
        }
    }

    fn check_serialization(codec: &Codec, probe: &[u64]) {
        let decoder = codec.decoder();
        let mut buff = Vec::new();
        decoder.write(&mut buff).unwrap();
        assert_eq!(buff.len(), decoder.write_bytes());
        let read = Decoder::read(&mut &buff[..]).unwrap();
        for &v in probe {
            let code = codec.encode(v).unwrap();
            assert_eq!(read.decode(code.bits), decoder.decode(code.bits));
        }
    }

    #[test]
    fn unary() {
        let codec = Codec::unary(10);
        assert_eq!(codec.encode(0), Some(Code { bits: 0, len: 1 }));
        assert_eq!(codec.encode(3), Some(Code { bits: 0b0111, len: 4 }));
        assert_eq!(codec.encode(11), None);
        for v in 0..=10 { check_roundtrip(&codec, v); }
        check_serialization(&codec, &[0, 5, 10]);
    }

    #[test]
    fn binary() {
        let codec = Codec::binary(12);
        assert_eq!(codec.max_codeword_length(), 4);
        assert_eq!(codec.encode(5), Some(Code { bits: 5, len: 4 }));
        for v in 0..=15 { check_roundtrip(&codec, v); }
        check_serialization(&codec, &[0, 7, 15]);
    }

    #[test]
    fn gamma() {
        let codec = Codec::gamma(1000);
        assert_eq!(codec.encode(0), Some(Code { bits: 1, len: 1 }));
        // v=1: n=2=0b10, one zero then 1,0 -> transmitted 0,1,0
        assert_eq!(codec.encode(1), Some(Code { bits: 0b010, len: 3 }));
        assert_eq!(codec.encode(2), Some(Code { bits: 0b110, len: 3 }));
        for v in [0, 1, 2, 3, 4, 7, 8, 100, 1000] { check_roundtrip(&codec, v); }
        check_serialization(&codec, &[0, 3, 1000]);
    }

    #[test]
    fn huffman_3_values() {
        //  /  \
        // /\  a
        // bc
        let codec = Codec::huffman(&[(10, 100), (20, 50), (30, 10)]);
        assert_eq!(codec.max_codeword_length(), 2);
        assert_eq!(codec.codeword_len(10), Some(1));
        assert_eq!(codec.codeword_len(20), Some(2));
        assert_eq!(codec.codeword_len(30), Some(2));
        for v in [10, 20, 30] { check_roundtrip(&codec, v); }
        assert_eq!(codec.encode(40), None);
        check_serialization(&codec, &[10, 20, 30]);
    }

    #[test]
    fn huffman_6_values() {
        let histogram = hashmap!('d' => 12u64, 'e' => 11, 'f' => 10, 'a' => 3, 'b' => 2, 'c' => 1);
        let histogram: Vec<(u64, u64)> = histogram.into_iter().map(|(k, v)| (k as u64, v)).collect();
        let codec = Codec::huffman(&histogram);
        assert_eq!(codec.max_codeword_length(), 4);
        assert_eq!(codec.codeword_len('d' as u64), Some(2));
        assert_eq!(codec.codeword_len('e' as u64), Some(2));
        assert_eq!(codec.codeword_len('f' as u64), Some(2));
        assert_eq!(codec.codeword_len('a' as u64), Some(3));
        assert_eq!(codec.codeword_len('b' as u64), Some(4));
        assert_eq!(codec.codeword_len('c' as u64), Some(4));
        for (v, _) in &histogram { check_roundtrip(&codec, *v); }
        check_serialization(&codec, &histogram.iter().map(|(v, _)| *v).collect::<Vec<_>>());
    }

    #[test]
    fn huffman_single_value() {
        let codec = Codec::huffman(&[(7, 1000)]);
        assert_eq!(codec.codeword_len(7), Some(1));
        check_roundtrip(&codec, 7);
    }

    #[test]
    fn huffman_is_order_independent() {
        let a = Codec::huffman(&[(1, 5), (2, 5), (3, 5), (4, 5)]);
        let b = Codec::huffman(&[(3, 5), (1, 5), (4, 5), (2, 5)]);
        for v in 1..=4 { assert_eq!(a.encode(v), b.encode(v)); }
    }

    #[test]
    fn length_limited_within_limit_is_plain() {
        let codec = Codec::length_limited(&[(10, 100), (20, 50), (30, 10)], 8);
        assert!(codec.escape().is_none());
        for v in [10, 20, 30] { check_roundtrip(&codec, v); }
    }

    #[test]
    fn length_limited_escapes() {
        // exponential frequencies give a degenerate deep tree
        let histogram: Vec<(u64, u64)> = (0..20).map(|i| (i as u64, 1u64 << i)).collect();
        let plain = Codec::huffman(&histogram);
        assert!(plain.max_codeword_length() > 8);
        let codec = Codec::length_limited(&histogram, 8);
        assert!(codec.escape().is_some());
        for (v, _) in &histogram {
            check_roundtrip(&codec, *v);
            let len = codec.codeword_len(*v).unwrap();
            assert!(len <= codec.max_codeword_length());
        }
        // escaped (rare) values must still decode exactly
        check_serialization(&codec, &histogram.iter().map(|(v, _)| *v).collect::<Vec<_>>());
    }

    #[test]
    fn length_limited_respects_tree_bound() {
        let histogram: Vec<(u64, u64)> = (0..64).map(|i| (i as u64, 1u64 << (i % 40))).collect();
        let codec = Codec::length_limited(&histogram, 10);
        let esc = codec.escape().unwrap();
        for (v, _) in &histogram {
            let code = codec.encode(*v).unwrap();
            // within the tree bound, or an escaped codeword of the exact escape shape
            assert!(code.len <= 10 || (code.len == esc.len + 6 && code.bits & n_lowest_bits_0_64(esc.len) == esc.bits),
                    "value {} has length {}", v, code.len);
            check_roundtrip(&codec, *v);
        }
    }
}
