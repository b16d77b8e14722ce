use std::collections::BTreeMap;
use std::io;

use binout::{AsIs, Serializer};
use bitwords::{BitAccess, BitVec};
use dyn_size_of::GetSize;
use precode::{Codec, Decoder};

use crate::build::{run_pipeline, BucketSolver, OFFSET_MASK, SEED_BITS};
use crate::conf::BuildConf;
use crate::error::{Error, Result};
use crate::f2::{solve_f2, F2Row};
use crate::function::with_reseeds;
use crate::hash::{rehash, Spooky, TripleHasher};
use crate::peel::{edge_vertices, peel};
use crate::stats::{AccessStatsCollector, BuildStatsCollector};
use crate::store::{bucket_log2_for, bucket_of, BucketStore};
use crate::transform::{RawBytes, Transform};
use crate::StaticFunction;

/// The prefix code used to compress the stored values.
#[derive(Copy, Clone, Debug)]
pub enum CodecChoice {
    /// `v` ones and a zero; good for tiny skewed ranges.
    Unary,
    /// Fixed-width binary; no compression, minimal decode cost.
    Binary,
    /// Elias gamma; good for geometric-like distributions.
    Gamma,
    /// Canonical Huffman built from the value histogram (the default).
    Huffman,
    /// Canonical Huffman whose decoding depth is limited to the given
    /// number of bits; rare values spill to an escape codeword.
    LengthLimitedHuffman(u8),
}

/// Compressed static function: per-key space approaches the empirical
/// entropy of the value distribution.
///
/// Each key contributes one equation per codeword bit; a lookup xors four
/// codeword-length-wide windows of the bucket's bit vector and decodes the
/// leading codeword of the result.
pub struct CompressedFunction<T = RawBytes, H = Spooky> {
    global_seed: u64,
    max_codeword_len: u8,
    bucket_state: Box<[u64]>,
    data: Box<[u64]>,
    decoder: Decoder,
    n: u64,
    transform: T,
    hasher: H,
}

struct CompressedSolver<'c> {
    codec: &'c Codec,
    /// With indirect storage, payloads are indices into this slice.
    values: Option<&'c [u64]>,
    max_codeword_len: u8,
}

impl CompressedSolver<'_> {
    #[inline] fn value(&self, payload: u64) -> u64 {
        self.values.map_or(payload, |vs| vs[payload as usize])
    }

    fn code_of(&self, payload: u64) -> precode::Code {
        self.codec.encode(self.value(payload))
            .expect("histogram covers every stored value")
    }
}

impl BucketSolver for CompressedSolver<'_> {
    fn variables(&self, _triples: &[[u64; 3]], payloads: &[u64]) -> u64 {
        let bits: u64 = payloads.iter().map(|&p| self.code_of(p).len as u64).sum();
        if bits == 0 { return 0; }
        // the tail padding keeps whole-window reads inside the bucket
        (103 * bits + 99) / 100 + self.max_codeword_len as u64
    }

    fn bits_per_variable(&self) -> u8 { 1 }

    fn solve(&self, triples: &[[u64; 3]], payloads: &[u64], seed: u64, variables: u64) -> Option<Vec<u64>> {
        let window_starts = variables - self.max_codeword_len as u64;
        let mut edges: Vec<[u32; 4]> = Vec::new();
        let mut constants: Vec<u64> = Vec::new();
        for (t, &p) in triples.iter().zip(payloads) {
            let starts = edge_vertices::<4>(&rehash(t, seed), window_starts);
            let code = self.code_of(p);
            for j in 0..code.len {
                edges.push(starts.map(|s| s + j as u32));
                constants.push(code.bit(j));
            }
        }
        let peeling = peel(&edges, variables as usize);
        let rows = peeling.residual(edges.len()).into_iter().map(|e| {
            let mut row = F2Row::new(variables as usize);
            for &v in &edges[e as usize] { row.toggle(v); }
            row.c = constants[e as usize];
            row
        }).collect();
        let mut sol = solve_f2(rows, variables as usize)?;
        for &(v, e) in peeling.order.iter().rev() {
            let mut bit = constants[e as usize];
            for &u in &edges[e as usize] {
                if u != v { bit ^= sol[u as usize]; }
            }
            sol[v as usize] = bit;
        }
        let mut packed = Box::<[u64]>::with_zeroed_bits(variables as usize);
        for (v, bit) in sol.iter().enumerate() {
            if *bit != 0 { packed.set_bit(v); }
        }
        Some(packed.into_vec())
    }
}

/// Builds the codec chosen by `choice` for the given values.
fn build_codec(choice: CodecChoice, values: &[u64]) -> Result<Codec> {
    let max = values.iter().copied().max().unwrap_or(0);
    let codec = match choice {
        CodecChoice::Unary => {
            if max > 62 { return Err(Error::InvalidInput("unary coding needs values below 63")); }
            Codec::unary(max)
        }
        CodecChoice::Binary => Codec::binary(max),
        CodecChoice::Gamma => {
            if max >= u32::MAX as u64 { return Err(Error::InvalidInput("gamma coding needs values below 2^32-1")); }
            Codec::gamma(max)
        }
        CodecChoice::Huffman | CodecChoice::LengthLimitedHuffman(_) => {
            let mut histogram = BTreeMap::new();
            for v in values { *histogram.entry(*v).or_insert(0u64) += 1; }
            let histogram: Vec<(u64, u64)> = histogram.into_iter().collect();
            match choice {
                CodecChoice::LengthLimitedHuffman(limit) => {
                    if !(2..=56).contains(&limit) {
                        return Err(Error::InvalidInput("codeword length limit must be in range [2, 56]"));
                    }
                    if max >= 1 << 56 {
                        return Err(Error::InvalidInput("length-limited coding needs values below 2^56"));
                    }
                    Codec::length_limited(&histogram, limit)
                }
                _ => Codec::huffman(&histogram),
            }
        }
    };
    Ok(codec)
}

impl CompressedFunction {
    /// Builds a Huffman-compressed function with the default configuration.
    pub fn try_new<K>(keys: &[K], values: &[u64]) -> Result<Self>
        where K: Sync, RawBytes: Transform<K>
    {
        Self::try_with_conf(keys, values, CodecChoice::Huffman, Default::default())
    }

    /// Reads `Self` from the `input`. Only structures using the default
    /// transform and hasher can be read by this method.
    pub fn read(input: &mut dyn io::Read) -> io::Result<Self> {
        Self::read_with(input, RawBytes, Spooky)
    }
}

impl<T, H> CompressedFunction<T, H>
    where T: Sync + Clone, H: TripleHasher + Sync + Clone
{
    /// Builds a [`CompressedFunction`] with the chosen codec.
    pub fn try_with_conf<K>(
        keys: &[K], values: &[u64], choice: CodecChoice, conf: BuildConf<T, H>,
    ) -> Result<Self>
        where K: Sync, T: Transform<K>
    {
        Self::try_with_conf_stats(keys, values, choice, conf, &mut ())
    }

    /// Builds a [`CompressedFunction`], reporting construction events to `stats`.
    pub fn try_with_conf_stats<K, BS>(
        keys: &[K], values: &[u64], choice: CodecChoice, conf: BuildConf<T, H>, stats: &mut BS,
    ) -> Result<Self>
        where K: Sync, T: Transform<K>, BS: BuildStatsCollector
    {
        if values.len() != keys.len() {
            return Err(Error::InvalidInput("the value list must have one entry per key"));
        }
        if !(1..=20).contains(&conf.bucket_log2_size) {
            return Err(Error::InvalidInput("bucket_log2_size must be in range [1, 20]"));
        }
        if keys.is_empty() {
            return Ok(Self {
                global_seed: conf.seed,
                max_codeword_len: 0,
                bucket_state: vec![0u64; 2].into_boxed_slice(),
                data: Box::new([]),
                decoder: Codec::binary(0).decoder(),
                n: 0,
                transform: conf.transform,
                hasher: conf.hasher,
            });
        }
        let codec = build_codec(choice, values)?;
        let max_codeword_len = codec.max_codeword_length();
        let mut store = BucketStore::new(conf.transform.clone(), conf.hasher.clone(), conf.temp_dir.as_deref())?;
        let bucket_log2 = bucket_log2_for(keys.len() as u64, conf.bucket_log2_size);
        let threads = conf.resolved_threads();
        let indirect = conf.indirect;
        let solver = CompressedSolver {
            codec: &codec,
            values: if indirect { Some(values) } else { None },
            max_codeword_len,
        };
        let out = with_reseeds(&mut store, conf.seed,
            |store| store.add_all_with(keys, |_, i| if indirect { i as u64 } else { values[i] }),
            |store, _| run_pipeline(
                store.buckets(bucket_log2)?, 1 << bucket_log2, &solver, threads, &mut *stats),
        )?;
        Ok(Self {
            global_seed: store.seed(),
            max_codeword_len,
            bucket_state: out.bucket_state,
            data: out.data,
            decoder: codec.decoder(),
            n: keys.len() as u64,
            transform: conf.transform,
            hasher: conf.hasher,
        })
    }
}

impl<T, H> CompressedFunction<T, H> {
    #[inline] fn bucket_log2(&self) -> u8 {
        (self.bucket_state.len() - 1).trailing_zeros() as u8
    }

    /// Returns the length of the longest codeword, in bits.
    #[inline] pub fn max_codeword_length(&self) -> u8 { self.max_codeword_len }

    /// Returns number of bytes which `write` will write.
    pub fn write_bytes(&self) -> usize {
        6 * std::mem::size_of::<u64>()
            + AsIs::array_content_size(&self.bucket_state)
            + AsIs::array_content_size(&self.data)
            + self.decoder.write_bytes()
    }

    /// Writes `self` to the `output`.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        AsIs::write(output, self.n)?;
        AsIs::write(output, 64 - self.bucket_log2() as u64)?;
        AsIs::write(output, self.max_codeword_len as u64)?;
        AsIs::write(output, self.global_seed)?;
        AsIs::write(output, self.bucket_state.len() as u64)?;
        AsIs::write_all(output, self.bucket_state.iter())?;
        AsIs::write(output, self.data.len() as u64)?;
        AsIs::write_all(output, self.data.iter())?;
        self.decoder.write(output)
    }

    /// Reads `Self` from the `input`; `transform` and `hasher` must match the written structure.
    pub fn read_with(input: &mut dyn io::Read, transform: T, hasher: H) -> io::Result<Self> {
        let n = AsIs::read(input)?;
        let _bucket_shift: u64 = AsIs::read(input)?;
        let max_codeword_len: u64 = AsIs::read(input)?;
        let global_seed = AsIs::read(input)?;
        let state_len: u64 = AsIs::read(input)?;
        let bucket_state = AsIs::read_n(input, state_len as usize)?;
        let data_len: u64 = AsIs::read(input)?;
        let data = AsIs::read_n(input, data_len as usize)?;
        let decoder = Decoder::read(input)?;
        Ok(Self {
            global_seed,
            max_codeword_len: max_codeword_len as u8,
            bucket_state,
            data,
            decoder,
            n,
            transform,
            hasher,
        })
    }
}

impl<T, H: TripleHasher> CompressedFunction<T, H> {
    /// Returns the value assigned to the given `key`.
    /// If the key was not in the input collection, an unspecified value is returned.
    #[inline] pub fn get<K: ?Sized>(&self, key: &K) -> u64 where T: Transform<K> {
        self.get_stats(key, &mut ())
    }

    /// Returns the value assigned to the given `key` and reports the decoded
    /// codeword length to `access_stats`.
    pub fn get_stats<K: ?Sized, A>(&self, key: &K, access_stats: &mut A) -> u64
        where T: Transform<K>, A: AccessStatsCollector
    {
        let t = self.hasher.triple(&self.transform.to_bytes(key), self.global_seed);
        let bucket = bucket_of(t[0], self.bucket_log2());
        let state = self.bucket_state[bucket];
        let offset = state & OFFSET_MASK;
        let variables = (self.bucket_state[bucket + 1] & OFFSET_MASK) - offset;
        if variables == 0 {
            access_stats.found_with_length(0);
            return 0;
        }
        let window_starts = variables - self.max_codeword_len as u64;
        let e = edge_vertices::<4>(&rehash(&t, state >> (64 - SEED_BITS)), window_starts);
        let mut window = 0;
        for v in e {
            window ^= self.data.get_bits64((offset + v as u64) as usize, self.max_codeword_len);
        }
        match self.decoder.decode(window) {
            Some((value, len)) => { access_stats.found_with_length(len); value }
            None => { access_stats.invalid_codeword(); 0 }
        }
    }
}

impl<T, H> GetSize for CompressedFunction<T, H> {
    fn size_bytes_dyn(&self) -> usize {
        self.bucket_state.size_bytes_dyn() + self.data.size_bytes_dyn() + self.decoder.size_bytes_dyn()
    }
    const USES_DYN_MEM: bool = true;
}

impl<K: ?Sized, T: Transform<K>, H: TripleHasher> StaticFunction<K> for CompressedFunction<T, H> {
    #[inline] fn get(&self, key: &K) -> u64 { CompressedFunction::get(self, key) }
    #[inline] fn size(&self) -> u64 { self.n }
    #[inline] fn num_bits(&self) -> u64 { 8 * self.size_bytes() as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{random_keys, splitmix};

    fn check<T: Transform<str>, H: TripleHasher>(f: &CompressedFunction<T, H>, keys: &[String], values: &[u64]) {
        for (k, v) in keys.iter().zip(values) {
            assert_eq!(f.get(k.as_str()), *v, "wrong value for key {}", k);
        }
    }

    #[test]
    fn huffman_small() {
        let keys = random_keys(200, 1);
        let values: Vec<u64> = (0..200u64).map(|i| i % 5).collect();
        let f = CompressedFunction::try_new(&keys, &values).unwrap();
        check(&f, &keys, &values);
    }

    #[test]
    fn every_codec() {
        let keys = random_keys(400, 2);
        let values: Vec<u64> = (0..400u64).map(|i| i % 17).collect();
        for choice in [CodecChoice::Unary, CodecChoice::Binary, CodecChoice::Gamma,
                       CodecChoice::Huffman, CodecChoice::LengthLimitedHuffman(12)] {
            let f = CompressedFunction::try_with_conf(&keys, &values, choice, BuildConf::default())
                .unwrap_or_else(|e| panic!("{:?} failed: {}", choice, e));
            check(&f, &keys, &values);
        }
    }

    #[test]
    fn skewed_values_compress() {
        // value 0 with probability 0.9, otherwise uniform in [1, 16]
        let n = 20_000usize;
        let keys = random_keys(n, 8);
        let mut s = 77u64;
        let values: Vec<u64> = (0..n).map(|_| {
            let r = splitmix(&mut s);
            if r % 10 < 9 { 0 } else { 1 + (r >> 8) % 16 }
        }).collect();
        let f = CompressedFunction::try_new(&keys, &values).unwrap();
        check(&f, &keys, &values);
        // entropy is about 0.47 + 0.4 = 0.87 bits/key; stored bits stay well below
        // the 5 bits/key of plain binary storage
        let bits_per_key = (f.data.len() * 64) as f64 / n as f64;
        assert!(bits_per_key < 1.6, "{} bits/key", bits_per_key);
    }

    #[test]
    fn access_stats_count_decoded_bits() {
        let keys = random_keys(300, 6);
        let values: Vec<u64> = (0..300u64).map(|i| i % 3).collect();
        let f = CompressedFunction::try_new(&keys, &values).unwrap();
        let mut decoded_bits = 0u64;
        for k in &keys { f.get_stats(k.as_str(), &mut decoded_bits); }
        // every codeword is 1 or 2 bits for a 3-value alphabet
        assert!(decoded_bits >= 300 && decoded_bits <= 600, "{} bits", decoded_bits);
    }

    #[test]
    fn constant_values() {
        let keys = random_keys(100, 3);
        let values = vec![42u64; 100];
        let f = CompressedFunction::try_new(&keys, &values).unwrap();
        check(&f, &keys, &values);
    }

    #[test]
    fn empty() {
        let empty: [&str; 0] = [];
        let f = CompressedFunction::try_new(&empty, &[]).unwrap();
        assert_eq!(f.get("x"), 0);
    }

    #[test]
    fn read_write() {
        let keys = random_keys(500, 4);
        let values: Vec<u64> = (0..500u64).map(|i| i % 11).collect();
        let f = CompressedFunction::try_new(&keys, &values).unwrap();
        let mut buff = Vec::new();
        f.write(&mut buff).unwrap();
        assert_eq!(buff.len(), f.write_bytes());
        let read = CompressedFunction::read(&mut &buff[..]).unwrap();
        check(&read, &keys, &values);
    }

    #[test]
    fn deterministic() {
        let keys = random_keys(1000, 5);
        let values: Vec<u64> = (0..1000u64).map(|i| i % 7).collect();
        let a = CompressedFunction::try_new(&keys, &values).unwrap();
        let b = CompressedFunction::try_new(&keys, &values).unwrap();
        let (mut wa, mut wb) = (Vec::new(), Vec::new());
        a.write(&mut wa).unwrap();
        b.write(&mut wb).unwrap();
        assert_eq!(wa, wb);
    }
}
