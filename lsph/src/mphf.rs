use std::io;

use binout::{AsIs, Serializer};
use bitwords::{n_lowest_bits_0_64, BitAccess, BitVec, PairRank};
use dyn_size_of::GetSize;

use crate::build::{run_pipeline, BucketSolver, OFFSET_MASK, SEED_BITS};
use crate::conf::BuildConf;
use crate::error::{Error, Result};
use crate::f3::{solve_f3, F3Row};
use crate::function::with_reseeds;
use crate::hash::{rehash, Spooky, TripleHasher};
use crate::orient::orient;
use crate::peel::{edge_vertices, peel};
use crate::stats::BuildStatsCollector;
use crate::store::{bucket_log2_for, bucket_of, BucketStore};
use crate::transform::{RawBytes, Transform};
use crate::StaticFunction;

/// Returned by signed structures for keys whose signature does not match.
pub const NOT_MEMBER: u64 = u64::MAX;

/// Variable count of a 3-regular F₃ bucket of `k` equations: 1.10·k, rounded up.
#[inline] fn f3_variables(k: usize) -> u64 {
    if k == 0 { 0 } else { (110 * k as u64 + 99) / 100 }
}

/// Minimal perfect hash function: maps the n input keys bijectively onto `[0, n)`.
///
/// Every vertex of the bucket's 3-regular hypergraph carries a 2-bit value;
/// the sum of an edge's three values modulo 3 (with the stored 3 acting as 0)
/// selects the edge's image vertex, and the rank of nonzero pairs before it
/// is the key's minimal index. With signatures enabled, lookups of keys
/// outside the input set return [`NOT_MEMBER`] with probability
/// 1 − 2⁻ʷⁱᵈᵗʰ.
pub struct Mphf<T = RawBytes, H = Spooky> {
    global_seed: u64,
    bucket_state: Box<[u64]>,
    values: PairRank,
    n: u64,
    sig_width: u8,
    signatures: Box<[u64]>,
    transform: T,
    hasher: H,
}

struct MphfSolver;

impl BucketSolver for MphfSolver {
    fn variables(&self, triples: &[[u64; 3]], _payloads: &[u64]) -> u64 {
        f3_variables(triples.len())
    }

    fn bits_per_variable(&self) -> u8 { 2 }

    fn solve(&self, triples: &[[u64; 3]], _payloads: &[u64], seed: u64, variables: u64) -> Option<Vec<u64>> {
        let edges: Vec<[u32; 3]> = triples.iter()
            .map(|t| edge_vertices::<3>(&rehash(t, seed), variables))
            .collect();
        let peeling = peel(&edges, variables as usize);
        let residual = peeling.residual(edges.len());
        let residual_edges: Vec<[u32; 3]> = residual.iter().map(|&e| edges[e as usize]).collect();
        let hinges = orient(&residual_edges, variables as usize)?;

        // the residual system is restricted to the hinge vertices; every other
        // vertex keeps the value 0 and therefore never contributes to a sum
        let mut hinge_index = vec![u32::MAX; variables as usize];
        let mut hinge_vertex = Vec::with_capacity(residual.len());
        for (j, e) in residual_edges.iter().enumerate() {
            let v = e[hinges[j] as usize];
            hinge_index[v as usize] = j as u32;
            hinge_vertex.push(v);
        }
        let rows = residual_edges.iter().zip(&hinges).map(|(e, &p)| {
            let mut row = F3Row::new(residual.len());
            for &u in e {
                if hinge_index[u as usize] != u32::MAX { row.add_var(hinge_index[u as usize]); }
            }
            row.c = p;
            row
        }).collect();
        let sol = solve_f3(rows, residual.len())?;

        // a hinge whose solution is 0 stores 3: still 0 modulo 3, but nonzero
        // for the rank structure that the minimal index is read from
        let mut values = vec![0u8; variables as usize];
        for (j, &v) in hinge_vertex.iter().enumerate() {
            values[v as usize] = if sol[j] == 0 { 3 } else { sol[j] };
        }
        for &(v, e) in peeling.order.iter().rev() {
            let verts = &edges[e as usize];
            let p = verts.iter().position(|&u| u == v)
                .expect("a peeled vertex lies on its edge");
            let mut others = 0u32;
            for &u in verts {
                if u != v { others += (values[u as usize] % 3) as u32; }
            }
            let x = (p as u32 + 6 - others % 3) % 3;
            values[v as usize] = if x == 0 { 3 } else { x as u8 };
        }
        let mut packed = Box::<[u64]>::with_zeroed_bits(2 * variables as usize);
        for (v, value) in values.iter().enumerate() {
            packed.init_fragment(v, *value as u64, 2);
        }
        Some(packed.into_vec())
    }
}

impl Mphf {
    /// Builds an unsigned [`Mphf`] with the default configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use lsph::Mphf;
    ///
    /// let mphf = Mphf::try_new(&["apple", "banana", "cherry"]).unwrap();
    /// let mut indices: Vec<u64> = ["apple", "banana", "cherry"]
    ///     .iter().map(|k| mphf.get(*k)).collect();
    /// indices.sort();
    /// assert_eq!(indices, [0, 1, 2]);
    /// ```
    pub fn try_new<K>(keys: &[K]) -> Result<Self>
        where K: Sync, RawBytes: Transform<K>
    {
        Self::try_with_conf(keys, 0, Default::default())
    }

    /// Reads `Self` from the `input`. Only structures using the default
    /// transform and hasher can be read by this method.
    pub fn read(input: &mut dyn io::Read) -> io::Result<Self> {
        Self::read_with(input, RawBytes, Spooky)
    }
}

impl<T, H> Mphf<T, H>
    where T: Sync + Clone, H: TripleHasher + Sync + Clone
{
    /// Builds a [`Mphf`]; with `signature_width > 0` the structure is signed
    /// and non-member lookups return [`NOT_MEMBER`] with false-positive rate
    /// about 2⁻ˢⁱᵍⁿᵃᵗᵘʳᵉ⁻ʷⁱᵈᵗʰ.
    pub fn try_with_conf<K>(keys: &[K], signature_width: u8, conf: BuildConf<T, H>) -> Result<Self>
        where K: Sync, T: Transform<K>
    {
        Self::try_with_conf_stats(keys, signature_width, conf, &mut ())
    }

    /// Builds a [`Mphf`], reporting construction events to `stats`.
    pub fn try_with_conf_stats<K, BS>(
        keys: &[K], signature_width: u8, conf: BuildConf<T, H>, stats: &mut BS,
    ) -> Result<Self>
        where K: Sync, T: Transform<K>, BS: BuildStatsCollector
    {
        if signature_width > 56 {
            return Err(Error::InvalidInput("signature width must be in range [0, 56]"));
        }
        if !(1..=20).contains(&conf.bucket_log2_size) {
            return Err(Error::InvalidInput("bucket_log2_size must be in range [1, 20]"));
        }
        let n = keys.len() as u64;
        if n == 0 {
            let (values, _) = PairRank::build(Box::new([]));
            return Ok(Self {
                global_seed: conf.seed,
                bucket_state: vec![0u64; 2].into_boxed_slice(),
                values,
                n,
                sig_width: signature_width,
                signatures: Box::new([]),
                transform: conf.transform,
                hasher: conf.hasher,
            });
        }
        let mut store = BucketStore::new(conf.transform.clone(), conf.hasher.clone(), conf.temp_dir.as_deref())?;
        let bucket_log2 = bucket_log2_for(n, conf.bucket_log2_size);
        let threads = conf.resolved_threads();
        with_reseeds(&mut store, conf.seed,
            |store| store.add_all(keys),
            |store, seed| {
                let out = run_pipeline(
                    store.buckets(bucket_log2)?, 1 << bucket_log2, &MphfSolver, threads, &mut *stats)?;
                let (values, nonzero) = PairRank::build(out.data);
                debug_assert_eq!(nonzero, n);
                let mut mphf = Self {
                    global_seed: seed,
                    bucket_state: out.bucket_state,
                    values,
                    n,
                    sig_width: 0,
                    signatures: Box::new([]),
                    transform: store.transform().clone(),
                    hasher: conf.hasher.clone(),
                };
                if signature_width > 0 {
                    let mut signatures = Box::<[u64]>::with_zeroed_bits(n as usize * signature_width as usize);
                    for bucket in store.buckets(bucket_log2)? {
                        for t in bucket?.triples() {
                            let index = mphf.lookup_by_triple(t);
                            signatures.init_fragment(
                                index as usize, t[0] & n_lowest_bits_0_64(signature_width), signature_width);
                        }
                    }
                    mphf.sig_width = signature_width;
                    mphf.signatures = signatures;
                }
                Ok(mphf)
            },
        )
    }
}

impl<T, H> Mphf<T, H> {
    #[inline] fn bucket_log2(&self) -> u8 {
        (self.bucket_state.len() - 1).trailing_zeros() as u8
    }

    /// Returns the global hash seed the structure was built with.
    #[inline] pub fn global_seed(&self) -> u64 { self.global_seed }

    /// Returns the signature width in bits (0 for unsigned structures).
    #[inline] pub fn signature_width(&self) -> u8 { self.sig_width }

    fn lookup_by_triple(&self, t: &[u64; 3]) -> u64 {
        let bucket = bucket_of(t[0], self.bucket_log2());
        let state = self.bucket_state[bucket];
        let offset = state & OFFSET_MASK;
        let variables = (self.bucket_state[bucket + 1] & OFFSET_MASK) - offset;
        if variables == 0 {
            return if self.sig_width > 0 { NOT_MEMBER } else { 0 };
        }
        let e = edge_vertices::<3>(&rehash(t, state >> (64 - SEED_BITS)), variables);
        let values = self.values.content.as_ref();
        let sum: u64 = e.iter().map(|&v| values.get_fragment((offset + v as u64) as usize, 2) % 3).sum();
        let image = offset + e[(sum % 3) as usize] as u64;
        let index = self.values.rank(image as usize);
        if self.sig_width > 0 {
            // only non-members can rank past the last key
            if index >= self.n
                || self.signatures.get_fragment(index as usize, self.sig_width)
                    != t[0] & n_lowest_bits_0_64(self.sig_width)
            {
                return NOT_MEMBER;
            }
        }
        index
    }

    /// Returns number of bytes which `write` will write.
    pub fn write_bytes(&self) -> usize {
        8 * std::mem::size_of::<u64>()
            + AsIs::array_content_size(&self.bucket_state)
            + AsIs::array_content_size(&self.values.content)
            + AsIs::array_content_size(&self.values.counts)
            + AsIs::array_content_size(&self.signatures)
    }

    /// Writes `self` to the `output`.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        AsIs::write(output, self.n)?;
        AsIs::write(output, 64 - self.bucket_log2() as u64)?;
        AsIs::write(output, 2u64)?;  // bits per variable
        AsIs::write(output, self.global_seed)?;
        AsIs::write(output, self.bucket_state.len() as u64)?;
        AsIs::write_all(output, self.bucket_state.iter())?;
        AsIs::write(output, self.values.content.len() as u64)?;
        AsIs::write_all(output, self.values.content.iter())?;
        AsIs::write(output, self.values.counts.len() as u64)?;
        AsIs::write_all(output, self.values.counts.iter())?;
        AsIs::write(output, self.sig_width as u64)?;
        AsIs::write_all(output, self.signatures.iter())
    }

    /// Reads `Self` from the `input`; `transform` and `hasher` must match the written structure.
    pub fn read_with(input: &mut dyn io::Read, transform: T, hasher: H) -> io::Result<Self> {
        let n: u64 = AsIs::read(input)?;
        let _bucket_shift: u64 = AsIs::read(input)?;
        let _bits_per_variable: u64 = AsIs::read(input)?;
        let global_seed = AsIs::read(input)?;
        let state_len: u64 = AsIs::read(input)?;
        let bucket_state = AsIs::read_n(input, state_len as usize)?;
        let content_len: u64 = AsIs::read(input)?;
        let content = AsIs::read_n(input, content_len as usize)?;
        let counts_len: u64 = AsIs::read(input)?;
        let counts = AsIs::read_n(input, counts_len as usize)?;
        let sig_width: u64 = AsIs::read(input)?;
        let signatures = AsIs::read_n(
            input, bitwords::ceiling_div(n as usize * sig_width as usize, 64))?;
        Ok(Self {
            global_seed,
            bucket_state,
            values: PairRank::from_parts(content, counts),
            n,
            sig_width: sig_width as u8,
            signatures,
            transform,
            hasher,
        })
    }
}

impl<T, H: TripleHasher> Mphf<T, H> {
    /// Returns the key's index in `[0, n)`.
    ///
    /// For keys outside the input set, an unsigned structure returns an
    /// unspecified (but safely computed) value; a signed one returns
    /// [`NOT_MEMBER`] unless the signature collides.
    #[inline] pub fn get<K: ?Sized>(&self, key: &K) -> u64 where T: Transform<K> {
        self.lookup_by_triple(&self.hasher.triple(&self.transform.to_bytes(key), self.global_seed))
    }
}

impl<K: Sync> From<&[K]> for Mphf
    where RawBytes: Transform<K>
{
    /// Builds an unsigned [`Mphf`] from the given keys.
    /// Panics if the construction fails; then it is almost certain
    /// that the input contains duplicate keys.
    fn from(keys: &[K]) -> Self {
        Self::try_new(keys)
            .expect("constructing the mphf failed; the input probably contains duplicate keys")
    }
}

impl<T, H> GetSize for Mphf<T, H> {
    fn size_bytes_dyn(&self) -> usize {
        self.bucket_state.size_bytes_dyn() + self.values.size_bytes_dyn() + self.signatures.size_bytes_dyn()
    }
    const USES_DYN_MEM: bool = true;
}

impl<K: ?Sized, T: Transform<K>, H: TripleHasher> StaticFunction<K> for Mphf<T, H> {
    #[inline] fn get(&self, key: &K) -> u64 { Mphf::get(self, key) }
    #[inline] fn size(&self) -> u64 { self.n }
    #[inline] fn num_bits(&self) -> u64 { 8 * self.size_bytes() as u64 }
}
