use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use binout::{AsIs, Serializer};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::hash::{Spooky, TripleHasher};
use crate::transform::{RawBytes, Transform};

/// Number of spill files; chosen so that single files comfortably fit in
/// memory for the sorting pass even for billions of keys.
const SPILL_LOG2: u8 = 8;
const SPILL_FILES: usize = 1 << SPILL_LOG2;

static STORE_ID: AtomicU64 = AtomicU64::new(0);

/// Disk-backed partitioning of (hash triple, payload) records.
///
/// Keys are streamed through the hasher and appended to one of the spill
/// files keyed by the leading bits of the triple. Iteration loads each file,
/// sorts it by triple, surfaces duplicate triples as [`Error::DuplicateKey`],
/// and regroups the records into `2^b` buckets in ascending index order.
///
/// The caller is expected to [`reset`](Self::reset) with a new seed and refill
/// on duplicates; the spill directory is removed when the store is dropped.
pub struct BucketStore<T = RawBytes, H = Spooky> {
    transform: T,
    hasher: H,
    dir: PathBuf,
    writers: Vec<Option<BufWriter<File>>>,
    seed: u64,
    len: u64,
    has_payload: bool,
}

impl<T, H> BucketStore<T, H> {
    /// Creates an empty store spilling under `temp_dir`
    /// (or the system temporary directory).
    pub fn new(transform: T, hasher: H, temp_dir: Option<&Path>) -> Result<Self> {
        let base = temp_dir.map_or_else(std::env::temp_dir, |d| d.to_path_buf());
        let dir = base.join(format!(
            "lsph-store-{}-{}", std::process::id(), STORE_ID.fetch_add(1, Ordering::Relaxed)));
        fs::create_dir_all(&dir)?;
        Ok(Self {
            transform,
            hasher,
            dir,
            writers: (0..SPILL_FILES).map(|_| None).collect(),
            seed: 0,
            len: 0,
            has_payload: false,
        })
    }

    /// Discards all records and adopts a new hash seed.
    pub fn reset(&mut self, seed: u64) -> Result<()> {
        self.writers = (0..SPILL_FILES).map(|_| None).collect();
        for f in 0..SPILL_FILES {
            let path = self.spill_path(f);
            if path.exists() { fs::remove_file(path)?; }
        }
        self.seed = seed;
        self.len = 0;
        self.has_payload = false;
        Ok(())
    }

    /// Returns the number of records added since the last reset.
    #[inline] pub fn size(&self) -> u64 { self.len }

    /// Returns the hash seed in effect.
    #[inline] pub fn seed(&self) -> u64 { self.seed }

    /// Returns the key-to-bytes strategy used.
    #[inline] pub fn transform(&self) -> &T { &self.transform }

    fn spill_path(&self, file: usize) -> PathBuf {
        self.dir.join(format!("spill-{:03}", file))
    }

    fn writer(&mut self, file: usize) -> Result<&mut BufWriter<File>> {
        if self.writers[file].is_none() {
            self.writers[file] = Some(BufWriter::new(File::create(self.spill_path(file))?));
        }
        Ok(self.writers[file].as_mut().expect("just created"))
    }

    fn push_record(&mut self, t: [u64; 3], payload: Option<u64>) -> Result<()> {
        let w = self.writer((t[0] >> (64 - SPILL_LOG2)) as usize)?;
        AsIs::write(w, t[0])?;
        AsIs::write(w, t[1])?;
        AsIs::write(w, t[2])?;
        if let Some(p) = payload { AsIs::write(w, p)?; }
        self.len += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for w in self.writers.iter_mut().flatten() { w.flush()?; }
        Ok(())
    }
}

impl<T, H: TripleHasher> BucketStore<T, H> {
    /// Streams key hashes to disk.
    pub fn add_all<K: ?Sized, I>(&mut self, keys: I) -> Result<()>
        where T: Transform<K>, I: IntoIterator, I::Item: Borrow<K>
    {
        debug_assert!(!self.has_payload || self.len == 0, "records must share one layout");
        for key in keys {
            let t = self.hasher.triple(&self.transform.to_bytes(key.borrow()), self.seed);
            self.push_record(t, None)?;
        }
        Ok(())
    }

    /// Streams key hashes to disk together with a payload word per key,
    /// computed from the key's triple and input position.
    pub fn add_all_with<K, I, P>(&mut self, keys: I, mut payload: P) -> Result<()>
        where T: Transform<K>, I: IntoIterator, I::Item: Borrow<K>, P: FnMut(&[u64; 3], usize) -> u64
    {
        debug_assert!(self.has_payload || self.len == 0, "records must share one layout");
        self.has_payload = true;
        for (i, key) in keys.into_iter().enumerate() {
            let t = self.hasher.triple(&self.transform.to_bytes(key.borrow()), self.seed);
            let p = payload(&t, i);
            self.push_record(t, Some(p))?;
        }
        Ok(())
    }

    /// Returns an iterator over the `2^bucket_log2` buckets, in ascending index
    /// order, empty buckets included. Duplicate triples surface as errors.
    pub fn buckets(&mut self, bucket_log2: u8) -> Result<BucketIter> {
        self.flush()?;
        Ok(BucketIter {
            dir: self.dir.clone(),
            has_payload: self.has_payload,
            bucket_log2,
            next_bucket: 0,
            pending: VecDeque::new(),
        })
    }
}

impl<T, H> Drop for BucketStore<T, H> {
    fn drop(&mut self) {
        self.writers.clear();
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// One partition of the key set: the ordinal index, the sorted triples,
/// and the parallel payload list (empty if none was stored).
pub struct Bucket {
    pub index: usize,
    triples: Vec<[u64; 3]>,
    payloads: Vec<u64>,
}

impl Bucket {
    #[inline] pub fn len(&self) -> usize { self.triples.len() }
    #[inline] pub fn is_empty(&self) -> bool { self.triples.is_empty() }
    /// The triples assigned to this bucket, sorted.
    #[inline] pub fn triples(&self) -> &[[u64; 3]] { &self.triples }
    /// The payload words parallel to [`triples`](Self::triples).
    #[inline] pub fn payloads(&self) -> &[u64] { &self.payloads }

    /// Decomposes the bucket into its index, triples and payloads.
    #[inline] pub fn into_parts(self) -> (usize, Vec<[u64; 3]>, Vec<u64>) {
        (self.index, self.triples, self.payloads)
    }
}

/// Iterator over store buckets in ascending index order.
pub struct BucketIter {
    dir: PathBuf,
    has_payload: bool,
    bucket_log2: u8,
    next_bucket: usize,
    pending: VecDeque<Bucket>,
}

/// Bucket of the given triple: its leading `bucket_log2` bits.
#[inline(always)] pub(crate) fn bucket_of(t0: u64, bucket_log2: u8) -> usize {
    if bucket_log2 == 0 { 0 } else { (t0 >> (64 - bucket_log2)) as usize }
}

impl BucketIter {
    /// Loads and sorts the records of the given spill file; duplicate triples are errors.
    fn load_sorted(&self, file: usize) -> Result<Vec<([u64; 3], u64)>> {
        let path = self.dir.join(format!("spill-{:03}", file));
        if !path.exists() { return Ok(Vec::new()); }
        let bytes = fs::read(path)?;
        let rec_words = if self.has_payload { 4 } else { 3 };
        if bytes.len() % (8 * rec_words) != 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData, "truncated spill file")));
        }
        let mut records = Vec::with_capacity(bytes.len() / (8 * rec_words));
        let mut input = &bytes[..];
        while !input.is_empty() {
            let t = [AsIs::read(&mut input)?, AsIs::read(&mut input)?, AsIs::read(&mut input)?];
            let p = if self.has_payload { AsIs::read(&mut input)? } else { 0 };
            records.push((t, p));
        }
        records.par_sort_unstable_by_key(|r| r.0);
        if records.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(Error::DuplicateKey);
        }
        Ok(records)
    }

    fn bucket_from_records(&self, index: usize, records: Vec<([u64; 3], u64)>) -> Bucket {
        let (triples, payloads) = records.into_iter().unzip();
        Bucket {
            index,
            triples,
            payloads: if self.has_payload { payloads } else { Vec::new() },
        }
    }

    fn next_bucket(&mut self) -> Result<Option<Bucket>> {
        if let Some(b) = self.pending.pop_front() {
            self.next_bucket += 1;
            return Ok(Some(b));
        }
        let bucket_count = 1usize << self.bucket_log2;
        if self.next_bucket >= bucket_count { return Ok(None); }
        let index = self.next_bucket;
        if self.bucket_log2 <= SPILL_LOG2 {
            // one bucket covers a whole group of consecutive spill files
            let files_per_bucket = SPILL_FILES >> self.bucket_log2;
            let mut records = Vec::new();
            for f in index * files_per_bucket..(index + 1) * files_per_bucket {
                records.append(&mut self.load_sorted(f)?);
            }
            records.par_sort_unstable_by_key(|r| r.0);
            if records.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(Error::DuplicateKey);
            }
            self.next_bucket += 1;
            Ok(Some(self.bucket_from_records(index, records)))
        } else {
            // one spill file splits into a run of consecutive buckets
            let buckets_per_file = bucket_count >> SPILL_LOG2;
            let file = index / buckets_per_file;
            let records = self.load_sorted(file)?;
            let mut runs: Vec<Vec<([u64; 3], u64)>> = (0..buckets_per_file).map(|_| Vec::new()).collect();
            let first = file * buckets_per_file;
            for r in records {
                runs[bucket_of(r.0[0], self.bucket_log2) - first].push(r);
            }
            for (i, run) in runs.into_iter().enumerate() {
                self.pending.push_back(self.bucket_from_records(first + i, run));
            }
            let b = self.pending.pop_front().expect("file split yields at least one bucket");
            self.next_bucket += 1;
            Ok(Some(b))
        }
    }
}

impl Iterator for BucketIter {
    type Item = Result<Bucket>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_bucket().transpose()
    }
}

/// Number of bucket index bits for `n` keys and a target bucket size of
/// `2^bucket_log2_size` keys.
pub(crate) fn bucket_log2_for(n: u64, bucket_log2_size: u8) -> u8 {
    let groups = n >> bucket_log2_size;
    if groups <= 1 { 0 } else { groups.ilog2() as u8 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BucketStore {
        BucketStore::new(RawBytes, Spooky, None).unwrap()
    }

    #[test]
    fn groups_all_keys() {
        let keys: Vec<String> = (0..5000).map(|i| format!("key-{}", i)).collect();
        let mut s = store();
        s.reset(42).unwrap();
        s.add_all_with::<String, _, _>(&keys, |_, i| i as u64).unwrap();
        assert_eq!(s.size(), 5000);
        assert_eq!(s.seed(), 42);
        for &b in &[0u8, 2, 10] {
            let mut seen = 0usize;
            let mut expected_index = 0usize;
            for bucket in s.buckets(b).unwrap() {
                let bucket = bucket.unwrap();
                assert_eq!(bucket.index, expected_index);
                expected_index += 1;
                for (t, &p) in bucket.triples().iter().zip(bucket.payloads()) {
                    assert_eq!(bucket_of(t[0], b), bucket.index);
                    let expect = Spooky.triple(keys[p as usize].as_bytes(), 42);
                    assert_eq!(*t, expect);
                }
                seen += bucket.len();
            }
            assert_eq!(expected_index, 1usize << b);
            assert_eq!(seen, 5000);
        }
    }

    #[test]
    fn detects_duplicates() {
        let mut s = store();
        s.reset(7).unwrap();
        s.add_all::<str, _>(["a", "b", "a", "c"]).unwrap();
        let r: Result<Vec<Bucket>> = s.buckets(0).unwrap().collect();
        assert!(matches!(r, Err(Error::DuplicateKey)));
    }

    #[test]
    fn reset_discards() {
        let mut s = store();
        s.reset(1).unwrap();
        s.add_all::<str, _>(["x", "y"]).unwrap();
        s.reset(2).unwrap();
        assert_eq!(s.size(), 0);
        s.add_all::<str, _>(["z"]).unwrap();
        let buckets: Result<Vec<Bucket>> = s.buckets(0).unwrap().collect();
        let buckets = buckets.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].len(), 1);
        assert_eq!(buckets[0].triples()[0], Spooky.triple(b"z", 2));
    }

    #[test]
    fn empty_store_yields_empty_buckets() {
        let mut s = store();
        s.reset(0).unwrap();
        let buckets: Result<Vec<Bucket>> = s.buckets(3).unwrap().collect();
        let buckets = buckets.unwrap();
        assert_eq!(buckets.len(), 8);
        assert!(buckets.iter().all(|b| b.is_empty()));
    }

    #[test]
    fn bucket_log2_choice() {
        assert_eq!(bucket_log2_for(0, 10), 0);
        assert_eq!(bucket_log2_for(1000, 10), 0);
        assert_eq!(bucket_log2_for(2048, 10), 1);
        assert_eq!(bucket_log2_for(1 << 20, 10), 10);
    }
}
