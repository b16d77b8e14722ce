use std::path::PathBuf;

use crate::hash::Spooky;
use crate::transform::RawBytes;

/// Build configuration accepted by all constructors.
///
/// See field descriptions for details.
#[derive(Clone)]
pub struct BuildConf<T = RawBytes, H = Spooky> {
    /// Strategy turning keys into hashed byte sequences. (default: [`RawBytes`])
    pub transform: T,

    /// The 192-bit keyed hash family. (default: [`Spooky`])
    pub hasher: H,

    /// Log₂ of the target bucket size; governs parallelism granularity
    /// and per-bucket memory. (default: `10`)
    pub bucket_log2_size: u8,

    /// Number of solver threads; `0` picks `min(available cores, 16)`.
    /// With `1`, construction runs entirely on the calling thread. (default: `0`)
    pub threads: usize,

    /// Directory for the hash store spill files;
    /// [`None`] uses the system temporary directory. (default: [`None`])
    pub temp_dir: Option<PathBuf>,

    /// If true, the store records value indices instead of values,
    /// and values are fetched through the value slice at solve time. (default: `false`)
    pub indirect: bool,

    /// Initial global hash seed. Reseeds triggered by duplicate detection
    /// derive deterministically from it. (default: `0`)
    pub seed: u64,
}

impl Default for BuildConf {
    fn default() -> Self {
        Self {
            transform: RawBytes,
            hasher: Spooky,
            bucket_log2_size: 10,
            threads: 0,
            temp_dir: None,
            indirect: false,
            seed: 0,
        }
    }
}

impl BuildConf {
    /// Returns the default configuration with the given number of solver threads.
    pub fn threads(threads: usize) -> Self {
        Self { threads, ..Default::default() }
    }

    /// Returns the default configuration with the given log₂ of the target bucket size.
    pub fn bucket_log2(bucket_log2_size: u8) -> Self {
        Self { bucket_log2_size, ..Default::default() }
    }

    /// Returns the default configuration with the given initial global seed.
    pub fn seeded(seed: u64) -> Self {
        Self { seed, ..Default::default() }
    }
}

impl<T, H> BuildConf<T, H> {
    /// Returns a configuration with a custom transform and hasher.
    pub fn with_hashing(transform: T, hasher: H) -> Self {
        Self {
            transform,
            hasher,
            bucket_log2_size: 10,
            threads: 0,
            temp_dir: None,
            indirect: false,
            seed: 0,
        }
    }

    /// Number of worker threads the pipeline will actually use.
    pub(crate) fn resolved_threads(&self) -> usize {
        if self.threads != 0 { return self.threads; }
        std::thread::available_parallelism().map_or(4, |n| n.get().min(16))
    }
}
