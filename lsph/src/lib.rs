#![doc = include_str!("../README.md")]

mod error;
pub use error::{Error, Result};

pub mod hash;
pub mod transform;

mod conf;
pub use conf::BuildConf;

pub mod stats;

mod store;
pub use store::{Bucket, BucketIter, BucketStore};

mod peel;
mod f2;
mod f3;
mod orient;
mod queue;
mod build;

mod function;
pub use function::{ApproxDict, Function};

mod cfunction;
pub use cfunction::{CodecChoice, CompressedFunction};

mod mphf;
pub use mphf::{Mphf, NOT_MEMBER};

/// The capability set shared by all built structures.
pub trait StaticFunction<K: ?Sized> {
    /// Returns the value assigned to the given key.
    fn get(&self, key: &K) -> u64;

    /// Returns the number of keys in the input collection.
    fn size(&self) -> u64;

    /// Returns the approximate number of bits the structure occupies.
    fn num_bits(&self) -> u64;
}

#[cfg(test)]
pub(crate) mod testing {
    /// splitmix64 step; the tests' only source of randomness.
    pub fn splitmix(state: &mut u64) -> u64 {
        *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = *state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// `n` distinct printable keys, deterministically derived from `seed`.
    pub fn random_keys(n: usize, seed: u64) -> Vec<String> {
        let mut state = seed;
        (0..n).map(|i| format!("{:016x}-{}", splitmix(&mut state), i)).collect()
    }
}
