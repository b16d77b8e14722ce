//! The per-bucket construction pipeline: a producer walking store buckets in
//! order, a fixed pool of solver workers retrying local seeds, and a single
//! appender draining a reordering queue so the packed variable vector is
//! concatenated strictly in ascending bucket order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Mutex;

use bitwords::{ceiling_div, BitAccess};

use crate::error::{Error, Result};
use crate::queue::ReorderingQueue;
use crate::stats::BuildStatsCollector;
use crate::store::Bucket;

/// Upper bits of a bucket-state word hold the accepted local seed,
/// the rest the cumulative variable offset. Seed 0 denotes "not yet solved".
pub(crate) const SEED_BITS: u8 = 8;
pub(crate) const OFFSET_MASK: u64 = (1 << (64 - SEED_BITS)) - 1;
pub(crate) const MAX_LOCAL_SEED: u64 = (1 << SEED_BITS) - 1;

/// Per-bucket solving strategy of one artifact kind.
pub(crate) trait BucketSolver: Sync {
    /// Number of variables the bucket occupies in the global vector.
    fn variables(&self, triples: &[[u64; 3]], payloads: &[u64]) -> u64;

    /// Bits each variable occupies in the packed vector.
    fn bits_per_variable(&self) -> u8;

    /// Packed solution (at [`bits_per_variable`](Self::bits_per_variable) bits
    /// per variable) for the bucket under the given local seed, or [`None`]
    /// if the bucket's system was unsolvable under this seed.
    fn solve(&self, triples: &[[u64; 3]], payloads: &[u64], seed: u64, variables: u64) -> Option<Vec<u64>>;
}

pub(crate) struct PipelineOutput {
    /// `bucket_count + 1` words: seed in the upper bits, cumulative offset below.
    pub bucket_state: Box<[u64]>,
    /// The packed variable vector of all buckets, concatenated.
    pub data: Box<[u64]>,
}

/// Appends `src_bits` bits of `src` to the growing bit vector `dst`.
pub(crate) fn push_bits(dst: &mut Vec<u64>, dst_bits: &mut usize, src: &[u64], src_bits: usize) {
    let mut copied = 0;
    while copied < src_bits {
        let len = (src_bits - copied).min(64) as u8;
        let w = src.get_bits64(copied, len);
        let needed = ceiling_div(*dst_bits + len as usize, 64);
        while dst.len() < needed { dst.push(0); }
        dst.as_mut_slice().init_bits64(*dst_bits, w, len);
        *dst_bits += len as usize;
        copied += len as usize;
    }
}

/// Tries local seeds in ascending order until the bucket's system solves.
fn solve_bucket<S: BucketSolver>(
    solver: &S, index: usize, triples: &[[u64; 3]], payloads: &[u64], variables: u64,
) -> Result<(u64, u16, Vec<u64>)> {
    if variables == 0 { return Ok((0, 0, Vec::new())); }
    for seed in 1..=MAX_LOCAL_SEED {
        if let Some(words) = solver.solve(triples, payloads, seed, variables) {
            return Ok((seed, seed as u16, words));
        }
    }
    Err(Error::Unsolvable { bucket: index })
}

struct Job {
    index: usize,
    triples: Vec<[u64; 3]>,
    payloads: Vec<u64>,
    variables: u64,
}

/// Runs the pipeline over `bucket_count` store buckets.
///
/// With `threads <= 1` everything runs on the calling thread; the output is
/// identical either way.
pub(crate) fn run_pipeline<S, B, BS>(
    buckets: B,
    bucket_count: usize,
    solver: &S,
    threads: usize,
    stats: &mut BS,
) -> Result<PipelineOutput>
where
    S: BucketSolver,
    B: Iterator<Item = Result<Bucket>>,
    BS: BuildStatsCollector,
{
    if threads <= 1 {
        return run_sequential(buckets, bucket_count, solver, stats);
    }
    let bits_per_var = solver.bits_per_variable();
    let state = Mutex::new(vec![0u64; bucket_count + 1]);
    let error: Mutex<Option<Error>> = Mutex::new(None);
    let stop = AtomicBool::new(false);
    let stats = Mutex::new(stats);
    let queue = ReorderingQueue::<(Vec<u64>, usize)>::new(threads * 128);
    let (sender, receiver) = sync_channel::<Job>(2 * threads);
    let receiver: Mutex<Receiver<Job>> = Mutex::new(receiver);

    let set_error = |e: Error| {
        let mut slot = error.lock().expect("error slot poisoned");
        if slot.is_none() { *slot = Some(e); }
        stop.store(true, Ordering::Relaxed);
        queue.cancel();
    };

    let data = std::thread::scope(|scope| {
        let consumer = scope.spawn(|| {
            let mut data = Vec::new();
            let mut bits = 0usize;
            for _ in 0..bucket_count {
                match queue.take() {
                    Some((words, bit_len)) => push_bits(&mut data, &mut bits, &words, bit_len),
                    None => break,
                }
            }
            data
        });
        for _ in 0..threads {
            // workers keep draining the channel after an error so the producer
            // is never left blocked on a full channel
            scope.spawn(|| loop {
                let job = match receiver.lock().expect("job channel poisoned").recv() {
                    Ok(job) => job,
                    Err(_) => break,
                };
                if stop.load(Ordering::Relaxed) { continue; }
                let solved = catch_unwind(AssertUnwindSafe(|| solve_bucket(
                    solver, job.index, &job.triples, &job.payloads, job.variables)));
                match solved {
                    Ok(Ok((seed, attempts, words))) => {
                        {
                            let mut state = state.lock().expect("bucket state poisoned");
                            state[job.index] |= seed << (64 - SEED_BITS);
                        }
                        stats.lock().expect("stats poisoned")
                            .bucket(job.index, job.triples.len(), attempts);
                        let bit_len = (job.variables * bits_per_var as u64) as usize;
                        queue.put(job.index, (words, bit_len));
                    }
                    Ok(Err(e)) => set_error(e),
                    Err(_) => set_error(Error::Internal("construction worker panicked".into())),
                }
            });
        }

        // the calling thread is the producer
        let mut offset = 0u64;
        for bucket in buckets {
            if stop.load(Ordering::Relaxed) { break; }
            match bucket {
                Err(e) => { set_error(e); break; }
                Ok(bucket) => {
                    let (index, triples, payloads) = bucket.into_parts();
                    let variables = solver.variables(&triples, &payloads);
                    if offset + variables > OFFSET_MASK {
                        set_error(Error::InvalidInput("variable space exceeds the offset range"));
                        break;
                    }
                    offset += variables;
                    state.lock().expect("bucket state poisoned")[index + 1] = offset;
                    if sender.send(Job { index, triples, payloads, variables }).is_err() {
                        break; // every worker is gone
                    }
                }
            }
        }
        drop(sender);
        match consumer.join() {
            Ok(data) => data,
            Err(_) => { set_error(Error::Internal("appender panicked".into())); Vec::new() }
        }
    });

    if let Some(e) = error.lock().expect("error slot poisoned").take() {
        return Err(e);
    }
    stats.lock().expect("stats poisoned").end();
    Ok(PipelineOutput {
        bucket_state: state.into_inner().expect("bucket state poisoned").into_boxed_slice(),
        data: data.into_boxed_slice(),
    })
}

fn run_sequential<S, B, BS>(
    buckets: B,
    bucket_count: usize,
    solver: &S,
    stats: &mut BS,
) -> Result<PipelineOutput>
where
    S: BucketSolver,
    B: Iterator<Item = Result<Bucket>>,
    BS: BuildStatsCollector,
{
    let bits_per_var = solver.bits_per_variable();
    let mut state = vec![0u64; bucket_count + 1];
    let mut data = Vec::new();
    let mut bits = 0usize;
    let mut offset = 0u64;
    for bucket in buckets {
        let bucket = bucket?;
        let variables = solver.variables(bucket.triples(), bucket.payloads());
        if offset + variables > OFFSET_MASK {
            return Err(Error::InvalidInput("variable space exceeds the offset range"));
        }
        offset += variables;
        state[bucket.index + 1] = offset;
        let (seed, attempts, words) =
            solve_bucket(solver, bucket.index, bucket.triples(), bucket.payloads(), variables)?;
        state[bucket.index] |= seed << (64 - SEED_BITS);
        stats.bucket(bucket.index, bucket.len(), attempts);
        push_bits(&mut data, &mut bits, &words, (variables * bits_per_var as u64) as usize);
    }
    stats.end();
    Ok(PipelineOutput {
        bucket_state: state.into_boxed_slice(),
        data: data.into_boxed_slice(),
    })
}
