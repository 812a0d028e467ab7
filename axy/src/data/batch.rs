use std::ops::Range;

use super::offsets;

/// The slice of a batch handled by one worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub samples: Range<usize>,
    pub rows: Range<usize>,
}

/// Per thread windows into the sample and aggregate row spaces of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    chunks: Vec<Chunk>,
}

impl BatchPlan {
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Splits the samples of a batch among `num_threads` workers.
///
/// Every sample costs its aggregate rows plus one main network evaluation. Chunks are
/// contiguous, never split a sample's aggregate rows, and cover `[0, sizes.len())`.
/// Cut points are chosen greedily against the remaining average, which hands any
/// excess to the first threads.
///
/// # Arguments
/// * `sizes` - The number of aggregate rows of every sample.
/// * `num_threads` - The amount of workers.
///
/// # Returns
/// A plan with `min(num_threads, sizes.len())` chunks.
pub fn plan_batches(sizes: &[usize], num_threads: usize) -> BatchPlan {
    let nm = sizes.len();
    let count = num_threads.max(1).min(nm);
    let offsets = offsets(sizes);

    let mut remaining: usize = sizes.iter().map(|s| s + 1).sum();
    let mut chunks = Vec::with_capacity(count);
    let mut start = 0;

    for c in 0..count {
        let left = count - c;
        let target = remaining.div_ceil(left);
        // Every later chunk still needs one sample.
        let last = nm - (left - 1);

        let mut end = start;
        let mut work = 0;
        while end < last && (end == start || work < target) {
            work += sizes[end] + 1;
            end += 1;
        }
        if left == 1 {
            end = nm;
        }

        remaining -= (offsets[end] - offsets[start]) + (end - start);
        chunks.push(Chunk {
            samples: start..end,
            rows: offsets[start]..offsets[end],
        });
        start = end;
    }

    BatchPlan { chunks }
}
