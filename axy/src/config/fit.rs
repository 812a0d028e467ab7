use super::{Dims, ModelLayout};

/// Data size dependent part of a configuration, filled by `new_fit_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitSizes {
    /// Samples in the whole dataset.
    pub nm: usize,
    /// Aggregate rows in the whole dataset.
    pub na: usize,
    /// Samples evaluated per step.
    pub batch: usize,
    /// Worker threads used per step, never more than `batch`.
    pub num_threads: usize,
    /// Length of the float scratch held by the work buffers.
    pub rwork_size: usize,
    /// Length of the integer scratch held by the work buffers.
    pub iwork_size: usize,
}

impl FitSizes {
    /// Derives every size from the model shape and the dataset counts.
    ///
    /// # Arguments
    /// * `dims` - The resolved model dimensions.
    /// * `layout` - The model's offset table.
    /// * `nm` - Number of samples.
    /// * `na` - Number of aggregate rows.
    /// * `max_batch` - Upper bound of samples per step.
    pub fn new(dims: &Dims, layout: &ModelLayout, nm: usize, na: usize, max_batch: usize) -> Self {
        let batch = nm.min(max_batch);
        let num_threads = dims.num_threads.min(batch).max(1);

        let nv = layout.num_vars;
        let rwork_size = 7 * nv + 2 * layout.total_size + num_threads * nv;

        let counters = embedding_rows(dims) + neurons(layout);
        let iwork_size = (num_threads + 1) * counters + nm;

        Self {
            nm,
            na,
            batch,
            num_threads,
            rwork_size,
            iwork_size,
        }
    }
}

/// Total number of embedding rows across the three tables.
pub fn embedding_rows(dims: &Dims) -> usize {
    dims.ane + dims.mne + dims.noe
}

/// Total number of internal neurons across both networks.
pub fn neurons(layout: &ModelLayout) -> usize {
    layout.agg.neurons() + layout.main.neurons()
}
