use std::mem;

use ndarray::Array2;
use rand::{Rng, seq::SliceRandom};

use super::Dataset;
use crate::arch::InplaceReshape;

/// Chooses the samples of the next batch inside a reused index buffer.
///
/// With `reshuffle` a fresh random subset is drawn, otherwise a window that wraps
/// around the dataset advances by `batch` samples per call. `order` holds a permutation
/// of `0..order.len()` before and after the call.
///
/// # Arguments
/// * `order` - One index per dataset sample.
/// * `batch` - Samples per batch.
/// * `reshuffle` - Whether to draw random subsets.
/// * `cursor` - Start of the next window, advanced in place.
/// * `rng` - A random number generator.
///
/// # Returns
/// The chosen samples in increasing order for random subsets, window order otherwise.
pub fn select_samples<'a, R: Rng>(
    order: &'a mut [usize],
    batch: usize,
    reshuffle: bool,
    cursor: &mut usize,
    rng: &mut R,
) -> &'a [usize] {
    let nm = order.len();
    let batch = batch.min(nm);
    if nm == 0 {
        return order;
    }

    if reshuffle {
        let (picked, _) = order.partial_shuffle(rng, batch);
        picked.sort_unstable();
        return picked;
    }

    let start = *cursor % nm;
    *cursor = (start + batch) % nm;
    order
        .iter_mut()
        .enumerate()
        .for_each(|(i, o)| *o = (start + i) % nm);
    &order[..batch]
}

/// Copies the given rows of `src` into `dst`, arrays left empty for an absent feature stay
/// empty.
fn pick_into<T: Clone + Default>(dst: &mut Array2<T>, src: &Array2<T>, rows: &[usize]) {
    let n = if src.nrows() == 0 { 0 } else { rows.len() };
    *dst = mem::take(dst).into_reshape((n, src.ncols()));
    if n == 0 {
        return;
    }
    for (mut out, &r) in dst.rows_mut().into_iter().zip(rows) {
        out.assign(&src.row(r));
    }
}

/// A batch gathered out of a dataset, its arrays are reshaped rather than reallocated
/// from one step to the next.
#[derive(Debug, Clone, Default)]
pub struct BatchBuffer {
    batch: Dataset,
    rows: Vec<usize>,
    offsets: Vec<usize>,
}

impl BatchBuffer {
    /// Gathers samples and their aggregate rows.
    ///
    /// # Arguments
    /// * `data` - The source dataset.
    /// * `samples` - Indices of the samples to copy, in output order.
    /// * `shuffle_rows` - When given, the aggregate rows of every sample are permuted.
    ///
    /// # Returns
    /// The gathered batch.
    pub fn gather<R: Rng>(
        &mut self,
        data: &Dataset,
        samples: &[usize],
        mut shuffle_rows: Option<&mut R>,
    ) -> &Dataset {
        let inputs = &data.inputs;
        self.offsets.clear();
        self.offsets.push(0);
        let mut at = 0;
        for &s in &inputs.sizes {
            at += s;
            self.offsets.push(at);
        }

        let batch = &mut self.batch;
        self.rows.clear();
        batch.inputs.sizes.clear();
        for &i in samples {
            let start = self.rows.len();
            self.rows.extend(self.offsets[i]..self.offsets[i + 1]);
            if let Some(rng) = shuffle_rows.as_deref_mut() {
                self.rows[start..].shuffle(rng);
            }
            batch.inputs.sizes.push(inputs.sizes[i]);
        }

        pick_into(&mut batch.inputs.ax, &inputs.ax, &self.rows);
        pick_into(&mut batch.inputs.axi, &inputs.axi, &self.rows);
        pick_into(&mut batch.inputs.x, &inputs.x, samples);
        pick_into(&mut batch.inputs.xi, &inputs.xi, samples);
        pick_into(&mut batch.y, &data.y, samples);
        pick_into(&mut batch.yi, &data.yi, samples);
        pick_into(&mut batch.yw, &data.yw, samples);
        batch
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, array};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::data::Inputs;

    fn dataset() -> Dataset {
        let ax = array![[0.], [1.], [2.], [3.], [4.], [5.]];
        let axi = array![[0], [1], [2], [3], [4], [5]];
        let inputs = Inputs::new(ax, axi, vec![1, 2, 3], array![[10.], [11.], [12.]], Array2::zeros((3, 0)));
        Dataset::new(inputs, array![[0.], [1.], [2.]])
    }

    #[test]
    fn windows_wrap_around() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut order: Vec<usize> = (0..5).collect();
        let mut cursor = 0;

        assert_eq!(select_samples(&mut order, 3, false, &mut cursor, &mut rng), &[0, 1, 2]);
        assert_eq!(select_samples(&mut order, 3, false, &mut cursor, &mut rng), &[3, 4, 0]);
        assert_eq!(cursor, 1);
    }

    #[test]
    fn random_subsets_are_sorted_and_unique() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut order: Vec<usize> = (0..100).collect();
        let mut cursor = 0;

        for _ in 0..5 {
            let picked = select_samples(&mut order, 10, true, &mut cursor, &mut rng).to_vec();
            assert_eq!(picked.len(), 10);
            assert!(picked.windows(2).all(|w| w[0] < w[1]));
        }

        // The buffer is still a permutation after repeated draws.
        order.sort_unstable();
        assert!(order.iter().enumerate().all(|(i, &o)| i == o));
    }

    #[test]
    fn gather_keeps_sets_with_their_sample() {
        let data = dataset();
        let mut buffer = BatchBuffer::default();
        let batch = buffer.gather::<StdRng>(&data, &[2, 0], None);

        assert_eq!(batch.inputs.sizes, vec![3, 1]);
        assert_eq!(batch.inputs.ax.column(0).to_vec(), vec![3., 4., 5., 0.]);
        assert_eq!(batch.inputs.x.column(0).to_vec(), vec![12., 10.]);
        assert_eq!(batch.y.column(0).to_vec(), vec![2., 0.]);
        assert_eq!(batch.inputs.xi.dim(), (2, 0));
    }

    #[test]
    fn gathering_again_reuses_the_buffer() {
        let data = dataset();
        let mut buffer = BatchBuffer::default();
        buffer.gather::<StdRng>(&data, &[0, 1, 2], None);

        let batch = buffer.gather::<StdRng>(&data, &[1], None);
        assert_eq!(batch.inputs.sizes, vec![2]);
        assert_eq!(batch.inputs.ax.column(0).to_vec(), vec![1., 2.]);
        assert_eq!(batch.inputs.axi.column(0).to_vec(), vec![1, 2]);
        assert_eq!(batch.y.dim(), (1, 1));
    }

    #[test]
    fn shuffling_stays_inside_each_set() {
        let data = dataset();
        let mut rng = StdRng::seed_from_u64(3);
        let mut buffer = BatchBuffer::default();
        let shuffled = buffer.gather(&data, &[0, 1, 2], Some(&mut rng));

        let mut last: Vec<f32> = shuffled.inputs.ax.column(0).iter().skip(3).copied().collect();
        last.sort_by(f32::total_cmp);
        assert_eq!(last, vec![3., 4., 5.]);
        assert_eq!(shuffled.inputs.ax[[0, 0]], 0.);
        assert_eq!(shuffled.inputs.axi[[0, 0]], 0);
    }
}
