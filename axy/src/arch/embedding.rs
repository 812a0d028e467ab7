use ndarray::prelude::*;

/// Writes the embedding of every row of `indices` into `out`.
///
/// A row's embedding is the mean of the table entries its non-missing indices point to,
/// indices are 1-based and `0` marks a missing value. Rows with no index embed to zero.
pub fn embed_rows(table: ArrayView2<f32>, indices: ArrayView2<i64>, mut out: ArrayViewMut2<f32>) {
    for (idx, mut row) in indices.rows().into_iter().zip(out.rows_mut()) {
        row.fill(0.);
        let mut count = 0;
        for &i in idx.iter().filter(|&&i| i > 0) {
            row += &table.row(i as usize - 1);
            count += 1;
        }
        if count > 1 {
            row /= count as f32;
        }
    }
}

/// Adds the contribution of every occurrence of every index onto the table gradient.
///
/// Repeated occurrences of the same index are summed, and `usage` counts them.
pub fn accumulate_rows(
    indices: ArrayView2<i64>,
    d: ArrayView2<f32>,
    mut table_grad: ArrayViewMut2<f32>,
    usage: &mut [u32],
) {
    for (idx, d_row) in indices.rows().into_iter().zip(d.rows()) {
        let count = idx.iter().filter(|&&i| i > 0).count();
        if count == 0 {
            continue;
        }
        let share = 1. / count as f32;
        for &i in idx.iter().filter(|&&i| i > 0) {
            let k = i as usize - 1;
            table_grad.row_mut(k).scaled_add(share, &d_row);
            usage[k] += 1;
        }
    }
}
