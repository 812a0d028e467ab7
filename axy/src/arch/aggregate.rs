//! Reduction of a sample's aggregate set into one fixed width summary.
//!
//! Rows of a set of size `s` are grouped by the prefix that introduces them. Without
//! pairwise expansion row `k` belongs to prefix `k + 1`. With it, the rows of prefix `k`
//! are member `k - 1` itself, followed by its differences against every earlier member, so the
//! first `k` members always own the first `k²` expanded rows.
//!
//! The summary is `Σ_r c_r · y_r`. With a plain reduction every coefficient is `h(n)`,
//! where `n` is the expanded size and `h(n) = 1/n` for the mean or `1` for the sum. With partial
//! aggregation the summary blends the reductions of every prefix, weighting prefix `k` by
//! `k / Σj`.

use ndarray::prelude::*;

use crate::config::{Reduction, TrainingParams};

/// Sets at most this long are reduced sequentially, longer ones are split in halves.
const TREE_LEAF: usize = 8;

/// One expanded aggregate row, `rows[plus] - rows[minus]` or just `rows[plus]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expanded {
    pub plus: usize,
    pub minus: Option<usize>,
}

/// The aggregation rules of a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregation {
    pub reduction: Reduction,
    pub pairwise: bool,
    pub partial: bool,
    pub min_weight: f32,
}

impl Aggregation {
    pub fn from_params(params: &TrainingParams) -> Self {
        Self {
            reduction: params.reduction,
            pairwise: params.pairwise_aggregation,
            partial: params.partial_aggregation,
            min_weight: params.min_agg_weight,
        }
    }

    /// Rows a set of `s` members expands to.
    pub fn expanded_len(&self, s: usize) -> usize {
        if self.pairwise { s * s } else { s }
    }

    fn scale(&self, n: usize) -> f32 {
        match self.reduction {
            Reduction::Mean => 1. / n as f32,
            Reduction::Sum => 1.,
        }
    }

    /// Appends the expanded rows of a set starting at row `start`.
    pub fn expand(&self, start: usize, s: usize, out: &mut Vec<Expanded>) {
        for k in 0..s {
            out.push(Expanded {
                plus: start + k,
                minus: None,
            });
            if self.pairwise {
                for j in 0..k {
                    out.push(Expanded {
                        plus: start + k,
                        minus: Some(start + j),
                    });
                    out.push(Expanded {
                        plus: start + j,
                        minus: Some(start + k),
                    });
                }
            }
        }
    }

    /// Appends the reduction coefficient of every expanded row of a set of `s` members.
    pub fn coefficients(&self, s: usize, out: &mut Vec<f32>) {
        if s == 0 {
            return;
        }
        let n = self.expanded_len(s);
        let start = out.len();

        if !self.partial {
            out.extend(std::iter::repeat_n(self.scale(n), n));
        } else {
            // Coefficient of prefix k's rows: Σ_{j>=k} w_j·h(n_j), w_j = j / Σi.
            let total = (s * (s + 1) / 2) as f32;
            let mut by_prefix = vec![0.; s + 1];
            for k in (1..=s).rev() {
                let w = k as f32 / total;
                let next = if k < s { by_prefix[k + 1] } else { 0. };
                by_prefix[k] = next + w * self.scale(self.expanded_len(k));
            }
            for k in 1..=s {
                let rows = self.expanded_len(k) - self.expanded_len(k - 1);
                out.extend(std::iter::repeat_n(by_prefix[k], rows));
            }
        }

        if self.min_weight > 0. {
            let floor = self.min_weight * self.scale(n);
            let coeffs = &mut out[start..];
            let before: f32 = coeffs.iter().sum();
            coeffs.iter_mut().for_each(|c| *c = c.max(floor));
            let after: f32 = coeffs.iter().sum();
            if after > 0. {
                coeffs.iter_mut().for_each(|c| *c *= before / after);
            }
        }
    }
}

/// Writes `Σ_r coeffs[r] · rows[r]` into `out` summing in halves.
pub fn weighted_tree_sum(rows: ArrayView2<f32>, coeffs: &[f32], mut out: ArrayViewMut1<f32>) {
    let n = rows.nrows();
    if n <= TREE_LEAF {
        out.fill(0.);
        for (row, &c) in rows.rows().into_iter().zip(coeffs) {
            out.scaled_add(c, &row);
        }
        return;
    }

    let mid = n / 2;
    let mut right = Array1::zeros(out.len());
    weighted_tree_sum(rows.slice(s![..mid, ..]), &coeffs[..mid], out.view_mut());
    weighted_tree_sum(rows.slice(s![mid.., ..]), &coeffs[mid..], right.view_mut());
    out += &right;
}
