use std::ops::Range;

use ndarray::prelude::*;

/// Prefix offsets of a `sizes` vector, `offsets[i]..offsets[i + 1]` are the aggregate rows of
/// sample `i`.
pub fn offsets(sizes: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    let mut at = 0;
    offsets.push(at);
    for &s in sizes {
        at += s;
        offsets.push(at);
    }
    offsets
}

/// Restricts a row indexed array, arrays left empty for an absent feature stay as they are.
fn slice_rows<T>(a: ArrayView2<'_, T>, rows: Range<usize>) -> ArrayView2<'_, T> {
    if a.nrows() == 0 { a } else { a.slice_move(s![rows, ..]) }
}

/// The inputs of a ragged dataset.
///
/// `ax`/`axi` hold the aggregate rows of every sample back to back, `sizes[i]` of them
/// belong to sample `i`. `x`/`xi` hold one row per sample. Categorical indices are
/// 1-based, `0` marks a missing value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    pub ax: Array2<f32>,
    pub axi: Array2<i64>,
    pub sizes: Vec<usize>,
    pub x: Array2<f32>,
    pub xi: Array2<i64>,
}

impl Inputs {
    /// Creates inputs with aggregate sets.
    pub fn new(
        ax: Array2<f32>,
        axi: Array2<i64>,
        sizes: Vec<usize>,
        x: Array2<f32>,
        xi: Array2<i64>,
    ) -> Self {
        Self {
            ax,
            axi,
            sizes,
            x,
            xi,
        }
    }

    /// Creates inputs holding only fixed numeric values, one row per sample.
    pub fn from_x(x: Array2<f32>) -> Self {
        let nm = x.nrows();
        Self {
            ax: Array2::zeros((0, 0)),
            axi: Array2::zeros((0, 0)),
            sizes: vec![0; nm],
            xi: Array2::zeros((nm, 0)),
            x,
        }
    }

    /// Number of samples.
    pub fn nm(&self) -> usize {
        self.sizes.len()
    }

    /// Number of aggregate rows.
    pub fn na(&self) -> usize {
        self.ax.nrows()
    }

    pub fn view(&self) -> InputsView<'_> {
        InputsView {
            ax: self.ax.view(),
            axi: self.axi.view(),
            sizes: &self.sizes,
            x: self.x.view(),
            xi: self.xi.view(),
        }
    }
}

/// A supervised ragged dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub inputs: Inputs,
    pub y: Array2<f32>,
    pub yi: Array2<i64>,
    /// Loss weights with 0 (unweighted), 1 (per sample) or `mdo` (per output) columns.
    pub yw: Array2<f32>,
}

impl Dataset {
    /// Creates an unweighted dataset without categorical targets.
    pub fn new(inputs: Inputs, y: Array2<f32>) -> Self {
        let nm = y.nrows();
        Self {
            inputs,
            y,
            yi: Array2::zeros((nm, 0)),
            yw: Array2::zeros((nm, 0)),
        }
    }

    /// Replaces the categorical targets.
    pub fn with_yi(mut self, yi: Array2<i64>) -> Self {
        self.yi = yi;
        self
    }

    /// Replaces the loss weights.
    pub fn with_yw(mut self, yw: Array2<f32>) -> Self {
        self.yw = yw;
        self
    }

    pub fn nm(&self) -> usize {
        self.inputs.nm()
    }

    pub fn na(&self) -> usize {
        self.inputs.na()
    }

    pub fn view(&self) -> DatasetView<'_> {
        DatasetView {
            inputs: self.inputs.view(),
            y: self.y.view(),
            yi: self.yi.view(),
            yw: self.yw.view(),
        }
    }
}

/// A borrowed window over dataset inputs.
#[derive(Debug, Clone, Copy)]
pub struct InputsView<'a> {
    pub ax: ArrayView2<'a, f32>,
    pub axi: ArrayView2<'a, i64>,
    pub sizes: &'a [usize],
    pub x: ArrayView2<'a, f32>,
    pub xi: ArrayView2<'a, i64>,
}

impl<'a> InputsView<'a> {
    pub fn nm(&self) -> usize {
        self.sizes.len()
    }

    pub fn na(&self) -> usize {
        self.ax.nrows()
    }

    /// Restricts the view to a range of samples and their aggregate rows.
    ///
    /// # Arguments
    /// * `samples` - The sample range.
    /// * `rows` - The aggregate rows of exactly those samples.
    pub fn slice(&self, samples: Range<usize>, rows: Range<usize>) -> Self {
        Self {
            ax: slice_rows(self.ax, rows.clone()),
            axi: slice_rows(self.axi, rows),
            sizes: &self.sizes[samples.clone()],
            x: slice_rows(self.x, samples.clone()),
            xi: slice_rows(self.xi, samples),
        }
    }
}

/// A borrowed window over a supervised dataset.
#[derive(Debug, Clone, Copy)]
pub struct DatasetView<'a> {
    pub inputs: InputsView<'a>,
    pub y: ArrayView2<'a, f32>,
    pub yi: ArrayView2<'a, i64>,
    pub yw: ArrayView2<'a, f32>,
}

impl<'a> DatasetView<'a> {
    pub fn nm(&self) -> usize {
        self.inputs.nm()
    }

    /// Restricts the view to a range of samples and their aggregate rows.
    pub fn slice(&self, samples: Range<usize>, rows: Range<usize>) -> Self {
        Self {
            inputs: self.inputs.slice(samples.clone(), rows),
            y: slice_rows(self.y, samples.clone()),
            yi: slice_rows(self.yi, samples.clone()),
            yw: slice_rows(self.yw, samples),
        }
    }

    /// Loss weight of output `j` of sample `i`.
    pub fn weight(&self, i: usize, j: usize) -> f32 {
        match self.yw.ncols() {
            0 => 1.,
            1 => self.yw[[i, 0]],
            _ => self.yw[[i, j]],
        }
    }

    /// Loss weight applied to the categorical terms of sample `i`.
    pub fn sample_weight(&self, i: usize) -> f32 {
        match self.yw.ncols() {
            0 => 1.,
            1 => self.yw[[i, 0]],
            _ => self.yw.row(i).mean().unwrap_or(1.),
        }
    }
}
