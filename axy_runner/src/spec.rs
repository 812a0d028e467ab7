use anyhow::{Context, Result, bail};
use axy::{Dataset, Inputs, ModelDims, TrainingParams};
use ndarray::Array2;
use serde::Deserialize;

/// An inline dataset, every matrix is a list of rows.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataSpec {
    pub ax: Vec<Vec<f32>>,
    pub axi: Vec<Vec<i64>>,
    pub sizes: Vec<usize>,
    pub x: Vec<Vec<f32>>,
    pub xi: Vec<Vec<i64>>,
    pub y: Vec<Vec<f32>>,
    pub yi: Vec<Vec<i64>>,
    pub yw: Vec<Vec<f32>>,
}

/// A whole fit run as read from disk.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSpec {
    pub dims: ModelDims,
    #[serde(default)]
    pub params: TrainingParams,
    pub steps: usize,
    #[serde(default)]
    pub record: bool,
    #[serde(default)]
    pub model_seed: Option<u64>,
    #[serde(default)]
    pub initial_shift_range: Option<f32>,
    #[serde(default)]
    pub initial_output_scale: Option<f32>,
    pub data: DataSpec,
}

fn rows<T: Clone + Default>(what: &str, rows: &[Vec<T>], nrows: usize) -> Result<Array2<T>> {
    if rows.is_empty() {
        return Ok(Array2::from_elem((nrows, 0), T::default()));
    }
    if rows.len() != nrows {
        bail!("{what} has {} rows, expected {nrows}", rows.len());
    }

    let cols = rows[0].len();
    if let Some(i) = rows.iter().position(|r| r.len() != cols) {
        bail!("row {i} of {what} has {} columns, expected {cols}", rows[i].len());
    }
    let flat: Vec<T> = rows.iter().flatten().cloned().collect();
    Array2::from_shape_vec((nrows, cols), flat).with_context(|| format!("shaping {what}"))
}

impl DataSpec {
    /// Builds the dataset, samples without aggregate rows may omit `sizes`.
    pub fn to_dataset(&self) -> Result<Dataset> {
        let nm = self.x.len().max(self.y.len());
        let sizes = if self.sizes.is_empty() {
            vec![0; nm]
        } else {
            self.sizes.clone()
        };
        if sizes.len() != nm {
            bail!("sizes has {} entries for {nm} samples", sizes.len());
        }
        let na = sizes.iter().sum();

        let inputs = Inputs::new(
            rows("ax", &self.ax, na)?,
            rows("axi", &self.axi, na)?,
            sizes,
            rows("x", &self.x, nm)?,
            rows("xi", &self.xi, nm)?,
        );
        Ok(Dataset::new(inputs, rows("y", &self.y, nm)?)
            .with_yi(rows("yi", &self.yi, nm)?)
            .with_yw(rows("yw", &self.yw, nm)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_run() {
        let spec: RunSpec = serde_json::from_str(
            r#"{
                "dims": {"mdn": 1, "mdo": 1, "mds": 4, "mns": 1},
                "params": {"seed": 3},
                "steps": 20,
                "data": {"x": [[0.0], [1.0], [2.0]], "y": [[1.0], [3.0], [5.0]]}
            }"#,
        )
        .unwrap();

        assert_eq!(spec.dims.mds, Some(4));
        assert_eq!(spec.params.seed, Some(3));
        assert!(!spec.record);

        let data = spec.data.to_dataset().unwrap();
        assert_eq!(data.nm(), 3);
        assert_eq!(data.na(), 0);
        assert_eq!(data.y.dim(), (3, 1));
        assert_eq!(data.inputs.xi.dim(), (3, 0));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let data = DataSpec {
            x: vec![vec![0.], vec![1., 2.]],
            y: vec![vec![0.], vec![1.]],
            ..Default::default()
        };
        assert!(data.to_dataset().is_err());

        let data = DataSpec {
            x: vec![vec![0.], vec![1.]],
            y: vec![vec![0.], vec![1.]],
            sizes: vec![1],
            ..Default::default()
        };
        assert!(data.to_dataset().is_err());
    }
}
