use ndarray::ArrayView2;

use super::{Dataset, Inputs};
use crate::{
    config::ModelConfig,
    error::{AxyErr, Result},
    model::Model,
};

fn expect_size(a: &'static str, b: &'static str, got: usize, expected: usize) -> Result<()> {
    if got == expected {
        Ok(())
    } else {
        Err(AxyErr::SizeMismatch {
            a,
            b,
            got,
            expected,
        })
    }
}

fn expect_finite(what: &'static str, values: ArrayView2<f32>) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(AxyErr::NonFinite { what })
    }
}

/// Checks the shape of a categorical index matrix and that every index is in `[0, table]`.
fn expect_indices(
    what: &'static str,
    indices: ArrayView2<i64>,
    rows: usize,
    table: usize,
) -> Result<()> {
    if table == 0 {
        if indices.nrows() > 0 && indices.ncols() > 0 {
            return expect_size(what, "embedding table size", indices.ncols(), 0);
        }
        return Ok(());
    }

    expect_size(what, "rows", indices.nrows(), rows)?;
    if rows > 0 && indices.ncols() == 0 {
        return Err(AxyErr::SizeMismatch {
            a: what,
            b: "embedding columns",
            got: 0,
            expected: 1,
        });
    }

    match indices.iter().find(|&&i| i < 0 || i as usize > table) {
        Some(&index) => Err(AxyErr::IndexOutOfRange {
            what,
            index,
            max: table,
        }),
        None => Ok(()),
    }
}

/// Checks model and input arrays against a configuration, targets are not required.
///
/// # Returns
/// A shape family error describing the first mismatch found.
pub fn check_inputs(config: &ModelConfig, model: &Model, inputs: &Inputs) -> Result<()> {
    let dims = config.dims();
    expect_size("model", "total_size", model.len(), config.total_size())?;

    let nm = inputs.nm();
    let na: usize = inputs.sizes.iter().sum();
    expect_size("sum(sizes)", "ax rows", inputs.ax.nrows(), na)?;
    if na > 0 {
        if !dims.has_aggregator() {
            return expect_size("ax rows", "aggregator inputs", na, 0);
        }
        expect_size("ax columns", "adn", inputs.ax.ncols(), dims.adn)?;
        expect_finite("ax", inputs.ax.view())?;
    }
    expect_indices("axi", inputs.axi.view(), na, dims.ane)?;

    expect_size("x rows", "sizes", inputs.x.nrows(), nm)?;
    expect_size("x columns", "mdn", inputs.x.ncols(), dims.mdn)?;
    expect_finite("x", inputs.x.view())?;
    expect_indices("xi", inputs.xi.view(), nm, dims.mne)?;

    Ok(())
}

/// Checks a supervised dataset against a configuration before any computation begins.
///
/// # Returns
/// A shape family error describing the first mismatch found.
pub fn check_shape(config: &ModelConfig, model: &Model, data: &Dataset) -> Result<()> {
    check_inputs(config, model, &data.inputs)?;

    let dims = config.dims();
    let nm = data.nm();

    expect_size("y rows", "sizes", data.y.nrows(), nm)?;
    expect_size("y columns", "mdo", data.y.ncols(), dims.mdo)?;
    expect_finite("y", data.y.view())?;

    if dims.noc > 0 {
        expect_size("yi rows", "sizes", data.yi.nrows(), nm)?;
        expect_size("yi columns", "noc", data.yi.ncols(), dims.noc)?;
        expect_indices("yi", data.yi.view(), nm, dims.noe)?;
    } else if data.yi.ncols() > 0 && data.yi.nrows() > 0 {
        expect_size("yi columns", "noc", data.yi.ncols(), 0)?;
    }

    match data.yw.ncols() {
        0 => {}
        1 => expect_size("yw rows", "sizes", data.yw.nrows(), nm)?,
        cols => {
            expect_size("yw rows", "sizes", data.yw.nrows(), nm)?;
            expect_size("yw columns", "mdo", cols, dims.mdo)?;
        }
    }
    if data.yw.iter().any(|w| !w.is_finite() || *w < 0.) {
        return Err(AxyErr::NonFinite { what: "yw" });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, array};

    use super::*;
    use crate::config::{ModelDims, TrainingParams, new_model_config};

    fn config() -> ModelConfig {
        let dims = ModelDims {
            adn: 1,
            mdn: 1,
            mdo: 1,
            ane: Some(3),
            ads: Some(2),
            ans: Some(1),
            ..Default::default()
        };
        new_model_config(&dims, TrainingParams::default()).unwrap()
    }

    fn dataset() -> Dataset {
        let inputs = Inputs::new(
            array![[0.], [1.], [2.]],
            array![[1], [0], [3]],
            vec![1, 2],
            array![[0.], [1.]],
            Array2::zeros((2, 0)),
        );
        Dataset::new(inputs, array![[0.], [1.]])
    }

    #[test]
    fn valid_dataset_passes() {
        let config = config();
        let model = Model::zeros(&config);
        check_shape(&config, &model, &dataset()).unwrap();
    }

    #[test]
    fn sizes_must_sum_to_rows() {
        let config = config();
        let model = Model::zeros(&config);
        let mut data = dataset();
        data.inputs.sizes = vec![1, 1];

        let err = check_shape(&config, &model, &data).unwrap_err();
        assert!(err.is_shape_error());
    }

    #[test]
    fn indices_are_bounded() {
        let config = config();
        let model = Model::zeros(&config);
        let mut data = dataset();
        data.inputs.axi[[2, 0]] = 4;

        assert!(matches!(
            check_shape(&config, &model, &data),
            Err(AxyErr::IndexOutOfRange {
                what: "axi",
                index: 4,
                max: 3
            })
        ));
    }

    #[test]
    fn model_length_and_weights() {
        let config = config();
        let model = Model::zeros(&config);
        let short = Model::from_vec(vec![0.; 3]);

        assert!(check_shape(&config, &short, &dataset()).is_err());

        let data = dataset().with_yw(array![[1.], [-1.]]);
        assert!(check_shape(&config, &model, &data).is_err());
    }

    #[test]
    fn evaluation_skips_targets() {
        let config = config();
        let model = Model::zeros(&config);
        let mut data = dataset();
        data.y = Array2::zeros((0, 0));

        check_inputs(&config, &model, &data.inputs).unwrap();
        assert!(check_shape(&config, &model, &data).is_err());
    }
}
