use std::thread;

use serde::{Deserialize, Serialize};

use crate::error::{AxyErr, Result};

/// Default width of the internal layers of both networks.
pub const DEFAULT_STATE_WIDTH: usize = 32;
/// Default number of internal layers of both networks.
pub const DEFAULT_STATE_COUNT: usize = 2;
/// Upper bound of the default aggregator output width.
pub const DEFAULT_AGG_OUTPUT: usize = 16;

/// The declared dimensions of a model, every optional one is derived when absent.
///
/// `adn`, `mdn`, `mdo` and `noe` are the required numeric input, output and output
/// category counts, the rest are architecture knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDims {
    pub adn: usize,
    pub mdn: usize,
    pub mdo: usize,
    pub noe: usize,

    pub ane: Option<usize>,
    pub ade: Option<usize>,
    pub ads: Option<usize>,
    pub ans: Option<usize>,
    pub ado: Option<usize>,

    pub mne: Option<usize>,
    pub mde: Option<usize>,
    pub mds: Option<usize>,
    pub mns: Option<usize>,

    pub doe: Option<usize>,
    pub noc: Option<usize>,

    pub num_threads: Option<usize>,
}

/// Fully resolved dimensions of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    /// Aggregator numeric inputs, embedding width, embedding count and total input width.
    pub adn: usize,
    pub ade: usize,
    pub ane: usize,
    pub adi: usize,
    /// Aggregator internal width, internal layer count and output width.
    pub ads: usize,
    pub ans: usize,
    pub ado: usize,

    pub mdn: usize,
    pub mde: usize,
    pub mne: usize,
    pub mdi: usize,
    pub mds: usize,
    pub mns: usize,
    /// Numeric outputs of the main network.
    pub mdo: usize,

    /// Output embedding count, width and number of categorical output columns.
    pub noe: usize,
    pub doe: usize,
    pub noc: usize,
    /// Total width of the main network's last layer, `mdo + noc * doe`.
    pub mo: usize,

    pub num_threads: usize,
}

impl Dims {
    /// Whether the aggregator network takes part in evaluation.
    pub fn has_aggregator(&self) -> bool {
        self.adi > 0 && self.ado > 0
    }
}

/// `max(1, ceil(log2(n)))`, the default width of an `n` entry embedding table.
pub fn default_embedding_width(n: usize) -> usize {
    let ceil_log2 = (usize::BITS - n.saturating_sub(1).leading_zeros()) as usize;
    ceil_log2.max(1)
}

fn embedding_width(what: &'static str, table: usize, given: Option<usize>) -> Result<usize> {
    match (table, given) {
        (0, Some(w)) if w > 0 => Err(AxyErr::config(
            what,
            format!("width {w} given without an embedding table"),
        )),
        (0, _) => Ok(0),
        (n, Some(0)) => Err(AxyErr::config(
            what,
            format!("a table of {n} embeddings needs a positive width"),
        )),
        (_, Some(w)) => Ok(w),
        (n, None) => Ok(default_embedding_width(n)),
    }
}

/// A network with zero width or zero layers is a purely linear map.
fn internal(width: usize, layers: usize) -> (usize, usize) {
    if width == 0 || layers == 0 {
        (0, 0)
    } else {
        (width, layers)
    }
}

impl ModelDims {
    /// Resolves every optional dimension and validates their relationships.
    ///
    /// # Returns
    /// The resolved dimensions or a configuration error on contradicting values.
    pub fn resolve(&self) -> Result<Dims> {
        let ane = self.ane.unwrap_or(0);
        let ade = embedding_width("ade", ane, self.ade)?;
        let adi = self.adn + ade;

        let (ads, ans, ado) = if adi == 0 {
            if let Some(ado) = self.ado.filter(|&o| o > 0) {
                return Err(AxyErr::config(
                    "ado",
                    format!("aggregator output width {ado} without aggregator inputs"),
                ));
            }
            (0, 0, 0)
        } else {
            let (ads, ans) = internal(
                self.ads.unwrap_or(DEFAULT_STATE_WIDTH),
                self.ans.unwrap_or(DEFAULT_STATE_COUNT),
            );
            let default_ado = if ads > 0 {
                ads.min(DEFAULT_AGG_OUTPUT)
            } else {
                DEFAULT_AGG_OUTPUT
            };
            let ado = self.ado.unwrap_or(default_ado);
            if ado == 0 {
                return Err(AxyErr::config(
                    "ado",
                    format!("aggregator input width {adi} needs a positive output width"),
                ));
            }
            (ads, ans, ado)
        };

        let mne = self.mne.unwrap_or(0);
        let mde = embedding_width("mde", mne, self.mde)?;
        let mdi = self.mdn + mde + ado;
        if mdi == 0 {
            return Err(AxyErr::config("mdi", "the model has no inputs"));
        }
        let (mds, mns) = internal(
            self.mds.unwrap_or(DEFAULT_STATE_WIDTH),
            self.mns.unwrap_or(DEFAULT_STATE_COUNT),
        );

        let noe = self.noe;
        let doe = embedding_width("doe", noe, self.doe)?;
        let noc = match (noe, self.noc) {
            (0, Some(c)) if c > 0 => {
                return Err(AxyErr::config(
                    "noc",
                    format!("{c} categorical outputs without an output embedding table"),
                ));
            }
            (0, _) => 0,
            (_, Some(0)) => {
                return Err(AxyErr::config(
                    "noc",
                    "an output embedding table needs at least one categorical output",
                ));
            }
            (_, c) => c.unwrap_or(1),
        };
        let mo = self.mdo + noc * doe;
        if mo == 0 {
            return Err(AxyErr::config("mdo", "the model has no outputs"));
        }

        let num_threads = match self.num_threads {
            Some(0) => {
                return Err(AxyErr::config("num_threads", "at least one thread is needed"));
            }
            Some(n) => n,
            None => thread::available_parallelism().map_or(1, |n| n.get()),
        };

        Ok(Dims {
            adn: self.adn,
            ade,
            ane,
            adi,
            ads,
            ans,
            ado,
            mdn: self.mdn,
            mde,
            mne,
            mdi,
            mds,
            mns,
            mdo: self.mdo,
            noe,
            doe,
            noc,
            mo,
            num_threads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_width_defaults() {
        assert_eq!(default_embedding_width(1), 1);
        assert_eq!(default_embedding_width(2), 1);
        assert_eq!(default_embedding_width(3), 2);
        assert_eq!(default_embedding_width(8), 3);
        assert_eq!(default_embedding_width(9), 4);
    }

    #[test]
    fn aggregator_defaults() {
        let dims = ModelDims {
            adn: 3,
            mdn: 1,
            mdo: 1,
            ane: Some(5),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        assert_eq!(dims.ade, 3);
        assert_eq!(dims.adi, 6);
        assert_eq!(dims.ads, DEFAULT_STATE_WIDTH);
        assert_eq!(dims.ado, DEFAULT_AGG_OUTPUT);
        assert_eq!(dims.mdi, 1 + DEFAULT_AGG_OUTPUT);
        assert!(dims.has_aggregator());
    }

    #[test]
    fn aggregator_inputs_without_outputs_is_an_error() {
        let err = ModelDims {
            adn: 2,
            mdn: 1,
            mdo: 1,
            ado: Some(0),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();

        assert!(matches!(err, AxyErr::Config { what: "ado", .. }));
    }

    #[test]
    fn zero_width_means_linear() {
        let dims = ModelDims {
            mdn: 1,
            mdo: 1,
            mds: Some(0),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        assert_eq!((dims.mds, dims.mns), (0, 0));
        assert!(!dims.has_aggregator());
    }

    #[test]
    fn categorical_outputs_widen_the_output_layer() {
        let dims = ModelDims {
            mdn: 2,
            mdo: 1,
            noe: 4,
            noc: Some(2),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        assert_eq!(dims.doe, 2);
        assert_eq!(dims.mo, 1 + 2 * 2);
    }

    #[test]
    fn empty_models_are_rejected() {
        assert!(ModelDims::default().resolve().is_err());
        assert!(
            ModelDims {
                mdn: 1,
                ..Default::default()
            }
            .resolve()
            .is_err()
        );
    }
}
