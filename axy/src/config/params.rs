use serde::{Deserialize, Serialize};

use crate::error::{AxyErr, Result};

/// How the rows of one aggregate set are reduced into a single summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

/// Training hyperparameters and feature flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Half width of the smoothed region around every hinge.
    pub discontinuity: f32,
    /// Margin required between the true category score and every other score.
    pub category_gap: f32,
    /// Lower bound of any aggregate row's share of its set summary, relative to a plain reduction.
    pub min_agg_weight: f32,

    pub step_factor: f32,
    pub min_step_factor: f32,
    pub max_step_factor: f32,
    pub max_step_component: f32,
    pub min_curv_component: f32,
    pub max_curv_component: f32,
    pub initial_curv_estimate: f32,
    pub faster_rate: f32,
    pub slower_rate: f32,
    pub step_mean_change: f32,
    pub step_curv_change: f32,
    /// Blend rate of freshly measured aggregator output scales into the stored ones.
    pub step_ay_change: f32,
    /// Blend rate of a fresh whitening into the embedding tables.
    pub step_emb_change: f32,
    /// Upper bound of values moved per step, `None` moves every trainable value.
    pub num_to_update: Option<usize>,
    /// Lowest share of trainable values the step may shrink to.
    pub min_update_ratio: f32,
    /// Change of the updated share after every accepted step.
    pub update_ratio_step: f32,

    pub mse_upper_limit: f32,
    pub min_steps_to_stability: usize,
    pub max_batch: usize,
    /// Steps between refreshes of the aggregator output and embedding statistics, 0 disables.
    pub data_condition_frequency: usize,
    pub model_condition_frequency: usize,
    /// Steps between rank checks of the internal activations, 0 disables.
    pub rank_check_frequency: usize,
    /// Steps between logged per block gradient norms, 0 disables.
    pub log_grad_norm_frequency: usize,
    pub interrupt_delay_sec: Option<u64>,
    pub seed: Option<u64>,

    /// Whether conditioning restarts dependent neurons or only rescales them.
    pub basis_replacement: bool,
    pub keep_best: bool,
    pub early_stop: bool,
    pub reshuffle: bool,
    pub normalize: bool,
    pub pairwise_aggregation: bool,
    pub partial_aggregation: bool,
    pub ordered_aggregation: bool,
    pub reduction: Reduction,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            discontinuity: 0.,
            category_gap: 0.5,
            min_agg_weight: 0.,

            step_factor: 0.01,
            min_step_factor: 0.0005,
            max_step_factor: 0.05,
            max_step_component: 0.1,
            min_curv_component: 1e-8,
            max_curv_component: 1e8,
            initial_curv_estimate: 0.,
            faster_rate: 1.01,
            slower_rate: 0.99,
            step_mean_change: 0.1,
            step_curv_change: 0.01,
            step_ay_change: 0.1,
            step_emb_change: 0.1,
            num_to_update: None,
            min_update_ratio: 1.,
            update_ratio_step: 0.05,

            mse_upper_limit: 1e4,
            min_steps_to_stability: 100,
            max_batch: 10_000,
            data_condition_frequency: 100,
            model_condition_frequency: 100,
            rank_check_frequency: 10,
            log_grad_norm_frequency: 0,
            interrupt_delay_sec: None,
            seed: None,

            basis_replacement: true,
            keep_best: true,
            early_stop: true,
            reshuffle: true,
            normalize: true,
            pairwise_aggregation: false,
            partial_aggregation: false,
            ordered_aggregation: false,
            reduction: Reduction::Mean,
        }
    }
}

fn positive(what: &'static str, v: f32) -> Result<()> {
    if v.is_finite() && v > 0. {
        Ok(())
    } else {
        Err(AxyErr::config(what, format!("{v} must be finite and positive")))
    }
}

fn non_negative(what: &'static str, v: f32) -> Result<()> {
    if v.is_finite() && v >= 0. {
        Ok(())
    } else {
        Err(AxyErr::config(what, format!("{v} must be finite and non negative")))
    }
}

fn ordered(what: &'static str, min: f32, max: f32) -> Result<()> {
    if max >= min {
        Ok(())
    } else {
        Err(AxyErr::config(what, format!("max {max} is below min {min}")))
    }
}

fn unit_rate(what: &'static str, v: f32) -> Result<()> {
    if v > 0. && v <= 1. {
        Ok(())
    } else {
        Err(AxyErr::config(what, format!("{v} must lie in (0, 1]")))
    }
}

impl TrainingParams {
    /// Checks every bound relationship of the hyperparameters.
    pub fn validate(&self) -> Result<()> {
        non_negative("discontinuity", self.discontinuity)?;
        non_negative("category_gap", self.category_gap)?;
        non_negative("min_agg_weight", self.min_agg_weight)?;
        if self.min_agg_weight > 1. {
            return Err(AxyErr::config("min_agg_weight", "must not exceed 1"));
        }

        positive("min_step_factor", self.min_step_factor)?;
        ordered("step_factor", self.min_step_factor, self.max_step_factor)?;
        if !(self.min_step_factor..=self.max_step_factor).contains(&self.step_factor) {
            return Err(AxyErr::config(
                "step_factor",
                format!(
                    "{} is outside [{}, {}]",
                    self.step_factor, self.min_step_factor, self.max_step_factor
                ),
            ));
        }
        positive("max_step_component", self.max_step_component)?;
        positive("min_curv_component", self.min_curv_component)?;
        ordered(
            "curv_component",
            self.min_curv_component,
            self.max_curv_component,
        )?;
        non_negative("initial_curv_estimate", self.initial_curv_estimate)?;

        if !(self.faster_rate >= 1. && self.faster_rate.is_finite()) {
            return Err(AxyErr::config("faster_rate", "must be at least 1"));
        }
        unit_rate("slower_rate", self.slower_rate)?;
        unit_rate("step_mean_change", self.step_mean_change)?;
        unit_rate("step_curv_change", self.step_curv_change)?;
        unit_rate("step_ay_change", self.step_ay_change)?;
        unit_rate("step_emb_change", self.step_emb_change)?;
        unit_rate("min_update_ratio", self.min_update_ratio)?;
        non_negative("update_ratio_step", self.update_ratio_step)?;
        if self.num_to_update == Some(0) {
            return Err(AxyErr::config("num_to_update", "must be positive"));
        }

        positive("mse_upper_limit", self.mse_upper_limit)?;
        if self.max_batch == 0 {
            return Err(AxyErr::config("max_batch", "must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TrainingParams::default().validate().unwrap();
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let params = TrainingParams {
            min_step_factor: 0.1,
            max_step_factor: 0.01,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = TrainingParams {
            min_curv_component: 1.,
            max_curv_component: 0.5,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn aggregate_weight_is_a_fraction() {
        let params = TrainingParams {
            min_agg_weight: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(AxyErr::Config {
                what: "min_agg_weight",
                ..
            })
        ));
    }

    #[test]
    fn change_rates_are_fractions() {
        let params = TrainingParams {
            step_emb_change: 0.,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(AxyErr::Config {
                what: "step_emb_change",
                ..
            })
        ));

        let params = TrainingParams {
            num_to_update: Some(0),
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let params: TrainingParams =
            serde_json::from_str(r#"{"step_factor": 0.02, "reduction": "sum"}"#).unwrap();

        assert_eq!(params.step_factor, 0.02);
        assert_eq!(params.reduction, Reduction::Sum);
        assert_eq!(params.max_batch, TrainingParams::default().max_batch);
        assert_eq!(params.rank_check_frequency, 10);
        assert!(params.basis_replacement);
    }
}
