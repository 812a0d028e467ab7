use serde::Serialize;

/// The values recorded after one accepted step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RecordEntry {
    /// Mean squared error of the batch before the step.
    pub mse: f32,
    pub step_factor: f32,
    /// Norm of the mean gradient.
    pub grad_norm: f32,
    /// Mean curvature estimate of the moved values.
    pub curvature: f32,
    /// Norm of the mean gradient restricted to the embedding tables.
    pub emb_grad_norm: f32,
    /// Neurons restarted by the most recent conditioning.
    pub repaired: usize,
}

impl RecordEntry {
    /// Number of values per entry once flattened.
    pub const WIDTH: usize = 6;

    pub fn to_array(&self) -> [f32; Self::WIDTH] {
        [
            self.mse,
            self.step_factor,
            self.grad_norm,
            self.curvature,
            self.emb_grad_norm,
            self.repaired as f32,
        ]
    }
}

/// Per step history of one fit call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FitRecord {
    pub steps: Vec<RecordEntry>,
}

impl FitRecord {
    pub fn push(&mut self, entry: RecordEntry) {
        self.steps.push(entry);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The last recorded error, if any step was recorded.
    pub fn last_mse(&self) -> Option<f32> {
        self.steps.last().map(|e| e.mse)
    }
}
