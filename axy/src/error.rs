use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire fitting core.
pub type Result<T> = std::result::Result<T, AxyErr>;

/// The fitting core's fatal error type.
#[derive(Debug, Clone, PartialEq)]
pub enum AxyErr {
    Config {
        what: &'static str,
        reason: String,
    },
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    IndexOutOfRange {
        what: &'static str,
        index: i64,
        max: usize,
    },
    NonFinite {
        what: &'static str,
    },
    MissingFitConfig,
    Divergence {
        step: usize,
        retries: usize,
    },
    ThreadPool(String),
}

impl AxyErr {
    /// Builds a configuration error.
    pub(crate) fn config(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            what,
            reason: reason.into(),
        }
    }

    /// The integer `INFO` code reported for this error across the procedural boundary.
    ///
    /// # Returns
    /// A strictly positive code, `0` is reserved for success.
    pub fn info(&self) -> i32 {
        match self {
            AxyErr::Config { .. } => 1,
            AxyErr::SizeMismatch { .. } => 2,
            AxyErr::IndexOutOfRange { .. } => 3,
            AxyErr::NonFinite { .. } => 4,
            AxyErr::MissingFitConfig => 5,
            AxyErr::Divergence { .. } => 6,
            AxyErr::ThreadPool(_) => 7,
        }
    }

    /// Whether this error belongs to the dataset shape family.
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            AxyErr::SizeMismatch { .. } | AxyErr::IndexOutOfRange { .. } | AxyErr::NonFinite { .. }
        )
    }
}

impl Display for AxyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxyErr::Config { what, reason } => {
                write!(f, "invalid model configuration for {what}: {reason}")
            }
            AxyErr::SizeMismatch {
                a,
                b,
                got,
                expected,
            } => write!(f, "{a} holds {got} values where {b} expects {expected}"),
            AxyErr::IndexOutOfRange { what, index, max } => {
                write!(f, "index {index} in {what} is outside of [0, {max}]")
            }
            AxyErr::NonFinite { what } => write!(f, "{what} contains non-finite values"),
            AxyErr::MissingFitConfig => {
                write!(f, "the configuration has no fit sizes, call new_fit_config first")
            }
            AxyErr::Divergence { step, retries } => write!(
                f,
                "the fit diverged at step {step} after {retries} rejected steps"
            ),
            AxyErr::ThreadPool(e) => write!(f, "failed to build the worker pool: {e}"),
        }
    }
}

impl Error for AxyErr {}

impl From<rayon::ThreadPoolBuildError> for AxyErr {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        AxyErr::ThreadPool(e.to_string())
    }
}

/// A non-fatal condition observed while normalizing or fitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A column (or embedding direction) had no spread, its rescale fell back to identity.
    DegenerateData { what: &'static str, column: usize },
    /// A sample had no aggregate rows, its summary is the zero vector.
    EmptyAggregate { sample: usize },
    /// Internal neurons that were inactive over a whole batch or whose activations
    /// depended on the other neurons of their layer, the worst count seen during the fit.
    RankDeficiency { neurons: usize },
}

impl Notice {
    /// The integer `INFO` code of this notice.
    pub fn code(&self) -> i32 {
        match self {
            Notice::DegenerateData { .. } => 101,
            Notice::EmptyAggregate { .. } => 102,
            Notice::RankDeficiency { .. } => 103,
        }
    }

    /// A bit identifying the notice kind, used to fold many notices into one flag word.
    pub fn bit(&self) -> u32 {
        match self {
            Notice::DegenerateData { .. } => 1,
            Notice::EmptyAggregate { .. } => 2,
            Notice::RankDeficiency { .. } => 4,
        }
    }
}

impl Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::DegenerateData { what, column } => {
                write!(f, "column {column} of {what} has no spread, using identity rescale")
            }
            Notice::EmptyAggregate { sample } => {
                write!(f, "sample {sample} has an empty aggregate set")
            }
            Notice::RankDeficiency { neurons } => {
                write!(f, "{neurons} internal neurons were inactive or linearly dependent")
            }
        }
    }
}

/// Folds a list of notices into a bit mask of the kinds present.
pub fn notice_mask(notices: &[Notice]) -> u32 {
    notices.iter().fold(0, |mask, n| mask | n.bit())
}
