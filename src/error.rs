use thiserror::Error;

use crate::likelihood::Modality;

/// Errors of the density estimation capability.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DensityError {
    #[error("cannot fit a density to {0} samples")]
    NotEnoughSamples(usize),
    #[error("samples must have at least one dimension")]
    NoDimensions,
    #[error("expected points with {expected} dimensions, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("invalid density settings: {0}")]
    InvalidSettings(String),
    #[error("covariance factorisation failed")]
    Factorization,
}

/// Errors of the penalized regression capability.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum GlmError {
    #[error("design has {rows} rows but {targets} targets were given")]
    ShapeMismatch { rows: usize, targets: usize },
    #[error("penalty has length {found}, design has {expected} columns")]
    PenaltyMismatch { expected: usize, found: usize },
    #[error("no observations to fit")]
    Empty,
    #[error("normal equations are singular")]
    Singular,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("shape mismatch in {what}: expected {expected}, found {found}")]
    Shape {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("cannot build place grid: {0}")]
    Grid(String),
    #[error("likelihood `{0}` was selected but its input is missing")]
    MissingModality(Modality),
    #[error("likelihood `{0}` was selected but no model was fitted for it")]
    NotFitted(Modality),
    #[error("unknown likelihood `{0}`")]
    UnknownModality(String),
    #[error("numerical failure at time {time}: {reason}")]
    Numerical { time: usize, reason: &'static str },
    #[error("density model failed")]
    Density(#[from] DensityError),
    #[error("regression model failed")]
    Glm(#[from] GlmError),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

impl ReplayError {
    pub(crate) fn check_len(what: &'static str, expected: usize, found: usize) -> Result<()> {
        if expected == found {
            Ok(())
        } else {
            Err(ReplayError::Shape {
                what,
                expected,
                found,
            })
        }
    }
}
