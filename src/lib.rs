//! Decode hippocampal replay with a switching state-space model.
//!
//! The latent state at every time step is a pair of a replay indicator and a
//! place bin. Outside replay the place bin follows the animal, during replay
//! it moves according to a [`MovementKernel`]. Observations enter through
//! likelihood models (speed, ripple band power, sorted spikes and clusterless
//! multiunit marks) that are multiplied together and passed through a
//! forward [`filter`] and an optional backward [`smooth`]ing pass.
//!
//! ```no_run
//! use faer::Mat;
//! use replay_rs::{DetectorSettings, Modality, PredictionData, ReplayDetector, TrainingData};
//!
//! # fn main() -> Result<(), replay_rs::ReplayError> {
//! # let (is_replay, speed, position, power) = (vec![false], vec![0.], Mat::<f64>::zeros(1, 1), Mat::<f64>::zeros(1, 1));
//! let detector = ReplayDetector::new(DetectorSettings::default()).fit(
//!     &TrainingData::new(&is_replay, &speed, &position).with_lfp_power(&power),
//! )?;
//! let results = detector.predict(
//!     &PredictionData::new(&speed, &position).with_lfp_power(&power),
//!     &[Modality::Speed, Modality::LfpPower],
//!     true,
//! )?;
//! println!("{:?}", results.replay_probability);
//! # Ok(())
//! # }
//! ```

pub(crate) mod math;

mod density;
mod detector;
mod diagnostics;
mod error;
mod filter;
pub mod glm;
mod grid;
mod lfp;
mod likelihood;
mod movement;
mod multiunit;
mod replay_transition;
mod results;
mod smoother;
mod speed;
mod spiking;
mod spline;
mod tensor;

pub use density::{
    Bandwidth, DensityEstimator, DensityModel, DensitySettings, FittedDensity, GaussianMixture,
    GaussianMixtureSettings, KernelDensity, KernelDensitySettings,
};
pub use detector::{DetectorSettings, FittedDetector, PredictionData, ReplayDetector, TrainingData};
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticSink, Stage, TracingSink};
pub use error::{DensityError, GlmError, ReplayError, Result};
pub use filter::{filter, FilterOutput, InitialConditions, StateSpace};
pub use glm::{Family, FittedGlm, GlmOptions};
pub use grid::{column, GridSpec, PlaceGrid};
pub use lfp::LfpPowerLikelihood;
pub use likelihood::{fuse_likelihoods, Fusion, LikelihoodArray, LikelihoodModel, Modality};
pub use movement::{MovementData, MovementKernel, MovementModel, MovementParams, TrackTopology};
pub use multiunit::{MultiunitInput, MultiunitLikelihood, MultiunitSettings};
pub use replay_transition::{default_speed_knots, ReplayTransition, ReplayTransitionSeries};
pub use results::DecodingResults;
pub use smoother::smooth;
pub use speed::{SpeedLikelihood, MIN_SPEED_VARIANCE};
pub use spiking::{SpikeInput, SpikeModelSettings, SpikingLikelihood};
pub use spline::NaturalCubicSpline;
pub use tensor::{StateTensor, NO_REPLAY, N_STATES, REPLAY};
