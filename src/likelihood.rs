//! The uniform emission-likelihood contract and likelihood fusion.

use std::{fmt, str::FromStr};

use itertools::izip;

use crate::{
    diagnostics::{Diagnostic, DiagnosticSink},
    error::{ReplayError, Result},
    tensor::{StateTensor, N_STATES},
};

/// The available emission likelihoods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Speed,
    LfpPower,
    Spikes,
    Multiunit,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Speed,
        Modality::LfpPower,
        Modality::Spikes,
        Modality::Multiunit,
    ];

    /// The default selection, sorted spikes and ripple band power.
    pub const DEFAULT: [Modality; 2] = [Modality::Spikes, Modality::LfpPower];

    pub fn name(self) -> &'static str {
        match self {
            Modality::Speed => "speed",
            Modality::LfpPower => "lfp_power",
            Modality::Spikes => "spikes",
            Modality::Multiunit => "multiunit",
        }
    }

    /// Whether the likelihood varies over place bins.
    pub fn is_position_resolved(self) -> bool {
        matches!(self, Modality::Spikes | Modality::Multiunit)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Modality {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self> {
        Modality::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ReplayError::UnknownModality(s.to_string()))
    }
}

/// Output of a single modality, with a position axis of size 1 or `n_bins`.
pub type LikelihoodArray = StateTensor;

/// A fitted emission model bound to its parameters.
///
/// `evaluate` returns a `n_time x 2 x 1` tensor for likelihoods that only
/// depend on the replay state and `n_time x 2 x n_bins` for position
/// resolved ones. Values are nonnegative; missing inputs may produce
/// non-finite values, which fusion replaces by the neutral likelihood.
pub trait LikelihoodModel: Send + Sync {
    type Input<'a>;

    fn evaluate(&self, input: Self::Input<'_>) -> Result<LikelihoodArray>;
}

/// Replace every time slice that contains a non-finite value by ones.
/// Returns the number of replaced slices.
pub(crate) fn neutralize_missing(likelihood: &mut StateTensor) -> usize {
    let mut replaced = 0;
    for t in 0..likelihood.n_time() {
        let slice = likelihood.time_mut(t);
        if slice.iter().any(|x| !x.is_finite()) {
            slice.fill(1.);
            replaced += 1;
        }
    }
    replaced
}

/// Running product of the selected likelihoods over the full place grid.
pub struct Fusion<'a> {
    fused: StateTensor,
    is_interior: &'a [bool],
    arch: pulp::Arch,
}

impl<'a> Fusion<'a> {
    /// Start from the neutral likelihood.
    pub fn new(n_time: usize, is_interior: &'a [bool]) -> Self {
        Self {
            fused: StateTensor::ones(n_time, is_interior.len()),
            is_interior,
            arch: pulp::Arch::new(),
        }
    }

    /// Multiply one modality into the fused likelihood.
    pub fn absorb(
        &mut self,
        modality: Modality,
        mut likelihood: StateTensor,
        sink: &dyn DiagnosticSink,
    ) -> Result<()> {
        let n_bins = self.fused.n_bins();
        ReplayError::check_len("likelihood time points", self.fused.n_time(), likelihood.n_time())?;
        if likelihood.n_bins() != 1 {
            ReplayError::check_len("likelihood place bins", n_bins, likelihood.n_bins())?;
        }

        let missing = neutralize_missing(&mut likelihood);
        if missing > 0 {
            sink.emit(&Diagnostic::MissingData {
                modality,
                count: missing,
            });
        }

        let fused = &mut self.fused;
        self.arch.dispatch(|| {
            if likelihood.n_bins() == 1 {
                for t in 0..fused.n_time() {
                    for state in 0..N_STATES {
                        let factor = likelihood.get(t, state, 0);
                        fused.state_mut(t, state).iter_mut().for_each(|x| *x *= factor);
                    }
                }
            } else {
                izip!(fused.as_mut_slice().iter_mut(), likelihood.as_slice())
                    .for_each(|(x, &l)| *x *= l);
            }
        });

        if modality.is_position_resolved() {
            for t in 0..fused.n_time() {
                for state in 0..N_STATES {
                    fused
                        .state_mut(t, state)
                        .iter_mut()
                        .zip(self.is_interior)
                        .filter(|(_, &interior)| !interior)
                        .for_each(|(x, _)| *x = 0.);
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> StateTensor {
        self.fused
    }
}

/// Multiply the given likelihoods into one `n_time x 2 x n_bins` tensor.
pub fn fuse_likelihoods(
    n_time: usize,
    is_interior: &[bool],
    likelihoods: impl IntoIterator<Item = (Modality, LikelihoodArray)>,
    sink: &dyn DiagnosticSink,
) -> Result<StateTensor> {
    let mut fusion = Fusion::new(n_time, is_interior);
    for (modality, likelihood) in likelihoods {
        fusion.absorb(modality, likelihood, sink)?;
    }
    Ok(fusion.finish())
}
