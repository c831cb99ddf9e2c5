//! Structured diagnostics emitted while fitting and decoding.
//!
//! Nothing in the crate writes to process-wide logging state directly.
//! Every stage and recovery goes through a [`DiagnosticSink`] owned by the
//! detector. The default [`TracingSink`] forwards events to `tracing`,
//! tests can use a [`CollectingSink`], and any `Fn(&Diagnostic)` closure is
//! a sink as well.

use std::sync::{Arc, Mutex};

use crate::likelihood::Modality;

/// Pipeline stages reported while fitting or predicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FitSpeed,
    FitLfpPower,
    FitSpikes,
    FitMultiunit,
    FitMovementTransition,
    FitReplayTransition,
    PredictLikelihood(Modality),
    Filter,
    Smooth,
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Diagnostic {
    Stage(Stage),
    /// Two mutually exclusive settings were given; `used` won.
    ConflictingSettings {
        used: &'static str,
        ignored: &'static str,
    },
    /// The fused likelihood carried no mass at `time`; the predictive
    /// distribution was used as the posterior.
    ZeroLikelihood { time: usize },
    /// `count` time slices of a modality contained missing values and were
    /// replaced by the neutral likelihood.
    MissingData { modality: Modality, count: usize },
    /// A replay transition probability left `[eps, 1 - eps]` and was clipped.
    ClippedTransition { count: usize },
    /// An electrode had no multiunit events in the training data.
    SilentElectrode { electrode: usize },
    /// The replay transition was fit without any replay samples.
    NoReplayTraining,
}

/// Receiver of [`Diagnostic`] events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: &Diagnostic);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&Diagnostic) + Send + Sync,
{
    fn emit(&self, diagnostic: &Diagnostic) {
        self(diagnostic)
    }
}

/// Forwards diagnostics as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::Stage(stage) => tracing::info!(?stage, "replay detector stage"),
            Diagnostic::ConflictingSettings { used, ignored } => {
                tracing::warn!(used, ignored, "both {used} and {ignored} are set, using {used}")
            }
            Diagnostic::ZeroLikelihood { time } => {
                tracing::warn!(time, "likelihood has no mass, falling back to prior")
            }
            Diagnostic::MissingData { modality, count } => {
                tracing::debug!(%modality, count, "replaced missing data with neutral likelihood")
            }
            Diagnostic::ClippedTransition { count } => {
                tracing::debug!(count, "clipped replay transition probabilities")
            }
            Diagnostic::SilentElectrode { electrode } => {
                tracing::warn!(electrode, "electrode has no multiunit events in training data")
            }
            Diagnostic::NoReplayTraining => {
                tracing::warn!("no replay periods in training data")
            }
        }
    }
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<Diagnostic>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diagnostic: &Diagnostic) {
        if let Ok(mut events) = self.events.lock() {
            events.push(diagnostic.clone());
        }
    }
}
