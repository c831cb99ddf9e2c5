//! Fitting and decoding entry points.

use std::sync::Arc;

use faer::Mat;

use crate::{
    density::{DensitySettings, GaussianMixtureSettings},
    diagnostics::{Diagnostic, DiagnosticSink, Stage, TracingSink},
    error::{ReplayError, Result},
    filter::{filter, InitialConditions, StateSpace},
    grid::{GridSpec, PlaceGrid},
    lfp::LfpPowerLikelihood,
    likelihood::{Fusion, LikelihoodModel, Modality},
    movement::{MovementData, MovementKernel, MovementModel, MovementParams},
    multiunit::{MultiunitInput, MultiunitLikelihood, MultiunitSettings},
    replay_transition::ReplayTransition,
    results::DecodingResults,
    smoother::smooth,
    speed::SpeedLikelihood,
    spiking::{SpikeInput, SpikeModelSettings, SpikingLikelihood},
};

/// Settings of the replay detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// Speed above which the animal counts as moving when building the
    /// empirical movement kernel.
    pub speed_threshold: f64,
    pub spike_model: SpikeModelSettings,
    /// Ridge penalty of the replay transition regression.
    pub replay_state_transition_penalty: f64,
    /// Spline knots over lagged speed for the replay transition. The default
    /// depends on the training speeds.
    pub speed_knots: Option<Vec<f64>>,
    pub grid: GridSpec,
    /// How many times faster than behavior replay trajectories move.
    pub replay_speed: u32,
    /// Standard deviation of the random-walk movement kernels.
    pub movement_std: f64,
    pub movement_model: MovementModel,
    pub multiunit: MultiunitSettings,
    /// Estimator of the per-state LFP power densities.
    pub lfp_density: DensitySettings,
    pub initial_conditions: InitialConditions,
    /// Seed of every randomly initialised density estimator.
    pub seed: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            speed_threshold: 4.,
            spike_model: SpikeModelSettings::default(),
            replay_state_transition_penalty: 1e-5,
            speed_knots: None,
            grid: GridSpec::default(),
            replay_speed: 20,
            movement_std: 0.05,
            movement_model: MovementModel::Empirical,
            multiunit: MultiunitSettings::default(),
            lfp_density: DensitySettings::GaussianMixture(GaussianMixtureSettings {
                n_components: 10,
                ..Default::default()
            }),
            initial_conditions: InitialConditions::Uniform,
            seed: 0,
        }
    }
}

fn seeded(settings: DensitySettings, seed: u64) -> DensitySettings {
    match settings {
        DensitySettings::GaussianMixture(mixture) => {
            DensitySettings::GaussianMixture(GaussianMixtureSettings { seed, ..mixture })
        }
        other => other,
    }
}

/// Labelled recording used to fit the detector. All series share the time
/// axis of `position`.
#[derive(Debug, Clone, Copy)]
pub struct TrainingData<'a> {
    pub is_replay: &'a [bool],
    pub speed: &'a [f64],
    /// `n_time x n_dims`
    pub position: &'a Mat<f64>,
    /// Ripple band power, `n_time x n_signals`.
    pub lfp_power: Option<&'a Mat<f64>>,
    /// Sorted spike counts, `n_time x n_neurons`.
    pub spikes: Option<&'a Mat<f64>>,
    /// Marks per electrode, each `n_time x n_marks`.
    pub multiunit: Option<&'a [Mat<f64>]>,
    /// Which place bins lie on the track; all of them by default.
    pub is_track_interior: Option<&'a [bool]>,
    /// Track segment of every sample, used by the track random walk.
    pub track_labels: Option<&'a [i64]>,
}

impl<'a> TrainingData<'a> {
    pub fn new(is_replay: &'a [bool], speed: &'a [f64], position: &'a Mat<f64>) -> Self {
        Self {
            is_replay,
            speed,
            position,
            lfp_power: None,
            spikes: None,
            multiunit: None,
            is_track_interior: None,
            track_labels: None,
        }
    }

    pub fn with_lfp_power(self, lfp_power: &'a Mat<f64>) -> Self {
        Self {
            lfp_power: Some(lfp_power),
            ..self
        }
    }

    pub fn with_spikes(self, spikes: &'a Mat<f64>) -> Self {
        Self {
            spikes: Some(spikes),
            ..self
        }
    }

    pub fn with_multiunit(self, multiunit: &'a [Mat<f64>]) -> Self {
        Self {
            multiunit: Some(multiunit),
            ..self
        }
    }

    pub fn with_track_interior(self, is_track_interior: &'a [bool]) -> Self {
        Self {
            is_track_interior: Some(is_track_interior),
            ..self
        }
    }

    pub fn with_track_labels(self, track_labels: &'a [i64]) -> Self {
        Self {
            track_labels: Some(track_labels),
            ..self
        }
    }

    fn validate(&self) -> Result<()> {
        let n_time = self.position.nrows();
        ReplayError::check_len("speed", n_time, self.speed.len())?;
        ReplayError::check_len("replay labels", n_time, self.is_replay.len())?;
        if let Some(power) = self.lfp_power {
            ReplayError::check_len("lfp power", n_time, power.nrows())?;
        }
        if let Some(spikes) = self.spikes {
            ReplayError::check_len("spikes", n_time, spikes.nrows())?;
        }
        for electrode in self.multiunit.into_iter().flatten() {
            ReplayError::check_len("multiunit", n_time, electrode.nrows())?;
        }
        if let Some(labels) = self.track_labels {
            ReplayError::check_len("track labels", n_time, labels.len())?;
        }
        Ok(())
    }
}

/// Unlabelled recording to decode.
#[derive(Debug, Clone, Copy)]
pub struct PredictionData<'a> {
    pub speed: &'a [f64],
    pub position: &'a Mat<f64>,
    pub lfp_power: Option<&'a Mat<f64>>,
    pub spikes: Option<&'a Mat<f64>>,
    pub multiunit: Option<&'a [Mat<f64>]>,
}

impl<'a> PredictionData<'a> {
    pub fn new(speed: &'a [f64], position: &'a Mat<f64>) -> Self {
        Self {
            speed,
            position,
            lfp_power: None,
            spikes: None,
            multiunit: None,
        }
    }

    pub fn with_lfp_power(self, lfp_power: &'a Mat<f64>) -> Self {
        Self {
            lfp_power: Some(lfp_power),
            ..self
        }
    }

    pub fn with_spikes(self, spikes: &'a Mat<f64>) -> Self {
        Self {
            spikes: Some(spikes),
            ..self
        }
    }

    pub fn with_multiunit(self, multiunit: &'a [Mat<f64>]) -> Self {
        Self {
            multiunit: Some(multiunit),
            ..self
        }
    }
}

/// Unfitted detector: settings plus the sink that receives diagnostics.
pub struct ReplayDetector {
    settings: DetectorSettings,
    sink: Arc<dyn DiagnosticSink>,
}

impl ReplayDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            settings,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_diagnostics(self, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { sink, ..self }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn fit(&self, data: &TrainingData<'_>) -> Result<FittedDetector> {
        data.validate()?;
        let settings = &self.settings;
        let sink = self.sink.as_ref();

        let mut grid = PlaceGrid::from_positions(data.position, settings.grid, sink)?;
        if let Some(mask) = data.is_track_interior {
            grid = grid.with_interior(mask.to_vec())?;
        }

        sink.emit(&Diagnostic::Stage(Stage::FitMovementTransition));
        let movement = MovementKernel::fit(
            &settings.movement_model,
            &grid,
            &MovementData {
                position: data.position,
                speed: data.speed,
                track_labels: data.track_labels,
            },
            MovementParams {
                speed_threshold: settings.speed_threshold,
                replay_speed: settings.replay_speed,
                movement_std: settings.movement_std,
            },
        )?;

        sink.emit(&Diagnostic::Stage(Stage::FitReplayTransition));
        let replay_transition = ReplayTransition::fit(
            data.speed,
            data.is_replay,
            settings.replay_state_transition_penalty,
            settings.speed_knots.as_deref(),
            sink,
        )?;

        // the speed model needs samples in both states
        let speed = if data.is_replay.iter().any(|&r| r) && data.is_replay.iter().any(|&r| !r) {
            sink.emit(&Diagnostic::Stage(Stage::FitSpeed));
            Some(SpeedLikelihood::fit(data.speed, data.is_replay)?)
        } else {
            None
        };

        let lfp_power = data
            .lfp_power
            .map(|power| {
                sink.emit(&Diagnostic::Stage(Stage::FitLfpPower));
                let density = seeded(settings.lfp_density, settings.seed);
                LfpPowerLikelihood::fit(power, data.is_replay, &density)
            })
            .transpose()?;

        let spikes = data
            .spikes
            .map(|spikes| {
                sink.emit(&Diagnostic::Stage(Stage::FitSpikes));
                SpikingLikelihood::fit(
                    spikes,
                    data.position,
                    data.is_replay,
                    &grid,
                    settings.spike_model,
                )
            })
            .transpose()?;

        let multiunit = data
            .multiunit
            .map(|marks| {
                sink.emit(&Diagnostic::Stage(Stage::FitMultiunit));
                let multiunit_settings = MultiunitSettings {
                    joint_density: seeded(settings.multiunit.joint_density, settings.seed),
                    occupancy_density: seeded(settings.multiunit.occupancy_density, settings.seed),
                    ..settings.multiunit
                };
                MultiunitLikelihood::fit(
                    marks,
                    data.position,
                    data.is_replay,
                    &grid,
                    &multiunit_settings,
                    sink,
                )
            })
            .transpose()?;

        Ok(FittedDetector {
            initial_conditions: settings.initial_conditions,
            sink: Arc::clone(&self.sink),
            grid,
            movement,
            replay_transition,
            speed,
            lfp_power,
            spikes,
            multiunit,
        })
    }
}

/// A detector with every available model fitted. Immutable; `predict` can
/// be called from several threads at once.
pub struct FittedDetector {
    initial_conditions: InitialConditions,
    sink: Arc<dyn DiagnosticSink>,
    grid: PlaceGrid,
    movement: MovementKernel,
    replay_transition: ReplayTransition,
    speed: Option<SpeedLikelihood>,
    lfp_power: Option<LfpPowerLikelihood>,
    spikes: Option<SpikingLikelihood>,
    multiunit: Option<MultiunitLikelihood>,
}

impl FittedDetector {
    pub fn grid(&self) -> &PlaceGrid {
        &self.grid
    }

    pub fn movement_kernel(&self) -> &MovementKernel {
        &self.movement
    }

    pub fn replay_transition(&self) -> &ReplayTransition {
        &self.replay_transition
    }

    pub fn spiking(&self) -> Option<&SpikingLikelihood> {
        self.spikes.as_ref()
    }

    pub fn multiunit(&self) -> Option<&MultiunitLikelihood> {
        self.multiunit.as_ref()
    }

    /// Modalities that have a fitted model.
    pub fn fitted_modalities(&self) -> Vec<Modality> {
        Modality::ALL
            .into_iter()
            .filter(|&modality| match modality {
                Modality::Speed => self.speed.is_some(),
                Modality::LfpPower => self.lfp_power.is_some(),
                Modality::Spikes => self.spikes.is_some(),
                Modality::Multiunit => self.multiunit.is_some(),
            })
            .collect()
    }

    fn evaluate(
        &self,
        modality: Modality,
        data: &PredictionData<'_>,
    ) -> Result<crate::likelihood::LikelihoodArray> {
        fn model<T>(model: &Option<T>, modality: Modality) -> Result<&T> {
            model.as_ref().ok_or(ReplayError::NotFitted(modality))
        }
        fn input<T>(input: Option<T>, modality: Modality) -> Result<T> {
            input.ok_or(ReplayError::MissingModality(modality))
        }
        match modality {
            Modality::Speed => model(&self.speed, modality)?.evaluate(data.speed),
            Modality::LfpPower => {
                model(&self.lfp_power, modality)?.evaluate(input(data.lfp_power, modality)?)
            }
            Modality::Spikes => model(&self.spikes, modality)?.evaluate(SpikeInput {
                spikes: input(data.spikes, modality)?,
                position: data.position,
            }),
            Modality::Multiunit => model(&self.multiunit, modality)?.evaluate(MultiunitInput {
                marks: input(data.multiunit, modality)?,
                position: data.position,
            }),
        }
    }

    /// Decode `data` with the product of the likelihoods in `modalities`.
    /// Repeated modalities are used once.
    pub fn predict(
        &self,
        data: &PredictionData<'_>,
        modalities: &[Modality],
        use_smoother: bool,
    ) -> Result<DecodingResults> {
        let sink = self.sink.as_ref();
        let n_time = data.position.nrows();
        ReplayError::check_len("speed", n_time, data.speed.len())?;
        let observed_bins = self.grid.observed_bins(data.position)?;

        let mut selected: Vec<Modality> = Vec::with_capacity(modalities.len());
        for &modality in modalities {
            if !selected.contains(&modality) {
                selected.push(modality);
            }
        }

        let mut fusion = Fusion::new(n_time, self.grid.is_interior());
        for modality in selected {
            sink.emit(&Diagnostic::Stage(Stage::PredictLikelihood(modality)));
            let likelihood = self.evaluate(modality, data)?;
            fusion.absorb(modality, likelihood, sink)?;
        }
        let likelihood = fusion.finish();

        let replay_transition = self.replay_transition.evaluate(data.speed, sink);
        let space = StateSpace {
            movement: &self.movement,
            replay_transition: &replay_transition,
            observed_bins: &observed_bins,
            is_interior: self.grid.is_interior(),
            initial_conditions: self.initial_conditions,
        };
        let filtered = filter(&space, &likelihood, sink)?;
        let posterior = if use_smoother {
            smooth(&space, &filtered, sink)?
        } else {
            filtered.posterior.clone()
        };

        Ok(DecodingResults {
            replay_probability: posterior.replay_probability(),
            posterior,
            filtered_posterior: filtered.posterior,
            likelihood,
            log_likelihood: filtered.log_normalizers,
            place_bin_centers: self.grid.centers().to_owned(),
        })
    }
}
