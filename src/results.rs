use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::{
    array::{
        Array, ArrayBuilder, FixedSizeListBuilder, Float64Builder, PrimitiveBuilder, StructArray,
    },
    datatypes::{Field, Float64Type},
};
use faer::Mat;

use crate::tensor::{StateTensor, N_STATES, REPLAY};

/// Everything produced by one decoding run.
#[derive(Debug, Clone)]
pub struct DecodingResults {
    /// Probability of the replay state at every time.
    pub replay_probability: Vec<f64>,
    /// Smoothed posterior if smoothing was requested, otherwise the
    /// filtered posterior.
    pub posterior: StateTensor,
    pub filtered_posterior: StateTensor,
    /// The fused likelihood the filter consumed.
    pub likelihood: StateTensor,
    /// Per-time log normalising constants of the filter.
    pub log_likelihood: Vec<f64>,
    /// Centers of the place bins, `n_bins x n_dims`.
    pub place_bin_centers: Mat<f64>,
}

impl DecodingResults {
    pub fn n_time(&self) -> usize {
        self.replay_probability.len()
    }

    /// Posterior over place bins given replay, `None` where the replay
    /// state has no mass.
    pub fn replay_position(&self, t: usize) -> Option<Vec<f64>> {
        let replay = self.posterior.state(t, REPLAY);
        let total: f64 = replay.iter().sum();
        (total > 0.).then(|| replay.iter().map(|x| x / total).collect())
    }

    /// One row per time with columns `replay_probability`,
    /// `log_likelihood`, `posterior`, `filtered_posterior` and `likelihood`.
    /// Tensor columns are fixed-size lists of length `2 * n_bins`, replay
    /// state major.
    pub fn to_arrow(&self) -> Result<StructArray> {
        let mut replay_probability = Float64Builder::with_capacity(self.n_time());
        replay_probability.append_slice(&self.replay_probability);
        let mut log_likelihood = Float64Builder::with_capacity(self.n_time());
        log_likelihood.append_slice(&self.log_likelihood);

        let mut columns: Vec<(&str, Arc<dyn Array>)> = vec![
            ("replay_probability", ArrayBuilder::finish(&mut replay_probability)),
            ("log_likelihood", ArrayBuilder::finish(&mut log_likelihood)),
        ];
        for (name, tensor) in [
            ("posterior", &self.posterior),
            ("filtered_posterior", &self.filtered_posterior),
            ("likelihood", &self.likelihood),
        ] {
            let array = tensor_column(tensor)
                .with_context(|| format!("could not convert {name} to arrow"))?;
            columns.push((name, array));
        }

        let fields = columns
            .iter()
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), false))
            .collect::<Vec<_>>();
        let arrays = columns.into_iter().map(|(_, array)| array).collect();
        StructArray::try_new(fields.into(), arrays, None).context("could not assemble results")
    }
}

fn tensor_column(tensor: &StateTensor) -> Result<Arc<dyn Array>> {
    let width = N_STATES * tensor.n_bins();
    let size = i32::try_from(width).context("too many place bins")?;
    let mut builder = FixedSizeListBuilder::with_capacity(
        PrimitiveBuilder::<Float64Type>::with_capacity(width * tensor.n_time()),
        size,
        tensor.n_time(),
    );
    for t in 0..tensor.n_time() {
        builder.values().append_slice(tensor.time(t));
        builder.append(true);
    }
    Ok(ArrayBuilder::finish(&mut builder))
}
