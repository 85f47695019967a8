use super::{bind_param, TrainPass};
use crate::{
    config::NormSettings,
    ops::norm,
    param::{Param, ParamRole, Statistic, UpdateRule},
    Error, Result,
};
use ndarray::{ArrayD, Ix1};

/// Per-channel batch normalisation owned by a conv-pool or dot-product layer.
///
/// The train branch normalises with the statistics of the current batch and
/// records how they move the running estimates; the inference branch
/// normalises with the running estimates. Both scale and shift with the same
/// `gamma` and `beta`.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    gamma: Param,
    beta: Param,
    running_mean: Param,
    running_var: Param,
    epsilon: f32,
    rules: [UpdateRule; 2],
}

impl BatchNorm {
    /// Fresh statistics: `gamma = 1`, `beta = 0`, `running_mean = 0`, `running_var = 1`.
    pub fn new(layer: &str, channels: usize, settings: NormSettings) -> Result<Self> {
        settings.validate(layer)?;
        let shape = [channels];
        Ok(Self::from_params(
            Param::filled(format!("{}.gamma", layer), ParamRole::Trainable, &shape, 1.0),
            Param::zeros(format!("{}.beta", layer), ParamRole::Trainable, &shape),
            Param::zeros(format!("{}.running_mean", layer), ParamRole::Auxiliary, &shape),
            Param::filled(format!("{}.running_var", layer), ParamRole::Auxiliary, &shape, 1.0),
            settings,
        ))
    }

    /// Binds `[gamma, beta, running_mean, running_var]` from `supplied[offset..]`.
    pub fn bind(
        layer: &str,
        channels: usize,
        settings: NormSettings,
        supplied: &[Param],
        offset: usize,
    ) -> Result<Self> {
        settings.validate(layer)?;
        let shape = [channels];
        let running_mean = bind_param(layer, supplied, offset + 2, "running_mean", &shape)?;
        let running_var = bind_param(layer, supplied, offset + 3, "running_var", &shape)?;
        if let Some(p) = [&running_mean, &running_var]
            .into_iter()
            .find(|p| p.is_trainable())
        {
            return Err(Error::config(
                layer,
                format!("running statistic `{}` must be an auxiliary parameter", p.name()),
            ));
        }

        Ok(Self::from_params(
            bind_param(layer, supplied, offset, "gamma", &shape)?,
            bind_param(layer, supplied, offset + 1, "beta", &shape)?,
            running_mean,
            running_var,
            settings,
        ))
    }

    fn from_params(
        gamma: Param,
        beta: Param,
        running_mean: Param,
        running_var: Param,
        settings: NormSettings,
    ) -> Self {
        let rules = [
            UpdateRule {
                target: running_mean.clone(),
                statistic: Statistic::BatchMean,
                factor: settings.running_average_factor,
                offset: 0.0,
            },
            UpdateRule {
                target: running_var.clone(),
                statistic: Statistic::BatchVariance,
                factor: settings.running_average_factor,
                offset: settings.variance_epsilon,
            },
        ];

        Self {
            gamma,
            beta,
            running_mean,
            running_var,
            epsilon: settings.epsilon,
            rules,
        }
    }

    pub fn gamma(&self) -> &Param {
        &self.gamma
    }

    pub fn beta(&self) -> &Param {
        &self.beta
    }

    pub fn running_mean(&self) -> &Param {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Param {
        &self.running_var
    }

    /// `[gamma, beta, running_mean, running_var]`
    pub fn params(&self) -> [Param; 4] {
        [
            self.gamma.clone(),
            self.beta.clone(),
            self.running_mean.clone(),
            self.running_var.clone(),
        ]
    }

    pub fn update_rules(&self) -> &[UpdateRule] {
        &self.rules
    }

    pub fn train(&self, x: &ArrayD<f32>, pass: &mut TrainPass<'_>) -> Result<ArrayD<f32>> {
        let moments = norm::channel_moments(x)?;

        let out = {
            let gamma = self.gamma.read();
            let beta = self.beta.read();
            norm::normalize(
                x,
                moments.mean.view(),
                moments.variance.view(),
                as_vector(&gamma)?,
                as_vector(&beta)?,
                self.epsilon,
            )?
        };

        for rule in &self.rules {
            let observed = match rule.statistic {
                Statistic::BatchMean => moments.mean.clone(),
                Statistic::BatchVariance => moments.unbiased_variance(),
            };
            pass.record(rule, &observed.into_dyn())?;
        }

        Ok(out)
    }

    pub fn inference(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let gamma = self.gamma.read();
        let beta = self.beta.read();
        let mean = self.running_mean.read();
        let var = self.running_var.read();
        norm::normalize(
            x,
            as_vector(&mean)?,
            as_vector(&var)?,
            as_vector(&gamma)?,
            as_vector(&beta)?,
            self.epsilon,
        )
    }
}

fn as_vector(value: &ArrayD<f32>) -> Result<ndarray::ArrayView1<'_, f32>> {
    value
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| Error::Layer(format!("expected a vector parameter: {}", e)))
}
