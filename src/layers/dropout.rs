use super::{InferencePass, Layer, Objective, TrainPass};
use crate::{
    config::LayerType,
    param::{Param, Regularization, UpdateRule},
    Error, Result, Tensor,
};
use rand::distributions::{Bernoulli, Distribution};

/// Wraps a layer and drops units of its train output.
///
/// Kept units are scaled by `1 / (1 - rate)` so the inference output, which
/// is left untouched, has the same expectation.
#[derive(Debug)]
pub struct Dropout {
    inner: Box<dyn Layer>,
    rate: f32,
    keep: Bernoulli,
}

impl Dropout {
    pub fn new(inner: Box<dyn Layer>, rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::config(
                inner.id(),
                format!("dropout_rate must be in [0, 1), got {}", rate),
            ));
        }
        let keep = Bernoulli::new(1.0 - f64::from(rate))
            .map_err(|e| Error::config(inner.id(), e.to_string()))?;
        Ok(Self { inner, rate, keep })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn inner(&self) -> &dyn Layer {
        self.inner.as_ref()
    }
}

impl Layer for Dropout {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn layer_type(&self) -> LayerType {
        self.inner.layer_type()
    }

    fn output_shape(&self) -> &[usize] {
        self.inner.output_shape()
    }

    fn params(&self) -> &[Param] {
        self.inner.params()
    }

    fn update_rules(&self) -> &[UpdateRule] {
        self.inner.update_rules()
    }

    fn regularization(&self) -> Option<&Regularization> {
        self.inner.regularization()
    }

    fn train_output(&self, inputs: &[&Tensor], pass: &mut TrainPass<'_>) -> Result<Tensor> {
        let mut out = self.inner.train_output(inputs, pass)?;
        if self.rate == 0.0 {
            return Ok(out);
        }

        let scale = 1.0 / (1.0 - self.rate);
        let rng = pass.rng();
        out.data_mut().mapv_inplace(|v| {
            if self.keep.sample(&mut *rng) {
                v * scale
            } else {
                0.0
            }
        });
        Ok(out)
    }

    fn inference_output(&self, inputs: &[&Tensor], pass: &InferencePass<'_>) -> Result<Tensor> {
        self.inner.inference_output(inputs, pass)
    }

    fn as_objective(&self) -> Option<&Objective> {
        self.inner.as_objective()
    }
}
