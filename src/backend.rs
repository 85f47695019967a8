//! Gradient computation.
//!
//! The layers only evaluate values; differentiating the train loss is the
//! job of a [`Backend`]. [`FiniteDifference`] works for any graph and is
//! meant for small networks and for checking other backends.

use crate::{param::Param, Error, Result};
use ndarray::{ArrayD, Dimension, IxDyn};

/// Source of gradients of a scalar loss.
pub trait Backend {
    /// Gradient of `loss` with respect to each of `params`, in order and
    /// shaped like the parameter.
    ///
    /// `loss` re-evaluates the train branch against the current parameter
    /// values with the same stochastic draws every time. An implementation
    /// that perturbs parameters must restore them before returning, also
    /// when it fails.
    fn gradients(
        &self,
        loss: &mut dyn FnMut() -> Result<f32>,
        params: &[Param],
    ) -> Result<Vec<ArrayD<f32>>>;
}

/// Central differences: `(f(p + h) - f(p - h)) / 2h` per element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiniteDifference {
    pub step: f32,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        Self { step: 1e-3 }
    }
}

impl FiniteDifference {
    pub fn new(step: f32) -> Result<Self> {
        if !(step > 0.0 && step.is_finite()) {
            return Err(Error::Backend(format!(
                "finite difference step must be positive, got {}",
                step
            )));
        }
        Ok(Self { step })
    }

    fn element(
        &self,
        loss: &mut dyn FnMut() -> Result<f32>,
        param: &Param,
        at: &[usize],
    ) -> Result<f32> {
        let original = param.read()[at];

        param.write()[at] = original + self.step;
        let plus = loss();
        param.write()[at] = original - self.step;
        let minus = loss();
        param.write()[at] = original;

        Ok((plus? - minus?) / (2.0 * self.step))
    }
}

impl Backend for FiniteDifference {
    fn gradients(
        &self,
        loss: &mut dyn FnMut() -> Result<f32>,
        params: &[Param],
    ) -> Result<Vec<ArrayD<f32>>> {
        params
            .iter()
            .map(|param| {
                let mut grad = ArrayD::zeros(IxDyn(param.shape()));
                for idx in ndarray::indices(param.shape()) {
                    let at = idx.slice();
                    grad[at] = self.element(&mut *loss, param, at)?;
                }
                Ok(grad)
            })
            .collect()
    }
}
