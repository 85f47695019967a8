//! Gradient-descent updates for trainable parameters.

use crate::{param::Param, Error, Result};
use ndarray::{ArrayD, IxDyn, Zip};

/// Turns gradients into new parameter values in two phases.
///
/// [`Optimizer::propose`] computes values without touching parameters or
/// committed optimizer state. The train step then calls exactly one of
/// [`Optimizer::commit`] (the proposal was written) or
/// [`Optimizer::discard`] (it was not).
pub trait Optimizer {
    fn propose(&mut self, params: &[Param], grads: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>>;

    fn commit(&mut self);

    fn discard(&mut self);
}

/// Stochastic gradient descent with classical momentum:
/// `v <- momentum * v - learning_rate * g`, `p <- p + v`.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocities: Vec<(Param, ArrayD<f32>)>,
    staged: Option<Vec<(Param, ArrayD<f32>)>>,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            velocities: Vec::new(),
            staged: None,
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Committed velocity of `param`, if it has one.
    pub fn velocity(&self, param: &Param) -> Option<&ArrayD<f32>> {
        self.velocities
            .iter()
            .find(|(p, _)| p.ptr_eq(param))
            .map(|(_, v)| v)
    }
}

impl Optimizer for Sgd {
    fn propose(&mut self, params: &[Param], grads: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>> {
        if params.len() != grads.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![params.len()],
                actual: vec![grads.len()],
            });
        }

        let mut staged = Vec::with_capacity(params.len());
        let mut proposed = Vec::with_capacity(params.len());
        for (param, grad) in params.iter().zip(grads) {
            param.check_shape(grad.shape())?;

            let velocity = match self.velocity(param) {
                Some(v) => v * self.momentum - grad * self.learning_rate,
                None => grad * -self.learning_rate,
            };
            let mut next = ArrayD::zeros(IxDyn(param.shape()));
            Zip::from(&mut next)
                .and(&*param.read())
                .and(&velocity)
                .for_each(|n, &p, &v| *n = p + v);

            proposed.push(next);
            staged.push((param.clone(), velocity));
        }

        self.staged = Some(staged);
        Ok(proposed)
    }

    fn commit(&mut self) {
        if let Some(staged) = self.staged.take() {
            for (param, velocity) in staged {
                match self.velocities.iter_mut().find(|(p, _)| p.ptr_eq(&param)) {
                    Some((_, v)) => *v = velocity,
                    None => self.velocities.push((param, velocity)),
                }
            }
        }
    }

    fn discard(&mut self) {
        self.staged = None;
    }
}
