//! Shared parameter handles and the non-gradient update rules that act on them.

use crate::{Error, Result, Tensor};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Updated by the optimizer from gradients.
    Trainable,
    /// Updated by an [`UpdateRule`] during the train step.
    Auxiliary,
}

struct ParamInner {
    name: String,
    role: ParamRole,
    shape: Vec<usize>,
    value: RwLock<ArrayD<f32>>,
}

/// A named tensor shared by reference.
///
/// Cloning copies the handle: every clone observes the same value, which is
/// how the train and inference branches of a layer see one set of weights.
#[derive(Clone)]
pub struct Param {
    inner: Arc<ParamInner>,
}

impl Param {
    pub fn new(name: impl Into<String>, role: ParamRole, value: ArrayD<f32>) -> Self {
        Self {
            inner: Arc::new(ParamInner {
                name: name.into(),
                role,
                shape: value.shape().to_vec(),
                value: RwLock::new(value),
            }),
        }
    }

    pub fn zeros(name: impl Into<String>, role: ParamRole, shape: &[usize]) -> Self {
        Self::new(name, role, ArrayD::zeros(IxDyn(shape)))
    }

    pub fn filled(name: impl Into<String>, role: ParamRole, shape: &[usize], value: f32) -> Self {
        Self::new(name, role, ArrayD::from_elem(IxDyn(shape), value))
    }

    /// `scale * N(0, 1)` entries.
    pub fn gaussian<R: Rng + ?Sized>(
        name: impl Into<String>,
        shape: &[usize],
        scale: f32,
        rng: &mut R,
    ) -> Self {
        let value = ArrayD::from_shape_simple_fn(IxDyn(shape), || {
            let z: f32 = rng.sample(StandardNormal);
            scale * z
        });
        Self::new(name, ParamRole::Trainable, value)
    }

    pub fn from_tensor(name: impl Into<String>, role: ParamRole, tensor: Tensor) -> Self {
        Self::new(name, role, tensor.into_data())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn role(&self) -> ParamRole {
        self.inner.role
    }

    pub fn is_trainable(&self) -> bool {
        self.inner.role == ParamRole::Trainable
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    pub fn len(&self) -> usize {
        self.inner.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both handles point at the same parameter object.
    pub fn ptr_eq(&self, other: &Param) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ArrayD<f32>> {
        self.inner
            .value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ArrayD<f32>> {
        self.inner
            .value
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn value(&self) -> ArrayD<f32> {
        self.read().clone()
    }

    /// Replaces the value; the shape is fixed at creation.
    pub fn set_value(&self, value: ArrayD<f32>) -> Result<()> {
        self.check_shape(value.shape())?;
        *self.write() = value;
        Ok(())
    }

    pub(crate) fn check_shape(&self, shape: &[usize]) -> Result<()> {
        if shape != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().to_vec(),
                actual: shape.to_vec(),
            });
        }
        Ok(())
    }

    pub fn abs_sum(&self) -> f32 {
        self.read().iter().map(|v| v.abs()).sum()
    }

    pub fn square_sum(&self) -> f32 {
        self.read().iter().map(|v| v * v).sum()
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.inner.name)
            .field("role", &self.inner.role)
            .field("shape", &self.inner.shape)
            .finish()
    }
}

/// Batch quantity an update rule consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    BatchMean,
    BatchVariance,
}

/// `target <- (1 - factor) * target + factor * observed + offset`
///
/// Evaluated with the statistic observed during a train pass and committed
/// together with the optimizer's updates.
#[derive(Debug, Clone)]
pub struct UpdateRule {
    pub target: Param,
    pub statistic: Statistic,
    pub factor: f32,
    pub offset: f32,
}

impl UpdateRule {
    pub fn next_value(&self, observed: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.target.check_shape(observed.shape())?;
        let current = self.target.read();
        let factor = self.factor;
        let offset = self.offset;
        Ok(ndarray::Zip::from(&*current)
            .and(observed)
            .map_collect(|&c, &o| (1.0 - factor) * c + factor * o + offset))
    }
}

/// L1/L2 terms over a fixed set of trainable parameters.
///
/// The set is chosen when the layer is built; the sums are taken over the
/// current values.
#[derive(Debug, Clone, Default)]
pub struct Regularization {
    params: Vec<Param>,
}

impl Regularization {
    pub fn over(params: &[Param]) -> Self {
        Self {
            params: params.iter().filter(|p| p.is_trainable()).cloned().collect(),
        }
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn l1(&self) -> f32 {
        self.params.iter().map(Param::abs_sum).sum()
    }

    pub fn l2(&self) -> f32 {
        self.params.iter().map(Param::square_sum).sum()
    }
}

/// Deduplicates by handle, keeping first-seen order.
pub fn unique_params<'a>(params: impl IntoIterator<Item = &'a Param>) -> Vec<Param> {
    let mut out: Vec<Param> = Vec::new();
    for p in params {
        if !out.iter().any(|q| q.ptr_eq(p)) {
            out.push(p.clone());
        }
    }
    out
}
