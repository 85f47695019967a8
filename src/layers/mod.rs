pub mod batch_normalization;
pub mod classifier;
pub mod conv_pool;
pub mod dot_product;
pub mod dropout;
pub mod flatten;
pub mod input;
pub mod merge;
pub mod objective;

use crate::{
    activations::Activation,
    config::LayerType,
    param::{Param, Regularization, UpdateRule},
    Error, Result, Tensor,
};
use ndarray::ArrayD;
use rand::{rngs::StdRng, SeedableRng};

pub use batch_normalization::BatchNorm;
pub use classifier::Classifier;
pub use conv_pool::ConvPool;
pub use dot_product::DotProduct;
pub use dropout::Dropout;
pub use flatten::Flatten;
pub use input::Input;
pub use merge::Merge;
pub use objective::Objective;

/// A node of the layer graph.
///
/// A layer is fully built by its constructor: output shape, parameters,
/// update rules and regularisation terms are fixed from then on, and only
/// parameter values change during training. Both outputs read the same
/// parameter handles.
pub trait Layer: std::fmt::Debug + Send + Sync {
    fn id(&self) -> &str;

    fn layer_type(&self) -> LayerType;

    fn output_shape(&self) -> &[usize];

    /// Every parameter this layer owns, trainable ones first.
    fn params(&self) -> &[Param] {
        &[]
    }

    fn update_rules(&self) -> &[UpdateRule] {
        &[]
    }

    fn regularization(&self) -> Option<&Regularization> {
        None
    }

    /// Output using batch statistics and stochastic elements.
    fn train_output(&self, inputs: &[&Tensor], pass: &mut TrainPass<'_>) -> Result<Tensor>;

    /// Deterministic output using running statistics.
    fn inference_output(&self, inputs: &[&Tensor], pass: &InferencePass<'_>) -> Result<Tensor>;

    fn as_objective(&self) -> Option<&Objective> {
        None
    }

    fn trainable_params(&self) -> Vec<Param> {
        self.params()
            .iter()
            .filter(|p| p.is_trainable())
            .cloned()
            .collect()
    }

    fn auxiliary_params(&self) -> Vec<Param> {
        self.params()
            .iter()
            .filter(|p| !p.is_trainable())
            .cloned()
            .collect()
    }

    fn l1(&self) -> f32 {
        self.regularization().map_or(0.0, Regularization::l1)
    }

    fn l2(&self) -> f32 {
        self.regularization().map_or(0.0, Regularization::l2)
    }
}

/// Value an update rule wants to write once the step commits.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub target: Param,
    pub value: ArrayD<f32>,
}

/// State threaded through one train-branch evaluation.
pub struct TrainPass<'a> {
    labels: Option<&'a Tensor>,
    rng: StdRng,
    updates: Vec<PendingUpdate>,
}

impl<'a> TrainPass<'a> {
    /// `seed` drives every stochastic element of the pass, so two passes
    /// with the same seed draw the same dropout masks.
    pub fn new(labels: Option<&'a Tensor>, seed: u64) -> Self {
        Self {
            labels,
            rng: StdRng::seed_from_u64(seed),
            updates: Vec::new(),
        }
    }

    pub fn labels(&self) -> Option<&'a Tensor> {
        self.labels
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Evaluates `rule` against `observed`; the target is not written.
    pub fn record(&mut self, rule: &UpdateRule, observed: &ArrayD<f32>) -> Result<()> {
        let value = rule.next_value(observed)?;
        self.updates.retain(|u| !u.target.ptr_eq(&rule.target));
        self.updates.push(PendingUpdate {
            target: rule.target.clone(),
            value,
        });
        Ok(())
    }

    pub fn updates(&self) -> &[PendingUpdate] {
        &self.updates
    }

    pub fn into_updates(self) -> Vec<PendingUpdate> {
        self.updates
    }
}

/// State for one inference-branch evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct InferencePass<'a> {
    labels: Option<&'a Tensor>,
}

impl<'a> InferencePass<'a> {
    pub fn new(labels: Option<&'a Tensor>) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> Option<&'a Tensor> {
        self.labels
    }
}

pub(crate) fn single_input<'t>(layer: &str, inputs: &[&'t Tensor]) -> Result<&'t Tensor> {
    match inputs {
        [one] => Ok(*one),
        _ => Err(Error::Layer(format!(
            "layer `{}` expects one input, got {}",
            layer,
            inputs.len()
        ))),
    }
}

/// Batch size may vary between calls; every other axis must match.
pub(crate) fn check_input_shape(declared: &[usize], actual: &[usize]) -> Result<()> {
    if declared.len() != actual.len() || declared.iter().skip(1).ne(actual.iter().skip(1)) {
        let mut expected = declared.to_vec();
        if let (Some(e), Some(a)) = (expected.first_mut(), actual.first()) {
            *e = *a;
        }
        return Err(Error::ShapeMismatch {
            expected,
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

/// Takes the parameter at `index` from caller-supplied handles.
/// Output shape after `activation`. Bad support parameters are a config
/// error; a shape the activation cannot take is a shape error.
pub(crate) fn activation_shape(
    layer: &str,
    activation: &Activation,
    input_shape: &[usize],
) -> Result<Vec<usize>> {
    activation
        .validate()
        .map_err(|e| Error::config(layer, e))?;
    activation
        .output_shape(input_shape)
        .map_err(|e| Error::shape(layer, e))
}

pub(crate) fn bind_param(
    layer: &str,
    supplied: &[Param],
    index: usize,
    what: &str,
    shape: &[usize],
) -> Result<Param> {
    let param = supplied.get(index).ok_or_else(|| {
        Error::config(
            layer,
            format!(
                "input_params has {} entries, `{}` expected at position {}",
                supplied.len(),
                what,
                index
            ),
        )
    })?;

    if param.shape() != shape {
        return Err(Error::shape(
            layer,
            format!(
                "supplied `{}` has shape {:?}, expected {:?}",
                what,
                param.shape(),
                shape
            ),
        ));
    }

    Ok(param.clone())
}
