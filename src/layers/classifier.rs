use super::dot_product::{affine, flat_dims};
use super::{activation_shape, bind_param, single_input, InferencePass, TrainPass};
use crate::{
    activations::Activation,
    config::{ClassifierConfig, LayerType},
    param::{Param, ParamRole, Regularization},
    Error, Result, Tensor,
};
use log::debug;
use rand::Rng;

/// Class scores over `num_classes`; the input is flattened first.
#[derive(Debug, Clone)]
pub struct Classifier {
    id: String,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    activation: Activation,
    w: Param,
    b: Param,
    params: Vec<Param>,
    regularization: Regularization,
}

impl Classifier {
    pub fn new<R: Rng + ?Sized>(
        id: &str,
        input_shape: &[usize],
        config: ClassifierConfig,
        rng: &mut R,
    ) -> Result<Self> {
        debug!("... creating classifier `{}`", id);

        let (batch, features) = flat_dims(id, input_shape)?;
        if config.num_classes == 0 {
            return Err(Error::config(id, "num_classes must be at least 1"));
        }
        let classes = config.num_classes;

        let output_shape = activation_shape(id, &config.activation, &[batch, classes])?;

        let (w, b) = match &config.input_params {
            Some(supplied) => (
                bind_param(id, supplied, 0, "w", &[features, classes])?,
                bind_param(id, supplied, 1, "b", &[classes])?,
            ),
            None => (
                Param::gaussian(format!("{}.w", id), &[features, classes], 0.01, rng),
                Param::zeros(format!("{}.b", id), ParamRole::Trainable, &[classes]),
            ),
        };

        let params = vec![w.clone(), b.clone()];
        let regularization = Regularization::over(&params);

        Ok(Self {
            id: id.to_string(),
            input_shape: input_shape.to_vec(),
            output_shape,
            activation: config.activation,
            w,
            b,
            params,
            regularization,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.b.len()
    }

    pub fn weights(&self) -> &Param {
        &self.w
    }

    pub fn bias(&self) -> &Param {
        &self.b
    }

    /// Predicted class per sample: the argmax of a class-score output.
    pub fn predictions(output: &Tensor) -> Result<Vec<usize>> {
        output.argmax_rows()
    }

    fn scores(&self, input: &Tensor) -> Result<Tensor> {
        let pre = affine(&self.id, &self.input_shape, input, &self.w, &self.b)?;
        self.activation.apply(Tensor::new(pre))
    }
}

impl super::Layer for Classifier {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Classifier
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn regularization(&self) -> Option<&Regularization> {
        Some(&self.regularization)
    }

    fn train_output(&self, inputs: &[&Tensor], _pass: &mut TrainPass<'_>) -> Result<Tensor> {
        self.scores(single_input(&self.id, inputs)?)
    }

    fn inference_output(&self, inputs: &[&Tensor], _pass: &InferencePass<'_>) -> Result<Tensor> {
        self.scores(single_input(&self.id, inputs)?)
    }
}
