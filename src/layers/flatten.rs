use super::dot_product::flat_dims;
use super::{check_input_shape, single_input, InferencePass, TrainPass};
use crate::{config::LayerType, Result, Tensor};
use log::debug;

/// `(B, ...)` to `(B, prod)`.
#[derive(Debug, Clone)]
pub struct Flatten {
    id: String,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Flatten {
    pub fn new(id: &str, input_shape: &[usize]) -> Result<Self> {
        debug!("... creating flatten layer `{}`", id);
        let (batch, features) = flat_dims(id, input_shape)?;
        Ok(Self {
            id: id.to_string(),
            input_shape: input_shape.to_vec(),
            output_shape: vec![batch, features],
        })
    }

    fn flatten(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        let input = single_input(&self.id, inputs)?;
        check_input_shape(&self.input_shape, input.shape())?;
        input.clone().flatten_batch()
    }
}

impl super::Layer for Flatten {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Flatten
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn train_output(&self, inputs: &[&Tensor], _pass: &mut TrainPass<'_>) -> Result<Tensor> {
        self.flatten(inputs)
    }

    fn inference_output(&self, inputs: &[&Tensor], _pass: &InferencePass<'_>) -> Result<Tensor> {
        self.flatten(inputs)
    }
}
