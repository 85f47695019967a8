use super::{check_input_shape, single_input, InferencePass, TrainPass};
use crate::{
    config::{InputConfig, LayerType},
    Error, Result, Tensor,
};
use log::debug;
use ndarray::Axis;

/// Entry point of a graph. Receives the batch and optionally centres every
/// sample on its own mean.
#[derive(Debug, Clone)]
pub struct Input {
    id: String,
    shape: Vec<usize>,
    mean_subtract: bool,
}

impl Input {
    pub fn new(id: &str, config: InputConfig) -> Result<Self> {
        debug!("... creating input layer `{}`", id);

        if config.shape.is_empty() || config.shape.contains(&0) {
            return Err(Error::config(
                id,
                format!("input shape {:?} must be non-empty with non-zero axes", config.shape),
            ));
        }

        Ok(Self {
            id: id.to_string(),
            shape: config.shape,
            mean_subtract: config.mean_subtract,
        })
    }

    pub fn mean_subtract(&self) -> bool {
        self.mean_subtract
    }

    fn feed(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        let input = single_input(&self.id, inputs)?;
        check_input_shape(&self.shape, input.shape())?;

        let mut out = input.clone();
        if self.mean_subtract && out.shape().len() > 1 {
            for mut sample in out.data_mut().axis_iter_mut(Axis(0)) {
                if let Some(mean) = sample.mean() {
                    sample.mapv_inplace(|v| v - mean);
                }
            }
        }
        Ok(out)
    }
}

impl super::Layer for Input {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Input
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn train_output(&self, inputs: &[&Tensor], _pass: &mut TrainPass<'_>) -> Result<Tensor> {
        self.feed(inputs)
    }

    fn inference_output(&self, inputs: &[&Tensor], _pass: &InferencePass<'_>) -> Result<Tensor> {
        self.feed(inputs)
    }
}
