use super::{check_input_shape, InferencePass, TrainPass};
use crate::{
    config::{LayerType, MergeConfig, MergeMode},
    Error, Result, Tensor,
};
use log::debug;
use ndarray::{concatenate, ArrayD, Axis};

/// Joins two or more origins, either elementwise or along axis 1.
#[derive(Debug, Clone)]
pub struct Merge {
    id: String,
    mode: MergeMode,
    input_shapes: Vec<Vec<usize>>,
    output_shape: Vec<usize>,
}

impl Merge {
    pub fn new(id: &str, input_shapes: &[Vec<usize>], config: MergeConfig) -> Result<Self> {
        debug!("... creating merge layer `{}`", id);

        let first = match input_shapes {
            [first, _, ..] => first,
            _ => {
                return Err(Error::config(
                    id,
                    format!("merge needs at least two origins, got {}", input_shapes.len()),
                ))
            }
        };

        let output_shape = match config.mode {
            MergeMode::Sum => {
                if let Some(other) = input_shapes.iter().find(|s| *s != first) {
                    return Err(Error::shape(
                        id,
                        format!("sum merge needs identical shapes, got {:?} and {:?}", first, other),
                    ));
                }
                first.clone()
            }
            MergeMode::Concatenate => {
                if first.len() < 2 {
                    return Err(Error::shape(
                        id,
                        format!("concatenate merge needs a feature axis, got {:?}", first),
                    ));
                }
                let mut out = first.clone();
                out[1] = 0;
                for shape in input_shapes {
                    let compatible = shape.len() == first.len()
                        && shape
                            .iter()
                            .zip(first)
                            .enumerate()
                            .all(|(axis, (a, b))| axis == 1 || a == b);
                    if !compatible {
                        return Err(Error::shape(
                            id,
                            format!(
                                "cannot concatenate {:?} with {:?} along axis 1",
                                first, shape
                            ),
                        ));
                    }
                    out[1] += shape[1];
                }
                out
            }
        };

        Ok(Self {
            id: id.to_string(),
            mode: config.mode,
            input_shapes: input_shapes.to_vec(),
            output_shape,
        })
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    fn merge(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        if inputs.len() != self.input_shapes.len() {
            return Err(Error::Layer(format!(
                "layer `{}` expects {} inputs, got {}",
                self.id,
                self.input_shapes.len(),
                inputs.len()
            )));
        }
        for (declared, input) in self.input_shapes.iter().zip(inputs) {
            check_input_shape(declared, input.shape())?;
        }

        let out: ArrayD<f32> = match self.mode {
            MergeMode::Sum => {
                let mut acc = inputs[0].data().clone();
                for input in &inputs[1..] {
                    if input.shape() != acc.shape() {
                        return Err(Error::ShapeMismatch {
                            expected: acc.shape().to_vec(),
                            actual: input.shape().to_vec(),
                        });
                    }
                    acc += input.data();
                }
                acc
            }
            MergeMode::Concatenate => {
                let views: Vec<_> = inputs.iter().map(|t| t.data().view()).collect();
                concatenate(Axis(1), &views)
                    .map_err(|e| Error::Layer(format!("layer `{}`: {}", self.id, e)))?
            }
        };
        Ok(Tensor::new(out))
    }
}

impl super::Layer for Merge {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Merge
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn train_output(&self, inputs: &[&Tensor], _pass: &mut TrainPass<'_>) -> Result<Tensor> {
        self.merge(inputs)
    }

    fn inference_output(&self, inputs: &[&Tensor], _pass: &InferencePass<'_>) -> Result<Tensor> {
        self.merge(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Layer;
    use super::*;

    #[test]
    fn test_concatenate() {
        let layer = Merge::new("m", &[vec![2, 1], vec![2, 3]], MergeConfig::default()).unwrap();
        assert_eq!(layer.output_shape(), &[2, 4]);

        let a = Tensor::from_vec(vec![1.0, 2.0], &[2, 1]).unwrap();
        let b = Tensor::from_vec(vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 3]).unwrap();
        let out = layer
            .inference_output(&[&a, &b], &InferencePass::default())
            .unwrap();
        assert_eq!(out.to_vec(), vec![1.0, 3.0, 4.0, 5.0, 2.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_sum() {
        let config = MergeConfig {
            mode: MergeMode::Sum,
        };
        let layer = Merge::new("m", &[vec![1, 2], vec![1, 2]], config).unwrap();
        let a = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
        let out = layer
            .inference_output(&[&a, &a], &InferencePass::default())
            .unwrap();
        assert_eq!(out.to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_shapes_must_agree() {
        let sum = MergeConfig {
            mode: MergeMode::Sum,
        };
        assert!(matches!(
            Merge::new("m", &[vec![1, 2], vec![1, 3]], sum).unwrap_err(),
            Error::Shape { .. }
        ));
        assert!(matches!(
            Merge::new("m", &[vec![1, 2, 4], vec![1, 3, 5]], MergeConfig::default()).unwrap_err(),
            Error::Shape { .. }
        ));
        assert!(matches!(
            Merge::new("m", &[vec![1, 2]], MergeConfig::default()).unwrap_err(),
            Error::Config { .. }
        ));
    }
}
