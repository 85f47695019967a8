use crate::{Error, Result};
use ndarray::{Array, ArrayD, Axis, IxDyn};

/// Dense `f32` value flowing between layers.
///
/// Spatial values are laid out as `(batch, channels, height, width)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
}

impl Tensor {
    pub fn new(data: ArrayD<f32>) -> Self {
        Self { data }
    }

    pub fn from_vec(vec: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let actual = vec.len();
        let data = Array::from_shape_vec(IxDyn(shape), vec).map_err(|_| Error::ShapeMismatch {
            expected: shape.to_vec(),
            actual: vec![actual],
        })?;
        Ok(Self { data })
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            data: ArrayD::from_elem(IxDyn(&[1]), value),
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self> {
        self.clone().into_reshape(new_shape)
    }

    pub fn into_reshape(self, new_shape: &[usize]) -> Result<Self> {
        let total_elements: usize = new_shape.iter().product();
        if total_elements != self.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![total_elements],
                actual: vec![self.len()],
            });
        }

        let reshaped = self
            .data
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(IxDyn(new_shape))
            .map_err(|e| Error::Layer(format!("Reshape failed: {}", e)))?;
        Ok(Self { data: reshaped })
    }

    /// Collapses every axis after the first: `(B, ...)` becomes `(B, prod)`.
    pub fn flatten_batch(self) -> Result<Self> {
        let shape = self.shape().to_vec();
        match shape.len() {
            0 => self.into_reshape(&[1, 1]),
            1 => {
                let batch = shape[0];
                self.into_reshape(&[batch, 1])
            }
            _ => {
                let rest: usize = shape[1..].iter().product();
                self.into_reshape(&[shape[0], rest])
            }
        }
    }

    /// Index of the largest entry along axis 1 for every row of a 2D tensor.
    pub fn argmax_rows(&self) -> Result<Vec<usize>> {
        if self.data.ndim() != 2 {
            return Err(Error::Layer(format!(
                "argmax expects a 2D tensor, got {:?}",
                self.shape()
            )));
        }

        Ok(self
            .data
            .axis_iter(Axis(0))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect())
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(data: ArrayD<f32>) -> Self {
        Self::new(data)
    }
}

impl AsRef<ArrayD<f32>> for Tensor {
    fn as_ref(&self) -> &ArrayD<f32> {
        &self.data
    }
}
