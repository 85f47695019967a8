use crate::{Error, Result, Tensor};
use ndarray::{Axis, IxDyn, Zip};
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxoutKind {
    Max,
    Mean,
}

/// Elementwise or channel-wise non-linearity applied identically on the
/// train and inference branches.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "ActivationSpec")]
pub enum Activation {
    Linear,
    Abs,
    ReLU,
    LeakyReLU { alpha: f32 },
    ELU { alpha: f32 },
    Sigmoid,
    Tanh,
    Softmax { temperature: f32 },
    Squared,
    /// Reduces groups of `size` consecutive channels (axis 1) to one.
    Maxout { kind: MaxoutKind, size: usize },
}

/// Wire form: a bare name, or a name with its support parameters.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ActivationSpec {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        alpha: Option<f32>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        size: Option<usize>,
        #[serde(default)]
        kind: Option<MaxoutKind>,
    },
}

impl TryFrom<ActivationSpec> for Activation {
    type Error = String;

    fn try_from(spec: ActivationSpec) -> std::result::Result<Self, String> {
        match spec {
            ActivationSpec::Name(name) => name.parse(),
            ActivationSpec::Detailed {
                name,
                alpha,
                temperature,
                size,
                kind,
            } => {
                let base: Activation = name.parse()?;
                let activation = match base {
                    Activation::LeakyReLU { alpha: default } => Activation::LeakyReLU {
                        alpha: alpha.unwrap_or(default),
                    },
                    Activation::ELU { alpha: default } => Activation::ELU {
                        alpha: alpha.unwrap_or(default),
                    },
                    Activation::Softmax { temperature: default } => Activation::Softmax {
                        temperature: temperature.unwrap_or(default),
                    },
                    Activation::Maxout {
                        kind: default_kind,
                        size: default_size,
                    } => Activation::Maxout {
                        kind: kind.unwrap_or(default_kind),
                        size: size.unwrap_or(default_size),
                    },
                    other => other,
                };
                activation.validate()?;
                Ok(activation)
            }
        }
    }
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_lowercase().as_str() {
            "linear" | "none" | "identity" => Ok(Activation::Linear),
            "abs" => Ok(Activation::Abs),
            "relu" => Ok(Activation::ReLU),
            "leaky_relu" => Ok(Activation::LeakyReLU { alpha: 0.3 }),
            "elu" => Ok(Activation::ELU { alpha: 1.0 }),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "softmax" => Ok(Activation::Softmax { temperature: 1.0 }),
            "squared" => Ok(Activation::Squared),
            "maxout" => Ok(Activation::Maxout {
                kind: MaxoutKind::Max,
                size: 2,
            }),
            _ => Err(format!("unknown activation `{}`", s)),
        }
    }
}

impl Activation {
    /// Rejects support parameters the activation cannot be evaluated with.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            Activation::LeakyReLU { alpha } | Activation::ELU { alpha } if !alpha.is_finite() => {
                Err(format!("activation alpha must be finite, got {}", alpha))
            }
            Activation::Softmax { temperature } if !(temperature > 0.0) => Err(format!(
                "softmax temperature must be positive, got {}",
                temperature
            )),
            Activation::Maxout { size: 0, .. } => Err("maxout size must be at least 1".to_string()),
            _ => Ok(()),
        }
    }

    /// Shape after activation; only maxout changes it.
    pub fn output_shape(&self, input_shape: &[usize]) -> std::result::Result<Vec<usize>, String> {
        self.validate()?;
        match *self {
            Activation::Maxout { size, .. } => {
                if input_shape.len() < 2 {
                    return Err(format!(
                        "maxout needs a feature axis, got shape {:?}",
                        input_shape
                    ));
                }
                if input_shape[1] % size != 0 {
                    return Err(format!(
                        "maxout size {} does not divide {} features",
                        size, input_shape[1]
                    ));
                }
                let mut out = input_shape.to_vec();
                out[1] /= size;
                Ok(out)
            }
            _ => Ok(input_shape.to_vec()),
        }
    }

    pub fn apply(&self, mut tensor: Tensor) -> Result<Tensor> {
        match *self {
            Activation::Linear => {}
            Activation::Abs => tensor.data_mut().mapv_inplace(f32::abs),
            Activation::ReLU => {
                Zip::from(tensor.data_mut()).for_each(|x| {
                    *x = x.max(0.0);
                });
            }
            Activation::LeakyReLU { alpha } => {
                Zip::from(tensor.data_mut()).for_each(|x| {
                    if *x < 0.0 {
                        *x *= alpha;
                    }
                });
            }
            Activation::ELU { alpha } => {
                Zip::from(tensor.data_mut()).for_each(|x| {
                    if *x < 0.0 {
                        *x = alpha * (x.exp() - 1.0);
                    }
                });
            }
            Activation::Sigmoid => {
                Zip::from(tensor.data_mut()).for_each(|x| {
                    *x = 1.0 / (1.0 + (-*x).exp());
                });
            }
            Activation::Tanh => tensor.data_mut().mapv_inplace(f32::tanh),
            Activation::Softmax { temperature } => apply_softmax(&mut tensor, temperature),
            Activation::Squared => tensor.data_mut().mapv_inplace(|x| x * x),
            Activation::Maxout { kind, size } => return apply_maxout(tensor, kind, size),
        }
        Ok(tensor)
    }
}

fn apply_softmax(tensor: &mut Tensor, temperature: f32) {
    let data = tensor.data_mut();
    if data.ndim() == 0 {
        return;
    }

    let axis = if data.ndim() == 1 { Axis(0) } else { Axis(1) };
    for mut lane in data.lanes_mut(axis) {
        let max_val = lane.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let mut sum = 0.0;
        for v in lane.iter_mut() {
            *v = ((*v - max_val) / temperature).exp();
            sum += *v;
        }
        lane.mapv_inplace(|v| v / sum);
    }
}

fn apply_maxout(tensor: Tensor, kind: MaxoutKind, size: usize) -> Result<Tensor> {
    let shape = tensor.shape().to_vec();
    let out_shape = Activation::Maxout { kind, size }
        .output_shape(&shape)
        .map_err(Error::Layer)?;

    let batch = shape[0];
    let groups = out_shape[1];
    let rest: usize = shape[2..].iter().product();

    let grouped = tensor
        .into_data()
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, groups, size, rest))
        .map_err(|e| Error::Layer(format!("Reshape failed: {}", e)))?;

    let reduced = match kind {
        MaxoutKind::Max => grouped.fold_axis(Axis(2), f32::NEG_INFINITY, |m, &v| m.max(v)),
        MaxoutKind::Mean => grouped.sum_axis(Axis(2)) / size as f32,
    };

    let out = reduced
        .into_shape_with_order(IxDyn(&out_shape))
        .map_err(|e| Error::Layer(format!("Reshape failed: {}", e)))?;
    Ok(Tensor::new(out))
}
