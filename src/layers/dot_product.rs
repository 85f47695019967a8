use super::{
    activation_shape, bind_param, check_input_shape, single_input, BatchNorm, InferencePass,
    TrainPass,
};
use crate::{
    activations::Activation,
    config::{DotProductConfig, LayerType},
    param::{Param, ParamRole, Regularization, UpdateRule},
    Error, Result, Tensor,
};
use log::debug;
use ndarray::{ArrayD, Ix2};
use rand::Rng;

/// Fully connected layer. Inputs with more than two axes are flattened to
/// `(batch, features)` first.
#[derive(Debug, Clone)]
pub struct DotProduct {
    id: String,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    activation: Activation,
    w: Param,
    b: Param,
    batch_norm: Option<BatchNorm>,
    params: Vec<Param>,
    rules: Vec<UpdateRule>,
    regularization: Regularization,
}

impl DotProduct {
    pub fn new<R: Rng + ?Sized>(
        id: &str,
        input_shape: &[usize],
        config: DotProductConfig,
        rng: &mut R,
    ) -> Result<Self> {
        debug!("... creating dot product layer `{}`", id);

        let (batch, features) = flat_dims(id, input_shape)?;
        if config.num_neurons == 0 {
            return Err(Error::config(id, "num_neurons must be at least 1"));
        }
        let units = config.num_neurons;

        let output_shape = activation_shape(id, &config.activation, &[batch, units])?;

        let w_shape = [features, units];
        let b_shape = [units];
        let (w, b, batch_norm) = match &config.input_params {
            Some(supplied) => {
                let w = bind_param(id, supplied, 0, "w", &w_shape)?;
                let b = bind_param(id, supplied, 1, "b", &b_shape)?;
                let bn = if config.batch_norm {
                    Some(BatchNorm::bind(id, units, config.norm, supplied, 2)?)
                } else {
                    None
                };
                (w, b, bn)
            }
            None => (
                Param::gaussian(format!("{}.w", id), &w_shape, 0.01, rng),
                Param::zeros(format!("{}.b", id), ParamRole::Trainable, &b_shape),
                config
                    .batch_norm
                    .then(|| BatchNorm::new(id, units, config.norm))
                    .transpose()?,
            ),
        };

        let mut params = vec![w.clone(), b.clone()];
        let mut rules = Vec::new();
        if let Some(bn) = &batch_norm {
            params.extend(bn.params());
            rules.extend_from_slice(bn.update_rules());
        }
        let regularization = Regularization::over(&params);

        Ok(Self {
            id: id.to_string(),
            input_shape: input_shape.to_vec(),
            output_shape,
            activation: config.activation,
            w,
            b,
            batch_norm,
            params,
            rules,
            regularization,
        })
    }

    pub fn units(&self) -> usize {
        self.b.len()
    }

    pub fn weights(&self) -> &Param {
        &self.w
    }

    pub fn bias(&self) -> &Param {
        &self.b
    }

    pub fn batch_norm(&self) -> Option<&BatchNorm> {
        self.batch_norm.as_ref()
    }

    fn affine(&self, input: &Tensor) -> Result<ArrayD<f32>> {
        affine(&self.id, &self.input_shape, input, &self.w, &self.b)
    }
}

/// `(batch, features)` of a shape once everything after the batch axis is
/// collapsed.
pub(crate) fn flat_dims(id: &str, input_shape: &[usize]) -> Result<(usize, usize)> {
    match input_shape {
        [] | [_] => Err(Error::shape(
            id,
            format!(
                "expected an input with a batch axis and features, got {:?}",
                input_shape
            ),
        )),
        [batch, rest @ ..] => Ok((*batch, rest.iter().product())),
    }
}

/// `flatten(input) . w + b`
pub(crate) fn affine(
    id: &str,
    input_shape: &[usize],
    input: &Tensor,
    w: &Param,
    b: &Param,
) -> Result<ArrayD<f32>> {
    check_input_shape(input_shape, input.shape())?;

    let x = input
        .clone()
        .flatten_batch()?
        .into_data()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::Layer(format!("layer `{}` input: {}", id, e)))?;

    let w = w.read();
    let w = w
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::Layer(format!("layer `{}` weights: {}", id, e)))?;

    let mut out = x.dot(&w);
    let b = b.read();
    for mut row in out.rows_mut() {
        row.zip_mut_with(&*b, |o, &bias| *o += bias);
    }

    Ok(out.into_dyn())
}

impl super::Layer for DotProduct {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer_type(&self) -> LayerType {
        LayerType::DotProduct
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn update_rules(&self) -> &[UpdateRule] {
        &self.rules
    }

    fn regularization(&self) -> Option<&Regularization> {
        Some(&self.regularization)
    }

    fn train_output(&self, inputs: &[&Tensor], pass: &mut TrainPass<'_>) -> Result<Tensor> {
        let pre = self.affine(single_input(&self.id, inputs)?)?;
        let normalized = match &self.batch_norm {
            Some(bn) => bn.train(&pre, pass)?,
            None => pre,
        };
        self.activation.apply(Tensor::new(normalized))
    }

    fn inference_output(&self, inputs: &[&Tensor], _pass: &InferencePass<'_>) -> Result<Tensor> {
        let pre = self.affine(single_input(&self.id, inputs)?)?;
        let normalized = match &self.batch_norm {
            Some(bn) => bn.inference(&pre)?,
            None => pre,
        };
        self.activation.apply(Tensor::new(normalized))
    }
}

#[cfg(test)]
mod tests {
    use super::super::Layer;
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    fn bound(activation: Activation) -> DotProduct {
        let w = Param::new(
            "src.w",
            ParamRole::Trainable,
            array![[1.0, 2.0], [3.0, 4.0]].into_dyn(),
        );
        let b = Param::new("src.b", ParamRole::Trainable, array![0.1, 0.2].into_dyn());
        let config = DotProductConfig {
            activation,
            input_params: Some(vec![w, b]),
            ..DotProductConfig::new(2)
        };
        DotProduct::new("fc", &[1, 2], config, &mut StdRng::seed_from_u64(0)).unwrap()
    }

    #[test]
    fn test_dot_product_forward() {
        let layer = bound(Activation::Linear);
        let input = Tensor::from_vec(vec![1.0, 1.0], &[1, 2]).unwrap();
        let output = layer
            .inference_output(&[&input], &InferencePass::default())
            .unwrap();

        let result = output.to_vec();
        assert_eq!(result.len(), 2);
        assert_abs_diff_eq!(result[0], 4.1, epsilon = 1e-6);
        assert_abs_diff_eq!(result[1], 6.2, epsilon = 1e-6);
    }

    #[test]
    fn test_dot_product_with_relu() {
        let layer = bound(Activation::ReLU);
        let input = Tensor::from_vec(vec![-1.0, -1.0], &[1, 2]).unwrap();
        let output = layer
            .inference_output(&[&input], &InferencePass::default())
            .unwrap();
        assert_eq!(output.to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_flattens_spatial_input() {
        let layer = DotProduct::new(
            "fc",
            &[3, 2, 2, 2],
            DotProductConfig::new(5),
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert_eq!(layer.output_shape(), &[3, 5]);
        assert_eq!(layer.weights().shape(), &[8, 5]);
    }

    #[test]
    fn test_wrong_supplied_shape() {
        let w = Param::zeros("w", ParamRole::Trainable, &[3, 2]);
        let b = Param::zeros("b", ParamRole::Trainable, &[2]);
        let config = DotProductConfig {
            input_params: Some(vec![w, b]),
            ..DotProductConfig::new(2)
        };
        let err = DotProduct::new("fc", &[1, 2], config, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
    }
}
