use super::{
    activation_shape, bind_param, check_input_shape, single_input, BatchNorm, InferencePass,
    TrainPass,
};
use crate::{
    activations::Activation,
    config::{ConvPoolConfig, LayerType},
    ops::{conv, pool, BorderMode, PoolType},
    param::{Param, ParamRole, Regularization, UpdateRule},
    Error, Result, Tensor,
};
use log::debug;
use ndarray::{Array4, ArrayD, Axis, Ix4};
use rand::Rng;

/// Convolution, optional pooling, bias, optional batch normalisation and an
/// activation, as one layer over `(B, C, H, W)` inputs.
#[derive(Debug, Clone)]
pub struct ConvPool {
    id: String,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    filter_shape: (usize, usize),
    stride: (usize, usize),
    border_mode: BorderMode,
    pool_size: (usize, usize),
    pool_type: PoolType,
    activation: Activation,
    w: Param,
    b: Param,
    batch_norm: Option<BatchNorm>,
    params: Vec<Param>,
    rules: Vec<UpdateRule>,
    regularization: Regularization,
}

impl ConvPool {
    pub fn new<R: Rng + ?Sized>(
        id: &str,
        input_shape: &[usize],
        config: ConvPoolConfig,
        rng: &mut R,
    ) -> Result<Self> {
        debug!("... creating conv pool layer `{}`", id);

        let (batch, channels, height, width) = match *input_shape {
            [b, c, h, w] => (b, c, h, w),
            _ => {
                return Err(Error::shape(
                    id,
                    format!(
                        "conv_pool expects a (batch, channels, height, width) input, got {:?}",
                        input_shape
                    ),
                ))
            }
        };

        if config.nkerns == 0 {
            return Err(Error::config(id, "nkerns must be at least 1"));
        }
        if config.filter_shape.0 == 0 || config.filter_shape.1 == 0 {
            return Err(Error::config(
                id,
                format!("filter_shape {:?} must be non-zero", config.filter_shape),
            ));
        }
        if config.stride.0 == 0 || config.stride.1 == 0 {
            return Err(Error::config(
                id,
                format!("stride {:?} must be non-zero", config.stride),
            ));
        }

        let conv_h = config
            .border_mode
            .output_dim(height, config.filter_shape.0, config.stride.0);
        let conv_w = config
            .border_mode
            .output_dim(width, config.filter_shape.1, config.stride.1);
        let (conv_h, conv_w) = match (conv_h, conv_w) {
            (Some(h), Some(w)) => (h, w),
            _ => {
                return Err(Error::shape(
                    id,
                    format!(
                        "filter {:?} does not fit a {}x{} input with border mode {:?}",
                        config.filter_shape, height, width, config.border_mode
                    ),
                ))
            }
        };

        let (pool_h, pool_w) = if config.pool_size == (1, 1) {
            (conv_h, conv_w)
        } else {
            config
                .pool_type
                .output_size((conv_h, conv_w), config.pool_size)
                .map_err(|e| Error::shape(id, e))?
        };

        let pre_activation = [batch, config.nkerns, pool_h, pool_w];
        let output_shape = activation_shape(id, &config.activation, &pre_activation)?;

        let w_shape = [
            config.nkerns,
            channels,
            config.filter_shape.0,
            config.filter_shape.1,
        ];
        let b_shape = [config.nkerns];

        let (w, b, batch_norm) = match &config.input_params {
            Some(supplied) => {
                let w = bind_param(id, supplied, 0, "w", &w_shape)?;
                let b = bind_param(id, supplied, 1, "b", &b_shape)?;
                let bn = if config.batch_norm {
                    Some(BatchNorm::bind(id, config.nkerns, config.norm, supplied, 2)?)
                } else {
                    None
                };
                (w, b, bn)
            }
            None => {
                let w = Param::gaussian(format!("{}.w", id), &w_shape, 0.01, rng);
                let b = Param::zeros(format!("{}.b", id), ParamRole::Trainable, &b_shape);
                let bn = config
                    .batch_norm
                    .then(|| BatchNorm::new(id, config.nkerns, config.norm))
                    .transpose()?;
                (w, b, bn)
            }
        };

        let mut params = vec![w.clone(), b.clone()];
        let mut rules = Vec::new();
        if let Some(bn) = &batch_norm {
            params.extend(bn.params());
            rules.extend_from_slice(bn.update_rules());
        }
        let regularization = Regularization::over(&params);

        debug!("... layer `{}` output shape {:?}", id, output_shape);

        Ok(Self {
            id: id.to_string(),
            input_shape: input_shape.to_vec(),
            output_shape,
            filter_shape: config.filter_shape,
            stride: config.stride,
            border_mode: config.border_mode,
            pool_size: config.pool_size,
            pool_type: config.pool_type,
            activation: config.activation,
            w,
            b,
            batch_norm,
            params,
            rules,
            regularization,
        })
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

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn filter_shape(&self) -> (usize, usize) {
        self.filter_shape
    }

    pub fn pool_size(&self) -> (usize, usize) {
        self.pool_size
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    /// Convolution, pooling and bias: the part shared by both branches.
    fn pre_normalization(&self, input: &Tensor) -> Result<ArrayD<f32>> {
        check_input_shape(&self.input_shape, input.shape())?;

        let x = input
            .data()
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| Error::Layer(format!("conv_pool input: {}", e)))?;

        let conv_out = {
            let w = self.w.read();
            let filters = w
                .view()
                .into_dimensionality::<Ix4>()
                .map_err(|e| Error::Layer(format!("conv_pool filters: {}", e)))?;
            conv::conv2d(&x, &filters, self.stride, self.border_mode)
        };

        let mut out: Array4<f32> = if self.pool_size == (1, 1) {
            conv_out
        } else {
            pool::pool2d(&conv_out.view(), self.pool_size, self.pool_type)
        };

        let b = self.b.read();
        for (k, mut map) in out.axis_iter_mut(Axis(1)).enumerate() {
            let bias = b[k];
            map.mapv_inplace(|v| v + bias);
        }

        Ok(out.into_dyn())
    }
}

impl super::Layer for ConvPool {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer_type(&self) -> LayerType {
        LayerType::ConvPool
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
        let input = single_input(&self.id, inputs)?;
        let pre = self.pre_normalization(input)?;
        let normalized = match &self.batch_norm {
            Some(bn) => bn.train(&pre, pass)?,
            None => pre,
        };
        self.activation.apply(Tensor::new(normalized))
    }

    fn inference_output(&self, inputs: &[&Tensor], _pass: &InferencePass<'_>) -> Result<Tensor> {
        let input = single_input(&self.id, inputs)?;
        let pre = self.pre_normalization(input)?;
        let normalized = match &self.batch_norm {
            Some(bn) => bn.inference(&pre)?,
            None => pre,
        };
        self.activation.apply(Tensor::new(normalized))
    }
}
