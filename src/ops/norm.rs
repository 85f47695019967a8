use crate::{Error, Result};
use ndarray::{Array1, Array3, ArrayD, ArrayView1, Axis, IxDyn};

/// Per-channel statistics of a `(batch, channels, ...)` value.
#[derive(Debug, Clone)]
pub struct Moments {
    pub mean: Array1<f32>,
    /// Biased (population) variance.
    pub variance: Array1<f32>,
    /// Number of values reduced per channel.
    pub count: usize,
}

impl Moments {
    /// Variance with Bessel's correction, used for the running estimate.
    pub fn unbiased_variance(&self) -> Array1<f32> {
        if self.count > 1 {
            let scale = self.count as f32 / (self.count - 1) as f32;
            &self.variance * scale
        } else {
            self.variance.clone()
        }
    }
}

fn as_channels(x: &ArrayD<f32>) -> Result<Array3<f32>> {
    let shape = x.shape();
    if shape.len() < 2 {
        return Err(Error::Layer(format!(
            "normalization needs a channel axis, got shape {:?}",
            shape
        )));
    }
    let rest: usize = shape[2..].iter().product();
    x.as_standard_layout()
        .into_owned()
        .into_shape_with_order((shape[0], shape[1], rest))
        .map_err(|e| Error::Layer(format!("Reshape failed: {}", e)))
}

/// Mean and variance per channel, reducing over every axis but axis 1.
pub fn channel_moments(x: &ArrayD<f32>) -> Result<Moments> {
    let grouped = as_channels(x)?;
    let (batch, channels, rest) = grouped.dim();
    let count = batch * rest;
    if count == 0 {
        return Err(Error::Layer("cannot normalize an empty batch".to_string()));
    }

    let mut mean = Array1::zeros(channels);
    let mut variance = Array1::zeros(channels);
    for (c, lane) in grouped.axis_iter(Axis(1)).enumerate() {
        let m = lane.sum() / count as f32;
        let v = lane.fold(0.0, |acc, &x| acc + (x - m) * (x - m)) / count as f32;
        mean[c] = m;
        variance[c] = v;
    }

    Ok(Moments {
        mean,
        variance,
        count,
    })
}

/// `gamma * (x - mean) / sqrt(variance + epsilon) + beta`, channel-wise.
pub fn normalize(
    x: &ArrayD<f32>,
    mean: ArrayView1<f32>,
    variance: ArrayView1<f32>,
    gamma: ArrayView1<f32>,
    beta: ArrayView1<f32>,
    epsilon: f32,
) -> Result<ArrayD<f32>> {
    let shape = x.shape().to_vec();
    let mut grouped = as_channels(x)?;
    let channels = grouped.dim().1;

    for len in [mean.len(), variance.len(), gamma.len(), beta.len()] {
        if len != channels {
            return Err(Error::ShapeMismatch {
                expected: vec![channels],
                actual: vec![len],
            });
        }
    }

    for (c, mut lane) in grouped.axis_iter_mut(Axis(1)).enumerate() {
        let std_inv = 1.0 / (variance[c] + epsilon).sqrt();
        let (m, g, b) = (mean[c], gamma[c], beta[c]);
        lane.mapv_inplace(|v| g * ((v - m) * std_inv) + b);
    }

    grouped
        .into_shape_with_order(IxDyn(&shape))
        .map_err(|e| Error::Layer(format!("Reshape failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    #[test]
    fn test_moments_per_channel() {
        // (B=2, C=2): channel 0 = [1, 3], channel 1 = [2, 6]
        let x = array![[1.0, 2.0], [3.0, 6.0]].into_dyn();
        let moments = channel_moments(&x).unwrap();

        assert_eq!(moments.count, 2);
        assert_abs_diff_eq!(moments.mean[0], 2.0);
        assert_abs_diff_eq!(moments.mean[1], 4.0);
        assert_abs_diff_eq!(moments.variance[0], 1.0);
        assert_abs_diff_eq!(moments.variance[1], 4.0);
        assert_abs_diff_eq!(moments.unbiased_variance()[1], 8.0);
    }

    #[test]
    fn test_moments_reduce_spatial_axes() {
        let x = Array::from_shape_vec((1, 2, 1, 2), vec![1.0, 3.0, 10.0, 10.0])
            .unwrap()
            .into_dyn();
        let moments = channel_moments(&x).unwrap();

        assert_eq!(moments.count, 2);
        assert_abs_diff_eq!(moments.mean[0], 2.0);
        assert_abs_diff_eq!(moments.variance[1], 0.0);
    }

    #[test]
    fn test_normalize_with_scale_and_shift() {
        let x = array![[1.0, 2.0]].into_dyn();
        let zeros = array![0.0, 0.0];
        let ones = array![1.0, 1.0];
        let gamma = array![2.0, 2.0];

        let out = normalize(&x, zeros.view(), ones.view(), gamma.view(), ones.view(), 0.0).unwrap();

        assert_abs_diff_eq!(out[[0, 0]], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[[0, 1]], 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_normalize_rejects_wrong_width() {
        let x = array![[1.0, 2.0]].into_dyn();
        let short = array![0.0];
        let ok = array![1.0, 1.0];

        let result = normalize(&x, short.view(), ok.view(), ok.view(), ok.view(), 1e-3);
        assert!(result.is_err());

        match normalize(&x, ok.view(), ok.view(), ok.view(), short.view(), 1e-3) {
            Err(Error::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![2]);
                assert_eq!(actual, vec![1]);
            }
            other => panic!("expected a shape mismatch, got {:?}", other),
        }
    }
}
