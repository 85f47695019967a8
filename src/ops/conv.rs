use ndarray::{Array2, Array4, ArrayView4};
use serde::Deserialize;
use std::str::FromStr;

/// How the filter is placed relative to the image border.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum BorderMode {
    /// Only positions where the filter fits entirely inside the image.
    Valid,
    /// Every position where the filter overlaps the image by one pixel or more.
    Full,
    /// Pads by half the filter size on each side.
    Half,
}

impl FromStr for BorderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "valid" => Ok(BorderMode::Valid),
            "full" => Ok(BorderMode::Full),
            "half" | "same" => Ok(BorderMode::Half),
            _ => Err(format!("unknown border mode `{}`", s)),
        }
    }
}

impl TryFrom<String> for BorderMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        s.parse()
    }
}

impl BorderMode {
    pub fn padding(&self, filter: usize) -> usize {
        match self {
            BorderMode::Valid => 0,
            BorderMode::Full => filter - 1,
            BorderMode::Half => filter / 2,
        }
    }

    /// Output extent along one spatial axis, or `None` when the filter does
    /// not fit the padded input.
    pub fn output_dim(&self, input: usize, filter: usize, stride: usize) -> Option<usize> {
        if filter == 0 || stride == 0 {
            return None;
        }
        let padded = input + 2 * self.padding(filter);
        if filter > padded {
            return None;
        }
        Some((padded - filter) / stride + 1)
    }
}

/// Rearranges every receptive field of `input` into one row.
///
/// Rows are ordered `(batch, out_row, out_col)`, columns `(channel, kh, kw)`
/// so that a `(kernels, channels, kh, kw)` filter bank reshaped to
/// `(kernels, channels * kh * kw)` lines up with them.
#[allow(clippy::too_many_arguments)]
pub fn im2col(
    input: &ArrayView4<f32>,
    kernel_h: usize,
    kernel_w: usize,
    stride_h: usize,
    stride_w: usize,
    pad_top: usize,
    pad_left: usize,
    out_h: usize,
    out_w: usize,
) -> Array2<f32> {
    let (batch, channels, height, width) = input.dim();
    let col_h = batch * out_h * out_w;
    let col_w = channels * kernel_h * kernel_w;

    let mut col_matrix = Array2::zeros((col_h, col_w));

    for b in 0..batch {
        for oh in 0..out_h {
            for ow in 0..out_w {
                let row_idx = b * (out_h * out_w) + oh * out_w + ow;

                for c in 0..channels {
                    for kh in 0..kernel_h {
                        for kw in 0..kernel_w {
                            let ih = (oh * stride_h + kh).wrapping_sub(pad_top);
                            let iw = (ow * stride_w + kw).wrapping_sub(pad_left);

                            if ih < height && iw < width {
                                let col_idx = (c * kernel_h + kh) * kernel_w + kw;
                                col_matrix[[row_idx, col_idx]] = input[[b, c, ih, iw]];
                            }
                        }
                    }
                }
            }
        }
    }

    col_matrix
}

/// 2D cross-correlation of a `(B, C, H, W)` batch with a `(K, C, kh, kw)`
/// filter bank. Shapes must already have been validated by the caller.
pub fn conv2d(
    input: &ArrayView4<f32>,
    filters: &ArrayView4<f32>,
    stride: (usize, usize),
    border_mode: BorderMode,
) -> Array4<f32> {
    let (batch, _, height, width) = input.dim();
    let (kernels, channels, kernel_h, kernel_w) = filters.dim();

    let out_h = border_mode.output_dim(height, kernel_h, stride.0).unwrap_or(0);
    let out_w = border_mode.output_dim(width, kernel_w, stride.1).unwrap_or(0);

    let cols = im2col(
        input,
        kernel_h,
        kernel_w,
        stride.0,
        stride.1,
        border_mode.padding(kernel_h),
        border_mode.padding(kernel_w),
        out_h,
        out_w,
    );

    let bank = filters
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((kernels, channels * kernel_h * kernel_w))
        .unwrap_or_else(|_| Array2::zeros((kernels, channels * kernel_h * kernel_w)));

    // (B*oh*ow, K) -> (B, oh, ow, K) -> (B, K, oh, ow)
    let product = cols.dot(&bank.t());
    let mut out = Array4::zeros((batch, kernels, out_h, out_w));
    for b in 0..batch {
        for oh in 0..out_h {
            for ow in 0..out_w {
                let row = product.row(b * (out_h * out_w) + oh * out_w + ow);
                for (k, v) in row.iter().enumerate() {
                    out[[b, k, oh, ow]] = *v;
                }
            }
        }
    }
    out
}
