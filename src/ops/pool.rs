use ndarray::{Array4, ArrayView4};
use serde::Deserialize;
use std::str::FromStr;

/// Reduction applied over each non-overlapping pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum PoolType {
    Max,
    Sum,
    Mean,
    /// Keeps the window maximum in place and zeroes the rest; spatial size is preserved.
    MaxSameSize,
}

impl FromStr for PoolType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "max" => Ok(PoolType::Max),
            "sum" => Ok(PoolType::Sum),
            "mean" => Ok(PoolType::Mean),
            "max_same_size" => Ok(PoolType::MaxSameSize),
            _ => Err(format!(
                "unknown pooling mode `{}` (expected one of max, sum, mean, max_same_size)",
                s
            )),
        }
    }
}

impl TryFrom<String> for PoolType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        s.parse()
    }
}

impl PoolType {
    /// Spatial output size for a `(height, width)` map pooled by `window`.
    /// Borders that do not fill a whole window are dropped.
    pub fn output_size(
        &self,
        (height, width): (usize, usize),
        window: (usize, usize),
    ) -> Result<(usize, usize), String> {
        if window.0 == 0 || window.1 == 0 {
            return Err(format!("pool size {:?} must be non-zero", window));
        }
        if window.0 > height || window.1 > width {
            return Err(format!(
                "pool size {:?} is larger than the {}x{} feature map",
                window, height, width
            ));
        }

        match self {
            PoolType::MaxSameSize => {
                if height % window.0 != 0 || width % window.1 != 0 {
                    return Err(format!(
                        "pool size {:?} must divide the {}x{} feature map in max_same_size mode",
                        window, height, width
                    ));
                }
                Ok((height, width))
            }
            _ => Ok((height / window.0, width / window.1)),
        }
    }
}

pub fn pool2d(input: &ArrayView4<f32>, window: (usize, usize), mode: PoolType) -> Array4<f32> {
    let (batch, channels, height, width) = input.dim();
    let out_h = height / window.0;
    let out_w = width / window.1;

    let mut output = match mode {
        PoolType::MaxSameSize => Array4::zeros((batch, channels, height, width)),
        _ => Array4::zeros((batch, channels, out_h, out_w)),
    };

    for b in 0..batch {
        for c in 0..channels {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let h_start = oh * window.0;
                    let w_start = ow * window.1;

                    let mut max_val = f32::NEG_INFINITY;
                    let mut max_at = (h_start, w_start);
                    let mut sum = 0.0;
                    for h in h_start..h_start + window.0 {
                        for w in w_start..w_start + window.1 {
                            let val = input[[b, c, h, w]];
                            sum += val;
                            if val > max_val {
                                max_val = val;
                                max_at = (h, w);
                            }
                        }
                    }

                    match mode {
                        PoolType::Max => output[[b, c, oh, ow]] = max_val,
                        PoolType::Sum => output[[b, c, oh, ow]] = sum,
                        PoolType::Mean => {
                            output[[b, c, oh, ow]] = sum / (window.0 * window.1) as f32
                        }
                        PoolType::MaxSameSize => output[[b, c, max_at.0, max_at.1]] = max_val,
                    }
                }
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Array4<f32> {
        Array4::from_shape_vec((1, 1, 4, 4), (1..=16).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn test_max_pool() {
        let out = pool2d(&grid().view(), (2, 2), PoolType::Max);
        assert_eq!(out.dim(), (1, 1, 2, 2));
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![6.0, 8.0, 14.0, 16.0]);
    }

    #[test]
    fn test_mean_and_sum_pool() {
        let mean = pool2d(&grid().view(), (2, 2), PoolType::Mean);
        assert_eq!(mean.iter().copied().collect::<Vec<_>>(), vec![3.5, 5.5, 11.5, 13.5]);

        let sum = pool2d(&grid().view(), (2, 2), PoolType::Sum);
        assert_eq!(sum[[0, 0, 0, 0]], 14.0);
    }

    #[test]
    fn test_max_same_size_keeps_positions() {
        let out = pool2d(&grid().view(), (2, 2), PoolType::MaxSameSize);
        assert_eq!(out.dim(), (1, 1, 4, 4));
        assert_eq!(out[[0, 0, 1, 1]], 6.0);
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
        assert_eq!(out.iter().filter(|v| **v != 0.0).count(), 4);
    }

    #[test]
    fn test_output_size_drops_border() {
        assert_eq!(PoolType::Max.output_size((26, 26), (2, 2)), Ok((13, 13)));
        assert_eq!(PoolType::Max.output_size((5, 5), (2, 2)), Ok((2, 2)));
        assert!(PoolType::MaxSameSize.output_size((5, 5), (2, 2)).is_err());
        assert!(PoolType::Mean.output_size((1, 4), (2, 2)).is_err());
    }

    #[test]
    fn test_unknown_mode() {
        let err = "bogus".parse::<PoolType>().unwrap_err();
        assert!(err.contains("bogus"));
    }
}
