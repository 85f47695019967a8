use super::{check_input_shape, single_input, InferencePass, TrainPass};
use crate::{
    config::{LayerType, ObjectiveConfig, ObjectiveKind},
    Error, Result, Tensor,
};
use log::debug;
use ndarray::{ArrayView2, Ix2};

/// Probabilities are clamped away from zero before taking logs.
const LOG_FLOOR: f32 = 1e-7;

/// Scalar loss over the classifier output and the batch labels.
#[derive(Debug, Clone)]
pub struct Objective {
    id: String,
    kind: ObjectiveKind,
    regularization: Option<(f32, f32)>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Objective {
    pub fn new(id: &str, input_shape: &[usize], config: ObjectiveConfig) -> Result<Self> {
        debug!("... creating objective `{}` ({:?})", id, config.objective);

        if input_shape.len() != 2 {
            return Err(Error::shape(
                id,
                format!(
                    "objective expects (batch, classes) scores, got {:?}",
                    input_shape
                ),
            ));
        }
        if let Some((l1, l2)) = config.regularization {
            if !(l1 >= 0.0 && l2 >= 0.0) {
                return Err(Error::config(
                    id,
                    format!(
                        "regularization coefficients must be non-negative, got ({}, {})",
                        l1, l2
                    ),
                ));
            }
        }

        Ok(Self {
            id: id.to_string(),
            kind: config.objective,
            regularization: config.regularization,
            input_shape: input_shape.to_vec(),
            output_shape: vec![1],
        })
    }

    pub fn kind(&self) -> ObjectiveKind {
        self.kind
    }

    /// `(l1, l2)`; zero when no regularization was configured.
    pub fn regularization_coefficients(&self) -> (f32, f32) {
        self.regularization.unwrap_or((0.0, 0.0))
    }

    /// Loss of `scores` against class-index `labels`, averaged over the batch.
    pub fn loss(&self, scores: &Tensor, labels: &Tensor) -> Result<f32> {
        let (p, y) = self.prepare(scores, labels)?;
        let batch = y.len() as f32;

        let total: f32 = match self.kind {
            ObjectiveKind::Nll | ObjectiveKind::Cce => y
                .iter()
                .enumerate()
                .map(|(i, &c)| -p[[i, c]].max(LOG_FLOOR).ln())
                .sum(),
            ObjectiveKind::Bce => {
                let mut sum = 0.0;
                for (i, row) in p.rows().into_iter().enumerate() {
                    for (k, &v) in row.iter().enumerate() {
                        let v = v.clamp(LOG_FLOOR, 1.0 - LOG_FLOOR);
                        sum -= if k == y[i] { v.ln() } else { (1.0 - v).ln() };
                    }
                }
                sum / p.ncols() as f32
            }
            ObjectiveKind::Hinge => {
                let mut sum = 0.0;
                for (i, row) in p.rows().into_iter().enumerate() {
                    for (k, &v) in row.iter().enumerate() {
                        let target = if k == y[i] { 1.0 } else { -1.0 };
                        sum += (1.0 - target * v).max(0.0);
                    }
                }
                sum
            }
        };

        Ok(total / batch)
    }

    /// Fraction of samples whose argmax differs from the label.
    pub fn error_rate(&self, scores: &Tensor, labels: &Tensor) -> Result<f32> {
        let (_, y) = self.prepare(scores, labels)?;
        let predicted = scores.argmax_rows()?;
        let wrong = predicted.iter().zip(&y).filter(|(p, t)| p != t).count();
        Ok(wrong as f32 / y.len() as f32)
    }

    fn prepare<'s>(
        &self,
        scores: &'s Tensor,
        labels: &Tensor,
    ) -> Result<(ArrayView2<'s, f32>, Vec<usize>)> {
        check_input_shape(&self.input_shape, scores.shape())?;
        let p = scores
            .data()
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| Error::Layer(format!("objective `{}`: {}", self.id, e)))?;
        let (batch, classes) = p.dim();

        if labels.shape() != [batch] {
            return Err(Error::ShapeMismatch {
                expected: vec![batch],
                actual: labels.shape().to_vec(),
            });
        }
        if batch == 0 {
            return Err(Error::Layer(format!("objective `{}`: empty batch", self.id)));
        }

        let y = labels
            .data()
            .iter()
            .map(|&l| {
                if l >= 0.0 && l.fract() == 0.0 && (l as usize) < classes {
                    Ok(l as usize)
                } else {
                    Err(Error::Layer(format!(
                        "objective `{}`: label {} is not a class index below {}",
                        self.id, l, classes
                    )))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((p, y))
    }

    fn labelled(&self, labels: Option<&Tensor>, inputs: &[&Tensor]) -> Result<Tensor> {
        let scores = single_input(&self.id, inputs)?;
        let labels = labels.ok_or_else(|| {
            Error::Layer(format!("objective `{}` needs labels", self.id))
        })?;
        Ok(Tensor::scalar(self.loss(scores, labels)?))
    }
}

impl super::Layer for Objective {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Objective
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn train_output(&self, inputs: &[&Tensor], pass: &mut TrainPass<'_>) -> Result<Tensor> {
        self.labelled(pass.labels(), inputs)
    }

    fn inference_output(&self, inputs: &[&Tensor], pass: &InferencePass<'_>) -> Result<Tensor> {
        self.labelled(pass.labels(), inputs)
    }

    fn as_objective(&self) -> Option<&Objective> {
        Some(self)
    }
}
