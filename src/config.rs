//! Per-kind layer configuration records.
//!
//! Every record has explicit defaults and rejects unknown keys, so a typo in a
//! JSON description fails at construction instead of being silently ignored.

use crate::{
    activations::Activation,
    ops::{BorderMode, PoolType},
    param::Param,
    Error, Result,
};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    Input,
    ConvPool,
    DotProduct,
    Flatten,
    Merge,
    Classifier,
    Objective,
}

impl FromStr for LayerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_lowercase().as_str() {
            "input" => Ok(LayerType::Input),
            "conv_pool" => Ok(LayerType::ConvPool),
            "dot_product" => Ok(LayerType::DotProduct),
            "flatten" => Ok(LayerType::Flatten),
            "merge" => Ok(LayerType::Merge),
            "classifier" => Ok(LayerType::Classifier),
            "objective" => Ok(LayerType::Objective),
            _ => Err(format!("unknown layer type `{}`", s)),
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerType::Input => "input",
            LayerType::ConvPool => "conv_pool",
            LayerType::DotProduct => "dot_product",
            LayerType::Flatten => "flatten",
            LayerType::Merge => "merge",
            LayerType::Classifier => "classifier",
            LayerType::Objective => "objective",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ObjectiveKind {
    /// Negative log-likelihood of the labelled class.
    Nll,
    /// Categorical cross-entropy against one-hot labels.
    Cce,
    /// Binary cross-entropy against one-hot labels.
    Bce,
    /// Hinge loss against `{-1, +1}` one-hot labels.
    Hinge,
}

impl FromStr for ObjectiveKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_lowercase().as_str() {
            "nll" => Ok(ObjectiveKind::Nll),
            "cce" => Ok(ObjectiveKind::Cce),
            "bce" => Ok(ObjectiveKind::Bce),
            "hinge" => Ok(ObjectiveKind::Hinge),
            _ => Err(format!("unknown objective `{}`", s)),
        }
    }
}

impl TryFrom<String> for ObjectiveKind {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, String> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum MergeMode {
    Sum,
    Concatenate,
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_lowercase().as_str() {
            "sum" | "add" => Ok(MergeMode::Sum),
            "concatenate" | "concat" => Ok(MergeMode::Concatenate),
            _ => Err(format!("unknown merge mode `{}`", s)),
        }
    }
}

impl TryFrom<String> for MergeMode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, String> {
        s.parse()
    }
}

fn default_filter_shape() -> (usize, usize) {
    (3, 3)
}

fn default_pool_size() -> (usize, usize) {
    (2, 2)
}

fn default_pool_type() -> PoolType {
    PoolType::Max
}

fn default_border_mode() -> BorderMode {
    BorderMode::Valid
}

fn default_stride() -> (usize, usize) {
    (1, 1)
}

fn default_relu() -> Activation {
    Activation::ReLU
}

fn default_softmax() -> Activation {
    Activation::Softmax { temperature: 1.0 }
}

fn default_merge_mode() -> MergeMode {
    MergeMode::Concatenate
}

fn default_objective() -> ObjectiveKind {
    ObjectiveKind::Nll
}

/// Batch-normalisation settings.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NormSettings {
    /// Weight of the batch statistic when blending into the running estimate.
    pub running_average_factor: f32,
    /// Added to the running variance on every update.
    pub variance_epsilon: f32,
    /// Added to the variance before taking the square root.
    pub epsilon: f32,
}

impl NormSettings {
    pub fn validate(&self, layer: &str) -> Result<()> {
        if !(self.epsilon > 0.0) || !self.epsilon.is_finite() {
            return Err(Error::config(
                layer,
                format!("norm epsilon must be positive, got {}", self.epsilon),
            ));
        }
        if !(self.variance_epsilon >= 0.0) || !self.variance_epsilon.is_finite() {
            return Err(Error::config(
                layer,
                format!(
                    "variance_epsilon must be finite and non-negative, got {}",
                    self.variance_epsilon
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.running_average_factor) {
            return Err(Error::config(
                layer,
                format!(
                    "running_average_factor must be in [0, 1], got {}",
                    self.running_average_factor
                ),
            ));
        }
        Ok(())
    }
}

impl Default for NormSettings {
    fn default() -> Self {
        Self {
            running_average_factor: 0.1,
            variance_epsilon: 0.001,
            epsilon: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    /// Full shape including the mini-batch size, e.g. `(B, C, H, W)`.
    pub shape: Vec<usize>,
    #[serde(default)]
    pub mean_subtract: bool,
}

impl InputConfig {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            mean_subtract: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvPoolConfig {
    pub nkerns: usize,
    #[serde(default = "default_filter_shape")]
    pub filter_shape: (usize, usize),
    #[serde(default = "default_pool_size")]
    pub pool_size: (usize, usize),
    #[serde(default = "default_pool_type")]
    pub pool_type: PoolType,
    #[serde(default)]
    pub batch_norm: bool,
    #[serde(default)]
    pub norm: NormSettings,
    #[serde(default = "default_border_mode")]
    pub border_mode: BorderMode,
    #[serde(default = "default_stride")]
    pub stride: (usize, usize),
    #[serde(default = "default_relu")]
    pub activation: Activation,
    /// Parameter handles to bind instead of initialising:
    /// `[w, b]`, followed by `[gamma, beta, running_mean, running_var]` with batch norm.
    #[serde(skip)]
    pub input_params: Option<Vec<Param>>,
}

impl ConvPoolConfig {
    pub fn new(nkerns: usize) -> Self {
        Self {
            nkerns,
            filter_shape: default_filter_shape(),
            pool_size: default_pool_size(),
            pool_type: default_pool_type(),
            batch_norm: false,
            norm: NormSettings::default(),
            border_mode: default_border_mode(),
            stride: default_stride(),
            activation: default_relu(),
            input_params: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DotProductConfig {
    pub num_neurons: usize,
    #[serde(default = "default_relu")]
    pub activation: Activation,
    #[serde(default)]
    pub batch_norm: bool,
    #[serde(default)]
    pub norm: NormSettings,
    /// `[w, b]`, followed by `[gamma, beta, running_mean, running_var]` with batch norm.
    #[serde(skip)]
    pub input_params: Option<Vec<Param>>,
}

impl DotProductConfig {
    pub fn new(num_neurons: usize) -> Self {
        Self {
            num_neurons,
            activation: default_relu(),
            batch_norm: false,
            norm: NormSettings::default(),
            input_params: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlattenConfig {}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    #[serde(default = "default_merge_mode")]
    pub mode: MergeMode,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            mode: default_merge_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    pub num_classes: usize,
    #[serde(default = "default_softmax")]
    pub activation: Activation,
    /// `[w, b]`
    #[serde(skip)]
    pub input_params: Option<Vec<Param>>,
}

impl ClassifierConfig {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            activation: default_softmax(),
            input_params: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectiveConfig {
    #[serde(default = "default_objective")]
    pub objective: ObjectiveKind,
    /// `(l1_coefficient, l2_coefficient)` applied to the graph's trainable parameters.
    #[serde(default)]
    pub regularization: Option<(f32, f32)>,
}

impl ObjectiveConfig {
    pub fn new(objective: ObjectiveKind) -> Self {
        Self {
            objective,
            regularization: None,
        }
    }
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self::new(default_objective())
    }
}

#[derive(Debug, Clone)]
pub enum LayerConfig {
    Input(InputConfig),
    ConvPool(ConvPoolConfig),
    DotProduct(DotProductConfig),
    Flatten(FlattenConfig),
    Merge(MergeConfig),
    Classifier(ClassifierConfig),
    Objective(ObjectiveConfig),
}

impl LayerConfig {
    pub fn layer_type(&self) -> LayerType {
        match self {
            LayerConfig::Input(_) => LayerType::Input,
            LayerConfig::ConvPool(_) => LayerType::ConvPool,
            LayerConfig::DotProduct(_) => LayerType::DotProduct,
            LayerConfig::Flatten(_) => LayerType::Flatten,
            LayerConfig::Merge(_) => LayerType::Merge,
            LayerConfig::Classifier(_) => LayerType::Classifier,
            LayerConfig::Objective(_) => LayerType::Objective,
        }
    }

    fn from_value(layer: &str, kind: LayerType, config: Value) -> Result<Self> {
        let wrap = |e: serde_json::Error| Error::config(layer, e.to_string());
        Ok(match kind {
            LayerType::Input => LayerConfig::Input(serde_json::from_value(config).map_err(wrap)?),
            LayerType::ConvPool => {
                LayerConfig::ConvPool(serde_json::from_value(config).map_err(wrap)?)
            }
            LayerType::DotProduct => {
                LayerConfig::DotProduct(serde_json::from_value(config).map_err(wrap)?)
            }
            LayerType::Flatten => {
                LayerConfig::Flatten(serde_json::from_value(config).map_err(wrap)?)
            }
            LayerType::Merge => LayerConfig::Merge(serde_json::from_value(config).map_err(wrap)?),
            LayerType::Classifier => {
                LayerConfig::Classifier(serde_json::from_value(config).map_err(wrap)?)
            }
            LayerType::Objective => {
                LayerConfig::Objective(serde_json::from_value(config).map_err(wrap)?)
            }
        })
    }
}

macro_rules! impl_from_config {
    ($($config:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$config> for LayerConfig {
                fn from(config: $config) -> Self {
                    LayerConfig::$variant(config)
                }
            }
        )*
    };
}

impl_from_config! {
    InputConfig => Input,
    ConvPoolConfig => ConvPool,
    DotProductConfig => DotProduct,
    FlattenConfig => Flatten,
    MergeConfig => Merge,
    ClassifierConfig => Classifier,
    ObjectiveConfig => Objective,
}

/// Everything needed to add one layer to a graph.
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub id: String,
    /// Ids of the layers feeding this one; empty for an input layer.
    pub origins: Vec<String>,
    /// Train-branch dropout applied to this layer's output; `0.0` disables it.
    pub dropout_rate: f32,
    pub config: LayerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Origins {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLayerSpec {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    origin: Option<Origins>,
    #[serde(default)]
    dropout_rate: f32,
    #[serde(default)]
    config: Option<Value>,
}

/// `"none"` stands for "no origin" in layer descriptions.
pub(crate) fn is_no_origin(id: &str) -> bool {
    id.eq_ignore_ascii_case("none")
}

impl LayerSpec {
    pub fn new(id: impl Into<String>, config: impl Into<LayerConfig>) -> Self {
        Self {
            id: id.into(),
            origins: Vec::new(),
            dropout_rate: 0.0,
            config: config.into(),
        }
    }

    pub fn origin(mut self, id: impl Into<String>) -> Self {
        self.origins.push(id.into());
        self
    }

    pub fn dropout(mut self, rate: f32) -> Self {
        self.dropout_rate = rate;
        self
    }

    pub fn layer_type(&self) -> LayerType {
        self.config.layer_type()
    }

    /// Parses `{"type": ..., "id": ..., "origin": ..., "dropout_rate": ..., "config": {...}}`.
    ///
    /// `origin` is a single id or a list; `"none"` or an absent origin marks
    /// an input layer.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let layer = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_string();

        let raw: RawLayerSpec =
            serde_json::from_value(value).map_err(|e| Error::config(&layer, e.to_string()))?;
        let kind: LayerType = raw
            .kind
            .parse()
            .map_err(|e: String| Error::config(&raw.id, e))?;

        let origins = match raw.origin {
            None => Vec::new(),
            Some(Origins::One(o)) => vec![o],
            Some(Origins::Many(list)) => list,
        }
        .into_iter()
        .filter(|o| !is_no_origin(o))
        .collect();

        let config = raw
            .config
            .unwrap_or_else(|| Value::Object(Default::default()));
        let config = LayerConfig::from_value(&raw.id, kind, config)?;

        Ok(Self {
            id: raw.id,
            origins,
            dropout_rate: raw.dropout_rate,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_pool_defaults() {
        let spec = LayerSpec::from_json(
            r#"{"type": "conv_pool", "id": "conv1", "origin": "input", "config": {"nkerns": 8}}"#,
        )
        .unwrap();

        assert_eq!(spec.origins, vec!["input".to_string()]);
        match spec.config {
            LayerConfig::ConvPool(c) => {
                assert_eq!(c.nkerns, 8);
                assert_eq!(c.filter_shape, (3, 3));
                assert_eq!(c.pool_size, (2, 2));
                assert_eq!(c.pool_type, PoolType::Max);
                assert_eq!(c.border_mode, BorderMode::Valid);
                assert_eq!(c.stride, (1, 1));
                assert_eq!(c.activation, Activation::ReLU);
                assert!(!c.batch_norm);
                assert_eq!(c.norm, NormSettings::default());
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = LayerSpec::from_json(
            r#"{"type": "conv_pool", "id": "conv1", "origin": "input",
                "config": {"nkerns": 8, "kernel": 3}}"#,
        )
        .unwrap_err();

        match err {
            Error::Config { layer, reason } => {
                assert_eq!(layer, "conv1");
                assert!(reason.contains("kernel"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_bogus_pool_type_names_layer_and_value() {
        let err = LayerSpec::from_json(
            r#"{"type": "conv_pool", "id": "conv1", "origin": "input",
                "config": {"nkerns": 8, "pool_type": "bogus"}}"#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config { .. }));
        let message = err.to_string();
        assert!(message.contains("conv1"));
        assert!(message.contains("bogus"));
    }

    #[test]
    fn test_input_origin_none() {
        let spec = LayerSpec::from_json(
            r#"{"type": "input", "id": "input", "origin": "none", "config": {"shape": [4, 1, 28, 28]}}"#,
        )
        .unwrap();
        assert!(spec.origins.is_empty());
        assert_eq!(spec.layer_type(), LayerType::Input);
    }

    #[test]
    fn test_unknown_layer_type() {
        let err = LayerSpec::from_json(r#"{"type": "lstm", "id": "rnn"}"#).unwrap_err();
        assert!(err.to_string().contains("rnn"));
    }

    #[test]
    fn test_flatten_without_config() {
        let spec =
            LayerSpec::from_json(r#"{"type": "flatten", "id": "flat", "origin": ["conv1"]}"#)
                .unwrap();
        assert_eq!(spec.layer_type(), LayerType::Flatten);
    }

    #[test]
    fn test_objective_and_merge_parse() {
        let spec = LayerSpec::from_json(
            r#"{"type": "objective", "id": "nll", "origin": "softmax",
                "config": {"objective": "hinge", "regularization": [0.001, 0.0001]}}"#,
        )
        .unwrap();
        match spec.config {
            LayerConfig::Objective(c) => {
                assert_eq!(c.objective, ObjectiveKind::Hinge);
                assert_eq!(c.regularization, Some((0.001, 0.0001)));
            }
            other => panic!("unexpected config {:?}", other),
        }

        let err = LayerSpec::from_json(
            r#"{"type": "merge", "id": "m", "origin": ["a", "b"], "config": {"mode": "multiply"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("multiply"));
    }
}
