use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Layer `{layer}`: invalid configuration: {reason}")]
    Config { layer: String, reason: String },

    #[error("Layer `{layer}`: incompatible shapes: {reason}")]
    Shape { layer: String, reason: String },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Layer error: {0}")]
    Layer(String),

    #[error("Layer id `{0}` is already present in the graph")]
    DuplicateId(String),

    #[error("Layer `{layer}`: origin `{origin}` is not present in the graph")]
    UnknownOrigin { layer: String, origin: String },

    #[error("Incomplete graph: {0}")]
    IncompleteGraph(String),

    #[error("Cycle detected at layer `{0}`")]
    Cycle(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Non-finite value proposed for `{0}`")]
    NonFinite(String),

    #[error("Data stream: {0}")]
    Data(String),

    #[error("Parameter snapshot: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(layer: &str, reason: impl Into<String>) -> Self {
        Error::Config {
            layer: layer.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(layer: &str, reason: impl Into<String>) -> Self {
        Error::Shape {
            layer: layer.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
