//! Stateless numeric kernels over `ndarray` values.

pub mod conv;
pub mod norm;
pub mod pool;

pub use conv::BorderMode;
pub use pool::PoolType;
