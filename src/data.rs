//! Mini-batch sources for [`CompiledNetwork::train_epoch`](crate::CompiledNetwork::train_epoch).

use crate::{network::Batch, Error, Result};

/// A dataset served one mini-batch at a time.
pub trait DataStream {
    /// Batches per epoch.
    fn size(&self) -> usize;

    fn next_batch(&mut self) -> Result<Batch>;
}

/// Cycles through batches held in memory.
#[derive(Debug, Clone)]
pub struct InMemory {
    batches: Vec<Batch>,
    cursor: usize,
}

impl InMemory {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl DataStream for InMemory {
    fn size(&self) -> usize {
        self.batches.len()
    }

    fn next_batch(&mut self) -> Result<Batch> {
        if self.batches.is_empty() {
            return Err(Error::Data("no batches to serve".to_string()));
        }
        let batch = self.batches[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.batches.len();
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tensor;

    #[test]
    fn test_wraps_around() {
        let batch = |v: f32| Batch::new(Tensor::scalar(v), Tensor::scalar(0.0));
        let mut stream = InMemory::new(vec![batch(1.0), batch(2.0)]);

        assert_eq!(stream.size(), 2);
        let seen: Vec<f32> = (0..3)
            .map(|_| stream.next_batch().unwrap().input.to_vec()[0])
            .collect();
        assert_eq!(seen, vec![1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_empty_stream() {
        let err = InMemory::new(Vec::new()).next_batch().unwrap_err();
        assert!(matches!(err, Error::Data(_)));
    }
}
