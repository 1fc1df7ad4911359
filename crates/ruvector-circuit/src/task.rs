//! Task/dataset provider contract.

use ndarray::Array2;

use crate::error::{CircuitError, Result};
use crate::modal::ModalStore;

/// One batch of prompts.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Token ids, `[batch, seq]`.
    pub tokens: Array2<usize>,
    /// Position of the token whose prediction is scored, per example.
    pub last_token_positions: Vec<usize>,
}

impl Batch {
    /// Build a batch, checking that every example has a last-token position.
    pub fn new(tokens: Array2<usize>, last_token_positions: Vec<usize>) -> Result<Self> {
        if tokens.nrows() != last_token_positions.len() {
            return Err(CircuitError::shape_mismatch(
                "last token positions",
                &[tokens.nrows()],
                &[last_token_positions.len()],
            ));
        }
        Ok(Self {
            tokens,
            last_token_positions,
        })
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.tokens.nrows()
    }

    /// Whether the batch holds no examples.
    pub fn is_empty(&self) -> bool {
        self.tokens.nrows() == 0
    }
}

/// Source of training batches.
pub trait TaskDataset {
    /// Next batch of prompts.
    fn next_batch(&mut self) -> Result<Batch>;

    /// Task-specific baselines, if the task defines them.
    fn initial_modal_values(&self) -> Option<ModalStore> {
        None
    }
}

/// Cycles through a fixed list of batches.
#[derive(Debug, Clone)]
pub struct StaticDataset {
    batches: Vec<Batch>,
    cursor: usize,
    modal: Option<ModalStore>,
}

impl StaticDataset {
    /// Dataset over `batches`; at least one batch is required.
    pub fn new(batches: Vec<Batch>) -> Result<Self> {
        if batches.is_empty() {
            return Err(CircuitError::config("static dataset needs at least one batch"));
        }
        Ok(Self {
            batches,
            cursor: 0,
            modal: None,
        })
    }

    /// Attach baselines returned by [`TaskDataset::initial_modal_values`].
    pub fn with_modal_values(mut self, modal: ModalStore) -> Self {
        self.modal = Some(modal);
        self
    }
}

impl TaskDataset for StaticDataset {
    fn next_batch(&mut self) -> Result<Batch> {
        let batch = self.batches[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.batches.len();
        Ok(batch)
    }

    fn initial_modal_values(&self) -> Option<ModalStore> {
        self.modal.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_batch_rejects_missing_positions() {
        assert!(Batch::new(array![[1usize, 2], [3, 4]], vec![1]).is_err());
    }

    #[test]
    fn test_static_dataset_cycles() {
        let a = Batch::new(array![[1usize, 2]], vec![1]).unwrap();
        let b = Batch::new(array![[3usize, 4]], vec![0]).unwrap();
        let mut ds = StaticDataset::new(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(ds.next_batch().unwrap(), a);
        assert_eq!(ds.next_batch().unwrap(), b);
        assert_eq!(ds.next_batch().unwrap(), a);
        assert!(ds.initial_modal_values().is_none());
    }
}
