//! Tensor edges of the operator graph.

use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_TENSOR_ID: AtomicU32 = AtomicU32::new(0);

fn next_tensor_id() -> u32 {
    NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// One tensor: an edge between operations, or a model input/initializer.
///
/// A tensor is a legal input to an operation only once `produced` is true;
/// model inputs and initializers start produced.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub id: u32,
    pub name: String,
    pub dims: Vec<u64>,

    /// Bytes per element.
    pub precision: u32,

    /// Whether the producing operation has finished (or the tensor is a
    /// model input/initializer).
    pub produced: bool,

    /// Operation that produces this tensor, if any.
    pub producer: Option<u32>,

    /// Synthetic DRAM base address, assigned by the model's allocator.
    pub address: u64,
}

impl Tensor {
    pub fn new(name: impl Into<String>, dims: Vec<u64>, precision: u32, produced: bool) -> Self {
        Self {
            id: next_tensor_id(),
            name: name.into(),
            dims,
            precision,
            produced,
            producer: None,
            address: 0,
        }
    }

    pub fn num_elems(&self) -> u64 {
        self.dims.iter().product::<u64>().max(1)
    }

    pub fn size_bytes(&self) -> u64 {
        self.num_elems() * self.precision as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_accounts_for_precision() {
        let tensor = Tensor::new("x", vec![2, 3, 4], 2, true);
        assert_eq!(tensor.num_elems(), 24);
        assert_eq!(tensor.size_bytes(), 48);
    }

    #[test]
    fn test_scalar_tensor_occupies_one_element() {
        let tensor = Tensor::new("s", vec![], 4, true);
        assert_eq!(tensor.num_elems(), 1);
        assert_eq!(tensor.size_bytes(), 4);
    }

    #[test]
    fn test_tensor_ids_unique() {
        let a = Tensor::new("a", vec![1], 1, false);
        let b = Tensor::new("b", vec![1], 1, false);
        assert_ne!(a.id, b.id);
    }
}
