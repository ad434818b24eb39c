//! Read-only buffer over an existing sample array

use super::{BufferError, SampleBuffer};

/// Wraps a fixed array so it can be handed to code expecting a [`SampleBuffer`]
///
/// Writes fail with [`BufferError::Immutable`]; the buffer is always filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantBuffer {
    data: Vec<u32>,
}

impl ConstantBuffer {
    pub fn new(data: Vec<u32>) -> Self {
        Self { data }
    }
}

impl From<Vec<u32>> for ConstantBuffer {
    fn from(data: Vec<u32>) -> Self {
        Self::new(data)
    }
}

impl SampleBuffer for ConstantBuffer {
    fn add(&self, _value: u32) -> Result<(), BufferError> {
        Err(BufferError::Immutable)
    }

    fn add_slice(&self, _values: &[u32]) -> Result<(), BufferError> {
        Err(BufferError::Immutable)
    }

    fn snapshot(&self) -> Vec<u32> {
        self.data.clone()
    }

    fn is_filled(&self) -> bool {
        true
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}
