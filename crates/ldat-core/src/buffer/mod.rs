//! Fixed-capacity sample containers
//!
//! Every capture in a measurement lands in a [`SampleBuffer`]. The sampling
//! worker writes into it from its own thread while the measurement thread
//! polls [`SampleBuffer::is_filled`] and finally takes a snapshot, so all
//! implementations use interior locking and take `&self`.
//!
//! - [`ring::FixedRing`]: overwrite-on-wrap ring, the base of every filter
//! - [`constant::ConstantBuffer`]: read-only wrap of an existing array

pub mod constant;
pub mod ring;

use thiserror::Error;

/// Errors raised by buffer writes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Constant buffers cannot be altered")]
    Immutable,
}

/// A fixed-capacity sequence of samples
///
/// `snapshot()` always returns `capacity()` values, oldest first. Slots that
/// have never been written read as zero and come before the written samples.
pub trait SampleBuffer: Send + Sync {
    /// Append one sample, overwriting the oldest when full
    fn add(&self, value: u32) -> Result<(), BufferError>;

    /// Append a run of samples in order
    fn add_slice(&self, values: &[u32]) -> Result<(), BufferError>;

    /// Ordered copy of the buffer contents
    fn snapshot(&self) -> Vec<u32>;

    /// True once at least `capacity()` samples have been written; never reverts
    fn is_filled(&self) -> bool;

    /// Number of samples the buffer holds
    fn capacity(&self) -> usize;
}
