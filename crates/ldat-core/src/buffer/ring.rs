//! Overwrite-on-wrap ring buffer of samples
//!
//! Storage is a `ringbuf::HeapRb` behind a single mutex. The sampling worker
//! is the only writer; any number of threads may take snapshots. A snapshot
//! reflects some prefix of the writes issued before it.

use super::{BufferError, SampleBuffer};
use ringbuf::traits::{Consumer, Observer, Producer, RingBuffer};
use ringbuf::HeapRb;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct RingState {
    rb: HeapRb<u32>,
    /// Cumulative number of samples ever written
    written: u64,
}

impl RingState {
    fn push(&mut self, value: u32) {
        self.rb.push_overwrite(value);
        self.written += 1;
    }

    fn push_slice(&mut self, values: &[u32], capacity: usize) {
        if values.len() >= capacity {
            // Only the tail survives
            self.rb.clear();
            self.rb.push_slice(&values[values.len() - capacity..]);
        } else {
            let overflow = values.len().saturating_sub(self.rb.vacant_len());
            self.rb.skip(overflow);
            self.rb.push_slice(values);
        }
        self.written += values.len() as u64;
    }
}

/// Fixed-capacity ring of samples with overwrite semantics
///
/// # Example
/// ```
/// use ldat_core::buffer::ring::FixedRing;
/// use ldat_core::buffer::SampleBuffer;
///
/// let ring = FixedRing::new(3);
/// ring.add_slice(&[1, 2, 3, 4]).unwrap();
/// assert_eq!(ring.snapshot(), vec![2, 3, 4]);
/// assert!(ring.is_filled());
/// ```
pub struct FixedRing {
    capacity: usize,
    state: Mutex<RingState>,
}

impl FixedRing {
    /// Create a ring holding `capacity` samples (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(RingState {
                rb: HeapRb::new(capacity),
                written: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Infallible single-sample write
    pub fn push(&self, value: u32) {
        self.lock().push(value);
    }

    /// Infallible bulk write
    pub fn push_slice(&self, values: &[u32]) {
        self.lock().push_slice(values, self.capacity);
    }

    /// Largest value currently held, zero when empty
    pub fn max(&self) -> u32 {
        let state = self.lock();
        let (head, tail) = state.rb.as_slices();
        head.iter().chain(tail).copied().max().unwrap_or(0)
    }

    /// Total samples written since creation
    pub fn written(&self) -> u64 {
        self.lock().written
    }

    /// Samples actually written, oldest first, without the zero padding of
    /// [`SampleBuffer::snapshot`]
    pub fn recent(&self) -> Vec<u32> {
        let state = self.lock();
        let (head, tail) = state.rb.as_slices();
        let mut out = Vec::with_capacity(head.len() + tail.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }
}

impl SampleBuffer for FixedRing {
    fn add(&self, value: u32) -> Result<(), BufferError> {
        self.push(value);
        Ok(())
    }

    fn add_slice(&self, values: &[u32]) -> Result<(), BufferError> {
        self.push_slice(values);
        Ok(())
    }

    fn snapshot(&self) -> Vec<u32> {
        let state = self.lock();
        let (head, tail) = state.rb.as_slices();
        let mut out = Vec::with_capacity(self.capacity);
        out.resize(self.capacity - head.len() - tail.len(), 0);
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }

    fn is_filled(&self) -> bool {
        self.lock().written >= self.capacity as u64
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
