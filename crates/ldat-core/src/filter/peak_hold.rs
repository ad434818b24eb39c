//! Peak-hold envelope filter
//!
//! Flattens the dips of a PWM-driven backlight so that edge detection sees the
//! envelope instead of the carrier.

use crate::buffer::ring::FixedRing;
use crate::buffer::{BufferError, SampleBuffer};
use std::sync::{Mutex, PoisonError};

/// Ring buffer that stores, for every input sample, the maximum of the last
/// `window_size` inputs
///
/// The window starts zero-filled. Outputs are always one of the input values
/// (or the initial zero), so no rounding is involved.
///
/// # Example
/// ```
/// use ldat_core::buffer::SampleBuffer;
/// use ldat_core::filter::peak_hold::PeakHoldFilter;
///
/// let filter = PeakHoldFilter::new(5, 2);
/// filter.add_slice(&[1, 5, 2, 8, 3]).unwrap();
/// assert_eq!(filter.snapshot(), vec![1, 5, 5, 8, 8]);
/// ```
pub struct PeakHoldFilter {
    output: FixedRing,
    /// Sliding input window; its lock also serialises writers
    window: Mutex<FixedRing>,
    window_size: usize,
}

impl PeakHoldFilter {
    /// Create a filter holding `capacity` outputs with a `window_size` input window
    pub fn new(capacity: usize, window_size: usize) -> Self {
        Self {
            output: FixedRing::new(capacity),
            window: Mutex::new(FixedRing::new(window_size)),
            window_size: window_size.max(1),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Search for the smallest window that tames the noise in `samples`
    ///
    /// Tries `min, min + step, ...` up to `max` inclusive. For each candidate
    /// the whole series is filtered and the spread (max − min) of the output
    /// is measured, skipping the first `w` warm-up samples. Returns the first
    /// window whose spread is at most `noise_threshold`.
    ///
    /// # Arguments
    /// * `samples` - Noisy capture to analyse
    /// * `min` - Smallest window to try (raised to 2)
    /// * `max` - Largest window to try
    /// * `step` - Increment between candidates (raised to 1)
    /// * `noise_threshold` - Largest acceptable spread
    ///
    /// # Returns
    /// `None` when `max < min` or no candidate succeeds
    pub fn find_best_window_size(
        samples: &[u32],
        min: usize,
        max: usize,
        step: usize,
        noise_threshold: u32,
    ) -> Option<usize> {
        let min = min.max(2);
        let step = step.max(1);
        if max < min {
            return None;
        }

        (min..=max).step_by(step).find(|&w| {
            let filter = PeakHoldFilter::new(samples.len(), w);
            filter.push_slice(samples);
            let filtered = filter.output.snapshot();
            let settled = filtered.get(w..).unwrap_or(&[]);
            let spread = match (settled.iter().max(), settled.iter().min()) {
                (Some(hi), Some(lo)) => hi - lo,
                _ => 0,
            };
            spread <= noise_threshold
        })
    }

    fn push_slice(&self, values: &[u32]) {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let processed: Vec<u32> = values
            .iter()
            .map(|&v| {
                window.push(v);
                window.max()
            })
            .collect();
        self.output.push_slice(&processed);
    }
}

impl SampleBuffer for PeakHoldFilter {
    fn add(&self, value: u32) -> Result<(), BufferError> {
        self.push_slice(&[value]);
        Ok(())
    }

    fn add_slice(&self, values: &[u32]) -> Result<(), BufferError> {
        self.push_slice(values);
        Ok(())
    }

    fn snapshot(&self) -> Vec<u32> {
        self.output.snapshot()
    }

    fn is_filled(&self) -> bool {
        self.output.is_filled()
    }

    fn capacity(&self) -> usize {
        self.output.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_hold_literal_vector() {
        let filter = PeakHoldFilter::new(5, 2);
        for v in [1, 5, 2, 8, 3] {
            filter.add(v).unwrap();
        }
        assert_eq!(filter.snapshot(), vec![1, 5, 5, 8, 8]);
    }

    #[test]
    fn test_scalar_and_bulk_paths_agree() {
        let input = [3, 9, 1, 1, 1, 7, 2, 2, 2, 2];
        let a = PeakHoldFilter::new(10, 3);
        let b = PeakHoldFilter::new(10, 3);
        for v in input {
            a.add(v).unwrap();
        }
        b.add_slice(&input[..4]).unwrap();
        b.add_slice(&input[4..]).unwrap();
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot(), vec![3, 9, 9, 9, 1, 7, 7, 7, 2, 2]);
    }

    #[test]
    fn test_filled_follows_output_ring() {
        let filter = PeakHoldFilter::new(3, 10);
        filter.add_slice(&[1, 2]).unwrap();
        assert!(!filter.is_filled());
        filter.add(3).unwrap();
        assert!(filter.is_filled());
    }

    /// Square wave with period 5: four high samples then one low one
    fn pwm_like(len: usize) -> Vec<u32> {
        (0..len)
            .map(|i| if i % 5 == 4 { 100 } else { 600 })
            .collect()
    }

    #[test]
    fn test_find_best_window_size_picks_exact_window() {
        // A single dark sample is hidden by any window of two
        let samples = pwm_like(200);
        assert_eq!(
            PeakHoldFilter::find_best_window_size(&samples, 1, 20, 1, 16),
            Some(2)
        );

        // Dark runs of four need a window of five
        let samples: Vec<u32> = (0..300)
            .map(|i| if i % 5 == 0 { 600 } else { 100 })
            .collect();
        assert_eq!(
            PeakHoldFilter::find_best_window_size(&samples, 2, 20, 1, 16),
            Some(5)
        );
    }

    #[test]
    fn test_find_best_window_size_not_found() {
        let samples: Vec<u32> = (0..300)
            .map(|i| if i % 50 < 25 { 600 } else { 100 })
            .collect();
        assert_eq!(
            PeakHoldFilter::find_best_window_size(&samples, 2, 20, 2, 16),
            None
        );
    }

    #[test]
    fn test_find_best_window_size_invalid_range() {
        assert_eq!(
            PeakHoldFilter::find_best_window_size(&[1, 2, 3], 10, 5, 1, 0),
            None
        );
    }

    #[test]
    fn test_find_best_window_size_respects_step() {
        let samples: Vec<u32> = (0..300)
            .map(|i| if i % 5 == 0 { 600 } else { 100 })
            .collect();
        // 2, 5, 8...: 5 is on the grid
        assert_eq!(
            PeakHoldFilter::find_best_window_size(&samples, 2, 20, 3, 16),
            Some(5)
        );
        // 2, 6, 10...: 6 is the first on the grid at or above 5
        assert_eq!(
            PeakHoldFilter::find_best_window_size(&samples, 2, 20, 4, 16),
            Some(6)
        );
    }
}
