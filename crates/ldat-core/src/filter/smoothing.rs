//! Exponential running-average filter

use crate::buffer::ring::FixedRing;
use crate::buffer::{BufferError, SampleBuffer};
use std::sync::{Mutex, PoisonError};

/// Ring buffer storing `y[i] = x[i]·(1−f) + y[i−1]·f`
///
/// The running value is kept in `f64` and seeded with the first sample, so
/// there is no ramp up from zero. Stored outputs truncate toward zero.
pub struct RunningAverageSmoothingFilter {
    output: FixedRing,
    factor: f64,
    /// Running value; `None` until the first write
    current: Mutex<Option<f64>>,
}

impl RunningAverageSmoothingFilter {
    /// # Arguments
    /// * `capacity` - Number of smoothed samples to keep
    /// * `factor` - Weight of the previous output, in `[0, 1)`
    pub fn new(capacity: usize, factor: f64) -> Self {
        Self {
            output: FixedRing::new(capacity),
            factor: factor.clamp(0.0, 1.0),
            current: Mutex::new(None),
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    fn push_slice(&self, values: &[u32]) {
        let Some(&first) = values.first() else {
            return;
        };
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let mut y = current.unwrap_or(f64::from(first));
        let processed: Vec<u32> = values
            .iter()
            .map(|&x| {
                y = f64::from(x) * (1.0 - self.factor) + y * self.factor;
                y as u32
            })
            .collect();
        *current = Some(y);
        self.output.push_slice(&processed);
    }
}

impl SampleBuffer for RunningAverageSmoothingFilter {
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
    fn test_half_factor_truncates() {
        let filter = RunningAverageSmoothingFilter::new(3, 0.5);
        filter.add_slice(&[10, 0, 0]).unwrap();
        assert_eq!(filter.snapshot(), vec![10, 5, 2]);
    }

    #[test]
    fn test_scalar_path_seeds_with_first_sample() {
        let filter = RunningAverageSmoothingFilter::new(3, 0.5);
        for v in [10, 0, 0] {
            filter.add(v).unwrap();
        }
        assert_eq!(filter.snapshot(), vec![10, 5, 2]);
    }

    #[test]
    fn test_running_value_is_not_truncated_between_writes() {
        // 2 -> 1.5 -> 1.125; an integer state would give 2 -> 1 -> 0
        let filter = RunningAverageSmoothingFilter::new(3, 0.75);
        filter.add(2).unwrap();
        filter.add(0).unwrap();
        filter.add_slice(&[0]).unwrap();
        assert_eq!(filter.snapshot(), vec![2, 1, 1]);
    }

    #[test]
    fn test_zero_factor_is_passthrough() {
        let filter = RunningAverageSmoothingFilter::new(4, 0.0);
        filter.add_slice(&[4, 8, 15, 16]).unwrap();
        assert_eq!(filter.snapshot(), vec![4, 8, 15, 16]);
    }

    #[test]
    fn test_heavy_smoothing_suppresses_square_wave() {
        let filter = RunningAverageSmoothingFilter::new(1000, 0.99);
        let input: Vec<u32> = (0..2000).map(|i| if i % 4 < 2 { 800 } else { 200 }).collect();
        filter.add_slice(&input).unwrap();
        let out = filter.snapshot();
        let hi = *out.iter().max().unwrap();
        let lo = *out.iter().min().unwrap();
        assert!(hi - lo < 20, "ripple {}", hi - lo);
        assert!((480..=520).contains(&lo));
    }

    #[test]
    fn test_empty_slice_does_not_seed() {
        let filter = RunningAverageSmoothingFilter::new(2, 0.5);
        filter.add_slice(&[]).unwrap();
        filter.add_slice(&[8, 0]).unwrap();
        assert_eq!(filter.snapshot(), vec![8, 4]);
    }
}
