//! Windowed FFT magnitude filter
//!
//! Writes land in a plain ring; every snapshot windows the current contents
//! with a Blackman-Harris window and returns the absolute values of the
//! forward transform, packed the way a real-input FFT packs its output:
//!
//! ```text
//! [Re(0), Re(n/2), Re(1), Im(1), Re(2), Im(2), ..., Re(n/2-1), Im(n/2-1)]
//! ```
//!
//! Slot `i` therefore sits at roughly `i · rate / (2n)` Hz.
//! [`strongest_frequency`] picks the loudest slot of such a spectrum.

use crate::buffer::ring::FixedRing;
use crate::buffer::{BufferError, SampleBuffer};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// Ring buffer whose snapshot is a magnitude spectrum of its contents
pub struct SpectrumFilter {
    ring: FixedRing,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl SpectrumFilter {
    /// Create a filter over `size` samples; callers pass a power of two
    pub fn new(size: usize) -> Self {
        let ring = FixedRing::new(size);
        let size = ring.capacity();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        Self {
            ring,
            window: blackman_harris(size),
            fft,
        }
    }

    /// Un-windowed contents of the ring
    pub fn raw_snapshot(&self) -> Vec<u32> {
        self.ring.snapshot()
    }

    fn spectrum(&self, data: &[u32]) -> Vec<u32> {
        let n = data.len();
        let mut buf: Vec<Complex<f32>> = data
            .iter()
            .zip(&self.window)
            .map(|(&x, &w)| Complex::new(x as f32 * w, 0.0))
            .collect();
        self.fft.process(&mut buf);

        let mut packed = vec![0.0f32; n];
        packed[0] = buf[0].re;
        let half = n / 2;
        if n % 2 == 0 {
            if n > 1 {
                packed[1] = buf[half].re;
            }
            for k in 1..half {
                packed[2 * k] = buf[k].re;
                packed[2 * k + 1] = buf[k].im;
            }
        } else {
            for k in 1..half {
                packed[2 * k] = buf[k].re;
                packed[2 * k + 1] = buf[k].im;
            }
            if half > 0 {
                packed[n - 1] = buf[half].re;
                packed[1] = buf[half].im;
            }
        }
        packed.into_iter().map(|v| v.abs() as u32).collect()
    }
}

/// A peak must reach this many times the slot count to count
pub const MIN_PEAK_FRACTION: f64 = 0.15;

/// Frequency of the strongest slot inside `[min_hz, max_hz]`
///
/// Slot `i` is taken to sit at `i / len · rate / 2` Hz. Returns `None` when
/// the band is empty or the winner is below [`MIN_PEAK_FRACTION`] of the slot
/// count. On ties the lowest slot wins.
pub fn strongest_frequency(
    spectrum: &[u32],
    sample_rate: f64,
    min_hz: f64,
    max_hz: f64,
) -> Option<f64> {
    let len = spectrum.len() as f64;
    let mut best: Option<(f64, u32)> = None;
    for (i, &p) in spectrum.iter().enumerate() {
        let freq = i as f64 / len * (sample_rate / 2.0);
        if freq >= min_hz && freq <= max_hz && p > best.map_or(0, |(_, m)| m) {
            best = Some((freq, p));
        }
    }
    best.filter(|&(_, p)| f64::from(p) >= len * MIN_PEAK_FRACTION)
        .map(|(freq, _)| freq)
}

fn blackman_harris(n: usize) -> Vec<f32> {
    let n_f = n as f64;
    (0..n)
        .map(|i| {
            let x = i as f64;
            (0.35875 - 0.48829 * (2.0 * PI * x / n_f).cos() + 0.14128 * (4.0 * PI * x / n_f).cos()
                - 0.01168 * (6.0 * PI * x / n_f).cos()) as f32
        })
        .collect()
}

impl SampleBuffer for SpectrumFilter {
    fn add(&self, value: u32) -> Result<(), BufferError> {
        self.ring.push(value);
        Ok(())
    }

    fn add_slice(&self, values: &[u32]) -> Result<(), BufferError> {
        self.ring.push_slice(values);
        Ok(())
    }

    /// Recomputed on every call
    fn snapshot(&self) -> Vec<u32> {
        self.spectrum(&self.ring.snapshot())
    }

    fn is_filled(&self) -> bool {
        self.ring.is_filled()
    }

    fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_window_shape() {
        let w = blackman_harris(64);
        assert_relative_eq!(w[0], 0.00006, epsilon = 1e-5);
        assert_relative_eq!(w[32], 1.0, epsilon = 1e-4);
        assert_relative_eq!(w[16], w[48], epsilon = 1e-6);
    }

    #[test]
    fn test_raw_snapshot_is_unwindowed() {
        let filter = SpectrumFilter::new(4);
        filter.add_slice(&[1, 2, 3, 4]).unwrap();
        assert_eq!(filter.raw_snapshot(), vec![1, 2, 3, 4]);
        assert!(filter.is_filled());
    }

    #[test]
    fn test_dc_lands_in_slot_zero() {
        let filter = SpectrumFilter::new(256);
        filter.add_slice(&vec![500; 256]).unwrap();
        let spec = filter.snapshot();
        // Sum of the window is 0.35875·n
        let expected = 500.0 * 0.35875 * 256.0;
        assert!((spec[0] as f64 - expected).abs() < expected * 0.01);
        // Nothing away from DC beyond the window's first sidelobe pair
        assert!(spec[8..].iter().all(|&v| v < 5));
    }

    #[test]
    fn test_tone_peaks_at_packed_slot() {
        let n = 1024;
        let rate = 4096.0;
        let freq = 128.0; // bin 32
        let samples: Vec<u32> = (0..n)
            .map(|i| (512.0 + 400.0 * (2.0 * PI * freq * i as f64 / rate).sin()) as u32)
            .collect();
        let filter = SpectrumFilter::new(n);
        filter.add_slice(&samples).unwrap();
        let spec = filter.snapshot();
        let (peak_slot, _) = spec
            .iter()
            .enumerate()
            .skip(8)
            .max_by_key(|&(_, &v)| v)
            .unwrap();
        // Slots below 8 hold the DC main lobe; bin 32 is packed at 64 and 65
        assert!(peak_slot == 64 || peak_slot == 65, "peak at {}", peak_slot);
    }

    #[test]
    fn test_strongest_frequency_in_band() {
        let mut spectrum = vec![2u32; 1000];
        spectrum[100] = 400;
        spectrum[300] = 900;
        // Slot i sits at i Hz with a 2 kHz rate
        assert_eq!(strongest_frequency(&spectrum, 2000.0, 20.0, 1000.0), Some(300.0));
        assert_eq!(strongest_frequency(&spectrum, 2000.0, 20.0, 200.0), Some(100.0));
        // 15% of 1000 slots
        spectrum[100] = 149;
        assert_eq!(strongest_frequency(&spectrum, 2000.0, 20.0, 200.0), None);
        assert_eq!(strongest_frequency(&spectrum, 2000.0, 500.0, 400.0), None);
        assert_eq!(strongest_frequency(&[], 2000.0, 0.0, 1000.0), None);
    }

    #[test]
    fn test_snapshot_tracks_new_writes() {
        let filter = SpectrumFilter::new(8);
        filter.add_slice(&[0; 8]).unwrap();
        assert!(filter.snapshot().iter().all(|&v| v == 0));
        filter.add_slice(&[100; 8]).unwrap();
        assert!(filter.snapshot()[0] > 0);
    }
}
