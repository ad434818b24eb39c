//! E2E tests for sample buffers and signal filters
//!
//! Checks the buffer contract shared by rings and filters: snapshots hold
//! the most recent writes oldest first, and "filled" never reverts.

use ldat::buffer::constant::ConstantBuffer;
use ldat::buffer::ring::FixedRing;
use ldat::buffer::SampleBuffer;
use ldat::calibration::MonitorCapture;
use ldat::filter::peak_hold::PeakHoldFilter;
use ldat::filter::smoothing::RunningAverageSmoothingFilter;
use ldat::filter::spectrum::SpectrumFilter;
use proptest::prelude::*;

// ============================================================================
// Rings
// ============================================================================

#[test]
fn test_ring_keeps_most_recent_samples() {
    let ring = FixedRing::new(4);
    ring.add_slice(&[1, 2, 3]).unwrap();
    assert!(!ring.is_filled());
    // Unwritten slots read as zero ahead of the data
    assert_eq!(ring.snapshot(), vec![0, 1, 2, 3]);

    ring.add_slice(&[4, 5, 6]).unwrap();
    assert!(ring.is_filled());
    assert_eq!(ring.snapshot(), vec![3, 4, 5, 6]);
}

#[test]
fn test_ring_slice_longer_than_capacity() {
    let ring = FixedRing::new(3);
    ring.add_slice(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
    assert_eq!(ring.snapshot(), vec![5, 6, 7]);
    assert_eq!(ring.capacity(), 3);
}

#[test]
fn test_constant_buffer_rejects_writes() {
    let buffer = ConstantBuffer::new(vec![7, 8, 9]);
    assert!(buffer.add(1).is_err());
    assert!(buffer.add_slice(&[2, 3]).is_err());
    assert!(buffer.is_filled());
    assert_eq!(buffer.snapshot(), vec![7, 8, 9]);
}

#[test]
fn test_monitor_capture_stopped_early() {
    // Ctrl+C after 30 of 100 samples
    let ring = FixedRing::new(100);
    ring.add_slice(&[500; 30]).unwrap();
    ring.add(520).unwrap();
    let capture = MonitorCapture::from_ring(7798.0, &ring);
    assert_eq!(capture.samples.len(), 31);
    assert_eq!(capture.stats.low, 500);
    assert_eq!(capture.stats.high, 520);
    assert!(capture.stats.mean > 500.0);

    let json = serde_json::to_value(&capture).unwrap();
    assert_eq!(json["samples"].as_array().unwrap().len(), 31);
    assert_eq!(json["stats"]["low"], 500);
}

// ============================================================================
// Filters behind the buffer trait
// ============================================================================

#[test]
fn test_filters_as_trait_objects() {
    let buffers: Vec<Box<dyn SampleBuffer>> = vec![
        Box::new(FixedRing::new(8)),
        Box::new(PeakHoldFilter::new(8, 3)),
        Box::new(RunningAverageSmoothingFilter::new(8, 0.5)),
        Box::new(SpectrumFilter::new(8)),
    ];
    for buffer in &buffers {
        assert!(!buffer.is_filled());
        buffer.add_slice(&[100; 8]).unwrap();
        assert!(buffer.is_filled());
        assert_eq!(buffer.snapshot().len(), 8);
    }
}

#[test]
fn test_peak_hold_flattens_pwm_ripple() {
    // 8 sample PWM period, 3 samples dark
    let samples: Vec<u32> = (0..400).map(|i| if i % 8 < 3 { 200 } else { 600 }).collect();
    let filter = PeakHoldFilter::new(samples.len(), 8);
    filter.add_slice(&samples).unwrap();
    let settled = &filter.snapshot()[8..];
    assert!(settled.iter().all(|&v| v == 600));

    let window = PeakHoldFilter::find_best_window_size(&samples, 2, 20, 1, 16);
    assert_eq!(window, Some(4));
}

#[test]
fn test_smoothing_converges_on_step() {
    let filter = RunningAverageSmoothingFilter::new(64, 0.5);
    filter.add_slice(&[0; 8]).unwrap();
    filter.add_slice(&[1000; 56]).unwrap();
    let out = filter.snapshot();
    assert_eq!(out[7], 0);
    assert_eq!(out[8], 500);
    assert_eq!(out[9], 750);
    assert!(*out.last().unwrap() >= 999);
}

#[test]
fn test_spectrum_keeps_raw_samples() {
    let filter = SpectrumFilter::new(16);
    let samples: Vec<u32> = (0..16).collect();
    filter.add_slice(&samples).unwrap();
    assert_eq!(filter.raw_snapshot(), samples);
    // DC slot carries the windowed sum
    assert!(filter.snapshot()[0] > 0);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_ring_snapshot_is_suffix_of_writes(
        capacity in 1usize..64,
        writes in proptest::collection::vec(proptest::collection::vec(0u32..1024, 0..40), 0..8),
    ) {
        let ring = FixedRing::new(capacity);
        let mut all = Vec::new();
        for chunk in &writes {
            ring.add_slice(chunk).unwrap();
            all.extend_from_slice(chunk);
        }
        let tail = &all[all.len().saturating_sub(capacity)..];
        let mut expected = vec![0; capacity - tail.len()];
        expected.extend_from_slice(tail);
        prop_assert_eq!(ring.snapshot(), expected);
        prop_assert_eq!(ring.is_filled(), all.len() >= capacity);
    }

    #[test]
    fn prop_peak_hold_never_below_input(
        window in 1usize..16,
        samples in proptest::collection::vec(0u32..1024, 1..200),
    ) {
        let filter = PeakHoldFilter::new(samples.len(), window);
        filter.add_slice(&samples).unwrap();
        let out = filter.snapshot();
        prop_assert_eq!(out.len(), samples.len());
        for (i, (&o, &x)) in out.iter().zip(&samples).enumerate() {
            prop_assert!(o >= x);
            let start = i.saturating_sub(window - 1);
            prop_assert_eq!(o, *samples[start..=i].iter().max().unwrap());
        }
    }

    #[test]
    fn prop_smoothing_stays_within_input_range(
        factor in 0.0f64..0.99,
        samples in proptest::collection::vec(0u32..1024, 1..200),
    ) {
        let filter = RunningAverageSmoothingFilter::new(samples.len(), factor);
        filter.add_slice(&samples).unwrap();
        let hi = *samples.iter().max().unwrap();
        let lo = *samples.iter().min().unwrap();
        for v in filter.snapshot() {
            prop_assert!(v <= hi);
            // Truncation can drop at most one count below the minimum
            prop_assert!(v + 1 >= lo);
        }
    }
}
