//! Sample buffers that transform what passes through them
//!
//! Each filter wraps a [`FixedRing`](crate::buffer::ring::FixedRing) and
//! implements [`SampleBuffer`](crate::buffer::SampleBuffer), so a measurement
//! can swap a plain ring for a filter without touching the capture code.
//!
//! - [`peak_hold::PeakHoldFilter`]: max over a sliding window, on write
//! - [`smoothing::RunningAverageSmoothingFilter`]: exponential smoothing, on write
//! - [`spectrum::SpectrumFilter`]: windowed FFT magnitudes, on read

pub mod peak_hold;
pub mod smoothing;
pub mod spectrum;
