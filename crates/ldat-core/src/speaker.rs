//! Audio playback through the default output device
//!
//! The instrument streams at rates no sound card offers, so samples are
//! queued in a ring buffer and the output callback steps through the queue at
//! the ratio of the two rates, holding the last sample between steps. Every
//! output channel carries the same mono signal.

use crate::measurement::light_to_sound::AudioOutput;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Stream;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Queue length in seconds of source samples
const QUEUE_SECONDS: f64 = 0.25;

#[derive(Error, Debug)]
pub enum SpeakerError {
    #[error("No audio output device available")]
    NoOutputDevice,

    #[error("Failed to open audio stream: {0}")]
    StreamError(String),
}

/// Producer side shared with the sampling worker
pub struct SpeakerFeed {
    queue: Mutex<HeapProd<i16>>,
    playing: AtomicBool,
    /// Set by `pause`; the output callback empties the queue and clears it
    flush: AtomicBool,
}

impl AudioOutput for SpeakerFeed {
    fn play(&self, samples: &[i16]) {
        if !self.playing.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let pushed = queue.push_slice(samples);
        if pushed < samples.len() {
            tracing::trace!(dropped = samples.len() - pushed, "Audio queue full");
        }
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::Release);
        self.flush.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.playing.store(true, Ordering::Release);
    }
}

/// Steps through queued source samples at the output rate
struct Resampler {
    queue: HeapCons<i16>,
    step: f64,
    phase: f64,
    current: f32,
}

impl Resampler {
    fn next_sample(&mut self) -> f32 {
        self.phase += self.step;
        while self.phase >= 1.0 {
            self.phase -= 1.0;
            self.current = match self.queue.try_pop() {
                Some(s) => f32::from(s) / 32768.0,
                None => 0.0,
            };
        }
        self.current
    }

    fn clear(&mut self) {
        let queued = self.queue.occupied_len();
        self.queue.skip(queued);
        self.current = 0.0;
    }
}

/// An open output stream; playback stops when dropped
pub struct Speaker {
    _stream: Stream,
    feed: Arc<SpeakerFeed>,
    output_rate: u32,
}

impl Speaker {
    /// Open the default output device for a mono source at `source_rate` Hz
    ///
    /// The speaker starts paused.
    pub fn open(source_rate: f64) -> Result<Self, SpeakerError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(SpeakerError::NoOutputDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| SpeakerError::StreamError(e.to_string()))?;
        let output_rate = supported.sample_rate().0;
        let channels = usize::from(supported.channels()).max(1);
        let config = supported.config();

        let capacity = ((source_rate * QUEUE_SECONDS) as usize).max(1);
        let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
        let feed = Arc::new(SpeakerFeed {
            queue: Mutex::new(producer),
            playing: AtomicBool::new(false),
            flush: AtomicBool::new(false),
        });

        let mut resampler = Resampler {
            queue: consumer,
            step: source_rate / f64::from(output_rate),
            phase: 0.0,
            current: 0.0,
        };
        let callback_feed = Arc::clone(&feed);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if callback_feed.flush.swap(false, Ordering::AcqRel) {
                        resampler.clear();
                    }
                    if !callback_feed.playing.load(Ordering::Acquire) {
                        data.fill(0.0);
                        return;
                    }
                    for frame in data.chunks_mut(channels) {
                        frame.fill(resampler.next_sample());
                    }
                },
                move |err| {
                    tracing::error!("Output stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SpeakerError::StreamError(e.to_string()))?;
        stream
            .play()
            .map_err(|e| SpeakerError::StreamError(e.to_string()))?;

        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            output_rate,
            source_rate,
            "Audio output opened"
        );
        Ok(Self {
            _stream: stream,
            feed,
            output_rate,
        })
    }

    /// Handle to pass to the sampling side
    pub fn feed(&self) -> Arc<SpeakerFeed> {
        Arc::clone(&self.feed)
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resampler(step: f64, samples: &[i16]) -> Resampler {
        let (mut producer, consumer) = HeapRb::<i16>::new(64).split();
        producer.push_slice(samples);
        Resampler {
            queue: consumer,
            step,
            phase: 0.0,
            current: 0.0,
        }
    }

    #[test]
    fn test_downsampling_skips_samples() {
        let mut r = resampler(2.0, &[0, 16384, 0, -16384]);
        assert_eq!(r.next_sample(), 16384.0 / 32768.0);
        assert_eq!(r.next_sample(), -0.5);
        // Queue ran dry
        assert_eq!(r.next_sample(), 0.0);
    }

    #[test]
    fn test_upsampling_holds_samples() {
        let mut r = resampler(0.5, &[16384, -16384]);
        let out: Vec<f32> = (0..4).map(|_| r.next_sample()).collect();
        assert_eq!(out, vec![0.0, 0.5, 0.5, -0.5]);
    }

    #[test]
    fn test_clear_drops_queue() {
        let mut r = resampler(1.0, &[100, 200, 300]);
        r.clear();
        assert_eq!(r.next_sample(), 0.0);
    }
}
