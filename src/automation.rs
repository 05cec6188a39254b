//! Gain automation primitives.
//!
//! `GainParam` is a shared, rampable gain value evaluated against the audio
//! clock. The control plane is the only writer; the audio thread only reads,
//! so plain atomics carry the state across threads (the f32-bits-in-atomic
//! scheme). A new ramp always replaces the previous one — last-writer-wins,
//! there is no ramp queue.

use rodio::Source;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic audio-clock seconds, decoupled from wall-clock adjustments and
/// control-thread scheduling jitter.
#[derive(Clone)]
pub struct AudioClock {
    epoch: Instant,
}

impl AudioClock {
    pub fn new() -> Self {
        AudioClock {
            epoch: Instant::now(),
        }
    }

    pub fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Default for AudioClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A linearly rampable gain parameter shared between the control plane and
/// the audio thread.
pub struct GainParam {
    /// from (high 32 bits) and to (low 32 bits), both f32 bits.
    endpoints: AtomicU64,
    /// Ramp start on the audio clock, f64 bits. Written last on update.
    start: AtomicU64,
    /// Ramp duration in seconds, f32 bits.
    duration: AtomicU32,
}

impl GainParam {
    pub fn new(initial: f32) -> Arc<Self> {
        Arc::new(GainParam {
            endpoints: AtomicU64::new(pack(initial, initial)),
            start: AtomicU64::new(0f64.to_bits()),
            duration: AtomicU32::new(0f32.to_bits()),
        })
    }

    /// Jump immediately to a value, cancelling any ramp in flight.
    pub fn set_now(&self, value: f32) {
        self.duration.store(0f32.to_bits(), Ordering::Relaxed);
        self.endpoints.store(pack(value, value), Ordering::Relaxed);
        self.start.store(0f64.to_bits(), Ordering::Release);
    }

    /// Schedule a linear ramp from the current value toward `target`,
    /// starting at `clock_now`. Cancels any previously scheduled ramp.
    pub fn ramp_to(&self, target: f32, duration_secs: f64, clock_now: f64) {
        if duration_secs <= 0.0 {
            self.set_now(target);
            return;
        }
        let from = self.value_at(clock_now);
        self.duration
            .store((duration_secs as f32).to_bits(), Ordering::Relaxed);
        self.endpoints.store(pack(from, target), Ordering::Relaxed);
        self.start.store(clock_now.to_bits(), Ordering::Release);
    }

    /// Evaluate the parameter at an audio-clock time.
    pub fn value_at(&self, clock: f64) -> f32 {
        let start = f64::from_bits(self.start.load(Ordering::Acquire));
        let duration = f32::from_bits(self.duration.load(Ordering::Relaxed)) as f64;
        let (from, to) = unpack(self.endpoints.load(Ordering::Relaxed));

        if duration <= 0.0 {
            return to;
        }
        let t = ((clock - start) / duration).clamp(0.0, 1.0) as f32;
        from + (to - from) * t
    }

    /// The value the parameter is heading toward.
    pub fn target(&self) -> f32 {
        unpack(self.endpoints.load(Ordering::Relaxed)).1
    }
}

fn pack(from: f32, to: f32) -> u64 {
    ((from.to_bits() as u64) << 32) | to.to_bits() as u64
}

fn unpack(bits: u64) -> (f32, f32) {
    (
        f32::from_bits((bits >> 32) as u32),
        f32::from_bits(bits as u32),
    )
}

/// A Source wrapper that applies a `GainParam` sample-accurately.
/// The clock position is derived by counting samples from the start clock,
/// so gain ramps stay exact even when the control thread stalls.
pub struct GainSource<S> {
    inner: S,
    param: Arc<GainParam>,
    start_clock: f64,
    samples_per_sec: f64,
    samples_emitted: u64,
}

impl<S> GainSource<S>
where
    S: Source<Item = f32>,
{
    pub fn new(source: S, param: Arc<GainParam>, start_clock: f64) -> Self {
        let samples_per_sec = source.sample_rate() as f64 * source.channels() as f64;
        GainSource {
            inner: source,
            param,
            start_clock,
            samples_per_sec: samples_per_sec.max(1.0),
            samples_emitted: 0,
        }
    }
}

impl<S> Iterator for GainSource<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.inner.next()?;
        let clock = self.start_clock + self.samples_emitted as f64 / self.samples_per_sec;
        self.samples_emitted += 1;
        Some(sample * self.param.value_at(clock))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S> Source for GainSource<S>
where
    S: Source<Item = f32>,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}
