use rodio::Source;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Shared atomics storing the current RMS and peak level as f32 bits.
/// Updated by `LevelSource` on the audio thread, read by the control plane.
#[derive(Clone)]
pub struct LevelMonitor {
    rms: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

impl LevelMonitor {
    pub fn new() -> Self {
        LevelMonitor {
            rms: Arc::new(AtomicU32::new(0)),
            peak: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Current RMS level (0.0–1.0+).
    pub fn rms(&self) -> f32 {
        f32::from_bits(self.rms.load(Ordering::Relaxed))
    }

    /// Peak amplitude of the most recent analysis window.
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }

    /// Store fresh readings. Called from whichever thread meters the audio.
    pub fn set(&self, rms: f32, peak: f32) {
        self.rms.store(rms.to_bits(), Ordering::Relaxed);
        self.peak.store(peak.to_bits(), Ordering::Relaxed);
    }

    /// Reset both meters to zero (e.g. on stop).
    pub fn reset(&self) {
        self.set(0.0, 0.0);
    }
}

impl Default for LevelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time meter readings across the graph, emitted as an event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelSnapshot {
    /// (label, rms, peak) per metered point, in graph order.
    pub points: Vec<(String, f32, f32)>,
}

/// A Source wrapper that measures RMS and peak amplitude over ~50ms windows
/// and updates a `LevelMonitor`. Passes all samples through unchanged.
pub struct LevelSource<S> {
    inner: S,
    monitor: LevelMonitor,
    window_size: usize,
    window_sum_sq: f64,
    window_peak: f32,
    window_pos: usize,
}

impl<S> LevelSource<S>
where
    S: Source<Item = f32>,
{
    pub fn new(source: S, monitor: LevelMonitor) -> Self {
        let sample_rate = source.sample_rate() as usize;
        let channels = source.channels() as usize;
        let samples_per_sec = sample_rate * channels;
        // ~50ms analysis window for responsive metering
        let window_size = (samples_per_sec as f64 * 0.05).max(1.0) as usize;

        LevelSource {
            inner: source,
            monitor,
            window_size,
            window_sum_sq: 0.0,
            window_peak: 0.0,
            window_pos: 0,
        }
    }
}

impl<S> Iterator for LevelSource<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.inner.next()?;

        self.window_sum_sq += (sample as f64) * (sample as f64);
        self.window_peak = self.window_peak.max(sample.abs());
        self.window_pos += 1;

        if self.window_pos >= self.window_size {
            let rms = (self.window_sum_sq / self.window_size as f64).sqrt() as f32;
            self.monitor.set(rms, self.window_peak);
            self.window_sum_sq = 0.0;
            self.window_peak = 0.0;
            self.window_pos = 0;
        }

        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S> Source for LevelSource<S>
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

#[cfg(test)]
mod tests {
    use super::*;

    struct TestSource {
        samples: Vec<f32>,
        pos: usize,
        sample_rate: u32,
        channels: u16,
    }

    impl TestSource {
        fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
            TestSource {
                samples,
                pos: 0,
                sample_rate,
                channels,
            }
        }
    }

    impl Iterator for TestSource {
        type Item = f32;
        fn next(&mut self) -> Option<f32> {
            if self.pos < self.samples.len() {
                let s = self.samples[self.pos];
                self.pos += 1;
                Some(s)
            } else {
                None
            }
        }
    }

    impl Source for TestSource {
        fn current_frame_len(&self) -> Option<usize> {
            Some(self.samples.len() - self.pos)
        }
        fn channels(&self) -> u16 {
            self.channels
        }
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }
        fn total_duration(&self) -> Option<Duration> {
            None
        }
    }

    #[test]
    fn monitor_starts_at_zero() {
        let monitor = LevelMonitor::new();
        assert_eq!(monitor.rms(), 0.0);
        assert_eq!(monitor.peak(), 0.0);
    }

    #[test]
    fn monitor_reset_clears_both_meters() {
        let monitor = LevelMonitor::new();
        monitor.set(0.5, 0.9);
        assert!(monitor.rms() > 0.0);
        monitor.reset();
        assert_eq!(monitor.rms(), 0.0);
        assert_eq!(monitor.peak(), 0.0);
    }

    #[test]
    fn level_source_passes_samples_unchanged() {
        let original = vec![0.1, 0.2, -0.3, 0.4, 0.5];
        let source = TestSource::new(original.clone(), 1000, 1);
        let wrapped = LevelSource::new(source, LevelMonitor::new());
        let output: Vec<f32> = wrapped.collect();
        assert_eq!(output, original);
    }

    #[test]
    fn level_source_measures_loud_audio() {
        // 1000 Hz mono, window = ~50 samples; 100 samples of 0.5 amplitude
        // give RMS ~0.5 after the first window.
        let source = TestSource::new(vec![0.5; 100], 1000, 1);
        let monitor = LevelMonitor::new();
        let wrapped = LevelSource::new(source, monitor.clone());
        let _: Vec<f32> = wrapped.collect();
        let rms = monitor.rms();
        assert!(rms > 0.4 && rms < 0.6, "Expected RMS ~0.5, got {}", rms);
        assert!((monitor.peak() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn level_source_measures_silence() {
        let source = TestSource::new(vec![0.0; 100], 1000, 1);
        let monitor = LevelMonitor::new();
        let wrapped = LevelSource::new(source, monitor.clone());
        let _: Vec<f32> = wrapped.collect();
        assert_eq!(monitor.rms(), 0.0);
    }

    #[test]
    fn peak_tracks_extremes_within_window() {
        let mut samples = vec![0.1; 50];
        samples[10] = -0.8;
        let source = TestSource::new(samples, 1000, 1);
        let monitor = LevelMonitor::new();
        let wrapped = LevelSource::new(source, monitor.clone());
        let _: Vec<f32> = wrapped.collect();
        assert!((monitor.peak() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn level_source_preserves_source_properties() {
        let source = TestSource::new(vec![0.0; 50], 44100, 2);
        let wrapped = LevelSource::new(source, LevelMonitor::new());
        assert_eq!(wrapped.sample_rate(), 44100);
        assert_eq!(wrapped.channels(), 2);
    }
}
