//! Main-bus mastering: a soft-knee compressor followed by a 3-band EQ
//! (low shelf, peaking mid, high shelf). Disabled mastering is a bit-exact
//! passthrough.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, Q_BUTTERWORTH_F32, ToHertz, Type};
use serde::{Deserialize, Serialize};

pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

pub fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.max(1e-10).log10()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressorConfig {
    /// Compression threshold in dBFS.
    pub threshold_db: f32,
    /// Knee width in dB (0 = hard knee).
    pub knee_db: f32,
    /// Compression ratio (e.g. 4.0 = 4:1).
    pub ratio: f32,
    /// Attack time in ms.
    pub attack_ms: f32,
    /// Release time in ms.
    pub release_ms: f32,
    /// Make-up gain in dB.
    pub makeup_db: f32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig {
            threshold_db: -18.0,
            knee_db: 6.0,
            ratio: 3.0,
            attack_ms: 5.0,
            release_ms: 50.0,
            makeup_db: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqConfig {
    /// Low shelf gain in dB.
    pub low_gain_db: f32,
    /// Low shelf corner frequency in Hz.
    pub low_freq_hz: f32,
    /// Peaking mid gain in dB.
    pub mid_gain_db: f32,
    /// Mid centre frequency in Hz.
    pub mid_freq_hz: f32,
    /// High shelf gain in dB.
    pub high_gain_db: f32,
    /// High shelf corner frequency in Hz.
    pub high_freq_hz: f32,
}

impl Default for EqConfig {
    fn default() -> Self {
        EqConfig {
            low_gain_db: 0.0,
            low_freq_hz: 100.0,
            mid_gain_db: 0.0,
            mid_freq_hz: 1000.0,
            high_gain_db: 0.0,
            high_freq_hz: 8000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MasteringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub compressor: CompressorConfig,
    #[serde(default)]
    pub eq: EqConfig,
}

/// Soft-knee peak compressor. Detector smoothing uses separate attack and
/// release coefficients.
struct Compressor {
    config: CompressorConfig,
    detector: f32,
    attack_coeff: f32,
    release_coeff: f32,
    makeup_gain: f32,
}

impl Compressor {
    fn new(sample_rate: f32, config: CompressorConfig) -> Self {
        let attack_coeff = time_coeff(config.attack_ms, sample_rate);
        let release_coeff = time_coeff(config.release_ms, sample_rate);
        let makeup_gain = db_to_linear(config.makeup_db);
        Compressor {
            config,
            detector: 0.0,
            attack_coeff,
            release_coeff,
            makeup_gain,
        }
    }

    #[inline]
    fn process(&mut self, sample: f32) -> f32 {
        let abs_in = sample.abs();
        let coeff = if abs_in > self.detector {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.detector = coeff * self.detector + (1.0 - coeff) * abs_in;

        let level_db = linear_to_db(self.detector);
        sample * db_to_linear(self.gain_db(level_db)) * self.makeup_gain
    }

    #[inline]
    fn gain_db(&self, level_db: f32) -> f32 {
        let t = self.config.threshold_db;
        let r = self.config.ratio.max(1.0);
        let w = self.config.knee_db;
        let excess = level_db - t;

        if w > 0.0 {
            let half_w = w / 2.0;
            if excess < -half_w {
                0.0
            } else if excess > half_w {
                (t + excess / r) - level_db
            } else {
                let x = (excess + half_w) / w;
                let interp_ratio = 1.0 + (r - 1.0) * x;
                (t - half_w + (excess + half_w) / interp_ratio) - level_db
            }
        } else if excess > 0.0 {
            (t + excess / r) - level_db
        } else {
            0.0
        }
    }
}

#[inline]
fn time_coeff(time_ms: f32, sample_rate: f32) -> f32 {
    if time_ms <= 0.0 {
        return 0.0;
    }
    let samples = (time_ms / 1000.0) * sample_rate;
    (-1.0_f32 / samples.max(1.0)).exp()
}

fn unity_coeffs() -> Coefficients<f32> {
    Coefficients {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    }
}

/// The full mastering chain for the main bus.
pub struct MasteringChain {
    sample_rate: f32,
    config: MasteringConfig,
    compressor: Compressor,
    low_shelf: DirectForm2Transposed<f32>,
    peak_mid: DirectForm2Transposed<f32>,
    high_shelf: DirectForm2Transposed<f32>,
}

impl MasteringChain {
    pub fn new(sample_rate: f32, config: MasteringConfig) -> Self {
        let (low_shelf, peak_mid, high_shelf) = build_eq(sample_rate, &config);
        let compressor = Compressor::new(sample_rate, config.compressor.clone());
        MasteringChain {
            sample_rate,
            config,
            compressor,
            low_shelf,
            peak_mid,
            high_shelf,
        }
    }

    pub fn with_defaults(sample_rate: f32) -> Self {
        Self::new(sample_rate, MasteringConfig::default())
    }

    pub fn config(&self) -> &MasteringConfig {
        &self.config
    }

    /// Apply new targets. Rebuilds filter coefficients; flat when disabled.
    pub fn set_config(&mut self, config: MasteringConfig) {
        let (low_shelf, peak_mid, high_shelf) = build_eq(self.sample_rate, &config);
        self.low_shelf = low_shelf;
        self.peak_mid = peak_mid;
        self.high_shelf = high_shelf;
        self.compressor = Compressor::new(self.sample_rate, config.compressor.clone());
        self.config = config;
    }

    #[inline]
    pub fn process_mono(&mut self, sample: f32) -> f32 {
        if !self.config.enabled {
            return sample;
        }
        let s = self.compressor.process(sample);
        let s = self.low_shelf.run(s);
        let s = self.peak_mid.run(s);
        self.high_shelf.run(s)
    }

    pub fn process_buffer(&mut self, buf: &mut [f32]) {
        if !self.config.enabled {
            return;
        }
        for s in buf.iter_mut() {
            *s = self.process_mono(*s);
        }
    }
}

fn build_eq(
    sample_rate: f32,
    config: &MasteringConfig,
) -> (
    DirectForm2Transposed<f32>,
    DirectForm2Transposed<f32>,
    DirectForm2Transposed<f32>,
) {
    // Flat response when mastering is off; targets otherwise.
    let eq = if config.enabled {
        config.eq.clone()
    } else {
        EqConfig::default()
    };
    let fs = sample_rate.hz();
    let nyquist_cap = sample_rate / 2.0 - 1.0;

    let low = Coefficients::<f32>::from_params(
        Type::LowShelf(eq.low_gain_db),
        fs,
        eq.low_freq_hz.clamp(20.0, nyquist_cap).hz(),
        Q_BUTTERWORTH_F32,
    )
    .unwrap_or_else(|_| unity_coeffs());

    let mid = Coefficients::<f32>::from_params(
        Type::PeakingEQ(eq.mid_gain_db),
        fs,
        eq.mid_freq_hz.clamp(20.0, nyquist_cap).hz(),
        Q_BUTTERWORTH_F32,
    )
    .unwrap_or_else(|_| unity_coeffs());

    let high = Coefficients::<f32>::from_params(
        Type::HighShelf(eq.high_gain_db),
        fs,
        eq.high_freq_hz.clamp(20.0, nyquist_cap).hz(),
        Q_BUTTERWORTH_F32,
    )
    .unwrap_or_else(|_| unity_coeffs());

    (
        DirectForm2Transposed::<f32>::new(low),
        DirectForm2Transposed::<f32>::new(mid),
        DirectForm2Transposed::<f32>::new(high),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_chain_is_passthrough() {
        let mut chain = MasteringChain::with_defaults(44100.0);
        assert!(!chain.config().enabled);
        let input = 0.42_f32;
        assert_eq!(chain.process_mono(input), input);
    }

    #[test]
    fn enabled_flat_chain_is_near_transparent() {
        let config = MasteringConfig {
            enabled: true,
            compressor: CompressorConfig {
                threshold_db: 0.0, // nothing below full scale is compressed
                ..Default::default()
            },
            eq: EqConfig::default(),
        };
        let mut chain = MasteringChain::new(44100.0, config);
        let out = chain.process_mono(0.25);
        assert!(
            (out - 0.25).abs() < 1e-3,
            "flat mastering should be near-transparent, got {out}"
        );
    }

    #[test]
    fn compressor_reduces_loud_signal() {
        let config = MasteringConfig {
            enabled: true,
            compressor: CompressorConfig {
                threshold_db: -20.0,
                knee_db: 0.0,
                ratio: 10.0,
                attack_ms: 0.1,
                release_ms: 10.0,
                makeup_db: 0.0,
            },
            eq: EqConfig::default(),
        };
        let mut chain = MasteringChain::new(44100.0, config);
        // Warm up the detector.
        for _ in 0..1000 {
            chain.process_mono(0.9);
        }
        let out = chain.process_mono(0.9);
        assert!(out.abs() < 0.9, "compressor should reduce loud signal: {out}");
    }

    #[test]
    fn low_shelf_boost_raises_dc() {
        let config = MasteringConfig {
            enabled: true,
            compressor: CompressorConfig {
                threshold_db: 0.0,
                ..Default::default()
            },
            eq: EqConfig {
                low_gain_db: 6.0,
                ..Default::default()
            },
        };
        let mut chain = MasteringChain::new(44100.0, config);
        // Settle the filters on a DC input; a low shelf boosts DC.
        let mut out = 0.0;
        for _ in 0..10_000 {
            out = chain.process_mono(0.25);
        }
        assert!(out > 0.25, "6 dB low shelf should boost DC, got {out}");
    }

    #[test]
    fn set_config_swaps_targets() {
        let mut chain = MasteringChain::with_defaults(44100.0);
        let mut config = MasteringConfig::default();
        config.enabled = true;
        config.compressor.threshold_db = -30.0;
        chain.set_config(config.clone());
        assert_eq!(chain.config(), &config);
    }

    #[test]
    fn db_conversions_roundtrip() {
        for db in [-60.0_f32, -18.0, -3.0, 0.0, 6.0] {
            let back = linear_to_db(db_to_linear(db));
            assert!((back - db).abs() < 1e-3, "roundtrip failed for {db} dB");
        }
    }
}
