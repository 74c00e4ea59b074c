//! Fixed-length sample buffers for the measurement cycle: the probe
//! signal played through each speaker and the recording read back from
//! the microphone buffer.
//!
//! Levels follow the convention of the measurement toolchain this feeds:
//! RMS in decibels re 20 µPa, treating digital full scale as 1 pascal.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;

/// dB reference pressure, 20 µPa.
const DB_REF: f64 = 2e-5;

/// Hardware sample rate of the rack, in Hz.
pub const HARDWARE_SAMPLERATE: f64 = 48828.125;

/// A mono sample buffer with a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    samples: Vec<f32>,
    samplerate: f64,
}

impl Signal {
    /// Wraps raw samples at a sample rate.
    pub fn new(samples: Vec<f32>, samplerate: f64) -> Self {
        Self {
            samples,
            samplerate,
        }
    }

    /// A linear sine sweep from `from_freq` to `to_freq` Hz over
    /// `duration` seconds: the probe stimulus for response measurement.
    /// Peak amplitude is kept below full scale to leave converter
    /// headroom.
    pub fn chirp(duration: f64, from_freq: f64, to_freq: f64, samplerate: f64) -> Self {
        const PEAK: f64 = 0.8;
        let nsamples = (duration * samplerate) as usize;
        let sweep_rate = (to_freq - from_freq) / (2.0 * duration);
        let samples = (0..nsamples)
            .map(|i| {
                let t = i as f64 / samplerate;
                let phase = 2.0 * std::f64::consts::PI * (from_freq * t + sweep_rate * t * t);
                (phase.sin() * PEAK) as f32
            })
            .collect();
        Signal {
            samples,
            samplerate,
        }
    }

    /// Number of samples in the buffer.
    pub fn nsamples(&self) -> usize {
        self.samples.len()
    }

    /// The raw samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample rate in Hz.
    pub fn samplerate(&self) -> f64 {
        self.samplerate
    }

    /// RMS amplitude of the buffer.
    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let power: f64 = self
            .samples
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum::<f64>()
            / self.samples.len() as f64;
        power.sqrt()
    }

    /// Level in dB re 20 µPa. Digital silence reads as negative
    /// infinity.
    pub fn level_db(&self) -> f64 {
        let rms = self.rms();
        if rms <= 0.0 {
            return f64::NEG_INFINITY;
        }
        20.0 * (rms / DB_REF).log10()
    }

    /// Dumps the buffer as a mono float WAV, for offline inspection of
    /// a measurement.
    pub fn write_wav(&self, path: &Path) -> Result<(), hound::Error> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.samplerate as u32,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()
    }
}

/// A buffer read back from the record unit, with its measured level.
/// The level decides whether a speaker's measurement is trusted or
/// bypassed.
#[derive(Debug, Clone)]
pub struct Recording {
    signal: Signal,
    level_db: f64,
}

impl Recording {
    /// Wraps recorded samples, measuring their level once.
    pub fn new(samples: Vec<f32>, samplerate: f64) -> Self {
        let signal = Signal::new(samples, samplerate);
        let level_db = signal.level_db();
        Self { signal, level_db }
    }

    /// The recorded buffer.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Measured level in dB re 20 µPa.
    pub fn level_db(&self) -> f64 {
        self.level_db
    }
}
