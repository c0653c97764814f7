//! Windowed RMS energy detector and the silence gate that turns it into
//! end-of-utterance decisions.

use std::collections::VecDeque;

/// Configuration for the energy VAD.
#[derive(Debug, Clone)]
pub struct EnergyVadConfig {
    /// Number of recent frame energies kept in the window.
    /// 10 frames is ~250 ms at 25 ms framing.
    pub window_frames: usize,
    /// Speech threshold as a fraction of full-scale amplitude (0.0..=1.0).
    pub threshold: f32,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            window_frames: 10,
            threshold: 0.01,
        }
    }
}

/// Energy-based speech/silence classifier over a sliding window of frames.
///
/// One instance per session; reset on session destruction.
pub struct EnergyVad {
    window: VecDeque<f32>,
    window_frames: usize,
    threshold_abs: f32,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        let window_frames = config.window_frames.max(1);
        Self {
            window: VecDeque::with_capacity(window_frames),
            window_frames,
            threshold_abs: config.threshold.clamp(0.0, 1.0) * i16::MAX as f32,
        }
    }

    /// Observe one audio frame and report whether the window currently reads
    /// as speech.
    pub fn observe(&mut self, samples: &[i16]) -> bool {
        if self.window.len() == self.window_frames {
            self.window.pop_front();
        }
        self.window.push_back(rms(samples));

        let mean = self.window.iter().sum::<f32>() / self.window.len() as f32;
        mean > self.threshold_abs
    }

    /// Clear the window, e.g. when a new utterance starts.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Root-mean-square energy of a frame.
fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Turns per-frame speech/silence observations into a single commit decision.
///
/// A turn commits once speech has been observed at least once and the
/// configured number of consecutive silent frames follows it.
pub struct TurnGate {
    silence_frames_to_commit: u32,
    heard_speech: bool,
    silent_run: u32,
}

impl TurnGate {
    pub fn new(silence_frames_to_commit: u32) -> Self {
        Self {
            silence_frames_to_commit: silence_frames_to_commit.max(1),
            heard_speech: false,
            silent_run: 0,
        }
    }

    /// Feed one VAD observation; returns true exactly once per utterance when
    /// the turn should be committed.
    pub fn observe(&mut self, speaking: bool) -> bool {
        if speaking {
            self.heard_speech = true;
            self.silent_run = 0;
            return false;
        }
        if !self.heard_speech {
            return false;
        }
        self.silent_run += 1;
        if self.silent_run >= self.silence_frames_to_commit {
            self.heard_speech = false;
            self.silent_run = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.heard_speech = false;
        self.silent_run = 0;
    }
}
