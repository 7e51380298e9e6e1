//! Local voice activity detection using RMS energy analysis.
//!
//! This heuristic only drives UI feedback and local barge-in
//! triggering. On the realtime channel the server's own detector is
//! authoritative for turn boundaries.

use crate::config::VadConfig;

/// Activity transition reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    /// Confirmed start of user speech.
    SpeechStarted,
    /// Confirmed end of user speech.
    SpeechEnded,
}

/// Energy-based speech activity detector.
#[derive(Debug)]
pub struct EnergyVad {
    threshold: f32,
    min_speech_frames: u32,
    hangover_frames: u32,
    /// Consecutive frames classified as speech while idle.
    speech_run: u32,
    /// Consecutive silent frames while in speech.
    silence_run: u32,
    in_speech: bool,
}

impl EnergyVad {
    /// Create a detector from config.
    #[must_use]
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_speech_frames: config.min_speech_frames.max(1),
            hangover_frames: config.hangover_frames.max(1),
            speech_run: 0,
            silence_run: 0,
            in_speech: false,
        }
    }

    /// Whether the detector currently considers the user to be speaking.
    #[must_use]
    pub fn is_speech_active(&self) -> bool {
        self.in_speech
    }

    /// Classify one audio frame; returns a transition when the
    /// confirmation threshold is crossed.
    pub fn process_frame(&mut self, samples: &[f32]) -> Option<VadTransition> {
        let is_speech = compute_rms_energy(samples) > self.threshold;

        if self.in_speech {
            if is_speech {
                self.silence_run = 0;
            } else {
                self.silence_run += 1;
                if self.silence_run >= self.hangover_frames {
                    self.in_speech = false;
                    self.silence_run = 0;
                    return Some(VadTransition::SpeechEnded);
                }
            }
        } else if is_speech {
            self.speech_run += 1;
            if self.speech_run >= self.min_speech_frames {
                self.in_speech = true;
                self.speech_run = 0;
                return Some(VadTransition::SpeechStarted);
            }
        } else {
            self.speech_run = 0;
        }

        None
    }

    /// Reset to the idle state.
    pub fn reset(&mut self) {
        self.speech_run = 0;
        self.silence_run = 0;
        self.in_speech = false;
    }
}

/// Compute RMS energy of audio samples.
fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
