use std::f64::consts::TAU;

use crate::config::EngineConfig;

/// Phase-accumulating sine synthesizer
///
/// Keeps phase continuous across calls and frequency changes so that
/// consecutive symbols join without discontinuities. The amplitude ramps
/// linearly toward the target at symbol onset and back to zero when a tone
/// is followed by silence.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    sample_rate: f64,
    target_amplitude: f64,
    ramp_step: f64,
    amplitude: f64,
    phase: f64,
    /// Frequency currently sounding (also used for the release tail)
    current_hz: Option<f64>,
}

impl Synthesizer {
    pub fn new(config: &EngineConfig) -> Self {
        let ramp = config.ramp_samples.max(1) as f64;
        Self {
            sample_rate: config.sample_rate as f64,
            target_amplitude: config.amplitude as f64,
            ramp_step: config.amplitude as f64 / ramp,
            amplitude: 0.0,
            phase: 0.0,
            current_hz: None,
        }
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude as f32
    }

    /// Phase accumulator, always within [0, 2π)
    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn is_silent(&self) -> bool {
        self.amplitude == 0.0
    }

    /// Silence immediately and forget the phase
    pub fn reset(&mut self) {
        self.amplitude = 0.0;
        self.phase = 0.0;
        self.current_hz = None;
    }

    /// Fill `out` with the requested tone, or with the release tail and
    /// zeros when `frequency` is `None`. Never allocates.
    pub fn render(&mut self, frequency: Option<f32>, out: &mut [f32]) {
        match frequency {
            Some(hz) => {
                self.current_hz = Some(hz as f64);
                for sample in out.iter_mut() {
                    self.amplitude = (self.amplitude + self.ramp_step).min(self.target_amplitude);
                    *sample = self.next_sample();
                }
            }
            None => {
                for sample in out.iter_mut() {
                    if self.amplitude > 0.0 && self.current_hz.is_some() {
                        self.amplitude = (self.amplitude - self.ramp_step).max(0.0);
                        *sample = self.next_sample();
                    } else {
                        self.amplitude = 0.0;
                        self.current_hz = None;
                        *sample = 0.0;
                    }
                }
            }
        }
    }

    /// Convenience wrapper around [`render`](Self::render) that allocates
    /// the output block.
    pub fn synthesize(&mut self, frequency: Option<f32>, num_frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; num_frames];
        self.render(frequency, &mut out);
        out
    }

    fn next_sample(&mut self) -> f32 {
        let hz = self.current_hz.unwrap_or(0.0);
        self.phase = (self.phase + TAU * hz / self.sample_rate).rem_euclid(TAU);
        (self.amplitude * self.phase.sin()) as f32
    }
}
