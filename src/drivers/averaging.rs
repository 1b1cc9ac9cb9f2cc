use log::debug;

use crate::drivers::ConsoleError;
use crate::types::{ConfigEpoch, Frame};

/// Averaging factors offered to the operator.
pub const AVERAGING_FACTORS: [usize; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

pub fn validate_factor(factor: usize) -> Result<usize, ConsoleError> {
    if AVERAGING_FACTORS.contains(&factor) {
        Ok(factor)
    } else {
        Err(ConsoleError::Config(format!(
            "invalid averaging factor {factor}; expected one of {AVERAGING_FACTORS:?}"
        )))
    }
}

/// Running elementwise sum over consecutive frames of one configuration epoch.
///
/// Reset rule: any reset (factor change, clear, disconnect) drops the partial
/// sum outright, and a frame from a different epoch (or with a different
/// sample count) restarts the accumulation from that frame.
#[derive(Debug)]
pub struct Accumulator {
    factor: usize,
    sum: Vec<f64>,
    count: usize,
    epoch: Option<ConfigEpoch>,
}

impl Accumulator {
    pub fn new(factor: usize) -> Result<Self, ConsoleError> {
        Ok(Self {
            factor: validate_factor(factor)?,
            sum: Vec::new(),
            count: 0,
            epoch: None,
        })
    }

    /// Changes the window size and discards any partial sum.
    pub fn set_factor(&mut self, factor: usize) -> Result<(), ConsoleError> {
        self.factor = validate_factor(factor)?;
        self.reset();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.sum.clear();
        self.count = 0;
        self.epoch = None;
    }

    /// Folds one frame in. Returns the averaged frame once `factor` frames of the
    /// same epoch have been summed; its metadata is taken from `frame`.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let epoch = frame.epoch();
        let restart = self.count == 0
            || self.epoch != Some(epoch)
            || self.sum.len() != frame.samples.len();
        if restart {
            if self.count > 0 {
                debug!(
                    "discarding {} partial frame(s): configuration changed to {:.2}ns/{}ps",
                    self.count, epoch.pulse_period_ns, epoch.sample_spacing_ps
                );
            }
            self.sum.clear();
            self.sum.extend_from_slice(&frame.samples);
            self.count = 1;
            self.epoch = Some(epoch);
        } else {
            for (acc, sample) in self.sum.iter_mut().zip(&frame.samples) {
                *acc += sample;
            }
            self.count += 1;
        }
        if self.count < self.factor {
            return None;
        }
        let divisor = self.factor as f64;
        let samples = self.sum.drain(..).map(|v| v / divisor).collect();
        self.count = 0;
        Some(Frame { samples, ..frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<f64>, spacing: f64, period: f64) -> Frame {
        Frame {
            samples,
            sample_spacing_ps: spacing,
            pulse_period_ns: period,
            ref_50ohm: 0.5,
            ref_unit_amp: 0.25,
        }
    }

    #[test]
    fn identical_frames_average_to_themselves() {
        let input = frame(vec![0.1, 0.2, 0.3, -0.7], 1.0, 16.0);
        let mut acc = Accumulator::new(4).unwrap();
        for _ in 0..3 {
            assert!(acc.push(input.clone()).is_none());
        }
        let out = acc.push(input.clone()).expect("fourth frame completes the window");
        assert_eq!(out.len(), input.len());
        for (a, b) in out.samples.iter().zip(&input.samples) {
            assert!((a - b).abs() < 1e-12);
        }
        assert_eq!(acc.count, 0);
    }

    #[test]
    fn factor_one_passes_frames_through() {
        let mut acc = Accumulator::new(1).unwrap();
        let input = frame(vec![1.0, 2.0], 100.0, 16.0);
        assert_eq!(acc.push(input.clone()), Some(input));
    }

    #[test]
    fn epoch_change_restarts_from_the_new_frame() {
        let mut acc = Accumulator::new(2).unwrap();
        assert!(acc.push(frame(vec![10.0, 10.0], 1.0, 16.0)).is_none());
        assert!(acc.push(frame(vec![2.0, 4.0], 2.0, 32.0)).is_none());
        assert_eq!(acc.count, 1);
        let out = acc.push(frame(vec![4.0, 6.0], 2.0, 32.0)).unwrap();
        assert_eq!(out.samples, vec![3.0, 5.0]);
        assert_eq!(out.sample_spacing_ps, 2.0);
    }

    #[test]
    fn factor_change_discards_partial_sum() {
        let mut acc = Accumulator::new(4).unwrap();
        assert!(acc.push(frame(vec![100.0], 1.0, 16.0)).is_none());
        acc.set_factor(2).unwrap();
        assert_eq!(acc.count, 0);
        assert!(acc.push(frame(vec![1.0], 1.0, 16.0)).is_none());
        assert_eq!(acc.push(frame(vec![3.0], 1.0, 16.0)).unwrap().samples, vec![2.0]);
    }

    #[test]
    fn invalid_factor_is_a_config_error() {
        assert!(matches!(Accumulator::new(3), Err(ConsoleError::Config(_))));
        let mut acc = Accumulator::new(8).unwrap();
        assert!(acc.set_factor(0).is_err());
        assert_eq!(acc.factor, 8);
    }

    #[test]
    fn averaged_frame_carries_latest_metadata() {
        let mut acc = Accumulator::new(2).unwrap();
        let mut first = frame(vec![0.0], 1.0, 16.0);
        first.ref_50ohm = 0.4;
        acc.push(first);
        let mut second = frame(vec![1.0], 1.0, 16.0);
        second.ref_50ohm = 0.6;
        let out = acc.push(second).unwrap();
        assert_eq!(out.ref_50ohm, 0.6);
    }
}
