//! [`RateCalculator`] – converts an inter-pulse interval into a physical rate.
//!
//! An electricity meter that blinks once per watt-hour yields power in watts
//! as `3600 / seconds_between_blinks`; the `3600` is the calibration constant.

use pulsebridge_types::RateSample;

/// Calibration used when none is configured: one pulse per watt-hour,
/// reported in watts.
pub const DEFAULT_CALIBRATION: f64 = 3600.0;

/// Pure `calibration / elapsed` conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateCalculator {
    calibration: f64,
}

impl RateCalculator {
    pub fn new(calibration: f64) -> Self {
        Self { calibration }
    }

    pub fn calibration(&self) -> f64 {
        self.calibration
    }

    /// `None` for a zero (or non-positive) interval: the first edge, or two
    /// edges with no measurable gap, has no prior interval to rate.
    pub fn compute(&self, elapsed_seconds: f64) -> Option<RateSample> {
        if elapsed_seconds <= 0.0 {
            return None;
        }
        Some(RateSample {
            value: self.calibration / elapsed_seconds,
        })
    }
}

impl Default for RateCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_CALIBRATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_yields_no_sample() {
        assert_eq!(RateCalculator::default().compute(0.0), None);
    }

    #[test]
    fn compute_divides_calibration_by_interval() {
        let calc = RateCalculator::new(3600.0);
        for elapsed in [0.001, 0.25, 1.0, 2.0, 7.5, 3600.0] {
            let sample = calc.compute(elapsed).expect("positive interval");
            assert!((sample.value - 3600.0 / elapsed).abs() < 1e-9);
        }
    }

    #[test]
    fn scripted_pulse_train() {
        let calc = RateCalculator::new(3600.0);
        assert_eq!(calc.compute(1.0).map(|s| s.value), Some(3600.0));
        assert_eq!(calc.compute(2.0).map(|s| s.value), Some(1800.0));
    }

    #[test]
    fn calibration_is_injected() {
        let calc = RateCalculator::new(1000.0);
        assert_eq!(calc.calibration(), 1000.0);
        assert_eq!(calc.compute(4.0).map(|s| s.value), Some(250.0));
    }
}
