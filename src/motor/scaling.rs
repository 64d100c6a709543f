// Speed scaling with dead-zone compensation
//
// Most motors do not turn until the input reaches some threshold. The usable
// input range [start_input, 1] is stretched over [0, 1] and then capped at
// max_speed, so a 10% request on a motor that starts at 20% becomes 28%.

/// Decimal places kept after scaling
const PRECISION: f64 = 10_000.0;

/// Per-motor calibration used by the scaler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Input magnitude at which the motor starts responding (0..=1)
    pub start_input: f64,
    /// Output ceiling (0..=1)
    pub max_speed: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            start_input: 0.0,
            max_speed: 1.0,
        }
    }
}

impl Calibration {
    pub fn scale(&self, speed: f64) -> f64 {
        scale_speed(speed, self.start_input, self.max_speed)
    }
}

/// Map a requested speed in [-1, 1] to the output range [-max_speed, max_speed].
///
/// Zero stays zero; the sign of the request is preserved.
pub fn scale_speed(speed: f64, start_input: f64, max_speed: f64) -> f64 {
    let stretched = if speed > 0.0 {
        speed * (1.0 - start_input) + start_input
    } else if speed < 0.0 {
        speed * (1.0 - start_input) - start_input
    } else {
        0.0
    };

    round_to_precision(stretched * max_speed)
}

fn round_to_precision(value: f64) -> f64 {
    (value * PRECISION).round() / PRECISION
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEPS: [f64; 9] = [-1.0, -0.75, -0.5, -0.1, 0.0, 0.1, 0.5, 0.75, 1.0];

    #[test]
    fn test_zero_stays_zero() {
        for &start in &[0.0, 0.2, 0.5, 1.0] {
            for &max in &[0.0, 0.5, 1.0] {
                assert_eq!(scale_speed(0.0, start, max), 0.0);
            }
        }
    }

    #[test]
    fn test_dead_zone_examples() {
        // Motor that starts at 20%: 10% -> 28%, 50% -> 60%
        assert!((scale_speed(0.1, 0.2, 1.0) - 0.28).abs() < 1e-4);
        assert!((scale_speed(0.5, 0.2, 1.0) - 0.6).abs() < 1e-4);
        assert!((scale_speed(-0.5, 0.2, 1.0) + 0.6).abs() < 1e-4);
    }

    #[test]
    fn test_left_motor_calibration() {
        // ((0.5 * 0.8) + 0.2) * 0.8
        let calibration = Calibration {
            start_input: 0.2,
            max_speed: 0.8,
        };
        assert!((calibration.scale(0.5) - 0.48).abs() < 1e-4);
        assert!((calibration.scale(-1.0) + 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_sign_preserved_and_bounded() {
        for &start in &[0.0, 0.3, 1.0] {
            for &max in &[0.1, 0.6, 1.0] {
                for &speed in &STEPS {
                    let scaled = scale_speed(speed, start, max);
                    assert!(scaled.abs() <= max + 1e-6, "{scaled} exceeds {max}");
                    if speed != 0.0 {
                        assert_eq!(scaled.signum(), speed.signum());
                    }
                }
            }
        }
    }

    #[test]
    fn test_rounded_to_four_decimals() {
        let scaled = scale_speed(0.123_456, 0.0, 1.0);
        assert!((scaled - 0.1235).abs() < 1e-6);
    }

    #[test]
    fn test_default_calibration_is_identity() {
        let calibration = Calibration::default();
        for &speed in &STEPS {
            assert!((calibration.scale(speed) - speed).abs() < 1e-4);
        }
    }
}
