// Single-byte motor command for the microcontroller link
//
// Byte layout (MSB first):
//   bits 7..6  motor id (0-3)
//   bit  5     sign (1 = reverse)
//   bits 4..0  magnitude (0-31)
//
// No framing and no acknowledgement: the microcontroller decodes every byte
// it receives as one command.

use super::scaling::Calibration;

/// Largest encodable motor id
pub const MAX_PACKET_ID: u8 = 0b11;

/// Largest encodable magnitude
pub const MAX_MAGNITUDE: u8 = 0b1_1111;

const ID_SHIFT: u8 = 6;
const SIGN_BIT: u8 = 1 << 5;

/// Decoded view of a motor command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorPacket {
    pub motor_id: u8,
    pub negative: bool,
    pub magnitude: u8,
}

impl MotorPacket {
    /// Build the packet for a requested speed using the motor's calibration.
    ///
    /// The sign comes from the unscaled request so the dead-zone never flips it.
    pub fn from_speed(motor_id: u8, speed: f64, calibration: &Calibration) -> Self {
        let scaled = calibration.scale(speed);
        let magnitude = (scaled.abs() * MAX_MAGNITUDE as f64).round() as u8;

        Self {
            motor_id: motor_id & MAX_PACKET_ID,
            negative: speed < 0.0,
            magnitude: magnitude.min(MAX_MAGNITUDE),
        }
    }

    pub fn as_byte(&self) -> u8 {
        let sign = if self.negative { SIGN_BIT } else { 0 };
        ((self.motor_id & MAX_PACKET_ID) << ID_SHIFT) | sign | (self.magnitude & MAX_MAGNITUDE)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            motor_id: byte >> ID_SHIFT,
            negative: byte & SIGN_BIT != 0,
            magnitude: byte & MAX_MAGNITUDE,
        }
    }

    /// Signed speed fraction carried by the packet
    pub fn speed(&self) -> f64 {
        let value = self.magnitude as f64 / MAX_MAGNITUDE as f64;
        if self.negative { -value } else { value }
    }
}

/// Encode a speed command for `motor_id` into its wire byte
pub fn encode(motor_id: u8, speed: f64, calibration: &Calibration) -> u8 {
    MotorPacket::from_speed(motor_id, speed, calibration).as_byte()
}

/// Decode a wire byte
pub fn decode(byte: u8) -> MotorPacket {
    MotorPacket::from_byte(byte)
}
