//! DHT22 (AM2302) temperature/humidity sensor, bit-banged over one GPIO.
//!
//! Frame layout (40 bits, MSB first):
//!
//! ```text
//!   [0..16)   humidity  x10, unsigned
//!   [16..32)  temperature x10, bit 15 = sign
//!   [32..40)  checksum = low byte of the sum of the four data bytes
//! ```
//!
//! Each bit is a ~50us LOW followed by a HIGH whose width encodes the value:
//! ~27us for 0, ~70us for 1. Frame decoding is pure and host-testable; the
//! pin-level driver is gated on the `gpio` feature.

use anyhow::{bail, Result};

/// HIGH pulses longer than this are a 1 bit.
pub const BIT_THRESHOLD_US: u32 = 50;

pub const FRAME_BITS: usize = 40;

/// Pack 40 HIGH-pulse widths into the five frame bytes.
pub fn pulses_to_bytes(pulses: &[u32]) -> Result<[u8; 5]> {
    if pulses.len() != FRAME_BITS {
        bail!("short frame: {} of {FRAME_BITS} bits", pulses.len());
    }
    let mut bytes = [0u8; 5];
    for (i, &width) in pulses.iter().enumerate() {
        if width > BIT_THRESHOLD_US {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
    }
    Ok(bytes)
}

/// Verify the checksum and decode `(temperature_c, humidity_pct)`.
pub fn decode_frame(bytes: [u8; 5]) -> Result<(f64, f64)> {
    let sum = bytes[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != bytes[4] {
        bail!(
            "checksum mismatch: computed {sum:#04x}, sensor sent {:#04x}",
            bytes[4]
        );
    }

    let humidity = f64::from(u16::from_be_bytes([bytes[0], bytes[1]])) / 10.0;
    let magnitude = f64::from(u16::from_be_bytes([bytes[2] & 0x7F, bytes[3]])) / 10.0;
    let temperature = if bytes[2] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    };

    if !(0.0..=100.0).contains(&humidity) || !(-40.0..=80.0).contains(&temperature) {
        bail!("reading out of sensor range: {temperature}C {humidity}%");
    }
    Ok((temperature, humidity))
}

// ---------------------------------------------------------------------------
// Pin driver (production; requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use driver::Dht22;

#[cfg(feature = "gpio")]
mod driver {
    use super::*;
    use crate::hal::ClimateDriver;
    use rppal::gpio::{Gpio, IoPin, Level, Mode, PullUpDown};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Host start signal: hold the line LOW at least 1ms.
    const START_LOW: Duration = Duration::from_millis(2);
    /// No edge takes longer than ~90us; anything past this is a dead line.
    const EDGE_TIMEOUT: Duration = Duration::from_micros(200);

    pub struct Dht22 {
        pin: IoPin,
    }

    impl Dht22 {
        pub fn new(bcm_pin: u8) -> Result<Self> {
            let mut pin = Gpio::new()?.get(bcm_pin)?.into_io(Mode::Input);
            pin.set_pullupdown(PullUpDown::PullUp);
            Ok(Self { pin })
        }

        /// Busy-wait until the line leaves `level`; returns how long it held.
        fn hold_time(&self, level: Level) -> Result<u32> {
            let start = Instant::now();
            while self.pin.read() == level {
                if start.elapsed() > EDGE_TIMEOUT {
                    bail!("timed out waiting for {level:?} edge");
                }
            }
            Ok(start.elapsed().as_micros() as u32)
        }

        fn read_pulses(&mut self) -> Result<Vec<u32>> {
            self.pin.set_mode(Mode::Output);
            self.pin.write(Level::Low);
            thread::sleep(START_LOW);
            self.pin.write(Level::High);
            self.pin.set_mode(Mode::Input);

            // Host release, then the sensor's 80us LOW / 80us HIGH response.
            self.hold_time(Level::High)?;
            self.hold_time(Level::Low)?;
            self.hold_time(Level::High)?;

            let mut pulses = Vec::with_capacity(FRAME_BITS);
            for _ in 0..FRAME_BITS {
                self.hold_time(Level::Low)?;
                pulses.push(self.hold_time(Level::High)?);
            }
            Ok(pulses)
        }
    }

    impl ClimateDriver for Dht22 {
        fn read_temperature_humidity(&mut self) -> Result<(f64, f64)> {
            let pulses = self.read_pulses();
            // Leave the line pulled up between reads whatever happened.
            self.pin.set_mode(Mode::Input);
            decode_frame(pulses_to_bytes(&pulses?)?)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(h: u16, t: i16) -> [u8; 5] {
        let [h0, h1] = h.to_be_bytes();
        let raw_t = if t < 0 {
            0x8000 | t.unsigned_abs()
        } else {
            t as u16
        };
        let [t0, t1] = raw_t.to_be_bytes();
        let sum = h0.wrapping_add(h1).wrapping_add(t0).wrapping_add(t1);
        [h0, h1, t0, t1, sum]
    }

    fn pulses_for(bytes: [u8; 5]) -> Vec<u32> {
        (0..FRAME_BITS)
            .map(|i| {
                if bytes[i / 8] & (0x80 >> (i % 8)) != 0 {
                    70
                } else {
                    27
                }
            })
            .collect()
    }

    #[test]
    fn decodes_positive_reading() {
        let (t, h) = decode_frame(frame(652, 351)).unwrap();
        assert_eq!(h, 65.2);
        assert_eq!(t, 35.1);
    }

    #[test]
    fn decodes_negative_temperature() {
        let (t, _) = decode_frame(frame(400, -101)).unwrap();
        assert_eq!(t, -10.1);
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let mut bytes = frame(500, 200);
        bytes[4] = bytes[4].wrapping_add(1);
        let err = decode_frame(bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"), "{err}");
    }

    #[test]
    fn implausible_values_rejected() {
        assert!(decode_frame(frame(1200, 200)).is_err());
        assert!(decode_frame(frame(500, 900)).is_err());
    }

    #[test]
    fn pulse_widths_pack_msb_first() {
        let bytes = frame(652, 351);
        assert_eq!(pulses_to_bytes(&pulses_for(bytes)).unwrap(), bytes);
    }

    #[test]
    fn short_frame_rejected() {
        assert!(pulses_to_bytes(&[70; 39]).is_err());
    }
}
