//! Factory calibration records.
//!
//! Both models keep a fixed-layout record in device EEPROM, read once when
//! the device is probed. A short read or a wrong magic value is not fatal:
//! the device runs uncalibrated (zero offsets, unity gains).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, SmuError};

/// Magic value of a valid CEE record.
pub const CEE_CAL_MAGIC: u32 = 0x90e2_6cee;
/// Size of the CEE record as stored (naturally aligned, tail-padded).
pub const CEE_CAL_LEN: usize = 28;

/// Magic value of a valid M1000 record.
pub const M1000_CAL_MAGIC: u32 = 0x01ee_02dd;
/// Size of the M1000 record.
pub const M1000_CAL_LEN: usize = 4 + 3 * 8 * 4;

/// Unity value of the CEE current gain fields.
pub const CEE_GAIN_UNITY: u32 = 100_000;

/// CEE calibration record.
///
/// Offsets are in raw ADC codes, the current gains are fixed point with
/// [`CEE_GAIN_UNITY`] meaning 1.0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CeeCalibration {
    /// Voltage ADC offset per channel
    pub offset_v: [i8; 2],
    /// Current ADC offset per channel
    pub offset_i: [i8; 2],
    /// Current-limit DAC trim for the 200 mA range per channel
    pub dac200: [i16; 2],
    /// Current-limit DAC trim for the 400 mA range per channel
    pub dac400: [i16; 2],
    /// Current gain per channel
    pub current_gain: [u32; 2],
    /// Bit 0: USB powered
    pub flags: u8,
    valid: bool,
}

impl Default for CeeCalibration {
    fn default() -> Self {
        Self::identity()
    }
}

impl CeeCalibration {
    /// Uncalibrated record.
    pub fn identity() -> Self {
        Self {
            offset_v: [0; 2],
            offset_i: [0; 2],
            dac200: [0; 2],
            dac400: [0; 2],
            current_gain: [CEE_GAIN_UNITY; 2],
            flags: 0,
            valid: false,
        }
    }

    /// Calibrated record with the given offsets and gains.
    pub fn new(offset_v: [i8; 2], offset_i: [i8; 2], current_gain: [u32; 2]) -> Self {
        Self {
            offset_v,
            offset_i,
            current_gain,
            valid: true,
            ..Self::identity()
        }
    }

    /// Parse the EEPROM image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        // the trailing padding is optional
        if data.len() < CEE_CAL_LEN - 3 {
            return Err(SmuError::Protocol {
                message: format!("calibration record too short: {} bytes", data.len()),
            });
        }
        let mut buf = data;
        let magic = buf.get_u32_le();
        if magic != CEE_CAL_MAGIC {
            return Err(SmuError::Protocol {
                message: format!("calibration magic {magic:#010x} != {CEE_CAL_MAGIC:#010x}"),
            });
        }

        let (a_v, a_i, b_v, b_i) = (buf.get_i8(), buf.get_i8(), buf.get_i8(), buf.get_i8());
        let dac200 = [buf.get_i16_le(), buf.get_i16_le()];
        let dac400 = [buf.get_i16_le(), buf.get_i16_le()];
        let mut current_gain = [buf.get_u32_le(), buf.get_u32_le()];
        let flags = buf.get_u8();

        for gain in &mut current_gain {
            if *gain == 0 {
                *gain = CEE_GAIN_UNITY;
            }
        }

        Ok(Self {
            offset_v: [a_v, b_v],
            offset_i: [a_i, b_i],
            dac200,
            dac400,
            current_gain,
            flags,
            valid: true,
        })
    }

    /// Serialize to the EEPROM image.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(CEE_CAL_LEN);
        buf.put_u32_le(if self.valid { CEE_CAL_MAGIC } else { 0xffff_ffff });
        buf.put_i8(self.offset_v[0]);
        buf.put_i8(self.offset_i[0]);
        buf.put_i8(self.offset_v[1]);
        buf.put_i8(self.offset_i[1]);
        for v in self.dac200.iter().chain(self.dac400.iter()) {
            buf.put_i16_le(*v);
        }
        buf.put_u32_le(self.current_gain[0]);
        buf.put_u32_le(self.current_gain[1]);
        buf.put_u8(self.flags);
        buf.put_bytes(0, CEE_CAL_LEN - buf.len());
        buf
    }

    /// Whether a valid record was read.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Current gain of `channel` as a factor.
    pub fn gain(&self, channel: usize) -> f64 {
        f64::from(self.current_gain[channel]) / f64::from(CEE_GAIN_UNITY)
    }

    /// Whether the device reports running from USB power.
    pub fn usb_powered(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Index of one M1000 calibration entry within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum M1000CalEntry {
    /// Voltage measurement
    MeasureVoltage = 0,
    /// Current measurement
    MeasureCurrent = 1,
    /// Voltage output
    SourceVoltage = 2,
    /// Current output
    SourceCurrent = 3,
}

impl M1000CalEntry {
    fn index(self, channel: usize) -> usize {
        channel * 4 + self as usize
    }
}

/// M1000 calibration record: offset plus sign-dependent gain per entry.
#[derive(Debug, Clone, PartialEq)]
pub struct M1000Calibration {
    /// Offset per entry, in physical units
    pub offset: [f32; 8],
    /// Gain applied to positive values
    pub gain_p: [f32; 8],
    /// Gain applied to negative values
    pub gain_n: [f32; 8],
    valid: bool,
}

impl Default for M1000Calibration {
    fn default() -> Self {
        Self::identity()
    }
}

impl M1000Calibration {
    /// Uncalibrated record.
    pub fn identity() -> Self {
        Self {
            offset: [0.0; 8],
            gain_p: [1.0; 8],
            gain_n: [1.0; 8],
            valid: false,
        }
    }

    /// Parse the EEPROM image. Non-finite entries fall back to identity.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < M1000_CAL_LEN {
            return Err(SmuError::Protocol {
                message: format!("calibration record too short: {} bytes", data.len()),
            });
        }
        let mut buf = data;
        let magic = buf.get_u32_le();
        if magic != M1000_CAL_MAGIC {
            return Err(SmuError::Protocol {
                message: format!("calibration magic {magic:#010x} != {M1000_CAL_MAGIC:#010x}"),
            });
        }

        let mut cal = Self::identity();
        for v in &mut cal.offset {
            let x = buf.get_f32_le();
            *v = if x.is_finite() { x } else { 0.0 };
        }
        for table in [&mut cal.gain_p, &mut cal.gain_n] {
            for v in table.iter_mut() {
                let x = buf.get_f32_le();
                *v = if x.is_finite() && x != 0.0 { x } else { 1.0 };
            }
        }
        cal.valid = true;
        Ok(cal)
    }

    /// Serialize to the EEPROM image.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(M1000_CAL_LEN);
        buf.put_u32_le(if self.valid { M1000_CAL_MAGIC } else { 0xffff_ffff });
        for v in self.offset.iter().chain(&self.gain_p).chain(&self.gain_n) {
            buf.put_f32_le(*v);
        }
        buf
    }

    /// Mark as a valid, factory-written record.
    pub fn into_valid(mut self) -> Self {
        self.valid = true;
        self
    }

    /// Whether a valid record was read.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Correct a raw measured value.
    pub fn measure(&self, channel: usize, entry: M1000CalEntry, raw: f64) -> f64 {
        let i = entry.index(channel);
        let x = raw - f64::from(self.offset[i]);
        if x >= 0.0 {
            x * f64::from(self.gain_p[i])
        } else {
            x * f64::from(self.gain_n[i])
        }
    }

    /// Value to command so that the output lands on `target`.
    pub fn source(&self, channel: usize, entry: M1000CalEntry, target: f64) -> f64 {
        let i = entry.index(channel);
        let gain = if target >= 0.0 {
            self.gain_p[i]
        } else {
            self.gain_n[i]
        };
        target / f64::from(gain) + f64::from(self.offset[i])
    }

    /// What an uncorrected output stage produces for a `commanded` value.
    pub fn actual_output(&self, channel: usize, entry: M1000CalEntry, commanded: f64) -> f64 {
        self.measure(channel, entry, commanded)
    }

    /// What an uncorrected converter reads for an `actual` value.
    pub fn raw_reading(&self, channel: usize, entry: M1000CalEntry, actual: f64) -> f64 {
        self.source(channel, entry, actual)
    }

    /// One `[offset, gain_p, gain_n]` row per entry.
    pub fn rows(&self) -> Vec<Vec<f32>> {
        (0..8)
            .map(|i| vec![self.offset[i], self.gain_p[i], self.gain_n[i]])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cee_layout() {
        let mut raw = vec![0u8; CEE_CAL_LEN];
        raw[..4].copy_from_slice(&CEE_CAL_MAGIC.to_le_bytes());
        raw[4] = 3; // a_v
        raw[5] = 0xfe; // a_i = -2
        raw[6] = 1; // b_v
        raw[7] = 4; // b_i
        raw[8..10].copy_from_slice(&1200i16.to_le_bytes());
        raw[14..16].copy_from_slice(&(-7i16).to_le_bytes());
        raw[16..20].copy_from_slice(&101_000u32.to_le_bytes());
        raw[20..24].copy_from_slice(&99_000u32.to_le_bytes());
        raw[24] = 0x01;

        let cal = CeeCalibration::parse(&raw).unwrap();
        assert!(cal.is_valid());
        assert_eq!(cal.offset_v, [3, 1]);
        assert_eq!(cal.offset_i, [-2, 4]);
        assert_eq!(cal.dac200, [1200, 0]);
        assert_eq!(cal.dac400, [0, -7]);
        assert!((cal.gain(0) - 1.01).abs() < 1e-12);
        assert!(cal.usb_powered());
        assert_eq!(&cal.to_bytes()[..], &raw[..]);
    }

    #[test]
    fn test_cee_rejects_bad_magic_and_short_reads() {
        let mut raw = CeeCalibration::new([1, 1], [1, 1], [CEE_GAIN_UNITY; 2]).to_bytes();
        assert!(CeeCalibration::parse(&raw[..10]).is_err());
        raw[0] ^= 0xff;
        assert!(CeeCalibration::parse(&raw).is_err());
        assert!(CeeCalibration::parse(&CeeCalibration::identity().to_bytes()).is_err());
    }

    #[test]
    fn test_cee_zero_gain_is_unity() {
        let raw = CeeCalibration::new([0, 0], [0, 0], [0, 0]).to_bytes();
        let cal = CeeCalibration::parse(&raw).unwrap();
        assert_eq!(cal.gain(1), 1.0);
    }

    #[test]
    fn test_m1000_parse_and_apply() {
        let mut cal = M1000Calibration::identity().into_valid();
        cal.offset[1] = 0.01;
        cal.gain_p[1] = 1.02;
        cal.gain_n[1] = 0.98;
        cal.gain_p[4] = f32::NAN;

        let parsed = M1000Calibration::parse(&cal.to_bytes()).unwrap();
        assert_eq!(parsed.gain_p[4], 1.0);
        assert_eq!(parsed.offset[1], 0.01);

        let measured = parsed.measure(0, M1000CalEntry::MeasureCurrent, 0.11);
        assert!((measured - 0.1 * 1.02).abs() < 1e-6);
        let measured = parsed.measure(0, M1000CalEntry::MeasureCurrent, -0.09);
        assert!((measured + 0.1 * 0.98).abs() < 1e-6);

        let identity = M1000Calibration::identity();
        assert_eq!(identity.source(1, M1000CalEntry::SourceVoltage, 2.5), 2.5);
        assert_eq!(identity.rows().len(), 8);
    }

    #[test]
    fn test_m1000_rejects_wrong_magic() {
        let raw = M1000Calibration::identity().to_bytes();
        assert!(M1000Calibration::parse(&raw).is_err());
        assert!(M1000Calibration::parse(&[0xdd, 0x02]).is_err());
    }
}
