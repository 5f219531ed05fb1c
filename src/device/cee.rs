//! CEE (Current-Experimental-Environment) model.
//!
//! Two 12-bit channels, ten ticks per USB packet. Each OUT packet carries the
//! channel modes followed by packed DAC codes; each IN packet echoes the modes
//! and carries packed signed ADC codes for both signals of both channels.

use tracing::{debug, warn};

use super::calibration::{CeeCalibration, CEE_CAL_LEN};
use super::{optional, Control, Model};
use crate::error::{Result, SmuError};
use crate::info::{ChannelInfo, DescriptorType, DeviceInfo, Mode, ModeSet, SignalInfo, Unit};
use crate::signal::{CHANNELS, SIGNALS_PER_CHANNEL};

/// USB ids handled by this model.
pub const USB_IDS: [(u16, u16); 1] = [(0x59e3, 0xcee1)];

/// Device descriptor.
pub static CEE_DEVICE_INFO: DeviceInfo = DeviceInfo {
    kind: DescriptorType::DeviceCee,
    label: "CEE",
    channel_count: CHANNELS,
};

/// Channel descriptors.
pub static CEE_CHANNELS: [ChannelInfo; CHANNELS] = [
    ChannelInfo {
        kind: DescriptorType::ChannelSmu,
        label: "A",
        mode_count: 3,
        signal_count: SIGNALS_PER_CHANNEL,
    },
    ChannelInfo {
        kind: DescriptorType::ChannelSmu,
        label: "B",
        mode_count: 3,
        signal_count: SIGNALS_PER_CHANNEL,
    },
];

const VOLTAGE: SignalInfo = SignalInfo {
    kind: DescriptorType::Signal,
    label: "Voltage",
    input_modes: ModeSet::all(),
    output_modes: ModeSet::SVMI,
    unit: Unit::VOLT,
    min: 0.0,
    max: 5.0,
    resolution: wire::V_SCALE,
};

const CURRENT: SignalInfo = SignalInfo {
    kind: DescriptorType::Signal,
    label: "Current",
    input_modes: ModeSet::SVMI.union(ModeSet::SIMV),
    output_modes: ModeSet::SIMV,
    unit: Unit::AMPERE,
    min: -0.2,
    max: 0.2,
    resolution: 0.4 / 2048.0,
};

/// Signal descriptors, `[channel][voltage, current]`.
pub static CEE_SIGNALS: [[SignalInfo; SIGNALS_PER_CHANNEL]; CHANNELS] =
    [[VOLTAGE, CURRENT], [VOLTAGE, CURRENT]];

/// Wire format and unit conversions.
///
/// The `dac_*`, `adc_*_code`, [`wire::decode_out_packet`] and
/// [`wire::encode_in_packet`] helpers are the device side of the link and
/// are used by the simulator.
pub mod wire {
    /// Ticks per packet.
    pub const TICKS_PER_PACKET: usize = 10;
    /// OUT packet size: 2 mode bytes + 10 × 3 bytes.
    pub const OUT_PACKET_LEN: usize = 2 + TICKS_PER_PACKET * 3;
    /// IN packet size: 4 header bytes + 10 × 6 bytes.
    pub const IN_PACKET_LEN: usize = 4 + TICKS_PER_PACKET * 6;
    /// Bulk OUT endpoint.
    pub const EP_OUT: u8 = 0x02;
    /// Bulk IN endpoint.
    pub const EP_IN: u8 = 0x81;

    /// String descriptors (`wIndex` 0 = hardware, 1 = firmware).
    pub const REQ_INFO: u8 = 0x00;
    /// Current-limit DAC trim (`wValue` = A, `wIndex` = B).
    pub const REQ_CURRENT_LIMIT: u8 = 0x15;
    /// Timer description: `per_ns: u16`, `min_per: u16`, little endian.
    pub const REQ_TIMING: u8 = 0x6F;
    /// Start (`wValue` = period, `wIndex` = 1) or stop (`0, 0`) streaming.
    pub const REQ_START: u8 = 0x80;
    /// EEPROM calibration record.
    pub const REQ_CALIBRATION: u8 = 0xE0;

    /// Timer tick length when the firmware does not report one.
    pub const DEFAULT_PER_NS: u16 = 250;
    /// Shortest timer period when the firmware does not report one.
    pub const DEFAULT_MIN_PER: u16 = 100;

    /// Volts per ADC code.
    pub const V_SCALE: f64 = 5.0 / 2048.0;
    /// Amps per ADC code (sense resistor 0.07 Ω, gain 45, ×2 range).
    pub const I_SCALE: f64 = 2.5 / 2048.0 / (0.07 * 45.0 * 2.0);

    const DAC_MAX: f64 = 4095.0;
    // A per volt of DAC swing in SIMV
    const SIMV_TRANSCONDUCTANCE: f64 = 10.0 / (45.0 * 0.07);

    /// DAC code for an SVMI voltage target.
    pub fn voltage_code(volts: f64) -> u16 {
        (DAC_MAX * volts / 5.0).round().clamp(0.0, DAC_MAX) as u16
    }

    /// DAC code for an SIMV current target.
    pub fn current_code(amps: f64) -> u16 {
        (DAC_MAX * (1.25 + amps * SIMV_TRANSCONDUCTANCE) / 2.5)
            .round()
            .clamp(0.0, DAC_MAX) as u16
    }

    /// Voltage a DAC code drives in SVMI.
    pub fn dac_voltage(code: u16) -> f64 {
        f64::from(code) * 5.0 / DAC_MAX
    }

    /// Current a DAC code drives in SIMV.
    pub fn dac_current(code: u16) -> f64 {
        (f64::from(code) * 2.5 / DAC_MAX - 1.25) / SIMV_TRANSCONDUCTANCE
    }

    /// ADC code reading `volts`.
    pub fn adc_voltage_code(volts: f64) -> i16 {
        (volts / V_SCALE).round().clamp(-2048.0, 2047.0) as i16
    }

    /// ADC code reading `amps`.
    pub fn adc_current_code(amps: f64) -> i16 {
        (amps / I_SCALE).round().clamp(-2048.0, 2047.0) as i16
    }

    /// Sign-extend a 12-bit two's complement value.
    pub fn sign_extend12(raw: u16) -> i16 {
        ((raw << 4) as i16) >> 4
    }

    /// Pack one OUT packet.
    pub fn encode_out_packet(modes: [u8; 2], codes: &[[u16; 2]], packet: &mut [u8]) {
        packet[0] = modes[0];
        packet[1] = modes[1];
        for (t, &[a, b]) in codes.iter().take(TICKS_PER_PACKET).enumerate() {
            let p = &mut packet[2 + 3 * t..5 + 3 * t];
            p[0] = (a & 0xff) as u8;
            p[1] = (b & 0xff) as u8;
            p[2] = (((b & 0xf00) >> 4) | ((a & 0xf00) >> 8)) as u8;
        }
    }

    /// Unpack one OUT packet into its modes and `[a, b]` DAC codes.
    pub fn decode_out_packet(packet: &[u8]) -> ([u8; 2], [[u16; 2]; TICKS_PER_PACKET]) {
        let mut codes = [[0u16; 2]; TICKS_PER_PACKET];
        for (t, code) in codes.iter_mut().enumerate() {
            let p = &packet[2 + 3 * t..5 + 3 * t];
            let hi = u16::from(p[2]);
            code[0] = u16::from(p[0]) | ((hi & 0x0f) << 8);
            code[1] = u16::from(p[1]) | ((hi & 0xf0) << 4);
        }
        ([packet[0], packet[1]], codes)
    }

    /// Pack one IN packet from `[av, ai, bv, bi]` ADC codes.
    pub fn encode_in_packet(modes: [u8; 2], flags: u8, codes: &[[i16; 4]], packet: &mut [u8]) {
        packet[0] = modes[0];
        packet[1] = modes[1];
        packet[2] = flags;
        packet[3] = 0;
        for (t, c) in codes.iter().take(TICKS_PER_PACKET).enumerate() {
            let [av, ai, bv, bi] = c.map(|x| (x as u16) & 0x0fff);
            let p = &mut packet[4 + 6 * t..10 + 6 * t];
            p[0] = (av & 0xff) as u8;
            p[1] = (ai & 0xff) as u8;
            p[2] = ((av >> 8) | ((ai >> 8) << 4)) as u8;
            p[3] = (bv & 0xff) as u8;
            p[4] = (bi & 0xff) as u8;
            p[5] = ((bv >> 8) | ((bi >> 8) << 4)) as u8;
        }
    }

    /// Unpack the ADC codes of one tick.
    pub fn decode_tick(p: &[u8]) -> [i16; 4] {
        let x = |i: usize| u16::from(p[i]);
        [
            sign_extend12(x(0) | ((x(2) & 0x0f) << 8)),
            sign_extend12(x(1) | ((x(2) & 0xf0) << 4)),
            sign_extend12(x(3) | ((x(5) & 0x0f) << 8)),
            sign_extend12(x(4) | ((x(5) & 0xf0) << 4)),
        ]
    }
}

/// Output current limit of a CEE channel pair.
///
/// The limit is a clamp set through a trim DAC; the SIMV transconductance does
/// not change with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentLimit {
    /// 200 mA, the firmware default
    Ma200,
    /// 400 mA
    Ma400,
}

impl CurrentLimit {
    /// Limit for `milliamps`; only 200 and 400 exist.
    pub fn from_milliamps(milliamps: u32) -> Result<Self> {
        match milliamps {
            200 => Ok(Self::Ma200),
            400 => Ok(Self::Ma400),
            other => Err(SmuError::invalid(format!(
                "current limit must be 200 or 400 mA, got {other}"
            ))),
        }
    }

    /// Limit in milliamps.
    pub fn milliamps(self) -> u32 {
        match self {
            Self::Ma200 => 200,
            Self::Ma400 => 400,
        }
    }
}

/// CEE model state.
#[derive(Debug)]
pub(crate) struct Cee {
    fw_version: String,
    hw_version: String,
    cal: CeeCalibration,
    current_limit: CurrentLimit,
    per_ns: u16,
    min_per: u16,
    per: u16,
}

impl Cee {
    pub(crate) fn init(io: &Control<'_>) -> Result<Self> {
        let hw_version = optional(io.read_string(wire::REQ_INFO, 0, 0), "hardware version")?
            .unwrap_or_else(|| "unknown".to_string());
        let fw_version = optional(io.read_string(wire::REQ_INFO, 0, 1), "firmware version")?
            .unwrap_or_else(|| "unknown".to_string());

        let mut timing = [0u8; 4];
        let (per_ns, min_per) = match optional(io.read(wire::REQ_TIMING, 0, 0, &mut timing), "timer description")? {
            Some(4) => (
                u16::from_le_bytes([timing[0], timing[1]]),
                u16::from_le_bytes([timing[2], timing[3]]),
            ),
            _ => (wire::DEFAULT_PER_NS, wire::DEFAULT_MIN_PER),
        };
        if per_ns == 0 {
            return Err(SmuError::Protocol {
                message: "device reports a zero timer tick".to_string(),
            });
        }

        let mut raw = [0u8; CEE_CAL_LEN];
        let cal = match optional(io.read(wire::REQ_CALIBRATION, 0, 0, &mut raw), "calibration")? {
            Some(len) => CeeCalibration::parse(&raw[..len.min(CEE_CAL_LEN)]).unwrap_or_else(|err| {
                warn!(error = %err, "running uncalibrated");
                CeeCalibration::identity()
            }),
            None => CeeCalibration::identity(),
        };

        debug!(per_ns, min_per, calibrated = cal.is_valid(), "CEE initialized");
        Ok(Self {
            fw_version,
            hw_version,
            cal,
            current_limit: CurrentLimit::Ma200,
            per_ns,
            min_per,
            per: 0,
        })
    }

    /// Write the trim of the selected limit. Without calibration the trim
    /// values are unknown and the firmware keeps its own.
    fn write_current_limit(&self, io: &Control<'_>) -> Result<()> {
        if !self.cal.is_valid() {
            debug!("no current-limit trim, keeping firmware default");
            return Ok(());
        }
        let [a, b] = match self.current_limit {
            CurrentLimit::Ma200 => self.cal.dac200,
            CurrentLimit::Ma400 => self.cal.dac400,
        };
        io.write(wire::REQ_CURRENT_LIMIT, a as u16, b as u16)?;
        debug!(dac_a = a, dac_b = b, limit_ma = self.current_limit.milliamps(), "current limit trim written");
        Ok(())
    }

    fn clock_hz(&self) -> f64 {
        1e9 / f64::from(self.per_ns)
    }

    fn check_mode(channel: usize, raw: u8) -> Result<()> {
        if usize::from(raw) >= Mode::ALL.len() {
            return Err(SmuError::Protocol {
                message: format!("channel {channel} reports unknown mode {raw}"),
            });
        }
        Ok(())
    }
}

impl Model for Cee {
    fn device_info() -> &'static DeviceInfo {
        &CEE_DEVICE_INFO
    }

    fn channel_table() -> &'static [ChannelInfo; CHANNELS] {
        &CEE_CHANNELS
    }

    fn signal_table() -> &'static [[SignalInfo; SIGNALS_PER_CHANNEL]; CHANNELS] {
        &CEE_SIGNALS
    }

    fn fw_version(&self) -> &str {
        &self.fw_version
    }

    fn hw_version(&self) -> &str {
        &self.hw_version
    }

    fn is_calibrated(&self) -> bool {
        self.cal.is_valid()
    }

    fn calibration_rows(&self) -> Vec<Vec<f32>> {
        (0..CHANNELS)
            .map(|ch| {
                vec![
                    f32::from(self.cal.offset_v[ch]),
                    f32::from(self.cal.offset_i[ch]),
                    self.cal.gain(ch) as f32,
                ]
            })
            .collect()
    }

    fn ticks_per_packet(&self) -> usize {
        wire::TICKS_PER_PACKET
    }

    fn out_packet_len(&self) -> usize {
        wire::OUT_PACKET_LEN
    }

    fn in_packet_len(&self) -> usize {
        wire::IN_PACKET_LEN
    }

    fn out_endpoint(&self) -> u8 {
        wire::EP_OUT
    }

    fn in_endpoint(&self) -> u8 {
        wire::EP_IN
    }

    fn configure(&mut self, rate: u64) -> Result<f64> {
        let clock = self.clock_hz();
        let ideal = (clock / rate as f64).round();
        let per = ideal.clamp(f64::from(self.min_per), f64::from(u16::MAX)) as u16;
        if f64::from(per) != ideal {
            warn!(requested = rate, period = per, "sample rate out of range, clamped");
        }
        self.per = per;
        Ok(clock / f64::from(per))
    }

    fn encode_value(&self, channel: usize, mode: Mode, value: f32) -> u16 {
        match mode {
            Mode::Svmi => wire::voltage_code(f64::from(value)),
            Mode::Simv => wire::current_code(f64::from(value) / self.cal.gain(channel)),
            Mode::Disabled => 0,
        }
    }

    fn write_out_packet(&self, modes: [Mode; CHANNELS], codes: &[[u16; CHANNELS]], packet: &mut [u8]) {
        let modes = modes.map(|m| m.index() as u8);
        wire::encode_out_packet(modes, codes, packet);
    }

    fn decode_packet(&self, packet: &[u8], values: &mut Vec<[f32; 4]>) -> Result<()> {
        Self::check_mode(0, packet[0])?;
        Self::check_mode(1, packet[1])?;
        if packet[2] & 0x01 != 0 {
            warn!("device dropped a packet");
        }

        let cal = &self.cal;
        let (gain_a, gain_b) = (cal.gain(0), cal.gain(1));
        for tick in packet[4..].chunks_exact(6) {
            let [av, ai, bv, bi] = wire::decode_tick(tick);
            values.push([
                ((f64::from(av) - f64::from(cal.offset_v[0])) * wire::V_SCALE) as f32,
                ((f64::from(ai) - f64::from(cal.offset_i[0])) * wire::I_SCALE * gain_a) as f32,
                ((f64::from(bv) - f64::from(cal.offset_v[1])) * wire::V_SCALE) as f32,
                ((f64::from(bi) - f64::from(cal.offset_i[1])) * wire::I_SCALE * gain_b) as f32,
            ]);
        }
        Ok(())
    }

    fn start_streaming(&self, io: &Control<'_>) -> Result<()> {
        io.write(wire::REQ_START, self.per, 1)
    }

    fn stop_streaming(&self, io: &Control<'_>) -> Result<()> {
        io.write(wire::REQ_START, 0, 0)
    }

    fn added(&mut self, io: &Control<'_>) -> Result<()> {
        self.write_current_limit(io)
    }

    fn set_current_limit(&mut self, io: &Control<'_>, milliamps: u32) -> Result<()> {
        self.current_limit = CurrentLimit::from_milliamps(milliamps)?;
        self.write_current_limit(io)
    }
}
