//! ADALM1000 (M1000) model.
//!
//! 16-bit converters, 256 ticks per packet. Packets are split into
//! per-signal regions of big-endian `u16` codes: OUT carries channel A then
//! channel B, IN carries A voltage, A current, B voltage, B current. Modes are
//! not part of the stream; they are set with a control request.

use std::sync::atomic::{AtomicU16, Ordering};

use tracing::{debug, warn};

use super::calibration::{M1000CalEntry, M1000Calibration, M1000_CAL_LEN};
use super::{optional, Control, Model};
use crate::error::Result;
use crate::info::{ChannelInfo, DescriptorType, DeviceInfo, Mode, ModeSet, SignalInfo, Unit};
use crate::signal::{CHANNELS, SIGNALS_PER_CHANNEL};

/// USB ids handled by this model.
pub const USB_IDS: [(u16, u16); 2] = [(0x0456, 0xcee2), (0x064b, 0x784c)];

/// Default sample rate of the M1000.
pub const M1000_DEFAULT_RATE: u64 = 100_000;

/// Device descriptor.
pub static M1000_DEVICE_INFO: DeviceInfo = DeviceInfo {
    kind: DescriptorType::DeviceM1000,
    label: "ADALM1000",
    channel_count: CHANNELS,
};

/// Channel descriptors.
pub static M1000_CHANNELS: [ChannelInfo; CHANNELS] = [
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
    resolution: 5.0 / 65535.0,
};

const CURRENT: SignalInfo = SignalInfo {
    kind: DescriptorType::Signal,
    label: "Current",
    input_modes: ModeSet::SVMI.union(ModeSet::SIMV),
    output_modes: ModeSet::SIMV,
    unit: Unit::AMPERE,
    min: -0.2,
    max: 0.2,
    resolution: 1.0 / 65535.0 / 1.6,
};

/// Signal descriptors, `[channel][voltage, current]`.
pub static M1000_SIGNALS: [[SignalInfo; SIGNALS_PER_CHANNEL]; CHANNELS] =
    [[VOLTAGE, CURRENT], [VOLTAGE, CURRENT]];

/// Wire format and unit conversions.
pub mod wire {
    /// Ticks per packet.
    pub const TICKS_PER_PACKET: usize = 256;
    /// OUT packet size: two regions of 256 codes.
    pub const OUT_PACKET_LEN: usize = TICKS_PER_PACKET * 2 * 2;
    /// IN packet size: four regions of 256 codes.
    pub const IN_PACKET_LEN: usize = TICKS_PER_PACKET * 4 * 2;
    /// Bulk OUT endpoint.
    pub const EP_OUT: u8 = 0x02;
    /// Bulk IN endpoint.
    pub const EP_IN: u8 = 0x81;

    /// String descriptors (`wIndex` 0 = hardware, 1 = firmware).
    pub const REQ_INFO: u8 = 0x00;
    /// EEPROM calibration record.
    pub const REQ_CALIBRATION: u8 = 0x01;
    /// Clear a control pin (`wValue` = pin).
    pub const REQ_PIN_CLEAR: u8 = 0x50;
    /// Set a control pin (`wValue` = pin).
    pub const REQ_PIN_SET: u8 = 0x51;
    /// Channel mode (`wValue` = channel, `wIndex` = mode).
    pub const REQ_SET_MODE: u8 = 0x53;
    /// Read the current USB frame number (`u16` little endian).
    pub const REQ_FRAME: u8 = 0x6F;
    /// Start (`wValue` = period, `wIndex` = start frame) or stop (`0, 0`).
    pub const REQ_START: u8 = 0xC5;

    /// Pin enabling the output stages.
    pub const PIN_OUTPUT_ENABLE: u16 = 32;
    /// Timer clock.
    pub const CLOCK_HZ: f64 = 48e6;
    /// Shortest timer period (200 kS/s).
    pub const MIN_PERIOD: u16 = 240;
    /// Frames between `sync` and the synchronized start.
    pub const START_DELAY_FRAMES: u16 = 20;

    const FULL_SCALE: f64 = 65535.0;

    /// Code for a voltage.
    pub fn voltage_code(volts: f64) -> u16 {
        (volts / 5.0 * FULL_SCALE).round().clamp(0.0, FULL_SCALE) as u16
    }

    /// Code for a current.
    pub fn current_code(amps: f64) -> u16 {
        (FULL_SCALE * (0.4 + 1.6 * amps)).round().clamp(0.0, FULL_SCALE) as u16
    }

    /// Voltage of a code.
    pub fn code_voltage(code: u16) -> f64 {
        f64::from(code) / FULL_SCALE * 5.0
    }

    /// Current of a code.
    pub fn code_current(code: u16) -> f64 {
        (f64::from(code) / FULL_SCALE - 0.4) / 1.6
    }

    /// Code of `region`, `tick` in a packet.
    pub fn read_code(packet: &[u8], region: usize, tick: usize) -> u16 {
        let at = (region * TICKS_PER_PACKET + tick) * 2;
        u16::from_be_bytes([packet[at], packet[at + 1]])
    }

    /// Store a code at `region`, `tick` in a packet.
    pub fn write_code(packet: &mut [u8], region: usize, tick: usize, code: u16) {
        let at = (region * TICKS_PER_PACKET + tick) * 2;
        packet[at..at + 2].copy_from_slice(&code.to_be_bytes());
    }
}

/// M1000 model state.
#[derive(Debug)]
pub(crate) struct M1000 {
    fw_version: String,
    hw_version: String,
    cal: M1000Calibration,
    period: u16,
    start_frame: AtomicU16,
}

impl M1000 {
    pub(crate) fn init(io: &Control<'_>) -> Result<Self> {
        let hw_version = optional(io.read_string(wire::REQ_INFO, 0, 0), "hardware version")?
            .unwrap_or_else(|| "unknown".to_string());
        let fw_version = optional(io.read_string(wire::REQ_INFO, 0, 1), "firmware version")?
            .unwrap_or_else(|| "unknown".to_string());

        let mut raw = [0u8; M1000_CAL_LEN];
        let cal = match optional(io.read(wire::REQ_CALIBRATION, 0, 0, &mut raw), "calibration")? {
            Some(len) => M1000Calibration::parse(&raw[..len.min(M1000_CAL_LEN)]).unwrap_or_else(|err| {
                warn!(error = %err, "running uncalibrated");
                M1000Calibration::identity()
            }),
            None => M1000Calibration::identity(),
        };

        Ok(Self {
            fw_version,
            hw_version,
            cal,
            period: 0,
            start_frame: AtomicU16::new(0),
        })
    }
}

impl Model for M1000 {
    fn device_info() -> &'static DeviceInfo {
        &M1000_DEVICE_INFO
    }

    fn channel_table() -> &'static [ChannelInfo; CHANNELS] {
        &M1000_CHANNELS
    }

    fn signal_table() -> &'static [[SignalInfo; SIGNALS_PER_CHANNEL]; CHANNELS] {
        &M1000_SIGNALS
    }

    fn default_rate(&self) -> u64 {
        M1000_DEFAULT_RATE
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
        self.cal.rows()
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
        let ideal = (wire::CLOCK_HZ / rate as f64).round();
        let period = ideal.clamp(f64::from(wire::MIN_PERIOD), f64::from(u16::MAX)) as u16;
        if f64::from(period) != ideal {
            warn!(requested = rate, period, "sample rate out of range, clamped");
        }
        self.period = period;
        Ok(wire::CLOCK_HZ / f64::from(period))
    }

    fn encode_value(&self, channel: usize, mode: Mode, value: f32) -> u16 {
        let value = f64::from(value);
        match mode {
            Mode::Svmi => wire::voltage_code(self.cal.source(channel, M1000CalEntry::SourceVoltage, value)),
            Mode::Simv => wire::current_code(self.cal.source(channel, M1000CalEntry::SourceCurrent, value)),
            // high impedance, the code is ignored
            Mode::Disabled => 0,
        }
    }

    fn write_out_packet(&self, _modes: [Mode; CHANNELS], codes: &[[u16; CHANNELS]], packet: &mut [u8]) {
        for (tick, pair) in codes.iter().take(wire::TICKS_PER_PACKET).enumerate() {
            for (channel, &code) in pair.iter().enumerate() {
                wire::write_code(packet, channel, tick, code);
            }
        }
    }

    fn decode_packet(&self, packet: &[u8], values: &mut Vec<[f32; 4]>) -> Result<()> {
        let cal = &self.cal;
        for tick in 0..wire::TICKS_PER_PACKET {
            let v = |ch: usize| {
                let raw = wire::code_voltage(wire::read_code(packet, ch * 2, tick));
                cal.measure(ch, M1000CalEntry::MeasureVoltage, raw) as f32
            };
            let i = |ch: usize| {
                let raw = wire::code_current(wire::read_code(packet, ch * 2 + 1, tick));
                cal.measure(ch, M1000CalEntry::MeasureCurrent, raw) as f32
            };
            values.push([v(0), i(0), v(1), i(1)]);
        }
        Ok(())
    }

    fn start_streaming(&self, io: &Control<'_>) -> Result<()> {
        io.write(wire::REQ_START, self.period, self.start_frame.load(Ordering::Relaxed))
    }

    fn stop_streaming(&self, io: &Control<'_>) -> Result<()> {
        self.start_frame.store(0, Ordering::Relaxed);
        io.write(wire::REQ_START, 0, 0)
    }

    fn apply_mode(&self, io: &Control<'_>, channel: usize, mode: Mode) -> Result<()> {
        io.write(wire::REQ_SET_MODE, channel as u16, mode.index() as u16)
    }

    fn added(&mut self, io: &Control<'_>) -> Result<()> {
        Ok(io.transport.set_alt_setting(0, 1)?)
    }

    fn removed(&mut self, io: &Control<'_>) -> Result<()> {
        Ok(io.transport.set_alt_setting(0, 0)?)
    }

    fn on(&self, io: &Control<'_>, modes: [Mode; CHANNELS]) -> Result<()> {
        for (channel, mode) in modes.into_iter().enumerate() {
            self.apply_mode(io, channel, mode)?;
        }
        io.write(wire::REQ_PIN_SET, wire::PIN_OUTPUT_ENABLE, 0)
    }

    fn sync(&self, io: &Control<'_>) -> Result<()> {
        let mut frame = [0u8; 2];
        io.read(wire::REQ_FRAME, 0, 0, &mut frame)?;
        let start = u16::from_le_bytes(frame).wrapping_add(wire::START_DELAY_FRAMES) & 0x07ff;
        self.start_frame.store(start, Ordering::Relaxed);
        debug!(start_frame = start, "synchronized start scheduled");
        Ok(())
    }
}
