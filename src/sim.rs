//! In-process simulated SMU.
//!
//! [`SimulatedSmu`] implements [`Transport`] for both hardware models. Each
//! channel drives a resistive load to ground, so what is sourced in one
//! transfer comes back as measurements in the matching inbound transfer:
//!
//! - SVMI: `v = source`, `i = v / load`
//! - SIMV: `i = source`, `v = i * load` (limited to 0..5 V)
//!
//! Transfers complete in submission order, only while the device clock runs
//! (after the model's start request). The simulator never paces itself to the
//! sample rate; a run completes as fast as the event loop drains it.
//!
//! Faults are injected with [`FaultScenario`]s. Counters in [`SimStats`]
//! expose what the driver did to the transport.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use daq_driver_smu::{config::PipelineConfig, device, sim::SimulatedSmu};
//!
//! # fn main() -> daq_driver_smu::Result<()> {
//! let sim = Arc::new(SimulatedSmu::cee("SIM-1").with_load(100.0));
//! let dev = device::probe(sim.clone(), &PipelineConfig::default())?;
//! assert_eq!(dev.info().label, "CEE");
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::device::calibration::{CeeCalibration, M1000CalEntry, M1000Calibration};
use crate::device::{cee, m1000};
use crate::info::Mode;
use crate::signal::CHANNELS;
use crate::transport::{
    Completion, ControlRequest, Direction, SubmitError, TransferId, TransferStatus, Transport,
    TransportError, UsbDescriptor,
};

/// Hardware model being simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// CEE
    Cee,
    /// ADALM1000
    M1000,
}

/// Injected fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultScenario {
    /// Disconnect once this many transfers have completed
    UnplugAfter {
        /// Completed transfers before the disconnect
        transfers: u64,
    },
    /// Stall every `nth` inbound transfer
    StallEvery {
        /// Period in inbound transfers
        nth: u64,
    },
    /// Time out every `nth` inbound transfer
    TimeoutEvery {
        /// Period in inbound transfers
        nth: u64,
    },
    /// Return half a block on every `nth` inbound transfer
    TruncateEvery {
        /// Period in inbound transfers
        nth: u64,
    },
    /// Report an unknown channel mode on every `nth` inbound transfer (CEE)
    CorruptModeEvery {
        /// Period in inbound transfers
        nth: u64,
    },
}

/// What the driver did to the simulated transport.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    /// Accepted bulk submissions
    pub submitted: u64,
    /// Transfers completed with data
    pub completed: u64,
    /// Transfers completed as cancelled
    pub cancelled: u64,
    /// Transfers completed with an error
    pub failed: u64,
    /// Submissions of a slot that was already in flight
    pub duplicate_submissions: u64,
    /// Submissions made while cancelled transfers were still pending
    pub submitted_after_cancel: u64,
    /// OUT transfers currently in flight
    pub in_flight_out: usize,
    /// IN transfers currently in flight
    pub in_flight_in: usize,
    /// Highest OUT in-flight count seen
    pub max_in_flight_out: usize,
    /// Highest IN in-flight count seen
    pub max_in_flight_in: usize,
    /// `clear_halt` calls
    pub halts_cleared: u64,
    /// Every control request, in order
    pub control_log: Vec<ControlRequest>,
}

impl SimStats {
    /// Transfers in flight in both directions.
    pub fn in_flight(&self) -> usize {
        self.in_flight_out + self.in_flight_in
    }

    /// Number of control requests with this `bRequest`.
    pub fn control_count(&self, request: u8) -> usize {
        self.control_log.iter().filter(|r| r.request == request).count()
    }
}

#[derive(Debug, Clone, Copy)]
struct Drive {
    mode: Mode,
    value: f64,
}

impl Default for Drive {
    fn default() -> Self {
        Self {
            mode: Mode::Disabled,
            value: 0.0,
        }
    }
}

#[derive(Debug)]
struct Pending {
    id: TransferId,
    buffer: BytesMut,
    cancelled: bool,
}

#[derive(Debug)]
struct SimState {
    cee_cal: CeeCalibration,
    m1000_cal: M1000Calibration,
    load_ohms: f64,
    faults: Vec<FaultScenario>,
    pending: VecDeque<Pending>,
    streaming: bool,
    unplugged: bool,
    draining: bool,
    modes: [Mode; CHANNELS],
    fifo: VecDeque<[Drive; CHANNELS]>,
    last: [Drive; CHANNELS],
    in_count: u64,
    done: u64,
    frame: u16,
    alt_setting: u8,
    outputs_enabled: bool,
    stats: SimStats,
}

/// A simulated device.
#[derive(Debug)]
pub struct SimulatedSmu {
    kind: SimKind,
    descriptor: UsbDescriptor,
    hw_version: String,
    fw_version: String,
    state: Mutex<SimState>,
    wake: Condvar,
}

impl SimulatedSmu {
    /// Simulated CEE.
    pub fn cee(serial: &str) -> Self {
        let (vendor_id, product_id) = cee::USB_IDS[0];
        Self::new(SimKind::Cee, vendor_id, product_id, serial)
    }

    /// Simulated ADALM1000.
    pub fn m1000(serial: &str) -> Self {
        let (vendor_id, product_id) = m1000::USB_IDS[0];
        Self::new(SimKind::M1000, vendor_id, product_id, serial)
    }

    fn new(kind: SimKind, vendor_id: u16, product_id: u16, serial: &str) -> Self {
        Self {
            kind,
            descriptor: UsbDescriptor {
                vendor_id,
                product_id,
                bcd_device: 0x0102,
                serial: serial.to_string(),
            },
            hw_version: "sim".to_string(),
            fw_version: "1.2".to_string(),
            state: Mutex::new(SimState {
                cee_cal: CeeCalibration::identity(),
                m1000_cal: M1000Calibration::identity(),
                load_ohms: 100.0,
                faults: Vec::new(),
                pending: VecDeque::new(),
                streaming: false,
                unplugged: false,
                draining: false,
                modes: [Mode::Disabled; CHANNELS],
                fifo: VecDeque::new(),
                last: [Drive::default(); CHANNELS],
                in_count: 0,
                done: 0,
                frame: 0,
                alt_setting: 0,
                outputs_enabled: false,
                stats: SimStats::default(),
            }),
            wake: Condvar::new(),
        }
    }

    /// Override the reported USB id.
    pub fn with_usb_id(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.descriptor.vendor_id = vendor_id;
        self.descriptor.product_id = product_id;
        self
    }

    /// Store a CEE calibration record; the simulated converters carry the
    /// errors it corrects.
    pub fn with_cee_calibration(self, cal: CeeCalibration) -> Self {
        self.state.lock().cee_cal = cal;
        self
    }

    /// Store an M1000 calibration record; the simulated converters carry the
    /// errors it corrects.
    pub fn with_m1000_calibration(self, cal: M1000Calibration) -> Self {
        self.state.lock().m1000_cal = cal;
        self
    }

    /// Load resistance in ohms on both channels.
    pub fn with_load(self, ohms: f64) -> Self {
        self.state.lock().load_ohms = ohms;
        self
    }

    /// Add a fault scenario.
    pub fn with_fault(self, fault: FaultScenario) -> Self {
        self.state.lock().faults.push(fault);
        self
    }

    /// Simulated model.
    pub fn kind(&self) -> SimKind {
        self.kind
    }

    /// Disconnect now. Pending transfers fail with [`TransportError::NoDevice`].
    pub fn unplug(&self) {
        self.state.lock().unplugged = true;
        self.wake.notify_all();
    }

    /// Whether the device clock is running.
    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    /// Current alternate setting of interface 0.
    pub fn alt_setting(&self) -> u8 {
        self.state.lock().alt_setting
    }

    /// Whether the output stages are enabled (M1000).
    pub fn outputs_enabled(&self) -> bool {
        self.state.lock().outputs_enabled
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    fn string_descriptor(&self, index: u16) -> Option<&str> {
        match index {
            0 => Some(&self.hw_version),
            1 => Some(&self.fw_version),
            _ => None,
        }
    }

    fn control_in(&self, st: &mut SimState, req: ControlRequest, data: &mut [u8]) -> Result<usize, TransportError> {
        let reply: Vec<u8> = match (self.kind, req.request) {
            (_, cee::wire::REQ_INFO) => self
                .string_descriptor(req.index)
                .ok_or(TransportError::Stall)?
                .as_bytes()
                .to_vec(),
            (SimKind::Cee, cee::wire::REQ_TIMING) => {
                let mut v = cee::wire::DEFAULT_PER_NS.to_le_bytes().to_vec();
                v.extend_from_slice(&cee::wire::DEFAULT_MIN_PER.to_le_bytes());
                v
            }
            (SimKind::Cee, cee::wire::REQ_CALIBRATION) => st.cee_cal.to_bytes().to_vec(),
            (SimKind::M1000, m1000::wire::REQ_CALIBRATION) => st.m1000_cal.to_bytes().to_vec(),
            (SimKind::M1000, m1000::wire::REQ_FRAME) => st.frame.to_le_bytes().to_vec(),
            _ => return Err(TransportError::Stall),
        };
        let len = reply.len().min(data.len());
        data[..len].copy_from_slice(&reply[..len]);
        Ok(len)
    }

    fn control_out(&self, st: &mut SimState, req: ControlRequest) -> Result<usize, TransportError> {
        match (self.kind, req.request) {
            (SimKind::Cee, cee::wire::REQ_START) | (SimKind::M1000, m1000::wire::REQ_START) => {
                st.streaming = req.value != 0;
                if st.streaming {
                    st.fifo.clear();
                }
                debug!(streaming = st.streaming, period = req.value, "sim clock");
            }
            (SimKind::Cee, cee::wire::REQ_CURRENT_LIMIT) => {}
            (SimKind::M1000, m1000::wire::REQ_SET_MODE) => {
                let channel = usize::from(req.value);
                let mode = Mode::from_index(channel, u32::from(req.index))
                    .map_err(|_| TransportError::Stall)?;
                *st.modes.get_mut(channel).ok_or(TransportError::Stall)? = mode;
            }
            (SimKind::M1000, m1000::wire::REQ_PIN_SET) => st.outputs_enabled = true,
            (SimKind::M1000, m1000::wire::REQ_PIN_CLEAR) => st.outputs_enabled = false,
            _ => return Err(TransportError::Stall),
        }
        Ok(0)
    }
}

impl SimState {
    fn every(&self, pick: impl Fn(&FaultScenario) -> Option<u64>) -> bool {
        self.faults
            .iter()
            .filter_map(pick)
            .any(|nth| nth > 0 && self.in_count % nth == 0)
    }

    fn unplug_due(&self) -> bool {
        self.faults.iter().any(|f| match f {
            FaultScenario::UnplugAfter { transfers } => self.done >= *transfers,
            _ => false,
        })
    }

    fn respond(&self, drive: Drive) -> (f64, f64) {
        let load = self.load_ohms;
        match drive.mode {
            Mode::Disabled => (0.0, 0.0),
            Mode::Svmi => {
                let v = drive.value.clamp(0.0, 5.0);
                (v, v / load)
            }
            Mode::Simv => {
                let v = drive.value * load;
                if (0.0..=5.0).contains(&v) {
                    (v, drive.value)
                } else {
                    let v = v.clamp(0.0, 5.0);
                    (v, v / load)
                }
            }
        }
    }

    fn next_tick(&mut self) -> [Drive; CHANNELS] {
        if let Some(tick) = self.fifo.pop_front() {
            self.last = tick;
        }
        self.last
    }

    fn accept_out(&mut self, kind: SimKind, data: &[u8]) {
        match kind {
            SimKind::Cee => {
                for packet in data.chunks_exact(cee::wire::OUT_PACKET_LEN) {
                    let (raw_modes, codes) = cee::wire::decode_out_packet(packet);
                    let modes = [0, 1].map(|ch| {
                        Mode::from_index(ch, u32::from(raw_modes[ch])).unwrap_or(Mode::Disabled)
                    });
                    self.modes = modes;
                    for pair in codes {
                        let tick = [0, 1].map(|ch| Drive {
                            mode: modes[ch],
                            value: match modes[ch] {
                                Mode::Svmi => cee::wire::dac_voltage(pair[ch]),
                                Mode::Simv => cee::wire::dac_current(pair[ch]) * self.cee_cal.gain(ch),
                                Mode::Disabled => 0.0,
                            },
                        });
                        self.fifo.push_back(tick);
                    }
                }
            }
            SimKind::M1000 => {
                use m1000::wire::{code_current, code_voltage, read_code, OUT_PACKET_LEN, TICKS_PER_PACKET};
                for packet in data.chunks_exact(OUT_PACKET_LEN) {
                    for t in 0..TICKS_PER_PACKET {
                        let tick = [0, 1].map(|ch| {
                            let code = read_code(packet, ch, t);
                            let mode = self.modes[ch];
                            let value = match mode {
                                Mode::Svmi => self.m1000_cal.actual_output(
                                    ch,
                                    M1000CalEntry::SourceVoltage,
                                    code_voltage(code),
                                ),
                                Mode::Simv => self.m1000_cal.actual_output(
                                    ch,
                                    M1000CalEntry::SourceCurrent,
                                    code_current(code),
                                ),
                                Mode::Disabled => 0.0,
                            };
                            Drive { mode, value }
                        });
                        self.fifo.push_back(tick);
                    }
                }
            }
        }
    }

    fn produce_in(&mut self, kind: SimKind, data: &mut [u8], corrupt: bool) {
        match kind {
            SimKind::Cee => {
                use cee::wire::{adc_current_code, adc_voltage_code, encode_in_packet, IN_PACKET_LEN, TICKS_PER_PACKET};
                for packet in data.chunks_exact_mut(IN_PACKET_LEN) {
                    let mut codes = [[0i16; 4]; TICKS_PER_PACKET];
                    let mut modes = self.modes;
                    for (t, code) in codes.iter_mut().enumerate() {
                        let tick = self.next_tick();
                        if t == 0 {
                            modes = tick.map(|d| d.mode);
                        }
                        for ch in 0..CHANNELS {
                            let (v, i) = self.respond(tick[ch]);
                            let cal = &self.cee_cal;
                            code[ch * 2] = adc_voltage_code(v).saturating_add(i16::from(cal.offset_v[ch]));
                            code[ch * 2 + 1] =
                                adc_current_code(i / cal.gain(ch)).saturating_add(i16::from(cal.offset_i[ch]));
                        }
                    }
                    let mut raw_modes = modes.map(|m| m.index() as u8);
                    if corrupt {
                        raw_modes[1] = 7;
                    }
                    encode_in_packet(raw_modes, 0, &codes, packet);
                }
            }
            SimKind::M1000 => {
                use m1000::wire::{current_code, voltage_code, write_code, IN_PACKET_LEN, TICKS_PER_PACKET};
                for packet in data.chunks_exact_mut(IN_PACKET_LEN) {
                    for t in 0..TICKS_PER_PACKET {
                        let tick = self.next_tick();
                        for ch in 0..CHANNELS {
                            let (v, i) = self.respond(tick[ch]);
                            let cal = &self.m1000_cal;
                            let raw_v = cal.raw_reading(ch, M1000CalEntry::MeasureVoltage, v);
                            let raw_i = cal.raw_reading(ch, M1000CalEntry::MeasureCurrent, i);
                            write_code(packet, ch * 2, t, voltage_code(raw_v));
                            write_code(packet, ch * 2 + 1, t, current_code(raw_i));
                        }
                    }
                }
            }
        }
    }

    /// Finish one pending transfer, or hand it back if the clock is stopped.
    fn process(&mut self, kind: SimKind, mut p: Pending) -> Result<Completion, Pending> {
        if p.cancelled {
            self.stats.cancelled += 1;
            return Ok(self.finish(p, TransferStatus::Cancelled));
        }
        if !self.unplugged && self.unplug_due() {
            debug!(after = self.done, "sim unplugged");
            self.unplugged = true;
        }
        if self.unplugged {
            self.stats.failed += 1;
            return Ok(self.finish(p, TransferStatus::Failed(TransportError::NoDevice)));
        }
        if !self.streaming {
            return Err(p);
        }

        match p.id.direction {
            Direction::Out => self.accept_out(kind, &p.buffer),
            Direction::In => {
                self.in_count += 1;
                let stall = self.every(|f| match f {
                    FaultScenario::StallEvery { nth } => Some(*nth),
                    _ => None,
                });
                let timeout = self.every(|f| match f {
                    FaultScenario::TimeoutEvery { nth } => Some(*nth),
                    _ => None,
                });
                let truncate = self.every(|f| match f {
                    FaultScenario::TruncateEvery { nth } => Some(*nth),
                    _ => None,
                });
                let corrupt = self.every(|f| match f {
                    FaultScenario::CorruptModeEvery { nth } => Some(*nth),
                    _ => None,
                });

                // samples of a failed transfer are lost on the device too
                self.produce_in(kind, &mut p.buffer, corrupt);
                if stall || timeout {
                    self.stats.failed += 1;
                    let error = if stall {
                        TransportError::Stall
                    } else {
                        TransportError::Timeout
                    };
                    return Ok(self.finish(p, TransferStatus::Failed(error)));
                }
                if truncate {
                    let half = p.buffer.len() / 2;
                    p.buffer.truncate(half);
                }
            }
        }

        self.done += 1;
        self.stats.completed += 1;
        Ok(self.finish(p, TransferStatus::Completed))
    }

    fn finish(&mut self, p: Pending, status: TransferStatus) -> Completion {
        match p.id.direction {
            Direction::Out => self.stats.in_flight_out -= 1,
            Direction::In => self.stats.in_flight_in -= 1,
        }
        trace!(direction = %p.id.direction, slot = p.id.slot, ?status, "sim completion");
        Completion {
            id: p.id,
            status,
            buffer: p.buffer,
        }
    }
}

impl Transport for SimulatedSmu {
    fn descriptor(&self) -> &UsbDescriptor {
        &self.descriptor
    }

    fn control_transfer(
        &self,
        request: ControlRequest,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut st = self.state.lock();
        st.stats.control_log.push(request);
        if st.unplugged {
            return Err(TransportError::NoDevice);
        }
        if request.is_in() {
            self.control_in(&mut st, request, data)
        } else {
            self.control_out(&mut st, request)
        }
    }

    fn submit_bulk(
        &self,
        id: TransferId,
        _endpoint: u8,
        buffer: BytesMut,
        _timeout: Duration,
    ) -> Result<(), SubmitError> {
        let mut st = self.state.lock();
        if st.unplugged {
            return Err(SubmitError {
                error: TransportError::NoDevice,
                buffer,
            });
        }
        if st.pending.iter().any(|p| p.id == id) {
            st.stats.duplicate_submissions += 1;
            return Err(SubmitError {
                error: TransportError::Busy,
                buffer,
            });
        }
        if st.draining {
            st.stats.submitted_after_cancel += 1;
        }

        let stats = &mut st.stats;
        stats.submitted += 1;
        match id.direction {
            Direction::Out => {
                stats.in_flight_out += 1;
                stats.max_in_flight_out = stats.max_in_flight_out.max(stats.in_flight_out);
            }
            Direction::In => {
                stats.in_flight_in += 1;
                stats.max_in_flight_in = stats.max_in_flight_in.max(stats.in_flight_in);
            }
        }
        st.pending.push_back(Pending {
            id,
            buffer,
            cancelled: false,
        });
        self.wake.notify_all();
        Ok(())
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        let pending = st
            .pending
            .iter_mut()
            .find(|p| p.id == id && !p.cancelled)
            .ok_or(TransportError::NotFound)?;
        pending.cancelled = true;
        st.draining = true;
        self.wake.notify_all();
        Ok(())
    }

    fn handle_events(
        &self,
        timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        let ready = |st: &SimState| {
            st.unplugged || (st.streaming && !st.pending.is_empty()) || st.pending.iter().any(|p| p.cancelled)
        };
        if !ready(&st) {
            self.wake.wait_for(&mut st, timeout.min(Duration::from_millis(1)));
        }
        st.frame = st.frame.wrapping_add(1) & 0x07ff;

        for _ in 0..st.pending.len() {
            let Some(p) = st.pending.pop_front() else {
                break;
            };
            match st.process(self.kind, p) {
                Ok(completion) => completions.push(completion),
                Err(p) => st.pending.push_back(p),
            }
        }
        if st.pending.is_empty() {
            st.draining = false;
        }
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        st.stats.halts_cleared += 1;
        trace!(endpoint, "sim halt cleared");
        Ok(())
    }

    fn set_alt_setting(&self, interface: u8, setting: u8) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        if st.unplugged {
            return Err(TransportError::NoDevice);
        }
        if interface != 0 {
            return Err(TransportError::Stall);
        }
        st.alt_setting = setting;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::REQUEST_TYPE_VENDOR_IN;

    #[test]
    fn test_unknown_control_request_stalls() {
        let sim = SimulatedSmu::cee("S");
        let req = ControlRequest {
            request_type: REQUEST_TYPE_VENDOR_IN,
            request: 0x42,
            value: 0,
            index: 0,
        };
        let mut buf = [0u8; 8];
        assert_eq!(
            sim.control_transfer(req, &mut buf, Duration::from_millis(10)),
            Err(TransportError::Stall)
        );
        assert_eq!(sim.stats().control_log.len(), 1);
    }

    #[test]
    fn test_transfers_wait_for_clock() {
        let sim = SimulatedSmu::cee("S");
        let buf = BytesMut::zeroed(cee::wire::IN_PACKET_LEN);
        sim.submit_bulk(TransferId::input(0), cee::wire::EP_IN, buf, Duration::from_secs(1))
            .unwrap();

        let mut done = Vec::new();
        sim.handle_events(Duration::from_millis(1), &mut done).unwrap();
        assert!(done.is_empty());

        sim.control_transfer(ControlRequest::vendor_out(cee::wire::REQ_START, 400, 1), &mut [], Duration::ZERO)
            .unwrap();
        sim.handle_events(Duration::from_millis(1), &mut done).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, TransferStatus::Completed);
        assert_eq!(sim.stats().in_flight(), 0);
    }

    #[test]
    fn test_cancel_and_duplicates() {
        let sim = SimulatedSmu::m1000("S");
        let id = TransferId::out(0);
        sim.submit_bulk(id, 0x02, BytesMut::zeroed(16), Duration::ZERO).unwrap();
        let dup = sim.submit_bulk(id, 0x02, BytesMut::zeroed(16), Duration::ZERO).unwrap_err();
        assert_eq!(dup.error, TransportError::Busy);
        assert_eq!(dup.buffer.len(), 16);

        sim.cancel_transfer(id).unwrap();
        assert_eq!(sim.cancel_transfer(id), Err(TransportError::NotFound));

        let mut done = Vec::new();
        sim.handle_events(Duration::from_millis(1), &mut done).unwrap();
        assert_eq!(done[0].status, TransferStatus::Cancelled);
        assert_eq!(sim.stats().duplicate_submissions, 1);
    }

    #[test]
    fn test_unplug_fails_everything() {
        let sim = SimulatedSmu::cee("S");
        sim.submit_bulk(TransferId::out(0), 0x02, BytesMut::zeroed(32), Duration::ZERO)
            .unwrap();
        sim.unplug();

        let mut done = Vec::new();
        sim.handle_events(Duration::from_millis(1), &mut done).unwrap();
        assert_eq!(done[0].status, TransferStatus::Failed(TransportError::NoDevice));
        let err = sim
            .submit_bulk(TransferId::out(0), 0x02, BytesMut::zeroed(32), Duration::ZERO)
            .unwrap_err();
        assert_eq!(err.error, TransportError::NoDevice);
    }
}
