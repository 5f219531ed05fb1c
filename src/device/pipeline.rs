//! Bulk transfer pipeline shared by all models.
//!
//! Each direction owns a fixed arena of [`Slot`]s. A slot is either idle
//! (buffer at home), in flight (buffer lent to the transport) or cancelling
//! (in flight, cancel requested). Completions address slots by index and
//! hand the buffer back, so a late completion can never touch a buffer twice:
//! a completion for an idle slot is logged and dropped.
//!
//! Counters, all in ticks:
//! - `out_sampleno`: ticks generated from sources and submitted
//! - `requested_in`: ticks requested through inbound submissions
//! - `in_sampleno`: ticks consumed (delivered, or dropped with a bad block)
//!
//! For a finite run of `n` ticks all three stop at `n`; sinks see exactly the
//! first `n` measured ticks.

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{Control, DeviceEvent, Model};
use crate::config::PipelineConfig;
use crate::error::{Result, SmuError};
use crate::info::Mode;
use crate::signal::{SignalBank, CHANNELS};
use crate::transport::{Completion, Direction, TransferId, TransferStatus, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    InFlight,
    Cancelling,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    buffer: Option<BytesMut>,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Self {
            state: SlotState::Idle,
            buffer: Some(BytesMut::with_capacity(capacity)),
        }
    }
}

/// Run state of one device's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    /// No run; every slot idle
    Stopped,
    /// Streaming
    Running,
    /// Cancel requested, waiting for in-flight slots to come home
    Cancelling,
}

pub(crate) struct Pipeline<M: Model> {
    pub(crate) model: M,
    config: PipelineConfig,
    pub(crate) modes: [Mode; CHANNELS],
    sample_rate: Option<f64>,
    packets_per_transfer: usize,
    out_slots: Vec<Slot>,
    in_slots: Vec<Slot>,
    codes: Vec<[u16; CHANNELS]>,
    decoded: Vec<[f32; 4]>,
    last_codes: [u16; CHANNELS],
    state: RunState,
    nsamples: u64,
    out_sampleno: u64,
    requested_in: u64,
    in_sampleno: u64,
    consecutive_errors: u32,
    completed_reported: bool,
}

impl<M: Model> Pipeline<M> {
    pub(crate) fn new(model: M, config: PipelineConfig) -> Self {
        let depth = config.transfers_in_flight;
        let out_len = model.out_packet_len();
        let in_len = model.in_packet_len();
        let tpp = model.ticks_per_packet();
        Self {
            model,
            config,
            modes: [Mode::Disabled; CHANNELS],
            sample_rate: None,
            packets_per_transfer: 1,
            out_slots: (0..depth).map(|_| Slot::new(out_len)).collect(),
            in_slots: (0..depth).map(|_| Slot::new(in_len)).collect(),
            codes: Vec::with_capacity(tpp),
            decoded: Vec::with_capacity(tpp),
            last_codes: [0; CHANNELS],
            state: RunState::Stopped,
            nsamples: 0,
            out_sampleno: 0,
            requested_in: 0,
            in_sampleno: 0,
            consecutive_errors: 0,
            completed_reported: false,
        }
    }

    pub(crate) fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn sample_rate(&self) -> Option<f64> {
        self.sample_rate
    }

    pub(crate) fn samples_consumed(&self) -> u64 {
        self.in_sampleno
    }

    pub(crate) fn packets_per_transfer(&self) -> usize {
        self.packets_per_transfer
    }

    fn ticks_per_transfer(&self) -> u64 {
        (self.packets_per_transfer * self.model.ticks_per_packet()) as u64
    }

    fn out_len(&self) -> usize {
        self.packets_per_transfer * self.model.out_packet_len()
    }

    fn in_len(&self) -> usize {
        self.packets_per_transfer * self.model.in_packet_len()
    }

    fn out_needed(&self) -> bool {
        self.nsamples == 0 || self.out_sampleno < self.nsamples
    }

    fn in_needed(&self) -> bool {
        self.nsamples == 0 || self.requested_in < self.nsamples
    }

    fn all_idle(&self) -> bool {
        self.out_slots
            .iter()
            .chain(self.in_slots.iter())
            .all(|s| s.state == SlotState::Idle)
    }

    pub(crate) fn ensure_stopped(&self, operation: &'static str, target: &str) -> Result<()> {
        if self.state == RunState::Stopped {
            Ok(())
        } else {
            Err(SmuError::Busy {
                operation,
                target: target.to_string(),
            })
        }
    }

    /// Apply a sample rate and size transfers for `buffer_time_ms` of signal.
    pub(crate) fn configure(&mut self, rate: u64) -> Result<f64> {
        if rate == 0 {
            return Err(SmuError::invalid("sample rate must be > 0"));
        }
        let achieved = self.model.configure(rate)?;
        let ticks = (self.config.buffer_time_secs() * achieved).ceil() as usize;
        let tpp = self.model.ticks_per_packet();
        self.packets_per_transfer = ticks.div_ceil(tpp).max(1);
        self.sample_rate = Some(achieved);

        let (out_len, in_len) = (self.out_len(), self.in_len());
        for slot in &mut self.out_slots {
            if let Some(buf) = slot.buffer.as_mut() {
                buf.reserve(out_len.saturating_sub(buf.len()));
            }
        }
        for slot in &mut self.in_slots {
            if let Some(buf) = slot.buffer.as_mut() {
                buf.reserve(in_len.saturating_sub(buf.len()));
            }
        }
        Ok(achieved)
    }

    /// Reset counters, prime both arenas and start the device clock.
    pub(crate) fn start(
        &mut self,
        io: &Control<'_>,
        bank: &Mutex<SignalBank>,
        nsamples: u64,
    ) -> Result<()> {
        self.nsamples = nsamples;
        self.out_sampleno = 0;
        self.requested_in = 0;
        self.in_sampleno = 0;
        self.consecutive_errors = 0;
        self.completed_reported = false;
        self.state = RunState::Running;

        let result = self.prime(io, bank);
        if let Err(err) = &result {
            warn!(error = %err, "start failed, cancelling");
            self.begin_cancel(io);
        }
        result
    }

    fn prime(&mut self, io: &Control<'_>, bank: &Mutex<SignalBank>) -> Result<()> {
        for slot in 0..self.out_slots.len() {
            if !self.out_needed() {
                break;
            }
            self.submit_out(io.transport, bank, slot)?;
        }
        for slot in 0..self.in_slots.len() {
            if !self.in_needed() {
                break;
            }
            self.submit_in(io.transport, slot)?;
        }
        self.model.start_streaming(io)?;
        debug!(
            nsamples = self.nsamples,
            out_in_flight = self.in_flight(Direction::Out),
            in_in_flight = self.in_flight(Direction::In),
            "run started"
        );
        Ok(())
    }

    fn in_flight(&self, direction: Direction) -> usize {
        let slots = match direction {
            Direction::Out => &self.out_slots,
            Direction::In => &self.in_slots,
        };
        slots.iter().filter(|s| s.state != SlotState::Idle).count()
    }

    fn submit_out(
        &mut self,
        transport: &dyn Transport,
        bank: &Mutex<SignalBank>,
        slot: usize,
    ) -> Result<()> {
        let Some(mut buf) = self.out_slots[slot].buffer.take() else {
            return Err(SmuError::Protocol {
                message: format!("OUT slot {slot} has no buffer"),
            });
        };
        let len = self.out_len();
        buf.resize(len, 0);
        self.fill_out(bank, &mut buf);

        match transport.submit_bulk(
            TransferId::out(slot),
            self.model.out_endpoint(),
            buf,
            self.config.transfer_timeout(),
        ) {
            Ok(()) => {
                self.out_slots[slot].state = SlotState::InFlight;
                Ok(())
            }
            Err(rejected) => {
                self.out_slots[slot].buffer = Some(rejected.buffer);
                Err(rejected.error.into())
            }
        }
    }

    fn fill_out(&mut self, bank: &Mutex<SignalBank>, buf: &mut BytesMut) {
        let tpp = self.model.ticks_per_packet();
        let packet_len = self.model.out_packet_len();
        let modes = self.modes;
        let mut bank = bank.lock();

        for packet in buf.chunks_exact_mut(packet_len) {
            self.codes.clear();
            for _ in 0..tpp {
                if self.nsamples == 0 || self.out_sampleno < self.nsamples {
                    for (channel, &mode) in modes.iter().enumerate() {
                        let signals = bank.channel_mut(channel);
                        let value = match mode {
                            Mode::Svmi => signals[0].get_sample(),
                            Mode::Simv => signals[1].get_sample(),
                            Mode::Disabled => 0.0,
                        };
                        self.last_codes[channel] = self.model.encode_value(channel, mode, value);
                    }
                    self.out_sampleno += 1;
                }
                self.codes.push(self.last_codes);
            }
            self.model.write_out_packet(modes, &self.codes, packet);
        }
    }

    fn submit_in(&mut self, transport: &dyn Transport, slot: usize) -> Result<()> {
        let Some(mut buf) = self.in_slots[slot].buffer.take() else {
            return Err(SmuError::Protocol {
                message: format!("IN slot {slot} has no buffer"),
            });
        };
        buf.resize(self.in_len(), 0);

        match transport.submit_bulk(
            TransferId::input(slot),
            self.model.in_endpoint(),
            buf,
            self.config.transfer_timeout(),
        ) {
            Ok(()) => {
                self.in_slots[slot].state = SlotState::InFlight;
                self.requested_in += self.ticks_per_transfer();
                if self.nsamples > 0 {
                    self.requested_in = self.requested_in.min(self.nsamples);
                }
                Ok(())
            }
            Err(rejected) => {
                self.in_slots[slot].buffer = Some(rejected.buffer);
                Err(rejected.error.into())
            }
        }
    }

    /// Request cancellation of every in-flight slot. Idempotent.
    pub(crate) fn begin_cancel(&mut self, io: &Control<'_>) {
        if self.state != RunState::Running {
            return;
        }
        self.state = RunState::Cancelling;

        for (direction, slots) in [
            (Direction::Out, &mut self.out_slots),
            (Direction::In, &mut self.in_slots),
        ] {
            for (index, slot) in slots.iter_mut().enumerate() {
                if slot.state != SlotState::InFlight {
                    continue;
                }
                slot.state = SlotState::Cancelling;
                let id = TransferId { direction, slot: index };
                if let Err(err) = io.transport.cancel_transfer(id) {
                    debug!(%direction, slot = index, error = %err, "cancel request failed");
                }
            }
        }

        if let Err(err) = self.model.stop_streaming(io) {
            debug!(error = %err, "stop request failed");
        }
        self.settle(io);
    }

    /// Process completions gathered from the transport.
    pub(crate) fn process(
        &mut self,
        io: &Control<'_>,
        bank: &Mutex<SignalBank>,
        completions: &mut Vec<Completion>,
        events: &mut Vec<DeviceEvent>,
    ) {
        for completion in completions.drain(..) {
            self.on_completion(io, bank, completion, events);
        }
        self.settle(io);
    }

    fn on_completion(
        &mut self,
        io: &Control<'_>,
        bank: &Mutex<SignalBank>,
        completion: Completion,
        events: &mut Vec<DeviceEvent>,
    ) {
        let Completion { id, status, buffer } = completion;
        let slots = match id.direction {
            Direction::Out => &mut self.out_slots,
            Direction::In => &mut self.in_slots,
        };
        let Some(slot) = slots.get_mut(id.slot) else {
            warn!(direction = %id.direction, slot = id.slot, "completion for unknown slot");
            return;
        };
        if slot.state == SlotState::Idle {
            warn!(direction = %id.direction, slot = id.slot, "completion for idle slot ignored");
            return;
        }

        let was_cancelling = slot.state == SlotState::Cancelling;
        slot.state = SlotState::Idle;
        slot.buffer = Some(buffer);

        if was_cancelling || self.state != RunState::Running {
            trace!(direction = %id.direction, slot = id.slot, ?status, "slot released");
            return;
        }

        match status {
            TransferStatus::Completed => {
                self.consecutive_errors = 0;
                let result = match id.direction {
                    Direction::In => self.on_in_completed(io.transport, bank, id.slot, events),
                    Direction::Out => self.resubmit_out(io.transport, bank, id.slot),
                };
                if let Err(err) = result {
                    self.fail(io, err, events);
                }
            }
            // not requested while running: retried like any transient loss
            TransferStatus::Cancelled => {
                self.on_failed(io, bank, id, TransportError::Cancelled, events)
            }
            TransferStatus::Failed(err) => self.on_failed(io, bank, id, err, events),
        }
    }

    fn on_in_completed(
        &mut self,
        transport: &dyn Transport,
        bank: &Mutex<SignalBank>,
        slot: usize,
        events: &mut Vec<DeviceEvent>,
    ) -> Result<()> {
        let ticks = self.ticks_per_transfer();
        let expected = self.in_len();
        let packet_len = self.model.in_packet_len();

        let decoded = match self.in_slots[slot].buffer.as_deref() {
            Some(data) if data.len() == expected => {
                self.decoded.clear();
                data.chunks_exact(packet_len)
                    .try_for_each(|packet| self.model.decode_packet(packet, &mut self.decoded))
            }
            Some(data) => Err(SmuError::Protocol {
                message: format!("IN block of {} bytes, expected {expected}", data.len()),
            }),
            None => Err(SmuError::Protocol {
                message: format!("IN slot {slot} has no buffer"),
            }),
        };

        match decoded {
            Ok(()) => {
                let remaining = if self.nsamples == 0 {
                    u64::MAX
                } else {
                    self.nsamples - self.in_sampleno
                };
                let deliver = (self.decoded.len() as u64).min(remaining) as usize;
                let mut bank = bank.lock();
                for values in &self.decoded[..deliver] {
                    for (channel, pair) in values.chunks_exact(2).enumerate() {
                        let signals = bank.channel_mut(channel);
                        signals[0].put_sample(pair[0]);
                        signals[1].put_sample(pair[1]);
                    }
                }
            }
            Err(err) => {
                warn!(slot, error = %err, "dropping inbound block");
                events.push(DeviceEvent::Protocol {
                    message: err.to_string(),
                });
            }
        }

        self.consume(ticks, events);
        if self.in_needed() {
            self.submit_in(transport, slot)?;
        }
        Ok(())
    }

    fn consume(&mut self, ticks: u64, events: &mut Vec<DeviceEvent>) {
        self.in_sampleno += ticks;
        if self.nsamples > 0 {
            self.in_sampleno = self.in_sampleno.min(self.nsamples);
        }
        events.push(DeviceEvent::Progress {
            samples: self.in_sampleno,
        });
        if self.nsamples > 0 && self.in_sampleno >= self.nsamples && !self.completed_reported {
            self.completed_reported = true;
            debug!(samples = self.in_sampleno, "run complete");
            events.push(DeviceEvent::Completed);
        }
    }

    fn resubmit_out(
        &mut self,
        transport: &dyn Transport,
        bank: &Mutex<SignalBank>,
        slot: usize,
    ) -> Result<()> {
        if self.out_needed() {
            self.submit_out(transport, bank, slot)?;
        }
        Ok(())
    }

    fn on_failed(
        &mut self,
        io: &Control<'_>,
        bank: &Mutex<SignalBank>,
        id: TransferId,
        err: TransportError,
        events: &mut Vec<DeviceEvent>,
    ) {
        if !err.is_transient() {
            self.fail(io, err.into(), events);
            return;
        }

        self.consecutive_errors += 1;
        if self.consecutive_errors > self.config.max_consecutive_errors {
            let message = format!(
                "{} consecutive transfer errors, last: {err}",
                self.consecutive_errors
            );
            self.fail(io, SmuError::Protocol { message }, events);
            return;
        }

        warn!(
            direction = %id.direction,
            slot = id.slot,
            error = %err,
            attempt = self.consecutive_errors,
            "transfer failed, resubmitting"
        );
        events.push(DeviceEvent::Transport { error: err.clone() });

        let endpoint = match id.direction {
            Direction::Out => self.model.out_endpoint(),
            Direction::In => self.model.in_endpoint(),
        };
        if err == TransportError::Stall {
            if let Err(clear) = io.transport.clear_halt(endpoint) {
                debug!(endpoint, error = %clear, "clear_halt failed");
            }
        }

        let result = match id.direction {
            Direction::Out => self.resubmit_out(io.transport, bank, id.slot),
            Direction::In => {
                // the block's ticks are lost
                self.consume(self.ticks_per_transfer(), events);
                if self.in_needed() {
                    self.submit_in(io.transport, id.slot)
                } else {
                    Ok(())
                }
            }
        };
        if let Err(err) = result {
            self.fail(io, err, events);
        }
    }

    fn fail(&mut self, io: &Control<'_>, err: SmuError, events: &mut Vec<DeviceEvent>) {
        if err.is_device_gone() {
            warn!("device disconnected");
            events.push(DeviceEvent::Removed);
        } else {
            warn!(error = %err, "run failed");
            events.push(DeviceEvent::Failed {
                message: err.to_string(),
            });
        }
        self.begin_cancel(io);
    }

    /// Move to `Stopped` once nothing is in flight.
    fn settle(&mut self, io: &Control<'_>) {
        if !self.all_idle() {
            return;
        }
        match self.state {
            RunState::Running if self.nsamples > 0 && self.in_sampleno >= self.nsamples => {
                if let Err(err) = self.model.stop_streaming(io) {
                    debug!(error = %err, "stop request failed");
                }
                self.state = RunState::Stopped;
                debug!(samples = self.in_sampleno, "pipeline stopped");
            }
            RunState::Cancelling => {
                self.state = RunState::Stopped;
                debug!(samples = self.in_sampleno, "pipeline drained");
            }
            _ => {}
        }
    }

    /// Transfers currently lent to the transport, per direction.
    pub(crate) fn outstanding(&self) -> (usize, usize) {
        (self.in_flight(Direction::Out), self.in_flight(Direction::In))
    }

    /// Convert a transport event-loop error into device events.
    pub(crate) fn on_event_error(
        &mut self,
        io: &Control<'_>,
        err: TransportError,
        events: &mut Vec<DeviceEvent>,
    ) {
        if err == TransportError::NoDevice {
            self.fail(io, err.into(), events);
        } else {
            warn!(error = %err, "event handling failed");
            events.push(DeviceEvent::Transport { error: err });
        }
    }

    #[cfg(test)]
    pub(crate) fn counters(&self) -> (u64, u64, u64) {
        (self.out_sampleno, self.requested_in, self.in_sampleno)
    }
}
