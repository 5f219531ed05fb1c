//! Per-channel waveform generation and measurement delivery.
//!
//! A [`Signal`] is one sourceable / measurable quantity on a channel (the
//! voltage or the current). It carries two independent pieces of state:
//!
//! - a **source** producing the next output value each tick
//!   ([`Signal::get_sample`]), and
//! - a **sink** receiving each measured value ([`Signal::put_sample`]).
//!
//! The engine does no I/O and no locking of its own. The owning device wraps
//! its [`SignalBank`] in a mutex and consults it once per transfer block, so a
//! reconfiguration always lands between two ticks.
//!
//! # Example
//!
//! ```
//! use daq_driver_smu::device::cee::CEE_SIGNALS;
//! use daq_driver_smu::signal::{MeasureBuffer, SignalBank};
//!
//! # fn example() -> daq_driver_smu::Result<()> {
//! let mut bank = SignalBank::new(&CEE_SIGNALS);
//! let voltage = bank.signal_mut(0, 0)?;
//! voltage.source_square(0.0, 5.0, 100.0, 0.5, 0.0)?;
//!
//! let captured = MeasureBuffer::new(1000);
//! voltage.measure_buffer(captured.clone(), 1000);
//! # Ok(())
//! # }
//! ```

use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, SmuError};
use crate::info::SignalInfo;

/// Number of channels on every supported model.
pub const CHANNELS: usize = 2;
/// Number of signals per channel (voltage, current).
pub const SIGNALS_PER_CHANNEL: usize = 2;

/// Caller-supplied source: maps a tick index to an output value.
pub type SourceFn = Box<dyn FnMut(u64) -> f32 + Send>;

/// Caller-supplied sink: receives each measured value.
///
/// Runs on the session's background thread and must return promptly; a
/// blocking callback stalls the whole device's sample stream.
pub type SinkFn = Box<dyn FnMut(f32) + Send>;

/// Source variant currently driving a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Fixed value
    Constant,
    /// Two-level square wave
    Square,
    /// Descending ramp
    Sawtooth,
    /// Ten-step quantized ramp
    Stairstep,
    /// Cosine around a center value
    Sine,
    /// Symmetric triangle
    Triangle,
    /// Shared sample buffer
    Buffer,
    /// Caller callback
    Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Square,
    Sawtooth,
    Stairstep,
    Sine,
    Triangle,
}

enum Source {
    Constant(f32),
    Periodic {
        shape: Shape,
        v1: f32,
        v2: f32,
        period: f64,
        duty: f64,
        // running accumulator in ticks, kept in [0, period)
        phase: f64,
    },
    Buffer {
        samples: Arc<[f32]>,
        index: usize,
        repeat: bool,
    },
    Callback {
        func: SourceFn,
        index: u64,
    },
}

/// Caller-owned storage that a signal fills with measured values.
///
/// Cloning yields another handle to the same storage, so the caller keeps one
/// clone and passes the other to [`Signal::measure_buffer`].
#[derive(Clone, Default)]
pub struct MeasureBuffer {
    inner: Arc<Mutex<MeasureStorage>>,
}

#[derive(Default)]
struct MeasureStorage {
    data: Vec<f32>,
    written: usize,
}

impl MeasureBuffer {
    /// Allocate a zeroed buffer of `len` samples.
    pub fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MeasureStorage {
                data: vec![0.0; len],
                written: 0,
            })),
        }
    }

    /// Capacity in samples.
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// Whether the buffer has zero capacity.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples written since the buffer was attached.
    pub fn written(&self) -> usize {
        self.inner.lock().written
    }

    /// Copy of the full buffer contents.
    pub fn snapshot(&self) -> Vec<f32> {
        self.inner.lock().data.clone()
    }

    fn reset(&self) {
        self.inner.lock().written = 0;
    }

    fn write(&self, position: usize, value: f32) -> bool {
        let mut storage = self.inner.lock();
        match storage.data.get_mut(position) {
            Some(slot) => {
                *slot = value;
                storage.written += 1;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for MeasureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.inner.lock();
        f.debug_struct("MeasureBuffer")
            .field("len", &storage.data.len())
            .field("written", &storage.written)
            .finish()
    }
}

enum Sink {
    None,
    Buffer {
        buffer: MeasureBuffer,
        position: usize,
        remaining: usize,
    },
    Callback(SinkFn),
}

/// One voltage or current endpoint of a channel.
pub struct Signal {
    info: &'static SignalInfo,
    source: Source,
    sink: Sink,
    latest: f32,
}

impl Signal {
    /// Create a signal with a constant-zero source and no sink.
    pub(crate) fn new(info: &'static SignalInfo) -> Self {
        Self {
            info,
            source: Source::Constant(0.0),
            sink: Sink::None,
            latest: 0.0,
        }
    }

    /// Descriptor of this signal.
    pub fn info(&self) -> &'static SignalInfo {
        self.info
    }

    /// Variant of the active source.
    pub fn source_kind(&self) -> SourceKind {
        match &self.source {
            Source::Constant(_) => SourceKind::Constant,
            Source::Periodic { shape, .. } => match shape {
                Shape::Square => SourceKind::Square,
                Shape::Sawtooth => SourceKind::Sawtooth,
                Shape::Stairstep => SourceKind::Stairstep,
                Shape::Sine => SourceKind::Sine,
                Shape::Triangle => SourceKind::Triangle,
            },
            Source::Buffer { .. } => SourceKind::Buffer,
            Source::Callback { .. } => SourceKind::Callback,
        }
    }

    /// Output a fixed value every tick.
    pub fn source_constant(&mut self, value: f32) {
        self.source = Source::Constant(value);
    }

    /// Output `v1` for the first `duty` fraction of each period, then `v2`.
    pub fn source_square(
        &mut self,
        v1: f32,
        v2: f32,
        period: f64,
        duty: f64,
        phase: f64,
    ) -> Result<()> {
        if !duty.is_finite() {
            return Err(SmuError::invalid(format!("duty cycle must be finite, got {duty}")));
        }
        self.set_periodic(Shape::Square, v1, v2, period, duty, phase)
    }

    /// Ramp from `v2` down towards `v1` once per period.
    pub fn source_sawtooth(&mut self, v1: f32, v2: f32, period: f64, phase: f64) -> Result<()> {
        self.set_periodic(Shape::Sawtooth, v1, v2, period, 0.0, phase)
    }

    /// Sawtooth quantized to ten steps per period.
    pub fn source_stairstep(&mut self, v1: f32, v2: f32, period: f64, phase: f64) -> Result<()> {
        self.set_periodic(Shape::Stairstep, v1, v2, period, 0.0, phase)
    }

    /// `center ± amplitude` cosine, peak at phase 0.
    pub fn source_sine(
        &mut self,
        center: f32,
        amplitude: f32,
        period: f64,
        phase: f64,
    ) -> Result<()> {
        self.set_periodic(Shape::Sine, center, amplitude, period, 0.0, phase)
    }

    /// Triangle between `v1` and `v1 + |v2 - v1|`, lowest at mid-period.
    pub fn source_triangle(&mut self, v1: f32, v2: f32, period: f64, phase: f64) -> Result<()> {
        self.set_periodic(Shape::Triangle, v1, v2, period, 0.0, phase)
    }

    /// Play back `samples`, wrapping if `repeat` and holding the last value
    /// otherwise.
    pub fn source_buffer(&mut self, samples: impl Into<Arc<[f32]>>, repeat: bool) -> Result<()> {
        let samples = samples.into();
        if samples.is_empty() {
            return Err(SmuError::invalid("source buffer must not be empty"));
        }
        self.source = Source::Buffer {
            samples,
            index: 0,
            repeat,
        };
        Ok(())
    }

    /// Call `func(index)` every tick, `index` counting from zero.
    pub fn source_callback<F>(&mut self, func: F)
    where
        F: FnMut(u64) -> f32 + Send + 'static,
    {
        self.source = Source::Callback {
            func: Box::new(func),
            index: 0,
        };
    }

    /// Store measured values into `buffer`, at most `len` of them.
    ///
    /// Values beyond `len` (or beyond the buffer's capacity) are dropped.
    pub fn measure_buffer(&mut self, buffer: MeasureBuffer, len: usize) {
        buffer.reset();
        let remaining = len.min(buffer.len());
        self.sink = Sink::Buffer {
            buffer,
            position: 0,
            remaining,
        };
    }

    /// Pass every measured value to `func`.
    pub fn measure_callback<F>(&mut self, func: F)
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.sink = Sink::Callback(Box::new(func));
    }

    /// Stop delivering measured values.
    pub fn measure_none(&mut self) {
        self.sink = Sink::None;
    }

    /// Most recently measured value (0.0 before the first sample).
    pub fn measure_instantaneous(&self) -> f32 {
        self.latest
    }

    fn set_periodic(
        &mut self,
        shape: Shape,
        v1: f32,
        v2: f32,
        period: f64,
        duty: f64,
        phase: f64,
    ) -> Result<()> {
        if !period.is_finite() || period <= 0.0 {
            return Err(SmuError::invalid(format!(
                "period must be a positive number of samples, got {period}"
            )));
        }
        if !phase.is_finite() {
            return Err(SmuError::invalid(format!("phase must be finite, got {phase}")));
        }
        self.source = Source::Periodic {
            shape,
            v1,
            v2,
            period,
            duty,
            phase: phase.rem_euclid(period),
        };
        Ok(())
    }

    /// Produce the next output value.
    pub(crate) fn get_sample(&mut self) -> f32 {
        match &mut self.source {
            Source::Constant(value) => *value,

            Source::Buffer {
                samples,
                index,
                repeat,
            } => {
                if *index >= samples.len() {
                    if *repeat {
                        *index = 0;
                    } else {
                        return samples.last().copied().unwrap_or(0.0);
                    }
                }
                let value = samples[*index];
                *index += 1;
                value
            }

            Source::Callback { func, index } => {
                let value = func(*index);
                *index += 1;
                value
            }

            Source::Periodic {
                shape,
                v1,
                v2,
                period,
                duty,
                phase,
            } => {
                let mut norm = *phase / *period;
                if norm >= 1.0 {
                    norm -= 1.0;
                }
                *phase = (*phase + 1.0) % *period;

                let (v1, v2) = (f64::from(*v1), f64::from(*v2));
                let pkpk = v2 - v1;
                let value = match shape {
                    Shape::Square => {
                        if norm < *duty {
                            v1
                        } else {
                            v2
                        }
                    }
                    Shape::Sawtooth => v2 - norm * pkpk,
                    Shape::Stairstep => v2 - (norm * 10.0).floor() / 10.0 * pkpk,
                    // v1 = center, v2 = amplitude
                    Shape::Sine => v1 + v2 * (norm * 2.0 * PI).cos(),
                    Shape::Triangle => v1 + (1.0 - norm * 2.0).abs() * pkpk.abs(),
                };
                value as f32
            }
        }
    }

    /// Deliver one measured value.
    pub(crate) fn put_sample(&mut self, value: f32) {
        self.latest = value;
        match &mut self.sink {
            Sink::None => {}
            Sink::Buffer {
                buffer,
                position,
                remaining,
            } => {
                if *remaining > 0 && buffer.write(*position, value) {
                    *position += 1;
                    *remaining -= 1;
                }
            }
            Sink::Callback(func) => func(value),
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sink = match &self.sink {
            Sink::None => "none",
            Sink::Buffer { .. } => "buffer",
            Sink::Callback(_) => "callback",
        };
        f.debug_struct("Signal")
            .field("label", &self.info.label)
            .field("source", &self.source_kind())
            .field("sink", &sink)
            .field("latest", &self.latest)
            .finish()
    }
}

/// The fixed channel × signal array owned by a device.
///
/// Obtained through [`crate::device::SmuDevice::lock`]; hold the guard only
/// while changing sources or sinks.
#[derive(Debug)]
pub struct SignalBank {
    signals: [[Signal; SIGNALS_PER_CHANNEL]; CHANNELS],
}

impl SignalBank {
    /// Build a bank from a model's signal descriptor table.
    pub fn new(infos: &'static [[SignalInfo; SIGNALS_PER_CHANNEL]; CHANNELS]) -> Self {
        Self {
            signals: [
                [Signal::new(&infos[0][0]), Signal::new(&infos[0][1])],
                [Signal::new(&infos[1][0]), Signal::new(&infos[1][1])],
            ],
        }
    }

    /// Borrow a signal.
    pub fn signal(&self, channel: usize, signal: usize) -> Result<&Signal> {
        Self::check(channel, signal)?;
        Ok(&self.signals[channel][signal])
    }

    /// Mutably borrow a signal to change its source or sink.
    pub fn signal_mut(&mut self, channel: usize, signal: usize) -> Result<&mut Signal> {
        Self::check(channel, signal)?;
        Ok(&mut self.signals[channel][signal])
    }

    /// Both signals of a channel, in (voltage, current) order.
    pub(crate) fn channel_mut(&mut self, channel: usize) -> &mut [Signal; SIGNALS_PER_CHANNEL] {
        &mut self.signals[channel]
    }

    fn check(channel: usize, signal: usize) -> Result<()> {
        if channel >= CHANNELS {
            return Err(SmuError::InvalidChannel {
                channel,
                max: CHANNELS,
            });
        }
        if signal >= SIGNALS_PER_CHANNEL {
            return Err(SmuError::InvalidSignal {
                channel,
                signal,
                max: SIGNALS_PER_CHANNEL,
            });
        }
        Ok(())
    }
}
