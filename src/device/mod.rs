//! SMU devices.
//!
//! [`SmuDevice`] is the capability set a session needs from a device. There
//! is one implementation per hardware model, chosen by [`probe`] from the USB
//! vendor/product id:
//!
//! | Model  | USB id                     | Ticks/packet | Default rate |
//! |--------|----------------------------|--------------|--------------|
//! | CEE    | `59e3:cee1`                | 10           | 10 kS/s      |
//! | M1000  | `0456:cee2`, `064b:784c`   | 256          | 100 kS/s     |
//!
//! All models share the same transfer [`pipeline`]; the model-specific part
//! (wire codec, timer setup, control requests) is a private `Model`.

pub mod calibration;
pub mod cee;
pub mod m1000;
pub(crate) mod pipeline;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, info_span, warn, Span};

use crate::config::PipelineConfig;
use crate::error::{Result, SmuError};
use crate::info::{ChannelInfo, DeviceInfo, Mode, SignalInfo};
use crate::signal::{SignalBank, CHANNELS, SIGNALS_PER_CHANNEL};
use crate::transport::{Completion, ControlRequest, Transport, TransportError};

use self::pipeline::{Pipeline, RunState};

/// Something a device reports from its completion handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Ticks consumed so far in the current run
    Progress {
        /// Consumed tick count
        samples: u64,
    },
    /// A finite run consumed all of its ticks
    Completed,
    /// An inbound block was malformed and dropped
    Protocol {
        /// What was wrong with it
        message: String,
    },
    /// A transfer failed transiently and was resubmitted
    Transport {
        /// The transport error
        error: TransportError,
    },
    /// The device disappeared; its run is being cancelled
    Removed,
    /// The run cannot continue; its run is being cancelled
    Failed {
        /// Why
        message: String,
    },
}

impl DeviceEvent {
    /// Whether the event ends the device's participation in the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Removed | Self::Failed { .. })
    }
}

/// Capability set of one source-measure unit.
///
/// All methods take `&self`; devices are shared between the caller and the
/// session's background thread as `Arc<dyn SmuDevice>`.
pub trait SmuDevice: Send + Sync {
    /// Model descriptor.
    fn info(&self) -> &'static DeviceInfo;

    /// Channel descriptor, `None` if out of range.
    fn channel_info(&self, channel: usize) -> Option<&'static ChannelInfo>;

    /// Signal descriptor, `None` if out of range.
    fn signal_info(&self, channel: usize, signal: usize) -> Option<&'static SignalInfo>;

    /// USB serial number.
    fn serial(&self) -> &str;

    /// Firmware version string.
    fn fw_version(&self) -> &str;

    /// Hardware version string.
    fn hw_version(&self) -> &str;

    /// Lock the signal bank to change sources and sinks.
    ///
    /// While the guard is held no transfer of this device is processed; hold
    /// it briefly.
    fn lock(&self) -> MutexGuard<'_, SignalBank>;

    /// Set the mode of `channel`. Not allowed while running.
    fn set_mode(&self, channel: usize, mode: Mode) -> Result<()>;

    /// Current mode of `channel`.
    fn mode(&self, channel: usize) -> Result<Mode>;

    /// The model's preferred sample rate.
    fn default_rate(&self) -> u64;

    /// Prepare for a synchronized multi-device start.
    fn sync(&self) -> Result<()>;

    /// Raw control transfer on the underlying device.
    fn ctrl_transfer(
        &self,
        request: ControlRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Whether a valid factory calibration record was read.
    fn is_calibrated(&self) -> bool;

    /// Calibration values as rows of numbers, model-specific.
    fn calibration(&self) -> Vec<Vec<f32>>;

    /// Select the output current limit in mA. Only models with a
    /// selectable limit accept it. Not allowed while running.
    fn set_current_limit(&self, milliamps: u32) -> Result<()>;

    /// The device joined a session.
    fn added(&self) -> Result<()>;

    /// The device left a session. Cancels a run in progress.
    fn removed(&self) -> Result<()>;

    /// Apply a sample rate. Returns the rate the hardware timer achieves.
    fn configure(&self, sample_rate: u64) -> Result<f64>;

    /// Last achieved sample rate.
    fn sample_rate(&self) -> Option<f64>;

    /// Enable the output stages for the configured modes.
    fn on(&self) -> Result<()>;

    /// Put every channel into [`Mode::Disabled`].
    fn off(&self) -> Result<()>;

    /// Start streaming `nsamples` ticks (`0` = until cancelled).
    fn start_run(&self, nsamples: u64) -> Result<()>;

    /// Request cancellation of the current run. Returns immediately.
    ///
    /// Safe to call from a source or sink callback of the same device; the
    /// request is then applied once the running completion handler returns.
    fn cancel(&self);

    /// Wait up to `timeout` for transfer completions and process them.
    fn handle_events(&self, timeout: Duration, events: &mut Vec<DeviceEvent>);

    /// Whether no run is active and no transfer is in flight.
    fn is_idle(&self) -> bool;

    /// Ticks consumed in the current or last run.
    fn samples_consumed(&self) -> u64;
}

impl dyn SmuDevice {
    /// [`SmuDevice::set_mode`] with a raw mode index.
    pub fn set_mode_index(&self, channel: usize, index: u32) -> Result<()> {
        let max = self
            .channel_info(channel)
            .ok_or(SmuError::InvalidChannel {
                channel,
                max: self.info().channel_count,
            })?
            .mode_count as u32;
        if index >= max {
            return Err(SmuError::InvalidMode {
                channel,
                mode: index,
                max,
            });
        }
        self.set_mode(channel, Mode::from_index(channel, index)?)
    }
}

impl fmt::Debug for dyn SmuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmuDevice")
            .field("model", &self.info().label)
            .field("serial", &self.serial())
            .finish()
    }
}

/// Open a device of a supported model.
///
/// Reads version and calibration through control requests and sizes the
/// transfer pipeline for the model's default rate.
pub fn probe(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Result<Arc<dyn SmuDevice>> {
    let descriptor = transport.descriptor().clone();
    let id = (descriptor.vendor_id, descriptor.product_id);
    let span = info_span!("smu_device", serial = %descriptor.serial);

    let device: Arc<dyn SmuDevice> = if cee::USB_IDS.contains(&id) {
        let model = span.in_scope(|| cee::Cee::init(&Control::new(&*transport, config)))?;
        Arc::new(Device::new(transport, model, config.clone(), span)?)
    } else if m1000::USB_IDS.contains(&id) {
        let model = span.in_scope(|| m1000::M1000::init(&Control::new(&*transport, config)))?;
        Arc::new(Device::new(transport, model, config.clone(), span)?)
    } else {
        return Err(SmuError::UnsupportedDevice {
            vendor_id: id.0,
            product_id: id.1,
        });
    };

    info!(
        model = device.info().label,
        serial = device.serial(),
        fw = device.fw_version(),
        hw = device.hw_version(),
        calibrated = device.is_calibrated(),
        "device probed"
    );
    Ok(device)
}

/// Whether `probe` would accept this USB id.
pub fn is_supported(vendor_id: u16, product_id: u16) -> bool {
    let id = (vendor_id, product_id);
    cee::USB_IDS.contains(&id) || m1000::USB_IDS.contains(&id)
}

/// Control-request helper bound to one transport.
pub(crate) struct Control<'a> {
    pub(crate) transport: &'a dyn Transport,
    timeout: Duration,
}

impl<'a> Control<'a> {
    pub(crate) fn new(transport: &'a dyn Transport, config: &PipelineConfig) -> Self {
        Self {
            transport,
            timeout: config.control_timeout(),
        }
    }

    /// Vendor request without data stage.
    pub(crate) fn write(&self, request: u8, value: u16, index: u16) -> Result<()> {
        self.transport.control_transfer(
            ControlRequest::vendor_out(request, value, index),
            &mut [],
            self.timeout,
        )?;
        Ok(())
    }

    /// Vendor request reading into `data`. Returns the byte count.
    pub(crate) fn read(&self, request: u8, value: u16, index: u16, data: &mut [u8]) -> Result<usize> {
        Ok(self.transport.control_transfer(
            ControlRequest::vendor_in(request, value, index),
            data,
            self.timeout,
        )?)
    }

    /// Read a NUL-terminated string descriptor.
    pub(crate) fn read_string(&self, request: u8, value: u16, index: u16) -> Result<String> {
        let mut buf = [0u8; 64];
        let len = self.read(request, value, index, &mut buf)?;
        let raw = &buf[..len.min(buf.len())];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).trim().to_string())
    }
}

/// Keep going without an optional control read unless the device is gone.
pub(crate) fn optional<T>(result: Result<T>, what: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_device_gone() => Err(err),
        Err(err) => {
            warn!(error = %err, "{what} unavailable");
            Ok(None)
        }
    }
}

/// Model-specific half of a device.
pub(crate) trait Model: Send + 'static {
    fn device_info() -> &'static DeviceInfo;
    fn channel_table() -> &'static [ChannelInfo; CHANNELS];
    fn signal_table() -> &'static [[SignalInfo; SIGNALS_PER_CHANNEL]; CHANNELS];

    fn default_rate(&self) -> u64 {
        crate::config::DEFAULT_SAMPLE_RATE
    }
    fn fw_version(&self) -> &str;
    fn hw_version(&self) -> &str;
    fn is_calibrated(&self) -> bool;
    fn calibration_rows(&self) -> Vec<Vec<f32>>;

    fn ticks_per_packet(&self) -> usize;
    fn out_packet_len(&self) -> usize;
    fn in_packet_len(&self) -> usize;
    fn out_endpoint(&self) -> u8;
    fn in_endpoint(&self) -> u8;

    /// Program the timer for `rate`; returns the achieved rate.
    fn configure(&mut self, rate: u64) -> Result<f64>;
    /// DAC code for `value` on `channel` in `mode`.
    fn encode_value(&self, channel: usize, mode: Mode, value: f32) -> u16;
    fn write_out_packet(&self, modes: [Mode; CHANNELS], codes: &[[u16; CHANNELS]], packet: &mut [u8]);
    /// Append one calibrated `[a_v, a_i, b_v, b_i]` per tick.
    fn decode_packet(&self, packet: &[u8], values: &mut Vec<[f32; 4]>) -> Result<()>;

    fn start_streaming(&self, io: &Control<'_>) -> Result<()>;
    fn stop_streaming(&self, io: &Control<'_>) -> Result<()>;
    fn apply_mode(&self, _io: &Control<'_>, _channel: usize, _mode: Mode) -> Result<()> {
        Ok(())
    }
    fn added(&mut self, _io: &Control<'_>) -> Result<()> {
        Ok(())
    }
    fn removed(&mut self, _io: &Control<'_>) -> Result<()> {
        Ok(())
    }
    fn on(&self, _io: &Control<'_>, _modes: [Mode; CHANNELS]) -> Result<()> {
        Ok(())
    }
    fn sync(&self, _io: &Control<'_>) -> Result<()> {
        Ok(())
    }
    fn set_current_limit(&mut self, _io: &Control<'_>, _milliamps: u32) -> Result<()> {
        Err(SmuError::invalid(format!(
            "{} has no selectable current limit",
            Self::device_info().label
        )))
    }
}

/// A device of model `M`: identity, signal bank and transfer pipeline.
///
/// Lock order: `completions`, then `pipeline`, then `signals`.
///
/// Callbacks run with `pipeline` and `signals` held, so [`SmuDevice::cancel`]
/// never waits for `pipeline`: when it is busy the request is parked in
/// `cancel_pending` for the thread holding it.
pub(crate) struct Device<M: Model> {
    transport: Arc<dyn Transport>,
    config: PipelineConfig,
    serial: String,
    fw_version: String,
    hw_version: String,
    calibrated: bool,
    calibration: Vec<Vec<f32>>,
    default_rate: u64,
    span: Span,
    signals: Mutex<SignalBank>,
    pipeline: Mutex<Pipeline<M>>,
    completions: Mutex<Vec<Completion>>,
    cancel_pending: AtomicBool,
}

impl<M: Model> Device<M> {
    fn new(transport: Arc<dyn Transport>, model: M, config: PipelineConfig, span: Span) -> Result<Self> {
        let serial = transport.descriptor().serial.clone();
        let default_rate = model.default_rate();
        let device = Self {
            serial,
            fw_version: model.fw_version().to_string(),
            hw_version: model.hw_version().to_string(),
            calibrated: model.is_calibrated(),
            calibration: model.calibration_rows(),
            default_rate,
            span,
            signals: Mutex::new(SignalBank::new(M::signal_table())),
            completions: Mutex::new(Vec::with_capacity(2 * config.transfers_in_flight)),
            pipeline: Mutex::new(Pipeline::new(model, config.clone())),
            cancel_pending: AtomicBool::new(false),
            config,
            transport,
        };
        device.pipeline.lock().configure(default_rate)?;
        Ok(device)
    }

    fn control(&self) -> Control<'_> {
        Control::new(&*self.transport, &self.config)
    }

    /// Apply a cancel parked while `pipeline` was held elsewhere.
    fn apply_pending_cancel(&self, pipeline: &mut Pipeline<M>, io: &Control<'_>) {
        if self.cancel_pending.swap(false, Ordering::AcqRel) {
            debug!(samples = pipeline.samples_consumed(), "applying deferred cancel");
            pipeline.begin_cancel(io);
        }
    }

    fn check_channel(channel: usize) -> Result<()> {
        if channel >= CHANNELS {
            return Err(SmuError::InvalidChannel {
                channel,
                max: CHANNELS,
            });
        }
        Ok(())
    }
}

impl<M: Model> SmuDevice for Device<M> {
    fn info(&self) -> &'static DeviceInfo {
        M::device_info()
    }

    fn channel_info(&self, channel: usize) -> Option<&'static ChannelInfo> {
        M::channel_table().get(channel)
    }

    fn signal_info(&self, channel: usize, signal: usize) -> Option<&'static SignalInfo> {
        M::signal_table().get(channel)?.get(signal)
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn fw_version(&self) -> &str {
        &self.fw_version
    }

    fn hw_version(&self) -> &str {
        &self.hw_version
    }

    fn lock(&self) -> MutexGuard<'_, SignalBank> {
        self.signals.lock()
    }

    fn set_mode(&self, channel: usize, mode: Mode) -> Result<()> {
        Self::check_channel(channel)?;
        let _span = self.span.enter();
        let mut pipeline = self.pipeline.lock();
        pipeline.ensure_stopped("set_mode", &self.serial)?;
        pipeline.model.apply_mode(&self.control(), channel, mode)?;
        pipeline.modes[channel] = mode;
        debug!(channel, %mode, "mode set");
        Ok(())
    }

    fn mode(&self, channel: usize) -> Result<Mode> {
        Self::check_channel(channel)?;
        Ok(self.pipeline.lock().modes[channel])
    }

    fn default_rate(&self) -> u64 {
        self.default_rate
    }

    fn sync(&self) -> Result<()> {
        let pipeline = self.pipeline.lock();
        pipeline.model.sync(&self.control())
    }

    fn ctrl_transfer(
        &self,
        request: ControlRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self.transport.control_transfer(request, data, timeout)?)
    }

    fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    fn calibration(&self) -> Vec<Vec<f32>> {
        self.calibration.clone()
    }

    fn set_current_limit(&self, milliamps: u32) -> Result<()> {
        let _span = self.span.enter();
        let mut pipeline = self.pipeline.lock();
        pipeline.ensure_stopped("set_current_limit", &self.serial)?;
        pipeline.model.set_current_limit(&self.control(), milliamps)?;
        info!(milliamps, "current limit set");
        Ok(())
    }

    fn added(&self) -> Result<()> {
        let _span = self.span.enter();
        self.pipeline.lock().model.added(&self.control())?;
        info!("device added");
        Ok(())
    }

    fn removed(&self) -> Result<()> {
        let _span = self.span.enter();
        let io = self.control();
        let mut pipeline = self.pipeline.lock();
        pipeline.begin_cancel(&io);
        pipeline.model.removed(&io)?;
        info!("device removed");
        Ok(())
    }

    fn configure(&self, sample_rate: u64) -> Result<f64> {
        let _span = self.span.enter();
        let mut pipeline = self.pipeline.lock();
        pipeline.ensure_stopped("configure", &self.serial)?;
        let achieved = pipeline.configure(sample_rate)?;
        info!(
            requested = sample_rate,
            achieved,
            packets_per_transfer = pipeline.packets_per_transfer(),
            "configured"
        );
        Ok(achieved)
    }

    fn sample_rate(&self) -> Option<f64> {
        self.pipeline.lock().sample_rate()
    }

    fn on(&self) -> Result<()> {
        let pipeline = self.pipeline.lock();
        pipeline.ensure_stopped("on", &self.serial)?;
        pipeline.model.on(&self.control(), pipeline.modes)
    }

    fn off(&self) -> Result<()> {
        let _span = self.span.enter();
        let io = self.control();
        let mut pipeline = self.pipeline.lock();
        pipeline.ensure_stopped("off", &self.serial)?;
        for channel in 0..CHANNELS {
            pipeline.model.apply_mode(&io, channel, Mode::Disabled)?;
            pipeline.modes[channel] = Mode::Disabled;
        }
        debug!("outputs off");
        Ok(())
    }

    fn start_run(&self, nsamples: u64) -> Result<()> {
        let _span = self.span.enter();
        let mut pipeline = self.pipeline.lock();
        pipeline.ensure_stopped("start_run", &self.serial)?;
        if pipeline.sample_rate().is_none() {
            return Err(SmuError::invalid("device is not configured"));
        }
        self.cancel_pending.store(false, Ordering::Release);
        let io = self.control();
        pipeline.start(&io, &self.signals, nsamples)?;
        info!(nsamples, modes = ?pipeline.modes, "run started");
        // a source callback may already have asked to stop
        self.apply_pending_cancel(&mut pipeline, &io);
        Ok(())
    }

    fn cancel(&self) {
        let _span = self.span.enter();
        self.cancel_pending.store(true, Ordering::Release);
        let Some(mut pipeline) = self.pipeline.try_lock() else {
            debug!("pipeline busy, cancel deferred");
            return;
        };
        if pipeline.state() == RunState::Running {
            debug!(samples = pipeline.samples_consumed(), "cancelling run");
        }
        self.cancel_pending.store(false, Ordering::Release);
        pipeline.begin_cancel(&self.control());
    }

    fn handle_events(&self, timeout: Duration, events: &mut Vec<DeviceEvent>) {
        let _span = self.span.enter();
        let io = self.control();
        let mut completions = self.completions.lock();
        let polled = self.transport.handle_events(timeout, &mut completions);

        let mut pipeline = self.pipeline.lock();
        if let Err(err) = polled {
            pipeline.on_event_error(&io, err, events);
        }
        if !completions.is_empty() {
            pipeline.process(&io, &self.signals, &mut completions, events);
            if pipeline.state() != RunState::Stopped {
                let (out, inp) = pipeline.outstanding();
                if out > self.config.transfers_in_flight || inp > self.config.transfers_in_flight {
                    warn!(out, inp, "transfer pool overrun");
                }
            }
        }
        self.apply_pending_cancel(&mut pipeline, &io);
    }

    fn is_idle(&self) -> bool {
        self.pipeline.lock().state() == RunState::Stopped
    }

    fn samples_consumed(&self) -> u64 {
        self.pipeline.lock().samples_consumed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MeasureBuffer;
    use crate::sim::SimulatedSmu;
    use std::time::Instant;

    fn drive(device: &dyn SmuDevice, events: &mut Vec<DeviceEvent>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !device.is_idle() && Instant::now() < deadline {
            device.handle_events(Duration::from_millis(1), events);
        }
        assert!(device.is_idle(), "device did not stop");
    }

    #[test]
    fn test_probe_rejects_unknown_ids() {
        let sim = SimulatedSmu::cee("X1").with_usb_id(0x1234, 0x5678);
        let err = probe(Arc::new(sim), &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, SmuError::UnsupportedDevice { vendor_id: 0x1234, .. }));
        assert!(is_supported(0x59e3, 0xcee1));
        assert!(!is_supported(0x1234, 0x5678));
    }

    #[test]
    fn test_probe_reads_identity() {
        let sim = Arc::new(SimulatedSmu::cee("CEE-0001"));
        let device = probe(sim, &PipelineConfig::default()).unwrap();
        assert_eq!(device.serial(), "CEE-0001");
        assert_eq!(device.info().label, "CEE");
        assert_eq!(device.channel_info(1).map(|c| c.label), Some("B"));
        assert!(device.channel_info(2).is_none());
        assert!(device.signal_info(0, 2).is_none());
        assert!(!device.is_calibrated());
        assert!(device.is_idle());
    }

    #[test]
    fn test_set_mode_validation() {
        let device = probe(Arc::new(SimulatedSmu::cee("CEE-0002")), &PipelineConfig::default()).unwrap();
        assert!(matches!(
            device.set_mode(2, Mode::Svmi),
            Err(SmuError::InvalidChannel { channel: 2, .. })
        ));
        assert!(matches!(
            device.set_mode_index(0, 3),
            Err(SmuError::InvalidMode { mode: 3, .. })
        ));
        device.set_mode_index(1, 2).unwrap();
        assert_eq!(device.mode(1).unwrap(), Mode::Simv);
    }

    #[test]
    fn test_finite_run_delivers_exactly_n() {
        let sim = Arc::new(SimulatedSmu::cee("CEE-0003"));
        let device = probe(sim.clone(), &PipelineConfig::default()).unwrap();
        device.set_mode(0, Mode::Svmi).unwrap();
        device.configure(10_000).unwrap();

        let captured = MeasureBuffer::new(1000);
        {
            let mut bank = device.lock();
            bank.signal_mut(0, 0).unwrap().source_constant(2.0);
            bank.signal_mut(0, 0).unwrap().measure_buffer(captured.clone(), 1000);
        }

        let mut events = Vec::new();
        device.start_run(777).unwrap();
        assert!(matches!(device.set_mode(0, Mode::Simv), Err(SmuError::Busy { .. })));
        drive(&*device, &mut events);

        assert_eq!(captured.written(), 777);
        assert_eq!(device.samples_consumed(), 777);
        assert_eq!(events.iter().filter(|e| **e == DeviceEvent::Completed).count(), 1);
        assert!(sim.stats().max_in_flight_out <= PipelineConfig::default().transfers_in_flight);
        let values = captured.snapshot();
        assert!((values[500] - 2.0).abs() < 0.01, "got {}", values[500]);
    }

    #[test]
    fn test_current_limit_selects_trim() {
        let mut cal = calibration::CeeCalibration::new([0, 0], [0, 0], [100_000, 100_000]);
        cal.dac200 = [1200, 1100];
        cal.dac400 = [2400, 2300];
        let sim = Arc::new(SimulatedSmu::cee("CEE-0005").with_cee_calibration(cal));
        let device = probe(sim.clone(), &PipelineConfig::default()).unwrap();

        device.added().unwrap();
        device.set_current_limit(400).unwrap();
        assert!(device.set_current_limit(300).unwrap_err().is_validation());

        let writes: Vec<(u16, u16)> = sim
            .stats()
            .control_log
            .iter()
            .filter(|r| r.request == cee::wire::REQ_CURRENT_LIMIT)
            .map(|r| (r.value, r.index))
            .collect();
        assert_eq!(writes, [(1200, 1100), (2400, 2300)]);

        let m1k = probe(Arc::new(SimulatedSmu::m1000("M1K-0005")), &PipelineConfig::default()).unwrap();
        assert!(m1k.set_current_limit(200).unwrap_err().is_validation());
    }

    #[test]
    fn test_cancel_from_sink_callback() {
        let sim = Arc::new(SimulatedSmu::cee("CEE-0006"));
        let device = probe(sim.clone(), &PipelineConfig::default()).unwrap();
        device.configure(10_000).unwrap();

        let weak = Arc::downgrade(&device);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        device.lock().signal_mut(0, 0).unwrap().measure_callback(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 100 {
                if let Some(device) = weak.upgrade() {
                    device.cancel();
                }
            }
        });

        let mut events = Vec::new();
        device.start_run(0).unwrap();
        drive(&*device, &mut events);

        assert!(calls.load(Ordering::SeqCst) > 100);
        assert!(!events.contains(&DeviceEvent::Completed));
        assert_eq!(sim.stats().in_flight(), 0);
        assert!(!sim.is_streaming());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let sim = Arc::new(SimulatedSmu::cee("CEE-0004"));
        let device = probe(sim.clone(), &PipelineConfig::default()).unwrap();
        device.configure(10_000).unwrap();

        let mut events = Vec::new();
        device.start_run(0).unwrap();
        device.handle_events(Duration::from_millis(1), &mut events);
        device.cancel();
        device.cancel();
        drive(&*device, &mut events);
        device.cancel();

        let stats = sim.stats();
        assert_eq!(stats.submitted_after_cancel, 0);
        assert_eq!(stats.duplicate_submissions, 0);
        assert_eq!(stats.in_flight(), 0);
    }
}
