//! Multi-device acquisition session.
//!
//! A [`Session`] keeps two device sets:
//!
//! - **available**: every device handed to [`Session::attach`] by the hot-plug
//!   collaborator,
//! - **active**: the devices added to the session; these take part in runs,
//!   ordered by serial number.
//!
//! Runs follow the phase machine
//!
//! ```text
//! Idle ──configure──▶ Configured ──start──▶ Running ──▶ Cancelling ──▶ Idle
//! ```
//!
//! `Running` ends when the caller cancels, every device has finished a finite
//! run, or the last running device is removed or fails. `Cancelling` ends once
//! every device of the run is idle.
//!
//! While a run is active a background thread (`smu-session`) services every
//! device's transfer events. It runs under the session's
//! [`tracing::Dispatch`], so log output of a session can be routed without
//! touching process-wide state.
//!
//! Membership changes and run progress are published as [`SessionEvent`]s on a
//! broadcast channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, dispatcher, info, warn, Dispatch};

use crate::config::SmuConfig;
use crate::device::{self, DeviceEvent, SmuDevice};
use crate::error::{Result, SmuError};
use crate::transport::Transport;

/// Run phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No run; no rate applied yet
    Idle,
    /// Sample rate applied to the active devices
    Configured,
    /// Devices are streaming
    Running,
    /// Waiting for devices to drain
    Cancelling,
}

impl SessionPhase {
    fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }
}

/// Notifications published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A device became available
    DeviceAttached {
        /// Serial number
        serial: String,
    },
    /// A device is no longer available
    DeviceDetached {
        /// Serial number
        serial: String,
    },
    /// A device joined the active set
    DeviceAdded {
        /// Serial number
        serial: String,
    },
    /// A device left the active set; its transfers have drained
    DeviceRemoved {
        /// Serial number
        serial: String,
    },
    /// A device reported a problem
    DeviceError {
        /// Serial number
        serial: String,
        /// What happened
        message: String,
        /// Whether the device's run ended because of it
        fatal: bool,
    },
    /// A run started
    RunStarted {
        /// Requested ticks per device, `0` for continuous
        samples: u64,
    },
    /// Lowest tick count consumed by the running devices
    Progress {
        /// Consumed ticks
        samples: u64,
    },
    /// Every device finished its finite run
    RunCompleted {
        /// Lowest consumed tick count
        samples: u64,
    },
    /// The run was cancelled or lost all of its devices
    RunCancelled {
        /// Lowest consumed tick count
        samples: u64,
    },
}

#[derive(Debug)]
struct RunMember {
    serial: String,
    device: Arc<dyn SmuDevice>,
    consumed: u64,
    completed: bool,
    // removed by the caller, drains before DeviceRemoved
    leaving: bool,
    // removal reported by the device itself
    gone: bool,
    failed: bool,
}

impl RunMember {
    fn new(serial: String, device: Arc<dyn SmuDevice>) -> Self {
        Self {
            serial,
            device,
            consumed: 0,
            completed: false,
            leaving: false,
            gone: false,
            failed: false,
        }
    }

    /// Still counts towards the run's completion.
    fn participating(&self) -> bool {
        !(self.leaving || self.gone || self.failed)
    }
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    sample_rate: u64,
    available: BTreeMap<String, Arc<dyn SmuDevice>>,
    active: BTreeMap<String, Arc<dyn SmuDevice>>,
    running: Vec<RunMember>,
    cancel_requested: bool,
    // devices are being started without the state lock
    starting: bool,
    progress: u64,
    shutdown: bool,
}

impl SessionState {
    fn ensure_not_running(&self, operation: &'static str) -> Result<()> {
        if self.phase.is_active() || self.starting {
            return Err(SmuError::Busy {
                operation,
                target: "session".to_string(),
            });
        }
        Ok(())
    }

    fn min_consumed(&self) -> u64 {
        self.running
            .iter()
            .filter(|m| m.participating())
            .map(|m| m.consumed)
            .min()
            .unwrap_or(self.progress)
    }

    fn begin_cancel(&mut self) {
        if self.phase != SessionPhase::Running {
            return;
        }
        self.phase = SessionPhase::Cancelling;
        for member in &self.running {
            member.device.cancel();
        }
        debug!(devices = self.running.len(), "session cancelling");
    }
}

struct Shared {
    state: Mutex<SessionState>,
    finished: Condvar,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// A set of devices acquiring together.
pub struct Session {
    config: SmuConfig,
    dispatch: Dispatch,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a session logging to the current default subscriber.
    pub fn new(config: SmuConfig) -> Result<Self> {
        let dispatch = dispatcher::get_default(Dispatch::clone);
        Self::with_dispatch(config, dispatch)
    }

    /// Create a session whose operations and background thread log to
    /// `dispatch`.
    pub fn with_dispatch(config: SmuConfig, dispatch: Dispatch) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.session.event_capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                phase: SessionPhase::Idle,
                sample_rate: config.session.sample_rate,
                available: BTreeMap::new(),
                active: BTreeMap::new(),
                running: Vec::new(),
                cancel_requested: false,
                starting: false,
                progress: 0,
                shutdown: false,
            }),
            finished: Condvar::new(),
            events,
        });
        Ok(Self {
            config,
            dispatch,
            shared,
            worker: Mutex::new(None),
        })
    }

    fn scoped<R>(&self, f: impl FnOnce() -> R) -> R {
        dispatcher::with_default(&self.dispatch, f)
    }

    /// Receive session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Current run phase.
    pub fn phase(&self) -> SessionPhase {
        self.shared.state.lock().phase
    }

    /// Sample rate applied at the next start.
    pub fn sample_rate(&self) -> u64 {
        self.shared.state.lock().sample_rate
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &SmuConfig {
        &self.config
    }

    /// Make an opened device available. Probes the model behind `transport`.
    ///
    /// Attaching a serial that is already available returns the known device.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Result<Arc<dyn SmuDevice>> {
        self.scoped(|| {
            let serial = transport.descriptor().serial.clone();
            if let Some(known) = self.get_device(&serial) {
                debug!(serial = %serial, "device already attached");
                return Ok(known);
            }
            let device = device::probe(transport, &self.config.pipeline)?;
            self.shared
                .state
                .lock()
                .available
                .insert(serial.clone(), Arc::clone(&device));
            info!(serial = %serial, "device attached");
            self.shared.emit(SessionEvent::DeviceAttached { serial });
            Ok(device)
        })
    }

    /// The device with this serial is gone from the system.
    ///
    /// An active device is removed first, cancelling only its part of a run.
    pub fn detach(&self, serial: &str) -> Result<()> {
        self.scoped(|| {
            // the worker may already have dropped a device that vanished mid-run
            match self.remove_device(serial) {
                Ok(()) | Err(SmuError::DeviceNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
            let removed = self.shared.state.lock().available.remove(serial);
            if removed.is_none() {
                return Err(SmuError::DeviceNotFound {
                    serial: serial.to_string(),
                });
            }
            info!(serial, "device detached");
            self.shared.emit(SessionEvent::DeviceDetached {
                serial: serial.to_string(),
            });
            Ok(())
        })
    }

    /// Available device by serial.
    pub fn get_device(&self, serial: &str) -> Option<Arc<dyn SmuDevice>> {
        self.shared.state.lock().available.get(serial).cloned()
    }

    /// Every available device, ordered by serial.
    pub fn available_devices(&self) -> Vec<Arc<dyn SmuDevice>> {
        self.shared.state.lock().available.values().cloned().collect()
    }

    /// Devices taking part in runs, ordered by serial.
    pub fn active_devices(&self) -> Vec<Arc<dyn SmuDevice>> {
        self.shared.state.lock().active.values().cloned().collect()
    }

    /// Add an available device to the active set.
    ///
    /// During a run the device is prepared for the next run; the current one
    /// is not disturbed.
    pub fn add_device(&self, serial: &str) -> Result<Arc<dyn SmuDevice>> {
        self.scoped(|| {
            let mut st = self.shared.state.lock();
            if let Some(device) = st.active.get(serial) {
                return Ok(Arc::clone(device));
            }
            let device = st
                .available
                .get(serial)
                .cloned()
                .ok_or_else(|| SmuError::DeviceNotFound {
                    serial: serial.to_string(),
                })?;
            // still draining after leaving the current run
            if st.running.iter().any(|m| m.serial == serial) || !device.is_idle() {
                return Err(SmuError::Busy {
                    operation: "add_device",
                    target: serial.to_string(),
                });
            }

            device.added()?;
            if st.phase != SessionPhase::Idle {
                device.configure(st.sample_rate)?;
            }
            st.active.insert(serial.to_string(), Arc::clone(&device));
            drop(st);

            info!(serial, "device added to session");
            self.shared.emit(SessionEvent::DeviceAdded {
                serial: serial.to_string(),
            });
            Ok(device)
        })
    }

    /// Remove a device from the active set.
    ///
    /// If the device is part of a run, only its transfers are cancelled;
    /// [`SessionEvent::DeviceRemoved`] follows once they have drained.
    pub fn remove_device(&self, serial: &str) -> Result<()> {
        self.scoped(|| {
            let mut st = self.shared.state.lock();
            if st.starting {
                return Err(SmuError::Busy {
                    operation: "remove_device",
                    target: serial.to_string(),
                });
            }
            let device = st.active.remove(serial).ok_or_else(|| SmuError::DeviceNotFound {
                serial: serial.to_string(),
            })?;

            if let Some(member) = st.running.iter_mut().find(|m| m.serial == serial) {
                member.leaving = true;
                device.cancel();
                info!(serial, "device leaving run");
                return Ok(());
            }
            drop(st);

            if let Err(err) = device.removed() {
                warn!(serial, error = %err, "device removal hook failed");
            }
            self.shared.emit(SessionEvent::DeviceRemoved {
                serial: serial.to_string(),
            });
            Ok(())
        })
    }

    /// Apply `sample_rate` to every active device.
    pub fn configure(&self, sample_rate: u64) -> Result<()> {
        self.scoped(|| {
            let mut st = self.shared.state.lock();
            st.ensure_not_running("configure")?;
            if sample_rate == 0 {
                return Err(SmuError::invalid("sample rate must be positive"));
            }
            for (serial, device) in &st.active {
                let achieved = device.configure(sample_rate)?;
                debug!(serial = %serial, sample_rate, achieved, "device configured");
            }
            st.sample_rate = sample_rate;
            st.phase = SessionPhase::Configured;
            Ok(())
        })
    }

    /// Start streaming `nsamples` ticks on every active device (`0` runs until
    /// cancelled). Returns once all devices are started.
    pub fn start(&self, nsamples: u64) -> Result<()> {
        self.shared.state.lock().ensure_not_running("start")?;
        // the previous run's thread has already left its loop
        self.join_worker();
        self.scoped(|| {
            let (rate, from_idle, members) = {
                let mut st = self.shared.state.lock();
                st.ensure_not_running("start")?;
                if st.active.is_empty() {
                    return Err(SmuError::invalid("no devices in session"));
                }
                st.starting = true;
                let members: Vec<(String, Arc<dyn SmuDevice>)> = st
                    .active
                    .iter()
                    .map(|(serial, device)| (serial.clone(), Arc::clone(device)))
                    .collect();
                (st.sample_rate, st.phase == SessionPhase::Idle, members)
            };

            let started = self.start_members(members, rate, from_idle, nsamples);

            let mut st = self.shared.state.lock();
            st.starting = false;
            let started = started?;
            st.running = started;
            st.phase = SessionPhase::Running;
            st.cancel_requested = false;
            st.progress = 0;
            info!(devices = st.running.len(), nsamples, rate, "session run started");
            drop(st);

            self.shared.emit(SessionEvent::RunStarted { samples: nsamples });
            self.spawn_worker()
        })
    }

    /// Configure, sync and start `members` in serial order. Runs without the
    /// state lock; `starting` keeps `configure`, `start` and `remove_device`
    /// out meanwhile.
    fn start_members(
        &self,
        members: Vec<(String, Arc<dyn SmuDevice>)>,
        rate: u64,
        from_idle: bool,
        nsamples: u64,
    ) -> Result<Vec<RunMember>> {
        if from_idle {
            for (_, device) in &members {
                device.configure(rate)?;
            }
            self.shared.state.lock().phase = SessionPhase::Configured;
        }
        if members.len() > 1 {
            for (_, device) in &members {
                device.sync()?;
            }
        }

        let mut started: Vec<RunMember> = Vec::with_capacity(members.len());
        for (serial, device) in members {
            if let Err(err) = device.start_run(nsamples) {
                warn!(serial = %serial, error = %err, "start failed, cancelling started devices");
                self.abort_start(&started);
                return Err(err);
            }
            started.push(RunMember::new(serial, device));
        }
        Ok(started)
    }

    /// Cancel what already started; drained on the caller's thread.
    fn abort_start(&self, started: &[RunMember]) {
        for member in started {
            member.device.cancel();
        }
        let deadline = Instant::now() + self.config.session.shutdown_timeout();
        let poll = self.config.session.poll_interval();
        let mut events = Vec::new();
        for member in started {
            while !member.device.is_idle() && Instant::now() < deadline {
                member.device.handle_events(poll, &mut events);
                events.clear();
            }
        }
    }

    fn spawn_worker(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let dispatch = self.dispatch.clone();
        let poll = self.config.session.poll_interval();
        let handle = thread::Builder::new()
            .name("smu-session".to_string())
            .spawn(move || dispatcher::with_default(&dispatch, || worker_loop(&shared, poll)))
            .map_err(|err| {
                // nothing services the devices without the worker
                let mut st = self.shared.state.lock();
                st.begin_cancel();
                SmuError::invalid(format!("cannot spawn session thread: {err}"))
            })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// [`Session::start`] followed by [`Session::wait_for_completion`].
    pub fn run(&self, nsamples: u64) -> Result<()> {
        self.start(nsamples)?;
        self.wait_for_completion();
        Ok(())
    }

    /// Ask every running device to stop. Returns immediately.
    pub fn cancel(&self) {
        self.scoped(|| {
            let mut st = self.shared.state.lock();
            if st.phase == SessionPhase::Running {
                st.cancel_requested = true;
                st.begin_cancel();
                info!("session cancel requested");
            }
        });
    }

    /// Block until the current run is over.
    pub fn wait_for_completion(&self) {
        {
            let mut st = self.shared.state.lock();
            while st.phase.is_active() {
                self.shared.finished.wait(&mut st);
            }
        }
        self.join_worker();
    }

    /// Block up to `timeout` for the current run to end. Returns whether it did.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut st = self.shared.state.lock();
            while st.phase.is_active() {
                if self.shared.finished.wait_until(&mut st, deadline).timed_out() {
                    return !st.phase.is_active();
                }
            }
        }
        self.join_worker();
        true
    }

    /// Wait for the run to end, then disable the outputs of every active device.
    pub fn end(&self) -> Result<()> {
        self.wait_for_completion();
        self.scoped(|| {
            for device in self.active_devices() {
                device.off()?;
            }
            Ok(())
        })
    }

    fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("session thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Session")
            .field("phase", &st.phase)
            .field("sample_rate", &st.sample_rate)
            .field("active", &st.active.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let timeout = self.config.session.shutdown_timeout();
        self.cancel();
        if !self.wait_timeout(timeout) {
            self.scoped(|| warn!(?timeout, "devices did not drain, abandoning run"));
            self.shared.state.lock().shutdown = true;
            self.join_worker();
        }
    }
}

/// Service every device of the run until all of them are idle.
fn worker_loop(shared: &Shared, poll: Duration) {
    debug!("session thread started");
    let mut events = Vec::new();
    loop {
        let devices: Vec<(String, Arc<dyn SmuDevice>)> = {
            let st = shared.state.lock();
            if st.shutdown {
                break;
            }
            st.running
                .iter()
                .map(|m| (m.serial.clone(), Arc::clone(&m.device)))
                .collect()
        };

        let mut reports = Vec::with_capacity(devices.len());
        for (serial, device) in &devices {
            device.handle_events(poll, &mut events);
            if !events.is_empty() {
                reports.push((serial.clone(), std::mem::take(&mut events)));
            }
        }

        let mut st = shared.state.lock();
        for (serial, batch) in reports {
            apply_events(shared, &mut st, &serial, batch);
        }

        // drained members whose run ended early leave the run
        let mut index = 0;
        while index < st.running.len() {
            let member = &st.running[index];
            if member.participating() || !member.device.is_idle() {
                index += 1;
                continue;
            }
            let member = st.running.remove(index);
            retire(shared, &mut st, member);
        }

        let progress = st.min_consumed();
        if progress > st.progress {
            st.progress = progress;
            shared.emit(SessionEvent::Progress { samples: progress });
        }

        if st.phase == SessionPhase::Running {
            // also true once no device is left; a device cancelled on its
            // own (e.g. from a callback) is done without completing
            let all_done = st
                .running
                .iter()
                .filter(|m| m.participating())
                .all(|m| m.completed || m.device.is_idle());
            if all_done {
                st.begin_cancel();
            }
        }

        if st.phase == SessionPhase::Cancelling && st.running.iter().all(|m| m.device.is_idle()) {
            let samples = st.min_consumed();
            let completed = !st.cancel_requested
                && st.running.iter().any(|m| m.participating())
                && st.running.iter().filter(|m| m.participating()).all(|m| m.completed);
            for member in std::mem::take(&mut st.running) {
                if !member.participating() {
                    retire(shared, &mut st, member);
                }
            }
            st.phase = SessionPhase::Idle;
            drop(st);

            if completed {
                info!(samples, "session run completed");
                shared.emit(SessionEvent::RunCompleted { samples });
            } else {
                info!(samples, "session run cancelled");
                shared.emit(SessionEvent::RunCancelled { samples });
            }
            shared.finished.notify_all();
            break;
        }
    }
    debug!("session thread exiting");
}

fn apply_events(shared: &Shared, st: &mut SessionState, serial: &str, batch: Vec<DeviceEvent>) {
    let Some(member) = st.running.iter_mut().find(|m| m.serial == serial) else {
        return;
    };
    for event in batch {
        match event {
            DeviceEvent::Progress { samples } => member.consumed = samples,
            DeviceEvent::Completed => member.completed = true,
            DeviceEvent::Protocol { message } => {
                shared.emit(SessionEvent::DeviceError {
                    serial: serial.to_string(),
                    message,
                    fatal: false,
                });
            }
            DeviceEvent::Transport { error } => {
                shared.emit(SessionEvent::DeviceError {
                    serial: serial.to_string(),
                    message: error.to_string(),
                    fatal: false,
                });
            }
            DeviceEvent::Removed => {
                warn!(serial, "device disappeared during run");
                member.gone = true;
            }
            DeviceEvent::Failed { message } => {
                warn!(serial, %message, "device run failed");
                member.failed = true;
                shared.emit(SessionEvent::DeviceError {
                    serial: serial.to_string(),
                    message,
                    fatal: true,
                });
            }
        }
    }
}

/// Finish the removal of a drained member that left the run early.
fn retire(shared: &Shared, st: &mut SessionState, member: RunMember) {
    if member.failed && !member.leaving {
        // stays active for the next run
        return;
    }
    if member.gone {
        st.active.remove(&member.serial);
    } else if let Err(err) = member.device.removed() {
        warn!(serial = %member.serial, error = %err, "device removal hook failed");
    }
    info!(serial = %member.serial, "device removed from run");
    shared.emit(SessionEvent::DeviceRemoved {
        serial: member.serial,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedSmu;
    use tracing_test::traced_test;

    fn session() -> Session {
        let mut config = SmuConfig::default();
        config.session.shutdown_timeout_ms = 500;
        Session::new(config).unwrap()
    }

    #[test]
    fn test_attach_and_membership() {
        let session = session();
        let mut rx = session.subscribe();
        session.attach(Arc::new(SimulatedSmu::cee("B"))).unwrap();
        session.attach(Arc::new(SimulatedSmu::m1000("A"))).unwrap();
        assert_eq!(session.available_devices().len(), 2);
        assert!(session.active_devices().is_empty());

        session.add_device("B").unwrap();
        session.add_device("A").unwrap();
        let serials: Vec<String> = session.active_devices().iter().map(|d| d.serial().to_string()).collect();
        assert_eq!(serials, ["A", "B"]);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::DeviceAttached { serial: "B".into() }
        );
        assert!(matches!(
            session.add_device("nope"),
            Err(SmuError::DeviceNotFound { .. })
        ));
    }

    #[test]
    #[traced_test]
    fn test_membership_is_logged() {
        let session = session();
        session.attach(Arc::new(SimulatedSmu::cee("LOG-1"))).unwrap();
        session.add_device("LOG-1").unwrap();
        assert!(logs_contain("device probed"));
        assert!(logs_contain("device added to session"));
        assert!(logs_contain("LOG-1"));
    }

    #[test]
    fn test_start_requires_devices() {
        let session = session();
        let err = session.start(100).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_configure_rejects_zero_rate() {
        let session = session();
        assert!(session.configure(0).unwrap_err().is_validation());
        session.configure(20_000).unwrap();
        assert_eq!(session.phase(), SessionPhase::Configured);
        assert_eq!(session.sample_rate(), 20_000);
    }

    #[test]
    fn test_detach_unknown() {
        let session = session();
        assert!(matches!(
            session.detach("ghost"),
            Err(SmuError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_finite_run_returns_to_idle() {
        let session = session();
        session.attach(Arc::new(SimulatedSmu::cee("S1"))).unwrap();
        session.add_device("S1").unwrap();
        session.run(1000).unwrap();
        assert_eq!(session.phase(), SessionPhase::Idle);
        let dev = session.get_device("S1").unwrap();
        assert_eq!(dev.samples_consumed(), 1000);
        assert!(dev.is_idle());
    }
}
