//! Cancellation, removal and fault escalation against the simulator.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use common::{drain, session_with, test_config, wait_until};
use daq_driver_smu::info::Mode;
use daq_driver_smu::session::{Session, SessionEvent, SessionPhase};
use daq_driver_smu::signal::MeasureBuffer;
use daq_driver_smu::sim::{FaultScenario, SimulatedSmu};
use daq_driver_smu::transport::{
    Completion, ControlRequest, Direction, SubmitError, TransferId, TransferStatus, Transport,
    TransportError, UsbDescriptor,
};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn test_cancel_continuous_run() {
    let sim = Arc::new(SimulatedSmu::cee("C-1"));
    let session = session_with(&[sim.clone()]);
    let dev = session.get_device("C-1").unwrap();
    let mut rx = session.subscribe();

    session.start(0).unwrap();
    assert_eq!(session.phase(), SessionPhase::Running);
    assert!(wait_until(TIMEOUT, || dev.samples_consumed() >= 5_000));

    session.cancel();
    session.cancel();
    assert!(session.wait_timeout(TIMEOUT));
    assert_eq!(session.phase(), SessionPhase::Idle);

    let stats = sim.stats();
    assert_eq!(stats.in_flight(), 0);
    assert_eq!(stats.submitted_after_cancel, 0);
    assert_eq!(stats.duplicate_submissions, 0);
    assert!(stats.max_in_flight_out <= 4);
    assert!(stats.max_in_flight_in <= 4);
    assert!(!sim.is_streaming());
    assert!(dev.is_idle());

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(SessionEvent::RunStarted { samples: 0 })));
    assert!(matches!(events.last(), Some(SessionEvent::RunCancelled { .. })));
}

#[test]
fn test_cancel_when_idle_is_noop() {
    let sim = Arc::new(SimulatedSmu::cee("C-2"));
    let session = session_with(&[sim]);
    session.cancel();
    assert_eq!(session.phase(), SessionPhase::Idle);
    assert!(session.wait_timeout(Duration::from_millis(10)));
}

#[test]
fn test_unplug_mid_run_keeps_other_device() {
    let good = Arc::new(SimulatedSmu::cee("A-good"));
    let flaky = Arc::new(SimulatedSmu::cee("B-flaky").with_fault(FaultScenario::UnplugAfter { transfers: 20 }));
    let session = session_with(&[good.clone(), flaky.clone()]);
    let mut rx = session.subscribe();

    session.run(20_000).unwrap();

    let events = drain(&mut rx);
    assert!(events.contains(&SessionEvent::DeviceRemoved {
        serial: "B-flaky".into()
    }));
    assert!(matches!(events.last(), Some(SessionEvent::RunCompleted { .. })));

    let active: Vec<String> = session.active_devices().iter().map(|d| d.serial().to_string()).collect();
    assert_eq!(active, ["A-good"]);
    assert_eq!(session.get_device("A-good").unwrap().samples_consumed(), 20_000);
    assert_eq!(flaky.stats().in_flight(), 0);
}

#[test]
fn test_persistent_stall_fails_device() {
    let sim = Arc::new(SimulatedSmu::cee("S-1").with_fault(FaultScenario::StallEvery { nth: 1 }));
    let session = session_with(&[sim.clone()]);
    let mut rx = session.subscribe();

    session.run(10_000).unwrap();

    let events = drain(&mut rx);
    let fatal = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::DeviceError { fatal: true, .. }))
        .count();
    assert_eq!(fatal, 1);
    assert!(matches!(events.last(), Some(SessionEvent::RunCancelled { .. })));
    // a failed device stays in the session
    assert_eq!(session.active_devices().len(), 1);
    assert!(sim.stats().halts_cleared > 0);
    assert_eq!(sim.stats().in_flight(), 0);
}

#[test]
fn test_occasional_stall_is_retried() {
    let sim = Arc::new(SimulatedSmu::m1000("S-2").with_fault(FaultScenario::StallEvery { nth: 5 }));
    let session = session_with(&[sim.clone()]);
    let mut rx = session.subscribe();

    session.run(50_000).unwrap();

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::DeviceError { fatal: false, .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::DeviceError { fatal: true, .. })));
    assert!(matches!(events.last(), Some(SessionEvent::RunCompleted { samples: 50_000 })));
}

#[test]
fn test_truncated_blocks_are_dropped_whole() {
    let sim = Arc::new(SimulatedSmu::cee("T-1").with_fault(FaultScenario::TruncateEvery { nth: 3 }));
    let session = session_with(&[sim]);
    let dev = session.get_device("T-1").unwrap();
    let mut rx = session.subscribe();

    dev.set_mode(0, Mode::Svmi).unwrap();
    let volts = MeasureBuffer::new(3000);
    {
        let mut bank = dev.lock();
        bank.signal_mut(0, 0).unwrap().source_constant(1.5);
        bank.signal_mut(0, 0).unwrap().measure_buffer(volts.clone(), 3000);
    }
    session.run(3000).unwrap();

    let protocol_errors = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::DeviceError { fatal: false, .. }))
        .count();
    assert!(protocol_errors > 0);
    // whole blocks (100 ticks at 10 kS/s) went missing, nothing partial
    let written = volts.written();
    assert!(written < 3000);
    assert_eq!(written % 100, 0);
    assert_eq!(dev.samples_consumed(), 3000);
}

#[test]
fn test_corrupt_mode_reported_as_protocol_error() {
    let sim = Arc::new(SimulatedSmu::cee("P-1").with_fault(FaultScenario::CorruptModeEvery { nth: 2 }));
    let session = session_with(&[sim]);
    let mut rx = session.subscribe();

    session.run(2000).unwrap();

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::DeviceError { message, fatal: false, .. } if message.contains("unknown mode")
    )));
    assert!(matches!(events.last(), Some(SessionEvent::RunCompleted { .. })));
}

#[test]
fn test_remove_device_mid_run() {
    let a = Arc::new(SimulatedSmu::cee("R-a"));
    let b = Arc::new(SimulatedSmu::m1000("R-b"));
    let session = session_with(&[a.clone(), b.clone()]);
    let dev_a = session.get_device("R-a").unwrap();
    let mut rx = session.subscribe();

    session.start(0).unwrap();
    assert!(wait_until(TIMEOUT, || dev_a.samples_consumed() > 1_000));

    session.remove_device("R-b").unwrap();
    assert!(wait_until(TIMEOUT, || b.stats().in_flight() == 0 && !b.is_streaming()));
    assert!(wait_until(TIMEOUT, || drain(&mut rx)
        .contains(&SessionEvent::DeviceRemoved { serial: "R-b".into() })));

    // the other device keeps streaming
    let before = dev_a.samples_consumed();
    assert!(wait_until(TIMEOUT, || dev_a.samples_consumed() > before + 1_000));
    assert_eq!(session.phase(), SessionPhase::Running);

    session.cancel();
    session.wait_for_completion();
    assert_eq!(a.stats().in_flight(), 0);
    assert_eq!(session.active_devices().len(), 1);
}

#[test]
fn test_removing_last_device_ends_run() {
    let sim = Arc::new(SimulatedSmu::cee("L-1"));
    let session = session_with(&[sim.clone()]);
    let mut rx = session.subscribe();

    session.start(0).unwrap();
    session.remove_device("L-1").unwrap();
    assert!(session.wait_timeout(TIMEOUT));

    let events = drain(&mut rx);
    assert!(events.contains(&SessionEvent::DeviceRemoved { serial: "L-1".into() }));
    assert!(matches!(events.last(), Some(SessionEvent::RunCancelled { .. })));
    assert_eq!(sim.stats().in_flight(), 0);
}

#[test]
fn test_drop_cancels_and_joins() {
    let sim = Arc::new(SimulatedSmu::cee("D-1"));
    {
        let session = session_with(&[sim.clone()]);
        session.start(0).unwrap();
        assert!(wait_until(TIMEOUT, || sim.stats().completed > 10));
    }
    assert_eq!(sim.stats().in_flight(), 0);
    assert!(!sim.is_streaming());
}

#[test]
fn test_sink_callback_cancels_its_device() {
    let sim = Arc::new(SimulatedSmu::cee("K-1"));
    let session = session_with(&[sim.clone()]);
    let dev = session.get_device("K-1").unwrap();
    let mut rx = session.subscribe();

    let weak = Arc::downgrade(&dev);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    dev.lock().signal_mut(0, 0).unwrap().measure_callback(move |_| {
        // stop at the 101st value
        if counter.fetch_add(1, Ordering::SeqCst) == 100 {
            if let Some(dev) = weak.upgrade() {
                dev.cancel();
            }
        }
    });

    session.start(0).unwrap();
    assert!(session.wait_timeout(TIMEOUT));
    assert_eq!(session.phase(), SessionPhase::Idle);
    assert!(calls.load(Ordering::SeqCst) > 100);
    assert!(dev.is_idle());
    assert_eq!(sim.stats().in_flight(), 0);

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(SessionEvent::RunCancelled { .. })));
}

/// Reports the first finished inbound transfer as cancelled.
struct CancelFirstIn {
    inner: SimulatedSmu,
    fired: AtomicBool,
}

impl Transport for CancelFirstIn {
    fn descriptor(&self) -> &UsbDescriptor {
        self.inner.descriptor()
    }

    fn control_transfer(
        &self,
        request: ControlRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.inner.control_transfer(request, data, timeout)
    }

    fn submit_bulk(
        &self,
        id: TransferId,
        endpoint: u8,
        buffer: BytesMut,
        timeout: Duration,
    ) -> Result<(), SubmitError> {
        self.inner.submit_bulk(id, endpoint, buffer, timeout)
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<(), TransportError> {
        self.inner.cancel_transfer(id)
    }

    fn handle_events(
        &self,
        timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<(), TransportError> {
        let first = completions.len();
        self.inner.handle_events(timeout, completions)?;
        for completion in &mut completions[first..] {
            if completion.id.direction == Direction::In
                && completion.status == TransferStatus::Completed
                && !self.fired.swap(true, Ordering::SeqCst)
            {
                completion.status = TransferStatus::Cancelled;
            }
        }
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
        self.inner.clear_halt(endpoint)
    }

    fn set_alt_setting(&self, interface: u8, setting: u8) -> Result<(), TransportError> {
        self.inner.set_alt_setting(interface, setting)
    }
}

#[test]
fn test_unrequested_cancellation_is_retried() {
    let transport = Arc::new(CancelFirstIn {
        inner: SimulatedSmu::cee("U-1"),
        fired: AtomicBool::new(false),
    });
    let session = Session::new(test_config()).unwrap();
    session.attach(transport.clone()).unwrap();
    let dev = session.add_device("U-1").unwrap();
    let mut rx = session.subscribe();

    session.start(2_000).unwrap();
    assert!(session.wait_timeout(TIMEOUT));

    assert!(transport.fired.load(Ordering::SeqCst));
    assert_eq!(dev.samples_consumed(), 2_000);
    assert!(dev.is_idle());
    assert_eq!(transport.inner.stats().in_flight(), 0);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::DeviceError { message, fatal: false, .. } if message.contains("cancelled unexpectedly")
    )));
    assert!(matches!(events.last(), Some(SessionEvent::RunCompleted { samples: 2_000 })));
}
