//! Shared helpers for the simulator-backed integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use daq_driver_smu::config::SmuConfig;
use daq_driver_smu::session::{Session, SessionEvent};
use daq_driver_smu::sim::SimulatedSmu;
use tokio::sync::broadcast::{error::TryRecvError, Receiver};

pub fn test_config() -> SmuConfig {
    let mut config = SmuConfig::default();
    config.session.event_capacity = 1 << 16;
    config.session.shutdown_timeout_ms = 2_000;
    config
}

/// Session with every simulator attached and added.
pub fn session_with(sims: &[Arc<SimulatedSmu>]) -> Session {
    let session = Session::new(test_config()).unwrap();
    for sim in sims {
        let dev = session.attach(sim.clone()).unwrap();
        session.add_device(dev.serial()).unwrap();
    }
    session
}

/// Everything queued on `rx`, skipping lag notices.
pub fn drain(rx: &mut Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
