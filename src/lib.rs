//! # daq-driver-smu
//!
//! Host-side streaming driver core for USB source-measure units (CEE and
//! ADALM1000 class hardware) in the rust-daq ecosystem.
//!
//! Each device has two channels; each channel has a voltage and a current
//! [`signal::Signal`]. Depending on the channel [`info::Mode`] one of them is
//! sourced from a waveform generator while both are measured into sinks.
//! Devices stream continuously at a fixed sample rate, and sources and sinks
//! can be changed while they do.
//!
//! ## Crate Structure
//!
//! - **`signal`**: waveform sources, measurement sinks and the per-device
//!   [`signal::SignalBank`].
//! - **`device`**: the [`device::SmuDevice`] trait, model probing, wire codecs,
//!   calibration and the bulk-transfer pipeline.
//! - **`session`**: multi-device runs, the background event thread and
//!   [`session::SessionEvent`]s.
//! - **`transport`**: the [`transport::Transport`] seam to the USB stack.
//! - **`sim`**: an in-process simulated device for tests and demos.
//! - **`config`** / **`logging`**: figment-backed configuration and the
//!   tracing subscriber setup.
//! - **`error`**: [`SmuError`] and [`TransportError`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use daq_driver_smu::{config::SmuConfig, info::Mode, session::Session, sim::SimulatedSmu};
//! use daq_driver_smu::signal::MeasureBuffer;
//!
//! # fn main() -> daq_driver_smu::Result<()> {
//! let session = Session::new(SmuConfig::default())?;
//! session.attach(Arc::new(SimulatedSmu::cee("CEE-1")))?;
//! let dev = session.add_device("CEE-1")?;
//!
//! dev.set_mode(0, Mode::Svmi)?;
//! let current = MeasureBuffer::new(1000);
//! {
//!     let mut bank = dev.lock();
//!     bank.signal_mut(0, 0)?.source_constant(2.5);
//!     bank.signal_mut(0, 1)?.measure_buffer(current.clone(), 1000);
//! }
//!
//! session.run(1000)?;
//! assert_eq!(current.written(), 1000);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod info;
pub mod logging;
pub mod session;
pub mod signal;
pub mod sim;
pub mod transport;

pub use config::SmuConfig;
pub use device::{probe, DeviceEvent, SmuDevice};
pub use error::{Result, SmuError, TransportError};
pub use session::{Session, SessionEvent, SessionPhase};
