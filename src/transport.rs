//! USB transport seam.
//!
//! Enumeration, opening and claiming a device belong to the caller's USB
//! stack. The driver core only needs an opened handle that can run control
//! requests and asynchronous bulk transfers; [`Transport`] is that contract.
//!
//! Bulk transfers follow the submit / complete model of libusb and nusb:
//! the buffer is moved into [`Transport::submit_bulk`] and handed back in the
//! matching [`Completion`] produced by [`Transport::handle_events`]. Transfers
//! on one endpoint complete in submission order.

use std::time::Duration;

use bytes::BytesMut;

pub use crate::error::{Direction, TransportError};

/// `bmRequestType` for a vendor request reading from the device.
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;
/// `bmRequestType` for a vendor request writing to the device.
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// Identifies one slot of a device's transfer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    /// Transfer direction
    pub direction: Direction,
    /// Slot index within that direction's pool
    pub slot: usize,
}

impl TransferId {
    /// Outbound slot id.
    pub fn out(slot: usize) -> Self {
        Self {
            direction: Direction::Out,
            slot,
        }
    }

    /// Inbound slot id.
    pub fn input(slot: usize) -> Self {
        Self {
            direction: Direction::In,
            slot,
        }
    }
}

/// Terminal state of a bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Data transferred
    Completed,
    /// Cancelled through [`Transport::cancel_transfer`]
    Cancelled,
    /// Failed with a transport error
    Failed(TransportError),
}

/// A finished bulk transfer, returned with its buffer.
#[derive(Debug)]
pub struct Completion {
    /// Which slot the transfer belongs to
    pub id: TransferId,
    /// How it ended
    pub status: TransferStatus,
    /// The submitted buffer; for IN transfers its length is the received byte count
    pub buffer: BytesMut,
}

/// A submission that the transport refused. The buffer is handed back.
#[derive(Debug)]
pub struct SubmitError {
    /// Why the submission failed
    pub error: TransportError,
    /// The buffer that was not submitted
    pub buffer: BytesMut,
}

/// Setup packet of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
}

impl ControlRequest {
    /// Vendor request reading from the device.
    pub fn vendor_in(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_VENDOR_IN,
            request,
            value,
            index,
        }
    }

    /// Vendor request writing to the device.
    pub fn vendor_out(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_VENDOR_OUT,
            request,
            value,
            index,
        }
    }

    /// Whether the data stage flows device-to-host.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// USB identity of an opened device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDescriptor {
    /// `idVendor`
    pub vendor_id: u16,
    /// `idProduct`
    pub product_id: u16,
    /// `bcdDevice`, the hardware release
    pub bcd_device: u16,
    /// Serial number string descriptor
    pub serial: String,
}

/// An opened, claimed USB device.
///
/// Implementations must be callable from the caller's thread (control
/// requests, submission, cancellation) and from the session's background
/// thread (event handling) at the same time.
pub trait Transport: Send + Sync {
    /// USB identity of the device.
    fn descriptor(&self) -> &UsbDescriptor;

    /// Run a blocking control request. Returns the number of data bytes moved.
    fn control_transfer(
        &self,
        request: ControlRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Queue a bulk transfer on `endpoint`.
    ///
    /// For OUT endpoints the whole buffer is sent; for IN endpoints up to
    /// `buffer.len()` bytes are received.
    fn submit_bulk(
        &self,
        id: TransferId,
        endpoint: u8,
        buffer: BytesMut,
        timeout: Duration,
    ) -> Result<(), SubmitError>;

    /// Ask for an in-flight transfer to be cancelled.
    ///
    /// Returns immediately; the transfer still completes (with
    /// [`TransferStatus::Cancelled`] or whatever state it reached first)
    /// through [`Transport::handle_events`].
    fn cancel_transfer(&self, id: TransferId) -> Result<(), TransportError>;

    /// Wait up to `timeout` for transfers to finish and append them to
    /// `completions`.
    fn handle_events(
        &self,
        timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<(), TransportError>;

    /// Clear a halt condition on `endpoint`.
    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError>;

    /// Select an alternate setting of `interface`.
    fn set_alt_setting(&self, interface: u8, setting: u8) -> Result<(), TransportError>;
}
