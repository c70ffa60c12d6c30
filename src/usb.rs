//! Interface to the USB host transport.
//!
//! The host library that owns the controller implements [`UsbDevice`] for
//! every attached device. Everything in this crate talks to hardware through
//! it: control requests, interface claiming, and asynchronous transfers that
//! come back through [`Transfer::complete`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// Errors reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("device is gone")]
    NoDevice,
    #[error("backend error {0}")]
    Backend(i32),
}

impl TransportError {
    /// Code reported with transfer error events, shared with [`TransferStatus::code`]
    pub fn code(&self) -> i32 {
        match self {
            TransportError::Stall => 2,
            TransportError::NoDevice => 4,
            TransportError::Timeout => 5,
            TransportError::Backend(code) => *code,
        }
    }
}

/// Identity of an attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Setup stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Completion status of a transfer or of one isochronous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Canceled,
    Stall,
    Overflow,
    NoDevice,
    Error(i32),
}

impl TransferStatus {
    /// Backend-independent code reported with transfer error events.
    pub fn code(&self) -> i32 {
        match self {
            TransferStatus::Completed => 0,
            TransferStatus::Canceled => 1,
            TransferStatus::Stall => 2,
            TransferStatus::Overflow => 3,
            TransferStatus::NoDevice => 4,
            TransferStatus::Error(code) => *code,
        }
    }
}

/// One packet slot of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsocPacket {
    pub num_bytes: usize,
    pub actual_num_bytes: usize,
    pub status: TransferStatus,
}

pub type CompletionFn = Arc<dyn Fn(Transfer) + Send + Sync>;

/// Transfer descriptor handed to [`UsbDevice::submit`].
///
/// The transport owns the transfer until it calls [`Transfer::complete`],
/// which moves it back to whoever armed it.
pub struct Transfer {
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    /// Requested length. For isochronous transfers this is the sum of the
    /// packet slot sizes.
    pub num_bytes: usize,
    pub actual_num_bytes: usize,
    pub status: TransferStatus,
    /// Empty for bulk transfers.
    pub isoc_packets: Vec<IsocPacket>,
    callback: CompletionFn,
}

impl Transfer {
    pub fn bulk(endpoint: u8, size: usize, callback: CompletionFn) -> Self {
        Self {
            endpoint,
            buffer: vec![0; size],
            num_bytes: size,
            actual_num_bytes: 0,
            status: TransferStatus::Completed,
            isoc_packets: Vec::new(),
            callback,
        }
    }

    pub fn isochronous(
        endpoint: u8,
        packets: usize,
        packet_size: usize,
        callback: CompletionFn,
    ) -> Self {
        let size = packets * packet_size;
        Self {
            endpoint,
            buffer: vec![0; size],
            num_bytes: size,
            actual_num_bytes: 0,
            status: TransferStatus::Completed,
            isoc_packets: vec![
                IsocPacket {
                    num_bytes: packet_size,
                    actual_num_bytes: 0,
                    status: TransferStatus::Completed,
                };
                packets
            ],
            callback,
        }
    }

    pub fn is_isochronous(&self) -> bool {
        !self.isoc_packets.is_empty()
    }

    /// Received payload of each isochronous packet, with its status.
    pub fn isoc_payloads(&self) -> impl Iterator<Item = (&[u8], TransferStatus)> + '_ {
        self.isoc_packets.iter().scan(0usize, move |offset, packet| {
            let start = *offset;
            *offset += packet.num_bytes;
            let end = (start + packet.actual_num_bytes.min(packet.num_bytes)).min(self.buffer.len());
            let start = start.min(end);
            Some((&self.buffer[start..end], packet.status))
        })
    }

    /// Received bytes of a bulk transfer.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_num_bytes.min(self.buffer.len())]
    }

    /// Hand the transfer back to its owner. Called by the transport.
    pub fn complete(self) {
        let callback = Arc::clone(&self.callback);
        callback(self)
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("endpoint", &self.endpoint)
            .field("num_bytes", &self.num_bytes)
            .field("actual_num_bytes", &self.actual_num_bytes)
            .field("status", &self.status)
            .field("isoc_packets", &self.isoc_packets.len())
            .finish()
    }
}

/// Transfer rejected by [`UsbDevice::submit`]; ownership comes back with it.
#[derive(Debug, Error)]
#[error("failed to submit transfer: {error}")]
pub struct SubmitError {
    pub error: TransportError,
    pub transfer: Transfer,
}

/// An opened device as exposed by the host transport.
///
/// Control transfers block the caller up to a timeout owned by the
/// implementation. Completions must be delivered serialized per endpoint.
pub trait UsbDevice: Send + Sync {
    fn info(&self) -> DeviceInfo;

    /// Raw active configuration descriptor, including all subordinate
    /// descriptors.
    fn config_descriptor(&self) -> Bytes;

    fn claim_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    fn release_interface(&self, interface: u8) -> Result<(), TransportError>;

    /// Select an alternate setting. Selecting a setting that removes an
    /// endpoint cancels every transfer pending on it.
    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Halt an endpoint and cancel every transfer pending on it.
    fn halt_endpoint(&self, endpoint: u8) -> Result<(), TransportError>;

    fn clear_endpoint(&self, endpoint: u8) -> Result<(), TransportError>;

    /// Returns the number of bytes moved in the data stage.
    fn control_transfer(&self, setup: SetupPacket, data: &mut [u8]) -> Result<usize, TransportError>;

    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError>;
}
