//! Configuration descriptor walking

pub mod uvc;

pub use uvc::{
    AltSetting, FormatDescriptor, FrameDescriptor, FrameIntervals, StreamingInterface, UvcConfig,
};

use crate::error::{Error, Result};

pub const DESC_INTERFACE: u8 = 0x04;
pub const DESC_ENDPOINT: u8 = 0x05;
pub const DESC_INTERFACE_ASSOCIATION: u8 = 0x0B;
pub const DESC_CS_INTERFACE: u8 = 0x24;

/// Iterator over the descriptors packed in a configuration descriptor.
///
/// Yields each descriptor as a slice starting at its bLength byte. A
/// descriptor that claims to run past the end of the buffer ends the walk
/// with an error.
pub struct Descriptors<'a> {
    buf: &'a [u8],
}

impl<'a> Descriptors<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let len = self.buf[0] as usize;
        if len < 2 || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(Error::InvalidResponse("malformed descriptor")));
        }
        let (desc, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(Ok(desc))
    }
}

/// Standard interface descriptor fields we care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceDescriptor {
    pub fn parse(desc: &[u8]) -> Option<Self> {
        if desc.len() < 9 || desc[1] != DESC_INTERFACE {
            return None;
        }
        Some(Self {
            number: desc[2],
            alt_setting: desc[3],
            num_endpoints: desc[4],
            class: desc[5],
            subclass: desc[6],
            protocol: desc[7],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub transfer_type: TransferType,
    /// wMaxPacketSize bits 10..0
    pub max_packet_size: u16,
    /// Additional transactions per microframe (high-bandwidth isochronous)
    pub mult: u8,
}

impl EndpointDescriptor {
    pub fn parse(desc: &[u8]) -> Option<Self> {
        if desc.len() < 7 || desc[1] != DESC_ENDPOINT {
            return None;
        }
        let transfer_type = match desc[3] & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        };
        let w_max = u16::from_le_bytes([desc[4], desc[5]]);
        Some(Self {
            address: desc[2],
            transfer_type,
            max_packet_size: w_max & 0x07ff,
            mult: ((w_max >> 11) & 0x03) as u8,
        })
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    /// Bytes the endpoint can move per (micro)frame
    pub fn effective_packet_size(&self) -> usize {
        self.max_packet_size as usize * (1 + self.mult as usize)
    }
}
