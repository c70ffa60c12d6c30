//! UVC payload header (UVC 1.5, 2.4.3.3)

/// bmHeaderInfo bits
pub mod flags {
    pub const FID: u8 = 0x01;
    pub const EOF: u8 = 0x02;
    pub const PTS: u8 = 0x04;
    pub const SCR: u8 = 0x08;
    pub const STI: u8 = 0x20;
    pub const ERR: u8 = 0x40;
    pub const EOH: u8 = 0x80;
}

/// Longest header the standard payload formats produce: 2 + PTS(4) + SCR(6)
pub const MAX_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// bLength, offset of the payload data
    pub len: usize,
    pub fid: bool,
    pub eof: bool,
    pub error: bool,
    pub still: bool,
    pub pts: Option<u32>,
    /// Source clock: STC (32 bit) and 1 kHz SOF counter (11 bit)
    pub scr: Option<(u32, u16)>,
}

impl PayloadHeader {
    /// Parse the header at the start of a payload. Returns `None` if the
    /// bytes can't be a header, so the caller can drop the packet.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 2 {
            return None;
        }
        let len = buf[0] as usize;
        let info = buf[1];
        if !(2..=MAX_HEADER_LEN).contains(&len) || len > buf.len() {
            return None;
        }

        let mut offset = 2;
        let pts = if info & flags::PTS != 0 {
            let bytes = buf.get(offset..offset + 4).filter(|_| offset + 4 <= len)?;
            offset += 4;
            Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        } else {
            None
        };
        let scr = if info & flags::SCR != 0 {
            let bytes = buf.get(offset..offset + 6).filter(|_| offset + 6 <= len)?;
            let stc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let sof = u16::from_le_bytes([bytes[4], bytes[5]]) & 0x07ff;
            Some((stc, sof))
        } else {
            None
        };

        Some(Self {
            len,
            fid: info & flags::FID != 0,
            eof: info & flags::EOF != 0,
            error: info & flags::ERR != 0,
            still: info & flags::STI != 0,
            pts,
            scr,
        })
    }
}
