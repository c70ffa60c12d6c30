//! Two-phase PROBE/COMMIT negotiation of streaming parameters (UVC 1.5, 4.3.1.1)

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, instrument};

use crate::descriptor::uvc::FormatMatch;
use crate::error::{Error, Result};
use crate::usb::{SetupPacket, UsbDevice};

pub const SET_CUR: u8 = 0x01;
pub const GET_CUR: u8 = 0x81;

pub const VS_PROBE_CONTROL: u8 = 0x01;
pub const VS_COMMIT_CONTROL: u8 = 0x02;

/// Class request, interface recipient
const REQUEST_TYPE_OUT: u8 = 0x21;
const REQUEST_TYPE_IN: u8 = 0xA1;

/// bmHint: keep dwFrameInterval fixed
const HINT_FRAME_INTERVAL: u16 = 0x0001;

/// Size of the probe/commit structure for a UVC revision
pub fn control_len(bcd_uvc: u16) -> usize {
    match bcd_uvc {
        0..=0x010F => 26,
        0x0110..=0x014F => 34,
        _ => 48,
    }
}

/// Video probe and commit control structure.
///
/// Fields past the UVC 1.0 layout are zero when the device speaks an older
/// revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingControl {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    // UVC 1.1
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
    // UVC 1.5
    pub usage: u8,
    pub bit_depth_luma: u8,
    pub settings: u8,
    pub max_ref_frames_plus_one: u8,
    pub rate_control_modes: u16,
    pub layout_per_stream: u64,
}

impl StreamingControl {
    /// Probe request for a matched format/frame pair
    pub fn request(matched: &FormatMatch<'_>) -> Self {
        Self {
            hint: HINT_FRAME_INTERVAL,
            format_index: matched.format.index,
            frame_index: matched.frame.index,
            frame_interval: matched.interval,
            ..Default::default()
        }
    }

    pub fn encode(&self, len: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(48);
        buf.put_u16_le(self.hint);
        buf.put_u8(self.format_index);
        buf.put_u8(self.frame_index);
        buf.put_u32_le(self.frame_interval);
        buf.put_u16_le(self.key_frame_rate);
        buf.put_u16_le(self.p_frame_rate);
        buf.put_u16_le(self.comp_quality);
        buf.put_u16_le(self.comp_window_size);
        buf.put_u16_le(self.delay);
        buf.put_u32_le(self.max_video_frame_size);
        buf.put_u32_le(self.max_payload_transfer_size);
        buf.put_u32_le(self.clock_frequency);
        buf.put_u8(self.framing_info);
        buf.put_u8(self.preferred_version);
        buf.put_u8(self.min_version);
        buf.put_u8(self.max_version);
        buf.put_u8(self.usage);
        buf.put_u8(self.bit_depth_luma);
        buf.put_u8(self.settings);
        buf.put_u8(self.max_ref_frames_plus_one);
        buf.put_u16_le(self.rate_control_modes);
        buf.put_u64_le(self.layout_per_stream);
        buf.truncate(len);
        buf
    }

    /// Decode a reply. `buf` must hold at least the UVC 1.0 layout.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < 26 {
            return Err(Error::InvalidSize {
                expected: 26,
                actual: buf.len(),
            });
        }
        let mut ctrl = Self {
            hint: buf.get_u16_le(),
            format_index: buf.get_u8(),
            frame_index: buf.get_u8(),
            frame_interval: buf.get_u32_le(),
            key_frame_rate: buf.get_u16_le(),
            p_frame_rate: buf.get_u16_le(),
            comp_quality: buf.get_u16_le(),
            comp_window_size: buf.get_u16_le(),
            delay: buf.get_u16_le(),
            max_video_frame_size: buf.get_u32_le(),
            max_payload_transfer_size: buf.get_u32_le(),
            ..Default::default()
        };
        if buf.remaining() >= 8 {
            ctrl.clock_frequency = buf.get_u32_le();
            ctrl.framing_info = buf.get_u8();
            ctrl.preferred_version = buf.get_u8();
            ctrl.min_version = buf.get_u8();
            ctrl.max_version = buf.get_u8();
        }
        if buf.remaining() >= 14 {
            ctrl.usage = buf.get_u8();
            ctrl.bit_depth_luma = buf.get_u8();
            ctrl.settings = buf.get_u8();
            ctrl.max_ref_frames_plus_one = buf.get_u8();
            ctrl.rate_control_modes = buf.get_u16_le();
            ctrl.layout_per_stream = buf.get_u64_le();
        }
        Ok(ctrl)
    }
}

/// Control endpoint of one streaming interface
pub struct StreamControl<'a> {
    pub device: &'a dyn UsbDevice,
    pub interface: u8,
    pub bcd_uvc: u16,
}

impl StreamControl<'_> {
    fn set_cur(&self, selector: u8, ctrl: &StreamingControl) -> Result<()> {
        let len = control_len(self.bcd_uvc);
        let mut data = ctrl.encode(len);
        let setup = SetupPacket {
            request_type: REQUEST_TYPE_OUT,
            request: SET_CUR,
            value: (selector as u16) << 8,
            index: self.interface as u16,
            length: len as u16,
        };
        let sent = self.device.control_transfer(setup, &mut data)?;
        if sent != len {
            return Err(Error::InvalidSize {
                expected: len,
                actual: sent,
            });
        }
        Ok(())
    }

    fn get_cur(&self, selector: u8) -> Result<StreamingControl> {
        let len = control_len(self.bcd_uvc);
        let mut data = vec![0u8; len];
        let setup = SetupPacket {
            request_type: REQUEST_TYPE_IN,
            request: GET_CUR,
            value: (selector as u16) << 8,
            index: self.interface as u16,
            length: len as u16,
        };
        let received = self.device.control_transfer(setup, &mut data)?;
        if received != len {
            return Err(Error::InvalidSize {
                expected: len,
                actual: received,
            });
        }
        StreamingControl::decode(&data)
    }

    /// SET_CUR then GET_CUR on the probe control. Returns what the device
    /// settled on without committing it.
    #[instrument(skip(self, request), fields(format = request.format_index, frame = request.frame_index))]
    pub fn probe(&self, request: &StreamingControl) -> Result<StreamingControl> {
        self.set_cur(VS_PROBE_CONTROL, request)?;
        let result = self.get_cur(VS_PROBE_CONTROL)?;

        if result.format_index != request.format_index || result.frame_index != request.frame_index
        {
            return Err(Error::InvalidResponse("device changed format or frame index"));
        }
        if result.frame_interval == 0 {
            return Err(Error::InvalidResponse("device returned a zero frame interval"));
        }
        debug!(
            interval = result.frame_interval,
            max_frame_size = result.max_video_frame_size,
            max_payload = result.max_payload_transfer_size,
            "Probe result"
        );
        Ok(result)
    }

    /// SET_CUR on the commit control with a probed result.
    pub fn commit(&self, ctrl: &StreamingControl) -> Result<()> {
        self.set_cur(VS_COMMIT_CONTROL, ctrl)
    }
}
