//! Scripted USB device for driving streams without hardware
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use uvc_host::descriptor::uvc::{vc, vs, CLASS_VIDEO};
use uvc_host::descriptor::{DESC_CS_INTERFACE, DESC_ENDPOINT, DESC_INTERFACE};
use uvc_host::stream::negotiate::{StreamingControl, GET_CUR, SET_CUR, VS_COMMIT_CONTROL};
use uvc_host::usb::{
    DeviceInfo, SetupPacket, SubmitError, Transfer, TransferStatus, TransportError, UsbDevice,
};

pub const VENDOR_ID: u16 = 0x046d;
pub const PRODUCT_ID: u16 = 0x0825;
pub const STREAMING_INTERFACE: u8 = 1;
pub const ENDPOINT: u8 = 0x81;

fn frame_mjpeg(index: u8, w: u16, h: u16, intervals: &[u32]) -> Vec<u8> {
    let mut d = vec![0, DESC_CS_INTERFACE, vs::FRAME_MJPEG, index, 0];
    d.extend_from_slice(&w.to_le_bytes());
    d.extend_from_slice(&h.to_le_bytes());
    d.extend_from_slice(&0u32.to_le_bytes());
    d.extend_from_slice(&0u32.to_le_bytes());
    d.extend_from_slice(&(w as u32 * h as u32 * 2).to_le_bytes());
    d.extend_from_slice(&intervals[0].to_le_bytes());
    d.push(intervals.len() as u8);
    for i in intervals {
        d.extend_from_slice(&i.to_le_bytes());
    }
    d[0] = d.len() as u8;
    d
}

/// Configuration descriptor of a UVC 1.1 camera with one MJPEG format
/// (640x480 at 30/15 fps, 1280x720 at 30 fps).
pub fn camera_descriptor(bulk: bool) -> Vec<u8> {
    let mut c = vec![9, 2, 0, 0, 2, 1, 0, 0x80, 250];
    c.extend_from_slice(&[9, DESC_INTERFACE, 0, 0, 0, CLASS_VIDEO, 1, 0, 0]);
    c.extend_from_slice(&[13, DESC_CS_INTERFACE, vc::HEADER, 0x10, 0x01, 0, 0, 0, 0, 0, 0, 1, 1]);

    let alt0_endpoints = if bulk { 1 } else { 0 };
    c.extend_from_slice(&[9, DESC_INTERFACE, STREAMING_INTERFACE, 0, alt0_endpoints, CLASS_VIDEO, 2, 0, 0]);
    c.extend_from_slice(&[14, DESC_CS_INTERFACE, vs::INPUT_HEADER, 1, 0, 0, ENDPOINT, 0, 3, 0, 0, 0, 1, 0]);
    c.extend_from_slice(&[11, DESC_CS_INTERFACE, vs::FORMAT_MJPEG, 1, 2, 0, 1, 0, 0, 0, 0]);
    c.extend(frame_mjpeg(1, 640, 480, &[333_333, 666_666]));
    c.extend(frame_mjpeg(2, 1280, 720, &[333_333]));

    if bulk {
        c.extend_from_slice(&[7, DESC_ENDPOINT, ENDPOINT, 0x02, 0x00, 0x02, 0]);
    } else {
        // alt 1: 512 bytes, alt 2: 3 x 1024 bytes
        c.extend_from_slice(&[9, DESC_INTERFACE, STREAMING_INTERFACE, 1, 1, CLASS_VIDEO, 2, 0, 0]);
        c.extend_from_slice(&[7, DESC_ENDPOINT, ENDPOINT, 0x05, 0x00, 0x02, 1]);
        c.extend_from_slice(&[9, DESC_INTERFACE, STREAMING_INTERFACE, 2, 1, CLASS_VIDEO, 2, 0, 0]);
        c.extend_from_slice(&[7, DESC_ENDPOINT, ENDPOINT, 0x05, 0x00, 0x14, 1]);
    }
    c
}

/// Payload header with optional EOF
pub fn header(fid: bool, eof: bool) -> Vec<u8> {
    let mut info = 0x80u8;
    if fid {
        info |= 0x01;
    }
    if eof {
        info |= 0x02;
    }
    vec![2, info]
}

pub fn payload(fid: bool, eof: bool, data: &[u8]) -> Vec<u8> {
    let mut p = header(fid, eof);
    p.extend_from_slice(data);
    p
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MockState {
    claimed: Vec<u8>,
    alt_setting: u8,
    pending: VecDeque<Transfer>,
    probe: Vec<u8>,
    commits: Vec<StreamingControl>,
    fail_submit: bool,
    max_frame_size: u32,
    max_payload: u32,
    gone: bool,
    on_claim: Option<Hook>,
    on_set_interface: Option<Hook>,
}

pub struct MockDevice {
    info: DeviceInfo,
    descriptor: Bytes,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new(address: u8, bulk: bool) -> Arc<Self> {
        Self::with_descriptor(address, camera_descriptor(bulk))
    }

    pub fn with_descriptor(address: u8, descriptor: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            info: DeviceInfo {
                address,
                vendor_id: VENDOR_ID,
                product_id: PRODUCT_ID,
            },
            descriptor: Bytes::from(descriptor),
            state: Mutex::new(MockState {
                max_frame_size: 4096,
                max_payload: 1024,
                ..Default::default()
            }),
        })
    }

    pub fn set_max_frame_size(&self, size: u32) {
        self.state.lock().unwrap().max_frame_size = size;
    }

    pub fn fail_submit(&self, fail: bool) {
        self.state.lock().unwrap().fail_submit = fail;
    }

    /// Run `hook` once, inside the next `claim_interface`, before the
    /// interface is marked claimed.
    pub fn on_claim(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().unwrap().on_claim = Some(Box::new(hook));
    }

    /// Run `hook` once, inside the next `set_interface` to a non-zero
    /// alternate setting.
    pub fn on_set_interface(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().unwrap().on_set_interface = Some(Box::new(hook));
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn alt_setting(&self) -> u8 {
        self.state.lock().unwrap().alt_setting
    }

    pub fn is_claimed(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .claimed
            .contains(&STREAMING_INTERFACE)
    }

    pub fn commits(&self) -> Vec<StreamingControl> {
        self.state.lock().unwrap().commits.clone()
    }

    fn take_pending(&self) -> Option<Transfer> {
        self.state.lock().unwrap().pending.pop_front()
    }

    fn cancel_all(&self, status: TransferStatus) {
        let pending: Vec<Transfer> = self.state.lock().unwrap().pending.drain(..).collect();
        for mut transfer in pending {
            transfer.status = status;
            transfer.actual_num_bytes = 0;
            transfer.complete();
        }
    }

    /// Complete the oldest isochronous transfer with one packet per entry.
    pub fn complete_isoc(&self, packets: &[Vec<u8>]) -> bool {
        let packets: Vec<(Vec<u8>, TransferStatus)> = packets
            .iter()
            .map(|p| (p.clone(), TransferStatus::Completed))
            .collect();
        self.complete_isoc_with(&packets)
    }

    /// Like `complete_isoc`, with a status per packet.
    pub fn complete_isoc_with(&self, packets: &[(Vec<u8>, TransferStatus)]) -> bool {
        let Some(mut transfer) = self.take_pending() else {
            return false;
        };
        let slot = transfer.isoc_packets[0].num_bytes;
        assert!(packets.len() <= transfer.isoc_packets.len());
        for (i, packet) in transfer.isoc_packets.iter_mut().enumerate() {
            let (data, status) = packets
                .get(i)
                .map_or((&[][..], TransferStatus::Completed), |(d, s)| (d.as_slice(), *s));
            transfer.buffer[i * slot..i * slot + data.len()].copy_from_slice(data);
            packet.actual_num_bytes = data.len();
            packet.status = status;
        }
        transfer.actual_num_bytes = packets.iter().map(|(d, _)| d.len()).sum();
        transfer.status = TransferStatus::Completed;
        transfer.complete();
        true
    }

    /// Complete the oldest bulk transfer with `data`; shorter than the
    /// transfer size means a short packet.
    pub fn complete_bulk(&self, data: &[u8]) -> bool {
        let Some(mut transfer) = self.take_pending() else {
            return false;
        };
        transfer.buffer[..data.len()].copy_from_slice(data);
        transfer.actual_num_bytes = data.len();
        transfer.status = TransferStatus::Completed;
        transfer.complete();
        true
    }

    /// Size of the transfers the stream submitted
    pub fn transfer_size(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .pending
            .front()
            .map_or(0, |t| t.num_bytes)
    }

    pub fn fail_next(&self, status: TransferStatus) -> bool {
        let Some(mut transfer) = self.take_pending() else {
            return false;
        };
        transfer.status = status;
        transfer.complete();
        true
    }

    /// Unplug: every pending transfer comes back with NoDevice.
    pub fn unplug(&self) {
        self.state.lock().unwrap().gone = true;
        self.cancel_all(TransferStatus::NoDevice);
    }
}

impl UsbDevice for MockDevice {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn config_descriptor(&self) -> Bytes {
        self.descriptor.clone()
    }

    fn claim_interface(&self, interface: u8, _alt_setting: u8) -> Result<(), TransportError> {
        let hook = self.state.lock().unwrap().on_claim.take();
        if let Some(hook) = hook {
            hook();
        }
        let mut state = self.state.lock().unwrap();
        if state.claimed.contains(&interface) {
            return Err(TransportError::Backend(-6));
        }
        state.claimed.push(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        self.state.lock().unwrap().claimed.retain(|&i| i != interface);
        Ok(())
    }

    fn set_interface(&self, _interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        let hook = if alt_setting == 0 {
            None
        } else {
            self.state.lock().unwrap().on_set_interface.take()
        };
        if let Some(hook) = hook {
            hook();
        }
        self.state.lock().unwrap().alt_setting = alt_setting;
        if alt_setting == 0 {
            self.cancel_all(TransferStatus::Canceled);
        }
        Ok(())
    }

    fn halt_endpoint(&self, _endpoint: u8) -> Result<(), TransportError> {
        self.cancel_all(TransferStatus::Canceled);
        Ok(())
    }

    fn clear_endpoint(&self, _endpoint: u8) -> Result<(), TransportError> {
        Ok(())
    }

    fn control_transfer(&self, setup: SetupPacket, data: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.gone {
            return Err(TransportError::NoDevice);
        }
        let selector = (setup.value >> 8) as u8;
        match setup.request {
            SET_CUR if selector == VS_COMMIT_CONTROL => {
                let ctrl = StreamingControl::decode(data).map_err(|_| TransportError::Stall)?;
                state.commits.push(ctrl);
            }
            SET_CUR => state.probe = data.to_vec(),
            GET_CUR => {
                let mut ctrl =
                    StreamingControl::decode(&state.probe).map_err(|_| TransportError::Stall)?;
                ctrl.max_video_frame_size = state.max_frame_size;
                ctrl.max_payload_transfer_size = state.max_payload;
                let reply = ctrl.encode(data.len());
                data.copy_from_slice(&reply);
            }
            _ => return Err(TransportError::Stall),
        }
        Ok(data.len())
    }

    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_submit || state.gone {
            let error = if state.gone {
                TransportError::NoDevice
            } else {
                TransportError::Backend(-1)
            };
            return Err(SubmitError { error, transfer });
        }
        state.pending.push_back(transfer);
        Ok(())
    }
}
