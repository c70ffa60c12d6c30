//! Library context: attached devices and the streams opened on them.
//!
//! The application feeds connect and disconnect events from its USB host
//! task into [`UvcHost`]; streams are opened through it so that a
//! disconnect can reach every stream on the device.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::stream::{lock, Stream, StreamConfig, StreamInner, StreamState};
use crate::usb::UsbDevice;
use crate::utils::find_device;

#[derive(Default)]
struct HostInner {
    devices: Vec<Arc<dyn UsbDevice>>,
    streams: Vec<Weak<StreamInner>>,
    /// (address, interface) pairs picked by an `open` still in progress
    reserved: Vec<(u8, u8)>,
    /// Tasks blocked in `open`, woken on every new device
    waiters: Vec<flume::Sender<()>>,
}

impl HostInner {
    fn live_streams(&mut self) -> Vec<Stream> {
        self.streams.retain(|s| s.strong_count() > 0);
        self.streams
            .iter()
            .filter_map(Weak::upgrade)
            .map(Stream::from_inner)
            .filter(|s| s.state() != StreamState::Closed)
            .collect()
    }
}

/// Handle to the UVC host context. Clones share the same context.
#[derive(Clone, Default)]
pub struct UvcHost {
    inner: Arc<Mutex<HostInner>>,
}

impl UvcHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device finished enumeration.
    pub fn device_connected(&self, device: Arc<dyn UsbDevice>) {
        let info = device.info();
        let mut inner = lock(&self.inner);
        inner.devices.retain(|d| d.info().address != info.address);
        inner.devices.push(device);
        inner.waiters.retain(|tx| tx.send(()).is_ok());
        debug!(address = info.address, "Device connected");
    }

    /// A device went away. Every stream open on it moves to
    /// [`StreamState::DeviceGone`] and gets a disconnect event.
    pub fn device_gone(&self, address: u8) {
        let streams = {
            let mut inner = lock(&self.inner);
            inner.devices.retain(|d| d.info().address != address);
            inner.live_streams()
        };
        // Events go out without the host lock held so callbacks may call back in.
        for stream in streams.into_iter().filter(|s| s.device_address() == address) {
            stream.device_gone();
        }
        info!(address, "Device removed");
    }

    pub fn devices(&self) -> Vec<Arc<dyn UsbDevice>> {
        lock(&self.inner).devices.clone()
    }

    /// Open a stream on the first device matching the configured selector,
    /// waiting up to `timeout` for one to be connected.
    #[instrument(skip_all, fields(selector = ?config.settings.device))]
    pub fn open(&self, config: StreamConfig, timeout: Duration) -> Result<Stream> {
        config.validate()?;
        let deadline = Instant::now() + timeout;
        let (tx, rx) = flume::unbounded();
        lock(&self.inner).waiters.push(tx);

        let found = loop {
            let found = {
                let mut inner = lock(&self.inner);
                let mut in_use: Vec<(u8, u8)> = inner
                    .live_streams()
                    .iter()
                    .map(|s| (s.device_address(), s.interface()))
                    .collect();
                in_use.extend_from_slice(&inner.reserved);
                let found = find_device(&inner.devices, &config.settings.device, &in_use)
                    .and_then(|(device, uvc)| {
                        let vs = uvc.streaming.get(config.settings.device.stream_index)?;
                        let key = (device.info().address, vs.number);
                        Some((device, uvc, key))
                    });
                if let Some((_, _, key)) = &found {
                    inner.reserved.push(*key);
                }
                found
            };
            if let Some(found) = found {
                break Some(found);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || rx.recv_timeout(remaining).is_err() {
                break None;
            }
        };
        drop(rx);

        let Some((device, uvc, key)) = found else {
            debug!("No matching device before timeout");
            return Err(Error::NotFound("no matching device"));
        };
        let opened = Stream::open(device, &uvc, config);
        let mut inner = lock(&self.inner);
        if let Some(pos) = inner.reserved.iter().position(|r| *r == key) {
            inner.reserved.swap_remove(pos);
        }
        let stream = opened?;
        inner.streams.push(stream.downgrade());
        Ok(stream)
    }
}
