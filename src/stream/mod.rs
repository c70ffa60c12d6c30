//! Video stream lifecycle: open, start, stop, close.
//!
//! ```text
//!  CLOSED --open--> OPENED --start--> STREAMING
//!                     ^                  |
//!                     +-------stop-------+
//!  OPENED --close--> CLOSED
//!  any --device gone--> DEVICE_GONE --close--> CLOSED
//! ```
//!
//! State touched from both the transfer completion path and the
//! application is split in two: the negotiated format and the streaming
//! flag can be read without locking, the reassembler lives behind a mutex
//! that only the completion path takes while streaming.

pub mod negotiate;
mod transfer;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use flume::RecvTimeoutError;
use tracing::{debug, info, instrument, warn};

use crate::capture::{Frame, Reassembler, VideoFormat};
use crate::descriptor::uvc::{FormatMatch, FrameDescriptor, StreamingInterface, UvcConfig};
use crate::error::{Error, Result};
use crate::pipeline::FramePool;
use crate::usb::{SetupPacket, Transfer, UsbDevice};
use crate::Settings;

use negotiate::{StreamControl, StreamingControl};

/// How long `stop` waits for the transport to hand back every transfer
pub const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Called from the transfer completion path with every completed frame.
///
/// Return `Some(frame)` to give the buffer straight back to the pool, or
/// `None` to keep it; a kept frame must later go back through
/// [`Stream::frame_return`] or the pool runs dry. The callback must not
/// block, and must not call [`Stream::stop`] or [`Stream::close`]. For
/// heavier processing use [`crate::pipeline::frame_channel`].
pub type FrameCallback = Box<dyn FnMut(Frame) -> Option<Frame> + Send>;

/// Called with asynchronous stream events. Same restrictions as
/// [`FrameCallback`].
pub type EventCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

#[derive(Debug)]
pub enum StreamEvent {
    /// A transfer failed; carries the backend error code
    TransferError(i32),
    /// The device went away. The stream must still be closed.
    DeviceDisconnected(Stream),
    /// A frame did not fit its buffer
    FrameOverflow,
    /// No empty buffer was available for a new frame
    FrameUnderflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opened,
    Streaming,
    DeviceGone,
    Closed,
}

/// Everything needed to open a stream
pub struct StreamConfig {
    pub settings: Settings,
    pub frame_cb: FrameCallback,
    pub event_cb: Option<EventCallback>,
}

impl StreamConfig {
    pub fn new(settings: Settings, frame_cb: FrameCallback) -> Self {
        Self {
            settings,
            frame_cb,
            event_cb: None,
        }
    }

    pub fn with_event_callback(mut self, cb: impl Fn(StreamEvent) + Send + Sync + 'static) -> Self {
        self.event_cb = Some(Arc::new(cb));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let advanced = &self.settings.advanced;
        if advanced.number_of_frame_buffers == 0 {
            return Err(Error::InvalidArg("number_of_frame_buffers must be non-zero"));
        }
        if advanced.number_of_transfers == 0 {
            return Err(Error::InvalidArg("number_of_transfers must be non-zero"));
        }
        if advanced.transfer_size == 0 {
            return Err(Error::InvalidArg("transfer_size must be non-zero"));
        }
        if advanced.frame_size == Some(0) {
            return Err(Error::InvalidArg("frame_size override must be non-zero"));
        }
        Ok(())
    }
}

/// Snapshot of the per-stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub overflows: u64,
    pub underflows: u64,
    pub transfer_errors: u64,
}

#[derive(Default)]
struct Counters {
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    overflows: AtomicU64,
    underflows: AtomicU64,
    transfer_errors: AtomicU64,
}

/// Parameters agreed with the device at the last commit
#[derive(Debug, Clone)]
struct Negotiated {
    format: VideoFormat,
    control: StreamingControl,
    max_frame_size: usize,
    alt_setting: u8,
}

/// Reassembly state, owned by the completion path while streaming
struct Completion {
    reassembler: Reassembler,
    frame_cb: FrameCallback,
}

pub(crate) struct StreamInner {
    device: Arc<dyn UsbDevice>,
    address: u8,
    interface: u8,
    endpoint: u8,
    bcd_uvc: u16,
    bulk: bool,
    descriptors: StreamingInterface,
    frame_size_override: bool,
    transfer_count: usize,

    negotiated: ArcSwap<Negotiated>,
    streaming: AtomicBool,
    state: Mutex<StreamState>,
    /// Serializes lifecycle calls; may be held across blocking transport calls
    ops: Mutex<()>,

    completion: Mutex<Completion>,
    pool: FramePool,

    idle: Mutex<Vec<Transfer>>,
    in_flight: AtomicUsize,
    parked_tx: flume::Sender<()>,
    parked_rx: flume::Receiver<()>,

    events: Option<EventCallback>,
    counters: CachePadded<Counters>,
}

/// Handle to an open video stream. Clones refer to the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frame size to allocate for a negotiated format
fn negotiated_frame_size(ctrl: &StreamingControl, frame: &FrameDescriptor) -> usize {
    if ctrl.max_video_frame_size > 0 {
        ctrl.max_video_frame_size as usize
    } else if frame.max_frame_buffer_size > 0 {
        frame.max_frame_buffer_size as usize
    } else {
        frame.width as usize * frame.height as usize * 2
    }
}

impl Stream {
    /// Claim the streaming interface, negotiate the format and allocate
    /// buffers and transfers. The device has already been selected.
    #[instrument(skip_all, fields(address = device.info().address))]
    pub(crate) fn open(
        device: Arc<dyn UsbDevice>,
        uvc: &UvcConfig,
        config: StreamConfig,
    ) -> Result<Self> {
        config.validate()?;
        let settings = &config.settings;
        let descriptors = uvc
            .streaming
            .get(settings.device.stream_index)
            .cloned()
            .ok_or(Error::NotFound("streaming interface"))?;
        let matched = descriptors
            .find_format(&settings.format)
            .ok_or(Error::NotFound("no format matches the request"))?;

        let (bulk, endpoint, packet_size) = match descriptors.bulk_endpoint() {
            Some(ep) => (true, ep.address, ep.max_packet_size as usize),
            None => {
                // Slots sized for the biggest alternate setting, so a later
                // format commit can move to any of them.
                let (_, ep) = descriptors
                    .isoc_alt_setting(usize::MAX)
                    .ok_or(Error::NotFound("streaming endpoint"))?;
                (false, ep.address, ep.effective_packet_size())
            }
        };

        device.claim_interface(descriptors.number, 0)?;
        let negotiated = Self::negotiate(device.as_ref(), uvc.bcd_uvc, &descriptors, &matched)
            .and_then(|negotiated| {
                let size = settings.advanced.frame_size.unwrap_or(negotiated.max_frame_size);
                let pool = FramePool::allocate(
                    settings.advanced.number_of_frame_buffers,
                    size,
                    negotiated.format,
                )?;
                Ok((negotiated, pool))
            });
        let (negotiated, pool) = match negotiated {
            Ok(ok) => ok,
            Err(e) => {
                if let Err(release) = device.release_interface(descriptors.number) {
                    warn!(%release, "Failed to release interface after open error");
                }
                return Err(e);
            }
        };

        let advanced = &settings.advanced;
        let (parked_tx, parked_rx) = flume::unbounded();
        let inner = Arc::new(StreamInner {
            address: device.info().address,
            device,
            interface: descriptors.number,
            endpoint,
            bcd_uvc: uvc.bcd_uvc,
            bulk,
            frame_size_override: advanced.frame_size.is_some(),
            transfer_count: advanced.number_of_transfers,
            completion: Mutex::new(Completion {
                reassembler: Reassembler::new(negotiated.max_frame_size, advanced.deliver_truncated),
                frame_cb: config.frame_cb,
            }),
            descriptors,
            negotiated: ArcSwap::from_pointee(negotiated),
            streaming: AtomicBool::new(false),
            state: Mutex::new(StreamState::Opened),
            ops: Mutex::new(()),
            pool,
            idle: Mutex::new(Vec::with_capacity(advanced.number_of_transfers)),
            in_flight: AtomicUsize::new(0),
            parked_tx,
            parked_rx,
            events: config.event_cb,
            counters: CachePadded::new(Counters::default()),
        });

        {
            let callback = transfer::completion_fn(Arc::downgrade(&inner));
            let mut idle = lock(&inner.idle);
            for _ in 0..advanced.number_of_transfers {
                let transfer = if bulk {
                    let size = advanced.transfer_size.div_ceil(packet_size.max(1)) * packet_size.max(1);
                    Transfer::bulk(endpoint, size, Arc::clone(&callback))
                } else {
                    let packets = (advanced.transfer_size / packet_size).max(1);
                    Transfer::isochronous(endpoint, packets, packet_size, Arc::clone(&callback))
                };
                idle.push(transfer);
            }
        }

        let stream = Stream { inner };
        info!(
            interface = stream.inner.interface,
            endpoint = format_args!("{:#04x}", endpoint),
            bulk,
            format = ?stream.format(),
            "Stream opened"
        );
        Ok(stream)
    }

    fn negotiate(
        device: &dyn UsbDevice,
        bcd_uvc: u16,
        descriptors: &StreamingInterface,
        matched: &FormatMatch<'_>,
    ) -> Result<Negotiated> {
        let control = StreamControl {
            device,
            interface: descriptors.number,
            bcd_uvc,
        };
        let probed = control.probe(&StreamingControl::request(matched))?;
        let alt_setting = match descriptors.bulk_endpoint() {
            Some(_) => 0,
            None => {
                descriptors
                    .isoc_alt_setting(probed.max_payload_transfer_size as usize)
                    .ok_or(Error::NotFound("isochronous alternate setting"))?
                    .0
            }
        };
        control.commit(&probed)?;

        let mut format = matched.video_format();
        format.fps = crate::descriptor::uvc::interval_to_fps(probed.frame_interval);
        Ok(Negotiated {
            format,
            max_frame_size: negotiated_frame_size(&probed, matched.frame),
            control: probed,
            alt_setting,
        })
    }

    /// Submit all transfers and start delivering frames.
    #[instrument(skip(self), fields(address = self.inner.address))]
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _ops = lock(&inner.ops);
        self.expect_state(StreamState::Opened)?;

        let negotiated = inner.negotiated.load();
        if !inner.bulk {
            inner
                .device
                .set_interface(inner.interface, negotiated.alt_setting)?;
        }

        while inner.parked_rx.try_recv().is_ok() {}
        self.reset_reassembly(negotiated.max_frame_size);

        // The device may have gone away while the alternate setting changed
        self.transition(StreamState::Opened, StreamState::Streaming)?;

        if let Err(e) = inner.submit_idle() {
            warn!(%e, "Failed to submit transfers, rolling back");
            if let Err(stop) = self.halt_and_drain() {
                warn!(%stop, "Rollback did not drain all transfers");
            }
            if let Err(rollback) = self.transition(StreamState::Streaming, StreamState::Opened) {
                debug!(%rollback, "Stream left streaming during rollback");
            }
            return Err(e.into());
        }
        info!(transfers = inner.transfer_count, "Streaming started");
        Ok(())
    }

    /// Cancel all transfers and wait until the transport has handed every
    /// one of them back. No reassembly runs once this returns.
    #[instrument(skip(self), fields(address = self.inner.address))]
    pub fn stop(&self) -> Result<()> {
        let _ops = lock(&self.inner.ops);
        self.transition(StreamState::Streaming, StreamState::Opened)?;
        self.halt_and_drain()?;
        info!("Streaming stopped");
        Ok(())
    }

    fn halt_and_drain(&self) -> Result<()> {
        let inner = &self.inner;
        inner.streaming.store(false, Ordering::Release);

        let cancel = if inner.bulk {
            inner.device.halt_endpoint(inner.endpoint)
        } else {
            inner.device.set_interface(inner.interface, 0)
        };
        if let Err(e) = cancel {
            warn!(%e, "Failed to cancel transfers, waiting for them to finish");
        }

        self.wait_idle(STOP_TIMEOUT)?;

        if inner.bulk {
            if let Err(e) = inner.device.clear_endpoint(inner.endpoint) {
                warn!(%e, "Failed to clear endpoint halt");
            }
        }
        self.reset_reassembly(inner.negotiated.load().max_frame_size);
        Ok(())
    }

    fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        while inner.in_flight.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match inner.parked_rx.recv_timeout(remaining) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    warn!(
                        in_flight = inner.in_flight.load(Ordering::Acquire),
                        "Timed out waiting for transfers"
                    );
                    return Err(Error::Timeout);
                }
            }
        }
        Ok(())
    }

    fn reset_reassembly(&self, max_frame_size: usize) {
        let frame = lock(&self.inner.completion).reassembler.reset(max_frame_size);
        if let Some(frame) = frame {
            if let Err(e) = self.inner.pool.return_frame(frame) {
                warn!(%e, "Failed to recycle frame in progress");
            }
        }
    }

    /// Release buffers, transfers and the interface. Streaming must be
    /// stopped first; a stream whose device is gone can always be closed.
    #[instrument(skip(self), fields(address = self.inner.address))]
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let _ops = lock(&inner.ops);
        // Marked closed up front so a late disconnect can't change the
        // teardown path below.
        let state = {
            let mut state = lock(&inner.state);
            let previous = *state;
            match previous {
                StreamState::Streaming => {
                    return Err(Error::InvalidState("stream must be stopped first"))
                }
                StreamState::Closed => return Err(Error::InvalidState("stream is closed")),
                StreamState::Opened | StreamState::DeviceGone => {}
            }
            *state = StreamState::Closed;
            previous
        };

        if inner.in_flight.load(Ordering::Acquire) > 0 {
            if let Err(e) = self.wait_idle(STOP_TIMEOUT) {
                warn!(%e, "Closing with transfers still owned by the transport");
            }
        }
        self.reset_reassembly(0);

        if !inner.pool.are_all_returned() {
            warn!(
                held = inner.pool.count() - inner.pool.available(),
                "Closing stream while the application still holds frames"
            );
        }
        inner.pool.free();
        lock(&inner.idle).clear();

        if state == StreamState::Opened {
            if let Err(e) = inner.device.release_interface(inner.interface) {
                warn!(%e, "Failed to release interface");
            }
        }
        info!("Stream closed");
        Ok(())
    }

    /// Give back a frame kept by the frame callback.
    pub fn frame_return(&self, frame: Frame) -> Result<()> {
        if self.state() == StreamState::Closed {
            return Err(Error::InvalidState("stream is closed"));
        }
        self.inner.pool.return_frame(frame)
    }

    /// Probe `format` without committing it. The stream must be opened and
    /// not streaming.
    pub fn probe(&self, format: &VideoFormat) -> Result<StreamingControl> {
        let inner = &self.inner;
        let _ops = lock(&inner.ops);
        self.expect_state(StreamState::Opened)?;
        let matched = inner
            .descriptors
            .find_format(format)
            .ok_or(Error::NotFound("no format matches the request"))?;
        self.control().probe(&StreamingControl::request(&matched))
    }

    /// Negotiate and commit a new format on a stopped stream.
    ///
    /// Every frame must be back in the pool. The stream is left untouched on
    /// failure.
    #[instrument(skip(self), fields(address = self.inner.address))]
    pub fn format_commit(&self, format: &VideoFormat) -> Result<()> {
        let inner = &self.inner;
        let _ops = lock(&inner.ops);
        self.expect_state(StreamState::Opened)?;
        if !inner.pool.are_all_returned() {
            return Err(Error::InvalidState("frames are still held by the application"));
        }

        let matched = inner
            .descriptors
            .find_format(format)
            .ok_or(Error::NotFound("no format matches the request"))?;
        let control = self.control();
        let probed = control.probe(&StreamingControl::request(&matched))?;

        let max_frame_size = negotiated_frame_size(&probed, matched.frame);
        if !inner.frame_size_override && max_frame_size > inner.pool.frame_size() {
            return Err(Error::InvalidSize {
                expected: inner.pool.frame_size(),
                actual: max_frame_size,
            });
        }
        let alt_setting = if inner.bulk {
            0
        } else {
            inner
                .descriptors
                .isoc_alt_setting(probed.max_payload_transfer_size as usize)
                .ok_or(Error::NotFound("isochronous alternate setting"))?
                .0
        };

        control.commit(&probed)?;

        let mut negotiated_format = matched.video_format();
        negotiated_format.fps = crate::descriptor::uvc::interval_to_fps(probed.frame_interval);
        inner.pool.refresh_format(negotiated_format)?;
        inner.negotiated.store(Arc::new(Negotiated {
            format: negotiated_format,
            control: probed,
            max_frame_size,
            alt_setting,
        }));
        info!(format = ?negotiated_format, max_frame_size, "Format committed");
        Ok(())
    }

    /// Raw control transfer to the device, for camera and processing-unit
    /// controls.
    pub fn usb_control(&self, setup: SetupPacket, data: &mut [u8]) -> Result<usize> {
        match self.state() {
            StreamState::Opened | StreamState::Streaming => {}
            StreamState::DeviceGone => return Err(Error::InvalidState("device is gone")),
            StreamState::Closed => return Err(Error::InvalidState("stream is closed")),
        }
        Ok(self.inner.device.control_transfer(setup, data)?)
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.inner.state)
    }

    /// Format agreed at the last commit
    pub fn format(&self) -> VideoFormat {
        self.inner.negotiated.load().format
    }

    /// Probe/commit structure agreed at the last commit
    pub fn streaming_control(&self) -> StreamingControl {
        self.inner.negotiated.load().control
    }

    pub fn max_frame_size(&self) -> usize {
        self.inner.negotiated.load().max_frame_size
    }

    /// Everything the streaming interface advertises
    pub fn formats(&self) -> Vec<VideoFormat> {
        self.inner.descriptors.formats()
    }

    pub fn is_bulk(&self) -> bool {
        self.inner.bulk
    }

    pub fn device_address(&self) -> u8 {
        self.inner.address
    }

    pub fn interface(&self) -> u8 {
        self.inner.interface
    }

    /// Frames currently sitting in the pool
    pub fn frames_available(&self) -> usize {
        self.inner.pool.available()
    }

    pub fn stats(&self) -> StreamStats {
        let c = &self.inner.counters;
        StreamStats {
            frames_delivered: c.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            overflows: c.overflows.load(Ordering::Relaxed),
            underflows: c.underflows.load(Ordering::Relaxed),
            transfer_errors: c.transfer_errors.load(Ordering::Relaxed),
        }
    }

    /// Force the stream out of service after the device disappeared.
    pub(crate) fn device_gone(&self) {
        {
            let mut state = lock(&self.inner.state);
            if matches!(*state, StreamState::Closed | StreamState::DeviceGone) {
                return;
            }
            *state = StreamState::DeviceGone;
            self.inner.streaming.store(false, Ordering::Release);
        }
        info!(address = self.inner.address, "Device disconnected");
        self.inner.emit(StreamEvent::DeviceDisconnected(self.clone()));
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<StreamInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<StreamInner>) -> Self {
        Self { inner }
    }

    fn control(&self) -> StreamControl<'_> {
        StreamControl {
            device: self.inner.device.as_ref(),
            interface: self.inner.interface,
            bcd_uvc: self.inner.bcd_uvc,
        }
    }

    fn expect_state(&self, expected: StreamState) -> Result<()> {
        let state = self.state();
        if state == expected {
            return Ok(());
        }
        debug!(?state, ?expected, "Rejected call in wrong state");
        Err(wrong_state(state))
    }

    /// Move from `from` to `to` under a single state lock. The streaming
    /// flag follows the new state.
    fn transition(&self, from: StreamState, to: StreamState) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if *state != from {
            debug!(state = ?*state, expected = ?from, "Rejected call in wrong state");
            return Err(wrong_state(*state));
        }
        *state = to;
        self.inner
            .streaming
            .store(to == StreamState::Streaming, Ordering::Release);
        Ok(())
    }
}

fn wrong_state(state: StreamState) -> Error {
    match state {
        StreamState::Closed => Error::InvalidState("stream is closed"),
        StreamState::DeviceGone => Error::InvalidState("device is gone"),
        StreamState::Streaming => Error::InvalidState("stream is streaming"),
        StreamState::Opened => Error::InvalidState("stream is not streaming"),
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("address", &self.inner.address)
            .field("interface", &self.inner.interface)
            .field("endpoint", &self.inner.endpoint)
            .field("bulk", &self.inner.bulk)
            .finish()
    }
}
