//! Transfer completion path.
//!
//! The transport calls back here once per finished transfer, serialized per
//! endpoint. This is the only code that touches the reassembler while the
//! stream is running.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tracing::{debug, error, trace, warn};

use super::{lock, Counters, EventCallback, FrameCallback, StreamEvent, StreamInner};
use crate::capture::{Frame, FrameSink};
use crate::pipeline::FramePool;
use crate::usb::{CompletionFn, SubmitError, Transfer, TransferStatus, TransportError};

pub(super) fn completion_fn(stream: Weak<StreamInner>) -> CompletionFn {
    Arc::new(move |transfer| match stream.upgrade() {
        Some(inner) => inner.on_transfer_complete(transfer),
        None => trace!("Transfer completed after its stream was dropped"),
    })
}

/// Frame sink backed by the stream's pool and the application callbacks
struct StreamSink<'a> {
    pool: &'a FramePool,
    frame_cb: &'a mut FrameCallback,
    events: Option<&'a EventCallback>,
    counters: &'a Counters,
}

impl StreamSink<'_> {
    fn emit(&self, event: StreamEvent) {
        if let Some(cb) = self.events {
            cb(event);
        }
    }

    fn recycle(&self, frame: Frame) {
        if let Err(e) = self.pool.return_frame(frame) {
            error!("Failed to recycle frame: {}", e);
        }
    }
}

impl FrameSink for StreamSink<'_> {
    fn take_empty(&mut self) -> Option<Frame> {
        self.pool.get_empty()
    }

    fn deliver(&mut self, frame: Frame) {
        self.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("uvc.frames_delivered").increment(1);
        if let Some(frame) = (self.frame_cb)(frame) {
            self.recycle(frame);
        }
    }

    fn discard(&mut self, frame: Frame) {
        if !frame.is_empty() {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("uvc.frames_dropped").increment(1);
        }
        self.recycle(frame);
    }

    fn overflow(&mut self) {
        self.counters.overflows.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("uvc.frame_overflows").increment(1);
        self.emit(StreamEvent::FrameOverflow);
    }

    fn underflow(&mut self) {
        self.counters.underflows.fetch_add(1, Ordering::Relaxed);
        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("uvc.frame_underflows").increment(1);
        self.emit(StreamEvent::FrameUnderflow);
    }
}

impl StreamInner {
    fn on_transfer_complete(&self, transfer: Transfer) {
        let status = transfer.status;
        match status {
            TransferStatus::Completed => self.process(&transfer),
            TransferStatus::Canceled => trace!("Transfer canceled"),
            TransferStatus::NoDevice => debug!("Transfer failed, device is gone"),
            other => {
                warn!(?other, "Transfer failed");
                self.counters.transfer_errors.fetch_add(1, Ordering::Relaxed);
                self.emit(StreamEvent::TransferError(other.code()));
            }
        }

        let resubmit = self.streaming.load(Ordering::Acquire)
            && !matches!(status, TransferStatus::Canceled | TransferStatus::NoDevice);
        if !resubmit {
            self.park(transfer);
            return;
        }
        if let Err(SubmitError { error, transfer }) = self.device.submit(transfer) {
            warn!(%error, "Failed to resubmit transfer");
            self.counters.transfer_errors.fetch_add(1, Ordering::Relaxed);
            self.emit(StreamEvent::TransferError(error.code()));
            self.park(transfer);
        }
    }

    fn process(&self, transfer: &Transfer) {
        let mut region = lock(&self.completion);
        let region = &mut *region;
        let mut sink = StreamSink {
            pool: &self.pool,
            frame_cb: &mut region.frame_cb,
            events: self.events.as_ref(),
            counters: &self.counters,
        };

        if transfer.is_isochronous() {
            for (payload, status) in transfer.isoc_payloads() {
                if status != TransferStatus::Completed {
                    trace!(?status, "Bad isochronous packet");
                    region.reassembler.corrupt();
                    continue;
                }
                region.reassembler.isoc_packet(payload, &mut sink);
            }
        } else {
            let short = transfer.actual_num_bytes < transfer.num_bytes;
            region
                .reassembler
                .bulk_packet(transfer.data(), short, &mut sink);
        }
    }

    /// Take a transfer out of circulation; `stop` waits for all of them.
    pub(super) fn park(&self, transfer: Transfer) {
        lock(&self.idle).push(transfer);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        let _ = self.parked_tx.send(());
    }

    /// Hand every idle transfer to the transport.
    pub(super) fn submit_idle(&self) -> Result<(), TransportError> {
        let transfers: Vec<Transfer> = lock(&self.idle).drain(..).collect();
        let mut transfers = transfers.into_iter();
        while let Some(transfer) = transfers.next() {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            if let Err(SubmitError { error, transfer }) = self.device.submit(transfer) {
                self.park(transfer);
                lock(&self.idle).extend(transfers);
                return Err(error);
            }
        }
        Ok(())
    }

    pub(super) fn emit(&self, event: StreamEvent) {
        if let Some(cb) = &self.events {
            cb(event);
        }
    }
}
