//! Reassembly of UVC payloads into frames.
//!
//! Isochronous streams carry a payload header in every packet; a frame ends
//! when the frame-ID bit toggles or a header carries the end-of-frame bit.
//! Bulk streams carry one header at the start of each payload transfer, and
//! the frame ends with a short packet.

use std::time::Instant;

use tracing::{debug, trace};

use super::frame::Frame;
use super::header::PayloadHeader;

/// Last frame-ID bit seen on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameId {
    /// Nothing seen since the stream (re)started; the next ID is accepted
    /// unconditionally.
    Unset,
    Zero,
    One,
}

impl FrameId {
    fn from_bit(fid: bool) -> Self {
        if fid {
            FrameId::One
        } else {
            FrameId::Zero
        }
    }

    fn starts_new_frame(self, fid: bool) -> bool {
        self != FrameId::from_bit(fid)
    }
}

/// Role expected of the next bulk packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkPacket {
    /// Payload header opening a frame
    Sof,
    /// Raw payload continuing the frame; a short packet closes it
    Data,
    /// Frame reached its maximum size; only a zero-length terminator may follow
    Eof,
}

/// Where reassembled frames go, and where empty ones come from.
///
/// Called from the transfer completion path: no method may block.
pub trait FrameSink {
    fn take_empty(&mut self) -> Option<Frame>;

    /// Hand a completed frame to the application.
    fn deliver(&mut self, frame: Frame);

    /// Put back a frame that won't be delivered.
    fn discard(&mut self, frame: Frame);

    /// A frame did not fit its buffer.
    fn overflow(&mut self);

    /// No empty buffer was available at a frame boundary.
    fn underflow(&mut self);
}

/// Per-stream reassembly state. Only the completion path touches it.
#[derive(Debug)]
pub struct Reassembler {
    current: Option<Frame>,
    frame_id: FrameId,
    skip_frame: bool,
    next_bulk: BulkPacket,
    max_frame_size: usize,
    deliver_truncated: bool,
    sequence: u64,
}

impl Reassembler {
    pub fn new(max_frame_size: usize, deliver_truncated: bool) -> Self {
        Self {
            current: None,
            frame_id: FrameId::Unset,
            skip_frame: false,
            next_bulk: BulkPacket::Sof,
            max_frame_size,
            deliver_truncated,
            sequence: 0,
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn next_bulk_packet(&self) -> BulkPacket {
        self.next_bulk
    }

    pub fn is_skipping(&self) -> bool {
        self.skip_frame
    }

    /// Drop all per-stream state and hand back the frame being assembled.
    pub fn reset(&mut self, max_frame_size: usize) -> Option<Frame> {
        self.frame_id = FrameId::Unset;
        self.skip_frame = false;
        self.next_bulk = BulkPacket::Sof;
        self.max_frame_size = max_frame_size;
        self.current.take()
    }

    /// Process one isochronous packet (header plus payload).
    pub fn isoc_packet(&mut self, packet: &[u8], sink: &mut impl FrameSink) {
        if packet.is_empty() {
            return;
        }
        let Some(header) = PayloadHeader::parse(packet) else {
            trace!(len = packet.len(), "Invalid payload header, dropping packet");
            if self.current.is_some() {
                self.skip_frame = true;
            }
            return;
        };

        if self.frame_id.starts_new_frame(header.fid) {
            self.start_frame(header.fid, sink);
        }
        if header.error {
            debug!("Payload header ERR set, skipping frame");
            self.skip_frame = true;
        }

        self.append(&packet[header.len..], header.pts, sink);

        if header.eof {
            self.finish_frame(sink);
        }
    }

    /// Mark the frame in progress corrupted (bad packet status).
    pub fn corrupt(&mut self) {
        if self.current.is_some() {
            self.skip_frame = true;
        }
    }

    /// Process one completed bulk transfer. `short` means the device sent
    /// fewer bytes than requested.
    pub fn bulk_packet(&mut self, data: &[u8], short: bool, sink: &mut impl FrameSink) {
        match self.next_bulk {
            BulkPacket::Sof => {
                let Some(header) = PayloadHeader::parse(data) else {
                    if !data.is_empty() {
                        debug!(len = data.len(), "Unexpected bulk packet while waiting for SOF");
                        self.skip_frame = true;
                    }
                    return;
                };
                self.start_frame(header.fid, sink);
                if header.error {
                    self.skip_frame = true;
                }
                self.append(&data[header.len..], header.pts, sink);
                self.next_bulk = BulkPacket::Data;
                if short {
                    self.end_bulk_frame(sink);
                } else {
                    self.check_bulk_full();
                }
            }
            BulkPacket::Data => {
                self.append(data, None, sink);
                if short {
                    self.end_bulk_frame(sink);
                } else {
                    self.check_bulk_full();
                }
            }
            BulkPacket::Eof => {
                if data.is_empty() {
                    self.end_bulk_frame(sink);
                    return;
                }
                // No terminator: a header here is the next frame's SOF
                if PayloadHeader::parse(data).is_some() {
                    trace!("Header after full frame, treating as start of frame");
                    self.end_bulk_frame(sink);
                    self.bulk_packet(data, short, sink);
                    return;
                }
                debug!(len = data.len(), "Data after full frame, resynchronizing");
                self.skip_frame = true;
                self.end_bulk_frame(sink);
            }
        }
    }

    fn check_bulk_full(&mut self) {
        if let Some(frame) = &self.current {
            if self.max_frame_size > 0 && frame.len() >= self.max_frame_size {
                self.next_bulk = BulkPacket::Eof;
            }
        }
    }

    fn end_bulk_frame(&mut self, sink: &mut impl FrameSink) {
        self.finish_frame(sink);
        self.next_bulk = BulkPacket::Sof;
    }

    fn start_frame(&mut self, fid: bool, sink: &mut impl FrameSink) {
        self.finish_frame(sink);
        self.frame_id = FrameId::from_bit(fid);
        self.skip_frame = false;

        match sink.take_empty() {
            Some(frame) => self.current = Some(frame),
            None => {
                debug!("No empty frame buffer, dropping frame");
                self.skip_frame = true;
                sink.underflow();
            }
        }
    }

    fn append(&mut self, data: &[u8], pts: Option<u32>, sink: &mut impl FrameSink) {
        if self.skip_frame || data.is_empty() {
            return;
        }
        // Same frame ID after the frame was closed: keep-alive, nothing to do
        let Some(frame) = self.current.as_mut() else {
            return;
        };
        if frame.is_truncated() {
            return;
        }

        if frame.add_data(data).is_err() {
            debug!(
                len = frame.len(),
                capacity = frame.capacity(),
                "Frame buffer overflow"
            );
            sink.overflow();
            if self.deliver_truncated {
                frame.fill_truncated(data);
            } else {
                self.skip_frame = true;
                return;
            }
        }
        if pts.is_some() {
            frame.pts = pts;
        }
    }

    fn finish_frame(&mut self, sink: &mut impl FrameSink) {
        let Some(mut frame) = self.current.take() else {
            return;
        };
        if self.skip_frame || frame.is_empty() {
            sink.discard(frame);
            return;
        }

        frame.sequence = self.sequence;
        frame.timestamp = Some(Instant::now());
        self.sequence = self.sequence.wrapping_add(1);
        trace!(len = frame.len(), sequence = frame.sequence, "Frame complete");
        sink.deliver(frame);
    }
}
