use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::{Error, Result};

/// Encodings a streaming interface can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Matches whatever the device lists first
    Any,
    Uncompressed,
    Mjpeg,
    H264,
    H265,
    /// Frame-based format with a GUID we don't map to a named codec
    FrameBased,
}

/// Resolution, frame rate and encoding of a stream.
///
/// Zero width/height/fps act as wildcards when used as a request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u16,
    pub height: u16,
    pub fps: f32,
    pub encoding: Encoding,
}

impl VideoFormat {
    pub const fn new(width: u16, height: u16, fps: f32, encoding: Encoding) -> Self {
        Self {
            width,
            height,
            fps,
            encoding,
        }
    }
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self::new(0, 0, 0.0, Encoding::Any)
    }
}

/// One video frame buffer.
///
/// The backing buffer is allocated once with a fixed capacity and recycled
/// through the frame pool for the life of the stream.
pub struct Frame {
    data: Vec<u8>,
    capacity: usize,
    truncated: bool,

    /// Format snapshot taken when the frame was last committed
    pub(crate) format: VideoFormat,

    pub(crate) sequence: u64,
    pub(crate) timestamp: Option<Instant>,
    pub(crate) pts: Option<u32>,
}

impl Frame {
    /// Allocate a frame with `capacity` bytes of backing storage.
    pub(crate) fn with_capacity(capacity: usize, format: VideoFormat) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|_| Error::NoMem)?;
        Ok(Self {
            data,
            capacity,
            truncated: false,
            format,
            sequence: 0,
            timestamp: None,
            pts: None,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated size of the backing buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    /// Only set when truncated-frame delivery is enabled
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Per-stream delivery counter
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the frame's last payload was processed
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Presentation time stamp from the device, in device clock units
    pub fn pts(&self) -> Option<u32> {
        self.pts
    }

    /// Append payload bytes.
    ///
    /// Fails with [`Error::InvalidSize`] without touching the frame if the
    /// data does not fit.
    pub fn add_data(&mut self, data: &[u8]) -> Result<()> {
        let needed = self.data.len() + data.len();
        if needed > self.capacity {
            return Err(Error::InvalidSize {
                expected: self.capacity,
                actual: needed,
            });
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Copy as much of `data` as fits and flag the frame truncated.
    pub(crate) fn fill_truncated(&mut self, data: &[u8]) {
        let room = self.capacity - self.data.len();
        self.data.extend_from_slice(&data[..room.min(data.len())]);
        self.truncated = true;
    }

    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.truncated = false;
        self.timestamp = None;
        self.pts = None;
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .field("truncated", &self.truncated)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .finish()
    }
}
