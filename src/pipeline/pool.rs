//! Fixed pool of pre-allocated frame buffers

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tracing::{debug, error};

use crate::capture::frame::{Frame, VideoFormat};
use crate::error::{Error, Result};

/// Lock-free pool of frame buffers shared between the transfer completion
/// path and the application.
///
/// Frames move out of the pool by value and come back by value, so a buffer
/// is only ever owned by one of: the pool, the reassembler, or the
/// application.
pub struct FramePool {
    /// Empty frames ready for the reassembler
    queue: ArrayQueue<Frame>,
    count: usize,
    frame_size: usize,

    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    exhausted: AtomicUsize,
}

impl FramePool {
    /// Allocate `count` frames of `size` bytes each.
    ///
    /// On allocation failure everything allocated so far is released and
    /// [`Error::NoMem`] is returned.
    pub fn allocate(count: usize, size: usize, format: VideoFormat) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidArg("frame buffer count must be non-zero"));
        }
        if size == 0 {
            return Err(Error::InvalidArg("frame buffer size must be non-zero"));
        }

        let queue = ArrayQueue::new(count);
        for _ in 0..count {
            let frame = Frame::with_capacity(size, format)?;
            if queue.push(frame).is_err() {
                return Err(Error::NoMem);
            }
        }
        debug!(count, size, "Allocated frame pool");

        Ok(Self {
            queue,
            count,
            frame_size: size,
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Take an empty frame. Never blocks.
    pub fn get_empty(&self) -> Option<Frame> {
        let frame = self.queue.pop();
        if frame.is_none() {
            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Give a frame back. Its data length is reset to zero.
    ///
    /// A full queue means the frame was returned twice or does not belong to
    /// this pool; the frame is dropped and the call fails.
    pub fn return_frame(&self, mut frame: Frame) -> Result<()> {
        frame.reset();
        self.queue.push(frame).map_err(|_| {
            error!("Frame returned to a full pool, dropping it");
            Error::InvalidState("frame pool is already full")
        })
    }

    /// True when every frame is sitting in the pool.
    pub fn are_all_returned(&self) -> bool {
        self.queue.is_full()
    }

    /// Update the format snapshot of every pooled frame.
    ///
    /// Only legal while no frame is leased.
    pub fn refresh_format(&self, format: VideoFormat) -> Result<()> {
        if !self.are_all_returned() {
            return Err(Error::InvalidState("frames are still in use"));
        }
        let mut frames = Vec::with_capacity(self.count);
        while let Some(mut frame) = self.queue.pop() {
            frame.format = format;
            frames.push(frame);
        }
        for frame in frames {
            self.queue.push(frame).map_err(|_| {
                error!("Pool filled up during format refresh, dropping frame");
                Error::InvalidState("frame pool is already full")
            })?;
        }
        Ok(())
    }

    /// Release every pooled frame. The caller guarantees streaming is
    /// stopped; frames still held by the application are not affected.
    pub fn free(&self) {
        let mut freed = 0;
        while self.queue.pop().is_some() {
            freed += 1;
        }
        debug!(freed, "Freed frame pool");
    }

    /// Number of frame buffers the pool was created with
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Frames currently in the pool
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// (frames out of the pool, times the pool was found empty)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.count.saturating_sub(self.queue.len()),
            self.stats.exhausted.load(Ordering::Relaxed),
        )
    }
}
