//! Hand frames off the completion path through a bounded channel

use flume::{Receiver, TrySendError};
use tracing::debug;

use crate::capture::Frame;
use crate::stream::FrameCallback;

/// Build a frame callback that forwards every frame into a bounded channel.
///
/// The callback never blocks: when the channel is full the frame goes
/// straight back to the pool and is counted as dropped. Frames taken from
/// the receiver must be given back with [`Stream::frame_return`].
///
/// [`Stream::frame_return`]: crate::stream::Stream::frame_return
pub fn frame_channel(depth: usize) -> (FrameCallback, Receiver<Frame>) {
    let (tx, rx) = flume::bounded(depth);
    let callback: FrameCallback = Box::new(move |frame| match tx.try_send(frame) {
        Ok(()) => None,
        Err(TrySendError::Full(frame)) => {
            debug!(sequence = frame.sequence(), "Frame queue full, dropping frame");
            metrics::counter!("uvc.frames_deferred_dropped").increment(1);
            Some(frame)
        }
        Err(TrySendError::Disconnected(frame)) => Some(frame),
    });
    (callback, rx)
}
