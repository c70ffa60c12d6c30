pub mod channel;
pub mod pool;

pub use channel::frame_channel;
pub use pool::FramePool;
