pub mod frame;
pub mod header;
pub mod reassembly;

pub use frame::{Encoding, Frame, VideoFormat};
pub use header::PayloadHeader;
pub use reassembly::{BulkPacket, FrameId, FrameSink, Reassembler};
