//! # reel Core
//!
//! MP4 video frame index and look-ahead frame buffering.

// ============================================================================
// Container
// ============================================================================
pub mod source;
pub mod mp4_demux;
pub mod codec_config;

// ============================================================================
// Decode + Buffering
// ============================================================================
pub mod decode;
pub mod frame_queue;
pub mod buffer_manager;
pub mod reorder;

#[cfg(test)]
pub(crate) mod test_util;

pub use buffer_manager::{BufferError, BufferManager, BufferManagerStats, BufferState};
pub use decode::{DecodeError, DecodedFrame, Decoder, PassthroughConfig, PassthroughDecoder};
pub use frame_queue::{BufferConfig, BufferedFrame, ConfigError, FrameBuffer};
pub use mp4_demux::{Mp4Demuxer, Mp4Error, Sample, SampleTable, VideoCodec, VideoTrackInfo};
pub use reorder::ReorderBuffer;
pub use source::{ByteSource, FileSource, MemorySource, SourceError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
