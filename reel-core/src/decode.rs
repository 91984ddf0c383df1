//! # Video Decode Contract
//!
//! The buffering layer drives any decoder through the [`Decoder`] trait:
//! compressed samples go in strictly in decode order, frames come out in
//! presentation order, possibly delayed by the codec's reorder depth.
//!
//! [`PassthroughDecoder`] is the reference backend. It does no pixel work and
//! hands back the compressed payload, which is enough to exercise timing,
//! reordering and buffering without a hardware decoder.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec_config::{length_prefixed_to_annexb, CodecConfigError};
use crate::mp4_demux::{Mp4Error, Sample, VideoTrackInfo};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Decoder used before configure()")]
    NotConfigured,
    #[error("Invalid codec configuration: {0}")]
    InvalidConfig(#[from] CodecConfigError),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Invalid NAL unit in sample {0}")]
    InvalidNal(usize),
    #[error(transparent)]
    Demux(#[from] Mp4Error),
}

/// A frame leaving the decoder. Times are in media timescale units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Opaque frame handle; for the passthrough backend, the sample bytes
    pub payload: Bytes,
    pub width: u32,
    pub height: u32,
    pub presentation_time: i64,
    pub decode_time: i64,
    pub duration: u32,
    pub sample_index: usize,
    pub keyframe: bool,
}

/// Decoder trait - implemented by all decoder backends
pub trait Decoder: Send {
    /// Prepare for the given track. Must be called before the first decode.
    fn configure(&mut self, track: &VideoTrackInfo) -> Result<(), DecodeError>;

    /// Submit one sample in decode order. `Ok(None)` means the frame is held
    /// back for reordering and will surface from a later call.
    fn decode(&mut self, data: &[u8], sample: &Sample) -> Result<Option<DecodedFrame>, DecodeError>;

    /// Signal end of input so held-back frames become drainable
    fn finish_delayed_frames(&mut self) -> Result<(), DecodeError>;

    /// Take every frame released by `finish_delayed_frames`, in presentation order
    fn drain_frames(&mut self) -> Vec<DecodedFrame>;

    /// Drop all internal state (used on seek). Configuration is kept.
    fn reset(&mut self);

    /// Get decoder name for debugging
    fn name(&self) -> &str;
}

// ============================================================================
// Passthrough Decoder
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughConfig {
    /// Frames held back before the earliest one is released
    pub reorder_delay: usize,
    /// Rewrite length-prefixed NALs to Annex B, with parameter sets in front
    /// of every keyframe
    pub annexb: bool,
}

struct StreamParams {
    width: u32,
    height: u32,
    nal_length_size: u8,
    parameter_sets: Vec<u8>,
}

pub struct PassthroughDecoder {
    config: PassthroughConfig,
    stream: Option<StreamParams>,
    /// Held-back frames, sorted by presentation time
    pending: Vec<DecodedFrame>,
    flushed: Vec<DecodedFrame>,
}

impl PassthroughDecoder {
    pub fn new(config: PassthroughConfig) -> Self {
        Self {
            config,
            stream: None,
            pending: Vec::new(),
            flushed: Vec::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn insert_by_pts(&mut self, frame: DecodedFrame) {
        let pos = self
            .pending
            .partition_point(|f| f.presentation_time <= frame.presentation_time);
        self.pending.insert(pos, frame);
    }
}

impl Decoder for PassthroughDecoder {
    fn configure(&mut self, track: &VideoTrackInfo) -> Result<(), DecodeError> {
        let sets = track.parameter_sets()?;
        if self.config.annexb && sets.is_empty() {
            return Err(DecodeError::InvalidConfig(CodecConfigError::TooShort {
                codec: "parameter sets",
                len: 0,
            }));
        }

        tracing::debug!(
            "{} configured for {:?} {}x{} (nal length {}, reorder delay {})",
            self.name(),
            track.codec,
            track.width,
            track.height,
            sets.nal_length_size,
            self.config.reorder_delay
        );

        self.stream = Some(StreamParams {
            width: track.width as u32,
            height: track.height as u32,
            nal_length_size: sets.nal_length_size,
            parameter_sets: sets.to_annexb(),
        });
        self.reset();
        Ok(())
    }

    fn decode(&mut self, data: &[u8], sample: &Sample) -> Result<Option<DecodedFrame>, DecodeError> {
        let stream = self.stream.as_ref().ok_or(DecodeError::NotConfigured)?;

        let payload = if self.config.annexb {
            let nals = length_prefixed_to_annexb(data, stream.nal_length_size)
                .ok_or(DecodeError::InvalidNal(sample.index))?;
            if sample.is_keyframe {
                let mut out = stream.parameter_sets.clone();
                out.extend_from_slice(&nals);
                Bytes::from(out)
            } else {
                Bytes::from(nals)
            }
        } else {
            Bytes::copy_from_slice(data)
        };

        let frame = DecodedFrame {
            payload,
            width: stream.width,
            height: stream.height,
            presentation_time: sample.presentation_time,
            decode_time: sample.decode_time,
            duration: sample.duration,
            sample_index: sample.index,
            keyframe: sample.is_keyframe,
        };

        self.insert_by_pts(frame);
        if self.pending.len() > self.config.reorder_delay {
            Ok(Some(self.pending.remove(0)))
        } else {
            Ok(None)
        }
    }

    fn finish_delayed_frames(&mut self) -> Result<(), DecodeError> {
        if self.stream.is_none() {
            return Err(DecodeError::NotConfigured);
        }
        self.flushed.append(&mut self.pending);
        Ok(())
    }

    fn drain_frames(&mut self) -> Vec<DecodedFrame> {
        std::mem::take(&mut self.flushed)
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.flushed.clear();
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}
