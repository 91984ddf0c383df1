// MP4 VIDEO DEMUXING - One Track, Flat Index
//
// What the playback side needs from an MP4 file:
// ════════════════════════════════════════════════════════════════════════════
//
// 1. BOX TREE        → boxes.rs        (header decoding, container recursion)
// 2. SAMPLE INDEX    → sample_table.rs (stsz/stsc/stco/stts/ctts/stss → flat list)
// 3. TRACK METADATA  → track.rs        (hdlr/tkhd/mdhd/elst/stsd)
// 4. SAMPLE READS    → demuxer.rs      (ranged reads through a ByteSource)
//
// Not covered: audio, fragmented files (moof/traf), encryption boxes.
// ════════════════════════════════════════════════════════════════════════════

use crate::source::SourceError;
use bytes::Buf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod boxes;
pub mod demuxer;
pub mod sample_table;
pub mod track;

pub use boxes::{find_all_boxes, find_box, find_path, BoxParser, Mp4Box};
pub use demuxer::Mp4Demuxer;
pub use sample_table::{RawSampleTables, Sample, SampleTable, SampleTableBuilder};
pub use track::VideoTrackInfo;

// ============================================================================
// Box Types
// ============================================================================

pub const FTYP: [u8; 4] = *b"ftyp";
pub const MOOV: [u8; 4] = *b"moov";
pub const TRAK: [u8; 4] = *b"trak";
pub const TKHD: [u8; 4] = *b"tkhd";
pub const EDTS: [u8; 4] = *b"edts";
pub const ELST: [u8; 4] = *b"elst";
pub const MDIA: [u8; 4] = *b"mdia";
pub const MDHD: [u8; 4] = *b"mdhd";
pub const HDLR: [u8; 4] = *b"hdlr";
pub const MINF: [u8; 4] = *b"minf";
pub const DINF: [u8; 4] = *b"dinf";
pub const STBL: [u8; 4] = *b"stbl";
pub const STSD: [u8; 4] = *b"stsd";
pub const STTS: [u8; 4] = *b"stts";
pub const CTTS: [u8; 4] = *b"ctts";
pub const STSC: [u8; 4] = *b"stsc";
pub const STSZ: [u8; 4] = *b"stsz";
pub const STCO: [u8; 4] = *b"stco";
pub const CO64: [u8; 4] = *b"co64";
pub const STSS: [u8; 4] = *b"stss";
pub const UDTA: [u8; 4] = *b"udta";
pub const MVEX: [u8; 4] = *b"mvex";
pub const MDAT: [u8; 4] = *b"mdat";

// Codec configuration boxes inside the visual sample entry
pub const AVCC: [u8; 4] = *b"avcC";
pub const HVCC: [u8; 4] = *b"hvcC";

/// Handler type of a video track (`hdlr` box)
pub const HANDLER_VIDEO: [u8; 4] = *b"vide";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum Mp4Error {
    #[error("Invalid box header at offset {offset}: only {available} bytes available")]
    InvalidHeader { offset: u64, available: u64 },
    #[error("Box '{box_type}' at offset {offset} has size {size}, smaller than its {header_size}-byte header")]
    SizeTooSmall {
        box_type: String,
        offset: u64,
        size: u64,
        header_size: u8,
    },
    #[error("Box '{box_type}' at offset {offset} (size {size}) overruns its container ending at {limit}")]
    BoxOverrun {
        box_type: String,
        offset: u64,
        size: u64,
        limit: u64,
    },
    #[error("Required box '{0}' not found")]
    MissingBox(&'static str),
    #[error("Missing required sample table: {0}")]
    MissingRequiredTable(&'static str),
    #[error("Malformed '{table}' box: {reason}")]
    MalformedTable { table: &'static str, reason: String },
    #[error("Sample table has no samples")]
    NoSamples,
    #[error("No video track found")]
    TrackNotFound,
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Codec configuration box not found in '{0}' sample entry")]
    InvalidCodecConfig(String),
    #[error("Sample {index} out of range (track has {count} samples)")]
    SampleOutOfRange { index: usize, count: usize },
    #[error("Demuxer has not been parsed")]
    NotParsed,
    #[error(transparent)]
    Source(#[from] SourceError),
}

// ============================================================================
// Codecs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"avc1" | b"avc3" => Some(VideoCodec::H264),
            b"hvc1" | b"hev1" => Some(VideoCodec::H265),
            _ => None,
        }
    }

    /// Type of the configuration box carried in the sample entry
    pub fn config_box(&self) -> [u8; 4] {
        match self {
            VideoCodec::H264 => AVCC,
            VideoCodec::H265 => HVCC,
        }
    }
}

/// Printable form of a box type
pub fn fourcc_str(fourcc: &[u8; 4]) -> String {
    fourcc
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

// ============================================================================
// Payload Field Reader
// ============================================================================

/// Bounds-checked big-endian reader over a box payload. Every read names the
/// box it belongs to so truncation surfaces as a typed error.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    table: &'static str,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(buf: &'a [u8], table: &'static str) -> Self {
        Self { buf, pos: 0, table }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Mp4Error> {
        if self.remaining() < n {
            return Err(Mp4Error::MalformedTable {
                table: self.table,
                reason: format!(
                    "truncated at byte {} (needed {}, {} left)",
                    self.pos,
                    n,
                    self.remaining()
                ),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), Mp4Error> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, Mp4Error> {
        let mut cursor = self.take(2)?;
        Ok(cursor.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Mp4Error> {
        let mut cursor = self.take(4)?;
        Ok(cursor.get_u32())
    }

    pub(crate) fn i32(&mut self) -> Result<i32, Mp4Error> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, Mp4Error> {
        let mut cursor = self.take(8)?;
        Ok(cursor.get_u64())
    }

    pub(crate) fn i64(&mut self) -> Result<i64, Mp4Error> {
        Ok(self.u64()? as i64)
    }

    pub(crate) fn fourcc(&mut self) -> Result<[u8; 4], Mp4Error> {
        let mut cursor = self.take(4)?;
        let mut fourcc = [0u8; 4];
        cursor.copy_to_slice(&mut fourcc);
        Ok(fourcc)
    }

    /// Full-box prefix: version byte and 24-bit flags
    pub(crate) fn version_and_flags(&mut self) -> Result<(u8, u32), Mp4Error> {
        let b = self.take(4)?;
        let flags = ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | b[3] as u32;
        Ok((b[0], flags))
    }

    /// Entry count followed by a bound check that `count * entry_size` bytes
    /// are actually present, so a corrupt count can't drive a huge allocation.
    pub(crate) fn entry_count(&mut self, entry_size: usize) -> Result<usize, Mp4Error> {
        let count = self.u32()? as usize;
        let needed = count.saturating_mul(entry_size);
        if needed > self.remaining() {
            return Err(Mp4Error::MalformedTable {
                table: self.table,
                reason: format!(
                    "{} entries declared but only {} bytes of entries present",
                    count,
                    self.remaining()
                ),
            });
        }
        Ok(count)
    }
}
