//! Track-level metadata: handler, header, media header, edit list and the
//! visual sample entry.

use bytes::Bytes;
use serde::Serialize;

use super::boxes::{BoxParser, Mp4Box};
use super::{fourcc_str, FieldReader, Mp4Error, VideoCodec, EDTS, ELST, HDLR, MDHD, MDIA, STSD, TKHD};
use crate::codec_config::{CodecConfigError, ParameterSets};
use crate::source::ByteSource;

/// Offset of the first child box inside a visual sample entry payload
const VISUAL_ENTRY_CHILDREN: usize = 78;

/// Everything a decoder needs to be configured for the selected video track.
#[derive(Debug, Clone, Serialize)]
pub struct VideoTrackInfo {
    pub track_id: u32,
    pub width: u16,
    pub height: u16,
    pub codec: VideoCodec,
    /// Sample entry four-character code, e.g. `avc1`
    pub sample_entry: String,
    /// Raw avcC / hvcC payload
    #[serde(skip)]
    pub codec_config: Bytes,
    pub timescale: u32,
    /// Media duration in timescale units (from mdhd)
    pub duration: u64,
    pub sample_count: usize,
    /// First edit-list media time, subtracted from every presentation time
    pub media_time_offset: i64,
    /// ISO-639-2 code from mdhd, `None` for `und`
    pub language: Option<String>,
}

impl VideoTrackInfo {
    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            self.duration as f64 / self.timescale as f64
        }
    }

    pub fn parameter_sets(&self) -> Result<ParameterSets, CodecConfigError> {
        ParameterSets::parse(self.codec, &self.codec_config)
    }

    pub fn nal_length_size(&self) -> Result<u8, CodecConfigError> {
        self.parameter_sets().map(|sets| sets.nal_length_size)
    }
}

/// Media header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHeader {
    pub timescale: u32,
    pub duration: u64,
    pub language: Option<String>,
}

/// Visual sample entry fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    pub fourcc: [u8; 4],
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub codec_config: Bytes,
}

// ============================================================================
// Box Parsers
// ============================================================================

/// Handler type of an `hdlr` payload
pub fn parse_hdlr(payload: &[u8]) -> Result<[u8; 4], Mp4Error> {
    let mut r = FieldReader::new(payload, "hdlr");
    r.version_and_flags()?;
    r.skip(4)?; // pre_defined
    r.fourcc()
}

pub fn parse_tkhd(payload: &[u8]) -> Result<u32, Mp4Error> {
    let mut r = FieldReader::new(payload, "tkhd");
    let (version, _) = r.version_and_flags()?;
    // creation + modification times are 32 or 64 bit
    r.skip(if version == 1 { 16 } else { 8 })?;
    r.u32()
}

pub fn parse_mdhd(payload: &[u8]) -> Result<MediaHeader, Mp4Error> {
    let mut r = FieldReader::new(payload, "mdhd");
    let (version, _) = r.version_and_flags()?;
    let (timescale, duration) = if version == 1 {
        r.skip(16)?;
        (r.u32()?, r.u64()?)
    } else {
        r.skip(8)?;
        (r.u32()?, r.u32()? as u64)
    };

    let language = if r.remaining() >= 2 {
        decode_language(r.u16()?)
    } else {
        None
    };

    Ok(MediaHeader {
        timescale,
        duration,
        language,
    })
}

/// Packed ISO-639-2 code: three 5-bit letters offset from 0x60
fn decode_language(packed: u16) -> Option<String> {
    let letters = [(packed >> 10) & 0x1F, (packed >> 5) & 0x1F, packed & 0x1F];
    if letters.iter().any(|&l| l == 0) {
        return None;
    }
    let code: String = letters.iter().map(|&l| (l as u8 + 0x60) as char).collect();
    (code != "und").then_some(code)
}

/// Media time of the first edit-list entry. An empty list or an empty edit
/// (media time -1) yields 0.
pub fn parse_elst_offset(payload: &[u8]) -> Result<i64, Mp4Error> {
    let mut r = FieldReader::new(payload, "elst");
    let (version, _) = r.version_and_flags()?;
    let entry_size = if version == 1 { 20 } else { 12 };
    let count = r.entry_count(entry_size)?;
    if count == 0 {
        return Ok(0);
    }
    if count > 1 {
        tracing::debug!("elst has {} entries, only the first is applied", count);
    }

    let media_time = if version == 1 {
        r.skip(8)?;
        r.i64()?
    } else {
        r.skip(4)?;
        r.i32()? as i64
    };

    Ok(if media_time == -1 { 0 } else { media_time })
}

/// Decode the single visual sample entry of an `stsd` payload.
pub fn parse_stsd(payload: &Bytes) -> Result<SampleEntry, Mp4Error> {
    let mut r = FieldReader::new(payload, "stsd");
    r.version_and_flags()?;
    let entries = r.u32()?;
    if entries == 0 {
        return Err(Mp4Error::MalformedTable {
            table: "stsd",
            reason: "no sample entries".into(),
        });
    }

    let entry_start = r.position();
    let entry_size = r.u32()? as usize;
    let fourcc = r.fourcc()?;
    let codec = VideoCodec::from_fourcc(&fourcc).ok_or_else(|| Mp4Error::UnsupportedCodec(fourcc_str(&fourcc)))?;

    let entry_end = entry_start + entry_size;
    if entry_size < 8 + VISUAL_ENTRY_CHILDREN || entry_end > payload.len() {
        return Err(Mp4Error::MalformedTable {
            table: "stsd",
            reason: format!("visual sample entry of {} bytes", entry_size),
        });
    }

    // Entry payload: 6 reserved, data_reference_index, 16 pre_defined/reserved
    r.skip(24)?;
    let width = r.u16()?;
    let height = r.u16()?;

    let config_type = codec.config_box();
    let children_start = entry_start + 8 + VISUAL_ENTRY_CHILDREN;
    let config = find_child_payload(&payload[children_start..entry_end], &config_type)
        .ok_or_else(|| Mp4Error::InvalidCodecConfig(fourcc_str(&fourcc)))?;

    Ok(SampleEntry {
        fourcc,
        codec,
        width,
        height,
        codec_config: payload.slice(children_start + config.start..children_start + config.end),
    })
}

/// Locate a child box inside a sample entry, returning its payload range.
fn find_child_payload(data: &[u8], wanted: &[u8; 4]) -> Option<std::ops::Range<usize>> {
    let mut r = FieldReader::new(data, "stsd");
    while r.remaining() >= 8 {
        let start = r.position();
        let size = r.u32().ok()? as usize;
        let box_type = r.fourcc().ok()?;
        if size < 8 || start + size > data.len() {
            return None;
        }
        if &box_type == wanted {
            return Some(start + 8..start + size);
        }
        r.skip(size - 8).ok()?;
    }
    None
}

// ============================================================================
// Track Assembly
// ============================================================================

fn leaf_payload<S: ByteSource + ?Sized>(
    parser: &BoxParser<'_, S>,
    parent: &Mp4Box,
    box_type: &[u8; 4],
    name: &'static str,
) -> Result<Bytes, Mp4Error> {
    let leaf = parent.child(box_type).ok_or(Mp4Error::MissingBox(name))?;
    parser.read_payload(leaf)
}

/// Handler type of a `trak`, `None` when it has no mdia/hdlr
pub fn handler_type<S: ByteSource + ?Sized>(parser: &BoxParser<'_, S>, trak: &Mp4Box) -> Result<Option<[u8; 4]>, Mp4Error> {
    match trak.child(&MDIA).and_then(|mdia| mdia.child(&HDLR)) {
        Some(hdlr) => parse_hdlr(&parser.read_payload(hdlr)?).map(Some),
        None => Ok(None),
    }
}

/// Decode the metadata of a video `trak`. `sample_count` is left at 0 for
/// the caller to fill in once the sample table is built.
pub fn read_track_info<S: ByteSource + ?Sized>(parser: &BoxParser<'_, S>, trak: &Mp4Box) -> Result<VideoTrackInfo, Mp4Error> {
    let track_id = parse_tkhd(&leaf_payload(parser, trak, &TKHD, "tkhd")?)?;

    let mdia = trak.child(&MDIA).ok_or(Mp4Error::MissingBox("mdia"))?;
    let header = parse_mdhd(&leaf_payload(parser, mdia, &MDHD, "mdhd")?)?;

    let media_time_offset = match trak.child(&EDTS).and_then(|edts| edts.child(&ELST)) {
        Some(elst) => parse_elst_offset(&parser.read_payload(elst)?)?,
        None => 0,
    };

    let stbl = super::find_path(mdia, &[super::MINF, super::STBL]).ok_or(Mp4Error::MissingBox("stbl"))?;
    let entry = parse_stsd(&leaf_payload(parser, stbl, &STSD, "stsd")?)?;

    Ok(VideoTrackInfo {
        track_id,
        width: entry.width,
        height: entry.height,
        codec: entry.codec,
        sample_entry: fourcc_str(&entry.fourcc),
        codec_config: entry.codec_config,
        timescale: header.timescale,
        duration: header.duration,
        sample_count: 0,
        media_time_offset,
        language: header.language,
    })
}
