//! H.264 / HEVC codec configuration records
//!
//! MP4 stores NAL units length-prefixed (AVCC / HVCC layout) and carries the
//! parameter sets in the `avcC` / `hvcC` box of the sample entry. Decoders that
//! expect Annex B want start-code separated NALs with the parameter sets first.

use bytes::{Buf, Bytes};
use thiserror::Error;

use crate::mp4_demux::VideoCodec;

/// Annex B start code (4-byte version)
const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

// HEVC NAL unit types carried in hvcC arrays
const HEVC_NAL_VPS: u8 = 32;
const HEVC_NAL_SPS: u8 = 33;
const HEVC_NAL_PPS: u8 = 34;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecConfigError {
    #[error("{codec} configuration too short: {len} bytes")]
    TooShort { codec: &'static str, len: usize },
    #[error("Unsupported {codec} configuration version {version}")]
    UnsupportedVersion { codec: &'static str, version: u8 },
    #[error("{codec} configuration truncated at byte {offset}")]
    Truncated { codec: &'static str, offset: usize },
}

/// Parameter sets split out of a configuration record. The NAL payloads are
/// zero-copy slices of the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    /// Size of the length prefix in front of every NAL in a sample (1, 2 or 4)
    pub nal_length_size: u8,
    /// HEVC only
    pub vps: Vec<Bytes>,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl ParameterSets {
    pub fn parse(codec: VideoCodec, config: &Bytes) -> Result<Self, CodecConfigError> {
        match codec {
            VideoCodec::H264 => Self::from_avcc(config),
            VideoCodec::H265 => Self::from_hvcc(config),
        }
    }

    /// Parse an `avcC` payload.
    ///
    /// ```text
    /// [0]   version (1)
    /// [1-3] profile, profile compat, level
    /// [4]   0xFC | (nal_length_size - 1)
    /// [5]   0xE0 | num_sps, then u16-length SPS entries
    /// [..]  num_pps, then u16-length PPS entries
    /// ```
    pub fn from_avcc(config: &Bytes) -> Result<Self, CodecConfigError> {
        const CODEC: &str = "avcC";
        if config.len() < 7 {
            return Err(CodecConfigError::TooShort { codec: CODEC, len: config.len() });
        }
        if config[0] != 1 {
            return Err(CodecConfigError::UnsupportedVersion { codec: CODEC, version: config[0] });
        }

        let nal_length_size = (config[4] & 0x03) + 1;
        let num_sps = (config[5] & 0x1F) as usize;

        let mut reader = NalReader::new(config, 6, CODEC);
        let sps = reader.nal_list(num_sps)?;

        // Some encoders end the record right after the SPS list
        let pps = if reader.remaining() > 0 {
            let num_pps = reader.u8()? as usize;
            reader.nal_list(num_pps)?
        } else {
            Vec::new()
        };

        Ok(Self {
            nal_length_size,
            vps: Vec::new(),
            sps,
            pps,
        })
    }

    /// Parse an `hvcC` payload: 22 bytes of profile fields, the length size at
    /// byte 21, then `numOfArrays` typed NAL arrays.
    pub fn from_hvcc(config: &Bytes) -> Result<Self, CodecConfigError> {
        const CODEC: &str = "hvcC";
        if config.len() < 23 {
            return Err(CodecConfigError::TooShort { codec: CODEC, len: config.len() });
        }

        let mut sets = Self {
            nal_length_size: (config[21] & 0x03) + 1,
            ..Self::default()
        };
        let num_arrays = config[22] as usize;

        let mut reader = NalReader::new(config, 23, CODEC);
        for _ in 0..num_arrays {
            let nal_type = reader.u8()? & 0x3F;
            let count = reader.u16()? as usize;
            let nals = reader.nal_list(count)?;
            match nal_type {
                HEVC_NAL_VPS => sets.vps.extend(nals),
                HEVC_NAL_SPS => sets.sps.extend(nals),
                HEVC_NAL_PPS => sets.pps.extend(nals),
                // SEI arrays and friends are not needed to start decoding
                _ => {}
            }
        }

        Ok(sets)
    }

    /// VPS, SPS then PPS, each behind a start code
    pub fn to_annexb(&self) -> Vec<u8> {
        let total: usize = self.iter().map(|nal| nal.len() + 4).sum();
        let mut out = Vec::with_capacity(total);
        for nal in self.iter() {
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(nal);
        }
        out
    }

    fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.vps.iter().chain(&self.sps).chain(&self.pps)
    }

    pub fn is_empty(&self) -> bool {
        self.sps.is_empty() && self.pps.is_empty() && self.vps.is_empty()
    }
}

/// Cursor over a configuration record that hands out NALs as `Bytes` slices.
struct NalReader {
    buf: Bytes,
    consumed: usize,
    codec: &'static str,
}

impl NalReader {
    fn new(config: &Bytes, start: usize, codec: &'static str) -> Self {
        let mut buf = config.clone();
        buf.advance(start);
        Self { buf, consumed: start, codec }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), CodecConfigError> {
        if self.buf.remaining() < n {
            return Err(CodecConfigError::Truncated {
                codec: self.codec,
                offset: self.consumed,
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecConfigError> {
        self.need(1)?;
        self.consumed += 1;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecConfigError> {
        self.need(2)?;
        self.consumed += 2;
        Ok(self.buf.get_u16())
    }

    fn nal(&mut self) -> Result<Bytes, CodecConfigError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        self.consumed += len;
        Ok(self.buf.split_to(len))
    }

    fn nal_list(&mut self, count: usize) -> Result<Vec<Bytes>, CodecConfigError> {
        (0..count).map(|_| self.nal()).collect()
    }
}

/// Convert length-prefixed NAL units to Annex B.
///
/// AVCC: `[len][NAL][len][NAL]...`, Annex B: `[00 00 00 01][NAL]...`.
/// Returns `None` when a length prefix runs past the end of the sample.
pub fn length_prefixed_to_annexb(data: &[u8], nal_length_size: u8) -> Option<Vec<u8>> {
    let prefix = nal_length_size as usize;
    if !(1..=4).contains(&prefix) || prefix == 3 {
        return None;
    }

    let mut out = Vec::with_capacity(data.len() + 16);
    let mut cursor = data;
    while !cursor.is_empty() {
        if cursor.len() < prefix {
            return None;
        }
        let len = cursor.get_uint(prefix) as usize;
        if len > cursor.len() {
            return None;
        }
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(&cursor[..len]);
        cursor.advance(len);
    }
    Some(out)
}
