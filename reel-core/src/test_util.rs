//! Synthetic MP4 builders shared by the unit tests.

use crate::mp4_demux::{
    CO64, CTTS, EDTS, ELST, FTYP, HDLR, MDAT, MDHD, MDIA, MINF, MOOV, STBL, STCO, STSC, STSD,
    STSS, STSZ, STTS, TKHD, TRAK,
};

pub fn make_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(payload);
    out
}

pub fn container(box_type: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    make_box(box_type, &children.concat())
}

pub fn full_box(box_type: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = vec![version, 0, 0, 0];
    payload.extend_from_slice(body);
    make_box(box_type, &payload)
}

fn be32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

pub fn stsz(default_size: u32, count: u32, sizes: &[u32]) -> Vec<u8> {
    let mut body = be32(&[default_size, count]);
    body.extend(be32(sizes));
    full_box(&STSZ, 0, &body)
}

pub fn stsc(runs: &[(u32, u32, u32)]) -> Vec<u8> {
    let mut body = be32(&[runs.len() as u32]);
    for &(first_chunk, per_chunk, desc) in runs {
        body.extend(be32(&[first_chunk, per_chunk, desc]));
    }
    full_box(&STSC, 0, &body)
}

pub fn stco(offsets: &[u32]) -> Vec<u8> {
    let mut body = be32(&[offsets.len() as u32]);
    body.extend(be32(offsets));
    full_box(&STCO, 0, &body)
}

pub fn co64(offsets: &[u64]) -> Vec<u8> {
    let mut body = be32(&[offsets.len() as u32]);
    for o in offsets {
        body.extend_from_slice(&o.to_be_bytes());
    }
    full_box(&CO64, 0, &body)
}

pub fn stts(runs: &[(u32, u32)]) -> Vec<u8> {
    let mut body = be32(&[runs.len() as u32]);
    for &(count, delta) in runs {
        body.extend(be32(&[count, delta]));
    }
    full_box(&STTS, 0, &body)
}

pub fn ctts(version: u8, runs: &[(u32, i32)]) -> Vec<u8> {
    let mut body = be32(&[runs.len() as u32]);
    for &(count, offset) in runs {
        body.extend(be32(&[count, offset as u32]));
    }
    full_box(&CTTS, version, &body)
}

pub fn stss(numbers: &[u32]) -> Vec<u8> {
    let mut body = be32(&[numbers.len() as u32]);
    body.extend(be32(numbers));
    full_box(&STSS, 0, &body)
}

pub fn tkhd(track_id: u32) -> Vec<u8> {
    // creation, modification, track_id, reserved, duration, then the rest of v0
    let mut body = be32(&[0, 0, track_id, 0, 0]);
    body.resize(80, 0);
    full_box(&TKHD, 0, &body)
}

pub fn mdhd_v0(timescale: u32, duration: u32) -> Vec<u8> {
    let mut body = be32(&[0, 0, timescale, duration]);
    // 'und' packed language + pre_defined
    body.extend_from_slice(&[0x55, 0xC4, 0, 0]);
    full_box(&MDHD, 0, &body)
}

pub fn mdhd_v1(timescale: u32, duration: u64) -> Vec<u8> {
    let mut body = vec![0u8; 16];
    body.extend_from_slice(&timescale.to_be_bytes());
    body.extend_from_slice(&duration.to_be_bytes());
    // 'eng'
    body.extend_from_slice(&[0x15, 0xC7, 0, 0]);
    full_box(&MDHD, 1, &body)
}

pub fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut body = be32(&[0]);
    body.extend_from_slice(handler);
    body.extend(be32(&[0, 0, 0]));
    body.extend_from_slice(b"handler\0");
    full_box(&HDLR, 0, &body)
}

pub fn elst_v0(segment_duration: u32, media_time: i32) -> Vec<u8> {
    let body = be32(&[1, segment_duration, media_time as u32, 0x0001_0000]);
    container(&EDTS, &[full_box(&ELST, 0, &body)])
}

pub fn elst_v1(segment_duration: u64, media_time: i64) -> Vec<u8> {
    let mut body = be32(&[1]);
    body.extend_from_slice(&segment_duration.to_be_bytes());
    body.extend_from_slice(&media_time.to_be_bytes());
    body.extend(be32(&[0x0001_0000]));
    container(&EDTS, &[full_box(&ELST, 1, &body)])
}

/// Minimal avcC: version 1, baseline profile, 4-byte NAL lengths, one SPS, one PPS
pub fn avcc_payload() -> Vec<u8> {
    let mut p = vec![1, 0x42, 0x00, 0x1E, 0xFF, 0xE1];
    p.extend_from_slice(&[0x00, 0x04, 0x67, 0x42, 0x00, 0x1E]);
    p.push(1);
    p.extend_from_slice(&[0x00, 0x02, 0x68, 0xCE]);
    p
}

/// Minimal hvcC: 22 bytes of profile fields, 4-byte NAL lengths, VPS/SPS/PPS arrays
pub fn hvcc_payload() -> Vec<u8> {
    let mut p = vec![1u8];
    p.extend_from_slice(&[0u8; 20]);
    p.push(0x03);
    p.push(3);
    for (nal_type, nal) in [(32u8, &[0x40u8, 0x01][..]), (33, &[0x42, 0x01, 0x01]), (34, &[0x44, 0x01])] {
        p.push(0x80 | nal_type);
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        p.extend_from_slice(nal);
    }
    p
}

/// Visual sample entry with an optional configuration child box
pub fn visual_entry(fourcc: &[u8; 4], width: u16, height: u16, config: Option<(&[u8; 4], &[u8])>) -> Vec<u8> {
    let mut body = vec![0u8; 6];
    body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    body.extend_from_slice(&[0u8; 16]);
    body.extend_from_slice(&width.to_be_bytes());
    body.extend_from_slice(&height.to_be_bytes());
    body.extend_from_slice(&[0x00, 0x48, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00]);
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    body.extend_from_slice(&[0u8; 32]); // compressor name
    body.extend_from_slice(&[0x00, 0x18, 0xFF, 0xFF]);
    assert_eq!(body.len(), 78);
    body.extend(make_box(b"pasp", &be32(&[1, 1])));
    if let Some((box_type, payload)) = config {
        body.extend(make_box(box_type, payload));
    }
    make_box(fourcc, &body)
}

pub fn stsd(entry: Vec<u8>) -> Vec<u8> {
    let mut body = be32(&[1]);
    body.extend(entry);
    full_box(&STSD, 0, &body)
}

// ============================================================================
// Whole-file builder
// ============================================================================

/// Description of one synthetic video track. Sample `i` is stored as `size[i]`
/// copies of the byte `i as u8` so reads can be checked by content.
#[derive(Debug, Clone)]
pub struct SyntheticTrack {
    pub timescale: u32,
    pub sample_sizes: Vec<u32>,
    pub samples_per_chunk: u32,
    pub stts: Vec<(u32, u32)>,
    pub ctts: Option<Vec<(u32, i32)>>,
    pub sync_samples: Option<Vec<u32>>,
    /// First edit-list entry as `(segment_duration, media_time)`
    pub edit: Option<(u32, i32)>,
    pub sample_entry: Vec<u8>,
    pub use_co64: bool,
    pub mdhd_v1: bool,
    pub audio_track_first: bool,
    pub omit_stts: bool,
}

impl SyntheticTrack {
    /// `count` samples at 30 fps in a 90 kHz timescale, keyframe every `gop`
    pub fn constant(count: usize, gop: usize) -> Self {
        let sample_sizes: Vec<u32> = (0..count).map(|i| 100 + (i % 7) as u32 * 10).collect();
        let sync: Vec<u32> = (0..count).step_by(gop.max(1)).map(|i| i as u32 + 1).collect();
        Self {
            timescale: 90_000,
            sample_sizes,
            samples_per_chunk: 4,
            stts: vec![(count as u32, 3000)],
            ctts: None,
            sync_samples: Some(sync),
            edit: None,
            sample_entry: visual_entry(b"avc1", 1920, 1080, Some((b"avcC", &avcc_payload()))),
            use_co64: false,
            mdhd_v1: false,
            audio_track_first: false,
            omit_stts: false,
        }
    }

    fn duration(&self) -> u64 {
        self.stts.iter().map(|&(c, d)| c as u64 * d as u64).sum()
    }
}

fn stbl(track: &SyntheticTrack, chunk_offsets: &[u64]) -> Vec<u8> {
    let mut children = vec![stsd(track.sample_entry.clone())];
    if !track.omit_stts {
        children.push(stts(&track.stts));
    }
    if let Some(runs) = &track.ctts {
        children.push(ctts(0, runs));
    }
    if let Some(sync) = &track.sync_samples {
        children.push(stss(sync));
    }
    children.push(stsc(&[(1, track.samples_per_chunk, 1)]));
    children.push(stsz(0, track.sample_sizes.len() as u32, &track.sample_sizes));
    if track.use_co64 {
        children.push(co64(chunk_offsets));
    } else {
        let narrow: Vec<u32> = chunk_offsets.iter().map(|&o| o as u32).collect();
        children.push(stco(&narrow));
    }
    container(&STBL, &children)
}

fn trak(track: &SyntheticTrack, chunk_offsets: &[u64]) -> Vec<u8> {
    let mdhd = if track.mdhd_v1 {
        mdhd_v1(track.timescale, track.duration())
    } else {
        mdhd_v0(track.timescale, track.duration() as u32)
    };
    let minf = container(&MINF, &[stbl(track, chunk_offsets)]);
    let mdia = container(&MDIA, &[mdhd, hdlr(b"vide"), minf]);

    let mut children = vec![tkhd(1)];
    if let Some((duration, media_time)) = track.edit {
        children.push(elst_v0(duration, media_time));
    }
    children.push(mdia);
    container(&TRAK, &children)
}

fn audio_trak() -> Vec<u8> {
    let stbl = container(&STBL, &[stsd(make_box(b"mp4a", &[0u8; 28])), stts(&[(1, 1024)])]);
    let mdia = container(
        &MDIA,
        &[mdhd_v0(48_000, 1024), hdlr(b"soun"), container(&MINF, &[stbl])],
    );
    container(&TRAK, &[tkhd(2), mdia])
}

/// Lay out `ftyp | mdat | moov` with chunk offsets pointing into `mdat`.
pub fn build_mp4(track: &SyntheticTrack) -> Vec<u8> {
    let ftyp = make_box(&FTYP, b"isom\0\0\x02\0isomavc1");

    let mut payload = Vec::new();
    let mut chunk_offsets = Vec::new();
    let data_start = (ftyp.len() + 8) as u64;
    for (i, &size) in track.sample_sizes.iter().enumerate() {
        if i % track.samples_per_chunk as usize == 0 {
            chunk_offsets.push(data_start + payload.len() as u64);
        }
        payload.extend(std::iter::repeat(i as u8).take(size as usize));
    }
    let mdat = make_box(&MDAT, &payload);

    let mut traks = Vec::new();
    if track.audio_track_first {
        traks.push(audio_trak());
    }
    traks.push(trak(track, &chunk_offsets));
    let moov = container(&MOOV, &traks);

    [ftyp, mdat, moov].concat()
}
