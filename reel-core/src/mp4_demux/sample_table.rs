//! Sample table interpretation.
//!
//! Combines the run-length coded sample tables of a track (stsz, stsc,
//! stco/co64, stts, and the optional ctts and stss) into one flat list of
//! frame descriptors. Samples are emitted in storage order; only the
//! timestamps carry the presentation reordering.

use serde::Serialize;

use super::boxes::{BoxParser, Mp4Box};
use super::{FieldReader, Mp4Error, CO64, CTTS, STCO, STSC, STSS, STSZ, STTS};
use crate::source::ByteSource;

/// One compressed frame: where it lives and when it plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// 0-based index in decode order
    pub index: usize,
    /// Absolute byte offset in the file
    pub offset: u64,
    pub size: u32,
    /// Decode timestamp in media timescale units
    pub decode_time: i64,
    /// Presentation timestamp in media timescale units, edit offset applied
    pub presentation_time: i64,
    pub duration: u32,
    pub is_keyframe: bool,
}

/// Flat, immutable sample index for one track.
#[derive(Debug, Clone)]
pub struct SampleTable {
    samples: Vec<Sample>,
    timescale: u32,
    duration: i64,
}

impl SampleTable {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    /// Total duration in timescale units (last decode time + last duration)
    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.duration as f64 / self.timescale as f64
    }

    pub fn ticks_to_us(&self, ticks: i64) -> i64 {
        if self.timescale == 0 {
            return 0;
        }
        (ticks as i128 * 1_000_000 / self.timescale as i128) as i64
    }

    pub fn us_to_ticks(&self, us: i64) -> i64 {
        (us as i128 * self.timescale as i128 / 1_000_000) as i64
    }

    pub fn keyframe_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_keyframe).count()
    }

    /// Nearest keyframe at or before `index`. Falls back to 0 when no earlier
    /// sample is flagged, since decoding has to start somewhere.
    pub fn keyframe_at_or_before(&self, index: usize) -> usize {
        if self.samples.is_empty() {
            return 0;
        }
        let start = index.min(self.samples.len() - 1);
        self.samples[..=start]
            .iter()
            .rposition(|s| s.is_keyframe)
            .unwrap_or(0)
    }

    /// Last sample whose decode time is at or before `decode_time`
    /// (0 when the time precedes the first sample).
    pub fn sample_at_decode_time(&self, decode_time: i64) -> usize {
        let after = self.samples.partition_point(|s| s.decode_time <= decode_time);
        after.saturating_sub(1)
    }

    /// Sample presenting exactly at `presentation_time`
    pub fn sample_at_presentation_time(&self, presentation_time: i64) -> Option<usize> {
        self.samples
            .iter()
            .position(|s| s.presentation_time == presentation_time)
    }

    /// Presentation times sorted ascending, i.e. display order
    pub fn presentation_order(&self) -> Vec<i64> {
        let mut times: Vec<i64> = self.samples.iter().map(|s| s.presentation_time).collect();
        times.sort_unstable();
        times
    }
}

// ============================================================================
// Raw Tables
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CttsEntry {
    pub sample_count: u32,
    pub sample_offset: i32,
}

/// Contents of stsz: either one shared size or one size per sample
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSizes {
    pub default_size: u32,
    pub sample_count: u32,
    pub sizes: Vec<u32>,
}

impl SampleSizes {
    pub fn size_of(&self, index: usize) -> u32 {
        if self.default_size != 0 {
            self.default_size
        } else {
            self.sizes[index]
        }
    }
}

/// Decoded sample-table boxes of one track, before they are combined.
#[derive(Debug, Clone, Default)]
pub struct RawSampleTables {
    pub sample_sizes: SampleSizes,
    pub sample_to_chunk: Vec<StscEntry>,
    pub chunk_offsets: Vec<u64>,
    pub time_to_sample: Vec<SttsEntry>,
    /// 1-based sample numbers; `None` when the track has no stss
    pub sync_samples: Option<Vec<u32>>,
    pub composition_offsets: Option<Vec<CttsEntry>>,
}

impl RawSampleTables {
    /// Read and decode the sample-table children of an `stbl` box.
    pub fn read<S: ByteSource + ?Sized>(parser: &BoxParser<'_, S>, stbl: &Mp4Box) -> Result<Self, Mp4Error> {
        let payload = |box_type: &[u8; 4]| -> Result<Option<bytes::Bytes>, Mp4Error> {
            stbl.child(box_type).map(|b| parser.read_payload(b)).transpose()
        };

        let stsz = payload(&STSZ)?.ok_or(Mp4Error::MissingRequiredTable("stsz"))?;
        let stsc = payload(&STSC)?.ok_or(Mp4Error::MissingRequiredTable("stsc"))?;
        let stts = payload(&STTS)?.ok_or(Mp4Error::MissingRequiredTable("stts"))?;

        // Exactly one chunk-offset variant is expected; stco wins if both appear.
        let chunk_offsets = match (payload(&STCO)?, payload(&CO64)?) {
            (Some(stco), Some(_)) => {
                tracing::warn!("stbl carries both stco and co64, using stco");
                parse_stco(&stco)?
            }
            (Some(stco), None) => parse_stco(&stco)?,
            (None, Some(co64)) => parse_co64(&co64)?,
            (None, None) => return Err(Mp4Error::MissingRequiredTable("stco")),
        };

        Ok(Self {
            sample_sizes: parse_stsz(&stsz)?,
            sample_to_chunk: parse_stsc(&stsc)?,
            chunk_offsets,
            time_to_sample: parse_stts(&stts)?,
            sync_samples: payload(&STSS)?.map(|p| parse_stss(&p)).transpose()?,
            composition_offsets: payload(&CTTS)?.map(|p| parse_ctts(&p)).transpose()?,
        })
    }
}

pub fn parse_stsz(payload: &[u8]) -> Result<SampleSizes, Mp4Error> {
    let mut r = FieldReader::new(payload, "stsz");
    r.version_and_flags()?;
    let default_size = r.u32()?;
    let sample_count = r.u32()?;

    let mut sizes = Vec::new();
    if default_size == 0 {
        let needed = (sample_count as usize).saturating_mul(4);
        if needed > r.remaining() {
            return Err(Mp4Error::MalformedTable {
                table: "stsz",
                reason: format!("{} sizes declared, {} bytes present", sample_count, r.remaining()),
            });
        }
        sizes.reserve(sample_count as usize);
        for _ in 0..sample_count {
            sizes.push(r.u32()?);
        }
    }

    Ok(SampleSizes {
        default_size,
        sample_count,
        sizes,
    })
}

pub fn parse_stsc(payload: &[u8]) -> Result<Vec<StscEntry>, Mp4Error> {
    let mut r = FieldReader::new(payload, "stsc");
    r.version_and_flags()?;
    let count = r.entry_count(12)?;
    let mut runs = Vec::with_capacity(count);
    for _ in 0..count {
        runs.push(StscEntry {
            first_chunk: r.u32()?,
            samples_per_chunk: r.u32()?,
            sample_description_index: r.u32()?,
        });
    }
    Ok(runs)
}

pub fn parse_stco(payload: &[u8]) -> Result<Vec<u64>, Mp4Error> {
    let mut r = FieldReader::new(payload, "stco");
    r.version_and_flags()?;
    let count = r.entry_count(4)?;
    (0..count).map(|_| r.u32().map(u64::from)).collect()
}

pub fn parse_co64(payload: &[u8]) -> Result<Vec<u64>, Mp4Error> {
    let mut r = FieldReader::new(payload, "co64");
    r.version_and_flags()?;
    let count = r.entry_count(8)?;
    (0..count).map(|_| r.u64()).collect()
}

pub fn parse_stts(payload: &[u8]) -> Result<Vec<SttsEntry>, Mp4Error> {
    let mut r = FieldReader::new(payload, "stts");
    r.version_and_flags()?;
    let count = r.entry_count(8)?;
    let mut runs = Vec::with_capacity(count);
    for _ in 0..count {
        runs.push(SttsEntry {
            sample_count: r.u32()?,
            sample_delta: r.u32()?,
        });
    }
    Ok(runs)
}

pub fn parse_stss(payload: &[u8]) -> Result<Vec<u32>, Mp4Error> {
    let mut r = FieldReader::new(payload, "stss");
    r.version_and_flags()?;
    let count = r.entry_count(4)?;
    (0..count).map(|_| r.u32()).collect()
}

/// Composition offsets are read as signed for both versions.
pub fn parse_ctts(payload: &[u8]) -> Result<Vec<CttsEntry>, Mp4Error> {
    let mut r = FieldReader::new(payload, "ctts");
    let (_version, _flags) = r.version_and_flags()?;
    let count = r.entry_count(8)?;
    let mut runs = Vec::with_capacity(count);
    for _ in 0..count {
        runs.push(CttsEntry {
            sample_count: r.u32()?,
            sample_offset: r.i32()?,
        });
    }
    Ok(runs)
}

// ============================================================================
// Cursors
// ============================================================================

/// Walks chunks in file order, yielding the byte offset of each sample.
struct ChunkCursor<'a> {
    runs: &'a [StscEntry],
    offsets: &'a [u64],
    run_index: usize,
    /// 1-based number of the current chunk, 0 before the first
    chunk_number: u32,
    remaining_in_chunk: u32,
    current_offset: u64,
}

impl<'a> ChunkCursor<'a> {
    fn new(runs: &'a [StscEntry], offsets: &'a [u64]) -> Self {
        Self {
            runs,
            offsets,
            run_index: 0,
            chunk_number: 0,
            remaining_in_chunk: 0,
            current_offset: 0,
        }
    }

    fn advance_chunk(&mut self) -> Result<(), Mp4Error> {
        loop {
            self.chunk_number += 1;
            let base = *self
                .offsets
                .get(self.chunk_number as usize - 1)
                .ok_or_else(|| Mp4Error::MalformedTable {
                    table: "stco",
                    reason: format!("chunk {} referenced but only {} chunks declared", self.chunk_number, self.offsets.len()),
                })?;

            while self.run_index + 1 < self.runs.len()
                && self.runs[self.run_index + 1].first_chunk <= self.chunk_number
            {
                self.run_index += 1;
            }

            self.current_offset = base;
            self.remaining_in_chunk = self.runs[self.run_index].samples_per_chunk;
            if self.remaining_in_chunk > 0 {
                return Ok(());
            }
        }
    }

    fn next_offset(&mut self, size: u32) -> Result<u64, Mp4Error> {
        if self.remaining_in_chunk == 0 {
            self.advance_chunk()?;
        }
        let offset = self.current_offset;
        self.current_offset += size as u64;
        self.remaining_in_chunk -= 1;
        Ok(offset)
    }
}

/// Running decode time over the stts runs.
struct TimeCursor<'a> {
    runs: &'a [SttsEntry],
    run_index: usize,
    remaining_in_run: u32,
    delta: u32,
    elapsed: i64,
}

impl<'a> TimeCursor<'a> {
    fn new(runs: &'a [SttsEntry]) -> Self {
        Self {
            runs,
            run_index: 0,
            remaining_in_run: 0,
            delta: 0,
            elapsed: 0,
        }
    }

    /// Decode time and duration of the next sample
    fn next(&mut self, sample_index: usize) -> Result<(i64, u32), Mp4Error> {
        while self.remaining_in_run == 0 {
            let run = self.runs.get(self.run_index).ok_or_else(|| Mp4Error::MalformedTable {
                table: "stts",
                reason: format!("runs cover only {} samples", sample_index),
            })?;
            self.remaining_in_run = run.sample_count;
            self.delta = run.sample_delta;
            self.run_index += 1;
        }

        let decode_time = self.elapsed;
        self.elapsed += self.delta as i64;
        self.remaining_in_run -= 1;
        Ok((decode_time, self.delta))
    }
}

/// Composition offset per sample; 0 when absent or exhausted.
struct CompositionCursor<'a> {
    runs: &'a [CttsEntry],
    run_index: usize,
    remaining_in_run: u32,
    offset: i32,
}

impl<'a> CompositionCursor<'a> {
    fn new(runs: Option<&'a [CttsEntry]>) -> Self {
        Self {
            runs: runs.unwrap_or(&[]),
            run_index: 0,
            remaining_in_run: 0,
            offset: 0,
        }
    }

    fn next(&mut self) -> i32 {
        while self.remaining_in_run == 0 {
            match self.runs.get(self.run_index) {
                Some(run) => {
                    self.remaining_in_run = run.sample_count;
                    self.offset = run.sample_offset;
                    self.run_index += 1;
                }
                None => return 0,
            }
        }
        self.remaining_in_run -= 1;
        self.offset
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct SampleTableBuilder;

impl SampleTableBuilder {
    /// Read the tables under `stbl` and build the flat index.
    pub fn from_stbl<S: ByteSource + ?Sized>(
        parser: &BoxParser<'_, S>,
        stbl: &Mp4Box,
        timescale: u32,
        media_time_offset: i64,
    ) -> Result<SampleTable, Mp4Error> {
        let raw = RawSampleTables::read(parser, stbl)?;

        // Per-sample sizes are bounded by the stsz payload; a shared size is
        // bounded only by the bytes the samples would occupy.
        let sizes = &raw.sample_sizes;
        let span = sizes.default_size as u64 * sizes.sample_count as u64;
        if sizes.default_size != 0 && span > parser.resource_len() {
            return Err(Mp4Error::MalformedTable {
                table: "stsz",
                reason: format!(
                    "{} samples of {} bytes exceed the {}-byte resource",
                    sizes.sample_count,
                    sizes.default_size,
                    parser.resource_len()
                ),
            });
        }

        Self::build(&raw, timescale, media_time_offset)
    }

    /// Reject sample counts the time and chunk tables cannot cover before
    /// anything is sized from the count.
    fn check_coverage(raw: &RawSampleTables, count: usize) -> Result<(), Mp4Error> {
        let timed: u64 = raw.time_to_sample.iter().map(|r| r.sample_count as u64).sum();
        if timed < count as u64 {
            return Err(Mp4Error::MalformedTable {
                table: "stts",
                reason: format!("runs cover only {} of {} samples", timed, count),
            });
        }

        let per_chunk = raw
            .sample_to_chunk
            .iter()
            .map(|r| r.samples_per_chunk as u64)
            .max()
            .unwrap_or(0);
        let capacity = per_chunk.saturating_mul(raw.chunk_offsets.len() as u64);
        if capacity < count as u64 {
            return Err(Mp4Error::MalformedTable {
                table: "stco",
                reason: format!("{} chunks hold at most {} of {} samples", raw.chunk_offsets.len(), capacity, count),
            });
        }
        Ok(())
    }

    pub fn build(raw: &RawSampleTables, timescale: u32, media_time_offset: i64) -> Result<SampleTable, Mp4Error> {
        let count = raw.sample_sizes.sample_count as usize;
        if count == 0 {
            return Err(Mp4Error::NoSamples);
        }
        if raw.sample_sizes.default_size == 0 && raw.sample_sizes.sizes.len() < count {
            return Err(Mp4Error::MalformedTable {
                table: "stsz",
                reason: format!("{} sizes for {} samples", raw.sample_sizes.sizes.len(), count),
            });
        }
        if raw.sample_to_chunk.is_empty() {
            return Err(Mp4Error::MalformedTable {
                table: "stsc",
                reason: "no entries".into(),
            });
        }
        Self::check_coverage(raw, count)?;

        let mut keyframes = vec![raw.sync_samples.is_none(); count];
        for &number in raw.sync_samples.iter().flatten() {
            match (number as usize).checked_sub(1) {
                Some(index) if index < count => keyframes[index] = true,
                _ => tracing::debug!("Ignoring out-of-range sync sample {}", number),
            }
        }

        let mut chunks = ChunkCursor::new(&raw.sample_to_chunk, &raw.chunk_offsets);
        let mut times = TimeCursor::new(&raw.time_to_sample);
        let mut composition = CompositionCursor::new(raw.composition_offsets.as_deref());

        let mut samples = Vec::with_capacity(count);
        for index in 0..count {
            let size = raw.sample_sizes.size_of(index);
            let offset = chunks.next_offset(size)?;
            let (decode_time, duration) = times.next(index)?;
            let composition_offset = composition.next() as i64;

            samples.push(Sample {
                index,
                offset,
                size,
                decode_time,
                presentation_time: decode_time + composition_offset - media_time_offset,
                duration,
                is_keyframe: keyframes[index],
            });
        }

        let duration = samples
            .last()
            .map(|s| s.decode_time + s.duration as i64)
            .unwrap_or(0);

        tracing::debug!(
            "SampleTable: {} samples, {} keyframes, timescale={}, duration={}",
            samples.len(),
            keyframes.iter().filter(|&&k| k).count(),
            timescale,
            duration
        );

        Ok(SampleTable {
            samples,
            timescale,
            duration,
        })
    }
}
