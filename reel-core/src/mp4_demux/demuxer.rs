//! Single-track MP4 demuxer over a [`ByteSource`].

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use super::boxes::{find_box, find_path, BoxParser, Mp4Box};
use super::sample_table::{Sample, SampleTable, SampleTableBuilder};
use super::track::{handler_type, read_track_info, VideoTrackInfo};
use super::{Mp4Error, HANDLER_VIDEO, MDIA, MINF, MOOV, STBL, TRAK};
use crate::source::{ByteSource, FileSource, SourceError};

/// Locates the first video track of a file and serves its samples.
///
/// Construct with [`Mp4Demuxer::new`], then call [`Mp4Demuxer::parse`] once.
/// A failed range read leaves the demuxer usable.
pub struct Mp4Demuxer<S: ByteSource> {
    source: S,
    boxes: Vec<Mp4Box>,
    track: Option<VideoTrackInfo>,
    samples: Option<Arc<SampleTable>>,
    /// Next sample returned by `next_sample`
    cursor: usize,
}

impl Mp4Demuxer<FileSource> {
    /// Open and parse a local file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Mp4Error> {
        let mut demuxer = Self::new(FileSource::open(path)?);
        demuxer.parse()?;
        Ok(demuxer)
    }
}

impl<S: ByteSource> Mp4Demuxer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            boxes: Vec::new(),
            track: None,
            samples: None,
            cursor: 0,
        }
    }

    /// Parse the box tree, select the video track and build its sample table.
    pub fn parse(&mut self) -> Result<(), Mp4Error> {
        let parser = BoxParser::new(&self.source);
        let boxes = parser.parse_full_structure()?;

        let moov = find_box(&boxes, &MOOV).ok_or(Mp4Error::MissingBox("moov"))?;

        let mut video_trak = None;
        for trak in moov.children_of_type(&TRAK) {
            if handler_type(&parser, trak)? == Some(HANDLER_VIDEO) {
                video_trak = Some(trak);
                break;
            }
        }
        let trak = video_trak.ok_or(Mp4Error::TrackNotFound)?;

        let mut track = read_track_info(&parser, trak)?;
        let stbl = trak
            .child(&MDIA)
            .and_then(|mdia| find_path(mdia, &[MINF, STBL]))
            .ok_or(Mp4Error::MissingBox("stbl"))?;
        let table = SampleTableBuilder::from_stbl(&parser, stbl, track.timescale, track.media_time_offset)?;
        track.sample_count = table.len();

        tracing::info!(
            "Video track {}: {} {}x{}, {} samples, {:.2}s, timescale={}",
            track.track_id,
            track.sample_entry,
            track.width,
            track.height,
            track.sample_count,
            table.duration_secs(),
            track.timescale
        );

        self.boxes = boxes;
        self.track = Some(track);
        self.samples = Some(Arc::new(table));
        self.cursor = 0;
        Ok(())
    }

    pub fn is_parsed(&self) -> bool {
        self.samples.is_some()
    }

    pub fn boxes(&self) -> &[Mp4Box] {
        &self.boxes
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn track_info(&self) -> Result<&VideoTrackInfo, Mp4Error> {
        self.track.as_ref().ok_or(Mp4Error::NotParsed)
    }

    fn table(&self) -> Result<&SampleTable, Mp4Error> {
        self.samples.as_deref().ok_or(Mp4Error::NotParsed)
    }

    /// Shared handle to the sample index
    pub fn sample_table(&self) -> Result<Arc<SampleTable>, Mp4Error> {
        self.samples.clone().ok_or(Mp4Error::NotParsed)
    }

    pub fn sample_count(&self) -> Result<usize, Mp4Error> {
        Ok(self.table()?.len())
    }

    /// Metadata of sample `index`, no I/O
    pub fn sample(&self, index: usize) -> Result<&Sample, Mp4Error> {
        let table = self.table()?;
        table.get(index).ok_or(Mp4Error::SampleOutOfRange {
            index,
            count: table.len(),
        })
    }

    /// Compressed bytes of sample `index`, one ranged read.
    pub fn read_sample(&self, index: usize) -> Result<Bytes, Mp4Error> {
        let sample = *self.sample(index)?;
        let data = self.source.read(sample.offset, sample.size as usize)?;
        if data.len() < sample.size as usize {
            return Err(Mp4Error::Source(SourceError::InvalidRange {
                offset: sample.offset + data.len() as u64,
                len: self.source.len(),
            }));
        }
        Ok(data)
    }

    /// Sample at the cursor and its bytes, advancing the cursor. `None` once
    /// every sample has been returned.
    pub fn next_sample(&mut self) -> Result<Option<(Sample, Bytes)>, Mp4Error> {
        if self.cursor >= self.sample_count()? {
            return Ok(None);
        }
        let index = self.cursor;
        let sample = *self.sample(index)?;
        let data = self.read_sample(index)?;
        self.cursor += 1;
        Ok(Some((sample, data)))
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Move the cursor to the keyframe at or before `decode_time` (timescale
    /// units) and return its index.
    pub fn seek_to_keyframe(&mut self, decode_time: i64) -> Result<usize, Mp4Error> {
        let table = self.table()?;
        let index = table.keyframe_at_or_before(table.sample_at_decode_time(decode_time));
        tracing::debug!("Seek to dts {} -> keyframe sample {}", decode_time, index);
        self.cursor = index;
        Ok(index)
    }
}
