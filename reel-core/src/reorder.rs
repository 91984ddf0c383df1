//! Pull-based reorder buffer.
//!
//! The consumer asks for the frame presenting at a given time; the buffer
//! decodes forward in decode order, parking every frame it produces in a
//! PTS-keyed map until it is asked for.
//!
//! Not synchronized: one owner drives it through `&mut self`. Callers sharing
//! it across threads must serialize access themselves.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::decode::{DecodeError, DecodedFrame, Decoder};
use crate::mp4_demux::{Mp4Demuxer, SampleTable};
use crate::source::ByteSource;

pub struct ReorderBuffer<S: ByteSource, D: Decoder> {
    demuxer: Mp4Demuxer<S>,
    decoder: D,
    table: Arc<SampleTable>,
    /// Decoded frames keyed by presentation time; PTS is unique per track
    pending: BTreeMap<i64, DecodedFrame>,
    next_decode_index: usize,
    end_of_stream: bool,
    skipped: u64,
}

impl<S: ByteSource, D: Decoder> ReorderBuffer<S, D> {
    /// `demuxer` must already be parsed; `decoder` is configured here.
    pub fn new(demuxer: Mp4Demuxer<S>, mut decoder: D) -> Result<Self, DecodeError> {
        let table = demuxer.sample_table()?;
        decoder.configure(demuxer.track_info()?)?;
        Ok(Self {
            demuxer,
            decoder,
            table,
            pending: BTreeMap::new(),
            next_decode_index: 0,
            end_of_stream: false,
            skipped: 0,
        })
    }

    /// Frame presenting exactly at `requested_pts` (timescale units).
    ///
    /// Decodes forward until the frame turns up or the samples run out; in
    /// the latter case `Ok(None)` is returned and [`is_end_of_stream`]
    /// becomes true.
    ///
    /// [`is_end_of_stream`]: ReorderBuffer::is_end_of_stream
    pub fn next_frame(&mut self, requested_pts: i64) -> Result<Option<DecodedFrame>, DecodeError> {
        loop {
            if let Some(frame) = self.pending.remove(&requested_pts) {
                return Ok(Some(frame));
            }
            if self.end_of_stream {
                return Ok(None);
            }
            self.decode_next()?;
        }
    }

    fn decode_next(&mut self) -> Result<(), DecodeError> {
        let index = self.next_decode_index;
        let Some(sample) = self.table.get(index).copied() else {
            if let Err(e) = self.decoder.finish_delayed_frames() {
                tracing::warn!("Decoder flush failed: {}", e);
            }
            for frame in self.decoder.drain_frames() {
                self.park(frame);
            }
            tracing::debug!("Reorder buffer reached end of stream, {} frames pending", self.pending.len());
            self.end_of_stream = true;
            return Ok(());
        };
        self.next_decode_index += 1;

        let decoded = match self.demuxer.read_sample(index) {
            Ok(data) => self.decoder.decode(&data, &sample),
            Err(e) => Err(e.into()),
        };
        match decoded {
            Ok(Some(frame)) => self.park(frame),
            Ok(None) => {}
            Err(e) => {
                self.skipped += 1;
                tracing::warn!("Skipping sample {}: {}", index, e);
            }
        }
        Ok(())
    }

    fn park(&mut self, frame: DecodedFrame) {
        if let Some(prev) = self.pending.insert(frame.presentation_time, frame) {
            tracing::warn!(
                "Duplicate presentation time {}, replacing sample {}",
                prev.presentation_time,
                prev.sample_index
            );
        }
    }

    /// Every parked frame in presentation order
    pub fn drain_all(&mut self) -> Vec<DecodedFrame> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Restart from the keyframe at or before `decode_time`; returns its index
    pub fn seek(&mut self, decode_time: i64) -> usize {
        let index = self
            .table
            .keyframe_at_or_before(self.table.sample_at_decode_time(decode_time));
        self.decoder.reset();
        self.pending.clear();
        self.end_of_stream = false;
        self.next_decode_index = index;
        index
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn next_decode_index(&self) -> usize {
        self.next_decode_index
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn skipped_samples(&self) -> u64 {
        self.skipped
    }

    pub fn sample_table(&self) -> &SampleTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{PassthroughConfig, PassthroughDecoder};
    use crate::source::MemorySource;
    use crate::test_util::{build_mp4, SyntheticTrack};

    fn passthrough(delay: usize) -> PassthroughDecoder {
        PassthroughDecoder::new(PassthroughConfig {
            reorder_delay: delay,
            annexb: false,
        })
    }

    /// I P B B P B B with a one-frame edit offset
    fn b_frame_buffer() -> ReorderBuffer<MemorySource, PassthroughDecoder> {
        let mut track = SyntheticTrack::constant(7, 7);
        track.ctts = Some(vec![(1, 3000), (1, 9000), (2, 0), (1, 9000), (2, 0)]);
        track.edit = Some((21_000, 3000));
        let mut demuxer = Mp4Demuxer::new(MemorySource::new(build_mp4(&track)));
        demuxer.parse().expect("parse");
        ReorderBuffer::new(demuxer, passthrough(2)).expect("reorder buffer")
    }

    #[test]
    fn returns_frames_in_presentation_order() {
        let mut buffer = b_frame_buffer();
        let mut indices = Vec::new();
        for pts in (0..7).map(|i| i * 3000) {
            let frame = buffer.next_frame(pts).expect("decode").expect("frame");
            assert_eq!(frame.presentation_time, pts);
            indices.push(frame.sample_index);
        }
        assert_eq!(indices, vec![0, 2, 3, 1, 5, 6, 4]);
        assert!(buffer.is_end_of_stream());
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn decodes_only_as_far_as_needed() {
        let mut buffer = b_frame_buffer();
        // pts 0 needs samples 0, 1, 2 in before the delay-2 decoder releases it
        buffer.next_frame(0).unwrap().expect("frame");
        assert_eq!(buffer.next_decode_index(), 3);
        assert!(!buffer.is_end_of_stream());

        // pts 3000 comes out on the next decode
        buffer.next_frame(3000).unwrap().expect("frame");
        assert_eq!(buffer.next_decode_index(), 4);
    }

    #[test]
    fn missing_pts_runs_to_end_of_stream() {
        let mut buffer = b_frame_buffer();
        assert!(buffer.next_frame(1).unwrap().is_none());
        assert!(buffer.is_end_of_stream());
        assert_eq!(buffer.pending_len(), 7);

        let drained: Vec<i64> = buffer.drain_all().iter().map(|f| f.presentation_time).collect();
        assert_eq!(drained, vec![0, 3000, 6000, 9000, 12000, 15000, 18000]);
        assert_eq!(buffer.pending_len(), 0);
        assert!(buffer.next_frame(0).unwrap().is_none());
    }

    #[test]
    fn seek_resets_to_keyframe() {
        let mut demuxer = Mp4Demuxer::new(MemorySource::new(build_mp4(&SyntheticTrack::constant(20, 10))));
        demuxer.parse().expect("parse");
        let mut buffer = ReorderBuffer::new(demuxer, passthrough(0)).expect("reorder buffer");

        assert!(buffer.next_frame(-1).unwrap().is_none());
        assert!(buffer.is_end_of_stream());
        assert_eq!(buffer.pending_len(), 20);

        assert_eq!(buffer.seek(14 * 3000), 10);
        assert!(!buffer.is_end_of_stream());
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.next_decode_index(), 10);

        let frame = buffer.next_frame(12 * 3000).unwrap().expect("frame");
        assert_eq!(frame.sample_index, 12);
        assert_eq!(buffer.pending_len(), 2);
    }

    /// Passthrough whose end-of-stream flush always fails
    struct BrokenFlush(PassthroughDecoder);

    impl Decoder for BrokenFlush {
        fn configure(&mut self, track: &crate::mp4_demux::VideoTrackInfo) -> Result<(), DecodeError> {
            self.0.configure(track)
        }

        fn decode(
            &mut self,
            data: &[u8],
            sample: &crate::mp4_demux::Sample,
        ) -> Result<Option<DecodedFrame>, DecodeError> {
            self.0.decode(data, sample)
        }

        fn finish_delayed_frames(&mut self) -> Result<(), DecodeError> {
            Err(DecodeError::DecodeFailed("flush rejected".into()))
        }

        fn drain_frames(&mut self) -> Vec<DecodedFrame> {
            self.0.drain_frames()
        }

        fn reset(&mut self) {
            self.0.reset()
        }

        fn name(&self) -> &str {
            "broken-flush"
        }
    }

    #[test]
    fn failed_flush_still_ends_the_stream() {
        let mut demuxer = Mp4Demuxer::new(MemorySource::new(build_mp4(&SyntheticTrack::constant(5, 5))));
        demuxer.parse().expect("parse");
        let mut buffer = ReorderBuffer::new(demuxer, BrokenFlush(passthrough(0))).expect("reorder buffer");

        assert!(buffer.next_frame(-1).expect("flush error is not fatal").is_none());
        assert!(buffer.is_end_of_stream());
        assert_eq!(buffer.pending_len(), 5);

        // Latched: no second flush attempt
        assert!(buffer.next_frame(-1).unwrap().is_none());
        assert_eq!(buffer.next_frame(0).unwrap().map(|f| f.sample_index), Some(0));
    }

    #[test]
    fn rejects_unparsed_demuxer() {
        let demuxer = Mp4Demuxer::new(MemorySource::new(Vec::new()));
        assert!(matches!(ReorderBuffer::new(demuxer, passthrough(0)), Err(DecodeError::Demux(_))));
    }
}
