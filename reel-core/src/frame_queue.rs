//! # Frame Buffer - Bounded, PTS-Ordered Look-Ahead
//!
//! Holds decoded frames ahead of the playback clock:
//! - frames kept sorted by presentation time (decoders emit out of order)
//! - bounded capacity, overflow drops the oldest frame
//! - two thresholds drive the producer: fetch below `low`, stop at `target`
//!
//! ```text
//!   now                 low                     target
//!    │◄─── should_fetch ──►│◄── has_enough_buffer ──►│ is_buffer_full
//!    ├─────────────────────┼─────────────────────────┤
//!  [f0 f1 f2 f3 ...                          ... fN]  (sorted by pts_us)
//! ```
//!
//! `FrameBuffer` itself is not synchronized; the buffer manager owns it
//! behind a mutex.

use std::collections::VecDeque;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("low threshold {low}s must be non-negative and no greater than target {target}s")]
    InvalidThresholds { low: f64, target: f64 },
    #[error("max_frames must be at least 1")]
    ZeroCapacity,
    #[error("Invalid buffer config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to read buffer config: {0}")]
    Io(#[from] std::io::Error),
}

/// Look-ahead buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum frames held at once
    pub max_frames: usize,
    /// Below this much buffered time the producer is asked to refill (seconds)
    pub low_threshold_secs: f64,
    /// A fill stops once this much time is buffered (seconds)
    pub target_threshold_secs: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_frames: 120,            // 4s at 30fps
            low_threshold_secs: 1.0,
            target_threshold_secs: 3.0,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frames == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let ordered = self.low_threshold_secs >= 0.0 && self.low_threshold_secs <= self.target_threshold_secs;
        if !ordered {
            return Err(ConfigError::InvalidThresholds {
                low: self.low_threshold_secs,
                target: self.target_threshold_secs,
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON config; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn low_threshold_us(&self) -> i64 {
        (self.low_threshold_secs * 1_000_000.0) as i64
    }

    pub fn target_threshold_us(&self) -> i64 {
        (self.target_threshold_secs * 1_000_000.0) as i64
    }
}

// ============================================================================
// Frames
// ============================================================================

/// A decoded frame waiting for its presentation time. Times in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedFrame {
    pub payload: Bytes,
    pub pts_us: i64,
    pub dts_us: i64,
    pub duration_us: i64,
    pub sample_index: usize,
    pub width: u32,
    pub height: u32,
    pub keyframe: bool,
}

/// Buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameBufferStats {
    pub len: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub evicted: u64,
    pub first_pts_us: Option<i64>,
    pub last_pts_us: Option<i64>,
}

// ============================================================================
// Frame Buffer
// ============================================================================

pub struct FrameBuffer {
    config: BufferConfig,
    frames: VecDeque<BufferedFrame>,
    enqueued: u64,
    dequeued: u64,
    evicted: u64,
}

impl FrameBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            frames: VecDeque::with_capacity(config.max_frames),
            config,
            enqueued: 0,
            dequeued: 0,
            evicted: 0,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Insert in PTS order. Returns the frame evicted to make room, if any.
    pub fn enqueue(&mut self, frame: BufferedFrame) -> Option<BufferedFrame> {
        let pos = self.frames.partition_point(|f| f.pts_us <= frame.pts_us);
        self.frames.insert(pos, frame);
        self.enqueued += 1;

        if self.frames.len() > self.config.max_frames {
            let oldest = self.frames.pop_front();
            if let Some(f) = &oldest {
                self.evicted += 1;
                tracing::trace!("Frame buffer full, evicted pts {}us", f.pts_us);
            }
            return oldest;
        }
        None
    }

    /// Earliest frame, but only once its presentation time has come
    pub fn dequeue(&mut self, at_us: i64) -> Option<BufferedFrame> {
        if self.frames.front()?.pts_us > at_us {
            return None;
        }
        self.dequeued += 1;
        self.frames.pop_front()
    }

    pub fn peek_pts(&self) -> Option<i64> {
        self.frames.front().map(|f| f.pts_us)
    }

    /// Time covered from `from_us` to the last buffered frame, never negative
    pub fn buffered_duration_us(&self, from_us: i64) -> i64 {
        self.frames
            .back()
            .map(|last| (last.pts_us - from_us).max(0))
            .unwrap_or(0)
    }

    pub fn buffered_secs(&self, from_us: i64) -> f64 {
        self.buffered_duration_us(from_us) as f64 / 1_000_000.0
    }

    pub fn should_fetch(&self, from_us: i64) -> bool {
        self.buffered_duration_us(from_us) < self.config.low_threshold_us()
    }

    pub fn has_enough_buffer(&self, from_us: i64) -> bool {
        !self.should_fetch(from_us)
    }

    pub fn is_buffer_full(&self, from_us: i64) -> bool {
        self.buffered_duration_us(from_us) >= self.config.target_threshold_us()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn stats(&self) -> FrameBufferStats {
        FrameBufferStats {
            len: self.frames.len(),
            capacity: self.config.max_frames,
            enqueued: self.enqueued,
            dequeued: self.dequeued,
            evicted: self.evicted,
            first_pts_us: self.frames.front().map(|f| f.pts_us),
            last_pts_us: self.frames.back().map(|f| f.pts_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts_us: i64) -> BufferedFrame {
        BufferedFrame {
            payload: Bytes::new(),
            pts_us,
            dts_us: pts_us,
            duration_us: 33_333,
            sample_index: 0,
            width: 1920,
            height: 1080,
            keyframe: false,
        }
    }

    fn pts_list(buffer: &FrameBuffer) -> Vec<i64> {
        buffer.frames.iter().map(|f| f.pts_us).collect()
    }

    #[test]
    fn test_enqueue_keeps_pts_order() {
        let mut buffer = FrameBuffer::new(BufferConfig::default());
        for pts in [30_000, 10_000, 20_000, 0, 50_000, 40_000] {
            buffer.enqueue(frame(pts));
        }
        assert_eq!(pts_list(&buffer), vec![0, 10_000, 20_000, 30_000, 40_000, 50_000]);
        assert_eq!(buffer.peek_pts(), Some(0));
    }

    #[test]
    fn test_dequeue_never_returns_future_frames() {
        let mut buffer = FrameBuffer::new(BufferConfig::default());
        buffer.enqueue(frame(100_000));
        buffer.enqueue(frame(200_000));

        assert!(buffer.dequeue(99_999).is_none());
        assert_eq!(buffer.dequeue(100_000).map(|f| f.pts_us), Some(100_000));
        assert!(buffer.dequeue(150_000).is_none());
        assert_eq!(buffer.dequeue(1_000_000).map(|f| f.pts_us), Some(200_000));
        assert!(buffer.dequeue(i64::MAX).is_none());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buffer = FrameBuffer::new(BufferConfig {
            max_frames: 3,
            ..Default::default()
        });
        for pts in [0, 1, 2] {
            assert!(buffer.enqueue(frame(pts)).is_none());
        }
        let evicted = buffer.enqueue(frame(3)).expect("evicted");
        assert_eq!(evicted.pts_us, 0);
        assert_eq!(pts_list(&buffer), vec![1, 2, 3]);
        assert_eq!(buffer.stats().evicted, 1);
    }

    #[test]
    fn test_thresholds() {
        let mut buffer = FrameBuffer::new(BufferConfig::default());
        assert!(buffer.should_fetch(0));
        assert_eq!(buffer.buffered_duration_us(0), 0);

        // 0.5s buffered
        for i in 0..=15 {
            buffer.enqueue(frame(i * 33_333));
        }
        assert!(buffer.should_fetch(0));
        assert!(!buffer.has_enough_buffer(0));

        // 1.5s buffered
        for i in 16..=45 {
            buffer.enqueue(frame(i * 33_333));
        }
        assert!(buffer.has_enough_buffer(0));
        assert!(!buffer.is_buffer_full(0));

        // 90 frames is 2.99997s, one more crosses the target
        for i in 46..=90 {
            buffer.enqueue(frame(i * 33_333));
        }
        assert!(!buffer.is_buffer_full(0));
        buffer.enqueue(frame(91 * 33_333));
        assert!(buffer.is_buffer_full(0));
        assert!(buffer.buffered_secs(0) > 3.0);

        // Clock past the last frame: nothing buffered, not negative
        assert_eq!(buffer.buffered_duration_us(10_000_000), 0);
        assert!(buffer.should_fetch(10_000_000));
    }

    #[test]
    fn test_peek_and_clear() {
        let mut buffer = FrameBuffer::new(BufferConfig::default());
        for pts in [300, 0, 200, 100] {
            buffer.enqueue(frame(pts));
        }
        assert_eq!(buffer.peek_pts(), Some(0));
        assert!(buffer.dequeue(0).is_some());
        assert_eq!(buffer.peek_pts(), Some(100));
        assert_eq!(pts_list(&buffer), vec![100, 200, 300]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.peek_pts(), None);
    }

    #[test]
    fn test_stats_track_activity() {
        let mut buffer = FrameBuffer::new(BufferConfig::default());
        buffer.enqueue(frame(5));
        buffer.enqueue(frame(9));
        buffer.dequeue(5);
        let stats = buffer.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dequeued, 1);
        assert_eq!(stats.len, 1);
        assert_eq!(stats.capacity, 120);
        assert_eq!(stats.first_pts_us, Some(9));
    }

    #[test]
    fn test_config_validation() {
        assert!(BufferConfig::default().validate().is_ok());
        let inverted = BufferConfig {
            low_threshold_secs: 4.0,
            ..Default::default()
        };
        assert!(matches!(inverted.validate(), Err(ConfigError::InvalidThresholds { .. })));
        let empty = BufferConfig {
            max_frames: 0,
            ..Default::default()
        };
        assert!(matches!(empty.validate(), Err(ConfigError::ZeroCapacity)));
    }

    #[test]
    fn test_config_from_json() {
        let config = BufferConfig::from_json(r#"{ "max_frames": 48 }"#).expect("config");
        assert_eq!(config.max_frames, 48);
        assert_eq!(config.low_threshold_secs, 1.0);
        assert_eq!(config.target_threshold_us(), 3_000_000);

        assert!(matches!(BufferConfig::from_json("{ not json"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            BufferConfig::from_json(r#"{ "low_threshold_secs": 5.0 }"#),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }
}
