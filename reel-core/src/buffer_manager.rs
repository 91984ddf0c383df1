//! # Buffer Manager - Clock-Driven Decode-Ahead
//!
//! Keeps a [`FrameBuffer`] topped up ahead of the playback clock.
//!
//! ```text
//!              check_and_refill(now)            dequeue(now)
//!   clock ──────────────┬───────────────────────────┬──────────► consumer
//!                       ▼                           ▲
//!            ┌─────────────────────┐     ┌──────────┴──────────┐
//!            │ fill task           │────►│ FrameBuffer (mutex) │
//!            │ (spawn_blocking)    │     └─────────────────────┘
//!            │ demuxer → decoder   │
//!            └─────────────────────┘
//! ```
//!
//! At most one fill runs at a time (`is_filling` slot). Seeks and stops bump
//! a generation counter that the fill loop checks between samples, then wait
//! for the slot before touching decoder or buffer state.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::decode::{DecodeError, DecodedFrame, Decoder};
use crate::frame_queue::{BufferConfig, BufferedFrame, ConfigError, FrameBuffer, FrameBufferStats};
use crate::mp4_demux::{Mp4Demuxer, Mp4Error, SampleTable, VideoTrackInfo};
use crate::source::ByteSource;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Decoder error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Demux error: {0}")]
    Demux(#[from] Mp4Error),
    #[error("BufferManager must be created inside a tokio runtime")]
    NoRuntime,
    #[error("Fill task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferState {
    /// Below target, playback should wait
    Buffering,
    /// Enough look-ahead to play
    Ready,
    /// Every sample has been decoded; the buffer only drains from here
    EndOfStream,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferManagerStats {
    pub state: BufferState,
    pub buffer: FrameBufferStats,
    pub next_sample_index: usize,
    pub sample_count: usize,
    pub samples_decoded: u64,
    pub samples_skipped: u64,
    pub fills: u64,
}

/// Demuxer + decoder pair, only ever touched by the slot holder
struct FrameSource<S: ByteSource> {
    demuxer: Mp4Demuxer<S>,
    decoder: Box<dyn Decoder>,
    next_sample_index: usize,
}

struct Shared<S: ByteSource> {
    config: BufferConfig,
    buffer: Mutex<FrameBuffer>,
    source: Mutex<FrameSource<S>>,
    table: Arc<SampleTable>,
    track: VideoTrackInfo,
    state_tx: watch::Sender<BufferState>,

    is_filling: AtomicBool,
    /// Incremented to cancel the in-flight fill
    generation: AtomicU64,
    /// Decoded frames presenting before this are dropped (set by seek)
    discard_before_us: AtomicI64,

    samples_decoded: AtomicU64,
    samples_skipped: AtomicU64,
    fills: AtomicU64,
}

/// Ownership of the fill slot; released on drop, including on panic.
struct FillSlot<S: ByteSource + 'static> {
    shared: Arc<Shared<S>>,
}

impl<S: ByteSource + 'static> Drop for FillSlot<S> {
    fn drop(&mut self) {
        self.shared.is_filling.store(false, Ordering::Release);
    }
}

pub struct BufferManager<S: ByteSource + 'static> {
    shared: Arc<Shared<S>>,
    runtime: Handle,
    fill_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ByteSource + 'static> BufferManager<S> {
    /// Configure `decoder` for the demuxer's track and start in `Buffering`.
    /// The demuxer must already be parsed.
    pub fn new(demuxer: Mp4Demuxer<S>, mut decoder: Box<dyn Decoder>, config: BufferConfig) -> Result<Self, BufferError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| BufferError::NoRuntime)?;

        let table = demuxer.sample_table()?;
        let track = demuxer.track_info()?.clone();
        decoder.configure(&track)?;

        tracing::debug!(
            "BufferManager: {} samples, decoder={}, max_frames={}, low={}s, target={}s",
            table.len(),
            decoder.name(),
            config.max_frames,
            config.low_threshold_secs,
            config.target_threshold_secs
        );

        let (state_tx, _) = watch::channel(BufferState::Buffering);
        let shared = Shared {
            buffer: Mutex::new(FrameBuffer::new(config.clone())),
            config,
            source: Mutex::new(FrameSource {
                demuxer,
                decoder,
                next_sample_index: 0,
            }),
            table,
            track,
            state_tx,
            is_filling: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            discard_before_us: AtomicI64::new(i64::MIN),
            samples_decoded: AtomicU64::new(0),
            samples_skipped: AtomicU64::new(0),
            fills: AtomicU64::new(0),
        };

        Ok(Self {
            shared: Arc::new(shared),
            runtime,
            fill_task: Mutex::new(None),
        })
    }

    // ========================================================================
    // Fill Control
    // ========================================================================

    fn try_acquire(&self) -> Option<FillSlot<S>> {
        self.shared
            .is_filling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FillSlot {
                shared: Arc::clone(&self.shared),
            })
    }

    async fn acquire(&self) -> Result<FillSlot<S>, BufferError> {
        loop {
            if let Some(slot) = self.try_acquire() {
                return Ok(slot);
            }
            if !self.wait_for_fill().await? {
                // Someone else is awaiting the task handle
                tokio::task::yield_now().await;
            }
        }
    }

    fn spawn_fill(&self, slot: FillSlot<S>, current_us: i64) {
        let generation = self.shared.generation.load(Ordering::Acquire);
        let handle = self.runtime.spawn_blocking(move || {
            slot.shared.fill_blocking(generation, current_us);
            drop(slot);
        });
        *self.fill_task.lock() = Some(handle);
    }

    /// Decode until the target look-ahead is buffered or the samples run out.
    /// Waits for any fill already in progress first.
    pub async fn fill_buffer(&self, current_us: i64) -> Result<BufferState, BufferError> {
        let slot = self.acquire().await?;
        self.spawn_fill(slot, current_us);
        self.wait_for_fill().await?;
        Ok(self.state())
    }

    /// Start a background fill if none is running, the stream is not
    /// exhausted and the buffer is below the low threshold. Returns whether a
    /// fill was started.
    pub fn check_and_refill(&self, current_us: i64) -> bool {
        if self.state() == BufferState::EndOfStream {
            return false;
        }
        if !self.shared.buffer.lock().should_fetch(current_us) {
            return false;
        }
        match self.try_acquire() {
            Some(slot) => {
                tracing::trace!("Refill at {}us", current_us);
                self.spawn_fill(slot, current_us);
                true
            }
            None => false,
        }
    }

    /// Await the most recently spawned fill. Returns `false` if there was no
    /// task handle to wait on.
    pub async fn wait_for_fill(&self) -> Result<bool, BufferError> {
        let handle = self.fill_task.lock().take();
        match handle {
            Some(handle) => {
                handle.await.map_err(|e| BufferError::TaskFailed(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel the in-flight fill and wait for it to finish. Buffered frames
    /// are kept.
    pub async fn stop(&self) -> Result<(), BufferError> {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        let _slot = self.acquire().await?;
        tracing::debug!("BufferManager stopped");
        Ok(())
    }

    /// Restart decoding from the keyframe at or before `target_us` and refill.
    /// Frames presenting before the target are not buffered.
    pub async fn seek(&self, target_us: i64) -> Result<BufferState, BufferError> {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        let slot = self.acquire().await?;

        let index = seek_index(&self.shared.table, target_us);
        {
            let mut source = slot.shared.source.lock();
            source.decoder.reset();
            source.next_sample_index = index;
        }
        self.shared.buffer.lock().clear();
        self.shared.discard_before_us.store(target_us, Ordering::Release);
        self.shared.state_tx.send_replace(BufferState::Buffering);
        tracing::debug!("Seek to {}us, restarting at sample {}", target_us, index);

        self.spawn_fill(slot, target_us);
        self.wait_for_fill().await?;
        Ok(self.state())
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Earliest frame due at `current_us`, if any
    pub fn dequeue(&self, current_us: i64) -> Option<BufferedFrame> {
        let frame = self.shared.buffer.lock().dequeue(current_us);
        self.shared.update_state(current_us);
        frame
    }

    /// Presentation time of the next frame waiting to be shown
    pub fn next_due_us(&self) -> Option<i64> {
        self.shared.buffer.lock().peek_pts()
    }

    pub fn state(&self) -> BufferState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BufferState> {
        self.shared.state_tx.subscribe()
    }

    pub fn buffered_duration(&self, current_us: i64) -> Duration {
        let us = self.shared.buffer.lock().buffered_duration_us(current_us);
        Duration::from_micros(us as u64)
    }

    pub fn is_filling(&self) -> bool {
        self.shared.is_filling.load(Ordering::Acquire)
    }

    pub fn track_info(&self) -> &VideoTrackInfo {
        &self.shared.track
    }

    pub fn sample_table(&self) -> Arc<SampleTable> {
        Arc::clone(&self.shared.table)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> BufferManagerStats {
        let next_sample_index = match self.shared.source.try_lock() {
            Some(source) => source.next_sample_index,
            // A fill holds the source; report what has been decoded so far
            None => self.shared.samples_decoded.load(Ordering::Relaxed) as usize,
        };
        BufferManagerStats {
            state: self.state(),
            buffer: self.shared.buffer.lock().stats(),
            next_sample_index,
            sample_count: self.shared.table.len(),
            samples_decoded: self.shared.samples_decoded.load(Ordering::Relaxed),
            samples_skipped: self.shared.samples_skipped.load(Ordering::Relaxed),
            fills: self.shared.fills.load(Ordering::Relaxed),
        }
    }
}

/// Keyframe to restart from so that the target is decodable: at or before
/// the target in decode order, with presentation not after it.
fn seek_index(table: &SampleTable, target_us: i64) -> usize {
    let ticks = table.us_to_ticks(target_us);
    let mut index = table.keyframe_at_or_before(table.sample_at_decode_time(ticks));
    while index > 0 && table.samples()[index].presentation_time > ticks {
        index = table.keyframe_at_or_before(index - 1);
    }
    index
}

impl<S: ByteSource> Shared<S> {
    fn cancelled(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) != generation
    }

    fn buffered_frame(&self, frame: DecodedFrame) -> BufferedFrame {
        BufferedFrame {
            pts_us: self.table.ticks_to_us(frame.presentation_time),
            dts_us: self.table.ticks_to_us(frame.decode_time),
            duration_us: self.table.ticks_to_us(frame.duration as i64),
            payload: frame.payload,
            sample_index: frame.sample_index,
            width: frame.width,
            height: frame.height,
            keyframe: frame.keyframe,
        }
    }

    fn push_frame(&self, frame: DecodedFrame) {
        let frame = self.buffered_frame(frame);
        if frame.pts_us < self.discard_before_us.load(Ordering::Acquire) {
            tracing::trace!("Dropping pre-roll frame {} ({}us)", frame.sample_index, frame.pts_us);
            return;
        }
        self.buffer.lock().enqueue(frame);
    }

    fn wants_more(&self, current_us: i64) -> bool {
        let buffer = self.buffer.lock();
        !buffer.is_buffer_full(current_us) && buffer.len() < self.config.max_frames
    }

    /// The fill loop. Runs on the blocking pool while holding the fill slot.
    fn fill_blocking(&self, generation: u64, current_us: i64) {
        self.fills.fetch_add(1, Ordering::Relaxed);
        let mut source = self.source.lock();

        while self.wants_more(current_us) {
            if self.cancelled(generation) {
                tracing::debug!("Fill cancelled at sample {}", source.next_sample_index);
                return;
            }

            let index = source.next_sample_index;
            let Some(sample) = self.table.get(index).copied() else {
                self.finish_stream(&mut source);
                return;
            };
            source.next_sample_index += 1;

            let decoded = match source.demuxer.read_sample(index) {
                Ok(data) => source.decoder.decode(&data, &sample),
                Err(e) => Err(e.into()),
            };

            match decoded {
                Ok(Some(frame)) => {
                    self.samples_decoded.fetch_add(1, Ordering::Relaxed);
                    self.push_frame(frame);
                }
                Ok(None) => {
                    self.samples_decoded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.samples_skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Skipping sample {}: {}", index, e);
                }
            }
        }

        if source.next_sample_index >= self.table.len() {
            self.finish_stream(&mut source);
            return;
        }
        drop(source);
        self.update_state(current_us);
    }

    /// Input exhausted: flush the decoder into the buffer and latch EOS.
    fn finish_stream(&self, source: &mut FrameSource<S>) {
        if let Err(e) = source.decoder.finish_delayed_frames() {
            tracing::warn!("Decoder flush failed: {}", e);
        }
        let delayed = source.decoder.drain_frames();
        tracing::debug!("End of stream, {} delayed frames drained", delayed.len());
        for frame in delayed {
            self.push_frame(frame);
        }
        self.state_tx.send_replace(BufferState::EndOfStream);
    }

    /// Hysteresis: Buffering → Ready at target, Ready → Buffering below low.
    fn update_state(&self, current_us: i64) {
        let buffer = self.buffer.lock();
        let full = buffer.is_buffer_full(current_us) || buffer.len() >= self.config.max_frames;
        let low = buffer.should_fetch(current_us);
        drop(buffer);

        self.state_tx.send_if_modified(|state| {
            let next = match *state {
                BufferState::Buffering if full => BufferState::Ready,
                BufferState::Ready if low => BufferState::Buffering,
                other => other,
            };
            if next != *state {
                tracing::debug!("Buffer state {:?} -> {:?} at {}us", *state, next, current_us);
                *state = next;
                true
            } else {
                false
            }
        });
    }
}
