//! # reel Probe
//!
//! Headless inspector for the reel-core frame index and a playback simulator
//! that drives the buffering layer with a passthrough decoder.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, info};

use reel_core::mp4_demux::Mp4Box;
use reel_core::{
    BufferConfig, BufferManager, BufferState, Mp4Demuxer, PassthroughConfig, PassthroughDecoder, ReorderBuffer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "reel - MP4 frame index probe")]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print video track metadata
    Info {
        file: PathBuf,
        /// Include the parsed box tree
        #[arg(long, action = clap::ArgAction::SetTrue)]
        tree: bool,
    },
    /// Dump the sample index as JSON lines
    Samples {
        file: PathBuf,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(short, long, action = clap::ArgAction::SetTrue)]
        keyframes_only: bool,
    },
    /// Simulate playback through the frame buffer
    Play {
        file: PathBuf,
        /// Buffer config as JSON (max_frames, low_threshold_secs, target_threshold_secs)
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value_t = 0)]
        reorder_delay: usize,
        /// Use the synchronous reorder buffer instead of the async manager
        #[arg(long, action = clap::ArgAction::SetTrue)]
        pull: bool,
    },
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::new("warn")
            .add_directive(format!("reel={level}").parse()?)
            .add_directive(format!("reel_core={level}").parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

fn open(path: &Path) -> Result<Mp4Demuxer<reel_core::FileSource>> {
    Mp4Demuxer::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

fn box_tree(boxes: &[Mp4Box]) -> Value {
    Value::Array(
        boxes
            .iter()
            .map(|b| {
                let mut node = json!({
                    "type": b.type_str(),
                    "offset": b.offset,
                    "size": b.size,
                });
                if !b.children.is_empty() {
                    node["children"] = box_tree(&b.children);
                }
                node
            })
            .collect(),
    )
}

fn run_info(file: &Path, tree: bool) -> Result<()> {
    let demuxer = open(file)?;
    let track = demuxer.track_info()?;
    let table = demuxer.sample_table()?;

    let mut out = json!({
        "file": file.display().to_string(),
        "track": track,
        "keyframes": table.keyframe_count(),
        "duration_secs": table.duration_secs(),
    });
    match track.parameter_sets() {
        Ok(sets) => {
            out["nal_length_size"] = json!(sets.nal_length_size);
            out["parameter_sets"] = json!({ "vps": sets.vps.len(), "sps": sets.sps.len(), "pps": sets.pps.len() });
        }
        Err(e) => out["codec_config_error"] = json!(e.to_string()),
    }
    if tree {
        out["boxes"] = box_tree(demuxer.boxes());
    }

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn run_samples(file: &Path, limit: Option<usize>, keyframes_only: bool) -> Result<()> {
    let demuxer = open(file)?;
    let table = demuxer.sample_table()?;

    let samples = table
        .iter()
        .filter(|s| !keyframes_only || s.is_keyframe)
        .take(limit.unwrap_or(usize::MAX));
    for sample in samples {
        println!("{}", serde_json::to_string(sample)?);
    }
    Ok(())
}

async fn run_play(file: &Path, config: Option<&Path>, reorder_delay: usize, pull: bool) -> Result<()> {
    let demuxer = open(file)?;
    let decoder = PassthroughDecoder::new(PassthroughConfig {
        reorder_delay,
        annexb: false,
    });

    if pull {
        return play_pull(demuxer, decoder);
    }

    let config = match config {
        Some(path) => BufferConfig::from_file(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => BufferConfig::default(),
    };
    let manager = BufferManager::new(demuxer, Box::new(decoder), config)?;
    let table = manager.sample_table();
    let step_us = table
        .get(0)
        .map(|s| table.ticks_to_us(s.duration as i64))
        .filter(|&us| us > 0)
        .unwrap_or(33_333);

    let mut clock_us = 0i64;
    let mut shown = 0u64;
    let mut stalls = 0u64;
    manager.fill_buffer(clock_us).await?;
    info!("Playback starting, {:?} buffered", manager.buffered_duration(clock_us));

    loop {
        manager.check_and_refill(clock_us);
        while let Some(frame) = manager.dequeue(clock_us) {
            debug!("t={}us frame {} pts={}us", clock_us, frame.sample_index, frame.pts_us);
            shown += 1;
        }

        match manager.state() {
            BufferState::EndOfStream if manager.stats().buffer.len == 0 => break,
            BufferState::Buffering => {
                stalls += 1;
                debug!("Stall at {}us, next frame due at {:?}us", clock_us, manager.next_due_us());
                manager.fill_buffer(clock_us).await?;
            }
            _ => {}
        }
        clock_us += step_us;
    }

    manager.stop().await?;
    let stats = manager.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "mode": "push",
            "frames_shown": shown,
            "stalls": stalls,
            "end_clock_us": clock_us,
            "stats": stats,
        }))?
    );
    Ok(())
}

fn play_pull(demuxer: Mp4Demuxer<reel_core::FileSource>, decoder: PassthroughDecoder) -> Result<()> {
    let mut buffer = ReorderBuffer::new(demuxer, decoder)?;
    let order = buffer.sample_table().presentation_order();

    let mut shown = 0u64;
    let mut missing = 0u64;
    for pts in order {
        match buffer.next_frame(pts)? {
            Some(frame) => {
                debug!("pts={} frame {}", pts, frame.sample_index);
                shown += 1;
            }
            None => missing += 1,
        }
    }
    let leftover = buffer.drain_all().len();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "mode": "pull",
            "frames_shown": shown,
            "frames_missing": missing,
            "leftover": leftover,
            "skipped_samples": buffer.skipped_samples(),
        }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    debug!("reel v{} (core {})", env!("CARGO_PKG_VERSION"), reel_core::VERSION);

    match cli.command {
        Command::Info { file, tree } => run_info(&file, tree),
        Command::Samples {
            file,
            limit,
            keyframes_only,
        } => run_samples(&file, limit, keyframes_only),
        Command::Play {
            file,
            config,
            reorder_delay,
            pull,
        } => run_play(&file, config.as_deref(), reorder_delay, pull).await,
    }
}
