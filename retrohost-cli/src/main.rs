//! Headless libretro frontend.
//!
//! Loads a core, optionally loads content, then pumps frames at the core's
//! nominal rate (or flat out with `--unthrottled`). Video goes into the
//! shared frame slot and is summarized at the end; audio is counted and
//! discarded; input reports everything released. Useful for smoke-testing
//! cores and exercising the runtime without a window system.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use retrohost_core::{AudioSink, NullInput, Session, SessionConfig};

#[derive(Parser)]
#[command(name = "retrohost", about = "Run a libretro core headless")]
struct Args {
    /// Path to the core library (.so / .dylib / .dll).
    core: PathBuf,

    /// Content file to load; omit for cores that support content-less runs.
    content: Option<PathBuf>,

    /// Number of frames to run before exiting.
    #[arg(long, default_value_t = 600)]
    frames: u32,

    /// Run as fast as possible instead of pacing to the core's frame rate.
    #[arg(long)]
    unthrottled: bool,

    /// Directory the core may query for system files (BIOS etc).
    #[arg(long)]
    system_dir: Option<PathBuf>,

    /// Directory the core may query for saves.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Seed a core option before load, e.g. --set mycore_region=pal.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    variables: Vec<(String, String)>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

/// Counts delivered audio frames, drops the samples.
#[derive(Clone, Default)]
struct CountingAudio {
    frames: Arc<AtomicU64>,
}

impl AudioSink for CountingAudio {
    fn play(&mut self, _samples: &[i16], frames: usize) {
        self.frames.fetch_add(frames as u64, Ordering::Relaxed);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let audio = CountingAudio::default();
    let audio_frames = Arc::clone(&audio.frames);
    let mut session = Session::new(
        SessionConfig {
            system_dir: args.system_dir,
            save_dir: args.save_dir,
            variables: args.variables,
        },
        Box::new(audio),
        Box::new(NullInput),
    );

    let caps = session
        .load(&args.core)
        .with_context(|| format!("loading core {}", args.core.display()))?;
    tracing::info!(
        "loaded {} {} (extensions: {})",
        caps.library_name,
        caps.library_version,
        caps.valid_extensions.join("|"),
    );

    session
        .load_content(args.content.as_deref())
        .context("loading content")?;

    let caps = session
        .capabilities()
        .context("capabilities missing after content load")?;
    let frame_duration = caps
        .target_frame_duration()
        .unwrap_or(Duration::from_secs_f64(1.0 / 60.0));
    if let Some(geometry) = caps.geometry {
        tracing::info!(
            "core reports {}x{} at {:.2} fps",
            geometry.base_width,
            geometry.base_height,
            1.0 / frame_duration.as_secs_f64(),
        );
    }

    let slot = session.frame_slot();
    let mut ticked = 0u32;
    for _ in 0..args.frames {
        session.tick().context("running frame")?;
        ticked += 1;
        if session.shutdown_requested() {
            tracing::info!("core requested shutdown");
            break;
        }
        if !args.unthrottled {
            spin_sleep::sleep(frame_duration);
        }
    }

    match slot.latest() {
        Some(frame) => tracing::info!(
            "ran {ticked} frames; last frame {}x{} ({:?}, {} bytes), {} audio frames",
            frame.width,
            frame.height,
            frame.format,
            frame.bytes.len(),
            audio_frames.load(Ordering::Relaxed),
        ),
        None => tracing::info!(
            "ran {ticked} frames; no video frame published, {} audio frames",
            audio_frames.load(Ordering::Relaxed),
        ),
    }

    session.unload();
    Ok(())
}
