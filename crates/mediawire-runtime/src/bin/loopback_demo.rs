//! # mediawire loopback demo
//!
//! Runs a full TransportContext over in-process loopback transports: a
//! control handshake, synthetic H.264 GOPs on video and PCM audio. Video is
//! read back only every `--drain-every` frames, so the backlog builds up and
//! the drop gate engages. Prints channel statistics as JSON on exit.
//!
//! ## Usage
//!
//! ```bash
//! mediawire-loopback --frames 300 --gop 30 --frame-size 20000
//!
//! # Lossy link, custom config, verbose
//! RUST_LOG=debug mediawire-loopback --config doorbell.toml --loss-every 50
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mediawire_runtime::loopback::LoopbackTransport;
use mediawire_runtime::{
    ChannelKind, ContextConfig, OutgoingFrame, SendOutcome, TransferError, TransportContext,
};
use mediawire_transport::media::FrameKind;

use clap::Parser;

/// Loopback run of a full mediawire context.
#[derive(Parser, Debug)]
#[command(
    name = "mediawire-loopback",
    about = "Run control, video and audio channels over in-process loopback transports"
)]
struct Args {
    /// TOML context configuration; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Video frames to send.
    #[arg(short = 'n', long, default_value_t = 300)]
    frames: usize,

    /// GOP length in frames (one IDR per GOP).
    #[arg(short, long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
    gop: u32,

    /// Bytes per synthetic video frame.
    #[arg(short = 's', long, default_value_t = 40_000)]
    frame_size: usize,

    /// Read the video loopback back every N frames.
    #[arg(short, long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(1..))]
    drain_every: u32,

    /// Drop every Nth video unit on the link (0 = lossless).
    #[arg(short, long, default_value_t = 0)]
    loss_every: u64,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ContextConfig::from_file(path)?,
        None => ContextConfig::default(),
    };

    tracing::info!(
        service = %config.service_name,
        frames = args.frames,
        gop = args.gop,
        frame_size = args.frame_size,
        drain_every = args.drain_every,
        loss_every = args.loss_every,
        "mediawire-loopback starting"
    );

    // ── Context ─────────────────────────────────────────────────
    let control = Arc::new(LoopbackTransport::new(64));
    let video = Arc::new(LoopbackTransport::new(4096).with_loss_every(args.loss_every));
    let audio = Arc::new(LoopbackTransport::new(256));

    let ctx = TransportContext::builder(config)
        .transport(ChannelKind::Control, control.clone())
        .driver(ChannelKind::Control, control.clone())
        .transport(ChannelKind::Video, video.clone())
        .driver(ChannelKind::Video, video.clone())
        .occupancy_probe(video.clone())
        .transport(ChannelKind::Audio, audio.clone())
        .driver(ChannelKind::Audio, audio.clone())
        .build()?;

    let received: Arc<[AtomicU64; 3]> = Arc::new(Default::default());
    for kind in ChannelKind::ALL {
        let received = received.clone();
        ctx.register_receive_callback(kind, move |kind, data| {
            received[kind.index()].fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%kind, len = data.len(), "frame received");
        });
    }
    ctx.register_lifecycle_callback(|ev| {
        tracing::info!(channel = %ev.channel, code = ?ev.code, param = ev.param, "lifecycle");
    });

    for kind in ChannelKind::ALL {
        ctx.start(kind, 0)?;
    }

    // ── Control handshake ───────────────────────────────────────
    ctx.send(ChannelKind::Control, OutgoingFrame::raw(&b"HELLO"[..]))?;
    control.pump_into(&ctx, ChannelKind::Control)?;

    // ── Media ───────────────────────────────────────────────────
    let mut dropped = 0usize;
    let mut would_block = 0usize;
    for n in 0..args.frames {
        let frame = synthetic_h264(n % args.gop as usize == 0, args.frame_size);
        match ctx.send(ChannelKind::Video, OutgoingFrame::video(frame, FrameKind::Unknown)) {
            Ok(SendOutcome::Dropped) => dropped += 1,
            Ok(SendOutcome::Sent { .. }) => {}
            Err(TransferError::FragmentRejected { index, .. }) => {
                would_block += 1;
                tracing::debug!(frame = n, index, "video transport full");
            }
            Err(e) => return Err(e.into()),
        }

        ctx.send(ChannelKind::Audio, OutgoingFrame::raw(vec![0u8; 320]))?;
        audio.pump_into(&ctx, ChannelKind::Audio)?;

        if (n + 1) % args.drain_every as usize == 0 {
            video.pump_into(&ctx, ChannelKind::Video)?;
        }
    }
    video.pump_into(&ctx, ChannelKind::Video)?;

    // Let the reassembly worker finish the last frames.
    std::thread::sleep(Duration::from_millis(200));

    tracing::info!(
        sent = args.frames,
        dropped,
        would_block,
        lost_units = video.lost_units(),
        video_received = received[ChannelKind::Video.index()].load(Ordering::Relaxed),
        audio_received = received[ChannelKind::Audio.index()].load(Ordering::Relaxed),
        "run complete"
    );

    println!("{}", serde_json::to_string_pretty(&ctx.snapshot())?);
    ctx.shutdown();
    Ok(())
}

/// An Annex B access unit: one IDR or non-IDR slice NAL padded to `size`.
fn synthetic_h264(intra: bool, size: usize) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00, 0x01, if intra { 0x65 } else { 0x41 }];
    out.resize(size.max(out.len()), 0xAB);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_match_documented_run() {
        let args = Args::try_parse_from(["mediawire-loopback"]).unwrap();
        assert_eq!(args.config, None);
        assert_eq!(args.frames, 300);
        assert_eq!(args.gop, 30);
        assert_eq!(args.frame_size, 40_000);
        assert_eq!(args.drain_every, 6);
        assert_eq!(args.loss_every, 0);
    }

    #[test]
    fn long_and_short_flags_parse() {
        let args = Args::try_parse_from([
            "mediawire-loopback",
            "--config",
            "doorbell.toml",
            "-n",
            "10",
            "--frame-size",
            "1200",
            "-d",
            "2",
            "--loss-every",
            "50",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("doorbell.toml"));
        assert_eq!(args.frames, 10);
        assert_eq!(args.frame_size, 1200);
        assert_eq!(args.drain_every, 2);
        assert_eq!(args.loss_every, 50);
    }

    #[test]
    fn zero_gop_and_drain_interval_are_rejected() {
        assert!(Args::try_parse_from(["mediawire-loopback", "--gop", "0"]).is_err());
        assert!(Args::try_parse_from(["mediawire-loopback", "--drain-every", "0"]).is_err());
        assert!(Args::try_parse_from(["mediawire-loopback", "--frames", "lots"]).is_err());
    }
}
