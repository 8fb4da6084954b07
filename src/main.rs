//! flipper-video - headless GX backend runner
//!
//! Plays a generated command stream through the video core, either inline
//! (single-core) or through the render thread (dual-core), against the null
//! backend.

use anyhow::{anyhow, Context};
use fv_core::config::GfxBackend;
use fv_core::{
    create_efb_bridge, create_gpu_bridge, logging, Config, EfbAccessPort, EfbAccessRequest,
    TracingHost, XfbSwap,
};
use fv_gx::backend::null::NullBackend;
use fv_gx::backend::PrimitiveType;
use fv_gx::decoder::encode;
use fv_gx::state::{BP_ALPHA_COMPARE, BP_TEV_COLOR_ENV_BASE, CP_VAT_A_BASE, CP_VCD_LO};
use fv_gx::{RenderThread, VideoCore};
use std::path::PathBuf;

const DEFAULT_FRAMES: u32 = 60;

struct Args {
    config: Option<PathBuf>,
    frames: u32,
    /// Save the last frame under this name
    screenshot: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        frames: DEFAULT_FRAMES,
        screenshot: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--frames" => {
                let value = iter.next().context("--frames needs a value")?;
                args.frames = value
                    .parse()
                    .with_context(|| format!("invalid frame count '{}'", value))?;
            }
            "--screenshot" => {
                let value = iter.next().context("--screenshot needs a file name")?;
                args.screenshot = Some(PathBuf::from(value));
            }
            _ => args.config = Some(PathBuf::from(arg)),
        }
    }
    Ok(args)
}

/// Command stream for one frame: a handful of draws under shifting TEV state
fn frame_commands(frame: u32) -> Vec<u8> {
    let mut stream = Vec::new();
    encode::load_cp(&mut stream, CP_VCD_LO, 1 << 9);
    encode::load_cp(&mut stream, CP_VAT_A_BASE, 1 | (4 << 1));
    for draw in 0..4u32 {
        encode::load_bp(&mut stream, BP_TEV_COLOR_ENV_BASE, 0x08_F8A0 + ((frame + draw) % 8));
        encode::load_bp(&mut stream, BP_ALPHA_COMPARE, 0x80 | ((draw % 2) << 16));
        encode::draw(&mut stream, PrimitiveType::Triangles, 0, 3);
        stream.extend_from_slice(&[0u8; 3 * 12]);
    }
    stream
}

fn swap() -> XfbSwap {
    XfbSwap {
        xfb_addr: 0x0030_0000,
        width: 640,
        height: 480,
        y_offset: 0,
    }
}

/// Build the configured backend at the configured EFB scale
fn make_backend(backend: GfxBackend, efb_scale: u32) -> NullBackend {
    match backend {
        GfxBackend::Null => NullBackend::with_scale(efb_scale),
    }
}

fn run_single_core(config: Config, args: &Args) -> anyhow::Result<()> {
    let host = TracingHost::new();
    let backend = make_backend(config.gfx.backend, config.gfx.efb_scale);
    let mut core = VideoCore::new(config, backend, host.clone());
    core.init().context("video core failed to start")?;

    for frame in 0..args.frames {
        if frame + 1 == args.frames {
            if let Some(name) = &args.screenshot {
                core.request_screenshot(name);
            }
        }
        core.run_commands(&frame_commands(frame));
        core.access_efb(EfbAccessRequest::peek_z(320, 240));
        core.update_xfb(swap());
    }

    let stats = core.pixel_cache().stats();
    tracing::info!(
        "Single-core: {} frames, {} draws, pixel cache {} hot / {} map / {} compiled",
        host.swap_count(),
        core.draw_count(),
        stats.hot_hits,
        stats.map_hits,
        stats.compiles
    );
    core.shutdown();
    Ok(())
}

fn run_dual_core(config: Config, args: &Args) -> anyhow::Result<()> {
    if args.screenshot.is_some() {
        tracing::warn!("Screenshots are only taken in single-core sessions");
    }
    let (gpu_tx, gpu_rx) = create_gpu_bridge();
    let (efb_tx, efb_rx) = create_efb_bridge(Some(gpu_rx.waker()));
    let host = TracingHost::new();
    let (backend, efb_scale) = (config.gfx.backend, config.gfx.efb_scale);
    let thread = RenderThread::spawn(
        config,
        host.clone(),
        move || make_backend(backend, efb_scale),
        gpu_rx,
        efb_rx,
    )
    .context("render thread failed to start")?;

    while !gpu_tx.is_connected() {
        std::thread::yield_now();
    }
    for frame in 0..args.frames {
        gpu_tx.send_commands(frame_commands(frame));
        efb_tx.access(EfbAccessRequest::peek_z(320, 240));
        gpu_tx.queue_swap(swap());
    }
    gpu_tx.finish();

    let summary = thread.stop()?;
    tracing::info!(
        "Dual-core: {} frames, {} commands, {} draws, {} EFB accesses, {} device resets",
        summary.frames,
        summary.commands,
        summary.draws,
        summary.efb_accesses,
        summary.device_resets
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .map_err(|e| anyhow!("could not load config: {}", e))?;

    logging::init(&config.debug);
    tracing::info!("Starting flipper-video ({} frames)", args.frames);

    if config.general.dual_core {
        run_dual_core(config, &args)
    } else {
        run_single_core(config, &args)
    }
}
