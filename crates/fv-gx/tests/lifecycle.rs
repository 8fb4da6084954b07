//! Startup, shutdown and whole sessions through the bridges

use fv_core::{
    create_efb_bridge, create_gpu_bridge, Config, EfbAccessRequest, TracingHost, VideoError, XfbSwap,
    EFB_ACCESS_SENTINEL,
};
use fv_gx::backend::null::NullBackend;
use fv_gx::decoder::encode;
use fv_gx::state::{BP_TEV_COLOR_ENV_BASE, CP_VAT_A_BASE, CP_VCD_LO};
use fv_gx::backend::PrimitiveType;
use fv_gx::{RenderThread, Subsystem, VideoCore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn config() -> Config {
    let mut config = Config::default();
    config.gfx.shader_cache = false;
    config.general.frame_limit = 0;
    config
}

/// One triangle with 12-byte positions, using TEV color env `env`
fn frame_commands(env: u32) -> Vec<u8> {
    let mut stream = Vec::new();
    encode::load_cp(&mut stream, CP_VCD_LO, 1 << 9);
    encode::load_cp(&mut stream, CP_VAT_A_BASE, 1 | (4 << 1));
    encode::load_bp(&mut stream, BP_TEV_COLOR_ENV_BASE, env);
    encode::draw(&mut stream, PrimitiveType::Triangles, 0, 3);
    stream.extend_from_slice(&[0u8; 36]);
    stream
}

#[test]
fn test_init_shutdown_cycles() {
    let host = TracingHost::new();
    let mut core = VideoCore::new(config(), NullBackend::new(), host.clone());

    // Nothing happens before init
    assert_eq!(core.run_commands(&frame_commands(0)), 0);
    assert!(!core.update_xfb(XfbSwap::default()));
    assert_eq!(core.reload_caches(), 0);

    for _ in 0..3 {
        core.init().unwrap();
        core.init().unwrap();
        assert_eq!(core.started_subsystems(), &Subsystem::STARTUP_ORDER);
        assert_eq!(core.run_commands(&frame_commands(0x08_F8AF)), 4);
        core.shutdown();
        core.shutdown();
        assert!(core.started_subsystems().is_empty());
    }
    assert_eq!(host.fatal_count(), 0);
}

#[test]
fn test_failed_startup_leaves_nothing_running() {
    let mut backend = NullBackend::new();
    backend.set_compile_failure(Some("utility vertex program"));
    let host = TracingHost::new();
    let mut core = VideoCore::new(config(), backend, host.clone());

    assert!(matches!(core.init(), Err(VideoError::Capability(_))));
    assert!(core.started_subsystems().is_empty());
    assert!(!core.is_initialized());
    assert_eq!(host.fatal_count(), 1);
}

#[test]
fn test_dual_core_session() {
    let (gpu_tx, gpu_rx) = create_gpu_bridge();
    let (efb_tx, efb_rx) = create_efb_bridge(Some(gpu_rx.waker()));
    let host = TracingHost::new();
    let thread = RenderThread::spawn(config(), host.clone(), NullBackend::new, gpu_rx, efb_rx).unwrap();

    while !gpu_tx.is_connected() {
        std::thread::yield_now();
    }
    for frame in 0..3u32 {
        assert!(gpu_tx.send_commands(frame_commands(0x08_F8A0 + frame)));
        assert!(gpu_tx.queue_swap(XfbSwap {
            xfb_addr: 0x0030_0000,
            width: 640,
            height: 480,
            y_offset: 0,
        }));
        // A peek lands between command chunks
        efb_tx.access(EfbAccessRequest::peek_z(320, 240));
    }
    assert!(gpu_tx.finish());

    let summary = thread.stop().unwrap();
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.commands, 12);
    assert_eq!(summary.efb_accesses, 3);
    assert_eq!(host.swap_count(), 3);
}

#[test]
fn test_single_core_session() {
    let host = TracingHost::new();
    let mut core = VideoCore::new(config(), NullBackend::new(), host.clone());
    core.init().unwrap();

    for frame in 0..3u32 {
        core.run_commands(&frame_commands(0x08_F8A0 + (frame % 2)));
        assert!(core.update_xfb(XfbSwap::default()));
    }
    assert_eq!(host.swap_count(), 3);
    assert_eq!(core.draw_count(), 3);
    // Two distinct signatures, the third frame repeats the first
    assert_eq!(core.pixel_cache().len(), 2);
    assert_eq!(core.pixel_cache().stats().misses, 2);
}

#[test]
fn test_dual_core_device_loss_recovers() {
    let (gpu_tx, gpu_rx) = create_gpu_bridge();
    let (efb_tx, efb_rx) = create_efb_bridge(Some(gpu_rx.waker()));
    let host = TracingHost::new();
    let trigger = Arc::new(AtomicBool::new(false));
    let backend_trigger = Arc::clone(&trigger);

    let thread = RenderThread::spawn(
        config(),
        host.clone(),
        move || NullBackend::new().with_loss_trigger(backend_trigger),
        gpu_rx,
        efb_rx,
    )
    .unwrap();
    while !gpu_tx.is_connected() {
        std::thread::yield_now();
    }

    gpu_tx.send_commands(frame_commands(0x08_F8A0));
    gpu_tx.queue_swap(XfbSwap::default());
    efb_tx.access(EfbAccessRequest::poke_z(5, 5, 0x12_3456));
    assert_eq!(efb_tx.access(EfbAccessRequest::peek_z(5, 5)), 0x12_3456);

    // The device goes away under a blocked peek
    trigger.store(true, Ordering::Release);
    assert_eq!(efb_tx.access(EfbAccessRequest::peek_z(5, 5)), EFB_ACCESS_SENTINEL);

    // Recreated context: real reads again, and draws resolve fresh programs
    efb_tx.access(EfbAccessRequest::poke_z(5, 5, 0x00_ABCD));
    assert_eq!(efb_tx.access(EfbAccessRequest::peek_z(5, 5)), 0x00_ABCD);
    gpu_tx.send_commands(frame_commands(0x08_F8A0));
    gpu_tx.queue_swap(XfbSwap::default());
    assert!(gpu_tx.finish());

    let summary = thread.stop().unwrap();
    assert_eq!(summary.device_resets, 1);
    assert_eq!(summary.draws, 2);
    assert_eq!(summary.frames, 2);
    assert_eq!(summary.efb_accesses, 5);
    assert_eq!(host.fatal_count(), 0);
}
