//! EFB peeks from a CPU thread serviced by the thread owning the context

use fv_core::{create_efb_bridge, Config, EfbAccessRequest, TracingHost, EFB_ACCESS_SENTINEL};
use fv_gx::backend::null::NullBackend;
use fv_gx::{GraphicsBackend, VideoCore};
use std::thread;
use std::time::Duration;

fn core() -> VideoCore<NullBackend> {
    let mut config = Config::default();
    config.gfx.shader_cache = false;
    let mut core = VideoCore::new(config, NullBackend::with_scale(2), TracingHost::new());
    core.init().unwrap();
    core
}

#[test]
fn test_peek_is_serviced_exactly_once() {
    let mut core = core();
    // Native (200, 956) is EFB (100, 50) at 2x
    core.backend_mut().write_depth(200, 2 * 528 - 100, 0x1234_5678);

    let (sender, receiver) = create_efb_bridge(None);
    let cpu = thread::spawn(move || sender.access(EfbAccessRequest::peek_z(100, 50)));

    let mut serviced = 0;
    while !cpu.is_finished() {
        if core.service_efb(&receiver) {
            serviced += 1;
        }
        thread::yield_now();
    }

    assert_eq!(cpu.join().unwrap(), 0x12_3456);
    assert_eq!(serviced, 1);
    assert_eq!(receiver.serviced_count(), 1);
    // Nothing left over
    assert!(!core.service_efb(&receiver));
}

#[test]
fn test_back_to_back_requests_are_serialized() {
    let mut core = core();
    let (sender, receiver) = create_efb_bridge(None);

    let callers: Vec<_> = (0..4u32)
        .map(|i| {
            let sender = sender.clone();
            thread::spawn(move || {
                for n in 0..8u32 {
                    let z = (i << 16) | n;
                    sender.access(EfbAccessRequest::poke_z(i, n, z));
                    assert_eq!(sender.access(EfbAccessRequest::peek_z(i, n)), z);
                }
            })
        })
        .collect();

    let mut serviced = 0u64;
    while callers.iter().any(|c| !c.is_finished()) {
        if core.service_efb(&receiver) {
            serviced += 1;
        }
    }
    for caller in callers {
        caller.join().unwrap();
    }
    assert_eq!(serviced, 4 * 8 * 2);
    assert_eq!(sender.serviced_count(), serviced);
}

#[test]
fn test_lost_device_services_sentinel() {
    let mut core = core();
    core.backend_mut().lose_device();

    let (sender, receiver) = create_efb_bridge(None);
    let cpu = thread::spawn(move || sender.access(EfbAccessRequest::peek_z(0, 0)));

    while !cpu.is_finished() {
        core.service_efb(&receiver);
        thread::yield_now();
    }
    assert_eq!(cpu.join().unwrap(), EFB_ACCESS_SENTINEL);
}

#[test]
fn test_close_releases_waiting_caller() {
    let (sender, receiver) = create_efb_bridge(None);
    let caller = {
        let sender = sender.clone();
        thread::spawn(move || sender.access(EfbAccessRequest::peek_color(1, 1)))
    };

    while !receiver.is_access_requested() {
        thread::sleep(Duration::from_micros(100));
    }
    receiver.close();
    assert_eq!(caller.join().unwrap(), EFB_ACCESS_SENTINEL);
    assert!(!sender.is_open());
}

#[test]
fn test_single_core_runs_inline() {
    use fv_core::EfbAccessPort;

    let mut core = core();
    core.access_efb(EfbAccessRequest::poke_color(3, 4, 0xFF00_FF00));
    assert_eq!(core.access_efb(EfbAccessRequest::peek_color(3, 4)), 0xFF00_FF00);
}
