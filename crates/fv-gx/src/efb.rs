//! EFB peek and poke against the backend's render target
//!
//! Requests arrive in emulated EFB coordinates with row 0 at the top. The
//! native target may be scaled up and stores row 0 at the bottom.

use crate::backend::GraphicsBackend;
use fv_core::{EfbAccessRequest, EfbAccessType, EFB_ACCESS_SENTINEL};

/// Map emulated EFB coordinates to native render-target coordinates
pub fn to_native_coords(x: u32, y: u32, scale_x: f32, scale_y: f32, native_height: u32) -> (u32, u32) {
    let nx = (x as f32 * scale_x) as u32;
    let ny = native_height.saturating_sub((y as f32 * scale_y) as u32);
    (nx, ny)
}

/// Native depth storage is 32 bits wide; the EFB holds 24
pub fn truncate_depth(native: u32) -> u32 {
    native / 0x100
}

/// Widen a 24-bit EFB depth to native storage
pub fn expand_depth(z: u32) -> u32 {
    (z & 0x00FF_FFFF) << 8
}

/// Perform one access on the calling (context) thread.
///
/// Reads of a multisampled depth target resolve it first and rebind the
/// render target afterwards. Writes return the sentinel.
pub fn perform_efb_access<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    request: &EfbAccessRequest,
    multisampled: bool,
) -> u32 {
    if backend.is_device_lost() {
        tracing::debug!("EFB {:?} with lost device", request.kind);
        return EFB_ACCESS_SENTINEL;
    }

    let (scale_x, scale_y) = backend.target_scale();
    let (_, height) = backend.target_size();
    let (x, y) = to_native_coords(request.x, request.y, scale_x, scale_y, height);

    let value = match request.kind {
        EfbAccessType::PeekZ => {
            if multisampled {
                backend.resolve_depth_target();
            }
            let z = truncate_depth(backend.read_depth(x, y));
            if multisampled {
                backend.restore_render_target();
            }
            z
        }
        EfbAccessType::PokeZ => {
            backend.write_depth(x, y, expand_depth(request.data));
            EFB_ACCESS_SENTINEL
        }
        EfbAccessType::PeekColor => backend.read_color(x, y),
        EfbAccessType::PokeColor => {
            backend.write_color(x, y, request.data);
            EFB_ACCESS_SENTINEL
        }
    };
    if backend.is_device_lost() {
        tracing::debug!("Device lost during EFB {:?}", request.kind);
        return EFB_ACCESS_SENTINEL;
    }

    tracing::trace!(
        "EFB {:?} ({}, {}) -> native ({}, {}) = 0x{:08X}",
        request.kind,
        request.x,
        request.y,
        x,
        y,
        value
    );
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::{NullBackend, EFB_HEIGHT};

    #[test]
    fn test_coordinate_transform() {
        assert_eq!(to_native_coords(100, 50, 2.0, 2.0, 960), (200, 860));
        assert_eq!(to_native_coords(0, 0, 1.0, 1.0, 528), (0, 528));
        // Never wraps below row 0
        assert_eq!(to_native_coords(0, 600, 1.0, 1.0, 528), (0, 0));
    }

    #[test]
    fn test_depth_truncation() {
        assert_eq!(truncate_depth(0x1234_5678), 0x12_3456);
        assert_eq!(truncate_depth(expand_depth(0xAB_CDEF)), 0xAB_CDEF);
    }

    #[test]
    fn test_poke_then_peek() {
        let mut backend = NullBackend::with_scale(2);
        backend.init().unwrap();

        perform_efb_access(&mut backend, &EfbAccessRequest::poke_z(100, 50, 0x12_3456), false);
        assert_eq!(backend.read_depth(200, 2 * EFB_HEIGHT - 100), 0x1234_5600);
        assert_eq!(
            perform_efb_access(&mut backend, &EfbAccessRequest::peek_z(100, 50), false),
            0x12_3456
        );

        perform_efb_access(&mut backend, &EfbAccessRequest::poke_color(10, 10, 0xFF11_2233), false);
        assert_eq!(
            perform_efb_access(&mut backend, &EfbAccessRequest::peek_color(10, 10), false),
            0xFF11_2233
        );
    }

    #[test]
    fn test_multisampled_peek_resolves() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        backend.set_multisample(4);

        perform_efb_access(&mut backend, &EfbAccessRequest::peek_z(1, 1), true);
        assert_eq!(backend.resolve_count(), 1);
        perform_efb_access(&mut backend, &EfbAccessRequest::peek_z(1, 1), false);
        assert_eq!(backend.resolve_count(), 1);
    }

    #[test]
    fn test_lost_device_returns_sentinel() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        backend.lose_device();
        assert_eq!(
            perform_efb_access(&mut backend, &EfbAccessRequest::peek_z(1, 1), false),
            EFB_ACCESS_SENTINEL
        );
    }
}
