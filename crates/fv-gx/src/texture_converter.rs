//! EFB-to-texture copies
//!
//! A copy execute write encodes a rectangle of the EFB into a texture format
//! and stores it at the copy destination address. Copies are kept here,
//! keyed by destination, until the texture cache asks for them. A new copy
//! replaces every older one whose memory it overlaps.

use crate::backend::GraphicsBackend;
use crate::efb;
use crate::state::EfbCopy;
use std::collections::BTreeMap;

/// Most copies kept at once; the oldest goes first
pub const MAX_COPIES: usize = 256;

/// Texture formats an EFB copy can encode to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyFormat {
    I8,
    Ia8,
    Rgb565,
    Rgb5a3,
    Rgba8,
}

impl CopyFormat {
    /// Decode the copy format field. Formats not handled here encode as RGBA8.
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0xF {
            0x1 => Self::I8,
            0x3 => Self::Ia8,
            0x4 => Self::Rgb565,
            0x5 => Self::Rgb5a3,
            0x6 => Self::Rgba8,
            other => {
                tracing::debug!("EFB copy format 0x{:X} encoded as RGBA8", other);
                Self::Rgba8
            }
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::Ia8 | Self::Rgb565 | Self::Rgb5a3 => 2,
            Self::Rgba8 => 4,
        }
    }

    /// Encode one 0xAARRGGBB pixel, big-endian
    fn encode(self, argb: u32, out: &mut Vec<u8>) {
        let a = (argb >> 24) as u8;
        let r = (argb >> 16) as u8;
        let g = (argb >> 8) as u8;
        let b = argb as u8;
        let intensity = ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8;
        match self {
            Self::I8 => out.push(intensity),
            Self::Ia8 => out.extend_from_slice(&[a, intensity]),
            Self::Rgb565 => {
                let v = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Rgb5a3 => {
                let v = if a == 0xFF {
                    0x8000 | ((r as u16 >> 3) << 10) | ((g as u16 >> 3) << 5) | (b as u16 >> 3)
                } else {
                    ((a as u16 >> 5) << 12) | ((r as u16 >> 4) << 8) | ((g as u16 >> 4) << 4) | (b as u16 >> 4)
                };
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Rgba8 => out.extend_from_slice(&[a, r, g, b]),
        }
    }
}

/// An encoded EFB copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCopy {
    pub format: CopyFormat,
    pub width: u32,
    pub height: u32,
    /// Row-major, top row first
    pub data: Vec<u8>,
}

impl EncodedCopy {
    /// Emulated memory range the copy was written to
    fn range(&self, dest_addr: u32) -> std::ops::Range<u64> {
        let start = dest_addr as u64;
        start..start + self.data.len().max(1) as u64
    }
}

/// Encodes EFB copies into textures
#[derive(Debug, Default)]
pub struct TextureConverter {
    /// Destination address to (insertion generation, copy)
    copies: BTreeMap<u32, (u64, EncodedCopy)>,
    generation: u64,
    ready: bool,
}

impl TextureConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self) {
        self.copies.clear();
        self.ready = true;
    }

    pub fn shutdown(&mut self) {
        self.copies.clear();
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Encode `copy` from the backend's render target and store it
    pub fn encode_copy<B: GraphicsBackend + ?Sized>(&mut self, copy: &EfbCopy, backend: &mut B) -> Option<&EncodedCopy> {
        if !self.ready {
            return None;
        }
        let format = CopyFormat::from_bits(copy.format);
        let (scale_x, scale_y) = backend.target_scale();
        let (_, height) = backend.target_size();

        let mut data = Vec::with_capacity((copy.width * copy.height) as usize * format.bytes_per_pixel());
        for y in copy.y..copy.y + copy.height {
            for x in copy.x..copy.x + copy.width {
                // Sample the pixel centre; the native row count starts at the bottom
                let (nx, ny) = efb::to_native_coords(x, y + 1, scale_x, scale_y, height);
                format.encode(backend.read_color(nx, ny), &mut data);
            }
        }

        tracing::debug!(
            "EFB copy {}x{} at ({}, {}) -> 0x{:08X} as {:?}",
            copy.width,
            copy.height,
            copy.x,
            copy.y,
            copy.dest_addr,
            format
        );
        let encoded = EncodedCopy {
            format,
            width: copy.width,
            height: copy.height,
            data,
        };
        self.store(copy.dest_addr, encoded);
        self.get(copy.dest_addr)
    }

    fn store(&mut self, dest_addr: u32, encoded: EncodedCopy) {
        let range = encoded.range(dest_addr);
        let before = self.copies.len();
        self.copies.retain(|&addr, (_, old)| {
            let old = old.range(addr);
            old.end <= range.start || range.end <= old.start
        });
        let overwritten = before - self.copies.len();
        if overwritten > 0 {
            tracing::trace!("EFB copy at 0x{:08X} replaced {} older copies", dest_addr, overwritten);
        }

        while self.copies.len() >= MAX_COPIES {
            let oldest = self
                .copies
                .iter()
                .min_by_key(|(_, (generation, _))| *generation)
                .map(|(&addr, _)| addr);
            match oldest {
                Some(addr) => {
                    self.copies.remove(&addr);
                }
                None => break,
            }
        }

        self.generation += 1;
        self.copies.insert(dest_addr, (self.generation, encoded));
    }

    pub fn get(&self, dest_addr: u32) -> Option<&EncodedCopy> {
        self.copies.get(&dest_addr).map(|(_, copy)| copy)
    }

    pub fn copy_count(&self) -> usize {
        self.copies.len()
    }

    /// Forget every copy; their memory contents are no longer trustworthy
    pub fn invalidate(&mut self) {
        self.copies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;

    fn copy(format: u32) -> EfbCopy {
        EfbCopy {
            x: 0,
            y: 0,
            width: 2,
            height: 2,
            dest_addr: 0x0010_0000,
            format,
            clear: false,
            to_xfb: false,
        }
    }

    #[test]
    fn test_pixel_encodings() {
        let mut out = Vec::new();
        CopyFormat::Rgb565.encode(0xFFFF_0000, &mut out);
        assert_eq!(out, vec![0xF8, 0x00]);

        out.clear();
        CopyFormat::Rgb5a3.encode(0xFF00_00FF, &mut out);
        assert_eq!(out, vec![0x80, 0x1F]);

        out.clear();
        CopyFormat::I8.encode(0xFFFF_FFFF, &mut out);
        assert_eq!(out, vec![0xFF]);
    }

    #[test]
    fn test_encode_copy_reads_efb() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        backend.clear(0xFF12_3456, 0);

        let mut converter = TextureConverter::new();
        converter.init();
        let encoded = converter.encode_copy(&copy(0x6), &mut backend).unwrap();
        assert_eq!(encoded.format, CopyFormat::Rgba8);
        assert_eq!(encoded.data.len(), 16);
        assert_eq!(&encoded.data[..4], &[0xFF, 0x12, 0x34, 0x56]);
        assert_eq!(converter.copy_count(), 1);

        converter.invalidate();
        assert!(converter.get(0x0010_0000).is_none());
    }

    #[test]
    fn test_overlapping_copy_replaces_older() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut converter = TextureConverter::new();
        converter.init();

        // 2x2 RGBA8 = 16 bytes at 0x100000
        converter.encode_copy(&copy(0x6), &mut backend);
        // Adjacent, no overlap
        let mut next = copy(0x6);
        next.dest_addr = 0x0010_0010;
        converter.encode_copy(&next, &mut backend);
        assert_eq!(converter.copy_count(), 2);

        // Starts inside the first copy
        let mut inside = copy(0x1);
        inside.dest_addr = 0x0010_0008;
        converter.encode_copy(&inside, &mut backend);
        assert_eq!(converter.copy_count(), 2);
        assert!(converter.get(0x0010_0000).is_none());
        assert!(converter.get(0x0010_0010).is_some());
        assert_eq!(converter.get(0x0010_0008).unwrap().format, CopyFormat::I8);
    }

    #[test]
    fn test_copy_count_is_capped() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut converter = TextureConverter::new();
        converter.init();

        let mut c = copy(0x1);
        c.width = 1;
        c.height = 1;
        for i in 0..(MAX_COPIES as u32 + 8) {
            c.dest_addr = i * 0x20;
            converter.encode_copy(&c, &mut backend);
        }
        assert_eq!(converter.copy_count(), MAX_COPIES);
        // The oldest went first
        assert!(converter.get(0).is_none());
        assert!(converter.get(7 * 0x20).is_none());
        assert!(converter.get(8 * 0x20).is_some());
    }

    #[test]
    fn test_not_ready_encodes_nothing() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut converter = TextureConverter::new();
        assert!(converter.encode_copy(&copy(0x4), &mut backend).is_none());
    }
}
