//! Vertex loaders
//!
//! The vertex descriptor (VCD) says which attributes a vertex has and whether
//! each is inline or indexed; the attribute format table (VAT) gives the
//! component counts and types. Together they fix the byte stride of a vertex
//! in the command stream, which the decoder needs to skip draw payloads.

use crate::state::{GxState, MAX_VAT};
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    /// Attributes present in a vertex
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct VertexComponents: u32 {
        const POSITION = 1 << 0;
        const NORMAL = 1 << 1;
        const COLOR0 = 1 << 2;
        const COLOR1 = 1 << 3;
        const POSMTX_IDX = 1 << 4;
        const TEXMTX_IDX0 = 1 << 5;
        const TEXMTX_IDX1 = 1 << 6;
        const TEXMTX_IDX2 = 1 << 7;
        const TEXMTX_IDX3 = 1 << 8;
        const TEXMTX_IDX4 = 1 << 9;
        const TEXMTX_IDX5 = 1 << 10;
        const TEXMTX_IDX6 = 1 << 11;
        const TEXMTX_IDX7 = 1 << 12;
        const TEXCOORD0 = 1 << 13;
        const TEXCOORD1 = 1 << 14;
        const TEXCOORD2 = 1 << 15;
        const TEXCOORD3 = 1 << 16;
        const TEXCOORD4 = 1 << 17;
        const TEXCOORD5 = 1 << 18;
        const TEXCOORD6 = 1 << 19;
        const TEXCOORD7 = 1 << 20;
    }
}

/// How an attribute is supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeMode {
    None,
    Direct,
    Index8,
    Index16,
}

impl AttributeMode {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::None,
            1 => Self::Direct,
            2 => Self::Index8,
            _ => Self::Index16,
        }
    }
}

impl VertexComponents {
    pub fn texcoord(index: usize) -> Self {
        Self::from_bits_truncate(Self::TEXCOORD0.bits() << index)
    }

    pub fn texmtx_idx(index: usize) -> Self {
        Self::from_bits_truncate(Self::TEXMTX_IDX0.bits() << index)
    }

    /// Attributes present according to a vertex descriptor
    pub fn from_vcd(vcd_lo: u32, vcd_hi: u32) -> Self {
        let desc = VertexDescriptor::new(vcd_lo, vcd_hi);
        let mut components = Self::empty();
        if desc.posmtx_idx {
            components |= Self::POSMTX_IDX;
        }
        for i in 0..8 {
            if desc.texmtx_idx[i] {
                components |= Self::texmtx_idx(i);
            }
            if desc.texcoord[i] != AttributeMode::None {
                components |= Self::texcoord(i);
            }
        }
        if desc.position != AttributeMode::None {
            components |= Self::POSITION;
        }
        if desc.normal != AttributeMode::None {
            components |= Self::NORMAL;
        }
        if desc.color[0] != AttributeMode::None {
            components |= Self::COLOR0;
        }
        if desc.color[1] != AttributeMode::None {
            components |= Self::COLOR1;
        }
        components
    }
}

/// Decoded VCD_LO / VCD_HI pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexDescriptor {
    pub posmtx_idx: bool,
    pub texmtx_idx: [bool; 8],
    pub position: AttributeMode,
    pub normal: AttributeMode,
    pub color: [AttributeMode; 2],
    pub texcoord: [AttributeMode; 8],
}

impl VertexDescriptor {
    pub fn new(vcd_lo: u32, vcd_hi: u32) -> Self {
        let mut texmtx_idx = [false; 8];
        let mut texcoord = [AttributeMode::None; 8];
        for i in 0..8 {
            texmtx_idx[i] = (vcd_lo >> (1 + i)) & 1 != 0;
            texcoord[i] = AttributeMode::from_bits(vcd_hi >> (2 * i));
        }
        Self {
            posmtx_idx: vcd_lo & 1 != 0,
            texmtx_idx,
            position: AttributeMode::from_bits(vcd_lo >> 9),
            normal: AttributeMode::from_bits(vcd_lo >> 11),
            color: [
                AttributeMode::from_bits(vcd_lo >> 13),
                AttributeMode::from_bits(vcd_lo >> 15),
            ],
            texcoord,
        }
    }
}

/// Count and format of one attribute from the VAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct AttributeFormat {
    count: u32,
    format: u32,
}

fn vat_field(word: u32, cnt_bit: u32) -> AttributeFormat {
    AttributeFormat {
        count: (word >> cnt_bit) & 1,
        format: (word >> (cnt_bit + 1)) & 0x7,
    }
}

/// Byte size of one component of a position, normal or texcoord
fn component_size(format: u32) -> u32 {
    match format {
        0 | 1 => 1,
        2 | 3 => 2,
        4 => 4,
        _ => {
            tracing::warn!("Invalid vertex component format {}, assuming float", format);
            4
        }
    }
}

/// Byte size of one color in the given color format
fn color_size(format: u32) -> u32 {
    match format {
        0 => 2, // RGB565
        1 => 3, // RGB888
        2 => 4, // RGB888x
        3 => 2, // RGBA4444
        4 => 3, // RGBA6666
        5 => 4, // RGBA8888
        _ => {
            tracing::warn!("Invalid vertex color format {}, assuming RGBA8888", format);
            4
        }
    }
}

fn attribute_size(mode: AttributeMode, direct_size: u32) -> u32 {
    match mode {
        AttributeMode::None => 0,
        AttributeMode::Direct => direct_size,
        AttributeMode::Index8 => 1,
        AttributeMode::Index16 => 2,
    }
}

/// Compute the stride of a vertex in the command stream
pub fn vertex_stride(vcd_lo: u32, vcd_hi: u32, vat: [u32; 3]) -> u32 {
    let desc = VertexDescriptor::new(vcd_lo, vcd_hi);
    let [a, b, c] = vat;

    let mut stride = 0;
    if desc.posmtx_idx {
        stride += 1;
    }
    stride += desc.texmtx_idx.iter().filter(|&&present| present).count() as u32;

    let pos = vat_field(a, 0);
    stride += attribute_size(desc.position, (2 + pos.count) * component_size(pos.format));

    let normal = vat_field(a, 9);
    let normal_elements = if normal.count == 0 { 3 } else { 9 };
    stride += attribute_size(desc.normal, normal_elements * component_size(normal.format));

    for (i, cnt_bit) in [13, 17].into_iter().enumerate() {
        let color = vat_field(a, cnt_bit);
        stride += attribute_size(desc.color[i], color_size(color.format));
    }

    let tex_formats = [
        vat_field(a, 21),
        vat_field(b, 0),
        vat_field(b, 9),
        vat_field(b, 18),
        vat_field(b, 27),
        vat_field(c, 5),
        vat_field(c, 14),
        vat_field(c, 23),
    ];
    for (mode, fmt) in desc.texcoord.iter().zip(tex_formats.iter()) {
        stride += attribute_size(*mode, (1 + fmt.count) * component_size(fmt.format));
    }

    stride
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LoaderKey {
    vcd_lo: u32,
    vcd_hi: u32,
    vat: [u32; 3],
}

/// A vertex format resolved for decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexLoader {
    pub stride: u32,
    pub components: VertexComponents,
}

/// Caches vertex loaders by format and remembers the active one per VAT slot
pub struct VertexLoaderManager {
    loaders: HashMap<LoaderKey, VertexLoader>,
    active: [Option<LoaderKey>; MAX_VAT],
    ready: bool,
}

impl VertexLoaderManager {
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
            active: [None; MAX_VAT],
            ready: false,
        }
    }

    pub fn init(&mut self) {
        self.loaders.clear();
        self.active = [None; MAX_VAT];
        self.ready = true;
    }

    pub fn shutdown(&mut self) {
        self.loaders.clear();
        self.active = [None; MAX_VAT];
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Loader for draws using VAT slot `vat` under the current state
    pub fn get_loader(&mut self, state: &GxState, vat: usize) -> VertexLoader {
        let vat = vat % MAX_VAT;
        let (vcd_lo, vcd_hi) = state.vcd();
        let key = LoaderKey {
            vcd_lo,
            vcd_hi,
            vat: state.vat(vat),
        };

        self.active[vat] = Some(key);

        *self.loaders.entry(key).or_insert_with(|| {
            let loader = VertexLoader {
                stride: vertex_stride(vcd_lo, vcd_hi, key.vat),
                components: VertexComponents::from_vcd(vcd_lo, vcd_hi),
            };
            tracing::debug!(
                "New vertex loader: vat={} stride={} components={:?}",
                vat,
                loader.stride,
                loader.components
            );
            loader
        })
    }

    /// Forget which loader each VAT slot uses, forcing a re-lookup on the next draw
    pub fn mark_all_dirty(&mut self) {
        self.active = [None; MAX_VAT];
    }

    pub fn is_active(&self, vat: usize) -> bool {
        self.active[vat % MAX_VAT].is_some()
    }

    pub fn loader_count(&self) -> usize {
        self.loaders.len()
    }
}

impl Default for VertexLoaderManager {
    fn default() -> Self {
        Self::new()
    }
}
