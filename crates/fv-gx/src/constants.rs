//! Constant buffer managers
//!
//! Values that change without changing program text (TEV color registers,
//! alpha reference, fog, transform matrices) live in constant buffers. Each
//! manager rebuilds its buffer from the register mirrors when the state marks
//! it dirty and uploads only when the bytes actually changed.

use crate::backend::{GraphicsBackend, ShaderStage};
use crate::state::{
    DirtyFlags, GxState, XF_AMBIENT0, XF_MATERIAL0, XF_NORMAL_MATRIX_BASE, XF_PROJECTION_BASE,
};
use bytemuck::{Pod, Zeroable};

/// Pixel program constants, in upload layout
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PixelConstants {
    /// prev (initial value), c0, c1, c2
    pub colors: [[f32; 4]; 4],
    pub konst: [[f32; 4]; 4],
    /// (ref0, ref1, _, _) normalized to 0-1
    pub alpha_ref: [f32; 4],
    pub fog_color: [f32; 4],
    /// (a, b, c, _)
    pub fog_params: [f32; 4],
    pub dst_alpha: [f32; 4],
}

/// Vertex program constants, in upload layout
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VertexConstants {
    /// Rows 0-2 position matrix, rows 3-5 normal matrix
    pub posnormal: [[f32; 4]; 6],
    pub projection: [[f32; 4]; 4],
    /// Ambient 0/1, material 0/1
    pub materials: [[f32; 4]; 4],
}

/// Sign-extend an 11-bit TEV color register component
fn s11(value: u32) -> f32 {
    let v = ((value & 0x7FF) as i32) << 21 >> 21;
    v as f32 / 255.0
}

fn unorm8(value: u32) -> f32 {
    (value & 0xFF) as f32 / 255.0
}

/// RGBA8 packed as 0xRRGGBBAA
fn rgba8(value: u32) -> [f32; 4] {
    [
        unorm8(value >> 24),
        unorm8(value >> 16),
        unorm8(value >> 8),
        unorm8(value),
    ]
}

/// Fog A and C use a 20-bit float: 11-bit mantissa, 8-bit exponent, sign
fn fog_float(value: u32) -> f32 {
    let mantissa = value & 0x7FF;
    let exponent = (value >> 11) & 0xFF;
    let sign = (value >> 19) & 1;
    if exponent == 0 && mantissa == 0 {
        return 0.0;
    }
    f32::from_bits((sign << 31) | (exponent << 23) | (mantissa << 12))
}

impl PixelConstants {
    pub fn from_state(state: &GxState) -> Self {
        let mut c = Self::zeroed();
        for i in 0..4 {
            let (ra, bg) = state.tev_register(i);
            c.colors[i] = [s11(ra), s11(bg >> 12), s11(bg), s11(ra >> 12)];
            let (kra, kbg) = state.tev_konst_register(i);
            c.konst[i] = [unorm8(kra), unorm8(kbg >> 12), unorm8(kbg), unorm8(kra >> 12)];
        }

        let alpha = state.alpha_test();
        c.alpha_ref = [unorm8(alpha.ref0), unorm8(alpha.ref1), 0.0, 0.0];

        let fog = state.fog_color();
        c.fog_color = [unorm8(fog >> 16), unorm8(fog >> 8), unorm8(fog), 1.0];
        let [a, b_mag, b_shift, c_param] = state.fog_params();
        let b = (b_mag & 0xFF_FFFF) as f32 / (1u32 << 23) as f32 / (1u64 << (b_shift & 0x1F)) as f32;
        c.fog_params = [fog_float(a), b, fog_float(c_param), 0.0];

        if let Some(alpha) = state.dst_alpha() {
            c.dst_alpha = [0.0, 0.0, 0.0, unorm8(alpha)];
        }
        c
    }
}

impl VertexConstants {
    pub fn from_state(state: &GxState) -> Self {
        let mut c = Self::zeroed();
        let word = |addr: usize| f32::from_bits(state.xf_mem(addr));

        for row in 0..3 {
            for col in 0..4 {
                c.posnormal[row][col] = word(row * 4 + col);
            }
            for col in 0..3 {
                c.posnormal[row + 3][col] = word(XF_NORMAL_MATRIX_BASE + row * 3 + col);
            }
        }

        let p: Vec<f32> = (0..6)
            .map(|i| f32::from_bits(state.xf(XF_PROJECTION_BASE + i)))
            .collect();
        let orthographic = state.xf(XF_PROJECTION_BASE + 6) != 0;
        c.projection = if orthographic {
            [
                [p[0], 0.0, 0.0, p[1]],
                [0.0, p[2], 0.0, p[3]],
                [0.0, 0.0, p[4], p[5]],
                [0.0, 0.0, 0.0, 1.0],
            ]
        } else {
            [
                [p[0], 0.0, p[1], 0.0],
                [0.0, p[2], p[3], 0.0],
                [0.0, 0.0, p[4], p[5]],
                [0.0, 0.0, -1.0, 0.0],
            ]
        };

        for i in 0..2 {
            c.materials[i] = rgba8(state.xf(XF_AMBIENT0 + i as u16));
            c.materials[i + 2] = rgba8(state.xf(XF_MATERIAL0 + i as u16));
        }
        c
    }
}

/// Builds a constant buffer from state and uploads it when it changes
pub struct ConstantManager<C> {
    stage: ShaderStage,
    dirty_flag: DirtyFlags,
    build: fn(&GxState) -> C,
    constants: C,
    /// Bytes differ from what the backend last received
    needs_upload: bool,
    uploads: u64,
    ready: bool,
}

pub type PixelConstantManager = ConstantManager<PixelConstants>;
pub type VertexConstantManager = ConstantManager<VertexConstants>;

impl PixelConstantManager {
    pub fn new() -> Self {
        ConstantManager::with_builder(ShaderStage::PIXEL, DirtyFlags::PIXEL_CONSTANTS, PixelConstants::from_state)
    }
}

impl Default for PixelConstantManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VertexConstantManager {
    pub fn new() -> Self {
        ConstantManager::with_builder(ShaderStage::VERTEX, DirtyFlags::VERTEX_CONSTANTS, VertexConstants::from_state)
    }
}

impl Default for VertexConstantManager {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Pod + PartialEq> ConstantManager<C> {
    fn with_builder(stage: ShaderStage, dirty_flag: DirtyFlags, build: fn(&GxState) -> C) -> Self {
        Self {
            stage,
            dirty_flag,
            build,
            constants: C::zeroed(),
            needs_upload: true,
            uploads: 0,
            ready: false,
        }
    }

    pub fn init(&mut self) {
        self.constants = C::zeroed();
        self.needs_upload = true;
        self.ready = true;
    }

    pub fn shutdown(&mut self) {
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Rebuild from `state` if it is marked dirty. Clears the dirty flag.
    pub fn update(&mut self, state: &mut GxState) {
        if !state.dirty().intersects(self.dirty_flag) {
            return;
        }
        state.clear_dirty(self.dirty_flag);
        let constants = (self.build)(state);
        if constants != self.constants {
            self.constants = constants;
            self.needs_upload = true;
        }
    }

    /// Upload to the backend if the buffer changed since the last upload
    pub fn upload<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> bool {
        if !self.ready || !self.needs_upload {
            return false;
        }
        backend.upload_constants(self.stage, bytemuck::bytes_of(&self.constants));
        self.needs_upload = false;
        self.uploads += 1;
        true
    }

    /// Force the next upload, e.g. after the context was recreated
    pub fn invalidate(&mut self) {
        self.needs_upload = true;
    }

    pub fn constants(&self) -> &C {
        &self.constants
    }

    /// Raw bytes as they are uploaded
    pub fn constant_buffer(&self) -> &[u8] {
        bytemuck::bytes_of(&self.constants)
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads
    }
}
