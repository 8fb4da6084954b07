//! Program signatures
//!
//! A signature is the part of the GX state that changes generated program
//! text, packed into a plain-old-data struct. Fields that cannot affect the
//! program (stages past the active count, texture fields of stages that do
//! not sample) are zeroed when the signature is built, so two signatures are
//! equal exactly when their programs are byte-identical. Being `Pod`, a
//! signature is persisted by its raw bytes.

use crate::backend::ShaderStage;
use crate::shader_gen;
use crate::state::{GxState, MAX_TEV_STAGES, MAX_TEXGENS};
use crate::utility::{PixelUtility, UtilityKind, VertexUtility};
use crate::vertex_loader::VertexComponents;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;
use std::hash::Hash;

/// A cache key for one program stage
pub trait ProgramKey: Pod + Ord + Hash + Debug + Send + 'static {
    /// Fixed programs living beside the keyed ones
    type Utility: UtilityKind;

    const STAGE: ShaderStage;

    /// Name of the persisted store file for this stage
    const STORE_TAG: &'static str;

    /// Generate program source. Equal keys yield identical text.
    fn generate_source(&self) -> String;
}

bitflags! {
    /// Boolean pixel pipeline features folded into the signature
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PixelFlags: u32 {
        const MULTISAMPLE = 1 << 0;
        const DST_ALPHA = 1 << 1;
        const PER_PIXEL_DEPTH = 1 << 2;
        const EARLY_Z = 1 << 3;
        const ALPHA_TEST = 1 << 4;
        const FOG_ORTHO = 1 << 5;
    }
}

/// Signature fields of one TEV stage
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct TevStageKey {
    pub color_env: u32,
    pub alpha_env: u32,
    /// Texture map, coordinate, enable and color channel (12 bits)
    pub order: u32,
    /// Konstant color and alpha selectors (10 bits)
    pub konst: u32,
}

/// Pixel program signature
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct PixelSignature {
    /// `stages | texgens << 8 | color chans << 12 | indirect stages << 16`
    pub components: u32,
    pub flags: u32,
    /// `comp0 | comp1 << 3 | logic << 6`, zero when the test always passes
    pub alpha_test: u32,
    /// Fog function select, zero when fog is off
    pub fog: u32,
    /// `type | op << 2`, zero when Z textures are off
    pub ztex: u32,
    pub stages: [TevStageKey; MAX_TEV_STAGES],
}

impl PixelSignature {
    /// Build the signature of the current pixel pipeline
    pub fn from_state(state: &GxState, multisample: bool) -> Self {
        let gen = state.gen_mode();
        let num_stages = gen.num_tev_stages as usize;

        let mut sig = Self::zeroed();
        sig.components = gen.num_tev_stages
            | (gen.num_texgens << 8)
            | (gen.num_color_chans << 12)
            | (gen.num_ind_stages << 16);

        let mut flags = PixelFlags::empty();
        if multisample {
            flags |= PixelFlags::MULTISAMPLE;
        }
        if state.dst_alpha().is_some() {
            flags |= PixelFlags::DST_ALPHA;
        }
        if state.early_z() {
            flags |= PixelFlags::EARLY_Z;
        }

        let alpha = state.alpha_test();
        if !alpha.always_passes() {
            flags |= PixelFlags::ALPHA_TEST;
            sig.alpha_test = alpha.comp0 as u32 | ((alpha.comp1 as u32) << 3) | (alpha.logic << 6);
        }

        sig.fog = state.fog_select();
        if sig.fog != 0 && state.fog_orthographic() {
            flags |= PixelFlags::FOG_ORTHO;
        }

        let (ztex_type, ztex_op) = state.ztex();
        if ztex_op != 0 {
            sig.ztex = ztex_type | (ztex_op << 2);
            flags |= PixelFlags::PER_PIXEL_DEPTH;
        }
        sig.flags = flags.bits();

        for (i, stage) in sig.stages.iter_mut().enumerate().take(num_stages) {
            let order = state.tev_order(i);
            let mut order_bits = state.tev_order_bits(i);
            if !order.tex_enable {
                // Texture map and coordinate are unused without sampling
                order_bits &= !0x3F;
            }
            stage.color_env = state.tev_color_env(i);
            stage.alpha_env = state.tev_alpha_env(i);
            stage.order = order_bits;
            stage.konst = state.tev_konst_sel(i);
        }

        sig
    }

    pub fn num_stages(&self) -> usize {
        (self.components & 0xFF) as usize
    }

    pub fn num_texgens(&self) -> u32 {
        (self.components >> 8) & 0xF
    }

    pub fn num_color_chans(&self) -> u32 {
        (self.components >> 12) & 0x7
    }

    pub fn num_ind_stages(&self) -> u32 {
        (self.components >> 16) & 0x7
    }

    pub fn pixel_flags(&self) -> PixelFlags {
        PixelFlags::from_bits_truncate(self.flags)
    }
}

impl ProgramKey for PixelSignature {
    type Utility = PixelUtility;
    const STAGE: ShaderStage = ShaderStage::PIXEL;
    const STORE_TAG: &'static str = "pixel";

    fn generate_source(&self) -> String {
        shader_gen::generate_pixel_program(self)
    }
}

/// Vertex program signature
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct VertexSignature {
    /// Attribute presence bits, see [`VertexComponents`]
    pub components: u32,
    pub num_texgens: u32,
    pub num_color_chans: u32,
    /// Texgen configuration (XF tex matrix info), zero past `num_texgens`
    pub texgens: [u32; MAX_TEXGENS],
    /// Color0, color1, alpha0, alpha1 channel control, zero past `num_color_chans`
    pub chan_ctrl: [u32; 4],
}

/// Bits of the tex matrix info register that change the generated program
const TEXMTX_INFO_MASK: u32 = 0x0003_FFFE;
/// Bits of a channel control register that change the generated program
const CHAN_CTRL_MASK: u32 = 0x0000_7FFF;

impl VertexSignature {
    pub fn from_state(state: &GxState) -> Self {
        let (vcd_lo, vcd_hi) = state.vcd();
        let mut sig = Self::zeroed();
        sig.components = VertexComponents::from_vcd(vcd_lo, vcd_hi).bits();
        sig.num_texgens = state.num_xf_texgens().min(MAX_TEXGENS as u32);
        sig.num_color_chans = state.num_xf_colors().min(2);

        for i in 0..sig.num_texgens as usize {
            sig.texgens[i] = state.xf_texmtx_info(i) & TEXMTX_INFO_MASK;
        }
        for chan in 0..sig.num_color_chans as usize {
            // Color and alpha control of the same channel
            sig.chan_ctrl[chan] = state.xf_chan_ctrl(chan) & CHAN_CTRL_MASK;
            sig.chan_ctrl[chan + 2] = state.xf_chan_ctrl(chan + 2) & CHAN_CTRL_MASK;
        }

        sig
    }

    pub fn vertex_components(&self) -> VertexComponents {
        VertexComponents::from_bits_truncate(self.components)
    }
}

impl ProgramKey for VertexSignature {
    type Utility = VertexUtility;
    const STAGE: ShaderStage = ShaderStage::VERTEX;
    const STORE_TAG: &'static str = "vertex";

    fn generate_source(&self) -> String {
        shader_gen::generate_vertex_program(self)
    }
}
