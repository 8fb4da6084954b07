//! GX pipeline state
//!
//! Mirrors of the three register files the command stream writes: BP (pixel
//! pipeline), CP (vertex descriptors and attribute tables) and XF (transform
//! unit). Field accessors decode only what program generation and the EFB
//! paths need.

use bitflags::bitflags;

// BP registers
pub const BP_GEN_MODE: u8 = 0x00;
pub const BP_TEV_ORDER_BASE: u8 = 0x28;
pub const BP_PE_ZMODE: u8 = 0x40;
pub const BP_PE_CMODE1: u8 = 0x42;
pub const BP_PE_CONTROL: u8 = 0x43;
pub const BP_EFB_TOP_LEFT: u8 = 0x49;
pub const BP_EFB_WIDTH_HEIGHT: u8 = 0x4A;
pub const BP_EFB_COPY_DEST: u8 = 0x4B;
pub const BP_CLEAR_AR: u8 = 0x4F;
pub const BP_CLEAR_GB: u8 = 0x50;
pub const BP_CLEAR_Z: u8 = 0x51;
pub const BP_COPY_EXECUTE: u8 = 0x52;
pub const BP_TEV_COLOR_ENV_BASE: u8 = 0xC0;
pub const BP_TEV_REGISTER_BASE: u8 = 0xE0;
pub const BP_FOG_PARAM3: u8 = 0xF1;
pub const BP_FOG_COLOR: u8 = 0xF2;
pub const BP_ALPHA_COMPARE: u8 = 0xF3;
pub const BP_ZTEX2: u8 = 0xF5;
pub const BP_TEV_KSEL_BASE: u8 = 0xF6;

// CP registers
pub const CP_VCD_LO: u8 = 0x50;
pub const CP_VCD_HI: u8 = 0x60;
pub const CP_VAT_A_BASE: u8 = 0x70;
pub const CP_VAT_B_BASE: u8 = 0x80;
pub const CP_VAT_C_BASE: u8 = 0x90;

// XF registers
pub const XF_REG_BASE: u16 = 0x1000;
pub const XF_NUM_COLORS: u16 = 0x1009;
pub const XF_COLOR0_CTRL: u16 = 0x100E;
pub const XF_NUM_TEXGENS: u16 = 0x103F;
pub const XF_TEXMTX_INFO_BASE: u16 = 0x1040;
pub const XF_REG_COUNT: usize = 0x58;
pub const XF_AMBIENT0: u16 = 0x100A;
pub const XF_MATERIAL0: u16 = 0x100C;
pub const XF_PROJECTION_BASE: u16 = 0x1020;
/// Matrix memory words mirrored (position, texture and normal matrices)
pub const XF_MEM_SIZE: usize = 0x600;
pub const XF_NORMAL_MATRIX_BASE: usize = 0x400;

/// Number of TEV stages the hardware has
pub const MAX_TEV_STAGES: usize = 16;
/// Number of texture coordinate generators
pub const MAX_TEXGENS: usize = 8;
/// Number of vertex attribute format tables
pub const MAX_VAT: usize = 8;

bitflags! {
    /// Which derived state needs to be recomputed
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags: u32 {
        const PIXEL_PROGRAM = 1 << 0;
        const VERTEX_PROGRAM = 1 << 1;
        const PIXEL_CONSTANTS = 1 << 2;
        const VERTEX_CONSTANTS = 1 << 3;
        const VERTEX_FORMAT = 1 << 4;
        const MULTISAMPLE = 1 << 5;
    }
}

/// Decoded GEN_MODE register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenMode {
    pub num_texgens: u32,
    pub num_color_chans: u32,
    pub multisampling: bool,
    pub num_tev_stages: u32,
    pub num_ind_stages: u32,
}

/// Decoded TEV order for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TevOrder {
    pub tex_map: u32,
    pub tex_coord: u32,
    pub tex_enable: bool,
    pub color_chan: u32,
}

/// Alpha test comparison functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareMode {
    Never = 0,
    Less = 1,
    Equal = 2,
    LEqual = 3,
    Greater = 4,
    NEqual = 5,
    GEqual = 6,
    Always = 7,
}

impl CompareMode {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => Self::Never,
            1 => Self::Less,
            2 => Self::Equal,
            3 => Self::LEqual,
            4 => Self::Greater,
            5 => Self::NEqual,
            6 => Self::GEqual,
            _ => Self::Always,
        }
    }

    pub fn glsl_operator(self) -> &'static str {
        match self {
            Self::Never => "false",
            Self::Less => "<",
            Self::Equal => "==",
            Self::LEqual => "<=",
            Self::Greater => ">",
            Self::NEqual => "!=",
            Self::GEqual => ">=",
            Self::Always => "true",
        }
    }
}

/// Decoded ALPHA_COMPARE register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlphaTest {
    pub ref0: u32,
    pub ref1: u32,
    pub comp0: CompareMode,
    pub comp1: CompareMode,
    /// 0 and, 1 or, 2 xor, 3 xnor
    pub logic: u32,
}

impl AlphaTest {
    /// Whether every fragment passes regardless of alpha
    pub fn always_passes(&self) -> bool {
        let c0 = self.comp0 == CompareMode::Always;
        let c1 = self.comp1 == CompareMode::Always;
        match self.logic {
            0 => c0 && c1,
            1 => c0 || c1,
            _ => false,
        }
    }
}

/// An EFB copy as configured by the BP copy registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EfbCopy {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub dest_addr: u32,
    /// Texture format field of the copy execute register
    pub format: u32,
    pub clear: bool,
    pub to_xfb: bool,
}

/// GX register state
#[derive(Debug, Clone)]
pub struct GxState {
    bp: [u32; 256],
    cp_vcd_lo: u32,
    cp_vcd_hi: u32,
    cp_vat: [[u32; 3]; MAX_VAT],
    xf: [u32; XF_REG_COUNT],
    xf_mem: Box<[u32; XF_MEM_SIZE]>,
    /// Konstant color registers, written through the TEV register addresses with bit 23 set
    tev_konst: [u32; 8],
    dirty: DirtyFlags,
}

impl GxState {
    pub fn new() -> Self {
        let mut state = Self {
            bp: [0; 256],
            cp_vcd_lo: 0,
            cp_vcd_hi: 0,
            cp_vat: [[0; 3]; MAX_VAT],
            xf: [0; XF_REG_COUNT],
            xf_mem: Box::new([0; XF_MEM_SIZE]),
            tev_konst: [0; 8],
            dirty: DirtyFlags::all(),
        };
        state.reset();
        state
    }

    /// Return every register to its power-on value
    pub fn reset(&mut self) {
        self.bp = [0; 256];
        self.cp_vcd_lo = 0;
        self.cp_vcd_hi = 0;
        self.cp_vat = [[0; 3]; MAX_VAT];
        self.xf = [0; XF_REG_COUNT];
        self.xf_mem.fill(0);
        self.tev_konst = [0; 8];
        // Alpha test that always passes
        self.bp[BP_ALPHA_COMPARE as usize] = (7 << 16) | (7 << 19);
        // One color channel, one stage
        self.bp[BP_GEN_MODE as usize] = 1 << 4;
        self.xf[(XF_NUM_COLORS - XF_REG_BASE) as usize] = 1;
        self.dirty = DirtyFlags::all();
    }

    /// Write a BP register. Only the low 24 bits carry data.
    pub fn write_bp(&mut self, reg: u8, value: u32) {
        let value = value & 0x00FF_FFFF;
        if (BP_TEV_REGISTER_BASE..=0xE7).contains(&reg) && (value >> 23) & 1 != 0 {
            self.tev_konst[(reg - BP_TEV_REGISTER_BASE) as usize] = value;
            self.dirty |= DirtyFlags::PIXEL_CONSTANTS;
            return;
        }
        let old = std::mem::replace(&mut self.bp[reg as usize], value);
        if old == value {
            return;
        }

        match reg {
            BP_GEN_MODE | BP_TEV_ORDER_BASE..=0x2F | BP_PE_CMODE1 | BP_PE_CONTROL | BP_ZTEX2
            | BP_TEV_COLOR_ENV_BASE..=0xDF | BP_TEV_KSEL_BASE..=0xFD => {
                self.dirty |= DirtyFlags::PIXEL_PROGRAM;
                if reg == BP_GEN_MODE {
                    self.dirty |= DirtyFlags::VERTEX_PROGRAM | DirtyFlags::MULTISAMPLE;
                }
            }
            BP_ALPHA_COMPARE | BP_FOG_PARAM3 => {
                self.dirty |= DirtyFlags::PIXEL_PROGRAM | DirtyFlags::PIXEL_CONSTANTS;
            }
            BP_TEV_REGISTER_BASE..=0xE7 | BP_FOG_COLOR | 0xEE..=0xF0 => {
                self.dirty |= DirtyFlags::PIXEL_CONSTANTS;
            }
            _ => {}
        }
    }

    pub fn bp(&self, reg: u8) -> u32 {
        self.bp[reg as usize]
    }

    /// Write a CP register. Unknown registers are ignored.
    pub fn write_cp(&mut self, reg: u8, value: u32) {
        match reg {
            CP_VCD_LO..=0x57 => self.cp_vcd_lo = value,
            CP_VCD_HI..=0x67 => self.cp_vcd_hi = value,
            CP_VAT_A_BASE..=0x77 => self.cp_vat[(reg - CP_VAT_A_BASE) as usize][0] = value,
            CP_VAT_B_BASE..=0x87 => self.cp_vat[(reg - CP_VAT_B_BASE) as usize][1] = value,
            CP_VAT_C_BASE..=0x97 => self.cp_vat[(reg - CP_VAT_C_BASE) as usize][2] = value,
            _ => {
                tracing::trace!("Ignoring CP register 0x{:02X} = 0x{:08X}", reg, value);
                return;
            }
        }
        self.dirty |= DirtyFlags::VERTEX_FORMAT | DirtyFlags::VERTEX_PROGRAM;
    }

    pub fn vcd(&self) -> (u32, u32) {
        (self.cp_vcd_lo, self.cp_vcd_hi)
    }

    pub fn vat(&self, index: usize) -> [u32; 3] {
        self.cp_vat[index % MAX_VAT]
    }

    /// Write consecutive XF registers starting at `addr`.
    ///
    /// Writes outside the register block (matrix memory) only dirty the
    /// vertex constants.
    pub fn write_xf(&mut self, addr: u16, values: &[u32]) {
        for (i, &value) in values.iter().enumerate() {
            let reg = addr.wrapping_add(i as u16);
            if (reg as usize) < XF_MEM_SIZE {
                self.xf_mem[reg as usize] = value;
                self.dirty |= DirtyFlags::VERTEX_CONSTANTS;
                continue;
            }
            if reg < XF_REG_BASE || reg as usize >= XF_REG_BASE as usize + XF_REG_COUNT {
                tracing::trace!("Ignoring XF write 0x{:04X} = 0x{:08X}", reg, value);
                continue;
            }
            let slot = &mut self.xf[(reg - XF_REG_BASE) as usize];
            if *slot != value {
                *slot = value;
                self.dirty |= DirtyFlags::VERTEX_PROGRAM | DirtyFlags::VERTEX_CONSTANTS;
            }
        }
    }

    /// Word of XF matrix memory
    pub fn xf_mem(&self, addr: usize) -> u32 {
        self.xf_mem.get(addr).copied().unwrap_or(0)
    }

    pub fn xf(&self, reg: u16) -> u32 {
        reg.checked_sub(XF_REG_BASE)
            .and_then(|i| self.xf.get(i as usize).copied())
            .unwrap_or(0)
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    pub fn clear_dirty(&mut self, flags: DirtyFlags) {
        self.dirty.remove(flags);
    }

    pub fn gen_mode(&self) -> GenMode {
        let v = self.bp(BP_GEN_MODE);
        GenMode {
            num_texgens: v & 0xF,
            num_color_chans: (v >> 4) & 0x7,
            multisampling: (v >> 9) & 1 != 0,
            num_tev_stages: ((v >> 10) & 0xF) + 1,
            num_ind_stages: (v >> 16) & 0x7,
        }
    }

    pub fn tev_color_env(&self, stage: usize) -> u32 {
        self.bp(BP_TEV_COLOR_ENV_BASE + 2 * stage as u8)
    }

    pub fn tev_alpha_env(&self, stage: usize) -> u32 {
        self.bp(BP_TEV_COLOR_ENV_BASE + 2 * stage as u8 + 1)
    }

    /// Raw 12-bit order field; two stages share one register
    pub fn tev_order_bits(&self, stage: usize) -> u32 {
        let reg = self.bp(BP_TEV_ORDER_BASE + (stage / 2) as u8);
        if stage % 2 == 0 {
            reg & 0xFFF
        } else {
            (reg >> 12) & 0xFFF
        }
    }

    pub fn tev_order(&self, stage: usize) -> TevOrder {
        let bits = self.tev_order_bits(stage);
        TevOrder {
            tex_map: bits & 0x7,
            tex_coord: (bits >> 3) & 0x7,
            tex_enable: (bits >> 6) & 1 != 0,
            color_chan: (bits >> 7) & 0x7,
        }
    }

    /// Constant color and alpha selectors for a stage, packed `kcsel | kasel << 5`
    pub fn tev_konst_sel(&self, stage: usize) -> u32 {
        let reg = self.bp(BP_TEV_KSEL_BASE + (stage / 2) as u8);
        let shift = if stage % 2 == 0 { 4 } else { 14 };
        (reg >> shift) & 0x3FF
    }

    pub fn alpha_test(&self) -> AlphaTest {
        let v = self.bp(BP_ALPHA_COMPARE);
        AlphaTest {
            ref0: v & 0xFF,
            ref1: (v >> 8) & 0xFF,
            comp0: CompareMode::from_bits(v >> 16),
            comp1: CompareMode::from_bits(v >> 19),
            logic: (v >> 22) & 0x3,
        }
    }

    /// Fog function select, 0 when fog is off
    pub fn fog_select(&self) -> u32 {
        (self.bp(BP_FOG_PARAM3) >> 21) & 0x7
    }

    pub fn fog_orthographic(&self) -> bool {
        (self.bp(BP_FOG_PARAM3) >> 20) & 1 != 0
    }

    /// Z texture (type, op); op 0 disables it
    pub fn ztex(&self) -> (u32, u32) {
        let v = self.bp(BP_ZTEX2);
        (v & 0x3, (v >> 2) & 0x3)
    }

    /// Destination alpha override, if enabled
    pub fn dst_alpha(&self) -> Option<u32> {
        let v = self.bp(BP_PE_CMODE1);
        if (v >> 8) & 1 != 0 {
            Some(v & 0xFF)
        } else {
            None
        }
    }

    /// Whether depth testing happens before texturing
    pub fn early_z(&self) -> bool {
        (self.bp(BP_PE_CONTROL) >> 6) & 1 != 0
    }

    /// Clear color as 0xAARRGGBB
    pub fn clear_color(&self) -> u32 {
        let ar = self.bp(BP_CLEAR_AR);
        let gb = self.bp(BP_CLEAR_GB);
        ((ar & 0xFF00) << 16) | ((ar & 0xFF) << 16) | ((gb & 0xFF00) | (gb & 0xFF))
    }

    /// 24-bit clear depth
    pub fn clear_depth(&self) -> u32 {
        self.bp(BP_CLEAR_Z) & 0x00FF_FFFF
    }

    /// Decode the copy registers as of a copy execute write
    pub fn efb_copy(&self) -> EfbCopy {
        let top_left = self.bp(BP_EFB_TOP_LEFT);
        let size = self.bp(BP_EFB_WIDTH_HEIGHT);
        let exec = self.bp(BP_COPY_EXECUTE);
        EfbCopy {
            x: top_left & 0x3FF,
            y: (top_left >> 10) & 0x3FF,
            width: (size & 0x3FF) + 1,
            height: ((size >> 10) & 0x3FF) + 1,
            dest_addr: (self.bp(BP_EFB_COPY_DEST) & 0x00FF_FFFF) << 5,
            format: ((exec >> 4) & 0x7) | (((exec >> 3) & 1) << 3),
            clear: (exec >> 11) & 1 != 0,
            to_xfb: (exec >> 14) & 1 != 0,
        }
    }

    /// Color register pair (RA, BG) for TEV register `index` (0-3)
    pub fn tev_register(&self, index: usize) -> (u32, u32) {
        let base = BP_TEV_REGISTER_BASE + 2 * index as u8;
        (self.bp(base), self.bp(base + 1))
    }

    /// Konstant register pair (RA, BG) for `index` (0-3)
    pub fn tev_konst_register(&self, index: usize) -> (u32, u32) {
        (self.tev_konst[2 * index], self.tev_konst[2 * index + 1])
    }

    /// Raw fog parameters A, B magnitude, B shift and C
    pub fn fog_params(&self) -> [u32; 4] {
        [self.bp(0xEE), self.bp(0xEF), self.bp(0xF0), self.bp(BP_FOG_PARAM3)]
    }

    pub fn fog_color(&self) -> u32 {
        self.bp(BP_FOG_COLOR)
    }

    pub fn num_xf_colors(&self) -> u32 {
        self.xf(XF_NUM_COLORS) & 0x3
    }

    pub fn num_xf_texgens(&self) -> u32 {
        self.xf(XF_NUM_TEXGENS) & 0xF
    }

    pub fn xf_texmtx_info(&self, texgen: usize) -> u32 {
        self.xf(XF_TEXMTX_INFO_BASE + texgen as u16)
    }

    /// Channel control for color0, color1, alpha0, alpha1
    pub fn xf_chan_ctrl(&self, chan: usize) -> u32 {
        self.xf(XF_COLOR0_CTRL + chan as u16)
    }
}

impl Default for GxState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_state() {
        let state = GxState::new();
        let gen = state.gen_mode();
        assert_eq!(gen.num_tev_stages, 1);
        assert_eq!(gen.num_color_chans, 1);
        assert!(state.alpha_test().always_passes());
        assert!(state.dirty().contains(DirtyFlags::PIXEL_PROGRAM));
    }

    #[test]
    fn test_gen_mode_decode() {
        let mut state = GxState::new();
        state.write_bp(BP_GEN_MODE, 2 | (1 << 4) | (1 << 9) | (3 << 10) | (1 << 16));
        let gen = state.gen_mode();
        assert_eq!(gen.num_texgens, 2);
        assert_eq!(gen.num_color_chans, 1);
        assert!(gen.multisampling);
        assert_eq!(gen.num_tev_stages, 4);
        assert_eq!(gen.num_ind_stages, 1);
    }

    #[test]
    fn test_bp_write_masks_to_24_bits() {
        let mut state = GxState::new();
        state.write_bp(BP_FOG_COLOR, 0xFF12_3456);
        assert_eq!(state.fog_color(), 0x12_3456);
    }

    #[test]
    fn test_dirty_tracking() {
        let mut state = GxState::new();
        state.clear_dirty(DirtyFlags::all());

        state.write_bp(BP_TEV_REGISTER_BASE, 0x0FF);
        assert_eq!(state.dirty(), DirtyFlags::PIXEL_CONSTANTS);

        state.clear_dirty(DirtyFlags::all());
        state.write_bp(BP_TEV_COLOR_ENV_BASE + 2, 0x08F);
        assert!(state.dirty().contains(DirtyFlags::PIXEL_PROGRAM));

        // Rewriting the same value is not a change
        state.clear_dirty(DirtyFlags::all());
        state.write_bp(BP_TEV_COLOR_ENV_BASE + 2, 0x08F);
        assert!(state.dirty().is_empty());
    }

    #[test]
    fn test_tev_order_two_stages_per_register() {
        let mut state = GxState::new();
        let even = 1 | (2 << 3) | (1 << 6) | (4 << 7);
        let odd = 3 | (5 << 7);
        state.write_bp(BP_TEV_ORDER_BASE + 1, even | (odd << 12));

        let order2 = state.tev_order(2);
        assert_eq!(order2.tex_map, 1);
        assert_eq!(order2.tex_coord, 2);
        assert!(order2.tex_enable);
        assert_eq!(order2.color_chan, 4);

        let order3 = state.tev_order(3);
        assert_eq!(order3.tex_map, 3);
        assert!(!order3.tex_enable);
        assert_eq!(order3.color_chan, 5);
    }

    #[test]
    fn test_alpha_test_decode() {
        let mut state = GxState::new();
        state.write_bp(BP_ALPHA_COMPARE, 0x80 | (0x40 << 8) | (4 << 16) | (1 << 19) | (1 << 22));
        let test = state.alpha_test();
        assert_eq!(test.ref0, 0x80);
        assert_eq!(test.ref1, 0x40);
        assert_eq!(test.comp0, CompareMode::Greater);
        assert_eq!(test.comp1, CompareMode::Less);
        assert_eq!(test.logic, 1);
        assert!(!test.always_passes());
    }

    #[test]
    fn test_clear_values() {
        let mut state = GxState::new();
        state.write_bp(BP_CLEAR_AR, 0xFF20);
        state.write_bp(BP_CLEAR_GB, 0x4060);
        state.write_bp(BP_CLEAR_Z, 0xFF_FFFF);
        assert_eq!(state.clear_color(), 0xFF20_4060);
        assert_eq!(state.clear_depth(), 0xFF_FFFF);
    }

    #[test]
    fn test_efb_copy_decode() {
        let mut state = GxState::new();
        state.write_bp(BP_EFB_TOP_LEFT, 8 | (16 << 10));
        state.write_bp(BP_EFB_WIDTH_HEIGHT, 63 | (31 << 10));
        state.write_bp(BP_EFB_COPY_DEST, 0x0010_0000 >> 5);
        state.write_bp(BP_COPY_EXECUTE, (1 << 11) | (6 << 4));

        let copy = state.efb_copy();
        assert_eq!((copy.x, copy.y, copy.width, copy.height), (8, 16, 64, 32));
        assert_eq!(copy.dest_addr, 0x0010_0000);
        assert_eq!(copy.format, 6);
        assert!(copy.clear);
        assert!(!copy.to_xfb);
    }

    #[test]
    fn test_xf_writes() {
        let mut state = GxState::new();
        state.clear_dirty(DirtyFlags::all());
        state.write_xf(XF_NUM_TEXGENS, &[2]);
        assert_eq!(state.num_xf_texgens(), 2);
        assert!(state.dirty().contains(DirtyFlags::VERTEX_PROGRAM));

        // Matrix memory only touches constants
        state.clear_dirty(DirtyFlags::all());
        state.write_xf(0x0000, &[0x3F80_0000; 4]);
        assert_eq!(state.dirty(), DirtyFlags::VERTEX_CONSTANTS);
    }

    #[test]
    fn test_konst_registers_are_separate() {
        let mut state = GxState::new();
        state.write_bp(BP_TEV_REGISTER_BASE, 0x0FF);
        state.write_bp(BP_TEV_REGISTER_BASE, (1 << 23) | 0x080);
        assert_eq!(state.tev_register(0).0, 0x0FF);
        assert_eq!(state.tev_konst_register(0).0, (1 << 23) | 0x080);
    }

    #[test]
    fn test_cp_vat_writes() {
        let mut state = GxState::new();
        state.write_cp(CP_VAT_A_BASE + 3, 0x11);
        state.write_cp(CP_VAT_C_BASE + 3, 0x33);
        assert_eq!(state.vat(3), [0x11, 0, 0x33]);
        state.write_cp(CP_VCD_LO, 0x200);
        assert_eq!(state.vcd(), (0x200, 0));
    }
}
