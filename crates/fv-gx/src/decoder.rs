//! GX command-stream decoder
//!
//! The command processor FIFO carries a byte stream of opcodes followed by
//! big-endian operands. Register loads update state; draw opcodes carry their
//! vertices inline, so their length depends on the current vertex format.
//! A command split across two FIFO chunks is held back until the rest arrives.

use crate::backend::PrimitiveType;

// Opcodes
pub const GX_NOP: u8 = 0x00;
pub const GX_LOAD_CP_REG: u8 = 0x08;
pub const GX_LOAD_XF_REG: u8 = 0x10;
pub const GX_LOAD_INDX_A: u8 = 0x20;
pub const GX_LOAD_INDX_B: u8 = 0x28;
pub const GX_LOAD_INDX_C: u8 = 0x30;
pub const GX_LOAD_INDX_D: u8 = 0x38;
pub const GX_CALL_DL: u8 = 0x40;
pub const GX_INVALIDATE_VTX_CACHE: u8 = 0x48;
pub const GX_LOAD_BP_REG: u8 = 0x61;
pub const GX_DRAW_BASE: u8 = 0x80;

/// Receives decoded commands
pub trait CommandHandler {
    fn load_cp(&mut self, reg: u8, value: u32);

    fn load_xf(&mut self, addr: u16, values: &[u32]);

    fn load_bp(&mut self, reg: u8, value: u32);

    /// Byte stride of one vertex for draws using VAT slot `vat`
    fn vertex_stride(&mut self, vat: usize) -> u32;

    fn draw(&mut self, primitive: PrimitiveType, vat: usize, vertex_count: u32, vertices: &[u8]);

    fn invalidate_vertex_cache(&mut self) {}
}

/// Outcome of decoding one command
enum Step {
    /// Consumed this many bytes
    Done(usize),
    /// Need more bytes than are buffered
    Incomplete,
}

fn be_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn be_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Stateful command-stream decoder
#[derive(Debug, Default)]
pub struct OpcodeDecoder {
    /// Bytes of an incomplete trailing command
    pending: Vec<u8>,
    commands: u64,
    unknown: u64,
    ready: bool,
}

impl OpcodeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self) {
        self.pending.clear();
        self.ready = true;
    }

    pub fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("Dropping {} bytes of partial command at shutdown", self.pending.len());
        }
        self.pending.clear();
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Bytes held back waiting for the rest of a command
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of commands decoded since creation
    pub fn command_count(&self) -> u64 {
        self.commands
    }

    pub fn unknown_count(&self) -> u64 {
        self.unknown
    }

    /// Decode as many complete commands from `data` as possible.
    ///
    /// Returns the number of commands executed.
    pub fn run<H: CommandHandler + ?Sized>(&mut self, data: &[u8], handler: &mut H) -> usize {
        if !self.ready {
            return 0;
        }

        let mut buffer = std::mem::take(&mut self.pending);
        let input: &[u8] = if buffer.is_empty() {
            data
        } else {
            buffer.extend_from_slice(data);
            &buffer
        };

        let mut pos = 0;
        let mut executed = 0;
        while pos < input.len() {
            match self.step(&input[pos..], handler) {
                Step::Done(len) => {
                    pos += len;
                    executed += 1;
                }
                Step::Incomplete => break,
            }
        }

        self.pending = input[pos..].to_vec();
        self.commands += executed as u64;
        executed
    }

    fn step<H: CommandHandler + ?Sized>(&mut self, data: &[u8], handler: &mut H) -> Step {
        let opcode = data[0];
        match opcode {
            GX_NOP => Step::Done(1),
            GX_LOAD_CP_REG => {
                if data.len() < 6 {
                    return Step::Incomplete;
                }
                handler.load_cp(data[1], be_u32(&data[2..]));
                Step::Done(6)
            }
            GX_LOAD_XF_REG => {
                if data.len() < 5 {
                    return Step::Incomplete;
                }
                let header = be_u32(&data[1..]);
                let count = ((header >> 16) & 0xF) as usize + 1;
                let addr = (header & 0xFFFF) as u16;
                let len = 5 + count * 4;
                if data.len() < len {
                    return Step::Incomplete;
                }
                let values: Vec<u32> = data[5..len].chunks_exact(4).map(be_u32).collect();
                handler.load_xf(addr, &values);
                Step::Done(len)
            }
            GX_LOAD_INDX_A | GX_LOAD_INDX_B | GX_LOAD_INDX_C | GX_LOAD_INDX_D => {
                if data.len() < 5 {
                    return Step::Incomplete;
                }
                tracing::trace!("Indexed XF load 0x{:02X} ignored", opcode);
                Step::Done(5)
            }
            GX_CALL_DL => {
                if data.len() < 9 {
                    return Step::Incomplete;
                }
                tracing::warn!(
                    "Display list call at 0x{:08X} ({} bytes) skipped",
                    be_u32(&data[1..]),
                    be_u32(&data[5..])
                );
                Step::Done(9)
            }
            GX_INVALIDATE_VTX_CACHE => {
                handler.invalidate_vertex_cache();
                Step::Done(1)
            }
            GX_LOAD_BP_REG => {
                if data.len() < 5 {
                    return Step::Incomplete;
                }
                let word = be_u32(&data[1..]);
                handler.load_bp((word >> 24) as u8, word & 0x00FF_FFFF);
                Step::Done(5)
            }
            op if op >= GX_DRAW_BASE && op < 0xC0 => {
                if data.len() < 3 {
                    return Step::Incomplete;
                }
                let vat = (op & 0x7) as usize;
                let vertex_count = be_u16(&data[1..]) as u32;
                let stride = handler.vertex_stride(vat);
                let len = 3 + (vertex_count * stride) as usize;
                if data.len() < len {
                    return Step::Incomplete;
                }
                match PrimitiveType::from_opcode(op) {
                    Some(primitive) => handler.draw(primitive, vat, vertex_count, &data[3..len]),
                    None => tracing::warn!("Invalid primitive in draw opcode 0x{:02X}", op),
                }
                Step::Done(len)
            }
            op => {
                self.unknown += 1;
                tracing::warn!("Unknown GX opcode 0x{:02X}, skipping one byte", op);
                Step::Done(1)
            }
        }
    }
}

/// Little helpers for building command streams
pub mod encode {
    use super::*;

    pub fn load_bp(out: &mut Vec<u8>, reg: u8, value: u32) {
        out.push(GX_LOAD_BP_REG);
        out.extend_from_slice(&(((reg as u32) << 24) | (value & 0x00FF_FFFF)).to_be_bytes());
    }

    pub fn load_cp(out: &mut Vec<u8>, reg: u8, value: u32) {
        out.push(GX_LOAD_CP_REG);
        out.push(reg);
        out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn load_xf(out: &mut Vec<u8>, addr: u16, values: &[u32]) {
        debug_assert!(!values.is_empty() && values.len() <= 16);
        out.push(GX_LOAD_XF_REG);
        let header = (((values.len() as u32) - 1) << 16) | addr as u32;
        out.extend_from_slice(&header.to_be_bytes());
        for value in values {
            out.extend_from_slice(&value.to_be_bytes());
        }
    }

    /// Draw opcode header; the caller appends `count * stride` vertex bytes
    pub fn draw(out: &mut Vec<u8>, primitive: PrimitiveType, vat: u8, count: u16) {
        out.push(GX_DRAW_BASE | ((primitive as u8) << 3) | (vat & 0x7));
        out.extend_from_slice(&count.to_be_bytes());
    }
}
