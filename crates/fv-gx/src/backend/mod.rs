//! GX rendering backends

pub mod null;

use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;

bitflags! {
    /// Shader stage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStage: u8 {
        const VERTEX = 0x01;
        const PIXEL = 0x02;
    }
}

/// Primitive topology types, numbered like the GX draw opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    Quads = 0,
    Triangles = 2,
    TriangleStrip = 3,
    TriangleFan = 4,
    Lines = 5,
    LineStrip = 6,
    Points = 7,
}

impl PrimitiveType {
    /// Decode the primitive field of a draw opcode (bits 3-5)
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match (opcode >> 3) & 0x7 {
            0 => Some(Self::Quads),
            2 => Some(Self::Triangles),
            3 => Some(Self::TriangleStrip),
            4 => Some(Self::TriangleFan),
            5 => Some(Self::Lines),
            6 => Some(Self::LineStrip),
            7 => Some(Self::Points),
            _ => None,
        }
    }
}

/// Native program object, as numbered by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u32);

/// Programs dropped by their owners, waiting to be released on the context thread
pub type RetireQueue = Arc<Mutex<Vec<ProgramId>>>;

/// A native program owned by exactly one cache slot.
///
/// Dropping it hands the id back to the backend's retire queue; the backend
/// releases retired programs on its own thread in `release_retired`.
#[derive(Debug)]
pub struct OwnedProgram {
    id: ProgramId,
    retire: RetireQueue,
}

impl OwnedProgram {
    pub fn new(id: ProgramId, retire: RetireQueue) -> Self {
        Self { id, retire }
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }
}

impl Drop for OwnedProgram {
    fn drop(&mut self) {
        self.retire.lock().push(self.id);
    }
}

/// Framebuffer contents handed out for screenshots, RGBA8 rows top to bottom
#[derive(Debug, Clone)]
pub struct FramebufferData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl FramebufferData {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width * height * 4) as usize],
        }
    }
}

/// Graphics backend trait.
///
/// A backend is bound to the thread that called `init` (the thread that made
/// the context current). Every other method must be called from that thread.
pub trait GraphicsBackend {
    /// Create the context, make it current on the calling thread and check
    /// required capabilities
    fn init(&mut self) -> Result<(), String>;

    /// Shutdown the backend
    fn shutdown(&mut self);

    /// Identifies the driver and feature level; compiled bytecode is only
    /// reusable under the same fingerprint
    fn driver_fingerprint(&self) -> String;

    /// Begin a frame
    fn begin_frame(&mut self);

    /// End a frame and present
    fn end_frame(&mut self);

    /// Clear the render target. `color` is 0xAARRGGBB, `depth` is 24-bit
    fn clear(&mut self, color: u32, depth: u32);

    /// Draw with the currently bound programs
    fn draw(&mut self, primitive: PrimitiveType, vertex_count: u32);

    /// Compile program source to backend bytecode
    fn compile_program(&mut self, stage: ShaderStage, source: &str) -> Result<Vec<u8>, String>;

    /// Create a native program from bytecode
    fn create_program(&mut self, stage: ShaderStage, bytecode: &[u8]) -> Result<ProgramId, String>;

    /// Bind a program for subsequent draws
    fn bind_program(&mut self, stage: ShaderStage, program: ProgramId);

    /// Upload a constant buffer for a stage
    fn upload_constants(&mut self, stage: ShaderStage, data: &[u8]);

    /// Queue that owned programs retire into when dropped
    fn retire_queue(&self) -> RetireQueue;

    /// Release every retired program. Returns how many were released
    fn release_retired(&mut self) -> usize;

    /// Change the sample count of the EFB render target
    fn set_multisample(&mut self, samples: u32);

    /// Size of the EFB render target in native pixels
    fn target_size(&self) -> (u32, u32);

    /// Native pixels per emulated EFB pixel, horizontally and vertically
    fn target_scale(&self) -> (f32, f32);

    /// Resolve a multisampled depth target and bind the result for reading
    fn resolve_depth_target(&mut self);

    /// Rebind the EFB render target after a resolve
    fn restore_render_target(&mut self);

    /// Read the native 32-bit depth value at native coordinates (row 0 at the bottom)
    fn read_depth(&mut self, x: u32, y: u32) -> u32;

    /// Write a native 32-bit depth value
    fn write_depth(&mut self, x: u32, y: u32, depth: u32);

    /// Read a native color as 0xAARRGGBB
    fn read_color(&mut self, x: u32, y: u32) -> u32;

    /// Write a native color given as 0xAARRGGBB
    fn write_color(&mut self, x: u32, y: u32, argb: u32);

    /// Whether the native context has been lost
    fn is_device_lost(&self) -> bool;

    /// Recreate a lost context. Every native program is gone afterwards
    fn recreate(&mut self) -> Result<(), String>;

    /// Get the current framebuffer contents
    fn get_framebuffer(&self) -> Option<FramebufferData>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_program_retires_on_drop() {
        let queue: RetireQueue = Arc::new(Mutex::new(Vec::new()));
        let program = OwnedProgram::new(ProgramId(7), Arc::clone(&queue));
        assert_eq!(program.id(), ProgramId(7));
        assert!(queue.lock().is_empty());

        drop(program);
        assert_eq!(queue.lock().as_slice(), &[ProgramId(7)]);
    }

    #[test]
    fn test_primitive_from_opcode() {
        assert_eq!(PrimitiveType::from_opcode(0x80), Some(PrimitiveType::Quads));
        assert_eq!(PrimitiveType::from_opcode(0x90), Some(PrimitiveType::Triangles));
        assert_eq!(PrimitiveType::from_opcode(0x98), Some(PrimitiveType::TriangleStrip));
        assert_eq!(PrimitiveType::from_opcode(0xB8), Some(PrimitiveType::Points));
        assert_eq!(PrimitiveType::from_opcode(0x88), None);
    }
}
