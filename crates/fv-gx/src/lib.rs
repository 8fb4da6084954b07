//! GX pipeline emulation for flipper-video
//!
//! Translates GameCube GX register state into native programs, caches and
//! persists them, and services EFB peeks and pokes for the CPU thread.

pub mod backend;
pub mod constants;
pub mod decoder;
pub mod efb;
pub mod hot_entry;
pub mod osd;
pub mod postprocess;
pub mod program_cache;
pub mod shader_gen;
pub mod signature;
pub mod state;
pub mod store;
pub mod texture_converter;
pub mod thread;
pub mod timing;
pub mod utility;
pub mod vertex_loader;
pub mod video_core;

pub use backend::{null::NullBackend, GraphicsBackend};
pub use program_cache::{CacheOptions, CacheStats, ProgramCache};
pub use signature::{PixelSignature, ProgramKey, VertexSignature};
pub use state::GxState;
pub use thread::{RenderSummary, RenderThread};
pub use video_core::{Subsystem, VideoCore};
