//! Null backend: a software EFB with fake program compilation
//!
//! Keeps real color and depth storage so EFB peeks and pokes behave, and
//! "compiles" programs by wrapping their source in a small bytecode header.
//! Failure hooks (missing capability, compile errors, device loss) let tests
//! drive every error path of the video core.

use super::{
    FramebufferData, GraphicsBackend, PrimitiveType, ProgramId, RetireQueue, ShaderStage,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Native EFB dimensions at 1x
pub const EFB_WIDTH: u32 = 640;
pub const EFB_HEIGHT: u32 = 528;

/// Header of null-backend bytecode
const BYTECODE_MAGIC: &[u8; 8] = b"NULLBC01";

/// Native depth value a cleared buffer holds (far plane)
const DEPTH_FAR: u32 = 0xFFFF_FF00;

/// Null graphics backend
pub struct NullBackend {
    scale: u32,
    width: u32,
    height: u32,
    samples: u32,
    shader_model: u32,
    /// Thread that made the context current
    owner: Option<ThreadId>,
    color: Vec<u32>,
    depth: Vec<u32>,
    programs: HashMap<ProgramId, (ShaderStage, usize)>,
    next_program: u32,
    retire: RetireQueue,
    bound_pixel: Option<ProgramId>,
    bound_vertex: Option<ProgramId>,
    frame_count: u64,
    draw_calls_this_frame: u32,
    total_draw_calls: u64,
    compile_count: u64,
    resolve_count: u64,
    constant_uploads: u64,
    compile_failure_marker: Option<String>,
    missing_capability: Option<String>,
    fail_recreate: bool,
    device_lost: bool,
    /// Set from any thread; the next EFB read then loses the device
    loss_trigger: Option<Arc<AtomicBool>>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::with_scale(1)
    }

    /// Create a backend whose EFB is `scale` times the native resolution
    pub fn with_scale(scale: u32) -> Self {
        let scale = scale.max(1);
        let width = EFB_WIDTH * scale;
        let height = EFB_HEIGHT * scale;
        Self {
            scale,
            width,
            height,
            samples: 1,
            shader_model: 5,
            owner: None,
            color: vec![0xFF00_0000; (width * height) as usize],
            depth: vec![DEPTH_FAR; (width * height) as usize],
            programs: HashMap::new(),
            next_program: 1,
            retire: Arc::new(Mutex::new(Vec::new())),
            bound_pixel: None,
            bound_vertex: None,
            frame_count: 0,
            draw_calls_this_frame: 0,
            total_draw_calls: 0,
            compile_count: 0,
            resolve_count: 0,
            constant_uploads: 0,
            compile_failure_marker: None,
            missing_capability: None,
            fail_recreate: false,
            device_lost: false,
            loss_trigger: None,
        }
    }

    /// Share a flag that loses the device on the next EFB read after it is set.
    ///
    /// Lets a test break a backend that lives on another thread.
    pub fn with_loss_trigger(mut self, trigger: Arc<AtomicBool>) -> Self {
        self.loss_trigger = Some(trigger);
        self
    }

    fn fire_loss_trigger(&mut self) {
        if self
            .loss_trigger
            .as_ref()
            .is_some_and(|trigger| trigger.swap(false, Ordering::AcqRel))
        {
            self.lose_device();
        }
    }

    /// Make `init` fail as if the named feature were missing
    pub fn set_missing_capability(&mut self, capability: Option<&str>) {
        self.missing_capability = capability.map(str::to_string);
    }

    /// Fail compilation of any source containing `marker`
    pub fn set_compile_failure(&mut self, marker: Option<&str>) {
        self.compile_failure_marker = marker.map(str::to_string);
    }

    /// Change the reported shader model, which changes the driver fingerprint
    pub fn set_shader_model(&mut self, shader_model: u32) {
        self.shader_model = shader_model;
    }

    /// Simulate the native context going away
    pub fn lose_device(&mut self) {
        tracing::warn!("NullBackend: device lost");
        self.device_lost = true;
    }

    /// Make the next `recreate` calls fail
    pub fn set_fail_recreate(&mut self, fail: bool) {
        self.fail_recreate = fail;
    }

    /// Number of source compilations performed
    pub fn compile_count(&self) -> u64 {
        self.compile_count
    }

    /// Number of native programs alive
    pub fn live_program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn resolve_count(&self) -> u64 {
        self.resolve_count
    }

    pub fn total_draw_calls(&self) -> u64 {
        self.total_draw_calls
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn constant_uploads(&self) -> u64 {
        self.constant_uploads
    }

    pub fn bound_program(&self, stage: ShaderStage) -> Option<ProgramId> {
        if stage == ShaderStage::PIXEL {
            self.bound_pixel
        } else {
            self.bound_vertex
        }
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Whether the calling thread may issue graphics calls
    fn is_current(&self) -> bool {
        match self.owner {
            Some(owner) => owner == thread::current().id(),
            None => false,
        }
    }

    fn check_context(&self, call: &str) -> bool {
        if !self.is_current() {
            tracing::error!("NullBackend: {} called without a current context on this thread", call);
            return false;
        }
        !self.device_lost
    }

    fn index(&self, x: u32, y: u32) -> usize {
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);
        (y * self.width + x) as usize
    }

    fn reset_buffers(&mut self) {
        self.color.fill(0xFF00_0000);
        self.depth.fill(DEPTH_FAR);
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsBackend for NullBackend {
    fn init(&mut self) -> Result<(), String> {
        if let Some(capability) = &self.missing_capability {
            return Err(format!("required feature '{}' is not supported", capability));
        }
        self.owner = Some(thread::current().id());
        tracing::debug!("NullBackend: context current on {:?}", thread::current().id());
        Ok(())
    }

    fn shutdown(&mut self) {
        self.programs.clear();
        self.retire.lock().clear();
        self.bound_pixel = None;
        self.bound_vertex = None;
        self.owner = None;
    }

    fn driver_fingerprint(&self) -> String {
        format!("NullBackend 1.0 sm{}", self.shader_model)
    }

    fn begin_frame(&mut self) {
        self.draw_calls_this_frame = 0;
    }

    fn end_frame(&mut self) {
        self.frame_count += 1;
    }

    fn clear(&mut self, color: u32, depth: u32) {
        if !self.check_context("clear") {
            return;
        }
        self.color.fill(color);
        self.depth.fill((depth & 0x00FF_FFFF) << 8);
    }

    fn draw(&mut self, _primitive: PrimitiveType, _vertex_count: u32) {
        if !self.check_context("draw") {
            return;
        }
        self.draw_calls_this_frame += 1;
        self.total_draw_calls += 1;
    }

    fn compile_program(&mut self, stage: ShaderStage, source: &str) -> Result<Vec<u8>, String> {
        if !self.check_context("compile_program") {
            return Err("no usable context".to_string());
        }
        self.compile_count += 1;

        if let Some(marker) = &self.compile_failure_marker {
            if source.contains(marker.as_str()) {
                return Err(format!("{:?} program rejected by driver", stage));
            }
        }

        let mut bytecode = Vec::with_capacity(BYTECODE_MAGIC.len() + 1 + source.len());
        bytecode.extend_from_slice(BYTECODE_MAGIC);
        bytecode.push(stage.bits());
        bytecode.extend_from_slice(source.as_bytes());
        Ok(bytecode)
    }

    fn create_program(&mut self, stage: ShaderStage, bytecode: &[u8]) -> Result<ProgramId, String> {
        if !self.check_context("create_program") {
            return Err("no usable context".to_string());
        }
        if bytecode.len() <= BYTECODE_MAGIC.len() || &bytecode[..BYTECODE_MAGIC.len()] != BYTECODE_MAGIC {
            return Err("invalid bytecode".to_string());
        }
        if bytecode[BYTECODE_MAGIC.len()] != stage.bits() {
            return Err(format!("bytecode is not a {:?} program", stage));
        }

        let id = ProgramId(self.next_program);
        self.next_program += 1;
        self.programs.insert(id, (stage, bytecode.len()));
        Ok(id)
    }

    fn bind_program(&mut self, stage: ShaderStage, program: ProgramId) {
        if !self.check_context("bind_program") {
            return;
        }
        if !self.programs.contains_key(&program) {
            tracing::warn!("NullBackend: binding unknown program {:?}", program);
        }
        if stage == ShaderStage::PIXEL {
            self.bound_pixel = Some(program);
        } else {
            self.bound_vertex = Some(program);
        }
    }

    fn upload_constants(&mut self, _stage: ShaderStage, _data: &[u8]) {
        if self.check_context("upload_constants") {
            self.constant_uploads += 1;
        }
    }

    fn retire_queue(&self) -> RetireQueue {
        Arc::clone(&self.retire)
    }

    fn release_retired(&mut self) -> usize {
        let retired: Vec<ProgramId> = self.retire.lock().drain(..).collect();
        let mut released = 0;
        for id in retired {
            // Programs from before a device loss are already gone
            if self.programs.remove(&id).is_some() {
                released += 1;
            }
            if self.bound_pixel == Some(id) {
                self.bound_pixel = None;
            }
            if self.bound_vertex == Some(id) {
                self.bound_vertex = None;
            }
        }
        released
    }

    fn set_multisample(&mut self, samples: u32) {
        self.samples = samples.max(1);
    }

    fn target_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn target_scale(&self) -> (f32, f32) {
        (self.scale as f32, self.scale as f32)
    }

    fn resolve_depth_target(&mut self) {
        if self.check_context("resolve_depth_target") {
            self.resolve_count += 1;
        }
    }

    fn restore_render_target(&mut self) {}

    fn read_depth(&mut self, x: u32, y: u32) -> u32 {
        self.fire_loss_trigger();
        if !self.check_context("read_depth") {
            return 0;
        }
        self.depth[self.index(x, y)]
    }

    fn write_depth(&mut self, x: u32, y: u32, depth: u32) {
        if !self.check_context("write_depth") {
            return;
        }
        let i = self.index(x, y);
        self.depth[i] = depth;
    }

    fn read_color(&mut self, x: u32, y: u32) -> u32 {
        self.fire_loss_trigger();
        if !self.check_context("read_color") {
            return 0;
        }
        self.color[self.index(x, y)]
    }

    fn write_color(&mut self, x: u32, y: u32, argb: u32) {
        if !self.check_context("write_color") {
            return;
        }
        let i = self.index(x, y);
        self.color[i] = argb;
    }

    fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    fn recreate(&mut self) -> Result<(), String> {
        if self.fail_recreate {
            return Err("could not recreate graphics context".to_string());
        }
        // Native objects died with the old context
        self.programs.clear();
        self.bound_pixel = None;
        self.bound_vertex = None;
        self.reset_buffers();
        self.device_lost = false;
        self.owner = Some(thread::current().id());
        tracing::info!("NullBackend: context recreated");
        Ok(())
    }

    fn get_framebuffer(&self) -> Option<FramebufferData> {
        let mut fb = FramebufferData::new(self.width, self.height);

        // Native rows run bottom-up, screenshots top-down
        for y in 0..self.height {
            let src_row = self.height - 1 - y;
            for x in 0..self.width {
                let argb = self.color[(src_row * self.width + x) as usize];
                let i = ((y * self.width + x) * 4) as usize;
                fb.pixels[i] = (argb >> 16) as u8;
                fb.pixels[i + 1] = (argb >> 8) as u8;
                fb.pixels[i + 2] = argb as u8;
                fb.pixels[i + 3] = (argb >> 24) as u8;
            }
        }

        Some(fb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_backend() -> NullBackend {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        backend
    }

    #[test]
    fn test_null_backend() {
        let mut backend = current_backend();
        backend.begin_frame();
        backend.clear(0xFF00_0000, 0xFF_FFFF);
        backend.draw(PrimitiveType::Triangles, 3);
        backend.end_frame();
        assert_eq!(backend.total_draw_calls(), 1);
        assert_eq!(backend.frame_count(), 1);
        backend.shutdown();
    }

    #[test]
    fn test_missing_capability() {
        let mut backend = NullBackend::new();
        backend.set_missing_capability(Some("dual source blending"));
        let err = backend.init().unwrap_err();
        assert!(err.contains("dual source blending"));
    }

    #[test]
    fn test_compile_and_create() {
        let mut backend = current_backend();
        let bytecode = backend.compile_program(ShaderStage::PIXEL, "void main() {}").unwrap();
        let id = backend.create_program(ShaderStage::PIXEL, &bytecode).unwrap();
        assert_eq!(backend.live_program_count(), 1);
        assert_eq!(backend.compile_count(), 1);

        // Wrong stage and garbage are rejected
        assert!(backend.create_program(ShaderStage::VERTEX, &bytecode).is_err());
        assert!(backend.create_program(ShaderStage::PIXEL, b"garbage").is_err());

        backend.retire_queue().lock().push(id);
        assert_eq!(backend.release_retired(), 1);
        assert_eq!(backend.live_program_count(), 0);
    }

    #[test]
    fn test_compile_failure_marker() {
        let mut backend = current_backend();
        backend.set_compile_failure(Some("tev_stage_3"));
        assert!(backend.compile_program(ShaderStage::PIXEL, "// tev_stage_3").is_err());
        assert!(backend.compile_program(ShaderStage::PIXEL, "// tev_stage_2").is_ok());
        assert_eq!(backend.compile_count(), 2);
    }

    #[test]
    fn test_depth_clear_and_poke() {
        let mut backend = current_backend();
        backend.clear(0xFF00_0000, 0x12_3456);
        assert_eq!(backend.read_depth(10, 10), 0x1234_5600);

        backend.write_depth(5, 6, 0xABCD_EF00);
        assert_eq!(backend.read_depth(5, 6), 0xABCD_EF00);
        // Out of range coordinates clamp to the edge
        backend.write_depth(EFB_WIDTH + 10, EFB_HEIGHT, 0x1111_1100);
        assert_eq!(backend.read_depth(EFB_WIDTH - 1, EFB_HEIGHT - 1), 0x1111_1100);
    }

    #[test]
    fn test_calls_from_other_thread_are_refused() {
        let mut backend = current_backend();
        backend.write_color(1, 1, 0xFFAA_BBCC);

        let handle = std::thread::spawn(move || {
            let value = backend.read_color(1, 1);
            let compiled = backend.compile_program(ShaderStage::PIXEL, "void main() {}");
            (value, compiled.is_err())
        });
        let (value, refused) = handle.join().unwrap();
        assert_eq!(value, 0);
        assert!(refused);
    }

    #[test]
    fn test_device_loss_and_recreate() {
        let mut backend = current_backend();
        let bytecode = backend.compile_program(ShaderStage::PIXEL, "void main() {}").unwrap();
        backend.create_program(ShaderStage::PIXEL, &bytecode).unwrap();

        backend.lose_device();
        assert!(backend.is_device_lost());
        assert!(backend.compile_program(ShaderStage::PIXEL, "void main() {}").is_err());

        backend.set_fail_recreate(true);
        assert!(backend.recreate().is_err());
        backend.set_fail_recreate(false);
        assert!(backend.recreate().is_ok());
        assert!(!backend.is_device_lost());
        assert_eq!(backend.live_program_count(), 0);
    }

    #[test]
    fn test_loss_trigger_fires_on_read() {
        let trigger = Arc::new(AtomicBool::new(false));
        let mut backend = NullBackend::new().with_loss_trigger(Arc::clone(&trigger));
        backend.init().unwrap();

        backend.write_depth(0, 0, 0x1234_5600);
        assert_eq!(backend.read_depth(0, 0), 0x1234_5600);
        trigger.store(true, Ordering::Release);
        assert!(!backend.is_device_lost());
        assert_eq!(backend.read_depth(0, 0), 0);
        assert!(backend.is_device_lost());
        assert!(!trigger.load(Ordering::Acquire));
    }

    #[test]
    fn test_framebuffer_is_top_down() {
        let mut backend = current_backend();
        // Native row 0 is the bottom of the image
        backend.write_color(0, 0, 0xFF11_2233);
        let fb = backend.get_framebuffer().unwrap();
        let last_row = ((fb.height - 1) * fb.width * 4) as usize;
        assert_eq!(&fb.pixels[last_row..last_row + 4], &[0x11, 0x22, 0x33, 0xFF]);
    }
}
