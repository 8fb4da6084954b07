//! Video core: owns every subsystem and drives them in dependency order
//!
//! The core lives on the thread that owns the graphics context. In dual-core
//! mode that is the render thread; in single-core mode the CPU thread calls
//! into it directly.

use crate::backend::{GraphicsBackend, PrimitiveType, ProgramId, ShaderStage};
use crate::constants::{PixelConstantManager, VertexConstantManager};
use crate::decoder::{CommandHandler, OpcodeDecoder};
use crate::efb;
use crate::osd::OnScreenDisplay;
use crate::postprocess::PostProcessor;
use crate::program_cache::{CacheOptions, ProgramCache};
use crate::signature::{PixelSignature, VertexSignature};
use crate::state::{DirtyFlags, GxState, BP_COPY_EXECUTE};
use crate::texture_converter::TextureConverter;
use crate::timing::FrameLimiter;
use crate::utility::{PixelUtility, VertexUtility};
use crate::vertex_loader::VertexLoaderManager;
use fv_core::config::MultisampleMode;
use fv_core::{
    Config, EfbAccessPort, EfbAccessRequest, EfbBridgeReceiver, HostCallbacks, Result, VideoError,
    XfbSwap, EFB_ACCESS_SENTINEL,
};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Banner posted to the on-screen display after startup
const STARTUP_BANNER: &str = "flipper-video GX backend";
const STARTUP_BANNER_MS: u32 = 5000;

/// Subsystems in startup order. Shutdown runs the exact reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    OpcodeDecoder,
    VertexProgramCache,
    PixelProgramCache,
    VertexConstants,
    PixelConstants,
    PostProcessing,
    VertexLoaders,
    TextureConverter,
}

impl Subsystem {
    pub const STARTUP_ORDER: [Subsystem; 8] = [
        Self::OpcodeDecoder,
        Self::VertexProgramCache,
        Self::PixelProgramCache,
        Self::VertexConstants,
        Self::PixelConstants,
        Self::PostProcessing,
        Self::VertexLoaders,
        Self::TextureConverter,
    ];
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpcodeDecoder => "opcode decoder",
            Self::VertexProgramCache => "vertex program cache",
            Self::PixelProgramCache => "pixel program cache",
            Self::VertexConstants => "vertex constant manager",
            Self::PixelConstants => "pixel constant manager",
            Self::PostProcessing => "post-processing",
            Self::VertexLoaders => "vertex loader manager",
            Self::TextureConverter => "texture converter",
        };
        f.write_str(name)
    }
}

/// Cache options for the program caches, from the config
pub fn cache_options(config: &Config) -> CacheOptions {
    CacheOptions {
        store_dir: config
            .gfx
            .shader_cache
            .then(|| config.paths.shader_cache.clone()),
        hot_path: config.gfx.hot_program_path,
        dump_dir: config
            .debug
            .dump_shaders
            .then(|| config.paths.shader_cache.join("dump")),
    }
}

/// The GX video core
pub struct VideoCore<B: GraphicsBackend> {
    config: Config,
    host: Arc<dyn HostCallbacks>,
    backend: B,
    state: GxState,
    decoder: OpcodeDecoder,
    vertex_programs: ProgramCache<VertexSignature>,
    pixel_programs: ProgramCache<PixelSignature>,
    vertex_constants: VertexConstantManager,
    pixel_constants: PixelConstantManager,
    post: PostProcessor,
    vertex_loaders: VertexLoaderManager,
    textures: TextureConverter,
    osd: OnScreenDisplay,
    limiter: FrameLimiter,
    /// Subsystems brought up so far, in startup order
    started: Vec<Subsystem>,
    backend_ready: bool,
    /// Gates every operation that needs a fully started core
    initialized: bool,
    multisample: MultisampleMode,
    screenshot: Option<PathBuf>,
    frames: u64,
    draws: u64,
    device_resets: u64,
}

impl<B: GraphicsBackend> VideoCore<B> {
    pub fn new(config: Config, backend: B, host: Arc<dyn HostCallbacks>) -> Self {
        let options = cache_options(&config);
        let multisample = config.gfx.multisample;
        Self {
            host,
            backend,
            state: GxState::new(),
            decoder: OpcodeDecoder::new(),
            vertex_programs: ProgramCache::new(&options),
            pixel_programs: ProgramCache::new(&options),
            vertex_constants: VertexConstantManager::new(),
            pixel_constants: PixelConstantManager::new(),
            post: PostProcessor::new(),
            vertex_loaders: VertexLoaderManager::new(),
            textures: TextureConverter::new(),
            osd: OnScreenDisplay::new(),
            limiter: FrameLimiter::new(config.general.frame_limit),
            started: Vec::with_capacity(Subsystem::STARTUP_ORDER.len()),
            backend_ready: false,
            initialized: false,
            multisample,
            screenshot: None,
            frames: 0,
            draws: 0,
            device_resets: 0,
            config,
        }
    }

    /// Bring up the backend and every subsystem in order.
    ///
    /// Must run on the thread that will own the graphics context. A failing
    /// step tears down whatever already started and the core stays unusable.
    /// Calling it again once initialized does nothing.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        if let Err(e) = self.backend.init() {
            let message = format!("Video backend could not start: {}", e);
            tracing::error!("{}", message);
            self.host.log(&message, true);
            return Err(VideoError::Capability(e));
        }
        self.backend_ready = true;
        self.backend.set_multisample(self.multisample.samples());
        tracing::info!("Graphics backend ready: {}", self.backend.driver_fingerprint());

        for subsystem in Subsystem::STARTUP_ORDER {
            if let Err(e) = self.start(subsystem) {
                let message = format!("Failed to start {}: {}", subsystem, e);
                tracing::error!("{}", message);
                self.host.log(&message, true);
                self.teardown();
                return Err(e);
            }
            tracing::debug!("Started {}", subsystem);
            self.started.push(subsystem);
        }

        self.initialized = true;
        self.osd.add_message(STARTUP_BANNER, STARTUP_BANNER_MS);
        tracing::info!("Video core initialized");
        Ok(())
    }

    fn start(&mut self, subsystem: Subsystem) -> Result<()> {
        match subsystem {
            Subsystem::OpcodeDecoder => self.decoder.init(),
            Subsystem::VertexProgramCache => {
                let restored = self.vertex_programs.init(&mut self.backend);
                tracing::info!("Vertex program cache ready, {} programs restored", restored);
                // Draws fall back to this program; without it nothing can render
                self.vertex_programs
                    .get_utility_program(VertexUtility::Simple, false, &mut self.backend)
                    .map_err(|e| VideoError::Capability(format!("simple vertex program: {}", e)))?;
            }
            Subsystem::PixelProgramCache => {
                let restored = self.pixel_programs.init(&mut self.backend);
                tracing::info!("Pixel program cache ready, {} programs restored", restored);
                self.pixel_programs
                    .invalidate_multisample_variants(self.multisample.samples());
                self.pixel_programs
                    .get_utility_program(PixelUtility::PassThrough, false, &mut self.backend)
                    .map_err(|e| VideoError::Capability(format!("pass-through pixel program: {}", e)))?;
            }
            Subsystem::VertexConstants => self.vertex_constants.init(),
            Subsystem::PixelConstants => self.pixel_constants.init(),
            Subsystem::PostProcessing => {
                let effect = self.config.gfx.post_processing_effect.clone();
                self.post.init(&effect, &mut self.backend);
            }
            Subsystem::VertexLoaders => self.vertex_loaders.init(),
            Subsystem::TextureConverter => self.textures.init(),
        }
        Ok(())
    }

    fn stop(&mut self, subsystem: Subsystem) {
        match subsystem {
            Subsystem::OpcodeDecoder => self.decoder.shutdown(),
            Subsystem::VertexProgramCache => self.vertex_programs.shutdown(),
            Subsystem::PixelProgramCache => self.pixel_programs.shutdown(),
            Subsystem::VertexConstants => self.vertex_constants.shutdown(),
            Subsystem::PixelConstants => self.pixel_constants.shutdown(),
            Subsystem::PostProcessing => self.post.shutdown(),
            Subsystem::VertexLoaders => self.vertex_loaders.shutdown(),
            Subsystem::TextureConverter => self.textures.shutdown(),
        }
        tracing::debug!("Stopped {}", subsystem);
    }

    /// Stop started subsystems in reverse, then the backend
    fn teardown(&mut self) {
        self.initialized = false;
        while let Some(subsystem) = self.started.pop() {
            self.stop(subsystem);
        }
        // Subsystems that failed halfway may still hold programs
        self.vertex_programs.shutdown();
        self.pixel_programs.shutdown();
        if self.backend_ready {
            self.backend.release_retired();
            self.backend.shutdown();
            self.backend_ready = false;
        }
    }

    /// Stop everything in reverse startup order. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.backend_ready && self.started.is_empty() {
            return;
        }
        self.teardown();
        self.osd.clear();
        self.screenshot = None;
        tracing::info!("Video core shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Subsystems currently running, in startup order
    pub fn started_subsystems(&self) -> &[Subsystem] {
        &self.started
    }

    /// Decode and execute command-stream bytes. Returns the number of commands run.
    pub fn run_commands(&mut self, data: &[u8]) -> usize {
        if !self.initialized || !self.ensure_device() {
            return 0;
        }
        let mut decoder = std::mem::take(&mut self.decoder);
        let executed = decoder.run(data, self);
        self.decoder = decoder;
        executed
    }

    /// Resolve and bind the programs for the current pipeline state.
    ///
    /// A pixel signature that fails to compile binds the pass-through
    /// program instead; the failure is reported to the host but is not fatal.
    pub fn resolve_active_program(&mut self) -> Result<(ProgramId, ProgramId)> {
        if !self.initialized {
            return Err(VideoError::NotInitialized);
        }
        // Cached programs belong to the old context until recovery drops them
        self.handle_device_loss()?;

        let vertex_sig = VertexSignature::from_state(&self.state);
        let vertex = match self.vertex_programs.resolve(&vertex_sig, &mut self.backend) {
            Ok(id) => id,
            Err(VideoError::ProgramCompilation(e)) => {
                self.host.log(&format!("Vertex program failed to compile: {}", e), false);
                self.vertex_programs
                    .get_utility_program(VertexUtility::Simple, false, &mut self.backend)?
            }
            Err(e) => return Err(e),
        };

        let pixel_sig = PixelSignature::from_state(&self.state, self.multisample.is_enabled());
        let pixel = match self.pixel_programs.resolve(&pixel_sig, &mut self.backend) {
            Ok(id) => id,
            Err(VideoError::ProgramCompilation(e)) => {
                self.host.log(&format!("Pixel program failed to compile: {}", e), false);
                self.pixel_programs
                    .get_utility_program(PixelUtility::PassThrough, false, &mut self.backend)?
            }
            Err(e) => return Err(e),
        };

        self.backend.bind_program(ShaderStage::VERTEX, vertex);
        self.backend.bind_program(ShaderStage::PIXEL, pixel);
        self.state
            .clear_dirty(DirtyFlags::VERTEX_PROGRAM | DirtyFlags::PIXEL_PROGRAM);
        Ok((vertex, pixel))
    }

    /// Present a frame.
    ///
    /// Runs post-processing, writes a pending screenshot, releases retired
    /// programs and notifies the host. Returns false before init.
    pub fn update_xfb(&mut self, swap: XfbSwap) -> bool {
        if !self.initialized || !self.ensure_device() {
            return false;
        }
        let y_offset = if self.config.general.use_xfb { swap.y_offset } else { 0 };
        tracing::trace!(
            "Swap XFB 0x{:08X} {}x{} y_offset={}",
            swap.xfb_addr,
            swap.width,
            swap.height,
            y_offset
        );

        self.post.apply(&mut self.backend);
        if let Some(path) = self.screenshot.take() {
            self.save_screenshot(&path);
        }
        for line in self.osd.visible(Instant::now()) {
            tracing::trace!(target: "osd", "{}", line);
        }

        self.backend.end_frame();
        let released = self.backend.release_retired();
        if released > 0 {
            tracing::debug!("Released {} retired programs", released);
        }
        self.frames += 1;
        self.host.frame_swapped();
        self.limiter.end_frame();
        self.backend.begin_frame();
        true
    }

    fn save_screenshot(&mut self, path: &Path) {
        let Some(mut frame) = self.backend.get_framebuffer() else {
            tracing::warn!("Screenshot requested but the backend has no framebuffer");
            return;
        };
        self.post.apply_to_framebuffer(&mut frame);

        match write_ppm(path, frame.width, frame.height, &frame.pixels) {
            Ok(()) => {
                tracing::info!("Saved screenshot to {}", path.display());
                self.osd
                    .add_message(&format!("Saved {}", path.display()), 2000);
            }
            Err(e) => {
                let message = format!("Could not save screenshot {}: {}", path.display(), e);
                tracing::warn!("{}", message);
                self.host.log(&message, false);
            }
        }
    }

    /// Save the next presented frame to `path` as a PPM image.
    ///
    /// Relative paths land in the configured screenshot directory. Ignored
    /// unless the core is initialized.
    pub fn request_screenshot(&mut self, path: impl AsRef<Path>) -> bool {
        if !self.initialized {
            return false;
        }
        self.screenshot = Some(self.config.paths.screenshots.join(path));
        true
    }

    pub fn add_message(&mut self, text: &str, milliseconds: u32) {
        self.osd.add_message(text, milliseconds);
    }

    /// Change the multisample mode. Multisampled utility variants are rebuilt on demand.
    pub fn set_multisample(&mut self, mode: MultisampleMode) {
        self.multisample = mode;
        if !self.initialized {
            return;
        }
        let samples = mode.samples();
        self.backend.set_multisample(samples);
        self.pixel_programs.invalidate_multisample_variants(samples);
        self.vertex_programs.invalidate_multisample_variants(samples);
        self.state.mark_dirty(DirtyFlags::MULTISAMPLE | DirtyFlags::PIXEL_PROGRAM);
    }

    /// Drop every cached program
    pub fn clear_caches(&mut self) {
        if !self.initialized {
            return;
        }
        self.vertex_programs.clear();
        self.pixel_programs.clear();
        self.backend.release_retired();
    }

    /// Drop every cached program and reload the persisted stores.
    /// Returns the number of programs restored.
    pub fn reload_caches(&mut self) -> usize {
        if !self.initialized {
            return 0;
        }
        let restored = self.vertex_programs.reload(&mut self.backend)
            + self.pixel_programs.reload(&mut self.backend);
        self.backend.release_retired();
        restored
    }

    /// Invalidate everything derived from emulated RAM before a save state is applied
    pub fn prepare_state_load(&mut self) {
        self.vertex_loaders.mark_all_dirty();
        self.textures.invalidate();
        self.vertex_constants.invalidate();
        self.pixel_constants.invalidate();
        self.state.mark_dirty(DirtyFlags::all());
    }

    /// Replace the register state with one restored from a save state
    pub fn load_state(&mut self, state: GxState) {
        self.prepare_state_load();
        self.state = state;
        self.state.mark_dirty(DirtyFlags::all());
    }

    /// Recover from a lost graphics device.
    ///
    /// Returns Ok(false) if the device is fine. Recovery recreates the
    /// context, then clears and reloads the program caches before anything
    /// else draws. A context that cannot be recreated is a capability failure.
    pub fn handle_device_loss(&mut self) -> Result<bool> {
        if !self.backend_ready || !self.backend.is_device_lost() {
            return Ok(false);
        }
        tracing::warn!("Graphics device lost, recreating context");

        if let Err(e) = self.backend.recreate() {
            let message = format!("Graphics device lost and could not be recreated: {}", e);
            tracing::error!("{}", message);
            self.host.log(&message, true);
            self.initialized = false;
            return Err(VideoError::Capability(e));
        }
        self.device_resets += 1;

        self.vertex_programs.clear();
        self.pixel_programs.clear();
        // Programs of the old context died with it
        self.backend.release_retired();
        let restored = self.vertex_programs.reload(&mut self.backend)
            + self.pixel_programs.reload(&mut self.backend);
        self.vertex_constants.invalidate();
        self.pixel_constants.invalidate();
        if self.started.contains(&Subsystem::PostProcessing) {
            let effect = self.config.gfx.post_processing_effect.clone();
            self.post.init(&effect, &mut self.backend);
        }
        self.backend.set_multisample(self.multisample.samples());
        self.state.mark_dirty(DirtyFlags::all());
        tracing::info!("Device recovered, {} programs restored", restored);
        Ok(true)
    }

    /// Recover a lost device before touching it again.
    /// False once recovery has failed and the core is unusable.
    fn ensure_device(&mut self) -> bool {
        match self.handle_device_loss() {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Video core unusable: {}", e);
                false
            }
        }
    }

    /// Service a pending EFB request from the bridge, if any.
    ///
    /// Call at safe points between commands. With no usable device the
    /// request is completed with the sentinel so the CPU thread never hangs.
    pub fn service_efb(&mut self, receiver: &EfbBridgeReceiver) -> bool {
        if !receiver.is_access_requested() {
            return false;
        }
        if !self.initialized || self.backend.is_device_lost() {
            return receiver.service_with_sentinel();
        }
        receiver.service(|request| self.access_efb(*request))
    }

    fn execute_efb_copy(&mut self) {
        let copy = self.state.efb_copy();
        if copy.to_xfb {
            tracing::trace!("EFB to XFB copy {}x{}", copy.width, copy.height);
        } else {
            self.textures.encode_copy(&copy, &mut self.backend);
        }
        if copy.clear {
            self.backend
                .clear(self.state.clear_color(), self.state.clear_depth());
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn state(&self) -> &GxState {
        &self.state
    }

    pub fn pixel_cache(&self) -> &ProgramCache<PixelSignature> {
        &self.pixel_programs
    }

    pub fn vertex_cache(&self) -> &ProgramCache<VertexSignature> {
        &self.vertex_programs
    }

    pub fn pixel_constants(&self) -> &PixelConstantManager {
        &self.pixel_constants
    }

    pub fn post_processor(&self) -> &PostProcessor {
        &self.post
    }

    pub fn texture_converter(&self) -> &TextureConverter {
        &self.textures
    }

    pub fn osd(&self) -> &OnScreenDisplay {
        &self.osd
    }

    pub fn multisample(&self) -> MultisampleMode {
        self.multisample
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    /// Times the graphics device was lost and recreated
    pub fn device_reset_count(&self) -> u64 {
        self.device_resets
    }

    pub fn frame_limiter(&self) -> &FrameLimiter {
        &self.limiter
    }
}

impl<B: GraphicsBackend> CommandHandler for VideoCore<B> {
    fn load_cp(&mut self, reg: u8, value: u32) {
        self.state.write_cp(reg, value);
    }

    fn load_xf(&mut self, addr: u16, values: &[u32]) {
        self.state.write_xf(addr, values);
    }

    fn load_bp(&mut self, reg: u8, value: u32) {
        self.state.write_bp(reg, value);
        if reg == BP_COPY_EXECUTE {
            self.execute_efb_copy();
        }
    }

    fn vertex_stride(&mut self, vat: usize) -> u32 {
        self.vertex_loaders.get_loader(&self.state, vat).stride
    }

    fn draw(&mut self, primitive: PrimitiveType, vat: usize, vertex_count: u32, _vertices: &[u8]) {
        if vertex_count == 0 {
            return;
        }
        if let Err(e) = self.resolve_active_program() {
            tracing::warn!("Skipping draw, no program: {}", e);
            return;
        }
        self.vertex_constants.update(&mut self.state);
        self.pixel_constants.update(&mut self.state);
        self.vertex_constants.upload(&mut self.backend);
        self.pixel_constants.upload(&mut self.backend);

        tracing::trace!("Draw {:?} vat={} count={}", primitive, vat, vertex_count);
        self.backend.draw(primitive, vertex_count);
        self.draws += 1;
    }

    fn invalidate_vertex_cache(&mut self) {
        tracing::trace!("Vertex cache invalidated");
    }
}

impl<B: GraphicsBackend> EfbAccessPort for VideoCore<B> {
    /// Single-core path: the caller already owns the context, service inline
    fn access_efb(&mut self, request: EfbAccessRequest) -> u32 {
        if !self.initialized || !self.config.gfx.efb_access_enabled {
            return EFB_ACCESS_SENTINEL;
        }
        if self.backend.is_device_lost() {
            // The lost contents are gone; later accesses see the new context
            self.ensure_device();
            return EFB_ACCESS_SENTINEL;
        }
        efb::perform_efb_access(&mut self.backend, &request, self.multisample.is_enabled())
    }
}

impl<B: GraphicsBackend> Drop for VideoCore<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write RGBA8 pixels as a binary PPM, dropping alpha
pub fn write_ppm(path: &Path, width: u32, height: u32, rgba: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut out = Vec::with_capacity(32 + (width * height * 3) as usize);
    write!(out, "P6\n{} {}\n255\n", width, height)?;
    for pixel in rgba.chunks_exact(4) {
        out.extend_from_slice(&pixel[..3]);
    }
    fs::write(path, out)
}
