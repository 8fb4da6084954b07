//! Post-processing applied to each presented frame
//!
//! One effect at a time, chosen by name in the config. The effect runs as a
//! full-screen pixel program when the frame is presented; screenshots get
//! the same transform applied to the read-back pixels.

use crate::backend::{FramebufferData, GraphicsBackend, OwnedProgram, PrimitiveType, ShaderStage};

/// Post-processing effect types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostProcessEffect {
    /// No effect
    #[default]
    None,
    Grayscale,
    Invert,
    Sepia,
    /// Darken every other line
    Scanlines,
}

impl PostProcessEffect {
    pub const ALL: [PostProcessEffect; 5] = [
        Self::None,
        Self::Grayscale,
        Self::Invert,
        Self::Sepia,
        Self::Scanlines,
    ];

    /// Look up an effect by config name. Empty means no effect.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Some(Self::None);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|effect| effect.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Grayscale => "grayscale",
            Self::Invert => "invert",
            Self::Sepia => "sepia",
            Self::Scanlines => "scanlines",
        }
    }

    fn source(self) -> String {
        let body = match self {
            Self::None => "    ocol0 = c;\n",
            Self::Grayscale => "    float l = dot(c.rgb, vec3(0.299, 0.587, 0.114));\n    ocol0 = vec4(l, l, l, c.a);\n",
            Self::Invert => "    ocol0 = vec4(1.0 - c.rgb, c.a);\n",
            Self::Sepia => concat!(
                "    ocol0 = vec4(dot(c.rgb, vec3(0.393, 0.769, 0.189)),\n",
                "                 dot(c.rgb, vec3(0.349, 0.686, 0.168)),\n",
                "                 dot(c.rgb, vec3(0.272, 0.534, 0.131)), c.a);\n"
            ),
            Self::Scanlines => "    ocol0 = (int(gl_FragCoord.y) & 1) == 1 ? vec4(c.rgb * 0.5, c.a) : c;\n",
        };
        format!(
            "// post-processing: {}\nuniform sampler2D frame;\nin vec2 uv0;\nout vec4 ocol0;\nvoid main() {{\n    vec4 c = texture(frame, uv0);\n{}}}\n",
            self.name(),
            body
        )
    }

    /// Same transform on one RGBA8 pixel; `row` counts from the top
    pub fn apply_pixel(self, rgba: [u8; 4], row: u32) -> [u8; 4] {
        let [r, g, b, a] = rgba.map(|c| c as f32);
        let clamp = |v: f32| v.round().clamp(0.0, 255.0) as u8;
        match self {
            Self::None => rgba,
            Self::Grayscale => {
                let l = clamp(0.299 * r + 0.587 * g + 0.114 * b);
                [l, l, l, rgba[3]]
            }
            Self::Invert => [255 - rgba[0], 255 - rgba[1], 255 - rgba[2], rgba[3]],
            Self::Sepia => [
                clamp(0.393 * r + 0.769 * g + 0.189 * b),
                clamp(0.349 * r + 0.686 * g + 0.168 * b),
                clamp(0.272 * r + 0.534 * g + 0.131 * b),
                a as u8,
            ],
            Self::Scanlines => {
                if row & 1 == 1 {
                    [rgba[0] / 2, rgba[1] / 2, rgba[2] / 2, rgba[3]]
                } else {
                    rgba
                }
            }
        }
    }
}

/// Post-processing stage of the presentation path
#[derive(Debug, Default)]
pub struct PostProcessor {
    effect: PostProcessEffect,
    program: Option<OwnedProgram>,
    applied: u64,
    ready: bool,
}

impl PostProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the effect named `name` and compile its program.
    ///
    /// An unknown name or a program that fails to build leaves
    /// post-processing off; neither stops the video core from starting.
    pub fn init<B: GraphicsBackend + ?Sized>(&mut self, name: &str, backend: &mut B) {
        self.program = None;
        self.ready = true;
        self.effect = match PostProcessEffect::from_name(name) {
            Some(effect) => effect,
            None => {
                tracing::warn!("Unknown post-processing effect '{}', disabled", name);
                PostProcessEffect::None
            }
        };
        if self.effect == PostProcessEffect::None {
            return;
        }

        let built = backend
            .compile_program(ShaderStage::PIXEL, &self.effect.source())
            .and_then(|bytecode| backend.create_program(ShaderStage::PIXEL, &bytecode));
        match built {
            Ok(id) => {
                tracing::info!("Post-processing effect: {}", self.effect.name());
                self.program = Some(OwnedProgram::new(id, backend.retire_queue()));
            }
            Err(e) => {
                tracing::warn!("Post-processing effect {} failed to build: {}", self.effect.name(), e);
                self.effect = PostProcessEffect::None;
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.program = None;
        self.effect = PostProcessEffect::None;
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn effect(&self) -> PostProcessEffect {
        self.effect
    }

    pub fn is_active(&self) -> bool {
        self.program.is_some()
    }

    /// Run the effect over the presented frame. Returns false when there is none.
    pub fn apply<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> bool {
        let Some(program) = &self.program else {
            return false;
        };
        backend.bind_program(ShaderStage::PIXEL, program.id());
        backend.draw(PrimitiveType::Quads, 4);
        self.applied += 1;
        true
    }

    /// Apply the effect to read-back pixels
    pub fn apply_to_framebuffer(&self, frame: &mut FramebufferData) {
        if self.effect == PostProcessEffect::None {
            return;
        }
        let width = frame.width as usize;
        for (i, pixel) in frame.pixels.chunks_exact_mut(4).enumerate() {
            let row = (i / width.max(1)) as u32;
            let out = self.effect.apply_pixel([pixel[0], pixel[1], pixel[2], pixel[3]], row);
            pixel.copy_from_slice(&out);
        }
    }

    /// Frames the effect has been applied to
    pub fn applied_count(&self) -> u64 {
        self.applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;

    #[test]
    fn test_effect_names() {
        assert_eq!(PostProcessEffect::from_name(""), Some(PostProcessEffect::None));
        assert_eq!(PostProcessEffect::from_name("Grayscale"), Some(PostProcessEffect::Grayscale));
        assert_eq!(PostProcessEffect::from_name("bloom"), None);
    }

    #[test]
    fn test_pixel_transforms() {
        assert_eq!(PostProcessEffect::Invert.apply_pixel([0, 128, 255, 7], 0), [255, 127, 0, 7]);
        assert_eq!(PostProcessEffect::Grayscale.apply_pixel([255, 255, 255, 255], 0), [255, 255, 255, 255]);
        assert_eq!(PostProcessEffect::Scanlines.apply_pixel([100, 100, 100, 255], 1), [50, 50, 50, 255]);
        assert_eq!(PostProcessEffect::Scanlines.apply_pixel([100, 100, 100, 255], 2), [100, 100, 100, 255]);
    }

    #[test]
    fn test_apply_draws_fullscreen_pass() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut post = PostProcessor::new();
        post.init("invert", &mut backend);

        assert!(post.is_active());
        assert!(post.apply(&mut backend));
        assert_eq!(backend.total_draw_calls(), 1);
        assert_eq!(post.applied_count(), 1);
        assert!(backend.bound_program(ShaderStage::PIXEL).is_some());
    }

    #[test]
    fn test_unknown_or_failing_effect_is_disabled() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut post = PostProcessor::new();

        post.init("bloom", &mut backend);
        assert!(post.is_ready());
        assert!(!post.is_active());

        backend.set_compile_failure(Some("post-processing"));
        post.init("sepia", &mut backend);
        assert_eq!(post.effect(), PostProcessEffect::None);
        assert!(!post.apply(&mut backend));
    }

    #[test]
    fn test_shutdown_retires_program() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut post = PostProcessor::new();
        post.init("sepia", &mut backend);
        assert_eq!(backend.live_program_count(), 1);

        post.shutdown();
        assert_eq!(backend.release_retired(), 1);
        assert_eq!(backend.live_program_count(), 0);
    }
}
