//! Utility programs
//!
//! Fixed programs used for EFB copies, clears, format reinterpretation and
//! presentation. They are not keyed by pipeline state; each kind exists in at
//! most two variants (single-sampled and multisampled) and lives as long as
//! the graphics context.

use crate::backend::{GraphicsBackend, OwnedProgram, ProgramId, ShaderStage};
use fv_core::{Result, VideoError};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// A family of fixed programs for one shader stage
pub trait UtilityKind: Copy + Eq + Hash + Debug {
    /// Whether a multisampled variant exists at all
    fn has_multisampled_variant(self) -> bool;

    /// Whether only the multisampled variant exists
    fn multisampled_only(self) -> bool {
        false
    }

    /// Source for this kind; `samples` is 1 for the single-sampled variant
    fn generate_source(self, samples: u32) -> String;

    fn name(self) -> &'static str;

    /// Normalize a requested variant to the one that actually exists
    fn variant(self, multisampled: bool) -> bool {
        if self.multisampled_only() {
            true
        } else {
            multisampled && self.has_multisampled_variant()
        }
    }
}

/// Pixel utility programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PixelUtility {
    /// EFB copy through a 4x5 color matrix
    ColorMatrix,
    /// Direct EFB color copy
    ColorCopy,
    /// Depth to color through a matrix
    DepthMatrix,
    /// Screen clear
    Clear,
    /// Red/cyan stereo combine
    Anaglyph,
    /// Resolve a multisampled depth target to one sample per pixel
    DepthResolve,
    /// Reinterpret RGBA6 data as RGB8
    ReinterpRgba6ToRgb8,
    /// Reinterpret RGB8 data as RGBA6
    ReinterpRgb8ToRgba6,
    /// Outputs the rasterized color unchanged; bound when a signature fails to compile
    PassThrough,
}

impl PixelUtility {
    pub const ALL: [PixelUtility; 9] = [
        PixelUtility::ColorMatrix,
        PixelUtility::ColorCopy,
        PixelUtility::DepthMatrix,
        PixelUtility::Clear,
        PixelUtility::Anaglyph,
        PixelUtility::DepthResolve,
        PixelUtility::ReinterpRgba6ToRgb8,
        PixelUtility::ReinterpRgb8ToRgba6,
        PixelUtility::PassThrough,
    ];
}

/// Sampling statement for an EFB source texture
fn sample_efb(samples: u32, target: &str) -> String {
    if samples > 1 {
        format!(
            "    vec4 {target} = vec4(0.0);\n    for (int i = 0; i < {samples}; i++) {target} += texelFetch(efb, ivec2(uv0), i);\n    {target} /= {samples}.0;\n"
        )
    } else {
        format!("    vec4 {target} = texture(efb, uv0);\n")
    }
}

fn sampler_decl(samples: u32) -> &'static str {
    if samples > 1 {
        "uniform sampler2DMS efb;\n"
    } else {
        "uniform sampler2D efb;\n"
    }
}

impl UtilityKind for PixelUtility {
    fn has_multisampled_variant(self) -> bool {
        matches!(
            self,
            Self::ColorMatrix
                | Self::ColorCopy
                | Self::DepthMatrix
                | Self::ReinterpRgba6ToRgb8
                | Self::ReinterpRgb8ToRgba6
                | Self::DepthResolve
        )
    }

    fn multisampled_only(self) -> bool {
        self == Self::DepthResolve
    }

    fn generate_source(self, samples: u32) -> String {
        let mut out = format!("// utility pixel program: {} samples={}\n", self.name(), samples);
        out.push_str("in vec2 uv0;\nin vec4 color0;\nout vec4 ocol0;\n");

        match self {
            Self::ColorMatrix | Self::DepthMatrix => {
                out.push_str(sampler_decl(samples));
                out.push_str("uniform vec4 cmatrix[5];\nvoid main() {\n");
                out.push_str(&sample_efb(samples, "texcol"));
                if self == Self::DepthMatrix {
                    out.push_str("    vec4 src = vec4(texcol.r * 255.0 / 256.0);\n");
                    out.push_str("    src = fract(src * vec4(1.0, 256.0, 65536.0, 16777216.0));\n");
                } else {
                    out.push_str("    vec4 src = round(texcol * 255.0) / 255.0;\n");
                }
                out.push_str("    ocol0 = vec4(dot(src, cmatrix[0]), dot(src, cmatrix[1]), dot(src, cmatrix[2]), dot(src, cmatrix[3])) + cmatrix[4];\n}\n");
            }
            Self::ColorCopy => {
                out.push_str(sampler_decl(samples));
                out.push_str("void main() {\n");
                out.push_str(&sample_efb(samples, "texcol"));
                out.push_str("    ocol0 = texcol;\n}\n");
            }
            Self::Clear => {
                out.push_str("void main() {\n    ocol0 = color0;\n}\n");
            }
            Self::Anaglyph => {
                out.push_str("uniform sampler2DArray eyes;\nvoid main() {\n");
                out.push_str("    vec4 left = texture(eyes, vec3(uv0, 0.0));\n");
                out.push_str("    vec4 right = texture(eyes, vec3(uv0, 1.0));\n");
                out.push_str("    ocol0 = vec4(left.r, right.g, right.b, 1.0);\n}\n");
            }
            Self::DepthResolve => {
                out.push_str(sampler_decl(samples));
                out.push_str("void main() {\n    float depth = 1.0;\n");
                out.push_str(&format!(
                    "    for (int i = 0; i < {samples}; i++) depth = min(depth, texelFetch(efb, ivec2(uv0), i).r);\n"
                ));
                out.push_str("    ocol0 = vec4(depth);\n}\n");
            }
            Self::ReinterpRgba6ToRgb8 => {
                out.push_str(sampler_decl(samples));
                out.push_str("void main() {\n");
                out.push_str(&sample_efb(samples, "texcol"));
                out.push_str("    ivec4 src6 = ivec4(round(texcol * 63.0));\n");
                out.push_str("    ivec4 dst8;\n");
                out.push_str("    dst8.r = (src6.r << 2) | (src6.g >> 4);\n");
                out.push_str("    dst8.g = ((src6.g & 0xF) << 4) | (src6.b >> 2);\n");
                out.push_str("    dst8.b = ((src6.b & 0x3) << 6) | src6.a;\n");
                out.push_str("    dst8.a = 255;\n    ocol0 = vec4(dst8) / 255.0;\n}\n");
            }
            Self::ReinterpRgb8ToRgba6 => {
                out.push_str(sampler_decl(samples));
                out.push_str("void main() {\n");
                out.push_str(&sample_efb(samples, "texcol"));
                out.push_str("    ivec4 src8 = ivec4(round(texcol * 255.0));\n");
                out.push_str("    ivec4 dst6;\n");
                out.push_str("    dst6.r = src8.r >> 2;\n");
                out.push_str("    dst6.g = ((src8.r & 0x3) << 4) | (src8.g >> 4);\n");
                out.push_str("    dst6.b = ((src8.g & 0xF) << 2) | (src8.b >> 6);\n");
                out.push_str("    dst6.a = src8.b & 0x3F;\n    ocol0 = vec4(dst6) / 63.0;\n}\n");
            }
            Self::PassThrough => {
                out.push_str("void main() {\n    ocol0 = color0;\n}\n");
            }
        }

        out
    }

    fn name(self) -> &'static str {
        match self {
            Self::ColorMatrix => "color_matrix",
            Self::ColorCopy => "color_copy",
            Self::DepthMatrix => "depth_matrix",
            Self::Clear => "clear",
            Self::Anaglyph => "anaglyph",
            Self::DepthResolve => "depth_resolve",
            Self::ReinterpRgba6ToRgb8 => "reinterp_rgba6_to_rgb8",
            Self::ReinterpRgb8ToRgba6 => "reinterp_rgb8_to_rgba6",
            Self::PassThrough => "pass_through",
        }
    }
}

/// Vertex utility programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VertexUtility {
    /// Position and one texture coordinate, used by copies and post-processing
    Simple,
    /// Position and color, used by clears
    Clear,
}

impl UtilityKind for VertexUtility {
    fn has_multisampled_variant(self) -> bool {
        false
    }

    fn generate_source(self, _samples: u32) -> String {
        let mut out = format!("// utility vertex program: {}\n", self.name());
        match self {
            Self::Simple => {
                out.push_str("in vec4 rawpos;\nin vec2 rawtex0;\nout vec2 uv0;\n");
                out.push_str("void main() {\n    uv0 = rawtex0;\n    gl_Position = rawpos;\n}\n");
            }
            Self::Clear => {
                out.push_str("in vec4 rawpos;\nin vec4 rawcolor0;\nout vec4 color0;\n");
                out.push_str("void main() {\n    color0 = rawcolor0;\n    gl_Position = rawpos;\n}\n");
            }
        }
        out
    }

    fn name(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Clear => "clear",
        }
    }
}

/// Lazily compiled utility programs for one stage
pub struct UtilityPrograms<U: UtilityKind> {
    stage: ShaderStage,
    programs: HashMap<(U, bool), OwnedProgram>,
}

impl<U: UtilityKind> UtilityPrograms<U> {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            programs: HashMap::new(),
        }
    }

    /// Get the program for `kind`, compiling it on first use
    pub fn get<B: GraphicsBackend + ?Sized>(
        &mut self,
        kind: U,
        multisampled: bool,
        samples: u32,
        backend: &mut B,
    ) -> Result<ProgramId> {
        let variant = kind.variant(multisampled);
        if let Some(program) = self.programs.get(&(kind, variant)) {
            return Ok(program.id());
        }

        let samples = if variant { samples.max(2) } else { 1 };
        let source = kind.generate_source(samples);
        let bytecode = backend
            .compile_program(self.stage, &source)
            .map_err(|e| VideoError::ProgramCompilation(format!("{}: {}", kind.name(), e)))?;
        let id = backend
            .create_program(self.stage, &bytecode)
            .map_err(|e| VideoError::ProgramCompilation(format!("{}: {}", kind.name(), e)))?;

        tracing::debug!("Compiled utility program {} (multisampled={})", kind.name(), variant);
        self.programs
            .insert((kind, variant), OwnedProgram::new(id, backend.retire_queue()));
        Ok(id)
    }

    /// Drop every multisampled variant. Returns how many were dropped
    pub fn invalidate_multisampled(&mut self) -> usize {
        let before = self.programs.len();
        self.programs.retain(|(_, multisampled), _| !*multisampled);
        before - self.programs.len()
    }

    pub fn clear(&mut self) {
        self.programs.clear();
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
