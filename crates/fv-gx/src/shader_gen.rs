//! Program source generation
//!
//! Turns a signature into GLSL-flavored program text. Generation is a pure
//! function of the signature: the same signature always yields the same
//! bytes, and every signature field shows up in the output so different
//! signatures never collapse to the same text.

use std::fmt::Write;

use crate::signature::{PixelFlags, PixelSignature, TevStageKey, VertexSignature};
use crate::state::CompareMode;
use crate::vertex_loader::VertexComponents;

const COLOR_INPUTS: [&str; 16] = [
    "prev.rgb", "prev.aaa", "c0.rgb", "c0.aaa", "c1.rgb", "c1.aaa", "c2.rgb", "c2.aaa",
    "tex.rgb", "tex.aaa", "ras.rgb", "ras.aaa", "vec3(1.0)", "vec3(0.5)", "konst.rgb",
    "vec3(0.0)",
];

const ALPHA_INPUTS: [&str; 8] = [
    "prev.a", "c0.a", "c1.a", "c2.a", "tex.a", "ras.a", "konst.a", "0.0",
];

const REGISTERS: [&str; 4] = ["prev", "c0", "c1", "c2"];

const BIAS: [&str; 4] = ["", " + 0.5", " - 0.5", ""];

const SCALE: [&str; 4] = ["1.0", "2.0", "4.0", "0.5"];

const COMPONENTS: [char; 4] = ['r', 'g', 'b', 'a'];

/// Decoded combiner fields shared by the color and alpha halves of a stage
#[derive(Debug, Clone, Copy)]
struct Combiner {
    d: usize,
    c: usize,
    b: usize,
    a: usize,
    bias: usize,
    subtract: bool,
    clamp: bool,
    scale: usize,
    dest: usize,
}

impl Combiner {
    fn color(env: u32) -> Self {
        Self {
            d: (env & 0xF) as usize,
            c: ((env >> 4) & 0xF) as usize,
            b: ((env >> 8) & 0xF) as usize,
            a: ((env >> 12) & 0xF) as usize,
            bias: ((env >> 16) & 0x3) as usize,
            subtract: (env >> 18) & 1 != 0,
            clamp: (env >> 19) & 1 != 0,
            scale: ((env >> 20) & 0x3) as usize,
            dest: ((env >> 22) & 0x3) as usize,
        }
    }

    fn alpha(env: u32) -> Self {
        Self {
            d: ((env >> 4) & 0x7) as usize,
            c: ((env >> 7) & 0x7) as usize,
            b: ((env >> 10) & 0x7) as usize,
            a: ((env >> 13) & 0x7) as usize,
            bias: ((env >> 16) & 0x3) as usize,
            subtract: (env >> 18) & 1 != 0,
            clamp: (env >> 19) & 1 != 0,
            scale: ((env >> 20) & 0x3) as usize,
            dest: ((env >> 22) & 0x3) as usize,
        }
    }

    /// Bias value 3 switches the stage to compare mode
    fn is_compare(&self) -> bool {
        self.bias == 3
    }
}

fn konst_color(sel: u32) -> String {
    match sel {
        0..=7 => format!("vec3({:.3})", (8 - sel) as f32 / 8.0),
        12..=15 => format!("k{}.rgb", sel - 12),
        16..=31 => {
            let reg = (sel - 16) % 4;
            let comp = COMPONENTS[((sel - 16) / 4) as usize];
            format!("k{}.{}{}{}", reg, comp, comp, comp)
        }
        _ => "vec3(0.0)".to_string(),
    }
}

fn konst_alpha(sel: u32) -> String {
    match sel {
        0..=7 => format!("{:.3}", (8 - sel) as f32 / 8.0),
        16..=31 => {
            let reg = (sel - 16) % 4;
            let comp = COMPONENTS[((sel - 16) / 4) as usize];
            format!("k{}.{}", reg, comp)
        }
        _ => "0.0".to_string(),
    }
}

fn rasterized_input(color_chan: u32) -> &'static str {
    match color_chan {
        0 => "color0",
        1 => "color1",
        5 => "vec4(alphabump)",
        6 => "vec4(alphabump * (255.0 / 248.0))",
        _ => "vec4(0.0)",
    }
}

fn emit_combiner(out: &mut String, combiner: &Combiner, inputs: &[&str], swizzle: &str, stage: usize) {
    let dest = REGISTERS[combiner.dest];
    if combiner.is_compare() {
        // Compare mode: d + (a OP b ? c : 0), equality when the subtract bit is set
        let equal = if combiner.subtract { "true" } else { "false" };
        let _ = writeln!(
            out,
            "    {dest}.{swizzle} = {} + (tev_compare_{}({}, {}, {}) ? {} : {}(0.0));",
            inputs[combiner.d],
            combiner.scale,
            inputs[combiner.a],
            equal,
            inputs[combiner.b],
            inputs[combiner.c],
            if swizzle == "a" { "float" } else { "vec3" },
        );
    } else {
        let sign = if combiner.subtract { "-" } else { "+" };
        let _ = writeln!(
            out,
            "    {dest}.{swizzle} = ({} {sign} mix({}, {}, {}){}) * {};",
            inputs[combiner.d],
            inputs[combiner.a],
            inputs[combiner.b],
            inputs[combiner.c],
            BIAS[combiner.bias],
            SCALE[combiner.scale],
        );
    }
    if combiner.clamp {
        let _ = writeln!(out, "    {dest}.{swizzle} = clamp({dest}.{swizzle}, 0.0, 1.0);");
    }
    let _ = writeln!(out, "    // stage {} writes {}", stage, dest);
}

fn emit_tev_stage(out: &mut String, index: usize, stage: &TevStageKey) {
    let _ = writeln!(
        out,
        "    // stage {}: color_env={:06x} alpha_env={:06x} order={:03x} konst={:03x}",
        index, stage.color_env, stage.alpha_env, stage.order, stage.konst
    );

    let tex_map = stage.order & 0x7;
    let tex_coord = (stage.order >> 3) & 0x7;
    let tex_enable = (stage.order >> 6) & 1 != 0;
    let color_chan = (stage.order >> 7) & 0x7;

    if tex_enable {
        let _ = writeln!(out, "    tex = texture(samp{}, uv{}.xy / uv{}.z);", tex_map, tex_coord, tex_coord);
    } else {
        out.push_str("    tex = vec4(1.0);\n");
    }
    let _ = writeln!(out, "    ras = {};", rasterized_input(color_chan));

    let kcsel = stage.konst & 0x1F;
    let kasel = (stage.konst >> 5) & 0x1F;
    let _ = writeln!(out, "    konst = vec4({}, {});", konst_color(kcsel), konst_alpha(kasel));

    // Alpha swap tables only change channel order of the inputs
    let ras_swap = stage.alpha_env & 0x3;
    let tex_swap = (stage.alpha_env >> 2) & 0x3;
    if ras_swap != 0 {
        let _ = writeln!(out, "    ras = ras.{};", swap_swizzle(ras_swap));
    }
    if tex_swap != 0 {
        let _ = writeln!(out, "    tex = tex.{};", swap_swizzle(tex_swap));
    }

    emit_combiner(out, &Combiner::color(stage.color_env), &COLOR_INPUTS, "rgb", index);
    emit_combiner(out, &Combiner::alpha(stage.alpha_env), &ALPHA_INPUTS, "a", index);
}

fn swap_swizzle(table: u32) -> &'static str {
    match table {
        1 => "rrra",
        2 => "ggga",
        _ => "bbba",
    }
}

fn alpha_compare_expr(mode: CompareMode, reference: &str) -> String {
    match mode {
        CompareMode::Never => "false".to_string(),
        CompareMode::Always => "true".to_string(),
        _ => format!("(prev.a {} {})", mode.glsl_operator(), reference),
    }
}

/// Generate a pixel program for `sig`
pub fn generate_pixel_program(sig: &PixelSignature) -> String {
    let flags = sig.pixel_flags();
    let num_stages = sig.num_stages();
    let mut out = String::with_capacity(2048 + num_stages * 512);

    let _ = writeln!(
        out,
        "// pixel program: components={:08x} flags={:08x} alpha={:03x} fog={} ztex={:x}",
        sig.components, sig.flags, sig.alpha_test, sig.fog, sig.ztex
    );

    if flags.contains(PixelFlags::EARLY_Z) {
        out.push_str("layout(early_fragment_tests) in;\n");
    }
    let interp = if flags.contains(PixelFlags::MULTISAMPLE) {
        "sample in"
    } else {
        "in"
    };

    out.push_str("uniform vec4 c0, c1, c2, prev_init;\n");
    out.push_str("uniform vec4 k0, k1, k2, k3;\n");
    out.push_str("uniform vec4 alpha_ref;\n");
    out.push_str("uniform vec4 fog_color, fog_params;\n");
    out.push_str("uniform vec4 dst_alpha;\n");
    for i in 0..8 {
        let _ = writeln!(out, "uniform sampler2D samp{};", i);
    }

    let num_chans = sig.num_color_chans();
    for i in 0..num_chans.min(2) {
        let _ = writeln!(out, "{} vec4 color{};", interp, i);
    }
    for i in num_chans..2 {
        let _ = writeln!(out, "const vec4 color{} = vec4(0.0);", i);
    }
    let num_texgens = sig.num_texgens();
    for i in 0..num_texgens {
        let _ = writeln!(out, "{} vec3 uv{};", interp, i);
    }
    for i in num_texgens..8 {
        let _ = writeln!(out, "const vec3 uv{} = vec3(0.0, 0.0, 1.0);", i);
    }
    let _ = writeln!(out, "{} float clip_z;", interp);
    out.push_str("const float alphabump = 0.0;\n");
    let _ = writeln!(out, "// indirect stages: {}", sig.num_ind_stages());
    out.push_str("out vec4 ocol0;\n\n");

    for scale in 0..4 {
        let _ = writeln!(
            out,
            "bool tev_compare_{}(float a, bool eq, float b) {{ return eq ? a == b : a > b; }}",
            scale
        );
        let _ = writeln!(
            out,
            "bool tev_compare_{}(vec3 a, bool eq, vec3 b) {{ return eq ? all(equal(a, b)) : all(greaterThan(a, b)); }}",
            scale
        );
    }

    out.push_str("\nvoid main() {\n");
    out.push_str("    vec4 prev = prev_init;\n    vec4 tex, ras, konst;\n");

    for (i, stage) in sig.stages.iter().take(num_stages).enumerate() {
        emit_tev_stage(&mut out, i, stage);
    }

    if flags.contains(PixelFlags::ALPHA_TEST) {
        let comp0 = CompareMode::from_bits(sig.alpha_test);
        let comp1 = CompareMode::from_bits(sig.alpha_test >> 3);
        let lhs = alpha_compare_expr(comp0, "alpha_ref.x");
        let rhs = alpha_compare_expr(comp1, "alpha_ref.y");
        let cond = match (sig.alpha_test >> 6) & 0x3 {
            0 => format!("{} && {}", lhs, rhs),
            1 => format!("{} || {}", lhs, rhs),
            2 => format!("{} != {}", lhs, rhs),
            _ => format!("{} == {}", lhs, rhs),
        };
        let _ = writeln!(out, "    if (!({})) discard;", cond);
    }

    if flags.contains(PixelFlags::PER_PIXEL_DEPTH) {
        let ztex_type = sig.ztex & 0x3;
        let ztex_op = (sig.ztex >> 2) & 0x3;
        let mask = match ztex_type {
            0 => "0x0000FF",
            1 => "0x00FFFF",
            _ => "0xFFFFFF",
        };
        let _ = writeln!(out, "    int zt = int(dot(tex, vec4(16711680.0, 65280.0, 255.0, 0.0))) & {};", mask);
        if ztex_op == 1 {
            out.push_str("    int zcoord = int(clip_z * 16777215.0) + zt;\n");
        } else {
            out.push_str("    int zcoord = zt;\n");
        }
        out.push_str("    gl_FragDepth = float(clamp(zcoord, 0, 0xFFFFFF)) / 16777215.0;\n");
    }

    if sig.fog != 0 {
        let depth = if flags.contains(PixelFlags::FOG_ORTHO) {
            "clip_z"
        } else {
            "fog_params.x / (fog_params.y - clip_z)"
        };
        let _ = writeln!(out, "    float ze = {};", depth);
        out.push_str("    float fog = clamp(ze - fog_params.z, 0.0, 1.0);\n");
        let curve = match sig.fog {
            4 => "    fog = 1.0 - exp2(-8.0 * fog);\n",
            5 => "    fog = 1.0 - exp2(-8.0 * fog * fog);\n",
            6 => "    fog = exp2(-8.0 * (1.0 - fog));\n",
            7 => "    fog = 1.0 - fog;\n    fog = exp2(-8.0 * fog * fog);\n",
            _ => "",
        };
        out.push_str(curve);
        let _ = writeln!(out, "    // fog function {}", sig.fog);
        out.push_str("    prev.rgb = mix(prev.rgb, fog_color.rgb, fog);\n");
    }

    out.push_str("    ocol0 = prev;\n");
    if flags.contains(PixelFlags::DST_ALPHA) {
        out.push_str("    ocol0.a = dst_alpha.a;\n");
    }
    out.push_str("}\n");
    out
}

/// Generate a vertex program for `sig`
pub fn generate_vertex_program(sig: &VertexSignature) -> String {
    let components = sig.vertex_components();
    let mut out = String::with_capacity(2048);

    let _ = writeln!(
        out,
        "// vertex program: components={:08x} texgens={} chans={}",
        sig.components, sig.num_texgens, sig.num_color_chans
    );
    out.push_str("uniform vec4 posnormalmatrix[6];\n");
    out.push_str("uniform vec4 projection[4];\n");
    out.push_str("uniform vec4 materials[4];\n");
    out.push_str("uniform vec4 lights[40];\n");
    out.push_str("uniform vec4 texmatrices[24];\n");
    out.push_str("in vec4 rawpos;\n");
    if components.contains(VertexComponents::POSMTX_IDX) {
        out.push_str("in float posmtx;\n");
    }
    if components.contains(VertexComponents::NORMAL) {
        out.push_str("in vec3 rawnorm0;\n");
    }
    for i in 0..2 {
        let flag = if i == 0 {
            VertexComponents::COLOR0
        } else {
            VertexComponents::COLOR1
        };
        if components.contains(flag) {
            let _ = writeln!(out, "in vec4 rawcolor{};", i);
        }
    }
    for i in 0..8 {
        if components.contains(VertexComponents::texcoord(i)) {
            let _ = writeln!(out, "in vec3 rawtex{};", i);
        }
        if components.contains(VertexComponents::texmtx_idx(i)) {
            let _ = writeln!(out, "in float texmtx{};", i);
        }
    }
    for i in 0..sig.num_color_chans {
        let _ = writeln!(out, "out vec4 color{};", i);
    }
    for i in 0..sig.num_texgens {
        let _ = writeln!(out, "out vec3 uv{};", i);
    }
    out.push_str("out float clip_z;\n\nvoid main() {\n");

    out.push_str("    vec4 pos = vec4(dot(posnormalmatrix[0], rawpos), dot(posnormalmatrix[1], rawpos), dot(posnormalmatrix[2], rawpos), 1.0);\n");
    if components.contains(VertexComponents::NORMAL) {
        out.push_str("    vec3 normal = normalize(vec3(dot(posnormalmatrix[3].xyz, rawnorm0), dot(posnormalmatrix[4].xyz, rawnorm0), dot(posnormalmatrix[5].xyz, rawnorm0)));\n");
    } else {
        out.push_str("    vec3 normal = vec3(0.0);\n");
    }

    for chan in 0..sig.num_color_chans as usize {
        emit_color_channel(&mut out, chan, sig.chan_ctrl[chan], sig.chan_ctrl[chan + 2], components);
    }

    for (i, &info) in sig.texgens.iter().take(sig.num_texgens as usize).enumerate() {
        emit_texgen(&mut out, i, info, components);
    }

    out.push_str("    gl_Position = vec4(dot(projection[0], pos), dot(projection[1], pos), dot(projection[2], pos), dot(projection[3], pos));\n");
    out.push_str("    clip_z = gl_Position.z / gl_Position.w;\n}\n");
    out
}

fn emit_color_channel(
    out: &mut String,
    chan: usize,
    color_ctrl: u32,
    alpha_ctrl: u32,
    components: VertexComponents,
) {
    let _ = writeln!(out, "    // channel {}: color_ctrl={:04x} alpha_ctrl={:04x}", chan, color_ctrl, alpha_ctrl);
    let vertex_color = if chan == 0 {
        VertexComponents::COLOR0
    } else {
        VertexComponents::COLOR1
    };

    for (half, ctrl, swizzle) in [("color", color_ctrl, "rgb"), ("alpha", alpha_ctrl, "a")] {
        let from_vertex = ctrl & 1 != 0;
        let lit = (ctrl >> 1) & 1 != 0;
        let light_mask = ((ctrl >> 2) & 0xF) | (((ctrl >> 11) & 0xF) << 4);
        let ambient_from_vertex = (ctrl >> 6) & 1 != 0;
        let diffuse_fn = (ctrl >> 7) & 0x3;
        let attenuation = (ctrl >> 9) & 0x3;

        let material = if from_vertex && components.contains(vertex_color) {
            format!("rawcolor{}", chan)
        } else {
            format!("materials[{}]", chan + 2)
        };

        if lit {
            let ambient = if ambient_from_vertex && components.contains(vertex_color) {
                format!("rawcolor{}", chan)
            } else {
                format!("materials[{}]", chan)
            };
            let _ = writeln!(out, "    vec4 {}lacc{} = {};", half, chan, ambient);
            for light in 0..8 {
                if light_mask & (1 << light) == 0 {
                    continue;
                }
                let _ = writeln!(
                    out,
                    "    {half}lacc{chan} += lights[{}] * light_term(normal, pos.xyz, {light}, {diffuse_fn}, {attenuation});",
                    light * 5
                );
            }
            let _ = writeln!(
                out,
                "    color{chan}.{swizzle} = ({material} * clamp({half}lacc{chan}, 0.0, 1.0)).{swizzle};"
            );
        } else {
            let _ = writeln!(out, "    color{chan}.{swizzle} = {material}.{swizzle};");
        }
    }
}

fn emit_texgen(out: &mut String, index: usize, info: u32, components: VertexComponents) {
    let projection = (info >> 1) & 1 != 0;
    let input_abc1 = (info >> 2) & 1 != 0;
    let gen_type = (info >> 4) & 0x7;
    let source_row = (info >> 7) & 0x1F;
    let emboss_source = (info >> 12) & 0x7;
    let emboss_light = (info >> 15) & 0x7;

    let _ = writeln!(out, "    // texgen {}: info={:05x}", index, info);

    let source = match source_row {
        0 => "rawpos".to_string(),
        1 => "vec4(normal, 1.0)".to_string(),
        2 => "color0".to_string(),
        3 | 4 => "vec4(0.0, 0.0, 1.0, 1.0)".to_string(),
        row @ 5..=12 => {
            let tex = (row - 5) as usize;
            if components.contains(VertexComponents::texcoord(tex)) {
                format!("vec4(rawtex{}.xy, 1.0, 1.0)", tex)
            } else {
                "vec4(0.0, 0.0, 1.0, 1.0)".to_string()
            }
        }
        _ => "vec4(0.0, 0.0, 1.0, 1.0)".to_string(),
    };
    let _ = writeln!(out, "    vec4 coord{} = {};", index, source);
    if !input_abc1 {
        let _ = writeln!(out, "    coord{}.z = 1.0;", index);
    }

    let matrix = if components.contains(VertexComponents::texmtx_idx(index)) {
        format!("int(texmtx{})", index)
    } else {
        (index * 3).to_string()
    };

    match gen_type {
        1 => {
            let _ = writeln!(
                out,
                "    uv{index} = uv{emboss_source} + vec3(dot(normal, lights[{}].xyz), 0.0, 0.0);",
                emboss_light * 5 + 3
            );
        }
        2 => {
            let _ = writeln!(out, "    uv{index} = vec3(color0.rg, 1.0);");
        }
        3 => {
            let _ = writeln!(out, "    uv{index} = vec3(color1.rg, 1.0);");
        }
        _ => {
            let _ = writeln!(
                out,
                "    uv{index}.xy = vec2(dot(texmatrices[{matrix}], coord{index}), dot(texmatrices[{matrix} + 1], coord{index}));"
            );
            if projection {
                let _ = writeln!(out, "    uv{index}.z = dot(texmatrices[{matrix} + 2], coord{index});");
            } else {
                let _ = writeln!(out, "    uv{index}.z = 1.0;");
            }
        }
    }
}
