//! Shader reload.
//!
//! Every compute program is rebuilt from its on-disk GLSL source plus a
//! generated header carrying the workgroup sizes, uniform locations and
//! specialization defines. Generic stages fan out into one compile per
//! specialization, each landing in its own program slot. A failed compile
//! keeps the previous program alive.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::{error, fmt};

use fxhash::FxHashMap;
use lazy_static::lazy_static;
use regex::Regex;

use crate::api as gl;
use crate::api::types::*;
use crate::params::*;

#[derive(Debug)]
pub enum ShaderError {
    Io(PathBuf, io::Error),
    Compile(String),
    Link(String),
}

impl fmt::Display for ShaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShaderError::Io(path, err) => write!(f, "failed to read {:?}: {}", path, err),
            ShaderError::Compile(log) => write!(f, "shader failed to compile: {}", log),
            ShaderError::Link(log) => write!(f, "program failed to link: {}", log),
        }
    }
}

impl error::Error for ShaderError {}

/// One source file participating in a program.
#[derive(Clone, Debug)]
pub struct ShaderStage {
    pub path: PathBuf,
    pub gl_type: GLenum,
}

/// A reloadable program: a name for logs and labels, the kernel tag whose
/// handle slot it fills, and the chain of sources composing it.
#[derive(Clone, Debug)]
pub struct ReloadableShader {
    pub name: String,
    pub kind: ShaderKind,
    pub stages: Vec<ShaderStage>,
}

/// Concrete variants emitted when a generic stage reloads. The first entry is
/// the base kind itself.
pub fn specializations(kind: ShaderKind) -> &'static [ShaderKind] {
    match kind {
        ShaderKind::Decode => &[
            ShaderKind::Decode,
            ShaderKind::DecodeInt16Complex,
            ShaderKind::DecodeFloat,
            ShaderKind::DecodeFloatComplex,
        ],
        ShaderKind::Demodulate => &[ShaderKind::Demodulate, ShaderKind::DemodulateFloat],
        ShaderKind::Das => &[ShaderKind::Das, ShaderKind::DasFast],
        ShaderKind::MinMax => &[ShaderKind::MinMax],
        ShaderKind::Sum => &[ShaderKind::Sum],
        _ => &[],
    }
}

/// The source file a concrete variant is built from.
pub fn base_kind(kind: ShaderKind) -> ShaderKind {
    match kind {
        k if k.is_decode() => ShaderKind::Decode,
        k if k.is_demodulate() => ShaderKind::Demodulate,
        ShaderKind::Das | ShaderKind::DasFast => ShaderKind::Das,
        other => other,
    }
}

/// Generated preamble for one concrete kernel variant.
pub fn shader_header(kind: ShaderKind) -> String {
    let mut h = String::from("#version 460 core\n\n");
    match kind {
        ShaderKind::Decode
        | ShaderKind::DecodeInt16Complex
        | ShaderKind::DecodeFloat
        | ShaderKind::DecodeFloatComplex => {
            match kind {
                ShaderKind::DecodeInt16Complex => {
                    h.push_str("#define INPUT_DATA_TYPE_INT16_COMPLEX\n\n")
                }
                ShaderKind::DecodeFloat => h.push_str("#define INPUT_DATA_TYPE_FLOAT\n\n"),
                ShaderKind::DecodeFloatComplex => {
                    h.push_str("#define INPUT_DATA_TYPE_FLOAT_COMPLEX\n\n")
                }
                _ => {}
            }
            let _ = write!(
                h,
                "layout(local_size_x = {}, local_size_y = {}, local_size_z = {}) in;\n\n\
                 layout(location = {}) uniform bool u_first_pass;\n\n\
                 #define DECODE_MODE_NONE     0\n\
                 #define DECODE_MODE_HADAMARD 1\n",
                DECODE_LOCAL_SIZE_X,
                DECODE_LOCAL_SIZE_Y,
                DECODE_LOCAL_SIZE_Z,
                DECODE_FIRST_PASS_UNIFORM_LOC,
            );
        }
        ShaderKind::Demodulate | ShaderKind::DemodulateFloat => {
            let _ = write!(
                h,
                "layout(local_size_x = {}, local_size_y = {}, local_size_z = {}) in;\n\n",
                DEMOD_LOCAL_SIZE_X, DEMOD_LOCAL_SIZE_Y, DEMOD_LOCAL_SIZE_Z,
            );
            if kind == ShaderKind::DemodulateFloat {
                h.push_str("#define INPUT_DATA_TYPE_FLOAT\n\n");
            }
        }
        ShaderKind::Das | ShaderKind::DasFast => {
            if kind == ShaderKind::Das {
                let _ = write!(
                    h,
                    "layout(local_size_x = {}, local_size_y = {}, local_size_z = {}) in;\n\n\
                     #define DAS_FAST 0\n\n\
                     layout(location = {}) uniform ivec3 u_voxel_offset;\n",
                    DAS_LOCAL_SIZE_X,
                    DAS_LOCAL_SIZE_Y,
                    DAS_LOCAL_SIZE_Z,
                    DAS_VOXEL_OFFSET_UNIFORM_LOC,
                );
            } else {
                let _ = write!(
                    h,
                    "layout(local_size_x = {}, local_size_y = {}, local_size_z = {}) in;\n\n\
                     #define DAS_FAST 1\n\n\
                     layout(location = {}) uniform int   u_channel;\n",
                    DAS_FAST_LOCAL_SIZE_X,
                    DAS_FAST_LOCAL_SIZE_Y,
                    DAS_FAST_LOCAL_SIZE_Z,
                    DAS_FAST_CHANNEL_UNIFORM_LOC,
                );
            }
            let _ = write!(
                h,
                "layout(location = {}) uniform mat4  u_voxel_transform;\n\
                 layout(location = {}) uniform uint  u_cycle_t;\n\n",
                DAS_VOXEL_MATRIX_LOC, DAS_CYCLE_T_UNIFORM_LOC,
            );
            for id in 0..DAS_KIND_COUNT as i32 {
                let das = DasKind::from_i32(id).unwrap();
                let _ = writeln!(h, "#define DAS_ID_{} {}", das.name(), id);
            }
        }
        ShaderKind::MinMax => {
            let _ = write!(
                h,
                "layout(location = {}) uniform int u_mip_map;\n\n",
                MIN_MAX_MIPS_LEVEL_UNIFORM_LOC,
            );
        }
        ShaderKind::Sum => {
            let _ = write!(
                h,
                "layout(location = {}) uniform float u_sum_prescale = 1.0;\n\n",
                SUM_PRESCALE_UNIFORM_LOC,
            );
        }
    }
    h.push_str("\n#line 1\n");
    h
}

lazy_static! {
    static ref RE_INCLUDE: Regex = Regex::new(r#"^\s*#include\s+"(?P<path>.*)"\s*$"#).unwrap();
}

/// Read a source file, inlining `#include "…"` directives relative to the
/// including file. Emits `#line` directives so driver logs point at the right
/// file positions.
pub fn read_source_with_includes(path: &Path) -> Result<String, ShaderError> {
    let text = fs::read_to_string(path).map_err(|e| ShaderError::Io(path.to_path_buf(), e))?;
    let mut out = String::with_capacity(text.len());
    for (linei, line) in text.lines().enumerate() {
        if let Some(captures) = RE_INCLUDE.captures(line) {
            let mut inc = path.parent().map(Path::to_path_buf).unwrap_or_default();
            inc.push(&captures["path"]);
            out.push_str(&read_source_with_includes(&inc)?);
            let _ = writeln!(out, "#line {}", linei + 2);
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out)
}

fn shader_info_log(obj: GLuint) -> String {
    unsafe {
        let mut log_size = 0;
        gl::GetShaderiv(obj, gl::INFO_LOG_LENGTH, &mut log_size);
        let mut log_buf = vec![0u8; log_size.max(1) as usize];
        gl::GetShaderInfoLog(
            obj,
            log_size,
            &mut log_size,
            log_buf.as_mut_ptr() as *mut GLchar,
        );
        log_buf.truncate(log_size.max(0) as usize);
        String::from_utf8_lossy(&log_buf).into_owned()
    }
}

fn program_info_log(obj: GLuint) -> String {
    unsafe {
        let mut log_size = 0;
        gl::GetProgramiv(obj, gl::INFO_LOG_LENGTH, &mut log_size);
        let mut log_buf = vec![0u8; log_size.max(1) as usize];
        gl::GetProgramInfoLog(
            obj,
            log_size,
            &mut log_size,
            log_buf.as_mut_ptr() as *mut GLchar,
        );
        log_buf.truncate(log_size.max(0) as usize);
        String::from_utf8_lossy(&log_buf).into_owned()
    }
}

fn compile_shader(gl_type: GLenum, source: &str) -> Result<GLuint, ShaderError> {
    unsafe {
        let obj = gl::CreateShader(gl_type);
        let sources = [source.as_ptr() as *const GLchar];
        let lengths = [source.len() as GLint];
        gl::ShaderSource(obj, 1, sources.as_ptr(), lengths.as_ptr());
        gl::CompileShader(obj);

        let mut status = 0;
        gl::GetShaderiv(obj, gl::COMPILE_STATUS, &mut status);
        if status != gl::TRUE as GLint {
            let log = shader_info_log(obj);
            gl::DeleteShader(obj);
            Err(ShaderError::Compile(log))
        } else {
            Ok(obj)
        }
    }
}

fn link_program(shaders: &[GLuint]) -> Result<GLuint, ShaderError> {
    unsafe {
        let program = gl::CreateProgram();
        for &shader in shaders {
            gl::AttachShader(program, shader);
        }
        gl::LinkProgram(program);
        for &shader in shaders {
            gl::DetachShader(program, shader);
        }

        let mut status = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut status);
        if status != gl::TRUE as GLint {
            let log = program_info_log(program);
            gl::DeleteProgram(program);
            Err(ShaderError::Link(log))
        } else {
            Ok(program)
        }
    }
}

pub struct ReloadCoordinator {
    recipes: FxHashMap<ShaderKind, ReloadableShader>,
}

impl ReloadCoordinator {
    /// Standard program set: one GLSL file per generic kernel under
    /// `shader_dir`.
    pub fn with_default_recipes(shader_dir: &Path) -> ReloadCoordinator {
        let mut recipes = FxHashMap::default();
        for (kind, name, file) in [
            (ShaderKind::Decode, "Decode", "decode.glsl"),
            (ShaderKind::Demodulate, "Demodulate", "demod.glsl"),
            (ShaderKind::Das, "DAS", "das.glsl"),
            (ShaderKind::MinMax, "Min/Max", "min_max.glsl"),
            (ShaderKind::Sum, "Sum", "sum.glsl"),
        ] {
            recipes.insert(
                kind,
                ReloadableShader {
                    name: name.to_string(),
                    kind,
                    stages: vec![ShaderStage {
                        path: shader_dir.join(file),
                        gl_type: gl::COMPUTE_SHADER,
                    }],
                },
            );
        }
        ReloadCoordinator { recipes }
    }

    pub fn recipe(&self, kind: ShaderKind) -> Option<&ReloadableShader> {
        self.recipes.get(&base_kind(kind))
    }

    /// Compile one concrete variant of `kind`'s program.
    fn build_variant(
        &self,
        recipe: &ReloadableShader,
        variant: ShaderKind,
    ) -> Result<GLuint, ShaderError> {
        let mut objects = Vec::with_capacity(recipe.stages.len());
        let result = (|| {
            for stage in &recipe.stages {
                let mut text = shader_header(variant);
                text.push_str(&read_source_with_includes(&stage.path)?);
                objects.push(compile_shader(stage.gl_type, &text)?);
            }
            link_program(&objects)
        })();
        for obj in objects {
            unsafe { gl::DeleteShader(obj) };
        }
        result
    }

    /// Reload `kind`'s program and every specialization of it, replacing
    /// handle slots in `programs` on success. A variant that fails to build
    /// keeps its previous handle. Returns true when every variant built.
    pub fn reload(&self, kind: ShaderKind, programs: &mut [GLuint; SHADER_KIND_COUNT]) -> bool {
        let base = base_kind(kind);
        let recipe = match self.recipes.get(&base) {
            Some(recipe) => recipe,
            None => return false,
        };

        let mut all_ok = true;
        for &variant in specializations(base) {
            match self.build_variant(recipe, variant) {
                Ok(program) => {
                    unsafe {
                        let name = std::ffi::CString::new(variant.name()).unwrap();
                        gl::ObjectLabel(
                            gl::PROGRAM,
                            program,
                            name.as_bytes().len() as GLsizei,
                            name.as_ptr(),
                        );
                        gl::DeleteProgram(programs[variant as usize]);
                    }
                    programs[variant as usize] = program;
                    info!("reloaded shader {}", variant.name());
                }
                Err(err) => {
                    error!("reload of {} failed: {}", variant.name(), err);
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_variants_get_their_data_kind_defines() {
        assert!(!shader_header(ShaderKind::Decode).contains("INPUT_DATA_TYPE"));
        assert!(shader_header(ShaderKind::DecodeInt16Complex)
            .contains("#define INPUT_DATA_TYPE_INT16_COMPLEX"));
        assert!(shader_header(ShaderKind::DecodeFloat).contains("#define INPUT_DATA_TYPE_FLOAT"));
        assert!(shader_header(ShaderKind::DecodeFloatComplex)
            .contains("#define INPUT_DATA_TYPE_FLOAT_COMPLEX"));
        for variant in specializations(ShaderKind::Decode) {
            let h = shader_header(*variant);
            assert!(h.contains("uniform bool u_first_pass"));
            assert!(h.contains("#define DECODE_MODE_HADAMARD 1"));
            assert!(h.ends_with("#line 1\n"));
        }
    }

    #[test]
    fn das_headers_carry_geometry_ids_and_fast_flag() {
        let das = shader_header(ShaderKind::Das);
        let fast = shader_header(ShaderKind::DasFast);
        assert!(das.contains("#define DAS_FAST 0"));
        assert!(fast.contains("#define DAS_FAST 1"));
        assert!(das.contains("uniform ivec3 u_voxel_offset"));
        assert!(fast.contains("uniform int   u_channel"));
        for header in [&das, &fast] {
            assert!(header.contains("#define DAS_ID_FORCES 0"));
            assert!(header.contains("#define DAS_ID_RCA_VLS 5"));
            assert!(header.contains("#define DAS_ID_FLASH 6"));
            assert!(header.contains("uniform mat4  u_voxel_transform"));
        }
    }

    #[test]
    fn specialization_sets_cover_every_variant_slot() {
        let mut covered = vec![false; SHADER_KIND_COUNT];
        for base in [
            ShaderKind::Decode,
            ShaderKind::Demodulate,
            ShaderKind::Das,
            ShaderKind::MinMax,
            ShaderKind::Sum,
        ] {
            for &variant in specializations(base) {
                assert_eq!(base_kind(variant), base);
                covered[variant as usize] = true;
            }
        }
        assert!(covered.iter().all(|c| *c));
    }

    #[test]
    fn includes_are_inlined_relative_to_the_including_file() {
        let dir = std::env::temp_dir().join(format!("bf-shader-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("common.glsl"), "float common_fn() { return 1.0; }\n").unwrap();
        fs::write(
            dir.join("kernel.glsl"),
            "#include \"common.glsl\"\nvoid main() { common_fn(); }\n",
        )
        .unwrap();

        let source = read_source_with_includes(&dir.join("kernel.glsl")).unwrap();
        assert!(source.contains("float common_fn()"));
        assert!(source.contains("#line 2"));
        assert!(source.contains("void main()"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_include_is_reported_with_its_path() {
        let dir = std::env::temp_dir().join(format!("bf-shader-missing-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("kernel.glsl"), "#include \"nope.glsl\"\n").unwrap();

        let err = read_source_with_includes(&dir.join("kernel.glsl")).unwrap_err();
        match err {
            ShaderError::Io(path, _) => assert!(path.ends_with("nope.glsl")),
            other => panic!("unexpected error: {:?}", other),
        }
        fs::remove_dir_all(&dir).unwrap();
    }
}
