//! GLSL to SPIR-V compilation.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use shaderc::{CompileOptions, Compiler, Limit, ShaderKind};

use crate::error::{Result, ShaderError};
use crate::preprocess::{FileSystem, Preprocessor};

/// Pipeline stage a source is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    fn kind(self) -> ShaderKind {
        match self {
            Self::Vertex => ShaderKind::Vertex,
            Self::TessellationControl => ShaderKind::TessControl,
            Self::TessellationEvaluation => ShaderKind::TessEvaluation,
            Self::Geometry => ShaderKind::Geometry,
            Self::Fragment => ShaderKind::Fragment,
            Self::Compute => ShaderKind::Compute,
        }
    }

    /// Guess the stage from a file extension such as `vert` or `frag`.
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "vert" => Some(Self::Vertex),
            "tesc" => Some(Self::TessellationControl),
            "tese" => Some(Self::TessellationEvaluation),
            "geom" => Some(Self::Geometry),
            "frag" => Some(Self::Fragment),
            "comp" => Some(Self::Compute),
            _ => None,
        }
    }
}

/// Resource limits every compile is checked against.
const RESOURCE_LIMITS: &[(Limit, i32)] = &[
    (Limit::MaxLights, 32),
    (Limit::MaxClipPlanes, 6),
    (Limit::MaxTextureUnits, 32),
    (Limit::MaxTextureCoords, 32),
    (Limit::MaxVertexAttribs, 64),
    (Limit::MaxVertexUniformComponents, 4096),
    (Limit::MaxVaryingFloats, 64),
    (Limit::MaxVertexTextureImageUnits, 32),
    (Limit::MaxCombinedTextureImageUnits, 80),
    (Limit::MaxTextureImageUnits, 32),
    (Limit::MaxFragmentUniformComponents, 4096),
    (Limit::MaxDrawBuffers, 32),
    (Limit::MaxVertexUniformVectors, 128),
    (Limit::MaxVaryingVectors, 8),
    (Limit::MaxFragmentUniformVectors, 16),
    (Limit::MaxVertexOutputVectors, 16),
    (Limit::MaxFragmentInputVectors, 15),
    (Limit::MinProgramTexelOffset, -8),
    (Limit::MaxProgramTexelOffset, 7),
    (Limit::MaxClipDistances, 8),
    (Limit::MaxComputeWorkGroupCountX, 65535),
    (Limit::MaxComputeWorkGroupCountY, 65535),
    (Limit::MaxComputeWorkGroupCountZ, 65535),
    (Limit::MaxComputeWorkGroupSizeX, 1024),
    (Limit::MaxComputeWorkGroupSizeY, 1024),
    (Limit::MaxComputeWorkGroupSizeZ, 64),
    (Limit::MaxCullDistances, 8),
    (Limit::MaxCombinedClipAndCullDistances, 8),
    (Limit::MaxSamples, 4),
];

/// Map a compiler failure onto the parse/link split. Front-end
/// diagnostics are parse errors; anything raised after the front end
/// accepted the source is a link error.
fn classify(error: shaderc::Error) -> ShaderError {
    match error {
        shaderc::Error::CompilationError(_, log) if log.contains("link") => {
            ShaderError::FailedToLinkShader(log)
        }
        shaderc::Error::CompilationError(_, log) | shaderc::Error::InvalidStage(log) => {
            ShaderError::FailedToParseShader(log)
        }
        other => ShaderError::FailedToLinkShader(other.to_string()),
    }
}

fn compile_options() -> Result<CompileOptions<'static>> {
    let mut options = CompileOptions::new().ok_or(ShaderError::CompilerUnavailable)?;
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_0 as u32);
    options.set_optimization_level(shaderc::OptimizationLevel::Size);
    for &(limit, value) in RESOURCE_LIMITS {
        options.set_limit(limit, value);
    }
    Ok(options)
}

/// Shared GLSL compiler.
///
/// The underlying compiler is not thread-safe, so compiles are serialized
/// behind a mutex.
pub struct ShaderCompiler {
    compiler: Mutex<Compiler>,
    search_paths: Vec<PathBuf>,
}

impl ShaderCompiler {
    /// Create a compiler with no include search paths.
    pub fn new() -> Result<Self> {
        let compiler = Compiler::new().ok_or(ShaderError::CompilerUnavailable)?;
        Ok(Self {
            compiler: Mutex::new(compiler),
            search_paths: Vec::new(),
        })
    }

    /// Directories searched for included files not found as given.
    pub fn with_search_paths(mut self, search_paths: Vec<PathBuf>) -> Self {
        self.search_paths = search_paths;
        self
    }

    /// Expand the includes of the file at `path` and compile it. The stage
    /// is taken from the file extension when `stage` is `None`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn compile_file(&self, path: impl AsRef<Path>, stage: Option<ShaderStage>) -> Result<Vec<u32>> {
        let path = path.as_ref();
        let stage = stage
            .or_else(|| ShaderStage::from_extension(path))
            .ok_or_else(|| {
                ShaderError::FailedToParseShader(format!("no shader stage for {}", path.display()))
            })?;

        let mut preprocessor = Preprocessor::new(FileSystem::new(self.search_paths.clone()));
        let source = preprocessor.preprocess_file(&path.to_string_lossy())?;
        self.compile_expanded(&source, &path.to_string_lossy(), stage)
    }

    /// Expand the includes of `source` and compile it. `name` only appears
    /// in diagnostics.
    pub fn compile_source(&self, source: &str, name: &str, stage: ShaderStage) -> Result<Vec<u32>> {
        let mut preprocessor = Preprocessor::new(FileSystem::new(self.search_paths.clone()));
        let source = preprocessor.preprocess_source(source)?;
        self.compile_expanded(&source, name, stage)
    }

    fn compile_expanded(&self, source: &str, name: &str, stage: ShaderStage) -> Result<Vec<u32>> {
        let options = compile_options()?;
        let artifact = self
            .compiler
            .lock()
            .compile_into_spirv(source, stage.kind(), name, "main", Some(&options))
            .map_err(|error| {
                let error = classify(error);
                tracing::error!("Compiling {} failed: {}", name, error);
                error
            })?;

        if artifact.get_num_warnings() > 0 {
            tracing::warn!("Shader warnings in {}: {}", name, artifact.get_warning_messages());
        }
        let words = artifact.as_binary().to_vec();
        tracing::debug!("Compiled {} ({:?}, {} words)", name, stage, words.len());
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_follows_extension() {
        assert_eq!(
            ShaderStage::from_extension(Path::new("shaders/mesh.vert")),
            Some(ShaderStage::Vertex)
        );
        assert_eq!(
            ShaderStage::from_extension(Path::new("blur.comp")),
            Some(ShaderStage::Compute)
        );
        assert_eq!(ShaderStage::from_extension(Path::new("notes.txt")), None);
        assert_eq!(ShaderStage::from_extension(Path::new("noext")), None);
    }

    #[test]
    fn link_diagnostics_are_link_errors() {
        let error = classify(shaderc::Error::CompilationError(
            1,
            "linking error: missing entry point".into(),
        ));
        assert!(matches!(error, ShaderError::FailedToLinkShader(_)));

        let error = classify(shaderc::Error::CompilationError(1, "syntax error".into()));
        assert!(matches!(error, ShaderError::FailedToParseShader(_)));
    }

    #[test]
    #[ignore = "needs the shaderc native library"]
    fn compiles_a_fragment_shader() {
        let compiler = ShaderCompiler::new().unwrap();
        let words = compiler
            .compile_source(
                "#version 450\nlayout(location = 0) out vec4 c;\nvoid main() { c = vec4(1.0); }\n",
                "inline.frag",
                ShaderStage::Fragment,
            )
            .unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    #[ignore = "needs the shaderc native library"]
    fn syntax_errors_are_parse_errors() {
        let compiler = ShaderCompiler::new().unwrap();
        let result = compiler.compile_source("#version 450\nvoid main( {", "bad.vert", ShaderStage::Vertex);
        assert!(matches!(result, Err(ShaderError::FailedToParseShader(_))));
    }
}
