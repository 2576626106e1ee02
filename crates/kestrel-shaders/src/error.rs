//! Shader pipeline errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced while preprocessing or compiling a shader.
#[derive(Error, Debug)]
pub enum ShaderError {
    /// A file includes itself, directly or through other files.
    #[error("Circular include of {0}")]
    CircularInclude(String),

    /// A source or included file could not be read.
    #[error("Failed to open {path:?}: {source}")]
    FailedToOpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The front end rejected the source.
    #[error("Failed to parse shader: {0}")]
    FailedToParseShader(String),

    /// The source parsed but could not be turned into a SPIR-V module.
    #[error("Failed to link shader: {0}")]
    FailedToLinkShader(String),

    /// The compiler could not be created.
    #[error("Shader compiler unavailable")]
    CompilerUnavailable,
}

/// Result type for shader operations.
pub type Result<T> = std::result::Result<T, ShaderError>;
