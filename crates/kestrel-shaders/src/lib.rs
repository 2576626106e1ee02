//! Shader tooling for the Kestrel renderer.
//!
//! This crate provides:
//! - Recursive `#include` expansion with cycle detection
//! - GLSL to SPIR-V compilation through shaderc
//! - Built-in shaders compiled at build time

pub mod builtin;
pub mod compiler;
pub mod error;
pub mod preprocess;

pub use compiler::{ShaderCompiler, ShaderStage};
pub use error::{Result, ShaderError};
pub use preprocess::{FileSystem, MemorySource, Preprocessor, SourceProvider};
