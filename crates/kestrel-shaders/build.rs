//! Build script compiling the built-in GLSL shaders to SPIR-V.

use shaderc::{Compiler, ShaderKind};
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();
    let shader_dir = Path::new("shaders");

    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for (name, kind) in [
        ("triangle.vert", ShaderKind::Vertex),
        ("triangle.frag", ShaderKind::Fragment),
    ] {
        compile_shader(
            &compiler,
            &shader_dir.join(name),
            &Path::new(&out_dir).join(format!("{name}.spv")),
            kind,
        );
    }
}

fn compile_shader(compiler: &Compiler, input: &Path, output: &Path, kind: ShaderKind) {
    let source = fs::read_to_string(input)
        .unwrap_or_else(|e| panic!("Failed to read shader {:?}: {}", input, e));
    let file_name = input.file_name().unwrap().to_str().unwrap();

    let mut options = shaderc::CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    options.set_optimization_level(shaderc::OptimizationLevel::Size);

    let result = compiler
        .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {:?}: {}", input, e));

    if result.get_num_warnings() > 0 {
        println!(
            "cargo:warning=Shader warnings in {:?}: {}",
            input,
            result.get_warning_messages()
        );
    }

    fs::write(output, bytemuck::cast_slice::<u32, u8>(result.as_binary()))
        .unwrap_or_else(|e| panic!("Failed to write shader {:?}: {}", output, e));
}
