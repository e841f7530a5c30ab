use ash::{prelude::VkResult, vk};
use thiserror::Error;

use crate::Device;

#[derive(Debug, Error)]
pub enum ShaderCompileError {
    #[cfg(feature = "glsl")]
    #[error("shaderc error: {0}")]
    Shaderc(#[from] shaderc::Error),
    #[error("shaderc unavailable")]
    CompilerUnavailable,
}

#[cfg(feature = "glsl")]
#[derive(Clone, Copy, Debug)]
pub enum ShaderStage {
    Compute,
    Vertex,
    Fragment,
}

/// Compile one self-contained GLSL 460 source to SPIR-V.
#[cfg(feature = "glsl")]
pub fn compile_glsl(
    source: &str,
    stage: ShaderStage,
    file_name: &str,
    defines: &[(&str, &str)],
) -> Result<Vec<u32>, ShaderCompileError> {
    use shaderc::{CompileOptions, Compiler, ShaderKind};
    let kind = match stage {
        ShaderStage::Compute => ShaderKind::Compute,
        ShaderStage::Vertex => ShaderKind::Vertex,
        ShaderStage::Fragment => ShaderKind::Fragment,
    };
    let compiler = Compiler::new().ok_or(ShaderCompileError::CompilerUnavailable)?;
    let mut options = CompileOptions::new().ok_or(ShaderCompileError::CompilerUnavailable)?;
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        vk::make_api_version(0, 1, 2, 0),
    );
    options.set_source_language(shaderc::SourceLanguage::GLSL);
    options.set_forced_version_profile(460, shaderc::GlslProfile::Core);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);
    for (name, value) in defines {
        options.add_macro_definition(name, Some(value));
    }
    let binary = compiler.compile_into_spirv(source, kind, file_name, "main", Some(&options))?;
    Ok(binary.as_binary().to_vec())
}

pub fn create_shader_module(device: &Device, spirv: &[u32]) -> VkResult<vk::ShaderModule> {
    unsafe {
        device.create_shader_module(
            &vk::ShaderModuleCreateInfo {
                code_size: std::mem::size_of_val(spirv),
                p_code: spirv.as_ptr(),
                ..Default::default()
            },
            None,
        )
    }
}
