//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Errors surfaced by the GPU layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Raw Vulkan error with no dedicated kind.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// Failed to load the Vulkan loader.
    #[error("Failed to load Vulkan: {0}")]
    LoaderUnavailable(String),

    /// No adapter supports both graphics and presentation.
    #[error("No compatible GPU found")]
    NoCompatibleDevice,

    /// The logical device was lost.
    #[error("Device lost")]
    DeviceLost,

    /// Device memory exhausted.
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// Host memory exhausted.
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Mapping device memory failed.
    #[error("Memory mapping failed")]
    MappingFailed,

    /// The window surface is no longer usable.
    #[error("Surface lost")]
    SurfaceLost,

    /// The swapchain no longer matches the surface.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// The swapchain still presents but no longer matches exactly.
    #[error("Swapchain suboptimal")]
    SwapchainSuboptimal,

    /// A shader module could not be created from the supplied code.
    #[error("Shader load failed: {0}")]
    ShaderLoadFailed(String),

    /// The back-end rejected a shader program's stages.
    #[error("Shader compile failed: {0}")]
    ShaderCompileFailed(String),

    /// The back-end rejected a program's layout.
    #[error("Shader link failed: {0}")]
    ShaderLinkFailed(String),

    /// A handle is stale or refers to the wrong kind of object.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// An argument violated a documented limit or precondition.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A single staging request exceeds the per-frame budget.
    #[error("Staging request of {requested} bytes exceeds the {budget} byte frame budget")]
    StagingTooLarge {
        /// Requested size in bytes.
        requested: u64,
        /// Per-frame budget in bytes.
        budget: u64,
    },
}

impl GpuError {
    /// Map a Vulkan result code onto its dedicated error kind.
    pub fn from_vk(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MappingFailed,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            vk::Result::SUBOPTIMAL_KHR => Self::SwapchainSuboptimal,
            vk::Result::ERROR_INCOMPATIBLE_DRIVER | vk::Result::ERROR_INITIALIZATION_FAILED => {
                Self::NoCompatibleDevice
            }
            other => Self::Vulkan(other),
        }
    }

    /// Whether the renderer cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        Self::from_vk(result)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_codes_map_to_dedicated_kinds() {
        assert_eq!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        );
        assert_eq!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            GpuError::SwapchainOutOfDate
        );
        assert_eq!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GpuError::OutOfDeviceMemory
        );
        assert_eq!(
            GpuError::from(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            GpuError::Vulkan(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
        );
    }

    #[test]
    fn only_device_loss_is_fatal() {
        assert!(GpuError::DeviceLost.is_fatal());
        assert!(!GpuError::SwapchainOutOfDate.is_fatal());
    }
}
