//! Device configuration.

use kestrel_core::limits::MAX_FRAMES_IN_FLIGHT;
use serde::{Deserialize, Serialize};

use crate::adapter::AdapterPreference;
use crate::descriptor_pool::DescriptorCapacity;
use crate::error::{GpuError, Result};

/// Tunables of a [`GpuDevice`](crate::GpuDevice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Frames a cached object may go unused before it is collected.
    pub gc_frame_threshold: u32,
    /// Staging bytes per in-flight frame.
    pub staging_bytes_per_frame: u64,
    /// Minimum size of one device memory page.
    pub memory_page_size: u64,
    /// Capacity of each descriptor pool link.
    pub descriptor_pool_capacity: DescriptorCapacity,
    /// Present with FIFO.
    pub vsync: bool,
    pub adapter_preference: AdapterPreference,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            gc_frame_threshold: 60,
            staging_bytes_per_frame: 16 * 1024 * 1024,
            memory_page_size: 64 * 1024 * 1024,
            descriptor_pool_capacity: DescriptorCapacity::default(),
            vsync: false,
            adapter_preference: AdapterPreference::default(),
        }
    }
}

impl DeviceConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(GpuError::InvalidArgument(format!(
                "frames_in_flight must be within 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.gc_frame_threshold == 0 {
            return Err(GpuError::InvalidArgument(
                "gc_frame_threshold must be non-zero".into(),
            ));
        }
        if self.staging_bytes_per_frame == 0 || self.memory_page_size == 0 {
            return Err(GpuError::InvalidArgument(
                "staging and page sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.gc_frame_threshold, 60);
        assert_eq!(config.adapter_preference, AdapterPreference::FirstDiscrete);
    }

    #[test]
    fn frames_in_flight_is_bounded() {
        let config = DeviceConfig {
            frames_in_flight: 4,
            ..DeviceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(GpuError::InvalidArgument(_))
        ));
    }
}
