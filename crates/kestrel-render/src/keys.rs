//! 64-bit sort keys.
//!
//! Each queue type packs its fields so that an ascending integer sort gives
//! the wanted execution order:
//!
//! | Queue          | bits 48..64  | bits 32..48   | bits 16..32   | bits 0..16 |
//! |----------------|--------------|---------------|---------------|------------|
//! | Opaque         | shader       | vertex format | material      | depth      |
//! | Screen overlay | layer        | shader        | material      | reserved   |
//!
//! Alpha-blended keys put 24 bits of inverted depth on top, then 16 bits of
//! shader, 16 of vertex format and 8 of material, so far objects draw first
//! whatever their state.

use glam::{Mat4, Vec3};
use kestrel_core::{reduce_id, ContentHasher};
use kestrel_gpu::{DescriptorResources, DescriptorSetInfo, Handle};

use crate::command::DescriptorBind;

/// Map a float to the top `bits` bits of an unsigned integer that sorts in
/// the same order as the float, negatives and negative zero included.
pub fn depth_to_bits(depth: f32, bits: u32) -> u64 {
    debug_assert!((1..=32).contains(&bits));
    let raw = depth.to_bits();
    let flip = if raw & 0x8000_0000 == 0 {
        0x8000_0000
    } else {
        u32::MAX
    };
    u64::from((raw ^ flip) >> (32 - bits))
}

/// Distance of `position` in front of the camera described by the
/// right-handed `view` matrix. Points behind the camera are negative.
pub fn view_depth(view: Mat4, position: Vec3) -> f32 {
    -view.transform_point3(position).z
}

/// Sixteen bits identifying an object handle.
pub fn handle_bits<T>(handle: Option<Handle<T>>) -> u16 {
    handle.map_or(0, |h| reduce_id(h.to_bits()) as u16)
}

/// Sixteen bits identifying a material binding.
///
/// Retained sets use their handle. Immediate sets hash their contents, so
/// two draws describing the same resources share a bucket.
pub fn material_bits(bind: Option<&DescriptorBind>) -> u16 {
    match bind {
        None => 0,
        Some(DescriptorBind::Retained(set)) => handle_bits(Some(*set)),
        Some(DescriptorBind::Immediate(info)) => {
            let hash = info_hash(info);
            (hash ^ (hash >> 16) ^ (hash >> 32) ^ (hash >> 48)) as u16
        }
    }
}

fn info_hash(info: &DescriptorSetInfo) -> u64 {
    let mut hasher = ContentHasher::new();
    for binding in &info.bindings {
        hasher.add_u32(binding.binding);
        hasher.add_u32(binding.array_start);
        match &binding.resources {
            DescriptorResources::Textures(textures) => {
                hasher.add_u32(0);
                for texture in textures {
                    hasher.add_id(texture.to_bits());
                }
            }
            DescriptorResources::UniformBuffers(ranges) => {
                hasher.add_u32(1);
                for range in ranges {
                    hasher.add_id(range.buffer.to_bits());
                    hasher.add_u64(range.offset);
                    hasher.add_u64(range.size);
                }
            }
        }
    }
    hasher.finish()
}

/// Key for the opaque queue: state first, then front to back.
pub fn opaque_key(shader: u16, vertex_format: u16, material: u16, depth: f32) -> u64 {
    (u64::from(shader) << 48)
        | (u64::from(vertex_format) << 32)
        | (u64::from(material) << 16)
        | depth_to_bits(depth, 16)
}

/// Key for the alpha-blended queue: back to front first, then state.
pub fn alpha_key(shader: u16, vertex_format: u16, material: u16, depth: f32) -> u64 {
    let back_to_front = !depth_to_bits(depth, 24) & 0x00FF_FFFF;
    (back_to_front << 40)
        | (u64::from(shader) << 24)
        | (u64::from(vertex_format) << 8)
        | u64::from(material & 0xFF)
}

/// Key for the screen overlay queue: layer first, then state.
pub fn overlay_key(layer: u16, shader: u16, material: u16) -> u64 {
    (u64::from(layer) << 48) | (u64::from(shader) << 32) | (u64::from(material) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_bits_follow_float_order() {
        let depths = [-100.0, -1.5, -0.0, 0.0, 0.25, 1.0, 5.0, 1.0e6];
        let bits: Vec<u64> = depths.iter().map(|&d| depth_to_bits(d, 32)).collect();
        assert!(bits.windows(2).all(|w| w[0] <= w[1]), "{bits:x?}");
        assert!(depth_to_bits(-0.0, 32) < depth_to_bits(0.0, 32));
    }

    #[test]
    fn truncated_depth_keeps_coarse_order() {
        assert!(depth_to_bits(1.0, 16) < depth_to_bits(5.0, 16));
        assert!(depth_to_bits(5.0, 16) < depth_to_bits(10.0, 16));
        assert_eq!(depth_to_bits(1.0, 16), 0xBF80);
    }

    #[test]
    fn view_depth_measures_along_the_view_direction() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        approx::assert_relative_eq!(view_depth(view, Vec3::ZERO), 10.0);
        approx::assert_relative_eq!(view_depth(view, Vec3::new(3.0, -2.0, 4.0)), 6.0);
        assert!(view_depth(view, Vec3::new(0.0, 0.0, 12.0)) < 0.0);
    }

    #[test]
    fn opaque_key_layout() {
        let key = opaque_key(1, 2, 3, 1.0);
        insta::assert_snapshot!(format!("{key:#018x}"), @"0x000100020003bf80");
    }

    #[test]
    fn alpha_key_puts_far_objects_first() {
        let near = alpha_key(0, 0, 0, 2.0);
        let far = alpha_key(0, 0, 0, 8.0);
        assert!(far < near);
        // Depth dominates state.
        assert!(alpha_key(u16::MAX, u16::MAX, 0xFF, 8.0) < alpha_key(0, 0, 0, 2.0));
    }

    #[test]
    fn alpha_key_keeps_eight_material_bits() {
        assert_eq!(alpha_key(0, 0, 0x1234, 0.0) & 0xFF, 0x34);
    }

    #[test]
    fn overlay_layer_dominates() {
        assert!(overlay_key(1, u16::MAX, u16::MAX) < overlay_key(2, 0, 0));
        insta::assert_snapshot!(format!("{:#018x}", overlay_key(3, 4, 5)), @"0x0003000400050000");
    }

    #[test]
    fn equal_immediate_sets_share_material_bits() {
        let a = DescriptorBind::Immediate(DescriptorSetInfo::new());
        let b = DescriptorBind::Immediate(DescriptorSetInfo::new());
        assert_eq!(material_bits(Some(&a)), material_bits(Some(&b)));
        assert_eq!(material_bits(None), 0);
    }
}
