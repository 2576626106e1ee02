//! Shaders compiled into the crate by the build script.

use std::sync::OnceLock;

mod spirv_bytes {
    pub static TRIANGLE_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/triangle.vert.spv"));
    pub static TRIANGLE_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/triangle.frag.spv"));
}

/// Reassemble little-endian SPIR-V words; `include_bytes!` gives no
/// alignment guarantee. A trailing partial word is dropped.
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

static TRIANGLE_VERT_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
static TRIANGLE_FRAG_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();

/// Vertex shader taking a `vec2` position at location 0 and a `vec3` color
/// at location 1.
pub fn triangle_vertex() -> &'static [u32] {
    TRIANGLE_VERT_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::TRIANGLE_VERT))
}

/// Fragment shader writing the interpolated vertex color.
pub fn triangle_fragment() -> &'static [u32] {
    TRIANGLE_FRAG_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::TRIANGLE_FRAG))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_shaders_are_spirv() {
        for words in [triangle_vertex(), triangle_fragment()] {
            assert_eq!(words[0], 0x0723_0203, "Invalid SPIR-V magic number");
            assert!(words.len() > 20, "Shader too small");
        }
    }

    #[test]
    fn words_are_little_endian() {
        assert_eq!(bytes_to_spirv(&[0x03, 0x02, 0x23, 0x07, 0xFF]), vec![0x0723_0203]);
    }
}
