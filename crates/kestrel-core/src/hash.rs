//! Order-dependent 64-bit content hashing.
//!
//! Every cacheable description (pipeline state, render pass, framebuffer,
//! descriptor set) is hashed field by field with [`ContentHasher`]. Arrays are
//! hashed element-wise, floats by bit pattern, and object references by their
//! reduced 64-bit id.

use std::hash::Hasher;

use xxhash_rust::xxh3::Xxh3;

/// Incremental XXH3 hasher over little-endian field encodings.
#[derive(Clone)]
pub struct ContentHasher {
    state: Xxh3,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContentHasher").field(&self.finish()).finish()
    }
}

impl ContentHasher {
    /// Create a hasher in its initial state.
    pub fn new() -> Self {
        Self { state: Xxh3::new() }
    }

    /// Create a hasher whose state is seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Xxh3::with_seed(seed),
        }
    }

    /// Mix a 32-bit value.
    pub fn add_u32(&mut self, value: u32) {
        self.state.update(&value.to_le_bytes());
    }

    /// Mix a 64-bit value.
    pub fn add_u64(&mut self, value: u64) {
        self.state.update(&value.to_le_bytes());
    }

    /// Mix a float by its bit pattern.
    pub fn add_f32(&mut self, value: f32) {
        self.add_u32(value.to_bits());
    }

    /// Mix an object id after reducing it to 64 bits.
    pub fn add_id(&mut self, id: u64) {
        self.add_u64(reduce_id(id));
    }

    /// Mix a boolean.
    pub fn add_bool(&mut self, value: bool) {
        self.state.update(&[u8::from(value)]);
    }

    /// Current hash value.
    pub fn finish(&self) -> u64 {
        self.state.digest()
    }
}

/// Lets `#[derive(Hash)]` types feed the same stream.
impl Hasher for ContentHasher {
    fn finish(&self) -> u64 {
        self.state.digest()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }
}

/// Fold the high half of an id into the low half.
pub const fn reduce_id(id: u64) -> u64 {
    id ^ (id >> 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_order_matters() {
        let mut a = ContentHasher::new();
        a.add_u32(1);
        a.add_u32(2);

        let mut b = ContentHasher::new();
        b.add_u32(2);
        b.add_u32(1);

        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn floats_hash_by_bit_pattern() {
        let mut pos = ContentHasher::new();
        pos.add_f32(0.0);
        let mut neg = ContentHasher::new();
        neg.add_f32(-0.0);
        assert_ne!(pos.finish(), neg.finish());

        let mut again = ContentHasher::new();
        again.add_f32(0.0);
        assert_eq!(pos.finish(), again.finish());
    }

    #[test]
    fn seeded_hasher_differs_from_unseeded() {
        assert_ne!(ContentHasher::with_seed(7).finish(), ContentHasher::new().finish());
    }

    #[test]
    fn derived_hash_impls_feed_the_same_stream() {
        use std::hash::Hash;

        let mut derived = ContentHasher::new();
        7u32.hash(&mut derived);
        let mut direct = ContentHasher::new();
        direct.add_u32(7);
        assert_eq!(derived.finish(), direct.finish());
    }

    #[test]
    fn id_reduction_folds_high_bits() {
        assert_eq!(reduce_id(0x0000_0001_0000_0000), 0x0000_0001_0000_0001);
        assert_eq!(reduce_id(42), 42);
    }
}
