//! Opaque object handles.
//!
//! Objects of one kind live in a [`HandleTable`], a slot map whose keys carry
//! a slot version, so a stale handle never resolves to a newer object living
//! in the same slot. A handle pairs that key with its object kind. Its 64-bit
//! form stores the kind in the top 4 bits, the low 28 bits of the version
//! below it and the slot index in the low word.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use slotmap::{Key, KeyData, SlotMap};

const KIND_SHIFT: u32 = 28;
const GENERATION_MASK: u32 = (1 << KIND_SHIFT) - 1;
const KIND_ID_MASK: u32 = (1 << 29) - 1;

slotmap::new_key_type! {
    /// Slot key shared by every handle table.
    pub struct SlotKey;
}

/// Kind of object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ObjectKind {
    Buffer = 0,
    Texture = 1,
    RenderPass = 2,
    ShaderModule = 3,
    ShaderProgram = 4,
    DescriptorSet = 5,
    Framebuffer = 6,
    Pipeline = 7,
    CommandList = 8,
    WindowSurface = 9,
    VertexLayoutSet = 10,
}

impl ObjectKind {
    /// Number of object kinds.
    pub const COUNT: usize = 11;

    const ALL: [Self; Self::COUNT] = [
        Self::Buffer,
        Self::Texture,
        Self::RenderPass,
        Self::ShaderModule,
        Self::ShaderProgram,
        Self::DescriptorSet,
        Self::Framebuffer,
        Self::Pipeline,
        Self::CommandList,
        Self::WindowSurface,
        Self::VertexLayoutSet,
    ];

    fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.get((tag >> KIND_SHIFT) as usize).copied()
    }

    /// Whether objects of this kind live in an object cache.
    pub fn is_cached(self) -> bool {
        matches!(
            self,
            Self::RenderPass | Self::Framebuffer | Self::Pipeline | Self::DescriptorSet
        )
    }
}

/// Untyped handle carrying its object kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle {
    kind: ObjectKind,
    key: SlotKey,
}

impl RawHandle {
    fn new(kind: ObjectKind, key: SlotKey) -> Self {
        Self { kind, key }
    }

    /// Kind of the referenced object.
    pub fn kind(self) -> ObjectKind {
        self.kind
    }

    /// Slot index.
    pub fn index(self) -> u32 {
        self.key.data().as_ffi() as u32
    }

    /// Slot generation, truncated to 28 bits.
    pub fn generation(self) -> u32 {
        (self.key.data().as_ffi() >> 32) as u32 & GENERATION_MASK
    }

    /// 64-bit id that is unique among live handles.
    pub fn to_bits(self) -> u64 {
        let tag = ((self.kind as u32) << KIND_SHIFT) | self.generation();
        (u64::from(tag) << 32) | u64::from(self.index())
    }

    /// Rebuild a handle from [`to_bits`](Self::to_bits). Returns `None` when
    /// the kind tag is unknown.
    pub fn from_bits(bits: u64) -> Option<Self> {
        let tag = (bits >> 32) as u32;
        let kind = ObjectKind::from_tag(tag)?;
        let version = u64::from(tag & GENERATION_MASK);
        let key = KeyData::from_ffi((version << 32) | (bits & 0xFFFF_FFFF));
        Some(Self::new(kind, key.into()))
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}#{}v{}",
            self.kind,
            self.index(),
            self.generation()
        )
    }
}

/// Bookkeeping carried by every device object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectHeader {
    /// Monotonic id across all kinds.
    pub id: u64,
    /// 29-bit id within the object's kind.
    pub kind_id: u32,
    /// Content hash for cached objects, zero otherwise.
    pub hash: u64,
    /// Frame counter value at the last use.
    pub last_frame_used: u32,
}

/// A device object stored in a [`HandleTable`].
pub trait GpuObject {
    /// Kind tag written into this object's handles.
    const KIND: ObjectKind;

    /// Shared bookkeeping.
    fn header(&self) -> &ObjectHeader;

    /// Shared bookkeeping, mutably.
    fn header_mut(&mut self) -> &mut ObjectHeader;
}

/// Typed handle to an object of type `T`.
pub struct Handle<T> {
    raw: RawHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn from_raw_unchecked(raw: RawHandle) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Untyped view of this handle.
    pub fn raw(self) -> RawHandle {
        self.raw
    }

    /// 64-bit id used when hashing references to this object.
    pub fn to_bits(self) -> u64 {
        self.raw.to_bits()
    }
}

impl<T: GpuObject> Handle<T> {
    /// Reinterpret a raw handle, checking its kind.
    pub fn from_raw(raw: RawHandle) -> Option<Self> {
        (raw.kind() == T::KIND).then(|| Self::from_raw_unchecked(raw))
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.raw.fmt(f)
    }
}

impl<T> From<Handle<T>> for RawHandle {
    fn from(handle: Handle<T>) -> Self {
        handle.raw
    }
}

/// Issues monotonic object ids and per-kind ids.
#[derive(Debug, Default)]
pub struct ObjectIds {
    next_id: u64,
    next_kind_id: [u32; ObjectKind::COUNT],
}

impl ObjectIds {
    /// Issue a fresh header for an object of `kind`.
    pub fn issue(&mut self, kind: ObjectKind) -> ObjectHeader {
        let id = self.next_id;
        self.next_id += 1;

        let slot = &mut self.next_kind_id[kind as usize];
        let kind_id = *slot;
        *slot = (*slot + 1) & KIND_ID_MASK;

        ObjectHeader {
            id,
            kind_id,
            hash: 0,
            last_frame_used: 0,
        }
    }
}

/// Versioned storage for one object kind.
pub struct HandleTable<T> {
    slots: SlotMap<SlotKey, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            slots: SlotMap::with_key(),
        }
    }
}

impl<T: GpuObject> HandleTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(key: SlotKey) -> Handle<T> {
        Handle::from_raw_unchecked(RawHandle::new(T::KIND, key))
    }

    /// Store `value` and return its handle.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        Self::handle(self.slots.insert(value))
    }

    /// Resolve a handle.
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots.get(handle.raw.key)
    }

    /// Resolve a handle mutably.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots.get_mut(handle.raw.key)
    }

    /// Whether `handle` refers to a live object.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slots.contains_key(handle.raw.key)
    }

    /// Remove an object, invalidating every copy of its handle.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        self.slots.remove(handle.raw.key)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table holds no objects.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate live objects with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().map(|(key, value)| (Self::handle(key), value))
    }

    /// Remove every object, newest slot first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained: Vec<T> = self.slots.drain().map(|(_, value)| value).collect();
        drained.reverse();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        header: ObjectHeader,
        value: u32,
    }

    impl GpuObject for Dummy {
        const KIND: ObjectKind = ObjectKind::Texture;

        fn header(&self) -> &ObjectHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut ObjectHeader {
            &mut self.header
        }
    }

    fn dummy(value: u32) -> Dummy {
        Dummy {
            header: ObjectHeader::default(),
            value,
        }
    }

    #[test]
    fn handles_carry_their_kind() {
        let mut table = HandleTable::new();
        let handle = table.insert(dummy(1));
        assert_eq!(handle.raw().kind(), ObjectKind::Texture);
        assert!(Handle::<Dummy>::from_raw(handle.raw()).is_some());
    }

    #[test]
    fn bits_round_trip_and_reject_unknown_kinds() {
        let mut table = HandleTable::new();
        table.insert(dummy(1));
        let handle = table.insert(dummy(2));
        assert_eq!(RawHandle::from_bits(handle.to_bits()), Some(handle.raw()));
        assert_eq!(RawHandle::from_bits(u64::MAX), None);
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut table = HandleTable::new();
        let first = table.insert(dummy(1));
        assert_eq!(table.remove(first).map(|d| d.value), Some(1));

        let second = table.insert(dummy(2));
        assert_eq!(first.raw().index(), second.raw().index());
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert_eq!(table.get(second).map(|d| d.value), Some(2));
        assert!(table.remove(first).is_none());
    }

    #[test]
    fn handles_from_another_table_slot_do_not_alias() {
        let mut table = HandleTable::new();
        let handle = table.insert(dummy(1));
        let foreign = RawHandle::from_bits(handle.to_bits() + 1)
            .and_then(Handle::<Dummy>::from_raw)
            .unwrap();
        assert!(!table.contains(foreign));
        assert!(table.contains(handle));
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = HandleTable::new();
        table.insert(dummy(1));
        table.insert(dummy(2));
        let order: Vec<u32> = table.drain().iter().map(|d| d.value).collect();
        assert_eq!(order, vec![2, 1]);
        assert!(table.is_empty());
    }

    #[test]
    fn ids_are_monotonic_and_per_kind() {
        let mut ids = ObjectIds::default();
        let a = ids.issue(ObjectKind::Pipeline);
        let b = ids.issue(ObjectKind::Buffer);
        let c = ids.issue(ObjectKind::Pipeline);
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!((a.kind_id, b.kind_id, c.kind_id), (0, 0, 1));
    }
}
