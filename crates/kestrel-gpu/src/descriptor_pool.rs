//! Chain of descriptor pools that packs many small sets into a few large
//! back-end pools.
//!
//! Each link tracks how many textures, uniforms and sets it can still hand
//! out and how many of its sets are alive. A link whose last set is freed is
//! unlinked and its pool destroyed.

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::error::{GpuError, Result};
use crate::resources::DescriptorDemand;

/// Descriptor counts held by one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorCapacity {
    pub textures: u32,
    pub uniforms: u32,
    pub sets: u32,
}

impl Default for DescriptorCapacity {
    fn default() -> Self {
        Self {
            textures: 64,
            uniforms: 64,
            sets: 32,
        }
    }
}

impl DescriptorCapacity {
    fn covers(&self, demand: &DescriptorDemand) -> bool {
        self.textures >= demand.textures && self.uniforms >= demand.uniforms && self.sets >= 1
    }

    /// Elementwise maximum of `self` and one set's `demand`.
    pub fn grown_for(&self, demand: &DescriptorDemand) -> Self {
        Self {
            textures: self.textures.max(demand.textures),
            uniforms: self.uniforms.max(demand.uniforms),
            sets: self.sets.max(1),
        }
    }
}

#[derive(Debug)]
struct DescriptorLink {
    id: u64,
    pool: vk::DescriptorPool,
    left: DescriptorCapacity,
    active: u32,
}

/// Linked pools, newest first.
#[derive(Debug)]
pub struct DescriptorPoolChain {
    links: Vec<DescriptorLink>,
    capacity: DescriptorCapacity,
    next_id: u64,
}

impl DescriptorPoolChain {
    /// Create an empty chain whose pools hold at least `capacity`.
    pub fn new(capacity: DescriptorCapacity) -> Self {
        Self {
            links: Vec::new(),
            capacity,
            next_id: 1,
        }
    }

    /// Number of live links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no pool exists.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Live sets allocated from link `id`.
    pub fn active_sets(&self, id: u64) -> Option<u32> {
        self.links.iter().find(|l| l.id == id).map(|l| l.active)
    }

    fn find_link(&self, demand: &DescriptorDemand) -> Option<usize> {
        self.links.iter().position(|link| link.left.covers(demand))
    }

    fn push_link(&mut self, pool: vk::DescriptorPool, capacity: DescriptorCapacity) -> usize {
        self.links.insert(
            0,
            DescriptorLink {
                id: self.next_id,
                pool,
                left: capacity,
                active: 0,
            },
        );
        self.next_id += 1;
        0
    }

    fn charge(&mut self, index: usize, demand: &DescriptorDemand) -> u64 {
        let link = &mut self.links[index];
        link.left.textures -= demand.textures;
        link.left.uniforms -= demand.uniforms;
        link.left.sets -= 1;
        link.active += 1;
        link.id
    }

    fn exhaust(&mut self, index: usize) {
        self.links[index].left = DescriptorCapacity {
            textures: 0,
            uniforms: 0,
            sets: 0,
        };
    }

    /// Unlink link `index` if none of its sets are alive, returning its pool.
    fn discard_unused(&mut self, index: usize) -> Option<vk::DescriptorPool> {
        if self.links.get(index)?.active > 0 {
            return None;
        }
        Some(self.links.remove(index).pool)
    }

    /// Drop one set from link `id`, returning the pool to destroy once the
    /// link has no live sets.
    pub fn release(&mut self, id: u64) -> Option<vk::DescriptorPool> {
        let index = self.links.iter().position(|l| l.id == id)?;
        let link = &mut self.links[index];
        link.active = link.active.saturating_sub(1);

        if link.active == 0 {
            let link = self.links.remove(index);
            tracing::debug!("Descriptor link {} drained, destroying its pool", link.id);
            Some(link.pool)
        } else {
            None
        }
    }

    /// Allocate a set with `layout`, growing the chain when no link fits.
    ///
    /// # Safety
    /// The device and layout must be valid.
    pub unsafe fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
        demand: &DescriptorDemand,
    ) -> Result<(vk::DescriptorSet, u64)> {
        if let Some(index) = self.find_link(demand) {
            match allocate_set(device, self.links[index].pool, layout) {
                Ok(set) => return Ok((set, self.charge(index, demand))),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                    self.exhaust(index);
                }
                Err(err) => return Err(GpuError::from_vk(err)),
            }
        }

        let capacity = self.capacity.grown_for(demand);
        let pool = create_pool(device, &capacity)?;
        let index = self.push_link(pool, capacity);
        tracing::debug!(
            "Descriptor chain grew to {} links ({} textures, {} uniforms, {} sets)",
            self.links.len(),
            capacity.textures,
            capacity.uniforms,
            capacity.sets
        );

        match allocate_set(device, pool, layout) {
            Ok(set) => Ok((set, self.charge(index, demand))),
            Err(err) => {
                if let Some(pool) = self.discard_unused(index) {
                    device.destroy_descriptor_pool(pool, None);
                }
                Err(GpuError::from_vk(err))
            }
        }
    }

    /// Destroy every pool regardless of live sets.
    ///
    /// # Safety
    /// No set from the chain may be in use.
    pub unsafe fn destroy_all(&mut self, device: &ash::Device) {
        for link in self.links.drain(..) {
            device.destroy_descriptor_pool(link.pool, None);
        }
    }
}

unsafe fn create_pool(device: &ash::Device, capacity: &DescriptorCapacity) -> Result<vk::DescriptorPool> {
    let pool_sizes: Vec<vk::DescriptorPoolSize> = [
        (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, capacity.textures),
        (vk::DescriptorType::UNIFORM_BUFFER, capacity.uniforms),
    ]
    .into_iter()
    .filter(|&(_, count)| count > 0)
    .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
        ty,
        descriptor_count,
    })
    .collect();

    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(capacity.sets)
        .pool_sizes(&pool_sizes);

    let pool = device.create_descriptor_pool(&create_info, None)?;
    Ok(pool)
}

unsafe fn allocate_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> std::result::Result<vk::DescriptorSet, vk::Result> {
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    let sets = device.allocate_descriptor_sets(&alloc_info)?;
    sets.first().copied().ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demand(textures: u32, uniforms: u32) -> DescriptorDemand {
        DescriptorDemand { textures, uniforms }
    }

    fn small() -> DescriptorCapacity {
        DescriptorCapacity {
            textures: 4,
            uniforms: 2,
            sets: 2,
        }
    }

    #[test]
    fn first_fitting_link_is_charged() {
        let mut chain = DescriptorPoolChain::new(small());
        let index = chain.push_link(vk::DescriptorPool::null(), small());
        let id = chain.charge(index, &demand(3, 1));

        assert_eq!(chain.find_link(&demand(1, 1)), Some(0));
        assert_eq!(chain.find_link(&demand(2, 0)), None);
        assert_eq!(chain.active_sets(id), Some(1));

        chain.charge(0, &demand(1, 1));
        assert_eq!(chain.find_link(&demand(0, 0)), None);
    }

    #[test]
    fn new_links_grow_to_the_demand() {
        let chain = DescriptorPoolChain::new(small());
        let capacity = chain.capacity.grown_for(&demand(10, 1));
        assert_eq!(
            capacity,
            DescriptorCapacity {
                textures: 10,
                uniforms: 2,
                sets: 2
            }
        );
    }

    #[test]
    fn newest_link_is_searched_first() {
        let mut chain = DescriptorPoolChain::new(small());
        chain.push_link(vk::DescriptorPool::null(), small());
        chain.push_link(vk::DescriptorPool::null(), small());
        let id = chain.charge(0, &demand(1, 0));
        assert_eq!(id, 2);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn drained_links_are_destroyed() {
        let mut chain = DescriptorPoolChain::new(small());
        chain.push_link(vk::DescriptorPool::null(), small());
        let a = chain.charge(0, &demand(1, 0));
        let b = chain.charge(0, &demand(1, 0));
        assert_eq!(a, b);

        assert!(chain.release(a).is_none());
        assert!(chain.release(a).is_some());
        assert!(chain.is_empty());
        assert!(chain.release(a).is_none());
    }

    #[test]
    fn unused_links_can_be_discarded() {
        let mut chain = DescriptorPoolChain::new(small());
        chain.push_link(vk::DescriptorPool::null(), small());
        chain.charge(0, &demand(1, 0));
        let fresh = chain.push_link(vk::DescriptorPool::null(), small());

        assert!(chain.discard_unused(fresh).is_some());
        assert_eq!(chain.len(), 1);
        assert!(chain.discard_unused(0).is_none());
        assert_eq!(chain.len(), 1);
        assert!(chain.discard_unused(5).is_none());
    }

    #[test]
    fn exhausted_links_are_skipped() {
        let mut chain = DescriptorPoolChain::new(small());
        chain.push_link(vk::DescriptorPool::null(), small());
        chain.exhaust(0);
        assert_eq!(chain.find_link(&demand(0, 0)), None);
    }
}
