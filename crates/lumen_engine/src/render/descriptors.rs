//! Descriptor set allocation and resource binding
//!
//! Three cooperating pieces:
//!
//! - [`DescriptorAllocator`] hands out sets from a growing list of pools. When
//!   the current pool is exhausted or fragmented it moves to a recycled or new
//!   pool and retries once.
//! - [`DescriptorLayoutCache`] deduplicates set layouts by their sorted
//!   bindings, so equal binding sets always resolve to one layout handle.
//! - [`DescriptorBuilder`] collects bindings and writes, then resolves the
//!   layout, allocates the set and writes it in one step.
//!
//! Pools are never reset behind the caller's back; call
//! [`DescriptorAllocator::reset_pools`] when every set it handed out is dead.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use super::backend::{DescriptorBinding, DescriptorResource, DescriptorWrite};
use super::device::Device;
use super::error::{VulkanError, VulkanResult};
use crate::config::DescriptorPoolConfig;

/// Descriptors per set, by type, used to size each new pool
#[derive(Debug, Clone)]
pub struct PoolSizes {
    /// `(type, descriptors per set)` pairs
    pub sizes: Vec<(vk::DescriptorType, f32)>,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self::from(&DescriptorPoolConfig::default())
    }
}

impl From<&DescriptorPoolConfig> for PoolSizes {
    fn from(config: &DescriptorPoolConfig) -> Self {
        Self {
            sizes: vec![
                (vk::DescriptorType::UNIFORM_BUFFER, config.uniform_buffer_ratio),
                (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, config.uniform_buffer_dynamic_ratio),
                (vk::DescriptorType::STORAGE_BUFFER, config.storage_buffer_ratio),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, config.combined_image_sampler_ratio),
            ],
        }
    }
}

impl PoolSizes {
    fn for_sets(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        self.sizes
            .iter()
            .map(|&(ty, ratio)| vk::DescriptorPoolSize {
                ty,
                descriptor_count: ((ratio * sets as f32) as u32).max(1),
            })
            .collect()
    }
}

/// Pool-backed descriptor set allocator
pub struct DescriptorAllocator {
    device: Arc<Device>,
    pool_sizes: PoolSizes,
    sets_per_pool: u32,
    current_pool: vk::DescriptorPool,
    used_pools: Vec<vk::DescriptorPool>,
    free_pools: Vec<vk::DescriptorPool>,
}

impl DescriptorAllocator {
    /// Allocator sized from configuration
    pub fn new(device: &Arc<Device>, config: &DescriptorPoolConfig) -> Self {
        Self::with_pool_sizes(device, config.sets_per_pool, PoolSizes::from(config))
    }

    /// Allocator with explicit sizing
    pub fn with_pool_sizes(device: &Arc<Device>, sets_per_pool: u32, pool_sizes: PoolSizes) -> Self {
        Self {
            device: Arc::clone(device),
            pool_sizes,
            sets_per_pool,
            current_pool: vk::DescriptorPool::null(),
            used_pools: Vec::new(),
            free_pools: Vec::new(),
        }
    }

    /// Device the allocator creates pools on
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn grab_pool(&mut self) -> VulkanResult<vk::DescriptorPool> {
        let pool = match self.free_pools.pop() {
            Some(pool) => pool,
            None => {
                let sizes = self.pool_sizes.for_sets(self.sets_per_pool);
                let pool = self
                    .device
                    .raw()
                    .create_descriptor_pool(self.sets_per_pool, &sizes)?;
                log::debug!(
                    "Created descriptor pool #{} ({} sets)",
                    self.used_pools.len() + 1,
                    self.sets_per_pool
                );
                pool
            }
        };
        self.used_pools.push(pool);
        self.current_pool = pool;
        Ok(pool)
    }

    /// Allocate one set, moving to a fresh pool once if the current one is full
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        if self.current_pool == vk::DescriptorPool::null() {
            self.grab_pool()?;
        }

        match self.device.raw().allocate_descriptor_set(self.current_pool, layout) {
            Ok(set) => Ok(set),
            Err(vk::Result::ERROR_FRAGMENTED_POOL | vk::Result::ERROR_OUT_OF_POOL_MEMORY) => {
                log::debug!("Descriptor pool exhausted, retrying in a fresh pool");
                let pool = self.grab_pool()?;
                self.device
                    .raw()
                    .allocate_descriptor_set(pool, layout)
                    .map_err(VulkanError::DescriptorAllocation)
            }
            Err(e) => Err(VulkanError::DescriptorAllocation(e)),
        }
    }

    /// Return every pool to the free list; all sets handed out become invalid
    pub fn reset_pools(&mut self) -> VulkanResult<()> {
        for pool in &self.used_pools {
            self.device.raw().reset_descriptor_pool(*pool)?;
        }
        self.free_pools.append(&mut self.used_pools);
        self.current_pool = vk::DescriptorPool::null();
        Ok(())
    }

    /// Pools currently handing out sets
    pub fn used_pool_count(&self) -> usize {
        self.used_pools.len()
    }

    /// Reset pools waiting for reuse
    pub fn free_pool_count(&self) -> usize {
        self.free_pools.len()
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        for pool in self.used_pools.drain(..).chain(self.free_pools.drain(..)) {
            self.device.raw().destroy_descriptor_pool(pool);
        }
    }
}

/// Structural identity of a set layout: bindings sorted by index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorLayoutKey {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorLayoutKey {
    /// Normalize a binding list
    pub fn new(bindings: &[DescriptorBinding]) -> Self {
        let mut bindings = bindings.to_vec();
        bindings.sort_by_key(|b| b.binding);
        Self { bindings }
    }

    /// Sorted bindings
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }
}

/// Deduplicating store of descriptor set layouts
pub struct DescriptorLayoutCache {
    device: Arc<Device>,
    layouts: HashMap<DescriptorLayoutKey, vk::DescriptorSetLayout>,
}

impl DescriptorLayoutCache {
    /// Empty cache
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
            layouts: HashMap::new(),
        }
    }

    /// Layout for `bindings`, created on first request
    pub fn create_descriptor_layout(&mut self, bindings: &[DescriptorBinding]) -> VulkanResult<vk::DescriptorSetLayout> {
        let key = DescriptorLayoutKey::new(bindings);
        if let Some(layout) = self.layouts.get(&key) {
            return Ok(*layout);
        }
        let layout = self
            .device
            .raw()
            .create_descriptor_set_layout(key.bindings())?;
        self.layouts.insert(key, layout);
        Ok(layout)
    }

    /// Number of distinct layouts
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Whether no layout was created yet
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

impl Drop for DescriptorLayoutCache {
    fn drop(&mut self) {
        for (_, layout) in self.layouts.drain() {
            self.device.raw().destroy_descriptor_set_layout(layout);
        }
    }
}

/// Fluent descriptor set construction
pub struct DescriptorBuilder<'a> {
    cache: &'a mut DescriptorLayoutCache,
    allocator: &'a mut DescriptorAllocator,
    bindings: Vec<DescriptorBinding>,
    writes: Vec<(u32, vk::DescriptorType, DescriptorResource)>,
}

impl<'a> DescriptorBuilder<'a> {
    /// Start a set
    pub fn begin(cache: &'a mut DescriptorLayoutCache, allocator: &'a mut DescriptorAllocator) -> Self {
        Self {
            cache,
            allocator,
            bindings: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Bind a buffer range
    pub fn bind_buffer(mut self, binding: u32, info: vk::DescriptorBufferInfo, descriptor_type: vk::DescriptorType, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings
            .push(DescriptorBinding::new(binding, descriptor_type, stage_flags));
        self.writes
            .push((binding, descriptor_type, DescriptorResource::Buffer(info)));
        self
    }

    /// Bind a sampled image
    pub fn bind_image(mut self, binding: u32, info: vk::DescriptorImageInfo, descriptor_type: vk::DescriptorType, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings
            .push(DescriptorBinding::new(binding, descriptor_type, stage_flags));
        self.writes
            .push((binding, descriptor_type, DescriptorResource::Image(info)));
        self
    }

    /// Resolve the layout, allocate a set and write every binding
    pub fn build(self) -> VulkanResult<(vk::DescriptorSet, vk::DescriptorSetLayout)> {
        let layout = self.cache.create_descriptor_layout(&self.bindings)?;
        let set = self.allocator.allocate(layout)?;
        let writes: Vec<DescriptorWrite> = self
            .writes
            .iter()
            .map(|&(binding, descriptor_type, resource)| DescriptorWrite {
                set,
                binding,
                descriptor_type,
                resource,
            })
            .collect();
        self.allocator.device().raw().update_descriptor_sets(&writes);
        Ok((set, layout))
    }
}
