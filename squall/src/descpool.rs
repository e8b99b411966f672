// Descriptor set allocators
//
// Two disciplines exist. The dynamic allocator hands out sets that
// live one frame: it keeps a sub-allocator per frame in flight and
// resets the sub-allocator of a frame slot when the scheduler
// reuses it. The static allocator hands out long-lived sets that
// are individually freed back to the pool they came from.
use ash::vk;
use std::collections::HashMap;

use crate::deletion_queue::DeletionQueue;
use crate::{DescriptorType, Result, SquallError};
use utils::log;

/// Per-descriptor-type maxima and the set count a single pool is
/// created with
#[derive(Clone)]
pub struct DescriptorPoolSizes {
    pub counts: Vec<(DescriptorType, u32)>,
    pub max_sets: u32,
}

fn create_pool(
    dev: &ash::Device,
    sizes: &DescriptorPoolSizes,
    free_individual: bool,
) -> Result<vk::DescriptorPool> {
    let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
        .counts
        .iter()
        .map(|(ty, count)| {
            vk::DescriptorPoolSize::builder()
                .ty(ty.to_vk())
                .descriptor_count(*count)
                .build()
        })
        .collect();

    let mut info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(sizes.max_sets);
    if free_individual {
        // we want to be able to free descriptor sets individually
        info = info.flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
    }

    unsafe {
        dev.create_descriptor_pool(&info, None).map_err(|_| {
            log::error!("Cannot create descriptor pool");
            SquallError::OUT_OF_VRAM
        })
    }
}

fn try_allocate(
    dev: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> Option<vk::DescriptorSet> {
    let layouts = [layout];
    let info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    match unsafe { dev.allocate_descriptor_sets(&info) } {
        Ok(sets) => Some(sets[0]),
        Err(_) => None,
    }
}

// ---------------- Single-frame sub-allocator ----------------

struct FrameAllocatorPools {
    free_pools: Vec<vk::DescriptorPool>,
    exhausted_pools: Vec<vk::DescriptorPool>,
}

impl FrameAllocatorPools {
    fn new() -> Self {
        Self {
            free_pools: Vec::new(),
            exhausted_pools: Vec::new(),
        }
    }

    fn allocate(
        &mut self,
        dev: &ash::Device,
        sizes: &DescriptorPoolSizes,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        while let Some(pool) = self.free_pools.last().copied() {
            if let Some(set) = try_allocate(dev, pool, layout) {
                return Ok(set);
            }
            self.free_pools.pop();
            self.exhausted_pools.push(pool);
        }
        let pool = create_pool(dev, sizes, false)?;
        self.free_pools.push(pool);
        match try_allocate(dev, pool, layout) {
            Some(set) => Ok(set),
            None => {
                log::error!("Descriptor pool exhausted.");
                Err(SquallError::OUT_OF_VRAM)
            }
        }
    }

    /// Reset every pool and move the exhausted ones back into
    /// rotation. Sets allocated from this sub-allocator die here.
    fn reset(&mut self, dev: &ash::Device) {
        unsafe {
            for pool in self.free_pools.iter() {
                dev.reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())
                    .unwrap();
            }
            for pool in self.exhausted_pools.drain(..) {
                dev.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
                    .unwrap();
                self.free_pools.push(pool);
            }
        }
    }

    fn release(&mut self, dev: &ash::Device, queue: &mut DeletionQueue) {
        for pool in self
            .free_pools
            .drain(..)
            .chain(self.exhausted_pools.drain(..))
        {
            let raw_dev = dev.clone();
            queue.push(Box::new(move || unsafe {
                raw_dev.destroy_descriptor_pool(pool, None);
            }));
        }
    }
}

// ---------------- Dynamic allocator ----------------

/// Sets from this allocator must not be referenced beyond the
/// frame in which they were allocated
pub struct DynamicDescriptorAllocator {
    sizes: DescriptorPoolSizes,
    allocators: Vec<FrameAllocatorPools>,
}

impl DynamicDescriptorAllocator {
    pub fn new(sizes: DescriptorPoolSizes, frames_in_flight: usize) -> Self {
        let mut allocators = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            allocators.push(FrameAllocatorPools::new());
        }
        Self {
            sizes: sizes,
            allocators: allocators,
        }
    }

    pub fn allocate(
        &mut self,
        dev: &ash::Device,
        frame: usize,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let sizes = self.sizes.clone();
        self.allocators[frame].allocate(dev, &sizes, layout)
    }

    /// Called by the scheduler once `frame`'s fence was observed
    pub fn reset(&mut self, dev: &ash::Device, frame: usize) {
        self.allocators[frame].reset(dev);
    }

    /// All pools go through the deletion queue at shutdown
    pub fn release(&mut self, dev: &ash::Device, queue: &mut DeletionQueue) {
        for allocator in self.allocators.iter_mut() {
            allocator.release(dev, queue);
        }
    }
}

// ---------------- Static allocator ----------------

/// Long-lived sets, freed individually back to their origin pool
pub struct StaticDescriptorAllocator {
    sizes: DescriptorPoolSizes,
    free_pools: Vec<vk::DescriptorPool>,
    exhausted_pools: Vec<vk::DescriptorPool>,
    /// Which pool each live set was allocated from
    pool_table: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
}

impl StaticDescriptorAllocator {
    pub fn new(sizes: DescriptorPoolSizes) -> Self {
        Self {
            sizes: sizes,
            free_pools: Vec::new(),
            exhausted_pools: Vec::new(),
            pool_table: HashMap::new(),
        }
    }

    pub fn allocate(
        &mut self,
        dev: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        while let Some(pool) = self.free_pools.last().copied() {
            if let Some(set) = try_allocate(dev, pool, layout) {
                self.pool_table.insert(set, pool);
                return Ok(set);
            }
            self.free_pools.pop();
            self.exhausted_pools.push(pool);
        }
        let pool = create_pool(dev, &self.sizes, true)?;
        self.free_pools.push(pool);
        match try_allocate(dev, pool, layout) {
            Some(set) => {
                self.pool_table.insert(set, pool);
                Ok(set)
            }
            None => {
                log::error!("Descriptor pool exhausted.");
                Err(SquallError::OUT_OF_VRAM)
            }
        }
    }

    pub fn free(&mut self, dev: &ash::Device, set: vk::DescriptorSet) {
        let pool = match self.pool_table.remove(&set) {
            Some(p) => p,
            None => {
                log::error!("Freed a descriptor set not allocated from this allocator.");
                return;
            }
        };
        unsafe {
            dev.free_descriptor_sets(pool, &[set]).unwrap();
        }
        // A previously exhausted pool has room again
        if let Some(index) = self.exhausted_pools.iter().position(|p| *p == pool) {
            self.exhausted_pools.swap_remove(index);
            self.free_pools.push(pool);
        }
    }

    pub fn release(&mut self, dev: &ash::Device, queue: &mut DeletionQueue) {
        for pool in self
            .free_pools
            .drain(..)
            .chain(self.exhausted_pools.drain(..))
        {
            let raw_dev = dev.clone();
            queue.push(Box::new(move || unsafe {
                raw_dev.destroy_descriptor_pool(pool, None);
            }));
        }
        self.pool_table.clear();
    }
}
