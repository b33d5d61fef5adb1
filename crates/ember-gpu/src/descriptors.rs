//! Descriptor set allocation and updates.
//!
//! This module provides:
//! - [`DescriptorLayoutBuilder`] for assembling descriptor set layouts
//! - [`DescriptorAllocator`], a single fixed-capacity pool
//! - [`GrowableDescriptorAllocator`], a pool-of-pools allocator that grows
//!   on demand and recycles exhausted pools
//! - [`DescriptorWriter`] for batching descriptor updates
//!
//! The allocators and writer are generic over [`DescriptorDevice`], the
//! small driver surface they need. `ash::Device` implements it; tests run
//! against a counting fake.

use std::ffi::c_void;
use std::ptr;

use crate::error::Result;
use ash::prelude::VkResult;
use ash::vk;

/// Per-type scaling factor used to size descriptor pools.
///
/// A pool created for `n` sets reserves `ratio * n` descriptors of
/// `descriptor_type`.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizeRatio {
    pub descriptor_type: vk::DescriptorType,
    pub ratio: f32,
}

/// Driver surface needed by the descriptor types.
///
/// Implemented by `ash::Device`. Keeping the allocators generic over this
/// trait lets the pool bookkeeping be exercised without a live driver.
pub trait DescriptorDevice {
    /// Create a descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    unsafe fn create_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;

    /// Destroy a descriptor pool and every set allocated from it.
    ///
    /// # Safety
    /// The pool must not be in use.
    unsafe fn destroy_pool(&self, pool: vk::DescriptorPool);

    /// Reset a descriptor pool, invalidating every set allocated from it.
    ///
    /// # Safety
    /// No set from the pool may still be in use by the GPU.
    unsafe fn reset_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;

    /// Allocate one descriptor set from a pool.
    ///
    /// # Safety
    /// The pool and layout must be valid; `p_next` must be null or point to
    /// a valid extension chain for set allocation.
    unsafe fn allocate_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        p_next: *const c_void,
    ) -> VkResult<vk::DescriptorSet>;

    /// Create a descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid; `p_next` must be null or point to a valid
    /// extension chain for layout creation.
    unsafe fn create_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        flags: vk::DescriptorSetLayoutCreateFlags,
        p_next: *const c_void,
    ) -> VkResult<vk::DescriptorSetLayout>;

    /// Submit a batch of descriptor writes.
    ///
    /// # Safety
    /// Every write must reference live resources and a live set.
    unsafe fn update_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);
}

impl DescriptorDevice for ash::Device {
    unsafe fn create_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        self.create_descriptor_pool(&pool_info, None)
    }

    unsafe fn destroy_pool(&self, pool: vk::DescriptorPool) {
        self.destroy_descriptor_pool(pool, None);
    }

    unsafe fn reset_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        self.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
    }

    unsafe fn allocate_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        p_next: *const c_void,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        alloc_info.p_next = p_next;

        let sets = self.allocate_descriptor_sets(&alloc_info)?;
        sets.first().copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn create_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        flags: vk::DescriptorSetLayoutCreateFlags,
        p_next: *const c_void,
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(bindings)
            .flags(flags);
        layout_info.p_next = p_next;

        self.create_descriptor_set_layout(&layout_info, None)
    }

    unsafe fn update_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        self.update_descriptor_sets(writes, &[]);
    }
}

fn pool_sizes_for(ratios: &[PoolSizeRatio], set_count: u32) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|ratio| vk::DescriptorPoolSize {
            ty: ratio.descriptor_type,
            descriptor_count: (ratio.ratio * set_count as f32) as u32,
        })
        .collect()
}

/// Descriptor set layout builder.
///
/// Accumulates bindings, then stamps a shared stage mask onto all of them
/// at build time. Duplicate binding indices are not rejected here; the
/// validation layer flags them at build time.
pub struct DescriptorLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Append a binding with a descriptor count of one.
    pub fn add_binding(&mut self, binding: u32, descriptor_type: vk::DescriptorType) -> &mut Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_count(1)
                .descriptor_type(descriptor_type),
        );
        self
    }

    /// Discard accumulated bindings so the builder can be reused.
    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    /// Number of accumulated bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the builder holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Build a descriptor set layout.
    ///
    /// `shader_stages` is ORed into every accumulated binding's stage
    /// flags. Returns the raw handle; the caller is responsible for
    /// wrapping it (see [`DescriptorSetLayout::from_raw`]) or destroying it.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build<D: DescriptorDevice>(
        &mut self,
        device: &D,
        shader_stages: vk::ShaderStageFlags,
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout> {
        self.build_with_next(device, shader_stages, ptr::null(), flags)
    }

    /// Build a descriptor set layout with an extension chain.
    ///
    /// # Safety
    /// The device must be valid; `p_next` must be null or point to a valid
    /// extension chain for layout creation.
    pub unsafe fn build_with_next<D: DescriptorDevice>(
        &mut self,
        device: &D,
        shader_stages: vk::ShaderStageFlags,
        p_next: *const c_void,
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout> {
        for binding in &mut self.bindings {
            binding.stage_flags |= shader_stages;
        }

        let layout = device.create_layout(&self.bindings, flags, p_next)?;
        Ok(layout)
    }
}

impl Default for DescriptorLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned descriptor set layout.
pub struct DescriptorSetLayout {
    device: ash::Device,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Create a descriptor set layout from binding descriptions.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<Self> {
        let layout = DescriptorDevice::create_layout(
            device,
            bindings,
            vk::DescriptorSetLayoutCreateFlags::empty(),
            ptr::null(),
        )?;

        Ok(Self {
            device: device.clone(),
            layout,
        })
    }

    /// Adopt ownership of an existing layout handle, e.g. one produced by
    /// [`DescriptorLayoutBuilder::build`].
    ///
    /// # Safety
    /// The layout must have been created from this device and must not be
    /// owned by anything else.
    pub unsafe fn from_raw(device: &ash::Device, layout: vk::DescriptorSetLayout) -> Self {
        Self {
            device: device.clone(),
            layout,
        }
    }

    /// Get the raw layout handle.
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        if self.layout != vk::DescriptorSetLayout::null() {
            unsafe { self.device.destroy_descriptor_set_layout(self.layout, None) };
        }
    }
}

/// Fixed-capacity descriptor allocator backed by a single pool.
///
/// Allocation fails once the pool is exhausted; there is no growth or
/// retry. This is the simple baseline [`GrowableDescriptorAllocator`]
/// extends.
pub struct DescriptorAllocator<D: DescriptorDevice = ash::Device> {
    device: D,
    pool: vk::DescriptorPool,
}

impl<D: DescriptorDevice> DescriptorAllocator<D> {
    /// Create the pool, sized for `max_sets` sets with per-type budgets of
    /// `ratio * max_sets` descriptors.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: D, max_sets: u32, ratios: &[PoolSizeRatio]) -> Result<Self> {
        let pool_sizes = pool_sizes_for(ratios, max_sets);
        let pool = device.create_pool(max_sets, &pool_sizes)?;

        Ok(Self { device, pool })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one descriptor set. Propagates the driver error when the
    /// pool is exhausted.
    ///
    /// # Safety
    /// The layout must be valid.
    pub unsafe fn allocate(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let set = self.device.allocate_set(self.pool, layout, ptr::null())?;
        Ok(set)
    }

    /// Reset the pool, invalidating every set allocated from it.
    ///
    /// # Safety
    /// No set from the pool may still be in use by the GPU.
    pub unsafe fn clear_descriptors(&self) -> Result<()> {
        self.device.reset_pool(self.pool)?;
        Ok(())
    }

    /// Destroy the pool. Safe to call more than once.
    ///
    /// # Safety
    /// No set from the pool may still be in use by the GPU.
    pub unsafe fn destroy_pool(&mut self) {
        if self.pool != vk::DescriptorPool::null() {
            self.device.destroy_pool(self.pool);
            self.pool = vk::DescriptorPool::null();
        }
    }
}

impl<D: DescriptorDevice> Drop for DescriptorAllocator<D> {
    fn drop(&mut self) {
        unsafe { self.destroy_pool() };
    }
}

/// Hard ceiling on the per-pool set count.
const MAX_SETS_PER_POOL: u32 = 4092;

fn grow_sets_per_pool(current: u32) -> u32 {
    let mut next = (current as f32 * 1.5) as u32;
    // Integer truncation must not stall the growth sequence
    if next <= current {
        next = current + 1;
    }
    next.min(MAX_SETS_PER_POOL)
}

/// Growable descriptor allocator.
///
/// Maintains a stack of ready pools and a list of full ones. Pool
/// exhaustion is discovered lazily: an allocation that fails with
/// out-of-pool-memory or fragmented-pool parks the pool in the full list
/// and retries once against a fresh pool. Each newly created pool is sized
/// 1.5x the previous one, capped at [`MAX_SETS_PER_POOL`], so creation
/// cost amortizes as demand grows.
pub struct GrowableDescriptorAllocator<D: DescriptorDevice = ash::Device> {
    device: D,
    ratios: Vec<PoolSizeRatio>,
    ready_pools: Vec<vk::DescriptorPool>,
    full_pools: Vec<vk::DescriptorPool>,
    sets_per_pool: u32,
}

impl<D: DescriptorDevice> GrowableDescriptorAllocator<D> {
    /// Create the allocator with one pool sized for `initial_sets` sets
    /// (minimum 10 when zero is requested). Every later pool uses the same
    /// ratio template.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: D, initial_sets: u32, ratios: &[PoolSizeRatio]) -> Result<Self> {
        let ratios = ratios.to_vec();
        let first_pool_sets = if initial_sets == 0 { 10 } else { initial_sets };

        let pool_sizes = pool_sizes_for(&ratios, first_pool_sets);
        let pool = device.create_pool(first_pool_sets, &pool_sizes)?;

        Ok(Self {
            device,
            ratios,
            ready_pools: vec![pool],
            full_pools: Vec::new(),
            sets_per_pool: grow_sets_per_pool(first_pool_sets),
        })
    }

    /// The set count the next created pool will use.
    pub fn sets_per_pool(&self) -> u32 {
        self.sets_per_pool
    }

    /// The ratio template applied to every pool.
    pub fn ratios(&self) -> &[PoolSizeRatio] {
        &self.ratios
    }

    /// Number of pools with spare capacity.
    pub fn ready_pool_count(&self) -> usize {
        self.ready_pools.len()
    }

    /// Number of exhausted pools awaiting reset.
    pub fn full_pool_count(&self) -> usize {
        self.full_pools.len()
    }

    unsafe fn get_pool(&mut self) -> Result<vk::DescriptorPool> {
        if let Some(pool) = self.ready_pools.pop() {
            return Ok(pool);
        }

        // No spare capacity; create a pool at the current size and grow
        // the size for the next one.
        let pool_sizes = pool_sizes_for(&self.ratios, self.sets_per_pool);
        let pool = self.device.create_pool(self.sets_per_pool, &pool_sizes)?;
        tracing::trace!(sets = self.sets_per_pool, "Created descriptor pool");

        self.sets_per_pool = grow_sets_per_pool(self.sets_per_pool);

        Ok(pool)
    }

    /// Allocate one descriptor set, growing the pool set if needed.
    ///
    /// # Safety
    /// The layout must be valid.
    pub unsafe fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.allocate_with_next(layout, ptr::null())
    }

    /// Allocate one descriptor set with an extension chain.
    ///
    /// # Safety
    /// The layout must be valid; `p_next` must be null or point to a valid
    /// extension chain for set allocation.
    pub unsafe fn allocate_with_next(
        &mut self,
        layout: vk::DescriptorSetLayout,
        p_next: *const c_void,
    ) -> Result<vk::DescriptorSet> {
        let mut pool = self.get_pool()?;

        let set = match self.device.allocate_set(pool, layout, p_next) {
            Ok(set) => set,
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                // The pool is spent; park it and retry once against a
                // fresh pool. A second failure is fatal.
                self.full_pools.push(pool);

                pool = self.get_pool()?;
                match self.device.allocate_set(pool, layout, p_next) {
                    Ok(set) => set,
                    Err(e) => {
                        self.ready_pools.push(pool);
                        return Err(e.into());
                    }
                }
            }
            Err(e) => {
                self.ready_pools.push(pool);
                return Err(e.into());
            }
        };

        self.ready_pools.push(pool);
        Ok(set)
    }

    /// Reset every pool and move the full ones back into the ready list.
    ///
    /// Every set allocated from this allocator becomes invalid.
    ///
    /// # Safety
    /// No set from this allocator may still be in use by the GPU.
    pub unsafe fn clear_pools(&mut self) -> Result<()> {
        for &pool in &self.ready_pools {
            self.device.reset_pool(pool)?;
        }
        for &pool in &self.full_pools {
            self.device.reset_pool(pool)?;
        }
        self.ready_pools.append(&mut self.full_pools);

        Ok(())
    }

    /// Destroy every pool and clear the ratio template. Safe to call more
    /// than once.
    ///
    /// # Safety
    /// No set from this allocator may still be in use by the GPU.
    pub unsafe fn destroy_pools(&mut self) {
        for pool in self.ready_pools.drain(..) {
            self.device.destroy_pool(pool);
        }
        for pool in self.full_pools.drain(..) {
            self.device.destroy_pool(pool);
        }
        self.ratios.clear();
    }
}

impl<D: DescriptorDevice> Drop for GrowableDescriptorAllocator<D> {
    fn drop(&mut self) {
        unsafe { self.destroy_pools() };
    }
}

enum InfoSlot {
    Buffer(usize),
    Image(usize),
}

struct PendingWrite {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    slot: InfoSlot,
}

/// Batches descriptor writes against a set.
///
/// Writes accumulate unbound to any destination; [`update_set`] stamps
/// them all onto one target set and submits them in a single batched
/// update call. The same batch may be applied to several sets.
///
/// [`update_set`]: DescriptorWriter::update_set
pub struct DescriptorWriter {
    buffer_infos: Vec<vk::DescriptorBufferInfo>,
    image_infos: Vec<vk::DescriptorImageInfo>,
    writes: Vec<PendingWrite>,
}

impl DescriptorWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self {
            buffer_infos: Vec::new(),
            image_infos: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Queue a buffer write for `binding`.
    pub fn write_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        size: u64,
        offset: u64,
        descriptor_type: vk::DescriptorType,
    ) -> &mut Self {
        self.buffer_infos.push(
            vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .offset(offset)
                .range(size),
        );
        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            slot: InfoSlot::Buffer(self.buffer_infos.len() - 1),
        });
        self
    }

    /// Queue an image write for `binding`.
    pub fn write_image(
        &mut self,
        binding: u32,
        image_view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        descriptor_type: vk::DescriptorType,
    ) -> &mut Self {
        self.image_infos.push(
            vk::DescriptorImageInfo::default()
                .sampler(sampler)
                .image_view(image_view)
                .image_layout(layout),
        );
        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            slot: InfoSlot::Image(self.image_infos.len() - 1),
        });
        self
    }

    /// Discard all queued writes.
    pub fn clear(&mut self) {
        self.buffer_infos.clear();
        self.image_infos.clear();
        self.writes.clear();
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the writer holds no queued writes.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Stamp every queued write onto `set` and submit them in one batched
    /// update. Each call performs a real update, so the batch can be
    /// re-applied to the same or another set.
    ///
    /// # Safety
    /// The set and every resource referenced by the queued writes must be
    /// valid.
    pub unsafe fn update_set<D: DescriptorDevice>(&self, device: &D, set: vk::DescriptorSet) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|pending| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(pending.binding)
                    .descriptor_type(pending.descriptor_type);

                match pending.slot {
                    InfoSlot::Buffer(index) => {
                        write.buffer_info(std::slice::from_ref(&self.buffer_infos[index]))
                    }
                    InfoSlot::Image(index) => {
                        write.image_info(std::slice::from_ref(&self.image_infos[index]))
                    }
                }
            })
            .collect();

        device.update_sets(&writes);
    }
}

impl Default for DescriptorWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use ash::vk::Handle;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct PoolState {
        max_sets: u32,
        used: u32,
    }

    #[derive(Default)]
    struct FakeState {
        next_handle: u64,
        pools: HashMap<u64, PoolState>,
        created: Vec<(u32, Vec<(vk::DescriptorType, u32)>)>,
        destroyed: Vec<u64>,
        resets: Vec<u64>,
        layouts: Vec<(
            Vec<(u32, vk::DescriptorType, vk::ShaderStageFlags)>,
            vk::DescriptorSetLayoutCreateFlags,
        )>,
        updates: Vec<Vec<CapturedWrite>>,
        allocation_attempts: u32,
        fail_allocations: bool,
    }

    struct CapturedWrite {
        dst_set: u64,
        dst_binding: u32,
        descriptor_type: vk::DescriptorType,
        has_buffer_info: bool,
        has_image_info: bool,
    }

    #[derive(Clone, Default)]
    struct FakeDevice {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeDevice {
        fn new() -> Self {
            Self::default()
        }

        fn fail_allocations(&self) {
            self.state.lock().fail_allocations = true;
        }

        fn pools_created(&self) -> usize {
            self.state.lock().created.len()
        }

        fn created_sizes(&self) -> Vec<u32> {
            self.state.lock().created.iter().map(|c| c.0).collect()
        }

        fn destroyed(&self) -> Vec<u64> {
            self.state.lock().destroyed.clone()
        }

        fn reset_count(&self) -> usize {
            self.state.lock().resets.len()
        }

        fn allocation_attempts(&self) -> u32 {
            self.state.lock().allocation_attempts
        }
    }

    impl DescriptorDevice for FakeDevice {
        unsafe fn create_pool(
            &self,
            max_sets: u32,
            pool_sizes: &[vk::DescriptorPoolSize],
        ) -> VkResult<vk::DescriptorPool> {
            let mut state = self.state.lock();
            state.next_handle += 1;
            let handle = state.next_handle;
            state.pools.insert(handle, PoolState { max_sets, used: 0 });
            state.created.push((
                max_sets,
                pool_sizes
                    .iter()
                    .map(|size| (size.ty, size.descriptor_count))
                    .collect(),
            ));
            Ok(vk::DescriptorPool::from_raw(handle))
        }

        unsafe fn destroy_pool(&self, pool: vk::DescriptorPool) {
            let mut state = self.state.lock();
            state.pools.remove(&pool.as_raw());
            state.destroyed.push(pool.as_raw());
        }

        unsafe fn reset_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
            let mut state = self.state.lock();
            state.resets.push(pool.as_raw());
            if let Some(pool) = state.pools.get_mut(&pool.as_raw()) {
                pool.used = 0;
            }
            Ok(())
        }

        unsafe fn allocate_set(
            &self,
            pool: vk::DescriptorPool,
            _layout: vk::DescriptorSetLayout,
            _p_next: *const c_void,
        ) -> VkResult<vk::DescriptorSet> {
            let mut state = self.state.lock();
            state.allocation_attempts += 1;
            if state.fail_allocations {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }

            let pool_state = state
                .pools
                .get_mut(&pool.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            if pool_state.used >= pool_state.max_sets {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }
            pool_state.used += 1;

            state.next_handle += 1;
            Ok(vk::DescriptorSet::from_raw(state.next_handle))
        }

        unsafe fn create_layout(
            &self,
            bindings: &[vk::DescriptorSetLayoutBinding<'_>],
            flags: vk::DescriptorSetLayoutCreateFlags,
            _p_next: *const c_void,
        ) -> VkResult<vk::DescriptorSetLayout> {
            let mut state = self.state.lock();
            state.layouts.push((
                bindings
                    .iter()
                    .map(|b| (b.binding, b.descriptor_type, b.stage_flags))
                    .collect(),
                flags,
            ));
            state.next_handle += 1;
            Ok(vk::DescriptorSetLayout::from_raw(state.next_handle))
        }

        unsafe fn update_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
            let mut state = self.state.lock();
            let captured = writes
                .iter()
                .map(|write| CapturedWrite {
                    dst_set: write.dst_set.as_raw(),
                    dst_binding: write.dst_binding,
                    descriptor_type: write.descriptor_type,
                    has_buffer_info: !write.p_buffer_info.is_null(),
                    has_image_info: !write.p_image_info.is_null(),
                })
                .collect();
            state.updates.push(captured);
        }
    }

    fn uniform_ratio() -> Vec<PoolSizeRatio> {
        vec![PoolSizeRatio {
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            ratio: 1.0,
        }]
    }

    fn any_layout() -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(0xdead)
    }

    #[test]
    fn fixed_pool_sizes_follow_ratios() {
        let device = FakeDevice::new();
        let ratios = [
            PoolSizeRatio {
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                ratio: 1.0,
            },
            PoolSizeRatio {
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                ratio: 0.5,
            },
        ];

        let _allocator =
            unsafe { DescriptorAllocator::new(device.clone(), 10, &ratios) }.unwrap();

        let state = device.state.lock();
        assert_eq!(state.created.len(), 1);
        let (max_sets, sizes) = &state.created[0];
        assert_eq!(*max_sets, 10);
        assert_eq!(
            sizes.as_slice(),
            &[
                (vk::DescriptorType::UNIFORM_BUFFER, 10),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 5),
            ]
        );
    }

    #[test]
    fn fixed_allocator_fails_when_pool_exhausted() {
        let device = FakeDevice::new();
        let allocator = unsafe { DescriptorAllocator::new(device, 2, &uniform_ratio()) }.unwrap();

        unsafe {
            allocator.allocate(any_layout()).unwrap();
            allocator.allocate(any_layout()).unwrap();

            let err = allocator.allocate(any_layout()).unwrap_err();
            assert!(matches!(
                err,
                GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
            ));
        }
    }

    #[test]
    fn fixed_clear_descriptors_resets_pool() {
        let device = FakeDevice::new();
        let allocator =
            unsafe { DescriptorAllocator::new(device.clone(), 1, &uniform_ratio()) }.unwrap();

        unsafe {
            allocator.allocate(any_layout()).unwrap();
            allocator.clear_descriptors().unwrap();
            allocator.allocate(any_layout()).unwrap();
        }

        assert_eq!(device.reset_count(), 1);
    }

    #[test]
    fn fixed_destroy_happens_exactly_once() {
        let device = FakeDevice::new();
        let mut allocator =
            unsafe { DescriptorAllocator::new(device.clone(), 1, &uniform_ratio()) }.unwrap();

        unsafe {
            allocator.destroy_pool();
            allocator.destroy_pool();
        }
        drop(allocator);

        assert_eq!(device.destroyed().len(), 1);
    }

    #[test]
    fn growable_initial_pool_uses_requested_size() {
        let device = FakeDevice::new();
        let allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 4, &uniform_ratio()) }
                .unwrap();

        assert_eq!(device.created_sizes(), vec![4]);
        assert_eq!(allocator.sets_per_pool(), 6);
        assert_eq!(allocator.ready_pool_count(), 1);
    }

    #[test]
    fn growable_initial_size_of_zero_defaults_to_ten() {
        let device = FakeDevice::new();
        let allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 0, &uniform_ratio()) }
                .unwrap();

        assert_eq!(device.created_sizes(), vec![10]);
        assert_eq!(allocator.sets_per_pool(), 15);
    }

    #[test]
    fn exhaustion_creates_second_pool_grown_by_half() {
        let device = FakeDevice::new();
        let mut allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 4, &uniform_ratio()) }
                .unwrap();

        unsafe {
            for _ in 0..4 {
                allocator.allocate(any_layout()).unwrap();
            }
            assert_eq!(device.pools_created(), 1);

            // Fifth set exceeds the initial pool's capacity
            allocator.allocate(any_layout()).unwrap();
        }

        assert_eq!(device.created_sizes(), vec![4, 6]);
        assert_eq!(allocator.full_pool_count(), 1);
        assert_eq!(allocator.ready_pool_count(), 1);
    }

    #[test]
    fn growth_from_one_set_forces_a_strictly_larger_second_pool() {
        let device = FakeDevice::new();
        let mut allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 1, &uniform_ratio()) }
                .unwrap();

        unsafe {
            allocator.allocate(any_layout()).unwrap();
            allocator.allocate(any_layout()).unwrap();
        }

        let sizes = device.created_sizes();
        assert_eq!(sizes.len(), 2);
        assert!(sizes[1] > sizes[0]);
    }

    #[test]
    fn pool_sizes_never_shrink() {
        let device = FakeDevice::new();
        let mut allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 1, &uniform_ratio()) }
                .unwrap();

        unsafe {
            for _ in 0..40 {
                allocator.allocate(any_layout()).unwrap();
            }
        }

        let sizes = device.created_sizes();
        assert!(sizes.len() > 2);
        for pair in sizes.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(sizes.iter().all(|&size| size <= 4092));
    }

    #[test]
    fn growth_sequence_is_capped() {
        let mut size = 1;
        for _ in 0..100 {
            let next = grow_sets_per_pool(size);
            assert!(next > size || next == 4092);
            assert!(next <= 4092);
            size = next;
        }
        assert_eq!(size, 4092);
        assert_eq!(grow_sets_per_pool(4092), 4092);
    }

    #[test]
    fn exhausted_pools_recycle_after_clear() {
        let device = FakeDevice::new();
        let mut allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 2, &uniform_ratio()) }
                .unwrap();

        unsafe {
            for _ in 0..6 {
                allocator.allocate(any_layout()).unwrap();
            }
        }
        let pools_before_clear = device.pools_created();
        assert!(allocator.full_pool_count() > 0);

        unsafe { allocator.clear_pools() }.unwrap();
        assert_eq!(allocator.full_pool_count(), 0);
        assert_eq!(allocator.ready_pool_count(), pools_before_clear);

        // Reset pools have their full capacity back; no new pool is needed
        unsafe {
            for _ in 0..3 {
                allocator.allocate(any_layout()).unwrap();
            }
        }
        assert_eq!(device.pools_created(), pools_before_clear);
    }

    #[test]
    fn allocation_failure_after_retry_propagates() {
        let device = FakeDevice::new();
        let mut allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 3, &uniform_ratio()) }
                .unwrap();

        device.fail_allocations();

        let err = unsafe { allocator.allocate(any_layout()) }.unwrap_err();
        assert!(matches!(
            err,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        ));

        // Exactly one retry: two attempts, the failed pool parked as full,
        // the retry pool returned to ready for teardown.
        assert_eq!(device.allocation_attempts(), 2);
        assert_eq!(allocator.full_pool_count(), 1);
        assert_eq!(allocator.ready_pool_count(), 1);
    }

    #[test]
    fn destroy_pools_is_idempotent() {
        let device = FakeDevice::new();
        let mut allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 2, &uniform_ratio()) }
                .unwrap();

        unsafe {
            for _ in 0..3 {
                allocator.allocate(any_layout()).unwrap();
            }
        }
        let created = device.pools_created();

        unsafe {
            allocator.destroy_pools();
            allocator.destroy_pools();
        }

        assert_eq!(device.destroyed().len(), created);
        assert_eq!(allocator.ready_pool_count(), 0);
        assert_eq!(allocator.full_pool_count(), 0);
        assert!(allocator.ratios().is_empty());

        // The destructor must not destroy anything again
        drop(allocator);
        assert_eq!(device.destroyed().len(), created);
    }

    #[test]
    fn drop_destroys_every_pool_once() {
        let device = FakeDevice::new();
        let mut allocator =
            unsafe { GrowableDescriptorAllocator::new(device.clone(), 2, &uniform_ratio()) }
                .unwrap();

        unsafe {
            for _ in 0..5 {
                allocator.allocate(any_layout()).unwrap();
            }
        }
        let created = device.pools_created();
        drop(allocator);

        let mut destroyed = device.destroyed();
        destroyed.sort_unstable();
        destroyed.dedup();
        assert_eq!(destroyed.len(), created);
    }

    #[test]
    fn builder_applies_stage_flags_to_all_bindings() {
        let device = FakeDevice::new();
        let mut builder = DescriptorLayoutBuilder::new();
        builder
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
            .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);

        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let layout = unsafe {
            builder.build(&device, stages, vk::DescriptorSetLayoutCreateFlags::empty())
        }
        .unwrap();
        assert_ne!(layout, vk::DescriptorSetLayout::null());

        let state = device.state.lock();
        let (bindings, flags) = &state.layouts[0];
        assert_eq!(*flags, vk::DescriptorSetLayoutCreateFlags::empty());
        assert_eq!(
            bindings.as_slice(),
            &[
                (0, vk::DescriptorType::UNIFORM_BUFFER, stages),
                (1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages),
            ]
        );
    }

    #[test]
    fn builder_permits_duplicate_binding_indices() {
        let device = FakeDevice::new();
        let mut builder = DescriptorLayoutBuilder::new();
        builder
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
            .add_binding(0, vk::DescriptorType::STORAGE_BUFFER);

        assert_eq!(builder.len(), 2);
        unsafe {
            builder.build(
                &device,
                vk::ShaderStageFlags::COMPUTE,
                vk::DescriptorSetLayoutCreateFlags::empty(),
            )
        }
        .unwrap();

        assert_eq!(device.state.lock().layouts[0].0.len(), 2);
    }

    #[test]
    fn builder_clear_allows_reuse() {
        let device = FakeDevice::new();
        let mut builder = DescriptorLayoutBuilder::new();
        builder.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER);
        builder.clear();
        assert!(builder.is_empty());

        builder.add_binding(3, vk::DescriptorType::STORAGE_IMAGE);
        unsafe {
            builder.build(
                &device,
                vk::ShaderStageFlags::COMPUTE,
                vk::DescriptorSetLayoutCreateFlags::empty(),
            )
        }
        .unwrap();

        let state = device.state.lock();
        let (bindings, _) = &state.layouts[0];
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].0, 3);
    }

    #[test]
    fn writer_batches_buffer_and_image_writes() {
        let device = FakeDevice::new();
        let mut writer = DescriptorWriter::new();
        writer
            .write_buffer(
                0,
                vk::Buffer::from_raw(1),
                64,
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
            )
            .write_image(
                1,
                vk::ImageView::from_raw(2),
                vk::Sampler::from_raw(3),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            );

        let set = vk::DescriptorSet::from_raw(7);
        unsafe { writer.update_set(&device, set) };

        let state = device.state.lock();
        assert_eq!(state.updates.len(), 1);
        let batch = &state.updates[0];
        assert_eq!(batch.len(), 2);

        assert_eq!(batch[0].dst_set, 7);
        assert_eq!(batch[0].dst_binding, 0);
        assert_eq!(batch[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert!(batch[0].has_buffer_info);
        assert!(!batch[0].has_image_info);

        assert_eq!(batch[1].dst_set, 7);
        assert_eq!(batch[1].dst_binding, 1);
        assert_eq!(
            batch[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert!(batch[1].has_image_info);
        assert!(!batch[1].has_buffer_info);
    }

    #[test]
    fn writer_reapplies_batch_on_each_update() {
        let device = FakeDevice::new();
        let mut writer = DescriptorWriter::new();
        writer.write_buffer(
            0,
            vk::Buffer::from_raw(1),
            16,
            0,
            vk::DescriptorType::STORAGE_BUFFER,
        );

        unsafe {
            writer.update_set(&device, vk::DescriptorSet::from_raw(7));
            writer.update_set(&device, vk::DescriptorSet::from_raw(8));
        }

        let state = device.state.lock();
        assert_eq!(state.updates.len(), 2);
        assert_eq!(state.updates[0][0].dst_set, 7);
        assert_eq!(state.updates[1][0].dst_set, 8);
    }

    #[test]
    fn writer_clear_discards_pending_writes() {
        let device = FakeDevice::new();
        let mut writer = DescriptorWriter::new();
        writer.write_buffer(
            0,
            vk::Buffer::from_raw(1),
            16,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
        );
        writer.clear();
        assert!(writer.is_empty());

        unsafe { writer.update_set(&device, vk::DescriptorSet::from_raw(7)) };
        assert!(device.state.lock().updates[0].is_empty());
    }
}
