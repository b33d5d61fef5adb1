//! GPU resource and pipeline management layer for the Ember renderer.
//!
//! This crate provides:
//! - RAII ownership wrappers for Vulkan handles (fences, semaphores,
//!   command pools, images, buffers, samplers, pipelines, swapchains)
//! - Descriptor set layout building and write batching
//! - A growable descriptor pool allocator
//! - Memory allocation via gpu-allocator
//!
//! Every wrapper owns exactly one native object and destroys it exactly
//! once when dropped; ownership is unique and transfers by move. The
//! device and allocator context handles are created by the surrounding
//! engine and passed in explicitly.

pub mod command;
pub mod deferred;
pub mod descriptors;
pub mod error;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod swapchain;
pub mod sync;

pub use command::{
    begin_command_buffer, end_command_buffer, execute_single_time_commands,
    submit_command_buffers, CommandPool,
};
pub use deferred::DeferredDeletionQueue;
pub use descriptors::{
    DescriptorAllocator, DescriptorDevice, DescriptorLayoutBuilder, DescriptorSetLayout,
    DescriptorWriter, GrowableDescriptorAllocator, PoolSizeRatio,
};
pub use error::{GpuError, Result};
pub use image::{ImageView, Sampler};
pub use memory::{AllocatedBuffer, AllocatedImage, MemoryAllocator};
pub use pipeline::{
    ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig, Pipeline, PipelineLayout,
};
pub use swapchain::{calculate_extent, select_present_mode, select_surface_format, Swapchain};
pub use sync::{Fence, Semaphore};
