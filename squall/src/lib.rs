// The squall renderer core
//
// This crate is the GPU resource management and frame submission
// layer that the rest of the engine sits on. It owns the Vulkan
// instance/device plumbing, the structural caches for shaders,
// descriptor layouts and pipeline state, the N-frames-in-flight
// scheduler with its deferred deletion queues, staging uploads,
// and the material system built on all of the above.
//
// This layer is very low, and as a result is mostly unsafe
// internally. Raw vulkan handles do appear in the public surface,
// but only where the pipeline layer genuinely needs them; all
// lifetime management stays on this side of the boundary.
#![allow(dead_code, non_camel_case_types)]

pub mod batch;
mod cache;
pub mod descpool;
mod device;
mod display;
mod frame;
mod image;
mod instance;
pub mod material;
pub mod pipeline;
mod pipeline_state;
mod reflect;
pub mod renderer;
pub mod renderpass;
mod shader;
mod staging;

mod buffer;
mod deletion_queue;

#[cfg(test)]
mod tests;

pub use crate::buffer::Buffer;
pub use crate::device::{CardSelector, Device, GpuInfo};
pub use crate::display::{SurfaceCreateFn, SurfaceType};
pub use crate::image::{Image, ImageDim, ImageView, Texture};
pub use crate::instance::Instance;
pub use crate::material::{Material, MaterialInitializer, MaterialInstance};
pub use crate::pipeline::{MaterialDomainInfo, Pipeline};
pub use crate::pipeline_state::{BlendFactor, BlendOperation, CullMode, MetaMaterial};
pub use crate::renderer::{RecordParams, RenderSettings, Renderer, RendererStartupInfo};
pub use crate::renderpass::RenderPassBuilder;
pub use crate::shader::{Shader, ShaderInitializer, ShaderProperty};


/// Errors this crate can return
///
/// Lower level vulkan errors are mapped onto these at the wrapper
/// boundary. The caches never panic on construction failure, they
/// log and hand one of these back so the caller can retry.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum SquallError {
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Operation could not be completed")]
    INVALID,
    #[error("Invalid or unreflectable shader bytecode")]
    INVALID_BYTECODE,
    #[error("A device limit was exceeded")]
    LIMIT_EXCEEDED,
    #[error("A shader interface does not match its previous definition")]
    PROPERTY_MISMATCH,
    #[error("Payload is too large for the dynamic staging buffer")]
    UPLOAD_TOO_LARGE,
    #[error("Out of device memory")]
    OUT_OF_VRAM,
    #[error("The swapchain is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Presentation failed")]
    PRESENT_FAILED,
    #[error("Vulkan surface is not supported on this device")]
    VK_SURF_NOT_SUPPORTED,
    #[error("No suitable queue family was found")]
    NO_SUITABLE_QUEUE,
    #[error("Required vulkan extensions are not available")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("Could not create a vulkan object")]
    CREATION_FAILED,
}

pub type Result<T> = std::result::Result<T, SquallError>;

/// Hard caps the reflection and cache layers enforce
pub struct Limits;

impl Limits {
    pub const NUM_VERTEX_ATTRIBUTES: usize = 16; // Vulkan approved.
    pub const UNIFORM_BUFFER_SIZE: u32 = 16 * 1024; // 16 KiB, Vulkan approved.
    pub const NUM_MATERIAL_TEXTURES: u32 = 16;
    pub const NUM_DESCRIPTOR_SETS: usize = 4;
    pub const NUM_BINDINGS_PER_SET: usize = 18;
    pub const DESCRIPTOR_LAYOUT_STRING_LENGTH: usize = 519;
    pub const NUM_BATCH_TEXTURES: u32 = 64;
    pub const PUSH_CONSTANT_SIZE: u32 = 128;
}

/// Descriptor set indices are assigned by convention: set 0 is the
/// pass-global set supplied by the active render pipeline, set 1
/// belongs to the bound material, set 2 to the object being drawn.
pub const GLOBAL_DESCRIPTOR_SET: u32 = 0;
pub const MATERIAL_DESCRIPTOR_SET: u32 = 1;
pub const OBJECT_DESCRIPTOR_SET: u32 = 2;

bitflags::bitflags! {
    /// Which shader stages reference a resource
    pub struct ShaderStageSet: u8 {
        const VERTEX = 0x1;
        const GEOMETRY = 0x2;
        const FRAGMENT = 0x4;
    }
}

impl ShaderStageSet {
    pub const ALL_GRAPHICS: ShaderStageSet = ShaderStageSet::all();

    pub fn to_vk(self) -> ash::vk::ShaderStageFlags {
        let mut ret = ash::vk::ShaderStageFlags::empty();
        if self.contains(ShaderStageSet::VERTEX) {
            ret |= ash::vk::ShaderStageFlags::VERTEX;
        }
        if self.contains(ShaderStageSet::GEOMETRY) {
            ret |= ash::vk::ShaderStageFlags::GEOMETRY;
        }
        if self.contains(ShaderStageSet::FRAGMENT) {
            ret |= ash::vk::ShaderStageFlags::FRAGMENT;
        }
        return ret;
    }
}

/// 32-bit scalar and vector types allowed in vertex layouts and
/// material uniform blocks
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Int,
    IVec2,
    IVec3,
    IVec4,
    UInt,
    UVec2,
    UVec3,
    UVec4,
}

impl DataType {
    /// Byte size of one attribute of this type
    pub fn size(&self) -> u32 {
        match self {
            DataType::Float | DataType::Int | DataType::UInt => 4,
            DataType::Vec2 | DataType::IVec2 | DataType::UVec2 => 8,
            DataType::Vec3 | DataType::IVec3 | DataType::UVec3 => 12,
            DataType::Vec4 | DataType::IVec4 | DataType::UVec4 => 16,
        }
    }

    pub fn to_vk_format(&self) -> ash::vk::Format {
        use ash::vk::Format;
        match self {
            DataType::Float => Format::R32_SFLOAT,
            DataType::Vec2 => Format::R32G32_SFLOAT,
            DataType::Vec3 => Format::R32G32B32_SFLOAT,
            DataType::Vec4 => Format::R32G32B32A32_SFLOAT,
            DataType::Int => Format::R32_SINT,
            DataType::IVec2 => Format::R32G32_SINT,
            DataType::IVec3 => Format::R32G32B32_SINT,
            DataType::IVec4 => Format::R32G32B32A32_SINT,
            DataType::UInt => Format::R32_UINT,
            DataType::UVec2 => Format::R32G32_UINT,
            DataType::UVec3 => Format::R32G32B32_UINT,
            DataType::UVec4 => Format::R32G32B32A32_UINT,
        }
    }
}

/// The four descriptor kinds the engine manages
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    UniformBuffer,
}

impl DescriptorType {
    pub fn to_vk(self) -> ash::vk::DescriptorType {
        match self {
            DescriptorType::Sampler => ash::vk::DescriptorType::SAMPLER,
            DescriptorType::CombinedImageSampler => {
                ash::vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            DescriptorType::SampledImage => ash::vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorType::UniformBuffer => ash::vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/// One reflected binding within a descriptor set
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding_point: u32,
    pub array_size: u32,
    pub ty: DescriptorType,
    pub stages: ShaderStageSet,
}

/// The per-set binding lists a shader's pipeline layout is built from
pub type DescriptorLayoutDesc = [Vec<DescriptorBinding>; Limits::NUM_DESCRIPTOR_SETS];
