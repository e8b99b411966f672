// Vulkan device representation
//
// This stores per-GPU state: the logical device, its queues, the
// deletion queue, and the structural caches. Everything mutable is
// kept behind one lock in DeviceInternal; deleters and cache
// destruction callbacks only ever touch raw handles so they can
// run after that lock is released.
use ash::extensions::khr;
use ash::vk;

use crate::buffer::Buffer;
use crate::cache::{
    DescriptorLayoutCache, PipelineLayoutHandles, PipelineStateCache, ShaderModuleCache,
};
use crate::deletion_queue::{Deleter, DeletionQueue};
use crate::descpool::{DescriptorPoolSizes, StaticDescriptorAllocator};
use crate::image::Image;
use crate::instance::Instance;
use crate::renderpass::RenderPassCache;
use crate::shader::Shader;
use crate::{
    DescriptorBinding, DescriptorLayoutDesc, DescriptorType, MetaMaterial, Result, SquallError,
};
use utils::log;

use std::ffi::CStr;
use std::sync::{Arc, RwLock};

/// What the GPU selection callback gets to look at
#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_sampler_count: u32,
    pub supports_wireframe: bool,
    pub(crate) pdev: vk::PhysicalDevice,
}

pub type CardSelector = Box<dyn Fn(&[GpuInfo]) -> usize>;

/// This is the set of per-device data that needs to be "externally
/// synchronized" according to Vulkan, plus any mutable state.
pub(crate) struct DeviceInternal {
    /// queue for copy operations
    pub(crate) transfer_queue: vk::Queue,
    pub(crate) transfer_cmd_pool: vk::CommandPool,

    /// This holds all deleters that run once the frame that
    /// released them has its fence observed again
    pub(crate) deletion_queue: DeletionQueue,

    pub(crate) shader_cache: ShaderModuleCache,
    pub(crate) layout_cache: DescriptorLayoutCache,
    pub(crate) pso_cache: PipelineStateCache,
    pub(crate) render_pass_cache: RenderPassCache,

    /// Long-lived material descriptor sets
    pub(crate) static_material_descriptors: StaticDescriptorAllocator,

    /// The active render pipeline's set 0 layout. Registered at
    /// pipeline startup, consumed when pipeline layouts are built.
    pub(crate) global_set_layout: vk::DescriptorSetLayout,
}

/// One GPU
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// the physical device selected to display to
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) gpu_info: GpuInfo,
    pub(crate) graphics_family: u32,
    pub(crate) transfer_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) d_internal: RwLock<DeviceInternal>,
}

impl Device {
    fn collect_gpu_infos(inst: &ash::Instance) -> Vec<GpuInfo> {
        let pdevices = unsafe { inst.enumerate_physical_devices().unwrap_or_default() };
        pdevices
            .iter()
            .map(|&pdev| {
                let props = unsafe { inst.get_physical_device_properties(pdev) };
                let features = unsafe { inst.get_physical_device_features(pdev) };
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned();
                GpuInfo {
                    name: name,
                    device_type: props.device_type,
                    max_sampler_count: props.limits.max_per_stage_descriptor_samplers,
                    supports_wireframe: features.fill_mode_non_solid != 0,
                    pdev: pdev,
                }
            })
            .collect()
    }

    /// Choose a queue family
    ///
    /// returns an index into the array of queue types
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        flags: vk::QueueFlags,
    ) -> Result<u32> {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .filter_map(|(index, info)| match info.queue_flags.contains(flags) {
                true => Some(index as u32),
                false => None,
            })
            .nth(0)
            .ok_or(SquallError::NO_SUITABLE_QUEUE)
    }

    /// Prefer a dedicated transfer family so uploads do not contend
    /// with the graphics queue; fall back to the graphics family.
    fn select_transfer_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        graphics_family: u32,
    ) -> u32 {
        let families = unsafe { inst.get_physical_device_queue_family_properties(pdev) };
        for (index, info) in families.iter().enumerate() {
            if info.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            {
                return index as u32;
            }
        }
        return graphics_family;
    }

    fn device_extensions(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Vec<*const i8> {
        let available = unsafe {
            inst.enumerate_device_extension_properties(pdev)
                .unwrap_or_default()
        };
        let mut ret = Vec::new();
        let has_swapchain = available.iter().any(|prop| {
            let name = unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) };
            name == khr::Swapchain::name()
        });
        if has_swapchain {
            ret.push(khr::Swapchain::name().as_ptr());
        }
        return ret;
    }

    /// Create a new Device on the GPU the selector picks
    ///
    /// `render_ahead` sizes the deletion queue: one slot per frame
    /// in flight.
    pub fn new(
        instance: Arc<Instance>,
        card_selector: Option<&CardSelector>,
        render_ahead: usize,
    ) -> Result<Arc<Self>> {
        let infos = Self::collect_gpu_infos(&instance.inst);
        if infos.is_empty() {
            log::error!("No vulkan-capable GPU found");
            return Err(SquallError::INVALID);
        }
        let index = match card_selector {
            Some(selector) => selector(&infos),
            None => 0,
        };
        if index >= infos.len() {
            log::error!("GPU selector returned an out of range index");
            return Err(SquallError::INVALID);
        }
        let gpu_info = infos[index].clone();
        let pdev = gpu_info.pdev;
        log::info!("Using GPU: {}", gpu_info.name);

        let graphics_family =
            Self::select_queue_family(&instance.inst, pdev, vk::QueueFlags::GRAPHICS)?;
        let transfer_family = Self::select_transfer_family(&instance.inst, pdev, graphics_family);
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };

        let priorities = [1.0];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(&priorities)
            .build()];
        if transfer_family != graphics_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(transfer_family)
                    .queue_priorities(&priorities)
                    .build(),
            );
        }

        let features = vk::PhysicalDeviceFeatures::builder()
            .fill_mode_non_solid(gpu_info.supports_wireframe)
            .build();
        let extensions = Self::device_extensions(&instance.inst, pdev);
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let dev = unsafe {
            instance
                .inst
                .create_device(pdev, &create_info, None)
                .or(Err(SquallError::CREATION_FAILED))?
        };

        let graphics_queue = unsafe { dev.get_device_queue(graphics_family, 0) };
        let transfer_queue = unsafe { dev.get_device_queue(transfer_family, 0) };

        let ret = Self {
            inst: instance,
            dev: dev,
            pdev: pdev,
            mem_props: mem_props,
            gpu_info: gpu_info,
            graphics_family: graphics_family,
            transfer_family: transfer_family,
            graphics_queue: graphics_queue,
            d_internal: RwLock::new(DeviceInternal {
                transfer_queue: transfer_queue,
                transfer_cmd_pool: vk::CommandPool::null(),
                deletion_queue: DeletionQueue::new(render_ahead),
                shader_cache: ShaderModuleCache::new(),
                layout_cache: DescriptorLayoutCache::new(),
                pso_cache: PipelineStateCache::new(),
                render_pass_cache: RenderPassCache::new(),
                static_material_descriptors: StaticDescriptorAllocator::new(
                    DescriptorPoolSizes {
                        counts: vec![
                            (DescriptorType::UniformBuffer, 256),
                            (DescriptorType::CombinedImageSampler, 1024),
                        ],
                        max_sets: 256,
                    },
                ),
                global_set_layout: vk::DescriptorSetLayout::null(),
            }),
        };

        {
            let pool = ret.create_command_pool(transfer_family)?;
            ret.d_internal.write().unwrap().transfer_cmd_pool = pool;
        }

        Ok(Arc::new(ret))
    }

    pub(crate) fn vk_device(&self) -> &ash::Device {
        &self.dev
    }

    pub fn gpu_info(&self) -> &GpuInfo {
        &self.gpu_info
    }

    pub fn wait_idle(&self) {
        unsafe {
            self.dev.device_wait_idle().unwrap();
        }
    }

    // ---------------- Command pools and buffers ----------------

    /// returns a new vkCommandPool for `queue_family`
    pub(crate) fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        unsafe {
            self.dev
                .create_command_pool(&info, None)
                .or(Err(SquallError::CREATION_FAILED))
        }
    }

    /// Allocate a vec of vkCommandBuffers from `pool`
    pub(crate) fn create_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);
        unsafe {
            self.dev
                .allocate_command_buffers(&info)
                .or(Err(SquallError::CREATION_FAILED))
        }
    }

    // ---------------- Memory and resource factories ----------------

    /// Returns an index into the array of memory types for the
    /// memory properties
    ///
    /// Memory types specify the location and accessibility of
    /// memory. Device local memory is resident on the GPU, while
    /// host visible memory can be read from the system side.
    fn find_memory_type_index(
        props: &vk::PhysicalDeviceMemoryProperties,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, mem_type) in props.memory_types.iter().enumerate() {
            // Bit i of memory_type_bits is set if the resource
            // supports the ith memory type in props
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Allocates a buffer/memory pair of size `size` and binds them
    pub(crate) fn create_buffer_with_size(
        &self,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        unsafe {
            let info = vk::BufferCreateInfo::builder()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = self
                .dev
                .create_buffer(&info, None)
                .or(Err(SquallError::OUT_OF_VRAM))?;
            let reqs = self.dev.get_buffer_memory_requirements(buffer);
            let index = match Self::find_memory_type_index(&self.mem_props, &reqs, flags) {
                Some(i) => i,
                None => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(SquallError::OUT_OF_VRAM);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(reqs.size)
                .memory_type_index(index);
            let memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(SquallError::OUT_OF_VRAM);
                }
            };
            if self.dev.bind_buffer_memory(buffer, memory, 0).is_err() {
                self.dev.destroy_buffer(buffer, None);
                self.dev.free_memory(memory, None);
                return Err(SquallError::OUT_OF_VRAM);
            }
            Ok((buffer, memory))
        }
    }

    pub(crate) fn map_memory_ptr(&self, memory: vk::DeviceMemory, size: u64) -> Result<*mut u8> {
        unsafe {
            self.dev
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                .map(|p| p as *mut u8)
                .or(Err(SquallError::OUT_OF_VRAM))
        }
    }

    pub(crate) fn create_image_internal(
        &self,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        extent: vk::Extent2D,
        layers: u32,
        samples: u32,
        cube_compatible: bool,
    ) -> Result<(vk::Image, vk::DeviceMemory)> {
        let mut flags = vk::ImageCreateFlags::empty();
        if cube_compatible {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        let info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::from_raw(samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let image = self
                .dev
                .create_image(&info, None)
                .or(Err(SquallError::OUT_OF_VRAM))?;
            let reqs = self.dev.get_image_memory_requirements(image);
            let index = match Self::find_memory_type_index(
                &self.mem_props,
                &reqs,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ) {
                Some(i) => i,
                None => {
                    self.dev.destroy_image(image, None);
                    return Err(SquallError::OUT_OF_VRAM);
                }
            };
            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(reqs.size)
                .memory_type_index(index);
            let memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_image(image, None);
                    return Err(SquallError::OUT_OF_VRAM);
                }
            };
            if self.dev.bind_image_memory(image, memory, 0).is_err() {
                self.dev.destroy_image(image, None);
                self.dev.free_memory(memory, None);
                return Err(SquallError::OUT_OF_VRAM);
            }
            Ok((image, memory))
        }
    }

    pub(crate) fn create_image_view_internal(
        &self,
        image: vk::Image,
        format: vk::Format,
        base_layer: u32,
        layer_count: u32,
        view_type: vk::ImageViewType,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .format(format)
            .view_type(view_type)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(base_layer)
                    .layer_count(layer_count)
                    .build(),
            );
        unsafe {
            self.dev
                .create_image_view(&info, None)
                .or(Err(SquallError::CREATION_FAILED))
        }
    }

    /// Create an image sampler
    ///
    /// Samplers are used to filter data from an image when it is
    /// referenced from a fragment shader.
    pub fn create_sampler(&self) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);
        unsafe {
            self.dev
                .create_sampler(&info, None)
                .or(Err(SquallError::CREATION_FAILED))
        }
    }

    pub fn destroy_sampler(&self, sampler: vk::Sampler) {
        let raw_dev = self.dev.clone();
        self.pending_delete(Box::new(move || unsafe {
            raw_dev.destroy_sampler(sampler, None);
        }));
    }

    // ---------------- Deferred destruction ----------------

    /// Enqueue a deleter on the current frame's deletion slot
    pub fn pending_delete(&self, deleter: Deleter) {
        self.d_internal
            .write()
            .unwrap()
            .deletion_queue
            .push(deleter);
    }

    /// Rotate the deletion queue to `slot` and run everything that
    /// was deferred the last time this slot was active. The caller
    /// must have observed the slot's fence signaled.
    pub(crate) fn begin_frame_slot(&self, slot: usize) {
        let mut deleters = self
            .d_internal
            .write()
            .unwrap()
            .deletion_queue
            .begin_slot(slot);
        // Run outside the lock; deleters never reenter the caches
        while let Some(deleter) = deleters.pop_front() {
            deleter();
        }
    }

    /// Tear down all deferred state. Requires an idle device; used
    /// at renderer shutdown. Panics in debug builds if any cache
    /// still holds referenced entries.
    pub(crate) fn drain_deferred_state(&self) {
        self.wait_idle();
        let mut deleters = {
            let mut internal = self.d_internal.write().unwrap();
            let DeviceInternal {
                ref mut static_material_descriptors,
                ref mut deletion_queue,
                ref shader_cache,
                ref layout_cache,
                ref pso_cache,
                ref render_pass_cache,
                ..
            } = *internal;
            static_material_descriptors.release(&self.dev, deletion_queue);
            shader_cache.assert_empty();
            layout_cache.assert_empty();
            pso_cache.assert_empty();
            render_pass_cache.assert_empty();
            deletion_queue.drain_all()
        };
        while let Some(deleter) = deleters.pop_front() {
            deleter();
        }
    }

    // ---------------- Cache access ----------------

    pub fn get_shader_module(&self, file: &str, bytecode: &[u32]) -> Result<vk::ShaderModule> {
        self.d_internal
            .write()
            .unwrap()
            .shader_cache
            .get(&self.dev, file, bytecode)
    }

    pub fn free_shader_module(&self, module: vk::ShaderModule) {
        let mut internal = self.d_internal.write().unwrap();
        let DeviceInternal {
            ref mut shader_cache,
            ref mut deletion_queue,
            ..
        } = *internal;
        shader_cache.free(&self.dev, deletion_queue, module);
    }

    pub fn shader_module_ref_count(&self, module: vk::ShaderModule) -> u32 {
        self.d_internal
            .read()
            .unwrap()
            .shader_cache
            .ref_count(module)
    }

    pub(crate) fn has_shader_module(&self, file: &str) -> bool {
        self.d_internal.read().unwrap().shader_cache.contains(file)
    }

    pub fn get_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        self.d_internal
            .write()
            .unwrap()
            .layout_cache
            .get_set_layout(&self.dev, bindings)
    }

    pub fn free_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut internal = self.d_internal.write().unwrap();
        let DeviceInternal {
            ref mut layout_cache,
            ref mut deletion_queue,
            ..
        } = *internal;
        layout_cache.free_set_layout(&self.dev, deletion_queue, layout);
    }

    pub(crate) fn get_pipeline_layout(
        &self,
        desc: &DescriptorLayoutDesc,
    ) -> Result<PipelineLayoutHandles> {
        let mut internal = self.d_internal.write().unwrap();
        let global = internal.global_set_layout;
        let DeviceInternal {
            ref mut layout_cache,
            ref mut deletion_queue,
            ..
        } = *internal;
        layout_cache.get_pipeline_layout(&self.dev, deletion_queue, desc, global)
    }

    pub(crate) fn free_pipeline_layout(&self, layout: vk::PipelineLayout) {
        let mut internal = self.d_internal.write().unwrap();
        let DeviceInternal {
            ref mut layout_cache,
            ref mut deletion_queue,
            ..
        } = *internal;
        layout_cache.free_pipeline_layout(&self.dev, deletion_queue, layout);
    }

    pub fn pipeline_layout_ref_count(&self, layout: vk::PipelineLayout) -> u32 {
        self.d_internal
            .read()
            .unwrap()
            .layout_cache
            .pipeline_layout_ref_count(layout)
    }

    /// Look up or compile the pipeline for (shader, meta material,
    /// render pass, subpass)
    pub fn get_pipeline_state(
        &self,
        shader: &Arc<Shader>,
        meta: MetaMaterial,
        render_pass: vk::RenderPass,
        subpass: u32,
    ) -> Result<vk::Pipeline> {
        let shader_id = Arc::as_ptr(shader) as usize;
        self.d_internal.write().unwrap().pso_cache.get(
            &self.dev,
            shader.as_ref(),
            shader_id,
            meta,
            render_pass,
            subpass,
            self.gpu_info.supports_wireframe,
        )
    }

    pub fn free_pipeline_state(&self, pipeline: vk::Pipeline) {
        let mut internal = self.d_internal.write().unwrap();
        let DeviceInternal {
            ref mut pso_cache,
            ref mut deletion_queue,
            ..
        } = *internal;
        pso_cache.free(&self.dev, deletion_queue, pipeline);
    }

    /// The render pipeline registers its set 0 layout here so that
    /// shader pipeline layouts bind against it
    pub fn set_global_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.d_internal.write().unwrap().global_set_layout = layout;
    }

    pub fn global_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.d_internal.read().unwrap().global_set_layout
    }

    pub fn allocate_static_material_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.d_internal
            .write()
            .unwrap()
            .static_material_descriptors
            .allocate(&self.dev, layout)
    }

    pub fn free_static_material_descriptor_set(&self, set: vk::DescriptorSet) {
        self.d_internal
            .write()
            .unwrap()
            .static_material_descriptors
            .free(&self.dev, set);
    }

    // ---------------- Blocking uploads ----------------

    /// One-shot staging buffer, command buffer and fence on the
    /// transfer queue. Returns once the copy completed.
    fn with_transfer_submit<F: FnOnce(&ash::Device, vk::CommandBuffer, vk::Buffer)>(
        &self,
        data: &[u8],
        record: F,
    ) -> Result<()> {
        let (staging, staging_mem) = self.create_buffer_with_size(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data.len() as u64,
        )?;
        let map = self.map_memory_ptr(staging_mem, data.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), map, data.len());
        }

        let internal = self.d_internal.write().unwrap();
        let cbuf = self.create_command_buffers(internal.transfer_cmd_pool, 1)?[0];
        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.dev
                .begin_command_buffer(cbuf, &begin_info)
                .or(Err(SquallError::INVALID))?;

            record(&self.dev, cbuf, staging);

            self.dev
                .end_command_buffer(cbuf)
                .or(Err(SquallError::INVALID))?;

            let fence = self
                .dev
                .create_fence(&vk::FenceCreateInfo::builder(), None)
                .or(Err(SquallError::CREATION_FAILED))?;
            let cbufs = [cbuf];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&cbufs).build();
            self.dev
                .queue_submit(internal.transfer_queue, &[submit_info], fence)
                .expect("Could not submit buffer to queue");
            self.dev
                .wait_for_fences(&[fence], true, u64::MAX)
                .expect("Could not wait for transfer fence");

            self.dev.destroy_fence(fence, None);
            self.dev
                .free_command_buffers(internal.transfer_cmd_pool, &cbufs);
            self.dev.destroy_buffer(staging, None);
            self.dev.free_memory(staging_mem, None);
        }
        Ok(())
    }

    /// Blocking buffer upload through the transfer queue
    pub fn upload_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let dest = buffer.vk_buffer();
        let size = data.len() as u64;
        self.with_transfer_submit(data, |dev, cbuf, staging| unsafe {
            dev.cmd_copy_buffer(
                cbuf,
                staging,
                dest,
                &[vk::BufferCopy::builder()
                    .src_offset(0)
                    .dst_offset(offset)
                    .size(size)
                    .build()],
            );
        })
    }

    /// Blocking image upload with automatic layout transitions.
    ///
    /// The payload is tightly packed `width * height` texels of
    /// `bytes_per_pixel` each. The layer is moved into TransferDst,
    /// filled from staging, then moved to ShaderRead. The image's
    /// tracked layer layout is updated to match what the GPU will
    /// observe.
    pub fn upload_image(
        &self,
        image: &Image,
        layer: u32,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        data: &[u8],
    ) -> Result<()> {
        if data.len() as u64 != width as u64 * height as u64 * bytes_per_pixel as u64 {
            log::error!("Image payload size does not match its dimensions");
            return Err(SquallError::INVALID);
        }
        let vk_image = image.vk_image();
        let old_layout = image.layout(layer);
        self.with_transfer_submit(data, |dev, cbuf, staging| unsafe {
            let range = vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(layer)
                .layer_count(1)
                .build();

            // into the transfer layout
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .image(vk_image)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(old_layout)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(range)
                .build();
            dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            dev.cmd_copy_buffer_to_image(
                cbuf,
                staging,
                vk_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[vk::BufferImageCopy::builder()
                    .buffer_offset(0)
                    // 0 means tightly packed
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(
                        vk::ImageSubresourceLayers::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(0)
                            .base_array_layer(layer)
                            .layer_count(1)
                            .build(),
                    )
                    .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                    .image_extent(vk::Extent3D {
                        width: width,
                        height: height,
                        depth: 1,
                    })
                    .build()],
            );

            // and out to the shader read layout
            let to_shader = vk::ImageMemoryBarrier::builder()
                .image(vk_image)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(range)
                .build();
            dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        })?;

        image.set_layout(layer, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(())
    }

    /// Record a buffer memory barrier so later reads in this frame
    /// observe a staged copy
    pub(crate) fn cmd_buffer_barrier(
        &self,
        cbuf: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::BufferMemoryBarrier::builder()
            .buffer(buffer)
            .offset(offset)
            .size(size)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .build();
        unsafe {
            self.dev.cmd_pipeline_barrier(
                cbuf,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // first wait for the device to finish working
            self.dev.device_wait_idle().unwrap();
            let internal = self.d_internal.get_mut().unwrap();
            self.dev
                .destroy_command_pool(internal.transfer_cmd_pool, None);
            self.dev.destroy_device(None);
        }
    }
}
