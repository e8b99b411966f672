// The frame scheduler
//
// Renders N frames in flight. Every tick waits on the slot's
// fence, drains the deletions that slot deferred a full cycle ago,
// rewinds the slot's staging and dynamic descriptors, records the
// frame through the active pipeline, then submits and presents
// against the slot's semaphore pair.
use ash::extensions::khr;
use ash::vk;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::batch::BatchRenderer;
use crate::buffer::Buffer;
use crate::device::{CardSelector, Device};
use crate::display::{Display, SurfaceType};
use crate::frame::FrameResource;
use crate::image::{Image, ImageView};
use crate::instance::Instance;
use crate::material::MaterialInstance;
use crate::pipeline::Pipeline;
use crate::{Result, SquallError, GLOBAL_DESCRIPTOR_SET, MATERIAL_DESCRIPTOR_SET};
use utils::log;

/// Settings an application can persist across runs
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct RenderSettings {
    /// Frames in flight, clamped to [1, 3]
    pub render_ahead_count: u8,
    pub enable_vsync: bool,
    pub use_triple_buffering: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            render_ahead_count: 2,
            enable_vsync: true,
            use_triple_buffering: true,
        }
    }
}

pub struct RendererStartupInfo {
    pub settings: RenderSettings,
    /// Initial capacity of the quad batcher, in quads
    pub quad_budget: u32,
    pub surface: SurfaceType,
    /// Picks the GPU from the enumerated candidates; the first one
    /// wins when unset
    pub card_selector: Option<CardSelector>,
}

impl Default for RendererStartupInfo {
    fn default() -> Self {
        Self {
            settings: RenderSettings::default(),
            quad_budget: 2048,
            surface: SurfaceType::Headless,
            card_selector: None,
        }
    }
}

/// Recording parameters handed to the pipeline each frame
#[derive(Copy, Clone)]
pub struct RecordParams {
    pub cbuf: vk::CommandBuffer,
    pub frame: usize,
}

pub struct Renderer {
    r_inst: Arc<Instance>,
    r_dev: Arc<Device>,
    r_display: Display,
    r_graphics_pool: vk::CommandPool,
    r_frames: Vec<FrameResource>,
    /// k mod renderAhead, advanced at the end of every tick
    r_current_frame: usize,
    r_settings: RenderSettings,
    /// A present reported out-of-date; recreate before next frame
    r_needs_resize: bool,
    /// Cached from the pipeline so binds don't need it passed in
    r_global_set: vk::DescriptorSet,
    /// Currently bound material instance, cleared per frame
    r_current_instance: Option<Arc<MaterialInstance>>,
    pub(crate) r_batch: Option<BatchRenderer>,
}

impl Renderer {
    /// Bring up the whole core: instance, device, display, frame
    /// resources, then the pipeline and the quad batcher.
    pub fn startup(info: RendererStartupInfo, pipeline: &mut dyn Pipeline) -> Result<Renderer> {
        let mut settings = info.settings;
        settings.render_ahead_count = settings.render_ahead_count.max(1).min(3);
        let render_ahead = settings.render_ahead_count as usize;

        let mut extensions = info.surface.instance_extensions();
        if let SurfaceType::Window { .. } = info.surface {
            extensions.push(khr::Surface::name());
        }
        let instance = Arc::new(Instance::new(&extensions)?);
        let dev = Device::new(instance.clone(), info.card_selector.as_ref(), render_ahead)?;
        let display = Display::new(&dev, info.surface, &settings)?;

        let graphics_pool = dev.create_command_pool(dev.graphics_family)?;
        let mut frames = Vec::with_capacity(render_ahead);
        for _ in 0..render_ahead {
            frames.push(FrameResource::new(&dev, graphics_pool)?);
        }

        let mut rend = Renderer {
            r_inst: instance,
            r_dev: dev,
            r_display: display,
            r_graphics_pool: graphics_pool,
            r_frames: frames,
            r_current_frame: 0,
            r_settings: settings,
            r_needs_resize: false,
            r_global_set: vk::DescriptorSet::null(),
            r_current_instance: None,
            r_batch: None,
        };

        pipeline.startup(&mut rend)?;
        rend.r_dev
            .set_global_descriptor_set_layout(pipeline.global_descriptor_set_layout());
        rend.r_global_set = pipeline.global_descriptor_set();

        rend.r_batch = Some(BatchRenderer::new(
            &rend.r_dev,
            info.quad_budget,
            render_ahead,
        )?);

        Ok(rend)
    }

    /// Tear everything down deterministically. All user-held
    /// resources (shaders, materials, buffers) must already be
    /// dropped, or the cache emptiness asserts fire.
    pub fn shutdown(mut self, pipeline: &mut dyn Pipeline) {
        self.r_dev.wait_idle();
        self.r_current_instance = None;
        pipeline.shutdown(&mut self);
        self.r_dev
            .set_global_descriptor_set_layout(vk::DescriptorSetLayout::null());
        if let Some(mut batch) = self.r_batch.take() {
            batch.destroy(&self.r_dev);
        }
        for frame in self.r_frames.iter_mut() {
            frame.destroy(&self.r_dev);
        }
        self.r_frames.clear();
        self.r_display.destroy();
        unsafe {
            self.r_dev
                .vk_device()
                .destroy_command_pool(self.r_graphics_pool, None);
        }
        self.r_dev.drain_deferred_state();
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.r_dev
    }

    pub fn display(&self) -> &Display {
        &self.r_display
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.r_settings
    }

    pub fn current_frame(&self) -> usize {
        self.r_current_frame
    }

    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.r_frames[self.r_current_frame].f_cbuf
    }

    /// Enqueue a deleter on the current frame. It runs when this
    /// frame slot's fence has been observed again, renderAhead
    /// frames from now.
    pub fn pending_delete(&self, deleter: Box<dyn FnOnce() + Send>) {
        self.r_dev.pending_delete(deleter);
    }

    // ---------------- The per-frame procedure ----------------

    /// Render and present one frame
    pub fn tick(&mut self, pipeline: &mut dyn Pipeline) -> Result<()> {
        if self.r_needs_resize {
            self.resize(pipeline)?;
        }

        let frame_idx = self.r_current_frame;
        let raw_dev = self.r_dev.vk_device().clone();

        // 1. wait for this slot's previous submission to retire
        unsafe {
            raw_dev
                .wait_for_fences(&[self.r_frames[frame_idx].f_in_flight], true, u64::MAX)
                .expect("Could not wait for frame fence");
        }

        // 2. the fence has been observed: run this slot's deferred
        // deleters, rewind its staging and dynamic descriptors
        self.r_dev.begin_frame_slot(frame_idx);
        self.r_frames[frame_idx].f_staging.reset();
        if let Some(batch) = self.r_batch.as_mut() {
            batch.tick(&self.r_dev, frame_idx);
        }
        self.r_current_instance = None;

        // 3. begin recording
        let cbuf = self.r_frames[frame_idx].f_cbuf;
        self.begin_command_buffer(cbuf)?;

        // 4. acquire the next swapchain image; out-of-date triggers
        // a resize and a restart of the acquire
        let image_available = self.r_frames[frame_idx].f_image_available;
        let mut attempts = 0;
        loop {
            match self.r_display.acquire_next_image(image_available) {
                Ok(()) => break,
                Err(SquallError::OUT_OF_DATE) if attempts < 1 => {
                    attempts += 1;
                    unsafe {
                        raw_dev
                            .end_command_buffer(cbuf)
                            .or(Err(SquallError::INVALID))?;
                    }
                    self.resize(pipeline)?;
                    self.begin_command_buffer(cbuf)?;
                }
                Err(e) => {
                    unsafe {
                        let _ = raw_dev.end_command_buffer(cbuf);
                    }
                    return Err(e);
                }
            }
        }

        // 5. record the frame
        let params = RecordParams {
            cbuf: cbuf,
            frame: frame_idx,
        };
        let target = pipeline.render(self, &params)?;
        if let Some(view) = target.as_ref() {
            self.record_present_blit(cbuf, view);
        }

        // 6. submit on the graphics queue
        unsafe {
            raw_dev
                .end_command_buffer(cbuf)
                .or(Err(SquallError::INVALID))?;

            let frame = &self.r_frames[frame_idx];
            raw_dev
                .reset_fences(&[frame.f_in_flight])
                .expect("Could not reset frame fence");

            let cbufs = [cbuf];
            let wait_semas = [frame.f_image_available];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semas = [frame.f_render_finished];
            let mut submit_info = vk::SubmitInfo::builder().command_buffers(&cbufs);
            if self.r_display.uses_present_semaphores() {
                submit_info = submit_info
                    .wait_semaphores(&wait_semas)
                    .wait_dst_stage_mask(&wait_stages)
                    .signal_semaphores(&signal_semas);
            }
            raw_dev
                .queue_submit(
                    self.r_dev.graphics_queue,
                    &[submit_info.build()],
                    frame.f_in_flight,
                )
                .expect("Could not submit frame to graphics queue");
        }

        // 7. present. Out-of-date here only schedules the resize
        // for the next tick.
        match self.r_display.present(
            self.r_dev.graphics_queue,
            self.r_frames[frame_idx].f_render_finished,
        ) {
            Ok(()) => {}
            Err(SquallError::OUT_OF_DATE) => {
                log::warning!("Swapchain out of date at present, scheduling a resize");
                self.r_needs_resize = true;
            }
            Err(e) => return Err(e),
        }

        // 8. advance
        self.r_current_frame = (frame_idx + 1) % self.r_frames.len();
        Ok(())
    }

    fn begin_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        unsafe {
            let raw_dev = self.r_dev.vk_device();
            raw_dev
                .reset_command_buffer(cbuf, vk::CommandBufferResetFlags::RELEASE_RESOURCES)
                .or(Err(SquallError::INVALID))?;
            let info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            raw_dev
                .begin_command_buffer(cbuf, &info)
                .or(Err(SquallError::INVALID))
        }
    }

    /// Blit the pipeline's composed view onto the current
    /// presentable image and move it to its final layout
    fn record_present_blit(&self, cbuf: vk::CommandBuffer, view: &Arc<ImageView>) {
        let raw_dev = self.r_dev.vk_device();
        let src_image = view.image();
        let src_extent = src_image.extent();
        let dst = self.r_display.current_image();
        let dst_extent = self.r_display.resolution();
        let layer = view.base_layer();

        unsafe {
            let src_range = vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(layer)
                .layer_count(1)
                .build();
            let dst_range = vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1)
                .build();

            let barriers = [
                vk::ImageMemoryBarrier::builder()
                    .image(src_image.vk_image())
                    .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                    .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .old_layout(src_image.layout(layer))
                    .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(src_range)
                    .build(),
                vk::ImageMemoryBarrier::builder()
                    .image(dst)
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(dst_range)
                    .build(),
            ];
            raw_dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
            src_image.set_layout(layer, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

            let blit = vk::ImageBlit::builder()
                .src_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(layer)
                        .layer_count(1)
                        .build(),
                )
                .src_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: src_extent.width as i32,
                        y: src_extent.height as i32,
                        z: 1,
                    },
                ])
                .dst_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .dst_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: dst_extent.width as i32,
                        y: dst_extent.height as i32,
                        z: 1,
                    },
                ])
                .build();
            raw_dev.cmd_blit_image(
                cbuf,
                src_image.vk_image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::NEAREST,
            );

            let final_layout = match self.r_display.uses_present_semaphores() {
                true => vk::ImageLayout::PRESENT_SRC_KHR,
                false => vk::ImageLayout::GENERAL,
            };
            let present_barrier = vk::ImageMemoryBarrier::builder()
                .image(dst)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(final_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(dst_range)
                .build();
            raw_dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[present_barrier],
            );
        }
    }

    /// Swapchain recreation after a presented out-of-date
    pub fn resize(&mut self, pipeline: &mut dyn Pipeline) -> Result<()> {
        self.r_dev.wait_idle();
        self.r_display.recreate()?;
        pipeline.resize(self)?;
        self.r_global_set = pipeline.global_descriptor_set();
        self.r_needs_resize = false;
        Ok(())
    }

    // ---------------- Uploads ----------------

    /// Blocking upload through the transfer queue
    pub fn upload_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.r_dev.upload_buffer(buffer, offset, data)
    }

    /// In-frame upload through the current frame's staging buffer.
    ///
    /// `src_stage`/`src_access` fence off earlier reads of the
    /// destination range before the transfer overwrites it (pass
    /// empty flags when nothing read it this frame); `dst_stage`/
    /// `dst_access` make reads after this call observe the new
    /// contents. Payloads too large for dynamic staging fall back
    /// to the blocking path.
    ///
    /// Only legal while the frame is being recorded, i.e. from
    /// within Pipeline::render.
    pub fn upload_buffer_dynamic(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        data: &[u8],
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) -> Result<()> {
        let frame_idx = self.r_current_frame;
        let cbuf = self.r_frames[frame_idx].f_cbuf;
        if !src_stage.is_empty() {
            self.r_dev.cmd_buffer_barrier(
                cbuf,
                buffer.vk_buffer(),
                offset,
                data.len() as u64,
                src_stage,
                src_access,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            );
        }
        match self.r_frames[frame_idx]
            .f_staging
            .upload_buffer(&self.r_dev, cbuf, buffer, offset, data)
        {
            Ok(()) => {
                self.r_dev.cmd_buffer_barrier(
                    cbuf,
                    buffer.vk_buffer(),
                    offset,
                    data.len() as u64,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                    dst_stage,
                    dst_access,
                );
                Ok(())
            }
            Err(SquallError::UPLOAD_TOO_LARGE) => {
                log::warning!(
                    "Payload of {} bytes is too large for dynamic staging, falling back to a blocking upload",
                    data.len()
                );
                self.r_dev.upload_buffer(buffer, offset, data)
            }
            Err(e) => Err(e),
        }
    }

    /// Blocking image upload with automatic layout transitions
    pub fn upload_image(
        &self,
        image: &Image,
        layer: u32,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        data: &[u8],
    ) -> Result<()> {
        self.r_dev
            .upload_image(image, layer, width, height, bytes_per_pixel, data)
    }

    pub fn allocate_static_material_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.r_dev.allocate_static_material_descriptor_set(layout)
    }

    pub fn free_static_material_descriptor_set(&self, set: vk::DescriptorSet) {
        self.r_dev.free_static_material_descriptor_set(set)
    }

    // ---------------- Material binding ----------------

    /// Bind a material instance for subsequent draws.
    ///
    /// Rebinding the same instance is free. A new pipeline state is
    /// bound only when it differs from the current one, and the
    /// pass-global set is bound once per frame at the first bind.
    pub fn bind_material_instance(&mut self, instance: &Arc<MaterialInstance>) {
        if let Some(current) = self.r_current_instance.as_ref() {
            if Arc::ptr_eq(current, instance) {
                return;
            }
        }
        let cbuf = self.current_command_buffer();
        let raw_dev = self.r_dev.vk_device();
        let first_bind = self.r_current_instance.is_none();
        let pso_differs = match self.r_current_instance.as_ref() {
            Some(current) => current.pipeline_state() != instance.pipeline_state(),
            None => true,
        };

        unsafe {
            if pso_differs {
                raw_dev.cmd_bind_pipeline(
                    cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    instance.pipeline_state(),
                );
                if first_bind && self.r_global_set != vk::DescriptorSet::null() {
                    raw_dev.cmd_bind_descriptor_sets(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        instance.shader().pipeline_layout(),
                        GLOBAL_DESCRIPTOR_SET,
                        &[self.r_global_set],
                        &[],
                    );
                }
            }
            let material_set = instance.material().descriptor_set();
            if material_set != vk::DescriptorSet::null() {
                raw_dev.cmd_bind_descriptor_sets(
                    cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    instance.shader().pipeline_layout(),
                    MATERIAL_DESCRIPTOR_SET,
                    &[material_set],
                    &[],
                );
            }
        }
        self.r_current_instance = Some(instance.clone());
    }

    pub fn current_material_instance(&self) -> Option<&Arc<MaterialInstance>> {
        self.r_current_instance.as_ref()
    }

    // ---------------- Quad batching ----------------

    /// Queue one textured or solid quad. Quads accumulate into few
    /// draw calls; texture slots, buffer exhaustion and material
    /// switches flush automatically.
    pub fn draw_quad(
        &mut self,
        rect: cgmath::Vector4<f32>,
        texture: Option<&Arc<crate::image::Texture>>,
        uv: cgmath::Vector4<f32>,
        color: cgmath::Vector4<f32>,
    ) -> Result<()> {
        let mut batch = self.r_batch.take().unwrap();
        let ret = batch.draw_quad(self, rect, texture, uv, color);
        self.r_batch = Some(batch);
        ret
    }

    /// Bind the material the following quads are drawn with,
    /// flushing any pending run first
    pub fn use_batch_material(&mut self, instance: &Arc<MaterialInstance>) -> Result<()> {
        let mut batch = self.r_batch.take().unwrap();
        let ret = batch.use_material(self, instance);
        self.r_batch = Some(batch);
        ret
    }

    /// Issue the draw for everything batched since the last flush
    pub fn flush_batch(&mut self) -> Result<()> {
        let mut batch = self.r_batch.take().unwrap();
        let ret = batch.flush(self);
        self.r_batch = Some(batch);
        ret
    }
}
