// Quad batching
//
// Coalesces many small textured or solid quads into few indexed
// draws. One host visible vertex buffer and one index buffer grow
// by 1.5x when exhausted (the old backing retires through the
// deletion queue, so frames in flight are unaffected). Textures
// resolve into a bounded slot array; filling it flushes the run
// and restarts the table.
use ash::vk;
use cgmath::{Vector2, Vector4};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::descpool::{DescriptorPoolSizes, DynamicDescriptorAllocator};
use crate::device::Device;
use crate::image::Texture;
use crate::material::MaterialInstance;
use crate::renderer::Renderer;
use crate::{
    DescriptorBinding, DescriptorType, Limits, Result, ShaderStageSet, SquallError,
    OBJECT_DESCRIPTOR_SET,
};
use utils::log;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct QuadVertex {
    pub pos: Vector2<f32>,
    /// Slot in the bound texture array, u32::MAX for solid quads
    pub tex_id: u32,
    pub uv: Vector2<f32>,
    pub color: Vector4<f32>,
}

pub struct BatchRenderer {
    /// binding 0: an array of combined image samplers, fragment only
    b_texture_set_layout: vk::DescriptorSetLayout,
    b_allocator: DynamicDescriptorAllocator,

    b_vertex_buffer: Buffer,
    b_index_buffer: Buffer,
    /// Ranges written since the previous flush, in elements
    b_vertex_begin: u32,
    b_vertex_end: u32,
    b_index_begin: u32,
    b_index_end: u32,

    /// The texture slot table for the current run
    b_textures: Vec<Option<Arc<Texture>>>,
    b_num_textures: u32,
    /// Slots this material leaves available for batching
    b_available_textures: u32,

    /// Allocated lazily when a textureless run flushes under a
    /// shader that still declares an object set
    b_empty_set: vk::DescriptorSet,
    b_current_material: Option<Arc<MaterialInstance>>,
    b_buffers_bound: bool,
}

impl BatchRenderer {
    pub(crate) fn new(
        dev: &Arc<Device>,
        quad_budget: u32,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let texture_count = std::cmp::min(
            dev.gpu_info().max_sampler_count,
            Limits::NUM_BATCH_TEXTURES,
        );
        let texture_set_layout = dev.get_descriptor_set_layout(&[DescriptorBinding {
            binding_point: 0,
            array_size: texture_count,
            ty: DescriptorType::CombinedImageSampler,
            stages: ShaderStageSet::FRAGMENT,
        }])?;

        let allocator = DynamicDescriptorAllocator::new(
            DescriptorPoolSizes {
                counts: vec![(DescriptorType::CombinedImageSampler, texture_count)],
                max_sets: 60,
            },
            frames_in_flight,
        );

        let vertex_buffer = Buffer::new(
            dev,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            quad_budget as u64 * 4 * std::mem::size_of::<QuadVertex>() as u64,
            true,
        )?;
        let index_buffer = Buffer::new(
            dev,
            vk::BufferUsageFlags::INDEX_BUFFER,
            quad_budget as u64 * 6 * 4,
            true,
        )?;

        Ok(Self {
            b_texture_set_layout: texture_set_layout,
            b_allocator: allocator,
            b_vertex_buffer: vertex_buffer,
            b_index_buffer: index_buffer,
            b_vertex_begin: 0,
            b_vertex_end: 0,
            b_index_begin: 0,
            b_index_end: 0,
            b_textures: std::iter::repeat(None).take(texture_count as usize).collect(),
            b_num_textures: 0,
            b_available_textures: texture_count,
            b_empty_set: vk::DescriptorSet::null(),
            b_current_material: None,
            b_buffers_bound: false,
        })
    }

    /// Frame reset: dynamic sets die, write offsets rewind
    pub(crate) fn tick(&mut self, dev: &Device, frame: usize) {
        self.b_allocator.reset(dev.vk_device(), frame);
        self.b_empty_set = vk::DescriptorSet::null();
        self.b_vertex_begin = 0;
        self.b_vertex_end = 0;
        self.b_index_begin = 0;
        self.b_index_end = 0;
        for slot in self.b_textures.iter_mut() {
            *slot = None;
        }
        self.b_num_textures = 0;
        self.b_current_material = None;
        self.b_buffers_bound = false;
    }

    fn bind_buffers(&mut self, rend: &Renderer) {
        let cbuf = rend.current_command_buffer();
        unsafe {
            rend.device().vk_device().cmd_bind_vertex_buffers(
                cbuf,
                0,
                &[self.b_vertex_buffer.vk_buffer()],
                &[0],
            );
            rend.device().vk_device().cmd_bind_index_buffer(
                cbuf,
                self.b_index_buffer.vk_buffer(),
                0,
                vk::IndexType::UINT32,
            );
        }
        self.b_buffers_bound = true;
    }

    /// Flush the pending run and switch to a new material
    pub(crate) fn use_material(
        &mut self,
        rend: &mut Renderer,
        instance: &Arc<MaterialInstance>,
    ) -> Result<()> {
        if let Some(current) = self.b_current_material.as_ref() {
            if !Arc::ptr_eq(current, instance) && self.b_index_begin != self.b_index_end {
                self.flush(rend)?;
            }
        }
        self.b_available_textures =
            self.b_textures.len() as u32 - instance.shader().num_textures();
        if self.b_available_textures < 16 {
            log::warning!(
                "This material contains too many textures. Only {} left for batching.",
                self.b_available_textures
            );
        }
        rend.bind_material_instance(instance);
        self.b_current_material = Some(instance.clone());
        if !self.b_buffers_bound {
            self.bind_buffers(rend);
        }
        Ok(())
    }

    pub(crate) fn draw_quad(
        &mut self,
        rend: &mut Renderer,
        rect: Vector4<f32>,
        texture: Option<&Arc<Texture>>,
        uv: Vector4<f32>,
        color: Vector4<f32>,
    ) -> Result<()> {
        let vertices = [
            QuadVertex {
                pos: Vector2::new(rect.x, rect.y),
                tex_id: 0,
                uv: Vector2::new(uv.x, uv.y),
                color: color,
            },
            QuadVertex {
                pos: Vector2::new(rect.x, rect.y + rect.w),
                tex_id: 0,
                uv: Vector2::new(uv.x, uv.y - uv.w),
                color: color,
            },
            QuadVertex {
                pos: Vector2::new(rect.x + rect.z, rect.y + rect.w),
                tex_id: 0,
                uv: Vector2::new(uv.x + uv.z, uv.y - uv.w),
                color: color,
            },
            QuadVertex {
                pos: Vector2::new(rect.x + rect.z, rect.y),
                tex_id: 0,
                uv: Vector2::new(uv.x + uv.z, uv.y),
                color: color,
            },
        ];
        self.push_mesh_data(rend, &vertices, &[0, 1, 2, 0, 2, 3], texture)
    }

    fn push_mesh_data(
        &mut self,
        rend: &mut Renderer,
        vertices: &[QuadVertex],
        indices: &[u32],
        texture: Option<&Arc<Texture>>,
    ) -> Result<()> {
        // Allocate a texture slot, reusing a bound slot when the
        // texture already participates in this run
        let mut tex_id = u32::MAX;
        if let Some(texture) = texture {
            let mut found = false;
            for i in 0..self.b_available_textures as usize {
                match self.b_textures[i].as_ref() {
                    Some(bound) => {
                        if Arc::ptr_eq(bound, texture) {
                            tex_id = i as u32;
                            found = true;
                            break;
                        }
                    }
                    None => {
                        self.b_textures[i] = Some(texture.clone());
                        tex_id = i as u32;
                        self.b_num_textures = i as u32 + 1;
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                // Slot table is full: draw what we have and restart
                self.flush(rend)?;
                self.b_textures[0] = Some(texture.clone());
                tex_id = 0;
                self.b_num_textures = 1;
            }
        }

        // Grow the buffers by 1.5x when the batch no longer fits
        let vertex_stride = std::mem::size_of::<QuadVertex>() as u64;
        if (self.b_vertex_end as u64 + vertices.len() as u64) * vertex_stride
            > self.b_vertex_buffer.size()
        {
            if self.b_vertex_begin != self.b_vertex_end {
                self.flush(rend)?;
            }
            let new_size = self.b_vertex_buffer.size() + (self.b_vertex_buffer.size() >> 1);
            if self.b_vertex_buffer.resize(new_size).is_err() {
                log::error!("Cannot draw quad batch anymore. VRAM ran out.");
                return Err(SquallError::OUT_OF_VRAM);
            }
            self.b_vertex_begin = 0;
            self.b_vertex_end = 0;
            self.bind_buffers(rend);
        }
        if (self.b_index_end as u64 + indices.len() as u64) * 4 > self.b_index_buffer.size() {
            if self.b_index_begin != self.b_index_end {
                self.flush(rend)?;
            }
            let new_size = self.b_index_buffer.size() + (self.b_index_buffer.size() >> 1);
            if self.b_index_buffer.resize(new_size).is_err() {
                log::error!("Cannot draw quad batch anymore. VRAM ran out.");
                return Err(SquallError::OUT_OF_VRAM);
            }
            self.b_index_begin = 0;
            self.b_index_end = 0;
            self.bind_buffers(rend);
        }

        unsafe {
            let index_map = self.b_index_buffer.map() as *mut u32;
            for index in indices {
                index_map
                    .add(self.b_index_end as usize)
                    .write(self.b_vertex_end + index);
                self.b_index_end += 1;
            }
            let vertex_map = self.b_vertex_buffer.map() as *mut QuadVertex;
            for vertex in vertices {
                let mut copy = *vertex;
                copy.tex_id = tex_id;
                vertex_map.add(self.b_vertex_end as usize).write(copy);
                self.b_vertex_end += 1;
            }
        }
        Ok(())
    }

    /// Draw the run accumulated since the previous flush
    pub(crate) fn flush(&mut self, rend: &mut Renderer) -> Result<()> {
        let instance = match self.b_current_material.as_ref() {
            Some(m) => m.clone(),
            None => return Ok(()),
        };
        let cbuf = rend.current_command_buffer();
        let raw_dev = rend.device().vk_device().clone();
        let frame = rend.current_frame();

        if self.b_textures[0].is_some() {
            // Write the slot table into a fresh one-frame set
            let set = match self.b_allocator.allocate(
                &raw_dev,
                frame,
                self.b_texture_set_layout,
            ) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("Cannot allocate descriptor for quads. Rendering failed.");
                    self.b_vertex_begin = self.b_vertex_end;
                    self.b_index_begin = self.b_index_end;
                    return Err(e);
                }
            };

            let infos: Vec<vk::DescriptorImageInfo> = self.b_textures
                [0..self.b_num_textures as usize]
                .iter()
                .map(|texture| {
                    let texture = texture.as_ref().unwrap();
                    vk::DescriptorImageInfo::builder()
                        .sampler(texture.sampler())
                        .image_view(texture.view().vk_image_view())
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .build()
                })
                .collect();
            let writes = [vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&infos)
                .build()];
            unsafe {
                raw_dev.update_descriptor_sets(&writes, &[]);
                raw_dev.cmd_bind_descriptor_sets(
                    cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    instance.shader().pipeline_layout(),
                    OBJECT_DESCRIPTOR_SET,
                    &[set],
                    &[],
                );
            }
            for slot in self.b_textures.iter_mut() {
                *slot = None;
            }
            self.b_num_textures = 0;
        } else {
            // No textures in this run, but the shader may still
            // declare an object set that has to be bound
            let object_layout = instance.shader().object_layout();
            if object_layout != vk::DescriptorSetLayout::null() {
                if self.b_empty_set == vk::DescriptorSet::null() {
                    self.b_empty_set =
                        match self.b_allocator.allocate(&raw_dev, frame, object_layout) {
                            Ok(s) => s,
                            Err(e) => {
                                log::error!(
                                    "Cannot allocate descriptor for quads. Rendering failed."
                                );
                                self.b_vertex_begin = self.b_vertex_end;
                                self.b_index_begin = self.b_index_end;
                                return Err(e);
                            }
                        };
                }
                unsafe {
                    raw_dev.cmd_bind_descriptor_sets(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        instance.shader().pipeline_layout(),
                        OBJECT_DESCRIPTOR_SET,
                        &[self.b_empty_set],
                        &[],
                    );
                }
            }
        }

        if self.b_index_end != self.b_index_begin {
            unsafe {
                raw_dev.cmd_draw_indexed(
                    cbuf,
                    self.b_index_end - self.b_index_begin,
                    1,
                    self.b_index_begin,
                    0,
                    0,
                );
            }
        }
        self.b_vertex_begin = self.b_vertex_end;
        self.b_index_begin = self.b_index_end;
        Ok(())
    }

    pub(crate) fn destroy(&mut self, dev: &Arc<Device>) {
        let mut internal = dev.d_internal.write().unwrap();
        let crate::device::DeviceInternal {
            ref mut deletion_queue,
            ..
        } = *internal;
        self.b_allocator.release(dev.vk_device(), deletion_queue);
        drop(internal);
        dev.free_descriptor_set_layout(self.b_texture_set_layout);
        // the vertex/index Buffer wrappers retire themselves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn vertex_layout_matches_shader_interface() {
        // {pos: vec2, texID: uint, uv: vec2, color: vec4}, tightly
        // packed in declaration order
        assert_eq!(offset_of!(QuadVertex, pos), 0);
        assert_eq!(offset_of!(QuadVertex, tex_id), 8);
        assert_eq!(offset_of!(QuadVertex, uv), 12);
        assert_eq!(offset_of!(QuadVertex, color), 20);
        assert_eq!(std::mem::size_of::<QuadVertex>(), 36);
    }
}
