// Materials and material instances
//
// A Material owns the uniform data and texture set one shader
// parameterization needs: a device-local uniform buffer, a static
// descriptor set, and pre-baked pipeline states per material
// domain. A MaterialInstance pins a material to one domain's
// (render pass, subpass, meta material) triple through the
// pipeline-state cache.
use ash::vk;
use cgmath::{Vector2, Vector3, Vector4};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::device::Device;
use crate::image::Texture;
use crate::pipeline::Pipeline;
use crate::pipeline_state::MetaMaterial;
use crate::shader::{Shader, ShaderProperty};
use crate::{DataType, Result, SquallError};
use utils::log;

/// Staged construction data for a Material. Property setters
/// validate names and types against the shader's schema before a
/// single byte reaches the GPU.
pub struct MaterialInitializer {
    m_dev: Arc<Device>,
    m_shader: Option<Arc<Shader>>,
    m_uniform_data: Vec<u8>,
    /// (texture binding point, textures) per declared texture array.
    /// Unclaimed entries hold u32::MAX until a texture names them.
    m_textures: Vec<(u32, Vec<Option<Arc<Texture>>>)>,
    /// Pre-resolved pipeline state per material domain
    m_pipeline_states: Vec<vk::Pipeline>,
}

impl MaterialInitializer {
    pub fn new(dev: &Arc<Device>, shader: Option<Arc<Shader>>) -> Self {
        let mut ret = Self {
            m_dev: dev.clone(),
            m_shader: None,
            m_uniform_data: Vec::new(),
            m_textures: Vec::new(),
            m_pipeline_states: Vec::new(),
        };
        if let Some(shader) = shader {
            if shader.is_valid() {
                ret.m_uniform_data = vec![0; shader.uniform_buffer_size() as usize];
                ret.m_textures = std::iter::repeat((u32::MAX, Vec::new()))
                    .take(shader.num_texture_arrays() as usize)
                    .collect();
                ret.m_shader = Some(shader);
            }
        }
        ret
    }

    /// Take a prebuilt uniform image instead of zeroes. The byte
    /// count must equal the shader's reported size.
    pub fn with_data(dev: &Arc<Device>, shader: Option<Arc<Shader>>, data: Vec<u8>) -> Self {
        let mut ret = Self::new(dev, shader);
        if ret.m_shader.is_some() {
            if data.len() != ret.m_uniform_data.len() {
                log::error!("Uniform data size does not match the shader's uniform buffer size.");
                ret.m_shader = None;
                ret.m_uniform_data.clear();
                ret.m_textures.clear();
            } else {
                ret.m_uniform_data = data;
            }
        }
        ret
    }

    pub fn is_valid(&self) -> bool {
        self.m_shader.is_some()
    }

    fn set_vector_raw(&mut self, name: &str, ty: DataType, bytes: &[u8]) -> bool {
        let shader = match self.m_shader.as_ref() {
            Some(s) => s,
            None => return false,
        };
        match shader.property(name) {
            Some(ShaderProperty::Vector {
                ty: declared,
                offset,
            }) if declared == ty => {
                let offset = offset as usize;
                self.m_uniform_data[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            _ => {
                log::error!("Property {} is not a {:?}.", name, ty);
                false
            }
        }
    }

    pub fn set_float(&mut self, name: &str, value: f32) -> bool {
        self.set_vector_raw(name, DataType::Float, &value.to_ne_bytes())
    }

    pub fn set_vec2(&mut self, name: &str, value: Vector2<f32>) -> bool {
        self.set_vector_raw(name, DataType::Vec2, as_bytes(&value))
    }

    pub fn set_vec3(&mut self, name: &str, value: Vector3<f32>) -> bool {
        self.set_vector_raw(name, DataType::Vec3, as_bytes(&value))
    }

    pub fn set_vec4(&mut self, name: &str, value: Vector4<f32>) -> bool {
        self.set_vector_raw(name, DataType::Vec4, as_bytes(&value))
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> bool {
        self.set_vector_raw(name, DataType::Int, &value.to_ne_bytes())
    }

    pub fn set_ivec2(&mut self, name: &str, value: Vector2<i32>) -> bool {
        self.set_vector_raw(name, DataType::IVec2, as_bytes(&value))
    }

    pub fn set_ivec3(&mut self, name: &str, value: Vector3<i32>) -> bool {
        self.set_vector_raw(name, DataType::IVec3, as_bytes(&value))
    }

    pub fn set_ivec4(&mut self, name: &str, value: Vector4<i32>) -> bool {
        self.set_vector_raw(name, DataType::IVec4, as_bytes(&value))
    }

    pub fn set_uint(&mut self, name: &str, value: u32) -> bool {
        self.set_vector_raw(name, DataType::UInt, &value.to_ne_bytes())
    }

    pub fn set_uvec2(&mut self, name: &str, value: Vector2<u32>) -> bool {
        self.set_vector_raw(name, DataType::UVec2, as_bytes(&value))
    }

    pub fn set_uvec3(&mut self, name: &str, value: Vector3<u32>) -> bool {
        self.set_vector_raw(name, DataType::UVec3, as_bytes(&value))
    }

    pub fn set_uvec4(&mut self, name: &str, value: Vector4<u32>) -> bool {
        self.set_vector_raw(name, DataType::UVec4, as_bytes(&value))
    }

    /// Bind one texture of a declared texture property. `index` is
    /// the element within the property's array.
    pub fn set_texture(&mut self, name: &str, index: u32, texture: &Arc<Texture>) -> bool {
        let shader = match self.m_shader.as_ref() {
            Some(s) => s,
            None => return false,
        };
        if !texture.is_valid() {
            return false;
        }
        let (binding, dim) = match shader.property(name) {
            Some(ShaderProperty::Texture { binding, dim, .. }) => (binding, dim),
            _ => {
                log::error!("Property {} is not a texture.", name);
                return false;
            }
        };
        if dim != texture.view().dim() {
            log::error!("Type of property {} does not match input parameter.", name);
            return false;
        }
        for entry in self.m_textures.iter_mut() {
            if entry.0 == binding || entry.0 == u32::MAX {
                entry.0 = binding;
                let list = &mut entry.1;
                if list.len() < index as usize + 1 {
                    list.resize(index as usize + 1, None);
                }
                list[index as usize] = Some(texture.clone());
                return true;
            }
        }
        return false;
    }

    /// Resolve `domain` through the active pipeline and pre-bake
    /// the pipeline state the material will use there
    pub fn add_material_domain(
        &mut self,
        pipeline: &dyn Pipeline,
        domain: u32,
        shader: &Arc<Shader>,
    ) -> bool {
        if self.m_pipeline_states.len() < domain as usize + 1 {
            self.m_pipeline_states
                .resize(domain as usize + 1, vk::Pipeline::null());
        }
        let info = pipeline.resolve_material_domain(domain);
        let state = match self.m_dev.get_pipeline_state(
            shader,
            info.meta_material,
            info.render_pass,
            info.subpass,
        ) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let old = self.m_pipeline_states[domain as usize];
        if old != vk::Pipeline::null() {
            self.m_dev.free_pipeline_state(old);
        }
        self.m_pipeline_states[domain as usize] = state;
        return true;
    }
}

impl Drop for MaterialInitializer {
    fn drop(&mut self) {
        for state in self.m_pipeline_states.drain(..) {
            if state != vk::Pipeline::null() {
                self.m_dev.free_pipeline_state(state);
            }
        }
    }
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

pub struct Material {
    m_dev: Arc<Device>,
    m_shader: Option<Arc<Shader>>,
    m_uniform_buffer: Option<Buffer>,
    /// Can be null if the shader declares no material set
    m_descriptor_set: vk::DescriptorSet,
    m_pipeline_states: Vec<vk::Pipeline>,
}

impl Material {
    pub fn new(dev: &Arc<Device>, mut init: MaterialInitializer) -> Result<Arc<Material>> {
        let shader = match init.m_shader.take() {
            Some(s) => s,
            None => return Err(SquallError::INVALID),
        };

        let mut uniform_buffer = None;
        let mut descriptor_set = vk::DescriptorSet::null();

        if shader.material_layout() != vk::DescriptorSetLayout::null() {
            descriptor_set = dev.allocate_static_material_descriptor_set(shader.material_layout())?;

            let mut writes: Vec<vk::WriteDescriptorSet> = Vec::new();
            let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::new();
            let mut image_info_lists: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();

            if shader.uniform_buffer_size() != 0 {
                let buf = Buffer::new(
                    dev,
                    vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                    shader.uniform_buffer_size() as u64,
                    false,
                )?;
                dev.upload_buffer(&buf, 0, &init.m_uniform_data)?;
                buffer_infos.push(
                    vk::DescriptorBufferInfo::builder()
                        .buffer(buf.vk_buffer())
                        .offset(0)
                        .range(shader.uniform_buffer_size() as u64)
                        .build(),
                );
                uniform_buffer = Some(buf);
            }

            for (binding, list) in init.m_textures.iter() {
                if *binding == u32::MAX {
                    continue;
                }
                // The declared array must be fully populated
                let declared = shader
                    .properties()
                    .values()
                    .find_map(|p| match p {
                        ShaderProperty::Texture {
                            binding: b,
                            array_size,
                            ..
                        } if *b == *binding => Some(*array_size),
                        _ => None,
                    })
                    .unwrap_or(0);
                if list.len() as u32 != declared || list.iter().any(|t| t.is_none()) {
                    log::warning!(
                        "Texture array at binding {} is incomplete ({} of {} set).",
                        binding,
                        list.iter().filter(|t| t.is_some()).count(),
                        declared
                    );
                    dev.free_static_material_descriptor_set(descriptor_set);
                    return Err(SquallError::INVALID);
                }

                let infos: Vec<vk::DescriptorImageInfo> = list
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
                image_info_lists.push(infos);
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(descriptor_set)
                        .dst_binding(*binding)
                        .dst_array_element(0)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(image_info_lists.last().unwrap())
                        .build(),
                );
            }

            if !buffer_infos.is_empty() {
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(descriptor_set)
                        .dst_binding(0)
                        .dst_array_element(0)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&buffer_infos)
                        .build(),
                );
            }

            unsafe {
                dev.vk_device().update_descriptor_sets(&writes, &[]);
            }
        }

        Ok(Arc::new(Material {
            m_dev: dev.clone(),
            m_shader: Some(shader),
            m_uniform_buffer: uniform_buffer,
            m_descriptor_set: descriptor_set,
            m_pipeline_states: std::mem::take(&mut init.m_pipeline_states),
        }))
    }

    pub fn is_valid(&self) -> bool {
        self.m_shader.is_some()
    }

    pub fn shader(&self) -> Option<&Arc<Shader>> {
        self.m_shader.as_ref()
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.m_descriptor_set
    }

    pub fn pipeline_state(&self, domain: u32) -> vk::Pipeline {
        self.m_pipeline_states
            .get(domain as usize)
            .copied()
            .unwrap_or(vk::Pipeline::null())
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        if self.m_shader.is_some() {
            if self.m_descriptor_set != vk::DescriptorSet::null() {
                self.m_dev
                    .free_static_material_descriptor_set(self.m_descriptor_set);
            }
            for state in self.m_pipeline_states.drain(..) {
                if state != vk::Pipeline::null() {
                    self.m_dev.free_pipeline_state(state);
                }
            }
        }
        // the uniform buffer retires itself through the deletion queue
    }
}

/// A material bound to one material domain: the cached pipeline
/// state for (shader, meta material, render pass, subpass)
pub struct MaterialInstance {
    mi_dev: Arc<Device>,
    mi_material: Option<Arc<Material>>,
    mi_shader: Option<Arc<Shader>>,
    mi_pipeline: vk::Pipeline,
    mi_meta: MetaMaterial,
}

impl MaterialInstance {
    /// `rebind_shader` substitutes the material's shader for this
    /// instance, for domains drawn with a specialized variant.
    pub fn new(
        dev: &Arc<Device>,
        pipeline: &dyn Pipeline,
        material: &Arc<Material>,
        domain: u32,
        rebind_shader: Option<&Arc<Shader>>,
    ) -> Result<Arc<MaterialInstance>> {
        if !material.is_valid() {
            return Err(SquallError::INVALID);
        }
        let shader = match rebind_shader {
            Some(shader) => {
                if !shader.is_valid() {
                    return Err(SquallError::INVALID);
                }
                shader.clone()
            }
            None => material.shader().unwrap().clone(),
        };

        let info = pipeline.resolve_material_domain(domain);
        let pso = dev.get_pipeline_state(
            &shader,
            info.meta_material,
            info.render_pass,
            info.subpass,
        )?;

        Ok(Arc::new(MaterialInstance {
            mi_dev: dev.clone(),
            mi_material: Some(material.clone()),
            mi_shader: Some(shader),
            mi_pipeline: pso,
            mi_meta: info.meta_material,
        }))
    }

    pub fn is_valid(&self) -> bool {
        self.mi_pipeline != vk::Pipeline::null()
    }

    pub fn shader(&self) -> &Arc<Shader> {
        self.mi_shader.as_ref().unwrap()
    }

    pub fn material(&self) -> &Arc<Material> {
        self.mi_material.as_ref().unwrap()
    }

    pub fn pipeline_state(&self) -> vk::Pipeline {
        self.mi_pipeline
    }

    pub fn meta_material(&self) -> MetaMaterial {
        self.mi_meta
    }
}

impl Drop for MaterialInstance {
    fn drop(&mut self) {
        if self.mi_pipeline != vk::Pipeline::null() {
            self.mi_dev.free_pipeline_state(self.mi_pipeline);
        }
    }
}
