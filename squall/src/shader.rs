// Shaders
//
// A shader owns its stage modules (through the module cache), the
// reflected vertex layout, the descriptor layouts shared with every
// structurally identical shader, and the material property schema
// that materials are validated against.
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use crate::device::Device;
use crate::image::ImageDim;
use crate::reflect::{self, StageReflection};
use crate::{
    DataType, DescriptorBinding, DescriptorLayoutDesc, DescriptorType, Limits, Result,
    ShaderStageSet, SquallError, MATERIAL_DESCRIPTOR_SET,
};
use utils::log;

/// What shader stage bytecode to build a Shader from. The string
/// is the canonical source identifier the module cache dedups on.
pub struct ShaderInitializer<'a> {
    pub vertex: (&'a str, &'a [u32]),
    pub geometry: Option<(&'a str, &'a [u32])>,
    pub fragment: (&'a str, &'a [u32]),
}

/// One entry of a shader's material schema. Names are unique per
/// shader; vectors live in the uniform block, textures are bound
/// combined image samplers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShaderProperty {
    Vector {
        ty: DataType,
        offset: u32,
    },
    Texture {
        dim: ImageDim,
        binding: u32,
        array_size: u32,
    },
}

pub struct Shader {
    s_dev: Arc<Device>,
    s_vertex_module: vk::ShaderModule,
    s_geometry_module: vk::ShaderModule,
    s_fragment_module: vk::ShaderModule,
    s_vertex_layout: Vec<DataType>,
    s_pipeline_layout: vk::PipelineLayout,
    s_material_layout: vk::DescriptorSetLayout,
    s_object_layout: vk::DescriptorSetLayout,
    s_uniform_buffer_size: u32,
    s_num_textures: u32,
    s_num_texture_arrays: u32,
    s_properties: HashMap<String, ShaderProperty>,
    s_push_constant_stages: ShaderStageSet,
}

/// Merge one stage's reflection into the shader-wide layout and
/// property schema. Bindings seen by several stages must agree on
/// type and array size; material definitions must agree exactly.
pub(crate) fn fill_descriptor_layout(
    file: &str,
    stage: ShaderStageSet,
    reflection: &StageReflection,
    layout: &mut DescriptorLayoutDesc,
    properties: &mut HashMap<String, ShaderProperty>,
    uniform_buffer_size: &mut u32,
    push_stages: &mut ShaderStageSet,
) -> Result<()> {
    for reflected in reflection.bindings.iter() {
        if reflected.set >= Limits::NUM_DESCRIPTOR_SETS as u32 {
            log::error!("Number of descriptor sets exceeds the maximum count in {}.", file);
            return Err(SquallError::LIMIT_EXCEEDED);
        }
        let bindings = &mut layout[reflected.set as usize];
        match bindings
            .iter_mut()
            .find(|b| b.binding_point == reflected.binding)
        {
            Some(binding) => {
                if binding.ty != reflected.ty
                    || binding.array_size != reflected.count
                    || !(binding.stages & stage).is_empty()
                {
                    log::error!("Descriptor doesn't match its previous definition: {}.", file);
                    return Err(SquallError::PROPERTY_MISMATCH);
                }
                binding.stages |= stage;
            }
            None => {
                if bindings.len() >= Limits::NUM_BINDINGS_PER_SET {
                    log::error!("Too many bindings in shader: {}.", file);
                    return Err(SquallError::LIMIT_EXCEEDED);
                }
                bindings.push(DescriptorBinding {
                    binding_point: reflected.binding,
                    array_size: reflected.count,
                    ty: reflected.ty,
                    stages: stage,
                });
            }
        }

        // Material property reflection
        if reflected.set == MATERIAL_DESCRIPTOR_SET {
            match reflected.ty {
                DescriptorType::UniformBuffer => {
                    if reflected.binding != 0 {
                        log::error!(
                            "Uniform buffer of a material must be bound to index 0. Error occured in shader: {}.",
                            file
                        );
                        return Err(SquallError::INVALID_BYTECODE);
                    }
                    if reflected.count != 1 {
                        log::error!(
                            "Uniform buffer of a material must not be an array. Error occured in shader: {}.",
                            file
                        );
                        return Err(SquallError::INVALID_BYTECODE);
                    }
                    let block = reflected.block.as_ref().unwrap();
                    if block.size > Limits::UNIFORM_BUFFER_SIZE {
                        log::error!("Uniform buffer is too large in shader: {}.", file);
                        return Err(SquallError::LIMIT_EXCEEDED);
                    }
                    *uniform_buffer_size = std::cmp::max(*uniform_buffer_size, block.size);
                    for (name, ty, offset) in block.members.iter() {
                        let property = ShaderProperty::Vector {
                            ty: *ty,
                            offset: *offset,
                        };
                        match properties.get(name) {
                            None => {
                                properties.insert(name.clone(), property);
                            }
                            Some(existing) => {
                                if *existing != property {
                                    log::error!(
                                        "Material definition in shader {} doesn't match its previous definition.",
                                        file
                                    );
                                    return Err(SquallError::PROPERTY_MISMATCH);
                                }
                            }
                        }
                    }
                }
                DescriptorType::CombinedImageSampler => {
                    let property = ShaderProperty::Texture {
                        dim: reflected.dim,
                        binding: reflected.binding,
                        array_size: reflected.count,
                    };
                    match properties.get(&reflected.name) {
                        None => {
                            properties.insert(reflected.name.clone(), property);
                        }
                        Some(existing) => {
                            if *existing != property {
                                log::error!(
                                    "Material definition in shader {} doesn't match its previous definition.",
                                    file
                                );
                                return Err(SquallError::PROPERTY_MISMATCH);
                            }
                        }
                    }
                }
                _ => {
                    log::error!(
                        "Descriptor type {:?} in shader {} cannot be used as a material property.",
                        reflected.ty,
                        file
                    );
                    return Err(SquallError::INVALID_BYTECODE);
                }
            }
        }
    }

    if reflection.push_constant_blocks > 1 {
        log::error!(
            "More than 1 push-constants buffer is not supported. Error occured in shader: {}.",
            file
        );
        return Err(SquallError::INVALID_BYTECODE);
    }
    if reflection.push_constant_blocks == 1 {
        *push_stages |= stage;
    }
    Ok(())
}

impl Shader {
    pub fn new(dev: &Arc<Device>, init: &ShaderInitializer) -> Result<Arc<Shader>> {
        let mut layout = DescriptorLayoutDesc::default();
        let mut properties = HashMap::new();
        let mut uniform_buffer_size = 0;
        let mut push_stages = ShaderStageSet::empty();

        let (vertex_file, vertex_code) = init.vertex;
        let vertex_reflection = reflect::reflect_stage(vertex_code, true).map_err(|e| {
            log::error!("Cannot reflect shader: {}.", vertex_file);
            e
        })?;
        fill_descriptor_layout(
            vertex_file,
            ShaderStageSet::VERTEX,
            &vertex_reflection,
            &mut layout,
            &mut properties,
            &mut uniform_buffer_size,
            &mut push_stages,
        )?;

        if let Some((geometry_file, geometry_code)) = init.geometry {
            let reflection = reflect::reflect_stage(geometry_code, false).map_err(|e| {
                log::error!("Cannot reflect shader: {}.", geometry_file);
                e
            })?;
            fill_descriptor_layout(
                geometry_file,
                ShaderStageSet::GEOMETRY,
                &reflection,
                &mut layout,
                &mut properties,
                &mut uniform_buffer_size,
                &mut push_stages,
            )?;
        }

        let (fragment_file, fragment_code) = init.fragment;
        let fragment_reflection = reflect::reflect_stage(fragment_code, false).map_err(|e| {
            log::error!("Cannot reflect shader: {}.", fragment_file);
            e
        })?;
        fill_descriptor_layout(
            fragment_file,
            ShaderStageSet::FRAGMENT,
            &fragment_reflection,
            &mut layout,
            &mut properties,
            &mut uniform_buffer_size,
            &mut push_stages,
        )?;

        // Count the material textures
        let mut num_textures = 0;
        let mut num_texture_arrays = 0;
        for binding in layout[MATERIAL_DESCRIPTOR_SET as usize].iter() {
            if binding.ty == DescriptorType::CombinedImageSampler {
                num_textures += binding.array_size;
                num_texture_arrays += 1;
            }
        }
        if num_textures > Limits::NUM_MATERIAL_TEXTURES {
            log::error!("Too many textures.");
            return Err(SquallError::LIMIT_EXCEEDED);
        }

        for bindings in layout.iter_mut() {
            bindings.sort_by_key(|b| b.binding_point);
        }

        // Stage modules come from the module cache, one vulkan
        // object per distinct source identifier
        let vertex_module = dev.get_shader_module(vertex_file, vertex_code)?;
        let geometry_module = match init.geometry {
            Some((file, code)) => match dev.get_shader_module(file, code) {
                Ok(m) => m,
                Err(e) => {
                    dev.free_shader_module(vertex_module);
                    return Err(e);
                }
            },
            None => vk::ShaderModule::null(),
        };
        let fragment_module = match dev.get_shader_module(fragment_file, fragment_code) {
            Ok(m) => m,
            Err(e) => {
                dev.free_shader_module(vertex_module);
                if geometry_module != vk::ShaderModule::null() {
                    dev.free_shader_module(geometry_module);
                }
                return Err(e);
            }
        };

        let handles = match dev.get_pipeline_layout(&layout) {
            Ok(h) => h,
            Err(e) => {
                log::error!("Cannot create descriptor layout.");
                dev.free_shader_module(vertex_module);
                if geometry_module != vk::ShaderModule::null() {
                    dev.free_shader_module(geometry_module);
                }
                dev.free_shader_module(fragment_module);
                return Err(e);
            }
        };

        let shader = Shader {
            s_dev: dev.clone(),
            s_vertex_module: vertex_module,
            s_geometry_module: geometry_module,
            s_fragment_module: fragment_module,
            s_vertex_layout: vertex_reflection.inputs,
            s_pipeline_layout: handles.layout,
            s_material_layout: handles.material_layout,
            s_object_layout: handles.object_layout,
            s_uniform_buffer_size: uniform_buffer_size,
            s_num_textures: num_textures,
            s_num_texture_arrays: num_texture_arrays,
            s_properties: properties,
            s_push_constant_stages: push_stages,
        };
        shader.log_info(vertex_file, init.geometry.map(|g| g.0), fragment_file);
        Ok(Arc::new(shader))
    }

    fn log_info(&self, vertex_file: &str, geometry_file: Option<&str>, fragment_file: &str) {
        log::info!(
            "Shader [vert: {} geom: {} frag: {}] ubo {} bytes, {} properties",
            vertex_file,
            geometry_file.unwrap_or("<none>"),
            fragment_file,
            self.s_uniform_buffer_size,
            self.s_properties.len()
        );
        for (name, property) in self.s_properties.iter() {
            log::info!("  {}: {:?}", name, property);
        }
    }

    pub fn is_valid(&self) -> bool {
        self.s_pipeline_layout != vk::PipelineLayout::null()
    }

    pub fn vertex_layout(&self) -> &[DataType] {
        &self.s_vertex_layout
    }

    pub fn uniform_buffer_size(&self) -> u32 {
        self.s_uniform_buffer_size
    }

    pub fn num_textures(&self) -> u32 {
        self.s_num_textures
    }

    pub fn num_texture_arrays(&self) -> u32 {
        self.s_num_texture_arrays
    }

    /// Look up one schema entry, None if the shader doesn't
    /// declare a property with this name
    pub fn property(&self, name: &str) -> Option<ShaderProperty> {
        self.s_properties.get(name).copied()
    }

    pub fn properties(&self) -> &HashMap<String, ShaderProperty> {
        &self.s_properties
    }

    pub fn push_constant_stages(&self) -> ShaderStageSet {
        self.s_push_constant_stages
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.s_pipeline_layout
    }

    pub fn material_layout(&self) -> vk::DescriptorSetLayout {
        self.s_material_layout
    }

    pub fn object_layout(&self) -> vk::DescriptorSetLayout {
        self.s_object_layout
    }

    pub(crate) fn vertex_module(&self) -> vk::ShaderModule {
        self.s_vertex_module
    }

    pub(crate) fn geometry_module(&self) -> vk::ShaderModule {
        self.s_geometry_module
    }

    pub(crate) fn fragment_module(&self) -> vk::ShaderModule {
        self.s_fragment_module
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        if self.is_valid() {
            self.s_dev.free_pipeline_layout(self.s_pipeline_layout);
            self.s_dev.free_shader_module(self.s_vertex_module);
            if self.s_geometry_module != vk::ShaderModule::null() {
                self.s_dev.free_shader_module(self.s_geometry_module);
            }
            self.s_dev.free_shader_module(self.s_fragment_module);
        }
    }
}
