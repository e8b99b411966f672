// Structural caches for shader modules, descriptor layouts and
// pipeline state
//
// Anything that is expensive to create and structurally identical
// across users exists at most once. Entries are reference counted;
// when the last holder frees one, the vulkan object is enqueued on
// the deletion queue and the table entry disappears, so a retry
// after a failed construction is always possible.
//
// Tables are only mutated from the renderer thread. The refcounts
// themselves live inside the tables, so that contract covers them.
use ash::vk;
use std::collections::HashMap;

use crate::deletion_queue::DeletionQueue;
use crate::pipeline_state::{self, MetaMaterial, PipelineInfo};
use crate::shader::Shader;
use crate::{
    DescriptorBinding, DescriptorLayoutDesc, DescriptorType, Limits, Result, ShaderStageSet,
    SquallError, GLOBAL_DESCRIPTOR_SET, MATERIAL_DESCRIPTOR_SET, OBJECT_DESCRIPTOR_SET,
};
use utils::log;

// ---------------- Shader modules ----------------

/// One vkShaderModule per distinct source identifier
pub(crate) struct ShaderModuleCache {
    path_table: HashMap<String, vk::ShaderModule>,
    ref_counts: HashMap<vk::ShaderModule, (String, u32)>,
}

impl ShaderModuleCache {
    pub fn new() -> Self {
        Self {
            path_table: HashMap::new(),
            ref_counts: HashMap::new(),
        }
    }

    pub fn get(
        &mut self,
        dev: &ash::Device,
        file: &str,
        bytecode: &[u32],
    ) -> Result<vk::ShaderModule> {
        if let Some(module) = self.path_table.get(file) {
            self.ref_counts.get_mut(module).unwrap().1 += 1;
            return Ok(*module);
        }

        let info = vk::ShaderModuleCreateInfo::builder().code(bytecode);
        let module = match unsafe { dev.create_shader_module(&info, None) } {
            Ok(m) => m,
            Err(_) => {
                log::error!("Cannot create shader: {}.", file);
                return Err(SquallError::CREATION_FAILED);
            }
        };
        self.path_table.insert(file.to_string(), module);
        self.ref_counts.insert(module, (file.to_string(), 1));
        Ok(module)
    }

    pub fn free(&mut self, dev: &ash::Device, queue: &mut DeletionQueue, module: vk::ShaderModule) {
        let entry = self.ref_counts.get_mut(&module).expect("Unknown module");
        debug_assert!(entry.1 != 0);
        entry.1 -= 1;
        if entry.1 == 0 {
            let path = entry.0.clone();
            self.path_table.remove(&path);
            self.ref_counts.remove(&module);
            let raw_dev = dev.clone();
            queue.push(Box::new(move || unsafe {
                raw_dev.destroy_shader_module(module, None);
            }));
        }
    }

    pub fn ref_count(&self, module: vk::ShaderModule) -> u32 {
        self.ref_counts.get(&module).map(|e| e.1).unwrap_or(0)
    }

    pub fn contains(&self, file: &str) -> bool {
        self.path_table.contains_key(file)
    }

    pub fn assert_empty(&self) {
        debug_assert!(self.path_table.is_empty());
        debug_assert!(self.ref_counts.is_empty());
    }
}

// ---------------- Descriptor layouts ----------------

/// Canonical key for one descriptor set.
///
/// Bindings are sorted by binding point first, so two requests
/// that differ only in declaration order produce the same key:
/// "u1@0vf,t2@1f" reads as a one-deep uniform buffer at binding 0
/// used by vertex+fragment, then a two-texture array at binding 1.
pub(crate) fn descriptor_set_key(bindings: &[DescriptorBinding]) -> String {
    let mut sorted: Vec<DescriptorBinding> = bindings.to_vec();
    sorted.sort_by_key(|b| b.binding_point);

    let mut key = String::new();
    for (i, binding) in sorted.iter().enumerate() {
        if i != 0 {
            key.push(',');
        }
        key.push(match binding.ty {
            DescriptorType::Sampler => 's',
            DescriptorType::CombinedImageSampler => 't',
            DescriptorType::SampledImage => 'i',
            DescriptorType::UniformBuffer => 'u',
        });
        key.push_str(&binding.array_size.to_string());
        key.push('@');
        key.push_str(&binding.binding_point.to_string());
        if binding.stages == ShaderStageSet::ALL_GRAPHICS {
            key.push_str("ag");
        } else {
            if binding.stages.contains(ShaderStageSet::VERTEX) {
                key.push('v');
            }
            if binding.stages.contains(ShaderStageSet::GEOMETRY) {
                key.push('g');
            }
            if binding.stages.contains(ShaderStageSet::FRAGMENT) {
                key.push('f');
            }
        }
    }
    return key;
}

/// Canonical key over all sets of a pipeline layout, ascending set
/// index. The global set is supplied by the active render pipeline
/// rather than derived from reflection, so it never participates.
pub(crate) fn pipeline_layout_key(layout: &DescriptorLayoutDesc) -> String {
    let mut key = String::new();
    for (i, bindings) in layout.iter().enumerate() {
        if i == GLOBAL_DESCRIPTOR_SET as usize || bindings.is_empty() {
            continue;
        }
        if !key.is_empty() {
            key.push(';');
        }
        key.push_str(&i.to_string());
        key.push(':');
        key.push_str(&descriptor_set_key(bindings));
    }
    return key;
}

struct PipelineLayoutBundle {
    sets: [vk::DescriptorSetLayout; Limits::NUM_DESCRIPTOR_SETS],
    num_sets: u32,
    layout: vk::PipelineLayout,
    /// Set 0 belongs to the render pipeline, not this cache
    global_external: bool,
}

pub(crate) struct DescriptorLayoutCache {
    set_table: HashMap<String, vk::DescriptorSetLayout>,
    set_ref_counts: HashMap<vk::DescriptorSetLayout, (String, u32)>,
    pipeline_table: HashMap<String, PipelineLayoutBundle>,
    ref_counts: HashMap<vk::PipelineLayout, (String, u32)>,
}

/// What a shader gets back for its merged descriptor layout
pub(crate) struct PipelineLayoutHandles {
    pub layout: vk::PipelineLayout,
    pub material_layout: vk::DescriptorSetLayout,
    pub object_layout: vk::DescriptorSetLayout,
}

impl DescriptorLayoutCache {
    pub fn new() -> Self {
        Self {
            set_table: HashMap::new(),
            set_ref_counts: HashMap::new(),
            pipeline_table: HashMap::new(),
            ref_counts: HashMap::new(),
        }
    }

    pub fn get_set_layout(
        &mut self,
        dev: &ash::Device,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let key = descriptor_set_key(bindings);
        if key.len() > Limits::DESCRIPTOR_LAYOUT_STRING_LENGTH {
            log::error!("Descriptor layout is too long.");
            return Err(SquallError::LIMIT_EXCEEDED);
        }
        self.get_set_layout_keyed(dev, key, bindings)
    }

    fn get_set_layout_keyed(
        &mut self,
        dev: &ash::Device,
        key: String,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        if let Some(layout) = self.set_table.get(&key) {
            self.set_ref_counts.get_mut(layout).unwrap().1 += 1;
            return Ok(*layout);
        }

        let mut vk_bindings = Vec::with_capacity(bindings.len());
        for binding in bindings {
            vk_bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding_point)
                    .descriptor_type(binding.ty.to_vk())
                    .descriptor_count(binding.array_size)
                    .stage_flags(binding.stages.to_vk())
                    .build(),
            );
        }
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
        let layout = match unsafe { dev.create_descriptor_set_layout(&info, None) } {
            Ok(l) => l,
            Err(_) => {
                log::error!("Cannot create descriptor set: {}.", key);
                return Err(SquallError::CREATION_FAILED);
            }
        };
        self.set_table.insert(key.clone(), layout);
        self.set_ref_counts.insert(layout, (key, 1));
        Ok(layout)
    }

    pub fn free_set_layout(
        &mut self,
        dev: &ash::Device,
        queue: &mut DeletionQueue,
        layout: vk::DescriptorSetLayout,
    ) {
        let entry = self
            .set_ref_counts
            .get_mut(&layout)
            .expect("Unknown descriptor set layout");
        debug_assert!(entry.1 != 0);
        entry.1 -= 1;
        if entry.1 == 0 {
            let key = entry.0.clone();
            self.set_table.remove(&key);
            self.set_ref_counts.remove(&layout);
            let raw_dev = dev.clone();
            queue.push(Box::new(move || unsafe {
                raw_dev.destroy_descriptor_set_layout(layout, None);
            }));
        }
    }

    /// Build or look up the pipeline layout for a shader's merged
    /// per-set binding lists.
    ///
    /// Set 0 is the render pipeline's global layout when one is
    /// registered; reflected set 0 bindings only describe it and
    /// never create a layout of their own.
    pub fn get_pipeline_layout(
        &mut self,
        dev: &ash::Device,
        queue: &mut DeletionQueue,
        desc: &DescriptorLayoutDesc,
        global_layout: vk::DescriptorSetLayout,
    ) -> Result<PipelineLayoutHandles> {
        let key = pipeline_layout_key(desc);
        if key.len() > Limits::DESCRIPTOR_LAYOUT_STRING_LENGTH {
            log::error!("Descriptor layout is too long.");
            return Err(SquallError::LIMIT_EXCEEDED);
        }

        if let Some(bundle) = self.pipeline_table.get(&key) {
            let layout = bundle.layout;
            self.ref_counts.get_mut(&layout).unwrap().1 += 1;
            return Ok(PipelineLayoutHandles {
                layout: layout,
                material_layout: bundle.sets[MATERIAL_DESCRIPTOR_SET as usize],
                object_layout: bundle.sets[OBJECT_DESCRIPTOR_SET as usize],
            });
        }

        // Highest set this layout must cover
        let mut last: i32 = -1;
        for (i, bindings) in desc.iter().enumerate() {
            if i != GLOBAL_DESCRIPTOR_SET as usize && !bindings.is_empty() {
                last = i as i32;
            }
        }
        let global_external = global_layout != vk::DescriptorSetLayout::null();
        if global_external && last < 0 {
            last = 0;
        }

        let mut sets = [vk::DescriptorSetLayout::null(); Limits::NUM_DESCRIPTOR_SETS];
        let mut owned: Vec<vk::DescriptorSetLayout> = Vec::new();
        let mut failed = false;
        let num_sets = (last + 1) as u32;
        for i in 0..num_sets as usize {
            let layout = if i == GLOBAL_DESCRIPTOR_SET as usize && global_external {
                Ok(global_layout)
            } else {
                self.get_set_layout(dev, &desc[i])
            };
            match layout {
                Ok(l) => {
                    sets[i] = l;
                    if !(i == GLOBAL_DESCRIPTOR_SET as usize && global_external) {
                        owned.push(l);
                    }
                }
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            for l in owned {
                self.free_set_layout(dev, queue, l);
            }
            return Err(SquallError::CREATION_FAILED);
        }

        // Every layout carries the full push constant range so that
        // set 0 stays compatible across shaders in one pass
        let constant_range = [vk::PushConstantRange::builder()
            .stage_flags(ShaderStageSet::ALL_GRAPHICS.to_vk())
            .offset(0)
            .size(Limits::PUSH_CONSTANT_SIZE)
            .build()];
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&sets[0..num_sets as usize])
            .push_constant_ranges(&constant_range);
        let layout = match unsafe { dev.create_pipeline_layout(&info, None) } {
            Ok(l) => l,
            Err(_) => {
                log::error!("Cannot create pipeline layout: {}.", key);
                for l in owned {
                    self.free_set_layout(dev, queue, l);
                }
                return Err(SquallError::CREATION_FAILED);
            }
        };

        let handles = PipelineLayoutHandles {
            layout: layout,
            material_layout: sets[MATERIAL_DESCRIPTOR_SET as usize],
            object_layout: sets[OBJECT_DESCRIPTOR_SET as usize],
        };
        self.pipeline_table.insert(
            key.clone(),
            PipelineLayoutBundle {
                sets: sets,
                num_sets: num_sets,
                layout: layout,
                global_external: global_external,
            },
        );
        self.ref_counts.insert(layout, (key, 1));
        Ok(handles)
    }

    pub fn free_pipeline_layout(
        &mut self,
        dev: &ash::Device,
        queue: &mut DeletionQueue,
        layout: vk::PipelineLayout,
    ) {
        let entry = self
            .ref_counts
            .get_mut(&layout)
            .expect("Unknown pipeline layout");
        debug_assert!(entry.1 != 0);
        entry.1 -= 1;
        if entry.1 == 0 {
            let key = entry.0.clone();
            let bundle = self.pipeline_table.remove(&key).unwrap();
            self.ref_counts.remove(&layout);
            for i in 0..bundle.num_sets as usize {
                if i == GLOBAL_DESCRIPTOR_SET as usize && bundle.global_external {
                    continue;
                }
                self.free_set_layout(dev, queue, bundle.sets[i]);
            }
            let raw_dev = dev.clone();
            queue.push(Box::new(move || unsafe {
                raw_dev.destroy_pipeline_layout(layout, None);
            }));
        }
    }

    pub fn pipeline_layout_ref_count(&self, layout: vk::PipelineLayout) -> u32 {
        self.ref_counts.get(&layout).map(|e| e.1).unwrap_or(0)
    }

    pub fn assert_empty(&self) {
        debug_assert!(self.set_table.is_empty());
        debug_assert!(self.set_ref_counts.is_empty());
        debug_assert!(self.pipeline_table.is_empty());
        debug_assert!(self.ref_counts.is_empty());
    }
}

// ---------------- Pipeline state ----------------

/// A pipeline is uniquely described by its shader, the packed
/// fixed-function state, and the pass+subpass it renders in. The
/// shader reference is a raw pointer; the refcount invariant keeps
/// it alive for as long as the cache entry exists.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
struct PipelineStateKey {
    shader: usize,
    meta: u32,
    render_pass: vk::RenderPass,
    subpass: u32,
}

pub(crate) struct PipelineStateCache {
    states: HashMap<PipelineStateKey, vk::Pipeline>,
    ref_counts: HashMap<vk::Pipeline, (PipelineStateKey, u32)>,
}

impl PipelineStateCache {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            ref_counts: HashMap::new(),
        }
    }

    pub fn get(
        &mut self,
        dev: &ash::Device,
        shader: &Shader,
        shader_id: usize,
        meta: MetaMaterial,
        render_pass: vk::RenderPass,
        subpass: u32,
        supports_wireframe: bool,
    ) -> Result<vk::Pipeline> {
        let key = PipelineStateKey {
            shader: shader_id,
            meta: meta.bits(),
            render_pass: render_pass,
            subpass: subpass,
        };
        if let Some(pipeline) = self.states.get(&key) {
            self.ref_counts.get_mut(pipeline).unwrap().1 += 1;
            return Ok(*pipeline);
        }

        let info = PipelineInfo {
            vertex_layout: shader.vertex_layout(),
            meta: meta,
            render_pass: render_pass,
            subpass: subpass,
            layout: shader.pipeline_layout(),
            vertex_module: shader.vertex_module(),
            geometry_module: shader.geometry_module(),
            fragment_module: shader.fragment_module(),
        };
        let pipeline = pipeline_state::create_pipeline(dev, &info, supports_wireframe)?;
        self.states.insert(key, pipeline);
        self.ref_counts.insert(pipeline, (key, 1));
        Ok(pipeline)
    }

    pub fn free(&mut self, dev: &ash::Device, queue: &mut DeletionQueue, pipeline: vk::Pipeline) {
        let entry = self
            .ref_counts
            .get_mut(&pipeline)
            .expect("Unknown pipeline state");
        debug_assert!(entry.1 != 0);
        entry.1 -= 1;
        if entry.1 == 0 {
            let key = entry.0;
            self.ref_counts.remove(&pipeline);
            self.states.remove(&key);
            let raw_dev = dev.clone();
            queue.push(Box::new(move || unsafe {
                raw_dev.destroy_pipeline(pipeline, None);
            }));
        }
    }

    pub fn assert_empty(&self) {
        debug_assert!(self.states.is_empty());
        debug_assert!(self.ref_counts.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(
        point: u32,
        count: u32,
        ty: DescriptorType,
        stages: ShaderStageSet,
    ) -> DescriptorBinding {
        DescriptorBinding {
            binding_point: point,
            array_size: count,
            ty: ty,
            stages: stages,
        }
    }

    #[test]
    fn set_key_grammar() {
        let bindings = [
            binding(0, 1, DescriptorType::UniformBuffer, ShaderStageSet::VERTEX | ShaderStageSet::FRAGMENT),
            binding(1, 2, DescriptorType::CombinedImageSampler, ShaderStageSet::FRAGMENT),
            binding(2, 1, DescriptorType::Sampler, ShaderStageSet::ALL_GRAPHICS),
            binding(3, 4, DescriptorType::SampledImage, ShaderStageSet::GEOMETRY),
        ];
        assert_eq!(descriptor_set_key(&bindings), "u1@0vf,t2@1f,s1@2ag,i4@3g");
    }

    #[test]
    fn set_key_is_order_independent() {
        let a = [
            binding(0, 1, DescriptorType::UniformBuffer, ShaderStageSet::FRAGMENT),
            binding(1, 1, DescriptorType::CombinedImageSampler, ShaderStageSet::FRAGMENT),
            binding(5, 3, DescriptorType::SampledImage, ShaderStageSet::VERTEX),
        ];
        let mut b = a.clone();
        b.reverse();
        let c = [a[1], a[0], a[2]];
        assert_eq!(descriptor_set_key(&a), descriptor_set_key(&b));
        assert_eq!(descriptor_set_key(&a), descriptor_set_key(&c));
    }

    #[test]
    fn set_key_distinguishes_tuples() {
        // keys must be injective on (binding, type, count, stages)
        let base = [binding(0, 1, DescriptorType::UniformBuffer, ShaderStageSet::FRAGMENT)];
        let keys = [
            descriptor_set_key(&base),
            descriptor_set_key(&[binding(1, 1, DescriptorType::UniformBuffer, ShaderStageSet::FRAGMENT)]),
            descriptor_set_key(&[binding(0, 2, DescriptorType::UniformBuffer, ShaderStageSet::FRAGMENT)]),
            descriptor_set_key(&[binding(0, 1, DescriptorType::CombinedImageSampler, ShaderStageSet::FRAGMENT)]),
            descriptor_set_key(&[binding(0, 1, DescriptorType::UniformBuffer, ShaderStageSet::VERTEX)]),
        ];
        for i in 0..keys.len() {
            for j in 0..keys.len() {
                if i != j {
                    assert_ne!(keys[i], keys[j]);
                }
            }
        }
    }

    #[test]
    fn pipeline_key_skips_global_and_empty_sets() {
        let mut desc = DescriptorLayoutDesc::default();
        desc[0].push(binding(0, 1, DescriptorType::UniformBuffer, ShaderStageSet::VERTEX));
        desc[1].push(binding(0, 1, DescriptorType::UniformBuffer, ShaderStageSet::FRAGMENT));
        desc[3].push(binding(2, 1, DescriptorType::CombinedImageSampler, ShaderStageSet::FRAGMENT));
        // the global set is externally supplied and never keyed
        assert_eq!(pipeline_layout_key(&desc), "1:u1@0f;3:t1@2f");
    }
}
