// Crate-level tests
//
// The reflection and merge tests run against hand-assembled
// SPIR-V, so they need no GPU. Tests that talk to a device are
// ignored by default and only run where a vulkan implementation
// is present.
use crate as sq;
use crate::image::ImageDim;
use crate::reflect;
use crate::shader::{fill_descriptor_layout, ShaderProperty};
use crate::{
    DataType, DescriptorLayoutDesc, DescriptorType, ShaderStageSet, SquallError,
    MATERIAL_DESCRIPTOR_SET,
};
use spirv_headers as spirv;
use std::collections::HashMap;

// ---------------- A tiny SPIR-V assembler ----------------

fn string_words(s: &str) -> Vec<u32> {
    let mut bytes: Vec<u8> = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

struct Asm {
    words: Vec<u32>,
}

impl Asm {
    fn new() -> Self {
        // magic, version 1.0, generator, bound, schema
        Self {
            words: vec![0x0723_0203, 0x0001_0000, 0, 128, 0],
        }
    }

    fn inst(&mut self, op: spirv::Op, operands: &[u32]) -> &mut Self {
        self.words
            .push((((operands.len() + 1) as u32) << 16) | op as u32);
        self.words.extend_from_slice(operands);
        self
    }

    fn inst_named(&mut self, op: spirv::Op, pre: &[u32], name: &str) -> &mut Self {
        let mut operands = pre.to_vec();
        operands.extend(string_words(name));
        self.inst(op, &operands)
    }

    fn build(&self) -> Vec<u32> {
        self.words.clone()
    }
}

/// Vertex stage declaring attributes [vec3, vec2]
fn vertex_stage_words() -> Vec<u32> {
    let mut asm = Asm::new();
    asm.inst(spirv::Op::Decorate, &[6, spirv::Decoration::Location as u32, 0])
        .inst(spirv::Op::Decorate, &[7, spirv::Decoration::Location as u32, 1])
        .inst(spirv::Op::TypeFloat, &[1, 32])
        .inst(spirv::Op::TypeVector, &[2, 1, 3])
        .inst(spirv::Op::TypeVector, &[3, 1, 2])
        .inst(
            spirv::Op::TypePointer,
            &[4, spirv::StorageClass::Input as u32, 2],
        )
        .inst(
            spirv::Op::TypePointer,
            &[5, spirv::StorageClass::Input as u32, 3],
        )
        .inst(
            spirv::Op::Variable,
            &[4, 6, spirv::StorageClass::Input as u32],
        )
        .inst(
            spirv::Op::Variable,
            &[5, 7, spirv::StorageClass::Input as u32],
        );
    asm.build()
}

/// Fragment stage declaring set 1 binding 0 as {float time; vec4 tint}
fn fragment_stage_words() -> Vec<u32> {
    let mut asm = Asm::new();
    asm.inst_named(spirv::Op::MemberName, &[3, 0], "time")
        .inst_named(spirv::Op::MemberName, &[3, 1], "tint")
        .inst(spirv::Op::Decorate, &[3, spirv::Decoration::Block as u32])
        .inst(
            spirv::Op::MemberDecorate,
            &[3, 0, spirv::Decoration::Offset as u32, 0],
        )
        .inst(
            spirv::Op::MemberDecorate,
            &[3, 1, spirv::Decoration::Offset as u32, 16],
        )
        .inst(
            spirv::Op::Decorate,
            &[5, spirv::Decoration::DescriptorSet as u32, 1],
        )
        .inst(spirv::Op::Decorate, &[5, spirv::Decoration::Binding as u32, 0])
        .inst(spirv::Op::TypeFloat, &[1, 32])
        .inst(spirv::Op::TypeVector, &[2, 1, 4])
        .inst(spirv::Op::TypeStruct, &[3, 1, 2])
        .inst(
            spirv::Op::TypePointer,
            &[4, spirv::StorageClass::Uniform as u32, 3],
        )
        .inst(
            spirv::Op::Variable,
            &[4, 5, spirv::StorageClass::Uniform as u32],
        );
    asm.build()
}

/// Fragment stage with a 2D combined image sampler named "albedo"
/// at set 1 binding 1
fn textured_fragment_words() -> Vec<u32> {
    let mut asm = Asm::new();
    asm.inst_named(spirv::Op::Name, &[6], "albedo")
        .inst(
            spirv::Op::Decorate,
            &[6, spirv::Decoration::DescriptorSet as u32, 1],
        )
        .inst(spirv::Op::Decorate, &[6, spirv::Decoration::Binding as u32, 1])
        .inst(spirv::Op::TypeFloat, &[1, 32])
        // sampled type, dim 2D, depth 0, arrayed 0, ms 0, sampled 1, format 0
        .inst(
            spirv::Op::TypeImage,
            &[2, 1, spirv::Dim::Dim2D as u32, 0, 0, 0, 1, 0],
        )
        .inst(spirv::Op::TypeSampledImage, &[3, 2])
        .inst(
            spirv::Op::TypePointer,
            &[4, spirv::StorageClass::UniformConstant as u32, 3],
        )
        .inst(
            spirv::Op::Variable,
            &[4, 6, spirv::StorageClass::UniformConstant as u32],
        );
    asm.build()
}

// ---------------- Reflection ----------------

#[test]
fn reflects_vertex_attributes() {
    let reflection = reflect::reflect_stage(&vertex_stage_words(), true).unwrap();
    assert_eq!(reflection.inputs, vec![DataType::Vec3, DataType::Vec2]);
    assert!(reflection.bindings.is_empty());
    assert_eq!(reflection.push_constant_blocks, 0);
}

#[test]
fn reflects_material_uniform_block() {
    let reflection = reflect::reflect_stage(&fragment_stage_words(), false).unwrap();
    assert_eq!(reflection.bindings.len(), 1);
    let binding = &reflection.bindings[0];
    assert_eq!(binding.set, 1);
    assert_eq!(binding.binding, 0);
    assert_eq!(binding.ty, DescriptorType::UniformBuffer);
    assert_eq!(binding.count, 1);
    let block = binding.block.as_ref().unwrap();
    assert_eq!(block.size, 32);
    assert_eq!(
        block.members,
        vec![
            ("time".to_string(), DataType::Float, 0),
            ("tint".to_string(), DataType::Vec4, 16),
        ]
    );
}

#[test]
fn reflects_texture_binding() {
    let reflection = reflect::reflect_stage(&textured_fragment_words(), false).unwrap();
    assert_eq!(reflection.bindings.len(), 1);
    let binding = &reflection.bindings[0];
    assert_eq!(binding.ty, DescriptorType::CombinedImageSampler);
    assert_eq!(binding.set, 1);
    assert_eq!(binding.binding, 1);
    assert_eq!(binding.dim, ImageDim::D2);
    assert_eq!(binding.name, "albedo");
}

#[test]
fn rejects_incontinuous_attribute_locations() {
    let mut asm = Asm::new();
    asm.inst(spirv::Op::Decorate, &[4, spirv::Decoration::Location as u32, 2])
        .inst(spirv::Op::TypeFloat, &[1, 32])
        .inst(spirv::Op::TypeVector, &[2, 1, 2])
        .inst(
            spirv::Op::TypePointer,
            &[3, spirv::StorageClass::Input as u32, 2],
        )
        .inst(
            spirv::Op::Variable,
            &[3, 4, spirv::StorageClass::Input as u32],
        );
    assert_eq!(
        reflect::reflect_stage(&asm.build(), true).unwrap_err(),
        SquallError::INVALID_BYTECODE
    );
}

#[test]
fn rejects_garbage_bytecode() {
    assert_eq!(
        reflect::reflect_stage(&[1, 2, 3], false).unwrap_err(),
        SquallError::INVALID_BYTECODE
    );
}

#[test]
fn skips_builtin_inputs() {
    let mut asm = Asm::new();
    asm.inst(
        spirv::Op::Decorate,
        &[4, spirv::Decoration::BuiltIn as u32, 0],
    )
    .inst(spirv::Op::TypeFloat, &[1, 32])
    .inst(spirv::Op::TypeVector, &[2, 1, 4])
    .inst(
        spirv::Op::TypePointer,
        &[3, spirv::StorageClass::Input as u32, 2],
    )
    .inst(
        spirv::Op::Variable,
        &[3, 4, spirv::StorageClass::Input as u32],
    );
    let reflection = reflect::reflect_stage(&asm.build(), true).unwrap();
    assert!(reflection.inputs.is_empty());
}

#[test]
fn counts_push_constant_blocks() {
    let mut asm = Asm::new();
    asm.inst(spirv::Op::TypeFloat, &[1, 32])
        .inst(spirv::Op::TypeStruct, &[2, 1])
        .inst(spirv::Op::Decorate, &[2, spirv::Decoration::Block as u32])
        .inst(
            spirv::Op::TypePointer,
            &[3, spirv::StorageClass::PushConstant as u32, 2],
        )
        .inst(
            spirv::Op::Variable,
            &[3, 4, spirv::StorageClass::PushConstant as u32],
        );
    let reflection = reflect::reflect_stage(&asm.build(), false).unwrap();
    assert_eq!(reflection.push_constant_blocks, 1);
}

// ---------------- Stage merging ----------------

fn merge_stages(
    stages: &[(&[u32], ShaderStageSet, bool)],
) -> sq::Result<(
    DescriptorLayoutDesc,
    HashMap<String, ShaderProperty>,
    u32,
    ShaderStageSet,
)> {
    let mut layout = DescriptorLayoutDesc::default();
    let mut properties = HashMap::new();
    let mut ubo_size = 0;
    let mut push_stages = ShaderStageSet::empty();
    for (words, stage, vertex) in stages {
        let reflection = reflect::reflect_stage(words, *vertex)?;
        fill_descriptor_layout(
            "test.spv",
            *stage,
            &reflection,
            &mut layout,
            &mut properties,
            &mut ubo_size,
            &mut push_stages,
        )?;
    }
    Ok((layout, properties, ubo_size, push_stages))
}

#[test]
fn merges_material_schema_across_stages() {
    let vertex = vertex_stage_words();
    let fragment = fragment_stage_words();
    let (layout, properties, ubo_size, _) = merge_stages(&[
        (&vertex, ShaderStageSet::VERTEX, true),
        (&fragment, ShaderStageSet::FRAGMENT, false),
    ])
    .unwrap();

    assert_eq!(ubo_size, 32);
    assert_eq!(
        properties.get("time"),
        Some(&ShaderProperty::Vector {
            ty: DataType::Float,
            offset: 0
        })
    );
    assert_eq!(
        properties.get("tint"),
        Some(&ShaderProperty::Vector {
            ty: DataType::Vec4,
            offset: 16
        })
    );

    let material_set = &layout[MATERIAL_DESCRIPTOR_SET as usize];
    assert_eq!(material_set.len(), 1);
    assert_eq!(material_set[0].binding_point, 0);
    assert_eq!(material_set[0].ty, DescriptorType::UniformBuffer);
    assert_eq!(material_set[0].stages, ShaderStageSet::FRAGMENT);
}

#[test]
fn merging_both_stages_ors_the_stage_mask() {
    let fragment = fragment_stage_words();
    let (layout, _, _, _) = merge_stages(&[
        (&fragment, ShaderStageSet::VERTEX, false),
        (&fragment, ShaderStageSet::FRAGMENT, false),
    ])
    .unwrap();
    let material_set = &layout[MATERIAL_DESCRIPTOR_SET as usize];
    assert_eq!(material_set.len(), 1);
    assert_eq!(
        material_set[0].stages,
        ShaderStageSet::VERTEX | ShaderStageSet::FRAGMENT
    );
}

#[test]
fn conflicting_definitions_are_rejected() {
    // Same set+binding, but a texture in one stage and a uniform
    // buffer in the other
    let fragment = fragment_stage_words();
    let mut conflicting = Asm::new();
    conflicting
        .inst_named(spirv::Op::Name, &[6], "albedo")
        .inst(
            spirv::Op::Decorate,
            &[6, spirv::Decoration::DescriptorSet as u32, 1],
        )
        .inst(
            spirv::Op::Decorate,
            &[6, spirv::Decoration::Binding as u32, 0],
        )
        .inst(spirv::Op::TypeFloat, &[1, 32])
        .inst(
            spirv::Op::TypeImage,
            &[2, 1, spirv::Dim::Dim2D as u32, 0, 0, 0, 1, 0],
        )
        .inst(spirv::Op::TypeSampledImage, &[3, 2])
        .inst(
            spirv::Op::TypePointer,
            &[4, spirv::StorageClass::UniformConstant as u32, 3],
        )
        .inst(
            spirv::Op::Variable,
            &[4, 6, spirv::StorageClass::UniformConstant as u32],
        );
    let words = conflicting.build();
    let err = merge_stages(&[
        (&fragment, ShaderStageSet::VERTEX, false),
        (&words, ShaderStageSet::FRAGMENT, false),
    ])
    .unwrap_err();
    assert_eq!(err, SquallError::PROPERTY_MISMATCH);
}

#[test]
fn push_constants_union_stages() {
    let mut with_push = Asm::new();
    with_push
        .inst(spirv::Op::TypeFloat, &[1, 32])
        .inst(spirv::Op::TypeStruct, &[2, 1])
        .inst(spirv::Op::Decorate, &[2, spirv::Decoration::Block as u32])
        .inst(
            spirv::Op::TypePointer,
            &[3, spirv::StorageClass::PushConstant as u32, 2],
        )
        .inst(
            spirv::Op::Variable,
            &[3, 4, spirv::StorageClass::PushConstant as u32],
        );
    let words = with_push.build();
    let (_, _, _, push_stages) = merge_stages(&[
        (&words, ShaderStageSet::VERTEX, false),
        (&words, ShaderStageSet::FRAGMENT, false),
    ])
    .unwrap();
    assert_eq!(
        push_stages,
        ShaderStageSet::VERTEX | ShaderStageSet::FRAGMENT
    );
}

#[test]
fn rejects_material_set_out_of_range() {
    let mut asm = Asm::new();
    asm.inst(
        spirv::Op::Decorate,
        &[5, spirv::Decoration::DescriptorSet as u32, 4],
    )
    .inst(spirv::Op::Decorate, &[5, spirv::Decoration::Binding as u32, 0])
    .inst(
        spirv::Op::MemberDecorate,
        &[3, 0, spirv::Decoration::Offset as u32, 0],
    )
    .inst(spirv::Op::TypeFloat, &[1, 32])
    .inst(spirv::Op::TypeStruct, &[3, 1])
    .inst(spirv::Op::Decorate, &[3, spirv::Decoration::Block as u32])
    .inst(
        spirv::Op::TypePointer,
        &[4, spirv::StorageClass::Uniform as u32, 3],
    )
    .inst(
        spirv::Op::Variable,
        &[4, 5, spirv::StorageClass::Uniform as u32],
    );
    let words = asm.build();
    let err = merge_stages(&[(&words, ShaderStageSet::FRAGMENT, false)]).unwrap_err();
    assert_eq!(err, SquallError::LIMIT_EXCEEDED);
}

// ---------------- Device-level scenarios (need a vulkan implementation) ----------------

struct NullPipeline;

impl sq::Pipeline for NullPipeline {
    fn startup(&mut self, _rend: &mut sq::Renderer) -> sq::Result<()> {
        Ok(())
    }
    fn shutdown(&mut self, _rend: &mut sq::Renderer) {}
    fn resize(&mut self, _rend: &mut sq::Renderer) -> sq::Result<()> {
        Ok(())
    }
    fn render(
        &mut self,
        _rend: &mut sq::Renderer,
        _params: &sq::RecordParams,
    ) -> sq::Result<Option<std::sync::Arc<sq::ImageView>>> {
        Ok(None)
    }
    fn resolve_material_domain(&self, _domain: u32) -> sq::MaterialDomainInfo {
        sq::MaterialDomainInfo {
            render_pass: ash::vk::RenderPass::null(),
            subpass: 0,
            meta_material: sq::MetaMaterial::new(),
        }
    }
}

fn headless_renderer(render_ahead: u8) -> (sq::Renderer, NullPipeline) {
    let mut pipeline = NullPipeline;
    let info = sq::RendererStartupInfo {
        settings: sq::RenderSettings {
            render_ahead_count: render_ahead,
            enable_vsync: false,
            use_triple_buffering: false,
        },
        quad_budget: 64,
        surface: sq::SurfaceType::Headless,
        card_selector: None,
    };
    let rend = sq::Renderer::startup(info, &mut pipeline).expect("renderer startup failed");
    (rend, pipeline)
}

#[test]
#[ignore = "requires a vulkan-capable device"]
fn five_empty_frames() {
    let (mut rend, mut pipeline) = headless_renderer(2);
    for _ in 0..5 {
        rend.tick(&mut pipeline).unwrap();
    }
    assert_eq!(rend.current_frame(), 1);
    rend.shutdown(&mut pipeline);
}

#[test]
#[ignore = "requires a vulkan-capable device"]
fn shader_module_cache_is_idempotent() {
    let (rend, mut pipeline) = headless_renderer(2);
    let dev = rend.device().clone();
    let code = vertex_stage_words();

    let first = dev.get_shader_module("cache_test.vert.spv", &code).unwrap();
    assert_eq!(dev.shader_module_ref_count(first), 1);
    for _ in 0..9 {
        let again = dev.get_shader_module("cache_test.vert.spv", &code).unwrap();
        assert_eq!(again, first);
    }
    assert_eq!(dev.shader_module_ref_count(first), 10);

    for _ in 0..9 {
        dev.free_shader_module(first);
    }
    // nine frees leave the module alive
    assert_eq!(dev.shader_module_ref_count(first), 1);
    dev.free_shader_module(first);
    // the tenth free retires it and clears the table
    assert_eq!(dev.shader_module_ref_count(first), 0);

    rend.shutdown(&mut pipeline);
}

/// Uploads into its buffer while a frame is recording, the only
/// point where dynamic staging is legal
struct UploadPipeline {
    buffer: Option<sq::Buffer>,
}

impl sq::Pipeline for UploadPipeline {
    fn startup(&mut self, rend: &mut sq::Renderer) -> sq::Result<()> {
        self.buffer = Some(sq::Buffer::new(
            rend.device(),
            ash::vk::BufferUsageFlags::UNIFORM_BUFFER | ash::vk::BufferUsageFlags::TRANSFER_DST,
            64,
            false,
        )?);
        Ok(())
    }
    fn shutdown(&mut self, _rend: &mut sq::Renderer) {
        self.buffer = None;
    }
    fn resize(&mut self, _rend: &mut sq::Renderer) -> sq::Result<()> {
        Ok(())
    }
    fn render(
        &mut self,
        rend: &mut sq::Renderer,
        _params: &sq::RecordParams,
    ) -> sq::Result<Option<std::sync::Arc<sq::ImageView>>> {
        let buffer = self.buffer.take().unwrap();
        let bytes = [7u8; 64];
        rend.upload_buffer_dynamic(
            &buffer,
            0,
            &bytes,
            ash::vk::PipelineStageFlags::empty(),
            ash::vk::AccessFlags::empty(),
            ash::vk::PipelineStageFlags::VERTEX_SHADER,
            ash::vk::AccessFlags::UNIFORM_READ,
        )?;
        self.buffer = Some(buffer);
        Ok(None)
    }
    fn resolve_material_domain(&self, _domain: u32) -> sq::MaterialDomainInfo {
        sq::MaterialDomainInfo {
            render_pass: ash::vk::RenderPass::null(),
            subpass: 0,
            meta_material: sq::MetaMaterial::new(),
        }
    }
}

#[test]
#[ignore = "requires a vulkan-capable device"]
fn dynamic_upload_reaches_the_buffer() {
    let mut pipeline = UploadPipeline { buffer: None };
    let info = sq::RendererStartupInfo {
        settings: sq::RenderSettings {
            render_ahead_count: 2,
            enable_vsync: false,
            use_triple_buffering: false,
        },
        quad_budget: 64,
        surface: sq::SurfaceType::Headless,
        card_selector: None,
    };
    let mut rend = sq::Renderer::startup(info, &mut pipeline).expect("renderer startup failed");
    for _ in 0..4 {
        rend.tick(&mut pipeline).unwrap();
    }
    rend.shutdown(&mut pipeline);
}
