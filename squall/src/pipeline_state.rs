// Fixed-function pipeline state
//
// MetaMaterial packs the whole fixed-function portion of a pipeline
// (cull, depth, blend, wireframe) into 32 bits so pipeline-state
// cache keys stay cheap to hash and compare.
use ash::vk;

use crate::{DataType, Result, SquallError};
use utils::log;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CullMode {
    None = 0,
    Front = 1,
    Back = 2,
    FrontAndBack = 3,
}

impl CullMode {
    fn from_bits(bits: u32) -> CullMode {
        match bits & 0x3 {
            0 => CullMode::None,
            1 => CullMode::Front,
            2 => CullMode::Back,
            _ => CullMode::FrontAndBack,
        }
    }

    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero = 0,
    One = 1,
    SourceColor = 2,
    OneMinusSourceColor = 3,
    DestColor = 4,
    OneMinusDestColor = 5,
    SourceAlpha = 6,
    OneMinusSourceAlpha = 7,
    DestAlpha = 8,
    OneMinusDestAlpha = 9,
}

impl BlendFactor {
    fn from_bits(bits: u32) -> BlendFactor {
        match bits & 0xf {
            0 => BlendFactor::Zero,
            1 => BlendFactor::One,
            2 => BlendFactor::SourceColor,
            3 => BlendFactor::OneMinusSourceColor,
            4 => BlendFactor::DestColor,
            5 => BlendFactor::OneMinusDestColor,
            6 => BlendFactor::SourceAlpha,
            7 => BlendFactor::OneMinusSourceAlpha,
            8 => BlendFactor::DestAlpha,
            _ => BlendFactor::OneMinusDestAlpha,
        }
    }

    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SourceColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::OneMinusSourceColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::DestColor => vk::BlendFactor::DST_COLOR,
            BlendFactor::OneMinusDestColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::SourceAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::OneMinusSourceAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DestAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::OneMinusDestAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendOperation {
    Add = 0,
    Subtract = 1,
    ReverseSubtract = 2,
    Min = 3,
    Max = 4,
}

impl BlendOperation {
    fn from_bits(bits: u32) -> BlendOperation {
        match bits & 0xf {
            0 => BlendOperation::Add,
            1 => BlendOperation::Subtract,
            2 => BlendOperation::ReverseSubtract,
            3 => BlendOperation::Min,
            _ => BlendOperation::Max,
        }
    }

    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOperation::Add => vk::BlendOp::ADD,
            BlendOperation::Subtract => vk::BlendOp::SUBTRACT,
            BlendOperation::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOperation::Min => vk::BlendOp::MIN,
            BlendOperation::Max => vk::BlendOp::MAX,
        }
    }
}

// Bit layout, LSB first:
//   [0..4)   cull mode
//   [4]      depth test
//   [5]      depth write
//   [6]      blend enable
//   [7]      wireframe
//   [8..12)  source color factor
//   [12..16) source alpha factor
//   [16..20) color blend op
//   [20..24) dest color factor
//   [24..28) dest alpha factor
//   [28..32) alpha blend op
const CULL_SHIFT: u32 = 0;
const DEPTH_TEST_BIT: u32 = 1 << 4;
const DEPTH_WRITE_BIT: u32 = 1 << 5;
const BLEND_BIT: u32 = 1 << 6;
const WIREFRAME_BIT: u32 = 1 << 7;
const SRC_COLOR_SHIFT: u32 = 8;
const SRC_ALPHA_SHIFT: u32 = 12;
const COLOR_OP_SHIFT: u32 = 16;
const DST_COLOR_SHIFT: u32 = 20;
const DST_ALPHA_SHIFT: u32 = 24;
const ALPHA_OP_SHIFT: u32 = 28;

/// The fixed-function half of a pipeline-state key
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetaMaterial(u32);

impl Default for MetaMaterial {
    fn default() -> Self {
        MetaMaterial::new()
    }
}

impl MetaMaterial {
    /// Opaque defaults: back-face culling, depth test and write on,
    /// blending off, standard alpha factors preloaded for when
    /// blending gets enabled
    pub fn new() -> Self {
        MetaMaterial(0)
            .with_cull_mode(CullMode::Back)
            .with_depth_test(true)
            .with_depth_write(true)
            .with_blend_factors(
                BlendFactor::SourceAlpha,
                BlendFactor::OneMinusSourceAlpha,
                BlendOperation::Add,
                BlendFactor::Zero,
                BlendFactor::One,
                BlendOperation::Add,
            )
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        MetaMaterial(bits)
    }

    fn with_field(self, shift: u32, width_mask: u32, value: u32) -> Self {
        MetaMaterial((self.0 & !(width_mask << shift)) | ((value & width_mask) << shift))
    }

    fn with_bit(self, bit: u32, value: bool) -> Self {
        match value {
            true => MetaMaterial(self.0 | bit),
            false => MetaMaterial(self.0 & !bit),
        }
    }

    pub fn with_cull_mode(self, mode: CullMode) -> Self {
        self.with_field(CULL_SHIFT, 0xf, mode as u32)
    }

    pub fn with_depth_test(self, on: bool) -> Self {
        self.with_bit(DEPTH_TEST_BIT, on)
    }

    pub fn with_depth_write(self, on: bool) -> Self {
        self.with_bit(DEPTH_WRITE_BIT, on)
    }

    pub fn with_blend(self, on: bool) -> Self {
        self.with_bit(BLEND_BIT, on)
    }

    pub fn with_wireframe(self, on: bool) -> Self {
        self.with_bit(WIREFRAME_BIT, on)
    }

    pub fn with_blend_factors(
        self,
        src_color: BlendFactor,
        dst_color: BlendFactor,
        color_op: BlendOperation,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
        alpha_op: BlendOperation,
    ) -> Self {
        self.with_field(SRC_COLOR_SHIFT, 0xf, src_color as u32)
            .with_field(DST_COLOR_SHIFT, 0xf, dst_color as u32)
            .with_field(COLOR_OP_SHIFT, 0xf, color_op as u32)
            .with_field(SRC_ALPHA_SHIFT, 0xf, src_alpha as u32)
            .with_field(DST_ALPHA_SHIFT, 0xf, dst_alpha as u32)
            .with_field(ALPHA_OP_SHIFT, 0xf, alpha_op as u32)
    }

    pub fn cull_mode(&self) -> CullMode {
        CullMode::from_bits(self.0 >> CULL_SHIFT)
    }

    pub fn depth_test(&self) -> bool {
        self.0 & DEPTH_TEST_BIT != 0
    }

    pub fn depth_write(&self) -> bool {
        self.0 & DEPTH_WRITE_BIT != 0
    }

    pub fn blend(&self) -> bool {
        self.0 & BLEND_BIT != 0
    }

    pub fn wireframe(&self) -> bool {
        self.0 & WIREFRAME_BIT != 0
    }

    pub fn source_color_factor(&self) -> BlendFactor {
        BlendFactor::from_bits(self.0 >> SRC_COLOR_SHIFT)
    }

    pub fn source_alpha_factor(&self) -> BlendFactor {
        BlendFactor::from_bits(self.0 >> SRC_ALPHA_SHIFT)
    }

    pub fn dest_color_factor(&self) -> BlendFactor {
        BlendFactor::from_bits(self.0 >> DST_COLOR_SHIFT)
    }

    pub fn dest_alpha_factor(&self) -> BlendFactor {
        BlendFactor::from_bits(self.0 >> DST_ALPHA_SHIFT)
    }

    pub fn color_blend_operation(&self) -> BlendOperation {
        BlendOperation::from_bits(self.0 >> COLOR_OP_SHIFT)
    }

    pub fn alpha_blend_operation(&self) -> BlendOperation {
        BlendOperation::from_bits(self.0 >> ALPHA_OP_SHIFT)
    }
}

/// Everything a graphics pipeline compilation needs
pub(crate) struct PipelineInfo<'a> {
    pub vertex_layout: &'a [DataType],
    pub meta: MetaMaterial,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub layout: vk::PipelineLayout,
    pub vertex_module: vk::ShaderModule,
    pub geometry_module: vk::ShaderModule,
    pub fragment_module: vk::ShaderModule,
}

/// Compile one graphics pipeline
///
/// Viewport, scissor and line width stay dynamic so window resizes
/// do not invalidate cached pipelines. Topology is fixed to a
/// triangle list and multisampling to one sample.
pub(crate) fn create_pipeline(
    dev: &ash::Device,
    info: &PipelineInfo,
    supports_wireframe: bool,
) -> Result<vk::Pipeline> {
    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::LINE_WIDTH,
    ];
    let dynamic_info = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Vertex layout. Locations are contiguous and tightly packed
    // in one interleaved binding.
    let mut vertex_attributes = Vec::with_capacity(info.vertex_layout.len());
    let mut offset = 0;
    for (i, ty) in info.vertex_layout.iter().enumerate() {
        vertex_attributes.push(
            vk::VertexInputAttributeDescription::builder()
                .location(i as u32)
                .binding(0)
                .format(ty.to_vk_format())
                .offset(offset)
                .build(),
        );
        offset += ty.size();
    }
    let vertex_bindings = [vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(offset)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build()];
    let mut vertex_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_attribute_descriptions(&vertex_attributes);
    if !info.vertex_layout.is_empty() {
        vertex_info = vertex_info.vertex_binding_descriptions(&vertex_bindings);
    }

    let assembly_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Counts only, the actual rects are dynamic
    let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let wireframe = info.meta.wireframe() && supports_wireframe;
    if info.meta.wireframe() && !supports_wireframe {
        log::warning!("Wireframe requested but not supported, falling back to fill");
    }
    let raster_info = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(match wireframe {
            true => vk::PolygonMode::LINE,
            false => vk::PolygonMode::FILL,
        })
        .cull_mode(info.meta.cull_mode().to_vk())
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .line_width(1.0);

    let msaa_info = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let depth_info = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(info.meta.depth_test())
        .depth_write_enable(info.meta.depth_write())
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_states = [vk::PipelineColorBlendAttachmentState::builder()
        .blend_enable(info.meta.blend())
        .src_color_blend_factor(info.meta.source_color_factor().to_vk())
        .dst_color_blend_factor(info.meta.dest_color_factor().to_vk())
        .color_blend_op(info.meta.color_blend_operation().to_vk())
        .src_alpha_blend_factor(info.meta.source_alpha_factor().to_vk())
        .dst_alpha_blend_factor(info.meta.dest_alpha_factor().to_vk())
        .alpha_blend_op(info.meta.alpha_blend_operation().to_vk())
        .color_write_mask(
            vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
        )
        .build()];
    let blend_info = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&blend_states);

    let entry_name = unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"main\0") };
    let mut stages = Vec::with_capacity(3);
    stages.push(
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(info.vertex_module)
            .name(entry_name)
            .build(),
    );
    if info.geometry_module != vk::ShaderModule::null() {
        stages.push(
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::GEOMETRY)
                .module(info.geometry_module)
                .name(entry_name)
                .build(),
        );
    }
    stages.push(
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(info.fragment_module)
            .name(entry_name)
            .build(),
    );

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_info)
        .input_assembly_state(&assembly_info)
        .viewport_state(&viewport_info)
        .rasterization_state(&raster_info)
        .multisample_state(&msaa_info)
        .depth_stencil_state(&depth_info)
        .color_blend_state(&blend_info)
        .dynamic_state(&dynamic_info)
        .layout(info.layout)
        .render_pass(info.render_pass)
        .subpass(info.subpass)
        .build();

    let pipelines = unsafe {
        dev.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| {
                log::error!("Cannot create graphics pipeline: {:?}", e);
                SquallError::CREATION_FAILED
            })?
    };

    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_opaque_state() {
        let meta = MetaMaterial::new();
        assert_eq!(meta.cull_mode(), CullMode::Back);
        assert!(meta.depth_test());
        assert!(meta.depth_write());
        assert!(!meta.blend());
        assert!(!meta.wireframe());
        assert_eq!(meta.source_color_factor(), BlendFactor::SourceAlpha);
        assert_eq!(meta.dest_color_factor(), BlendFactor::OneMinusSourceAlpha);
        assert_eq!(meta.source_alpha_factor(), BlendFactor::Zero);
        assert_eq!(meta.dest_alpha_factor(), BlendFactor::One);
        assert_eq!(meta.color_blend_operation(), BlendOperation::Add);
        assert_eq!(meta.alpha_blend_operation(), BlendOperation::Add);
    }

    #[test]
    fn packing_round_trips() {
        let meta = MetaMaterial::new()
            .with_cull_mode(CullMode::None)
            .with_depth_test(false)
            .with_blend(true)
            .with_wireframe(true)
            .with_blend_factors(
                BlendFactor::One,
                BlendFactor::OneMinusDestAlpha,
                BlendOperation::Max,
                BlendFactor::DestColor,
                BlendFactor::Zero,
                BlendOperation::ReverseSubtract,
            );
        let copy = MetaMaterial::from_bits(meta.bits());
        assert_eq!(meta, copy);
        assert_eq!(copy.cull_mode(), CullMode::None);
        assert!(!copy.depth_test());
        assert!(copy.depth_write());
        assert!(copy.blend());
        assert!(copy.wireframe());
        assert_eq!(copy.source_color_factor(), BlendFactor::One);
        assert_eq!(copy.dest_color_factor(), BlendFactor::OneMinusDestAlpha);
        assert_eq!(copy.color_blend_operation(), BlendOperation::Max);
        assert_eq!(copy.source_alpha_factor(), BlendFactor::DestColor);
        assert_eq!(copy.dest_alpha_factor(), BlendFactor::Zero);
        assert_eq!(copy.alpha_blend_operation(), BlendOperation::ReverseSubtract);
    }

    #[test]
    fn byte_equal_values_compare_equal() {
        let a = MetaMaterial::new().with_blend(true);
        let b = MetaMaterial::new().with_blend(true);
        assert_eq!(a, b);
        assert_eq!(a.bits(), b.bits());
    }
}
