// The render pipeline trait
//
// A pipeline is a mini-backend for the renderer: it owns the render
// passes, framebuffers and pass-global resources of one rendering
// topology and records the draw calls for a frame. The core stays
// ignorant of forward/deferred/whatever; it only needs the seams
// declared here.
use ash::vk;
use std::sync::Arc;

use crate::image::ImageView;
use crate::pipeline_state::MetaMaterial;
use crate::renderer::{RecordParams, Renderer};
use crate::Result;

/// What a material domain resolves to: the pass and subpass the
/// domain draws in, plus the fixed-function state it requires
#[derive(Copy, Clone, Debug)]
pub struct MaterialDomainInfo {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub meta_material: MetaMaterial,
}

pub trait Pipeline {
    /// Create descriptor sets, render passes and targets. Called
    /// once by Renderer::startup, after the core is functional.
    fn startup(&mut self, rend: &mut Renderer) -> Result<()>;

    /// Tear down everything created in startup
    fn shutdown(&mut self, rend: &mut Renderer);

    /// The swapchain was recreated; rebuild size-dependent targets
    fn resize(&mut self, rend: &mut Renderer) -> Result<()>;

    /// Record one frame of draw calls into the current command
    /// buffer. The returned view is blitted to the swapchain image;
    /// None skips presentation compositing for this frame.
    ///
    /// Any dynamic descriptor allocators the pipeline owns must be
    /// reset for `params.frame` before sets are allocated from them.
    fn render(&mut self, rend: &mut Renderer, params: &RecordParams)
        -> Result<Option<Arc<ImageView>>>;

    /// Map an opaque material domain to its pass/subpass/state
    /// triple. Materials use this to pre-bake pipeline states.
    fn resolve_material_domain(&self, domain: u32) -> MaterialDomainInfo;

    /// The pass-global descriptor set (set 0), bound once per frame
    /// at the first material bind
    fn global_descriptor_set(&self) -> vk::DescriptorSet {
        vk::DescriptorSet::null()
    }

    /// The layout of set 0, registered with the device so shader
    /// pipeline layouts stay compatible across materials
    fn global_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::null()
    }
}
