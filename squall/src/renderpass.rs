// Render pass assembly
//
// The builder collects attachments and per-subpass roles, then
// derives load/store operations, initial/final layouts and the
// subpass dependencies from how each attachment is actually used.
// Structurally identical passes share one vkRenderPass through a
// refcounted cache keyed on the canonical description.
use ash::vk;
use ash::vk::Handle;
use std::collections::HashMap;
use std::sync::Arc;

use crate::deletion_queue::DeletionQueue;
use crate::device::Device;
use crate::image::ImageView;
use crate::{Result, SquallError};
use utils::log;

bitflags::bitflags! {
    /// How one subpass touches one attachment
    struct AttachmentRole: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const CLEAR = 0x4;
        const DEPTH = 0x8;
    }
}

struct AttachmentRecord {
    view: Arc<ImageView>,
    format: vk::Format,
    samples: u32,
    /// Present source after the pass, for swapchain targets
    present_after: bool,
}

#[derive(Default)]
struct SubpassRecord {
    /// (attachment index, role) pairs in declaration order
    uses: Vec<(usize, AttachmentRole)>,
    preserves: Vec<usize>,
}

pub struct RenderPassBuilder {
    attachments: Vec<AttachmentRecord>,
    attachment_indices: HashMap<vk::ImageView, usize>,
    subpasses: Vec<SubpassRecord>,
}

impl RenderPassBuilder {
    pub fn new() -> Self {
        Self {
            attachments: Vec::new(),
            attachment_indices: HashMap::new(),
            subpasses: Vec::new(),
        }
    }

    /// Attachments are deduplicated by the view they reference
    fn get_or_add_attachment(&mut self, view: &Arc<ImageView>) -> usize {
        let key = view.vk_image_view();
        if let Some(index) = self.attachment_indices.get(&key) {
            return *index;
        }
        let index = self.attachments.len();
        self.attachments.push(AttachmentRecord {
            view: view.clone(),
            format: view.image().format(),
            samples: view.image().samples(),
            present_after: false,
        });
        self.attachment_indices.insert(key, index);
        return index;
    }

    fn is_depth(view: &Arc<ImageView>) -> bool {
        view.aspect().contains(vk::ImageAspectFlags::DEPTH)
    }

    pub fn push_subpass(&mut self) -> &mut Self {
        self.subpasses.push(SubpassRecord::default());
        self
    }

    fn add_use(&mut self, view: &Arc<ImageView>, mut role: AttachmentRole) -> &mut Self {
        assert!(!self.subpasses.is_empty());
        if Self::is_depth(view) {
            role |= AttachmentRole::DEPTH;
        }
        let index = self.get_or_add_attachment(view);
        let subpass = self.subpasses.last_mut().unwrap();
        match subpass.uses.iter_mut().find(|(i, _)| *i == index) {
            Some((_, existing)) => *existing |= role,
            None => subpass.uses.push((index, role)),
        }
        self
    }

    /// The current subpass samples this attachment as an input
    pub fn read(&mut self, view: &Arc<ImageView>) -> &mut Self {
        self.add_use(view, AttachmentRole::READ)
    }

    /// The current subpass renders to this attachment
    pub fn write(&mut self, view: &Arc<ImageView>) -> &mut Self {
        self.add_use(view, AttachmentRole::WRITE)
    }

    /// The current subpass clears then renders to this attachment
    pub fn clear(&mut self, view: &Arc<ImageView>) -> &mut Self {
        self.add_use(view, AttachmentRole::CLEAR | AttachmentRole::WRITE)
    }

    /// Keep an attachment alive across a subpass that ignores it
    pub fn preserve(&mut self, view: &Arc<ImageView>) -> &mut Self {
        assert!(!self.subpasses.is_empty());
        let index = self.get_or_add_attachment(view);
        self.subpasses.last_mut().unwrap().preserves.push(index);
        self
    }

    /// Mark an attachment as presented after the pass ends
    pub fn present_source(&mut self, view: &Arc<ImageView>) -> &mut Self {
        let index = self.get_or_add_attachment(view);
        self.attachments[index].present_after = true;
        self
    }

    /// Layout an attachment needs while used with `role`
    fn role_layout(role: AttachmentRole) -> vk::ImageLayout {
        if role.contains(AttachmentRole::DEPTH) {
            if role.intersects(AttachmentRole::WRITE | AttachmentRole::CLEAR) {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            }
        } else if role.intersects(AttachmentRole::WRITE | AttachmentRole::CLEAR) {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
    }

    /// The canonical identity of this pass: attachment views and
    /// roles, subpass usage lists, in order
    fn cache_key(&self) -> Vec<u64> {
        let mut key = Vec::new();
        key.push(self.attachments.len() as u64);
        for attachment in self.attachments.iter() {
            key.push(attachment.view.vk_image_view().as_raw());
            key.push(attachment.format.as_raw() as u64);
            key.push(attachment.present_after as u64);
        }
        for subpass in self.subpasses.iter() {
            key.push(u64::MAX); // subpass delimiter
            for (index, role) in subpass.uses.iter() {
                key.push(((*index as u64) << 8) | role.bits() as u64);
            }
            for index in subpass.preserves.iter() {
                key.push(((*index as u64) << 8) | 0x80);
            }
        }
        return key;
    }

    /// Resolve the builder into a cached render pass handle.
    ///
    /// The derived ops follow first-use/last-use: the first subpass
    /// reading an attachment forces Load, the first clearing it
    /// forces Clear, anything else starts DontCare; the last writer
    /// forces Store. Initial/final layouts come from the same walk.
    pub fn build(&self, dev: &Arc<Device>) -> Result<vk::RenderPass> {
        if self.subpasses.is_empty() || self.attachments.is_empty() {
            return Err(SquallError::INVALID);
        }
        dev.get_render_pass(self)
    }

    /// Translate to vulkan descriptions and create the pass
    pub(crate) fn create(&self, dev: &ash::Device) -> Result<vk::RenderPass> {
        let num_attachments = self.attachments.len();

        // First/last use per attachment
        let mut first_use: Vec<Option<AttachmentRole>> = vec![None; num_attachments];
        let mut last_use: Vec<Option<AttachmentRole>> = vec![None; num_attachments];
        let mut last_write_subpass: Vec<Option<usize>> = vec![None; num_attachments];
        for (subpass_index, subpass) in self.subpasses.iter().enumerate() {
            for (index, role) in subpass.uses.iter() {
                if first_use[*index].is_none() {
                    first_use[*index] = Some(*role);
                }
                last_use[*index] = Some(*role);
                if role.intersects(AttachmentRole::WRITE | AttachmentRole::CLEAR) {
                    last_write_subpass[*index] = Some(subpass_index);
                }
            }
        }

        let mut descriptions = Vec::with_capacity(num_attachments);
        for (i, attachment) in self.attachments.iter().enumerate() {
            let first = first_use[i].unwrap_or(AttachmentRole::empty());
            let last = last_use[i].unwrap_or(AttachmentRole::empty());

            let load_op = if first.contains(AttachmentRole::CLEAR) {
                vk::AttachmentLoadOp::CLEAR
            } else if first.contains(AttachmentRole::READ) {
                vk::AttachmentLoadOp::LOAD
            } else {
                vk::AttachmentLoadOp::DONT_CARE
            };
            let store_op = if last.intersects(AttachmentRole::WRITE | AttachmentRole::CLEAR) {
                vk::AttachmentStoreOp::STORE
            } else {
                vk::AttachmentStoreOp::DONT_CARE
            };

            let initial_layout = match load_op {
                vk::AttachmentLoadOp::LOAD => Self::role_layout(first),
                _ => vk::ImageLayout::UNDEFINED,
            };
            let final_layout = match attachment.present_after {
                true => vk::ImageLayout::PRESENT_SRC_KHR,
                false => Self::role_layout(last),
            };

            descriptions.push(
                vk::AttachmentDescription::builder()
                    .format(attachment.format)
                    .samples(vk::SampleCountFlags::from_raw(attachment.samples))
                    .load_op(load_op)
                    .store_op(store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial_layout)
                    .final_layout(final_layout)
                    .build(),
            );
        }

        // Subpass descriptions. The reference arrays must outlive
        // the create call, so collect them per subpass first.
        let mut input_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
        let mut color_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
        let mut depth_refs: Vec<Option<vk::AttachmentReference>> = Vec::new();
        for subpass in self.subpasses.iter() {
            let mut inputs = Vec::new();
            let mut colors = Vec::new();
            let mut depth = None;
            for (index, role) in subpass.uses.iter() {
                let reference = vk::AttachmentReference {
                    attachment: *index as u32,
                    layout: Self::role_layout(*role),
                };
                if role.contains(AttachmentRole::DEPTH) {
                    if role.intersects(AttachmentRole::WRITE | AttachmentRole::CLEAR) {
                        depth = Some(reference);
                    } else {
                        inputs.push(reference);
                    }
                } else if role.intersects(AttachmentRole::WRITE | AttachmentRole::CLEAR) {
                    colors.push(reference);
                } else {
                    inputs.push(reference);
                }
            }
            input_refs.push(inputs);
            color_refs.push(colors);
            depth_refs.push(depth);
        }

        let preserve_lists: Vec<Vec<u32>> = self
            .subpasses
            .iter()
            .map(|s| s.preserves.iter().map(|i| *i as u32).collect())
            .collect();

        let mut subpass_descriptions = Vec::with_capacity(self.subpasses.len());
        for i in 0..self.subpasses.len() {
            let mut builder = vk::SubpassDescription::builder()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .input_attachments(&input_refs[i])
                .color_attachments(&color_refs[i])
                .preserve_attachments(&preserve_lists[i]);
            if let Some(depth) = depth_refs[i].as_ref() {
                builder = builder.depth_stencil_attachment(depth);
            }
            subpass_descriptions.push(builder.build());
        }

        // Read-after-write dependencies across consecutive subpasses
        let mut dependencies = Vec::new();
        for j in 1..self.subpasses.len() {
            let i = j - 1;
            let mut needed = false;
            let mut depth_write = false;
            for (index, role) in self.subpasses[j].uses.iter() {
                if !role.contains(AttachmentRole::READ) {
                    continue;
                }
                let written_in_prev = self.subpasses[i]
                    .uses
                    .iter()
                    .any(|(pi, prole)| {
                        pi == index
                            && prole.intersects(AttachmentRole::WRITE | AttachmentRole::CLEAR)
                    });
                if written_in_prev {
                    needed = true;
                    if role.contains(AttachmentRole::DEPTH) {
                        depth_write = true;
                    }
                }
            }
            if needed {
                let (src_stage, src_access) = match depth_write {
                    true => (
                        vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    ),
                    false => (
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    ),
                };
                dependencies.push(
                    vk::SubpassDependency::builder()
                        .src_subpass(i as u32)
                        .dst_subpass(j as u32)
                        .src_stage_mask(src_stage)
                        .src_access_mask(src_access)
                        .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                        .dst_access_mask(vk::AccessFlags::INPUT_ATTACHMENT_READ)
                        .dependency_flags(vk::DependencyFlags::BY_REGION)
                        .build(),
                );
            }
        }

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&descriptions)
            .subpasses(&subpass_descriptions)
            .dependencies(&dependencies);

        unsafe {
            dev.create_render_pass(&info, None).map_err(|_| {
                log::error!("Cannot create render pass");
                SquallError::CREATION_FAILED
            })
        }
    }

    pub fn attachment_views(&self) -> Vec<Arc<ImageView>> {
        self.attachments.iter().map(|a| a.view.clone()).collect()
    }
}

// ---------------- Cache ----------------

pub(crate) struct RenderPassCache {
    table: HashMap<Vec<u64>, vk::RenderPass>,
    ref_counts: HashMap<vk::RenderPass, (Vec<u64>, u32)>,
}

impl RenderPassCache {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
            ref_counts: HashMap::new(),
        }
    }

    pub fn get(
        &mut self,
        dev: &ash::Device,
        builder: &RenderPassBuilder,
    ) -> Result<vk::RenderPass> {
        let key = builder.cache_key();
        if let Some(pass) = self.table.get(&key) {
            self.ref_counts.get_mut(pass).unwrap().1 += 1;
            return Ok(*pass);
        }
        let pass = builder.create(dev)?;
        self.table.insert(key.clone(), pass);
        self.ref_counts.insert(pass, (key, 1));
        Ok(pass)
    }

    pub fn free(&mut self, dev: &ash::Device, queue: &mut DeletionQueue, pass: vk::RenderPass) {
        let entry = self.ref_counts.get_mut(&pass).expect("Unknown render pass");
        debug_assert!(entry.1 != 0);
        entry.1 -= 1;
        if entry.1 == 0 {
            let key = entry.0.clone();
            self.table.remove(&key);
            self.ref_counts.remove(&pass);
            let raw_dev = dev.clone();
            queue.push(Box::new(move || unsafe {
                raw_dev.destroy_render_pass(pass, None);
            }));
        }
    }

    pub fn assert_empty(&self) {
        debug_assert!(self.table.is_empty());
        debug_assert!(self.ref_counts.is_empty());
    }
}

impl Device {
    pub fn get_render_pass(&self, builder: &RenderPassBuilder) -> Result<vk::RenderPass> {
        self.d_internal
            .write()
            .unwrap()
            .render_pass_cache
            .get(&self.dev, builder)
    }

    pub fn free_render_pass(&self, pass: vk::RenderPass) {
        let mut internal = self.d_internal.write().unwrap();
        let crate::device::DeviceInternal {
            ref mut render_pass_cache,
            ref mut deletion_queue,
            ..
        } = *internal;
        render_pass_cache.free(&self.dev, deletion_queue, pass);
    }
}
