// Images, image views and textures
//
// An Image owns its vulkan image and allocation and tracks the
// current layout of every array layer, so upload and render paths
// can elide barriers the layer already satisfies. Views reference
// a layer range of an image; a Texture pairs a view with a sampler
// owned by someone else.
use ash::vk;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use crate::device::Device;
use crate::Result;
use utils::log;

/// Image dimensionality as shaders declare it
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageDim {
    D1,
    D2,
    D3,
    Cube,
}

impl ImageDim {
    pub(crate) fn to_vk_view_type(self, layer_count: u32) -> vk::ImageViewType {
        match (self, layer_count) {
            (ImageDim::D1, 1) => vk::ImageViewType::TYPE_1D,
            (ImageDim::D1, _) => vk::ImageViewType::TYPE_1D_ARRAY,
            (ImageDim::D2, 1) => vk::ImageViewType::TYPE_2D,
            (ImageDim::D2, _) => vk::ImageViewType::TYPE_2D_ARRAY,
            (ImageDim::D3, _) => vk::ImageViewType::TYPE_3D,
            (ImageDim::Cube, _) => vk::ImageViewType::CUBE,
        }
    }
}

struct ImageBacking {
    image: vk::Image,
    memory: vk::DeviceMemory,
    extent: vk::Extent2D,
}

pub struct Image {
    i_dev: Arc<Device>,
    i_backing: RwLock<ImageBacking>,
    i_format: vk::Format,
    i_usage: vk::ImageUsageFlags,
    i_layers: u32,
    i_samples: u32,
    i_cube_compatible: bool,
    /// The layout the next consumer of each layer will observe.
    /// Updated with every recorded transition.
    i_layouts: Vec<AtomicI32>,
}

impl Image {
    pub fn new(
        dev: &Arc<Device>,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        width: u32,
        height: u32,
        layers: u32,
        samples: u32,
        cube_compatible: bool,
    ) -> Result<Arc<Image>> {
        let extent = vk::Extent2D {
            width: width,
            height: height,
        };
        let (image, memory) =
            dev.create_image_internal(format, usage, extent, layers, samples, cube_compatible)?;

        let mut layouts = Vec::with_capacity(layers as usize);
        for _ in 0..layers {
            layouts.push(AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()));
        }

        Ok(Arc::new(Image {
            i_dev: dev.clone(),
            i_backing: RwLock::new(ImageBacking {
                image: image,
                memory: memory,
                extent: extent,
            }),
            i_format: format,
            i_usage: usage,
            i_layers: layers,
            i_samples: samples,
            i_cube_compatible: cube_compatible,
            i_layouts: layouts,
        }))
    }

    pub fn vk_image(&self) -> vk::Image {
        self.i_backing.read().unwrap().image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.i_backing.read().unwrap().extent
    }

    pub fn format(&self) -> vk::Format {
        self.i_format
    }

    pub fn layer_count(&self) -> u32 {
        self.i_layers
    }

    pub fn samples(&self) -> u32 {
        self.i_samples
    }

    pub fn layout(&self, layer: u32) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.i_layouts[layer as usize].load(Ordering::Acquire))
    }

    pub(crate) fn set_layout(&self, layer: u32, layout: vk::ImageLayout) {
        self.i_layouts[layer as usize].store(layout.as_raw(), Ordering::Release);
    }

    /// Replace the backing image with one of a new size.
    ///
    /// The old image and memory retire through the deletion queue.
    /// Every layer layout resets to undefined; views into this
    /// image must be recreated.
    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        let extent = vk::Extent2D {
            width: width,
            height: height,
        };
        let (image, memory) = match self.i_dev.create_image_internal(
            self.i_format,
            self.i_usage,
            extent,
            self.i_layers,
            self.i_samples,
            self.i_cube_compatible,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Image resize failed but you can still use the old one.");
                return Err(e);
            }
        };

        let mut backing = self.i_backing.write().unwrap();
        self.schedule_release(&backing);
        backing.image = image;
        backing.memory = memory;
        backing.extent = extent;
        for layout in self.i_layouts.iter() {
            layout.store(vk::ImageLayout::UNDEFINED.as_raw(), Ordering::Release);
        }
        Ok(())
    }

    fn schedule_release(&self, backing: &ImageBacking) {
        let raw_dev = self.i_dev.vk_device().clone();
        let image = backing.image;
        let memory = backing.memory;
        self.i_dev.pending_delete(Box::new(move || unsafe {
            raw_dev.destroy_image(image, None);
            raw_dev.free_memory(memory, None);
        }));
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let backing = self.i_backing.read().unwrap();
        if backing.image != vk::Image::null() {
            self.schedule_release(&backing);
        }
    }
}

/// A view over a layer range of an image
pub struct ImageView {
    v_image: Arc<Image>,
    v_handle: RwLock<vk::ImageView>,
    v_base_layer: u32,
    v_layer_count: u32,
    v_dim: ImageDim,
    v_aspect: vk::ImageAspectFlags,
}

impl ImageView {
    pub fn new(
        image: &Arc<Image>,
        base_layer: u32,
        layer_count: u32,
        dim: ImageDim,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Arc<ImageView>> {
        let handle = image.i_dev.create_image_view_internal(
            image.vk_image(),
            image.format(),
            base_layer,
            layer_count,
            dim.to_vk_view_type(layer_count),
            aspect,
        )?;

        Ok(Arc::new(ImageView {
            v_image: image.clone(),
            v_handle: RwLock::new(handle),
            v_base_layer: base_layer,
            v_layer_count: layer_count,
            v_dim: dim,
            v_aspect: aspect,
        }))
    }

    pub fn vk_image_view(&self) -> vk::ImageView {
        *self.v_handle.read().unwrap()
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.v_image
    }

    pub fn dim(&self) -> ImageDim {
        self.v_dim
    }

    pub fn base_layer(&self) -> u32 {
        self.v_base_layer
    }

    pub fn layer_count(&self) -> u32 {
        self.v_layer_count
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.v_aspect
    }

    /// Rebuild the view after the image was resized. The stale view
    /// retires through the deletion queue.
    pub fn recreate(&self) -> Result<()> {
        let image = &self.v_image;
        let new_handle = image.i_dev.create_image_view_internal(
            image.vk_image(),
            image.format(),
            self.v_base_layer,
            self.v_layer_count,
            self.v_dim.to_vk_view_type(self.v_layer_count),
            self.v_aspect,
        )?;

        let mut handle = self.v_handle.write().unwrap();
        let raw_dev = image.i_dev.vk_device().clone();
        let old = *handle;
        image.i_dev.pending_delete(Box::new(move || unsafe {
            raw_dev.destroy_image_view(old, None);
        }));
        *handle = new_handle;
        Ok(())
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        let handle = *self.v_handle.read().unwrap();
        if handle != vk::ImageView::null() {
            let raw_dev = self.v_image.i_dev.vk_device().clone();
            self.v_image.i_dev.pending_delete(Box::new(move || unsafe {
                raw_dev.destroy_image_view(handle, None);
            }));
        }
    }
}

/// An image view paired with a sampler. The sampler belongs to
/// whoever created it, usually the render pipeline layer.
pub struct Texture {
    t_view: Arc<ImageView>,
    t_sampler: vk::Sampler,
}

impl Texture {
    pub fn new(view: &Arc<ImageView>, sampler: vk::Sampler) -> Texture {
        Texture {
            t_view: view.clone(),
            t_sampler: sampler,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.t_sampler != vk::Sampler::null()
    }

    pub fn view(&self) -> &Arc<ImageView> {
        &self.t_view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.t_sampler
    }
}
