// Swapchain ownership and presentation
//
// A Display is the renderer's output: either a real vulkan
// swapchain on a window surface handed in by the embedding layer,
// or a headless pair of offscreen images for tests. The renderer
// only talks to the backend trait, so the frame scheduler is
// identical in both cases.
use ash::extensions::khr;
use ash::vk;

use crate::device::Device;
use crate::renderer::RenderSettings;
use crate::{Result, SquallError};
use utils::log;

use std::ffi::CStr;
use std::sync::Arc;

/// Window surfaces are created by the embedding layer since only
/// it knows the windowing system. It also names the instance
/// extensions that the surface will require.
pub type SurfaceCreateFn =
    Box<dyn FnOnce(&ash::Entry, &ash::Instance) -> std::result::Result<vk::SurfaceKHR, vk::Result>>;

pub enum SurfaceType {
    /// Render to offscreen images; present is a no-op
    Headless,
    Window {
        extensions: Vec<&'static CStr>,
        create_surface: SurfaceCreateFn,
    },
}

impl SurfaceType {
    pub(crate) fn instance_extensions(&self) -> Vec<&'static CStr> {
        match self {
            SurfaceType::Headless => Vec::new(),
            SurfaceType::Window { extensions, .. } => extensions.clone(),
        }
    }
}

/// Shared state that the renderer and backend both consume
pub(crate) struct DisplayState {
    /// The presentable images and one view per image
    pub d_images: Vec<vk::Image>,
    pub d_views: Vec<vk::ImageView>,
    pub d_resolution: vk::Extent2D,
    pub d_surface_format: vk::SurfaceFormatKHR,
    /// index into swapchain images that we are currently using
    pub d_current_image: u32,
}

pub(crate) trait SwapchainBackend {
    /// Tear down and rebuild the swapchain after an out-of-date
    fn recreate_swapchain(&mut self, dstate: &mut DisplayState) -> Result<()>;

    /// Pick the next image, signaling `signal` when it is ready
    fn acquire_next_image(&mut self, dstate: &mut DisplayState, signal: vk::Semaphore)
        -> Result<()>;

    fn present(&mut self, dstate: &DisplayState, queue: vk::Queue, wait: vk::Semaphore)
        -> Result<()>;

    /// Whether acquire/present actually signal and consume the
    /// per-frame semaphores
    fn uses_present_semaphores(&self) -> bool {
        true
    }

    fn destroy(&mut self, dstate: &mut DisplayState);
}

pub struct Display {
    d_dev: Arc<Device>,
    pub(crate) d_state: DisplayState,
    d_back: Box<dyn SwapchainBackend>,
}

impl Display {
    pub(crate) fn new(
        dev: &Arc<Device>,
        surface: SurfaceType,
        settings: &RenderSettings,
    ) -> Result<Display> {
        let mut dstate = DisplayState {
            d_images: Vec::new(),
            d_views: Vec::new(),
            d_resolution: vk::Extent2D {
                width: 0,
                height: 0,
            },
            d_surface_format: vk::SurfaceFormatKHR::builder()
                .format(vk::Format::B8G8R8A8_UNORM)
                .color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
                .build(),
            d_current_image: 0,
        };

        let mut back: Box<dyn SwapchainBackend> = match surface {
            SurfaceType::Headless => Box::new(HeadlessSwapchain::new(dev)),
            SurfaceType::Window { create_surface, .. } => {
                Box::new(VkSwapchain::new(dev, create_surface, settings)?)
            }
        };
        back.recreate_swapchain(&mut dstate)?;

        Ok(Display {
            d_dev: dev.clone(),
            d_state: dstate,
            d_back: back,
        })
    }

    pub fn resolution(&self) -> vk::Extent2D {
        self.d_state.d_resolution
    }

    pub fn surface_format(&self) -> vk::Format {
        self.d_state.d_surface_format.format
    }

    pub(crate) fn current_image(&self) -> vk::Image {
        self.d_state.d_images[self.d_state.d_current_image as usize]
    }

    pub(crate) fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<()> {
        self.d_back.acquire_next_image(&mut self.d_state, signal)
    }

    pub(crate) fn present(&mut self, queue: vk::Queue, wait: vk::Semaphore) -> Result<()> {
        self.d_back.present(&self.d_state, queue, wait)
    }

    pub(crate) fn uses_present_semaphores(&self) -> bool {
        self.d_back.uses_present_semaphores()
    }

    /// Recreate the swapchain. The device must be idle.
    pub(crate) fn recreate(&mut self) -> Result<()> {
        self.d_back.recreate_swapchain(&mut self.d_state)
    }

    pub(crate) fn destroy(&mut self) {
        self.d_back.destroy(&mut self.d_state);
    }
}

// ---------------- Real vulkan swapchain ----------------

struct VkSwapchain {
    s_dev: Arc<Device>,
    s_surface_loader: khr::Surface,
    s_surface: vk::SurfaceKHR,
    s_swapchain_loader: khr::Swapchain,
    s_swapchain: vk::SwapchainKHR,
    s_vsync: bool,
    s_triple_buffering: bool,
}

impl VkSwapchain {
    fn new(
        dev: &Arc<Device>,
        create_surface: SurfaceCreateFn,
        settings: &RenderSettings,
    ) -> Result<Self> {
        let entry = &dev.inst.loader;
        let inst = &dev.inst.inst;
        let surface_loader = khr::Surface::new(entry, inst);
        let surface = create_surface(entry, inst).map_err(|e| {
            log::error!("Cannot create window surface: {:?}", e);
            SquallError::VK_SURF_NOT_SUPPORTED
        })?;

        // The graphics queue must be able to present this surface
        let supported = unsafe {
            surface_loader
                .get_physical_device_surface_support(dev.pdev, dev.graphics_family, surface)
                .unwrap_or(false)
        };
        if !supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(SquallError::VK_SURF_NOT_SUPPORTED);
        }

        Ok(Self {
            s_dev: dev.clone(),
            s_surface_loader: surface_loader,
            s_surface: surface,
            s_swapchain_loader: khr::Swapchain::new(inst, &dev.dev),
            s_swapchain: vk::SwapchainKHR::null(),
            s_vsync: settings.enable_vsync,
            s_triple_buffering: settings.use_triple_buffering,
        })
    }

    fn select_surface_format(&self) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            self.s_surface_loader
                .get_physical_device_surface_formats(self.s_dev.pdev, self.s_surface)
                .or(Err(SquallError::VK_SURF_NOT_SUPPORTED))?
        };
        formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM || f.format == vk::Format::B8G8R8A8_SRGB
            })
            .or(formats.first())
            .copied()
            .ok_or(SquallError::VK_SURF_NOT_SUPPORTED)
    }

    fn select_present_mode(&self) -> vk::PresentModeKHR {
        if self.s_vsync {
            // FIFO is always available and rate-limited
            return vk::PresentModeKHR::FIFO;
        }
        let modes = unsafe {
            self.s_surface_loader
                .get_physical_device_surface_present_modes(self.s_dev.pdev, self.s_surface)
                .unwrap_or_default()
        };
        for preferred in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE].iter() {
            if modes.contains(preferred) {
                return *preferred;
            }
        }
        return vk::PresentModeKHR::FIFO;
    }

    fn destroy_image_views(&mut self, dstate: &mut DisplayState) {
        unsafe {
            for view in dstate.d_views.drain(..) {
                self.s_dev.dev.destroy_image_view(view, None);
            }
        }
        // swapchain images belong to the swapchain
        dstate.d_images.clear();
    }
}

impl SwapchainBackend for VkSwapchain {
    fn recreate_swapchain(&mut self, dstate: &mut DisplayState) -> Result<()> {
        let caps = unsafe {
            self.s_surface_loader
                .get_physical_device_surface_capabilities(self.s_dev.pdev, self.s_surface)
                .or(Err(SquallError::VK_SURF_NOT_SUPPORTED))?
        };
        let format = self.select_surface_format()?;
        let present_mode = self.select_present_mode();

        // how many images we want the swapchain to contain
        let mut desired_image_count = match self.s_triple_buffering {
            true => std::cmp::max(3, caps.min_image_count),
            false => caps.min_image_count + 1,
        };
        if caps.max_image_count > 0 && desired_image_count > caps.max_image_count {
            desired_image_count = caps.max_image_count;
        }

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.s_surface)
            .min_image_count(desired_image_count)
            .image_color_space(format.color_space)
            .image_format(format.format)
            .image_extent(caps.current_extent)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.s_swapchain);

        let new_swapchain = unsafe {
            self.s_swapchain_loader
                .create_swapchain(&info, None)
                .or(Err(SquallError::CREATION_FAILED))?
        };

        self.destroy_image_views(dstate);
        if self.s_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.s_swapchain_loader
                    .destroy_swapchain(self.s_swapchain, None)
            };
        }
        self.s_swapchain = new_swapchain;
        dstate.d_surface_format = format;
        dstate.d_resolution = caps.current_extent;
        dstate.d_current_image = 0;

        let images = unsafe {
            self.s_swapchain_loader
                .get_swapchain_images(self.s_swapchain)
                .or(Err(SquallError::CREATION_FAILED))?
        };
        for image in images.iter() {
            let view = self.s_dev.create_image_view_internal(
                *image,
                format.format,
                0,
                1,
                vk::ImageViewType::TYPE_2D,
                vk::ImageAspectFlags::COLOR,
            )?;
            dstate.d_views.push(view);
        }
        dstate.d_images = images;

        Ok(())
    }

    /// If the next image is not ready (NOT_READY or TIMEOUT), loop
    /// on vkAcquireNextImageKHR until we get a valid image
    fn acquire_next_image(
        &mut self,
        dstate: &mut DisplayState,
        signal: vk::Semaphore,
    ) -> Result<()> {
        loop {
            match unsafe {
                self.s_swapchain_loader.acquire_next_image(
                    self.s_swapchain,
                    0,
                    signal,
                    vk::Fence::null(),
                )
            } {
                Ok((index, _suboptimal)) => {
                    dstate.d_current_image = index;
                    return Ok(());
                }
                Err(vk::Result::NOT_READY) => continue,
                Err(vk::Result::TIMEOUT) => continue,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(SquallError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => return Err(SquallError::OUT_OF_DATE),
                Err(_) => return Err(SquallError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
            }
        }
    }

    fn present(
        &mut self,
        dstate: &DisplayState,
        queue: vk::Queue,
        wait: vk::Semaphore,
    ) -> Result<()> {
        let wait_semas = [wait];
        let swapchains = [self.s_swapchain];
        let indices = [dstate.d_current_image];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        unsafe {
            match self.s_swapchain_loader.queue_present(queue, &info) {
                Ok(_) => Ok(()),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SquallError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(SquallError::OUT_OF_DATE),
                Err(_) => Err(SquallError::PRESENT_FAILED),
            }
        }
    }

    fn destroy(&mut self, dstate: &mut DisplayState) {
        self.destroy_image_views(dstate);
        unsafe {
            if self.s_swapchain != vk::SwapchainKHR::null() {
                self.s_swapchain_loader
                    .destroy_swapchain(self.s_swapchain, None);
                self.s_swapchain = vk::SwapchainKHR::null();
            }
            self.s_surface_loader.destroy_surface(self.s_surface, None);
        }
    }
}

// ---------------- Headless backend ----------------

const HEADLESS_WIDTH: u32 = 640;
const HEADLESS_HEIGHT: u32 = 480;

/// Two offscreen images standing in for a swapchain. Defaults to
/// a 640x480 surface, used for tests.
struct HeadlessSwapchain {
    h_dev: Arc<Device>,
    h_image_mems: Vec<vk::DeviceMemory>,
}

impl HeadlessSwapchain {
    fn new(dev: &Arc<Device>) -> Self {
        Self {
            h_dev: dev.clone(),
            h_image_mems: Vec::new(),
        }
    }

    fn destroy_images(&mut self, dstate: &mut DisplayState) {
        unsafe {
            for view in dstate.d_views.drain(..) {
                self.h_dev.dev.destroy_image_view(view, None);
            }
            for image in dstate.d_images.drain(..) {
                self.h_dev.dev.destroy_image(image, None);
            }
            for mem in self.h_image_mems.drain(..) {
                self.h_dev.dev.free_memory(mem, None);
            }
        }
    }
}

impl SwapchainBackend for HeadlessSwapchain {
    fn recreate_swapchain(&mut self, dstate: &mut DisplayState) -> Result<()> {
        self.destroy_images(dstate);

        let extent = vk::Extent2D {
            width: HEADLESS_WIDTH,
            height: HEADLESS_HEIGHT,
        };
        let format = vk::Format::B8G8R8A8_UNORM;
        for _ in 0..2 {
            let (image, mem) = self.h_dev.create_image_internal(
                format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
                extent,
                1,
                1,
                false,
            )?;
            let view = self.h_dev.create_image_view_internal(
                image,
                format,
                0,
                1,
                vk::ImageViewType::TYPE_2D,
                vk::ImageAspectFlags::COLOR,
            )?;
            dstate.d_images.push(image);
            dstate.d_views.push(view);
            self.h_image_mems.push(mem);
        }
        dstate.d_resolution = extent;
        dstate.d_surface_format = vk::SurfaceFormatKHR::builder()
            .format(format)
            .color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .build();
        dstate.d_current_image = 0;
        Ok(())
    }

    fn acquire_next_image(
        &mut self,
        dstate: &mut DisplayState,
        _signal: vk::Semaphore,
    ) -> Result<()> {
        // simply bump the image number
        dstate.d_current_image = (dstate.d_current_image + 1) % dstate.d_images.len() as u32;
        Ok(())
    }

    fn present(
        &mut self,
        _dstate: &DisplayState,
        _queue: vk::Queue,
        _wait: vk::Semaphore,
    ) -> Result<()> {
        // no-op here, nothing to present
        Ok(())
    }

    fn uses_present_semaphores(&self) -> bool {
        false
    }

    fn destroy(&mut self, dstate: &mut DisplayState) {
        self.destroy_images(dstate);
    }
}
