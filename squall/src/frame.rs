// Per-frame-in-flight resources
//
// Each of the renderAhead slots owns a command buffer, the
// semaphores and fence that sequence its submission, and a dynamic
// staging buffer. The matching deletion queue slot lives in the
// device so resource drops can reach it without the renderer.
use ash::vk;

use crate::device::Device;
use crate::staging::DynamicStagingBuffer;
use crate::{Result, SquallError};

pub struct FrameResource {
    pub(crate) f_cbuf: vk::CommandBuffer,
    /// Signaled by the swapchain acquire, waited by the submit
    pub(crate) f_image_available: vk::Semaphore,
    /// Signaled by the submit, waited by present
    pub(crate) f_render_finished: vk::Semaphore,
    /// Signaled when this slot's submission retires. Created
    /// signaled so the first wait passes.
    pub(crate) f_in_flight: vk::Fence,
    pub(crate) f_staging: DynamicStagingBuffer,
}

impl FrameResource {
    pub(crate) fn new(dev: &Device, pool: vk::CommandPool) -> Result<Self> {
        let cbuf = dev.create_command_buffers(pool, 1)?[0];
        unsafe {
            let sema_info = vk::SemaphoreCreateInfo::default();
            let image_available = dev
                .vk_device()
                .create_semaphore(&sema_info, None)
                .or(Err(SquallError::CREATION_FAILED))?;
            let render_finished = dev
                .vk_device()
                .create_semaphore(&sema_info, None)
                .or(Err(SquallError::CREATION_FAILED))?;
            let fence = dev
                .vk_device()
                .create_fence(
                    &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
                    None,
                )
                .or(Err(SquallError::CREATION_FAILED))?;

            Ok(Self {
                f_cbuf: cbuf,
                f_image_available: image_available,
                f_render_finished: render_finished,
                f_in_flight: fence,
                f_staging: DynamicStagingBuffer::new(dev)?,
            })
        }
    }

    /// Direct destruction at shutdown, once the device is idle
    pub(crate) fn destroy(&mut self, dev: &Device) {
        unsafe {
            dev.vk_device().destroy_semaphore(self.f_image_available, None);
            dev.vk_device().destroy_semaphore(self.f_render_finished, None);
            dev.vk_device().destroy_fence(self.f_in_flight, None);
        }
        self.f_staging.destroy(dev);
    }
}
