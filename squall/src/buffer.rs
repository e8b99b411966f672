// A GPU buffer and its backing allocation
//
// Ownership at this level is unique. The underlying vulkan objects
// are destroyed through the deletion queue so in-flight frames can
// keep reading the old backing after a release or a resize.
use ash::vk;
use std::sync::Arc;

use crate::device::Device;
use crate::{Result, SquallError};
use utils::log;

pub struct Buffer {
    b_dev: Arc<Device>,
    pub(crate) b_buffer: vk::Buffer,
    pub(crate) b_memory: vk::DeviceMemory,
    b_usage: vk::BufferUsageFlags,
    b_size: u64,
    b_host_visible: bool,
    /// Persistent mapping, host visible buffers only
    b_map: *mut u8,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub fn new(
        dev: &Arc<Device>,
        usage: vk::BufferUsageFlags,
        size: u64,
        host_visible: bool,
    ) -> Result<Buffer> {
        let flags = match host_visible {
            true => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            false => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        let (buffer, memory) = dev.create_buffer_with_size(usage, flags, size)?;
        let map = match host_visible {
            true => dev.map_memory_ptr(memory, size)?,
            false => std::ptr::null_mut(),
        };

        Ok(Buffer {
            b_dev: dev.clone(),
            b_buffer: buffer,
            b_memory: memory,
            b_usage: usage,
            b_size: size,
            b_host_visible: host_visible,
            b_map: map,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.b_buffer != vk::Buffer::null()
    }

    pub fn size(&self) -> u64 {
        self.b_size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.b_usage
    }

    pub fn host_visible(&self) -> bool {
        self.b_host_visible
    }

    pub(crate) fn vk_buffer(&self) -> vk::Buffer {
        self.b_buffer
    }

    /// The persistent CPU mapping of a host visible buffer
    pub fn map(&self) -> *mut u8 {
        assert!(self.b_host_visible);
        self.b_map
    }

    /// Replace the backing store with a larger one.
    ///
    /// The previous buffer stays alive on the deletion queue until
    /// every frame that may reference it has retired. On failure the
    /// old backing is untouched and still usable.
    pub fn resize(&mut self, size: u64) -> Result<()> {
        debug_assert!(self.is_valid());
        let flags = match self.b_host_visible {
            true => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            false => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        let (buffer, memory) = match self.b_dev.create_buffer_with_size(self.b_usage, flags, size)
        {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Buffer resize failed but you can still use the old one.");
                return Err(e);
            }
        };
        let map = match self.b_host_visible {
            true => self.b_dev.map_memory_ptr(memory, size)?,
            false => std::ptr::null_mut(),
        };

        self.schedule_release();
        self.b_buffer = buffer;
        self.b_memory = memory;
        self.b_size = size;
        self.b_map = map;
        Ok(())
    }

    fn schedule_release(&self) {
        let raw_dev = self.b_dev.vk_device().clone();
        let buffer = self.b_buffer;
        let memory = self.b_memory;
        self.b_dev.pending_delete(Box::new(move || unsafe {
            raw_dev.destroy_buffer(buffer, None);
            raw_dev.free_memory(memory, None);
        }));
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.is_valid() {
            self.schedule_release();
        }
    }
}
