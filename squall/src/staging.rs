// Per-frame dynamic staging
//
// Each frame resource owns one of these. Uploads append into a
// list of fixed-size host visible buffers and record a copy on the
// frame's command buffer; the frame reset rewinds every fill
// pointer. The raw vulkan objects are destroyed directly at
// shutdown since the frame resources outlive the deletion queue.
use ash::vk;

use crate::buffer::Buffer;
use crate::device::Device;
use crate::{Result, SquallError};
use utils::log;

/// Fixed size of one staging block. Payloads have to fit in here,
/// larger uploads must take the blocking path.
pub(crate) const STAGING_BLOCK_SIZE: u64 = 1 << 20;

struct StagingBlock {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    address: *mut u8,
    filled: u64,
}

pub struct DynamicStagingBuffer {
    s_blocks: Vec<StagingBlock>,
    s_block_size: u64,
    /// Blocks before this index are known full enough to skip
    s_first_free: usize,
}

unsafe impl Send for DynamicStagingBuffer {}

impl DynamicStagingBuffer {
    pub(crate) fn new(dev: &Device) -> Result<Self> {
        let mut ret = Self {
            s_blocks: Vec::new(),
            s_block_size: STAGING_BLOCK_SIZE,
            s_first_free: 0,
        };
        // Try again at the first upload if this fails
        if let Err(e) = ret.add_block(dev) {
            log::warning!("Could not preallocate a staging block: {:?}", e);
        }
        Ok(ret)
    }

    fn add_block(&mut self, dev: &Device) -> Result<&mut StagingBlock> {
        let (buffer, memory) = dev.create_buffer_with_size(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            self.s_block_size,
        )?;
        let address = dev.map_memory_ptr(memory, self.s_block_size)?;
        self.s_blocks.push(StagingBlock {
            buffer: buffer,
            memory: memory,
            address: address,
            filled: 0,
        });
        Ok(self.s_blocks.last_mut().unwrap())
    }

    /// Copy `data` into staging memory and record a transfer into
    /// `dest` at `offset` on the frame's command buffer.
    ///
    /// The destination sees the bytes once the recorded copy
    /// executes; insert a buffer memory barrier before dependent
    /// reads in the same frame.
    pub(crate) fn upload_buffer(
        &mut self,
        dev: &Device,
        cbuf: vk::CommandBuffer,
        dest: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let size = data.len() as u64;
        if size > self.s_block_size {
            return Err(SquallError::UPLOAD_TOO_LARGE);
        }

        let mut found = None;
        while self.s_first_free < self.s_blocks.len() {
            let block = &self.s_blocks[self.s_first_free];
            if self.s_block_size - block.filled >= size {
                found = Some(self.s_first_free);
                break;
            }
            self.s_first_free += 1;
        }
        let index = match found {
            Some(i) => i,
            None => {
                if self.add_block(dev).is_err() {
                    log::error!("Cannot upload buffer. Shared VRAM ran out?");
                    return Err(SquallError::OUT_OF_VRAM);
                }
                self.s_blocks.len() - 1
            }
        };

        let block = &mut self.s_blocks[index];
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                block.address.add(block.filled as usize),
                data.len(),
            );
            dev.vk_device().cmd_copy_buffer(
                cbuf,
                block.buffer,
                dest.vk_buffer(),
                &[vk::BufferCopy::builder()
                    .src_offset(block.filled)
                    .dst_offset(offset)
                    .size(size)
                    .build()],
            );
        }
        block.filled += size;
        Ok(())
    }

    /// Rewind all fill pointers. Only valid once the frame's fence
    /// has been observed signaled.
    pub(crate) fn reset(&mut self) {
        for block in self.s_blocks.iter_mut() {
            block.filled = 0;
        }
        self.s_first_free = 0;
    }

    /// Destroy the backing blocks. Requires an idle device.
    pub(crate) fn destroy(&mut self, dev: &Device) {
        unsafe {
            for block in self.s_blocks.drain(..) {
                dev.vk_device().destroy_buffer(block.buffer, None);
                dev.vk_device().free_memory(block.memory, None);
            }
        }
    }
}
