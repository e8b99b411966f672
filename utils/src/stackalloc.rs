// A committed-on-demand stack allocator
//
// One-ended variant of the frame allocator. Allocation returns a
// bookmark that rewinds the stack pointer when dropped, so scoped
// scratch memory unwinds in LIFO order.
use crate::fatal;
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use std::cell::Cell;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use crate::framealloc::PAGE_SIZE;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub struct StackAllocator {
    start: *mut u8,
    end: *mut u8,
    end_committed: Cell<*mut u8>,
    stack_ptr: Cell<*mut u8>,
}

/// Rewinds the owning allocator to the pre-allocation mark on drop
pub struct Bookmark<'a> {
    owner: &'a StackAllocator,
    previous: *mut u8,
}

impl<'a> Drop for Bookmark<'a> {
    fn drop(&mut self) {
        self.owner.stack_ptr.set(self.previous);
    }
}

impl StackAllocator {
    pub fn new(size: usize) -> Self {
        let size = align_up(size, PAGE_SIZE);
        let start = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(size).unwrap(),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .expect("Cannot reserve address space")
        .as_ptr() as *mut u8;

        Self {
            start: start,
            end: unsafe { start.add(size) },
            end_committed: Cell::new(start),
            stack_ptr: Cell::new(start),
        }
    }

    pub fn allocate(&self, size: usize, alignment: usize) -> (*mut u8, Bookmark) {
        let previous = self.stack_ptr.get();
        let start = align_up(previous as usize, alignment) as *mut u8;
        let end = unsafe { start.add(size) };
        if end > self.end {
            fatal!(
                "Stack allocator is too small. Current size: {}. Allocating: {}.",
                self.end as usize - self.start as usize,
                size
            );
        }
        if self.end_committed.get() < end {
            let commit_size = align_up(
                end as usize - self.end_committed.get() as usize,
                PAGE_SIZE,
            );
            unsafe {
                mprotect(
                    NonNull::new(self.end_committed.get() as *mut c_void).unwrap(),
                    commit_size,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                )
            }
            .expect("Cannot commit pages");
            self.end_committed
                .set(unsafe { self.end_committed.get().add(commit_size) });
        }
        self.stack_ptr.set(end);
        (
            start,
            Bookmark {
                owner: self,
                previous: previous,
            },
        )
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        unsafe {
            munmap(
                NonNull::new(self.start as *mut c_void).unwrap(),
                self.end as usize - self.start as usize,
            )
            .expect("Cannot unmap stack allocator pages");
        }
    }
}

unsafe impl Send for StackAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bookmark_rewinds() {
        let alloc = StackAllocator::new(8 * PAGE_SIZE);
        let first = {
            let (ptr, _mark) = alloc.allocate(128, 16);
            unsafe { std::ptr::write_bytes(ptr, 7, 128) };
            ptr as usize
        };
        // The bookmark dropped, so the next allocation reuses the space
        let (ptr, _mark) = alloc.allocate(128, 16);
        assert_eq!(ptr as usize, first);
    }

    #[test]
    fn nested_allocations_stack() {
        let alloc = StackAllocator::new(8 * PAGE_SIZE);
        let (a, _mark_a) = alloc.allocate(64, 16);
        let (b, _mark_b) = alloc.allocate(64, 16);
        assert!(b > a);
        unsafe {
            std::ptr::write_bytes(a, 1, 64);
            std::ptr::write_bytes(b, 2, 64);
            assert_eq!(*a, 1);
            assert_eq!(*b, 2);
        }
    }

    #[test]
    fn commits_across_pages() {
        let alloc = StackAllocator::new(32 * PAGE_SIZE);
        let (ptr, _mark) = alloc.allocate(5 * PAGE_SIZE, 16);
        unsafe {
            std::ptr::write_bytes(ptr, 0xcd, 5 * PAGE_SIZE);
            assert_eq!(*ptr.add(5 * PAGE_SIZE - 1), 0xcd);
        }
    }
}
