//! Stackful fiber stack allocator.
//!
//! A slab of fixed-size stacks grown geometrically (×1.5) on exhaustion,
//! with reused slots tracked by an in-use flag rather than returned to the
//! system allocator. Each slab is a single `mmap` region sliced into
//! `stack_size`-sized stacks; the first page of each stack is a guard page
//! (`PROT_NONE`) below the usable stack, so a stack overflow faults instead
//! of silently corrupting an adjacent stack.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::sync::RwLock;

const GROWTH_FACTOR: f64 = 1.5;
const RESIZE_AFTER_FAILED_SCANS: usize = 3;

struct Slot {
    base: NonNull<u8>,
    in_use: AtomicBool,
}

unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

struct Slab {
    /// Base of the single mmap'd region backing every slot in this slab.
    mapping: NonNull<u8>,
    mapping_len: usize,
    slots: Vec<Slot>,
}

unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Drop for Slab {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mapping.as_ptr() as *mut libc::c_void, self.mapping_len);
        }
    }
}

/// A handle to one allocated stack. Dropping it returns the slot to the
/// allocator's free list; it does not unmap memory.
pub struct Stack {
    top: NonNull<u8>,
    size: usize,
    slab_index: usize,
    slot_index: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Pointer to the lowest address of the allocated stack region — what
    /// `ucontext_t.uc_stack.ss_sp` expects (glibc computes the actual
    /// initial stack pointer as `ss_sp + ss_size` itself).
    pub fn base(&self) -> *mut libc::c_void {
        self.top.as_ptr() as *mut libc::c_void
    }

    /// Pointer to the highest address of the stack (stacks grow down on
    /// the architectures this crate targets).
    pub fn top(&self) -> *mut libc::c_void {
        unsafe { self.top.as_ptr().add(self.size) as *mut libc::c_void }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

struct Inner {
    stack_size: usize,
    slabs: Vec<Slab>,
    /// Hint cursor: the next index `try_claim` starts scanning from, so
    /// repeated allocation doesn't always re-scan slots already handed out.
    now_pos: AtomicUsize,
}

/// Thread-safe slab allocator for fiber stacks.
pub struct StackAllocator {
    inner: RwLock<Inner>,
}

impl StackAllocator {
    pub fn new(stack_size: usize, initial_slabs_capacity: usize) -> Result<Self> {
        let mut inner = Inner {
            stack_size,
            slabs: Vec::new(),
            now_pos: AtomicUsize::new(0),
        };
        inner.resize(initial_slabs_capacity)?;
        Ok(StackAllocator {
            inner: RwLock::new(inner),
        })
    }

    /// Acquire a stack, growing the slab pool ×1.5 if three full scans find
    /// nothing free.
    pub fn alloc(&self) -> Result<Stack> {
        {
            let guard = self.inner.read();
            if let Some(stack) = guard.try_claim() {
                return Ok(stack);
            }
        }
        let mut guard = self.inner.write();
        let mut scans = 0;
        loop {
            if let Some(stack) = guard.try_claim() {
                return Ok(stack);
            }
            scans += 1;
            if scans >= RESIZE_AFTER_FAILED_SCANS || guard.slabs.is_empty() {
                let grow_by = ((guard.total_slots() as f64 * GROWTH_FACTOR) as usize)
                    .max(guard.total_slots() + 1);
                guard.resize(grow_by - guard.total_slots())?;
                scans = 0;
            }
        }
    }

    pub fn free(&self, stack: Stack) {
        let guard = self.inner.read();
        guard.slabs[stack.slab_index].slots[stack.slot_index]
            .in_use
            .store(false, Ordering::Release);
    }
}

impl Inner {
    fn total_slots(&self) -> usize {
        self.slabs.iter().map(|s| s.slots.len()).sum()
    }

    fn try_claim(&self) -> Option<Stack> {
        let total = self.total_slots();
        if total == 0 {
            return None;
        }
        let start = self.now_pos.load(Ordering::Relaxed) % total;
        for offset in 0..total {
            let idx = (start + offset) % total;
            let (slab_index, slot_index) = self.locate(idx);
            let slot = &self.slabs[slab_index].slots[slot_index];
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Next scan picks up right after the slot we just claimed.
                self.now_pos.store((idx + 1) % total, Ordering::Relaxed);
                return Some(Stack {
                    top: slot.base,
                    size: self.stack_size,
                    slab_index,
                    slot_index,
                });
            }
        }
        None
    }

    fn locate(&self, mut idx: usize) -> (usize, usize) {
        for (slab_index, slab) in self.slabs.iter().enumerate() {
            if idx < slab.slots.len() {
                return (slab_index, idx);
            }
            idx -= slab.slots.len();
        }
        unreachable!("index out of range of allocated slabs");
    }

    fn resize(&mut self, additional_stacks: usize) -> Result<()> {
        if additional_stacks == 0 {
            return Ok(());
        }
        // The new slabs start right after every existing slot; point the
        // hint cursor there so the next scan finds fresh slots immediately
        // instead of re-scanning the exhausted ones first.
        let first_new_slot = self.total_slots();
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let stride = self.stack_size + page_size;
        let mapping_len = stride * additional_stacks;

        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(Error::StackAllocation(format!(
                "mmap({mapping_len} bytes) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let mapping = NonNull::new(mapping as *mut u8).expect("mmap returned non-null on success");

        let mut slots = Vec::with_capacity(additional_stacks);
        for i in 0..additional_stacks {
            let guard_page = unsafe { mapping.as_ptr().add(i * stride) };
            let rc = unsafe { libc::mprotect(guard_page as *mut libc::c_void, page_size, libc::PROT_NONE) };
            if rc != 0 {
                log::warn!(
                    "failed to protect fiber stack guard page: {}",
                    std::io::Error::last_os_error()
                );
            }
            let base = unsafe { guard_page.add(page_size) };
            slots.push(Slot {
                base: NonNull::new(base).expect("stack base is non-null"),
                in_use: AtomicBool::new(false),
            });
        }

        self.slabs.push(Slab {
            mapping,
            mapping_len,
            slots,
        });
        self.now_pos.store(first_new_slot, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_reuses_stacks() {
        let alloc = StackAllocator::new(64 * 1024, 2).unwrap();
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert_ne!(a.top() as usize, b.top() as usize);
        alloc.free(a);
        let c = alloc.alloc().unwrap();
        assert_eq!(c.size(), 64 * 1024);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let alloc = StackAllocator::new(16 * 1024, 1).unwrap();
        let mut stacks = Vec::new();
        for _ in 0..5 {
            stacks.push(alloc.alloc().unwrap());
        }
        assert_eq!(stacks.len(), 5);
    }
}
