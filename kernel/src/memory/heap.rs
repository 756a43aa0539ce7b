// =============================================================================
// MinimalOS NextGen — Kernel Heap Allocator
// =============================================================================
//
// Backs Rust's `alloc` crate (Box, Vec, String, Arc, ...) so the rest of
// the kernel — the scheduler's thread table, the block cache, driver
// state — can use ordinary collection types instead of hand-rolled fixed
// arrays everywhere.
//
// A first-fit free-list allocator over one PMM-backed region:
//
//   ┌──────────┐     ┌──────────────┐     ┌───────────┐
//   │ FreeBlock│ ──→ │  FreeBlock   │ ──→ │ FreeBlock  │ ──→ null
//   │ size: 64 │     │ size: 4096   │     │ size: 128  │
//   └──────────┘     └──────────────┘     └───────────┘
//
// The list stays sorted by address purely so adjacent free blocks can be
// detected and coalesced in O(1) once a walk reaches them — without that,
// enough alloc/free churn fragments the heap into blocks too small to
// satisfy anything.
//
// alloc():   walk the list for the first block the request fits in
//            (accounting for alignment padding), split off whatever's
//            left over on each side back into the list.
// dealloc(): insert the freed region back in address order, merge with
//            whichever neighbor(s) it now sits flush against.
//
// The heap doesn't grow after `init()` — 256 KiB (64 pages) is sized for
// what this kernel's own data structures need, not for hosting arbitrary
// user workloads. A slab or buddy allocator would pay for itself at much
// higher allocation volume than a single-core boot-to-shell kernel sees;
// first-fit keeps this file auditable instead.
//
// =============================================================================

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use log::info;
use crate::memory::address::PAGE_SIZE;
use crate::memory::pmm;
use crate::sync::spinlock::SpinLock;

const INITIAL_HEAP_PAGES: usize = 64;

/// A free block must fit a `FreeBlock` header, or there's nowhere to
/// record its size and successor once it's handed back.
const MIN_BLOCK_SIZE: usize = core::mem::size_of::<FreeBlock>();

/// Header written in-place at the start of every free block — there's no
/// side table, the free list lives inside the freed memory itself.
#[repr(C)]
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

struct Heap {
    free_list: *mut FreeBlock,
    heap_start: usize,
    heap_end: usize,
    allocated_bytes: usize,
    total_bytes: usize,
}

// SAFETY: all access to the raw pointers inside `Heap` goes through
// `KernelAllocator`'s SpinLock, so there's never more than one live
// reference into the free list at a time.
unsafe impl Send for Heap {}

impl Heap {
    const fn new() -> Self {
        Self {
            free_list: ptr::null_mut(),
            heap_start: 0,
            heap_end: 0,
            allocated_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Seeds the free list with one block spanning `[start, start+size)`.
    fn init(&mut self, start: usize, size: usize) {
        assert!(size >= MIN_BLOCK_SIZE, "Heap region too small");
        assert!(
            start % core::mem::align_of::<FreeBlock>() == 0,
            "Heap start must be aligned to FreeBlock alignment"
        );

        self.heap_start = start;
        self.heap_end = start + size;
        self.total_bytes = size;
        self.allocated_bytes = 0;

        let block = start as *mut FreeBlock;
        unsafe {
            (*block).size = size;
            (*block).next = ptr::null_mut();
        }
        self.free_list = block;
    }

    /// First-fit search: the first block the aligned request fits inside
    /// wins, regardless of how much of it goes unused. Whatever's left
    /// over on either side of the carved-out region goes back on the list
    /// if it's big enough to hold a header of its own.
    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(MIN_BLOCK_SIZE);
        let align = layout.align().max(core::mem::align_of::<FreeBlock>());

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut current = self.free_list;

        while !current.is_null() {
            let block_start = current as usize;
            let block_size = unsafe { (*current).size };
            let block_end = block_start + block_size;

            let alloc_start = align_up(block_start, align);
            let alloc_end = alloc_start + size;

            if alloc_end <= block_end {
                let next = unsafe { (*current).next };
                if prev.is_null() {
                    self.free_list = next;
                } else {
                    unsafe {
                        (*prev).next = next;
                    }
                }

                let front_gap = alloc_start - block_start;
                if front_gap >= MIN_BLOCK_SIZE {
                    self.insert_free_block(block_start, front_gap);
                }

                let back_gap = block_end - alloc_end;
                if back_gap >= MIN_BLOCK_SIZE {
                    self.insert_free_block(alloc_end, back_gap);
                }

                self.allocated_bytes += size;
                return alloc_start as *mut u8;
            }

            prev = current;
            current = unsafe { (*current).next };
        }

        ptr::null_mut()
    }

    fn dealloc(&mut self, ptr: *mut u8, layout: Layout) {
        let addr = ptr as usize;
        let size = layout.size().max(MIN_BLOCK_SIZE);

        debug_assert!(
            addr >= self.heap_start && addr + size <= self.heap_end,
            "Heap: dealloc address outside heap bounds"
        );

        self.allocated_bytes -= size;
        self.insert_free_block(addr, size);
    }

    /// Splices `[addr, addr+size)` into the free list at its address-sorted
    /// position, then merges it into whichever neighbor(s) it now
    /// borders — a block freed between two others can coalesce with both
    /// in the same call.
    fn insert_free_block(&mut self, addr: usize, size: usize) {
        debug_assert!(size >= MIN_BLOCK_SIZE);

        let new_block = addr as *mut FreeBlock;

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut current = self.free_list;

        while !current.is_null() && (current as usize) < addr {
            prev = current;
            current = unsafe { (*current).next };
        }

        unsafe {
            (*new_block).size = size;
            (*new_block).next = current;
        }

        if prev.is_null() {
            self.free_list = new_block;
        } else {
            unsafe {
                (*prev).next = new_block;
            }
        }

        // Merge forward: the new block's tail touches the next block's head.
        if !current.is_null() {
            let new_end = addr + unsafe { (*new_block).size };
            if new_end == current as usize {
                unsafe {
                    (*new_block).size += (*current).size;
                    (*new_block).next = (*current).next;
                }
            }
        }

        // Merge backward: the predecessor's tail touches the new block's head.
        if !prev.is_null() {
            let prev_end = prev as usize + unsafe { (*prev).size };
            if prev_end == addr {
                unsafe {
                    (*prev).size += (*new_block).size;
                    (*prev).next = (*new_block).next;
                }
            }
        }
    }
}

/// `GlobalAlloc` requires `Sync`; wrapping the free list in a `SpinLock`
/// is what lets a single static own it.
pub struct KernelAllocator {
    inner: SpinLock<Heap>,
}

impl KernelAllocator {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(Heap::new()),
        }
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.lock().dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator::new();

/// Claims `INITIAL_HEAP_PAGES` contiguous physical pages from the PMM and
/// hands them to the free-list allocator as the kernel heap.
///
/// # Panics
/// If the PMM can't satisfy the contiguous allocation.
///
/// # Prerequisites
/// `pmm::init()` and `address::init_hhdm()` must already have run.
pub fn init() {
    let heap_size = INITIAL_HEAP_PAGES * PAGE_SIZE as usize;

    let heap_phys = pmm::alloc_contiguous(INITIAL_HEAP_PAGES)
        .expect("Heap: failed to allocate contiguous physical pages for kernel heap");

    let heap_virt = heap_phys.to_virt().as_u64() as usize;

    info!(
        "[heap] Allocated {} KiB at phys {} / virt {:#018X}",
        heap_size / 1024,
        heap_phys,
        heap_virt,
    );

    ALLOCATOR.inner.lock().init(heap_virt, heap_size);

    info!("[heap] Kernel heap initialized ({} KiB)", heap_size / 1024);
}

pub fn allocated_bytes() -> usize {
    ALLOCATOR.inner.lock().allocated_bytes
}

pub fn total_bytes() -> usize {
    ALLOCATOR.inner.lock().total_bytes
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// There's no swap and no userspace to kill to reclaim memory here — an
/// allocation failure is unrecoverable, so report it and halt rather than
/// return a null the caller almost certainly won't check.
#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!(
        "Kernel heap allocation failed: size={}, align={}",
        layout.size(),
        layout.align()
    );
}
