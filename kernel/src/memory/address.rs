// =============================================================================
// MinimalOS NextGen — Physical and Virtual Address Types
// =============================================================================
//
// Mixing up a physical address with a virtual one is a classic way to
// corrupt memory in ways that are hard to trace back: the write lands
// somewhere real, just not where you meant it to. The newtype pattern
// turns that into a compile error instead of a debugging session —
// `PhysAddr` and `VirtAddr` are distinct types, and converting between
// them goes through named functions that say what's actually happening.
//
// ADDRESS SPACE SHAPE ON x86_64:
//   - Physical addresses: up to 52 bits architecturally; we store the full
//     u64 and only assert the top 12 bits are clear.
//   - Virtual addresses: 48 bits of real address, sign-extended through
//     bit 63. An address is "canonical" only if bits 48-63 all match bit
//     47 — anything else faults with a GPF before it ever reaches the
//     page tables.
//       Lower half (user):   0x0000_0000_0000_0000 .. 0x0000_7FFF_FFFF_FFFF
//       Upper half (kernel): 0xFFFF_8000_0000_0000 .. 0xFFFF_FFFF_FFFF_FFFF
//       Everything between those two ranges is non-canonical.
//
// HHDM — HIGHER HALF DIRECT MAP:
//   Limine maps the entirety of physical memory into one contiguous
//   region of kernel virtual address space before the kernel ever runs.
//   Given that mapping's base offset, `phys + hhdm_offset == virt`, so any
//   physical frame is reachable without building a page mapping for it
//   first — which matters because building a mapping means walking page
//   tables that are themselves stored at physical addresses.
//
// =============================================================================

use core::fmt;

/// Virtual offset of Limine's direct map of physical memory. Zero until
/// [`init_hhdm`] runs; using it before that reads a bogus offset.
static mut HHDM_OFFSET: u64 = 0;

/// Records the HHDM offset Limine reported at boot.
///
/// # Safety
/// Call exactly once, early in boot, before any [`PhysAddr::to_virt`] call.
pub unsafe fn init_hhdm(offset: u64) {
    unsafe { HHDM_OFFSET = offset; }
}

/// Returns the HHDM offset recorded by [`init_hhdm`].
#[inline]
pub fn hhdm_offset() -> u64 {
    // SAFETY: write-once during boot, read-only from here on.
    let offset = unsafe { HHDM_OFFSET };
    debug_assert!(offset != 0, "HHDM offset not initialized — call init_hhdm() first");
    offset
}

// =============================================================================
// PhysAddr — a physical memory address
// =============================================================================

/// A physical memory address — what actually goes out on the memory bus
/// once the page tables have done their job.
///
/// # Examples
/// ```
/// let addr = PhysAddr::new(0x1000);
/// assert!(addr.is_page_aligned());
/// let virt = addr.to_virt(); // HHDM mapping of the same frame
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wraps a raw address. x86_64 requires bits 52-63 to be clear on any
    /// physical address actually fed to the MMU; this asserts that in
    /// debug builds rather than silently truncating.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(
            addr & 0xFFF0_0000_0000_0000 == 0,
            "Physical address exceeds 52-bit limit"
        );
        Self(addr)
    }

    /// Wraps a raw address without the 52-bit check.
    ///
    /// # Safety
    /// The caller vouches the value is a real, in-range physical address
    /// — e.g. one just extracted from a present page table entry.
    #[inline]
    pub const unsafe fn new_unchecked(addr: u64) -> Self {
        Self(addr)
    }

    /// Unwraps back to the raw `u64`.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Looks up where this physical frame lives in the HHDM.
    #[inline]
    pub fn to_virt(self) -> VirtAddr {
        VirtAddr::new(self.0 + hhdm_offset())
    }

    /// True if aligned to the start of a 4 KiB page.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }

    /// Rounds down to the enclosing page boundary.
    ///
    /// ```
    /// assert_eq!(PhysAddr::new(0x1234).page_align_down(), PhysAddr::new(0x1000));
    /// assert_eq!(PhysAddr::new(0x1000).page_align_down(), PhysAddr::new(0x1000));
    /// ```
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !0xFFF)
    }

    /// Rounds up to the next page boundary (a no-op if already aligned).
    #[inline]
    pub const fn page_align_up(self) -> Self {
        let aligned = (self.0 + 0xFFF) & !0xFFF;
        debug_assert!(aligned >= self.0, "PhysAddr::page_align_up overflow");
        Self(aligned)
    }

    /// The null physical address — the PMM never hands out frame 0, so
    /// callers use this as a sentinel for "nothing here."
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn sub(self, offset: u64) -> Self {
        Self::new(self.0 - offset)
    }
}

/// Byte distance between two physical addresses.
impl core::ops::Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: PhysAddr) -> u64 {
        self.0 - other.0
    }
}

// =============================================================================
// VirtAddr — a virtual memory address
// =============================================================================

/// A virtual memory address — what every load, store, and instruction
/// fetch actually uses; the MMU turns this into a `PhysAddr` by walking
/// the page tables.
///
/// # Examples
/// ```
/// let addr = VirtAddr::new(0xFFFF_8000_0000_1000);
/// assert!(addr.is_kernel());
/// assert!(addr.is_page_aligned());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Wraps a raw address, asserting it's canonical (bits 48-63 equal
    /// bit 47 — sign-extending bit 47 across the top and comparing against
    /// the input is the cheapest way to check that).
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let canonical = ((addr << 16) as i64 >> 16) as u64;
        debug_assert!(addr == canonical, "Non-canonical virtual address");
        Self(addr)
    }

    /// Wraps a raw address without the canonicality check.
    ///
    /// # Safety
    /// The caller vouches the address is canonical.
    #[inline]
    pub const unsafe fn new_unchecked(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Reinterprets this address as a raw pointer, for the handful of
    /// places that need to actually touch the memory it names.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// True for upper-half (kernel) addresses — equivalently, bit 47 set.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= 0xFFFF_8000_0000_0000
    }

    /// True for lower-half (user) addresses — bit 47 clear.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < 0x0000_8000_0000_0000
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }

    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !0xFFF)
    }

    #[inline]
    pub const fn page_align_up(self) -> Self {
        Self((self.0 + 0xFFF) & !0xFFF)
    }

    /// Splits the address into the four 9-bit indices a page table walk
    /// needs, one per level:
    ///
    /// ```text
    /// 63       48 47    39 38    30 29    21 20    12 11       0
    /// ┌──────────┬────────┬────────┬────────┬────────┬─────────┐
    /// │ sign ext │ PML4   │  PDPT  │   PD   │   PT   │ Offset  │
    /// └──────────┴────────┴────────┴────────┴────────┴─────────┘
    ///              idx[3]   idx[2]   idx[1]   idx[0]
    /// ```
    ///
    /// Returned lowest-level-first (`[PT, PD, PDPT, PML4]`) to match how
    /// the VMM walks from PML4 down but indexes the result array bottom-up.
    #[inline]
    pub const fn page_table_indices(self) -> [u16; 4] {
        [
            ((self.0 >> 12) & 0x1FF) as u16,
            ((self.0 >> 21) & 0x1FF) as u16,
            ((self.0 >> 30) & 0x1FF) as u16,
            ((self.0 >> 39) & 0x1FF) as u16,
        ]
    }

    /// The low 12 bits — byte offset within whatever page this address falls in.
    #[inline]
    pub const fn page_offset(self) -> u16 {
        (self.0 & 0xFFF) as u16
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl core::ops::Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, offset: u64) -> Self {
        Self::new(self.0 - offset)
    }
}

impl core::ops::Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: VirtAddr) -> u64 {
        self.0 - other.0
    }
}

// =============================================================================
// Page size constants
// =============================================================================

pub const PAGE_SIZE: u64 = 4096;
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;
pub const PAGE_SHIFT: u64 = 12;
