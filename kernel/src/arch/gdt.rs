//! x86_64 Global Descriptor Table.
//!
//! Long mode barely uses segmentation — base and limit are ignored for
//! code/data fetches, everything flat — but a GDT is still mandatory
//! hardware plumbing: the CPU needs code/data descriptors to reload CS/SS
//! with after the Limine bootloader hands off, and a TSS descriptor to
//! point at the structure that supplies the IST stacks used by the
//! double-fault handler.

use core::arch::asm;
use core::mem::size_of;

use super::tss::Tss;

/// Null + kernel code + kernel data + TSS (2 slots, since a 64-bit TSS
/// descriptor is 16 bytes).
const GDT_ENTRIES: usize = 5;

/// One 8-byte GDT descriptor, raw bit pattern.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// Required first entry; the CPU doesn't care what's in it but
    /// selector 0 must name something that isn't a live descriptor.
    pub const NULL: Self = Self(0);

    /// Ring-0 64-bit code segment: present, DPL=0, executable, long-mode
    /// (`L` bit), readable. Base/limit are set to cover the legacy
    /// full-32-bit range for tooling that still inspects them, even
    /// though the CPU ignores both in 64-bit code-segment fetches.
    pub const fn kernel_code() -> Self {
        Self(0x00_2F_9A_00_0000_FFFF)
    }

    /// Ring-0 data segment: present, DPL=0, writable.
    pub const fn kernel_data() -> Self {
        Self(0x00_0F_92_00_0000_FFFF)
    }
}

/// A TSS descriptor. Unlike code/data descriptors this one carries a real
/// 64-bit base (the TSS can live anywhere in the address space), so it
/// needs the full 16 bytes long-mode descriptors reserve for "system"
/// segment types — two consecutive slots in the GDT array.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TssDescriptor {
    low: u64,
    high: u64,
}

impl TssDescriptor {
    /// Packs `tss`'s address and size into the 16-byte descriptor layout.
    pub fn new(tss: &Tss) -> Self {
        let base = tss as *const _ as u64;
        let limit = (size_of::<Tss>() - 1) as u64;

        let mut low: u64 = 0;
        low |= limit & 0xFFFF; // limit[15:0]
        low |= (base & 0xFFFF) << 16; // base[15:0]
        low |= ((base >> 16) & 0xFF) << 32; // base[23:16]
        low |= 0x89u64 << 40; // present, DPL=0, type=0x9 (64-bit TSS, available)
        low |= ((limit >> 16) & 0xF) << 48; // limit[19:16]
        low |= ((base >> 24) & 0xFF) << 56; // base[31:24]

        let high = base >> 32; // base[63:32]

        Self { low, high }
    }
}

/// The table itself: five consecutive 8-byte slots, 16-byte aligned so
/// `lgdt` can take its address directly.
///
/// | slot | selector | contents          |
/// |------|----------|-------------------|
/// | 0    | —        | null              |
/// | 1    | 0x08     | kernel code       |
/// | 2    | 0x10     | kernel data       |
/// | 3-4  | 0x18     | TSS (16 bytes)    |
#[repr(C, align(16))]
pub struct Gdt {
    entries: [u64; GDT_ENTRIES],
}

/// Byte offsets into the GDT for each segment, handed to `Gdt::load` so
/// it knows which selector to reload CS/SS/TR with.
pub struct Selectors {
    pub kernel_code: u16,
    pub kernel_data: u16,
    pub tss: u16,
}

impl Gdt {
    /// Builds the table (borrowing `tss` only long enough to read its
    /// address into the descriptor — the GDT entry then stands on its own).
    pub fn new(tss: &Tss) -> (Self, Selectors) {
        let tss_desc = TssDescriptor::new(tss);

        let gdt = Self {
            entries: [
                SegmentDescriptor::NULL.0,
                SegmentDescriptor::kernel_code().0,
                SegmentDescriptor::kernel_data().0,
                tss_desc.low,
                tss_desc.high,
            ],
        };

        let selectors = Selectors {
            kernel_code: 0x08,
            kernel_data: 0x10,
            tss: 0x18,
        };

        (gdt, selectors)
    }

    /// Installs this table with `lgdt`, then reloads every segment
    /// register and the task register so the new selectors actually take
    /// effect — `lgdt` alone only changes what the GDTR points at, CS
    /// keeps running on the old (possibly now-dangling) selector until
    /// it's explicitly reloaded.
    ///
    /// # Safety
    /// `self` must outlive every future use of these selectors — in
    /// practice that means a `'static` GDT, since nothing ever calls
    /// `load` again to point the CPU elsewhere. The entries in
    /// `selectors` must actually belong to this table.
    pub unsafe fn load(&'static self, selectors: &Selectors) {
        let ptr = GdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };

        unsafe {
            asm!(
                "lgdt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags)
            );

            // CS can only be reloaded via a control transfer, not `mov` —
            // a far return pops both a new CS and a return RIP off the
            // stack, so we push a selector and the address of the very
            // next instruction and retfq into it.
            asm!(
                "push {sel}",
                "lea {tmp}, [rip + 2f]",
                "push {tmp}",
                "retfq",
                "2:",
                sel = in(reg) selectors.kernel_code as u64,
                tmp = lateout(reg) _,
                options(preserves_flags)
            );

            // DS/ES/SS can be loaded directly with `mov`.
            asm!(
                "mov ds, {sel:x}",
                "mov es, {sel:x}",
                "mov ss, {sel:x}",
                sel = in(reg) selectors.kernel_data as u16,
                options(nostack, preserves_flags)
            );

            // Points the task register at the TSS descriptor so IST
            // stack-switching on fault entry works.
            asm!(
                "ltr {sel:x}",
                sel = in(reg) selectors.tss,
                options(nostack, preserves_flags)
            );
        }
    }
}

/// The 10-byte operand `lgdt` expects: a 16-bit limit followed by a
/// 64-bit base, packed with no padding.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}
