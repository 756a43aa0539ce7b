// =============================================================================
// MinimalOS NextGen — Kernel Drivers
// =============================================================================
//
// Drivers that need to run before any userspace exists: PCI enumeration
// (just far enough to find the AHCI HBA), the AHCI SATA controller itself,
// and the block layer built on top of it (MBR/GPT partition decoding plus
// a 4 KiB LRU buffer cache).
//
// Framebuffer rendering, PS/2 input, and the interactive shell are external
// collaborators built against this kernel's contracts — they don't live here.
// =============================================================================

pub mod pci;
pub mod ahci;
pub mod block;
pub mod bcache;
