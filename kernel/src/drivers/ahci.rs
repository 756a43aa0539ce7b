// =============================================================================
// MinimalOS NextGen — AHCI SATA Driver
// =============================================================================
//
// Talks to a single AHCI HBA port found by `drivers::pci`. No NCQ, no hot
// plug, no port multipliers — one SATA disk, PIO-free DMA transfers through
// a scatter/gather PRDT, which is the whole point of AHCI over legacy IDE.
//
// MMIO access goes through a small dedicated virtual window rather than
// relying on the HHDM: Limine's HHDM maps usable/reclaimable RAM, and isn't
// guaranteed to cover a BAR that can land anywhere in the physical address
// space (including above all installed RAM on real hardware).
// =============================================================================

use core::mem::size_of;

use log::{error, info, warn};

use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::pmm;
use crate::memory::vmm::{self, PageTableFlags};
use crate::sync::spinlock::SpinLock;

/// Errors surfaced by the public read/write/flush API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    /// No disk was found (or selected) during `probe_mmio`.
    NoDisk,
    /// The HBA reported a command error (TFD error bit set after completion).
    CommandError,
    /// The command did not complete within the polling budget.
    Timeout,
    /// Neither a direct PRDT nor a bounce buffer could be built for the
    /// transfer (buffer not mapped and bounce allocation failed).
    BufferUnavailable,
}

// ---------------------------------------------------------------------------
// HBA / port register layout
// ---------------------------------------------------------------------------

const HBA_CAP: usize = 0x00;
const HBA_GHC: usize = 0x04;
const HBA_IS: usize = 0x08;
const HBA_PI: usize = 0x0C;
const HBA_VS: usize = 0x10;

const GHC_AHCI_ENABLE: u32 = 1 << 31;

const PORT_REGION_BASE: usize = 0x100;
const PORT_REGION_STRIDE: usize = 0x80;

const PX_CLB: usize = 0x00;
const PX_CLBU: usize = 0x04;
const PX_FB: usize = 0x08;
const PX_FBU: usize = 0x0C;
const PX_IS: usize = 0x10;
const PX_IE: usize = 0x14;
const PX_CMD: usize = 0x18;
const PX_TFD: usize = 0x20;
const PX_SIG: usize = 0x24;
const PX_SSTS: usize = 0x28;
const PX_SERR: usize = 0x30;
const PX_CI: usize = 0x38;

const PXCMD_ST: u32 = 1 << 0;
const PXCMD_FRE: u32 = 1 << 4;
const PXCMD_FR: u32 = 1 << 14;
const PXCMD_CR: u32 = 1 << 15;

const TFD_ERR: u32 = 1 << 0;
const TFD_BSY: u32 = 1 << 7;
const TFD_DRQ: u32 = 1 << 3;

const SATA_SIG_ATA: u32 = 0x0000_0101;
const SATA_SIG_ATAPI: u32 = 0xEB14_0101;
const SATA_SIG_SEMB: u32 = 0xC33C_0101;
const SATA_SIG_PM: u32 = 0x9669_0101;

const FIS_TYPE_REG_H2D: u8 = 0x27;

const ATA_CMD_IDENTIFY: u8 = 0xEC;
const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
const ATA_CMD_FLUSH_CACHE_EXT: u8 = 0xEA;

const AHCI_MAX_PRDT: usize = 128;
/// Any one PRDT entry covers at most 4 MiB (`dbc` is a 22-bit byte count).
const PRDT_MAX_BYTES: usize = 4 * 1024 * 1024;

const SECTOR_SIZE: usize = 512;

// ---------------------------------------------------------------------------
// Command list / FIS / PRDT structures (HBA-defined layout, byte-exact)
// ---------------------------------------------------------------------------

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct HbaCmdHeader {
    flags: u16, // cfl:5, a:1, w:1, p:1, r:1, b:1, c:1, rsv0:1, pmp:4
    prdtl: u16,
    prdbc: u32,
    ctba: u32,
    ctbau: u32,
    _rsv1: [u32; 4],
}

const CMD_FLAG_CFL_MASK: u16 = 0x1F;
const CMD_FLAG_WRITE: u16 = 1 << 6;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct HbaPrdt {
    dba: u32,
    dbau: u32,
    _rsv0: u32,
    dbc_i: u32, // dbc:22, rsv1:9, i:1
}

/// `dbc_i` bit 31 (`I`) — raise PxIS.DPS on this PRD's completion. We poll
/// CI/TFD rather than wait on the interrupt, but the spec requires the bit
/// set on every entry regardless.
const PRDT_INTERRUPT_ON_COMPLETION: u32 = 1 << 31;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct FisRegH2d {
    fis_type: u8,
    pmport_c: u8, // pmport:4, rsv0:3, c:1
    command: u8,
    featurel: u8,
    lba0: u8,
    lba1: u8,
    lba2: u8,
    device: u8,
    lba3: u8,
    lba4: u8,
    lba5: u8,
    featureh: u8,
    countl: u8,
    counth: u8,
    icc: u8,
    control: u8,
    _rsv1: [u8; 4],
}

#[repr(C, packed)]
struct HbaCmdTable {
    cfis: [u8; 64],
    acmd: [u8; 16],
    _rsv: [u8; 48],
    prdt: [HbaPrdt; AHCI_MAX_PRDT],
}

// ---------------------------------------------------------------------------
// MMIO window
// ---------------------------------------------------------------------------

const MMIO_VIRT_BASE: u64 = 0xFFFF_FFFF_A000_0000;
const MMIO_SLOTS: usize = 16;

static MMIO_SLOT_PHYS: SpinLock<[Option<PhysAddr>; MMIO_SLOTS]> = SpinLock::new([None; MMIO_SLOTS]);

/// Maps `phys_page` into the dedicated AHCI MMIO window, reusing an existing
/// mapping if this page is already resident in the slot cache.
fn map_mmio_page(phys_page: PhysAddr) -> VirtAddr {
    let mut slots = MMIO_SLOT_PHYS.lock();
    if let Some(idx) = slots.iter().position(|s| *s == Some(phys_page)) {
        return VirtAddr::new(MMIO_VIRT_BASE + idx as u64 * PAGE_SIZE);
    }
    let idx = slots
        .iter()
        .position(|s| s.is_none())
        .expect("ahci: mmio slot cache exhausted");
    slots[idx] = Some(phys_page);
    let virt = VirtAddr::new(MMIO_VIRT_BASE + idx as u64 * PAGE_SIZE);
    unsafe {
        vmm::map_page(
            vmm::active_pml4(),
            virt,
            phys_page,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE,
        )
        .expect("ahci: failed to map mmio page");
    }
    vmm::flush(virt);
    virt
}

/// A handle to the HBA's MMIO space, page-granular.
struct Mmio {
    base_phys: u64,
}

impl Mmio {
    fn page_for(&self, byte_offset: usize) -> (VirtAddr, usize) {
        let abs = self.base_phys + byte_offset as u64;
        let page_phys = PhysAddr::new(abs & !(PAGE_SIZE - 1));
        let virt = map_mmio_page(page_phys);
        (virt, (abs & (PAGE_SIZE - 1)) as usize)
    }

    fn read32(&self, offset: usize) -> u32 {
        let (virt, in_page) = self.page_for(offset);
        unsafe { core::ptr::read_volatile(virt.as_ptr::<u32>().byte_add(in_page)) }
    }

    fn write32(&self, offset: usize, value: u32) {
        let (virt, in_page) = self.page_for(offset);
        unsafe { core::ptr::write_volatile(virt.as_mut_ptr::<u32>().byte_add(in_page), value) }
    }

    fn port_base(&self, port: usize) -> usize {
        PORT_REGION_BASE + port * PORT_REGION_STRIDE
    }

    fn port_read32(&self, port: usize, reg: usize) -> u32 {
        self.read32(self.port_base(port) + reg)
    }

    fn port_write32(&self, port: usize, reg: usize, value: u32) {
        self.write32(self.port_base(port) + reg, value)
    }
}

// ---------------------------------------------------------------------------
// Selected disk state
// ---------------------------------------------------------------------------

struct Disk {
    mmio: Mmio,
    port: usize,
    clb_phys: PhysAddr,
    fb_phys: PhysAddr,
    ctba_phys: PhysAddr,
    model: [u8; 41],
}

static DISK: SpinLock<Option<Disk>> = SpinLock::new(None);

/// True once `probe_mmio` has found and initialized a disk.
pub fn disk_ready() -> bool {
    DISK.lock().is_some()
}

// ---------------------------------------------------------------------------
// Port control helpers
// ---------------------------------------------------------------------------

fn port_stop(mmio: &Mmio, port: usize) {
    let mut cmd = mmio.port_read32(port, PX_CMD);
    cmd &= !(PXCMD_ST | PXCMD_FRE);
    mmio.port_write32(port, PX_CMD, cmd);

    for _ in 0..200_000 {
        let cmd = mmio.port_read32(port, PX_CMD);
        if cmd & (PXCMD_FR | PXCMD_CR) == 0 {
            break;
        }
        core::hint::spin_loop();
    }
}

fn port_start(mmio: &Mmio, port: usize) {
    for _ in 0..200_000 {
        if mmio.port_read32(port, PX_CMD) & PXCMD_CR == 0 {
            break;
        }
        core::hint::spin_loop();
    }
    let mut cmd = mmio.port_read32(port, PX_CMD);
    cmd |= PXCMD_FRE;
    mmio.port_write32(port, PX_CMD, cmd);
    cmd |= PXCMD_ST;
    mmio.port_write32(port, PX_CMD, cmd);
}

fn port_wait_not_busy(mmio: &Mmio, port: usize) -> Result<(), AhciError> {
    for _ in 0..200_000 {
        let tfd = mmio.port_read32(port, PX_TFD);
        if tfd & (TFD_BSY | TFD_DRQ) == 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(AhciError::Timeout)
}

/// Issues slot 0 and polls for completion. `PxCI` bit 0 clears when the HBA
/// has processed the command; `PxTFD` error bit signals command failure.
fn port_issue_and_wait(mmio: &Mmio, port: usize) -> Result<(), AhciError> {
    mmio.port_write32(port, PX_CI, 1);

    for _ in 0..1_000 {
        if mmio.port_read32(port, PX_CI) & 1 == 0 {
            break;
        }
        core::hint::spin_loop();
    }

    for _ in 0..400_000 {
        let ci = mmio.port_read32(port, PX_CI);
        if ci & 1 == 0 {
            let tfd = mmio.port_read32(port, PX_TFD);
            if tfd & TFD_ERR != 0 {
                return Err(AhciError::CommandError);
            }
            return Ok(());
        }
        core::hint::spin_loop();
    }

    Err(AhciError::Timeout)
}

// ---------------------------------------------------------------------------
// PRDT construction
// ---------------------------------------------------------------------------

/// Builds PRDT entries for `virt`/`len`, walking the buffer page by page and
/// translating each page through the active address space. Returns `None`
/// if any page in the range is unmapped — the caller falls back to a bounce
/// buffer in that case.
fn build_prdt_from_virt(prdt: &mut [HbaPrdt], virt: VirtAddr, len: usize) -> Option<usize> {
    let pml4 = vmm::active_pml4();
    let mut remaining = len;
    let mut cursor = virt.as_u64();
    let mut entry = 0usize;

    while remaining > 0 {
        if entry >= prdt.len() {
            return None;
        }
        let page_base = cursor & !(PAGE_SIZE - 1);
        let in_page = (cursor - page_base) as usize;
        let phys = vmm::get_physical(pml4, VirtAddr::new(page_base));
        if phys == 0 {
            return None;
        }

        let chunk = core::cmp::min(remaining, PAGE_SIZE as usize - in_page);
        let dba = phys + in_page as u64;
        prdt[entry] = HbaPrdt {
            dba: dba as u32,
            dbau: (dba >> 32) as u32,
            _rsv0: 0,
            dbc_i: ((chunk as u32 - 1) & 0x3F_FFFF) | PRDT_INTERRUPT_ON_COMPLETION,
        };

        entry += 1;
        cursor += chunk as u64;
        remaining -= chunk;
    }

    Some(entry)
}

/// Builds PRDT entries for a contiguous physical buffer, chunking into
/// `PRDT_MAX_BYTES`-sized pieces.
fn build_prdt_from_phys_contig(prdt: &mut [HbaPrdt], phys: PhysAddr, len: usize) -> Option<usize> {
    let mut remaining = len;
    let mut addr = phys.as_u64();
    let mut entry = 0usize;

    while remaining > 0 {
        if entry >= prdt.len() {
            return None;
        }
        let chunk = core::cmp::min(remaining, PRDT_MAX_BYTES);
        prdt[entry] = HbaPrdt {
            dba: addr as u32,
            dbau: (addr >> 32) as u32,
            _rsv0: 0,
            dbc_i: ((chunk as u32 - 1) & 0x3F_FFFF) | PRDT_INTERRUPT_ON_COMPLETION,
        };
        entry += 1;
        addr += chunk as u64;
        remaining -= chunk;
    }

    Some(entry)
}

fn dma_alloc_contig(bytes: usize) -> Option<PhysAddr> {
    let pages = bytes.div_ceil(PAGE_SIZE as usize);
    pmm::alloc_contiguous(pages)
}

fn dma_free_contig(phys: PhysAddr, bytes: usize) {
    let pages = bytes.div_ceil(PAGE_SIZE as usize);
    pmm::free_pages(phys, pages);
}

// ---------------------------------------------------------------------------
// Command submission
// ---------------------------------------------------------------------------

fn cmd_table_virt(ctba_phys: PhysAddr) -> *mut HbaCmdTable {
    ctba_phys.to_virt().as_mut_ptr::<HbaCmdTable>()
}

fn build_h2d_fis(cfis: &mut [u8; 64], command: u8, lba: u64, sector_count: u16) {
    let fis = FisRegH2d {
        fis_type: FIS_TYPE_REG_H2D,
        pmport_c: 1 << 7, // c=1: this is a command FIS
        command,
        featurel: 0,
        lba0: lba as u8,
        lba1: (lba >> 8) as u8,
        lba2: (lba >> 16) as u8,
        device: 1 << 6, // LBA mode
        lba3: (lba >> 24) as u8,
        lba4: (lba >> 32) as u8,
        lba5: (lba >> 40) as u8,
        featureh: 0,
        countl: sector_count as u8,
        counth: (sector_count >> 8) as u8,
        icc: 0,
        control: 0,
        _rsv1: [0; 4],
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(&fis as *const _ as *const u8, size_of::<FisRegH2d>())
    };
    cfis[..bytes.len()].copy_from_slice(bytes);
}

/// Issues a read or write for `count` sectors starting at `lba`, bouncing
/// through a freshly allocated physical buffer if `buf` isn't cleanly
/// mappable (e.g. it straddles unmapped pages — shouldn't happen for kernel
/// stack/heap buffers, but we don't assume).
fn ahci_rw(disk: &mut Disk, lba: u64, count: u16, buf: &mut [u8], write: bool) -> Result<(), AhciError> {
    let len = count as usize * SECTOR_SIZE;
    assert!(buf.len() >= len, "ahci: buffer too small for transfer");

    if disk.mmio.port_read32(disk.port, PX_CMD) & PXCMD_ST == 0 {
        port_start(&disk.mmio, disk.port);
    }
    port_wait_not_busy(&disk.mmio, disk.port)?;
    disk.mmio.port_write32(disk.port, PX_SERR, 0xFFFF_FFFF);
    disk.mmio.port_write32(disk.port, PX_IS, 0xFFFF_FFFF);

    let table = unsafe { &mut *cmd_table_virt(disk.ctba_phys) };

    let direct = build_prdt_from_virt(&mut table.prdt, VirtAddr::new(buf.as_ptr() as u64), len);
    let (prdtl, bounce) = match direct {
        Some(n) => (n, None),
        None => {
            let bounce_phys = dma_alloc_contig(len).ok_or(AhciError::BufferUnavailable)?;
            if write {
                let bounce_virt = bounce_phys.to_virt().as_mut_ptr::<u8>();
                unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), bounce_virt, len) };
            }
            let n = build_prdt_from_phys_contig(&mut table.prdt, bounce_phys, len)
                .ok_or(AhciError::BufferUnavailable)?;
            (n, Some(bounce_phys))
        }
    };

    build_h2d_fis(
        &mut table.cfis,
        if write { ATA_CMD_WRITE_DMA_EXT } else { ATA_CMD_READ_DMA_EXT },
        lba,
        count,
    );

    let header = unsafe { &mut *(disk.clb_phys.to_virt().as_mut_ptr::<HbaCmdHeader>()) };
    let mut flags = (size_of::<FisRegH2d>() as u16 / 4) & CMD_FLAG_CFL_MASK;
    if write {
        flags |= CMD_FLAG_WRITE;
    }
    header.flags = flags;
    header.prdtl = prdtl as u16;
    header.prdbc = 0;
    header.ctba = disk.ctba_phys.as_u64() as u32;
    header.ctbau = (disk.ctba_phys.as_u64() >> 32) as u32;

    let result = port_issue_and_wait(&disk.mmio, disk.port);

    if let Some(bounce_phys) = bounce {
        if result.is_ok() && !write {
            let bounce_virt = bounce_phys.to_virt().as_ptr::<u8>();
            unsafe { core::ptr::copy_nonoverlapping(bounce_virt, buf.as_mut_ptr(), len) };
        }
        dma_free_contig(bounce_phys, len);
    }

    result
}

fn ahci_nodata(disk: &mut Disk, command: u8) -> Result<(), AhciError> {
    if disk.mmio.port_read32(disk.port, PX_CMD) & PXCMD_ST == 0 {
        port_start(&disk.mmio, disk.port);
    }
    port_wait_not_busy(&disk.mmio, disk.port)?;
    disk.mmio.port_write32(disk.port, PX_SERR, 0xFFFF_FFFF);
    disk.mmio.port_write32(disk.port, PX_IS, 0xFFFF_FFFF);

    let table = unsafe { &mut *cmd_table_virt(disk.ctba_phys) };
    build_h2d_fis(&mut table.cfis, command, 0, 0);

    let header = unsafe { &mut *(disk.clb_phys.to_virt().as_mut_ptr::<HbaCmdHeader>()) };
    header.flags = (size_of::<FisRegH2d>() as u16 / 4) & CMD_FLAG_CFL_MASK;
    header.prdtl = 0;
    header.prdbc = 0;
    header.ctba = disk.ctba_phys.as_u64() as u32;
    header.ctbau = (disk.ctba_phys.as_u64() >> 32) as u32;

    port_issue_and_wait(&disk.mmio, disk.port)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Reads `count` sectors starting at `lba` into `buf` (must hold at least
/// `count * 512` bytes).
pub fn read(lba: u64, count: u16, buf: &mut [u8]) -> Result<(), AhciError> {
    let mut guard = DISK.lock();
    let disk = guard.as_mut().ok_or(AhciError::NoDisk)?;
    ahci_rw(disk, lba, count, buf, false)
}

/// Writes `count` sectors starting at `lba` from `buf`.
pub fn write(lba: u64, count: u16, buf: &[u8]) -> Result<(), AhciError> {
    let mut guard = DISK.lock();
    let disk = guard.as_mut().ok_or(AhciError::NoDisk)?;
    // ahci_rw wants &mut for the bounce-copy-back path on reads; writes never
    // touch the caller's buffer, so the mutable borrow is only to share code.
    let buf_ptr = buf.as_ptr() as *mut u8;
    let buf_mut = unsafe { core::slice::from_raw_parts_mut(buf_ptr, buf.len()) };
    ahci_rw(disk, lba, count, buf_mut, true)
}

/// Issues FLUSH CACHE EXT and waits for completion.
pub fn flush() -> Result<(), AhciError> {
    let mut guard = DISK.lock();
    let disk = guard.as_mut().ok_or(AhciError::NoDisk)?;
    ahci_nodata(disk, ATA_CMD_FLUSH_CACHE_EXT)
}

fn ata_swap_model(raw: &[u8], out: &mut [u8; 41]) {
    // IDENTIFY's model string is word-swapped ASCII: each pair of bytes is
    // stored big-endian within a little-endian word.
    for i in 0..40 {
        out[i] = if i % 2 == 0 { raw[i + 1] } else { raw[i - 1] };
    }
    out[40] = 0;
}

fn ahci_identify_selected_disk(disk: &mut Disk) -> Result<(), AhciError> {
    let id_phys = dma_alloc_contig(512).ok_or(AhciError::BufferUnavailable)?;
    let id_virt = id_phys.to_virt();

    if disk.mmio.port_read32(disk.port, PX_CMD) & PXCMD_ST == 0 {
        port_start(&disk.mmio, disk.port);
    }
    port_wait_not_busy(&disk.mmio, disk.port)?;

    let table = unsafe { &mut *cmd_table_virt(disk.ctba_phys) };
    table.prdt[0] = HbaPrdt {
        dba: id_phys.as_u64() as u32,
        dbau: (id_phys.as_u64() >> 32) as u32,
        _rsv0: 0,
        dbc_i: 511,
    };
    build_h2d_fis(&mut table.cfis, ATA_CMD_IDENTIFY, 0, 0);

    let header = unsafe { &mut *(disk.clb_phys.to_virt().as_mut_ptr::<HbaCmdHeader>()) };
    header.flags = (size_of::<FisRegH2d>() as u16 / 4) & CMD_FLAG_CFL_MASK;
    header.prdtl = 1;
    header.prdbc = 0;
    header.ctba = disk.ctba_phys.as_u64() as u32;
    header.ctbau = (disk.ctba_phys.as_u64() >> 32) as u32;

    let result = port_issue_and_wait(&disk.mmio, disk.port);
    if result.is_ok() {
        let raw = unsafe { core::slice::from_raw_parts(id_virt.as_ptr::<u8>().byte_add(54), 40) };
        ata_swap_model(raw, &mut disk.model);
    }
    dma_free_contig(id_phys, 512);
    result
}

fn ahci_init_port(mmio: Mmio, port: usize) -> Result<Disk, AhciError> {
    port_stop(&mmio, port);
    mmio.port_write32(port, PX_SERR, 0xFFFF_FFFF);
    mmio.port_write32(port, PX_IS, 0xFFFF_FFFF);

    let clb_phys = pmm::alloc_frame_zeroed().ok_or(AhciError::BufferUnavailable)?;
    let fb_phys = pmm::alloc_frame_zeroed().ok_or(AhciError::BufferUnavailable)?;
    let ctba_phys = pmm::alloc_frame_zeroed().ok_or(AhciError::BufferUnavailable)?;

    mmio.port_write32(port, PX_CLB, clb_phys.as_u64() as u32);
    mmio.port_write32(port, PX_CLBU, (clb_phys.as_u64() >> 32) as u32);
    mmio.port_write32(port, PX_FB, fb_phys.as_u64() as u32);
    mmio.port_write32(port, PX_FBU, (fb_phys.as_u64() >> 32) as u32);

    port_start(&mmio, port);

    Ok(Disk {
        mmio,
        port,
        clb_phys,
        fb_phys,
        ctba_phys,
        model: [0; 41],
    })
}

fn det_ipm_status(ssts: u32) -> (u32, u32) {
    (ssts & 0xF, (ssts >> 8) & 0xF)
}

/// Enables the HBA (if not already), enumerates implemented ports, and
/// initializes the first ACTIVE SATA disk it finds. Called once per
/// AHCI-class function found by `drivers::pci::enumerate_and_probe`.
pub fn probe_mmio(mmio_phys32: u32) {
    let mmio = Mmio { base_phys: mmio_phys32 as u64 };

    let ghc = mmio.read32(HBA_GHC);
    if ghc & GHC_AHCI_ENABLE == 0 {
        mmio.write32(HBA_GHC, ghc | GHC_AHCI_ENABLE);
    }

    let cap = mmio.read32(HBA_CAP);
    let pi = mmio.read32(HBA_PI);
    let vs = mmio.read32(HBA_VS);
    info!(
        "[ahci] CAP={:#010x} GHC={:#010x} PI={:#010x} VS={:#010x}",
        cap,
        mmio.read32(HBA_GHC),
        pi,
        vs
    );

    let n_ports = ((cap & 0x1F) + 1) as usize;
    let mut selected: Option<usize> = None;

    for port in 0..n_ports {
        if pi & (1 << port) == 0 {
            continue;
        }
        let ssts = mmio.port_read32(port, PX_SSTS);
        let (det, ipm) = det_ipm_status(ssts);
        let sig = mmio.port_read32(port, PX_SIG);

        let status = match (det, ipm) {
            (3, 1) => "ACTIVE",
            (1, _) => "PRESENT",
            (0, _) => "NO-COMM",
            _ => "EMPTY",
        };
        info!("[ahci] port {}: {} sig={:#010x}", port, status, sig);

        if selected.is_none() && det == 3 && ipm == 1 && sig == SATA_SIG_ATA {
            selected = Some(port);
        } else if selected.is_none() && det == 3 && ipm == 1 {
            let kind = match sig {
                SATA_SIG_ATAPI => "ATAPI",
                SATA_SIG_SEMB => "enclosure bridge",
                SATA_SIG_PM => "port multiplier",
                _ => "unknown device",
            };
            warn!("[ahci] port {}: active but not a SATA disk ({})", port, kind);
        }
    }

    let Some(port) = selected else {
        error!("[ahci] no SATA disk found on this controller");
        return;
    };

    match ahci_init_port(mmio, port) {
        Ok(mut disk) => match ahci_identify_selected_disk(&mut disk) {
            Ok(()) => {
                let model = core::str::from_utf8(&disk.model[..40]).unwrap_or("").trim();
                info!("[ahci] selected port {}: {}", port, model);
                *DISK.lock() = Some(disk);
            }
            Err(e) => error!("[ahci] IDENTIFY failed on port {}: {:?}", port, e),
        },
        Err(e) => error!("[ahci] failed to initialize port {}: {:?}", port, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prdt_from_phys_contig_chunks_at_4mib() {
        let mut prdt = [HbaPrdt { dba: 0, dbau: 0, _rsv0: 0, dbc_i: 0 }; AHCI_MAX_PRDT];
        let len = PRDT_MAX_BYTES + 1024;
        let n = build_prdt_from_phys_contig(&mut prdt, PhysAddr::new(0x10_0000), len).unwrap();
        assert_eq!(n, 2);
        assert_eq!(prdt[0].dbc_i + 1, PRDT_MAX_BYTES as u32);
        assert_eq!(prdt[1].dbc_i + 1, 1024);
    }

    #[test]
    fn det_ipm_decodes_active() {
        assert_eq!(det_ipm_status(0x0000_0133), (3, 1));
    }

    #[test]
    fn ata_model_string_unswaps_word_pairs() {
        let mut raw = [0u8; 40];
        raw[0] = b'B';
        raw[1] = b'A';
        let mut out = [0u8; 41];
        ata_swap_model(&raw, &mut out);
        assert_eq!(&out[0..2], b"AB");
    }
}
