// =============================================================================
// MinimalOS NextGen — Block Layer
// =============================================================================
//
// A minimal block-device abstraction over the AHCI disk: a vtable-shaped
// trait for reading/writing sectors, and MBR/GPT partition decoding so the
// rest of the kernel can address "ahci0p1" instead of raw LBAs.
// =============================================================================

use log::{error, info, warn};

use crate::drivers::ahci;

pub const MAX_PARTITIONS: usize = 16;
const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// `lba`/`count` would read or write past the end of the device.
    OutOfRange,
    /// The underlying AHCI transfer failed.
    Io(ahci::AhciError),
    /// No disk has been initialized yet.
    NotReady,
}

impl From<ahci::AhciError> for BlockError {
    fn from(e: ahci::AhciError) -> Self {
        BlockError::Io(e)
    }
}

/// A readable/writable/flushable span of sectors. Implemented by both the
/// raw boot device and by each partition (which bounds-checks and offsets
/// into its parent).
pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;
    fn sector_size(&self) -> u32;
    fn total_sectors(&self) -> u64;
    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError>;
    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError>;
    fn flush(&self) -> Result<(), BlockError>;
}

// ---------------------------------------------------------------------------
// Boot device (raw AHCI disk)
// ---------------------------------------------------------------------------

struct BootDevice {
    total_sectors: u64,
}

impl BlockDevice for BootDevice {
    fn name(&self) -> &str {
        "ahci0"
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE as u32
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        ahci::read(lba, count as u16, buf).map_err(BlockError::from)
    }

    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
        ahci::write(lba, count as u16, buf).map_err(BlockError::from)
    }

    fn flush(&self) -> Result<(), BlockError> {
        ahci::flush().map_err(BlockError::from)
    }
}

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartTableType {
    None,
    Mbr,
    Gpt,
}

struct Partition {
    name: [u8; 24],
    name_len: u8,
    lba_start: u64,
    lba_count: u64,
    mbr_type: u8,
    is_gpt: bool,
    gpt_type_guid: [u8; 16],
    gpt_part_guid: [u8; 16],
}

impl BlockDevice for Partition {
    fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE as u32
    }

    fn total_sectors(&self) -> u64 {
        self.lba_count
    }

    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        if lba >= self.lba_count || count as u64 > self.lba_count - lba {
            return Err(BlockError::OutOfRange);
        }
        boot_device_read(self.lba_start + lba, count, buf)
    }

    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
        if lba >= self.lba_count || count as u64 > self.lba_count - lba {
            return Err(BlockError::OutOfRange);
        }
        boot_device_write(self.lba_start + lba, count, buf)
    }

    fn flush(&self) -> Result<(), BlockError> {
        boot_device_flush()
    }
}

fn boot_device_read(lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
    ahci::read(lba, count as u16, buf).map_err(BlockError::from)
}

fn boot_device_write(lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
    ahci::write(lba, count as u16, buf).map_err(BlockError::from)
}

fn boot_device_flush() -> Result<(), BlockError> {
    ahci::flush().map_err(BlockError::from)
}

fn make_part_name(parent: &str, index: usize, out: &mut [u8; 24]) -> u8 {
    let mut len = 0usize;
    for b in parent.bytes() {
        if len >= out.len() {
            break;
        }
        out[len] = b;
        len += 1;
    }
    out[len] = b'p';
    len += 1;
    // index is always < MAX_PARTITIONS (16), so one or two digits suffice.
    if index >= 10 {
        out[len] = b'0' + (index / 10) as u8;
        len += 1;
    }
    out[len] = b'0' + (index % 10) as u8;
    len += 1;
    len as u8
}

// ---------------------------------------------------------------------------
// MBR
// ---------------------------------------------------------------------------

const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_PARTITION_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_PROTECTIVE_TYPE: u8 = 0xEE;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MbrPartEntry {
    status: u8,
    chs_first: [u8; 3],
    part_type: u8,
    chs_last: [u8; 3],
    lba_start: u32,
    lba_count: u32,
}

fn probe_mbr_partitions(lba0: &[u8; 512]) -> Result<alloc_free::PartitionVec, BlockError> {
    if lba0[MBR_SIGNATURE_OFFSET] != 0x55 || lba0[MBR_SIGNATURE_OFFSET + 1] != 0xAA {
        return Err(BlockError::OutOfRange);
    }

    let mut parts = alloc_free::PartitionVec::new();
    for i in 0..4 {
        let off = MBR_PARTITION_TABLE_OFFSET + i * MBR_ENTRY_SIZE;
        let entry = unsafe { &*(lba0[off..].as_ptr() as *const MbrPartEntry) };
        let part_type = entry.part_type;
        let lba_count = entry.lba_count;

        if part_type == 0 || lba_count == 0 {
            continue;
        }
        if part_type == MBR_PROTECTIVE_TYPE {
            // GPT already failed validation if probe_mbr_partitions is being
            // called at all, so a protective MBR entry here means "no usable
            // partitions" rather than "go read the GPT".
            info!("[block] skipping protective MBR entry {}", i);
            continue;
        }

        let mut name = [0u8; 24];
        let name_len = make_part_name("ahci0", parts.len() + 1, &mut name);
        parts.push(Partition {
            name,
            name_len,
            lba_start: entry.lba_start as u64,
            lba_count: lba_count as u64,
            mbr_type: part_type,
            is_gpt: false,
            gpt_type_guid: [0; 16],
            gpt_part_guid: [0; 16],
        });
    }

    Ok(parts)
}

// ---------------------------------------------------------------------------
// GPT
// ---------------------------------------------------------------------------

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
/// Original firmware caps the entry-array read at 1024 sectors; this kernel
/// caps it tighter, at 512 sectors (256 KiB), since nothing we boot needs a
/// partition table anywhere near that large and it bounds a single read.
const GPT_ENTRIES_MAX_SECTORS: u64 = 512;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GptHeader {
    signature: [u8; 8],
    revision: u32,
    header_size: u32,
    header_crc32: u32,
    reserved: u32,
    current_lba: u64,
    backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    part_entry_lba: u64,
    num_part_entries: u32,
    part_entry_size: u32,
    part_array_crc32: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GptEntry {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    first_lba: u64,
    last_lba: u64,
    attrs: u64,
    name_utf16le: [u16; 36],
}

fn gpt_header_checksum_ok(raw: &[u8; 512]) -> bool {
    let hdr = unsafe { &*(raw.as_ptr() as *const GptHeader) };
    let header_size = hdr.header_size as usize;
    if !(92..=512).contains(&header_size) {
        return false;
    }
    let stored = hdr.header_crc32;

    // CRC32 is computed over the header with the checksum field itself
    // zeroed out.
    let mut zeroed = [0u8; 512];
    zeroed[..header_size].copy_from_slice(&raw[..header_size]);
    zeroed[16..20].copy_from_slice(&0u32.to_le_bytes());

    let computed = crc32fast::hash(&zeroed[..header_size]);
    computed == stored
}

fn probe_gpt_partitions(lba0: &[u8; 512]) -> Result<alloc_free::PartitionVec, BlockError> {
    let mut lba1 = [0u8; 512];
    boot_device_read(1, 1, &mut lba1)?;

    let hdr = unsafe { &*(lba1.as_ptr() as *const GptHeader) };
    let signature = hdr.signature;
    if signature != *GPT_SIGNATURE {
        return Err(BlockError::OutOfRange);
    }
    let header_size = hdr.header_size;
    if !(92..=512).contains(&header_size) {
        return Err(BlockError::OutOfRange);
    }
    if !gpt_header_checksum_ok(&lba1) {
        warn!("[block] GPT header CRC32 mismatch, falling back to MBR");
        return Err(BlockError::OutOfRange);
    }

    let part_entry_size = hdr.part_entry_size as usize;
    let num_part_entries = hdr.num_part_entries;
    let part_entry_lba = hdr.part_entry_lba;
    let part_array_crc32 = hdr.part_array_crc32;
    if part_entry_size < core::mem::size_of::<GptEntry>() || part_entry_size > 1024 {
        return Err(BlockError::OutOfRange);
    }
    if num_part_entries == 0 || num_part_entries > 4096 {
        return Err(BlockError::OutOfRange);
    }

    let entries_bytes = part_entry_size * num_part_entries as usize;
    let sectors_needed = core::cmp::min(
        (entries_bytes as u64).div_ceil(SECTOR_SIZE),
        GPT_ENTRIES_MAX_SECTORS,
    );

    let mut entries_buf = alloc_free::ByteBuf::new((sectors_needed * SECTOR_SIZE) as usize);
    boot_device_read(part_entry_lba, sectors_needed as u32, entries_buf.as_mut())?;

    let computed_crc = crc32fast::hash(entries_buf.as_ref());
    if computed_crc != part_array_crc32 {
        warn!("[block] GPT partition array CRC32 mismatch, falling back to MBR");
        return Err(BlockError::OutOfRange);
    }

    let max_entries_read = (entries_buf.as_ref().len() / part_entry_size) as u32;
    let usable_entries = core::cmp::min(num_part_entries, max_entries_read);

    let mut parts = alloc_free::PartitionVec::new();
    for i in 0..usable_entries {
        let off = i as usize * part_entry_size;
        if off + core::mem::size_of::<GptEntry>() > entries_buf.as_ref().len() {
            break;
        }
        let entry = unsafe { &*(entries_buf.as_ref()[off..].as_ptr() as *const GptEntry) };
        let type_guid = entry.type_guid;
        let unique_guid = entry.unique_guid;
        let first_lba = entry.first_lba;
        let last_lba = entry.last_lba;

        if type_guid == [0u8; 16] {
            continue;
        }
        if last_lba < first_lba {
            continue;
        }

        let mut name = [0u8; 24];
        let name_len = make_part_name("ahci0", parts.len() + 1, &mut name);
        parts.push(Partition {
            name,
            name_len,
            lba_start: first_lba,
            lba_count: last_lba - first_lba + 1,
            mbr_type: 0,
            is_gpt: true,
            gpt_type_guid: type_guid,
            gpt_part_guid: unique_guid,
        });
    }

    let _ = lba0; // LBA0's protective-MBR contents aren't consulted once GPT validates.
    Ok(parts)
}

// ---------------------------------------------------------------------------
// Fixed-capacity containers (no heap allocator dependency at this layer)
// ---------------------------------------------------------------------------

mod alloc_free {
    use super::{Partition, MAX_PARTITIONS};

    pub struct PartitionVec {
        items: [Option<Partition>; MAX_PARTITIONS],
        len: usize,
    }

    impl PartitionVec {
        pub fn new() -> Self {
            Self { items: [const { None }; MAX_PARTITIONS], len: 0 }
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn push(&mut self, part: Partition) {
            if self.len < MAX_PARTITIONS {
                self.items[self.len] = Some(part);
                self.len += 1;
            }
        }

        pub fn into_array(self) -> ([Option<Partition>; MAX_PARTITIONS], usize) {
            (self.items, self.len)
        }
    }

    /// A page-backed byte buffer sized at construction time. The block
    /// layer only ever needs this for the (bounded) GPT entry-array read, so
    /// a bump allocation straight from the PMM is simpler than threading the
    /// kernel heap through this module.
    pub struct ByteBuf {
        phys: crate::memory::address::PhysAddr,
        len: usize,
    }

    impl ByteBuf {
        pub fn new(len: usize) -> Self {
            let pages = (len as u64).div_ceil(crate::memory::address::PAGE_SIZE) as usize;
            let phys = crate::memory::pmm::alloc_contiguous(pages.max(1))
                .expect("block: failed to allocate GPT entry-array buffer");
            Self { phys, len }
        }

        pub fn as_ref(&self) -> &[u8] {
            unsafe { core::slice::from_raw_parts(self.phys.to_virt().as_ptr::<u8>(), self.len) }
        }

        pub fn as_mut(&mut self) -> &mut [u8] {
            unsafe { core::slice::from_raw_parts_mut(self.phys.to_virt().as_mut_ptr::<u8>(), self.len) }
        }
    }

    impl Drop for ByteBuf {
        fn drop(&mut self) {
            let pages = (self.len as u64).div_ceil(crate::memory::address::PAGE_SIZE) as usize;
            crate::memory::pmm::free_pages(self.phys, pages.max(1));
        }
    }
}

// ---------------------------------------------------------------------------
// Global block-layer state
// ---------------------------------------------------------------------------

use crate::sync::spinlock::SpinLock;

struct BlockState {
    boot: Option<BootDevice>,
    parts: [Option<Partition>; MAX_PARTITIONS],
    part_count: usize,
    table_type: PartTableType,
}

static STATE: SpinLock<BlockState> = SpinLock::new(BlockState {
    boot: None,
    parts: [const { None }; MAX_PARTITIONS],
    part_count: 0,
    table_type: PartTableType::None,
});

/// Probes the AHCI disk, reads LBA0, and decodes a partition table from it
/// (GPT first, MBR as fallback). No-op (and logs) if no disk is ready.
pub fn init() {
    if !ahci::disk_ready() {
        warn!("[block] no AHCI disk ready, block layer idle");
        return;
    }

    let mut lba0 = [0u8; 512];
    if let Err(e) = boot_device_read(0, 1, &mut lba0) {
        error!("[block] failed to read LBA0: {:?}", e);
        return;
    }

    // total_sectors isn't reported by this minimal AHCI driver; we only
    // bounds-check partitions against the device, not the device against
    // itself, so an optimistic upper bound is fine here.
    let mut state = STATE.lock();
    state.boot = Some(BootDevice { total_sectors: u64::MAX });

    let (parts, table_type) = match probe_gpt_partitions(&lba0) {
        Ok(v) => (v, PartTableType::Gpt),
        Err(_) => match probe_mbr_partitions(&lba0) {
            Ok(v) => (v, PartTableType::Mbr),
            Err(_) => {
                info!("[block] no recognizable partition table");
                (alloc_free::PartitionVec::new(), PartTableType::None)
            }
        },
    };

    let (items, count) = parts.into_array();
    state.parts = items;
    state.part_count = count;
    state.table_type = table_type;

    info!(
        "[block] {} partitions found ({:?})",
        state.part_count, state.table_type
    );
}

pub fn partition_count() -> usize {
    STATE.lock().part_count
}

pub fn partition_table_type() -> PartTableType {
    STATE.lock().table_type
}

/// Reads `count` sectors from partition `index` at partition-relative `lba`.
pub fn partition_read(index: usize, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
    let state = STATE.lock();
    let part = state
        .parts
        .get(index)
        .and_then(|p| p.as_ref())
        .ok_or(BlockError::NotReady)?;
    part.read(lba, count, buf)
}

/// Writes `count` sectors to partition `index` at partition-relative `lba`.
pub fn partition_write(index: usize, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
    let state = STATE.lock();
    let part = state
        .parts
        .get(index)
        .and_then(|p| p.as_ref())
        .ok_or(BlockError::NotReady)?;
    part.write(lba, count, buf)
}

pub fn boot_device_flush_all() -> Result<(), BlockError> {
    boot_device_flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbr_signature_check() {
        let mut lba0 = [0u8; 512];
        lba0[510] = 0x55;
        lba0[511] = 0xAA;
        assert!(probe_mbr_partitions(&lba0).is_ok());
    }

    #[test]
    fn mbr_rejects_missing_signature() {
        let lba0 = [0u8; 512];
        assert!(probe_mbr_partitions(&lba0).is_err());
    }

    #[test]
    fn mbr_skips_protective_entry() {
        let mut lba0 = [0u8; 512];
        lba0[510] = 0x55;
        lba0[511] = 0xAA;
        lba0[446 + 4] = MBR_PROTECTIVE_TYPE;
        lba0[446 + 12..446 + 16].copy_from_slice(&1u32.to_le_bytes());
        let parts = probe_mbr_partitions(&lba0).unwrap();
        assert_eq!(parts.len(), 0);
    }

    #[test]
    fn make_part_name_single_and_double_digit() {
        let mut buf = [0u8; 24];
        let len = make_part_name("ahci0", 1, &mut buf);
        assert_eq!(&buf[..len as usize], b"ahci0p1");

        let mut buf2 = [0u8; 24];
        let len2 = make_part_name("ahci0", 12, &mut buf2);
        assert_eq!(&buf2[..len2 as usize], b"ahci0p12");
    }
}
