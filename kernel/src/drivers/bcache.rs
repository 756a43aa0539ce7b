// =============================================================================
// MinimalOS NextGen — Block Cache
// =============================================================================
//
// A fixed-size pool of 4 KiB buffers, each backing 8 contiguous 512-byte
// sectors, indexed by a separate-chaining hash table and kept in an
// intrusive LRU list for eviction. Dirty buffers are written back on
// eviction and on explicit sync.
// =============================================================================

use log::{debug, trace};

use crate::drivers::block::BlockError;
use crate::memory::address::PhysAddr;
use crate::memory::pmm;
use crate::sync::spinlock::SpinLock;

pub const BLOCK_SIZE: usize = 4096;
pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;

const DEFAULT_BUFS: usize = 128;
/// Upper bound on the buffer pool so the fixed-size tables below don't need
/// a heap allocator.
const MAX_BUFS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    NotInitialized,
    Io(BlockError),
    PoolExhausted,
}

impl From<BlockError> for CacheError {
    fn from(e: BlockError) -> Self {
        CacheError::Io(e)
    }
}

/// A device identifier the cache key is scoped to — the boot device (`None`
/// partition index) or a specific partition.
pub type DevId = Option<usize>;

const NIL: usize = usize::MAX;

struct Buf {
    dev: DevId,
    block_no: u64,
    refcnt: u32,
    valid: bool,
    dirty: bool,
    data_phys: PhysAddr,
    hnext: usize,
    prev: usize,
    next: usize,
}

impl Buf {
    const fn empty() -> Self {
        Self {
            dev: None,
            block_no: 0,
            refcnt: 0,
            valid: false,
            dirty: false,
            data_phys: PhysAddr::zero(),
            hnext: NIL,
            prev: NIL,
            next: NIL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub sync_calls: u64,
    pub total_bufs: u32,
    pub used_bufs: u32,
    pub dirty_bufs: u32,
}

struct Cache {
    bufs: [Buf; MAX_BUFS],
    nbufs: usize,
    ht: [usize; 2 * MAX_BUFS + 1],
    ht_cap: usize,
    lru_head: usize,
    lru_tail: usize,
    stats: Stats,
    initialized: bool,
}

static CACHE: SpinLock<Cache> = SpinLock::new(Cache {
    bufs: [const { Buf::empty() }; MAX_BUFS],
    nbufs: 0,
    ht: [NIL; 2 * MAX_BUFS + 1],
    ht_cap: 0,
    lru_head: NIL,
    lru_tail: NIL,
    stats: Stats { hits: 0, misses: 0, evictions: 0, writebacks: 0, sync_calls: 0, total_bufs: 0, used_bufs: 0, dirty_bufs: 0 },
    initialized: false,
});

fn key_hash(dev: DevId, block_no: u64) -> u64 {
    let dev_mix = match dev {
        Some(p) => (p as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        None => 0,
    };
    let mut h = dev_mix ^ block_no;
    h = h.wrapping_mul(0xff51afd7ed558cc);
    h ^= h >> 33;
    h
}

impl Cache {
    fn lru_remove(&mut self, idx: usize) {
        let prev = self.bufs[idx].prev;
        let next = self.bufs[idx].next;
        if prev != NIL {
            self.bufs[prev].next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.bufs[next].prev = prev;
        } else {
            self.lru_tail = prev;
        }
        self.bufs[idx].prev = NIL;
        self.bufs[idx].next = NIL;
    }

    fn lru_push_front(&mut self, idx: usize) {
        self.bufs[idx].prev = NIL;
        self.bufs[idx].next = self.lru_head;
        if self.lru_head != NIL {
            self.bufs[self.lru_head].prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NIL {
            self.lru_tail = idx;
        }
    }

    fn lru_touch(&mut self, idx: usize) {
        if self.lru_head == idx {
            return;
        }
        self.lru_remove(idx);
        self.lru_push_front(idx);
    }

    fn ht_bucket(&self, dev: DevId, block_no: u64) -> usize {
        (key_hash(dev, block_no) % self.ht_cap as u64) as usize
    }

    fn ht_remove(&mut self, idx: usize) {
        let dev = self.bufs[idx].dev;
        let block_no = self.bufs[idx].block_no;
        let bucket = self.ht_bucket(dev, block_no);
        let mut cur = self.ht[bucket];
        if cur == idx {
            self.ht[bucket] = self.bufs[idx].hnext;
            self.bufs[idx].hnext = NIL;
            return;
        }
        while cur != NIL {
            let next = self.bufs[cur].hnext;
            if next == idx {
                self.bufs[cur].hnext = self.bufs[idx].hnext;
                self.bufs[idx].hnext = NIL;
                return;
            }
            cur = next;
        }
    }

    fn ht_insert(&mut self, idx: usize) {
        let dev = self.bufs[idx].dev;
        let block_no = self.bufs[idx].block_no;
        let bucket = self.ht_bucket(dev, block_no);
        self.bufs[idx].hnext = self.ht[bucket];
        self.ht[bucket] = idx;
    }

    fn ht_lookup(&self, dev: DevId, block_no: u64) -> Option<usize> {
        let bucket = self.ht_bucket(dev, block_no);
        let mut cur = self.ht[bucket];
        while cur != NIL {
            if self.bufs[cur].dev == dev && self.bufs[cur].block_no == block_no {
                return Some(cur);
            }
            cur = self.bufs[cur].hnext;
        }
        None
    }

    fn find_evictable(&self) -> Option<usize> {
        let mut cur = self.lru_tail;
        while cur != NIL {
            if self.bufs[cur].refcnt == 0 {
                return Some(cur);
            }
            cur = self.bufs[cur].prev;
        }
        None
    }
}

fn dev_read_block(dev: DevId, block_no: u64, data: &mut [u8]) -> Result<(), CacheError> {
    let lba = block_no * SECTORS_PER_BLOCK as u64;
    match dev {
        None => crate::drivers::ahci::read(lba, SECTORS_PER_BLOCK as u16, data).map_err(|e| {
            CacheError::Io(BlockError::Io(e))
        }),
        Some(part) => crate::drivers::block::partition_read(part, lba, SECTORS_PER_BLOCK as u32, data)
            .map_err(CacheError::from),
    }
}

fn dev_write_block(dev: DevId, block_no: u64, data: &[u8]) -> Result<(), CacheError> {
    let lba = block_no * SECTORS_PER_BLOCK as u64;
    match dev {
        None => crate::drivers::ahci::write(lba, SECTORS_PER_BLOCK as u16, data).map_err(|e| {
            CacheError::Io(BlockError::Io(e))
        }),
        Some(part) => crate::drivers::block::partition_write(part, lba, SECTORS_PER_BLOCK as u32, data)
            .map_err(CacheError::from),
    }
}

/// Allocates the buffer pool: one physical 4 KiB page per buffer, `num_bufs`
/// of them (0 picks the default of 128), and puts every buffer on the LRU
/// list unused.
pub fn init(num_bufs: usize) -> Result<(), CacheError> {
    let num_bufs = if num_bufs == 0 { DEFAULT_BUFS } else { num_bufs.min(MAX_BUFS) };

    let mut cache = CACHE.lock();
    assert!(!cache.initialized, "bcache: init called more than once");

    cache.ht_cap = 2 * num_bufs + 1;
    let ht_cap = cache.ht_cap;
    for slot in cache.ht.iter_mut().take(ht_cap) {
        *slot = NIL;
    }

    for i in 0..num_bufs {
        let phys = pmm::alloc_frame_zeroed().ok_or(CacheError::PoolExhausted)?;
        cache.bufs[i] = Buf { data_phys: phys, ..Buf::empty() };
        cache.lru_push_front(i);
    }

    cache.nbufs = num_bufs;
    cache.stats.total_bufs = num_bufs as u32;
    cache.initialized = true;

    debug!("[bcache] initialized with {} buffers ({} KiB)", num_bufs, num_bufs * BLOCK_SIZE / 1024);
    Ok(())
}

fn data_slice(cache: &Cache, idx: usize) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(cache.bufs[idx].data_phys.to_virt().as_ptr::<u8>(), BLOCK_SIZE) }
}

fn data_slice_mut(cache: &mut Cache, idx: usize) -> &'static mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(cache.bufs[idx].data_phys.to_virt().as_mut_ptr::<u8>(), BLOCK_SIZE) }
}

fn writeback_one(cache: &mut Cache, idx: usize) -> Result<(), CacheError> {
    if !cache.bufs[idx].dirty {
        return Ok(());
    }
    let dev = cache.bufs[idx].dev;
    let block_no = cache.bufs[idx].block_no;
    let data = data_slice(cache, idx);
    dev_write_block(dev, block_no, data)?;
    cache.bufs[idx].dirty = false;
    cache.stats.dirty_bufs -= 1;
    cache.stats.writebacks += 1;
    Ok(())
}

/// A pinned handle to a cached 4 KiB block. Drop via [`put`] to unpin.
pub struct Handle(usize);

/// Looks up (or loads) the block at `(dev, block_no)`, pinning it in the
/// cache. The caller must call [`put`] exactly once per successful `get`.
pub fn get(dev: DevId, block_no: u64) -> Result<Handle, CacheError> {
    let mut cache = CACHE.lock();
    if !cache.initialized {
        return Err(CacheError::NotInitialized);
    }

    if let Some(idx) = cache.ht_lookup(dev, block_no) {
        cache.stats.hits += 1;
        cache.bufs[idx].refcnt += 1;
        cache.lru_touch(idx);
        return Ok(Handle(idx));
    }

    cache.stats.misses += 1;
    let idx = cache.find_evictable().ok_or(CacheError::PoolExhausted)?;

    writeback_one(&mut cache, idx)?;
    if cache.bufs[idx].valid {
        cache.ht_remove(idx);
    }

    cache.bufs[idx].dev = dev;
    cache.bufs[idx].block_no = block_no;

    let data = data_slice_mut(&mut cache, idx);
    if let Err(e) = dev_read_block(dev, block_no, data) {
        // The slot was already unlinked from the hash table above and now
        // carries a new (dev, block_no) with stale or partial data — it
        // must not be left `valid`, or a later lookup could hand out a
        // buffer that was never actually filled for this key.
        cache.bufs[idx].valid = false;
        return Err(e);
    }

    // Track `used_bufs` exactly: only the first fill of a never-valid buffer
    // grows the used count. Re-filling an already-valid (just-evicted)
    // buffer doesn't change how many distinct buffers are in use.
    if !cache.bufs[idx].valid {
        cache.bufs[idx].valid = true;
        cache.stats.used_bufs += 1;
    }

    cache.ht_insert(idx);
    cache.bufs[idx].refcnt = 1;
    cache.lru_touch(idx);

    trace!("[bcache] miss dev={:?} block={} -> buf {}", dev, block_no, idx);
    Ok(Handle(idx))
}

/// Read-only access to a pinned buffer's 4 KiB of data.
pub fn data(handle: &Handle) -> &'static [u8] {
    let cache = CACHE.lock();
    data_slice(&cache, handle.0)
}

/// Mutable access to a pinned buffer's data. Caller must call
/// [`mark_dirty`] after writing through this if the change should survive a
/// future eviction.
pub fn data_mut(handle: &Handle) -> &'static mut [u8] {
    let mut cache = CACHE.lock();
    data_slice_mut(&mut cache, handle.0)
}

pub fn mark_dirty(handle: &Handle) {
    let mut cache = CACHE.lock();
    let idx = handle.0;
    if !cache.bufs[idx].dirty {
        cache.bufs[idx].dirty = true;
        cache.stats.dirty_bufs += 1;
    }
}

/// Unpins a buffer obtained from [`get`]. The buffer stays resident until
/// evicted by a later miss.
pub fn put(handle: Handle) {
    let mut cache = CACHE.lock();
    let idx = handle.0;
    if cache.bufs[idx].refcnt > 0 {
        cache.bufs[idx].refcnt -= 1;
    }
}

/// Writes back every dirty buffer belonging to `dev`, then flushes `dev`.
pub fn sync_dev(dev: DevId) -> Result<(), CacheError> {
    let mut cache = CACHE.lock();
    cache.stats.sync_calls += 1;
    for idx in 0..cache.nbufs {
        if cache.bufs[idx].valid && cache.bufs[idx].dev == dev && cache.bufs[idx].dirty {
            writeback_one(&mut cache, idx)?;
        }
    }
    drop(cache);

    match dev {
        None => crate::drivers::ahci::flush().map_err(|e| CacheError::Io(BlockError::Io(e))),
        Some(_) => crate::drivers::block::boot_device_flush_all().map_err(CacheError::from),
    }
}

/// Writes back every dirty buffer across every device, then flushes the
/// boot device.
pub fn sync_all() -> Result<(), CacheError> {
    let mut cache = CACHE.lock();
    cache.stats.sync_calls += 1;
    for idx in 0..cache.nbufs {
        if cache.bufs[idx].valid && cache.bufs[idx].dirty {
            writeback_one(&mut cache, idx)?;
        }
    }
    drop(cache);
    crate::drivers::block::boot_device_flush_all().map_err(CacheError::from)
}

pub fn stats() -> Stats {
    CACHE.lock().stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_cache(num_bufs: usize) -> Cache {
        let mut cache = Cache {
            bufs: [const { Buf::empty() }; MAX_BUFS],
            nbufs: 0,
            ht: [NIL; 2 * MAX_BUFS + 1],
            ht_cap: 2 * num_bufs + 1,
            lru_head: NIL,
            lru_tail: NIL,
            stats: Stats::default(),
            initialized: true,
        };
        for i in 0..num_bufs {
            cache.bufs[i] = Buf::empty();
            cache.lru_push_front(i);
        }
        cache.nbufs = num_bufs;
        cache
    }

    #[test]
    fn lru_touch_moves_to_front() {
        let mut cache = fresh_cache(4);
        cache.lru_touch(2);
        assert_eq!(cache.lru_head, 2);
        cache.lru_touch(0);
        assert_eq!(cache.lru_head, 0);
    }

    #[test]
    fn find_evictable_skips_pinned_from_tail() {
        let mut cache = fresh_cache(3);
        // LRU order after construction: 2 (front) -> 1 -> 0 (tail).
        cache.bufs[0].refcnt = 1;
        let victim = cache.find_evictable().unwrap();
        assert_eq!(victim, 1);
    }

    #[test]
    fn ht_insert_and_lookup_roundtrip() {
        let mut cache = fresh_cache(4);
        cache.bufs[1].dev = Some(0);
        cache.bufs[1].block_no = 42;
        cache.ht_insert(1);
        assert_eq!(cache.ht_lookup(Some(0), 42), Some(1));
        assert_eq!(cache.ht_lookup(Some(0), 43), None);
    }

    #[test]
    fn ht_remove_unlinks_from_chain() {
        let mut cache = fresh_cache(4);
        cache.bufs[0].dev = Some(0);
        cache.bufs[0].block_no = 1;
        cache.bufs[1].dev = Some(0);
        cache.bufs[1].block_no = 1;
        cache.ht_insert(0);
        cache.ht_insert(1);
        cache.ht_remove(1);
        assert_eq!(cache.ht_lookup(Some(0), 1), Some(0));
        cache.ht_remove(0);
        assert_eq!(cache.ht_lookup(Some(0), 1), None);
    }
}
