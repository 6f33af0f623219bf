//! The mapped byte layout shared by both tiers.
//!
//! ```text
//! | head page (4096) | record slots (32 * n) | pad to 64 | data area (capacity) |
//! ```
//!
//! All bookkeeping lives inside the mapping as atomics, so every process attached to the same
//! file observes the same records. Mutations (`put`, `release`) and formatting serialize on the
//! lock word in the head page, which holds the pid of its holder. Lookups never take the lock,
//! they validate each slot by its mark instead.
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use memmap2::MmapRaw;

use crate::{ObjectId, ObjectView, OpenError, Tier, TierError, TierStats};

/// A 256-bit fingerprint of whatever grants access to a region.
pub(crate) type Digest = [u64; 4];

pub(crate) struct Region {
    /// Kept for the whole lifetime of the region. All references handed out by the accessors
    /// below borrow `self` and thus this mapping.
    map: MmapRaw,
    layout: Layout,
    tier: Tier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    slots: usize,
    data_offset: usize,
    capacity: usize,
}

#[repr(C)]
struct HeadPage {
    magic: AtomicU64,
    version: AtomicU32,
    /// One of `UNINIT`, `INITIALIZING`, `READY`.
    state: AtomicU32,
    /// Pid of the process modifying the slot table or the data extents, zero when unlocked.
    lock: AtomicU32,
    _reserved: AtomicU32,
    slots: AtomicU64,
    capacity: AtomicU64,
    digest: [AtomicU64; 4],
}

/// Do not change without bumping `Region::VERSION`.
#[repr(C)]
struct Slot {
    /// Generation of this slot, the lowest bit is set while a record is live.
    ///
    /// Every transition increments the mark. The fields are only written while the mark is even,
    /// so a reader that finds the same odd mark before and after reading them saw one record.
    mark: AtomicU64,
    id: AtomicU64,
    offset: AtomicU64,
    len: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Record {
    pub(crate) id: ObjectId,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

#[derive(Clone, Copy, Debug)]
struct Extent {
    offset: usize,
    len: usize,
}

struct RegionLock<'lt> {
    word: &'lt AtomicU32,
}

const UNINIT: u32 = 0;
const INITIALIZING: u32 = 1;
const READY: u32 = 2;

impl Layout {
    pub(crate) const HEAD_SZ: usize = 4096;
    const DATA_ALIGN: usize = 64;
    pub(crate) const EXTENT_ALIGN: usize = 8;

    pub(crate) fn new(capacity: usize, slots: usize) -> Result<Self, OpenError> {
        let bad = || OpenError::BadLayout { capacity, slots };

        if slots == 0 {
            return Err(bad());
        }

        // Extents are aligned, a tail shorter than the alignment could never be claimed.
        let capacity = capacity
            .checked_next_multiple_of(Self::EXTENT_ALIGN)
            .ok_or_else(bad)?;

        let table = slots
            .checked_mul(core::mem::size_of::<Slot>())
            .ok_or_else(bad)?;
        let data_offset = Self::HEAD_SZ
            .checked_add(table)
            .and_then(|end| end.checked_next_multiple_of(Self::DATA_ALIGN))
            .ok_or_else(bad)?;

        // Pointer arithmetic within the mapping must stay below `isize::MAX`.
        data_offset
            .checked_add(capacity)
            .filter(|&total| total <= isize::MAX as usize)
            .ok_or_else(bad)?;

        Ok(Layout {
            slots,
            data_offset,
            capacity,
        })
    }

    /// Bytes the backing file must have.
    pub(crate) fn total_len(&self) -> usize {
        self.data_offset + self.capacity
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Region {
    const MAGIC: u64 = u64::from_le_bytes(*b"TIERSHM\0");
    const VERSION: u32 = 1;
    const LOCK_TIMEOUT: Duration = Duration::from_secs(1);
    const SPIN_LIMIT: u32 = 128;

    /// Take over a mapping, formatting it when we are the first opener.
    ///
    /// A region formatted by an earlier opener must agree on layout and digest.
    pub(crate) fn attach(
        map: MmapRaw,
        layout: Layout,
        tier: Tier,
        digest: &Digest,
    ) -> Result<Self, OpenError> {
        if map.len() < layout.total_len() {
            return Err(OpenError::LayoutMismatch);
        }

        let region = Region { map, layout, tier };
        region.format_or_verify(digest)?;
        Ok(region)
    }

    fn format_or_verify(&self, digest: &Digest) -> Result<(), OpenError> {
        let head = self.head();
        let _guard = self.lock().ok_or(OpenError::Busy)?;

        match head.state.load(Ordering::Acquire) {
            READY => return self.verify(digest),
            // A formatter that died half way leaves `INITIALIZING`, start over.
            UNINIT | INITIALIZING => {}
            _ => return Err(OpenError::LayoutMismatch),
        }

        head.state.store(INITIALIZING, Ordering::Relaxed);
        head.magic.store(Self::MAGIC, Ordering::Relaxed);
        head.version.store(Self::VERSION, Ordering::Relaxed);
        head.slots.store(self.layout.slots as u64, Ordering::Relaxed);
        head.capacity.store(self.layout.capacity as u64, Ordering::Relaxed);

        for (word, &value) in head.digest.iter().zip(digest) {
            word.store(value, Ordering::Relaxed);
        }

        head.state.store(READY, Ordering::Release);
        tracing::debug!(tier = %self.tier, capacity = self.layout.capacity, "formatted region");
        Ok(())
    }

    fn verify(&self, digest: &Digest) -> Result<(), OpenError> {
        let head = self.head();

        if head.magic.load(Ordering::Relaxed) != Self::MAGIC
            || head.version.load(Ordering::Relaxed) != Self::VERSION
            || head.slots.load(Ordering::Relaxed) != self.layout.slots as u64
            || head.capacity.load(Ordering::Relaxed) != self.layout.capacity as u64
        {
            return Err(OpenError::LayoutMismatch);
        }

        // Compare every word, no early exit on the first difference.
        let difference = head
            .digest
            .iter()
            .zip(digest)
            .fold(0, |acc, (word, &value)| acc | (word.load(Ordering::Relaxed) ^ value));

        if difference != 0 {
            return Err(OpenError::AccessDenied);
        }

        Ok(())
    }

    pub(crate) fn tier(&self) -> Tier {
        self.tier
    }

    pub(crate) fn put(&self, id: ObjectId, data: &[u8]) -> Result<(), TierError> {
        let capacity_exceeded = || TierError::CapacityExceeded {
            requested: data.len(),
            tier: self.tier,
        };

        let need = extent_len(data.len()).ok_or_else(capacity_exceeded)?;

        let _guard = self.lock().ok_or(TierError::Busy { tier: self.tier })?;
        let slots = self.slots();

        let mut vacant = None;
        let mut live = Vec::new();

        for (index, slot) in slots.iter().enumerate() {
            if slot.mark.load(Ordering::Relaxed) & 1 == 0 {
                vacant.get_or_insert(index);
                continue;
            }

            if slot.id.load(Ordering::Relaxed) == id {
                return Err(TierError::DuplicateId { id, tier: self.tier });
            }

            let len = slot.len.load(Ordering::Relaxed) as usize;
            live.push(Extent {
                offset: slot.offset.load(Ordering::Relaxed) as usize,
                len: extent_len(len).unwrap_or(usize::MAX),
            });
        }

        let index = vacant.ok_or_else(capacity_exceeded)?;
        let offset =
            first_fit(&mut live, need, self.layout.capacity).ok_or_else(capacity_exceeded)?;

        // Safety: `first_fit` returns an extent of at least `need >= data.len()` bytes that is
        // within the data area and does not intersect any live record. We hold the lock, so no
        // other writer claims it concurrently.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.data().add(offset), data.len());
        }

        let slot = &slots[index];
        // Sequence the field writes after the increment that vacated this slot.
        fence(Ordering::Release);
        slot.id.store(id, Ordering::Relaxed);
        slot.offset.store(offset as u64, Ordering::Relaxed);
        slot.len.store(data.len() as u64, Ordering::Relaxed);
        slot.mark.fetch_add(1, Ordering::Release);

        tracing::debug!(tier = %self.tier, id, size = data.len(), offset, "stored object");
        Ok(())
    }

    pub(crate) fn get(&self, id: ObjectId) -> Result<ObjectView<'_>, TierError> {
        let record = self
            .slots()
            .iter()
            .find_map(|slot| self.record(slot).filter(|record| record.id == id))
            .ok_or(TierError::NotFound { id, tier: self.tier })?;

        // Safety: `record` validated the extent to be within the data area.
        let ptr = unsafe { NonNull::new_unchecked(self.data().add(record.offset)) };
        tracing::trace!(tier = %self.tier, id, offset = record.offset, "found object");
        Ok(ObjectView::new(ptr, record.len, self.tier))
    }

    pub(crate) fn release(&self, ptr: *const u8) -> Result<(), TierError> {
        let invalid = || TierError::InvalidPointer {
            addr: ptr as usize,
            tier: self.tier,
        };

        let offset = self.offset_of(ptr).ok_or_else(invalid)?;

        let _guard = self.lock().ok_or(TierError::Busy { tier: self.tier })?;
        let slot = self
            .slots()
            .iter()
            .find(|slot| {
                slot.mark.load(Ordering::Relaxed) & 1 == 1
                    && slot.offset.load(Ordering::Relaxed) == offset as u64
            })
            .ok_or_else(invalid)?;

        let id = slot.id.load(Ordering::Relaxed);
        slot.mark.fetch_add(1, Ordering::Release);

        tracing::debug!(tier = %self.tier, id, offset, "released object");
        Ok(())
    }

    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        self.offset_of(ptr).is_some()
    }

    pub(crate) fn stats(&self) -> TierStats {
        let (objects, used) = self
            .records()
            .fold((0, 0), |(objects, used), record| {
                (objects + 1, used + extent_len(record.len).unwrap_or(0))
            });

        TierStats {
            objects,
            used,
            capacity: self.layout.capacity,
        }
    }

    /// All records that are live at the time their slot is visited.
    pub(crate) fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.slots().iter().filter_map(move |slot| self.record(slot))
    }

    /// Read one consistent record from a slot, without locking.
    fn record(&self, slot: &Slot) -> Option<Record> {
        loop {
            let before = slot.mark.load(Ordering::Acquire);

            if before & 1 == 0 {
                return None;
            }

            let id = slot.id.load(Ordering::Relaxed);
            let offset = slot.offset.load(Ordering::Relaxed);
            let len = slot.len.load(Ordering::Relaxed);

            fence(Ordering::Acquire);
            if slot.mark.load(Ordering::Relaxed) != before {
                // Released or replaced while we were reading, look again.
                continue;
            }

            // Other processes write this table too, do not trust it blindly.
            let offset = usize::try_from(offset).ok()?;
            let len = usize::try_from(len).ok()?;
            let end = offset.checked_add(len)?;

            if end > self.layout.capacity {
                return None;
            }

            return Some(Record { id, offset, len });
        }
    }

    fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.data() as usize)?;
        (offset < self.layout.capacity).then_some(offset)
    }

    /// Take the lock word, or `None` when a live holder keeps it past `LOCK_TIMEOUT`.
    ///
    /// The lock of a process that exited is taken over. A record only becomes live or vacant by
    /// the final increment of its mark, whatever the holder did before dying is complete or
    /// invisible.
    fn lock(&self) -> Option<RegionLock<'_>> {
        let word = &self.head().lock;
        let owner = std::process::id();
        let deadline = Instant::now() + Self::LOCK_TIMEOUT;
        let mut spins = 0;

        loop {
            let acquired =
                word.compare_exchange_weak(0, owner, Ordering::Acquire, Ordering::Relaxed);
            let holder = match acquired {
                Ok(_) => return Some(RegionLock { word }),
                Err(holder) => holder,
            };

            if spins < Self::SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
                continue;
            }

            if holder != 0
                && !process_exists(holder)
                && word
                    .compare_exchange(holder, owner, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                tracing::warn!(tier = %self.tier, holder, "took over the lock of an exited holder");
                return Some(RegionLock { word });
            }

            if Instant::now() >= deadline {
                tracing::warn!(tier = %self.tier, holder, "timed out waiting for the region lock");
                return None;
            }

            std::thread::yield_now();
        }
    }

    fn head(&self) -> &HeadPage {
        // Safety: `attach` checked the mapping to be larger than the head page. The mapping is
        // page aligned and the page consists only of atomics, so sharing it with other processes
        // is fine. Fresh files are zero-filled which is a valid, unformatted head.
        unsafe { &*(self.map.as_ptr() as *const HeadPage) }
    }

    fn slots(&self) -> &[Slot] {
        // Safety: the slot table directly follows the head page and is in-bounds by `Layout`.
        // Slots are plain atomics, same as the head.
        unsafe {
            let table = self.map.as_ptr().add(Layout::HEAD_SZ) as *const Slot;
            &*core::ptr::slice_from_raw_parts(table, self.layout.slots)
        }
    }

    fn data(&self) -> *mut u8 {
        // Safety: `data_offset <= total_len <= map.len()`.
        unsafe { self.map.as_mut_ptr().add(self.layout.data_offset) }
    }
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };

    // Signal 0 only checks for existence. `EPERM` means it exists but belongs to someone else.
    (unsafe { libc::kill(pid, 0) == 0 })
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Fingerprint `material` for the head page, domain separated by `context`.
pub(crate) fn derive_digest(context: &str, material: &[u8]) -> Digest {
    let key = blake3::derive_key(context, material);
    let mut digest = [0; 4];

    for (word, chunk) in digest.iter_mut().zip(key.chunks_exact(8)) {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(chunk);
        *word = u64::from_le_bytes(bytes);
    }

    digest
}

/// The bytes an object of `len` bytes claims. Never zero, so every record starts at a distinct
/// address.
pub(crate) fn extent_len(len: usize) -> Option<usize> {
    len.max(1).checked_next_multiple_of(Layout::EXTENT_ALIGN)
}

/// Lowest offset with `need` free bytes between the `live` extents, if any.
fn first_fit(live: &mut [Extent], need: usize, capacity: usize) -> Option<usize> {
    live.sort_unstable_by_key(|extent| extent.offset);

    let mut cursor = 0usize;
    for extent in live.iter() {
        if extent.offset.saturating_sub(cursor) >= need {
            return Some(cursor);
        }

        cursor = cursor.max(extent.offset.saturating_add(extent.len));
    }

    (capacity.saturating_sub(cursor) >= need).then_some(cursor)
}
