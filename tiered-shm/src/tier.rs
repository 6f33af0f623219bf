//! The capability every memory tier offers to the router.
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::TierError;

/// Caller-chosen key of an object. Only unique within one tier.
pub type ObjectId = u64;

/// The physical tiers an object can be placed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Segment file on a RAM-resident filesystem. Small, fastest access.
    LocalSegment,
    /// Large byte-addressable memory pool with higher access latency.
    PooledMemory,
}

/// A snapshot of the occupancy of one tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Live records.
    pub objects: usize,
    /// Bytes claimed by live extents, including alignment padding.
    pub used: usize,
    /// Size of the data area.
    pub capacity: usize,
}

/// Uniform `put`/`get`/`release` contract over a backing region.
///
/// Implementations own their mapping exclusively; objects are views into it. The two tiers of
/// this crate are the only implementors the router knows about.
pub trait Backing {
    /// Which tier this store represents.
    fn tier(&self) -> Tier;

    /// Copy `data` into the region and record it under `id`.
    fn put(&self, id: ObjectId, data: &[u8]) -> Result<(), TierError>;

    /// Look up the live record of `id`.
    fn get(&self, id: ObjectId) -> Result<ObjectView<'_>, TierError>;

    /// Free the extent whose first byte is `ptr`, as returned by [`ObjectView::as_ptr`].
    fn release(&self, ptr: *const u8) -> Result<(), TierError>;

    /// Whether `ptr` points into the data area of this tier.
    fn contains(&self, ptr: *const u8) -> bool;

    fn stats(&self) -> TierStats;
}

/// A borrowed, non-owning view of an object's bytes inside a tier.
///
/// The store owns the memory. The view can not outlive the store, and it additionally becomes
/// dangling, in the sense of referring to memory that may be reused, once the object is released.
#[derive(Debug)]
pub struct ObjectView<'store> {
    ptr: NonNull<u8>,
    len: usize,
    tier: Tier,
    region: PhantomData<&'store [u8]>,
}

impl<'store> ObjectView<'store> {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, tier: Tier) -> Self {
        ObjectView {
            ptr,
            len,
            tier,
            region: PhantomData,
        }
    }

    /// The address of the first byte. Pass this to `release`.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// The stored size, exactly the length passed to `put`.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The tier that served this object.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Borrow the stored bytes.
    ///
    /// # Safety
    ///
    /// The object must not be released, by this or any other process attached to the same
    /// region, while the returned slice is alive. Other attached processes must not write to the
    /// extent either.
    pub unsafe fn as_slice(&self) -> &'store [u8] {
        core::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Tier::LocalSegment => f.write_str("local segment"),
            Tier::PooledMemory => f.write_str("pooled memory"),
        }
    }
}
