//! The router placing objects on a tier by the current watermark.
use crate::{
    Backing, Level, LocalSegment, LocalSegmentOptions, ObjectId, ObjectView, PoolOptions,
    PooledMemory, PressureSource, TierError, Watermark,
};

/// Options for both tiers of a [`TieredStore`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub local: LocalSegmentOptions,
    pub pool: PoolOptions,
}

/// An object store over a local segment and a memory pool.
///
/// Each call reads the watermark once and uses the local segment on [`Level::Low`], the pool
/// otherwise. Nothing remembers where an object was put: a `get` or `release` under a different
/// level than the matching `put` looks into the other tier and fails with
/// [`TierError::NotFound`] or [`TierError::InvalidPointer`]. Errors of a tier are returned as is,
/// there is no fallback to the other tier.
pub struct TieredStore<W = Watermark> {
    local: LocalSegment,
    pooled: PooledMemory,
    watermark: W,
}

impl<W: PressureSource> TieredStore<W> {
    /// Open both tiers.
    pub fn open(config: &StoreConfig, watermark: W) -> Result<Self, TierError> {
        let local = LocalSegment::open(&config.local)?;
        let pooled = PooledMemory::open(&config.pool)?;
        Ok(Self::from_tiers(local, pooled, watermark))
    }

    pub fn from_tiers(local: LocalSegment, pooled: PooledMemory, watermark: W) -> Self {
        TieredStore {
            local,
            pooled,
            watermark,
        }
    }

    /// Copy `data` into the tier selected right now.
    pub fn put(&self, id: ObjectId, data: &[u8]) -> Result<(), TierError> {
        self.select().put(id, data)
    }

    /// Find `id` in the tier selected right now.
    pub fn get(&self, id: ObjectId) -> Result<ObjectView<'_>, TierError> {
        self.select().get(id)
    }

    /// Release the object starting at `ptr` in the tier selected right now.
    pub fn release(&self, ptr: *const u8) -> Result<(), TierError> {
        self.select().release(ptr)
    }

    pub fn local(&self) -> &LocalSegment {
        &self.local
    }

    pub fn pooled(&self) -> &PooledMemory {
        &self.pooled
    }

    pub fn watermark(&self) -> &W {
        &self.watermark
    }

    fn select(&self) -> &dyn Backing {
        let level = self.watermark.current_level();
        let tier: &dyn Backing = match level {
            Level::Low => &self.local,
            Level::High => &self.pooled,
        };

        tracing::trace!(%level, tier = %tier.tier(), "selected tier");
        tier
    }
}
