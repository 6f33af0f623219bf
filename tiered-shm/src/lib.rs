//! An object store over two shared memory tiers.
//!
//! Objects are byte blobs keyed by a `u64`. Each is placed either on a [`LocalSegment`], a small
//! segment file on a RAM-resident filesystem, or on [`PooledMemory`], a large memory pool with
//! higher access latency. A [`TieredStore`] picks one of them on every call, by reading the
//! current [`Watermark`] that some external monitor keeps up to date.
//!
//! ```no_run
//! use tiered_shm::{Level, LocalSegmentOptions, PoolOptions, StoreConfig, TieredStore, Watermark};
//!
//! let watermark = Watermark::new(Level::Low);
//! let config = StoreConfig {
//!     local: LocalSegmentOptions::new("/dev/shm", "secret"),
//!     pool: PoolOptions::default(),
//! };
//!
//! let store = TieredStore::open(&config, watermark.clone())?;
//! store.put(123, b"Hello, World!")?;
//!
//! let view = store.get(123)?;
//! assert_eq!(unsafe { view.as_slice() }, b"Hello, World!");
//! store.release(view.as_ptr())?;
//! # Ok::<_, tiered_shm::TierError>(())
//! ```
//!
//! ## Sharing between processes
//!
//! The record table of each tier lives inside its mapping. Processes opening the same local
//! segment with the same secret, or the pool with the same id, see the same objects. A pool can
//! also be handed down to a child with [`PooledMemory::share_with`]. Views returned by `get`
//! point directly into the mapping; the store owns that memory and a view is only meaningful
//! until its object is released.
//!
//! The regions are not durable. Nothing here survives a reboot of the machine.
#[cfg(test)]
mod tests;

mod error;
mod listenfd;
mod local;
mod pooled;
mod region;
mod store;
mod tier;
mod watermark;

extern crate alloc;

pub use error::{OpenError, TierError};
pub use local::{LocalSegment, LocalSegmentOptions};
pub use pooled::{PoolOptions, PooledMemory};
pub use store::{StoreConfig, TieredStore};
pub use tier::{Backing, ObjectId, ObjectView, Tier, TierStats};
pub use watermark::{Level, PressureSource, Watermark};
