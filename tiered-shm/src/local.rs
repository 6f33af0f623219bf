//! The small, fast tier: a segment file on a RAM-resident filesystem.
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;

use crate::region::{derive_digest, Layout, Region};
use crate::{Backing, ObjectId, ObjectView, OpenError, Tier, TierError, TierStats};

/// Parameters to open a local segment.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalSegmentOptions {
    /// Mount point of the RAM-resident filesystem, e.g. `/dev/shm`.
    pub mount: PathBuf,
    /// Every opener of the same segment must present the same secret.
    pub secret: String,
    /// File name of the segment below `mount`.
    pub segment: String,
    /// Bytes available to objects.
    pub capacity: usize,
    /// Length of the record table, i.e. the maximum number of live objects.
    pub max_objects: usize,
}

/// A backing store over a segment file mapped from a tmpfs.
pub struct LocalSegment {
    region: Region,
    path: PathBuf,
}

impl LocalSegmentOptions {
    pub const DEFAULT_SEGMENT: &'static str = "tiered-shm";

    pub fn new(mount: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        LocalSegmentOptions {
            mount: mount.into(),
            secret: secret.into(),
            segment: Self::DEFAULT_SEGMENT.to_owned(),
            capacity: 64 << 20,
            max_objects: 1 << 12,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.mount.join(&self.segment)
    }
}

impl LocalSegment {
    /// Open, and create if necessary, the segment.
    ///
    /// The first opener formats the segment and seals it with the secret. Later openers, in this
    /// or another process, must present the same secret and layout.
    pub fn open(options: &LocalSegmentOptions) -> Result<Self, TierError> {
        Self::open_inner(options).map_err(|err| {
            tracing::warn!(path = %options.path().display(), %err, "failed to open local segment");
            err.at(Tier::LocalSegment)
        })
    }

    fn open_inner(options: &LocalSegmentOptions) -> Result<Self, OpenError> {
        let layout = Layout::new(options.capacity, options.max_objects)?;
        let total = layout.total_len() as u64;
        let path = options.path();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&path)?;

        // Never shrink. A larger file with another layout is rejected by the head check.
        if file.metadata()?.len() < total {
            file.set_len(total)?;
        }

        let map = MmapOptions::new().len(layout.total_len()).map_raw(&file)?;

        let digest = derive_digest(
            "tiered-shm local segment 2024-05 access secret",
            options.secret.as_bytes(),
        );
        let region = Region::attach(map, layout, Tier::LocalSegment, &digest)?;

        tracing::info!(
            path = %path.display(),
            capacity = layout.capacity(),
            "opened local segment",
        );

        Ok(LocalSegment { region, path })
    }

    /// The segment file backing this tier.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backing for LocalSegment {
    fn tier(&self) -> Tier {
        self.region.tier()
    }

    fn put(&self, id: ObjectId, data: &[u8]) -> Result<(), TierError> {
        self.region.put(id, data)
    }

    fn get(&self, id: ObjectId) -> Result<ObjectView<'_>, TierError> {
        self.region.get(id)
    }

    fn release(&self, ptr: *const u8) -> Result<(), TierError> {
        self.region.release(ptr)
    }

    fn contains(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }

    fn stats(&self) -> TierStats {
        self.region.stats()
    }
}

impl core::fmt::Debug for LocalSegmentOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalSegmentOptions")
            .field("mount", &self.mount)
            .field("secret", &"..")
            .field("segment", &self.segment)
            .field("capacity", &self.capacity)
            .field("max_objects", &self.max_objects)
            .finish()
    }
}
