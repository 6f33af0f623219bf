//! The large, slower tier: a shared memory pool identified by an integer id.
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::process::Command;

use memmap2::MmapOptions;

use crate::region::{derive_digest, Layout, Region};
use crate::{listenfd, Backing, ObjectId, ObjectView, OpenError, Tier, TierError, TierStats};

/// Parameters to attach to, or create, a memory pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Bytes available to objects.
    pub capacity: usize,
    /// Processes using the same id share one pool.
    pub pool_id: u32,
    /// Length of the record table, i.e. the maximum number of live objects.
    pub max_objects: usize,
}

/// A backing store over a region of a shared memory pool.
///
/// The pool is the POSIX shared memory object [`PooledMemory::shm_name`] of its id, created by
/// the first opener. A process that inherited the descriptor of a pool, see
/// [`PooledMemory::share_with`], uses that descriptor instead of looking up the name.
///
/// The object outlives all handles so that unrelated processes can meet in it. Remove it with
/// [`PooledMemory::remove`].
pub struct PooledMemory {
    region: Region,
    file: File,
    inherited: bool,
    pool_id: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            capacity: 1 << 30,
            pool_id: 12345,
            max_objects: 1 << 16,
        }
    }
}

impl PooledMemory {
    pub fn open(options: &PoolOptions) -> Result<Self, TierError> {
        Self::open_inner(options).map_err(|err| {
            tracing::warn!(pool_id = options.pool_id, %err, "failed to open pooled memory");
            err.at(Tier::PooledMemory)
        })
    }

    fn open_inner(options: &PoolOptions) -> Result<Self, OpenError> {
        let layout = Layout::new(options.capacity, options.max_objects)?;
        let total = layout.total_len() as u64;
        let name = Self::fd_name(options.pool_id);

        let (file, inherited) = match listenfd::inherited(&name)? {
            Some(file) => (file, true),
            None => (Self::open_named(options.pool_id)?, false),
        };

        // Never shrink, the other side may have mapped more than we need.
        if file.metadata()?.len() < total {
            file.set_len(total)?;
        }

        let map = MmapOptions::new()
            .len(layout.total_len())
            .map_raw(file.as_raw_fd())?;

        let digest = derive_digest(
            "tiered-shm pooled memory 2024-05 pool id",
            &options.pool_id.to_le_bytes(),
        );
        let region = Region::attach(map, layout, Tier::PooledMemory, &digest)?;

        tracing::info!(
            pool_id = options.pool_id,
            capacity = layout.capacity(),
            inherited,
            "opened pooled memory",
        );

        Ok(PooledMemory {
            region,
            file,
            inherited,
            pool_id: options.pool_id,
        })
    }

    fn open_named(pool_id: u32) -> Result<File, OpenError> {
        let name = CString::new(Self::shm_name(pool_id)).map_err(io::Error::from)?;
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o600) };

        if fd == -1 {
            return Err(OpenError::Io(io::Error::last_os_error()));
        }

        // Safety: a fresh descriptor, owned by nothing else.
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    /// The name of the shared memory object backing the pool `pool_id`.
    pub fn shm_name(pool_id: u32) -> String {
        format!("/tiered-shm-pool-{pool_id}")
    }

    /// Unlink the shared memory object of `pool_id`.
    ///
    /// Open handles keep their mapping, the next opener creates a new pool.
    pub fn remove(pool_id: u32) -> io::Result<()> {
        let name = CString::new(Self::shm_name(pool_id))?;

        if -1 == unsafe { libc::shm_unlink(name.as_ptr()) } {
            return Err(io::Error::last_os_error());
        }

        tracing::debug!(pool_id, "removed pool");
        Ok(())
    }

    /// The name under which a pool descriptor is passed between processes.
    pub fn fd_name(pool_id: u32) -> String {
        format!("TIER_POOL_{pool_id}")
    }

    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Whether this handle attached to a pool inherited from a parent process.
    pub fn is_attached(&self) -> bool {
        self.inherited
    }

    /// Pass this pool to the process spawned from `cmd`.
    ///
    /// The child attaches to it by opening a [`PooledMemory`] with the same pool id.
    ///
    /// # Safety
    ///
    /// The command must be spawned, or exec'd, while `self` is still alive.
    pub unsafe fn share_with(&self, cmd: &mut Command) {
        listenfd::share(cmd, &Self::fd_name(self.pool_id), self.file.as_raw_fd());
    }
}

impl Backing for PooledMemory {
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
