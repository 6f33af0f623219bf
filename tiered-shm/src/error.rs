use crate::{ObjectId, Tier};

/// Errors of the object-store operations.
///
/// Every variant names the tier that produced it. The router passes these through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum TierError {
    /// `put` of an id that already has a live record in this tier.
    #[error("object {id} already has a live record in the {tier} tier")]
    DuplicateId { id: ObjectId, tier: Tier },
    /// No live record for the id in this tier.
    #[error("object {id} has no live record in the {tier} tier")]
    NotFound { id: ObjectId, tier: Tier },
    /// No contiguous free extent, or no free record slot, for the requested size.
    #[error("{requested} bytes do not fit into the {tier} tier")]
    CapacityExceeded { requested: usize, tier: Tier },
    /// `release` of an address that is not the start of a live record of this tier.
    #[error("address {addr:#x} is not a live object of the {tier} tier")]
    InvalidPointer { addr: usize, tier: Tier },
    /// Another process kept the region locked for too long.
    #[error("the {tier} tier stayed locked by another process")]
    Busy { tier: Tier },
    /// The backing region could not be mapped or attached. The tier is unusable.
    #[error("failed to open the {tier} tier")]
    TierOpenFailure {
        tier: Tier,
        #[source]
        source: OpenError,
    },
}

/// The reason a backing region failed to open.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The requested capacity and record count can not be laid out in the address space.
    #[error("a region of {capacity} bytes with {slots} records is not representable")]
    BadLayout { capacity: usize, slots: usize },
    /// The region exists but was formatted with another layout or by another program.
    #[error("the region was formatted with a different layout")]
    LayoutMismatch,
    /// The access secret does not match the one the region was created with.
    #[error("the access secret does not match the region")]
    AccessDenied,
    /// Another process kept the region locked while we waited to format or verify it.
    #[error("the region stayed locked by another process")]
    Busy,
    /// Inherited descriptors were announced but the environment is malformed.
    #[error("malformed inherited descriptor environment: {0}")]
    Environment(&'static str),
}

impl OpenError {
    pub(crate) fn at(self, tier: Tier) -> TierError {
        TierError::TierOpenFailure { tier, source: self }
    }
}
