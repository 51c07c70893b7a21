//! Versioned cluster metadata and its owners.
//!
//! Two metadata objects drive everything in the cluster: the cluster map
//! ([`Smap`]) and the bucket metadata ([`Bmd`]). Both are immutable
//! snapshots tagged with a monotonic version and a cluster-lifetime UUID,
//! held by per-node [`Owner`]s that serialize writes, persist each accepted
//! snapshot to mountpath copies, and notify listeners after every swap.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bmd;
pub mod owner;
pub mod persist;
pub mod smap;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use bmd::{Bck, Bmd, BucketProps, ChecksumType, EcProps, MirrorProps, Provider, VersioningProps};
pub use owner::{BmdOwner, Owner, SmapOwner};
pub use persist::MetaStore;
pub use smap::Smap;

/// Capability set shared by Smap and BMD: a version, a cluster-lifetime
/// UUID, and self-validation. The owner and the persistence layer are
/// generic over this shape.
pub trait VersionedMeta:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Short tag used in persisted file names and error messages.
    const TAG: &'static str;

    /// Monotonic version; 0 means "no metadata yet".
    fn version(&self) -> i64;

    /// Cluster-lifetime UUID; empty on a version-0 object.
    fn uuid(&self) -> &str;

    /// Checks internal invariants of a committed snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRequest` describing the violated invariant.
    fn validate(&self) -> clustore_core::Result<()>;
}
