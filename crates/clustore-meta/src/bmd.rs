//! Bucket metadata.
//!
//! The BMD is the bucket-name-to-properties snapshot, versioned
//! independently of the Smap and carrying its own UUID. Structural changes
//! (bucket create, destroy, props update) advance the version; the
//! properties themselves are just knobs consumed by the data path, which
//! is outside this repository.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clustore_core::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::VersionedMeta;

/// Backend provider of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provider {
    /// Native bucket.
    Ais,
    /// Amazon S3 backend.
    Aws,
    /// Google Cloud Storage backend.
    Gcp,
    /// Azure Blob backend.
    Azure,
}

impl Provider {
    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ais => "ais",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ais" => Ok(Self::Ais),
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            other => Err(Error::InvalidRequest(format!("unknown provider '{other}'"))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bucket key: provider plus name.
///
/// Serializes as the string `provider/name` so it can key a JSON map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bck {
    /// Backend provider.
    pub provider: Provider,
    /// Bucket name, unique within its provider.
    pub name: String,
}

impl Bck {
    /// Creates a native bucket key.
    #[must_use]
    pub fn ais(name: impl Into<String>) -> Self {
        Self { provider: Provider::Ais, name: name.into() }
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

impl FromStr for Bck {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (provider, name) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidRequest(format!("bucket key '{s}' missing provider")))?;
        if name.is_empty() {
            return Err(Error::InvalidRequest(format!("bucket key '{s}' missing name")));
        }
        Ok(Self { provider: provider.parse()?, name: name.to_string() })
    }
}

impl Serialize for Bck {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bck {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Checksum algorithm configured per bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    /// xxhash, the default.
    #[default]
    XxHash,
    /// MD5, for S3 interop.
    Md5,
    /// SHA-256.
    Sha256,
    /// Checksumming disabled.
    None,
}

/// Per-bucket configuration knobs consumed by the data path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketProps {
    /// N-way mirroring.
    pub mirror: MirrorProps,
    /// Erasure coding.
    pub ec: EcProps,
    /// Object checksum algorithm.
    pub checksum: ChecksumType,
    /// Object versioning.
    pub versioning: VersioningProps,
}

/// Mirroring knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorProps {
    /// Enabled flag.
    pub enabled: bool,
    /// Number of copies when enabled.
    pub copies: u8,
}

/// Erasure-coding knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcProps {
    /// Enabled flag.
    pub enabled: bool,
    /// Data slices.
    pub data_slices: u8,
    /// Parity slices.
    pub parity_slices: u8,
}

/// Versioning knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningProps {
    /// Enabled flag.
    pub enabled: bool,
}

/// Versioned snapshot of all bucket definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bmd {
    /// Monotonic version, advancing on any structural change.
    pub version: i64,
    /// Cluster-lifetime identifier, distinct from the Smap UUID.
    pub uuid: String,
    /// Bucket descriptors keyed by `(provider, name)`.
    pub buckets: BTreeMap<Bck, BucketProps>,
}

impl Bmd {
    /// The empty, version-0 BMD.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the version-0 BMD, which is never merged or propagated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.version == 0
    }

    /// Looks up bucket properties.
    #[must_use]
    pub fn props(&self, bck: &Bck) -> Option<&BucketProps> {
        self.buckets.get(bck)
    }

    /// Adds a bucket.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRequest` if the bucket already exists.
    pub fn add_bucket(&mut self, bck: Bck, props: BucketProps) -> Result<()> {
        if self.buckets.contains_key(&bck) {
            return Err(Error::InvalidRequest(format!("bucket {bck} already exists")));
        }
        self.buckets.insert(bck, props);
        Ok(())
    }

    /// Removes a bucket, returning its properties if present.
    pub fn del_bucket(&mut self, bck: &Bck) -> Option<BucketProps> {
        self.buckets.remove(bck)
    }
}

impl VersionedMeta for Bmd {
    const TAG: &'static str = "bmd";

    fn version(&self) -> i64 {
        self.version
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if self.uuid.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "bmd v{} committed without a cluster UUID",
                self.version
            )));
        }
        for (bck, props) in &self.buckets {
            if props.mirror.enabled && props.mirror.copies < 2 {
                return Err(Error::InvalidRequest(format!(
                    "bucket {bck}: mirroring enabled with {} copies",
                    props.mirror.copies
                )));
            }
            if props.ec.enabled && (props.ec.data_slices == 0 || props.ec.parity_slices == 0) {
                return Err(Error::InvalidRequest(format!(
                    "bucket {bck}: EC enabled with {}d/{}p slices",
                    props.ec.data_slices, props.ec.parity_slices
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bck_string_round_trip() {
        let bck = Bck::ais("training-data");
        assert_eq!(bck.to_string(), "ais/training-data");
        assert_eq!("ais/training-data".parse::<Bck>().unwrap(), bck);

        assert!("nodash".parse::<Bck>().is_err());
        assert!("ais/".parse::<Bck>().is_err());
        assert!("s3magic/b".parse::<Bck>().is_err());
    }

    #[test]
    fn test_bmd_json_uses_string_keys() {
        let mut bmd = Bmd { version: 1, uuid: "u-2".into(), ..Bmd::new() };
        bmd.add_bucket(Bck::ais("b1"), BucketProps::default()).unwrap();

        let json = serde_json::to_string(&bmd).unwrap();
        assert!(json.contains("\"ais/b1\""));

        let back: Bmd = serde_json::from_str(&json).unwrap();
        assert!(back.props(&Bck::ais("b1")).is_some());
    }

    #[test]
    fn test_add_bucket_rejects_duplicate() {
        let mut bmd = Bmd { version: 1, uuid: "u-2".into(), ..Bmd::new() };
        bmd.add_bucket(Bck::ais("b1"), BucketProps::default()).unwrap();
        assert!(bmd.add_bucket(Bck::ais("b1"), BucketProps::default()).is_err());
        assert!(bmd.del_bucket(&Bck::ais("b1")).is_some());
        assert!(bmd.del_bucket(&Bck::ais("b1")).is_none());
    }

    #[test]
    fn test_validate_props() {
        let mut bmd = Bmd { version: 1, uuid: "u-2".into(), ..Bmd::new() };
        let props = BucketProps {
            mirror: MirrorProps { enabled: true, copies: 1 },
            ..BucketProps::default()
        };
        bmd.add_bucket(Bck::ais("bad"), props).unwrap();
        assert!(bmd.validate().is_err());

        bmd.buckets.get_mut(&Bck::ais("bad")).unwrap().mirror.copies = 3;
        assert!(bmd.validate().is_ok());
    }
}
