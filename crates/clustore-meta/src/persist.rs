//! Checksummed, multi-copy metadata persistence.
//!
//! Each accepted snapshot is written to up to N mountpaths (default 3) as
//! `{"checksum": <sha256 hex>, "payload": <snapshot>}` under the file name
//! `<tag>.<cluster-uuid>`. Loads scan every mountpath, drop copies whose
//! checksum does not validate, and pick the highest surviving version.
//! Divergent cluster UUIDs between valid copies are a fatal mountpath
//! inconsistency, as is a divergent daemon-ID marker.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use clustore_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::VersionedMeta;

/// File holding the daemon ID on each mountpath root.
const DAEMON_ID_FNAME: &str = ".clustore_daemon_id";

#[derive(Serialize, Deserialize)]
struct SignedWrapper {
    checksum: String,
    payload: serde_json::Value,
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Multi-copy persister for versioned metadata.
#[derive(Debug, Clone)]
pub struct MetaStore {
    mountpaths: Vec<PathBuf>,
    copies: usize,
}

impl MetaStore {
    /// Creates a store over `mountpaths`, writing up to `copies` copies
    /// per snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `mountpaths` is empty or `copies` is 0.
    pub fn new(mountpaths: Vec<PathBuf>, copies: usize) -> Result<Self> {
        if mountpaths.is_empty() {
            return Err(Error::Config("no mountpaths configured".into()));
        }
        if copies == 0 {
            return Err(Error::Config("metadata copies must be at least 1".into()));
        }
        Ok(Self { mountpaths, copies })
    }

    /// Persists `obj` to up to `copies` mountpaths.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if no mountpath accepted the write.
    pub fn save<T: VersionedMeta>(&self, obj: &T) -> Result<()> {
        let value = serde_json::to_value(obj)
            .map_err(|e| Error::Persistence(format!("encoding {}: {e}", T::TAG)))?;
        let payload = value.to_string();
        let wrapper = SignedWrapper { checksum: sha256_hex(payload.as_bytes()), payload: value };
        let encoded = serde_json::to_vec(&wrapper)
            .map_err(|e| Error::Persistence(format!("encoding {}: {e}", T::TAG)))?;

        let fname = format!("{}.{}", T::TAG, obj.uuid());
        let mut written = 0;
        for mpath in &self.mountpaths {
            if written == self.copies {
                break;
            }
            match write_atomic(mpath, &fname, &encoded) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(mountpath = %mpath.display(), error = %e, "metadata write failed");
                }
            }
        }
        if written == 0 {
            return Err(Error::Persistence(format!(
                "{} v{} not written to any of {} mountpaths",
                T::TAG,
                obj.version(),
                self.mountpaths.len()
            )));
        }
        Ok(())
    }

    /// Loads the highest-version valid copy, or `None` when no mountpath
    /// holds one.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClusterIdentity` when valid copies disagree on the
    /// cluster UUID.
    pub fn load<T: VersionedMeta>(&self) -> Result<Option<T>> {
        let mut best: Option<T> = None;
        for mpath in &self.mountpaths {
            let entries = match fs::read_dir(mpath) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(mountpath = %mpath.display(), error = %e, "mountpath unreadable");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.starts_with(&format!("{}.", T::TAG)) {
                    continue;
                }
                let path = entry.path();
                let obj = match read_signed::<T>(&path) {
                    Ok(obj) => obj,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "dropping invalid copy");
                        continue;
                    }
                };
                match &best {
                    Some(b) if b.uuid() != obj.uuid() => {
                        return Err(Error::ClusterIdentity {
                            expected: b.uuid().to_string(),
                            got: obj.uuid().to_string(),
                        });
                    }
                    Some(b) if b.version() >= obj.version() => {}
                    _ => best = Some(obj),
                }
            }
        }
        if best.is_none() {
            info!(tag = T::TAG, "no persisted copy on any of {} mountpaths", self.mountpaths.len());
        }
        Ok(best)
    }

    /// Writes the daemon-ID marker to every mountpath.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if no mountpath accepted the write.
    pub fn save_daemon_id(&self, id: &str) -> Result<()> {
        let mut written = 0;
        for mpath in &self.mountpaths {
            match write_atomic(mpath, DAEMON_ID_FNAME, id.as_bytes()) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(mountpath = %mpath.display(), error = %e, "daemon-ID write failed");
                }
            }
        }
        if written == 0 {
            return Err(Error::Persistence("daemon ID not written to any mountpath".into()));
        }
        Ok(())
    }

    /// Reads the daemon-ID marker, or `None` when no mountpath carries one.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClusterIdentity` when mountpaths disagree.
    pub fn load_daemon_id(&self) -> Result<Option<String>> {
        let mut found: Option<String> = None;
        for mpath in &self.mountpaths {
            let id = match fs::read_to_string(mpath.join(DAEMON_ID_FNAME)) {
                Ok(id) => id,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            let id = id.trim().to_string();
            if id.is_empty() {
                continue;
            }
            match &found {
                Some(have) if *have != id => {
                    return Err(Error::ClusterIdentity { expected: have.clone(), got: id });
                }
                Some(_) => {}
                None => found = Some(id),
            }
        }
        Ok(found)
    }
}

fn write_atomic(dir: &Path, fname: &str, data: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{fname}.tmp"));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, dir.join(fname))
}

fn read_signed<T: VersionedMeta>(path: &Path) -> Result<T> {
    let raw = fs::read(path)?;
    let wrapper: SignedWrapper = serde_json::from_slice(&raw)
        .map_err(|e| Error::InvalidRequest(format!("malformed wrapper: {e}")))?;
    let payload = wrapper.payload.to_string();
    if sha256_hex(payload.as_bytes()) != wrapper.checksum {
        return Err(Error::InvalidRequest("checksum mismatch".into()));
    }
    let obj: T = serde_json::from_value(wrapper.payload)
        .map_err(|e| Error::InvalidRequest(format!("malformed {}: {e}", T::TAG)))?;
    obj.validate()?;
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use clustore_core::{NetEndpoint, NodeRole, Snode};
    use tempfile::TempDir;

    use super::*;
    use crate::Smap;

    fn smap_v(version: i64, uuid: &str) -> Smap {
        let mut smap =
            Smap { version, uuid: uuid.into(), primary_id: "p1".into(), ..Smap::new() };
        smap.put_node(Snode::new("p1", NodeRole::Proxy, NetEndpoint::new("127.0.0.1", 8080)))
            .unwrap();
        smap
    }

    fn three_mountpaths(tmp: &TempDir) -> Vec<PathBuf> {
        (1..=3).map(|i| tmp.path().join(format!("mp{i}"))).collect()
    }

    #[test]
    fn test_save_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = MetaStore::new(three_mountpaths(&tmp), 3).unwrap();

        store.save(&smap_v(7, "u-1")).unwrap();
        let loaded: Smap = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.uuid, "u-1");

        // all three mountpaths hold a copy
        for mp in three_mountpaths(&tmp) {
            assert!(mp.join("smap.u-1").exists());
        }
    }

    #[test]
    fn test_load_picks_highest_valid_version() {
        let tmp = TempDir::new().unwrap();
        let mps = three_mountpaths(&tmp);

        // one copy per mountpath, different versions
        MetaStore::new(vec![mps[0].clone()], 1).unwrap().save(&smap_v(3, "u-1")).unwrap();
        MetaStore::new(vec![mps[1].clone()], 1).unwrap().save(&smap_v(9, "u-1")).unwrap();
        MetaStore::new(vec![mps[2].clone()], 1).unwrap().save(&smap_v(5, "u-1")).unwrap();

        let store = MetaStore::new(mps, 3).unwrap();
        let loaded: Smap = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, 9);
    }

    #[test]
    fn test_load_skips_corrupted_copy() {
        let tmp = TempDir::new().unwrap();
        let mps = three_mountpaths(&tmp);

        MetaStore::new(vec![mps[0].clone()], 1).unwrap().save(&smap_v(3, "u-1")).unwrap();
        MetaStore::new(vec![mps[1].clone()], 1).unwrap().save(&smap_v(9, "u-1")).unwrap();

        // corrupt the higher-version copy
        let victim = mps[1].join("smap.u-1");
        let mut raw = fs::read_to_string(&victim).unwrap();
        raw = raw.replacen("\"version\":9", "\"version\":99", 1);
        fs::write(&victim, raw).unwrap();

        let store = MetaStore::new(mps, 3).unwrap();
        let loaded: Smap = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, 3);
    }

    #[test]
    fn test_divergent_uuids_fatal() {
        let tmp = TempDir::new().unwrap();
        let mps = three_mountpaths(&tmp);

        MetaStore::new(vec![mps[0].clone()], 1).unwrap().save(&smap_v(3, "u-1")).unwrap();
        MetaStore::new(vec![mps[1].clone()], 1).unwrap().save(&smap_v(4, "u-2")).unwrap();

        let store = MetaStore::new(mps, 3).unwrap();
        let err = store.load::<Smap>().unwrap_err();
        assert!(matches!(err, Error::ClusterIdentity { .. }));
    }

    #[test]
    fn test_load_empty_mountpaths() {
        let tmp = TempDir::new().unwrap();
        let store = MetaStore::new(three_mountpaths(&tmp), 3).unwrap();
        assert!(store.load::<Smap>().unwrap().is_none());
    }

    #[test]
    fn test_daemon_id_round_trip_and_mismatch() {
        let tmp = TempDir::new().unwrap();
        let mps = three_mountpaths(&tmp);
        let store = MetaStore::new(mps.clone(), 3).unwrap();

        assert!(store.load_daemon_id().unwrap().is_none());
        store.save_daemon_id("p1").unwrap();
        assert_eq!(store.load_daemon_id().unwrap().unwrap(), "p1");

        fs::write(mps[2].join(DAEMON_ID_FNAME), "p-other").unwrap();
        assert!(matches!(store.load_daemon_id().unwrap_err(), Error::ClusterIdentity { .. }));
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(MetaStore::new(Vec::new(), 3).is_err());
        assert!(MetaStore::new(vec![PathBuf::from("/tmp")], 0).is_err());
    }
}
