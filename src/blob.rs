//! blob records and the per-container digest index.
//!
//! Every piece of stored content is described by exactly one [`BlobRecord`]
//! owned by the container's [`DigestIndex`]. Records are addressed by a stable
//! [`BlobId`]; the index additionally maps content digests to ids for hashed
//! records. Records backing in-flight staged content have no digest yet and
//! live in the arena only, until commit computes their digest.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::digest::Digest;
use crate::error::{Error, Result};

/// stable key for a blob record within one index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlobId(usize);

/// where a record's bytes physically live
#[derive(Clone, Debug)]
pub enum BlobLocation {
    /// compressed object inside a container's object store
    InContainer {
        /// root directory of the owning container
        root: PathBuf,
    },
    /// loose staging file created during a writable mount
    Staging(PathBuf),
    /// uncompressed file outside any container
    External(PathBuf),
    /// small in-memory buffer
    Memory(Vec<u8>),
}

/// metadata entry for one piece of stored content
#[derive(Clone, Debug)]
pub struct BlobRecord {
    /// content key; None while the record is backed by a staging file
    /// whose digest has not been computed yet
    pub digest: Option<Digest>,
    /// total number of logical references (one per hard link per stream)
    pub refcnt: u32,
    /// references added by an in-flight export, kept for rollback
    pub out_refcnt: u32,
    /// record was created by the in-flight export
    pub was_exported: bool,
    /// physical location of the bytes
    pub location: BlobLocation,
    /// declared uncompressed size
    pub size: u64,
    /// open file handles bound to this record on a writable mount
    pub open_handles: u32,
}

impl BlobRecord {
    /// record for an object stored inside a container
    pub fn in_container(digest: Digest, root: PathBuf, size: u64) -> Self {
        Self {
            digest: Some(digest),
            refcnt: 0,
            out_refcnt: 0,
            was_exported: false,
            location: BlobLocation::InContainer { root },
            size,
            open_handles: 0,
        }
    }

    /// unhashed record backed by a staging file
    pub fn staged(path: PathBuf, size: u64) -> Self {
        Self {
            digest: None,
            refcnt: 0,
            out_refcnt: 0,
            was_exported: false,
            location: BlobLocation::Staging(path),
            size,
            open_handles: 0,
        }
    }

    /// true if the record is backed by a loose staging file
    pub fn is_staged(&self) -> bool {
        matches!(self.location, BlobLocation::Staging(_))
    }

    /// staging file path, if staged
    pub fn staging_path(&self) -> Option<&PathBuf> {
        match &self.location {
            BlobLocation::Staging(path) => Some(path),
            _ => None,
        }
    }
}

/// exclusive owner of all blob records for one container.
///
/// Invariants: no two live records share a digest; every record referenced
/// from a live stream has refcnt >= 1.
#[derive(Debug, Default)]
pub struct DigestIndex {
    records: Vec<Option<BlobRecord>>,
    by_digest: HashMap<Digest, BlobId>,
    free_ids: Vec<BlobId>,
}

impl DigestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, record: BlobRecord) -> BlobId {
        match self.free_ids.pop() {
            Some(id) => {
                self.records[id.0] = Some(record);
                id
            }
            None => {
                self.records.push(Some(record));
                BlobId(self.records.len() - 1)
            }
        }
    }

    /// insert a hashed record, failing if its digest is already present
    pub fn insert(&mut self, record: BlobRecord) -> Result<BlobId> {
        let digest = record
            .digest
            .ok_or(Error::InvalidParam("cannot insert an unhashed record"))?;
        if self.by_digest.contains_key(&digest) {
            return Err(Error::DuplicateDigest(digest));
        }
        let id = self.alloc(record);
        self.by_digest.insert(digest, id);
        Ok(id)
    }

    /// add an unhashed record to the arena without indexing it by digest
    pub fn add_unhashed(&mut self, record: BlobRecord) -> BlobId {
        self.alloc(record)
    }

    /// index an arena record under its (now known) digest
    pub fn link(&mut self, id: BlobId) -> Result<()> {
        let digest = self
            .get(id)
            .and_then(|r| r.digest)
            .ok_or(Error::InvalidParam("cannot link an unhashed record"))?;
        if self.by_digest.contains_key(&digest) {
            return Err(Error::DuplicateDigest(digest));
        }
        self.by_digest.insert(digest, id);
        Ok(())
    }

    /// look up a record id by digest
    pub fn lookup(&self, digest: &Digest) -> Option<BlobId> {
        self.by_digest.get(digest).copied()
    }

    pub fn get(&self, id: BlobId) -> Option<&BlobRecord> {
        self.records.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: BlobId) -> Option<&mut BlobRecord> {
        self.records.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    /// remove a record from the digest map without freeing it.
    /// callers free explicitly once the record is fully unlinked from both
    /// index and storage, which keeps multi-step rollback possible.
    pub fn unlink(&mut self, id: BlobId) {
        if let Some(digest) = self.get(id).and_then(|r| r.digest) {
            if self.by_digest.get(&digest) == Some(&id) {
                self.by_digest.remove(&digest);
            }
        }
    }

    /// free a record, returning it for final disposal (e.g. deleting a
    /// staging file). also drops any digest mapping still pointing at it.
    pub fn free(&mut self, id: BlobId) -> Option<BlobRecord> {
        self.unlink(id);
        let record = self.records.get_mut(id.0).and_then(|slot| slot.take());
        if record.is_some() {
            self.free_ids.push(id);
        }
        record
    }

    /// drop one logical reference. when the last reference goes away and no
    /// handles remain open, the record is unlinked and freed; the freed
    /// record is returned so the caller can delete any staging file.
    pub fn decrement_refcnt(&mut self, id: BlobId) -> Option<BlobRecord> {
        let record = self.get_mut(id)?;
        record.refcnt = record.refcnt.saturating_sub(1);
        if record.refcnt == 0 && record.open_handles == 0 {
            self.free(id)
        } else {
            None
        }
    }

    /// ids of all live records
    pub fn ids(&self) -> Vec<BlobId> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| BlobId(i))
            .collect()
    }

    /// number of live records
    pub fn len(&self) -> usize {
        self.records.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// drop every record, leaving an empty index
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_digest.clear();
        self.free_ids.clear();
    }
}
