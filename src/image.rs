//! logical images: inodes, streams and open-handle tables.
//!
//! An image is a flat namespace of entries; several entries naming the same
//! inode are hard links. Each inode owns one default stream plus any named
//! alternates, and each stream references at most one blob record through the
//! container's digest index. Inodes hold their own open-handle table; handle
//! allocation and release happen under the mount lock as one atomic unit with
//! their refcount side effects.

use std::collections::BTreeMap;
use std::fs::File;

use serde::{Deserialize, Serialize};

use crate::blob::{BlobId, BlobRecord, DigestIndex};
use crate::digest::Digest;
use crate::error::{Error, Result};

/// stable key for an inode within one image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeId(pub(crate) usize);

/// a named or default byte sequence attached to a logical file
#[derive(Debug)]
pub struct Stream {
    /// identifier that stays stable across stream list edits
    pub id: u32,
    /// None is the default stream
    pub name: Option<String>,
    /// content key; None for empty or staged-and-not-yet-hashed content
    pub digest: Option<Digest>,
    /// resolved record, populated lazily from the digest
    pub blob: Option<BlobId>,
}

/// an open file handle, one per open() call
#[derive(Debug)]
pub struct FileHandle {
    /// stream this handle is bound to
    pub stream_id: u32,
    /// record the stream referenced at open (or split) time
    pub blob: Option<BlobId>,
    /// open descriptor on the staging file, when staging-backed
    pub staging: Option<File>,
    /// opened with write intent
    pub writable: bool,
}

/// a logical file
#[derive(Debug)]
pub struct Inode {
    pub ino: u64,
    /// number of entries naming this inode
    pub link_count: u32,
    pub streams: Vec<Stream>,
    /// open-handle table; slot index is the per-inode handle index
    pub handles: Vec<Option<FileHandle>>,
    pub open_handles: u16,
    next_stream_id: u32,
}

impl Inode {
    fn new(ino: u64) -> Self {
        Self {
            ino,
            link_count: 0,
            streams: vec![Stream {
                id: 0,
                name: None,
                digest: None,
                blob: None,
            }],
            handles: Vec::new(),
            open_handles: 0,
            next_stream_id: 1,
        }
    }

    /// find a stream by name (None for the default stream)
    pub fn stream(&self, name: Option<&str>) -> Option<&Stream> {
        self.streams.iter().find(|s| s.name.as_deref() == name)
    }

    pub fn stream_mut(&mut self, name: Option<&str>) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|s| s.name.as_deref() == name)
    }

    pub fn stream_by_id(&self, id: u32) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id == id)
    }

    pub fn stream_by_id_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|s| s.id == id)
    }

    /// add a named alternate stream, returning its stream id
    pub fn add_stream(&mut self, name: &str) -> Result<u32> {
        if self.stream(Some(name)).is_some() {
            return Err(Error::EntryExists(name.to_string()));
        }
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.push(Stream {
            id,
            name: Some(name.to_string()),
            digest: None,
            blob: None,
        });
        Ok(id)
    }

    /// allocate a slot in the handle table; the caller has already done the
    /// refcount bookkeeping for the record the handle binds to
    pub fn alloc_handle(&mut self, handle: FileHandle) -> u16 {
        self.open_handles += 1;
        for (i, slot) in self.handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return i as u16;
            }
        }
        self.handles.push(Some(handle));
        (self.handles.len() - 1) as u16
    }

    /// release a handle slot, returning the handle for disposal
    pub fn take_handle(&mut self, idx: u16) -> Option<FileHandle> {
        let handle = self.handles.get_mut(idx as usize)?.take();
        if handle.is_some() {
            self.open_handles -= 1;
        }
        handle
    }
}

/// a mounted (or exportable) image as runtime state
#[derive(Debug)]
pub struct Image {
    pub name: String,
    pub description: String,
    /// set once the image has uncommitted changes (writable mount or a
    /// fresh export); a modified image cannot be mounted again until the
    /// container is rewritten
    pub modified: bool,
    entries: BTreeMap<String, InodeId>,
    inodes: Vec<Option<Inode>>,
    next_ino: u64,
}

impl Image {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            modified: false,
            entries: BTreeMap::new(),
            inodes: Vec::new(),
            next_ino: 1,
        }
    }

    /// materialize runtime state from a saved image, resolving every stream
    /// digest against the index. a stream whose digest has no record means
    /// the container is structurally inconsistent.
    pub fn from_saved(saved: &SavedImage, index: &DigestIndex) -> Result<Self> {
        let mut inodes = Vec::with_capacity(saved.inodes.len());
        let mut next_ino = 1;
        for (idx, saved_inode) in saved.inodes.iter().enumerate() {
            let mut inode = Inode::new(next_ino);
            next_ino += 1;
            inode.link_count = saved.nlink(idx as u32);
            inode.streams.clear();
            for (sidx, saved_stream) in saved_inode.streams.iter().enumerate() {
                let blob = match saved_stream.digest {
                    Some(digest) => Some(
                        index
                            .lookup(&digest)
                            .ok_or(Error::ContentNotFound(digest))?,
                    ),
                    None => None,
                };
                inode.streams.push(Stream {
                    id: sidx as u32,
                    name: saved_stream.name.clone(),
                    digest: saved_stream.digest,
                    blob,
                });
            }
            inode.next_stream_id = inode.streams.len() as u32;
            inodes.push(Some(inode));
        }

        let entries = saved
            .entries
            .iter()
            .map(|(name, idx)| (name.clone(), InodeId(*idx as usize)))
            .collect();

        Ok(Self {
            name: saved.name.clone(),
            description: saved.description.clone(),
            modified: saved.modified,
            entries,
            inodes,
            next_ino,
        })
    }

    /// serialize back to the saved form, compacting freed inode slots
    pub fn to_saved(&self, index: &DigestIndex) -> SavedImage {
        let mut remap = vec![None; self.inodes.len()];
        let mut inodes = Vec::new();
        for (slot, inode) in self.inodes.iter().enumerate() {
            if let Some(inode) = inode {
                remap[slot] = Some(inodes.len() as u32);
                inodes.push(SavedInode {
                    streams: inode
                        .streams
                        .iter()
                        .map(|s| SavedStream {
                            name: s.name.clone(),
                            digest: s.digest,
                            size: s
                                .blob
                                .and_then(|id| index.get(id))
                                .map(|r| r.size)
                                .unwrap_or(0),
                        })
                        .collect(),
                });
            }
        }

        let entries = self
            .entries
            .iter()
            .filter_map(|(name, id)| remap[id.0].map(|idx| (name.clone(), idx)))
            .collect();

        SavedImage {
            name: self.name.clone(),
            description: self.description.clone(),
            modified: self.modified,
            entries,
            inodes,
        }
    }

    /// create a new empty file under the given entry name
    pub fn create_file(&mut self, name: &str) -> Result<InodeId> {
        if self.entries.contains_key(name) {
            return Err(Error::EntryExists(name.to_string()));
        }
        let mut inode = Inode::new(self.next_ino);
        self.next_ino += 1;
        inode.link_count = 1;
        let id = InodeId(self.inodes.len());
        self.inodes.push(Some(inode));
        self.entries.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<InodeId> {
        self.entries.get(name).copied()
    }

    pub fn inode(&self, id: InodeId) -> Option<&Inode> {
        self.inodes.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn inode_mut(&mut self, id: InodeId) -> Option<&mut Inode> {
        self.inodes.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    /// add a hard link: a second entry naming an existing inode. every
    /// resolved stream record gains one reference.
    pub fn link(&mut self, existing: &str, new_name: &str, index: &mut DigestIndex) -> Result<()> {
        if self.entries.contains_key(new_name) {
            return Err(Error::EntryExists(new_name.to_string()));
        }
        let id = self
            .lookup(existing)
            .ok_or_else(|| Error::EntryNotFound(existing.to_string()))?;
        let inode = self
            .inode_mut(id)
            .ok_or_else(|| Error::EntryNotFound(existing.to_string()))?;
        inode.link_count += 1;
        let blobs: Vec<BlobId> = inode.streams.iter().filter_map(|s| s.blob).collect();
        for blob in blobs {
            if let Some(record) = index.get_mut(blob) {
                record.refcnt += 1;
            }
        }
        self.entries.insert(new_name.to_string(), id);
        Ok(())
    }

    /// remove an entry. each stream record loses one reference; records that
    /// reach zero references are freed and returned so the caller can delete
    /// their staging files. the inode itself is freed once no entries and no
    /// open handles remain.
    pub fn unlink(&mut self, name: &str, index: &mut DigestIndex) -> Result<Vec<BlobRecord>> {
        let id = self
            .entries
            .remove(name)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        let inode = self
            .inode_mut(id)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        inode.link_count = inode.link_count.saturating_sub(1);
        let blobs: Vec<BlobId> = inode.streams.iter().filter_map(|s| s.blob).collect();
        let drop_inode = inode.link_count == 0 && inode.open_handles == 0;

        let mut freed = Vec::new();
        for blob in blobs {
            if let Some(record) = index.decrement_refcnt(blob) {
                self.forget_blob(blob);
                freed.push(record);
            }
        }
        if drop_inode {
            self.inodes[id.0] = None;
        }
        Ok(freed)
    }

    /// entry names in order
    pub fn entry_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// live inode ids
    pub fn inode_ids(&self) -> Vec<InodeId> {
        self.inodes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| InodeId(i))
            .collect()
    }

    /// repoint every stream referencing `old` to `new`, updating the stored
    /// digest alongside. used when commit merges duplicate records.
    pub fn repoint_blob(&mut self, old: BlobId, new: Option<BlobId>, digest: Option<Digest>) {
        for inode in self.inodes.iter_mut().flatten() {
            for stream in &mut inode.streams {
                if stream.blob == Some(old) {
                    stream.blob = new;
                    stream.digest = digest;
                }
            }
        }
    }

    /// clear dangling stream references to a freed record
    fn forget_blob(&mut self, blob: BlobId) {
        self.repoint_blob(blob, None, None);
    }

    /// free an inode slot once its last handle closes after unlink
    pub fn reap_inode(&mut self, id: InodeId) {
        if let Some(inode) = self.inode(id) {
            if inode.link_count == 0 && inode.open_handles == 0 {
                self.inodes[id.0] = None;
            }
        }
    }
}

/// serialized form of an image stored in the container manifest
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedImage {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub modified: bool,
    /// entry name -> inode position; several entries sharing a position are
    /// hard links
    pub entries: BTreeMap<String, u32>,
    pub inodes: Vec<SavedInode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedInode {
    pub streams: Vec<SavedStream>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedStream {
    pub name: Option<String>,
    pub digest: Option<Digest>,
    pub size: u64,
}

impl SavedImage {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            modified: false,
            entries: BTreeMap::new(),
            inodes: Vec::new(),
        }
    }

    /// number of entries naming the inode at the given position
    pub fn nlink(&self, inode_idx: u32) -> u32 {
        self.entries.values().filter(|&&v| v == inode_idx).count() as u32
    }
}
