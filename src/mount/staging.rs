//! the staging overlay for writable mounts.
//!
//! The first write-intent open of a stream materializes its bytes into a
//! uniquely named loose file inside a mount-exclusive staging directory.
//! Whether the existing record can be repointed in place or must be split
//! depends on whether other hard links still reference it; see
//! [`extract_to_staging`].

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::blob::{BlobId, BlobLocation, BlobRecord, DigestIndex};
use crate::error::{Error, IoResultExt, Result};
use crate::image::Inode;

/// random suffix on the staging directory name
const DIR_SUFFIX_LEN: usize = 10;
/// length of a loose staging file name
const FILE_NAME_LEN: usize = 20;

fn random_alnum(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// mount-exclusive directory of loose files backing in-flight modifications
#[derive(Debug)]
pub struct StagingOverlay {
    dir: PathBuf,
}

impl StagingOverlay {
    /// create a uniquely named staging directory next to the container
    /// (or under an explicit parent), mode 0700
    pub fn create(container_path: &Path, parent: Option<&Path>) -> Result<Self> {
        let base = container_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "container".to_string());
        let parent_dir = match parent {
            Some(p) => p.to_path_buf(),
            None => container_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf(),
        };

        loop {
            let dir = parent_dir.join(format!("{}.staging.{}", base, random_alnum(DIR_SUFFIX_LEN)));
            match fs::DirBuilder::new().mode(0o700).create(&dir) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "created staging directory");
                    return Ok(Self { dir });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(Error::Io {
                        path: dir,
                        source: e,
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// create a new loose file with a random alphanumeric name,
    /// retried on collision
    pub fn create_file(&self) -> Result<(PathBuf, File)> {
        loop {
            let path = self.dir.join(random_alnum(FILE_NAME_LEN));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(Error::Io {
                        path,
                        source: e,
                    })
                }
            }
        }
    }

    /// number of loose files currently present
    pub fn loose_file_count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.dir).with_path(&self.dir)? {
            entry.with_path(&self.dir)?;
            count += 1;
        }
        Ok(count)
    }

    /// delete the staging directory and everything in it
    pub fn delete(&self) -> Result<()> {
        fs::remove_dir_all(&self.dir).with_path(&self.dir)
    }
}

/// materialize a stream into the staging directory for writing.
///
/// `old_bytes` is the stream's current content (already read by the caller);
/// up to `size` bytes are copied, and the file is zero-extended if `size`
/// exceeds the current length. Afterwards either the existing record is
/// repointed in place (no other reference exists, i.e. the inode's link count
/// equals the record's refcnt) or a new record is split off absorbing exactly
/// this inode's links, with already-open handles on the same stream migrated
/// over. A failed handle migration reverses the handles already migrated and
/// discards the new record and its loose file.
pub fn extract_to_staging(
    index: &mut DigestIndex,
    inode: &mut Inode,
    stream_id: u32,
    size: u64,
    old_bytes: Option<&[u8]>,
    staging: &StagingOverlay,
) -> Result<BlobId> {
    let old = inode
        .stream_by_id(stream_id)
        .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))?
        .blob;

    let (path, mut file) = staging.create_file()?;

    match fill_and_switch(index, inode, stream_id, old, size, old_bytes, &path, &mut file) {
        Ok(id) => Ok(id),
        Err(e) => {
            // the loose file is useless without a record pointing at it
            let _ = fs::remove_file(&path);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn fill_and_switch(
    index: &mut DigestIndex,
    inode: &mut Inode,
    stream_id: u32,
    old: Option<BlobId>,
    size: u64,
    old_bytes: Option<&[u8]>,
    path: &Path,
    file: &mut File,
) -> Result<BlobId> {
    let mut copied = 0u64;
    if let Some(bytes) = old_bytes {
        let take = bytes.len().min(size as usize);
        file.write_all(&bytes[..take]).with_path(path)?;
        copied = take as u64;
    }
    if size > copied {
        // zero-extend to the requested length
        file.set_len(size).with_path(path)?;
    }
    file.sync_all().with_path(path)?;

    let reuse = match old {
        Some(old_id) => index
            .get(old_id)
            .map(|r| r.refcnt == inode.link_count)
            .unwrap_or(false),
        None => false,
    };

    if reuse {
        // every reference to the record belongs to this stream's inode,
        // so the record itself can move to the staging location
        let old_id = old.ok_or(Error::InvalidParam("reuse without a record"))?;
        debug!(?old_id, "re-using record for staged stream");
        index.unlink(old_id);
        let record = index
            .get_mut(old_id)
            .ok_or(Error::InvalidParam("reuse without a record"))?;
        record.digest = None;
        record.location = BlobLocation::Staging(path.to_path_buf());
        record.size = size;
        if let Some(stream) = inode.stream_by_id_mut(stream_id) {
            stream.digest = None;
        }
        return Ok(old_id);
    }

    if old.is_some() {
        debug!(
            link_count = inode.link_count,
            "splitting record shared beyond this inode"
        );
    }

    let mut record = BlobRecord::staged(path.to_path_buf(), size);
    record.refcnt = inode.link_count;
    let new_id = index.add_unhashed(record);

    // handles already open on this stream (read-only opens that predate the
    // write) move to the new record and get their own staging descriptors
    let mut migrated: Vec<u16> = Vec::new();
    let mut failure = None;
    for (idx, slot) in inode.handles.iter_mut().enumerate() {
        let Some(handle) = slot else { continue };
        if handle.stream_id != stream_id || handle.blob != old {
            continue;
        }
        match File::open(path) {
            Ok(staging_file) => {
                handle.blob = Some(new_id);
                handle.staging = Some(staging_file);
                migrated.push(idx as u16);
            }
            Err(e) => {
                failure = Some(Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
                break;
            }
        }
    }

    if let Some(e) = failure {
        // reverse every handle already migrated, then drop the new record
        for idx in migrated {
            if let Some(handle) = inode.handles[idx as usize].as_mut() {
                handle.blob = old;
                handle.staging = None;
            }
        }
        index.free(new_id);
        return Err(e);
    }

    let migrated_count = migrated.len() as u32;
    if let Some(record) = index.get_mut(new_id) {
        record.open_handles = migrated_count;
    }
    if let Some(old_id) = old {
        if let Some(record) = index.get_mut(old_id) {
            record.open_handles = record.open_handles.saturating_sub(migrated_count);
            record.refcnt -= inode.link_count;
        }
    }

    if let Some(stream) = inode.stream_by_id_mut(stream_id) {
        stream.blob = Some(new_id);
        stream.digest = None;
    }
    Ok(new_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobRecord;
    use crate::digest::digest_bytes;
    use crate::image::{FileHandle, Image};
    use tempfile::tempdir;

    fn staging() -> (tempfile::TempDir, StagingOverlay) {
        let dir = tempdir().unwrap();
        let container = dir.path().join("container.bale");
        std::fs::create_dir(&container).unwrap();
        let staging = StagingOverlay::create(&container, None).unwrap();
        (dir, staging)
    }

    fn image_with_links(
        index: &mut DigestIndex,
        content: &[u8],
        links: u32,
    ) -> (Image, crate::image::InodeId, BlobId) {
        let digest = digest_bytes(content);
        let id = index
            .insert(BlobRecord::in_container(
                digest,
                PathBuf::from("/c"),
                content.len() as u64,
            ))
            .unwrap();
        let mut image = Image::new("img", "");
        let ino = image.create_file("file").unwrap();
        {
            let inode = image.inode_mut(ino).unwrap();
            let stream = inode.stream_mut(None).unwrap();
            stream.digest = Some(digest);
            stream.blob = Some(id);
        }
        index.get_mut(id).unwrap().refcnt = 1;
        for i in 1..links {
            image.link("file", &format!("link{}", i), index).unwrap();
        }
        (image, ino, id)
    }

    #[test]
    fn test_staging_dir_naming() {
        let (_dir, staging) = staging();
        let name = staging
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with("container.bale.staging."));
    }

    #[test]
    fn test_create_file_unique_names() {
        let (_dir, staging) = staging();
        let (a, _fa) = staging.create_file().unwrap();
        let (b, _fb) = staging.create_file().unwrap();
        assert_ne!(a, b);
        assert_eq!(staging.loose_file_count().unwrap(), 2);
    }

    #[test]
    fn test_reuse_in_place_when_sole_reference() {
        let (_dir, staging) = staging();
        let mut index = DigestIndex::new();
        let (mut image, ino, id) = image_with_links(&mut index, b"hello", 1);

        let inode = image.inode_mut(ino).unwrap();
        let got =
            extract_to_staging(&mut index, inode, 0, 5, Some(b"hello"), &staging).unwrap();

        // same record, repointed
        assert_eq!(got, id);
        let record = index.get(id).unwrap();
        assert!(record.is_staged());
        assert_eq!(record.digest, None);
        assert_eq!(record.refcnt, 1);
        // digest no longer resolves
        assert_eq!(index.lookup(&digest_bytes(b"hello")), None);
        assert_eq!(
            std::fs::read(record.staging_path().unwrap()).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_split_leaves_other_links_untouched() {
        let (_dir, staging) = staging();
        let mut index = DigestIndex::new();
        // refcnt 3: this inode has 3 links... make refcnt larger than nlink by
        // referencing the same content from a second inode
        let (mut image, ino, old) = image_with_links(&mut index, b"shared", 2);
        index.get_mut(old).unwrap().refcnt = 5; // 3 more references elsewhere

        let inode = image.inode_mut(ino).unwrap();
        let new = extract_to_staging(&mut index, inode, 0, 6, Some(b"shared"), &staging).unwrap();

        assert_ne!(new, old);
        assert_eq!(index.get(old).unwrap().refcnt, 3);
        assert_eq!(index.get(new).unwrap().refcnt, 2);
        assert!(index.get(new).unwrap().is_staged());
        // the original stays resolvable by digest
        assert_eq!(index.lookup(&digest_bytes(b"shared")), Some(old));
        // the stream now points at the new record
        let inode = image.inode(ino).unwrap();
        assert_eq!(inode.stream(None).unwrap().blob, Some(new));
        assert_eq!(inode.stream(None).unwrap().digest, None);
    }

    #[test]
    fn test_split_migrates_open_read_handles() {
        let (_dir, staging) = staging();
        let mut index = DigestIndex::new();
        let (mut image, ino, old) = image_with_links(&mut index, b"shared", 1);
        index.get_mut(old).unwrap().refcnt = 2; // another inode references it too
        index.get_mut(old).unwrap().open_handles = 1;

        {
            let inode = image.inode_mut(ino).unwrap();
            inode.alloc_handle(FileHandle {
                stream_id: 0,
                blob: Some(old),
                staging: None,
                writable: false,
            });
        }

        let inode = image.inode_mut(ino).unwrap();
        let new = extract_to_staging(&mut index, inode, 0, 6, Some(b"shared"), &staging).unwrap();

        let handle = inode.handles[0].as_ref().unwrap();
        assert_eq!(handle.blob, Some(new));
        assert!(handle.staging.is_some());
        assert_eq!(index.get(new).unwrap().open_handles, 1);
        assert_eq!(index.get(old).unwrap().open_handles, 0);
    }

    #[test]
    fn test_zero_extend_beyond_current_length() {
        let (_dir, staging) = staging();
        let mut index = DigestIndex::new();
        let (mut image, ino, _) = image_with_links(&mut index, b"abc", 1);

        let inode = image.inode_mut(ino).unwrap();
        let id = extract_to_staging(&mut index, inode, 0, 8, Some(b"abc"), &staging).unwrap();

        let record = index.get(id).unwrap();
        let data = std::fs::read(record.staging_path().unwrap()).unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(&data[..3], b"abc");
        assert_eq!(&data[3..], &[0u8; 5]);
    }

    #[test]
    fn test_truncating_copy() {
        let (_dir, staging) = staging();
        let mut index = DigestIndex::new();
        let (mut image, ino, _) = image_with_links(&mut index, b"abcdef", 1);

        let inode = image.inode_mut(ino).unwrap();
        let id = extract_to_staging(&mut index, inode, 0, 2, Some(b"abcdef"), &staging).unwrap();

        let record = index.get(id).unwrap();
        assert_eq!(
            std::fs::read(record.staging_path().unwrap()).unwrap(),
            b"ab"
        );
        assert_eq!(record.size, 2);
    }

    #[test]
    fn test_delete_removes_loose_files() {
        let (_dir, staging) = staging();
        staging.create_file().unwrap();
        staging.create_file().unwrap();

        staging.delete().unwrap();
        assert!(!staging.path().exists());
    }
}
