//! the shared container: object store, image manifest and lock.
//!
//! A container is a directory holding a zstd-compressed object per content
//! digest, a CBOR manifest describing its images (name, description, boot
//! pointer, per-image inode trees) and a config.toml. Opening a container
//! rebuilds the digest index from the manifest; reference counts are the sum
//! of hard-link references across all images. In-container bytes are only
//! ever touched through [`Container::read_object`]/[`Container::write_object`]
//! so the codec stays in one place.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::blob::{BlobLocation, BlobRecord, DigestIndex};
use crate::config::Config;
use crate::digest::{digest_bytes, Digest};
use crate::error::{Error, IoResultExt, Result};
use crate::image::SavedImage;

/// serialized container metadata: image records and the boot pointer
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    /// 1-based index of the boot image, 0 if none
    pub boot_index: u32,
    pub images: Vec<SavedImage>,
}

/// selects one image of a container, or all of them
#[derive(Clone, Debug)]
pub enum ImageSelector {
    /// 1-based image index
    Index(u32),
    Name(String),
    All,
}

/// options for a container rewrite
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteFlags {
    /// verify object digests while rewriting
    pub check_integrity: bool,
    /// drop local objects no longer referenced by any image
    pub rebuild: bool,
    /// re-encode local objects
    pub recompress: bool,
}

/// result of an integrity check
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub corrupt: Vec<Digest>,
    pub missing: Vec<Digest>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty()
    }
}

/// a bale container on disk
pub struct Container {
    path: PathBuf,
    config: Config,
    manifest: Manifest,
    index: DigestIndex,
    /// set after a move export transferred this container's records away;
    /// further saves would write an inconsistent manifest and are refused
    consumed: bool,
}

impl Container {
    /// initialize a new empty container at the given path
    pub fn create(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::ContainerExists(path.to_path_buf()));
        }

        fs::create_dir_all(path.join("objects")).with_path(path)?;
        fs::create_dir_all(path.join("tmp")).with_path(path)?;

        let config = Config::default();
        config.save(&config_path)?;

        let mut container = Self {
            path: path.to_path_buf(),
            config,
            manifest: Manifest::default(),
            index: DigestIndex::new(),
            consumed: false,
        };
        container.write_manifest()?;
        Ok(container)
    }

    /// open an existing container and rebuild its digest index
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoContainer(path.to_path_buf()));
        }

        let config = Config::load(&config_path)?;

        let manifest_path = path.join("manifest.cbor");
        let manifest: Manifest = if manifest_path.exists() {
            let file = File::open(&manifest_path).with_path(&manifest_path)?;
            ciborium::from_reader(file)?
        } else {
            Manifest::default()
        };

        let index = build_index(path, &manifest);

        Ok(Self {
            path: path.to_path_buf(),
            config,
            manifest,
            index,
            consumed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &DigestIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut DigestIndex {
        &mut self.index
    }

    pub fn images(&self) -> &[SavedImage] {
        &self.manifest.images
    }

    /// 1-based boot image index, 0 if none
    pub fn boot_index(&self) -> u32 {
        self.manifest.boot_index
    }

    pub fn set_boot_index(&mut self, index: u32) -> Result<()> {
        if index as usize > self.manifest.images.len() {
            return Err(Error::InvalidParam("boot index out of range"));
        }
        self.manifest.boot_index = index;
        Ok(())
    }

    /// resolve a selector to a 0-based image position
    pub fn select(&self, selector: &ImageSelector) -> Result<usize> {
        match selector {
            ImageSelector::Index(n) => {
                if *n == 0 || *n as usize > self.manifest.images.len() {
                    return Err(Error::ImageNotFound(n.to_string()));
                }
                Ok(*n as usize - 1)
            }
            ImageSelector::Name(name) => self
                .manifest
                .images
                .iter()
                .position(|img| &img.name == name)
                .ok_or_else(|| Error::ImageNotFound(name.clone())),
            ImageSelector::All => Err(Error::InvalidParam(
                "cannot select all images for this operation",
            )),
        }
    }

    /// true if a non-empty image name is already taken
    pub fn image_name_in_use(&self, name: &str) -> bool {
        !name.is_empty() && self.manifest.images.iter().any(|img| img.name == name)
    }

    /// append a new empty image
    pub fn add_image(&mut self, name: &str, description: &str) -> Result<()> {
        if self.image_name_in_use(name) {
            return Err(Error::DuplicateImageName(name.to_string()));
        }
        self.manifest
            .images
            .push(SavedImage::new(name, description));
        Ok(())
    }

    /// append an image record produced by export or commit
    pub fn push_image(&mut self, image: SavedImage) {
        self.manifest.images.push(image);
    }

    /// drop images appended after the given count (export rollback)
    pub fn truncate_images(&mut self, count: usize) {
        self.manifest.images.truncate(count);
        if self.manifest.boot_index as usize > count {
            self.manifest.boot_index = 0;
        }
    }

    /// replace an image record in place (commit)
    pub fn replace_image(&mut self, idx: usize, image: SavedImage) -> Result<()> {
        let slot = self
            .manifest
            .images
            .get_mut(idx)
            .ok_or_else(|| Error::ImageNotFound(format!("{}", idx + 1)))?;
        *slot = image;
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    /// acquire the whole-container exclusive lock.
    /// returns a guard that releases the lock on drop.
    pub fn lock(&self) -> Result<ContainerLock> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        let flock =
            Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|_| Error::LockContention)?;

        Ok(ContainerLock { flock })
    }

    /// mark the container consumed by a move export
    pub fn consume(&mut self) {
        self.consumed = true;
        self.index.clear();
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// path of the object holding the given digest
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        object_path_in(&self.path, digest)
    }

    pub fn has_object(&self, digest: &Digest) -> bool {
        self.object_path(digest).exists()
    }

    /// read and decompress an object
    pub fn read_object(&self, digest: &Digest) -> Result<Vec<u8>> {
        read_object_in(&self.path, digest)
    }

    /// compress and store an object, skipping if already present.
    /// atomic write: temp file -> fsync -> rename -> fsync parent dir.
    pub fn write_object(&self, digest: &Digest, content: &[u8]) -> Result<()> {
        self.write_object_impl(digest, content, false)
    }

    fn write_object_impl(&self, digest: &Digest, content: &[u8], force: bool) -> Result<()> {
        let (dir, file) = digest.to_path_components();
        let object_dir = self.path.join("objects").join(&dir);
        let object_path = object_dir.join(&file);

        if !force && object_path.exists() {
            return Ok(());
        }

        let compressed = zstd::encode_all(content, self.config.compression_level)
            .map_err(|e| Error::Io {
                path: PathBuf::from("<zstd>"),
                source: e,
            })?;

        fs::create_dir_all(&object_dir).with_path(&object_dir)?;

        let tmp_path = self.path.join("tmp").join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(&compressed).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }

        fs::rename(&tmp_path, &object_path).with_path(&object_path)?;
        fsync_dir(&object_dir)?;
        Ok(())
    }

    /// read a record's bytes from wherever they live
    pub fn read_record_bytes(&self, record: &BlobRecord) -> Result<Vec<u8>> {
        match &record.location {
            BlobLocation::InContainer { root } => {
                let digest = record.digest.ok_or(Error::InvalidParam(
                    "in-container record without a digest",
                ))?;
                read_object_in(root, &digest)
            }
            BlobLocation::Staging(path) | BlobLocation::External(path) => {
                fs::read(path).with_path(path)
            }
            BlobLocation::Memory(bytes) => Ok(bytes.clone()),
        }
    }

    /// every digest referenced by any image in the manifest
    fn referenced_digests(&self) -> HashSet<Digest> {
        let mut referenced = HashSet::new();
        for image in &self.manifest.images {
            for inode in &image.inodes {
                for stream in &inode.streams {
                    if let Some(digest) = stream.digest {
                        referenced.insert(digest);
                    }
                }
            }
        }
        referenced
    }

    /// rewrite the container with default flags
    pub fn save(&mut self) -> Result<()> {
        self.save_with(WriteFlags::default())
    }

    /// rewrite the container: make every referenced record's bytes local,
    /// then atomically replace the manifest.
    pub fn save_with(&mut self, flags: WriteFlags) -> Result<()> {
        if self.consumed {
            return Err(Error::ContainerConsumed);
        }

        let referenced = self.referenced_digests();
        for digest in &referenced {
            let id = self
                .index
                .lookup(digest)
                .ok_or(Error::ContentNotFound(*digest))?;
            let record = self
                .index
                .get(id)
                .ok_or(Error::ContentNotFound(*digest))?;
            let local = matches!(&record.location, BlobLocation::InContainer { root } if *root == self.path);

            if !local || flags.recompress || flags.check_integrity {
                let bytes = self.read_record_bytes(record)?;
                if flags.check_integrity && digest_bytes(&bytes) != *digest {
                    return Err(Error::CorruptObject(*digest));
                }
                if !local || flags.recompress {
                    self.write_object_impl(digest, &bytes, flags.recompress)?;
                }
            }

            if !local {
                if let Some(record) = self.index.get_mut(id) {
                    record.location = BlobLocation::InContainer {
                        root: self.path.clone(),
                    };
                }
            }
        }

        for image in &mut self.manifest.images {
            image.modified = false;
        }
        self.write_manifest()?;

        if flags.rebuild {
            self.drop_unreferenced_objects(&referenced)?;
        }

        debug!(
            container = %self.path.display(),
            objects = referenced.len(),
            "container rewritten"
        );
        Ok(())
    }

    fn write_manifest(&self) -> Result<()> {
        let manifest_path = self.path.join("manifest.cbor");
        let tmp_path = self.path.join("tmp").join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            ciborium::into_writer(&self.manifest, &mut tmp_file)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, &manifest_path).with_path(&manifest_path)?;
        fsync_dir(&self.path)
    }

    fn drop_unreferenced_objects(&self, referenced: &HashSet<Digest>) -> Result<()> {
        let objects = self.path.join("objects");
        if !objects.exists() {
            return Ok(());
        }
        for dir_entry in fs::read_dir(&objects).with_path(&objects)? {
            let dir_entry = dir_entry.with_path(&objects)?;
            if !dir_entry.path().is_dir() {
                continue;
            }
            for file_entry in fs::read_dir(dir_entry.path()).with_path(dir_entry.path())? {
                let file_entry = file_entry.with_path(dir_entry.path())?;
                let hex = format!(
                    "{}{}",
                    dir_entry.file_name().to_string_lossy(),
                    file_entry.file_name().to_string_lossy()
                );
                let keep = Digest::from_hex(&hex)
                    .map(|d| referenced.contains(&d))
                    .unwrap_or(false);
                if !keep {
                    fs::remove_file(file_entry.path()).with_path(file_entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// recompute the digest of every referenced object
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for digest in self.referenced_digests() {
            if !self.has_object(&digest) {
                report.missing.push(digest);
                continue;
            }
            let bytes = self.read_object(&digest)?;
            if digest_bytes(&bytes) != digest {
                report.corrupt.push(digest);
            }
        }
        Ok(report)
    }
}

fn object_path_in(root: &Path, digest: &Digest) -> PathBuf {
    let (dir, file) = digest.to_path_components();
    root.join("objects").join(dir).join(file)
}

fn read_object_in(root: &Path, digest: &Digest) -> Result<Vec<u8>> {
    let path = object_path_in(root, digest);
    let compressed = fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ContentNotFound(*digest)
        } else {
            Error::Io { path, source: e }
        }
    })?;
    zstd::decode_all(&compressed[..]).map_err(|e| Error::Io {
        path: PathBuf::from("<zstd>"),
        source: e,
    })
}

fn build_index(root: &Path, manifest: &Manifest) -> DigestIndex {
    let mut index = DigestIndex::new();
    for image in &manifest.images {
        for (idx, inode) in image.inodes.iter().enumerate() {
            let nlink = image.nlink(idx as u32);
            for stream in &inode.streams {
                let Some(digest) = stream.digest else {
                    continue;
                };
                match index.lookup(&digest) {
                    Some(id) => {
                        if let Some(record) = index.get_mut(id) {
                            record.refcnt += nlink;
                        }
                    }
                    None => {
                        let mut record =
                            BlobRecord::in_container(digest, root.to_path_buf(), stream.size);
                        record.refcnt = nlink;
                        // digest uniqueness was just checked
                        let _ = index.insert(record);
                    }
                }
            }
        }
    }
    index
}

/// guard that holds the container lock until dropped
pub struct ContainerLock {
    #[allow(dead_code)]
    flock: Flock<File>,
}
// lock is released automatically when Flock is dropped

fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;
    use crate::image::{SavedInode, SavedStream};
    use tempfile::tempdir;

    fn test_container() -> (tempfile::TempDir, Container) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("container");
        let container = Container::create(&path).unwrap();
        (dir, container)
    }

    fn saved_image_with_content(container: &Container, name: &str, content: &[u8]) -> SavedImage {
        let digest = digest_bytes(content);
        container.write_object(&digest, content).unwrap();
        let mut image = SavedImage::new(name, "");
        image.inodes.push(SavedInode {
            streams: vec![SavedStream {
                name: None,
                digest: Some(digest),
                size: content.len() as u64,
            }],
        });
        image.entries.insert("file".to_string(), 0);
        image
    }

    #[test]
    fn test_create_and_open() {
        let (_dir, container) = test_container();
        let path = container.path().to_path_buf();

        assert!(path.join("objects").is_dir());
        assert!(path.join("tmp").is_dir());
        assert!(path.join("config.toml").is_file());
        assert!(path.join("manifest.cbor").is_file());

        let reopened = Container::open(&path).unwrap();
        assert!(reopened.images().is_empty());

        assert!(matches!(
            Container::create(&path),
            Err(Error::ContainerExists(_))
        ));
    }

    #[test]
    fn test_open_missing() {
        let dir = tempdir().unwrap();
        let result = Container::open(&dir.path().join("nope"));
        assert!(matches!(result, Err(Error::NoContainer(_))));
    }

    #[test]
    fn test_object_roundtrip() {
        let (_dir, container) = test_container();
        let digest = digest_bytes(b"hello, object");

        container.write_object(&digest, b"hello, object").unwrap();
        assert!(container.has_object(&digest));
        assert_eq!(container.read_object(&digest).unwrap(), b"hello, object");
    }

    #[test]
    fn test_read_missing_object() {
        let (_dir, container) = test_container();
        let result = container.read_object(&digest_bytes(b"missing"));
        assert!(matches!(result, Err(Error::ContentNotFound(_))));
    }

    #[test]
    fn test_index_rebuild_counts_hard_links() {
        let (_dir, mut container) = test_container();
        let content = b"linked content";
        let mut image = saved_image_with_content(&container, "img", content);
        image.entries.insert("hardlink".to_string(), 0);
        image.entries.insert("third".to_string(), 0);
        container.push_image(image);
        container.save().unwrap();

        let reopened = Container::open(container.path()).unwrap();
        let id = reopened.index().lookup(&digest_bytes(content)).unwrap();
        assert_eq!(reopened.index().get(id).unwrap().refcnt, 3);
    }

    #[test]
    fn test_add_image_name_collision() {
        let (_dir, mut container) = test_container();
        container.add_image("win10", "").unwrap();

        assert!(matches!(
            container.add_image("win10", ""),
            Err(Error::DuplicateImageName(_))
        ));
        // empty names never collide
        container.add_image("", "").unwrap();
        container.add_image("", "").unwrap();
    }

    #[test]
    fn test_selector() {
        let (_dir, mut container) = test_container();
        container.add_image("first", "").unwrap();
        container.add_image("second", "").unwrap();

        assert_eq!(container.select(&ImageSelector::Index(1)).unwrap(), 0);
        assert_eq!(
            container
                .select(&ImageSelector::Name("second".to_string()))
                .unwrap(),
            1
        );
        assert!(container.select(&ImageSelector::Index(0)).is_err());
        assert!(container.select(&ImageSelector::Index(3)).is_err());
    }

    #[test]
    fn test_lock_contention() {
        let (_dir, container) = test_container();

        let lock = container.lock().unwrap();
        assert!(matches!(container.lock(), Err(Error::LockContention)));
        drop(lock);
        assert!(container.lock().is_ok());
    }

    #[test]
    fn test_save_ingests_external_bytes() {
        let (dir, mut container) = test_container();

        // a record whose bytes live outside the container
        let loose = dir.path().join("loose");
        std::fs::write(&loose, b"external bytes").unwrap();
        let digest = digest_bytes(b"external bytes");
        let mut record = BlobRecord::staged(loose, 14);
        record.digest = Some(digest);
        record.refcnt = 1;
        let id = container.index_mut().add_unhashed(record);
        container.index_mut().link(id).unwrap();

        let mut image = SavedImage::new("img", "");
        image.inodes.push(SavedInode {
            streams: vec![SavedStream {
                name: None,
                digest: Some(digest),
                size: 14,
            }],
        });
        image.entries.insert("file".to_string(), 0);
        container.push_image(image);

        container.save().unwrap();
        assert!(container.has_object(&digest));
        assert_eq!(container.read_object(&digest).unwrap(), b"external bytes");
    }

    #[test]
    fn test_save_rebuild_drops_unreferenced() {
        let (_dir, mut container) = test_container();
        let kept = saved_image_with_content(&container, "img", b"kept");
        container.push_image(kept);

        let stray = digest_bytes(b"stray");
        container.write_object(&stray, b"stray").unwrap();

        container
            .save_with(WriteFlags {
                rebuild: true,
                ..Default::default()
            })
            .unwrap();

        assert!(container.has_object(&digest_bytes(b"kept")));
        assert!(!container.has_object(&stray));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (_dir, mut container) = test_container();
        let image = saved_image_with_content(&container, "img", b"pristine");
        container.push_image(image);

        let report = container.verify().unwrap();
        assert!(report.is_clean());

        // corrupt the object in place (valid zstd, wrong content)
        let digest = digest_bytes(b"pristine");
        let bad = zstd::encode_all(&b"tampered"[..], 3).unwrap();
        std::fs::write(container.object_path(&digest), bad).unwrap();

        let report = container.verify().unwrap();
        assert_eq!(report.corrupt, vec![digest]);
    }

    #[test]
    fn test_consumed_container_refuses_save() {
        let (_dir, mut container) = test_container();
        container.consume();
        assert!(matches!(container.save(), Err(Error::ContainerConsumed)));
    }
}
