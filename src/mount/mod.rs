//! mounting an image as a writable (or read-only) overlay.
//!
//! A mount binds one image of a container to a mountpoint and starts the
//! daemon thread that answers the unmount handshake. Filesystem calls arrive
//! through the [`Mount`] handle; only their blob-lifecycle side effects are
//! implemented here (handle allocation, staging materialization, refcount
//! bookkeeping). Path walking, directories and permissions belong to the
//! surrounding tree layer and are out of scope.
//!
//! Read-write mounts are serviced one call at a time; the mutex over
//! [`MountState`] enforces that and makes handle allocation and its refcount
//! side effects one atomic unit.

pub mod staging;

pub(crate) mod commit;

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::{debug, error, info};

use crate::blob::BlobId;
use crate::container::{Container, ContainerLock, ImageSelector, WriteFlags};
use crate::error::{Error, IoResultExt, Result};
use crate::image::{FileHandle, Image, InodeId};
use crate::protocol::channel::{channel_pair, Channel, PairChannel, SocketChannel};
use crate::protocol::daemon::run_daemon;
use crate::protocol::invoker::{run_invoker, ProcessProbe, DEFAULT_REPLY_TIMEOUT};
use self::staging::StagingOverlay;

/// unmount finished successfully
pub const STATUS_OK: i32 = 0;
/// the commit failed; the container was left at its pre-mount state
pub const STATUS_COMMIT_FAILED: i32 = 1;
/// the commit (if any) succeeded but the staging directory could not be removed
pub const STATUS_CLEANUP_FAILED: i32 = 2;

/// how an image is mounted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountFlags {
    pub read_write: bool,
}

impl MountFlags {
    const READ_WRITE: u32 = 1 << 0;

    pub fn read_write() -> Self {
        Self { read_write: true }
    }

    pub fn bits(self) -> u32 {
        if self.read_write {
            Self::READ_WRITE
        } else {
            0
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            read_write: bits & Self::READ_WRITE != 0,
        }
    }
}

/// what the unmount invoker asks the daemon to do
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnmountFlags {
    /// reconcile staged changes into the container; without it staged
    /// changes are discarded
    pub commit: bool,
    /// verify object digests during the container rewrite
    pub check_integrity: bool,
    /// rewrite the container from scratch, dropping unreferenced objects
    pub rebuild: bool,
    /// re-encode in-container objects
    pub recompress: bool,
}

impl UnmountFlags {
    const COMMIT: u32 = 1 << 0;
    const CHECK_INTEGRITY: u32 = 1 << 1;
    const REBUILD: u32 = 1 << 2;
    const RECOMPRESS: u32 = 1 << 3;

    pub fn commit() -> Self {
        Self {
            commit: true,
            ..Default::default()
        }
    }

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.commit {
            bits |= Self::COMMIT;
        }
        if self.check_integrity {
            bits |= Self::CHECK_INTEGRITY;
        }
        if self.rebuild {
            bits |= Self::REBUILD;
        }
        if self.recompress {
            bits |= Self::RECOMPRESS;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            commit: bits & Self::COMMIT != 0,
            check_integrity: bits & Self::CHECK_INTEGRITY != 0,
            rebuild: bits & Self::REBUILD != 0,
            recompress: bits & Self::RECOMPRESS != 0,
        }
    }
}

/// per-mount tunables
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// parent directory for the staging directory; next to the container
    /// if unset
    pub staging_parent: Option<PathBuf>,
    /// how long the daemon waits for the initial unmount request before
    /// exiting cleanly; None waits forever
    pub idle_timeout: Option<Duration>,
    /// rendezvous over unix datagram sockets instead of the in-process
    /// registry, so a different process can unmount
    pub external: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            staging_parent: None,
            idle_timeout: None,
            external: false,
        }
    }
}

/// daemon-side mount state, guarded by one lock
pub(crate) struct MountState {
    pub(crate) container: Container,
    pub(crate) image: Image,
    pub(crate) image_idx: usize,
    pub(crate) flags: MountFlags,
    pub(crate) staging: Option<StagingOverlay>,
    /// records currently backed by loose staging files
    pub(crate) staged: Vec<BlobId>,
    /// whole-container lock held for the lifetime of a writable mount
    lock: Option<ContainerLock>,
    fd_map: HashMap<u64, (InodeId, u16)>,
    next_fd: u64,
}

pub(crate) struct MountShared {
    pub(crate) state: Mutex<MountState>,
    pub(crate) commit_error: Mutex<Option<Error>>,
    flags: MountFlags,
    mountpoint: PathBuf,
}

/// in-process rendezvous between the mount daemon and the unmount invoker,
/// keyed by mountpoint. initialized once for the whole process.
static MOUNT_REGISTRY: Lazy<Mutex<HashMap<PathBuf, PairChannel>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<PathBuf, PairChannel>> {
    MOUNT_REGISTRY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// a mounted image
pub struct Mount {
    pub(crate) shared: Arc<MountShared>,
    daemon: Option<JoinHandle<Result<()>>>,
}

impl Mount {
    /// select an image, check the mount preconditions and start the daemon
    /// loop on its own thread. all setup failures are returned before the
    /// loop starts.
    pub fn start(
        container: Container,
        selector: &ImageSelector,
        mountpoint: &Path,
        flags: MountFlags,
        options: MountOptions,
    ) -> Result<Self> {
        let mountpoint = mountpoint.canonicalize().with_path(mountpoint)?;

        if flags.read_write && container.config().part_count != 1 {
            return Err(Error::SplitUnsupported);
        }

        let image_idx = container.select(selector)?;
        let saved = &container.images()[image_idx];
        if saved.modified {
            return Err(Error::ImageBusy(saved.name.clone()));
        }

        let lock = if flags.read_write {
            Some(container.lock()?)
        } else {
            None
        };

        let mut image = Image::from_saved(saved, container.index())?;
        if flags.read_write {
            image.modified = true;
        }

        let daemon_channel: Box<dyn Channel> = if options.external {
            Box::new(SocketChannel::daemon_endpoint(&mountpoint)?)
        } else {
            let mut reg = registry();
            if reg.contains_key(&mountpoint) {
                return Err(Error::AlreadyMounted(mountpoint));
            }
            let (daemon_end, invoker_end) = channel_pair();
            reg.insert(mountpoint.clone(), invoker_end);
            Box::new(daemon_end)
        };

        let staging = if flags.read_write {
            match StagingOverlay::create(container.path(), options.staging_parent.as_deref()) {
                Ok(staging) => Some(staging),
                Err(e) => {
                    registry().remove(&mountpoint);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let state = MountState {
            container,
            image,
            image_idx,
            flags,
            staging,
            staged: Vec::new(),
            lock,
            fd_map: HashMap::new(),
            next_fd: 1,
        };
        let shared = Arc::new(MountShared {
            state: Mutex::new(state),
            commit_error: Mutex::new(None),
            flags,
            mountpoint: mountpoint.clone(),
        });

        info!(
            mountpoint = %mountpoint.display(),
            read_write = flags.read_write,
            "mounting image"
        );

        let daemon_shared = Arc::clone(&shared);
        let idle_timeout = options.idle_timeout;
        let daemon = thread::Builder::new()
            .name("bale-mountd".to_string())
            .spawn(move || {
                let result = run_daemon(
                    daemon_channel.as_ref(),
                    std::process::id(),
                    daemon_shared.flags.bits(),
                    idle_timeout,
                    |raw_flags| handle_unmount_request(&daemon_shared, raw_flags),
                );
                registry().remove(&daemon_shared.mountpoint);
                if let Err(ref e) = result {
                    error!(error = %e, "mount daemon exited with protocol failure");
                }
                result
            })
            .map_err(|e| Error::Io {
                path: mountpoint,
                source: e,
            })?;

        Ok(Self {
            shared,
            daemon: Some(daemon),
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.shared.mountpoint
    }

    pub fn is_read_write(&self) -> bool {
        self.shared.flags.read_write
    }

    /// wait for the daemon loop to finish (after an unmount or idle timeout)
    pub fn join(mut self) -> Result<()> {
        match self.daemon.take() {
            Some(handle) => handle.join().map_err(|_| Error::DaemonCrashed)?,
            None => Ok(()),
        }
    }

    /// detailed commit failure from the last unmount, if any
    pub fn take_commit_error(&self) -> Option<Error> {
        self.shared
            .commit_error
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, MountState>> {
        // poisoned only if the daemon thread panicked mid-operation
        self.shared.state.lock().map_err(|_| Error::DaemonCrashed)
    }

    /// create a new empty file
    pub fn create(&self, name: &str) -> Result<()> {
        let mut st = self.lock_state()?;
        if !st.flags.read_write {
            return Err(Error::ReadOnlyMount);
        }
        st.image.create_file(name)?;
        Ok(())
    }

    /// add a named alternate stream to an existing file
    pub fn create_stream(&self, name: &str, stream_name: &str) -> Result<()> {
        let mut st = self.lock_state()?;
        if !st.flags.read_write {
            return Err(Error::ReadOnlyMount);
        }
        let ino = st
            .image
            .lookup(name)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        let inode = st
            .image
            .inode_mut(ino)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        inode.add_stream(stream_name)?;
        Ok(())
    }

    /// add a hard link to an existing file
    pub fn link(&self, existing: &str, new_name: &str) -> Result<()> {
        let mut st = self.lock_state()?;
        if !st.flags.read_write {
            return Err(Error::ReadOnlyMount);
        }
        let MountState {
            container, image, ..
        } = &mut *st;
        image.link(existing, new_name, container.index_mut())
    }

    /// remove an entry; content whose last reference goes away is freed
    pub fn unlink(&self, name: &str) -> Result<()> {
        let mut st = self.lock_state()?;
        if !st.flags.read_write {
            return Err(Error::ReadOnlyMount);
        }
        let MountState {
            container,
            image,
            staged,
            ..
        } = &mut *st;
        let freed = image.unlink(name, container.index_mut())?;
        for record in freed {
            if let Some(path) = record.staging_path() {
                let _ = fs::remove_file(path);
            }
        }
        staged.retain(|id| container.index().get(*id).is_some());
        Ok(())
    }

    /// open a stream, materializing it into the staging area on first
    /// write intent. returns a file handle id.
    pub fn open(&self, name: &str, stream: Option<&str>, writable: bool) -> Result<u64> {
        let mut st = self.lock_state()?;
        if writable && !st.flags.read_write {
            return Err(Error::ReadOnlyMount);
        }
        let ino = st
            .image
            .lookup(name)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        let sid = {
            let inode = st
                .image
                .inode(ino)
                .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
            inode
                .stream(stream)
                .ok_or_else(|| Error::StreamNotFound(stream.unwrap_or("<default>").to_string()))?
                .id
        };

        if writable {
            let needs_staging = {
                let inode = st
                    .image
                    .inode(ino)
                    .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
                match inode.stream_by_id(sid).and_then(|s| s.blob) {
                    Some(blob) => !st
                        .container
                        .index()
                        .get(blob)
                        .map(|r| r.is_staged())
                        .unwrap_or(false),
                    None => true,
                }
            };
            if needs_staging {
                let size = self.materialize(&mut st, ino, sid, None)?;
                debug!(name, size, "materialized stream for writing");
            }
        }

        let writable_mount = st.flags.read_write;
        let (blob, staging_file) = {
            let inode = st
                .image
                .inode(ino)
                .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
            let s = inode
                .stream_by_id(sid)
                .ok_or_else(|| Error::StreamNotFound(sid.to_string()))?;
            match s.blob {
                Some(blob) => {
                    let record = st
                        .container
                        .index()
                        .get(blob)
                        .ok_or(Error::InvalidParam("stream references a freed record"))?;
                    match record.staging_path() {
                        Some(path) => {
                            let file = OpenOptions::new()
                                .read(true)
                                .write(writable)
                                .open(path)
                                .with_path(path)?;
                            (Some(blob), Some(file))
                        }
                        None => (Some(blob), None),
                    }
                }
                None => (None, None),
            }
        };

        if writable_mount {
            if let Some(blob) = blob {
                if let Some(record) = st.container.index_mut().get_mut(blob) {
                    record.open_handles += 1;
                }
            }
        }

        let idx = st
            .image
            .inode_mut(ino)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?
            .alloc_handle(FileHandle {
                stream_id: sid,
                blob,
                staging: staging_file,
                writable,
            });

        let fd = st.next_fd;
        st.next_fd += 1;
        st.fd_map.insert(fd, (ino, idx));
        Ok(fd)
    }

    /// materialize a stream into staging, copying up to `cap` bytes of the
    /// current content (current size if None)
    fn materialize(
        &self,
        st: &mut MountState,
        ino: InodeId,
        sid: u32,
        cap: Option<u64>,
    ) -> Result<u64> {
        let (size, old_bytes) = {
            let inode = st
                .image
                .inode(ino)
                .ok_or(Error::InvalidParam("inode vanished during open"))?;
            match inode.stream_by_id(sid).and_then(|s| s.blob) {
                Some(blob) => match st.container.index().get(blob) {
                    Some(record) => {
                        let size = cap.unwrap_or(record.size);
                        let bytes = if record.size > 0 && size > 0 {
                            Some(st.container.read_record_bytes(record)?)
                        } else {
                            None
                        };
                        (size, bytes)
                    }
                    None => (cap.unwrap_or(0), None),
                },
                None => (cap.unwrap_or(0), None),
            }
        };

        let MountState {
            container,
            image,
            staging,
            staged,
            ..
        } = st;
        let staging = staging.as_ref().ok_or(Error::ReadOnlyMount)?;
        let inode = image
            .inode_mut(ino)
            .ok_or(Error::InvalidParam("inode vanished during open"))?;
        let id = staging::extract_to_staging(
            container.index_mut(),
            inode,
            sid,
            size,
            old_bytes.as_deref(),
            staging,
        )?;
        staged.push(id);
        Ok(size)
    }

    /// positioned read through a handle
    pub fn read(&self, fd: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let st = self.lock_state()?;
        let &(ino, idx) = st.fd_map.get(&fd).ok_or(Error::BadHandle(fd))?;
        let inode = st.image.inode(ino).ok_or(Error::BadHandle(fd))?;
        let handle = inode
            .handles
            .get(idx as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(Error::BadHandle(fd))?;

        let Some(blob) = handle.blob else {
            // empty stream with no record
            return Ok(Vec::new());
        };
        let record = st
            .container
            .index()
            .get(blob)
            .ok_or(Error::BadHandle(fd))?;

        if let Some(file) = &handle.staging {
            let path = record
                .staging_path()
                .cloned()
                .unwrap_or_else(|| PathBuf::from("<staging>"));
            let mut buf = vec![0u8; len];
            let n = file.read_at(&mut buf, offset).with_path(path)?;
            buf.truncate(n);
            return Ok(buf);
        }

        let data = st.container.read_record_bytes(record)?;
        let start = (offset.min(data.len() as u64)) as usize;
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// positioned write through a writable handle
    pub fn write(&self, fd: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let st = self.lock_state()?;
        let &(ino, idx) = st.fd_map.get(&fd).ok_or(Error::BadHandle(fd))?;
        let inode = st.image.inode(ino).ok_or(Error::BadHandle(fd))?;
        let handle = inode
            .handles
            .get(idx as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(Error::BadHandle(fd))?;
        if !handle.writable {
            return Err(Error::BadHandle(fd));
        }
        // open() guarantees a staging descriptor for every writable handle
        let file = handle.staging.as_ref().ok_or(Error::BadHandle(fd))?;
        let path = handle
            .blob
            .and_then(|b| st.container.index().get(b))
            .and_then(|r| r.staging_path().cloned())
            .unwrap_or_else(|| PathBuf::from("<staging>"));
        file.write_all_at(data, offset).with_path(path)?;
        Ok(data.len())
    }

    /// truncate or extend a stream. shrinking below the declared size also
    /// shrinks that declared size; a stream not yet staged is materialized
    /// with the requested length.
    pub fn truncate(&self, name: &str, stream: Option<&str>, size: u64) -> Result<()> {
        let mut st = self.lock_state()?;
        if !st.flags.read_write {
            return Err(Error::ReadOnlyMount);
        }
        let ino = st
            .image
            .lookup(name)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        let (sid, blob) = {
            let inode = st
                .image
                .inode(ino)
                .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
            let s = inode
                .stream(stream)
                .ok_or_else(|| Error::StreamNotFound(stream.unwrap_or("<default>").to_string()))?;
            (s.id, s.blob)
        };

        let staged_path = blob
            .and_then(|b| st.container.index().get(b))
            .and_then(|r| r.staging_path().cloned());

        match (blob, staged_path) {
            (None, _) if size == 0 => Ok(()),
            (Some(blob), Some(path)) => {
                let file = OpenOptions::new().write(true).open(&path).with_path(&path)?;
                file.set_len(size).with_path(&path)?;
                if let Some(record) = st.container.index_mut().get_mut(blob) {
                    if size < record.size {
                        record.size = size;
                    }
                }
                Ok(())
            }
            _ => {
                // in-container (or absent) content: materialize only the
                // first `size` bytes
                self.materialize(&mut st, ino, sid, Some(size))?;
                Ok(())
            }
        }
    }

    /// release a handle. the converse of open(): handle release and its
    /// refcount side effects are one atomic unit.
    pub fn close(&self, fd: u64) -> Result<()> {
        let mut st = self.lock_state()?;
        let (ino, idx) = st.fd_map.remove(&fd).ok_or(Error::BadHandle(fd))?;
        let rw = st.flags.read_write;
        let MountState {
            container,
            image,
            staged,
            ..
        } = &mut *st;
        let inode = image.inode_mut(ino).ok_or(Error::BadHandle(fd))?;
        let handle = inode.take_handle(idx).ok_or(Error::BadHandle(fd))?;

        if rw {
            if let Some(blob) = handle.blob {
                let free_now = match container.index_mut().get_mut(blob) {
                    Some(record) => {
                        record.open_handles = record.open_handles.saturating_sub(1);
                        record.refcnt == 0 && record.open_handles == 0
                    }
                    None => false,
                };
                if free_now {
                    if let Some(freed) = container.index_mut().free(blob) {
                        if let Some(path) = freed.staging_path() {
                            let _ = fs::remove_file(path);
                        }
                    }
                    staged.retain(|id| *id != blob);
                }
            }
        }

        drop(handle); // closes any staging descriptor
        image.reap_inode(ino);
        Ok(())
    }

    /// current size of a stream (native size of the staging file when staged)
    pub fn stream_size(&self, name: &str, stream: Option<&str>) -> Result<u64> {
        let st = self.lock_state()?;
        let ino = st
            .image
            .lookup(name)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        let inode = st.image.inode(ino).ok_or_else(|| Error::EntryNotFound(name.to_string()))?;
        let s = inode
            .stream(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.unwrap_or("<default>").to_string()))?;
        match s.blob {
            None => Ok(0),
            Some(blob) => {
                let record = st
                    .container
                    .index()
                    .get(blob)
                    .ok_or(Error::InvalidParam("stream references a freed record"))?;
                match record.staging_path() {
                    Some(path) => Ok(fs::metadata(path).with_path(path)?.len()),
                    None => Ok(record.size),
                }
            }
        }
    }

    /// entry names in this image
    pub fn entries(&self) -> Result<Vec<String>> {
        let st = self.lock_state()?;
        Ok(st.image.entry_names())
    }
}

/// daemon-side handling of one unmount request: commit or discard, then
/// always attempt staging cleanup. the status travels back in Finished.
fn handle_unmount_request(shared: &MountShared, raw_flags: u32) -> i32 {
    let flags = UnmountFlags::from_bits(raw_flags);
    if !shared.flags.read_write {
        debug!("read-only mount, nothing to commit");
        return STATUS_OK;
    }

    let Ok(mut st) = shared.state.lock() else {
        return STATUS_COMMIT_FAILED;
    };

    let mut status = STATUS_OK;
    if flags.commit {
        let write_flags = WriteFlags {
            check_integrity: flags.check_integrity,
            rebuild: flags.rebuild,
            recompress: flags.recompress,
        };
        if let Err(e) = commit::run_commit(&mut st, write_flags) {
            let staging_dir = st
                .staging
                .as_ref()
                .map(|s| s.path().to_path_buf())
                .unwrap_or_default();
            let aborted = Error::CommitAborted {
                staging_dir,
                source: Box::new(e),
            };
            error!(error = %aborted, "commit failed");
            if let Ok(mut slot) = shared.commit_error.lock() {
                *slot = Some(aborted);
            }
            status = STATUS_COMMIT_FAILED;
        }
    } else {
        debug!("discarding staged changes");
    }

    if let Some(staging) = st.staging.take() {
        if let Err(e) = staging.delete() {
            error!(error = %e, "failed to delete staging directory");
            if status == STATUS_OK {
                status = STATUS_CLEANUP_FAILED;
            }
        }
    }
    st.lock.take();
    status
}

/// unmount with the default reply timeout
pub fn unmount(mountpoint: &Path, flags: UnmountFlags) -> Result<i32> {
    unmount_with(mountpoint, flags, DEFAULT_REPLY_TIMEOUT)
}

/// run the unmount handshake against the daemon serving `mountpoint`,
/// blocking until Finished arrives or the daemon is found dead.
pub fn unmount_with(mountpoint: &Path, flags: UnmountFlags, timeout: Duration) -> Result<i32> {
    if !flags.commit && (flags.check_integrity || flags.rebuild || flags.recompress) {
        return Err(Error::InvalidParam(
            "integrity, rebuild and recompress flags require commit",
        ));
    }
    let mountpoint = mountpoint.canonicalize().with_path(mountpoint)?;

    let endpoint = registry().remove(&mountpoint);
    match endpoint {
        Some(channel) => run_invoker(&channel, flags.bits(), &ProcessProbe, timeout),
        None if SocketChannel::exists_for(&mountpoint) => {
            let channel = SocketChannel::invoker_endpoint(&mountpoint)?;
            run_invoker(&channel, flags.bits(), &ProcessProbe, timeout)
        }
        None => Err(Error::MountNotFound(mountpoint)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;
    use crate::image::{SavedImage, SavedInode, SavedStream};
    use tempfile::tempdir;

    pub(crate) fn container_with_hello(dir: &Path) -> Container {
        let mut container = Container::create(&dir.join("container")).unwrap();
        let digest = digest_bytes(b"hello");
        container.write_object(&digest, b"hello").unwrap();
        let mut image = SavedImage::new("img", "test image");
        image.inodes.push(SavedInode {
            streams: vec![SavedStream {
                name: None,
                digest: Some(digest),
                size: 5,
            }],
        });
        image.entries.insert("hello".to_string(), 0);
        container.push_image(image);
        container.save().unwrap();
        Container::open(&dir.join("container")).unwrap()
    }

    pub(crate) fn mountpoint(dir: &Path) -> PathBuf {
        let mp = dir.join("mnt");
        fs::create_dir(&mp).unwrap();
        mp
    }

    fn quick_idle() -> MountOptions {
        MountOptions {
            idle_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        }
    }

    #[test]
    fn test_mount_setup_rejects_missing_image() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        let mp = mountpoint(dir.path());

        let result = Mount::start(
            container,
            &ImageSelector::Name("nope".to_string()),
            &mp,
            MountFlags::default(),
            quick_idle(),
        );
        assert!(matches!(result, Err(Error::ImageNotFound(_))));
    }

    #[test]
    fn test_mount_setup_rejects_split_writable() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        // rewrite the config with a part count of 2
        std::fs::write(
            container.path().join("config.toml"),
            "compression_level = 3\npart_count = 2\n",
        )
        .unwrap();
        let container = Container::open(container.path()).unwrap();
        let mp = mountpoint(dir.path());

        let result = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::read_write(),
            quick_idle(),
        );
        assert!(matches!(result, Err(Error::SplitUnsupported)));
    }

    #[test]
    fn test_mount_setup_rejects_modified_image() {
        let dir = tempdir().unwrap();
        let mut container = container_with_hello(dir.path());
        let mut fresh = SavedImage::new("exported", "");
        fresh.modified = true;
        container.push_image(fresh);
        let mp = mountpoint(dir.path());

        let result = Mount::start(
            container,
            &ImageSelector::Index(2),
            &mp,
            MountFlags::default(),
            quick_idle(),
        );
        assert!(matches!(result, Err(Error::ImageBusy(_))));
    }

    #[test]
    fn test_mount_rejects_second_mount_on_same_mountpoint() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        let container2 = Container::open(container.path()).unwrap();
        let mp = mountpoint(dir.path());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::default(),
            MountOptions::default(),
        )
        .unwrap();

        let result = Mount::start(
            container2,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::default(),
            quick_idle(),
        );
        assert!(matches!(result, Err(Error::AlreadyMounted(_))));

        assert_eq!(unmount(&mp, UnmountFlags::default()).unwrap(), STATUS_OK);
        mount.join().unwrap();
    }

    #[test]
    fn test_read_only_mount_rejects_writes() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        let mp = mountpoint(dir.path());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::default(),
            quick_idle(),
        )
        .unwrap();

        assert!(matches!(mount.create("new"), Err(Error::ReadOnlyMount)));
        assert!(matches!(
            mount.open("hello", None, true),
            Err(Error::ReadOnlyMount)
        ));

        // reads still work
        let fd = mount.open("hello", None, false).unwrap();
        assert_eq!(mount.read(fd, 0, 16).unwrap(), b"hello");
        assert_eq!(mount.read(fd, 2, 2).unwrap(), b"ll");
        mount.close(fd).unwrap();

        mount.join().unwrap(); // idle timeout
    }

    #[test]
    fn test_write_then_commit_scenario() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        let container_path = container.path().to_path_buf();
        let old_digest = digest_bytes(b"hello");
        let mp = mountpoint(dir.path());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::read_write(),
            MountOptions::default(),
        )
        .unwrap();

        let fd = mount.open("hello", None, true).unwrap();
        assert_eq!(mount.write(fd, 0, b"HELLO!").unwrap(), 6);
        mount.close(fd).unwrap();
        assert_eq!(mount.stream_size("hello", None).unwrap(), 6);

        assert_eq!(
            unmount(&mp, UnmountFlags::commit()).unwrap(),
            STATUS_OK
        );
        mount.join().unwrap();

        // remount and observe the committed content
        let container = Container::open(&container_path).unwrap();
        let new_digest = digest_bytes(b"HELLO!");
        assert!(container.index().lookup(&new_digest).is_some());
        // the pre-mount 5-byte record no longer exists
        assert!(container.index().lookup(&old_digest).is_none());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::default(),
            quick_idle(),
        )
        .unwrap();
        let fd = mount.open("hello", None, false).unwrap();
        assert_eq!(mount.read(fd, 0, 64).unwrap(), b"HELLO!");
        mount.close(fd).unwrap();
        assert_eq!(mount.stream_size("hello", None).unwrap(), 6);
        mount.join().unwrap();
    }

    #[test]
    fn test_unmount_discard_leaves_container_untouched() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        let container_path = container.path().to_path_buf();
        let mp = mountpoint(dir.path());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::read_write(),
            MountOptions::default(),
        )
        .unwrap();

        let fd = mount.open("hello", None, true).unwrap();
        mount.write(fd, 0, b"scratch that").unwrap();
        mount.close(fd).unwrap();
        let staging_dir = {
            let st = mount.lock_state().unwrap();
            st.staging.as_ref().unwrap().path().to_path_buf()
        };

        assert_eq!(
            unmount(&mp, UnmountFlags::default()).unwrap(),
            STATUS_OK
        );
        mount.join().unwrap();
        assert!(!staging_dir.exists());

        let container = Container::open(&container_path).unwrap();
        assert!(container.index().lookup(&digest_bytes(b"hello")).is_some());
        assert!(container
            .index()
            .lookup(&digest_bytes(b"scratch that"))
            .is_none());
    }

    #[test]
    fn test_split_on_shared_content_across_inodes() {
        let dir = tempdir().unwrap();
        // two independent files (separate inodes) sharing one record
        let mut container = Container::create(&dir.path().join("container")).unwrap();
        let digest = digest_bytes(b"shared");
        container.write_object(&digest, b"shared").unwrap();
        let mut image = SavedImage::new("img", "");
        for _ in 0..2 {
            image.inodes.push(SavedInode {
                streams: vec![SavedStream {
                    name: None,
                    digest: Some(digest),
                    size: 6,
                }],
            });
        }
        image.entries.insert("a".to_string(), 0);
        image.entries.insert("b".to_string(), 1);
        container.push_image(image);
        container.save().unwrap();
        let container = Container::open(&dir.path().join("container")).unwrap();
        let mp = mountpoint(dir.path());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::read_write(),
            quick_idle(),
        )
        .unwrap();

        let fd = mount.open("a", None, true).unwrap();
        {
            let st = mount.lock_state().unwrap();
            let old = st.container.index().lookup(&digest).unwrap();
            // original record keeps the other inode's reference only
            assert_eq!(st.container.index().get(old).unwrap().refcnt, 1);
            assert_eq!(st.staged.len(), 1);
            let new = st.staged[0];
            assert_ne!(new, old);
            assert_eq!(st.container.index().get(new).unwrap().refcnt, 1);
        }
        mount.write(fd, 0, b"edited").unwrap();
        mount.close(fd).unwrap();

        // "b" still reads the original content
        let fd = mount.open("b", None, false).unwrap();
        assert_eq!(mount.read(fd, 0, 16).unwrap(), b"shared");
        mount.close(fd).unwrap();

        mount.join().unwrap();
    }

    #[test]
    fn test_unlink_frees_staged_record_and_loose_file() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        let mp = mountpoint(dir.path());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::read_write(),
            quick_idle(),
        )
        .unwrap();

        let fd = mount.open("hello", None, true).unwrap();
        mount.write(fd, 0, b"doomed").unwrap();
        mount.close(fd).unwrap();

        let loose = {
            let st = mount.lock_state().unwrap();
            let id = st.staged[0];
            st.container
                .index()
                .get(id)
                .unwrap()
                .staging_path()
                .unwrap()
                .clone()
        };
        assert!(loose.exists());

        mount.unlink("hello").unwrap();
        assert!(!loose.exists());
        {
            let st = mount.lock_state().unwrap();
            assert!(st.staged.is_empty());
        }

        mount.join().unwrap();
    }

    #[test]
    fn test_truncate_shrinks_declared_size() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        let mp = mountpoint(dir.path());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::read_write(),
            quick_idle(),
        )
        .unwrap();

        // truncating in-container content materializes only the prefix
        mount.truncate("hello", None, 3).unwrap();
        assert_eq!(mount.stream_size("hello", None).unwrap(), 3);

        let fd = mount.open("hello", None, false).unwrap();
        assert_eq!(mount.read(fd, 0, 16).unwrap(), b"hel");
        mount.close(fd).unwrap();

        // native truncate once staged, extending with zeroes
        mount.truncate("hello", None, 5).unwrap();
        assert_eq!(mount.stream_size("hello", None).unwrap(), 5);
        let fd = mount.open("hello", None, false).unwrap();
        assert_eq!(mount.read(fd, 0, 16).unwrap(), b"hel\0\0");
        mount.close(fd).unwrap();

        mount.join().unwrap();
    }

    #[test]
    fn test_hard_link_and_unlink_accounting() {
        let dir = tempdir().unwrap();
        let container = container_with_hello(dir.path());
        let digest = digest_bytes(b"hello");
        let mp = mountpoint(dir.path());

        let mount = Mount::start(
            container,
            &ImageSelector::Index(1),
            &mp,
            MountFlags::read_write(),
            quick_idle(),
        )
        .unwrap();

        mount.link("hello", "hello2").unwrap();
        {
            let st = mount.lock_state().unwrap();
            let id = st.container.index().lookup(&digest).unwrap();
            assert_eq!(st.container.index().get(id).unwrap().refcnt, 2);
        }

        mount.unlink("hello").unwrap();
        {
            let st = mount.lock_state().unwrap();
            let id = st.container.index().lookup(&digest).unwrap();
            assert_eq!(st.container.index().get(id).unwrap().refcnt, 1);
        }

        mount.unlink("hello2").unwrap();
        {
            let st = mount.lock_state().unwrap();
            assert!(st.container.index().lookup(&digest).is_none());
        }

        mount.join().unwrap();
    }

    #[test]
    fn test_unmount_without_mount_fails() {
        let dir = tempdir().unwrap();
        let mp = mountpoint(dir.path());
        assert!(matches!(
            unmount(&mp, UnmountFlags::default()),
            Err(Error::MountNotFound(_))
        ));
    }

    #[test]
    fn test_unmount_flag_validation() {
        let dir = tempdir().unwrap();
        let mp = mountpoint(dir.path());
        let flags = UnmountFlags {
            commit: false,
            rebuild: true,
            ..Default::default()
        };
        assert!(matches!(
            unmount(&mp, flags),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn test_flags_bits_roundtrip() {
        let flags = UnmountFlags {
            commit: true,
            check_integrity: false,
            rebuild: true,
            recompress: false,
        };
        assert_eq!(UnmountFlags::from_bits(flags.bits()), flags);

        let mf = MountFlags::read_write();
        assert_eq!(MountFlags::from_bits(mf.bits()), mf);
    }
}
