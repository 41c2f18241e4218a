//! bale - content-addressed binary-image archive
//!
//! a library for storing logical images in a shared container that keeps each
//! piece of content exactly once. content is keyed by its SHA-256 digest and
//! reference-counted across images; images can be migrated between containers
//! transactionally and mounted as a writable overlay whose edits accumulate
//! in a staging area until an explicit commit folds them back into the store.
//!
//! # Core concepts
//!
//! - **Blob record**: metadata for one piece of stored content (digest,
//!   refcount, physical location), owned by the container's digest index
//! - **Image**: a flat namespace of entries over inodes and streams; several
//!   entries naming one inode are hard links
//! - **Export**: copies or moves images between containers with exact
//!   rollback on failure
//! - **Mount**: binds an image to a mountpoint, staging modified content as
//!   loose files; a two-channel handshake drives commit at unmount
//!
//! # Example usage
//!
//! ```no_run
//! use bale::{Container, ImageSelector, Mount, MountFlags, MountOptions, UnmountFlags};
//! use std::path::Path;
//!
//! // open a container and mount its first image read-write
//! let container = Container::open(Path::new("/data/apps.bale")).unwrap();
//! let mount = Mount::start(
//!     container,
//!     &ImageSelector::Index(1),
//!     Path::new("/mnt/apps"),
//!     MountFlags::read_write(),
//!     MountOptions::default(),
//! )
//! .unwrap();
//!
//! // edits accumulate in the staging area through the mount handle ...
//! let fd = mount.open("report.txt", None, true).unwrap();
//! mount.write(fd, 0, b"updated").unwrap();
//! mount.close(fd).unwrap();
//!
//! // ... until an explicit commit at unmount
//! bale::unmount(Path::new("/mnt/apps"), UnmountFlags::commit()).unwrap();
//! mount.join().unwrap();
//! ```

mod blob;
mod config;
mod container;
mod digest;
mod error;
mod image;

pub mod mount;
pub mod ops;
pub mod protocol;

pub use blob::{BlobId, BlobLocation, BlobRecord, DigestIndex};
pub use config::Config;
pub use container::{Container, ContainerLock, ImageSelector, Manifest, VerifyReport, WriteFlags};
pub use digest::{digest_bytes, digest_file, Digest, DigestHasher};
pub use error::{Error, Result};
pub use image::{FileHandle, Image, Inode, InodeId, SavedImage, SavedInode, SavedStream, Stream};
pub use mount::{unmount, unmount_with, Mount, MountFlags, MountOptions, UnmountFlags};
pub use ops::{export_images, ExportMode, ExportOptions};
