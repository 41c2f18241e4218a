use std::path::PathBuf;

use crate::digest::Digest;

/// error type for bale operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("container not found at {0}")]
    NoContainer(PathBuf),

    #[error("container already exists at {0}")]
    ContainerExists(PathBuf),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("there is already an image named \"{0}\" in the destination container")]
    DuplicateImageName(String),

    #[error("duplicate digest in index: {0}")]
    DuplicateDigest(Digest),

    #[error("content not found for digest {0}")]
    ContentNotFound(Digest),

    #[error("corrupt object: digest mismatch for {0}")]
    CorruptObject(Digest),

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("cannot mount a multi-part container read-write")]
    SplitUnsupported,

    #[error("image \"{0}\" has pending changes and cannot be mounted until the container is rewritten")]
    ImageBusy(String),

    #[error("lock contention on container")]
    LockContention,

    #[error("container index was consumed by a move export")]
    ContainerConsumed,

    #[error("already mounted at {0}")]
    AlreadyMounted(PathBuf),

    #[error("no mount found at {0}")]
    MountNotFound(PathBuf),

    #[error("mount is read-only")]
    ReadOnlyMount,

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("entry already exists: {0}")]
    EntryExists(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("timed out waiting for filesystem daemon")]
    Timeout,

    #[error("the filesystem daemon has crashed; changes to the container may not have been committed")]
    DaemonCrashed,

    #[error("invalid unmount message: {0}")]
    InvalidMessage(String),

    #[error("message channel closed")]
    ChannelClosed,

    #[error("commit failed, staged changes under {staging_dir} were not merged: {source}")]
    CommitAborted {
        staging_dir: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("invalid digest hex: {0}")]
    InvalidDigestHex(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
