//! reconciling staged modifications back into the container.
//!
//! Runs once at the end of a writable mount, before the container rewrite.
//! Every handle still bound to a staging-backed record is force-closed, each
//! loose file is hashed, duplicates are merged into the surviving record,
//! empty files drop their record, and the rest are promoted to durable
//! content under the computed digest. Any failure aborts the whole commit;
//! there is no retry at this layer.

use std::collections::HashSet;
use std::fs;

use tracing::{debug, info};

use crate::blob::BlobId;
use crate::container::WriteFlags;
use crate::digest::digest_file;
use crate::error::{Error, IoResultExt, Result};

use super::MountState;

/// reconcile the staging overlay into the digest index, then rewrite the
/// container
pub(crate) fn run_commit(state: &mut MountState, flags: WriteFlags) -> Result<()> {
    let MountState {
        container,
        image,
        image_idx,
        staged,
        fd_map,
        ..
    } = state;

    // 1. force-close every handle still bound to a staging-backed record
    let staged_set: HashSet<BlobId> = staged
        .iter()
        .copied()
        .filter(|id| {
            container
                .index()
                .get(*id)
                .map(|r| r.is_staged())
                .unwrap_or(false)
        })
        .collect();
    for ino in image.inode_ids() {
        let Some(inode) = image.inode_mut(ino) else {
            continue;
        };
        for idx in 0..inode.handles.len() {
            let bound = inode.handles[idx]
                .as_ref()
                .and_then(|h| h.blob)
                .map(|b| staged_set.contains(&b))
                .unwrap_or(false);
            if !bound {
                continue;
            }
            if let Some(handle) = inode.take_handle(idx as u16) {
                if let Some(blob) = handle.blob {
                    if let Some(record) = container.index_mut().get_mut(blob) {
                        record.open_handles = record.open_handles.saturating_sub(1);
                    }
                }
            }
        }
    }
    fd_map.retain(|_, (ino, idx)| {
        image
            .inode(*ino)
            .and_then(|inode| inode.handles.get(*idx as usize))
            .and_then(|slot| slot.as_ref())
            .is_some()
    });

    // 2. hash every staged loose file, then merge, drop or promote
    for &id in staged.iter() {
        let Some(path) = container
            .index()
            .get(id)
            .and_then(|r| r.staging_path())
            .cloned()
        else {
            // freed during the mount, or already promoted
            continue;
        };
        let refcnt = container
            .index()
            .get(id)
            .map(|r| r.refcnt)
            .unwrap_or(0);

        let (digest, size) = digest_file(&path)?;

        let index = container.index_mut();
        if let Some(dup) = index.lookup(&digest) {
            // identical content already exists: merge into the survivor
            debug!(%digest, "merging staged record into existing duplicate");
            if let Some(survivor) = index.get_mut(dup) {
                survivor.refcnt += refcnt;
            }
            image.repoint_blob(id, Some(dup), Some(digest));
            index.free(id);
            fs::remove_file(&path).with_path(&path)?;
        } else if size == 0 {
            // zero-length stream: no record needed
            debug!("dropping record for empty staged stream");
            image.repoint_blob(id, None, None);
            index.free(id);
            fs::remove_file(&path).with_path(&path)?;
        } else {
            // promote in place under the computed digest
            let record = index
                .get_mut(id)
                .ok_or(Error::InvalidParam("staged record vanished during commit"))?;
            record.digest = Some(digest);
            record.size = size;
            index.link(id)?;
            image.repoint_blob(id, Some(id), Some(digest));
        }
    }
    staged.clear();

    // 3. serialize updated metadata and rewrite the container
    image.modified = false;
    let saved = image.to_saved(container.index());
    container.replace_image(*image_idx, saved)?;
    container.save_with(flags)?;
    info!(image = %image.name, "commit complete");
    Ok(())
}
