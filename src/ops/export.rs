//! migrating images between containers with all-or-nothing semantics.
//!
//! For every non-empty stream of every exported inode the destination is
//! consulted first, then the source; content missing from both means the
//! source container is structurally inconsistent. Copy mode clones records,
//! move mode transfers them without touching bytes. Reference counts grow by
//! the consuming inode's link count, mirrored into out_refcnt so a failure
//! mid-walk can subtract exactly this operation's deltas and restore the
//! destination to its pre-export state.

use tracing::{debug, info};

use crate::container::{Container, ImageSelector};
use crate::error::{Error, Result};

/// whether exported content is cloned or handed over
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportMode {
    Copy,
    /// transfer ownership without duplication; the source container's index
    /// is consumed and the source can no longer be saved
    Move,
}

/// options for an export
#[derive(Clone, Debug)]
pub struct ExportOptions {
    /// destination image name; source name if unset
    pub name: Option<String>,
    /// destination description; source description if unset
    pub description: Option<String>,
    /// give exported images empty names
    pub no_names: bool,
    /// give exported images empty descriptions
    pub no_descriptions: bool,
    /// repoint the destination boot image at the exported image
    pub boot: bool,
    pub mode: ExportMode,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            no_names: false,
            no_descriptions: false,
            boot: false,
            mode: ExportMode::Copy,
        }
    }
}

/// export the selected source image(s) into the destination container.
///
/// The destination is updated transactionally: structural problems (bad
/// flag combinations, name collisions) are detected before any mutation,
/// and a failure during the walk rolls the destination back exactly.
pub fn export_images(
    src: &mut Container,
    selector: &ImageSelector,
    dst: &mut Container,
    opts: &ExportOptions,
) -> Result<()> {
    if src.is_consumed() {
        return Err(Error::ContainerConsumed);
    }
    let all = matches!(selector, ImageSelector::All);
    if all
        && ((opts.name.is_some() && !opts.no_names)
            || (opts.description.is_some() && !opts.no_descriptions))
    {
        return Err(Error::InvalidParam(
            "image name and description must be left unset for multi-image export",
        ));
    }

    let range: Vec<usize> = if all {
        (0..src.images().len()).collect()
    } else {
        vec![src.select(selector)?]
    };

    // structural checks happen before any mutation; only missing content can
    // fail the walk below
    let mut dest_names = Vec::with_capacity(range.len());
    for &i in &range {
        let src_image = &src.images()[i];
        let name = if opts.no_names {
            String::new()
        } else {
            opts.name.clone().unwrap_or_else(|| src_image.name.clone())
        };
        let taken =
            dst.image_name_in_use(&name) || (!name.is_empty() && dest_names.contains(&name));
        if taken {
            return Err(Error::DuplicateImageName(name));
        }
        dest_names.push(name);
    }

    // enable rollbacks: clear the per-operation state on every
    // destination record
    for id in dst.index().ids() {
        if let Some(record) = dst.index_mut().get_mut(id) {
            record.out_refcnt = 0;
            record.was_exported = false;
        }
    }
    let orig_dest_count = dst.images().len();
    let src_boot = src.boot_index();

    for (pos, &i) in range.iter().enumerate() {
        if let Err(e) = export_one(src, i, dst, opts, &dest_names[pos]) {
            rollback(dst, orig_dest_count);
            if opts.mode == ExportMode::Move {
                // records may already have been transferred out of the
                // source index; the source is no longer saveable either way
                src.consume();
            }
            return Err(e);
        }
    }

    for (pos, &i) in range.iter().enumerate() {
        if opts.boot && (!all || (i as u32 + 1) == src_boot) {
            dst.set_boot_index((orig_dest_count + 1 + pos) as u32)?;
        }
    }

    if opts.mode == ExportMode::Move {
        // the transferred records are gone from the source index; the
        // source manifest no longer matches it
        src.consume();
    }
    info!(
        images = range.len(),
        mode = ?opts.mode,
        "export complete"
    );
    Ok(())
}

fn export_one(
    src: &mut Container,
    src_idx: usize,
    dst: &mut Container,
    opts: &ExportOptions,
    dest_name: &str,
) -> Result<()> {
    let mut image = src.images()[src_idx].clone();

    for (inode_idx, inode) in image.inodes.iter().enumerate() {
        let nlink = image.nlink(inode_idx as u32);
        for stream in &inode.streams {
            // empty streams carry no content
            let Some(digest) = stream.digest else {
                continue;
            };

            let dest_id = match dst.index().lookup(&digest) {
                Some(id) => id,
                None => {
                    let src_id = src
                        .index()
                        .lookup(&digest)
                        .ok_or(Error::ContentNotFound(digest))?;
                    let mut record = match opts.mode {
                        ExportMode::Move => src
                            .index_mut()
                            .free(src_id)
                            .ok_or(Error::ContentNotFound(digest))?,
                        ExportMode::Copy => src
                            .index()
                            .get(src_id)
                            .cloned()
                            .ok_or(Error::ContentNotFound(digest))?,
                    };
                    record.refcnt = 0;
                    record.out_refcnt = 0;
                    record.was_exported = true;
                    record.open_handles = 0;
                    dst.index_mut().insert(record)?
                }
            };

            // one reference per hard link, and the same amount into
            // out_refcnt for rollback
            if let Some(record) = dst.index_mut().get_mut(dest_id) {
                record.refcnt += nlink;
                record.out_refcnt += nlink;
            }
        }
    }

    image.name = dest_name.to_string();
    if opts.no_descriptions {
        image.description = String::new();
    } else if let Some(description) = &opts.description {
        image.description = description.clone();
    }
    // freshly exported images stay unmountable until the container is
    // rewritten
    image.modified = true;
    dst.push_image(image);
    debug!(image = src_idx + 1, name = dest_name, "image exported");
    Ok(())
}

/// restore the destination exactly to its pre-export state: subtract this
/// operation's reference deltas, then unlink and free every record the
/// operation created.
fn rollback(dst: &mut Container, orig_dest_count: usize) {
    debug!("rolling back failed export");
    dst.truncate_images(orig_dest_count);
    for id in dst.index().ids() {
        let was_exported = {
            let Some(record) = dst.index_mut().get_mut(id) else {
                continue;
            };
            record.refcnt -= record.out_refcnt;
            record.out_refcnt = 0;
            record.was_exported
        };
        if was_exported {
            dst.index_mut().unlink(id);
            dst.index_mut().free(id);
        }
    }
}
