//! Deletion marking and write ordering
//!
//! Within one hierarchical patch, objects to remove are listed before objects
//! to create or update. The removal prefix runs in reverse of the order the
//! objects were discovered.

use netfence_common::model::BackendObject;
use netfence_common::MARKED_FOR_DELETE;

use crate::compare::Diff;

/// Turn stale objects into deletion requests, reversing their order
pub fn mark_for_delete<T: BackendObject>(stale: Vec<T>) -> Vec<T> {
    stale
        .into_iter()
        .rev()
        .map(|mut obj| {
            obj.set_marked_for_delete(MARKED_FOR_DELETE);
            obj
        })
        .collect()
}

/// Final object list for a patch: deletions first, then changes
pub fn assemble<T: BackendObject>(diff: Diff<T>) -> Vec<T> {
    let Diff { changed, stale } = diff;
    let mut out = mark_for_delete(stale);
    out.extend(changed);
    out
}
