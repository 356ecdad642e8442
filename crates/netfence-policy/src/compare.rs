//! Diff engine for backend objects
//!
//! Objects are matched by identity only. Content equality uses
//! [`BackendObject::fingerprint`], which ignores system-managed fields, so an
//! object listed from the backend compares equal to the same object built
//! fresh from the custom resource.

use std::collections::{HashMap, HashSet};

use netfence_common::model::BackendObject;

/// Result of comparing existing and desired objects of one kind
#[derive(Clone, Debug, PartialEq)]
pub struct Diff<T> {
    /// Desired objects that are new or differ from what exists, in desired order
    pub changed: Vec<T>,
    /// Existing objects no longer desired, in existing order
    pub stale: Vec<T>,
}

impl<T> Default for Diff<T> {
    fn default() -> Self {
        Self {
            changed: Vec::new(),
            stale: Vec::new(),
        }
    }
}

impl<T> Diff<T> {
    /// True when nothing needs to be written
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.stale.is_empty()
    }
}

/// Classify `desired` against `existing`
pub fn compare_resources<T: BackendObject>(existing: Vec<T>, desired: Vec<T>) -> Diff<T> {
    let existing_fingerprints: HashMap<String, String> = existing
        .iter()
        .map(|obj| (obj.id().to_string(), obj.fingerprint()))
        .collect();
    let desired_ids: HashSet<String> = desired.iter().map(|obj| obj.id().to_string()).collect();

    let changed = desired
        .into_iter()
        .filter(|obj| {
            existing_fingerprints
                .get(obj.id())
                .is_none_or(|fp| *fp != obj.fingerprint())
        })
        .collect();

    let stale = existing
        .into_iter()
        .filter(|obj| !desired_ids.contains(obj.id()))
        .collect();

    Diff { changed, stale }
}

/// Whether `desired` must be written given what currently exists
pub fn compare_resource<T: BackendObject>(existing: Option<&T>, desired: &T) -> bool {
    existing.is_none_or(|e| e.fingerprint() != desired.fingerprint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netfence_common::model::{Group, GroupExpression};

    fn group(id: &str, value: &str) -> Group {
        Group {
            id: id.to_string(),
            expression: vec![GroupExpression::tag_equals("SegmentPort", "app", value)],
            ..Default::default()
        }
    }

    fn ids(groups: &[Group]) -> Vec<&str> {
        groups.iter().map(|g| g.id.as_str()).collect()
    }

    #[test]
    fn classifies_new_and_removed_objects() {
        let existing = vec![group("A", "1"), group("B", "2")];
        let desired = vec![group("A", "1"), group("C", "3")];

        let diff = compare_resources(existing, desired);

        assert_eq!(ids(&diff.changed), vec!["C"]);
        assert_eq!(ids(&diff.stale), vec!["B"]);
    }

    #[test]
    fn content_change_under_same_id_is_changed_not_stale() {
        let existing = vec![group("A", "1")];
        let desired = vec![group("A", "2")];

        let diff = compare_resources(existing, desired);

        assert_eq!(ids(&diff.changed), vec!["A"]);
        assert!(diff.stale.is_empty());
    }

    #[test]
    fn revision_alone_is_not_a_change() {
        let mut listed = group("A", "1");
        listed.revision = Some(4);

        let diff = compare_resources(vec![listed], vec![group("A", "1")]);
        assert!(diff.is_empty());
    }

    #[test]
    fn preserves_input_order() {
        let existing = vec![group("Z", "0"), group("X", "0"), group("Y", "0")];
        let desired = vec![group("N2", "0"), group("N1", "0")];

        let diff = compare_resources(existing, desired);

        assert_eq!(ids(&diff.changed), vec!["N2", "N1"]);
        assert_eq!(ids(&diff.stale), vec!["Z", "X", "Y"]);
    }

    #[test]
    fn single_object_comparison() {
        let a = group("A", "1");
        assert!(compare_resource(None, &a));
        assert!(!compare_resource(Some(&a), &a));
        assert!(compare_resource(Some(&group("A", "2")), &a));
    }
}
