//! Pure merge functions over report trees.
//!
//! Nothing here mutates its input: each function returns a new root that
//! shares every untouched subtree with the tree it was given.

use std::iter::once;
use std::sync::Arc;

use crate::error::SyncError;
use crate::report::{Category, FullNode, ShallowNode};

/// Keys a shallow payload may carry that are owned by the client-side tree.
const CLIENT_OWNED_KEYS: [&str; 5] = ["tags", "tags_index", "name_type_index", "uids", "counter"];

/// Replace `current`'s own fields with `update`'s, keeping the children,
/// tags and derived indices that a shallow entry does not carry.
pub fn unshallow(update: &ShallowNode, current: &FullNode) -> FullNode {
    let mut fields = update.fields.clone();
    for key in CLIENT_OWNED_KEYS {
        fields.extra.remove(key);
    }
    if let Some(tags) = current.fields.extra.get("tags") {
        fields.extra.insert("tags".to_string(), tags.clone());
    }

    FullNode {
        fields,
        entries: current.entries.clone(),
        assertions: current.assertions.clone(),
        indices: current.indices.clone(),
    }
}

/// Merge `update` into the tree rooted at `root`.
///
/// The entry is located by its `parent_uids`. Every ancestor on the way
/// down gets its hash cleared, since its aggregate state is now unknown.
/// A path that does not resolve leaves the tree as it was.
pub fn apply_shallow(root: &Arc<FullNode>, update: &ShallowNode) -> Result<Arc<FullNode>, SyncError> {
    let parent_uids = &update.fields.parent_uids;
    let target_uid = &update.fields.uid;
    let not_found = || SyncError::PathNotFound {
        path: parent_uids.iter().chain(once(target_uid)).cloned().collect(),
    };

    let Some((root_uid, below_root)) = parent_uids.split_first() else {
        if root.uid() != target_uid.as_str() {
            return Err(not_found());
        }
        return Ok(Arc::new(unshallow(update, root)));
    };
    if root.uid() != root_uid.as_str() {
        return Err(not_found());
    }

    // (ancestor, index of the child taken) from the root downwards.
    let mut chain: Vec<(&Arc<FullNode>, usize)> = Vec::with_capacity(parent_uids.len());
    let mut node = root;
    for uid in below_root.iter().chain(once(target_uid)) {
        let index = node
            .entries
            .iter()
            .position(|entry| entry.uid() == uid.as_str())
            .ok_or_else(not_found)?;
        chain.push((node, index));
        node = &node.entries[index];
    }

    let mut rebuilt = Arc::new(unshallow(update, node));
    for (ancestor, index) in chain.into_iter().rev() {
        let mut entries = ancestor.entries.clone();
        entries[index] = rebuilt;
        let mut fields = ancestor.fields.clone();
        fields.hash = None;
        rebuilt = Arc::new(FullNode::container(fields, entries));
    }
    Ok(rebuilt)
}

/// Re-apply local changes to a tree fetched from a stale snapshot.
///
/// `fetched` was built from `base`; `current` is what the tree became in
/// the meantime. Subtrees the fetcher reused from `base` are swapped for
/// their `current` counterparts. Subtrees untouched locally since `base`
/// are taken as fetched.
///
/// A node patched since `base` may have been downloaded before the server
/// applied the patch, so it keeps its `current` own fields with the hash
/// cleared. Its ancestors lose their hash too, and the next poll fetches
/// the whole path again.
pub fn rebase(fetched: &Arc<FullNode>, base: &Arc<FullNode>, current: &Arc<FullNode>) -> Arc<FullNode> {
    if Arc::ptr_eq(fetched, base) {
        return current.clone();
    }
    if Arc::ptr_eq(base, current) {
        return fetched.clone();
    }

    let mut fields = current.fields.clone();
    fields.hash = None;
    if fetched.fields.category == Category::Testcase {
        return Arc::new(FullNode::leaf(fields, fetched.assertions.clone()));
    }

    let entries: Vec<Arc<FullNode>> = fetched
        .entries
        .iter()
        .map(|child| match (base.child(child.uid()), current.child(child.uid())) {
            (Some(base_child), Some(current_child)) => rebase(child, base_child, current_child),
            _ => child.clone(),
        })
        .collect();
    Arc::new(FullNode::container(fields, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Address, NodeHash, RuntimeStatus};
    use serde_json::json;

    fn tree() -> Arc<FullNode> {
        Arc::new(
            serde_json::from_value(json!({
                "uid": "plan",
                "category": "report",
                "hash": "r",
                "entries": [
                    {
                        "uid": "T1",
                        "category": "test",
                        "hash": "h1",
                        "parent_uids": ["plan"],
                        "tags": ["nightly"],
                        "entries": [{
                            "uid": "S1",
                            "category": "suite",
                            "hash": "s1",
                            "parent_uids": ["plan", "T1"],
                            "entries": [{
                                "uid": "C1",
                                "category": "testcase",
                                "hash": "c1",
                                "parent_uids": ["plan", "T1", "S1"],
                                "runtime_status": "ready",
                                "entries": [{"type": "Log", "message": "hi"}]
                            }]
                        }]
                    },
                    {
                        "uid": "T2",
                        "category": "test",
                        "hash": "h2",
                        "parent_uids": ["plan"],
                        "entries": []
                    }
                ]
            }))
            .unwrap(),
        )
    }

    fn find<'a>(root: &'a FullNode, path: &[&str]) -> &'a FullNode {
        let address = Address::new(path.iter().map(|s| s.to_string()).collect());
        root.find(&address).unwrap()
    }

    fn shallow(root: &FullNode, path: &[&str]) -> ShallowNode {
        find(root, path).to_shallow()
    }

    #[test]
    fn test_target_fields_replaced_children_kept() {
        let root = tree();
        let mut update = shallow(&root, &["T1", "S1"]);
        update.fields.runtime_status = Some(RuntimeStatus::Running);
        update.fields.hash = Some(NodeHash::from("s2"));

        let patched = apply_shallow(&root, &update).unwrap();
        let before = find(&root, &["T1", "S1"]);
        let after = find(&patched, &["T1", "S1"]);

        assert_eq!(after.fields, update.fields);
        assert_eq!(after.entries, before.entries);
        assert!(Arc::ptr_eq(&after.entries[0], &before.entries[0]));
        assert_eq!(after.indices, before.indices);
    }

    #[test]
    fn test_ancestors_lose_hash_but_keep_siblings() {
        let root = tree();
        let mut update = shallow(&root, &["T1", "S1", "C1"]);
        update.fields.runtime_status = Some(RuntimeStatus::Running);

        let patched = apply_shallow(&root, &update).unwrap();
        assert!(patched.hash().is_none());
        assert!(find(&patched, &["T1"]).hash().is_none());
        assert!(find(&patched, &["T1", "S1"]).hash().is_none());

        // The untouched sibling test is shared, not copied.
        assert!(Arc::ptr_eq(
            patched.child("T2").unwrap(),
            root.child("T2").unwrap()
        ));
        // The original tree is not modified.
        assert_eq!(find(&root, &["T1"]).hash(), Some(&NodeHash::from("h1")));
    }

    #[test]
    fn test_leaf_keeps_assertions() {
        let root = tree();
        let mut update = shallow(&root, &["T1", "S1", "C1"]);
        update.fields.runtime_status = Some(RuntimeStatus::Resetting);

        let patched = apply_shallow(&root, &update).unwrap();
        let case = find(&patched, &["T1", "S1", "C1"]);
        assert_eq!(case.assertions, vec![json!({"type": "Log", "message": "hi"})]);
        assert_eq!(case.fields.runtime_status, Some(RuntimeStatus::Resetting));
    }

    #[test]
    fn test_tags_and_indices_carried_from_current() {
        let root = tree();
        let mut update = shallow(&root, &["T1"]);
        update.fields.extra.remove("tags");
        update.fields.extra.insert("counter".into(), json!({"total": 99}));

        let patched = apply_shallow(&root, &update).unwrap();
        let test = find(&patched, &["T1"]);
        assert_eq!(test.fields.extra.get("tags"), Some(&json!(["nightly"])));
        assert!(test.fields.extra.get("counter").is_none());
        assert_eq!(test.indices, find(&root, &["T1"]).indices);
    }

    #[test]
    fn test_merge_twice_equals_merge_once() {
        let root = tree();
        let mut update = shallow(&root, &["T1", "S1", "C1"]);
        update.fields.runtime_status = Some(RuntimeStatus::Running);
        update.fields.hash = Some(NodeHash::from("c2"));

        let first = apply_shallow(&root, &update).unwrap();
        let second = apply_shallow(&first, &update).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_root_update_keeps_entries() {
        let root = tree();
        let mut update = root.to_shallow();
        update.fields.runtime_status = Some(RuntimeStatus::Resetting);
        update.fields.hash = Some(NodeHash::from("r2"));

        let patched = apply_shallow(&root, &update).unwrap();
        assert_eq!(patched.fields.runtime_status, Some(RuntimeStatus::Resetting));
        assert_eq!(patched.hash(), Some(&NodeHash::from("r2")));
        assert!(Arc::ptr_eq(&patched.entries[0], &root.entries[0]));
    }

    #[test]
    fn test_missing_target_is_drift() {
        let root = tree();
        let mut update = shallow(&root, &["T1", "S1", "C1"]);
        update.fields.uid = "C9".to_string();

        let err = apply_shallow(&root, &update).unwrap_err();
        assert!(matches!(
            err,
            SyncError::PathNotFound { path } if path == vec!["plan", "T1", "S1", "C9"]
        ));
    }

    #[test]
    fn test_missing_ancestor_is_drift() {
        let root = tree();
        let mut update = shallow(&root, &["T1", "S1", "C1"]);
        update.fields.parent_uids = vec!["plan".into(), "T1".into(), "S7".into()];
        assert!(apply_shallow(&root, &update).is_err());

        update.fields.parent_uids = vec!["other-plan".into(), "T1".into(), "S1".into()];
        assert!(apply_shallow(&root, &update).is_err());
    }

    #[test]
    fn test_rebase_returns_current_when_nothing_was_fetched() {
        let base = tree();
        let mut update = shallow(&base, &["T1", "S1", "C1"]);
        update.fields.runtime_status = Some(RuntimeStatus::Running);
        let current = apply_shallow(&base, &update).unwrap();

        let rebased = rebase(&base, &base, &current);
        assert!(Arc::ptr_eq(&rebased, &current));
    }

    #[test]
    fn test_rebase_keeps_patch_on_reused_subtree() {
        let base = tree();

        // A command lands on T1 while the poll is in flight...
        let mut update = shallow(&base, &["T1", "S1", "C1"]);
        update.fields.runtime_status = Some(RuntimeStatus::Running);
        let current = apply_shallow(&base, &update).unwrap();

        // ...and the poll downloaded a new root and T2 but reused T1.
        let mut t2 = (**base.child("T2").unwrap()).clone();
        t2.fields.hash = Some(NodeHash::from("h2b"));
        let mut root_fields = base.fields.clone();
        root_fields.hash = Some(NodeHash::from("r2"));
        let fetched = Arc::new(FullNode::container(
            root_fields,
            vec![base.child("T1").unwrap().clone(), Arc::new(t2)],
        ));

        let rebased = rebase(&fetched, &base, &current);
        assert!(rebased.hash().is_none());
        assert_eq!(
            find(&rebased, &["T1", "S1", "C1"]).fields.runtime_status,
            Some(RuntimeStatus::Running)
        );
        assert!(Arc::ptr_eq(
            rebased.child("T1").unwrap(),
            current.child("T1").unwrap()
        ));
        assert!(Arc::ptr_eq(
            rebased.child("T2").unwrap(),
            fetched.child("T2").unwrap()
        ));
    }

    #[test]
    fn test_rebase_prefers_patch_over_refetched_copy() {
        let base = tree();

        let mut update = shallow(&base, &["T1", "S1", "C1"]);
        update.fields.runtime_status = Some(RuntimeStatus::Running);
        update.fields.hash = Some(NodeHash::from("c2"));
        let current = apply_shallow(&base, &update).unwrap();

        // The poll read T1 before the server applied the command.
        let mut stale = base.fields.clone();
        stale.hash = Some(NodeHash::from("r2"));
        let mut fetched_case = (*find(&base, &["T1", "S1", "C1"])).clone();
        fetched_case.fields.hash = Some(NodeHash::from("c1b"));
        fetched_case.assertions = vec![json!({"type": "Log", "message": "again"})];
        let suite = FullNode::container(
            find(&base, &["T1", "S1"]).fields.clone(),
            vec![Arc::new(fetched_case)],
        );
        let test = FullNode::container(find(&base, &["T1"]).fields.clone(), vec![Arc::new(suite)]);
        let fetched = Arc::new(FullNode::container(
            stale,
            vec![Arc::new(test), base.child("T2").unwrap().clone()],
        ));

        let rebased = rebase(&fetched, &base, &current);
        let case = find(&rebased, &["T1", "S1", "C1"]);
        assert_eq!(case.fields.runtime_status, Some(RuntimeStatus::Running));
        assert!(case.hash().is_none());
        assert_eq!(case.assertions, vec![json!({"type": "Log", "message": "again"})]);
        assert!(find(&rebased, &["T1", "S1"]).hash().is_none());
        assert!(find(&rebased, &["T1"]).hash().is_none());
        assert!(rebased.hash().is_none());
        assert!(Arc::ptr_eq(
            rebased.child("T2").unwrap(),
            base.child("T2").unwrap()
        ));
    }

    #[test]
    fn test_rebase_keeps_root_patch_over_stale_root() {
        let base = tree();
        let mut update = base.to_shallow();
        update.fields.runtime_status = Some(RuntimeStatus::Resetting);
        update.fields.hash = Some(NodeHash::from("r2"));
        let current = apply_shallow(&base, &update).unwrap();

        let mut stale = base.fields.clone();
        stale.runtime_status = Some(RuntimeStatus::Ready);
        stale.hash = Some(NodeHash::from("r3"));
        let fetched = Arc::new(FullNode::container(stale, base.entries.clone()));

        let rebased = rebase(&fetched, &base, &current);
        assert_eq!(rebased.fields.runtime_status, Some(RuntimeStatus::Resetting));
        assert!(rebased.hash().is_none());
    }
}
