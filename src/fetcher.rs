use futures::future::{try_join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::debug;

use crate::client::ReportApi;
use crate::error::SyncError;
use crate::report::{hash_unchanged, Address, Category, FullNode, WireNode};

/// Builds an up-to-date report tree, downloading only the entries whose
/// hash differs from the previously known tree.
pub struct TreeFetcher<'a, A> {
    api: &'a A,
}

/// Which categories may appear at a given depth below the root.
fn expected_at(depth: usize, category: &Category) -> bool {
    matches!(
        (depth, category),
        (0, Category::Report)
            | (1, Category::Test)
            | (2, Category::Suite)
            | (3, Category::Testcase | Category::Parametrization)
            | (4, Category::Testcase)
    )
}

fn check_category(wire: &WireNode, depth: usize) -> Result<(), SyncError> {
    let category = &wire.fields.category;
    if let Category::Other(name) = category {
        return Err(SyncError::UnknownCategory {
            uid: wire.fields.uid.clone(),
            category: name.clone(),
        });
    }
    if !expected_at(depth, category) {
        return Err(SyncError::UnexpectedCategory {
            uid: wire.fields.uid.clone(),
            category: category.to_string(),
            depth,
        });
    }
    Ok(())
}

impl<'a, A: ReportApi> TreeFetcher<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self { api }
    }

    /// Fetch the report. When the root hash is unchanged the previous tree
    /// is returned as-is (same `Arc`) after a single request.
    pub async fn fetch(&self, previous: Option<&Arc<FullNode>>) -> Result<Arc<FullNode>, SyncError> {
        let root = self.api.get_entry(&Address::root()).await?;
        check_category(&root, 0)?;

        if let Some(prev) = previous {
            if hash_unchanged(prev.hash(), root.fields.hash.as_ref()) {
                debug!("Report hash unchanged, reusing tree");
                return Ok(prev.clone());
            }
        }

        let entries = self
            .resolve_children(Address::root(), previous.map(|p| p.as_ref()))
            .await?;
        Ok(Arc::new(FullNode::container(root.fields, entries)))
    }

    fn resolve_children<'b>(
        &'b self,
        address: Address,
        previous: Option<&'b FullNode>,
    ) -> BoxFuture<'b, Result<Vec<Arc<FullNode>>, SyncError>> {
        async move {
            let listing = self.api.list_children(&address).await?;
            let resolved = listing.into_iter().map(|wire| {
                let prior = previous.and_then(|p| p.child(&wire.fields.uid));
                let child_address = address.child(&wire.fields.uid);
                self.resolve_entry(child_address, wire, prior)
            });
            try_join_all(resolved).await
        }
        .boxed()
    }

    async fn resolve_entry(
        &self,
        address: Address,
        wire: WireNode,
        previous: Option<&Arc<FullNode>>,
    ) -> Result<Arc<FullNode>, SyncError> {
        check_category(&wire, address.depth())?;

        if let Some(prev) = previous {
            if hash_unchanged(prev.hash(), wire.fields.hash.as_ref()) {
                return Ok(prev.clone());
            }
        }

        // Leaves come complete in their parent's listing.
        if wire.fields.category == Category::Testcase {
            let assertions = wire.entries.unwrap_or_default();
            return Ok(Arc::new(FullNode::leaf(wire.fields, assertions)));
        }

        debug!(path = ?address.uids(), "Entry changed, fetching children");
        let entries = self
            .resolve_children(address, previous.map(|p| p.as_ref()))
            .await?;
        Ok(Arc::new(FullNode::container(wire.fields, entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::NodeFields;

    fn wire(uid: &str, category: Category) -> WireNode {
        WireNode {
            fields: NodeFields::new(uid, category, vec![]),
            entries: None,
            entry_uids: None,
        }
    }

    #[test]
    fn test_categories_by_depth() {
        assert!(check_category(&wire("plan", Category::Report), 0).is_ok());
        assert!(check_category(&wire("T1", Category::Test), 1).is_ok());
        assert!(check_category(&wire("C1", Category::Parametrization), 3).is_ok());
        assert!(check_category(&wire("C1 <a=1>", Category::Testcase), 4).is_ok());
    }

    #[test]
    fn test_misplaced_category_is_rejected() {
        let err = check_category(&wire("S1", Category::Suite), 1).unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedCategory { depth: 1, .. }));

        let err = check_category(&wire("P", Category::Parametrization), 4).unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedCategory { depth: 4, .. }));
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        let err = check_category(&wire("X", Category::Other("group".into())), 3).unwrap_err();
        assert!(matches!(err, SyncError::UnknownCategory { category, .. } if category == "group"));
    }
}
