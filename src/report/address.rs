use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Path segment naming the children of an entry at each depth.
const CHILD_SEGMENTS: [&str; 4] = ["tests", "suites", "testcases", "parametrizations"];

/// Location of an entry below the report root: the uids of every
/// ancestor except the root, followed by the entry's own uid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(Vec<String>);

impl Address {
    pub fn root() -> Self {
        Address(Vec::new())
    }

    pub fn new(uids: Vec<String>) -> Self {
        Address(uids)
    }

    /// `parent_uids[0]` is the root itself and does not appear in the path.
    pub fn of(parent_uids: &[String], uid: &str) -> Self {
        if parent_uids.is_empty() {
            return Address::root();
        }
        let mut uids: Vec<String> = parent_uids[1..].to_vec();
        uids.push(uid.to_string());
        Address(uids)
    }

    pub fn uids(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, uid: &str) -> Self {
        let mut uids = self.0.clone();
        uids.push(uid.to_string());
        Address(uids)
    }

    /// `/report`, `/report/tests/{test}`, ... with every uid percent-encoded.
    pub fn resource_path(&self) -> Result<String, SyncError> {
        if self.depth() > CHILD_SEGMENTS.len() {
            return Err(SyncError::UnsupportedDepth(self.depth()));
        }
        let mut path = String::from("/report");
        for (segment, uid) in CHILD_SEGMENTS.iter().zip(&self.0) {
            path.push('/');
            path.push_str(segment);
            path.push('/');
            path.push_str(&urlencoding::encode(uid));
        }
        Ok(path)
    }

    /// Listing endpoint for the children of this entry.
    pub fn children_path(&self) -> Result<String, SyncError> {
        let segment = CHILD_SEGMENTS
            .get(self.depth())
            .ok_or(SyncError::UnsupportedDepth(self.depth() + 1))?;
        Ok(format!("{}/{}", self.resource_path()?, segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_root_paths() {
        let root = Address::of(&[], "plan");
        assert!(root.is_root());
        assert_eq!(root.resource_path().unwrap(), "/report");
        assert_eq!(root.children_path().unwrap(), "/report/tests");
    }

    #[test]
    fn test_root_placeholder_is_dropped() {
        let address = Address::of(&uids(&["plan", "T1", "S1"]), "C1");
        assert_eq!(address.uids(), uids(&["T1", "S1", "C1"]).as_slice());
        assert_eq!(
            address.resource_path().unwrap(),
            "/report/tests/T1/suites/S1/testcases/C1"
        );
        assert_eq!(
            address.children_path().unwrap(),
            "/report/tests/T1/suites/S1/testcases/C1/parametrizations"
        );
    }

    #[test]
    fn test_parametrization_path() {
        let address = Address::of(&uids(&["plan", "T1", "S1", "C1"]), "C1 <x=1>");
        assert_eq!(
            address.resource_path().unwrap(),
            "/report/tests/T1/suites/S1/testcases/C1/parametrizations/C1%20%3Cx%3D1%3E"
        );
        assert!(matches!(
            address.children_path(),
            Err(SyncError::UnsupportedDepth(5))
        ));
    }

    #[test]
    fn test_uids_are_percent_encoded() {
        let address = Address::new(uids(&["My Test/1"]));
        assert_eq!(address.resource_path().unwrap(), "/report/tests/My%20Test%2F1");
    }

    #[test]
    fn test_too_deep_is_rejected() {
        let address = Address::new(uids(&["a", "b", "c", "d", "e"]));
        assert!(matches!(
            address.resource_path(),
            Err(SyncError::UnsupportedDepth(5))
        ));
    }

    #[test]
    fn test_child_extends_path() {
        let address = Address::root().child("T1").child("S1");
        assert_eq!(address.depth(), 2);
        assert_eq!(address.resource_path().unwrap(), "/report/tests/T1/suites/S1");
    }
}
