use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::SyncError;
use crate::report::address::Address;

// --- Enumerations kept open to values this client does not know ---

macro_rules! open_string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $text,)+
                    $name::Other(s) => s,
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                match s.as_str() {
                    $($text => $name::$variant,)+
                    _ => $name::Other(s),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::Other(s) => s,
                    other => other.as_str().to_string(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

open_string_enum! {
    /// Kind of report entry. Determines how its children are resolved and
    /// which path segment addresses it.
    Category {
        Report => "report",
        Test => "test",
        Suite => "suite",
        Testcase => "testcase",
        Parametrization => "parametrization",
    }
}

open_string_enum! {
    RuntimeStatus {
        Ready => "ready",
        Waiting => "waiting",
        Running => "running",
        Resetting => "resetting",
        Finished => "finished",
        NotRun => "not_run",
    }
}

open_string_enum! {
    EnvStatus {
        Starting => "STARTING",
        Started => "STARTED",
        Stopping => "STOPPING",
        Stopped => "STOPPED",
    }
}

impl Category {
    /// Categories whose children are themselves report entries.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Category::Report | Category::Test | Category::Suite | Category::Parametrization
        )
    }
}

impl RuntimeStatus {
    /// States in which the runner has no reset pending.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Ready | RuntimeStatus::Finished | RuntimeStatus::NotRun
        )
    }
}

/// Opaque content fingerprint. The server may send strings or numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHash(pub Value);

impl From<&str> for NodeHash {
    fn from(s: &str) -> Self {
        NodeHash(Value::String(s.to_string()))
    }
}

impl From<i64> for NodeHash {
    fn from(n: i64) -> Self {
        NodeHash(Value::from(n))
    }
}

/// `true` only when both hashes are known and equal. A `None` on either
/// side means the entry must be fetched again.
pub fn hash_unchanged(previous: Option<&NodeHash>, current: Option<&NodeHash>) -> bool {
    matches!((previous, current), (Some(a), Some(b)) if a == b)
}

// --- Node shapes ---

/// Fields a report entry carries about itself, excluding its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFields {
    pub uid: String,
    pub category: Category,
    #[serde(default)]
    pub hash: Option<NodeHash>,
    #[serde(default)]
    pub parent_uids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_status: Option<RuntimeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_status: Option<EnvStatus>,
    /// Every other field the server sent, echoed back on PUT.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeFields {
    pub fn new(uid: impl Into<String>, category: Category, parent_uids: Vec<String>) -> Self {
        Self {
            uid: uid.into(),
            category,
            hash: None,
            parent_uids,
            name: None,
            status: None,
            runtime_status: None,
            env_status: None,
            extra: Map::new(),
        }
    }

    pub fn address(&self) -> Address {
        Address::of(&self.parent_uids, &self.uid)
    }

    pub fn depth(&self) -> usize {
        self.parent_uids.len()
    }
}

/// Entry as returned by any GET: own fields plus whichever child
/// representation the endpoint provides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNode {
    #[serde(flatten)]
    pub fields: NodeFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_uids: Option<Vec<String>>,
}

/// Entry carrying child identifiers only. This is what a PUT sends and
/// what the server answers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShallowNode {
    #[serde(flatten)]
    pub fields: NodeFields,
    #[serde(default)]
    pub entry_uids: Vec<String>,
}

impl From<WireNode> for ShallowNode {
    fn from(wire: WireNode) -> Self {
        ShallowNode {
            fields: wire.fields,
            entry_uids: wire.entry_uids.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub other: u32,
}

impl Counter {
    fn for_testcase(status: Option<&str>) -> Self {
        let mut counter = Counter {
            total: 1,
            ..Counter::default()
        };
        match status {
            Some("passed") => counter.passed = 1,
            Some("failed") | Some("error") => counter.failed = 1,
            _ => counter.other = 1,
        }
        counter
    }

    fn add(&mut self, other: &Counter) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.other += other.other;
    }
}

/// Caches computed from a node and its descendants.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedIndices {
    pub tags_index: BTreeMap<String, BTreeSet<String>>,
    pub name_type_index: BTreeSet<String>,
    pub uids: BTreeSet<String>,
    pub counter: Counter,
}

impl DerivedIndices {
    fn compute(fields: &NodeFields, entries: &[Arc<FullNode>]) -> Self {
        let mut indices = DerivedIndices::default();
        indices.uids.insert(fields.uid.clone());
        indices.name_type_index.insert(format!(
            "{}|{}",
            fields.name.as_deref().unwrap_or(&fields.uid),
            fields.category
        ));
        if let Some(tags) = fields.extra.get("tags") {
            merge_tags(&mut indices.tags_index, tags);
        }
        if fields.category == Category::Testcase {
            indices.counter = Counter::for_testcase(fields.status.as_deref());
        }

        for child in entries {
            let child = &child.indices;
            for (group, values) in &child.tags_index {
                indices
                    .tags_index
                    .entry(group.clone())
                    .or_default()
                    .extend(values.iter().cloned());
            }
            indices
                .name_type_index
                .extend(child.name_type_index.iter().cloned());
            indices.uids.extend(child.uids.iter().cloned());
            indices.counter.add(&child.counter);
        }
        indices
    }
}

/// Tags arrive either grouped (`{"color": ["red"]}`) or as a plain list,
/// which is filed under `simple`.
fn merge_tags(index: &mut BTreeMap<String, BTreeSet<String>>, tags: &Value) {
    match tags {
        Value::Object(groups) => {
            for (group, values) in groups {
                let slot = index.entry(group.clone()).or_default();
                if let Some(values) = values.as_array() {
                    slot.extend(values.iter().filter_map(|v| v.as_str().map(String::from)));
                }
            }
        }
        Value::Array(values) => {
            index
                .entry("simple".to_string())
                .or_default()
                .extend(values.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        _ => {}
    }
}

/// Entry with its complete subtree. Children are shared between
/// successive trees when they did not change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireNode")]
pub struct FullNode {
    pub fields: NodeFields,
    pub entries: Vec<Arc<FullNode>>,
    /// Result payloads of a testcase leaf; empty for containers.
    pub assertions: Vec<Value>,
    pub indices: DerivedIndices,
}

impl FullNode {
    pub fn container(fields: NodeFields, entries: Vec<Arc<FullNode>>) -> Self {
        let indices = DerivedIndices::compute(&fields, &entries);
        Self {
            fields,
            entries,
            assertions: Vec::new(),
            indices,
        }
    }

    pub fn leaf(fields: NodeFields, assertions: Vec<Value>) -> Self {
        let indices = DerivedIndices::compute(&fields, &[]);
        Self {
            fields,
            entries: Vec::new(),
            assertions,
            indices,
        }
    }

    pub fn uid(&self) -> &str {
        &self.fields.uid
    }

    pub fn hash(&self) -> Option<&NodeHash> {
        self.fields.hash.as_ref()
    }

    pub fn child(&self, uid: &str) -> Option<&Arc<FullNode>> {
        self.entries.iter().find(|entry| entry.fields.uid == uid)
    }

    /// Walk down from this node following `address`.
    pub fn find(&self, address: &Address) -> Option<&FullNode> {
        let mut node = self;
        for uid in address.uids() {
            node = node.child(uid)?;
        }
        Some(node)
    }

    /// Own fields plus the uids of the direct children.
    pub fn to_shallow(&self) -> ShallowNode {
        ShallowNode {
            fields: self.fields.clone(),
            entry_uids: self.entries.iter().map(|e| e.fields.uid.clone()).collect(),
        }
    }

    /// Build a full node from a complete payload, e.g. a saved snapshot.
    pub fn from_wire(wire: WireNode) -> Result<Self, SyncError> {
        let entries = wire.entries.unwrap_or_default();
        let category = wire.fields.category.clone();
        match category {
            Category::Testcase => Ok(FullNode::leaf(wire.fields, entries)),
            category if category.is_container() => {
                let children = entries
                    .into_iter()
                    .map(|value| {
                        serde_json::from_value::<FullNode>(value)
                            .map(Arc::new)
                            .map_err(|e| SyncError::Decode {
                                url: wire.fields.uid.clone(),
                                reason: e.to_string(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FullNode::container(wire.fields, children))
            }
            other => Err(SyncError::UnknownCategory {
                uid: wire.fields.uid.clone(),
                category: other.to_string(),
            }),
        }
    }
}

impl TryFrom<WireNode> for FullNode {
    type Error = SyncError;

    fn try_from(wire: WireNode) -> Result<Self, Self::Error> {
        FullNode::from_wire(wire)
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum EntriesRepr<'a> {
    Nodes(&'a [Arc<FullNode>]),
    Assertions(&'a [Value]),
}

#[derive(Serialize)]
struct FullNodeRepr<'a> {
    #[serde(flatten)]
    fields: &'a NodeFields,
    entries: EntriesRepr<'a>,
    #[serde(flatten)]
    indices: &'a DerivedIndices,
}

impl Serialize for FullNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = if self.fields.category == Category::Testcase {
            EntriesRepr::Assertions(&self.assertions)
        } else {
            EntriesRepr::Nodes(&self.entries)
        };
        FullNodeRepr {
            fields: &self.fields,
            entries,
            indices: &self.indices,
        }
        .serialize(serializer)
    }
}
