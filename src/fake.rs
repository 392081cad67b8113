//! In-memory stand-in for the interactive backend.
//!
//! Holds a complete report as JSON and answers the same requests the HTTP
//! client would make, with per-request failure injection and latency. The
//! `--demo` mode runs the engine against it; integration tests use it to
//! script server behavior.

use serde_json::{json, Map, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::client::{check_errmsg, ControlCall, ReportApi};
use crate::error::SyncError;
use crate::report::{Address, ShallowNode, WireNode};

/// Failure a scripted request answers with.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeFailure {
    Status(u16),
    Application(String),
}

impl FakeFailure {
    fn to_error(&self, path: &str) -> SyncError {
        match self {
            FakeFailure::Status(status) => SyncError::Status {
                status: *status,
                url: path.to_string(),
            },
            FakeFailure::Application(msg) => SyncError::Application(msg.clone()),
        }
    }
}

struct FakeServer {
    report: Value,
    requests: Vec<String>,
    fail_next: u32,
    failure: FakeFailure,
    put_failure: Option<FakeFailure>,
    control_failure: Option<FakeFailure>,
    latency: Duration,
    next_hash: u64,
    simulate_progress: bool,
}

impl FakeServer {
    fn new_hash(&mut self) -> Value {
        self.next_hash += 1;
        Value::String(format!("fake-{}", self.next_hash))
    }

    /// Log the request and decide whether it should fail.
    fn begin(&mut self, request: String) -> Result<Duration, SyncError> {
        debug!("fake backend: {}", request);
        self.requests.push(request.clone());
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(self.failure.to_error(&request));
        }
        Ok(self.latency)
    }

    /// Apply `edit` to the entry at `address` and give it and every
    /// ancestor a fresh hash.
    fn touch(&mut self, address: &Address, edit: impl FnOnce(&mut Map<String, Value>)) -> bool {
        if node_at(&self.report, address).is_none() {
            return false;
        }
        let mut hashes: Vec<Value> = (0..=address.depth()).map(|_| self.new_hash()).collect();
        let mut node = &mut self.report;
        for uid in address.uids() {
            if let Some(hash) = hashes.pop() {
                node["hash"] = hash;
            }
            let Some(child) = children_mut(node)
                .and_then(|entries| entries.iter_mut().find(|e| e["uid"] == uid.as_str()))
            else {
                return false;
            };
            node = child;
        }
        if let Some(hash) = hashes.pop() {
            node["hash"] = hash;
        }
        match node.as_object_mut() {
            Some(fields) => {
                edit(fields);
                true
            }
            None => false,
        }
    }
}

fn children(node: &Value) -> Option<&Vec<Value>> {
    node.get("entries").and_then(Value::as_array)
}

fn children_mut(node: &mut Value) -> Option<&mut Vec<Value>> {
    node.get_mut("entries").and_then(Value::as_array_mut)
}

fn is_testcase(node: &Value) -> bool {
    node["category"] == "testcase"
}

fn node_at<'a>(root: &'a Value, address: &Address) -> Option<&'a Value> {
    let mut node = root;
    for uid in address.uids() {
        node = children(node)?.iter().find(|e| e["uid"] == uid.as_str())?;
    }
    Some(node)
}

/// Entry as the backend returns it for a container: own fields and the
/// uids of its children.
fn shallow_value(node: &Value) -> Value {
    let mut value = node.clone();
    if let Some(fields) = value.as_object_mut() {
        let uids: Vec<Value> = fields
            .remove("entries")
            .and_then(|entries| entries.as_array().cloned())
            .unwrap_or_default()
            .iter()
            .map(|e| e["uid"].clone())
            .collect();
        fields.insert("entry_uids".to_string(), Value::Array(uids));
    }
    value
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, path: &str) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|e| SyncError::Decode {
        url: path.to_string(),
        reason: e.to_string(),
    })
}

/// Move running entries to finished and resetting entries back to ready,
/// rehashing whatever changed. Returns whether anything did.
fn advance(node: &mut Value, next_hash: &mut u64) -> bool {
    let mut changed = false;
    if let Some(entries) = children_mut(node) {
        for child in entries.iter_mut() {
            changed |= advance(child, next_hash);
        }
    }

    let testcase = is_testcase(node);
    let transition = match node["runtime_status"].as_str() {
        Some("running") => Some(("finished", "passed")),
        Some("resetting") => Some(("ready", "unknown")),
        _ => None,
    };
    if let Some((runtime_status, status)) = transition {
        node["runtime_status"] = json!(runtime_status);
        if testcase {
            node["status"] = json!(status);
        }
        changed = true;
    }
    if changed {
        *next_hash += 1;
        node["hash"] = json!(format!("fake-{}", next_hash));
    }
    changed
}

pub struct FakeReportApi {
    server: Mutex<FakeServer>,
}

impl FakeReportApi {
    /// Serve `report`, a complete tree in the nested `entries` shape.
    pub fn new(report: Value) -> Self {
        Self {
            server: Mutex::new(FakeServer {
                report,
                requests: Vec::new(),
                fail_next: 0,
                failure: FakeFailure::Status(503),
                put_failure: None,
                control_failure: None,
                latency: Duration::ZERO,
                next_hash: 0,
                simulate_progress: false,
            }),
        }
    }

    /// Sample report whose runs complete on the next poll.
    pub fn demo() -> Self {
        let api = Self::new(sample_report());
        api.lock().simulate_progress = true;
        api
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeServer> {
        // A poisoned lock still holds a usable report.
        self.server.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Requests served so far, e.g. `GET /report/tests`.
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Fail the next `count` requests of any kind with `failure`.
    pub fn fail_next(&self, count: u32, failure: FakeFailure) {
        let mut server = self.lock();
        server.fail_next = count;
        server.failure = failure;
    }

    pub fn fail_puts(&self, failure: Option<FakeFailure>) {
        self.lock().put_failure = failure;
    }

    pub fn fail_control(&self, failure: Option<FakeFailure>) {
        self.lock().control_failure = failure;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Change an entry's fields server-side, as a running test would.
    pub fn set_field(&self, address: &Address, key: &str, value: Value) -> bool {
        self.lock().touch(address, |fields| {
            fields.insert(key.to_string(), value);
        })
    }

    /// Current server-side copy of the report.
    pub fn report(&self) -> Value {
        self.lock().report.clone()
    }
}

impl ReportApi for FakeReportApi {
    async fn get_entry(&self, address: &Address) -> Result<WireNode, SyncError> {
        let path = address.resource_path()?;
        let (latency, value) = {
            let mut server = self.lock();
            let latency = server.begin(format!("GET {}", path))?;
            if address.is_root() && server.simulate_progress {
                let FakeServer {
                    report, next_hash, ..
                } = &mut *server;
                advance(report, next_hash);
            }
            let node = node_at(&server.report, address).ok_or(SyncError::Status {
                status: 404,
                url: path.clone(),
            })?;
            (latency, shallow_value(node))
        };
        tokio::time::sleep(latency).await;
        decode(value, &path)
    }

    async fn list_children(&self, address: &Address) -> Result<Vec<WireNode>, SyncError> {
        let path = address.children_path()?;
        let (latency, listing) = {
            let mut server = self.lock();
            let latency = server.begin(format!("GET {}", path))?;
            let node = node_at(&server.report, address).ok_or(SyncError::Status {
                status: 404,
                url: path.clone(),
            })?;
            let listing: Vec<Value> = children(node)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|e| if is_testcase(e) { e.clone() } else { shallow_value(e) })
                        .collect()
                })
                .unwrap_or_default();
            (latency, listing)
        };
        tokio::time::sleep(latency).await;
        decode(Value::Array(listing), &path)
    }

    async fn put_entry(&self, entry: &ShallowNode) -> Result<ShallowNode, SyncError> {
        let address = entry.fields.address();
        let path = address.resource_path()?;
        let (latency, value) = {
            let mut server = self.lock();
            let latency = server.begin(format!("PUT {}", path))?;
            if let Some(failure) = server.put_failure.clone() {
                return Err(failure.to_error(&path));
            }
            let sent = serde_json::to_value(&entry.fields).map_err(|e| SyncError::Decode {
                url: path.clone(),
                reason: e.to_string(),
            })?;
            let applied = server.touch(&address, |fields| {
                for key in ["runtime_status", "env_status"] {
                    if let Some(value) = sent.get(key) {
                        fields.insert(key.to_string(), value.clone());
                    }
                }
            });
            if !applied {
                return Err(SyncError::Status {
                    status: 404,
                    url: path,
                });
            }
            let node = node_at(&server.report, &address).cloned().unwrap_or_default();
            (latency, shallow_value(&node))
        };
        tokio::time::sleep(latency).await;
        check_errmsg(&value)?;
        let wire: WireNode = decode(value, &path)?;
        Ok(wire.into())
    }

    async fn control(&self, call: ControlCall) -> Result<(), SyncError> {
        let latency = {
            let mut server = self.lock();
            let latency = server.begin(format!("GET {}", call.path()))?;
            if let Some(failure) = &server.control_failure {
                return Err(failure.to_error(call.path()));
            }
            latency
        };
        tokio::time::sleep(latency).await;
        Ok(())
    }
}

fn testcase(uid: &str, parents: &[&str], status: &str) -> Value {
    json!({
        "uid": uid,
        "name": uid,
        "category": "testcase",
        "hash": format!("{}-0", uid),
        "parent_uids": parents,
        "status": status,
        "runtime_status": "ready",
        "entries": []
    })
}

fn container(uid: &str, category: &str, hash: &str, parents: &[&str], entries: Vec<Value>) -> Value {
    json!({
        "uid": uid,
        "name": uid,
        "category": category,
        "hash": hash,
        "parent_uids": parents,
        "status": "unknown",
        "runtime_status": "ready",
        "entries": entries
    })
}

/// A small report with one multitest and one environment-backed test.
pub fn sample_report() -> Value {
    let plan = "Demo Plan";
    let unit = [plan, "Unit Tests"];
    let suite = [plan, "Unit Tests", "Arithmetic"];
    let param = [plan, "Unit Tests", "Arithmetic", "test_mul"];

    let test_mul = container(
        "test_mul",
        "parametrization",
        "mul-0",
        &suite,
        vec![
            testcase("test_mul <a=1>", &param, "unknown"),
            testcase("test_mul <a=2>", &param, "unknown"),
        ],
    );
    let arithmetic = container(
        "Arithmetic",
        "suite",
        "arith-0",
        &unit,
        vec![
            testcase("test_add", &suite, "unknown"),
            testcase("test_sub", &suite, "unknown"),
            test_mul,
        ],
    );

    let mut unit_tests = container("Unit Tests", "test", "unit-0", &[plan], vec![arithmetic]);
    unit_tests["env_status"] = json!("STOPPED");
    unit_tests["tags"] = json!({"simple": ["fast"]});

    let mut service_checks = container("Service Checks", "test", "svc-0", &[plan], vec![]);
    service_checks["env_status"] = json!("STARTED");
    service_checks["tags"] = json!({"color": ["blue"]});

    container(plan, "report", "plan-0", &[], vec![unit_tests, service_checks])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Category;

    fn address(uids: &[&str]) -> Address {
        Address::new(uids.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_root_is_served_shallow() {
        let api = FakeReportApi::new(sample_report());
        let root = api.get_entry(&Address::root()).await.unwrap();
        assert_eq!(root.fields.category, Category::Report);
        assert!(root.entries.is_none());
        assert_eq!(
            root.entry_uids,
            Some(vec!["Unit Tests".to_string(), "Service Checks".to_string()])
        );
        assert_eq!(api.requests(), vec!["GET /report"]);
    }

    #[test]
    fn test_sample_report_shape() {
        let report: crate::report::FullNode = serde_json::from_value(sample_report()).unwrap();
        assert_eq!(report.uid(), "Demo Plan");
        let unit = report.child("Unit Tests").unwrap();
        assert_eq!(unit.fields.extra.get("tags"), Some(&json!({"simple": ["fast"]})));
        let param = report
            .find(&address(&["Unit Tests", "Arithmetic", "test_mul"]))
            .unwrap();
        assert_eq!(param.entries.len(), 2);
        assert_eq!(
            param.entries[1].fields.parent_uids,
            vec!["Demo Plan", "Unit Tests", "Arithmetic", "test_mul"]
        );
        assert_eq!(
            report.child("Service Checks").unwrap().fields.env_status,
            Some(crate::report::EnvStatus::Started)
        );
    }

    #[tokio::test]
    async fn test_listing_inlines_testcases() {
        let api = FakeReportApi::new(sample_report());
        let listing = api
            .list_children(&address(&["Unit Tests", "Arithmetic"]))
            .await
            .unwrap();
        assert_eq!(listing.len(), 3);
        assert_eq!(listing[0].entries, Some(vec![]));
        assert!(listing[2].entries.is_none());
        assert_eq!(
            listing[2].entry_uids.as_ref().map(|u| u.len()),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_put_rehashes_path() {
        let api = FakeReportApi::new(sample_report());
        let root = api.get_entry(&Address::root()).await.unwrap();
        let before = root.fields.hash.clone();

        let mut entry: ShallowNode = api
            .get_entry(&address(&["Unit Tests"]))
            .await
            .unwrap()
            .into();
        entry.fields.runtime_status = Some(crate::report::RuntimeStatus::Running);
        let response = api.put_entry(&entry).await.unwrap();

        assert_eq!(
            response.fields.runtime_status,
            Some(crate::report::RuntimeStatus::Running)
        );
        let root = api.get_entry(&Address::root()).await.unwrap();
        assert_ne!(root.fields.hash, before);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let api = FakeReportApi::new(sample_report());
        api.fail_next(1, FakeFailure::Status(500));
        assert!(matches!(
            api.get_entry(&Address::root()).await,
            Err(SyncError::Status { status: 500, .. })
        ));
        assert!(api.get_entry(&Address::root()).await.is_ok());

        api.fail_control(Some(FakeFailure::Application("busy".into())));
        assert!(matches!(
            api.control(ControlCall::Abort).await,
            Err(SyncError::Application(_))
        ));
    }

    #[test]
    fn test_advance_completes_runs() {
        let mut report = sample_report();
        report["entries"][0]["entries"][0]["entries"][0]["runtime_status"] = json!("running");
        let mut next_hash = 0;

        assert!(advance(&mut report, &mut next_hash));
        let case = &report["entries"][0]["entries"][0]["entries"][0];
        assert_eq!(case["runtime_status"], "finished");
        assert_eq!(case["status"], "passed");
        assert_ne!(report["hash"], "plan-0");
        assert_eq!(report["entries"][1]["hash"], "svc-0");

        assert!(!advance(&mut report, &mut next_hash));
    }
}
