use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::report::{Address, ShallowNode, WireNode};

/// Out-of-band calls that act on the whole session rather than on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    /// Recompute test code on the runner side.
    Reload,
    /// Terminate the test session.
    Abort,
}

impl ControlCall {
    pub fn path(&self) -> &'static str {
        match self {
            ControlCall::Reload => "/reload",
            ControlCall::Abort => "/abort",
        }
    }
}

/// Transport seam of the engine. Implementations issue the requests and
/// decode responses; they carry no merge or scheduling logic.
pub trait ReportApi: Send + Sync + 'static {
    /// GET the entry itself (own fields, child uids).
    fn get_entry(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<WireNode, SyncError>> + Send;

    /// GET the listing of the entry's direct children.
    fn list_children(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Vec<WireNode>, SyncError>> + Send;

    /// PUT a shallow entry and return the server's resulting entry.
    fn put_entry(
        &self,
        entry: &ShallowNode,
    ) -> impl Future<Output = Result<ShallowNode, SyncError>> + Send;

    fn control(&self, call: ControlCall) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// A 2xx body may still carry a failure message for the user.
pub fn check_errmsg(body: &Value) -> Result<(), SyncError> {
    match body.get("errmsg").and_then(|v| v.as_str()) {
        Some(msg) if !msg.is_empty() => Err(SyncError::Application(msg.to_string())),
        _ => Ok(()),
    }
}

/// `ReportApi` over HTTP against the interactive backend.
pub struct RemoteReportClient {
    http: reqwest::Client,
    api_root: String,
}

impl RemoteReportClient {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        url::Url::parse(&config.base_url)
            .map_err(|_| SyncError::InvalidBaseUrl(config.base_url.clone()))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self {
            http,
            api_root: config.api_root(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }

    async fn read_body(resp: reqwest::Response, url: &str) -> Result<String, SyncError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.text().await?)
    }

    fn decode<T: DeserializeOwned>(body: &str, url: &str) -> Result<T, SyncError> {
        serde_json::from_str(body).map_err(|e| SyncError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let url = self.url(path);
        debug!("GET {}", url);
        let resp = self.http.get(&url).send().await?;
        let body = Self::read_body(resp, &url).await?;
        Self::decode(&body, &url)
    }
}

impl ReportApi for RemoteReportClient {
    async fn get_entry(&self, address: &Address) -> Result<WireNode, SyncError> {
        let path = address.resource_path()?;
        self.get_json(&path).await
    }

    async fn list_children(&self, address: &Address) -> Result<Vec<WireNode>, SyncError> {
        let path = address.children_path()?;
        self.get_json(&path).await
    }

    async fn put_entry(&self, entry: &ShallowNode) -> Result<ShallowNode, SyncError> {
        let url = self.url(&entry.fields.address().resource_path()?);
        debug!("PUT {}", url);
        let resp = self.http.put(&url).json(entry).send().await?;
        let body = Self::read_body(resp, &url).await?;

        let value: Value = Self::decode(&body, &url)?;
        check_errmsg(&value)?;
        let wire: WireNode = serde_json::from_value(value).map_err(|e| SyncError::Decode {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(wire.into())
    }

    async fn control(&self, call: ControlCall) -> Result<(), SyncError> {
        let value: Value = self.get_json(call.path()).await?;
        check_errmsg(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_errmsg_becomes_application_error() {
        let err = check_errmsg(&json!({"errmsg": "Test is running"})).unwrap_err();
        assert!(matches!(err, SyncError::Application(msg) if msg == "Test is running"));
    }

    #[test]
    fn test_empty_or_missing_errmsg_is_ok() {
        assert!(check_errmsg(&json!({"errmsg": ""})).is_ok());
        assert!(check_errmsg(&json!({"errmsg": null})).is_ok());
        assert!(check_errmsg(&json!({"uid": "T1"})).is_ok());
    }

    #[test]
    fn test_client_builds_urls_under_api_prefix() {
        let config = SyncConfig {
            base_url: "http://127.0.0.1:5000".to_string(),
            ..SyncConfig::default()
        };
        let client = RemoteReportClient::new(&config).unwrap();
        assert_eq!(
            client.url("/report/tests"),
            "http://127.0.0.1:5000/api/v1/interactive/report/tests"
        );
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = SyncConfig {
            base_url: "not a url".to_string(),
            ..SyncConfig::default()
        };
        assert!(matches!(
            RemoteReportClient::new(&config),
            Err(SyncError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn test_control_paths() {
        assert_eq!(ControlCall::Reload.path(), "/reload");
        assert_eq!(ControlCall::Abort.path(), "/abort");
    }
}
