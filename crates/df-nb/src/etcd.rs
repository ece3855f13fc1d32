//! etcd v2 key-value backend.
//!
//! Talks to the `/v2/keys` HTTP API. Watches are long polls with
//! `wait=true&recursive=true&waitIndex=<cursor>` on the key root.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;

use crate::backend::{KvBackend, KvEntry, KvListing, Mutation, MutationAction};
use crate::error::BackendError;

/// etcd error code: key not found.
const ERROR_KEY_NOT_FOUND: u32 = 100;
/// etcd error code: compare failed.
const ERROR_TEST_FAILED: u32 = 101;
/// etcd error code: the requested index has been cleared from history.
const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Connection settings for [`EtcdBackend`].
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Base URL, e.g. `http://127.0.0.1:2379`.
    pub url: String,
    /// Timeout for ordinary requests.
    pub request_timeout: Duration,
    /// How long a watch long-poll may block.
    pub watch_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:2379".to_string(),
            request_timeout: Duration::from_secs(5),
            watch_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: String,
    value: Option<String>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: u64,
}

enum Reply {
    Ok {
        body: EtcdResponse,
        index: Option<u64>,
    },
    Error {
        body: EtcdErrorBody,
        index: Option<u64>,
    },
}

/// etcd v2 backend.
#[derive(Debug, Clone)]
pub struct EtcdBackend {
    client: Client,
    config: EtcdConfig,
}

impl EtcdBackend {
    pub fn new(config: EtcdConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn key_url(&self, key: &str) -> String {
        format!(
            "{}/v2/keys/{}",
            self.config.url.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, key: &str) -> RequestBuilder {
        self.client
            .request(method, self.key_url(key))
            .timeout(self.config.request_timeout)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Reply, BackendError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let index = response
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        // A long poll that the server closes without an event has no body.
        if body.is_empty() {
            return Err(BackendError::Timeout);
        }

        if status.is_success() {
            let body = serde_json::from_slice(&body)
                .map_err(|e| BackendError::Protocol(format!("invalid etcd response: {e}")))?;
            Ok(Reply::Ok { body, index })
        } else {
            match serde_json::from_slice::<EtcdErrorBody>(&body) {
                Ok(body) => Ok(Reply::Error { body, index }),
                Err(_) if status == StatusCode::REQUEST_TIMEOUT => Err(BackendError::Timeout),
                Err(e) => Err(BackendError::Protocol(format!(
                    "etcd returned {status} with an unreadable body: {e}"
                ))),
            }
        }
    }

    async fn put(&self, request: RequestBuilder, key: &str) -> Result<u64, BackendError> {
        match self.send(request).await? {
            Reply::Ok { body, .. } => body
                .node
                .map(|n| n.modified_index)
                .ok_or_else(|| BackendError::Protocol("etcd write returned no node".to_string())),
            Reply::Error { body, .. }
                if body.error_code == ERROR_TEST_FAILED
                    || body.error_code == ERROR_KEY_NOT_FOUND =>
            {
                Err(BackendError::Conflict {
                    key: key.to_string(),
                })
            }
            Reply::Error { body, .. } => Err(error_from_body(body)),
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(err.to_string())
    }
}

fn error_from_body(body: EtcdErrorBody) -> BackendError {
    if body.error_code == ERROR_EVENT_INDEX_CLEARED {
        return BackendError::CursorExpired {
            current_index: body.index,
        };
    }
    BackendError::Protocol(format!(
        "etcd error {}: {} ({})",
        body.error_code,
        body.message,
        body.cause.unwrap_or_default()
    ))
}

fn value_to_string(key: &str, value: Vec<u8>) -> Result<String, BackendError> {
    String::from_utf8(value)
        .map_err(|_| BackendError::Protocol(format!("value for '{key}' is not valid UTF-8")))
}

fn collect_leaves(node: EtcdNode, out: &mut Vec<KvEntry>) {
    if node.dir {
        for child in node.nodes {
            collect_leaves(child, out);
        }
    } else if let Some(value) = node.value {
        out.push(KvEntry {
            key: node.key.trim_start_matches('/').to_string(),
            value: value.into_bytes(),
            modified_index: node.modified_index,
        });
    }
}

fn action_of(action: &str) -> Option<MutationAction> {
    match action {
        "set" | "create" | "update" | "compareAndSwap" => Some(MutationAction::Upsert),
        "delete" | "expire" | "compareAndDelete" => Some(MutationAction::Delete),
        _ => None,
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn read(&self, key: &str) -> Result<Option<KvEntry>, BackendError> {
        match self.send(self.request(Method::GET, key)).await? {
            Reply::Ok { body, .. } => Ok(body.node.and_then(|node| {
                node.value.map(|value| KvEntry {
                    key: node.key.trim_start_matches('/').to_string(),
                    value: value.into_bytes(),
                    modified_index: node.modified_index,
                })
            })),
            Reply::Error { body, .. } if body.error_code == ERROR_KEY_NOT_FOUND => Ok(None),
            Reply::Error { body, .. } => Err(error_from_body(body)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<KvListing, BackendError> {
        let request = self
            .request(Method::GET, prefix)
            .query(&[("recursive", "true")]);
        match self.send(request).await? {
            Reply::Ok { body, index } => {
                let mut entries = Vec::new();
                if let Some(node) = body.node {
                    collect_leaves(node, &mut entries);
                }
                Ok(KvListing {
                    entries,
                    index: index.unwrap_or_default(),
                })
            }
            Reply::Error { body, index } if body.error_code == ERROR_KEY_NOT_FOUND => {
                Ok(KvListing {
                    entries: Vec::new(),
                    index: index.unwrap_or(body.index),
                })
            }
            Reply::Error { body, .. } => Err(error_from_body(body)),
        }
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<u64, BackendError> {
        let value = value_to_string(key, value)?;
        let request = self
            .request(Method::PUT, key)
            .form(&[("value", value.as_str())]);
        self.put(request, key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        prev_index: u64,
    ) -> Result<u64, BackendError> {
        let value = value_to_string(key, value)?;
        let request = self
            .request(Method::PUT, key)
            .query(&[("prevIndex", prev_index.to_string())])
            .form(&[("value", value.as_str())]);
        self.put(request, key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        match self.send(self.request(Method::DELETE, key)).await? {
            Reply::Ok { .. } => Ok(()),
            Reply::Error { body, .. } if body.error_code == ERROR_KEY_NOT_FOUND => Ok(()),
            Reply::Error { body, .. } => Err(error_from_body(body)),
        }
    }

    async fn watch(&self, from_index: u64) -> Result<Mutation, BackendError> {
        let request = self
            .client
            .get(self.key_url(""))
            .query(&[
                ("wait", "true".to_string()),
                ("recursive", "true".to_string()),
                ("waitIndex", from_index.to_string()),
            ])
            .timeout(self.config.watch_timeout);

        match self.send(request).await? {
            Reply::Ok { body, .. } => {
                let node = body
                    .node
                    .ok_or_else(|| BackendError::Protocol("watch event has no node".to_string()))?;
                let action = action_of(&body.action).ok_or_else(|| {
                    BackendError::Protocol(format!("unknown etcd action '{}'", body.action))
                })?;
                debug!(
                    "etcd {} {} at index {}",
                    body.action, node.key, node.modified_index
                );
                let value = match action {
                    MutationAction::Upsert => node.value.map(String::into_bytes),
                    MutationAction::Delete => None,
                };
                Ok(Mutation {
                    key: node.key,
                    value,
                    action,
                    index: node.modified_index,
                })
            }
            Reply::Error { body, .. } => {
                if body.error_code == ERROR_EVENT_INDEX_CLEARED {
                    warn!("etcd history cleared before index {}", from_index);
                }
                Err(error_from_body(body))
            }
        }
    }
}
