use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

use crate::model::QualifiedId;
use crate::{Error, Result};

pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub const MESSAGE_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub user: String,
    pub since: Option<i64>,
    pub conversation: Option<String>,
    pub order: SortOrder,
    pub size: u32,
}

impl MessageQuery {
    pub fn for_user(user: &QualifiedId) -> Self {
        Self {
            user: user.to_string(),
            since: None,
            conversation: None,
            order: SortOrder::Asc,
            size: MESSAGE_PAGE_SIZE,
        }
    }
}

/// One stored message. The payload is kept raw so a single bad entry does not
/// fail the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessageResult {
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub results: Vec<RemoteMessageResult>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoStateDownload {
    Downloaded { bytes: u64 },
    NotFound,
}

pub trait RemoteBackupService: Send + Sync {
    fn provider(&self) -> &'static str;

    fn upload_crypto_state<'a>(
        &'a self,
        account: &'a QualifiedId,
        archive: &'a Path,
        length: u64,
    ) -> RemoteFuture<'a, ()>;

    /// Streams the stored crypto-state archive into `target`.
    fn download_crypto_state<'a>(
        &'a self,
        account: &'a QualifiedId,
        target: &'a Path,
    ) -> RemoteFuture<'a, CryptoStateDownload>;

    fn fetch_messages<'a>(&'a self, query: &'a MessageQuery) -> RemoteFuture<'a, MessagePage>;

    fn upload_backup_artifact<'a>(
        &'a self,
        account: &'a QualifiedId,
        artifact: &'a Path,
        length: u64,
    ) -> RemoteFuture<'a, ()>;
}

#[derive(Debug, Clone)]
pub struct HttpRemoteBackupConfig {
    pub base_url: String,
    pub access_token: Option<String>,
}

pub struct HttpRemoteBackupService {
    config: HttpRemoteBackupConfig,
    client: reqwest::Client,
}

impl HttpRemoteBackupService {
    pub fn new(config: HttpRemoteBackupConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post_file(
        &self,
        path: &str,
        account: &QualifiedId,
        file: &Path,
        length: u64,
    ) -> Result<()> {
        let f = tokio::fs::File::open(file).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(f));
        let res = self
            .authorize(self.client.post(self.url(path)))
            .query(&[("user_id", account.to_string())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Remote {
                message: format!("upload request failed: {e}"),
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            error!(
                event = "remote.upload_failed",
                path,
                status = status.as_u16(),
                "remote.upload_failed"
            );
            return Err(Error::Remote {
                message: format!("upload http {status}: {body}"),
            });
        }
        debug!(event = "remote.uploaded", path, bytes = length, "remote.uploaded");
        Ok(())
    }
}

impl RemoteBackupService for HttpRemoteBackupService {
    fn provider(&self) -> &'static str {
        "http"
    }

    fn upload_crypto_state<'a>(
        &'a self,
        account: &'a QualifiedId,
        archive: &'a Path,
        length: u64,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(self.post_file("/backup/state", account, archive, length))
    }

    fn download_crypto_state<'a>(
        &'a self,
        account: &'a QualifiedId,
        target: &'a Path,
    ) -> RemoteFuture<'a, CryptoStateDownload> {
        Box::pin(async move {
            let mut res = self
                .authorize(self.client.get(self.url("/backup/state")))
                .query(&[("user_id", account.to_string())])
                .send()
                .await
                .map_err(|e| Error::Remote {
                    message: format!("download request failed: {e}"),
                })?;

            let status = res.status();
            if status == StatusCode::NOT_FOUND {
                debug!(event = "remote.state_not_found", "remote.state_not_found");
                return Ok(CryptoStateDownload::NotFound);
            }
            if !status.is_success() {
                return Err(Error::Remote {
                    message: format!("download http {status}"),
                });
            }

            let mut out = tokio::fs::File::create(target).await?;
            let mut bytes = 0u64;
            while let Some(chunk) = res.chunk().await.map_err(|e| Error::Remote {
                message: format!("download read failed: {e}"),
            })? {
                out.write_all(&chunk).await?;
                bytes += chunk.len() as u64;
            }
            out.flush().await?;
            Ok(CryptoStateDownload::Downloaded { bytes })
        })
    }

    fn fetch_messages<'a>(&'a self, query: &'a MessageQuery) -> RemoteFuture<'a, MessagePage> {
        Box::pin(async move {
            let mut params = vec![
                ("user", query.user.clone()),
                ("order", query.order.as_str().to_string()),
                ("size", query.size.to_string()),
            ];
            if let Some(since) = query.since {
                params.push(("since", since.to_string()));
            }
            if let Some(conversation) = &query.conversation {
                params.push(("conversation", conversation.clone()));
            }

            let res = self
                .authorize(self.client.get(self.url("/backup/messages")))
                .query(&params)
                .send()
                .await
                .map_err(|e| Error::Remote {
                    message: format!("fetch messages request failed: {e}"),
                })?;

            let status = res.status();
            let body = res.text().await.map_err(|e| Error::Remote {
                message: format!("fetch messages read failed: {e}"),
            })?;
            if !status.is_success() {
                return Err(Error::Remote {
                    message: format!("fetch messages http {status}: {body}"),
                });
            }
            serde_json::from_str(&body).map_err(|e| Error::Remote {
                message: format!("fetch messages invalid json: {e}"),
            })
        })
    }

    fn upload_backup_artifact<'a>(
        &'a self,
        account: &'a QualifiedId,
        artifact: &'a Path,
        length: u64,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(self.post_file("/backup/archive", account, artifact, length))
    }
}

/// Process-local backup service with call counters, for tests and offline use.
#[derive(Debug, Default)]
pub struct InMemoryRemoteBackup {
    pub state_uploads: AtomicUsize,
    pub state_downloads: AtomicUsize,
    pub message_fetches: AtomicUsize,
    pub artifact_uploads: AtomicUsize,
    states: Mutex<HashMap<String, Vec<u8>>>,
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    messages: Mutex<Vec<RemoteMessageResult>>,
}

impl InMemoryRemoteBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.state_uploads.load(Ordering::Relaxed)
            + self.state_downloads.load(Ordering::Relaxed)
            + self.message_fetches.load(Ordering::Relaxed)
            + self.artifact_uploads.load(Ordering::Relaxed)
    }

    pub async fn crypto_state(&self, account: &QualifiedId) -> Option<Vec<u8>> {
        self.states.lock().await.get(&account.to_string()).cloned()
    }

    pub async fn artifact(&self, account: &QualifiedId) -> Option<Vec<u8>> {
        self.artifacts.lock().await.get(&account.to_string()).cloned()
    }

    pub async fn push_message(&self, payload: serde_json::Value, timestamp: i64) {
        self.messages
            .lock()
            .await
            .push(RemoteMessageResult { payload, timestamp });
    }
}

fn payload_conversation(payload: &serde_json::Value) -> Option<&str> {
    payload.get("conversationId")?.get("id")?.as_str()
}

impl RemoteBackupService for InMemoryRemoteBackup {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn upload_crypto_state<'a>(
        &'a self,
        account: &'a QualifiedId,
        archive: &'a Path,
        _length: u64,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let bytes = tokio::fs::read(archive).await?;
            self.states.lock().await.insert(account.to_string(), bytes);
            self.state_uploads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn download_crypto_state<'a>(
        &'a self,
        account: &'a QualifiedId,
        target: &'a Path,
    ) -> RemoteFuture<'a, CryptoStateDownload> {
        Box::pin(async move {
            self.state_downloads.fetch_add(1, Ordering::Relaxed);
            let Some(bytes) = self.crypto_state(account).await else {
                return Ok(CryptoStateDownload::NotFound);
            };
            tokio::fs::write(target, &bytes).await?;
            Ok(CryptoStateDownload::Downloaded {
                bytes: bytes.len() as u64,
            })
        })
    }

    fn fetch_messages<'a>(&'a self, query: &'a MessageQuery) -> RemoteFuture<'a, MessagePage> {
        Box::pin(async move {
            self.message_fetches.fetch_add(1, Ordering::Relaxed);
            let mut matching: Vec<RemoteMessageResult> = self
                .messages
                .lock()
                .await
                .iter()
                .filter(|m| query.since.is_none_or(|since| match query.order {
                    SortOrder::Asc => m.timestamp > since,
                    SortOrder::Desc => m.timestamp < since,
                }))
                .filter(|m| {
                    query
                        .conversation
                        .as_deref()
                        .is_none_or(|c| payload_conversation(&m.payload) == Some(c))
                })
                .cloned()
                .collect();
            matching.sort_by_key(|m| m.timestamp);
            if query.order == SortOrder::Desc {
                matching.reverse();
            }

            let size = query.size.max(1) as usize;
            let has_more = matching.len() > size;
            matching.truncate(size);
            Ok(MessagePage {
                results: matching,
                has_more,
            })
        })
    }

    fn upload_backup_artifact<'a>(
        &'a self,
        account: &'a QualifiedId,
        artifact: &'a Path,
        _length: u64,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let bytes = tokio::fs::read(artifact).await?;
            self.artifacts.lock().await.insert(account.to_string(), bytes);
            self.artifact_uploads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}
