//! HTTP client for the Dropbox v2 `files/*` API.
//!
//! RPC endpoints take a JSON body.  Content endpoints take the raw bytes as
//! body and their JSON argument in the `Dropbox-API-Arg` header.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use streamvault_common::protocol::{
    ApiErrorBody, CommitInfo, CreateFolderArg, DeleteArg, DeleteBatchArg, DeleteBatchJobStatus,
    DeleteBatchLaunch, FileMetadata, ListFolderArg, ListFolderContinueArg, ListFolderResult,
    PollArg, UploadSessionAppendArg, UploadSessionCursor, UploadSessionFinishArg,
    UploadSessionStartArg, UploadSessionStartResult,
};

use crate::storage::{RemoteStorage, StorageError};

const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const USER_AGENT: &str = "streamvault-recorder/0.1";

/// Authenticated client; cheap to clone.
#[derive(Debug, Clone)]
pub struct DropboxClient {
    http: reqwest::Client,
    token: String,
    api_url: String,
    content_url: String,
}

impl DropboxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_urls(token, API_URL, CONTENT_URL)
    }

    /// Client against other base URLs, e.g. a local mock server.
    pub fn with_urls(
        token: impl Into<String>,
        api_url: impl Into<String>,
        content_url: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            token: token.into(),
            api_url: api_url.into(),
            content_url: content_url.into(),
        })
    }

    async fn rpc<A, R>(&self, endpoint: &'static str, arg: &A) -> Result<R, StorageError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{endpoint}", self.api_url);
        debug!("POST {url}");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(arg)
            .send()
            .await
            .map_err(|source| StorageError::Http { endpoint, source })?;
        decode(endpoint, resp).await
    }

    async fn upload<A, R>(
        &self,
        endpoint: &'static str,
        arg: &A,
        body: &[u8],
    ) -> Result<R, StorageError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{endpoint}", self.content_url);
        let header = api_arg_header(arg).map_err(|source| StorageError::Encode { endpoint, source })?;
        debug!("POST {url} ({} bytes)", body.len());
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header(API_ARG_HEADER, header)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|source| StorageError::Http { endpoint, source })?;
        decode(endpoint, resp).await
    }
}

/// Turn a response into `R`, or into [`StorageError::Api`] for non-2xx.
async fn decode<R: DeserializeOwned>(
    endpoint: &'static str,
    resp: reqwest::Response,
) -> Result<R, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|source| StorageError::Http { endpoint, source });
    }

    let text = resp.text().await.unwrap_or_default();
    let summary = serde_json::from_str::<ApiErrorBody>(&text)
        .map(|b| b.error_summary)
        .unwrap_or(text);
    Err(StorageError::Api {
        endpoint,
        status: status.as_u16(),
        summary,
    })
}

/// JSON for the `Dropbox-API-Arg` header.  Header values must be ASCII,
/// so everything else is written as `\uXXXX` escapes.
pub fn api_arg_header<A: Serialize + ?Sized>(arg: &A) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(arg)?;
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

/// Response of endpoints that return `null`.
#[derive(serde::Deserialize)]
struct Empty {}

impl RemoteStorage for DropboxClient {
    async fn create_folder(&self, path: &str) -> Result<(), StorageError> {
        let arg = CreateFolderArg {
            path: path.to_string(),
            autorename: false,
        };
        let _: serde_json::Value = self.rpc("files/create_folder_v2", &arg).await?;
        Ok(())
    }

    async fn list_folder(&self, path: &str, limit: u32) -> Result<ListFolderResult, StorageError> {
        let arg = ListFolderArg {
            path: path.to_string(),
            recursive: true,
            limit,
        };
        self.rpc("files/list_folder", &arg).await
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderResult, StorageError> {
        let arg = ListFolderContinueArg {
            cursor: cursor.to_string(),
        };
        self.rpc("files/list_folder/continue", &arg).await
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<DeleteBatchLaunch, StorageError> {
        let arg = DeleteBatchArg {
            entries: paths
                .iter()
                .map(|p| DeleteArg { path: p.clone() })
                .collect(),
        };
        self.rpc("files/delete_batch", &arg).await
    }

    async fn delete_batch_check(&self, job_id: &str) -> Result<DeleteBatchJobStatus, StorageError> {
        let arg = PollArg {
            async_job_id: job_id.to_string(),
        };
        self.rpc("files/delete_batch/check", &arg).await
    }

    async fn upload_session_start(&self, body: &[u8]) -> Result<String, StorageError> {
        let arg = UploadSessionStartArg { close: false };
        let result: UploadSessionStartResult =
            self.upload("files/upload_session/start", &arg, body).await?;
        Ok(result.session_id)
    }

    async fn upload_session_append(
        &self,
        cursor: &UploadSessionCursor,
        close: bool,
        body: &[u8],
    ) -> Result<(), StorageError> {
        let arg = UploadSessionAppendArg {
            cursor: cursor.clone(),
            close,
        };
        let _: Option<Empty> = self.upload("files/upload_session/append_v2", &arg, body).await?;
        Ok(())
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadSessionCursor,
        commit: &CommitInfo,
        body: &[u8],
    ) -> Result<FileMetadata, StorageError> {
        let arg = UploadSessionFinishArg {
            cursor: cursor.clone(),
            commit: commit.clone(),
        };
        self.upload("files/upload_session/finish", &arg, body).await
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
