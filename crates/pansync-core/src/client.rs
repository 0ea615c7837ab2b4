//! HTTP implementation of [`RemoteClient`] for the xpan REST API

use crate::error::TransferError;
use crate::remote::{
    ByteStream, CreateRequest, PrecreateRequest, PrecreateResponse, RemoteClient, TokenProvider,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use pansync_types::{ByteRange, FileOperation, RemoteFile, RenamePolicy, Settings};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const API_BASE: &str = "https://pan.baidu.com";
pub const PCS_BASE: &str = "https://d.pcs.baidu.com";

const FILE_PATH: &str = "/rest/2.0/xpan/file";
const MULTIMEDIA_PATH: &str = "/rest/2.0/xpan/multimedia";
const UPLOAD_PATH: &str = "/rest/2.0/pcs/superfile2";

const LIST_PAGE_SIZE: u64 = 1000;
const SEARCH_PAGE_SIZE: u64 = 500;

/// errno values that mean the access token is invalid or expired
const AUTH_ERRNOS: [i64; 2] = [-6, 111];

type Query = Vec<(&'static str, String)>;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errno: i64,
    #[serde(default)]
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileWire {
    fs_id: u64,
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    isdir: i64,
    #[serde(default, alias = "mtime")]
    server_mtime: i64,
    #[serde(default)]
    md5: Option<String>,
}

impl From<FileWire> for RemoteFile {
    fn from(wire: FileWire) -> Self {
        RemoteFile {
            fs_id: wire.fs_id,
            path: wire.path,
            size: wire.size,
            is_dir: wire.isdir != 0,
            mtime: wire.server_mtime,
            md5: wire.md5.filter(|m| !m.is_empty()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PrecreateWire {
    #[serde(default)]
    return_type: i32,
    #[serde(default)]
    uploadid: String,
    #[serde(default)]
    block_list: Vec<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ListWire {
    #[serde(default)]
    list: Vec<FileWire>,
    #[serde(default)]
    has_more: i64,
    #[serde(default)]
    cursor: u64,
}

#[derive(Debug, Default, Deserialize)]
struct MetaWire {
    #[serde(default)]
    dlink: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MetasWire {
    #[serde(default)]
    list: Vec<MetaWire>,
}

/// Parse a JSON body, turning a non-zero `errno` into an error first
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, TransferError> {
    let status: ApiStatus = serde_json::from_slice(body)?;
    if status.errno != 0 {
        let message = status
            .errmsg
            .unwrap_or_else(|| format!("errno {}", status.errno));
        if AUTH_ERRNOS.contains(&status.errno) {
            return Err(TransferError::Auth(message));
        }
        return Err(TransferError::remote(status.errno, message));
    }
    Ok(serde_json::from_slice(body)?)
}

/// Map an HTTP status to an error. `expired_on` marks the session as stale.
fn check_http(
    status: StatusCode,
    expired_on: Option<StatusCode>,
    context: &str,
) -> Result<(), TransferError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("{} returned HTTP {}", context, status.as_u16());
    if Some(status) == expired_on {
        return Err(TransferError::SessionExpired(message));
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(TransferError::Auth(message));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(TransferError::TransientNetwork(message));
    }
    Err(TransferError::remote(status.as_u16() as i64, message))
}

/// `filelist` form value for a file-manager operation
fn file_list(operation: &FileOperation) -> serde_json::Value {
    match operation {
        FileOperation::Copy {
            path,
            dest,
            newname,
        }
        | FileOperation::Move {
            path,
            dest,
            newname,
        } => serde_json::json!([{ "path": path, "dest": dest, "newname": newname }]),
        FileOperation::Rename { path, newname } => {
            serde_json::json!([{ "path": path, "newname": newname }])
        }
        FileOperation::Delete { paths } => serde_json::json!(paths),
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client for the remote storage service, shared by all workers
#[derive(Clone)]
pub struct PanClient {
    http: Client,
    token: Arc<dyn TokenProvider>,
    api_base: String,
    pcs_base: String,
}

impl PanClient {
    pub fn new(token: Arc<dyn TokenProvider>, settings: &Settings) -> Result<Self, TransferError> {
        let http = Client::builder()
            .user_agent(settings.user_agent.clone())
            .pool_max_idle_per_host(64)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransferError::InvalidInput(e.to_string()))?;

        Ok(Self {
            http,
            token,
            api_base: API_BASE.to_string(),
            pcs_base: PCS_BASE.to_string(),
        })
    }

    /// Point the client at other hosts, e.g. a local mock server
    pub fn with_base_urls(mut self, api_base: impl Into<String>, pcs_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.pcs_base = pcs_base.into();
        self
    }

    fn query(&self, method: &str) -> Result<Query, TransferError> {
        Ok(vec![
            ("method", method.to_string()),
            ("access_token", self.token.access_token()?),
        ])
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<T, TransferError> {
        let response = request.send().await?;
        check_http(response.status(), None, context)?;
        let body = response.bytes().await?;
        decode(&body)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        method: &str,
        extra: Query,
    ) -> Result<T, TransferError> {
        let mut query = self.query(method)?;
        query.extend(extra);
        let request = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .query(&query);
        self.send(request, method).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        method: &str,
        extra: Query,
        form: Query,
    ) -> Result<T, TransferError> {
        let mut query = self.query(method)?;
        query.extend(extra);
        let request = self
            .http
            .post(format!("{}{}", self.api_base, FILE_PATH))
            .query(&query)
            .form(&form);
        self.send(request, method).await
    }

    async fn create(
        &self,
        remote_path: &str,
        size: u64,
        is_dir: bool,
        upload_id: &str,
        block_list: &[String],
        rtype: u8,
    ) -> Result<RemoteFile, TransferError> {
        let form = vec![
            ("path", remote_path.to_string()),
            ("size", size.to_string()),
            ("isdir", u8::from(is_dir).to_string()),
            ("rtype", rtype.to_string()),
            ("uploadid", upload_id.to_string()),
            ("block_list", serde_json::to_string(block_list)?),
        ];
        let file: FileWire = self.post_form("create", Vec::new(), form).await?;
        Ok(file.into())
    }
}

#[async_trait]
impl RemoteClient for PanClient {
    async fn precreate(&self, request: &PrecreateRequest) -> Result<PrecreateResponse, TransferError> {
        let form = vec![
            ("path", request.remote_path.clone()),
            ("size", request.size.to_string()),
            ("isdir", u8::from(request.is_dir).to_string()),
            ("autoinit", "1".to_string()),
            ("rtype", request.rename.rtype().to_string()),
            ("block_list", serde_json::to_string(&request.block_list)?),
            ("content-md5", request.content_md5.clone()),
            ("slice-md5", request.slice_md5.clone()),
        ];
        let wire: PrecreateWire = self.post_form("precreate", Vec::new(), form).await?;
        debug!(
            "precreate {}: return_type={} needs {} slices",
            request.remote_path,
            wire.return_type,
            wire.block_list.len()
        );
        Ok(PrecreateResponse {
            return_type: wire.return_type,
            upload_id: wire.uploadid,
            block_list: wire.block_list,
        })
    }

    async fn upload_slice(
        &self,
        upload_id: &str,
        remote_path: &str,
        part_index: usize,
        data: Bytes,
    ) -> Result<(), TransferError> {
        let mut query = self.query("upload")?;
        query.extend([
            ("type", "tmpfile".to_string()),
            ("path", remote_path.to_string()),
            ("uploadid", upload_id.to_string()),
            ("partseq", part_index.to_string()),
        ]);
        let form = Form::new().part("file", Part::stream(data).file_name("chunk"));

        let response = self
            .http
            .post(format!("{}{}", self.pcs_base, UPLOAD_PATH))
            .query(&query)
            .multipart(form)
            .send()
            .await?;
        check_http(
            response.status(),
            Some(StatusCode::BAD_REQUEST),
            "slice upload",
        )?;
        let body = response.bytes().await?;
        let _: ApiStatus = decode(&body)?;
        Ok(())
    }

    async fn create_file(&self, request: &CreateRequest) -> Result<RemoteFile, TransferError> {
        let file = self
            .create(
                &request.remote_path,
                request.size,
                request.is_dir,
                &request.upload_id,
                &request.block_list,
                request.rename.rtype(),
            )
            .await?;
        info!("Created remote file {} ({} bytes)", file.path, file.size);
        Ok(file)
    }

    async fn get_download_link(&self, fs_id: u64) -> Result<String, TransferError> {
        let metas: MetasWire = self
            .get(
                MULTIMEDIA_PATH,
                "filemetas",
                vec![
                    ("fsids", format!("[{}]", fs_id)),
                    ("dlink", "1".to_string()),
                ],
            )
            .await?;
        metas
            .list
            .into_iter()
            .next()
            .and_then(|m| m.dlink)
            .filter(|link| !link.is_empty())
            .ok_or_else(|| TransferError::remote(-1, format!("No dlink for fs_id={}", fs_id)))
    }

    async fn stream_download(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, TransferError> {
        let mut request = self
            .http
            .get(url)
            .query(&[("access_token", self.token.access_token()?)]);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }

        let response = request.send().await?;
        let status = response.status();
        check_http(status, Some(StatusCode::FORBIDDEN), "download")?;

        // a 200 for a range past zero would be appended at the wrong offset
        if matches!(range, Some(r) if r.start > 0) && status != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::remote(
                status.as_u16() as i64,
                "server ignored the requested range",
            ));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransferError::from))
            .boxed())
    }

    async fn list_recursive(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError> {
        let mut files = Vec::new();
        let mut start = 0u64;
        loop {
            let page: ListWire = self
                .get(
                    MULTIMEDIA_PATH,
                    "listall",
                    vec![
                        ("path", dir.to_string()),
                        ("start", start.to_string()),
                        ("limit", LIST_PAGE_SIZE.to_string()),
                        ("recursion", "1".to_string()),
                    ],
                )
                .await?;
            let fetched = page.list.len() as u64;
            files.extend(
                page.list
                    .into_iter()
                    .map(RemoteFile::from)
                    .filter(|f| !f.is_dir),
            );
            if page.has_more == 0 || fetched == 0 {
                break;
            }
            start = if page.cursor > start {
                page.cursor
            } else {
                start + fetched
            };
        }
        debug!("listall {}: {} files", dir, files.len());
        Ok(files)
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError> {
        let mut entries = Vec::new();
        let mut start = 0u64;
        loop {
            let page: ListWire = self
                .get(
                    FILE_PATH,
                    "list",
                    vec![
                        ("dir", dir.to_string()),
                        ("order", "name".to_string()),
                        ("start", start.to_string()),
                        ("limit", LIST_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let fetched = page.list.len() as u64;
            entries.extend(page.list.into_iter().map(RemoteFile::from));
            if fetched < LIST_PAGE_SIZE {
                break;
            }
            start += fetched;
        }
        Ok(entries)
    }

    async fn search(&self, key: &str, dir: Option<&str>) -> Result<Vec<RemoteFile>, TransferError> {
        let mut results = Vec::new();
        let mut page_no = 1u64;
        loop {
            let mut extra = vec![
                ("key", key.to_string()),
                ("recursion", "1".to_string()),
                ("page", page_no.to_string()),
                ("num", SEARCH_PAGE_SIZE.to_string()),
            ];
            if let Some(dir) = dir {
                extra.push(("dir", dir.to_string()));
            }
            let page: ListWire = self.get(FILE_PATH, "search", extra).await?;
            let fetched = page.list.len();
            results.extend(page.list.into_iter().map(RemoteFile::from));
            if page.has_more == 0 || fetched == 0 {
                break;
            }
            page_no += 1;
        }
        Ok(results)
    }

    async fn file_manager(&self, operation: &FileOperation) -> Result<(), TransferError> {
        let form = vec![
            ("async", "0".to_string()),
            ("filelist", file_list(operation).to_string()),
            ("ondup", "fail".to_string()),
        ];
        let _: ApiStatus = self
            .post_form(
                "filemanager",
                vec![("opera", operation.opera().to_string())],
                form,
            )
            .await?;
        info!("filemanager {} done", operation.opera());
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<RemoteFile, TransferError> {
        self.create(path, 0, true, "", &[], RenamePolicy::Overwrite.rtype())
            .await
    }
}
