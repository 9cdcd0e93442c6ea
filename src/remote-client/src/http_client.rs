use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use std::ops::Range;
use std::time::Duration;

use fs_types::{FsError, FsResult};

use crate::backend::{ObjectRef, RemoteBackend, RemoteDirEntry};

/// HTTP client against the remote object gateway. Objects live under
/// `/uri/<capability>`; a PUT of raw bytes mints a new capability, returned
/// as the response body.
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(endpoint: &str, timeout: Duration) -> FsResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FsError::Internal(format!("build http client failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn obj_url(&self, obj: &ObjectRef) -> String {
        format!("{}/uri/{}", self.base_url, obj)
    }

    fn transport_err(context: &str, e: reqwest::Error) -> FsError {
        warn!("HttpBackend: {} failed: {}", context, e);
        FsError::BackendUnavailable(format!("{}: {}", context, e))
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn get_object(&self, obj: &ObjectRef, range: Option<Range<u64>>) -> FsResult<Vec<u8>> {
        let mut request = self.client.get(self.obj_url(obj));
        if let Some(range) = &range {
            if range.end <= range.start {
                return Ok(Vec::new());
            }
            request = request.header("Range", format!("bytes={}-{}", range.start, range.end - 1));
        }
        let resp = request
            .send()
            .await
            .map_err(|e| Self::transport_err("get_object", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FsError::from_http_status(status, format!("get_object {}", obj)));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| Self::transport_err("get_object body", e))?;
        Ok(body.to_vec())
    }

    async fn put_object(&self, data: &[u8]) -> FsResult<ObjectRef> {
        let resp = self
            .client
            .put(format!("{}/uri", self.base_url))
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Self::transport_err("put_object", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FsError::from_http_status(status, "put_object".to_string()));
        }
        let cap = resp
            .text()
            .await
            .map_err(|e| Self::transport_err("put_object body", e))?;
        let cap = cap.trim();
        if cap.is_empty() {
            return Err(FsError::BackendUnavailable(
                "put_object returned empty capability".to_string(),
            ));
        }
        Ok(ObjectRef::new(cap))
    }

    async fn get_dir(&self, obj: &ObjectRef) -> FsResult<Vec<RemoteDirEntry>> {
        let resp = self
            .client
            .get(format!("{}?t=json", self.obj_url(obj)))
            .send()
            .await
            .map_err(|e| Self::transport_err("get_dir", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FsError::from_http_status(status, format!("get_dir {}", obj)));
        }
        resp.json::<Vec<RemoteDirEntry>>()
            .await
            .map_err(|e| FsError::BackendUnavailable(format!("get_dir decode: {}", e)))
    }

    async fn put_dir(
        &self,
        prior: Option<&ObjectRef>,
        entries: &[RemoteDirEntry],
    ) -> FsResult<ObjectRef> {
        let url = match prior {
            Some(prior) => format!("{}/uri?t=mkdir&replace={}", self.base_url, prior),
            None => format!("{}/uri?t=mkdir", self.base_url),
        };
        let resp = self
            .client
            .put(url)
            .json(entries)
            .send()
            .await
            .map_err(|e| Self::transport_err("put_dir", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FsError::from_http_status(status, "put_dir".to_string()));
        }
        let cap = resp
            .text()
            .await
            .map_err(|e| Self::transport_err("put_dir body", e))?;
        Ok(ObjectRef::new(cap.trim()))
    }

    async fn delete(&self, obj: &ObjectRef) -> FsResult<()> {
        let resp = self
            .client
            .delete(self.obj_url(obj))
            .send()
            .await
            .map_err(|e| Self::transport_err("delete", e))?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(FsError::from_http_status(status, format!("delete {}", obj)))
    }
}
