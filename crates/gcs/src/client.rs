//! Cloud Storage JSON API client implementing [`BlobStore`].
//!
//! Async HTTP client using `reqwest` with Bearer token authentication.

use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use snapvault_store::{
    BlobStore, Crc32c, ObjectAttrs, ObjectWriter, StoreError, StoreFuture, validate_object_name,
};
use tracing::{debug, trace};

use crate::Error;
use crate::types::{ComposeRequest, ObjectList, ObjectResource, encode_crc32c};

const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";
const OBJECT_CONTENT_TYPE: &str = "application/octet-stream";
const HASH_HEADER: &str = "x-goog-hash";
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on one request, including the body of a full chunk upload.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A bucket in Google Cloud Storage.
#[derive(Clone)]
pub struct GcsStore {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl GcsStore {
    /// Creates a store for `bucket`, authenticating with an OAuth2 access token.
    pub fn new(bucket: &str, token: &str) -> Result<Self, Error> {
        Self::with_request_timeout(bucket, token, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`GcsStore::new`], failing any request that takes longer than
    /// `timeout`. A stalled request then surfaces as a transient error.
    pub fn with_request_timeout(
        bucket: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        if bucket.is_empty() {
            return Err(Error::InvalidBucket);
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| Error::InvalidToken)?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(timeout.min(MAX_CONNECT_TIMEOUT))
            .build()?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            bucket: bucket.to_string(),
        })
    }

    /// Points the client at another endpoint, e.g. a local emulator.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn objects_url(&self) -> String {
        format!("{}/storage/v1/b/{}/o", self.base_url, encode(&self.bucket))
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/{}", self.objects_url(), encode(name))
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base_url,
            encode(&self.bucket)
        )
    }

    async fn compose_object(
        &self,
        destination: &str,
        sources: &[String],
    ) -> Result<ObjectAttrs, Error> {
        let url = format!("{}/compose", self.object_url(destination));
        let resp = self
            .http
            .post(&url)
            .json(&ComposeRequest::new(sources, OBJECT_CONTENT_TYPE))
            .send()
            .await?;
        let body = check(resp).await?;
        let resource: ObjectResource = serde_json::from_slice(&body)?;
        resource.into_attrs()
    }

    async fn delete_object(&self, name: &str) -> Result<(), Error> {
        let resp = self.http.delete(self.object_url(name)).send().await?;
        match check(resp).await {
            Ok(_) => Ok(()),
            Err(Error::Api { status: 404, .. }) => {
                trace!(object = %name, "delete of missing object");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectAttrs>, Error> {
        let url = self.objects_url();
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self.http.get(&url).query(&[("prefix", prefix)]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let body = check(req.send().await?).await?;
            let page: ObjectList = serde_json::from_slice(&body)?;
            for item in page.items {
                objects.push(item.into_attrs()?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(prefix = %prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

/// Returns the body of a successful response, or [`Error::Api`].
async fn check(resp: reqwest::Response) -> Result<Vec<u8>, Error> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp.bytes().await?.to_vec())
}

/// Buffers an object in memory and uploads it in one media request on close.
///
/// The request carries the CRC32C of the buffer, so the service rejects an
/// upload whose bytes were altered in transit.
struct GcsWriter {
    http: reqwest::Client,
    url: String,
    name: String,
    buf: Vec<u8>,
}

impl ObjectWriter for GcsWriter {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> StoreFuture<'a, ()> {
        self.buf.extend_from_slice(data);
        Box::pin(async { Ok(()) })
    }

    fn close(self: Box<Self>) -> StoreFuture<'static, ObjectAttrs> {
        let GcsWriter {
            http,
            url,
            name,
            buf,
        } = *self;
        Box::pin(async move {
            let len = buf.len();
            let result = upload_media(&http, &url, &name, buf).await;
            debug!(object = %name, bytes = len, ok = result.is_ok(), "media upload");
            result.map_err(StoreError::from)
        })
    }
}

async fn upload_media(
    http: &reqwest::Client,
    url: &str,
    name: &str,
    data: Vec<u8>,
) -> Result<ObjectAttrs, Error> {
    let crc = Crc32c::of(&data);
    let resp = http
        .post(url)
        .query(&[("uploadType", "media"), ("name", name)])
        .header(CONTENT_TYPE, OBJECT_CONTENT_TYPE)
        .header(HASH_HEADER, format!("crc32c={}", encode_crc32c(crc)))
        .body(data)
        .send()
        .await?;
    let body = check(resp).await?;
    let resource: ObjectResource = serde_json::from_slice(&body)?;
    resource.into_attrs()
}

impl BlobStore for GcsStore {
    fn open_writer<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Box<dyn ObjectWriter>> {
        Box::pin(async move {
            validate_object_name(name)?;
            let writer: Box<dyn ObjectWriter> = Box::new(GcsWriter {
                http: self.http.clone(),
                url: self.upload_url(),
                name: name.to_string(),
                buf: Vec::new(),
            });
            Ok(writer)
        })
    }

    fn compose<'a>(
        &'a self,
        destination: &'a str,
        sources: &'a [String],
    ) -> StoreFuture<'a, ObjectAttrs> {
        Box::pin(async move {
            let limit = self.compose_limit();
            if sources.len() > limit {
                return Err(StoreError::ComposeLimit {
                    count: sources.len(),
                    limit,
                });
            }
            Ok(self.compose_object(destination, sources).await?)
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move { Ok(self.delete_object(name).await?) })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectAttrs>> {
        Box::pin(async move { Ok(self.list_objects(prefix).await?) })
    }

    fn location(&self) -> String {
        format!("gs://{}", self.bucket)
    }
}
