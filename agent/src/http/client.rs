//! HTTP client implementation

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, error};
use url::Url;

use crate::authn::credential::Credential;
use crate::authn::identity::DeviceIdentity;
use crate::errors::{classify_status, SyncError};
use crate::utils::{unix_now, version_info};

pub const DEVICE_ID_HEADER: &str = "X-Device-ID";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Longest error body echoed into logs
const MAX_ERROR_BODY: usize = 256;

/// Timeouts applied to every request
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(600),
        }
    }
}

/// Streaming response body of a file download
pub struct DownloadBody {
    /// `Content-Length` announced by the server, if any
    pub content_length: Option<u64>,
    stream: BoxStream<'static, Result<Bytes, SyncError>>,
}

impl DownloadBody {
    pub fn new(
        content_length: Option<u64>,
        stream: BoxStream<'static, Result<Bytes, SyncError>>,
    ) -> Self {
        Self {
            content_length,
            stream,
        }
    }

    /// Next chunk of the body; `None` once complete
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, SyncError>> {
        self.stream.next().await
    }
}

/// Signed HTTP client for the update server
pub struct HttpClient {
    client: Client,
    base_url: String,
    identity: DeviceIdentity,
    credential: Credential,
    options: HttpOptions,
}

impl HttpClient {
    /// Create a new HTTP client bound to one server, device and credential
    pub fn new(
        base_url: &str,
        identity: DeviceIdentity,
        credential: Credential,
        options: HttpOptions,
    ) -> Result<Self, SyncError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| SyncError::ConfigError(format!("Invalid server URL {:?}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SyncError::ConfigError(format!(
                "Unsupported server URL scheme: {}",
                parsed.scheme()
            )));
        }

        let version = version_info();
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .user_agent(format!("pisync/{} ({})", version.version, identity))
            .build()
            .map_err(|e| SyncError::ConfigError(format!("Unable to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            identity,
            credential,
            options,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the device identity requests are signed for
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Resolve a manifest `uri`: absolute URLs are kept, paths join the base URL
    pub fn resolve_uri(&self, uri: &str) -> Result<Url, SyncError> {
        let uri = uri.trim();
        match Url::parse(uri) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
            Ok(url) => Err(SyncError::ClientError(format!(
                "Unsupported download scheme: {}",
                url.scheme()
            ))),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let joined = format!("{}/{}", self.base_url, uri.trim_start_matches('/'));
                Url::parse(&joined)
                    .map_err(|e| SyncError::ClientError(format!("Invalid download uri: {}", e)))
            }
            Err(e) => Err(SyncError::ClientError(format!("Invalid download uri: {}", e))),
        }
    }

    /// Attach the device id, timestamp and request signature
    fn sign(&self, request: RequestBuilder) -> Result<RequestBuilder, SyncError> {
        let timestamp = unix_now();
        let signature = self.credential.sign(self.identity.as_str(), timestamp)?;
        Ok(request
            .header(DEVICE_ID_HEADER, self.identity.as_str())
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature))
    }

    /// Make a signed GET request and decode a JSON body
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, SyncError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!("GET {}", url);

        let request = self
            .client
            .get(&url)
            .query(params)
            .header(header::ACCEPT, "application/json");
        let response = self.sign(request)?.send().await?;
        let response = check_status("GET", response).await?;

        let body = response.json().await?;
        Ok(body)
    }

    /// Start a signed download and return its body as a byte stream
    pub async fn download_uri(&self, uri: &str) -> Result<DownloadBody, SyncError> {
        let url = self.resolve_uri(uri)?;
        debug!("GET {} (download)", url.path());

        let request = self
            .client
            .get(url)
            .timeout(self.options.download_timeout);
        let response = self.sign(request)?.send().await?;
        let response = check_status("download", response).await?;

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(SyncError::from))
            .boxed();
        Ok(DownloadBody::new(content_length, stream))
    }
}

async fn check_status(method: &str, response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    error!("HTTP {} failed: {} - {}", method, status, body.trim());
    Err(classify_status(status.as_u16(), body.trim()))
}
