//! Recipe download into a scoped temporary file.

use crate::error::{CoreError, Result};
use crate::session::Stage;
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Timeout for establishing the HTTP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retrieves a remote recipe into a local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `url` into a new temporary file.
    ///
    /// On failure no temporary file is left behind. On success the returned
    /// [`SpecFile`] owns the file and deletes it when dropped.
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<SpecFile>;
}

/// A downloaded recipe, removed from disk when dropped.
#[derive(Debug)]
pub struct SpecFile {
    path: TempPath,
    origin: String,
}

impl SpecFile {
    /// Take ownership of an existing temporary file.
    pub fn from_temp_path(path: TempPath, origin: impl Into<String>) -> Self {
        Self {
            path,
            origin: origin.into(),
        }
    }

    /// Local path of the recipe.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Locator the recipe was fetched from.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// [`Fetcher`] over plain HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    work_root: PathBuf,
    max_bytes: u64,
}

impl HttpFetcher {
    /// Create a fetcher writing into `work_root`.
    pub fn new(work_root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        Ok(Self::with_client(http_client()?, work_root, max_bytes))
    }

    /// Create a fetcher sharing an existing HTTP client.
    pub fn with_client(client: Client, work_root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            client,
            work_root: work_root.into(),
            max_bytes,
        }
    }

    async fn download(&self, url: Url) -> Result<SpecFile> {
        let origin = url.to_string();
        let response = get_checked(&self.client, url, self.max_bytes)
            .await
            .map_err(CoreError::Download)?;

        let temp = tempfile::Builder::new()
            .prefix("spec-")
            .suffix(".yaml")
            .tempfile_in(&self.work_root)
            .map_err(|e| CoreError::Download(format!("creating local copy: {e}")))?;
        let (file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        // `path` is dropped with the error, which removes the partial file.
        let written = copy_body(response, &mut file, self.max_bytes)
            .await
            .map_err(CoreError::Download)?;

        tracing::debug!(path = %path.display(), bytes = written, "Recipe downloaded");
        Ok(SpecFile::from_temp_path(path, origin))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<SpecFile> {
        let url = parse_http_url(url).map_err(CoreError::Download)?;
        tracing::info!(%url, "Downloading recipe");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Cancelled { stage: Stage::Downloading }),
            result = self.download(url) => result,
        }
    }
}

/// HTTP client used for recipe and script downloads.
pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| CoreError::InvalidConfig(format!("HTTP client: {e}")))
}

pub(crate) fn parse_http_url(url: &str) -> std::result::Result<Url, String> {
    let parsed = Url::parse(url.trim()).map_err(|e| format!("invalid url {url:?}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(format!("unsupported url scheme {other:?}")),
    }
}

/// GET `url`, failing on non-success status or an oversized declared body.
pub(crate) async fn get_checked(
    client: &Client,
    url: Url,
    max_bytes: u64,
) -> std::result::Result<Response, String> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(Response::error_for_status)
        .map_err(|e| e.to_string())?;

    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(format!("response of {len} bytes exceeds limit of {max_bytes}"));
        }
    }
    Ok(response)
}

/// Stream a response body into `file`, enforcing `max_bytes`.
pub(crate) async fn copy_body(
    mut response: Response,
    file: &mut tokio::fs::File,
    max_bytes: u64,
) -> std::result::Result<u64, String> {
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(format!("response exceeds limit of {max_bytes} bytes"));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("writing local copy: {e}"))?;
    }
    file.flush()
        .await
        .map_err(|e| format!("writing local copy: {e}"))?;
    Ok(written)
}
