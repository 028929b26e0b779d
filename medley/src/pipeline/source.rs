//! Source materialization.
//!
//! A job's `source` field is either a remote URL or the name of a file
//! previously staged under the upload root. Either way the pipeline needs a
//! local path before the engines can touch it. Downloads are streamed to a
//! `.part` file and renamed only once complete, so a crashed download never
//! leaves a partial file at the final path.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::artifacts::JobWorkspace;
use crate::{Error, Result};

const DEFAULT_REMOTE_FILE_NAME: &str = "source.mp4";

/// Resolves a job source to a local file, enforcing the size ceiling.
pub struct SourceMaterializer {
    client: Client,
    upload_root: PathBuf,
    max_source_bytes: u64,
}

enum SourceKind<'a> {
    Remote(Url),
    Upload(&'a str),
}

impl SourceMaterializer {
    pub fn new(client: Client, upload_root: impl Into<PathBuf>, max_source_bytes: u64) -> Self {
        Self {
            client,
            upload_root: upload_root.into(),
            max_source_bytes,
        }
    }

    /// Produce a local path for `source`, downloading it if remote.
    ///
    /// The returned file is transient: the caller removes it once the job
    /// reaches a terminal state.
    pub async fn materialize(&self, source: &str, workspace: &JobWorkspace) -> Result<PathBuf> {
        match parse_source(source)? {
            SourceKind::Remote(url) => self.download(&url, &workspace.upload_dir).await,
            SourceKind::Upload(token) => self.resolve_upload(token).await,
        }
    }

    async fn resolve_upload(&self, token: &str) -> Result<PathBuf> {
        validate_upload_token(token)?;
        let path = self.upload_root.join(token);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::validation(format!("uploaded source {token} does not exist")))?;
        if !metadata.is_file() {
            return Err(Error::validation(format!(
                "uploaded source {token} is not a regular file"
            )));
        }
        if metadata.len() > self.max_source_bytes {
            return Err(Error::validation(format!(
                "source size {} exceeds the {} byte limit",
                metadata.len(),
                self.max_source_bytes
            )));
        }
        debug!(token, size = metadata.len(), "resolved staged upload");
        Ok(path)
    }

    async fn download(&self, url: &Url, dest_dir: &Path) -> Result<PathBuf> {
        let response = self.client.get(url.as_str()).send().await?;
        if !response.status().is_success() {
            return Err(Error::validation(format!(
                "source fetch failed with http status {}",
                response.status()
            )));
        }
        if let Some(length) = response.content_length() {
            if length > self.max_source_bytes {
                return Err(Error::validation(format!(
                    "source size {length} exceeds the {} byte limit",
                    self.max_source_bytes
                )));
            }
        }

        let file_name = remote_file_name(url);
        let final_path = dest_dir.join(&file_name);
        let part_path = dest_dir.join(format!("{file_name}.part"));

        if let Err(err) = self.stream_to_file(response, &part_path).await {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(err);
        }
        tokio::fs::rename(&part_path, &final_path)
            .await
            .map_err(|e| Error::io_path("renaming downloaded source", &final_path, e))?;
        info!(url = %url, path = %final_path.display(), "source downloaded");
        Ok(final_path)
    }

    async fn stream_to_file(&self, response: reqwest::Response, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::io_path("creating download file", path, e))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > self.max_source_bytes {
                return Err(Error::validation(format!(
                    "source exceeded the {} byte limit while downloading",
                    self.max_source_bytes
                )));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io_path("writing download file", path, e))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::io_path("flushing download file", path, e))?;
        Ok(())
    }
}

fn parse_source(source: &str) -> Result<SourceKind<'_>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let url = Url::parse(source)
            .map_err(|e| Error::validation(format!("invalid source url {source}: {e}")))?;
        Ok(SourceKind::Remote(url))
    } else {
        Ok(SourceKind::Upload(source))
    }
}

/// Upload tokens are bare file names. Anything that could walk out of the
/// upload root is rejected.
fn validate_upload_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(Error::validation("source must not be empty"));
    }
    if token.contains('/') || token.contains('\\') || token == "." || token == ".." {
        return Err(Error::validation(format!(
            "invalid upload token {token}: must be a bare file name"
        )));
    }
    Ok(())
}

fn remote_file_name(url: &Url) -> String {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    if name.is_empty() {
        DEFAULT_REMOTE_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}
