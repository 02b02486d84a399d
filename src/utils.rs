use std::path::{Path, PathBuf};

use reqwest::{header::ACCEPT, Client, StatusCode};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{} does not exist and no download URL is configured", .0.display())]
    Missing(PathBuf),
    #[error("failed to download {url}: {status}")]
    Status { url: String, status: StatusCode },
    #[error("failed to download artifact: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Makes sure `path` exists, downloading it from `url` when it does not.
pub async fn ensure_artifact(
    client: &Client,
    path: &Path,
    url: Option<&str>,
    token: Option<&str>,
) -> Result<(), ProvisionError> {
    if tokio::fs::try_exists(path).await? {
        return Ok(());
    }
    let url = url.ok_or_else(|| ProvisionError::Missing(path.to_path_buf()))?;
    download_file(client, url, path, token).await
}

async fn download_file(
    client: &Client,
    url: &str,
    path: &Path,
    token: Option<&str>,
) -> Result<(), ProvisionError> {
    info!(%url, path = %path.display(), "downloading artifact");

    let mut request = client.get(url).header(ACCEPT, "application/octet-stream");
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProvisionError::Status {
            url: url.to_string(),
            status,
        });
    }

    let bytes = response.bytes().await?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, &bytes).await?;
    info!(bytes = bytes.len(), path = %path.display(), "artifact saved");
    Ok(())
}
