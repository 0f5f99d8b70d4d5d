//! CDN strategy: fetch a `.zip` over HTTP(S) with retry, then extract it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::{
    install_zip, stream_to_file, wrong_config, DownloadConfig, DownloadOutcome, DownloadStrategy,
    SourceType,
};
use crate::archive::ExtractionLimits;
use crate::config::EngineConfig;
use crate::error::PluginError;
use crate::fs_util;
use crate::retry::{run_with_retry, AttemptError, ErrorKind, RetryPolicy};

pub struct CdnStrategy {
    client: reqwest::Client,
    retry: RetryPolicy,
    timeout: Duration,
    limits: ExtractionLimits,
    search_depth: usize,
}

impl CdnStrategy {
    pub fn new(config: &EngineConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("plugin-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            retry: config.download.retry_policy(),
            timeout: config.download.timeout(),
            limits: config.limits.extraction_limits(),
            search_depth: config.limits.manifest_search_depth,
        }
    }

    async fn download_once(&self, url: &Url, dest: &Path) -> Result<u64, AttemptError> {
        let response = self.client.get(url.clone()).send().await?;
        stream_to_file(response, dest, self.limits.max_file_size).await
    }

    async fn download_with_timeout(&self, url: &Url, dest: &Path) -> Result<u64, AttemptError> {
        match tokio::time::timeout(self.timeout, self.download_once(url, dest)).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::new(
                ErrorKind::Timeout,
                PluginError::Network(format!(
                    "download of {} timed out after {}s",
                    url,
                    self.timeout.as_secs()
                )),
            )),
        }
    }

    async fn fetch_and_install(
        &self,
        url: &Url,
        zip_path: &Path,
        stem: &str,
        plugins_dir: &Path,
    ) -> Result<DownloadOutcome, PluginError> {
        let bytes = run_with_retry(&self.retry, url.as_str(), |_attempt| {
            self.download_with_timeout(url, zip_path)
        })
        .await?;
        debug!(url = %url, bytes, path = ?zip_path, "Archive downloaded");

        install_zip(zip_path, Some(stem), plugins_dir, self.limits, self.search_depth).await
    }
}

/// Check protocol and extension before any I/O. Returns the parsed URL and
/// the archive file name.
pub fn validate_url(raw: &str) -> Result<(Url, String), PluginError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| PluginError::Validation(format!("invalid URL '{}': {}", raw, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(PluginError::Validation(format!(
            "unsupported protocol '{}', expected http or https",
            url.scheme()
        )));
    }
    let file_name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .unwrap_or_default();
    let is_zip = file_name.to_lowercase().ends_with(".zip");
    // The stem names a directory inside the extraction root
    let dot_stem = matches!(file_name.get(..file_name.len().saturating_sub(4)), Some("." | ".."));
    if !is_zip || file_name.len() <= ".zip".len() || dot_stem || file_name.contains(['/', '\\']) {
        return Err(PluginError::Validation(format!(
            "URL must point to a .zip archive: {}",
            raw
        )));
    }
    Ok((url, file_name))
}

fn file_stem(file_name: &str) -> &str {
    &file_name[..file_name.len() - ".zip".len()]
}

#[async_trait]
impl DownloadStrategy for CdnStrategy {
    async fn execute(
        &self,
        config: &DownloadConfig,
        plugins_dir: &Path,
    ) -> Result<DownloadOutcome, PluginError> {
        let DownloadConfig::Cdn(cdn) = config else {
            return Err(wrong_config(SourceType::Cdn, config));
        };
        let (url, file_name) = validate_url(&cdn.url)?;
        info!(url = %url, "Downloading plugin archive");

        fs_util::ensure_dir(plugins_dir)?;
        let zip_path: PathBuf =
            plugins_dir.join(format!(".download-{}-{}", fs_util::now_millis(), file_name));

        let result = self
            .fetch_and_install(&url, &zip_path, file_stem(&file_name), plugins_dir)
            .await;
        fs_util::remove_best_effort(&zip_path);
        result
    }
}
