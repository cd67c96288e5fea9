//! Release discovery and installer download.
//!
//! The newest release on the releases endpoint is searched for an asset whose
//! name contains every configured fragment; its installer is downloaded next
//! to the install directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::DownloadError;
use crate::obs;
use crate::outcome::{Outcome, StatusCode};
use crate::retry::RetryPolicy;
use crate::settings::SbieSettings;

/// Provides the installer executable for a fresh installation.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Place the installer in `dest_dir` (or reuse one already there) and
    /// return its path.
    async fn download_installer(&self, dest_dir: &Path, retry: bool) -> Outcome<PathBuf>;
}

/// A downloadable release asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub url: String,
    /// Lowercase hex SHA-256, when published
    pub sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReleaseJson {
    #[serde(default)]
    assets: Option<Vec<AssetJson>>,
}

#[derive(Debug, Deserialize)]
struct AssetJson {
    name: Option<String>,
    browser_download_url: Option<String>,
    digest: Option<String>,
}

/// Pick the required asset from a releases-list body.
pub fn select_asset(body: &str, fragments: &[String]) -> Outcome<ReleaseAsset> {
    let releases: Vec<ReleaseJson> = match serde_json::from_str(body) {
        Ok(releases) => releases,
        Err(err) => {
            return Outcome::fail(
                StatusCode::InstallWebParsingError,
                format!("releases body is not valid: {}", DownloadError::from(err)),
            )
        }
    };
    let Some(latest) = releases.into_iter().next() else {
        return Outcome::fail(StatusCode::WebNoReleases, "no releases published");
    };
    let assets = latest.assets.unwrap_or_default();
    if assets.is_empty() {
        return Outcome::fail(StatusCode::WebNoAssets, "latest release has no assets");
    }

    let Some(asset) = assets.into_iter().find(|asset| {
        asset
            .name
            .as_deref()
            .is_some_and(|name| fragments.iter().all(|f| name.contains(f.as_str())))
    }) else {
        return Outcome::fail(
            StatusCode::WebNoRequiredAsset,
            format!("no asset name contains all of {fragments:?}"),
        );
    };

    let Some(url) = asset.browser_download_url else {
        return Outcome::fail(StatusCode::WebNoDownloadUrl, "asset has no download url");
    };
    Outcome::ok(ReleaseAsset {
        name: asset.name.unwrap_or_default(),
        url,
        sha256: asset
            .digest
            .and_then(|d| d.strip_prefix("sha256:").map(str::to_ascii_lowercase)),
    })
}

/// Last path segment of a download URL.
pub fn asset_file_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

/// A previously downloaded installer in `dir`: exact name match, or any file
/// whose name contains every fragment.
pub fn find_existing(dir: &Path, file_name: &str, fragments: &[String]) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .find(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name == file_name || fragments.iter().all(|f| name.contains(f.as_str()))
        })
        .map(|entry| entry.path())
}

/// Check `bytes` against an expected lowercase hex SHA-256.
pub fn verify_digest(bytes: &[u8], expected: &str) -> Result<(), DownloadError> {
    let actual = hex::encode(Sha256::digest(bytes));
    if actual == expected {
        Ok(())
    } else {
        Err(DownloadError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Releases served by the GitHub releases API.
pub struct GithubReleases {
    settings: Arc<SbieSettings>,
    client: reqwest::Client,
}

impl GithubReleases {
    pub fn new(settings: Arc<SbieSettings>) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .build()?;
        Ok(Self { settings, client })
    }

    /// Locate the newest matching asset.
    pub async fn latest_asset(&self) -> Outcome<ReleaseAsset> {
        let response = match self
            .client
            .get(&self.settings.releases_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return Outcome::fail(StatusCode::WebNotFound, DownloadError::from(err).to_string())
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Outcome::fail(
                StatusCode::WebBadStatusCode,
                format!("releases request failed with status {status}"),
            );
        }
        match response.text().await {
            Ok(body) => select_asset(&body, &self.settings.asset_name_fragments),
            Err(err) => Outcome::fail(
                StatusCode::InstallWebParsingError,
                DownloadError::from(err).to_string(),
            ),
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let response = self
            .client
            .get(url)
            .timeout(self.settings.download_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn download_installer(&self, dest_dir: &Path, retry: bool) -> Outcome<PathBuf> {
        let asset = self.latest_asset().await;
        let Some(asset) = asset.data().cloned() else {
            return asset.context(StatusCode::DownloadNoUrl, "installer url was not resolved");
        };
        let Some(file_name) = asset_file_name(&asset.url) else {
            return Outcome::fail(
                StatusCode::DownloadNoUrl,
                format!("no file name in {}", asset.url),
            );
        };

        let fragments = &self.settings.asset_name_fragments;
        if let Some(existing) = find_existing(dest_dir, file_name, fragments) {
            debug!(path = %existing.display(), "reusing downloaded installer");
            return Outcome::ok(existing);
        }

        let target = dest_dir.join(file_name);
        let policy = RetryPolicy::from_flag(retry);
        for attempt in policy.iter() {
            match self.fetch(&asset.url).await {
                Ok(bytes) if bytes.is_empty() => {
                    return Outcome::fail(
                        StatusCode::DownloadFailed,
                        format!("empty download {}", policy.describe()),
                    );
                }
                Ok(bytes) => {
                    if let Some(expected) = &asset.sha256 {
                        if let Err(err) = verify_digest(&bytes, expected) {
                            return Outcome::fail(StatusCode::DownloadDigestMismatch, err.to_string());
                        }
                    }
                    match fs::write(&target, &bytes) {
                        Ok(()) => {
                            info!(path = %target.display(), bytes = bytes.len(), "installer downloaded");
                            break;
                        }
                        Err(err) if policy.is_final(attempt) => {
                            return Outcome::fail(
                                StatusCode::DownloadFailed,
                                DownloadError::from(err).to_string(),
                            );
                        }
                        Err(err) => obs::emit_attempt_failed(
                            "download",
                            attempt,
                            policy.attempts(),
                            &err.to_string(),
                        ),
                    }
                }
                Err(err) if policy.is_final(attempt) => {
                    return Outcome::fail(
                        StatusCode::DownloadTimeout,
                        format!("download did not complete {}: {err}", policy.describe()),
                    );
                }
                Err(err) => {
                    obs::emit_attempt_failed("download", attempt, policy.attempts(), &err.to_string())
                }
            }
        }

        if target.is_file() {
            Outcome::ok(target)
        } else {
            Outcome::fail(
                StatusCode::DownloadFileNotFound,
                format!("{} not found after download", target.display()),
            )
        }
    }
}
