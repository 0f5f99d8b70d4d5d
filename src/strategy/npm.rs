//! npm strategy: resolve a package in a registry, fetch its tarball and
//! install its dependency tree under `node_modules`.
//!
//! Dependencies are installed best-effort by directory recursion: a failed
//! dependency is logged and skipped, it never aborts the primary package.

use async_trait::async_trait;
use base64::Engine as _;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    blocking, stream_to_file, wrong_config, DownloadConfig, DownloadOutcome, DownloadStrategy,
    PrivateRegistry, SourceType,
};
use crate::archive::{self, ExtractionLimits};
use crate::config::EngineConfig;
use crate::error::PluginError;
use crate::fs_util;
use crate::manifest::{PluginManifest, MANIFEST_FILE};

const TARBALL_FILE: &str = "package.tgz";
const NATIVE_MODULES: &str = "native_modules";
const NODE_MODULES: &str = "node_modules";

/// Registry document for one package (the "packument")
#[derive(Debug, Deserialize)]
struct Packument {
    #[serde(default)]
    versions: HashMap<String, PackageVersion>,
    #[serde(default, rename = "dist-tags")]
    dist_tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PackageVersion {
    dist: Dist,
}

#[derive(Debug, Deserialize)]
struct Dist {
    tarball: String,
    #[serde(default)]
    integrity: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

/// Registry endpoint plus optional bearer token
#[derive(Debug, Clone)]
struct Registry {
    base: String,
    token: Option<String>,
}

impl Registry {
    fn package_url(&self, name: &str) -> String {
        format!("{}/{}", self.base.trim_end_matches('/'), encode_package_name(name))
    }

    /// Only send credentials back to the registry that issued them
    fn token_for(&self, url: &str) -> Option<&str> {
        let same_host = match (url::Url::parse(url), url::Url::parse(&self.base)) {
            (Ok(target), Ok(base)) => {
                target.host_str() == base.host_str() && target.port_or_known_default() == base.port_or_known_default()
            }
            _ => false,
        };
        if same_host {
            self.token.as_deref()
        } else {
            None
        }
    }
}

/// Whether the package ends up as `{millis}-{name}` or as a plain
/// `node_modules/{name}` dependency directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Primary,
    Dependency,
}

pub struct NpmStrategy {
    client: reqwest::Client,
    registry_url: String,
    timeout: Duration,
    limits: ExtractionLimits,
    max_dependency_depth: usize,
    verify_integrity: bool,
}

impl NpmStrategy {
    pub fn new(config: &EngineConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("plugin-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            registry_url: config.npm.registry_url.clone(),
            timeout: config.npm.timeout(),
            limits: config.limits.extraction_limits(),
            max_dependency_depth: config.npm.max_dependency_depth,
            verify_integrity: config.npm.verify_integrity,
        }
    }

    fn registry(&self, private: Option<&PrivateRegistry>) -> Registry {
        match private {
            Some(private) => Registry {
                base: private.private_url.clone(),
                token: private.auth_token.clone(),
            },
            None => Registry {
                base: self.registry_url.clone(),
                token: None,
            },
        }
    }

    async fn fetch_packument(&self, registry: &Registry, name: &str) -> Result<Packument, PluginError> {
        let url = registry.package_url(name);
        debug!(package = %name, url = %url, "Fetching package metadata");
        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = registry.token.as_deref() {
            request = request.bearer_auth(token);
        }

        // Headers and body share one deadline
        let fetch = async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(PluginError::Network(format!(
                    "registry returned {} for package '{}'",
                    status, name
                )));
            }
            response.json::<Packument>().await.map_err(|e| {
                PluginError::Validation(format!("invalid registry metadata for '{}': {}", name, e))
            })
        };
        tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| PluginError::Network(format!("registry request to {} timed out", url)))?
    }

    async fn download_tarball(
        &self,
        registry: &Registry,
        dist: &Dist,
        dest: &Path,
    ) -> Result<u64, PluginError> {
        let mut request = self.client.get(&dist.tarball);
        if let Some(token) = registry.token_for(&dist.tarball) {
            request = request.bearer_auth(token);
        }
        let transfer = async {
            let response = request.send().await?;
            stream_to_file(response, dest, self.limits.max_file_size).await
        };
        match tokio::time::timeout(self.timeout, transfer).await {
            Ok(result) => result.map_err(|failure| failure.error),
            Err(_) => Err(PluginError::Network(format!(
                "tarball download from {} timed out",
                dist.tarball
            ))),
        }
    }

    /// Install one package (and, recursively, its dependencies) into
    /// `target_dir`. `chain` holds the packages above this one to break
    /// dependency cycles.
    fn install_package<'a>(
        &'a self,
        registry: &'a Registry,
        name: &'a str,
        requested: Option<&'a str>,
        target_dir: &'a Path,
        placement: Placement,
        chain: Vec<String>,
    ) -> BoxFuture<'a, Result<DownloadOutcome, PluginError>> {
        async move {
            let packument = self.fetch_packument(registry, name).await?;
            let (version, release) = resolve_version(&packument, name, requested)?;
            info!(package = %name, version = %version, "Resolved npm package");

            fs_util::ensure_dir(target_dir)?;
            let temp = fs_util::create_temp_extract_dir(target_dir)?;
            let result = self
                .unpack_release(registry, name, &release.dist, &temp, target_dir, placement)
                .await;
            fs_util::remove_best_effort(&temp);
            let outcome = result?;

            promote_native_modules(&outcome.path_dirname);

            let mut chain = chain;
            chain.push(name.to_string());
            self.install_dependencies(registry, &outcome.path_dirname, &chain)
                .await;
            Ok(outcome)
        }
        .boxed()
    }

    async fn unpack_release(
        &self,
        registry: &Registry,
        name: &str,
        dist: &Dist,
        temp: &Path,
        target_dir: &Path,
        placement: Placement,
    ) -> Result<DownloadOutcome, PluginError> {
        let tarball = temp.join(TARBALL_FILE);
        let bytes = self.download_tarball(registry, dist, &tarball).await?;
        debug!(package = %name, bytes, "Tarball downloaded");

        if self.verify_integrity {
            if let Some(integrity) = dist.integrity.clone() {
                let path = tarball.clone();
                blocking("integrity check", move || verify_integrity(&path, &integrity)).await?;
            }
        }

        let extracted = temp.join("extracted");
        let (src, dst, limits) = (tarball.clone(), extracted.clone(), self.limits);
        blocking("tarball extraction", move || archive::extract_tar_gz(&src, &dst, limits)).await?;

        let package_root = resolve_package_root(&extracted)?;
        let metadata = PluginManifest::load(&package_root)?;

        let path_dirname = match placement {
            Placement::Primary => fs_util::finalize_install(&package_root, target_dir, &metadata.name)?,
            Placement::Dependency => {
                let dir = target_dir.join(archive::sanitize_entry_path(name)?);
                fs_util::rename_into_place(&package_root, &dir)?;
                dir
            }
        };

        Ok(DownloadOutcome {
            path_dirname,
            metadata,
        })
    }

    async fn install_dependencies(&self, registry: &Registry, package_dir: &Path, chain: &[String]) {
        let dependencies = match read_dependencies(package_dir) {
            Ok(deps) => deps,
            Err(e) => {
                warn!(dir = ?package_dir, error = %e, "Unreadable package.json, skipping dependencies");
                return;
            }
        };
        if dependencies.is_empty() {
            return;
        }
        if chain.len() > self.max_dependency_depth {
            warn!(
                dir = ?package_dir,
                depth = chain.len(),
                "Dependency depth limit reached, skipping nested dependencies"
            );
            return;
        }

        let modules_dir = package_dir.join(NODE_MODULES);
        for (dependency, range) in &dependencies {
            if chain.iter().any(|ancestor| ancestor == dependency) {
                warn!(package = %dependency, "Dependency cycle detected, skipping");
                continue;
            }
            if modules_dir.join(dependency).exists() {
                debug!(package = %dependency, "Dependency already present");
                continue;
            }
            let result = self
                .install_package(
                    registry,
                    dependency,
                    Some(range.as_str()),
                    &modules_dir,
                    Placement::Dependency,
                    chain.to_vec(),
                )
                .await;
            match result {
                Ok(outcome) => info!(
                    package = %dependency,
                    dir = ?outcome.path_dirname,
                    "Installed dependency"
                ),
                Err(e) => warn!(package = %dependency, error = %e, "Dependency install failed, continuing"),
            }
        }
    }
}

/// `@scope/name` is requested as `@scope%2Fname`
pub fn encode_package_name(name: &str) -> String {
    match name.strip_prefix('@') {
        Some(scoped) => format!("@{}", urlencoding::encode(scoped)),
        None => urlencoding::encode(name).into_owned(),
    }
}

fn validate_package_name(name: &str) -> Result<(), PluginError> {
    let invalid = name.is_empty()
        || name.len() > 214
        || name.starts_with('.')
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
        || archive::sanitize_entry_path(name).is_err();
    if invalid {
        return Err(PluginError::Validation(format!(
            "invalid npm package name '{}'",
            name
        )));
    }
    Ok(())
}

/// Pick a release: exact version, then dist-tag, then an exact match after
/// dropping a leading range operator (`^1.2.0`, `~1.2.0`, `>=1.2.0`).
/// `*`, `x` and the empty string mean `latest`.
fn resolve_version<'p>(
    packument: &'p Packument,
    name: &str,
    requested: Option<&str>,
) -> Result<(String, &'p PackageVersion), PluginError> {
    let requested = requested.map(str::trim).unwrap_or("latest");
    let requested = match requested {
        "" | "*" | "x" => "latest",
        other => other,
    };

    let candidate = if packument.versions.contains_key(requested) {
        Some(requested.to_string())
    } else if let Some(tagged) = packument.dist_tags.get(requested) {
        Some(tagged.clone())
    } else {
        let stripped = requested
            .trim_start_matches(['^', '~', '=', '>', 'v'])
            .trim();
        packument
            .versions
            .contains_key(stripped)
            .then(|| stripped.to_string())
    };

    match candidate.and_then(|v| packument.versions.get(&v).map(|release| (v, release))) {
        Some(found) => Ok(found),
        None => {
            let mut available: Vec<&str> = packument.versions.keys().map(String::as_str).collect();
            available.sort();
            Err(PluginError::Validation(format!(
                "version '{}' of '{}' not found; available versions: {}",
                requested,
                name,
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            )))
        }
    }
}

/// Check an `sha512-<base64>` SRI string. Other algorithms are not checked.
fn verify_integrity(path: &Path, integrity: &str) -> Result<(), PluginError> {
    let Some(expected) = integrity
        .split_whitespace()
        .find_map(|entry| entry.strip_prefix("sha512-"))
    else {
        debug!(integrity = %integrity, "No sha512 integrity, skipping check");
        return Ok(());
    };

    let mut file = File::open(path).map_err(|e| PluginError::fs(path, e))?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|e| PluginError::fs(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let actual = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
    if actual != expected {
        return Err(PluginError::Security(format!(
            "tarball integrity mismatch (expected sha512-{}, got sha512-{})",
            expected, actual
        )));
    }
    Ok(())
}

/// npm tarballs normally unpack into `package/`; fall back to a single
/// top-level directory or the extraction root itself
fn resolve_package_root(extracted: &Path) -> Result<PathBuf, PluginError> {
    let direct = extracted.join("package");
    if direct.join(MANIFEST_FILE).is_file() {
        return Ok(direct);
    }
    if extracted.join(MANIFEST_FILE).is_file() {
        return Ok(extracted.to_path_buf());
    }
    let dirs: Vec<PathBuf> = fs::read_dir(extracted)
        .map_err(|e| PluginError::fs(extracted, e))?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    match dirs.as_slice() {
        [single] if single.join(MANIFEST_FILE).is_file() => Ok(single.clone()),
        _ => Err(PluginError::Validation(
            "manifest.json not found at the package root".to_string(),
        )),
    }
}

/// Prebuilt native modules ship as `native_modules` and are used as
/// `node_modules`
fn promote_native_modules(package_dir: &Path) {
    let native = package_dir.join(NATIVE_MODULES);
    if !native.is_dir() {
        return;
    }
    let modules = package_dir.join(NODE_MODULES);
    if modules.exists() {
        warn!(dir = ?package_dir, "Both native_modules and node_modules present, leaving as is");
        return;
    }
    match fs::rename(&native, &modules) {
        Ok(()) => debug!(dir = ?package_dir, "Renamed native_modules to node_modules"),
        Err(e) => warn!(dir = ?package_dir, error = %e, "Failed to rename native_modules"),
    }
}

fn read_dependencies(package_dir: &Path) -> Result<BTreeMap<String, String>, PluginError> {
    let path = package_dir.join("package.json");
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(&path).map_err(|e| PluginError::fs(&path, e))?;
    let package: PackageJson = serde_json::from_str(&content)?;
    Ok(package.dependencies)
}

#[async_trait]
impl DownloadStrategy for NpmStrategy {
    async fn execute(
        &self,
        config: &DownloadConfig,
        plugins_dir: &Path,
    ) -> Result<DownloadOutcome, PluginError> {
        let DownloadConfig::Npm(npm) = config else {
            return Err(wrong_config(SourceType::Npm, config));
        };
        validate_package_name(&npm.name)?;
        let registry = self.registry(npm.registry.as_ref());
        info!(package = %npm.name, registry = %registry.base, "Installing plugin from npm");

        self.install_package(
            &registry,
            &npm.name,
            npm.version.as_deref(),
            plugins_dir,
            Placement::Primary,
            Vec::new(),
        )
        .await
    }
}
