//! Browser catalogue: maps `(browser, version)` requests to pod templates.
//!
//! Loaded once from YAML at startup and read-only afterwards. Template fields
//! reuse the Kubernetes API types so catalogue entries can carry anything a
//! pod spec accepts (resources, tolerations, volumes, ...).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::{
    EnvVar, HostAlias, PodDNSConfig, ResourceRequirements, Toleration, Volume, VolumeMount,
};
use serde::Deserialize;
use tracing::warn;

use crate::errors::HubError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Meta {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub resources: Option<ResourceRequirements>,
    pub node_selector: BTreeMap<String, String>,
    pub host_aliases: Vec<HostAlias>,
    pub dns_config: Option<PodDNSConfig>,
    pub tolerations: Vec<Toleration>,
    pub service_account_name: String,
    pub priority_class_name: String,
    pub env: Vec<EnvVar>,
    pub volumes: Vec<Volume>,
    pub volume_mounts: Vec<VolumeMount>,
}

/// A fully resolved per-session template. Returned by value so callers can
/// mutate it (capability folding) without touching the catalogue.
#[derive(Debug, Clone, Default)]
pub struct BrowserSpec {
    pub browser_name: String,
    pub browser_version: String,
    pub image: String,
    pub path: String,
    pub privileged: bool,
    pub meta: Meta,
    pub spec: WorkloadSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BrowserEntry {
    default_version: String,
    path: String,
    privileged: bool,
    meta: Meta,
    spec: WorkloadSpec,
    versions: BTreeMap<String, VersionEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct VersionEntry {
    image: String,
    path: Option<String>,
    privileged: Option<bool>,
    meta: Meta,
    spec: WorkloadSpec,
}

#[derive(Debug, Default)]
pub struct BrowserCatalog {
    browsers: BTreeMap<String, BrowserEntry>,
}

impl BrowserCatalog {
    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        let browsers: BTreeMap<String, BrowserEntry> =
            serde_yaml::from_str(yaml).context("failed to parse browser catalogue")?;
        Ok(Self { browsers })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read browser catalogue {}", path.display()))?;
        Self::parse(&yaml)
    }

    /// Resolve a browser request to a template.
    ///
    /// An empty version falls back to the catalogue's `defaultVersion`; a
    /// non-empty version prefix-matches the version keys in sorted order, so
    /// `"85"` resolves to `"85.0"`.
    pub fn find(&self, name: &str, version: &str) -> Result<BrowserSpec, HubError> {
        let entry = self
            .browsers
            .get(name)
            .ok_or_else(|| HubError::UnknownBrowser(name.to_string()))?;

        let requested = if version.is_empty() {
            entry.default_version.as_str()
        } else {
            version
        };

        let (resolved_version, candidate) = entry
            .versions
            .iter()
            .find(|(key, _)| key.starts_with(requested))
            .ok_or_else(|| HubError::UnknownVersion(format!("{name} {requested}")))?;

        Ok(resolve(name, resolved_version, entry, candidate))
    }

    /// Browser names with their configured versions, for `/status`.
    pub fn browsers(&self) -> BTreeMap<String, Vec<String>> {
        self.browsers
            .iter()
            .map(|(name, entry)| (name.clone(), entry.versions.keys().cloned().collect()))
            .collect()
    }
}

fn resolve(name: &str, version: &str, entry: &BrowserEntry, candidate: &VersionEntry) -> BrowserSpec {
    let mut meta = entry.meta.clone();
    meta.labels.extend(candidate.meta.labels.clone());
    meta.annotations.extend(candidate.meta.annotations.clone());

    BrowserSpec {
        browser_name: name.to_string(),
        browser_version: version.to_string(),
        image: candidate.image.clone(),
        path: candidate
            .path
            .clone()
            .unwrap_or_else(|| entry.path.clone()),
        privileged: candidate.privileged.unwrap_or(entry.privileged),
        meta,
        spec: merge_spec(&entry.spec, &candidate.spec),
    }
}

/// Version-level fields override browser-level ones; collections merge with
/// the version values appended last.
fn merge_spec(base: &WorkloadSpec, over: &WorkloadSpec) -> WorkloadSpec {
    let mut node_selector = base.node_selector.clone();
    node_selector.extend(over.node_selector.clone());

    let mut env = base.env.clone();
    env.extend(over.env.iter().cloned());

    WorkloadSpec {
        resources: over.resources.clone().or_else(|| base.resources.clone()),
        node_selector,
        host_aliases: pick_vec(&base.host_aliases, &over.host_aliases),
        dns_config: over.dns_config.clone().or_else(|| base.dns_config.clone()),
        tolerations: pick_vec(&base.tolerations, &over.tolerations),
        service_account_name: pick_str(&base.service_account_name, &over.service_account_name),
        priority_class_name: pick_str(&base.priority_class_name, &over.priority_class_name),
        env,
        volumes: pick_vec(&base.volumes, &over.volumes),
        volume_mounts: pick_vec(&base.volume_mounts, &over.volume_mounts),
    }
}

fn pick_vec<T: Clone>(base: &[T], over: &[T]) -> Vec<T> {
    if over.is_empty() {
        base.to_vec()
    } else {
        over.to_vec()
    }
}

fn pick_str(base: &str, over: &str) -> String {
    if over.is_empty() {
        base.to_string()
    } else {
        over.to_string()
    }
}

/// Startup loader. The catalogue may be mounted by an orchestrator slightly
/// after the hub container starts, so the load is retried before giving up.
pub async fn load_with_retry(path: &Path, attempts: u32) -> anyhow::Result<BrowserCatalog> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match BrowserCatalog::load(path) {
            Ok(catalog) => return Ok(catalog),
            Err(err) => {
                warn!(attempt, error = %err, "browser catalogue load failed");
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("browser catalogue load failed")))
}
