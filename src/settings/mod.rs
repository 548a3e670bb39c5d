//! Organization settings: which repositories to mirror and index
//!
//! One JSON file per organization lives in `<data_dir>/conf`. An
//! organization either lists its repositories directly or carries an `scm`
//! block, in which case the list is discovered from a source-control server
//! on [`SettingsStore::sync`].

pub mod fs_lock;

use crate::error::SettingsError;
use crate::git::{RefFilters, repo_name_from_url};
use async_trait::async_trait;
use fs_lock::SettingsLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Settings of one organization, as stored in `<conf_dir>/<name>.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSetting {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<ProjectSetting>,
    /// Source-control server options; presence means repositories are discovered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scm: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub overrides: SettingOverrides,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSetting {
    pub name: String,
    #[serde(default)]
    pub repositories: Vec<RepositorySetting>,
    #[serde(flatten)]
    pub overrides: SettingOverrides,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySetting {
    pub url: String,
    /// Defaults to the last segment of `url` without `.git`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub overrides: SettingOverrides,
}

impl RepositorySetting {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => repo_name_from_url(&self.url),
        }
    }
}

/// Size limit and ref filters that may be set at any settings level
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_branches: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_branches: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_tags: Option<String>,
}

impl OrganizationSetting {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn find_project(&self, project: &str) -> Option<&ProjectSetting> {
        self.projects.iter().find(|p| p.name == project)
    }

    pub fn find_repository(&self, project: &str, repository: &str) -> Option<&RepositorySetting> {
        self.find_project(project)?
            .repositories
            .iter()
            .find(|r| r.name() == repository)
    }

    /// Append a repository, creating its project when needed
    pub fn add_repository(&mut self, project: &str, url: &str) -> Result<(), SettingsError> {
        let repository = repo_name_from_url(url);
        if self.find_repository(project, &repository).is_some() {
            return Err(SettingsError::RepositoryExists(format!(
                "{}:{}/{}",
                self.name, project, repository
            )));
        }

        match self.projects.iter_mut().find(|p| p.name == project) {
            Some(existing) => existing.repositories.push(RepositorySetting::new(url)),
            None => self.projects.push(ProjectSetting {
                name: project.to_string(),
                repositories: vec![RepositorySetting::new(url)],
                overrides: SettingOverrides::default(),
            }),
        }
        Ok(())
    }

    /// Every repository of this organization with its effective settings
    pub fn targets(&self, default_size_limit: u64) -> Vec<RepositoryTarget> {
        self.projects
            .iter()
            .flat_map(|project| {
                project
                    .repositories
                    .iter()
                    .map(move |repository| self.target(project, repository, default_size_limit))
            })
            .collect()
    }

    fn target(
        &self,
        project: &ProjectSetting,
        repository: &RepositorySetting,
        default_size_limit: u64,
    ) -> RepositoryTarget {
        let levels = [&repository.overrides, &project.overrides, &self.overrides];

        let size_limit = levels
            .iter()
            .filter_map(|o| o.size_limit)
            .find(|limit| *limit > 0)
            .unwrap_or(default_size_limit);

        let filters = RefFilters {
            include_branches: first_valid_regex(levels.map(|o| o.include_branches.as_deref())),
            exclude_branches: first_valid_regex(levels.map(|o| o.exclude_branches.as_deref())),
            include_tags: first_valid_regex(levels.map(|o| o.include_tags.as_deref())),
            exclude_tags: first_valid_regex(levels.map(|o| o.exclude_tags.as_deref())),
        };

        RepositoryTarget {
            organization: self.name.clone(),
            project: project.name.clone(),
            repository: repository.name(),
            url: repository.url.clone(),
            filters,
            size_limit,
        }
    }
}

/// First non-empty pattern that compiles, most specific level first
fn first_valid_regex(patterns: [Option<&str>; 3]) -> Option<Regex> {
    for pattern in patterns.into_iter().flatten() {
        if pattern.is_empty() {
            continue;
        }
        match Regex::new(pattern) {
            Ok(re) => return Some(re),
            Err(e) => tracing::warn!("Failed to parse regex pattern '{}': {}", pattern, e),
        }
    }
    None
}

/// A repository to sync with its resolved size limit and ref filters
#[derive(Debug, Clone)]
pub struct RepositoryTarget {
    pub organization: String,
    pub project: String,
    pub repository: String,
    pub url: String,
    pub filters: RefFilters,
    pub size_limit: u64,
}

impl RepositoryTarget {
    pub fn matches(&self, organization: &str, project: &str, repository: &str) -> bool {
        self.organization == organization && self.project == project && self.repository == repository
    }
}

impl std::fmt::Display for RepositoryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.organization, self.project, self.repository)
    }
}

/// A repository reported by a source-control server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRepository {
    pub project: String,
    pub url: String,
}

/// Lists the repositories of an organization from a source-control server
#[async_trait]
pub trait RepositoryDiscovery: Send + Sync {
    async fn discover(
        &self,
        organization: &str,
        scm: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<DiscoveredRepository>>;
}

/// Where an organization's repository list comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsSource {
    DirectRepoList(OrganizationSetting),
    DiscoveredFromServer(OrganizationSetting),
}

impl SettingsSource {
    pub fn from_setting(setting: OrganizationSetting) -> Self {
        if setting.scm.is_some() {
            SettingsSource::DiscoveredFromServer(setting)
        } else {
            SettingsSource::DirectRepoList(setting)
        }
    }

    pub fn setting(&self) -> &OrganizationSetting {
        match self {
            SettingsSource::DirectRepoList(setting)
            | SettingsSource::DiscoveredFromServer(setting) => setting,
        }
    }

    fn setting_mut(&mut self) -> &mut OrganizationSetting {
        match self {
            SettingsSource::DirectRepoList(setting)
            | SettingsSource::DiscoveredFromServer(setting) => setting,
        }
    }

    pub fn name(&self) -> &str {
        &self.setting().name
    }

    pub fn list_repositories(&self, default_size_limit: u64) -> Vec<RepositoryTarget> {
        self.setting().targets(default_size_limit)
    }

    /// Refresh the repository list; a direct list has nothing to refresh
    ///
    /// Discovered repositories replace the project list in memory while
    /// keeping the overrides of projects and repositories seen before.
    pub async fn sync(&mut self, discovery: Option<&dyn RepositoryDiscovery>) -> Result<(), SettingsError> {
        let SettingsSource::DiscoveredFromServer(setting) = self else {
            return Ok(());
        };
        let Some(discovery) = discovery else {
            tracing::warn!(
                "Organization '{}' has scm options but no discovery client is configured",
                setting.name
            );
            return Ok(());
        };

        let scm = setting.scm.clone().unwrap_or_default();
        let discovered = discovery
            .discover(&setting.name, &scm)
            .await
            .map_err(|e| SettingsError::DiscoveryFailed {
                organization: setting.name.clone(),
                reason: format!("{:#}", e),
            })?;

        let mut projects: Vec<ProjectSetting> = Vec::new();
        for found in discovered {
            let name = repo_name_from_url(&found.url);
            let repository = setting
                .find_repository(&found.project, &name)
                .cloned()
                .unwrap_or_else(|| RepositorySetting::new(&found.url));

            match projects.iter_mut().find(|p| p.name == found.project) {
                Some(project) => project.repositories.push(repository),
                None => projects.push(ProjectSetting {
                    name: found.project.clone(),
                    repositories: vec![repository],
                    overrides: setting
                        .find_project(&found.project)
                        .map(|p| p.overrides.clone())
                        .unwrap_or_default(),
                }),
            }
        }

        tracing::info!(
            "Discovered {} repositories in {} projects for '{}'",
            projects.iter().map(|p| p.repositories.len()).sum::<usize>(),
            projects.len(),
            setting.name
        );
        setting.projects = projects;
        Ok(())
    }
}

/// Settings of every organization, backed by `<data_dir>/conf/*.json`
pub struct SettingsStore {
    conf_dir: PathBuf,
    default_size_limit: u64,
    lock_timeout: Duration,
    sources: Mutex<Vec<SettingsSource>>,
    discovery: Option<Arc<dyn RepositoryDiscovery>>,
}

impl SettingsStore {
    /// Load every organization file under `<data_dir>/conf`
    pub fn open(data_dir: &Path, default_size_limit: u64) -> Result<Self, SettingsError> {
        let conf_dir = crate::paths::PlatformPaths::conf_dir(data_dir);
        fs::create_dir_all(&conf_dir).map_err(|e| SettingsError::LoadFailed {
            path: conf_dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let sources = load_sources(&conf_dir)?;
        tracing::info!(
            "Loaded {} organization settings from {}",
            sources.len(),
            conf_dir.display()
        );

        Ok(Self {
            conf_dir,
            default_size_limit,
            lock_timeout: Duration::from_secs(30),
            sources: Mutex::new(sources),
            discovery: None,
        })
    }

    /// Use `discovery` for organizations that carry scm options
    pub fn with_discovery(mut self, discovery: Arc<dyn RepositoryDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    pub async fn organizations(&self) -> Vec<OrganizationSetting> {
        let sources = self.sources.lock().await;
        sources.iter().map(|s| s.setting().clone()).collect()
    }

    /// Every configured repository with its effective settings
    pub async fn list_repositories(&self) -> Vec<RepositoryTarget> {
        let sources = self.sources.lock().await;
        sources
            .iter()
            .flat_map(|s| s.list_repositories(self.default_size_limit))
            .collect()
    }

    pub async fn find_repository(
        &self,
        organization: &str,
        project: &str,
        repository: &str,
    ) -> Option<RepositoryTarget> {
        self.list_repositories()
            .await
            .into_iter()
            .find(|t| t.matches(organization, project, repository))
    }

    /// Create a new organization
    pub async fn add_organization(&self, setting: OrganizationSetting) -> Result<(), SettingsError> {
        let mut sources = self.sources.lock().await;
        if sources.iter().any(|s| s.name() == setting.name) {
            return Err(SettingsError::AlreadyExists(setting.name));
        }

        self.write_setting(&setting).await?;
        tracing::info!("Added organization '{}'", setting.name);
        sources.push(SettingsSource::from_setting(setting));
        Ok(())
    }

    /// Register a repository by URL, creating its organization and project
    /// when needed
    pub async fn add_repository(
        &self,
        organization: &str,
        project: &str,
        url: &str,
    ) -> Result<RepositoryTarget, SettingsError> {
        let mut sources = self.sources.lock().await;

        let mut setting = sources
            .iter()
            .find(|s| s.name() == organization)
            .map(|s| s.setting().clone())
            .unwrap_or_else(|| OrganizationSetting::new(organization));
        setting.add_repository(project, url)?;

        self.write_setting(&setting).await?;

        let repository = repo_name_from_url(url);
        let target = setting
            .targets(self.default_size_limit)
            .into_iter()
            .find(|t| t.matches(organization, project, &repository))
            .ok_or_else(|| SettingsError::NotFound(format!("{}:{}/{}", organization, project, repository)))?;

        match sources.iter_mut().find(|s| s.name() == organization) {
            Some(source) => *source.setting_mut() = setting,
            None => sources.push(SettingsSource::from_setting(setting)),
        }

        tracing::info!("Added repository {} ({})", target, url);
        Ok(target)
    }

    /// Reload every settings file and refresh discovered repository lists
    ///
    /// A failed discovery is logged and leaves that organization's list as
    /// loaded from disk.
    pub async fn sync(&self) -> Result<(), SettingsError> {
        let mut sources = self.sources.lock().await;
        *sources = load_sources(&self.conf_dir)?;

        for source in sources.iter_mut() {
            if let Err(e) = source.sync(self.discovery.as_deref()).await {
                tracing::warn!("Failed to sync settings for '{}': {}", source.name(), e);
            }
        }
        Ok(())
    }

    async fn write_setting(&self, setting: &OrganizationSetting) -> Result<(), SettingsError> {
        let conf_dir = self.conf_dir.clone();
        let timeout = self.lock_timeout;
        let setting = setting.clone();
        let path = self.conf_dir.join(format!("{}.json", setting.name));
        let save_failed = |reason: String| SettingsError::SaveFailed {
            path: path.display().to_string(),
            reason,
        };

        tokio::task::spawn_blocking(move || write_setting_file(&conf_dir, &setting, timeout))
            .await
            .map_err(|e| save_failed(e.to_string()))?
            .map_err(|e| save_failed(format!("{:#}", e)))
    }
}

fn load_sources(conf_dir: &Path) -> Result<Vec<SettingsSource>, SettingsError> {
    let load_failed = |path: &Path, reason: String| SettingsError::LoadFailed {
        path: path.display().to_string(),
        reason,
    };

    let entries = fs::read_dir(conf_dir).map_err(|e| load_failed(conf_dir, e.to_string()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Settings file {} disappeared while loading: {}", path.display(), e);
                continue;
            }
        };
        let setting: OrganizationSetting =
            serde_json::from_str(&content).map_err(|e| load_failed(&path, e.to_string()))?;
        sources.push(SettingsSource::from_setting(setting));
    }
    Ok(sources)
}

fn write_setting_file(
    conf_dir: &Path,
    setting: &OrganizationSetting,
    timeout: Duration,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let _lock = SettingsLock::acquire(conf_dir, timeout)?;

    let path = conf_dir.join(format!("{}.json", setting.name));
    let content = serde_json::to_string_pretty(setting).context("Failed to serialize settings")?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content).with_context(|| format!("Failed to write {:?}", tmp_path))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("Failed to replace {:?}", path))?;

    tracing::debug!("Saved settings to {:?}", path);
    Ok(())
}
