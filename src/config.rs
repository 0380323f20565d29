//! Loader for `./.kiln/config`, a flat `KEY=value` file.
//!
//! Parsing reuses `dotenvy`'s iterator over `KEY=value` lines rather than
//! hand-rolling a parser, since the file's grammar is exactly what that
//! crate already speaks. This module only owns validation, defaults, and
//! the typed [`EngineConfig`] the rest of the engine is constructed from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;

/// GitHub.com or GitHub Enterprise Server credentials. Mutually exclusive.
#[derive(Debug, Clone)]
pub enum Credentials {
    GitHubCom { token: String },
    Enterprise {
        host: String,
        token: String,
        api_base: String,
    },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub credentials: Credentials,
    pub project_urls: Vec<String>,
    pub allowed_usernames: Vec<String>,
    pub poll_interval: Duration,
    pub watched_statuses: Vec<String>,
    pub max_concurrent_workflows: usize,
    pub stage_models: HashMap<String, String>,
    pub ghes_logs_mask: bool,
    pub executor_bin: String,
    pub stage_timeout: Duration,
    pub idle_timeout: Duration,
    pub project_dir: PathBuf,
}

impl EngineConfig {
    /// Load and validate configuration from a `KEY=value` file at `path`,
    /// rooted at `project_dir` for resolving relative state paths.
    pub fn load(path: &Path, project_dir: &Path) -> Result<Self, ConfigError> {
        let raw = read_kv_file(path)?;
        Self::from_map(raw, project_dir)
    }

    fn from_map(raw: HashMap<String, String>, project_dir: &Path) -> Result<Self, ConfigError> {
        let credentials = if let Some(token) = raw.get("GITHUB_TOKEN") {
            Credentials::GitHubCom {
                token: token.clone(),
            }
        } else {
            let host = raw
                .get("GHES_HOST")
                .ok_or_else(|| ConfigError::MissingKey("GITHUB_TOKEN".to_string()))?;
            let token = raw
                .get("GHES_TOKEN")
                .ok_or_else(|| ConfigError::MissingKey("GHES_TOKEN".to_string()))?;
            let api_base = raw
                .get("GHES_API_BASE")
                .ok_or_else(|| ConfigError::MissingKey("GHES_API_BASE".to_string()))?;
            Credentials::Enterprise {
                host: host.clone(),
                token: token.clone(),
                api_base: api_base.clone(),
            }
        };

        let project_urls = split_list(
            raw.get("PROJECT_URLS")
                .ok_or_else(|| ConfigError::MissingKey("PROJECT_URLS".to_string()))?,
        );
        if project_urls.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "PROJECT_URLS".to_string(),
                value: String::new(),
            });
        }

        let mut allowed_usernames = Vec::new();
        if let Some(u) = raw.get("ALLOWED_USERNAME") {
            allowed_usernames.push(u.clone());
        }
        if let Some(team) = raw.get("USERNAMES_TEAM") {
            allowed_usernames.extend(split_list(team));
        }

        let poll_interval = Duration::from_secs(parse_or_default(&raw, "POLL_INTERVAL", 30)?);
        let watched_statuses = raw
            .get("WATCHED_STATUSES")
            .map(|s| split_list(s))
            .unwrap_or_else(|| {
                vec![
                    "Research".to_string(),
                    "Plan".to_string(),
                    "Implement".to_string(),
                ]
            });
        let max_concurrent_workflows =
            parse_or_default(&raw, "MAX_CONCURRENT_WORKFLOWS", 3)? as usize;

        let stage_models = raw
            .get("STAGE_MODELS")
            .map(|s| parse_stage_models(s))
            .unwrap_or_default();

        let ghes_logs_mask = raw
            .get("GHES_LOGS_MASK")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let executor_bin = raw
            .get("EXECUTOR_BIN")
            .cloned()
            .unwrap_or_else(|| "claude".to_string());

        let stage_timeout =
            Duration::from_secs(parse_or_default(&raw, "STAGE_TIMEOUT_MINUTES", 60)? * 60);
        let idle_timeout =
            Duration::from_secs(parse_or_default(&raw, "IDLE_TIMEOUT_MINUTES", 10)? * 60);

        Ok(Self {
            credentials,
            project_urls,
            allowed_usernames,
            poll_interval,
            watched_statuses,
            max_concurrent_workflows,
            stage_models,
            ghes_logs_mask,
            executor_bin,
            stage_timeout,
            idle_timeout,
            project_dir: project_dir.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.project_dir.join(".kiln").join("db.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.project_dir.join(".kiln").join("logs")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.project_dir.join("workspaces")
    }

    pub fn model_for_stage(&self, stage: &str) -> Option<&str> {
        self.stage_models.get(stage).map(|s| s.as_str())
    }
}

fn read_kv_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let mut map = HashMap::new();
    for item in dotenvy::from_path_iter(path)? {
        let (key, value) = item?;
        map.insert(key, value);
    }
    Ok(map)
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn parse_stage_models(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in s.split(',') {
        if let Some((stage, model)) = pair.split_once('=') {
            out.insert(stage.trim().to_string(), model.trim().to_string());
        }
    }
    out
}

fn parse_or_default(raw: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    match raw.get(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: v.clone(),
        }),
    }
}

/// The minimum GitHub token scopes the engine needs. Refuses to start if the
/// token's granted scopes (as reported by the tracker) exceed this set.
pub const REQUIRED_TOKEN_SCOPES: &[&str] = &["repo", "read:org"];

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "GITHUB_TOKEN=ghp_abc\nPROJECT_URLS=https://github.com/acme/web\n",
        );
        let cfg = EngineConfig::load(&path, dir.path()).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent_workflows, 3);
        assert_eq!(cfg.project_urls, vec!["https://github.com/acme/web"]);
    }

    #[test]
    fn missing_project_urls_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "GITHUB_TOKEN=ghp_abc\n");
        let err = EngineConfig::load(&path, dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(k) if k == "PROJECT_URLS"));
    }

    #[test]
    fn parses_stage_models_and_allow_list() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "GITHUB_TOKEN=ghp_abc\n\
             PROJECT_URLS=https://github.com/acme/web\n\
             ALLOWED_USERNAME=alice\n\
             USERNAMES_TEAM=\"bob, carol\"\n\
             STAGE_MODELS=research=haiku,implement=opus\n",
        );
        let cfg = EngineConfig::load(&path, dir.path()).unwrap();
        assert_eq!(cfg.allowed_usernames, vec!["alice", "bob", "carol"]);
        assert_eq!(cfg.model_for_stage("research"), Some("haiku"));
        assert_eq!(cfg.model_for_stage("implement"), Some("opus"));
    }

    #[test]
    fn enterprise_credentials_require_full_triple() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "GHES_HOST=ghe.acme.internal\nPROJECT_URLS=https://ghe.acme.internal/acme/web\n",
        );
        let err = EngineConfig::load(&path, dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(k) if k == "GHES_TOKEN"));
    }
}
