//! Relay configuration stored as TOML (default `relay.toml`).
//!
//! Values are layered: the file, then `RELAY_*` environment variables, then
//! command-line flags applied by the binary.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{Location, MIN_INTERVAL_MS};
use crate::io::github::DEFAULT_API_BASE;
use crate::io::mirror::DEFAULT_RAW_BASE;

pub const DEFAULT_CONFIG_PATH: &str = "relay.toml";

/// Relay configuration (TOML).
///
/// Missing fields fall back to defaults; `owner`, `repo` and `token` have none
/// and are checked by [`RelayConfig::require_remote`] before network access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Account that owns the repository.
    pub owner: String,

    /// Access token for the contents API. Prefer `RELAY_TOKEN` over the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    pub repo: String,

    /// File inside the repository used as the relay resource.
    pub path: String,

    pub branch: String,

    /// Poll interval in milliseconds (minimum 100).
    pub interval_ms: u64,

    pub agent: AgentSettings,

    pub endpoints: Endpoints,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    /// Wall-clock limit for one directive, in seconds.
    pub command_timeout_secs: u64,

    /// Keep at most this many bytes of directive output.
    pub output_limit_bytes: usize,

    /// Directory for lock markers. Defaults to the system temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Endpoints {
    pub api_base: String,
    pub raw_base: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 300,
            output_limit_bytes: 100_000,
            lock_dir: None,
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            raw_base: DEFAULT_RAW_BASE.to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            token: None,
            repo: String::new(),
            path: "README.md".to_string(),
            branch: "main".to_string(),
            interval_ms: 5_000,
            agent: AgentSettings::default(),
            endpoints: Endpoints::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms < MIN_INTERVAL_MS {
            return Err(anyhow!(
                "interval_ms must be >= {MIN_INTERVAL_MS} (got {})",
                self.interval_ms
            ));
        }
        if self.path.trim().is_empty() {
            return Err(anyhow!("path must not be empty"));
        }
        if self.branch.trim().is_empty() {
            return Err(anyhow!("branch must not be empty"));
        }
        if self.agent.command_timeout_secs == 0 {
            return Err(anyhow!("agent.command_timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Ensure everything needed to reach the remote resource is set.
    pub fn require_remote(&self) -> Result<()> {
        self.validate()?;
        if self.owner.trim().is_empty() {
            return Err(anyhow!("owner is not set (config `owner`, RELAY_OWNER or --owner)"));
        }
        if self.repo.trim().is_empty() {
            return Err(anyhow!("repo is not set (config `repo`, RELAY_REPO or --repo)"));
        }
        if self.token().is_none() {
            return Err(anyhow!("token is not set (config `token` or RELAY_TOKEN)"));
        }
        Ok(())
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn location(&self) -> Location {
        Location::new(&self.owner, &self.repo, &self.path, &self.branch)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.agent
            .lock_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Render the effective configuration with the token masked.
    pub fn describe(&self) -> String {
        format!(
            "owner: {}\nrepo: {}\npath: {}\nbranch: {}\ninterval_ms: {}\ntoken: {}\nlock_dir: {}\napi_base: {}\nraw_base: {}",
            or_unset(&self.owner),
            or_unset(&self.repo),
            self.path,
            self.branch,
            self.interval_ms,
            mask_token(self.token()),
            self.lock_dir().display(),
            self.endpoints.api_base,
            self.endpoints.raw_base,
        )
    }
}

fn or_unset(value: &str) -> &str {
    if value.is_empty() { "(not set)" } else { value }
}

/// Keep the first and last four characters of tokens longer than eight.
pub fn mask_token(token: Option<&str>) -> String {
    const MASK: &str = "********";
    match token {
        None => "(not set)".to_string(),
        Some(token) if token.chars().count() > 8 => {
            let chars: Vec<char> = token.chars().collect();
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}{MASK}{tail}")
        }
        Some(_) => MASK.to_string(),
    }
}

/// Overlay `RELAY_*` variables from `lookup` onto `cfg`.
pub fn apply_env<F>(cfg: &mut RelayConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(owner) = lookup("RELAY_OWNER") {
        cfg.owner = owner;
    }
    if let Some(token) = lookup("RELAY_TOKEN") {
        cfg.token = Some(token);
    }
    if let Some(repo) = lookup("RELAY_REPO") {
        cfg.repo = repo;
    }
    if let Some(path) = lookup("RELAY_PATH") {
        cfg.path = path;
    }
    if let Some(branch) = lookup("RELAY_BRANCH") {
        cfg.branch = branch;
    }
    if let Some(interval) = lookup("RELAY_INTERVAL_MS") {
        cfg.interval_ms = interval
            .trim()
            .parse()
            .with_context(|| format!("parse RELAY_INTERVAL_MS={interval:?}"))?;
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RelayConfig::default()`.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        let cfg = RelayConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RelayConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RelayConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RelayConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("relay.toml");
        let cfg = RelayConfig {
            owner: "octo".to_string(),
            repo: "notes".to_string(),
            interval_ms: 250,
            ..RelayConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("relay.toml");
        fs::write(&path, "owner = \"octo\"\nrepo = \"notes\"\n\n[agent]\ncommand_timeout_secs = 5\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.owner, "octo");
        assert_eq!(cfg.path, "README.md");
        assert_eq!(cfg.branch, "main");
        assert_eq!(cfg.interval_ms, 5_000);
        assert_eq!(cfg.agent.command_timeout_secs, 5);
        assert_eq!(cfg.agent.output_limit_bytes, 100_000);
    }

    #[test]
    fn interval_floor_is_enforced_on_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("relay.toml");
        fs::write(&path, "interval_ms = 50\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("interval_ms must be >= 100"));
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("RELAY_OWNER", "env-owner"),
            ("RELAY_TOKEN", "env-token"),
            ("RELAY_INTERVAL_MS", "750"),
        ]
        .into_iter()
        .collect();
        let mut cfg = RelayConfig {
            owner: "file-owner".to_string(),
            repo: "notes".to_string(),
            ..RelayConfig::default()
        };
        apply_env(&mut cfg, |key| vars.get(key).map(|v| v.to_string())).expect("env");
        assert_eq!(cfg.owner, "env-owner");
        assert_eq!(cfg.token(), Some("env-token"));
        assert_eq!(cfg.interval_ms, 750);
        assert_eq!(cfg.repo, "notes");
    }

    #[test]
    fn bad_interval_env_is_an_error() {
        let mut cfg = RelayConfig::default();
        let err = apply_env(&mut cfg, |key| {
            (key == "RELAY_INTERVAL_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("RELAY_INTERVAL_MS"));
    }

    #[test]
    fn require_remote_names_missing_fields() {
        let cfg = RelayConfig {
            owner: "octo".to_string(),
            ..RelayConfig::default()
        };
        let err = cfg.require_remote().unwrap_err();
        assert!(err.to_string().contains("repo is not set"));

        let cfg = RelayConfig {
            owner: "octo".to_string(),
            repo: "notes".to_string(),
            token: Some("  ".to_string()),
            ..RelayConfig::default()
        };
        let err = cfg.require_remote().unwrap_err();
        assert!(err.to_string().contains("token is not set"));
    }

    #[test]
    fn mask_keeps_edges_of_long_tokens() {
        assert_eq!(mask_token(Some("ghp_1234567890abcd")), "ghp_********abcd");
        assert_eq!(mask_token(Some("short")), "********");
        assert_eq!(mask_token(None), "(not set)");
    }

    #[test]
    fn describe_never_prints_full_token() {
        let cfg = RelayConfig {
            owner: "octo".to_string(),
            repo: "notes".to_string(),
            token: Some("ghp_supersecretvalue".to_string()),
            ..RelayConfig::default()
        };
        let text = cfg.describe();
        assert!(!text.contains("supersecret"));
        assert!(text.contains("token: ghp_********alue"));
        assert!(text.contains("owner: octo"));
    }
}
