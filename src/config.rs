//! Configuration for truthweave.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TRUTHWEAVE_HOME, TRUTHWEAVE_DB, GEMINI_API_KEY,
//!    DEDUPLICATION_THRESHOLD)
//! 2. Config file (.truthweave/config.yaml)
//! 3. Defaults (~/.truthweave)
//!
//! Config file discovery:
//! - Searches current directory and parents for .truthweave/config.yaml
//! - Paths in config file are relative to the .truthweave/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{gdelt, gemini};
use crate::core::HostSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".truthweave";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub causal: CausalConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub gdelt: GdeltConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory: journals and the signal inbox
    pub home: Option<String>,
    /// Directory holding articles.db and graph.db
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    pub dedup_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfig {
    pub interval_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CausalConfig {
    pub context_event_limit: Option<usize>,
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub embedding_model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GdeltConfig {
    pub update_url: Option<String>,
    pub tone_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractorConfig {
    pub user_agent: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths and defaults filled in
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub home: PathBuf,
    pub database_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub dedup_threshold: f64,
    pub scheduler_interval: Duration,
    pub context_event_limit: usize,
    pub channel_capacity: usize,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub gemini_embedding_model: String,
    pub gdelt_update_url: String,
    pub tone_threshold: f64,
    pub user_agent: String,
    pub fetch_timeout: Duration,
}

impl ResolvedConfig {
    /// Run journals ($TRUTHWEAVE_HOME/runs)
    pub fn journal_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Durable signal inbox ($TRUTHWEAVE_HOME/inbox/signals.jsonl)
    pub fn inbox_path(&self) -> PathBuf {
        self.home.join("inbox").join("signals.jsonl")
    }

    pub fn articles_db_path(&self) -> PathBuf {
        self.database_dir.join("articles.db")
    }

    pub fn graph_db_path(&self) -> PathBuf {
        self.database_dir.join("graph.db")
    }

    pub fn host_settings(&self) -> HostSettings {
        HostSettings {
            dedup_threshold: self.dedup_threshold,
            context_event_limit: self.context_event_limit,
            ..HostSettings::default()
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file values, environment and defaults.
///
/// `env` looks up a variable; tests pass a map instead of the process environment.
fn resolve(
    file: Option<(PathBuf, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let (config_file, file) = match file {
        Some((path, file)) => (Some(path), file),
        None => (None, ConfigFile::default()),
    };
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let home = match (env("TRUTHWEAVE_HOME"), &file.paths.home) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(home)) => resolve_path(&config_dir, home),
        (None, None) => default_home,
    };

    let database_dir = match (env("TRUTHWEAVE_DB"), &file.paths.database) {
        (Some(env_db), _) => PathBuf::from(env_db),
        (None, Some(db)) => resolve_path(&config_dir, db),
        (None, None) => home.join("db"),
    };

    let dedup_threshold = match env("DEDUPLICATION_THRESHOLD") {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("DEDUPLICATION_THRESHOLD is not a number: {}", raw))?,
        None => file.pipeline.dedup_threshold.unwrap_or(0.90),
    };
    if !(0.0..=1.0).contains(&dedup_threshold) {
        anyhow::bail!("dedup threshold must be within [0, 1], got {}", dedup_threshold);
    }

    let gemini_api_key = env("GEMINI_API_KEY").filter(|k| !k.trim().is_empty());

    Ok(ResolvedConfig {
        home,
        database_dir,
        config_file,
        dedup_threshold,
        scheduler_interval: Duration::from_secs(60 * file.scheduler.interval_minutes.unwrap_or(15).max(1)),
        context_event_limit: file.causal.context_event_limit.unwrap_or(20),
        channel_capacity: file.causal.channel_capacity.unwrap_or(100).max(1),
        gemini_api_key,
        gemini_base_url: file.gemini.base_url.unwrap_or_else(|| gemini::DEFAULT_BASE_URL.to_string()),
        gemini_model: file.gemini.model.unwrap_or_else(|| gemini::DEFAULT_MODEL.to_string()),
        gemini_embedding_model: file
            .gemini
            .embedding_model
            .unwrap_or_else(|| gemini::DEFAULT_EMBEDDING_MODEL.to_string()),
        gdelt_update_url: file.gdelt.update_url.unwrap_or_else(|| gdelt::DEFAULT_UPDATE_URL.to_string()),
        tone_threshold: file.gdelt.tone_threshold.unwrap_or(gdelt::DEFAULT_TONE_THRESHOLD),
        user_agent: file
            .extractor
            .user_agent
            .unwrap_or_else(|| format!("truthweave/{}", env!("CARGO_PKG_VERSION"))),
        fetch_timeout: Duration::from_secs(file.extractor.timeout_seconds.unwrap_or(30)),
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let file = match find_config_file(&cwd) {
        Some(path) => {
            let parsed = load_config_file(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    resolve(file, |key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, env_from(&[]), PathBuf::from("/home/u/.truthweave")).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/u/.truthweave"));
        assert_eq!(config.journal_dir(), PathBuf::from("/home/u/.truthweave/runs"));
        assert_eq!(config.articles_db_path(), PathBuf::from("/home/u/.truthweave/db/articles.db"));
        assert_eq!(config.dedup_threshold, 0.90);
        assert_eq!(config.scheduler_interval, Duration::from_secs(15 * 60));
        assert_eq!(config.context_event_limit, 20);
        assert_eq!(config.channel_capacity, 100);
        assert_eq!(config.gemini_model, "gemini-1.5-pro");
        assert_eq!(config.tone_threshold, 5.0);
        assert!(config.gemini_api_key.is_none());
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing_and_discovery() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: ./state
  database: /var/lib/truthweave
pipeline:
  dedup_threshold: 0.95
scheduler:
  interval_minutes: 5
gdelt:
  tone_threshold: 7.5
"#
        )
        .unwrap();

        assert_eq!(find_config_file(&nested), Some(config_path.clone()));

        let parsed = load_config_file(&config_path).unwrap();
        let config = resolve(Some((config_path, parsed)), env_from(&[]), PathBuf::from("/unused")).unwrap();

        assert_eq!(config.home, config_dir.join("state"));
        assert_eq!(config.graph_db_path(), PathBuf::from("/var/lib/truthweave/graph.db"));
        assert_eq!(config.dedup_threshold, 0.95);
        assert_eq!(config.scheduler_interval, Duration::from_secs(300));
        assert_eq!(config.tone_threshold, 7.5);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            pipeline: PipelineConfig { dedup_threshold: Some(0.5) },
            ..ConfigFile::default()
        };
        let env = env_from(&[
            ("TRUTHWEAVE_HOME", "/srv/tw"),
            ("TRUTHWEAVE_DB", "/data"),
            ("DEDUPLICATION_THRESHOLD", "0.85"),
            ("GEMINI_API_KEY", "secret"),
        ]);

        let config = resolve(Some((PathBuf::from("/p/.truthweave/config.yaml"), file)), env, PathBuf::from("/x")).unwrap();
        assert_eq!(config.home, PathBuf::from("/srv/tw"));
        assert_eq!(config.inbox_path(), PathBuf::from("/srv/tw/inbox/signals.jsonl"));
        assert_eq!(config.articles_db_path(), PathBuf::from("/data/articles.db"));
        assert_eq!(config.dedup_threshold, 0.85);
        assert_eq!(config.host_settings().dedup_threshold, 0.85);
        assert_eq!(config.gemini_api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_bad_threshold_is_rejected() {
        assert!(resolve(None, env_from(&[("DEDUPLICATION_THRESHOLD", "high")]), PathBuf::from("/x")).is_err());
        assert!(resolve(None, env_from(&[("DEDUPLICATION_THRESHOLD", "1.5")]), PathBuf::from("/x")).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
