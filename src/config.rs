use crate::error::{HealError, Result};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const CONFIG_FILE_NAME: &str = "healwatch.toml";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const PLACEHOLDER_API_KEY: &str = "YOUR_GEMINI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealConfig {
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Directory for the category event logs and child stdout/stderr captures
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Extra directories whose `*_events.log` files are tailed for error records
    #[serde(default)]
    pub watch_log_dirs: Vec<PathBuf>,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Source files to syntax check; glob patterns relative to `project_root`
    #[serde(default = "default_tracked_files")]
    pub tracked_files: Vec<String>,

    /// Also walk the project for every Python source
    #[serde(default)]
    pub scan_all_sources: bool,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub syntax: SyntaxConfig,

    #[serde(default = "default_servers")]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyntaxConfig {
    /// External checker, e.g. `python3 -m py_compile {file}`
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(".self_healing_backups")
}

fn default_tracked_files() -> Vec<String> {
    vec![
        "simulation/sensor_server.py".to_string(),
        "UI/ui_server.py".to_string(),
        "ai_chat_server.py".to_string(),
    ]
}

fn default_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            name: "simulation".to_string(),
            command: "python3 sensor_server.py".to_string(),
            cwd: Some(PathBuf::from("simulation")),
            port: Some(5000),
        },
        ServerConfig {
            name: "ui".to_string(),
            command: "python3 ui_server.py".to_string(),
            cwd: Some(PathBuf::from("UI")),
            port: Some(5001),
        },
        ServerConfig {
            name: "ai_chat".to_string(),
            command: "python3 ai_chat_server.py".to_string(),
            cwd: None,
            port: Some(5002),
        },
    ]
}

fn default_poll_interval() -> u64 {
    5
}

fn default_log_tail_lines() -> usize {
    10
}

fn default_history_limit() -> usize {
    50
}

fn default_stop_grace() -> u64 {
    5
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            log_dir: default_log_dir(),
            watch_log_dirs: Vec::new(),
            backup_dir: default_backup_dir(),
            tracked_files: default_tracked_files(),
            scan_all_sources: false,
            monitor: MonitorConfig::default(),
            ai: AiConfig::default(),
            syntax: SyntaxConfig::default(),
            servers: default_servers(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_tail_lines: default_log_tail_lines(),
            history_limit: default_history_limit(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl MonitorConfig {
    /// Poll interval clamped to the supported 5..=30 second window.
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs.clamp(5, 30))
    }

    pub fn stop_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stop_grace_secs)
    }
}

impl AiConfig {
    /// API key from config, then `GEMINI_API_KEY`. Blank or template keys count as missing.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|key| std::env::var(key).ok())
    }

    pub fn resolve_api_key_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| env("GEMINI_API_KEY"))
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && k != PLACEHOLDER_API_KEY)
    }

    /// Model choice: explicit flag (unless "auto"), config, `AI_MODEL`, `GEMINI_MODEL`, default.
    pub fn resolve_model(&self, flag: Option<&str>) -> String {
        self.resolve_model_with(flag, |key| std::env::var(key).ok())
    }

    pub fn resolve_model_with(
        &self,
        flag: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> String {
        let explicit = flag
            .map(str::trim)
            .filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case("auto"))
            .map(str::to_string);

        explicit
            .or_else(|| self.model.clone())
            .or_else(|| env("AI_MODEL"))
            .or_else(|| env("GEMINI_MODEL"))
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }
}

impl ServerConfig {
    pub fn argv(&self) -> Result<Vec<String>> {
        let argv = shell_words::split(&self.command).map_err(|e| {
            HealError::Configuration(format!("Invalid command for '{}': {}", self.name, e))
        })?;
        if argv.is_empty() {
            return Err(HealError::Configuration(format!(
                "Empty command for '{}'",
                self.name
            )));
        }
        Ok(argv)
    }
}

impl HealConfig {
    /// Resolve a configured path against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.log_dir)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.backup_dir)
    }

    /// Every directory tailed for event records, the primary log dir first.
    pub fn event_log_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.log_dir()];
        for dir in &self.watch_log_dirs {
            let resolved = self.resolve(dir);
            if !dirs.contains(&resolved) {
                dirs.push(resolved);
            }
        }
        dirs
    }

    /// Expand `tracked_files` (and the optional project walk) into concrete paths.
    pub fn tracked_sources(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for pattern in &self.tracked_files {
            let full = self.resolve(Path::new(pattern));
            let full_str = full.to_string_lossy();
            match glob::glob(&full_str) {
                Ok(paths) => {
                    let mut matched = false;
                    for path in paths.flatten() {
                        matched = true;
                        if !files.contains(&path) {
                            files.push(path);
                        }
                    }
                    // Keep literal paths so a missing file is still reported as skipped.
                    if !matched && !files.contains(&full) {
                        files.push(full);
                    }
                }
                Err(_) => {
                    if !files.contains(&full) {
                        files.push(full);
                    }
                }
            }
        }

        if self.scan_all_sources {
            for path in discover_python_sources(&self.project_root) {
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }

        files
    }
}

const SKIPPED_DIRS: &[&str] = &[
    "__pycache__",
    "venv",
    ".venv",
    "env",
    "node_modules",
    "site-packages",
    "dist-packages",
    "target",
];

/// Walk `root` for `.py` files, skipping hidden, virtualenv and cache directories.
pub fn discover_python_sources(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref())
            } else {
                true
            }
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str()) == Some("py")
        })
        .map(|entry| entry.into_path())
        .collect()
}

pub struct ConfigManager {
    config: HealConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load `explicit`, else `./healwatch.toml`, else the user config dir file,
    /// layered with `HEALWATCH_*` environment variables.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(HealError::Configuration(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Some(path.to_path_buf())
            }
            None => Self::discover(),
        };

        let config = Self::build(config_path.as_deref())?;
        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn get(&self) -> &HealConfig {
        &self.config
    }

    pub fn into_inner(self) -> HealConfig {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Write the default configuration as TOML. Refuses to overwrite.
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(HealError::Configuration(format!(
                "{} already exists",
                path.display()
            )));
        }

        let toml = toml::to_string_pretty(&HealConfig::default())
            .map_err(|e| HealError::Configuration(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml)
            .map_err(|e| HealError::Configuration(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }

        ProjectDirs::from("com", "healwatch", "healwatch")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    fn build(path: Option<&Path>) -> Result<HealConfig> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }

        let s = builder
            .add_source(
                Environment::with_prefix("HEALWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| HealError::Configuration(format!("Failed to build config: {}", e)))?;

        let config: HealConfig = s.try_deserialize().map_err(|e| {
            HealError::Configuration(format!("Failed to deserialize config: {}", e))
        })?;

        Ok(config)
    }
}
