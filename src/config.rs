use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_JAVA_PATH: &str = "java";
pub const DEFAULT_SERVER_JAR: &str = "server.jar";
pub const DEFAULT_MEMORY_MIN: &str = "1G";
pub const DEFAULT_MEMORY_MAX: &str = "2G";
pub const DEFAULT_STOP_COMMAND: &str = "stop";
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_RELOAD_COMMAND: &str = "reload";
pub const DEFAULT_COMMAND_PREFIX: &str = "/";
pub const DEFAULT_CHAT_LABEL: &str = "Admin";
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_CONSOLE_HISTORY_CAPACITY: usize = 1000;
pub const DEFAULT_METRICS_HISTORY_CAPACITY: usize = 150;
pub const DEFAULT_PERSIST_DEBOUNCE_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How to launch the game server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    pub java_path: String,
    pub server_jar: String,
    pub memory_min: String,
    pub memory_max: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub additional_args: String,
    pub optimized_flags: bool,
    pub auto_start: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            java_path: DEFAULT_JAVA_PATH.to_string(),
            server_jar: DEFAULT_SERVER_JAR.to_string(),
            memory_min: DEFAULT_MEMORY_MIN.to_string(),
            memory_max: DEFAULT_MEMORY_MAX.to_string(),
            working_dir: None,
            additional_args: String::new(),
            optimized_flags: false,
            auto_start: false,
        }
    }
}

/// How the supervisor drives and observes the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSection {
    pub stop_command: String,
    pub stop_timeout_secs: u64,
    pub reload_command: String,
    pub command_prefix: String,
    pub chat_label: String,
    pub sample_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tps_poll_secs: Option<u64>,
    pub console_history_capacity: usize,
    pub metrics_history_capacity: usize,
    pub persist_debounce_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            stop_command: DEFAULT_STOP_COMMAND.to_string(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            reload_command: DEFAULT_RELOAD_COMMAND.to_string(),
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            chat_label: DEFAULT_CHAT_LABEL.to_string(),
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            tps_poll_secs: None,
            console_history_capacity: DEFAULT_CONSOLE_HISTORY_CAPACITY,
            metrics_history_capacity: DEFAULT_METRICS_HISTORY_CAPACITY,
            persist_debounce_ms: DEFAULT_PERSIST_DEBOUNCE_MS,
        }
    }
}

impl SupervisorSection {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn tps_poll_interval(&self) -> Option<Duration> {
        self.tps_poll_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub supervisor: SupervisorSection,
}

// ---------------------------------------------------------------------------
// Raw (on-disk) representation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawServerSection {
    java_path: Option<String>,
    server_jar: Option<String>,
    memory_min: Option<String>,
    memory_max: Option<String>,
    working_dir: Option<String>,
    additional_args: Option<String>,
    optimized_flags: Option<bool>,
    auto_start: Option<bool>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawSupervisorSection {
    stop_command: Option<String>,
    stop_timeout_secs: Option<u64>,
    reload_command: Option<String>,
    command_prefix: Option<String>,
    chat_label: Option<String>,
    sample_interval_ms: Option<u64>,
    tps_poll_secs: Option<u64>,
    console_history_capacity: Option<usize>,
    metrics_history_capacity: Option<usize>,
    persist_debounce_ms: Option<u64>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("unknown section `{0}`")]
    UnknownSection(String),
    #[error("unknown field `{field}` in section `{section}`")]
    UnknownField { section: String, field: String },
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
    #[error("{0}")]
    IoError(String),
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let table: HashMap<String, toml::Value> =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    let mut config = ServerConfig::default();

    for (name, value) in table {
        match name.as_str() {
            "server" => {
                let raw: RawServerSection = value
                    .try_into()
                    .map_err(|e: toml::de::Error| ConfigError::TomlParse(e.to_string()))?;
                config.server = server_from_raw(raw)?;
            }
            "supervisor" => {
                let raw: RawSupervisorSection = value
                    .try_into()
                    .map_err(|e: toml::de::Error| ConfigError::TomlParse(e.to_string()))?;
                config.supervisor = supervisor_from_raw(raw)?;
            }
            _ => return Err(ConfigError::UnknownSection(name)),
        }
    }

    validate(&config)?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    let content = render_config(config)?;
    std::fs::write(path, content)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))
}

pub fn render_config(config: &ServerConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::TomlParse(e.to_string()))
}

fn reject_extra(section: &str, extra: HashMap<String, toml::Value>) -> Result<(), ConfigError> {
    let mut fields: Vec<String> = extra.into_keys().collect();
    fields.sort();
    match fields.into_iter().next() {
        Some(field) => Err(ConfigError::UnknownField {
            section: section.to_string(),
            field,
        }),
        None => Ok(()),
    }
}

fn server_from_raw(raw: RawServerSection) -> Result<ServerSection, ConfigError> {
    reject_extra("server", raw.extra)?;
    let defaults = ServerSection::default();
    Ok(ServerSection {
        java_path: raw.java_path.unwrap_or(defaults.java_path),
        server_jar: raw.server_jar.unwrap_or(defaults.server_jar),
        memory_min: raw.memory_min.unwrap_or(defaults.memory_min),
        memory_max: raw.memory_max.unwrap_or(defaults.memory_max),
        working_dir: raw.working_dir.filter(|dir| !dir.trim().is_empty()),
        additional_args: raw.additional_args.unwrap_or_default(),
        optimized_flags: raw.optimized_flags.unwrap_or(defaults.optimized_flags),
        auto_start: raw.auto_start.unwrap_or(defaults.auto_start),
    })
}

fn supervisor_from_raw(raw: RawSupervisorSection) -> Result<SupervisorSection, ConfigError> {
    reject_extra("supervisor", raw.extra)?;
    let defaults = SupervisorSection::default();
    Ok(SupervisorSection {
        stop_command: raw.stop_command.unwrap_or(defaults.stop_command),
        stop_timeout_secs: raw.stop_timeout_secs.unwrap_or(defaults.stop_timeout_secs),
        reload_command: raw.reload_command.unwrap_or(defaults.reload_command),
        command_prefix: raw.command_prefix.unwrap_or(defaults.command_prefix),
        chat_label: raw.chat_label.unwrap_or(defaults.chat_label),
        sample_interval_ms: raw.sample_interval_ms.unwrap_or(defaults.sample_interval_ms),
        tps_poll_secs: raw.tps_poll_secs,
        console_history_capacity: raw
            .console_history_capacity
            .unwrap_or(defaults.console_history_capacity),
        metrics_history_capacity: raw
            .metrics_history_capacity
            .unwrap_or(defaults.metrics_history_capacity),
        persist_debounce_ms: raw
            .persist_debounce_ms
            .unwrap_or(defaults.persist_debounce_ms),
    })
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    let sup = &config.supervisor;
    if sup.stop_command.trim().is_empty() {
        return Err(invalid("stop_command", "must not be empty"));
    }
    if sup.command_prefix.is_empty() {
        return Err(invalid("command_prefix", "must not be empty"));
    }
    if sup.sample_interval_ms == 0 {
        return Err(invalid("sample_interval_ms", "must be greater than zero"));
    }
    if sup.console_history_capacity == 0 {
        return Err(invalid("console_history_capacity", "must be greater than zero"));
    }
    if sup.metrics_history_capacity == 0 {
        return Err(invalid("metrics_history_capacity", "must be greater than zero"));
    }
    if config.server.java_path.trim().is_empty() {
        return Err(invalid("java_path", "must not be empty"));
    }
    Ok(())
}
