use crate::error::HubError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub const CURRENT_VERSION: i32 = 1;
pub const DEFAULT_CONFIG_PATH: &str = "./scripthub.yml";
pub const DEFAULT_SCRIPT_DIRECTORY: &str = "./python_scripts";
pub const DEFAULT_LEDGER_PATH: &str = ".scripthub/runs.jsonl";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

const MAX_CONCURRENT_RUNS_LIMIT: usize = 64;
const VALID_ADMISSION: &[&str] = &["queue", "reject"];
const VALID_JSON_STYLE: &[&str] = &["flags", "payload"];

static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\.?[A-Za-z0-9]{1,16}$").expect("valid regex"));
static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// On-disk configuration, as written in `scripthub.yml`.
///
/// Empty strings and `None` mean "use the default".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: i32,
    pub script_directory: String,
    pub recursive: bool,
    pub extensions: Vec<String>,
    pub interpreters: Option<HashMap<String, String>>,
    pub execution_timeout: String,
    pub max_concurrent_runs: Option<usize>,
    pub admission: String,
    pub queue_timeout: String,
    pub max_output_bytes: Option<usize>,
    pub ledger_storage_path: String,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub json_style: String,
    pub kill_grace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Wait for a free slot, optionally giving up after `max_wait`.
    Queue { max_wait: Option<Duration> },
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkingDir {
    Inherit,
    ScriptDir,
    Fixed(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonStyle {
    /// `--key value` per entry.
    Flags,
    /// A single `--json <payload>` flag.
    Payload,
}

/// Fully resolved settings with every default applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub script_directory: PathBuf,
    pub recursive: bool,
    pub extensions: Vec<String>,
    pub interpreters: HashMap<String, String>,
    pub execution_timeout: Duration,
    pub max_concurrent_runs: usize,
    pub admission: Admission,
    pub max_output_bytes: usize,
    pub ledger_storage_path: PathBuf,
    pub working_dir: WorkingDir,
    pub env: HashMap<String, String>,
    pub json_style: JsonStyle,
    pub kill_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationErrors {
    pub issues: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F: Into<String>, M: Into<String>>(&mut self, field: F, message: M) {
        self.issues.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(first) = self.issues.first() {
            write!(
                f,
                "configuration validation failed: {}: {}",
                first.field, first.message
            )
        } else {
            write!(f, "configuration validation failed")
        }
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationErrors> for HubError {
    fn from(err: ValidationErrors) -> Self {
        HubError::Configuration(err.to_string())
    }
}

pub fn default_extensions() -> Vec<String> {
    vec!["py".to_string(), "sh".to_string()]
}

pub fn default_interpreters() -> HashMap<String, String> {
    HashMap::from([
        ("py".to_string(), "python3".to_string()),
        ("sh".to_string(), "sh".to_string()),
    ])
}

impl Config {
    /// Configuration used when no file is present.
    pub fn builtin() -> Self {
        Self {
            version: CURRENT_VERSION,
            ..Self::default()
        }
    }

    /// Applies environment overrides on top of the file values.
    ///
    /// `lookup` is usually `|key| std::env::var(key).ok()`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), HubError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("SCRIPTS_DIR").filter(|v| !v.trim().is_empty()) {
            self.script_directory = dir;
        }

        if let Some(timeout) = lookup("SCRIPTHUB_TIMEOUT").filter(|v| !v.trim().is_empty()) {
            self.execution_timeout = timeout;
        }

        if let Some(raw) = lookup("SCRIPTHUB_MAX_CONCURRENT").filter(|v| !v.trim().is_empty()) {
            let value = raw.trim().parse::<usize>().map_err(|_| {
                HubError::configuration(format!(
                    "SCRIPTHUB_MAX_CONCURRENT: expected a positive integer, got {raw:?}"
                ))
            })?;
            self.max_concurrent_runs = Some(value);
        }

        if let Some(raw) = lookup("SCRIPTHUB_MAX_OUTPUT_BYTES").filter(|v| !v.trim().is_empty()) {
            let value = raw.trim().parse::<usize>().map_err(|_| {
                HubError::configuration(format!(
                    "SCRIPTHUB_MAX_OUTPUT_BYTES: expected a positive integer, got {raw:?}"
                ))
            })?;
            self.max_output_bytes = Some(value);
        }

        if let Some(path) = lookup("SCRIPTHUB_LEDGER").filter(|v| !v.trim().is_empty()) {
            self.ledger_storage_path = path;
        }

        Ok(())
    }

    pub fn resolve(&self) -> Result<Settings, HubError> {
        validate(self)?;

        let script_directory = PathBuf::from(non_empty_or(
            &self.script_directory,
            DEFAULT_SCRIPT_DIRECTORY,
        ));
        let ledger_storage_path = PathBuf::from(non_empty_or(
            &self.ledger_storage_path,
            DEFAULT_LEDGER_PATH,
        ));

        let extensions = if self.extensions.is_empty() {
            default_extensions()
        } else {
            self.extensions.iter().map(|e| normalize_extension(e)).collect()
        };

        let interpreters = match &self.interpreters {
            Some(map) => map
                .iter()
                .map(|(ext, program)| (normalize_extension(ext), program.clone()))
                .collect(),
            None => default_interpreters(),
        };

        let queue_timeout = optional_duration(&self.queue_timeout, "queue_timeout")?;
        let admission = match self.admission.as_str() {
            "reject" => Admission::Reject,
            _ => Admission::Queue {
                max_wait: queue_timeout,
            },
        };

        let working_dir = match self.working_dir.trim() {
            "" | "inherit" => WorkingDir::Inherit,
            "script" => WorkingDir::ScriptDir,
            other => WorkingDir::Fixed(PathBuf::from(other)),
        };

        let json_style = match self.json_style.as_str() {
            "payload" => JsonStyle::Payload,
            _ => JsonStyle::Flags,
        };

        Ok(Settings {
            script_directory,
            recursive: self.recursive,
            extensions,
            interpreters,
            execution_timeout: resolve_duration(
                &self.execution_timeout,
                DEFAULT_TIMEOUT,
                "execution_timeout",
            )?,
            max_concurrent_runs: self
                .max_concurrent_runs
                .unwrap_or(DEFAULT_MAX_CONCURRENT_RUNS),
            admission,
            max_output_bytes: self.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
            ledger_storage_path,
            working_dir,
            env: self.env.clone(),
            json_style,
            kill_grace: resolve_duration(&self.kill_grace, DEFAULT_KILL_GRACE, "kill_grace")?,
        })
    }
}

/// Reads and validates a configuration file.
pub fn load(path: &Path) -> Result<Config, HubError> {
    let cfg = parse(path).map_err(HubError::Configuration)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Loads `path` when it exists, falling back to the built-in defaults.
///
/// A missing file is only an error when the caller named it explicitly.
pub fn load_or_default(path: &Path, explicit: bool) -> Result<Config, HubError> {
    if path.exists() {
        return load(path);
    }

    if explicit {
        return Err(HubError::configuration(format!(
            "config file {} not found",
            path.display()
        )));
    }

    Ok(Config::builtin())
}

pub fn parse(path: &Path) -> Result<Config, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("read config: {e}"))?;
    let cfg: Config = serde_yaml::from_str(&text).map_err(|e| format!("parse config yaml: {e}"))?;
    Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<(), ValidationErrors> {
    let mut issues = ValidationErrors::new();

    if cfg.version != CURRENT_VERSION {
        issues.add("version", format!("must be {CURRENT_VERSION}"));
    }

    for (idx, ext) in cfg.extensions.iter().enumerate() {
        if !EXTENSION_RE.is_match(ext) {
            issues.add(
                format!("extensions[{idx}]"),
                "must be a plain file extension such as py or .sh",
            );
        }
    }

    if let Some(interpreters) = &cfg.interpreters {
        for (ext, program) in interpreters {
            if !EXTENSION_RE.is_match(ext) {
                issues.add(
                    format!("interpreters.{ext}"),
                    "key must be a plain file extension",
                );
            }
            if program.trim().is_empty() {
                issues.add(format!("interpreters.{ext}"), "must not be empty");
            }
        }
    }

    if !cfg.execution_timeout.is_empty() && parse_duration(&cfg.execution_timeout).is_err() {
        issues.add("execution_timeout", "must be a valid duration");
    }

    if let Some(max) = cfg.max_concurrent_runs
        && !(1..=MAX_CONCURRENT_RUNS_LIMIT).contains(&max)
    {
        issues.add(
            "max_concurrent_runs",
            format!("must be between 1 and {MAX_CONCURRENT_RUNS_LIMIT}"),
        );
    }

    if !cfg.admission.is_empty() && !VALID_ADMISSION.contains(&cfg.admission.as_str()) {
        issues.add("admission", "must be one of queue, reject");
    }

    if !cfg.queue_timeout.is_empty() {
        if parse_duration(&cfg.queue_timeout).is_err() {
            issues.add("queue_timeout", "must be a valid duration");
        }
        if cfg.admission == "reject" {
            issues.add("queue_timeout", "is not supported when admission is reject");
        }
    }

    if cfg.max_output_bytes == Some(0) {
        issues.add("max_output_bytes", "must be greater than 0");
    }

    for key in cfg.env.keys() {
        if !ENV_KEY_RE.is_match(key) {
            issues.add(format!("env.{key}"), "invalid environment variable name");
        }
    }

    if !cfg.json_style.is_empty() && !VALID_JSON_STYLE.contains(&cfg.json_style.as_str()) {
        issues.add("json_style", "must be one of flags, payload");
    }

    if !cfg.kill_grace.is_empty() && parse_duration(&cfg.kill_grace).is_err() {
        issues.add("kill_grace", "must be a valid duration");
    }

    if issues.has_issues() {
        Err(issues)
    } else {
        Ok(())
    }
}

pub fn parse_duration(text: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(text.trim())
}

fn resolve_duration(value: &str, default_value: Duration, field: &str) -> Result<Duration, HubError> {
    if value.trim().is_empty() {
        return Ok(default_value);
    }

    parse_duration(value)
        .map_err(|_| HubError::configuration(format!("{field}: must be a valid duration")))
}

fn optional_duration(value: &str, field: &str) -> Result<Option<Duration>, HubError> {
    if value.trim().is_empty() {
        return Ok(None);
    }

    resolve_duration(value, Duration::ZERO, field).map(Some)
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}
