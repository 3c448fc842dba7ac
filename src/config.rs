use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file layout (`memhold.toml`). Every key is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct SettingsFile {
    pub monitor: MonitorSettings,
    pub thresholds: ThresholdSettings,
    pub retry: RetrySettings,
    pub procfs: ProcfsSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub refresh_secs: f64,
    pub max_iterations: u32,
    pub sample_cpu: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ThresholdSettings {
    pub memory_kb: u64,
    /// Reported at startup; no reaction is attached to it.
    pub cpu_percent: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_read_retries: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProcfsSettings {
    pub root: PathBuf,
}

// --- Default implementations ---

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            refresh_secs: 2.0,
            max_iterations: 4,
            sample_cpu: true,
        }
    }
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            memory_kb: 10240,
            cpu_percent: 50.0,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_read_retries: 8,
        }
    }
}

impl Default for ProcfsSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

/// Values given on the command line; `None` keeps the settings-file value.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub refresh_secs: Option<f64>,
    pub memory_threshold_kb: Option<u64>,
    pub cpu_threshold_percent: Option<f64>,
    pub max_iterations: Option<u32>,
    pub max_read_retries: Option<u32>,
    pub no_cpu: bool,
}

/// Resolved, validated monitor configuration. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorConfig {
    pub target_pid: u32,
    #[serde(rename = "refresh_secs", serialize_with = "serialize_secs")]
    pub refresh_interval: Duration,
    pub memory_threshold_kb: u64,
    pub cpu_threshold_percent: f64,
    pub max_iterations: u32,
    pub max_read_retries: u32,
    pub sample_cpu: bool,
    pub proc_root: PathBuf,
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Errors detected before monitoring starts.
#[derive(Debug)]
pub enum ConfigError {
    /// No PID argument was given.
    MissingPid,
    /// The PID argument is not a positive integer.
    InvalidPid { value: String },
    /// The settings file could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The settings file is not valid TOML for this layout.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A setting is out of range.
    InvalidValue { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingPid => write!(f, "missing PID argument"),
            ConfigError::InvalidPid { value } => {
                write!(
                    f,
                    "expected a positive integer PID (for example 105815), got {:?}",
                    value
                )
            }
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "invalid {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Parse the PID argument. Zero, negatives, and anything non-numeric are rejected.
pub fn parse_pid(raw: Option<&str>) -> Result<u32, ConfigError> {
    let raw = raw.ok_or(ConfigError::MissingPid)?;
    match raw.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid as u32),
        _ => Err(ConfigError::InvalidPid {
            value: raw.to_string(),
        }),
    }
}

/// Load the settings file at `path`, or defaults when no path is given.
pub fn load_settings(path: Option<&Path>) -> Result<SettingsFile, ConfigError> {
    let Some(path) = path else {
        return Ok(SettingsFile::default());
    };

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let settings = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), "loaded settings file");
    Ok(settings)
}

impl MonitorConfig {
    /// Merge CLI overrides over file settings and validate the result.
    pub fn resolve(
        target_pid: u32,
        settings: SettingsFile,
        overrides: &CliOverrides,
    ) -> Result<Self, ConfigError> {
        let refresh_secs = overrides
            .refresh_secs
            .unwrap_or(settings.monitor.refresh_secs);
        let refresh_interval = match Duration::try_from_secs_f64(refresh_secs) {
            Ok(d) if !d.is_zero() => d,
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "refresh interval",
                    reason: format!("must be a positive number of seconds, got {refresh_secs}"),
                })
            }
        };

        let memory_threshold_kb = overrides
            .memory_threshold_kb
            .unwrap_or(settings.thresholds.memory_kb);
        if memory_threshold_kb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory threshold",
                reason: "must be greater than 0 KB".to_string(),
            });
        }

        let cpu_threshold_percent = overrides
            .cpu_threshold_percent
            .unwrap_or(settings.thresholds.cpu_percent);
        if !cpu_threshold_percent.is_finite() || cpu_threshold_percent <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "CPU threshold",
                reason: format!("must be a positive percentage, got {cpu_threshold_percent}"),
            });
        }

        let max_iterations = overrides
            .max_iterations
            .unwrap_or(settings.monitor.max_iterations);
        if max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max iterations",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            target_pid,
            refresh_interval,
            memory_threshold_kb,
            cpu_threshold_percent,
            max_iterations,
            max_read_retries: overrides
                .max_read_retries
                .unwrap_or(settings.retry.max_read_retries),
            sample_cpu: settings.monitor.sample_cpu && !overrides.no_cpu,
            proc_root: settings.procfs.root,
        })
    }
}
