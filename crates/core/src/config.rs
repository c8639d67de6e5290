use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["signoff.toml", "config/signoff.toml"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub workflow: WorkflowConfig,
    pub escalation: EscalationConfig,
    pub logging: LoggingConfig,
}

/// Role names used to derive the default approver chain of a unit-scoped
/// setup, in chain order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub lead_role: String,
    pub manager_role: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationConfig {
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub lead_role: Option<String>,
    pub manager_role: Option<String>,
    pub sweep_interval_secs: Option<u64>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workflow: WorkflowConfig {
                lead_role: "Lead".to_string(),
                manager_role: "Manager".to_string(),
            },
            escalation: EscalationConfig { sweep_interval_secs: 60 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    /// Precedence: defaults < file < `SIGNOFF_*` env < `options.overrides`.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(workflow) = patch.workflow {
            if let Some(lead_role) = workflow.lead_role {
                self.workflow.lead_role = lead_role;
            }
            if let Some(manager_role) = workflow.manager_role {
                self.workflow.manager_role = manager_role;
            }
        }

        if let Some(escalation) = patch.escalation {
            if let Some(sweep_interval_secs) = escalation.sweep_interval_secs {
                self.escalation.sweep_interval_secs = sweep_interval_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SIGNOFF_WORKFLOW_LEAD_ROLE") {
            self.workflow.lead_role = value;
        }
        if let Some(value) = read_env("SIGNOFF_WORKFLOW_MANAGER_ROLE") {
            self.workflow.manager_role = value;
        }

        if let Some(value) = read_env("SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS") {
            self.escalation.sweep_interval_secs =
                parse_u64("SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS", &value)?;
        }

        let log_level =
            read_env("SIGNOFF_LOGGING_LEVEL").or_else(|| read_env("SIGNOFF_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SIGNOFF_LOGGING_FORMAT").or_else(|| read_env("SIGNOFF_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(lead_role) = overrides.lead_role {
            self.workflow.lead_role = lead_role;
        }
        if let Some(manager_role) = overrides.manager_role {
            self.workflow.manager_role = manager_role;
        }
        if let Some(sweep_interval_secs) = overrides.sweep_interval_secs {
            self.escalation.sweep_interval_secs = sweep_interval_secs;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_workflow(&self.workflow)?;
        validate_escalation(&self.escalation)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// First existing file among the explicit path or the default candidates.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    CONFIG_FILE_CANDIDATES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_workflow(workflow: &WorkflowConfig) -> Result<(), ConfigError> {
    let lead = workflow.lead_role.trim();
    let manager = workflow.manager_role.trim();
    if lead.is_empty() || manager.is_empty() {
        return Err(ConfigError::Validation(
            "workflow.lead_role and workflow.manager_role must not be empty".to_string(),
        ));
    }
    if lead.eq_ignore_ascii_case(manager) {
        return Err(ConfigError::Validation(format!(
            "workflow.lead_role and workflow.manager_role must differ (both are `{lead}`)"
        )));
    }
    Ok(())
}

fn validate_escalation(escalation: &EscalationConfig) -> Result<(), ConfigError> {
    if escalation.sweep_interval_secs == 0 || escalation.sweep_interval_secs > 86_400 {
        return Err(ConfigError::Validation(
            "escalation.sweep_interval_secs must be in range 1..=86400".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    workflow: Option<WorkflowPatch>,
    escalation: Option<EscalationPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowPatch {
    lead_role: Option<String>,
    manager_role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationPatch {
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| err.to_string())?;
        ensure(config.workflow.lead_role == "Lead", "default lead role")?;
        ensure(config.workflow.manager_role == "Manager", "default manager role")?;
        ensure(config.escalation.sweep_interval_secs == 60, "default sweep interval")?;
        ensure(matches!(config.logging.format, LogFormat::Compact), "default format is compact")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_SIGNOFF_LEAD_ROLE", "Team Lead");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("signoff.toml");
            fs::write(
                &path,
                r#"
[workflow]
lead_role = "${TEST_SIGNOFF_LEAD_ROLE}"
manager_role = "Head of Unit"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.workflow.lead_role == "Team Lead", "lead role comes from env var")?;
            ensure(config.workflow.manager_role == "Head of Unit", "manager role comes from file")
        })();

        clear_vars(&["TEST_SIGNOFF_LEAD_ROLE"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["TEST_SIGNOFF_UNSET_ROLE"]);

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("signoff.toml");
        fs::write(&path, "[workflow]\nlead_role = \"${TEST_SIGNOFF_UNSET_ROLE}\"\n")
            .map_err(|err| err.to_string())?;

        match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() }) {
            Err(ConfigError::MissingEnvInterpolation { var }) => {
                ensure(var == "TEST_SIGNOFF_UNSET_ROLE", "error names the missing variable")
            }
            other => Err(format!("expected interpolation failure, got {other:?}")),
        }
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SIGNOFF_LOG_LEVEL", "warn");
        env::set_var("SIGNOFF_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["SIGNOFF_LOG_LEVEL", "SIGNOFF_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SIGNOFF_WORKFLOW_MANAGER_ROLE", "Env Manager");
        env::set_var("SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS", "30");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("signoff.toml");
            fs::write(
                &path,
                r#"
[workflow]
lead_role = "File Lead"
manager_role = "File Manager"

[escalation]
sweep_interval_secs = 120

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    lead_role: Some("Override Lead".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.workflow.lead_role == "Override Lead", "override lead role should win")?;
            ensure(
                config.workflow.manager_role == "Env Manager",
                "env manager role should win over file and defaults",
            )?;
            ensure(config.escalation.sweep_interval_secs == 30, "env sweep interval should win")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")
        })();

        clear_vars(&["SIGNOFF_WORKFLOW_MANAGER_ROLE", "SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("sweep_interval_secs")
            );
            ensure(has_message, "validation failure should mention sweep_interval_secs")
        })();

        clear_vars(&["SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS"]);
        result
    }

    #[test]
    fn non_numeric_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS", "soon");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS", "error names the key")
            }
            other => Err(format!("expected invalid override, got {other:?}")),
        };

        clear_vars(&["SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS"]);
        result
    }

    #[test]
    fn identical_chain_roles_are_rejected() {
        let mut config = AppConfig::default();
        config.workflow.manager_role = "lead".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn required_file_must_exist() {
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("absent.toml");
        let error = AppConfig::load(LoadOptions {
            config_path: Some(missing.clone()),
            require_file: true,
            ..LoadOptions::default()
        })
        .expect_err("missing file");
        assert!(matches!(error, ConfigError::MissingConfigFile(path) if path == missing));
    }
}
