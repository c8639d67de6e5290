use std::env;
use std::fs;
use std::path::Path;

use signoff_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let lines = vec![
        "effective config (source precedence: env > file > default):".to_string(),
        render_line(
            "workflow.lead_role",
            &config.workflow.lead_role,
            source("workflow.lead_role", &["SIGNOFF_WORKFLOW_LEAD_ROLE"]),
        ),
        render_line(
            "workflow.manager_role",
            &config.workflow.manager_role,
            source("workflow.manager_role", &["SIGNOFF_WORKFLOW_MANAGER_ROLE"]),
        ),
        render_line(
            "escalation.sweep_interval_secs",
            &config.escalation.sweep_interval_secs.to_string(),
            source(
                "escalation.sweep_interval_secs",
                &["SIGNOFF_ESCALATION_SWEEP_INTERVAL_SECS"],
            ),
        ),
        render_line(
            "logging.level",
            &config.logging.level,
            source("logging.level", &["SIGNOFF_LOGGING_LEVEL", "SIGNOFF_LOG_LEVEL"]),
        ),
        render_line(
            "logging.format",
            &format!("{:?}", config.logging.format),
            source("logging.format", &["SIGNOFF_LOGGING_FORMAT", "SIGNOFF_LOG_FORMAT"]),
        ),
    ];

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
