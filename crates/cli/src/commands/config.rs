use std::env;
use std::fs;
use std::path::Path;

use toml::Value;
use triage_core::config::{resolve_config_path, ConfigEntry};

use crate::commands::{load_config, CommandResult};

pub fn run(config_path: Option<&Path>) -> CommandResult {
    let config = match load_config("config", config_path) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let file_path = resolve_config_path(config_path);
    let file_doc = load_config_file_doc(file_path.as_deref());

    let entries = config.entries();
    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(
        entries
            .iter()
            .map(|entry| render_line(entry, field_source(entry, file_doc.as_ref(), file_path.as_deref()))),
    );

    CommandResult::success("config", format!("{} settings resolved", entries.len()))
        .with_preamble(&lines)
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn env_keys(entry: &ConfigEntry) -> Vec<String> {
    let mut keys = vec![entry.env_key.clone()];
    match entry.key {
        "logging.level" => keys.push("TRIAGE_LOG_LEVEL".to_string()),
        "logging.format" => keys.push("TRIAGE_LOG_FORMAT".to_string()),
        _ => {}
    }
    keys
}

fn field_source(entry: &ConfigEntry, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    if let Some(env_key) = env_keys(entry).into_iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = file_doc {
        if contains_path(doc, entry.key) {
            let file_path = file_path
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

fn render_line(entry: &ConfigEntry, source: String) -> String {
    format!("- {} = {} (source: {source})", entry.key, entry.value)
}
