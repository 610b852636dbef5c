use std::fs;
use std::path::Path;
use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::{Map, Value};

/// Key of the "start processing automatically on launch" preference
pub const AUTO_START_KEY: &str = "auto_start";

/// Read the auto-start preference; absent file or key means off
pub fn auto_start_enabled(settings_file: &Path) -> bool {
    fs::read_to_string(settings_file)
        .ok()
        .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .and_then(|v| v.get(AUTO_START_KEY).and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Turn auto-start off, keeping every other setting in the file intact
pub fn disable_auto_start(settings_file: &Path) -> Result<()> {
    let mut settings = match fs::read_to_string(settings_file) {
        Ok(content) => match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("Settings file {} is not a JSON object, rewriting", settings_file.display());
                Map::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read settings file: {}", settings_file.display()));
        }
    };

    if settings.get(AUTO_START_KEY).and_then(Value::as_bool) == Some(false) {
        return Ok(());
    }
    settings.insert(AUTO_START_KEY.to_string(), Value::Bool(false));

    let body = serde_json::to_string_pretty(&Value::Object(settings))
        .context("Failed to serialize settings")?;
    fs::write(settings_file, body)
        .with_context(|| format!("Failed to write settings file: {}", settings_file.display()))?;
    info!("Auto-start disabled in {}", settings_file.display());
    Ok(())
}
