use std::{fs, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

const DEFAULT_API_URL: &str = "http://localhost:5000/api";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub api_url: String,
    pub token: Option<String>,
    pub page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            token: None,
            page_size: 10,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    token: Option<String>,
    page_size: Option<u32>,
}

pub fn config_path() -> PathBuf {
    std::env::var("CRM_CONSOLE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("console.toml"))
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(config_path()) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings);

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let Ok(file) = toml::from_str::<FileSettings>(raw) else {
        return;
    };
    if let Some(v) = file.api_url {
        settings.api_url = v;
    }
    if let Some(v) = file.token {
        settings.token = Some(v);
    }
    if let Some(v) = file.page_size {
        settings.page_size = v.max(1);
    }
}

fn apply_env(settings: &mut Settings) {
    if let Ok(v) = std::env::var("CRM_API_URL") {
        settings.api_url = v;
    }
    if let Ok(v) = std::env::var("CRM_TOKEN") {
        settings.token = Some(v);
    }
    if let Ok(v) = std::env::var("CRM_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_size = parsed.max(1);
        }
    }
}

/// Persists the bearer token issued at login next to the other settings.
pub fn save_token(token: &str) -> anyhow::Result<()> {
    let path = config_path();
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(&path) {
        apply_file(&mut settings, &raw);
    }
    settings.token = Some(token.to_owned());

    let raw = toml::to_string_pretty(&settings).context("serialize settings")?;
    fs::write(&path, raw).with_context(|| format!("write config '{}'", path.display()))?;
    Ok(())
}
