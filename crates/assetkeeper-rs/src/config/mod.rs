use std::{env, fs};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operator {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub probe_program: String,
    pub probe_script: String,
    /// Base URL the probe uses to call back into this service.
    pub api_base_url: Option<String>,
    /// Shared secret for probe callbacks. Empty disables the probe path.
    pub probe_token: String,
    pub probe_timeout_secs: u64,
    pub keepalive_secs: u64,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
    pub operators: Vec<Operator>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("ASSETKEEPER_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("AK_HOST") {
            self.host = v;
        }
        if let Some(v) = var("AK_PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("AK_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("AK_PROBE_PROGRAM") {
            self.probe_program = v;
        }
        if let Some(v) = var("AK_PROBE_SCRIPT") {
            self.probe_script = v;
        }
        if let Some(v) = var("AK_API_BASE_URL") {
            self.api_base_url = Some(v);
        }
        if let Some(v) = var("AK_PROBE_TOKEN") {
            self.probe_token = v;
        }
        if let Some(v) = var("AK_PROBE_TIMEOUT_SECS") {
            self.probe_timeout_secs = v.parse().unwrap_or(self.probe_timeout_secs);
        }
        if let Some(v) = var("AK_KEEPALIVE_SECS") {
            self.keepalive_secs = v.parse().unwrap_or(self.keepalive_secs);
        }
        if let Some(v) = var("AK_CORS_ORIGINS") {
            self.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    pub fn api_base_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}/api", self.port))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            database_url: "sqlite://assets.db".to_string(),
            probe_program: "python".to_string(),
            probe_script: "scanner.py".to_string(),
            api_base_url: None,
            probe_token: String::new(),
            probe_timeout_secs: 600,
            keepalive_secs: 20,
            cors_origins: vec![],
            operators: vec![],
        }
    }
}
