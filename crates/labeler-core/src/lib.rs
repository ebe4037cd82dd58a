pub mod error;
pub mod rules;
pub mod taxonomy;

pub use error::{Envelope, Error, Result};
pub use rules::{GeographyRules, RuleSet};
pub use taxonomy::{
    build_tree, CategoryNames, LabelSet, LeveledEntry, TaxonomyConfig, TaxonomyIndex, TaxonomyNode,
};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// --- Types ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum AuthMode {
    /// Direct completion API authenticated with an API key.
    #[default]
    ApiKey,
    /// Chat backend authenticated with a browser session token.
    Session,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    Medium,
    High,
}

/// Endpoints of the session-authenticated chat backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionEndpoints {
    pub session_url: String,
    pub conversation_url: String,
    /// Cookie header sent to the session endpoint (copied from a logged-in browser).
    pub cookie: Option<String>,
}

impl Default for SessionEndpoints {
    fn default() -> Self {
        Self {
            session_url: "https://chatgpt.com/api/auth/session".to_string(),
            conversation_url: "https://chatgpt.com/backend-api/conversation".to_string(),
            cookie: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub auth_mode: AuthMode,
    pub api_key: String,
    /// Override for the completion API base URL.
    pub api_base_url: Option<String>,
    pub model: String,
    pub service_tier: Option<String>,
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub verbosity: Option<Verbosity>,
    /// Overall budget for one model call, stream included.
    pub timeout_secs: u64,
    pub session: SessionEndpoints,
    pub rules: RuleSet,
    pub taxonomy: TaxonomyConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::ApiKey,
            api_key: String::new(),
            api_base_url: None,
            model: "gpt-5-mini".to_string(),
            service_tier: None,
            temperature: Some(0.0),
            reasoning_effort: None,
            verbosity: None,
            timeout_secs: 120,
            session: SessionEndpoints::default(),
            rules: RuleSet::default(),
            taxonomy: TaxonomyConfig::default(),
        }
    }
}

/// Credential for the chat backend. Owned by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    pub token: String,
    #[serde(default)]
    pub expires_at_epoch_ms: Option<i64>,
    #[serde(default)]
    pub subject_label: Option<String>,
}

impl SessionCredential {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_epoch_ms.is_some_and(|exp| now_ms >= exp)
    }
}

// --- Storage ---

/// Resolve the settings directory: `$LABELER_HOME`, else `~/.labeler/`.
pub fn labeler_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("LABELER_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".labeler")
}

fn settings_path(dir: &Path) -> PathBuf {
    dir.join("settings.json")
}

fn credential_path(dir: &Path) -> PathBuf {
    dir.join("session.json")
}

/// Read settings from `dir`. A missing or unreadable file yields defaults.
pub fn read_settings_in(dir: &Path) -> Settings {
    let path = settings_path(dir);
    if !path.exists() {
        return Settings::default();
    }
    match fs::read_to_string(&path)
        .map_err(Error::from)
        .and_then(|s| serde_json::from_str(&s).map_err(Error::from))
    {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(target: "labeler::settings", path = %path.display(), error = %e, "ignoring unreadable settings file");
            Settings::default()
        }
    }
}

pub fn read_settings() -> Settings {
    read_settings_in(&labeler_dir())
}

/// Write settings atomically (temp file + rename).
pub fn write_settings_in(dir: &Path, settings: &Settings) -> Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    write_atomic(dir, "settings.json", &json)
}

pub fn write_settings(settings: &Settings) -> Result<()> {
    write_settings_in(&labeler_dir(), settings)
}

pub fn read_credential_in(dir: &Path) -> Option<SessionCredential> {
    let raw = fs::read_to_string(credential_path(dir)).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn write_credential_in(dir: &Path, credential: &SessionCredential) -> Result<()> {
    let json = serde_json::to_string_pretty(credential)?;
    write_atomic(dir, "session.json", &json)
}

pub fn clear_credential_in(dir: &Path) -> Result<()> {
    let path = credential_path(dir);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    Ok(())
}

fn write_atomic(dir: &Path, file: &str, data: &str) -> Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{file}.tmp"));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, dir.join(file))?;
    Ok(())
}

/// Whether the selected auth mode has what it needs to make a call.
pub fn auth_configured(settings: &Settings) -> bool {
    if settings.model.trim().is_empty() {
        return false;
    }
    match settings.auth_mode {
        AuthMode::ApiKey => !settings.api_key.is_empty(),
        AuthMode::Session => {
            !settings.session.session_url.is_empty()
                && !settings.session.conversation_url.is_empty()
        }
    }
}

/// JSON Schema of the settings file, for editors.
pub fn settings_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(Settings)).unwrap_or_default()
}
