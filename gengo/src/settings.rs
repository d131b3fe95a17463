use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::network::{LlmConfig, ProviderKind};
use crate::orchestrator::{OrchestratorConfig, Timings};
use crate::prompt::PromptConfig;
use crate::secure_storage::{ApiKeyStore, KeyringStore};

const SETTINGS_DIR: &str = "gengo";
const SETTINGS_FILE: &str = "settings.json";

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:1234/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const MAX_MAX_TOKENS: u32 = 128_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
const MAX_REQUEST_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_TRANSLATION_SHORTCUT: &str = "Ctrl+Space";
const DEFAULT_CORRECTION_SHORTCUT: &str = "Ctrl+Shift+2";
const DEFAULT_ON_DEMAND_SHORTCUT: &str = "Ctrl+Shift+1";
const DEFAULT_PRESET_SHORTCUT: &str = "Ctrl+1";
const DEFAULT_PRESET_PROMPT: &str = "Please translate between Japanese and English. Automatically determine the \
language of the input text and translate it into the other language.";
const DEFAULT_CAPTURE_SETTLE_MS: u64 = 500;
const DEFAULT_FOCUS_SETTLE_MS: u64 = 50;
const DEFAULT_CLIPBOARD_RESTORE_MS: u64 = 300;
const DEFAULT_CLOSE_DELAY_MS: u64 = 200;
const MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 3_000;
const MIN_BACKEND_TIMEOUT_MS: u64 = 100;
const MAX_BACKEND_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONTROL_PORT: u16 = 47_913;

const SHORTCUT_MODIFIERS: &[&str] = &["Cmd", "Ctrl", "Alt", "Shift", "CmdOrCtrl"];

static SHORTCUT_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9]|F[1-9]|F1[0-2]|Space|Tab|Enter|Escape|Delete|Backspace|Up|Down|Left|Right|Home|End|PageUp|PageDown|Insert|[;,./\\\[\]'`\-=])$",
    )
    .unwrap_or_else(|err| panic!("invalid shortcut key pattern: {err}"))
});

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no configuration directory is available on this system")]
    NoConfigDir,
    #[error("failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write settings to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationLanguages {
    #[serde(default = "default_language1")]
    pub language1: String,
    #[serde(default = "default_language2")]
    pub language2: String,
}

impl Default for TranslationLanguages {
    fn default() -> Self {
        Self {
            language1: default_language1(),
            language2: default_language2(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetPrompt {
    #[serde(default)]
    pub shortcut_key: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default)]
    pub llm_provider: ProviderKind,
    #[serde(default = "default_endpoint")]
    pub llm_endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model_name: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub stream_responses: bool,
    #[serde(default)]
    pub translation_languages: TranslationLanguages,
    #[serde(default = "default_preset_prompts")]
    pub preset_prompts: Vec<PresetPrompt>,
    #[serde(default = "default_translation_shortcut")]
    pub translation_shortcut_key: String,
    #[serde(default = "default_correction_shortcut")]
    pub correction_shortcut_key: String,
    #[serde(default = "default_on_demand_shortcut")]
    pub on_demand_shortcut_key: String,
    #[serde(default)]
    pub auto_apply_and_close: bool,
    #[serde(default = "default_capture_settle_ms")]
    pub capture_settle_ms: u64,
    #[serde(default = "default_focus_settle_ms")]
    pub focus_settle_ms: u64,
    #[serde(default = "default_clipboard_restore_ms")]
    pub clipboard_restore_ms: u64,
    #[serde(default = "default_close_delay_ms")]
    pub close_delay_ms: u64,
    /// Upper bound for one focus query, activation or key chord.
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            llm_provider: ProviderKind::default(),
            llm_endpoint: default_endpoint(),
            api_key: String::new(),
            model_name: default_model(),
            max_tokens: default_max_tokens(),
            request_timeout_ms: default_request_timeout_ms(),
            stream_responses: true,
            translation_languages: TranslationLanguages::default(),
            preset_prompts: default_preset_prompts(),
            translation_shortcut_key: default_translation_shortcut(),
            correction_shortcut_key: default_correction_shortcut(),
            on_demand_shortcut_key: default_on_demand_shortcut(),
            auto_apply_and_close: false,
            capture_settle_ms: default_capture_settle_ms(),
            focus_settle_ms: default_focus_settle_ms(),
            clipboard_restore_ms: default_clipboard_restore_ms(),
            close_delay_ms: default_close_delay_ms(),
            backend_timeout_ms: default_backend_timeout_ms(),
            control_port: default_control_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_language1() -> String {
    "ja".to_string()
}

fn default_language2() -> String {
    "en".to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_preset_prompts() -> Vec<PresetPrompt> {
    vec![PresetPrompt {
        shortcut_key: DEFAULT_PRESET_SHORTCUT.to_string(),
        prompt: DEFAULT_PRESET_PROMPT.to_string(),
        enabled: true,
    }]
}

fn default_translation_shortcut() -> String {
    DEFAULT_TRANSLATION_SHORTCUT.to_string()
}

fn default_correction_shortcut() -> String {
    DEFAULT_CORRECTION_SHORTCUT.to_string()
}

fn default_on_demand_shortcut() -> String {
    DEFAULT_ON_DEMAND_SHORTCUT.to_string()
}

fn default_capture_settle_ms() -> u64 {
    DEFAULT_CAPTURE_SETTLE_MS
}

fn default_focus_settle_ms() -> u64 {
    DEFAULT_FOCUS_SETTLE_MS
}

fn default_clipboard_restore_ms() -> u64 {
    DEFAULT_CLIPBOARD_RESTORE_MS
}

fn default_close_delay_ms() -> u64 {
    DEFAULT_CLOSE_DELAY_MS
}

fn default_backend_timeout_ms() -> u64 {
    DEFAULT_BACKEND_TIMEOUT_MS
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

impl AppSettings {
    pub fn llm_config(&self) -> LlmConfig {
        let api_key = self.api_key.trim();
        LlmConfig {
            provider: self.llm_provider,
            endpoint: self.llm_endpoint.clone(),
            api_key: (!api_key.is_empty()).then(|| api_key.to_string()),
            model: self.model_name.clone(),
            max_tokens: self.max_tokens,
            timeout: Duration::from_millis(self.request_timeout_ms),
            stream: self.stream_responses,
        }
    }

    pub fn prompt_config(&self) -> PromptConfig {
        PromptConfig {
            language1: self.translation_languages.language1.clone(),
            language2: self.translation_languages.language2.clone(),
            presets: self
                .preset_prompts
                .iter()
                .map(|preset| preset.enabled.then(|| preset.prompt.clone()))
                .collect(),
        }
    }

    pub fn timings(&self) -> Timings {
        Timings {
            capture_settle: Duration::from_millis(self.capture_settle_ms),
            focus_settle: Duration::from_millis(self.focus_settle_ms),
            clipboard_restore: Duration::from_millis(self.clipboard_restore_ms),
            close_delay: Duration::from_millis(self.close_delay_ms),
            backend_call: Duration::from_millis(self.backend_timeout_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            llm: self.llm_config(),
            prompt: self.prompt_config(),
            auto_apply_and_close: self.auto_apply_and_close,
            timings: self.timings(),
        }
    }

    /// Copy safe to print: the API key is reduced to a short hint.
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        masked.api_key = mask_api_key(&self.api_key);
        masked
    }

    /// `(mode, shortcut)` pairs for every enabled binding.
    pub fn shortcut_bindings(&self) -> Vec<(String, String)> {
        let mut bindings = vec![
            ("translate".to_string(), self.translation_shortcut_key.clone()),
            ("correct".to_string(), self.correction_shortcut_key.clone()),
            ("ask <instruction>".to_string(), self.on_demand_shortcut_key.clone()),
        ];
        bindings.extend(
            self.preset_prompts
                .iter()
                .enumerate()
                .filter(|(_, preset)| preset.enabled)
                .map(|(index, preset)| (format!("preset {}", index + 1), preset.shortcut_key.clone())),
        );
        bindings
    }
}

pub fn mask_api_key(api_key: &str) -> String {
    let trimmed = api_key.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    match chars.len() {
        0 => String::new(),
        1..=8 => "*".repeat(chars.len()),
        len => {
            let head: String = chars[..3].iter().collect();
            let tail: String = chars[len - 4..].iter().collect();
            format!("{head}...{tail}")
        }
    }
}

pub fn validate_shortcut(shortcut: &str) -> Result<(), String> {
    let parts: Vec<&str> = shortcut.split('+').map(str::trim).collect();
    if parts.len() < 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(format!(
            "shortcut `{shortcut}` must combine at least one modifier and a key, e.g. Ctrl+Space"
        ));
    }

    let (key, modifiers) = parts
        .split_last()
        .ok_or_else(|| format!("shortcut `{shortcut}` is empty"))?;
    if let Some(unknown) = modifiers
        .iter()
        .find(|modifier| !SHORTCUT_MODIFIERS.contains(modifier))
    {
        return Err(format!(
            "shortcut `{shortcut}` uses unknown modifier `{unknown}` (expected one of {})",
            SHORTCUT_MODIFIERS.join(", ")
        ));
    }
    if !SHORTCUT_KEY.is_match(key) {
        return Err(format!("shortcut `{shortcut}` ends with unsupported key `{key}`"));
    }

    Ok(())
}

fn is_language_code(code: &str) -> bool {
    (2..=3).contains(&code.len()) && code.chars().all(|ch| ch.is_ascii_alphabetic())
}

fn normalize_shortcut(value: &str, fallback: fn() -> String, field: &str) -> String {
    let trimmed = value.trim();
    if validate_shortcut(trimmed).is_ok() {
        return trimmed.to_string();
    }
    warn!(field, "loaded shortcut is invalid; resetting to default");
    fallback()
}

fn clamp_or_default<T>(value: T, range: std::ops::RangeInclusive<T>, fallback: T, field: &str) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if range.contains(&value) {
        value
    } else {
        warn!(field, %value, "loaded value is out of range; resetting to default");
        fallback
    }
}

/// Repairs whatever a hand-edited or older settings file got wrong, falling
/// back to defaults instead of refusing to start.
pub fn normalize_loaded_settings(mut settings: AppSettings) -> AppSettings {
    settings.api_key = settings.api_key.trim().to_string();
    settings.llm_endpoint = settings.llm_endpoint.trim().to_string();
    if settings.llm_endpoint.is_empty() {
        settings.llm_endpoint = default_endpoint();
    }
    settings.model_name = settings.model_name.trim().to_string();
    if settings.model_name.is_empty() {
        settings.model_name = default_model();
    }

    settings.max_tokens = clamp_or_default(settings.max_tokens, 1..=MAX_MAX_TOKENS, DEFAULT_MAX_TOKENS, "maxTokens");
    settings.request_timeout_ms = clamp_or_default(
        settings.request_timeout_ms,
        MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS,
        DEFAULT_REQUEST_TIMEOUT_MS,
        "requestTimeoutMs",
    );
    settings.capture_settle_ms = clamp_or_default(
        settings.capture_settle_ms,
        1..=MAX_DELAY_MS,
        DEFAULT_CAPTURE_SETTLE_MS,
        "captureSettleMs",
    );
    settings.focus_settle_ms =
        clamp_or_default(settings.focus_settle_ms, 0..=MAX_DELAY_MS, DEFAULT_FOCUS_SETTLE_MS, "focusSettleMs");
    settings.clipboard_restore_ms = clamp_or_default(
        settings.clipboard_restore_ms,
        1..=MAX_DELAY_MS,
        DEFAULT_CLIPBOARD_RESTORE_MS,
        "clipboardRestoreMs",
    );
    settings.close_delay_ms =
        clamp_or_default(settings.close_delay_ms, 0..=MAX_DELAY_MS, DEFAULT_CLOSE_DELAY_MS, "closeDelayMs");
    settings.backend_timeout_ms = clamp_or_default(
        settings.backend_timeout_ms,
        MIN_BACKEND_TIMEOUT_MS..=MAX_BACKEND_TIMEOUT_MS,
        DEFAULT_BACKEND_TIMEOUT_MS,
        "backendTimeoutMs",
    );
    if settings.control_port == 0 {
        warn!("loaded control port is zero; resetting to default");
        settings.control_port = DEFAULT_CONTROL_PORT;
    }

    let languages = &mut settings.translation_languages;
    languages.language1 = languages.language1.trim().to_ascii_lowercase();
    languages.language2 = languages.language2.trim().to_ascii_lowercase();
    if !is_language_code(&languages.language1)
        || !is_language_code(&languages.language2)
        || languages.language1 == languages.language2
    {
        warn!("loaded translation languages are invalid; resetting to defaults");
        *languages = TranslationLanguages::default();
    }

    settings.translation_shortcut_key = normalize_shortcut(
        &settings.translation_shortcut_key,
        default_translation_shortcut,
        "translationShortcutKey",
    );
    settings.correction_shortcut_key = normalize_shortcut(
        &settings.correction_shortcut_key,
        default_correction_shortcut,
        "correctionShortcutKey",
    );
    settings.on_demand_shortcut_key = normalize_shortcut(
        &settings.on_demand_shortcut_key,
        default_on_demand_shortcut,
        "onDemandShortcutKey",
    );
    for preset in &mut settings.preset_prompts {
        preset.prompt = preset.prompt.trim().to_string();
        preset.shortcut_key = preset.shortcut_key.trim().to_string();
        if preset.enabled && (preset.prompt.is_empty() || validate_shortcut(&preset.shortcut_key).is_err()) {
            warn!("disabling preset with an empty prompt or invalid shortcut");
            preset.enabled = false;
        }
    }

    settings
}

fn invalid(message: impl Into<String>) -> SettingsError {
    SettingsError::Invalid(message.into())
}

fn check_range<T>(value: T, range: std::ops::RangeInclusive<T>, field: &str) -> Result<(), SettingsError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!(
            "{field} must be between {} and {}",
            range.start(),
            range.end()
        )))
    }
}

/// Rejects user-supplied settings with a message naming the offending field.
pub fn validate_settings(mut settings: AppSettings) -> Result<AppSettings, SettingsError> {
    settings.api_key = settings.api_key.trim().to_string();
    settings.llm_endpoint = settings.llm_endpoint.trim().to_string();
    settings.model_name = settings.model_name.trim().to_string();

    let endpoint = reqwest::Url::parse(&settings.llm_endpoint)
        .map_err(|err| invalid(format!("llmEndpoint `{}` is not a valid URL: {err}", settings.llm_endpoint)))?;
    if !matches!(endpoint.scheme(), "http" | "https") {
        return Err(invalid("llmEndpoint must use http or https"));
    }
    if settings.model_name.is_empty() {
        return Err(invalid("modelName cannot be empty"));
    }

    check_range(settings.max_tokens, 1..=MAX_MAX_TOKENS, "maxTokens")?;
    check_range(
        settings.request_timeout_ms,
        MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS,
        "requestTimeoutMs",
    )?;
    check_range(settings.capture_settle_ms, 1..=MAX_DELAY_MS, "captureSettleMs")?;
    check_range(settings.focus_settle_ms, 0..=MAX_DELAY_MS, "focusSettleMs")?;
    check_range(settings.clipboard_restore_ms, 1..=MAX_DELAY_MS, "clipboardRestoreMs")?;
    check_range(settings.close_delay_ms, 0..=MAX_DELAY_MS, "closeDelayMs")?;
    check_range(
        settings.backend_timeout_ms,
        MIN_BACKEND_TIMEOUT_MS..=MAX_BACKEND_TIMEOUT_MS,
        "backendTimeoutMs",
    )?;
    if settings.control_port == 0 {
        return Err(invalid("controlPort cannot be 0"));
    }

    let languages = &mut settings.translation_languages;
    languages.language1 = languages.language1.trim().to_ascii_lowercase();
    languages.language2 = languages.language2.trim().to_ascii_lowercase();
    for code in [&languages.language1, &languages.language2] {
        if !is_language_code(code) {
            return Err(invalid(format!("`{code}` is not an ISO-639 language code")));
        }
    }
    if languages.language1 == languages.language2 {
        return Err(invalid("translationLanguages must name two different languages"));
    }

    let mut bindings: Vec<(String, String)> = Vec::new();
    for (field, shortcut) in [
        ("translationShortcutKey", &mut settings.translation_shortcut_key),
        ("correctionShortcutKey", &mut settings.correction_shortcut_key),
        ("onDemandShortcutKey", &mut settings.on_demand_shortcut_key),
    ] {
        *shortcut = shortcut.trim().to_string();
        validate_shortcut(shortcut).map_err(|err| invalid(format!("{field}: {err}")))?;
        bindings.push((field.to_string(), shortcut.clone()));
    }
    for (index, preset) in settings.preset_prompts.iter_mut().enumerate() {
        preset.prompt = preset.prompt.trim().to_string();
        preset.shortcut_key = preset.shortcut_key.trim().to_string();
        if !preset.enabled {
            continue;
        }
        let field = format!("presetPrompts[{index}]");
        if preset.prompt.is_empty() {
            return Err(invalid(format!("{field}: an enabled preset needs a prompt")));
        }
        validate_shortcut(&preset.shortcut_key).map_err(|err| invalid(format!("{field}: {err}")))?;
        bindings.push((field, preset.shortcut_key.clone()));
    }

    for (position, (field, shortcut)) in bindings.iter().enumerate() {
        if let Some((other, _)) = bindings[..position]
            .iter()
            .find(|(_, existing)| existing.eq_ignore_ascii_case(shortcut))
        {
            return Err(invalid(format!("{field} reuses shortcut `{shortcut}` already bound to {other}")));
        }
    }

    Ok(settings)
}

/// Folds keys written by older releases into the current shape.
fn migrate_legacy_keys(value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };

    let auto_close = object.remove("autoClose");
    let auto_apply = object.remove("autoApply");
    if (auto_close.is_some() || auto_apply.is_some()) && !object.contains_key("autoApplyAndClose") {
        let enabled = auto_close.and_then(|value| value.as_bool()).unwrap_or(false)
            && auto_apply.and_then(|value| value.as_bool()).unwrap_or(false);
        info!(enabled, "migrating legacy autoClose/autoApply settings");
        object.insert("autoApplyAndClose".to_string(), Value::Bool(enabled));
    }

    if let Some(shortcut) = object.remove("shortcutKey") {
        if !object.contains_key("translationShortcutKey") {
            object.insert("translationShortcutKey".to_string(), shortcut);
        }
    }

    if let Some(Value::String(prompt)) = object.remove("customPrompt") {
        if !object.contains_key("presetPrompts") && !prompt.trim().is_empty() {
            object.insert(
                "presetPrompts".to_string(),
                serde_json::json!([{ "shortcutKey": DEFAULT_PRESET_SHORTCUT, "prompt": prompt, "enabled": true }]),
            );
        }
    }
}

pub fn read_config(path: &Path) -> Result<AppSettings, SettingsError> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }

    let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut value: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    migrate_legacy_keys(&mut value);
    serde_json::from_value(value).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_config(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let serialized = serde_json::to_string_pretty(settings).map_err(SettingsError::Serialize)?;
    fs::write(path, serialized).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn read_api_key_from_environment() -> Option<String> {
    for key_name in ["GENGO_API_KEY", "OPENAI_API_KEY"] {
        if let Ok(value) = std::env::var(key_name) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyLocation {
    SecureStorage,
    SettingsFile,
}

/// Settings file plus the secret store that holds the API key.
#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    keys: Arc<dyn ApiKeyStore>,
    env_fallback: bool,
}

impl SettingsStore {
    pub fn new(path: PathBuf, keys: Arc<dyn ApiKeyStore>) -> Self {
        Self {
            path,
            keys,
            env_fallback: true,
        }
    }

    pub fn default_path() -> Result<PathBuf, SettingsError> {
        dirs::config_dir()
            .map(|dir| dir.join(SETTINGS_DIR).join(SETTINGS_FILE))
            .ok_or(SettingsError::NoConfigDir)
    }

    pub fn open_default() -> Result<Self, SettingsError> {
        Ok(Self::new(Self::default_path()?, Arc::new(KeyringStore)))
    }

    pub fn without_env_fallback(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AppSettings, SettingsError> {
        let mut settings = normalize_loaded_settings(read_config(&self.path)?);

        match self.keys.read() {
            Ok(Some(api_key)) => {
                settings.api_key = api_key;
            }
            Ok(None) => {
                if !settings.api_key.is_empty() {
                    // Legacy plaintext key: move it into secure storage.
                    match self.keys.write_verified(&settings.api_key) {
                        Ok(()) => {
                            let mut sanitized = settings.clone();
                            sanitized.api_key.clear();
                            if let Err(err) = write_config(&self.path, &sanitized) {
                                warn!("failed to rewrite sanitized settings after secure migration: {err}");
                            }
                        }
                        Err(err) => warn!("failed to migrate API key into secure storage: {err}"),
                    }
                }
            }
            Err(err) => {
                warn!("failed to read API key from secure storage; using settings file fallback: {err}");
            }
        }

        if settings.api_key.trim().is_empty() && self.env_fallback {
            if let Some(env_api_key) = read_api_key_from_environment() {
                settings.api_key = env_api_key;
            }
        }

        Ok(settings)
    }

    /// Validates and persists `settings`, keeping the API key out of the file
    /// whenever secure storage accepted it.
    pub fn save(&self, settings: AppSettings) -> Result<(AppSettings, ApiKeyLocation), SettingsError> {
        let validated = validate_settings(settings)?;

        let location = match self.keys.write_verified(&validated.api_key) {
            Ok(()) => ApiKeyLocation::SecureStorage,
            Err(err) => {
                warn!("secure storage unavailable, keeping API key in settings file: {err}");
                ApiKeyLocation::SettingsFile
            }
        };

        let mut persisted = validated.clone();
        if location == ApiKeyLocation::SecureStorage {
            persisted.api_key.clear();
        }
        write_config(&self.path, &persisted)?;
        info!(path = %self.path.display(), has_api_key = !validated.api_key.is_empty(), "settings saved");

        Ok((validated, location))
    }

    pub fn set_api_key(&self, api_key: &str) -> Result<ApiKeyLocation, SettingsError> {
        let mut settings = self.load()?;
        settings.api_key = api_key.trim().to_string();
        self.save(settings).map(|(_, location)| location)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemoryKeys {
        value: Mutex<Option<String>>,
        broken: bool,
    }

    impl ApiKeyStore for MemoryKeys {
        fn read(&self) -> Result<Option<String>, String> {
            if self.broken {
                return Err("keyring offline".to_string());
            }
            Ok(self.value.lock().unwrap().clone())
        }

        fn write_verified(&self, api_key: &str) -> Result<(), String> {
            if self.broken {
                return Err("keyring offline".to_string());
            }
            let trimmed = api_key.trim();
            *self.value.lock().unwrap() = (!trimmed.is_empty()).then(|| trimmed.to_string());
            Ok(())
        }
    }

    fn store(dir: &tempfile::TempDir, keys: Arc<MemoryKeys>) -> SettingsStore {
        SettingsStore::new(dir.path().join("gengo").join("settings.json"), keys).without_env_fallback()
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = store(&dir, Arc::new(MemoryKeys::default())).load().unwrap();
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.llm_endpoint, "http://127.0.0.1:1234/v1");
        assert_eq!(settings.preset_prompts[0].shortcut_key, "Ctrl+1");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Arc::new(MemoryKeys::default()));
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), r#"{"llmProvider":"remote","modelName":"gpt-4.1"}"#).unwrap();

        let settings = store.load().unwrap();
        assert_eq!(settings.llm_provider, ProviderKind::Remote);
        assert_eq!(settings.model_name, "gpt-4.1");
        assert_eq!(settings.max_tokens, 4096);
        assert_eq!(settings.capture_settle_ms, 500);
    }

    #[test]
    fn legacy_auto_flags_are_folded() {
        let mut both: Value = serde_json::json!({ "autoClose": true, "autoApply": true });
        migrate_legacy_keys(&mut both);
        assert_eq!(both["autoApplyAndClose"], Value::Bool(true));
        assert!(both.get("autoClose").is_none());

        let mut one: Value = serde_json::json!({ "autoClose": true });
        migrate_legacy_keys(&mut one);
        assert_eq!(one["autoApplyAndClose"], Value::Bool(false));

        let mut legacy: Value = serde_json::json!({ "shortcutKey": "Alt+T", "customPrompt": "Make it polite" });
        migrate_legacy_keys(&mut legacy);
        let settings: AppSettings = serde_json::from_value(legacy).unwrap();
        assert_eq!(settings.translation_shortcut_key, "Alt+T");
        assert_eq!(settings.preset_prompts[0].prompt, "Make it polite");
    }

    #[test]
    fn save_keeps_key_out_of_file_when_keyring_works() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(MemoryKeys::default());
        let store = store(&dir, Arc::clone(&keys));

        let settings = AppSettings {
            api_key: " sk-secret ".to_string(),
            ..AppSettings::default()
        };
        let (saved, location) = store.save(settings).unwrap();
        assert_eq!(location, ApiKeyLocation::SecureStorage);
        assert_eq!(saved.api_key, "sk-secret");

        let on_disk = fs::read_to_string(store.path()).unwrap();
        assert!(!on_disk.contains("sk-secret"));
        assert_eq!(store.load().unwrap().api_key, "sk-secret");
    }

    #[test]
    fn save_falls_back_to_file_when_keyring_fails() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(MemoryKeys {
            broken: true,
            ..MemoryKeys::default()
        });
        let store = store(&dir, keys);

        let location = store.set_api_key("sk-file").unwrap();
        assert_eq!(location, ApiKeyLocation::SettingsFile);
        assert_eq!(store.load().unwrap().api_key, "sk-file");
    }

    #[test]
    fn plaintext_key_migrates_into_keyring() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(MemoryKeys::default());
        let store = store(&dir, Arc::clone(&keys));
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), r#"{"apiKey":"sk-legacy"}"#).unwrap();

        assert_eq!(store.load().unwrap().api_key, "sk-legacy");
        assert_eq!(keys.value.lock().unwrap().as_deref(), Some("sk-legacy"));
        assert!(!fs::read_to_string(store.path()).unwrap().contains("sk-legacy"));
    }

    #[test]
    fn normalize_resets_out_of_range_values() {
        let settings = normalize_loaded_settings(AppSettings {
            max_tokens: 0,
            request_timeout_ms: 10,
            translation_shortcut_key: "Space".to_string(),
            translation_languages: TranslationLanguages {
                language1: "en".to_string(),
                language2: "EN".to_string(),
            },
            ..AppSettings::default()
        });
        assert_eq!(settings.max_tokens, 4096);
        assert_eq!(settings.request_timeout_ms, 60_000);
        assert_eq!(settings.translation_shortcut_key, "Ctrl+Space");
        assert_eq!(settings.translation_languages, TranslationLanguages::default());
    }

    #[test]
    fn validate_rejects_bad_input_with_field_names() {
        let err = validate_settings(AppSettings {
            llm_endpoint: "not a url".to_string(),
            ..AppSettings::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("llmEndpoint"));

        let err = validate_settings(AppSettings {
            request_timeout_ms: 900_000,
            ..AppSettings::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("requestTimeoutMs"));

        let err = validate_settings(AppSettings {
            correction_shortcut_key: "Ctrl+Space".to_string(),
            ..AppSettings::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("reuses shortcut"));

        let mut settings = AppSettings::default();
        settings.preset_prompts[0].prompt = "  ".to_string();
        assert!(validate_settings(settings).is_err());
    }

    #[test]
    fn shortcut_syntax() {
        for valid in ["Ctrl+Space", "CmdOrCtrl+Shift+F12", "Alt+;", "Ctrl+/", "Cmd+Shift+1"] {
            assert!(validate_shortcut(valid).is_ok(), "{valid} should be valid");
        }
        for invalid in ["Space", "Ctrl+", "Hyper+K", "Ctrl+F13", "Ctrl+Shift+Enterr"] {
            assert!(validate_shortcut(invalid).is_err(), "{invalid} should be invalid");
        }
    }

    #[test]
    fn derived_configs_follow_settings() {
        let mut settings = AppSettings::default();
        settings.preset_prompts.push(PresetPrompt {
            shortcut_key: "Ctrl+2".to_string(),
            prompt: "Summarize".to_string(),
            enabled: false,
        });

        let prompt = settings.prompt_config();
        assert_eq!(prompt.presets.len(), 2);
        assert!(prompt.presets[1].is_none());

        let llm = settings.llm_config();
        assert_eq!(llm.api_key, None);
        assert_eq!(llm.timeout, Duration::from_secs(60));
        assert_eq!(settings.timings().capture_settle, Duration::from_millis(500));
        assert_eq!(settings.timings().backend_call, Duration::from_secs(3));
    }

    #[test]
    fn out_of_range_backend_timeout_is_reset_on_load() {
        let mut settings = AppSettings::default();
        settings.backend_timeout_ms = 0;
        assert_eq!(normalize_loaded_settings(settings.clone()).backend_timeout_ms, 3_000);
        assert!(validate_settings(settings).is_err());
    }

    #[test]
    fn masking_hides_the_middle_of_the_key() {
        assert_eq!(mask_api_key("sk-1234567890abcd"), "sk-...abcd");
        assert_eq!(mask_api_key("short"), "*****");
        assert_eq!(mask_api_key(""), "");
    }
}
