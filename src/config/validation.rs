//! Validation of administrative configuration updates.
//!
//! # Responsibilities
//! - Check value ranges and formats (ports valid, URLs absolute http(s))
//! - Reject fields that are not editable at runtime
//! - Normalize custom headers to the same rules the header file uses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: ConfigUpdate → Result<ValidatedUpdate, Vec<ValidationError>>
//! - Runs before anything is written to disk

use std::collections::BTreeMap;
use std::fmt;

use axum::http::{HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::loader::normalize_headers;
use crate::config::schema::{bool_to_env, keys, RuntimeSettings};

/// Upper bound on the dashboard key length, mirrored by the auth check.
pub const MAX_API_KEY_LENGTH: usize = 1024;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Partial update as received from the admin API. Absent fields are untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub target_base_url: Option<String>,
    pub preserve_host: Option<bool>,
    pub system_prompt_replacement: Option<String>,
    pub system_prompt_block_insert_if_not_exist: Option<bool>,
    pub debug_mode: Option<bool>,
    pub port: Option<i64>,
    #[serde(alias = "enable_dashboard")]
    pub dashboard_enabled: Option<bool>,
    pub dashboard_api_key: Option<String>,
    pub custom_headers: Option<Map<String, Value>>,
}

/// An update that passed validation, with typed and trimmed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedUpdate {
    pub target_base_url: Option<String>,
    pub preserve_host: Option<bool>,
    pub system_prompt_replacement: Option<String>,
    pub system_prompt_block_insert_if_not_exist: Option<bool>,
    pub debug_mode: Option<bool>,
    pub port: Option<u16>,
    pub dashboard_api_key: Option<String>,
    pub custom_headers: Option<BTreeMap<String, String>>,
}

impl ValidatedUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Names of the fields present in this update, in catalog order.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.target_base_url.is_some() {
            fields.push("target_base_url");
        }
        if self.preserve_host.is_some() {
            fields.push("preserve_host");
        }
        if self.system_prompt_replacement.is_some() {
            fields.push("system_prompt_replacement");
        }
        if self.system_prompt_block_insert_if_not_exist.is_some() {
            fields.push("system_prompt_block_insert_if_not_exist");
        }
        if self.debug_mode.is_some() {
            fields.push("debug_mode");
        }
        if self.port.is_some() {
            fields.push("port");
        }
        if self.dashboard_api_key.is_some() {
            fields.push("dashboard_api_key");
        }
        if self.custom_headers.is_some() {
            fields.push("custom_headers");
        }
        fields
    }

    /// Env file entries this update writes.
    pub fn env_updates(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(v) = &self.target_base_url {
            env.insert(keys::API_BASE_URL.to_string(), v.clone());
        }
        if let Some(v) = self.preserve_host {
            env.insert(keys::PRESERVE_HOST.to_string(), bool_to_env(v));
        }
        if let Some(v) = &self.system_prompt_replacement {
            env.insert(keys::SYSTEM_PROMPT_REPLACEMENT.to_string(), v.clone());
        }
        if let Some(v) = self.system_prompt_block_insert_if_not_exist {
            env.insert(keys::SYSTEM_PROMPT_BLOCK_INSERT_IF_NOT_EXIST.to_string(), bool_to_env(v));
        }
        if let Some(v) = self.debug_mode {
            env.insert(keys::DEBUG_MODE.to_string(), bool_to_env(v));
        }
        if let Some(v) = self.port {
            env.insert(keys::PORT.to_string(), v.to_string());
        }
        if let Some(v) = &self.dashboard_api_key {
            env.insert(keys::DASHBOARD_API_KEY.to_string(), v.clone());
        }
        env
    }

    /// Settings after applying this update to `current`.
    pub fn apply_to(&self, current: &RuntimeSettings) -> RuntimeSettings {
        let mut next = current.clone();
        if let Some(v) = &self.target_base_url {
            next.target_base_url = v.clone();
        }
        if let Some(v) = self.preserve_host {
            next.preserve_host = v;
        }
        if let Some(v) = &self.system_prompt_replacement {
            next.system_prompt_replacement = (!v.is_empty()).then(|| v.clone());
        }
        if let Some(v) = self.system_prompt_block_insert_if_not_exist {
            next.system_prompt_block_insert_if_not_exist = v;
        }
        if let Some(v) = self.debug_mode {
            next.debug_mode = v;
        }
        if let Some(v) = self.port {
            next.port = v;
        }
        if let Some(v) = &self.dashboard_api_key {
            next.dashboard_api_key = v.clone();
        }
        next
    }
}

/// Validate an update, collecting every error.
pub fn validate_update(update: ConfigUpdate) -> Result<ValidatedUpdate, Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut validated = ValidatedUpdate {
        preserve_host: update.preserve_host,
        system_prompt_block_insert_if_not_exist: update.system_prompt_block_insert_if_not_exist,
        debug_mode: update.debug_mode,
        ..ValidatedUpdate::default()
    };

    if let Some(url) = update.target_base_url {
        let url = url.trim().trim_end_matches('/').to_string();
        match validate_base_url(&url) {
            Ok(()) => validated.target_base_url = Some(url),
            Err(message) => errors.push(ValidationError::new("target_base_url", message)),
        }
    }

    if let Some(text) = update.system_prompt_replacement {
        validated.system_prompt_replacement = Some(text.trim().to_string());
    }

    if let Some(port) = update.port {
        match u16::try_from(port) {
            Ok(p) if p > 0 => validated.port = Some(p),
            _ => errors.push(ValidationError::new("port", "must be between 1 and 65535")),
        }
    }

    if update.dashboard_enabled.is_some() {
        errors.push(ValidationError::new(
            "dashboard_enabled",
            "is not editable at runtime",
        ));
    }

    if let Some(key) = update.dashboard_api_key {
        let key = key.trim().to_string();
        if key.len() > MAX_API_KEY_LENGTH {
            errors.push(ValidationError::new(
                "dashboard_api_key",
                format!("must be at most {MAX_API_KEY_LENGTH} bytes"),
            ));
        } else if key.chars().any(char::is_control) {
            errors.push(ValidationError::new(
                "dashboard_api_key",
                "must not contain control characters",
            ));
        } else {
            validated.dashboard_api_key = Some(key);
        }
    }

    if let Some(headers) = update.custom_headers {
        let before = errors.len();
        for (name, value) in &headers {
            if name.starts_with("__") {
                continue;
            }
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                errors.push(ValidationError::new(
                    "custom_headers",
                    format!("invalid header name {name:?}"),
                ));
                continue;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(_) | Value::Bool(_) => value.to_string(),
                _ => {
                    errors.push(ValidationError::new(
                        "custom_headers",
                        format!("value of {name:?} must be a string, number or boolean"),
                    ));
                    continue;
                }
            };
            if HeaderValue::from_str(&rendered).is_err() {
                errors.push(ValidationError::new(
                    "custom_headers",
                    format!("invalid header value for {name:?}"),
                ));
            }
        }
        if errors.len() == before {
            validated.custom_headers = Some(normalize_headers(headers));
        }
    }

    if errors.is_empty() {
        Ok(validated)
    } else {
        Err(errors)
    }
}

fn validate_base_url(raw: &str) -> Result<(), String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("invalid URL: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err("scheme must be http or https".to_string());
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err("must include a host".to_string());
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err("must not carry a query or fragment".to_string());
    }
    Ok(())
}
