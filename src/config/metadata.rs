//! Catalog of operator-facing configuration fields.

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::schema::RuntimeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Basic,
    Proxy,
    Security,
}

/// Describes one configuration field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldMetadata {
    pub key: &'static str,
    pub value_type: ValueType,
    pub editable: bool,
    pub requires_restart: bool,
    pub description: &'static str,
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<&'static str>,
}

pub const CATALOG: &[FieldMetadata] = &[
    FieldMetadata {
        key: "target_base_url",
        value_type: ValueType::String,
        editable: true,
        requires_restart: false,
        description: "Default upstream base URL for callers without a mapped key",
        category: Category::Proxy,
        example: Some("https://api.anthropic.com"),
    },
    FieldMetadata {
        key: "preserve_host",
        value_type: ValueType::Boolean,
        editable: true,
        requires_restart: false,
        description: "Forward the caller's Host header instead of the target host",
        category: Category::Proxy,
        example: None,
    },
    FieldMetadata {
        key: "system_prompt_replacement",
        value_type: ValueType::String,
        editable: true,
        requires_restart: false,
        description: "Text written into the first system prompt block of chat requests",
        category: Category::Proxy,
        example: Some("You are a helpful assistant."),
    },
    FieldMetadata {
        key: "system_prompt_block_insert_if_not_exist",
        value_type: ValueType::Boolean,
        editable: true,
        requires_restart: false,
        description: "Insert a new leading block unless the first block mentions the keyword",
        category: Category::Proxy,
        example: None,
    },
    FieldMetadata {
        key: "debug_mode",
        value_type: ValueType::Boolean,
        editable: true,
        requires_restart: true,
        description: "Verbose logging including request body previews",
        category: Category::Basic,
        example: None,
    },
    FieldMetadata {
        key: "port",
        value_type: ValueType::Number,
        editable: true,
        requires_restart: true,
        description: "Listen port",
        category: Category::Basic,
        example: Some("8088"),
    },
    FieldMetadata {
        key: "dashboard_enabled",
        value_type: ValueType::Boolean,
        editable: false,
        requires_restart: true,
        description: "Serve the admin API",
        category: Category::Security,
        example: None,
    },
    FieldMetadata {
        key: "dashboard_api_key",
        value_type: ValueType::String,
        editable: true,
        requires_restart: false,
        description: "Bearer token required by the admin API",
        category: Category::Security,
        example: Some("your-secret-api-key"),
    },
    FieldMetadata {
        key: "custom_headers",
        value_type: ValueType::Json,
        editable: true,
        requires_restart: false,
        description: "Extra headers injected into every upstream request",
        category: Category::Proxy,
        example: Some(r#"{"X-Custom-Header":"value"}"#),
    },
];

pub fn lookup(key: &str) -> Option<&'static FieldMetadata> {
    CATALOG.iter().find(|m| m.key == key)
}

/// Whether any of `fields` needs a restart to take effect.
pub fn requires_restart(fields: &[&str]) -> bool {
    fields
        .iter()
        .any(|f| lookup(f).is_some_and(|m| m.requires_restart))
}

/// Current value of a catalog field as JSON.
pub fn current_value(
    key: &str,
    settings: &RuntimeSettings,
    headers: &std::collections::BTreeMap<String, String>,
) -> Value {
    match key {
        "target_base_url" => json!(settings.target_base_url),
        "preserve_host" => json!(settings.preserve_host),
        "system_prompt_replacement" => json!(settings.system_prompt_replacement),
        "system_prompt_block_insert_if_not_exist" => json!(settings.system_prompt_block_insert_if_not_exist),
        "debug_mode" => json!(settings.debug_mode),
        "port" => json!(settings.port),
        "dashboard_enabled" => json!(settings.dashboard_enabled),
        "dashboard_api_key" => json!(settings.dashboard_api_key),
        "custom_headers" => json!(headers),
        _ => Value::Null,
    }
}
