//! Loading of the JSON side files: operator headers and key mappings.
//!
//! Both loaders are fail-soft at the call site: a missing file is an empty
//! result, and the caller decides whether a parse error keeps the previous
//! state or falls back to empty.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::env_file::{write_atomic, ConfigStoreError};

/// Error type for side-file loading.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} must contain a JSON object")]
    NotAnObject { path: PathBuf },
}

/// One upstream target and the credentials routed to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMapping {
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// On-disk shape of the key mappings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMappings {
    #[serde(default)]
    pub mappings: Vec<TargetMapping>,
}

/// Load credential routing records. A missing file yields no mappings.
pub fn load_key_mappings(path: &Path) -> Result<KeyMappings, LoadError> {
    let Some(content) = read_optional(path)? else {
        return Ok(KeyMappings::default());
    };
    serde_json::from_str(&content).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load operator headers.
///
/// Keys starting with `__` are comments. Non-string values are rendered as
/// JSON text; keys that are not valid header names are skipped.
pub fn load_custom_headers(path: &Path) -> Result<BTreeMap<String, String>, LoadError> {
    let Some(content) = read_optional(path)? else {
        return Ok(BTreeMap::new());
    };
    let value: Value = serde_json::from_str(&content).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let Value::Object(map) = value else {
        return Err(LoadError::NotAnObject {
            path: path.to_path_buf(),
        });
    };
    Ok(normalize_headers(map.into_iter()))
}

/// Apply the header file rules to arbitrary key/value pairs.
pub fn normalize_headers(entries: impl IntoIterator<Item = (String, Value)>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for (key, value) in entries {
        if key.starts_with("__") {
            continue;
        }
        if HeaderName::from_bytes(key.as_bytes()).is_err() {
            tracing::warn!(header = %key, "Skipping invalid custom header name");
            continue;
        }
        let rendered = match value {
            Value::String(s) => s,
            Value::Null => continue,
            other => other.to_string(),
        };
        headers.insert(key, rendered);
    }
    headers
}

/// Persist operator headers as pretty JSON, atomically.
pub fn save_custom_headers(path: &Path, headers: &BTreeMap<String, String>) -> Result<(), ConfigStoreError> {
    let mut content = serde_json::to_string_pretty(headers).unwrap_or_else(|_| "{}".to_string());
    content.push('\n');
    write_atomic(path, content.as_bytes())
}

fn read_optional(path: &Path) -> Result<Option<String>, LoadError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LoadError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_key_mappings(&dir.path().join("nope.json")).unwrap().mappings.is_empty());
        assert!(load_custom_headers(&dir.path().join("nope.json")).unwrap().is_empty());
    }

    #[test]
    fn test_load_key_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        fs::write(
            &path,
            r#"{"mappings":[{"target_url":"https://a.example","keys":["k1","k2"]},{"target_url":"https://b.example"}]}"#,
        )
        .unwrap();

        let mappings = load_key_mappings(&path).unwrap();
        assert_eq!(mappings.mappings.len(), 2);
        assert_eq!(mappings.mappings[0].keys, vec!["k1", "k2"]);
        assert!(mappings.mappings[1].keys.is_empty());
    }

    #[test]
    fn test_malformed_mappings_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_key_mappings(&path), Err(LoadError::Parse { .. })));
    }

    #[test]
    fn test_custom_headers_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.json");
        fs::write(
            &path,
            r#"{"__comment":"ignored","X-Team":"core","X-Retries":3,"X-Flag":true,"bad header":"x"}"#,
        )
        .unwrap();

        let headers = load_custom_headers(&path).unwrap();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers["X-Team"], "core");
        assert_eq!(headers["X-Retries"], "3");
        assert_eq!(headers["X-Flag"], "true");
    }

    #[test]
    fn test_headers_must_be_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.json");
        fs::write(&path, "[1,2]").unwrap();
        assert!(matches!(load_custom_headers(&path), Err(LoadError::NotAnObject { .. })));
    }

    #[test]
    fn test_save_then_load_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("h.json");
        let mut headers = BTreeMap::new();
        headers.insert("X-Env".to_string(), "prod".to_string());

        save_custom_headers(&path, &headers).unwrap();
        assert_eq!(load_custom_headers(&path).unwrap(), headers);
    }
}
