//! System prompt rewriting for chat completion bodies.
//!
//! `process_request_body` is total: anything it cannot parse or does not
//! recognise is returned byte-for-byte unchanged.

use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::config::schema::{CompatConfig, RuntimeSettings};
use crate::http::headers::is_forced_target;

/// Whether `path` is the chat completion endpoint, ignoring a trailing slash.
pub fn is_chat_path(path: &str, compat: &CompatConfig) -> bool {
    let want = compat.chat_path.trim_end_matches('/');
    !want.is_empty() && path.trim_end_matches('/') == want
}

/// Rewrite the `system` field of a chat completion body.
pub fn process_request_body(
    body: &Bytes,
    credential: Option<&str>,
    target: &str,
    settings: &RuntimeSettings,
    compat: &CompatConfig,
) -> Bytes {
    let forced = credential.is_some_and(|c| !c.is_empty()) && is_forced_target(target, compat);
    if forced {
        tracing::debug!(target = %target, "Forcing canonical system prompt");
        return rewrite(body, |data| {
            data.insert(
                "system".to_string(),
                json!([{ "type": "text", "text": compat.forced_system_prompt }]),
            );
            true
        });
    }

    let Some(replacement) = settings.system_prompt_replacement.as_deref() else {
        return body.clone();
    };

    rewrite(body, |data| {
        let Some(system) = data.get_mut("system") else {
            data.insert("system".to_string(), Value::String(replacement.to_string()));
            tracing::debug!("No system field, adding replacement");
            return true;
        };
        let Some(blocks) = system.as_array_mut() else {
            return false;
        };
        let Some(first_text) = blocks
            .first()
            .and_then(Value::as_object)
            .and_then(|first| first.get("text"))
        else {
            return false;
        };

        let has_keyword = first_text
            .as_str()
            .is_some_and(|t| contains_ignore_case(t, &compat.keyword));

        if settings.system_prompt_block_insert_if_not_exist && !has_keyword {
            blocks.insert(
                0,
                json!({
                    "type": "text",
                    "text": replacement,
                    "cache_control": { "type": "ephemeral" },
                }),
            );
            tracing::debug!(blocks = blocks.len(), "Inserted leading system block");
        } else if let Some(first) = blocks.first_mut().and_then(Value::as_object_mut) {
            first.insert("text".to_string(), Value::String(replacement.to_string()));
            tracing::debug!("Replaced first system block text");
        }
        true
    })
}

/// Parse, edit and compactly re-serialize a JSON object body.
///
/// `edit` returns `false` to leave the body untouched.
fn rewrite(body: &Bytes, edit: impl FnOnce(&mut Map<String, Value>) -> bool) -> Bytes {
    let mut data: Value = match serde_json::from_slice(body) {
        Ok(data) => data,
        Err(e) => {
            tracing::debug!(error = %e, "Body is not JSON, forwarding unchanged");
            return body.clone();
        }
    };
    let Some(object) = data.as_object_mut() else {
        return body.clone();
    };
    if !edit(object) {
        return body.clone();
    }
    match serde_json::to_vec(&data) {
        Ok(out) => Bytes::from(out),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize rewritten body, forwarding original");
            body.clone()
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "https://api.example.com";

    fn settings(replacement: Option<&str>, insert: bool) -> RuntimeSettings {
        RuntimeSettings {
            system_prompt_replacement: replacement.map(str::to_string),
            system_prompt_block_insert_if_not_exist: insert,
            ..RuntimeSettings::default()
        }
    }

    fn run(body: &str, replacement: Option<&str>, insert: bool) -> Value {
        let out = process_request_body(
            &Bytes::from(body.to_string()),
            None,
            TARGET,
            &settings(replacement, insert),
            &CompatConfig::default(),
        );
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn test_chat_path_detection() {
        let compat = CompatConfig::default();
        assert!(is_chat_path("/v1/messages", &compat));
        assert!(is_chat_path("/v1/messages/", &compat));
        assert!(!is_chat_path("/v1/messages/count_tokens", &compat));
        assert!(!is_chat_path("/v1/models", &compat));
    }

    #[test]
    fn test_overwrite_mode_replaces_first_text() {
        let out = run(
            r#"{"system":[{"type":"text","text":"Claude Code assistant"}],"model":"m"}"#,
            Some("X"),
            false,
        );
        assert_eq!(out["system"][0]["text"], "X");
        assert_eq!(out["system"].as_array().unwrap().len(), 1);
        assert_eq!(out["model"], "m");
    }

    #[test]
    fn test_insert_mode_without_keyword_inserts_block() {
        let out = run(
            r#"{"system":[{"type":"text","text":"You are helpful"}]}"#,
            Some("X"),
            true,
        );
        let blocks = out["system"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["text"], "X");
        assert_eq!(blocks[0]["cache_control"]["type"], "ephemeral");
        assert_eq!(blocks[1]["text"], "You are helpful");
    }

    #[test]
    fn test_insert_mode_with_keyword_replaces() {
        let out = run(
            r#"{"system":[{"type":"text","text":"you are CLAUDE code"}]}"#,
            Some("X"),
            true,
        );
        assert_eq!(out["system"].as_array().unwrap().len(), 1);
        assert_eq!(out["system"][0]["text"], "X");
    }

    #[test]
    fn test_insert_mode_is_idempotent_on_keyword_input() {
        let s = settings(Some("Claude Code rules apply"), true);
        let compat = CompatConfig::default();
        let input = Bytes::from_static(br#"{"system":[{"type":"text","text":"Claude Code base"}]}"#);

        let once = process_request_body(&input, None, TARGET, &s, &compat);
        let twice = process_request_body(&once, None, TARGET, &s, &compat);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_missing_system_is_created() {
        let out = run(r#"{"messages":[]}"#, Some("X"), false);
        assert_eq!(out["system"], "X");
    }

    #[test]
    fn test_unrecognised_shapes_pass_through() {
        let s = settings(Some("X"), false);
        let compat = CompatConfig::default();
        for body in [
            r#"{"system":"plain string"}"#,
            r#"{"system":[]}"#,
            r#"{"system":[{"type":"image"}]}"#,
            r#"[1,2,3]"#,
            "not json at all",
            "{\"system\": [ {\"text\" : \"a\"} ",
        ] {
            let input = Bytes::from(body.to_string());
            let out = process_request_body(&input, None, TARGET, &s, &compat);
            assert_eq!(out, input, "body {body} should pass through");
        }
    }

    #[test]
    fn test_no_replacement_returns_original_bytes() {
        let input = Bytes::from_static(b"{ \"system\" : [ {\"text\":\"a\"} ] }");
        let out = process_request_body(
            &input,
            None,
            TARGET,
            &settings(None, false),
            &CompatConfig::default(),
        );
        assert_eq!(out, input);
    }

    #[test]
    fn test_forced_provider_overrides_system() {
        let compat = CompatConfig::default();
        let input = Bytes::from_static(br#"{"system":"anything","model":"m"}"#);

        let out = process_request_body(&input, Some("sk-1"), "https://anyrouter.top", &settings(None, false), &compat);
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            out["system"],
            json!([{ "type": "text", "text": compat.forced_system_prompt }])
        );

        let untouched = process_request_body(&input, None, "https://anyrouter.top", &settings(None, false), &compat);
        assert_eq!(untouched, input);
    }

    #[test]
    fn test_output_is_compact_and_keeps_key_order() {
        let input = Bytes::from_static(b"{\"model\": \"m\", \"system\": [{\"type\": \"text\", \"text\": \"a\"}]}");
        let out = process_request_body(&input, None, TARGET, &settings(Some("X"), false), &CompatConfig::default());
        assert_eq!(&out[..], br#"{"model":"m","system":[{"type":"text","text":"X"}]}"#);
    }
}
