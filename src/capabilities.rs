//! WebDriver capabilities and new-session request parsing.
//!
//! Clients speak either the legacy JSON-Wire dialect (`desiredCapabilities`)
//! or W3C (`capabilities.alwaysMatch` / `firstMatch`). Both collapse into one
//! loose [`Capabilities`] record; keys the hub does not recognise are kept in
//! `extra` and travel to the browser untouched.

use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::HubError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Capabilities {
    pub browser_name: String,
    #[serde(alias = "version")]
    pub browser_version: String,
    pub screen_resolution: String,
    #[serde(rename = "enableVNC")]
    pub vnc: bool,
    pub time_zone: String,
    #[serde(rename = "enableVideo")]
    pub video: bool,
    pub video_name: String,
    pub video_screen_size: String,
    pub video_frame_rate: u16,
    pub video_codec: String,
    #[serde(alias = "name")]
    pub test_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Extract the requested capabilities from a `POST /wd/hub/session` body.
///
/// `desiredCapabilities` wins when it names a browser; otherwise each
/// `firstMatch` entry is merged over `alwaysMatch` until one does.
pub fn parse_new_session(body: &[u8]) -> Result<Capabilities, HubError> {
    let raw: Value = serde_json::from_slice(body)
        .map_err(|err| HubError::BadRequest(format!("malformed new session request: {err}")))?;

    if let Some(desired) = raw.get("desiredCapabilities") {
        if let Some(caps) = capabilities_from(desired.clone()) {
            return Ok(caps);
        }
    }

    if let Some(w3c) = raw.get("capabilities") {
        let always = match w3c.get("alwaysMatch") {
            Some(Value::Object(obj)) => obj.clone(),
            _ => Map::new(),
        };
        let first_match = match w3c.get("firstMatch") {
            Some(Value::Array(entries)) => entries.clone(),
            _ => Vec::new(),
        };

        let candidates = if first_match.is_empty() {
            vec![Value::Object(Map::new())]
        } else {
            first_match
        };

        for entry in candidates {
            let mut merged = always.clone();
            if let Value::Object(obj) = entry {
                merged.extend(obj);
            }
            if let Some(caps) = capabilities_from(Value::Object(merged)) {
                return Ok(caps);
            }
        }
    }

    Err(HubError::BadRequest(
        "browserName capability is required".to_string(),
    ))
}

fn capabilities_from(value: Value) -> Option<Capabilities> {
    serde_json::from_value::<Capabilities>(value)
        .ok()
        .filter(|caps| !caps.browser_name.is_empty())
}

/// Build the session identifier, which doubles as the pod name: it must be a
/// valid RFC 1123 DNS label.
pub fn generate_session_id(browser: &str, version: &str) -> String {
    format!("{}-{}-{}", slug(browser), slug(version), Uuid::new_v4())
}

fn slug(part: &str) -> String {
    let sanitized: String = part
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    sanitized.trim_matches('-').to_string()
}
