//! The configuration document loaded once before the first instantiation
//! attempt. The shim interprets two flags; everything else (asset
//! locations and similar bootstrap concerns) is carried through verbatim.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ShimConfig {
    /// Master switch: when false, no connection or request is rerouted.
    #[serde(default, rename = "interceptionEnabled")]
    pub interception_enabled: bool,
    /// Reroute HTTP request creation as well. Only consulted when
    /// `interception_enabled` is also set.
    #[serde(default, rename = "httpInterceptionEnabled")]
    pub http_interception_enabled: bool,
    /// Fields the shim does not interpret, preserved for the bootstrap.
    #[serde(flatten)]
    pub passthrough: Map<String, JsonValue>,
}

impl ShimConfig {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("parse config document")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("read config document {path:?}"))?;
        Self::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_off() {
        let config = ShimConfig::from_slice(b"{}").expect("parse");
        assert!(!config.interception_enabled);
        assert!(!config.http_interception_enabled);
        assert!(config.passthrough.is_empty());
    }

    #[test]
    fn recognized_flags_parse() {
        let config = ShimConfig::from_slice(
            br#"{"interceptionEnabled": true, "httpInterceptionEnabled": false}"#,
        )
        .expect("parse");
        assert!(config.interception_enabled);
        assert!(!config.http_interception_enabled);
    }

    #[test]
    fn unknown_fields_pass_through_verbatim() {
        let doc = br#"{
            "interceptionEnabled": true,
            "dataUrl": "/game_assets/data.data",
            "codeUrl": "/game_assets/code.wasm"
        }"#;
        let config = ShimConfig::from_slice(doc).expect("parse");
        assert_eq!(
            config.passthrough.get("dataUrl").and_then(JsonValue::as_str),
            Some("/game_assets/data.data")
        );
        let reencoded = serde_json::to_value(&config).expect("encode");
        assert_eq!(
            reencoded.get("codeUrl").and_then(JsonValue::as_str),
            Some("/game_assets/code.wasm")
        );
    }

    #[test]
    fn missing_document_is_an_error() {
        let err = ShimConfig::load(Path::new("does/not/exist.json"))
            .expect_err("must fail");
        assert!(err.to_string().contains("read config document"));
    }
}
