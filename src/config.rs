//! Config façade: load/merge/write over a three-layer hierarchy, publishing
//! `config.updated` and disposing the current [`Instance`](crate::instance::Instance)
//! on every update.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use jsonschema::Validator;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::instrument;

use crate::bus::{Bus, EventDescriptor};
use crate::error::{ConfigError, ConfigResult};
use crate::instance::Instance;

const PROJECT_CONFIG_FILE: &str = "opencode.json";
const LOCAL_CONFIG_FILE: &str = "opencode.local.json";
const TYPO_CANDIDATES: &[&str] = &[".opencode-config.json", "opencode.jsonc", "config.json"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShareMode {
    Manual,
    Auto,
    Disabled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub permission: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub enabled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The config surface recognized by this crate. Unknown top-level fields
/// round-trip verbatim through `extra` rather than being dropped by strict
/// deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Info {
    pub theme: Option<String>,
    pub username: Option<String>,
    pub share: Option<ShareMode>,
    pub model: Option<String>,
    pub small_model: Option<String>,
    pub keybinds: Option<HashMap<String, String>>,
    pub mcp: Option<HashMap<String, McpServerConfig>>,
    pub experimental: Option<HashMap<String, bool>>,
    pub agent: Option<HashMap<String, AgentConfig>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The config façade for one project directory.
pub struct Config {
    directory: PathBuf,
}

impl Config {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }

    fn project_path(&self) -> PathBuf {
        self.directory.join(PROJECT_CONFIG_FILE)
    }

    fn local_path(&self) -> PathBuf {
        self.directory.join(LOCAL_CONFIG_FILE)
    }

    fn global_path(&self) -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("opencode").join("config.json"))
    }

    /// Fail loudly when the project directory holds a recognized
    /// historical or mistyped config filename instead of `opencode.json`.
    fn check_directory_typo(&self) -> ConfigResult<()> {
        if self.project_path().exists() {
            return Ok(());
        }
        for candidate in TYPO_CANDIDATES {
            if self.directory.join(candidate).exists() {
                return Err(ConfigError::DirectoryTypo { found: candidate.to_string() });
            }
        }
        Ok(())
    }

    /// Read and merge the global, project, and local layers (in ascending
    /// priority) into the recognized [`Info`] shape.
    #[instrument(skip(self))]
    pub async fn get(&self) -> ConfigResult<Info> {
        self.check_directory_typo()?;

        let mut merged = json!({});

        if let Some(global_path) = self.global_path() {
            if let Some(layer) = read_layer(&global_path, false).await? {
                deep_merge(&mut merged, layer);
            }
        }

        if let Some(layer) = read_layer(&self.project_path(), false).await? {
            deep_merge(&mut merged, layer);
        }

        if let Some(layer) = read_layer(&self.local_path(), true).await? {
            deep_merge(&mut merged, layer);
        }

        validate_info(&merged)?;

        Ok(serde_json::from_value(merged)?)
    }

    /// Deep-merge `patch` into the on-disk project layer, write it back,
    /// publish `config.updated` carrying the freshly merged config, and
    /// dispose the current instance so the next access re-reads from disk.
    #[instrument(skip(self, patch))]
    pub async fn update(
        &self,
        patch: Value,
        bus: &Bus,
        updated_event: &EventDescriptor,
    ) -> ConfigResult<Info> {
        self.check_directory_typo()?;

        let mut project_layer = read_layer(&self.project_path(), false).await?.unwrap_or_else(|| json!({}));
        deep_merge(&mut project_layer, patch);
        write_layer(&self.project_path(), &project_layer).await?;

        let merged = self.get().await?;
        let merged_json = serde_json::to_value(&merged)?;

        let _ = bus.publish(updated_event, json!({ "config": merged_json })).await;

        if let Ok(instance) = Instance::current() {
            instance.dispose().await;
        }

        Ok(merged)
    }
}

/// The `config.updated` event descriptor: `{config: Info}`.
pub fn config_updated_event() -> EventDescriptor {
    crate::bus::event(
        "config.updated",
        json!({
            "type": "object",
            "properties": { "config": { "type": "object" } },
            "required": ["config"]
        }),
    )
    .expect("config.updated schema is a fixed, valid literal")
}

/// JSON Schema for the recognized [`Info`] fields, validated against the
/// merged tree ahead of typed deserialization so a domain violation (e.g.
/// `share` outside `{manual, auto, disabled}`) surfaces as
/// [`ConfigError::Invalid`] with the validator's diagnostics rather than as
/// an opaque `serde_json` deserialization failure. Unknown top-level keys
/// are deliberately left unconstrained (`additionalProperties: true`) so
/// they keep round-tripping through [`Info::extra`].
static INFO_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    jsonschema::validator_for(&json!({
        "type": "object",
        "additionalProperties": true,
        "properties": {
            "theme": { "type": ["string", "null"] },
            "username": { "type": ["string", "null"] },
            "share": { "enum": ["manual", "auto", "disabled", null] },
            "model": { "type": ["string", "null"] },
            "small_model": { "type": ["string", "null"] },
            "keybinds": {
                "type": ["object", "null"],
                "additionalProperties": { "type": "string" }
            },
            "mcp": { "type": ["object", "null"] },
            "experimental": {
                "type": ["object", "null"],
                "additionalProperties": { "type": "boolean" }
            },
            "agent": { "type": ["object", "null"] }
        }
    }))
    .expect("Info schema is a fixed, valid literal")
});

/// Validate the merged config tree against [`INFO_SCHEMA`].
fn validate_info(value: &Value) -> ConfigResult<()> {
    INFO_SCHEMA.validate(value).map_err(|e| ConfigError::Invalid(e.to_string()))
}

async fn read_layer(path: &Path, interpolate_env: bool) -> ConfigResult<Option<Value>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let stripped = strip_json_comments(&raw);
    let stripped = if interpolate_env { interpolate_env_vars(&stripped) } else { stripped };
    let value: Value = serde_json::from_str(&stripped)?;
    Ok(Some(value))
}

async fn write_layer(path: &Path, value: &Value) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, contents).await?;
    Ok(())
}

/// Recursively merge `patch` into `base`. Objects merge key-by-key; arrays
/// and scalars in `patch` replace the corresponding value in `base`
/// outright (no array concatenation) — last writer wins.
fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value,
    }
}

/// Strip `//` line comments and `/* */` block comments that fall outside
/// string literals, tolerating the historical `opencode.json`-with-comments
/// convention ahead of strict JSON parsing.
fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            other => out.push(other),
        }
    }

    out
}

/// Interpolate `${VAR}` and `${VAR:-default}` occurrences inside string
/// values. Applied only to the local config layer, so the merged config
/// published in `config.updated` stays reproducible from checked-in files.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let expr = &after[..end];
        let (var, default) = match expr.split_once(":-") {
            Some((var, default)) => (var, Some(default)),
            None => (expr, None),
        };
        match std::env::var(var) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                if let Some(default) = default {
                    out.push_str(default);
                }
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_line_and_block_comments_outside_strings() {
        let input = r#"{
            // a line comment
            "a": 1, /* block
            comment */ "b": "// not a comment"
        }"#;
        let stripped = strip_json_comments(input);
        let value: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], json!(1));
        assert_eq!(value["b"], json!("// not a comment"));
    }

    #[test]
    fn interpolates_env_vars_with_default() {
        unsafe {
            std::env::set_var("OPENCODE_CORE_TEST_VAR", "hello");
        }
        assert_eq!(interpolate_env_vars("${OPENCODE_CORE_TEST_VAR}"), "hello");
        assert_eq!(interpolate_env_vars("${OPENCODE_CORE_TEST_MISSING:-fallback}"), "fallback");
        unsafe {
            std::env::remove_var("OPENCODE_CORE_TEST_VAR");
        }
    }

    #[test]
    fn deep_merge_replaces_scalars_and_recurses_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": [1, 2]});
        let patch = json!({"a": {"y": 20, "z": 3}, "b": [9]});
        deep_merge(&mut base, patch);
        assert_eq!(base, json!({"a": {"x": 1, "y": 20, "z": 3}, "b": [9]}));
    }

    #[test]
    fn deep_merge_preserves_unknown_base_keys() {
        let mut base = json!({"theme": "dark", "some_future_field": {"nested": true}});
        let patch = json!({"username": "ada"});
        deep_merge(&mut base, patch);
        assert_eq!(base["some_future_field"], json!({"nested": true}));
        assert_eq!(base["username"], json!("ada"));
    }

    #[tokio::test]
    async fn update_writes_project_layer_and_merges_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let bus = Bus::new();
        let event = config_updated_event();

        let merged = config.update(json!({"theme": "dark"}), &bus, &event).await.unwrap();
        assert_eq!(merged.theme.as_deref(), Some("dark"));

        let on_disk = tokio::fs::read_to_string(dir.path().join("opencode.json")).await.unwrap();
        let value: Value = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(value["theme"], json!("dark"));
    }

    #[tokio::test]
    async fn out_of_domain_share_value_is_invalid_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("opencode.json"), serde_json::to_vec(&json!({"share": "bogus"})).unwrap())
            .await
            .unwrap();

        let config = Config::new(dir.path());
        assert!(matches!(config.get().await, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn directory_typo_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("config.json"), b"{}").await.unwrap();
        let config = Config::new(dir.path());
        assert!(matches!(config.get().await, Err(ConfigError::DirectoryTypo { .. })));
    }

    #[tokio::test]
    async fn unknown_fields_round_trip_through_update() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("opencode.json"),
            serde_json::to_vec(&json!({"theme": "light", "future_field": {"a": 1}})).unwrap(),
        )
        .await
        .unwrap();

        let config = Config::new(dir.path());
        let bus = Bus::new();
        let event = config_updated_event();
        let merged = config.update(json!({"username": "ada"}), &bus, &event).await.unwrap();

        assert_eq!(merged.extra.get("future_field"), Some(&json!({"a": 1})));
        assert_eq!(merged.username.as_deref(), Some("ada"));
    }
}
