//! Layered configuration loading.
//!
//! The built-in defaults are overlaid by each configured layer in order: YAML
//! files, `ADSIDEBAR_POLICY__*` variables plus a JSON blob, then the
//! comma-separated `path=value` list the CLI forwards. The result is
//! validated before it is handed out.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::api::apply_override_to_snapshot;
use crate::defaults::default_snapshot;
use crate::errors::PolicyError;
use crate::model::{PolicySnapshot, PolicySource};

const ENV_PREFIX: &str = "ADSIDEBAR_POLICY__";
const ENV_JSON: &str = "ADSIDEBAR_POLICY_OVERRIDE_JSON";
const ENV_CLI_OVERRIDES: &str = "ADSIDEBAR_POLICY_CLI_OVERRIDES";

/// Sections whose leaves get builtin provenance.
const SECTIONS: &[&str] = &["general", "layout", "convergence", "site_defaults"];

#[derive(Clone, Debug, PartialEq, Eq)]
enum Layer {
    /// Missing files are skipped.
    File(PathBuf),
    Env,
    CliEnv,
}

impl Layer {
    fn source(&self) -> PolicySource {
        match self {
            Layer::File(_) => PolicySource::File,
            Layer::Env => PolicySource::Env,
            Layer::CliEnv => PolicySource::Cli,
        }
    }

    fn entries(&self) -> Result<Vec<(String, Value)>, PolicyError> {
        match self {
            Layer::File(path) if !path.exists() => Ok(Vec::new()),
            Layer::File(path) => file_entries(path),
            Layer::Env => env_entries(),
            Layer::CliEnv => env::var(ENV_CLI_OVERRIDES)
                .map(|raw| cli_entries(&raw))
                .unwrap_or_else(|_| Ok(Vec::new())),
        }
    }
}

/// Builds a snapshot from the defaults and a list of layers.
#[derive(Clone, Debug, Default)]
pub struct PolicyLoader {
    layers: Vec<Layer>,
}

impl PolicyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.layers.push(Layer::File(path.into()));
        self
    }

    pub fn env(mut self) -> Self {
        self.layers.push(Layer::Env);
        self
    }

    pub fn cli_env(mut self) -> Self {
        self.layers.push(Layer::CliEnv);
        self
    }

    pub fn load(&self) -> Result<PolicySnapshot, PolicyError> {
        let mut snapshot = default_snapshot();
        record_builtin_provenance(&mut snapshot)?;

        for layer in &self.layers {
            let entries = layer.entries()?;
            debug!(?layer, entries = entries.len(), "policy layer read");
            let source = layer.source();
            for (path, value) in &entries {
                apply_override_to_snapshot(&mut snapshot, path, value, source)?;
            }
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Defaults, then the optional YAML file, then environment overlays.
pub fn load_snapshot(path: Option<&Path>) -> Result<PolicySnapshot, PolicyError> {
    let loader = match path {
        Some(path) => PolicyLoader::new().file(path),
        None => PolicyLoader::new(),
    };
    loader.env().cli_env().load()
}

fn file_entries(path: &Path) -> Result<Vec<(String, Value)>, PolicyError> {
    let content = fs::read_to_string(path)
        .map_err(|err| PolicyError::Io(format!("{}: {err}", path.display())))?;
    let document: Value = serde_yaml::from_str(&content)
        .map_err(|err| PolicyError::Invalid(format!("{}: {err}", path.display())))?;
    match document {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => Ok(dotted_entries(map, "")),
        other => Err(PolicyError::Invalid(format!(
            "{}: expected a mapping at the top level, got {other}",
            path.display()
        ))),
    }
}

fn env_entries() -> Result<Vec<(String, Value)>, PolicyError> {
    let mut entries: Vec<(String, Value)> = env::vars()
        .filter_map(|(key, raw)| {
            let path = key
                .strip_prefix(ENV_PREFIX)?
                .split("__")
                .filter(|segment| !segment.is_empty())
                .map(str::to_ascii_lowercase)
                .collect::<Vec<_>>()
                .join(".");
            (!path.is_empty()).then(|| (path, scalar(&raw)))
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let blob = env::var(ENV_JSON).unwrap_or_default();
    if !blob.trim().is_empty() {
        match serde_json::from_str::<Value>(&blob) {
            Ok(Value::Object(map)) => entries.extend(dotted_entries(map, "")),
            Ok(other) => {
                return Err(PolicyError::Invalid(format!(
                    "{ENV_JSON}: expected an object, got {other}"
                )))
            }
            Err(err) => return Err(PolicyError::Invalid(format!("{ENV_JSON}: {err}"))),
        }
    }
    Ok(entries)
}

fn cli_entries(raw: &str) -> Result<Vec<(String, Value)>, PolicyError> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| match token.split_once('=') {
            Some((path, value)) if !path.trim().is_empty() => {
                Ok((path.trim().to_string(), scalar(value.trim())))
            }
            _ => Err(PolicyError::Invalid(format!(
                "override `{token}` is not of the form path=value"
            ))),
        })
        .collect()
}

/// JSON when it parses, a plain string otherwise.
fn scalar(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Nested mappings become dot-separated paths. Sequences are leaves.
fn dotted_entries(map: Map<String, Value>, prefix: &str) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in map {
        let key = key.trim().to_ascii_lowercase();
        let path = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(nested) => out.extend(dotted_entries(nested, &path)),
            leaf => out.push((path, leaf)),
        }
    }
    out
}

fn record_builtin_provenance(snapshot: &mut PolicySnapshot) -> Result<(), PolicyError> {
    let Value::Object(mut tree) =
        serde_json::to_value(&*snapshot).map_err(|err| PolicyError::Invalid(err.to_string()))?
    else {
        return Ok(());
    };
    tree.retain(|key, _| SECTIONS.contains(&key.as_str()));
    for (path, _) in dotted_entries(tree, "") {
        snapshot.set_provenance(&path, PolicySource::Builtin);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_mappings_flatten_to_dotted_paths() {
        let Value::Object(map) = json!({
            "Layout": { "box_width": 300 },
            "sites": [{ "pattern": "example.com" }],
        }) else {
            unreachable!()
        };
        let mut entries = dotted_entries(map, "");
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            entries,
            vec![
                ("layout.box_width".to_string(), json!(300)),
                ("sites".to_string(), json!([{ "pattern": "example.com" }])),
            ]
        );
    }

    #[test]
    fn cli_list_parses_typed_values() {
        let entries =
            cli_entries(" general.enabled=false, ,layout.visible_boxes=4,sites=[]").unwrap();
        assert_eq!(
            entries,
            vec![
                ("general.enabled".to_string(), json!(false)),
                ("layout.visible_boxes".to_string(), json!(4)),
                ("sites".to_string(), json!([])),
            ]
        );
        assert_eq!(scalar("news"), json!("news"));
        assert_eq!(scalar(""), Value::Null);
    }

    #[test]
    fn cli_tokens_without_a_value_are_rejected() {
        assert!(matches!(
            cli_entries("general.enabled"),
            Err(PolicyError::Invalid(_))
        ));
        assert!(cli_entries("=true").is_err());
    }

    #[test]
    fn missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = PolicyLoader::new()
            .file(dir.path().join("absent.yaml"))
            .load()
            .unwrap();
        assert_eq!(snapshot.convergence.max_rounds, 5);
        assert_eq!(
            snapshot.provenance.get("layout.box_width").unwrap().source,
            PolicySource::Builtin
        );
    }

    #[test]
    fn non_mapping_documents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.yaml");
        std::fs::write(&path, "- 1\n- 2\n").unwrap();
        assert!(PolicyLoader::new().file(&path).load().is_err());
    }
}
