//! # Configuration loader
//!
//! Reads a JSON document, layers its `Imports` underneath it and compiles
//! the result into an [`Engine`](crate::engine::Engine).
//!
//! Import rule: for every top-level key, objects present on both sides are
//! merged one level deep with the importing document winning per entry;
//! any other value from the importing document replaces the imported one.

mod catalog;

use serde_json::{Map, Value as JsonValue};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::Config;
use crate::error::ConfigError;

pub use catalog::{compile, select_tests, CompileOptions};

const KEY_IMPORTS: &str = "Imports";

/// Load `path` and everything it imports.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = canonical(path.as_ref())?;
    let mut chain = Vec::new();
    let document = load_document(&path, &mut chain)?;
    let mut config: Config = serde_json::from_value(JsonValue::Object(document))
        .map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
    config.options.cfg_path = Some(path.display().to_string());
    tracing::debug!(
        path = %path.display(),
        tests = config.tests.len(),
        schedules = config.schedules.len(),
        "configuration loaded"
    );
    Ok(config)
}

fn canonical(path: &Path) -> Result<PathBuf, ConfigError> {
    fs::canonicalize(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_document(path: &Path, chain: &mut Vec<PathBuf>) -> Result<Map<String, JsonValue>, ConfigError> {
    if chain.iter().any(|seen| seen == path) {
        return Err(ConfigError::invalid(
            KEY_IMPORTS,
            format!("import cycle through `{}`", path.display()),
        ));
    }

    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: JsonValue = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let JsonValue::Object(mut document) = value else {
        return Err(ConfigError::invalid(
            path.display().to_string(),
            "configuration must be a JSON object",
        ));
    };

    let imports = match document.remove(KEY_IMPORTS) {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::String(one)) => vec![one],
        Some(JsonValue::Array(many)) => many
            .into_iter()
            .map(|item| match item {
                JsonValue::String(path) => Ok(path),
                other => Err(ConfigError::invalid(KEY_IMPORTS, format!("expected a path, got {other}"))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(ConfigError::invalid(KEY_IMPORTS, format!("expected a path or a list, got {other}")));
        }
    };
    if imports.is_empty() {
        return Ok(document);
    }

    chain.push(path.to_path_buf());
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut base = Map::new();
    for import in imports {
        let import_path = canonical(&base_dir.join(import))?;
        let imported = load_document(&import_path, chain)?;
        base = merge(base, imported);
    }
    chain.pop();

    Ok(merge(base, document))
}

/// Lay `child` over `parent`.
pub fn merge(mut parent: Map<String, JsonValue>, child: Map<String, JsonValue>) -> Map<String, JsonValue> {
    for (key, value) in child {
        match (parent.entry(key).or_insert(JsonValue::Null), value) {
            (JsonValue::Object(inherited), JsonValue::Object(own)) => inherited.extend(own),
            (slot, value) => *slot = value,
        }
    }
    parent
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn merge_is_one_level_deep_and_child_wins() {
        let parent = object(json!({
            "Name": "base",
            "Hosts": {"a": {"Host": "http://a"}, "b": {"Host": "http://b"}},
            "Schedules": [{"Name": "base"}]
        }));
        let child = object(json!({
            "Name": "child",
            "Hosts": {"b": {"Proxy": "http://p"}},
            "Schedules": [{"Name": "child"}]
        }));
        let merged = merge(parent, child);
        assert_eq!(merged["Name"], "child");
        assert_eq!(merged["Hosts"]["a"]["Host"], "http://a");
        assert_eq!(merged["Hosts"]["b"], json!({"Proxy": "http://p"}));
        assert_eq!(merged["Schedules"], json!([{"Name": "child"}]));
    }

    #[test]
    fn loads_imports_relative_to_importer() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("shared")).unwrap();
        fs::write(
            dir.path().join("shared/hosts.json"),
            r#"{"Hosts": {"api": {"Host": "http://localhost:1"}}, "Env": {"A": "1", "B": "1"}}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("main.json"),
            r#"{"Name": "main", "Imports": "shared/hosts.json", "Env": {"B": "2"}}"#,
        )
        .unwrap();

        let config = load_config(dir.path().join("main.json")).unwrap();
        assert_eq!(config.name, "main");
        assert_eq!(config.hosts["api"].host, "http://localhost:1");
        assert_eq!(config.env["A"], "1");
        assert_eq!(config.env["B"], "2");
        assert!(config.options.cfg_path.unwrap().ends_with("main.json"));
    }

    #[test]
    fn rejects_import_cycles() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), r#"{"Imports": ["b.json"]}"#).unwrap();
        fs::write(dir.path().join("b.json"), r#"{"Imports": "a.json"}"#).unwrap();
        let err = load_config(dir.path().join("a.json")).unwrap_err();
        assert!(err.to_string().contains("import cycle"));
    }

    #[test]
    fn reports_io_and_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_config(dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
        fs::write(dir.path().join("bad.json"), "{ nope").unwrap();
        assert!(matches!(
            load_config(dir.path().join("bad.json")),
            Err(ConfigError::Parse { .. })
        ));
        fs::write(dir.path().join("list.json"), "[]").unwrap();
        assert!(matches!(
            load_config(dir.path().join("list.json")),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
