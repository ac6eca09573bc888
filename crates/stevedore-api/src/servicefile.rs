//! Service-file loading.
//!
//! A service file is a YAML document with two kinds of top-level keys:
//! lowercase names are services, capitalized names are global directives
//! (`Domains`, `Env`, `Generate`, `Exec`, ...). `Includes: [path, ...]`
//! pulls in other files: their globals merge one level deep (maps
//! deep-merged with the local file winning, scalars overridden) and their
//! services come first, with local services overriding by name.
//!
//! The controller itself never reads files; the edge (or the CLI) loads
//! and merges, and the core sees only the resulting services + globals.

use std::path::Path;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use stevedore_core::{Error, Result};

/// A loaded, include-resolved service file.
#[derive(Debug, Clone, Default)]
pub struct ServiceFile {
    /// Raw service definitions, in file order.
    pub services: IndexMap<String, Value>,
    /// Global directives.
    pub globals: Map<String, Value>,
}

impl ServiceFile {
    /// Loads `path` and resolves its `Includes`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut file = Self::parse(&text)?;

        let includes: Vec<String> = match file.globals.remove("Includes") {
            Some(Value::Array(paths)) => paths
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(other) => {
                return Err(Error::invalid_input(format!(
                    "Includes must be a list of paths, got {other}"
                )));
            }
            None => Vec::new(),
        };

        let base = path.parent().unwrap_or(Path::new("."));
        for include in includes {
            let included = ServiceFile::load(&base.join(include))?;
            file = included.merged_with(file);
        }
        Ok(file)
    }

    /// Parses a single document without resolving includes.
    pub fn parse(text: &str) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|err| Error::invalid_input(format!("invalid service file: {err}")))?;
        let doc = serde_json::to_value(&doc)?;
        let Value::Object(entries) = doc else {
            return Err(Error::invalid_input("service file must be a mapping"));
        };

        let mut file = ServiceFile::default();
        for (key, value) in entries {
            // Uppercase idents are non-service directives.
            if key.chars().next().is_some_and(char::is_uppercase) {
                file.globals.insert(key, value);
            } else {
                file.services.insert(key, value);
            }
        }
        Ok(file)
    }

    /// Merges `local` over `self` (the included file): local globals win,
    /// maps one level deep; local services override by name but included
    /// services come first.
    fn merged_with(mut self, local: ServiceFile) -> ServiceFile {
        for (key, value) in local.globals {
            match (self.globals.get_mut(&key), value) {
                (Some(Value::Object(base)), Value::Object(overlay)) => {
                    for (sub_key, sub_value) in overlay {
                        base.insert(sub_key, sub_value);
                    }
                }
                (_, value) => {
                    self.globals.insert(key, value);
                }
            }
        }
        for (name, definition) in local.services {
            self.services.insert(name, definition);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_services_from_directives() {
        let file = ServiceFile::parse(
            "web:\n    image: example/web\nEnv:\n    web:\n        KEY: value\n",
        )
        .unwrap();
        assert_eq!(file.services.len(), 1);
        assert!(file.services.contains_key("web"));
        assert_eq!(file.globals["Env"]["web"]["KEY"], json!("value"));
    }

    #[test]
    fn service_order_is_preserved() {
        let file = ServiceFile::parse("b: {image: b}\na: {image: a}\nc: {image: c}\n").unwrap();
        let names: Vec<&String> = file.services.keys().collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn includes_merge_one_level_deep() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("base.yaml"),
            "db: {image: postgres}\nEnv:\n    db: {PASSWORD: secret}\n    web: {BASE: '1'}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("site.yaml"),
            "Includes: [base.yaml]\nweb: {image: web}\ndb: {image: mysql}\nEnv:\n    web: {BASE: '2'}\n",
        )
        .unwrap();

        let file = ServiceFile::load(&dir.path().join("site.yaml")).unwrap();

        // Included services first, local definitions override by name.
        let names: Vec<&String> = file.services.keys().collect();
        assert_eq!(names, ["db", "web"]);
        assert_eq!(file.services["db"]["image"], json!("mysql"));

        // Globals merged one level deep, local values winning.
        assert_eq!(file.globals["Env"]["db"]["PASSWORD"], json!("secret"));
        assert_eq!(file.globals["Env"]["web"]["BASE"], json!("2"));
    }
}
