use crate::error::{self, Result};
use log::warn;
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::path::Path;

/// One node in the nested configuration tree: either a concrete value or a further nested
/// map, reached by walking colon-delimited key segments.
#[derive(Debug, Clone)]
enum Node {
    Leaf(String),
    Branch(BTreeMap<String, Node>),
}

/// Process-wide keyed settings, addressed with colon-delimited paths like `velocity:system`.
///
/// Population order (each source overrides the previous): built-in defaults, then
/// `<config_dir>/config.yaml`, then environment variables, then CLI flags.
#[derive(Debug, Clone, Default)]
pub struct Config {
    root: BTreeMap<String, Node>,
}

fn validate_identifier(segment: &str) -> Result<()> {
    ensure!(
        !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
        error::InvalidConfigIdentifierSnafu { id: segment }
    );
    Ok(())
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in defaults: `velocity:backend=apptainer`, `velocity:distro=ubuntu`,
    /// `velocity:system=<host architecture>`.
    pub fn with_defaults() -> Result<Self> {
        let mut cfg = Self::new();
        cfg.set("velocity:backend", "apptainer")?;
        cfg.set("velocity:distro", "ubuntu")?;
        cfg.set("velocity:system", std::env::consts::ARCH)?;
        Ok(cfg)
    }

    /// Set a colon-delimited key, creating intermediate maps as needed. Every segment must
    /// be alphanumeric/underscore.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        let segments: Vec<&str> = key.split(':').collect();
        for segment in &segments {
            validate_identifier(segment)?;
        }

        let (last, prefix) = segments.split_last().expect("split(':') yields at least one segment");
        let mut map = &mut self.root;
        for segment in prefix {
            let entry = map
                .entry(segment.to_string())
                .or_insert_with(|| Node::Branch(BTreeMap::new()));
            map = match entry {
                Node::Branch(m) => m,
                Node::Leaf(_) => {
                    *entry = Node::Branch(BTreeMap::new());
                    match entry {
                        Node::Branch(m) => m,
                        Node::Leaf(_) => unreachable!(),
                    }
                }
            };
        }
        map.insert(last.to_string(), Node::Leaf(value.into()));
        Ok(())
    }

    /// Look up a colon-delimited key. Logs a warning on miss (opt out with
    /// [`Config::get_quiet`]).
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_with(key, true)
    }

    /// Look up a key without warning on miss.
    pub fn get_quiet(&self, key: &str) -> Option<String> {
        self.get_with(key, false)
    }

    pub fn get_with(&self, key: &str, warn_on_miss: bool) -> Option<String> {
        let mut map = &self.root;
        let segments: Vec<&str> = key.split(':').collect();
        let (last, prefix) = segments.split_last()?;

        for segment in prefix {
            match map.get(*segment) {
                Some(Node::Branch(m)) => map = m,
                _ => {
                    if warn_on_miss {
                        warn!("config key '{key}' not found");
                    }
                    return None;
                }
            }
        }

        match map.get(*last) {
            Some(Node::Leaf(v)) => Some(v.clone()),
            _ => {
                if warn_on_miss {
                    warn!("config key '{key}' not found");
                }
                None
            }
        }
    }

    /// Overlay `<config_dir>/config.yaml`, flattening its nested maps into colon-delimited
    /// keys the same way `set` addresses them. A missing file is not an error; the caller
    /// decides whether a config dir is expected to exist.
    pub fn apply_yaml_file(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(path).context(error::ReadConfigFileSnafu { path: path.to_path_buf() })?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&contents).context(error::ParseConfigFileSnafu { path: path.to_path_buf() })?;
        self.merge_yaml_value(String::new(), &value)?;
        Ok(())
    }

    fn merge_yaml_value(&mut self, prefix: String, value: &serde_yaml::Value) -> Result<()> {
        match value {
            serde_yaml::Value::Mapping(map) => {
                for (k, v) in map {
                    let serde_yaml::Value::String(k) = k else { continue };
                    let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}:{k}") };
                    self.merge_yaml_value(key, v)?;
                }
                Ok(())
            }
            serde_yaml::Value::Null => Ok(()),
            _ => {
                let scalar = match value {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    _ => return Ok(()),
                };
                self.set(&prefix, scalar)
            }
        }
    }

    /// Overlay the `VELOCITY_*` environment variables.
    pub fn apply_environment(&mut self) -> Result<()> {
        let bindings = [
            ("VELOCITY_SYSTEM", "velocity:system"),
            ("VELOCITY_BACKEND", "velocity:backend"),
            ("VELOCITY_DISTRO", "velocity:distro"),
            ("VELOCITY_IMAGE_PATH", "velocity:image_path"),
            ("VELOCITY_BUILD_DIR", "velocity:build_dir"),
            ("VELOCITY_LOGGING_LEVEL", "velocity:logging_level"),
            ("VELOCITY_OPENSHIFT_CPU_LIMIT", "velocity:openshift_cpu_limit"),
            ("VELOCITY_OPENSHIFT_MEMORY_LIMIT", "velocity:openshift_memory_limit"),
        ];
        for (env_var, key) in bindings {
            if let Ok(value) = std::env::var(env_var) {
                self.set(key, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_and_get_nested_key() {
        let mut cfg = Config::new();
        cfg.set("velocity:system", "x86_64").unwrap();
        assert_eq!(cfg.get("velocity:system").as_deref(), Some("x86_64"));
    }

    #[test]
    fn missing_key_returns_none() {
        let cfg = Config::new();
        assert_eq!(cfg.get_quiet("velocity:nope"), None);
    }

    #[test]
    fn rejects_non_identifier_segments() {
        let mut cfg = Config::new();
        assert!(cfg.set("velocity:not-valid", "x").is_err());
    }

    #[test]
    fn defaults_are_populated() {
        let cfg = Config::with_defaults().unwrap();
        assert_eq!(cfg.get_quiet("velocity:backend").as_deref(), Some("apptainer"));
        assert_eq!(cfg.get_quiet("velocity:distro").as_deref(), Some("ubuntu"));
    }

    #[test]
    fn later_set_overrides_earlier() {
        let mut cfg = Config::with_defaults().unwrap();
        cfg.set("velocity:backend", "docker").unwrap();
        assert_eq!(cfg.get_quiet("velocity:backend").as_deref(), Some("docker"));
    }

    #[test]
    fn yaml_file_is_flattened_into_nested_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "velocity:\n  backend: docker\n  system: x86_64\n").unwrap();

        let mut cfg = Config::with_defaults().unwrap();
        cfg.apply_yaml_file(&path).unwrap();
        assert_eq!(cfg.get_quiet("velocity:backend").as_deref(), Some("docker"));
        assert_eq!(cfg.get_quiet("velocity:system").as_deref(), Some("x86_64"));
    }

    #[test]
    fn missing_yaml_file_is_not_an_error() {
        let mut cfg = Config::with_defaults().unwrap();
        assert!(cfg.apply_yaml_file(Path::new("/nonexistent/config.yaml")).is_ok());
    }
}
