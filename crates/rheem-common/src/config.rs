//! Rheem configuration
//!
//! All settings live in a flat, text-keyed map; typed accessors parse on
//! read. Configurations layer: a job forks the global configuration and
//! overrides keys locally, lookups fall back to the parent chain.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, RheemError};

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    name: String,
    properties: HashMap<String, String>,
    parent: Option<Arc<Configuration>>,
}

impl Configuration {
    /// Create an empty top-level configuration with built-in defaults.
    pub fn new() -> Self {
        let mut config = Self {
            name: "default".to_string(),
            properties: HashMap::new(),
            parent: None,
        };
        config.load_defaults();
        config
    }

    /// Load a configuration from a TOML file; nested tables flatten into
    /// dotted keys (`[rheem.core] optimizer.reoptimize = true` becomes
    /// `rheem.core.optimizer.reoptimize`).
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let value: toml::Value = content
            .parse()
            .map_err(|e: toml::de::Error| RheemError::Configuration(e.to_string()))?;
        let mut config = Self::new();
        flatten_toml(&mut config.properties, "", &value);
        config.name = path.as_ref().display().to_string();
        Ok(config)
    }

    /// Fork this configuration for job-local overrides.
    pub fn fork(self: &Arc<Self>, name: impl Into<String>) -> Configuration {
        Configuration {
            name: name.into(),
            properties: HashMap::new(),
            parent: Some(Arc::clone(self)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(value) => Some(value.as_str()),
            None => self.parent.as_ref().and_then(|p| p.get(key)),
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn require_string(&self, key: &str) -> Result<String> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| RheemError::Configuration(format!("missing required key `{key}`")))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.parse_or(key, default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.parse_or(key, default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.parse_or(key, default)
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(raw) => match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(key, raw, "unparsable configuration value, using default");
                    default
                }
            },
            None => default,
        }
    }

    fn load_defaults(&mut self) {
        let defaults: &[(&str, &str)] = &[
            ("rheem.core.optimizer.reoptimize", "true"),
            ("rheem.core.optimizer.reoptimize.ratio", "5.0"),
            ("rheem.core.optimizer.pruning.topk", "8"),
            ("rheem.core.optimizer.pruning.sample", "0"),
            ("rheem.core.optimizer.pruning.sample.seed", "42"),
            ("rheem.core.debug.skipexecution", "false"),
            ("rheem.core.log.enabled", "false"),
            ("rheem.core.log.executions", "rheem-executions.json"),
            ("rheem.profiler.ga.sampling", "1.0"),
            ("rheem.profiler.ga.min-cardinality-confidence", "1.0"),
            ("rheem.profiler.ga.binning", "1.1"),
            ("rheem.profiler.ga.maxgenerations", "5000"),
            ("rheem.profiler.ga.maxstablegenerations", "2000"),
            ("rheem.profiler.ga.minfitness", "0.0"),
            ("rheem.profiler.ga.superoptimizations", "3"),
            ("rheem.profiler.ga.blocking", "false"),
            ("rheem.profiler.ga.population", "50"),
            ("rheem.profiler.ga.elite", "0.2"),
            ("rheem.profiler.ga.mutation", "0.2"),
            ("rheem.profiler.ga.seed", "42"),
            ("rheem.profiler.ga.noise-filter.max", "3"),
            ("rheem.profiler.ga.noise-filter.threshold", "2.0"),
            ("rheem.profiler.ga.intermediateupdate", "10000"),
        ];
        for (key, value) in defaults {
            self.properties.insert(key.to_string(), value.to_string());
        }
    }
}

fn flatten_toml(target: &mut HashMap<String, String>, prefix: &str, value: &toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, nested) in table {
                let next = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_toml(target, &next, nested);
            }
        }
        toml::Value::String(s) => {
            target.insert(prefix.to_string(), s.clone());
        }
        other => {
            target.insert(prefix.to_string(), other.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_typed_accessors() {
        let mut config = Configuration::new();
        config.set("a.flag", "true");
        config.set("a.number", "17");
        config.set("a.ratio", "0.25");
        assert!(config.get_bool("a.flag", false));
        assert_eq!(config.get_u64("a.number", 0), 17);
        assert!((config.get_f64("a.ratio", 0.0) - 0.25).abs() < 1e-12);
        assert_eq!(config.get_u64("a.missing", 3), 3);
    }

    #[test]
    fn test_fork_falls_back_to_parent() {
        let mut base = Configuration::new();
        base.set("x", "parent");
        base.set("y", "parent");
        let base = Arc::new(base);
        let mut forked = base.fork("job");
        forked.set("y", "child");
        assert_eq!(forked.get("x"), Some("parent"));
        assert_eq!(forked.get("y"), Some("child"));
    }

    #[test]
    fn test_defaults_present() {
        let config = Configuration::new();
        assert_eq!(config.get_u64("rheem.profiler.ga.maxgenerations", 0), 5000);
        assert!(!config.get_bool("rheem.core.debug.skipexecution", true));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rheem.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[rheem.core.log]\nenabled = true\nexecutions = \"/tmp/log.json\"").unwrap();
        drop(file);

        let config = Configuration::load_from_file(&path).unwrap();
        assert!(config.get_bool("rheem.core.log.enabled", false));
        assert_eq!(
            config.get("rheem.core.log.executions"),
            Some("/tmp/log.json")
        );
    }
}
