use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

const ENV_PREFIX: &str = "SITUATION_";

#[derive(Debug, Clone)]
struct Entry {
    default: String,
    usage: String,
}

/// Reflection-free layered option binder. Modules declare their options once
/// with `define`; lookups resolve flag > environment > YAML file > default.
/// Keys are dotted, `module.option`.
#[derive(Debug, Default)]
pub struct Config {
    defaults: BTreeMap<String, Entry>,
    file: HashMap<String, String>,
    flags: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Declares an option with its built-in default and usage line.
    pub fn define(&mut self, key: &str, default: impl ToString, usage: &str) {
        self.defaults.insert(
            key.to_string(),
            Entry {
                default: default.to_string(),
                usage: usage.to_string(),
            },
        );
    }

    /// Loads a YAML document of the form `module: {option: value}` (nested)
    /// or `module.option: value` (flat).
    pub fn load_yaml(&mut self, text: &str) -> Result<()> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(text).context("invalid YAML config")?;
        let serde_yaml::Value::Mapping(map) = doc else {
            return Ok(());
        };
        for (key, value) in map {
            let Some(key) = key.as_str() else { continue };
            match value {
                serde_yaml::Value::Mapping(inner) => {
                    for (sub, v) in inner {
                        if let (Some(sub), Some(v)) = (sub.as_str(), scalar(&v)) {
                            self.file.insert(format!("{key}.{sub}"), v);
                        }
                    }
                }
                other => {
                    if let Some(v) = scalar(&other) {
                        self.file.insert(key.to_string(), v);
                    }
                }
            }
        }
        Ok(())
    }

    /// CLI override, highest precedence.
    pub fn set_flag(&mut self, key: &str, value: &str) {
        self.flags.insert(key.to_string(), value.to_string());
    }

    fn raw(&self, key: &str) -> Option<String> {
        if let Some(v) = self.flags.get(key) {
            return Some(v.clone());
        }
        let env_key = format!(
            "{ENV_PREFIX}{}",
            key.to_ascii_uppercase().replace(['.', '-'], "_")
        );
        if let Ok(v) = std::env::var(env_key) {
            return Some(v);
        }
        if let Some(v) = self.file.get(key) {
            return Some(v.clone());
        }
        self.defaults.get(key).map(|e| e.default.clone())
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self
            .raw(key)
            .ok_or_else(|| anyhow!("unknown option: {key}"))?;
        raw.parse::<T>()
            .map_err(|e| anyhow!("invalid value {raw:?} for {key}: {e}"))
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.raw(key).ok_or_else(|| anyhow!("unknown option: {key}"))
    }

    /// Built-in defaults rendered as nested YAML, one `# usage` line each.
    pub fn defaults_yaml(&self) -> String {
        let mut out = String::new();
        let mut last_section = "";
        for (key, entry) in &self.defaults {
            let (section, option) = key.split_once('.').unwrap_or(("", key.as_str()));
            if section != last_section {
                if !last_section.is_empty() || !out.is_empty() {
                    out.push('\n');
                }
                if !section.is_empty() {
                    out.push_str(&format!("{section}:\n"));
                }
                last_section = section;
            }
            let indent = if section.is_empty() { "" } else { "  " };
            out.push_str(&format!(
                "{indent}# {}\n{indent}{option}: {}\n",
                entry.usage, entry.default
            ));
        }
        out
    }
}

fn scalar(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_when_nothing_overrides() {
        let mut cfg = Config::new();
        cfg.define("snmp.community", "public", "SNMP community string");
        cfg.define("snmp.timeout-ms", 1000, "SNMP request timeout");
        assert_eq!(cfg.get_string("snmp.community").unwrap(), "public");
        assert_eq!(cfg.get::<u64>("snmp.timeout-ms").unwrap(), 1000);
        assert!(cfg.get_string("snmp.port").is_err());
    }

    #[test]
    fn precedence_flag_over_file_over_default() {
        let mut cfg = Config::new();
        cfg.define("ping.width", 64, "ping worker pool width");
        cfg.load_yaml("ping:\n  width: 32\n").unwrap();
        assert_eq!(cfg.get::<usize>("ping.width").unwrap(), 32);
        cfg.set_flag("ping.width", "8");
        assert_eq!(cfg.get::<usize>("ping.width").unwrap(), 8);
    }

    #[test]
    fn flat_yaml_keys_also_work() {
        let mut cfg = Config::new();
        cfg.define("store", "situation.db", "store DSN");
        cfg.load_yaml("store: /tmp/inventory.db\n").unwrap();
        assert_eq!(cfg.get_string("store").unwrap(), "/tmp/inventory.db");
    }

    #[test]
    fn defaults_yaml_groups_by_section() {
        let mut cfg = Config::new();
        cfg.define("snmp.community", "public", "SNMP community string");
        cfg.define("snmp.port", 161, "SNMP agent port");
        let text = cfg.defaults_yaml();
        assert!(text.contains("snmp:\n"));
        assert!(text.contains("  community: public"));
        assert!(text.contains("  port: 161"));
    }

    #[test]
    fn invalid_values_report_the_key() {
        let mut cfg = Config::new();
        cfg.define("ping.width", 64, "ping worker pool width");
        cfg.set_flag("ping.width", "lots");
        let err = cfg.get::<usize>("ping.width").unwrap_err();
        assert!(format!("{err}").contains("ping.width"));
    }
}
