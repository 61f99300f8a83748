// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;

/// Snapshot of environment variables, optionally scoped to a prefix.
///
/// Taking a snapshot keeps lookups deterministic and lets tests supply
/// variables without touching the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvLoader {
    prefix: Option<String>,
    vars: HashMap<String, String>,
}

impl EnvLoader {
    /// Snapshot the process environment
    pub fn new(prefix: Option<String>) -> Self {
        Self::from_vars(prefix, env::vars())
    }

    /// Build from explicit key/value pairs
    pub fn from_vars<I, K, V>(prefix: Option<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix,
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// All prefixed variables, prefix stripped and keys lowercased
    pub fn load(&self) -> Result<HashMap<String, String>> {
        let Some(prefix) = &self.prefix else {
            return Ok(self
                .vars
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect());
        };

        Ok(self
            .vars
            .iter()
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(prefix.as_str())?.strip_prefix('_')?;
                Some((rest.to_lowercase(), value.clone()))
            })
            .collect())
    }

    /// Load a specific prefixed variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, key.to_uppercase()),
            None => key.to_uppercase(),
        };

        self.vars
            .get(&full_key)
            .cloned()
            .ok_or(ConfigError::KeyNotFound(full_key))
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }

    /// Unprefixed lookup; empty values count as unset
    pub fn raw(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
