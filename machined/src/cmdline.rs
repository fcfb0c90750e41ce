//! Kernel command-line lookup.

use crate::constants::{cmdline as keys, paths};
use machined_shared::MachinedResult;
use std::fmt;
use std::path::Path;

/// Parsed kernel command line. Keys may repeat; lookups return the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmdline {
    params: Vec<(String, Option<String>)>,
}

impl Cmdline {
    pub fn parse(line: &str) -> Self {
        let params = line
            .split_whitespace()
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.trim_matches('"').to_string())),
                None => (token.to_string(), None),
            })
            .collect();
        Self { params }
    }

    /// Read `/proc/cmdline`.
    pub fn read() -> MachinedResult<Self> {
        Self::read_from(paths::PROC_CMDLINE)
    }

    pub fn read_from(path: impl AsRef<Path>) -> MachinedResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::parse(&contents))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k == key)
    }

    /// Whether `token` is present. `key=value` tokens must match the value;
    /// bare tokens match a key with or without a value.
    pub fn contains(&self, token: &str) -> bool {
        match token.split_once('=') {
            Some((key, value)) => self.get(key) == Some(value),
            None => self.has_key(token),
        }
    }

    /// Append a parameter unless the key is already present.
    pub fn append(&mut self, key: &str, value: Option<&str>) {
        if !self.has_key(key) {
            self.params
                .push((key.to_string(), value.map(str::to_string)));
        }
    }

    /// Platform name; the `PLATFORM` environment variable takes precedence.
    pub fn platform(&self) -> Option<String> {
        std::env::var(keys::PLATFORM_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| self.get(keys::PLATFORM).map(str::to_string))
    }

    pub fn config_url(&self) -> Option<&str> {
        self.get(keys::CONFIG)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.get(keys::HOSTNAME)
    }

    pub fn shutdown(&self) -> Option<&str> {
        self.get(keys::SHUTDOWN)
    }

    /// Static network configuration disables early DHCP discovery.
    pub fn has_static_ip(&self) -> bool {
        self.has_key(keys::IP)
    }

    /// `panic=0`: a failed init waits for a signal instead of rebooting.
    pub fn panic_disabled(&self) -> bool {
        self.get(keys::PANIC) == Some("0")
    }

    /// Parameters as individual `key[=value]` strings.
    pub fn to_args(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{}={}", k, v),
                None => k.clone(),
            })
            .collect()
    }
}

impl fmt::Display for Cmdline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}
