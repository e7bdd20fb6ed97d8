//! Minimal reader for the operator-managed `KEY=value` config file.
//!
//! The format is the classic sysconfig shape: one assignment per line,
//! `#` comments, optional single or double quotes around the value.

use std::collections::HashMap;
use std::io;
use std::path::Path;

#[derive(Debug, Default)]
pub struct Sysconfig {
    values: HashMap<String, String>,
}

impl Sysconfig {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            values.insert(key.trim().to_string(), unquote(value.trim()).to_string());
        }
        Sysconfig { values }
    }

    /// The value of `key`, with empty values treated as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_int<T: std::str::FromStr>(&self, key: &str) -> Option<Result<T, T::Err>> {
        self.get(key).map(str::parse)
    }

    /// Truthy values are `yes`, `true` and `1`.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("yes") | Some("true") | Some("1"))
    }

    /// Whitespace-separated list, e.g. `KMIP_SERVER_ADDRS="a:1 b:2"`.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

// ── Tests ─────────────────────────────────────────────────────────────
