// Copyright 2026 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Runtime configuration, materialised once at startup from the environment
//! variables the cache client exports before spawning the helper.

use thiserror::Error;

pub const ENV_IPC_ENDPOINT: &str = "CRSH_IPC_ENDPOINT";
pub const ENV_URL: &str = "CRSH_URL";
pub const ENV_IDLE_TIMEOUT: &str = "CRSH_IDLE_TIMEOUT";
pub const ENV_NUM_ATTR: &str = "CRSH_NUM_ATTR";
pub const ENV_LOG_FILE: &str = "CRSH_LOGFILE";

/// Rule mapping a hex key to the URL suffix under the origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UrlLayout {
    /// `origin/ab/cdef` - first two hex characters form a subdirectory
    Subdirs,
    /// `origin/abcdef`
    Flat,
    /// `origin/ac/` followed by a 64-character hex string
    Bazel,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub ipc_endpoint: String,
    pub url: String,
    pub idle_timeout_seconds: u64,
    pub bearer_token: Option<String>,
    pub layout: UrlLayout,
    pub headers: Vec<(String, String)>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(String),
    #[error("{0} must be a non-negative integer")]
    InvalidInteger(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ipc_endpoint = lookup(ENV_IPC_ENDPOINT)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::Missing(ENV_IPC_ENDPOINT.to_string()))?;

        let url = lookup(ENV_URL)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::Missing(ENV_URL.to_string()))?;

        let idle_timeout_seconds = match lookup(ENV_IDLE_TIMEOUT).filter(|v| !v.is_empty()) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidInteger(ENV_IDLE_TIMEOUT.to_string()))?,
            None => 0,
        };

        let num_attr: usize = match lookup(ENV_NUM_ATTR).filter(|v| !v.is_empty()) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidInteger(ENV_NUM_ATTR.to_string()))?,
            None => 0,
        };

        let mut config = Config {
            ipc_endpoint: endpoint_path(&ipc_endpoint),
            url,
            idle_timeout_seconds,
            bearer_token: None,
            layout: UrlLayout::Subdirs,
            headers: Vec::new(),
        };

        for i in 0..num_attr {
            let key_var = format!("CRSH_ATTR_KEY_{}", i);
            let value_var = format!("CRSH_ATTR_VALUE_{}", i);
            let key = lookup(&key_var).ok_or(ConfigError::Missing(key_var))?;
            let value = lookup(&value_var).ok_or(ConfigError::Missing(value_var))?;

            match key.as_str() {
                "bearer-token" => config.bearer_token = Some(value),
                "layout" => config.layout = parse_layout(&value),
                "header" => {
                    // the first '=' splits name from value; entries without
                    // one are ignored
                    if let Some(pos) = value.find('=') {
                        config
                            .headers
                            .push((value[..pos].to_string(), value[pos + 1..].to_string()));
                    }
                }
                _ => {}
            }
        }

        Ok(config)
    }
}

fn parse_layout(value: &str) -> UrlLayout {
    match value {
        "bazel" => UrlLayout::Bazel,
        "flat" => UrlLayout::Flat,
        _ => UrlLayout::Subdirs,
    }
}

// Named pipes live in the pipe namespace; everywhere else the endpoint is a
// filesystem path used verbatim.
#[cfg(windows)]
fn endpoint_path(name: &str) -> String {
    format!(r"\\.\pipe\{}", name)
}

#[cfg(not(windows))]
fn endpoint_path(name: &str) -> String {
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn minimal() {
        let config = parse(&[
            ("CRSH_IPC_ENDPOINT", "/tmp/helper.sock"),
            ("CRSH_URL", "https://c.example/"),
        ])
        .unwrap();
        assert_eq!(config.url, "https://c.example/");
        assert_eq!(config.idle_timeout_seconds, 0);
        assert_eq!(config.layout, UrlLayout::Subdirs);
        assert!(config.bearer_token.is_none());
        assert!(config.headers.is_empty());
    }

    #[test]
    fn missing_endpoint() {
        assert!(matches!(
            parse(&[("CRSH_URL", "https://c.example/")]),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn empty_url_is_unset() {
        assert!(matches!(
            parse(&[("CRSH_IPC_ENDPOINT", "/tmp/x"), ("CRSH_URL", "")]),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn idle_timeout() {
        let config = parse(&[
            ("CRSH_IPC_ENDPOINT", "/tmp/x"),
            ("CRSH_URL", "https://c.example/"),
            ("CRSH_IDLE_TIMEOUT", "30"),
        ])
        .unwrap();
        assert_eq!(config.idle_timeout_seconds, 30);
    }

    #[test]
    fn malformed_idle_timeout() {
        assert!(matches!(
            parse(&[
                ("CRSH_IPC_ENDPOINT", "/tmp/x"),
                ("CRSH_URL", "https://c.example/"),
                ("CRSH_IDLE_TIMEOUT", "soon"),
            ]),
            Err(ConfigError::InvalidInteger(_))
        ));
    }

    #[test]
    fn attributes() {
        let config = parse(&[
            ("CRSH_IPC_ENDPOINT", "/tmp/x"),
            ("CRSH_URL", "https://c.example/"),
            ("CRSH_NUM_ATTR", "4"),
            ("CRSH_ATTR_KEY_0", "bearer-token"),
            ("CRSH_ATTR_VALUE_0", "secret"),
            ("CRSH_ATTR_KEY_1", "layout"),
            ("CRSH_ATTR_VALUE_1", "bazel"),
            ("CRSH_ATTR_KEY_2", "header"),
            ("CRSH_ATTR_VALUE_2", "X-Tenant=alpha"),
            ("CRSH_ATTR_KEY_3", "header"),
            ("CRSH_ATTR_VALUE_3", "X-Trace=a=b"),
        ])
        .unwrap();
        assert_eq!(config.bearer_token.as_deref(), Some("secret"));
        assert_eq!(config.layout, UrlLayout::Bazel);
        assert_eq!(
            config.headers,
            vec![
                ("X-Tenant".to_string(), "alpha".to_string()),
                ("X-Trace".to_string(), "a=b".to_string()),
            ]
        );
    }

    #[test]
    fn header_without_separator_is_ignored() {
        let config = parse(&[
            ("CRSH_IPC_ENDPOINT", "/tmp/x"),
            ("CRSH_URL", "https://c.example/"),
            ("CRSH_NUM_ATTR", "1"),
            ("CRSH_ATTR_KEY_0", "header"),
            ("CRSH_ATTR_VALUE_0", "not-a-header"),
        ])
        .unwrap();
        assert!(config.headers.is_empty());
    }

    #[test]
    fn unknown_attribute_is_ignored() {
        let config = parse(&[
            ("CRSH_IPC_ENDPOINT", "/tmp/x"),
            ("CRSH_URL", "https://c.example/"),
            ("CRSH_NUM_ATTR", "1"),
            ("CRSH_ATTR_KEY_0", "compression"),
            ("CRSH_ATTR_VALUE_0", "zstd"),
        ])
        .unwrap();
        assert!(config.bearer_token.is_none());
        assert!(config.headers.is_empty());
    }

    #[test]
    fn missing_attribute_value() {
        assert!(matches!(
            parse(&[
                ("CRSH_IPC_ENDPOINT", "/tmp/x"),
                ("CRSH_URL", "https://c.example/"),
                ("CRSH_NUM_ATTR", "1"),
                ("CRSH_ATTR_KEY_0", "layout"),
            ]),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn unknown_layout_falls_back_to_subdirs() {
        let config = parse(&[
            ("CRSH_IPC_ENDPOINT", "/tmp/x"),
            ("CRSH_URL", "https://c.example/"),
            ("CRSH_NUM_ATTR", "1"),
            ("CRSH_ATTR_KEY_0", "layout"),
            ("CRSH_ATTR_VALUE_0", "pyramid"),
        ])
        .unwrap();
        assert_eq!(config.layout, UrlLayout::Subdirs);
    }
}
