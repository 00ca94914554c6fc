use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::config::SpiderSettings;

/// Limits applied to one spider. Starts from the resolver's `[spider]`
/// settings; a `<artifact>.toml` next to a cached artifact may override them.
#[derive(Debug, Deserialize, Clone, Default)]
pub(crate) struct PluginConfig {
    #[serde(default)]
    pub(crate) allowed_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub(crate) rate_limit_ms: Option<u64>,
    #[serde(default)]
    pub(crate) call_timeout_ms: Option<u64>,
    #[serde(default)]
    pub(crate) memory_limit_mb: Option<usize>,
}

impl PluginConfig {
    pub(crate) fn from_settings(s: &SpiderSettings) -> Self {
        Self {
            allowed_hosts: s.allowed_hosts.clone(),
            rate_limit_ms: None,
            call_timeout_ms: Some(s.call_timeout_ms),
            memory_limit_mb: Some(s.memory_limit_mb),
        }
        .normalized()
    }

    /// Fields present in `path` replace ours; a missing or bad file changes nothing.
    pub(crate) fn with_override_file(self, path: &Path) -> Self {
        let Some(o) = std::fs::read_to_string(path).ok().and_then(|s| toml::from_str::<PluginConfig>(&s).ok()) else {
            return self;
        };
        Self {
            allowed_hosts: o.allowed_hosts.or(self.allowed_hosts),
            rate_limit_ms: o.rate_limit_ms.or(self.rate_limit_ms),
            call_timeout_ms: o.call_timeout_ms.or(self.call_timeout_ms),
            memory_limit_mb: o.memory_limit_mb.or(self.memory_limit_mb),
        }
        .normalized()
    }

    fn normalized(mut self) -> Self {
        self.allowed_hosts = self.allowed_hosts.map(|v|
            v.iter().map(|h| h.trim().to_ascii_lowercase()).filter(|h| !h.is_empty()).collect()
        );
        self
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.unwrap_or(15_000))
    }

    pub(crate) fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms.unwrap_or(0))
    }

    pub(crate) fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mb.unwrap_or(64).saturating_mul(1024 * 1024)
    }

    /// An explicitly empty allow-list switches the spider off.
    pub(crate) fn disabled(&self) -> bool {
        matches!(&self.allowed_hosts, Some(v) if v.is_empty())
    }

    pub(crate) fn url_allowed(&self, url: &str) -> bool {
        match &self.allowed_hosts {
            None => true,
            Some(list) => {
                if list.is_empty() { return false; }
                let Ok(parsed) = Url::parse(url) else { return false; };
                match parsed.scheme() { "http" | "https" => {}, _ => return false }
                let Some(host) = parsed.host_str() else { return false; };
                let host = host.to_ascii_lowercase();
                list.iter().any(|allowed| {
                    let a = allowed.as_str();
                    if let Some(stripped) = a.strip_prefix("*.") {
                        host == stripped || host.ends_with(&format!(".{}", stripped))
                    } else { host == a }
                })
            }
        }
    }
}
