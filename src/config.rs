use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10; Mobile) AppleWebKit/537.36";

/// Resolver settings. Loaded from TOML, then overridden by `VODSOURCE_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub http_timeout_secs: u64,
    /// Candidate links tried from a scraped HTML page.
    pub max_html_candidates: usize,
    /// Nesting limit for HTML / redirect fallbacks during identification.
    pub max_fallback_depth: usize,
    pub spider_cache_dir: Option<PathBuf>,
    pub spider: SpiderSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpiderSettings {
    /// Hosts spiders may return URLs for. `None` allows everything; an empty
    /// list disables the spider.
    pub allowed_hosts: Option<Vec<String>>,
    pub call_timeout_ms: u64,
    pub memory_limit_mb: usize,
}

impl Default for SpiderSettings {
    fn default() -> Self {
        Self { allowed_hosts: None, call_timeout_ms: 15_000, memory_limit_mb: 64 }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept: "*/*".to_string(),
            accept_language: "zh-CN,zh;q=0.9".to_string(),
            http_timeout_secs: 15,
            max_html_candidates: 10,
            max_fallback_depth: 3,
            spider_cache_dir: None,
            spider: SpiderSettings::default(),
        }
    }
}

impl ResolverConfig {
    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: ResolverConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg.with_env_overrides())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(ua) = std::env::var("VODSOURCE_USER_AGENT") {
            if !ua.trim().is_empty() { self.user_agent = ua; }
        }
        if let Some(secs) = std::env::var("VODSOURCE_HTTP_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()) {
            self.http_timeout_secs = secs;
        }
        if let Ok(dir) = std::env::var("VODSOURCE_SPIDER_CACHE_DIR") {
            if !dir.trim().is_empty() { self.spider_cache_dir = Some(PathBuf::from(dir)); }
        }
        self
    }

    /// Explicit cache dir, else the platform cache dir, else a temp dir.
    pub fn spider_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.spider_cache_dir { return dir.clone(); }
        directories::ProjectDirs::from("dev", "vodsource", "vodsource")
            .map(|d| d.cache_dir().join("spiders"))
            .unwrap_or_else(|| std::env::temp_dir().join("vodsource-spiders"))
    }
}
