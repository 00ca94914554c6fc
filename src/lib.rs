pub mod config;
pub mod error;
pub mod http;
pub mod identify;
pub mod manifest;
pub mod plugins;
pub mod result;
pub mod retrieve;
pub mod site;
pub mod types;
pub mod url_util;

// --- Library API for embedding ---

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::config::{ResolverConfig, SpiderSettings};
    pub use crate::error::RetrieveError;
    pub use crate::http::{HttpClient, ReqwestClient};
    pub use crate::types::{
        Episode, JavaScriptConfig, LiveConfig, PlaySource, PlayTarget, Site, SourceConfig, SourceType, SpiderKind, Strategy, VideoItem,
        VodConfig,
    };
    pub use crate::VodSource;
}

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::config::ResolverConfig;
use crate::error::RetrieveError;
use crate::http::{HttpClient, ReqwestClient};
use crate::identify::ConfigIdentifier;
use crate::manifest::ManifestFetcher;
use crate::plugins::SpiderLoader;
use crate::retrieve::ContentRetriever;
use crate::site::SiteResolver;
use crate::types::{PlayTarget, SourceConfig, Site, VideoItem};
use crate::url_util::is_direct_video_url;

/// The whole pipeline behind one handle: identify input, pick a site,
/// retrieve its content.
pub struct VodSource {
    config: Arc<ResolverConfig>,
    identifier: ConfigIdentifier,
    resolver: SiteResolver,
    loader: Arc<SpiderLoader>,
    retriever: ContentRetriever,
}

impl VodSource {
    /// Build with the default `reqwest` client.
    pub fn new(config: ResolverConfig) -> Result<Self> {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(&config)?);
        Ok(Self::with_http(config, http))
    }

    /// Build around any [`HttpClient`]; used by tests and embedders with
    /// their own transport.
    pub fn with_http(config: ResolverConfig, http: Arc<dyn HttpClient>) -> Self {
        let config = Arc::new(config);
        let fetcher = Arc::new(ManifestFetcher::new(http.clone(), config.clone()));
        let loader = Arc::new(SpiderLoader::new(http.clone(), config.clone()));
        Self {
            identifier: ConfigIdentifier::new(fetcher, config.clone()),
            resolver: SiteResolver::new(),
            retriever: ContentRetriever::new(http, config.clone(), loader.clone()),
            loader,
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig { &self.config }

    pub async fn identify(&self, input: &str, name: &str) -> Option<SourceConfig> {
        self.identifier.identify(input, name).await
    }

    pub fn validate_config(&self, text: &str) -> bool {
        identify::validate_config(text)
    }

    /// The site a config stands for. Vod endpoints become a JSON API site;
    /// direct video files and live lists have no site.
    pub fn resolve_site(&self, config: &SourceConfig, spider_url: Option<&str>, spider_class_name: Option<&str>) -> Option<Site> {
        match config {
            SourceConfig::JavaScript(js) => self.resolver.resolve(js, spider_url, spider_class_name),
            SourceConfig::Vod(v) if !is_direct_video_url(&v.url) => Some(Site {
                key: "vod".to_string(),
                name: v.name.clone(),
                api: v.url.clone(),
                ext: String::new(),
                jar: String::new(),
                kind: 1,
                timeout: v.timeout,
                searchable: v.searchable,
                hide: false,
                script: None,
            }),
            _ => None,
        }
    }

    pub fn list_sites(&self, config: &SourceConfig) -> Vec<Site> {
        match config {
            SourceConfig::JavaScript(js) => self.resolver.list_sites(js),
            other => self.resolve_site(other, None, None).into_iter().collect(),
        }
    }

    pub async fn home_videos(&self, site: &Site) -> Vec<VideoItem> {
        self.retriever.retrieve(site).await
    }

    pub async fn try_home_videos(&self, site: &Site) -> Result<Vec<VideoItem>, RetrieveError> {
        self.retriever.try_retrieve(site).await
    }

    pub async fn search(&self, site: &Site, keyword: &str) -> Result<Vec<VideoItem>, RetrieveError> {
        self.retriever.search(site, keyword).await
    }

    pub async fn play_url(&self, site: &Site, flag: &str, id: &str) -> Option<PlayTarget> {
        self.retriever.play(site, flag, id).await
    }

    /// Headers a player needs for a config that plays directly: the channel
    /// headers of a live list, or the suffixes of a direct video link.
    pub fn play_headers(&self, config: &SourceConfig) -> HashMap<String, String> {
        match config {
            SourceConfig::Live(l) => {
                let mut headers = PlayTarget::parse(&l.url).headers;
                headers.extend(l.headers());
                headers
            }
            SourceConfig::Vod(v) => PlayTarget::parse(&v.url).headers,
            SourceConfig::JavaScript(_) => HashMap::new(),
        }
    }

    /// Input to home content in one call. A direct video link or a live
    /// list comes back as a single item pointing at itself.
    pub async fn resolve(&self, input: &str, name: &str) -> Vec<VideoItem> {
        let Some(config) = self.identify(input, name).await else { return Vec::new(); };
        match &config {
            SourceConfig::Vod(v) if is_direct_video_url(&v.url) => {
                return vec![self.direct_item(&config, &v.name)];
            }
            SourceConfig::Live(l) => {
                debug!("{} is a live list; playing it directly", input);
                return vec![self.direct_item(&config, &l.name)];
            }
            _ => {}
        }
        match self.resolve_site(&config, None, None) {
            Some(site) => {
                debug!("resolved {} to site {}", input, site.key);
                self.home_videos(&site).await
            }
            None => Vec::new(),
        }
    }

    fn direct_item(&self, config: &SourceConfig, name: &str) -> VideoItem {
        let url = PlayTarget::parse(config.url()).url;
        VideoItem {
            id: url.clone(),
            name: name.to_string(),
            url,
            headers: self.play_headers(config),
            ..Default::default()
        }
    }

    /// Drop every downloaded spider artifact.
    pub async fn clear_spider_cache(&self) -> Result<usize> {
        self.loader.cache().clear().await
    }
}
