use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::error::RetrieveError;
use crate::http::{default_headers, HttpClient};
use crate::manifest::parse_json_lenient;
use crate::plugins::{Spider, SpiderLoader};
use crate::result;
use crate::types::{PlayTarget, Site, SpiderKind, Strategy, VideoItem};
use crate::url_util::{fix_header, is_direct_video_url, is_http_url, is_url, parse_url_with_headers, with_query_param};

/// Fetches catalog content for a [`Site`] using the strategy it selects.
pub struct ContentRetriever {
    http: Arc<dyn HttpClient>,
    config: Arc<ResolverConfig>,
    loader: Arc<SpiderLoader>,
}

impl ContentRetriever {
    pub fn new(http: Arc<dyn HttpClient>, config: Arc<ResolverConfig>, loader: Arc<SpiderLoader>) -> Self {
        Self { http, config, loader }
    }

    /// Home listing. Failures are logged and yield an empty list.
    pub async fn retrieve(&self, site: &Site) -> Vec<VideoItem> {
        match self.try_retrieve(site).await {
            Ok(items) => items,
            Err(e) => {
                warn!("retrieving {} failed: {}", site.key, e);
                Vec::new()
            }
        }
    }

    pub async fn try_retrieve(&self, site: &Site) -> Result<Vec<VideoItem>, RetrieveError> {
        let strategy = site.strategy();
        debug!("site {} uses {:?}", site.key, strategy);
        bounded(site, async {
            match strategy {
                Strategy::DirectApi { dialect } => {
                    let body = self.get(&site.api).await?;
                    Ok::<_, RetrieveError>(result::from_type(dialect, &body))
                }
                Strategy::Ext => {
                    let url = with_query_param(ext_base(site), "filter", "true")
                        .ok_or_else(|| RetrieveError::Unsupported(format!("ext site {} has no usable url", site.key)))?;
                    let body = self.get(&url).await?;
                    Ok(result::from_json(&body))
                }
                Strategy::Spider(kind) => self.spider_home(site, kind).await,
            }
        })
        .await
        .map(split_url_headers)
    }

    /// Search one site. Sites marked unsearchable return nothing.
    pub async fn search(&self, site: &Site, keyword: &str) -> Result<Vec<VideoItem>, RetrieveError> {
        if !site.searchable {
            debug!("site {} is not searchable", site.key);
            return Ok(Vec::new());
        }
        bounded(site, async {
            match site.strategy() {
                Strategy::DirectApi { dialect } => {
                    let url = with_query_param(&site.api, "wd", keyword)
                        .ok_or_else(|| RetrieveError::Unsupported(format!("bad api url {}", site.api)))?;
                    Ok::<_, RetrieveError>(result::from_type(dialect, &self.get(&url).await?))
                }
                Strategy::Ext => {
                    let url = with_query_param(ext_base(site), "wd", keyword)
                        .ok_or_else(|| RetrieveError::Unsupported(format!("ext site {} has no usable url", site.key)))?;
                    Ok(result::from_json(&self.get(&url).await?))
                }
                Strategy::Spider(kind) => {
                    let spider = self.start_spider(site, kind).await?;
                    let body = spider.search_content(keyword, false).await.map_err(|e| spider_error(kind, e))?;
                    Ok(strip_disallowed(spider.as_ref(), result::from_json(&body)))
                }
            }
        })
        .await
        .map(split_url_headers)
    }

    /// Resolve a playable URL for episode `id` on play line `flag`.
    ///
    /// Catalog APIs already carry the final URL in the episode id; when the id
    /// is not a URL, a site whose api is itself a video file plays that file.
    pub async fn play(&self, site: &Site, flag: &str, id: &str) -> Option<PlayTarget> {
        let kind = match site.strategy() {
            Strategy::Spider(kind) => kind,
            _ if is_url(id) => return Some(PlayTarget::parse(id)),
            _ if is_direct_video_url(&site.api) => return Some(PlayTarget::parse(&site.api)),
            _ => return None,
        };
        let outcome = bounded(site, async {
            let spider = self.start_spider(site, kind).await?;
            let body = spider.player_content(flag, id, &[]).await.map_err(|e| spider_error(kind, e))?;
            let target = parse_json_lenient(&body).and_then(|v| player_target(&v));
            Ok::<_, RetrieveError>(target.filter(|t| {
                let allowed = spider.url_allowed(&t.url);
                if !allowed { warn!("spider {} returned disallowed url {}", site.key, t.url); }
                allowed
            }))
        })
        .await;
        match outcome {
            Ok(url) => url,
            Err(e) => {
                warn!("play on {} failed: {}", site.key, e);
                None
            }
        }
    }

    async fn get(&self, url: &str) -> Result<String, RetrieveError> {
        if !is_url(url) {
            return Err(RetrieveError::Unsupported(format!("not a url: {}", url)));
        }
        self.http
            .get_text(url, &default_headers(&self.config))
            .await
            .map_err(|e| RetrieveError::Network(format!("{:#}", e)))
    }

    async fn start_spider(&self, site: &Site, kind: SpiderKind) -> Result<Arc<dyn Spider>, RetrieveError> {
        let spider = self.loader.load(site, kind).await.map_err(|e| spider_error(kind, e))?;
        spider.init(&site.ext).await.map_err(|e| spider_error(kind, e))?;
        Ok(spider)
    }

    async fn spider_home(&self, site: &Site, kind: SpiderKind) -> Result<Vec<VideoItem>, RetrieveError> {
        let spider = self.start_spider(site, kind).await?;
        let home = spider.home_content(true).await.map_err(|e| spider_error(kind, e))?;
        let mut items = result::from_json(&home);
        if items.is_empty() {
            debug!("home of {} is empty; asking for home videos", site.key);
            let videos = spider.home_video_content().await.map_err(|e| spider_error(kind, e))?;
            items = result::from_json(&videos);
        }
        Ok(strip_disallowed(spider.as_ref(), items))
    }
}

/// `ext` when it is a URL, else `api`.
fn ext_base(site: &Site) -> &str {
    if is_http_url(site.ext.trim()) { site.ext.trim() } else { site.api.trim() }
}

async fn bounded<T>(site: &Site, fut: impl Future<Output = Result<T, RetrieveError>>) -> Result<T, RetrieveError> {
    let secs = site.timeout.max(1);
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .unwrap_or(Err(RetrieveError::Timeout(secs)))
}

fn spider_error(kind: SpiderKind, e: anyhow::Error) -> RetrieveError {
    match kind {
        SpiderKind::Script => RetrieveError::Script(format!("{:#}", e)),
        _ => RetrieveError::Spider(format!("{:#}", e)),
    }
}

/// `{"url": ..., "header": ...}` from `playerContent`. The header may be an
/// object or its JSON text; URL suffixes win over it.
fn player_target(v: &Value) -> Option<PlayTarget> {
    let raw = v.get("url").and_then(Value::as_str).map(str::trim).filter(|u| !u.is_empty())?;
    let mut target = PlayTarget::parse(raw);
    let header = match v.get("header") {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok(),
        Some(other) => Some(other.clone()),
        None => None,
    };
    if let Some(Value::Object(map)) = header {
        for (k, v) in map {
            let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
            target.headers.entry(fix_header(&k)).or_insert(v);
        }
    }
    Some(target)
}

/// Move header suffixes off item URLs and pictures into their header maps.
fn split_url_headers(mut items: Vec<VideoItem>) -> Vec<VideoItem> {
    for item in &mut items {
        let (url, headers) = parse_url_with_headers(&item.url);
        item.url = url;
        item.headers.extend(headers);
        let (pic, headers) = parse_url_with_headers(&item.pic);
        item.pic = pic;
        item.pic_headers.extend(headers);
    }
    items
}

fn strip_disallowed(spider: &dyn Spider, mut items: Vec<VideoItem>) -> Vec<VideoItem> {
    for item in &mut items {
        if !item.url.is_empty() && !spider.url_allowed(&item.url) {
            debug!("dropping disallowed url {} from {}", item.url, spider.name());
            item.url.clear();
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::fake::FakeHttp;

    fn site(api: &str, kind: i32) -> Site {
        Site {
            key: "k".into(),
            name: "n".into(),
            api: api.into(),
            ext: String::new(),
            jar: String::new(),
            kind,
            timeout: 5,
            searchable: true,
            hide: false,
            script: None,
        }
    }

    fn retriever(http: FakeHttp) -> (ContentRetriever, Arc<FakeHttp>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let http = Arc::new(http);
        let config = Arc::new(ResolverConfig { spider_cache_dir: Some(tmp.path().to_path_buf()), ..Default::default() });
        let loader = Arc::new(SpiderLoader::new(http.clone(), config.clone()));
        (ContentRetriever::new(http.clone(), config, loader), http, tmp)
    }

    #[tokio::test]
    async fn direct_json_api() {
        let (r, http, _tmp) = retriever(FakeHttp::new().route("https://example.com/api", r#"{"code":1,"list":[{"vod_id":7,"vod_name":"Seven"}]}"#));
        let items = r.retrieve(&site("https://example.com/api", 1)).await;
        assert_eq!(items.len(), 1);
        assert_eq!((items[0].vod_id.as_str(), items[0].name.as_str()), ("7", "Seven"));
        assert_eq!(http.requested(), vec!["https://example.com/api".to_string()]);
    }

    #[tokio::test]
    async fn direct_xml_api() {
        let xml = r#"<rss><list><video><id>3</id><name><![CDATA[Three]]></name></video></list></rss>"#;
        let (r, _http, _tmp) = retriever(FakeHttp::new().route("https://example.com/xml", xml));
        let items = r.retrieve(&site("https://example.com/xml", 0)).await;
        assert_eq!(items[0].name, "Three");
    }

    #[tokio::test]
    async fn ext_appends_filter() {
        let (r, http, _tmp) = retriever(FakeHttp::new().route("https://example.com/ext?filter=true", r#"{"list":[{"name":"E"}]}"#));
        let mut s = site("https://example.com/unused", 4);
        s.ext = "https://example.com/ext".into();
        assert_eq!(r.retrieve(&s).await[0].name, "E");
        assert_eq!(http.requested(), vec!["https://example.com/ext?filter=true".to_string()]);
    }

    #[tokio::test]
    async fn failures_collapse_but_try_retrieve_reports() {
        let (r, _http, _tmp) = retriever(FakeHttp::new());
        let s = site("https://example.com/down", 1);
        assert!(r.retrieve(&s).await.is_empty());
        assert!(matches!(r.try_retrieve(&s).await, Err(RetrieveError::Network(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn script_home_falls_back_to_home_videos() {
        let (r, _http, _tmp) = retriever(FakeHttp::new());
        let mut s = site("", 3);
        s.script = Some(r#"
            function home() { return '{"class":[]}'; }
            function homeVod() { return { list: [{ vod_id: 'a', vod_name: 'From homeVod' }] }; }
        "#.into());
        let items = r.try_retrieve(&s).await.unwrap();
        assert_eq!(items[0].name, "From homeVod");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn script_play_and_search() {
        let (r, _http, _tmp) = retriever(FakeHttp::new());
        let mut s = site("", 3);
        s.script = Some(r#"
            function play(flag, id) { return { parse: 0, url: 'https://cdn.example.com/' + flag + '/' + id + '.m3u8' }; }
            function search(key) { return { list: [{ vod_name: key + '!' }] }; }
        "#.into());
        let target = r.play(&s, "hd", "9").await.unwrap();
        assert_eq!(target.url, "https://cdn.example.com/hd/9.m3u8");
        assert!(target.headers.is_empty());
        assert_eq!(r.search(&s, "abc").await.unwrap()[0].name, "abc!");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn script_errors_are_typed() {
        let (r, _http, _tmp) = retriever(FakeHttp::new());
        let mut s = site("", 3);
        s.script = Some("function home() { throw new Error('nope'); }".into());
        assert!(matches!(r.try_retrieve(&s).await, Err(RetrieveError::Script(_))));
    }

    #[tokio::test]
    async fn python_is_empty_and_plugins_need_artifacts() {
        let (r, _http, _tmp) = retriever(FakeHttp::new());
        assert!(r.try_retrieve(&site("https://example.com/s.py", 3)).await.unwrap().is_empty());
        assert!(matches!(r.try_retrieve(&site("csp_Missing", 3)).await, Err(RetrieveError::Spider(_))));
    }

    #[tokio::test]
    async fn direct_api_play_and_unsearchable() {
        let (r, _http, _tmp) = retriever(FakeHttp::new());
        let mut s = site("https://example.com/api", 1);
        let target = r.play(&s, "hd", "https://v.example/1.m3u8@Referer=https://example.com/").await.unwrap();
        assert_eq!(target.url, "https://v.example/1.m3u8");
        assert_eq!(target.headers.get("Referer").map(String::as_str), Some("https://example.com/"));
        assert_eq!(r.play(&s, "hd", "12345").await, None);
        s.searchable = false;
        assert!(r.search(&s, "x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn direct_video_api_is_the_play_fallback() {
        let (r, _http, _tmp) = retriever(FakeHttp::new());
        let s = site("https://cdn.example.com/movie.mp4", 1);
        assert_eq!(r.play(&s, "", "not-a-url").await.map(|t| t.url).as_deref(), Some("https://cdn.example.com/movie.mp4"));
    }

    #[tokio::test]
    async fn item_urls_lose_their_header_suffixes() {
        let body = r#"{"list":[{"vod_id":1,"vod_name":"A","vod_pic":"https://img.example/a.jpg@Referer=https://example.com/",
            "url":"https://v.example/a.m3u8@Headers={\"user-agent\":\"UA\"}"}]}"#;
        let (r, _http, _tmp) = retriever(FakeHttp::new().route("https://example.com/api", body));
        let items = r.try_retrieve(&site("https://example.com/api", 1)).await.unwrap();
        assert_eq!(items[0].pic, "https://img.example/a.jpg");
        assert_eq!(items[0].pic_headers.get("Referer").map(String::as_str), Some("https://example.com/"));
        assert_eq!(items[0].url, "https://v.example/a.m3u8");
        assert_eq!(items[0].headers.get("User-Agent").map(String::as_str), Some("UA"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn player_header_object_is_merged() {
        let (r, _http, _tmp) = retriever(FakeHttp::new());
        let mut s = site("", 3);
        s.script = Some(r#"
            function play(flag, id) {
                return { parse: 0, url: 'https://cdn.example.com/' + id + '.m3u8@Cookie=c=1', header: JSON.stringify({ referer: 'https://r.example/' }) };
            }
        "#.into());
        let target = r.play(&s, "hd", "9").await.unwrap();
        assert_eq!(target.url, "https://cdn.example.com/9.m3u8");
        assert_eq!(target.headers.get("Cookie").map(String::as_str), Some("c=1"));
        assert_eq!(target.headers.get("Referer").map(String::as_str), Some("https://r.example/"));
    }
}
