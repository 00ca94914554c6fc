use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use vodsource::config::ResolverConfig;
use vodsource::http::{Headers, HttpClient};
use vodsource::prelude::*;

#[derive(Default)]
struct Routes {
    bodies: HashMap<String, Vec<u8>>,
    hits: Mutex<Vec<String>>,
}

impl Routes {
    fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(url.to_string(), body.into());
        self
    }

    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for Routes {
    async fn get_bytes(&self, url: &str, _headers: &Headers) -> Result<Vec<u8>> {
        self.hits.lock().unwrap().push(url.to_string());
        self.bodies.get(url).cloned().ok_or_else(|| anyhow!("404 {}", url))
    }

    async fn post_text(&self, url: &str, _body: &str, headers: &Headers) -> Result<String> {
        self.get_text(url, headers).await
    }
}

fn source(routes: Routes) -> (VodSource, Arc<Routes>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let routes = Arc::new(routes);
    let config = ResolverConfig { spider_cache_dir: Some(tmp.path().to_path_buf()), ..Default::default() };
    (VodSource::with_http(config, routes.clone()), routes, tmp)
}

const MANIFEST: &str = r#"{
    "spider": "https://example.com/spider.jar",
    "sites": [
        {"key": "api", "name": "Example", "api": "https://example.com/api", "type": 1}
    ]
}"#;

const API_BODY: &str = r#"{"code":1,"list":[
    {"vod_id":101,"vod_name":"Movie A","vod_pic":"https://img.example.com/a.jpg","vod_remarks":"HD",
     "vod_play_from":"line1","vod_play_url":"Ep1$https://cdn.example.com/a/1.m3u8#Ep2$https://cdn.example.com/a/2.m3u8"}
]}"#;

#[tokio::test]
async fn manifest_to_direct_api_listing() {
    let routes = Routes::default()
        .with("https://example.com/config.json", MANIFEST)
        .with("https://example.com/api", API_BODY);
    let (vs, routes, _tmp) = source(routes);

    let cfg = vs.identify("https://example.com/config.json", "").await.unwrap();
    assert!(matches!(cfg, SourceConfig::JavaScript(_)));

    let site = vs.resolve_site(&cfg, None, None).unwrap();
    assert_eq!(site.kind, 1);
    assert_eq!(site.strategy(), Strategy::DirectApi { dialect: 1 });

    let items = vs.home_videos(&site).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "Movie A");
    assert_eq!(items[0].vod_id, "101");
    let sources = items[0].play_sources();
    assert_eq!(sources[0].flag, "line1");
    assert_eq!(sources[0].episodes.len(), 2);
    assert_eq!(items[0].first_play_url().as_deref(), Some("https://cdn.example.com/a/1.m3u8"));

    assert_eq!(routes.hits(), vec!["https://example.com/config.json".to_string(), "https://example.com/api".to_string()]);
}

#[tokio::test]
async fn direct_video_needs_no_fetch() {
    let (vs, routes, _tmp) = source(Routes::default());
    let cfg = vs.identify("https://cdn.example.com/movie.mp4", "Movie").await.unwrap();
    match &cfg {
        SourceConfig::Vod(v) => assert_eq!(v.url, "https://cdn.example.com/movie.mp4"),
        other => panic!("expected vod, got {:?}", other),
    }
    assert!(vs.resolve_site(&cfg, None, None).is_none());

    let items = vs.resolve("https://cdn.example.com/movie.mp4", "Movie").await;
    assert_eq!(items[0].url, "https://cdn.example.com/movie.mp4");
    assert!(routes.hits().is_empty());
}

#[tokio::test]
async fn landing_page_links_to_manifest() {
    let page = r#"<html><body><a href="/files/tv.json">download config</a></body></html>"#;
    let routes = Routes::default()
        .with("https://share.example.com/", page)
        .with("https://share.example.com/files/tv.json", MANIFEST)
        .with("https://example.com/api", API_BODY);
    let (vs, _routes, _tmp) = source(routes);

    let items = vs.resolve("https://share.example.com/", "").await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].note, "HD");
}

#[tokio::test]
async fn pasted_manifest_lists_all_sites() {
    let text = r#"{"sites":[
        {"key":"a","api":"https://example.com/api","type":1},
        {"key":"b","api":"csp_Douban"},
        {"key":"c","api":"https://example.com/lib/drpy.js"}
    ]}"#;
    let (vs, _routes, _tmp) = source(Routes::default());
    assert!(vs.validate_config(text));
    let cfg = vs.identify(text, "Pasted").await.unwrap();
    let sites = vs.list_sites(&cfg);
    let strategies: Vec<Strategy> = sites.iter().map(Site::strategy).collect();
    assert_eq!(
        strategies,
        vec![
            Strategy::DirectApi { dialect: 1 },
            Strategy::Spider(SpiderKind::Plugin),
            Strategy::Spider(SpiderKind::Script),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn script_site_end_to_end() {
    let script = r#"
        var host = '';
        function init(ext) { host = ext; }
        function home() {
            var html = request(host + '/index.html');
            var list = pdfa(html, '.item').map(function (it) {
                return { vod_id: pdfh(it, 'a&&href'), vod_name: pdfh(it, 'a&&Text') };
            });
            return JSON.stringify({ list: list });
        }
    "#;
    let manifest = r#"{"sites":[{"key":"js","name":"JS","api":"https://example.com/site.js","ext":"https://example.com"}]}"#;
    let html = r#"<div class="item"><a href="/v/1">One</a></div><div class="item"><a href="/v/2">Two</a></div>"#;
    let routes = Routes::default()
        .with("https://example.com/tv.json", manifest)
        .with("https://example.com/site.js", script)
        .with("https://example.com/index.html", html);
    let (vs, _routes, _tmp) = source(routes);

    let cfg = vs.identify("https://example.com/tv.json", "").await.unwrap();
    let site = vs.resolve_site(&cfg, None, None).unwrap();
    assert_eq!(site.strategy(), Strategy::Spider(SpiderKind::Script));
    let items = vs.try_home_videos(&site).await.unwrap();
    let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["One", "Two"]);
    assert_eq!(items[1].vod_id, "/v/2");
}

#[tokio::test]
async fn unreachable_sources_are_empty_not_errors() {
    let (vs, _routes, _tmp) = source(Routes::default());
    assert!(vs.identify("https://nowhere.example.com/config.json", "").await.is_none());
    let site = Site {
        key: "down".into(),
        name: "down".into(),
        api: "https://nowhere.example.com/api".into(),
        ext: String::new(),
        jar: String::new(),
        kind: 1,
        timeout: 5,
        searchable: true,
        hide: false,
        script: None,
    };
    assert!(vs.home_videos(&site).await.is_empty());
    assert!(matches!(vs.try_home_videos(&site).await, Err(RetrieveError::Network(_))));
}

#[tokio::test]
async fn live_list_plays_directly_with_its_headers() {
    let live = r#"{"url":"https://cdn.example.com/tv.m3u8","name":"TV","type":"live","ua":"UA1","referer":"https://tv.example.com/"}"#;
    let (vs, _routes, _tmp) = source(Routes::default().with("https://example.com/live.json", live));

    let cfg = vs.identify("https://example.com/live.json", "").await.unwrap();
    assert!(matches!(cfg, SourceConfig::Live(_)));
    let headers = vs.play_headers(&cfg);
    assert_eq!(headers.get("User-Agent").map(String::as_str), Some("UA1"));
    assert_eq!(headers.get("Referer").map(String::as_str), Some("https://tv.example.com/"));

    let items = vs.resolve("https://example.com/live.json", "").await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].url, "https://cdn.example.com/tv.m3u8");
    assert_eq!(items[0].name, "TV");
    assert_eq!(items[0].headers, headers);
}
