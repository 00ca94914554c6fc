use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::http::{Headers, HttpClient};
use crate::plugins::config::PluginConfig;
use crate::plugins::spider::Spider;

/// Globals every script sees before its own source runs.
const PRELUDE: &str = r#"
var window = globalThis;
var __out = null;
var __err = null;

function request(url, opt) {
    opt = opt || {};
    var headers = JSON.stringify(opt.headers || {});
    if (String(opt.method || 'GET').toUpperCase() === 'POST') {
        var body = opt.body !== undefined ? opt.body : (opt.data !== undefined ? opt.data : '');
        return __http_post(String(url), typeof body === 'string' ? body : JSON.stringify(body), headers);
    }
    return __http_get(String(url), headers);
}
function post(url, opt) {
    opt = opt || {};
    opt.method = 'POST';
    return request(url, opt);
}
function pdfh(html, rule) { return __pdfh(String(html || ''), String(rule || '')); }
function pdfa(html, rule) { return JSON.parse(__pdfa(String(html || ''), String(rule || ''))); }

var console = {
    log: function () { __log(Array.prototype.slice.call(arguments).map(String).join(' ')); }
};
console.info = console.log;
console.warn = console.log;
console.error = console.log;

function __lookup(names) {
    var spider = globalThis.__JS_SPIDER__;
    for (var i = 0; i < names.length; i++) {
        var n = names[i];
        if (spider && typeof spider[n] === 'function') return spider[n].bind(spider);
        try {
            var f = (0, eval)(n);
            if (typeof f === 'function') return f;
        } catch (e) {}
    }
    return null;
}
function __settle(v) {
    __out = (v === undefined || v === null) ? '' : (typeof v === 'string' ? v : JSON.stringify(v));
}
function __fail(e) {
    __err = (e && e.stack) ? String(e) + '\n' + e.stack : String(e);
}
function __invoke(names, args) {
    try {
        var init = __lookup(['init']);
        var ready = init ? init(__ext) : null;
        Promise.resolve(ready).then(function () {
            var f = __lookup(names);
            return f ? f.apply(null, args) : '';
        }).then(__settle, __fail);
    } catch (e) {
        __fail(e);
    }
}
"#;

/// A JavaScript spider. Every call gets a fresh QuickJS runtime, so scripts
/// keep no state between calls beyond what `init(ext)` rebuilds.
pub struct ScriptSpider {
    name: String,
    source: Arc<String>,
    http: Arc<dyn HttpClient>,
    cfg: PluginConfig,
    user_agent: String,
    ext: Mutex<String>,
}

impl ScriptSpider {
    pub(crate) fn new(name: impl Into<String>, source: impl Into<String>, http: Arc<dyn HttpClient>, cfg: PluginConfig, user_agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(source.into()),
            http,
            cfg,
            user_agent: user_agent.into(),
            ext: Mutex::new(String::new()),
        }
    }

    async fn call(&self, names: &'static [&'static str], args: Value) -> Result<String> {
        if self.cfg.disabled() { return Err(anyhow!("script {} has an empty host allow-list", self.name)); }
        let job = ScriptJob {
            name: self.name.clone(),
            source: self.source.clone(),
            ext: self.ext.lock().map(|e| e.clone()).unwrap_or_default(),
            http: self.http.clone(),
            cfg: self.cfg.clone(),
            user_agent: self.user_agent.clone(),
            handle: Handle::current(),
        };
        let start = Instant::now();
        let out = tokio::task::spawn_blocking(move || job.run(names, &args))
            .await
            .map_err(|e| anyhow!("script task failed: {}", e))?;
        debug!("script {} {:?} finished in {:?}", self.name, names.first(), start.elapsed());
        out
    }
}

/// Everything one blocking evaluation needs, detached from `&self`.
struct ScriptJob {
    name: String,
    source: Arc<String>,
    ext: String,
    http: Arc<dyn HttpClient>,
    cfg: PluginConfig,
    user_agent: String,
    handle: Handle,
}

impl ScriptJob {
    fn run(self, names: &[&str], args: &Value) -> Result<String> {
        let rt = Runtime::new().map_err(|e| anyhow!("creating script runtime: {}", e))?;
        rt.set_memory_limit(self.cfg.memory_limit_bytes());
        let deadline = Instant::now() + self.cfg.call_timeout();
        rt.set_interrupt_handler(Some(Box::new(move || Instant::now() > deadline)));
        let context = Context::full(&rt).map_err(|e| anyhow!("creating script context: {}", e))?;

        let invoke = format!("__invoke({}, {});", serde_json::to_string(names)?, args);
        context.with(|ctx| -> Result<()> {
            self.install_natives(&ctx)?;
            ctx.globals().set("__ext", self.ext.as_str()).map_err(|e| anyhow!("{}", e))?;
            eval_void(&ctx, PRELUDE)?;
            eval_void(&ctx, &self.source)?;
            eval_void(&ctx, &invoke)
        })?;

        while rt.is_job_pending() {
            if Instant::now() > deadline {
                return Err(anyhow!("script {} exceeded {:?}", self.name, self.cfg.call_timeout()));
            }
            if rt.execute_pending_job().is_err() {
                warn!("script {}: pending job raised", self.name);
                break;
            }
        }

        context.with(|ctx| -> Result<String> {
            let globals = ctx.globals();
            if let Some(err) = globals.get::<_, Option<String>>("__err").map_err(|e| anyhow!("{}", e))? {
                return Err(anyhow!("script {}: {}", self.name, err));
            }
            let out: Option<String> = globals.get("__out").map_err(|e| anyhow!("{}", e))?;
            out.ok_or_else(|| anyhow!("script {} never settled", self.name))
        })
    }

    fn install_natives<'js>(&self, ctx: &Ctx<'js>) -> Result<()> {
        let globals = ctx.globals();
        let js = |e: rquickjs::Error| anyhow!("installing natives: {}", e);

        let fetch = self.fetcher();
        let get = Function::new(ctx.clone(), move |url: String, headers: String| -> String {
            fetch.get(&url, &headers)
        })
        .map_err(js)?;
        globals.set("__http_get", get).map_err(js)?;

        let fetch = self.fetcher();
        let post = Function::new(ctx.clone(), move |url: String, body: String, headers: String| -> String {
            fetch.post(&url, &body, &headers)
        })
        .map_err(js)?;
        globals.set("__http_post", post).map_err(js)?;

        let h = Function::new(ctx.clone(), |html: String, rule: String| -> String { pdfh(&html, &rule) }).map_err(js)?;
        globals.set("__pdfh", h).map_err(js)?;

        let a = Function::new(ctx.clone(), |html: String, rule: String| -> String {
            serde_json::to_string(&pdfa(&html, &rule)).unwrap_or_else(|_| "[]".to_string())
        })
        .map_err(js)?;
        globals.set("__pdfa", a).map_err(js)?;

        let name = self.name.clone();
        let log = Function::new(ctx.clone(), move |msg: String| { info!("[{}] {}", name, msg); }).map_err(js)?;
        globals.set("__log", log).map_err(js)?;
        Ok(())
    }

    fn fetcher(&self) -> Fetcher {
        Fetcher {
            http: self.http.clone(),
            handle: self.handle.clone(),
            cfg: self.cfg.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Blocking HTTP bridge for script natives. Failures surface to the script
/// as an empty body.
struct Fetcher {
    http: Arc<dyn HttpClient>,
    handle: Handle,
    cfg: PluginConfig,
    user_agent: String,
}

impl Fetcher {
    fn headers(&self, raw: &str) -> Headers {
        let map: HashMap<String, String> = serde_json::from_str(raw).unwrap_or_default();
        let mut headers: Headers = map.into_iter().collect();
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
            headers.push(("User-Agent".to_string(), self.user_agent.clone()));
        }
        headers
    }

    fn get(&self, url: &str, headers: &str) -> String {
        if !self.cfg.url_allowed(url) {
            warn!("script request to {} blocked", url);
            return String::new();
        }
        let headers = self.headers(headers);
        match self.handle.block_on(self.http.get_text(url, &headers)) {
            Ok(body) => body,
            Err(e) => {
                debug!("script GET {} failed: {:#}", url, e);
                String::new()
            }
        }
    }

    fn post(&self, url: &str, body: &str, headers: &str) -> String {
        if !self.cfg.url_allowed(url) {
            warn!("script request to {} blocked", url);
            return String::new();
        }
        let headers = self.headers(headers);
        match self.handle.block_on(self.http.post_text(url, body, &headers)) {
            Ok(body) => body,
            Err(e) => {
                debug!("script POST {} failed: {:#}", url, e);
                String::new()
            }
        }
    }
}

fn eval_void(ctx: &Ctx<'_>, code: &str) -> Result<()> {
    ctx.eval::<(), _>(code).catch(ctx).map_err(|caught| anyhow!(describe(caught)))
}

fn describe(caught: CaughtError<'_>) -> String {
    match caught {
        CaughtError::Exception(exc) => {
            let msg = exc.message().unwrap_or_default();
            match exc.stack().filter(|s| !s.is_empty()) {
                Some(stack) => format!("{}\n{}", msg, stack),
                None => msg,
            }
        }
        CaughtError::Value(val) => format!("script threw {:?}", val.as_string().map(|s| s.to_string())),
        CaughtError::Error(err) => err.to_string(),
    }
}

#[async_trait]
impl Spider for ScriptSpider {
    fn name(&self) -> &str { &self.name }

    async fn init(&self, ext: &str) -> Result<()> {
        if let Ok(mut e) = self.ext.lock() { *e = ext.to_string(); }
        self.call(&[], json!([])).await.map(|_| ())
    }

    async fn home_content(&self, filter: bool) -> Result<String> {
        self.call(&["home", "homeContent"], json!([filter])).await
    }

    async fn home_video_content(&self) -> Result<String> {
        self.call(&["homeVod", "homeVideoContent"], json!([])).await
    }

    async fn category_content(&self, tid: &str, page: &str, filter: bool, extend: &HashMap<String, String>) -> Result<String> {
        self.call(&["category", "categoryContent"], json!([tid, page, filter, extend])).await
    }

    async fn detail_content(&self, ids: &[String]) -> Result<String> {
        self.call(&["detail", "detailContent"], json!([ids.join(",")])).await
    }

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> Result<String> {
        self.call(&["play", "playerContent"], json!([flag, id, vip_flags])).await
    }

    async fn search_content(&self, key: &str, quick: bool) -> Result<String> {
        self.call(&["search", "searchContent"], json!([key, quick])).await
    }

    fn url_allowed(&self, url: &str) -> bool {
        self.cfg.url_allowed(url)
    }
}

// --- HTML helpers exposed to scripts as pdfh / pdfa ---

/// One `&&` segment: a CSS selector with an optional trailing `:eq(n)`.
fn select_step<'a>(scope: &[ElementRef<'a>], step: &str) -> Vec<ElementRef<'a>> {
    static EQ: OnceLock<Regex> = OnceLock::new();
    let eq = EQ.get_or_init(|| Regex::new(r":eq\((-?\d+)\)\s*$").expect("static regex"));
    let (css, index) = match eq.captures(step) {
        Some(c) => (&step[..c.get(0).map(|m| m.start()).unwrap_or(step.len())], c[1].parse::<i64>().ok()),
        None => (step, None),
    };
    let Ok(selector) = Selector::parse(css.trim()) else {
        debug!("bad selector {}", css);
        return Vec::new();
    };
    let found: Vec<ElementRef<'a>> = scope.iter().flat_map(|el| el.select(&selector)).collect();
    match index {
        None => found,
        Some(i) => {
            let len = found.len() as i64;
            let i = if i < 0 { len + i } else { i };
            if (0..len).contains(&i) { vec![found[i as usize]] } else { Vec::new() }
        }
    }
}

fn select_all<'a>(doc: &'a Html, steps: &[&str]) -> Vec<ElementRef<'a>> {
    steps.iter().fold(vec![doc.root_element()], |scope, step| select_step(&scope, step))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// Extract one value. `div.a&&h3&&Text` walks selectors and ends with an
/// extractor (`Text`, `Html` or an attribute name); a rule with no `&&` is a
/// plain selector whose text is returned.
pub(crate) fn pdfh(html: &str, rule: &str) -> String {
    let rule = rule.trim();
    if rule.is_empty() { return String::new(); }
    let doc = Html::parse_document(html);
    let parts: Vec<&str> = rule.split("&&").map(str::trim).filter(|s| !s.is_empty()).collect();
    let (steps, extractor) = match parts.split_last() {
        Some((last, rest)) if !rest.is_empty() => (rest, *last),
        _ => (&parts[..], "Text"),
    };
    let Some(el) = select_all(&doc, steps).into_iter().next() else { return String::new(); };
    match extractor {
        "Text" => text_of(el),
        "Html" => el.inner_html(),
        attr => el.value().attr(attr).unwrap_or_default().to_string(),
    }
}

/// Outer HTML of every element matched by a `&&`-chained selector rule.
pub(crate) fn pdfa(html: &str, rule: &str) -> Vec<String> {
    let rule = rule.trim();
    if rule.is_empty() { return Vec::new(); }
    let doc = Html::parse_document(html);
    let steps: Vec<&str> = rule.split("&&").map(str::trim).filter(|s| !s.is_empty()).collect();
    select_all(&doc, &steps).into_iter().map(|el| el.html()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::fake::FakeHttp;

    const PAGE: &str = r#"<html><body>
        <ul class="list">
          <li><a href="/v/1" title="One"><img src="/p/1.jpg"> First  Movie </a></li>
          <li><a href="/v/2" title="Two"><img src="/p/2.jpg">Second</a></li>
        </ul>
        <div class="title"><h1>Catalog</h1></div>
    </body></html>"#;

    fn spider(source: &str, http: FakeHttp) -> ScriptSpider {
        ScriptSpider::new("test", source, Arc::new(http), PluginConfig::default(), "ua")
    }

    #[test]
    fn pdfh_rules() {
        assert_eq!(pdfh(PAGE, ".title&&h1&&Text"), "Catalog");
        assert_eq!(pdfh(PAGE, "ul.list li&&a&&href"), "/v/1");
        assert_eq!(pdfh(PAGE, "ul.list li:eq(1)&&a&&title"), "Two");
        assert_eq!(pdfh(PAGE, "ul.list li:eq(-1)&&img&&src"), "/p/2.jpg");
        assert_eq!(pdfh(PAGE, "li a"), "First Movie");
        assert_eq!(pdfh(PAGE, ".missing&&Text"), "");
        assert_eq!(pdfh(PAGE, ".title&&Html").trim(), "<h1>Catalog</h1>");
    }

    #[test]
    fn pdfa_returns_outer_html() {
        let items = pdfa(PAGE, "ul.list&&li");
        assert_eq!(items.len(), 2);
        assert!(items[0].starts_with("<li>"));
        assert_eq!(pdfh(&items[1], "a&&href"), "/v/2");
        assert!(pdfa(PAGE, "table&&tr").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_home_and_serializes_objects() {
        let s = spider(r#"function home(filter) { return { list: [{ vod_id: '1', vod_name: 'A' }], filter: filter }; }"#, FakeHttp::new());
        let out = s.home_content(true).await.unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["list"][0]["vod_name"], "A");
        assert_eq!(v["filter"], true);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn init_ext_and_request_bridge() {
        let http = FakeHttp::new().route("https://example.com/home", "<ul><li>X</li></ul>");
        let src = r#"
            var base = '';
            function init(ext) { base = ext; }
            function homeContent() {
                var html = request(base + '/home');
                return JSON.stringify({ list: pdfa(html, 'ul&&li').map(function (li) { return { vod_name: pdfh(li, 'li&&Text') }; }) });
            }
        "#;
        let s = spider(src, http);
        s.init("https://example.com").await.unwrap();
        let out = s.home_content(false).await.unwrap();
        assert_eq!(out, r#"{"list":[{"vod_name":"X"}]}"#);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn object_spiders_and_promises() {
        let src = r#"
            var __JS_SPIDER__ = {
                search: function (key) { return Promise.resolve('{"list":[{"vod_name":"' + key + '"}]}'); }
            };
        "#;
        let s = spider(src, FakeHttp::new());
        assert_eq!(s.search_content("abc", false).await.unwrap(), r#"{"list":[{"vod_name":"abc"}]}"#);
        assert_eq!(s.home_content(true).await.unwrap(), "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn errors_and_runaway_loops_fail() {
        let s = spider("function home() { throw new Error('boom'); }", FakeHttp::new());
        let err = s.home_content(true).await.unwrap_err();
        assert!(format!("{:#}", err).contains("boom"));

        let cfg = PluginConfig { call_timeout_ms: Some(200), ..Default::default() };
        let looping = ScriptSpider::new("loop", "function home() { while (true) {} }", Arc::new(FakeHttp::new()), cfg, "ua");
        assert!(looping.home_content(true).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_hosts_yield_empty_bodies() {
        let http = FakeHttp::new().route("https://evil.test/x", "secret");
        let cfg = PluginConfig { allowed_hosts: Some(vec!["example.com".into()]), ..Default::default() };
        let s = ScriptSpider::new("t", "function home() { return request('https://evil.test/x'); }", Arc::new(http), cfg, "ua");
        assert_eq!(s.home_content(true).await.unwrap(), "");
    }
}
