use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::ResolverConfig;
use crate::manifest::{self, ManifestFetcher};
use crate::types::*;
use crate::url_util::{is_direct_video_url, is_spider_identifier, is_url, looks_like_video_url};

const DEFAULT_MULTI_NAME: &str = "Multi-source";
const MAX_FETCHES: usize = 32;

/// Turns arbitrary user input into a [`SourceConfig`].
pub struct ConfigIdentifier {
    fetcher: Arc<ManifestFetcher>,
    config: Arc<ResolverConfig>,
}

impl ConfigIdentifier {
    pub fn new(fetcher: Arc<ManifestFetcher>, config: Arc<ResolverConfig>) -> Self {
        Self { fetcher, config }
    }

    /// `None` means the input was not recognised; nothing here errors.
    pub async fn identify(&self, input: &str, name: &str) -> Option<SourceConfig> {
        let input = input.trim();
        if input.is_empty() { return None; }
        if !is_url(input) {
            return parse_config(input, name);
        }
        if is_direct_video_url(input) {
            debug!("{} is a direct video url", input);
            return Some(SourceConfig::Vod(VodConfig::new(input, display_name(name, input))));
        }
        let mut visited = HashSet::new();
        if let Some(cfg) = self.identify_url(input.to_string(), name, 0, &mut visited).await {
            return Some(cfg);
        }
        if looks_like_video_url(input) {
            info!("treating {} as a direct video url", input);
            return Some(SourceConfig::Vod(VodConfig::new(input, display_name(name, input))));
        }
        None
    }

    fn identify_url<'a>(
        &'a self,
        url: String,
        name: &'a str,
        depth: usize,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Option<SourceConfig>> {
        async move {
            if visited.len() >= MAX_FETCHES || !visited.insert(url.clone()) { return None; }
            let bytes = self.fetcher.fetch_bytes(&url).await?;

            if let Some(text) = manifest::decode_manifest(&url, &bytes) {
                if let Some(cfg) = parse_config_from(&text, name, Some(&url)) {
                    return Some(cfg);
                }
            }
            if let Some(cfg) = media_payload_config(&url, &bytes, name) {
                return Some(cfg);
            }
            if depth >= self.config.max_fallback_depth {
                debug!("fallback depth {} reached at {}", depth, url);
                return None;
            }

            let body = String::from_utf8_lossy(&bytes).into_owned();
            for inline in manifest::extract_inline_configs(&body) {
                if let Some(cfg) = parse_config_from(&inline, name, Some(&url)) {
                    debug!("inline config found in {}", url);
                    return Some(cfg);
                }
            }
            let candidates = manifest::extract_config_from_html_limited(&body, &url, self.config.max_html_candidates);
            for candidate in candidates {
                if let Some(cfg) = self.identify_url(candidate, name, depth + 1, &mut *visited).await {
                    return Some(cfg);
                }
            }
            if let Some(target) = manifest::detect_js_redirect(&body, &url) {
                debug!("following script redirect {} -> {}", url, target);
                return self.identify_url(target, name, depth + 1, visited).await;
            }
            None
        }
        .boxed()
    }
}

/// Synchronous structural parse of config text.
pub fn parse_config(text: &str, name: &str) -> Option<SourceConfig> {
    parse_config_from(text, name, None)
}

/// True when `text` parses into a valid configuration.
pub fn validate_config(text: &str) -> bool {
    parse_config(text, "").is_some()
}

/// `origin` is the URL the text was fetched from; it becomes the URL of
/// script configs so relative references keep a base.
fn parse_config_from(text: &str, name: &str, origin: Option<&str>) -> Option<SourceConfig> {
    let t = text.trim().trim_start_matches('\u{feff}');
    if t.is_empty() { return None; }
    let cfg = match manifest::parse_json_lenient(t) {
        Some(Value::Object(obj)) => from_object(&obj, t, name, origin),
        Some(Value::Array(arr)) => from_site_array(&arr, name, origin),
        Some(_) => None,
        None if t.starts_with("csp_") && is_spider_identifier(t) => Some(SourceConfig::JavaScript(JavaScriptConfig {
            url: origin.unwrap_or_default().to_string(),
            name: display_name(name, t),
            js_code: t.to_string(),
            kind: SourceType::Vod,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        })),
        None => parse_javascript(t, name, origin).or_else(|| parse_live_list(t, name, origin)),
    };
    cfg.filter(SourceConfig::is_valid)
}

fn from_object(obj: &Map<String, Value>, text: &str, name: &str, origin: Option<&str>) -> Option<SourceConfig> {
    if let Some(sites) = obj.get("sites").and_then(Value::as_array).filter(|s| !s.is_empty()) {
        let first_type = sites.first().and_then(|s| s.get("type")).and_then(Value::as_i64);
        return Some(SourceConfig::JavaScript(JavaScriptConfig {
            url: origin.unwrap_or_default().to_string(),
            name: pick_name(name, obj, DEFAULT_MULTI_NAME),
            js_code: text.to_string(),
            kind: if first_type == Some(2) { SourceType::Live } else { SourceType::Vod },
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }));
    }

    if let Some(url) = obj.get("url").and_then(Value::as_str).map(str::trim).filter(|u| !u.is_empty()) {
        let is_live = obj.get("type").and_then(Value::as_str)
            .map(|t| t.eq_ignore_ascii_case("live") || t == "直播")
            .unwrap_or(false);
        let timeout = obj.get("timeout").and_then(Value::as_u64).unwrap_or(DEFAULT_SIMPLE_TIMEOUT);
        let label = pick_name(name, obj, url);
        if is_live {
            let opt = |k: &str| obj.get(k).and_then(Value::as_str).map(str::to_string);
            return Some(SourceConfig::Live(LiveConfig {
                url: url.to_string(),
                name: label,
                ua: opt("ua"),
                referer: opt("referer"),
                origin: opt("origin"),
                timeout,
            }));
        }
        return Some(SourceConfig::Vod(VodConfig {
            url: url.to_string(),
            name: label,
            searchable: flag(obj, "searchable"),
            changeable: flag(obj, "changeable"),
            quick_search: flag(obj, "quickSearch"),
            timeout,
        }));
    }

    // A single site descriptor
    if obj.get("api").and_then(Value::as_str).map(|a| !a.trim().is_empty()).unwrap_or(false) {
        let kind = if obj.get("type").and_then(Value::as_i64) == Some(2) { SourceType::Live } else { SourceType::Vod };
        return Some(SourceConfig::JavaScript(JavaScriptConfig {
            url: origin.unwrap_or_default().to_string(),
            name: pick_name(name, obj, DEFAULT_MULTI_NAME),
            js_code: text.to_string(),
            kind,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }));
    }
    None
}

/// `[{"api":...}, ...]` is treated as the `sites` array of a manifest.
fn from_site_array(arr: &[Value], name: &str, origin: Option<&str>) -> Option<SourceConfig> {
    let is_sites = !arr.is_empty() && arr.iter().all(|v| v.get("api").and_then(Value::as_str).is_some());
    if !is_sites { return None; }
    let wrapped = serde_json::json!({ "sites": arr }).to_string();
    let obj = serde_json::from_str::<Map<String, Value>>(&wrapped).ok()?;
    from_object(&obj, &wrapped, name, origin)
}

/// `1` (or `true`) enables, `0` disables, missing means enabled.
fn flag(obj: &Map<String, Value>, key: &str) -> bool {
    match obj.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s.trim() == "1" || s.trim().eq_ignore_ascii_case("true"),
        Some(_) => true,
    }
}

fn pick_name(arg: &str, obj: &Map<String, Value>, fallback: &str) -> String {
    let arg = arg.trim();
    if !arg.is_empty() { return arg.to_string(); }
    obj.get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn display_name(arg: &str, source: &str) -> String {
    let arg = arg.trim();
    if !arg.is_empty() { return arg.to_string(); }
    let path = source.split(['?', '#']).next().unwrap_or(source);
    path.trim_end_matches('/').rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(source).to_string()
}

// --- JavaScript sources ---

fn quoted_http_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"["'](https?://[^"'\s]+)["']"#).expect("static regex"))
}

fn live_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)live|直播").expect("static regex"))
}

fn looks_like_script(t: &str) -> bool {
    if t.starts_with('<') { return false; }
    const MARKERS: &[&str] = &["function", "=>", "var ", "let ", "const ", "rule", "export "];
    MARKERS.iter().any(|m| t.contains(m))
}

/// Braces outside string literals must balance; a truncated script does not.
fn braces_balanced(t: &str) -> bool {
    let mut depth = 0i64;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in t.chars() {
        if let Some(q) = quote {
            if escaped { escaped = false; } else if c == '\\' { escaped = true; } else if c == q { quote = None; }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '{' => depth += 1,
            '}' => { depth -= 1; if depth < 0 { return false; } }
            _ => {}
        }
    }
    depth == 0 && quote.is_none()
}

fn parse_javascript(t: &str, name: &str, origin: Option<&str>) -> Option<SourceConfig> {
    if !looks_like_script(t) || !braces_balanced(t) { return None; }
    let url = match origin {
        Some(o) => o.to_string(),
        None => quoted_http_re().captures(t)?.get(1)?.as_str().to_string(),
    };
    Some(SourceConfig::JavaScript(JavaScriptConfig {
        name: display_name(name, &url),
        url,
        js_code: t.to_string(),
        kind: if live_re().is_match(t) { SourceType::Live } else { SourceType::Vod },
        timeout: DEFAULT_SCRIPT_TIMEOUT,
    }))
}

/// M3U channel lists and `name,url` / `#genre#` text lists fetched from a URL.
fn parse_live_list(t: &str, name: &str, origin: Option<&str>) -> Option<SourceConfig> {
    let origin = origin?;
    let is_m3u_channels = t.starts_with("#EXTM3U") && t.contains("#EXTINF") && !t.contains("#EXT-X-");
    let is_txt_channels = t.contains("#genre#")
        || t.lines().filter(|l| l.split_once(',').map(|(_, u)| is_url(u.trim())).unwrap_or(false)).count() >= 2;
    if !is_m3u_channels && !is_txt_channels { return None; }
    Some(SourceConfig::Live(LiveConfig::new(origin, display_name(name, origin))))
}

/// Fetched bytes that are themselves media mean the URL plays directly.
fn media_payload_config(url: &str, bytes: &[u8], name: &str) -> Option<SourceConfig> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]);
    let hls = head.trim_start().starts_with("#EXTM3U") && head.contains("#EXT-X-");
    let mp4 = bytes.get(4..8) == Some(b"ftyp".as_slice());
    let flv = bytes.starts_with(b"FLV");
    let ts = bytes.first() == Some(&0x47) && bytes.get(188) == Some(&0x47);
    (hls || mp4 || flv || ts).then(|| SourceConfig::Vod(VodConfig::new(url, display_name(name, url))))
}
