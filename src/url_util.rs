use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Extensions that identify a playable media file rather than a manifest.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m3u8", "flv", "avi", "mkv", "webm", "mov", "wmv", "ts", "m3u"];

pub fn is_url(s: &str) -> bool {
    let l = s.trim_start().to_ascii_lowercase();
    l.starts_with("http://") || l.starts_with("https://") || l.starts_with("file://")
}

pub fn is_http_url(s: &str) -> bool {
    let l = s.trim_start().to_ascii_lowercase();
    l.starts_with("http://") || l.starts_with("https://")
}

/// Strip `?query` and `#fragment` from a URL-ish string.
fn path_part(s: &str) -> &str {
    let end = s.find(['?', '#']).unwrap_or(s.len());
    &s[..end]
}

/// True when the path component ends in `.{ext}` (case-insensitive).
/// `has_extension("a.json", "js")` is false.
pub fn has_extension(s: &str, ext: &str) -> bool {
    let path = path_part(s.trim()).to_ascii_lowercase();
    path.rsplit_once('.').map(|(_, e)| e == ext).unwrap_or(false)
}

/// Strict check used before any network fetch: the URL's path must end with a
/// known media extension.
pub fn is_direct_video_url(s: &str) -> bool {
    if !is_url(s) { return false; }
    let path = match Url::parse(s.trim()) {
        Ok(u) => u.path().to_ascii_lowercase(),
        Err(_) => path_part(s).to_ascii_lowercase(),
    };
    VIDEO_EXTENSIONS.iter().any(|e| path.ends_with(&format!(".{}", e)))
}

/// Loose keyword match used as the last resort of identification, e.g.
/// `https://cdn/x.m3u8?token=1` or `https://cdn/play/mp4/123`.
pub fn looks_like_video_url(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)(\.(mp4|m3u8|flv|avi|mkv|webm|mov|wmv|m3u)([?#&]|$))|(\.ts([?#]|$))|([/=](m3u8|mp4|flv)([/?&#]|$))")
            .expect("static regex")
    });
    is_http_url(s) && re.is_match(s.trim())
}

/// CatVod spider class names: `csp_Name`, or a plain identifier under 100 chars.
pub fn is_spider_identifier(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));
    let s = s.trim();
    if s.is_empty() || s.len() >= 100 { return false; }
    s.starts_with("csp_") || re.is_match(s)
}

/// Resolve `reference` against `base`, returning the absolute URL string.
pub fn resolve(base: &str, reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() { return None; }
    if let Ok(u) = Url::parse(reference) { return Some(u.to_string()); }
    let base = Url::parse(base.trim()).ok()?;
    base.join(reference).ok().map(|u| u.to_string())
}

/// Append `key=value` to a URL's query string.
pub fn with_query_param(url: &str, key: &str, value: &str) -> Option<String> {
    let mut u = Url::parse(url.trim()).ok()?;
    u.query_pairs_mut().append_pair(key, value);
    Some(u.to_string())
}

/// Header suffixes CatVod sources append to pic and play URLs. `None` marks
/// the JSON object form.
const HEADER_SUFFIXES: &[(&str, Option<&str>)] = &[
    ("@Headers=", None),
    ("@Cookie=", Some("Cookie")),
    ("@Referer=", Some("Referer")),
    ("@User-Agent=", Some("User-Agent")),
];

/// Canonical spelling for the header names sources get creative with.
pub fn fix_header(key: &str) -> String {
    match key.trim().to_ascii_lowercase().as_str() {
        "user-agent" | "useragent" => "User-Agent".to_string(),
        "referer" | "referrer" => "Referer".to_string(),
        "cookie" => "Cookie".to_string(),
        _ => key.trim().to_string(),
    }
}

/// Split `url@Headers={json}@Cookie=c@Referer=r@User-Agent=ua` into the bare
/// URL and its headers. Explicit suffixes override keys from `@Headers=`.
pub fn parse_url_with_headers(raw: &str) -> (String, HashMap<String, String>) {
    let raw = raw.trim();
    let mut headers = HashMap::new();
    if raw.is_empty() || raw.starts_with("data:") {
        return (raw.to_string(), headers);
    }

    let mut cut = raw.len();
    for (marker, name) in HEADER_SUFFIXES {
        let Some(at) = raw.find(marker) else { continue };
        cut = cut.min(at);
        let rest = &raw[at + marker.len()..];
        let value = &rest[..suffix_end(rest)];
        match name {
            Some(name) => {
                headers.insert(name.to_string(), value.trim().to_string());
            }
            None => match serde_json::from_str::<Value>(value.trim()) {
                Ok(Value::Object(map)) => {
                    for (k, v) in map {
                        let v = match v {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        headers.entry(fix_header(&k)).or_insert(v);
                    }
                }
                _ => debug!("ignoring malformed @Headers= in {}", raw),
            },
        }
    }
    (raw[..cut].trim().to_string(), headers)
}

/// Where the value of one suffix stops: at the next known suffix.
fn suffix_end(rest: &str) -> usize {
    HEADER_SUFFIXES
        .iter()
        .filter_map(|(marker, _)| rest.find(marker))
        .min()
        .unwrap_or(rest.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_ignores_query_and_substrings() {
        assert!(has_extension("https://a.example/x.js?v=2", "js"));
        assert!(!has_extension("https://a.example/config.json", "js"));
        assert!(has_extension("spider.py", "py"));
        assert!(!has_extension("csp_Foo", "js"));
    }

    #[test]
    fn direct_video_urls() {
        assert!(is_direct_video_url("https://cdn.example.com/movie.mp4"));
        assert!(is_direct_video_url("https://cdn.example.com/live/index.M3U8?t=1"));
        assert!(!is_direct_video_url("https://example.com/config.json"));
        // "https" must not count as a ".ts" match
        assert!(!is_direct_video_url("https://example.com/"));
        assert!(!is_direct_video_url("movie.mp4"));
    }

    #[test]
    fn loose_video_heuristic() {
        assert!(looks_like_video_url("https://cdn.example.com/play/m3u8/42"));
        assert!(looks_like_video_url("https://cdn.example.com/seg.ts"));
        assert!(!looks_like_video_url("https://example.com/index.html"));
    }

    #[test]
    fn spider_identifiers() {
        assert!(is_spider_identifier("csp_Douban"));
        assert!(is_spider_identifier("MySpider"));
        assert!(!is_spider_identifier("https://example.com/api"));
        assert!(!is_spider_identifier("1abc"));
        assert!(!is_spider_identifier(&"a".repeat(120)));
    }

    #[test]
    fn resolve_relative_and_absolute() {
        assert_eq!(resolve("https://a.example/dir/page.html", "cfg.json").as_deref(), Some("https://a.example/dir/cfg.json"));
        assert_eq!(resolve("https://a.example/dir/", "../x.txt").as_deref(), Some("https://a.example/x.txt"));
        assert_eq!(resolve("https://a.example/", "https://b.example/y").as_deref(), Some("https://b.example/y"));
    }

    #[test]
    fn query_param_is_appended() {
        assert_eq!(with_query_param("https://a.example/api?ac=list", "filter", "true").as_deref(), Some("https://a.example/api?ac=list&filter=true"));
    }

    #[test]
    fn header_suffixes_are_split_off() {
        let (url, h) = parse_url_with_headers("https://img.example/a.jpg@Referer=https://site.example/");
        assert_eq!(url, "https://img.example/a.jpg");
        assert_eq!(h.get("Referer").map(String::as_str), Some("https://site.example/"));

        let (url, h) = parse_url_with_headers("https://v.example/1.m3u8@Cookie=a=1; b=2@User-Agent=Mozilla/5.0 (X11)");
        assert_eq!(url, "https://v.example/1.m3u8");
        assert_eq!(h.get("Cookie").map(String::as_str), Some("a=1; b=2"));
        assert_eq!(h.get("User-Agent").map(String::as_str), Some("Mozilla/5.0 (X11)"));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn json_headers_are_normalized() {
        let raw = r#"https://v.example/1.mp4@Headers={"referrer":"https://r.example","useragent":"UA","X-Token":7}@Referer=https://wins.example"#;
        let (url, h) = parse_url_with_headers(raw);
        assert_eq!(url, "https://v.example/1.mp4");
        assert_eq!(h.get("User-Agent").map(String::as_str), Some("UA"));
        assert_eq!(h.get("X-Token").map(String::as_str), Some("7"));
        assert_eq!(h.get("Referer").map(String::as_str), Some("https://wins.example"));
    }

    #[test]
    fn plain_and_odd_urls_pass_through() {
        let (url, h) = parse_url_with_headers(" https://user@host.example/x.mp4 ");
        assert_eq!(url, "https://user@host.example/x.mp4");
        assert!(h.is_empty());
        let (url, h) = parse_url_with_headers("https://v.example/x.mp4@Headers={broken");
        assert_eq!(url, "https://v.example/x.mp4");
        assert!(h.is_empty());
        assert_eq!(parse_url_with_headers("data:image/png;base64,AAAA").0, "data:image/png;base64,AAAA");
        assert_eq!(fix_header("COOKIE"), "Cookie");
        assert_eq!(fix_header("Origin"), "Origin");
    }
}
