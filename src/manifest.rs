//! Manifest retrieval and adversarial format recovery.
//!
//! Publishers hide manifests behind HTML pages, inside images, or behind
//! simple encodings. Everything here is best effort: extractors return
//! `None` or an empty list and the caller decides what to try next.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use aes::Aes128;
use base64::Engine as _;
use block_modes::block_padding::Pkcs7;
use block_modes::{BlockMode, Cbc};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::ResolverConfig;
use crate::http::{default_headers, HttpClient};
use crate::url_util;

type Aes128Cbc = Cbc<Aes128, Pkcs7>;

const BMP_HEADER_LEN: usize = 54;
const MAX_JSON_SCAN_ATTEMPTS: usize = 4096;

pub struct ManifestFetcher {
    http: Arc<dyn HttpClient>,
    config: Arc<ResolverConfig>,
}

impl ManifestFetcher {
    pub fn new(http: Arc<dyn HttpClient>, config: Arc<ResolverConfig>) -> Self {
        Self { http, config }
    }

    /// Raw bytes from `http(s)://` or `file://`.
    pub async fn fetch_bytes(&self, url: &str) -> Option<Vec<u8>> {
        if url.trim_start().to_ascii_lowercase().starts_with("file://") {
            let path = Url::parse(url.trim()).ok()?.to_file_path().ok()?;
            return match tokio::fs::read(&path).await {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!("reading {} failed: {}", path.display(), e);
                    None
                }
            };
        }
        match self.http.get_bytes(url, &default_headers(&self.config)).await {
            Ok(b) => Some(b),
            Err(e) => {
                warn!("fetching {} failed: {:#}", url, e);
                None
            }
        }
    }

    /// Raw body as text.
    pub async fn fetch(&self, url: &str) -> Option<String> {
        let bytes = self.fetch_bytes(url).await?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Body run through the full decode chain (image payloads, base64, AES,
    /// relative path fixing).
    pub async fn fetch_manifest(&self, url: &str) -> Option<String> {
        let bytes = self.fetch_bytes(url).await?;
        decode_manifest(url, &bytes)
    }
}

/// Decode a fetched body into manifest text.
pub fn decode_manifest(url: &str, bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(b"BM") {
        let hidden = extract_hidden_data_from_bmp(bytes)?;
        return Some(verify(url, &hidden));
    }
    if is_image(bytes) {
        let hidden = scan_for_json(bytes)?;
        debug!("found {} byte JSON payload inside image {}", hidden.len(), url);
        return Some(verify(url, &hidden));
    }
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() { return None; }
    Some(verify(url, &text))
}

fn is_image(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\x89PNG") || bytes.starts_with(&[0xFF, 0xD8, 0xFF]) || bytes.starts_with(b"GIF8")
}

/// Undo the known payload encodings, then absolutize relative references.
pub fn verify(url: &str, data: &str) -> String {
    let t = data.trim().trim_start_matches('\u{feff}');
    if t.starts_with('{') || t.starts_with('[') {
        return fix(url, t);
    }
    if t.contains("**") {
        if let Some(decoded) = decode_base64_marker(t) {
            return fix(url, &decoded);
        }
    }
    if t.starts_with("2423") {
        match decrypt_cbc(t) {
            Some(decoded) => return fix(url, &decoded),
            None => warn!("payload from {} looked AES-wrapped but did not decrypt", url),
        }
    }
    fix(url, t)
}

fn quoted_relative_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""(\.\.?/[^"]*)""#).expect("static regex"))
}

/// Rewrite quoted `./x` and `../x` references against the manifest URL.
pub fn fix(url: &str, data: &str) -> String {
    let Ok(base) = Url::parse(url.trim()) else { return data.to_string() };
    quoted_relative_re()
        .replace_all(data, |c: &regex::Captures| match base.join(&c[1]) {
            Ok(abs) => format!("\"{}\"", abs),
            Err(_) => c[0].to_string(),
        })
        .into_owned()
}

fn base64_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9]{8}\*\*").expect("static regex"))
}

/// `<8 alnum>**<base64>`: everything after the marker is base64.
pub fn decode_base64_marker(data: &str) -> Option<String> {
    let m = base64_marker_re().find(data)?;
    let start = m.start() + 10;
    if start >= data.len() { return None; }
    let bytes = decode_base64_lenient(&data[start..])?;
    String::from_utf8(bytes).ok().filter(|s| !s.trim().is_empty())
}

pub(crate) fn decode_base64_lenient(s: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() { return None; }
    STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(cleaned.trim_end_matches('=')))
        .or_else(|_| URL_SAFE_NO_PAD.decode(cleaned.trim_end_matches('=')))
        .ok()
}

fn pad_key(raw: &[u8]) -> Vec<u8> {
    let mut k: Vec<u8> = raw.iter().take(16).map(|b| b.to_ascii_lowercase()).collect();
    k.resize(16, b'0');
    k
}

/// Hex payload framed as `$#<key>#$<ciphertext><13-byte iv>`, AES-128-CBC.
pub fn decrypt_cbc(data: &str) -> Option<String> {
    let raw = hex::decode(data.trim()).ok()?;
    let key_start = find(&raw, b"$#")? + 2;
    let key_end = key_start + find(&raw[key_start..], b"#$")?;
    if raw.len() < key_end + 2 + 13 { return None; }
    let key = pad_key(&raw[key_start..key_end]);
    let iv = pad_key(&raw[raw.len() - 13..]);
    let ciphertext = &raw[key_end + 2..raw.len() - 13];
    let cipher = Aes128Cbc::new_from_slices(&key, &iv).ok()?;
    let plain = cipher.decrypt_vec(ciphertext).ok()?;
    String::from_utf8(plain).ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Remove `//` and `/* */` comments outside of JSON strings.
pub fn strip_json_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_str = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_str {
            out.push(c);
            if escaped { escaped = false; } else if c == '\\' { escaped = true; } else if c == '"' { in_str = false; }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => { in_str = true; out.push(c); }
            ('/', Some('/')) => {
                while let Some(&n) = chars.peek() { if n == '\n' { break; } chars.next(); }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() { if prev == '*' && n == '/' { break; } prev = n; }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Strict JSON first, then with comments stripped.
pub fn parse_json_lenient(text: &str) -> Option<Value> {
    let t = text.trim().trim_start_matches('\u{feff}');
    serde_json::from_str(t).ok().or_else(|| serde_json::from_str(&strip_json_comments(t)).ok())
}

/// First complete JSON object embedded anywhere in `bytes`.
pub fn scan_for_json(bytes: &[u8]) -> Option<String> {
    let mut attempts = 0;
    for (i, _) in bytes.iter().enumerate().filter(|(_, b)| **b == b'{') {
        attempts += 1;
        if attempts > MAX_JSON_SCAN_ATTEMPTS { break; }
        let mut stream = serde_json::Deserializer::from_slice(&bytes[i..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(_))) = stream.next() {
            let end = i + stream.byte_offset();
            return String::from_utf8(bytes[i..end].to_vec()).ok();
        }
    }
    None
}

// --- BMP steganography ---

fn le_u32(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn le_i32(b: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn le_u16(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(at..at + 2)?.try_into().ok()?))
}

/// Bytes after the end of the declared pixel array are the hidden payload.
pub fn extract_hidden_data_from_bmp(bytes: &[u8]) -> Option<String> {
    if bytes.len() < BMP_HEADER_LEN || !bytes.starts_with(b"BM") { return None; }
    let offset = le_u32(bytes, 10)? as i64;
    let width = le_i32(bytes, 18)? as i64;
    let height = le_i32(bytes, 22)? as i64;
    let bpp = le_u16(bytes, 28)? as i64;

    let row = bpp.checked_mul(width.abs())?.checked_add(31)? / 32 * 4;
    let end = row.checked_mul(height.abs())?.checked_add(offset)?;
    debug!("bmp {}x{} {}bpp, pixel data ends at {} of {}", width, height, bpp, end, bytes.len());
    let end = usize::try_from(end).ok()?;
    if end >= bytes.len() { return None; }

    let payload = trim_padding(&bytes[end..]);
    if payload.is_empty() { return None; }
    decode_hidden_payload(payload)
}

fn trim_padding(b: &[u8]) -> &[u8] {
    let is_pad = |c: &u8| *c == 0 || c.is_ascii_whitespace();
    let start = b.iter().position(|c| !is_pad(c)).unwrap_or(b.len());
    let end = b.iter().rposition(|c| !is_pad(c)).map(|i| i + 1).unwrap_or(start);
    &b[start..end]
}

fn decode_hidden_payload(payload: &[u8]) -> Option<String> {
    let utf8 = std::str::from_utf8(payload).ok();
    if let Some(s) = utf8 {
        let t = s.trim_start();
        if t.starts_with('{') || t.starts_with('[') { return Some(s.to_string()); }
    }
    // base64 text is plain ASCII, so latin-1 and UTF-8 agree here
    let latin1: String = payload.iter().map(|&b| b as char).collect();
    if let Some(decoded) = decode_base64_lenient(&latin1).and_then(|d| String::from_utf8(d).ok()) {
        if !decoded.trim().is_empty() { return Some(decoded); }
    }
    if let Some(s) = utf8 {
        if !s.trim().is_empty() { return Some(s.to_string()); }
    }
    scan_for_json(payload)
}

// --- HTML scraping ---

fn script_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"["']([^"'\s<>()]{4,})["']"#).expect("static regex"))
}

fn is_config_candidate(link: &str) -> bool {
    let l = link.to_ascii_lowercase();
    if l.starts_with("javascript:") || l.starts_with("mailto:") || l.starts_with('#') { return false; }
    const KEYWORDS: &[&str] = &[".json", ".txt", "/api", "config", "spider", ".png", ".jpg", ".jpeg", ".gif", ".bmp"];
    KEYWORDS.iter().any(|k| l.contains(k))
}

fn is_linkish(s: &str) -> bool {
    s.contains('/') || s.contains('.')
}

/// Candidate manifest links from a page, absolute, deduplicated, at most 10.
pub fn extract_config_from_html(html: &str, base: &str) -> Vec<String> {
    extract_config_from_html_limited(html, base, 10)
}

pub fn extract_config_from_html_limited(html: &str, base: &str, limit: usize) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut raw: Vec<String> = Vec::new();
    if let Ok(sel) = Selector::parse("a[href]") {
        raw.extend(doc.select(&sel).filter_map(|a| a.value().attr("href")).map(str::to_string));
    }
    if let Ok(sel) = Selector::parse("script") {
        for script in doc.select(&sel) {
            let text: String = script.text().collect();
            raw.extend(script_url_re().captures_iter(&text).map(|c| c[1].to_string()).filter(|s| is_linkish(s)));
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for link in raw.iter().map(|s| s.trim()).filter(|s| is_config_candidate(s)) {
        let Some(abs) = url_util::resolve(base, link) else { continue };
        if !url_util::is_url(&abs) { continue; }
        if seen.insert(abs.clone()) {
            out.push(abs);
            if out.len() >= limit { break; }
        }
    }
    debug!("{} candidate config links in page {}", out.len(), base);
    out
}

/// JSON manifests embedded directly in `<script>`, `<pre>` or `<textarea>`.
pub fn extract_inline_configs(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Ok(sel) = Selector::parse("script, pre, textarea") else { return Vec::new() };
    doc.select(&sel)
        .filter_map(|el| {
            let text: String = el.text().collect();
            let json = scan_for_json(text.as_bytes())?;
            let v: Value = serde_json::from_str(&json).ok()?;
            let obj = v.as_object()?;
            (obj.contains_key("sites") || obj.contains_key("url") || obj.contains_key("api")).then_some(json)
        })
        .collect()
}

fn redirect_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r#"(?:window\.|document\.|top\.|self\.)?location(?:\.href)?\s*=\s*["']([^"']+)["']"#,
            r#"location\.(?:replace|assign)\(\s*["']([^"']+)["']\s*\)"#,
            r#"(?i)<meta[^>]+http-equiv\s*=\s*["']?refresh["']?[^>]*content\s*=\s*["'][^"']*url\s*=\s*([^"'>\s]+)"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Target of a script or meta-refresh redirect, resolved against `base`.
pub fn detect_js_redirect(body: &str, base: &str) -> Option<String> {
    redirect_res()
        .iter()
        .find_map(|re| re.captures(body).map(|c| c[1].trim().to_string()))
        .and_then(|target| url_util::resolve(base, &target))
        .filter(|u| url_util::is_url(u) && u != base)
}
