use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::url_util::{has_extension, is_spider_identifier, parse_url_with_headers};

/// Whether a configuration serves on-demand catalogs or live channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Vod,
    Live,
}

/// A typed video-source configuration recovered from user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Vod(VodConfig),
    Live(LiveConfig),
    #[serde(rename = "javascript")]
    JavaScript(JavaScriptConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VodConfig {
    pub url: String,
    pub name: String,
    pub searchable: bool,
    pub changeable: bool,
    pub quick_search: bool,
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub url: String,
    pub name: String,
    pub ua: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JavaScriptConfig {
    pub url: String,
    pub name: String,
    pub js_code: String,
    pub kind: SourceType,
    pub timeout: u64,
}

pub const DEFAULT_SIMPLE_TIMEOUT: u64 = 15;
pub const DEFAULT_SCRIPT_TIMEOUT: u64 = 30;

impl VodConfig {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            searchable: true,
            changeable: true,
            quick_search: true,
            timeout: DEFAULT_SIMPLE_TIMEOUT,
        }
    }
}

impl LiveConfig {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self { url: url.into(), name: name.into(), ua: None, referer: None, origin: None, timeout: DEFAULT_SIMPLE_TIMEOUT }
    }

    /// Request headers a player needs for this channel list.
    pub fn headers(&self) -> HashMap<String, String> {
        let mut h = HashMap::new();
        if let Some(ua) = self.ua.as_deref().filter(|s| !s.is_empty()) { h.insert("User-Agent".to_string(), ua.to_string()); }
        if let Some(r) = self.referer.as_deref().filter(|s| !s.is_empty()) { h.insert("Referer".to_string(), r.to_string()); }
        if let Some(o) = self.origin.as_deref().filter(|s| !s.is_empty()) { h.insert("Origin".to_string(), o.to_string()); }
        h
    }
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::Vod(c) => &c.name,
            SourceConfig::Live(c) => &c.name,
            SourceConfig::JavaScript(c) => &c.name,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            SourceConfig::Vod(c) => &c.url,
            SourceConfig::Live(c) => &c.url,
            SourceConfig::JavaScript(c) => &c.url,
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            SourceConfig::Vod(_) => SourceType::Vod,
            SourceConfig::Live(_) => SourceType::Live,
            SourceConfig::JavaScript(c) => c.kind,
        }
    }

    /// Vod and Live need a URL; JavaScript needs code.
    pub fn is_valid(&self) -> bool {
        match self {
            SourceConfig::Vod(c) => !c.url.trim().is_empty(),
            SourceConfig::Live(c) => !c.url.trim().is_empty(),
            SourceConfig::JavaScript(c) => !c.js_code.trim().is_empty(),
        }
    }

    /// Replace the URL of a config that was parsed from fetched text.
    pub fn with_url(mut self, url: &str) -> Self {
        match &mut self {
            SourceConfig::Vod(c) => c.url = url.to_string(),
            SourceConfig::Live(c) => c.url = url.to_string(),
            SourceConfig::JavaScript(c) => c.url = url.to_string(),
        }
        self
    }
}

// --- Site & strategy ---

/// One entry of a manifest, carrying the API endpoint and a dialect code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub key: String,
    pub name: String,
    pub api: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub jar: String,
    #[serde(rename = "type")]
    pub kind: i32,
    pub timeout: u64,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub hide: bool,
    /// Inline script source for sites synthesized from pasted JavaScript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiderKind {
    /// `.py` spiders; recognised but never executed.
    Python,
    /// JavaScript executed in the embedded engine.
    Script,
    /// A compiled plugin loaded into the wasm sandbox.
    Plugin,
}

/// How content for a [`Site`] is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectApi { dialect: i32 },
    Ext,
    Spider(SpiderKind),
}

impl Site {
    /// Selects exactly one strategy. `.js` wins over a non-blank `jar`.
    pub fn strategy(&self) -> Strategy {
        let api = self.api.trim();
        if has_extension(api, "py") { return Strategy::Spider(SpiderKind::Python); }
        if self.script.is_some() || has_extension(api, "js") { return Strategy::Spider(SpiderKind::Script); }
        if self.kind == 3 || api.starts_with("csp_") { return Strategy::Spider(SpiderKind::Plugin); }
        if self.kind == 4 { return Strategy::Ext; }
        if !self.jar.trim().is_empty() && is_spider_identifier(api) {
            return Strategy::Spider(SpiderKind::Plugin);
        }
        match self.kind {
            0..=2 => Strategy::DirectApi { dialect: self.kind },
            _ => Strategy::DirectApi { dialect: 1 },
        }
    }

    /// Spider class name for plugin lookup, if the api names one.
    pub fn spider_class(&self) -> Option<&str> {
        let api = self.api.trim();
        if api.starts_with("csp_") { return Some(api); }
        if !self.jar.trim().is_empty() && is_spider_identifier(api) { return Some(api); }
        None
    }
}

// --- Output records ---

/// Normalized catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoItem {
    pub id: String,
    pub name: String,
    pub pic: String,
    pub note: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub vod_id: String,
    pub year: String,
    pub area: String,
    pub actor: String,
    pub director: String,
    pub des: String,
    pub last: String,
    pub play_url: String,
    pub play_from: String,
    /// Headers split off `url` (`@Referer=...` and friends).
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub pic_headers: HashMap<String, String>,
}

/// A URL ready for a player, with the request headers it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayTarget {
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl PlayTarget {
    /// Split CatVod header suffixes off `raw`.
    pub fn parse(raw: &str) -> Self {
        let (url, headers) = parse_url_with_headers(raw);
        Self { url, headers }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub name: String,
    pub url: String,
}

/// One play line ("flag") and its episodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaySource {
    pub flag: String,
    pub episodes: Vec<Episode>,
}

impl VideoItem {
    pub fn play_sources(&self) -> Vec<PlaySource> {
        parse_play_sources(&self.play_from, &self.play_url)
    }

    /// First playable URL: the first episode with a URL, else the raw `play_url`.
    pub fn first_play_url(&self) -> Option<String> {
        self.play_sources()
            .into_iter()
            .flat_map(|s| s.episodes)
            .map(|e| e.url)
            .find(|u| !u.is_empty())
            .or_else(|| {
                let raw = self.play_url.trim();
                (!raw.is_empty() && !raw.contains('$')).then(|| raw.to_string())
            })
    }
}

/// Parse `vod_play_from` / `vod_play_url`. Lines are split on `$$$`.
/// A line is either `name$url#name$url` or the legacy `name#url$name#url`.
pub fn parse_play_sources(play_from: &str, play_url: &str) -> Vec<PlaySource> {
    if play_url.trim().is_empty() { return Vec::new(); }
    let flags: Vec<&str> = play_from.split("$$$").collect();
    play_url
        .split("$$$")
        .enumerate()
        .filter_map(|(i, line)| {
            let flag = flags.get(i).map(|f| f.trim()).filter(|f| !f.is_empty());
            let flag = match flag {
                Some(f) => f.to_string(),
                None if play_from.trim().is_empty() => format!("Line {}", i + 1),
                None => return None,
            };
            Some(PlaySource { flag, episodes: parse_episodes(line) })
        })
        .collect()
}

fn parse_episodes(line: &str) -> Vec<Episode> {
    let line = line.trim();
    if line.is_empty() { return Vec::new(); }
    let standard = line.split('#').all(|chunk| chunk.trim().is_empty() || chunk.contains('$'));
    let (ep_sep, kv_sep) = if standard { ('#', '$') } else { ('$', '#') };
    line.split(ep_sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|chunk| match chunk.split_once(kv_sep) {
            Some((n, u)) => Episode { name: n.trim().to_string(), url: u.trim().to_string() },
            None if chunk.contains("://") => Episode { name: String::new(), url: chunk.to_string() },
            None => Episode { name: chunk.to_string(), url: String::new() },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(api: &str, jar: &str, kind: i32) -> Site {
        Site {
            key: "k".into(),
            name: "n".into(),
            api: api.into(),
            ext: String::new(),
            jar: jar.into(),
            kind,
            timeout: 15,
            searchable: true,
            hide: false,
            script: None,
        }
    }

    #[test]
    fn js_api_always_selects_script() {
        assert_eq!(site("https://a.example/s.js", "https://a.example/x.jar", 3).strategy(), Strategy::Spider(SpiderKind::Script));
        assert_eq!(site("drpy.js", "", 1).strategy(), Strategy::Spider(SpiderKind::Script));
    }

    #[test]
    fn strategy_table() {
        assert_eq!(site("csp_Foo", "", 1).strategy(), Strategy::Spider(SpiderKind::Plugin));
        assert_eq!(site("https://a.example/api", "", 0).strategy(), Strategy::DirectApi { dialect: 0 });
        assert_eq!(site("https://a.example/api", "", 2).strategy(), Strategy::DirectApi { dialect: 2 });
        assert_eq!(site("https://a.example/api", "", 4).strategy(), Strategy::Ext);
        assert_eq!(site("https://a.example/s.py", "", 3).strategy(), Strategy::Spider(SpiderKind::Python));
        assert_eq!(site("Bili", "https://a.example/x.jar", 1).strategy(), Strategy::Spider(SpiderKind::Plugin));
        assert_eq!(site("https://a.example/config.json", "", 7).strategy(), Strategy::DirectApi { dialect: 1 });
        let inline = Site { script: Some("function home(){}".into()), ..site("", "", 3) };
        assert_eq!(inline.strategy(), Strategy::Spider(SpiderKind::Script));
    }

    #[test]
    fn live_headers() {
        let mut c = LiveConfig::new("https://a.example/tv.m3u", "tv");
        c.ua = Some("UA".into());
        c.referer = Some(String::new());
        let h = c.headers();
        assert_eq!(h.get("User-Agent").map(String::as_str), Some("UA"));
        assert!(!h.contains_key("Referer"));
    }

    #[test]
    fn validity() {
        assert!(!SourceConfig::Vod(VodConfig::new(" ", "x")).is_valid());
        assert!(SourceConfig::Vod(VodConfig::new("https://a.example/", "x")).is_valid());
    }

    #[test]
    fn play_sources_standard_form() {
        let s = parse_play_sources("HD$$$SD", "E1$https://v/1.m3u8#E2$https://v/2.m3u8$$$E1$https://w/1.mp4");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].flag, "HD");
        assert_eq!(s[0].episodes[1], Episode { name: "E2".into(), url: "https://v/2.m3u8".into() });
        assert_eq!(s[1].episodes.len(), 1);
    }

    #[test]
    fn play_sources_legacy_form() {
        let s = parse_play_sources("Line1", "Ep1#u1$Ep2#u2$Ep3");
        assert_eq!(s[0].episodes.len(), 3);
        assert_eq!(s[0].episodes[0], Episode { name: "Ep1".into(), url: "u1".into() });
        assert_eq!(s[0].episodes[2].url, "");
    }

    #[test]
    fn first_play_url_prefers_episodes() {
        let item = VideoItem { play_from: "HD".into(), play_url: "E1$https://v/1.m3u8".into(), ..Default::default() };
        assert_eq!(item.first_play_url().as_deref(), Some("https://v/1.m3u8"));
        let raw = VideoItem { play_url: "https://v/raw.mp4".into(), ..Default::default() };
        assert_eq!(raw.first_play_url().as_deref(), Some("https://v/raw.mp4"));
    }
}
