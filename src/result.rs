//! Normalizes upstream catalog responses into [`VideoItem`] lists.
//!
//! Upstream APIs speak several dialects: MacCMS JSON (`vod_*` keys), plain
//! `{name, pic, url}` objects, MacCMS XML, and the camelCase shape produced by
//! [`to_json`]. Every function here is pure.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::types::VideoItem;

// Candidate keys per field; the first key present wins.
const ID_KEYS: &[&str] = &["vod_id", "id"];
const NAME_KEYS: &[&str] = &["vod_name", "name", "title"];
const PIC_KEYS: &[&str] = &["vod_pic", "pic", "image", "cover"];
const NOTE_KEYS: &[&str] = &["vod_remarks", "note", "remarks", "subtitle"];
const URL_KEYS: &[&str] = &["url", "vod_id", "id"];
const TYPE_KEYS: &[&str] = &["type_id", "type", "type_name"];
const VOD_ID_KEYS: &[&str] = &["vod_id", "vodId", "id"];
const YEAR_KEYS: &[&str] = &["vod_year", "year"];
const AREA_KEYS: &[&str] = &["vod_area", "area"];
const ACTOR_KEYS: &[&str] = &["vod_actor", "actor"];
const DIRECTOR_KEYS: &[&str] = &["vod_director", "director"];
const DES_KEYS: &[&str] = &["vod_content", "des", "content", "description"];
const LAST_KEYS: &[&str] = &["vod_time", "last", "update_time"];
const PLAY_URL_KEYS: &[&str] = &["vod_play_url", "play_url", "playUrl", "vod_play_urls"];
const PLAY_FROM_KEYS: &[&str] = &["vod_play_from", "play_from", "playFrom"];

/// Parse any JSON dialect. Invalid JSON yields an empty list.
pub fn from_json(text: &str) -> Vec<VideoItem> {
    let value: Value = match serde_json::from_str(text.trim()) {
        Ok(v) => v,
        Err(e) => {
            debug!("result is not JSON: {}", e);
            return Vec::new();
        }
    };
    from_value(&value)
}

pub fn from_value(value: &Value) -> Vec<VideoItem> {
    match value {
        Value::Array(arr) => items_from_array(arr),
        Value::Object(obj) => {
            if let Some(code) = obj.get("code") {
                if !code_is_ok(code) {
                    let msg = obj.get("msg").and_then(Value::as_str).unwrap_or("");
                    warn!("upstream returned code {} ({}); parsing anyway", code, msg);
                }
            }
            if let Some(arr) = obj.get("list").and_then(Value::as_array) {
                return items_from_array(arr);
            }
            match obj.get("data") {
                Some(Value::Array(arr)) => return items_from_array(arr),
                Some(Value::Object(inner)) => {
                    if let Some(arr) = inner.get("list").and_then(Value::as_array) {
                        return items_from_array(arr);
                    }
                }
                _ => {}
            }
            item_from_object(obj).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

/// Dialect 0 is MacCMS XML; every other code is JSON.
pub fn from_type(kind: i32, text: &str) -> Vec<VideoItem> {
    if kind == 0 {
        let t = text.trim_start();
        if t.starts_with('{') || t.starts_with('[') {
            return from_json(text);
        }
        return from_xml(text);
    }
    from_json(text)
}

/// `{"code":1,"list":[...]}` in the camelCase shape. `from_json` reads it back unchanged.
pub fn to_json(items: &[VideoItem]) -> String {
    serde_json::json!({ "code": 1, "list": items }).to_string()
}

fn code_is_ok(code: &Value) -> bool {
    match code {
        Value::Number(n) => n.as_i64() == Some(1) || n.as_i64() == Some(200),
        Value::String(s) => s == "1" || s == "200",
        _ => true,
    }
}

fn items_from_array(arr: &[Value]) -> Vec<VideoItem> {
    arr.iter().filter_map(Value::as_object).filter_map(item_from_object).collect()
}

fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn pick(obj: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter().find_map(|k| obj.get(*k).and_then(scalar)).unwrap_or_default()
}

/// Objects with no name, id or url are not catalog entries (e.g. `{"class":[...]}`).
fn item_from_object(obj: &Map<String, Value>) -> Option<VideoItem> {
    let item = VideoItem {
        id: pick(obj, ID_KEYS),
        name: pick(obj, NAME_KEYS),
        pic: pick(obj, PIC_KEYS),
        note: pick(obj, NOTE_KEYS),
        url: pick(obj, URL_KEYS),
        kind: pick(obj, TYPE_KEYS),
        vod_id: pick(obj, VOD_ID_KEYS),
        year: pick(obj, YEAR_KEYS),
        area: pick(obj, AREA_KEYS),
        actor: pick(obj, ACTOR_KEYS),
        director: pick(obj, DIRECTOR_KEYS),
        des: pick(obj, DES_KEYS),
        last: pick(obj, LAST_KEYS),
        play_url: pick(obj, PLAY_URL_KEYS),
        play_from: pick(obj, PLAY_FROM_KEYS),
        ..Default::default()
    };
    if item.name.is_empty() && item.id.is_empty() && item.vod_id.is_empty() && item.url.is_empty() {
        return None;
    }
    Some(item)
}

// --- MacCMS XML ---

fn cdata_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").expect("static regex"))
}

fn area_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // <area> is a void element to an HTML parser; rename it before parsing
    RE.get_or_init(|| Regex::new(r"(?i)<(/?)area>").expect("static regex"))
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Parse a MacCMS `<rss><list><video>...</video></list></rss>` document.
pub fn from_xml(text: &str) -> Vec<VideoItem> {
    let unwrapped = cdata_re().replace_all(text, |c: &regex::Captures| escape_text(&c[1]));
    let normalized = area_re().replace_all(&unwrapped, "<${1}vod-area>");
    let doc = Html::parse_document(&normalized);
    let Ok(video_sel) = Selector::parse("video") else { return Vec::new() };
    let Ok(dd_sel) = Selector::parse("dl > dd") else { return Vec::new() };

    let mut out = Vec::new();
    for video in doc.select(&video_sel) {
        let child = |name: &str| child_text(&video, name);
        let (mut flags, mut urls) = (Vec::new(), Vec::new());
        for dd in video.select(&dd_sel) {
            flags.push(dd.value().attr("flag").unwrap_or("").to_string());
            urls.push(dd.text().collect::<String>().trim().to_string());
        }
        let id = child("id");
        let tid = child("tid");
        let item = VideoItem {
            id: id.clone(),
            name: child("name"),
            pic: child("pic"),
            note: child("note"),
            url: id.clone(),
            kind: if tid.is_empty() { child("type") } else { tid },
            vod_id: id,
            year: child("year"),
            area: child("vod-area"),
            actor: child("actor"),
            director: child("director"),
            des: child("des"),
            last: child("last"),
            play_url: urls.join("$$$"),
            play_from: flags.join("$$$"),
            ..Default::default()
        };
        if !item.name.is_empty() || !item.id.is_empty() {
            out.push(item);
        }
    }
    out
}

fn child_text(el: &ElementRef<'_>, name: &str) -> String {
    Selector::parse(name)
        .ok()
        .and_then(|sel| el.select(&sel).next().map(|c| c.text().collect::<String>().trim().to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maccms_json_list() {
        let body = r#"{"code":1,"msg":"ok","list":[{"vod_id":42,"vod_name":"Film","vod_pic":"p.jpg","vod_remarks":"HD","type_id":6,"vod_year":"2020","vod_content":"desc","vod_time":"2024-01-01","vod_play_from":"m3u8","vod_play_url":"E1$https://v/1.m3u8"}]}"#;
        let items = from_json(body);
        assert_eq!(items.len(), 1);
        let it = &items[0];
        assert_eq!(it.id, "42");
        assert_eq!(it.vod_id, "42");
        assert_eq!(it.url, "42");
        assert_eq!(it.name, "Film");
        assert_eq!(it.note, "HD");
        assert_eq!(it.kind, "6");
        assert_eq!(it.des, "desc");
        assert_eq!(it.play_from, "m3u8");
        assert_eq!(it.first_play_url().as_deref(), Some("https://v/1.m3u8"));
    }

    #[test]
    fn plain_dialects_and_containers() {
        let arr = r#"[{"title":"A","cover":"c.png","url":"https://v/a.mp4"},{"name":"B","image":"b.png"}]"#;
        let items = from_json(arr);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "A");
        assert_eq!(items[0].pic, "c.png");
        assert_eq!(items[1].pic, "b.png");

        let data = r#"{"data":[{"name":"C","subtitle":"s"}]}"#;
        assert_eq!(from_json(data)[0].note, "s");

        let single = r#"{"name":"Solo","url":"https://v/s.m3u8"}"#;
        assert_eq!(from_json(single).len(), 1);
    }

    #[test]
    fn error_code_still_parses() {
        let body = r#"{"code":0,"msg":"rate limited","list":[{"name":"X"}]}"#;
        assert_eq!(from_json(body).len(), 1);
    }

    #[test]
    fn non_items_are_dropped() {
        assert!(from_json(r#"{"class":[{"type_id":"1","type_name":"Movies"}]}"#).is_empty());
        assert!(from_json("not json").is_empty());
        assert!(from_json(r#"{"code":0,"msg":"x","list":[]}"#).is_empty());
    }

    #[test]
    fn reparse_is_identity() {
        let items = vec![
            VideoItem { id: "1".into(), name: "A".into(), url: String::new(), vod_id: "9".into(), kind: "2".into(), ..Default::default() },
            VideoItem { name: "B".into(), pic: "p".into(), play_url: "x$y".into(), play_from: "f".into(), ..Default::default() },
        ];
        let once = from_json(&to_json(&items));
        assert_eq!(once, items);
        assert_eq!(from_json(&to_json(&once)), once);
    }

    #[test]
    fn maccms_xml() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="5.1"><list page="1" pagecount="1" pagesize="20" recordcount="1">
<video><last>2024-05-01 10:00:00</last><id>7</id><tid>3</tid><name><![CDATA[Some <Show>]]></name><type>Drama</type>
<pic>https://img/7.jpg</pic><lang>zh</lang><area>US</area><year>2023</year><note><![CDATA[Ep 10]]></note>
<actor><![CDATA[A, B]]></actor><director><![CDATA[D]]></director>
<dl><dd flag="m3u8"><![CDATA[E1$https://v/1.m3u8#E2$https://v/2.m3u8]]></dd><dd flag="mp4"><![CDATA[E1$https://w/1.mp4]]></dd></dl>
<des><![CDATA[Plot & more]]></des></video>
</list></rss>"#;
        let items = from_type(0, xml);
        assert_eq!(items.len(), 1);
        let it = &items[0];
        assert_eq!(it.id, "7");
        assert_eq!(it.kind, "3");
        assert_eq!(it.name, "Some <Show>");
        assert_eq!(it.area, "US");
        assert_eq!(it.des, "Plot & more");
        assert_eq!(it.play_from, "m3u8$$$mp4");
        assert_eq!(it.play_sources().len(), 2);
    }

    #[test]
    fn dialect_zero_accepts_json_bodies() {
        assert_eq!(from_type(0, r#"{"list":[{"name":"J"}]}"#).len(), 1);
        assert_eq!(from_type(2, r#"{"list":[{"name":"J"}]}"#).len(), 1);
    }
}
