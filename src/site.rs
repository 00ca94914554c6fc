use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::manifest::parse_json_lenient;
use crate::types::{JavaScriptConfig, Site};
use crate::url_util::{has_extension, is_http_url, is_spider_identifier};

/// Inputs the type-inference rules look at.
pub struct TypeHints<'a> {
    pub api: &'a str,
    pub jar: &'a str,
    pub spider_class: Option<&'a str>,
}

type Rule = (&'static str, fn(&TypeHints) -> bool, i32);

/// Evaluated top to bottom; the first matching predicate decides the type.
pub const TYPE_RULES: &[Rule] = &[
    ("csp-prefix", |h: &TypeHints| h.api.starts_with("csp_"), 3),
    ("spider-class", |h: &TypeHints| h.spider_class.map(|c| !c.trim().is_empty()).unwrap_or(false), 3),
    ("js-script", |h: &TypeHints| has_extension(h.api, "js"), 3),
    ("jar", |h: &TypeHints| !h.jar.trim().is_empty(), 3),
    ("python", |h: &TypeHints| has_extension(h.api, "py"), 3),
    ("http", |h: &TypeHints| is_http_url(h.api), 1),
    ("fallback", |_: &TypeHints| true, 1),
];

/// The first matching rule's name and type.
pub fn infer_site_type(hints: &TypeHints) -> (&'static str, i32) {
    TYPE_RULES
        .iter()
        .find(|(_, pred, _)| pred(hints))
        .map(|(name, _, kind)| (*name, *kind))
        .unwrap_or(("fallback", 1))
}

/// Builds [`Site`] descriptors from script configs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SiteResolver;

impl SiteResolver {
    pub fn new() -> Self { Self }

    pub fn resolve(&self, config: &JavaScriptConfig, spider_url: Option<&str>, spider_class_name: Option<&str>) -> Option<Site> {
        let code = config.js_code.trim();
        let spider_class_name = spider_class_name.map(str::trim).filter(|c| !c.is_empty());

        let Some(manifest) = parse_json_lenient(code) else {
            if is_spider_identifier(code) {
                debug!("bare spider identifier {}", code);
                return Some(Site {
                    key: code.to_string(),
                    name: non_blank(&config.name).unwrap_or(code).to_string(),
                    api: code.to_string(),
                    ext: String::new(),
                    jar: spider_url.unwrap_or_default().to_string(),
                    kind: 3,
                    timeout: config.timeout,
                    searchable: true,
                    hide: false,
                    script: None,
                });
            }
            return script_site(config);
        };
        let obj = manifest.as_object()?;
        let top_spider = obj.get("spider").and_then(Value::as_str).and_then(non_blank);
        let jar_fallback = spider_url.and_then(non_blank).or(top_spider);
        let sites = obj.get("sites").and_then(Value::as_array).filter(|s| !s.is_empty());

        if let (Some(cls), Some(list)) = (spider_class_name, sites) {
            match list.iter().filter_map(Value::as_object).find(|s| str_field(s, "api") == cls) {
                Some(entry) => return build_site(entry, config, jar_fallback, Some(3), Some(cls)),
                None => warn!("no site with api {} in manifest; using the default entry", cls),
            }
        }

        // The class hint only describes a single-descriptor manifest
        let (entry, hint) = match sites {
            Some(list) => (list.iter().find_map(Value::as_object)?, None),
            None if obj.contains_key("api") => (obj, spider_class_name),
            None => return None,
        };
        build_site(entry, config, jar_fallback, None, hint)
    }

    /// Every usable site of a manifest, in manifest order.
    pub fn list_sites(&self, config: &JavaScriptConfig) -> Vec<Site> {
        let Some(Value::Object(obj)) = parse_json_lenient(&config.js_code) else {
            return self.resolve(config, None, None).into_iter().collect();
        };
        let jar_fallback = obj.get("spider").and_then(Value::as_str).and_then(non_blank);
        match obj.get("sites").and_then(Value::as_array) {
            Some(list) => list
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|e| build_site(e, config, jar_fallback, None, None))
                .collect(),
            None => self.resolve(config, None, None).into_iter().collect(),
        }
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let t = s.trim();
    (!t.is_empty()).then_some(t)
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a str {
    obj.get(key).and_then(Value::as_str).map(str::trim).unwrap_or("")
}

/// `ext` may be a string or an inline JSON value.
fn ext_field(obj: &Map<String, Value>) -> String {
    match obj.get("ext") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn int_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn build_site(
    entry: &Map<String, Value>,
    config: &JavaScriptConfig,
    jar_fallback: Option<&str>,
    default_type: Option<i32>,
    spider_class: Option<&str>,
) -> Option<Site> {
    let api = str_field(entry, "api");
    if api.is_empty() { return None; }
    let own_jar = str_field(entry, "jar");

    let kind = match int_field(entry, "type").and_then(|t| i32::try_from(t).ok()) {
        Some(t) => t,
        None => match default_type {
            Some(t) => t,
            None => {
                let (rule, t) = infer_site_type(&TypeHints { api, jar: own_jar, spider_class });
                debug!("site {} has no type; rule {} gives {}", api, rule, t);
                t
            }
        },
    };
    let key = non_blank(str_field(entry, "key")).unwrap_or(api).to_string();
    let name = non_blank(str_field(entry, "name")).unwrap_or(&key).to_string();
    let jar = non_blank(own_jar).or(jar_fallback).unwrap_or_default().to_string();
    let timeout = int_field(entry, "timeout").filter(|t| *t > 0).map(|t| t as u64).unwrap_or(config.timeout);

    Some(Site {
        key,
        name,
        api: api.to_string(),
        ext: ext_field(entry),
        jar,
        kind,
        timeout,
        searchable: int_field(entry, "searchable").map(|v| v == 1).unwrap_or(true),
        hide: int_field(entry, "hide").map(|v| v == 1).unwrap_or(false),
        script: None,
    })
}

/// Pasted JavaScript that is not a manifest runs as an inline script spider.
fn script_site(config: &JavaScriptConfig) -> Option<Site> {
    let code = config.js_code.trim();
    if code.is_empty() || code.starts_with('<') { return None; }
    let api = if has_extension(&config.url, "js") { config.url.clone() } else { String::new() };
    Some(Site {
        key: "script".to_string(),
        name: config.name.clone(),
        api,
        ext: String::new(),
        jar: String::new(),
        kind: 3,
        timeout: config.timeout,
        searchable: true,
        hide: false,
        script: Some(code.to_string()),
    })
}
