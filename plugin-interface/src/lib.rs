pub use wit_bindgen;

/// Path of the WIT package, for guests calling `wit_bindgen::generate!`.
pub const WIT_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/wit");

// Helpers for building the JSON documents a spider returns
pub mod utils {
    use serde::Serialize;
    use std::collections::HashMap;

    /// One entry of a `list` result, using the field names hosts understand.
    #[derive(Debug, Clone, Default, Serialize)]
    pub struct VodEntry {
        pub vod_id: String,
        pub vod_name: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub vod_pic: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub vod_remarks: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub vod_content: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub vod_play_from: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub vod_play_url: String,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct Category {
        pub type_id: String,
        pub type_name: String,
    }

    /// `{"code":1,"list":[...]}`
    pub fn list_result(items: &[VodEntry]) -> String {
        serde_json::json!({ "code": 1, "list": items }).to_string()
    }

    /// `{"class":[...],"list":[...]}` as returned by `home-content`.
    pub fn home_result(classes: &[Category], items: &[VodEntry]) -> String {
        serde_json::json!({ "class": classes, "list": items }).to_string()
    }

    /// `{"parse":0|1,"url":...}` as returned by `player-content`.
    pub fn player_result(url: &str, needs_parse: bool, headers: &HashMap<String, String>) -> String {
        let mut out = serde_json::json!({ "parse": if needs_parse { 1 } else { 0 }, "url": url });
        if !headers.is_empty() {
            out["header"] = serde_json::json!(headers);
        }
        out.to_string()
    }

    /// Join play lines into the `$$$` / `#` / `$` encoded `vod_play_url` form.
    pub fn encode_play_lines(lines: &[Vec<(String, String)>]) -> String {
        lines
            .iter()
            .map(|eps| eps.iter().map(|(n, u)| format!("{}${}", n, u)).collect::<Vec<_>>().join("#"))
            .collect::<Vec<_>>()
            .join("$$$")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn list_result_skips_empty_fields() {
            let out = list_result(&[VodEntry { vod_id: "1".into(), vod_name: "A".into(), ..Default::default() }]);
            let v: serde_json::Value = serde_json::from_str(&out).unwrap();
            assert_eq!(v["list"][0]["vod_id"], "1");
            assert!(v["list"][0].get("vod_pic").is_none());
        }

        #[test]
        fn play_lines_encode() {
            let lines = vec![
                vec![("E1".to_string(), "u1".to_string()), ("E2".to_string(), "u2".to_string())],
                vec![("HD".to_string(), "u3".to_string())],
            ];
            assert_eq!(encode_play_lines(&lines), "E1$u1#E2$u2$$$HD$u3");
        }

        #[test]
        fn player_result_includes_headers_when_present() {
            let mut h = HashMap::new();
            h.insert("Referer".to_string(), "https://a.example".to_string());
            let v: serde_json::Value = serde_json::from_str(&player_result("https://v/x.m3u8", false, &h)).unwrap();
            assert_eq!(v["parse"], 0);
            assert_eq!(v["header"]["Referer"], "https://a.example");
        }
    }
}
