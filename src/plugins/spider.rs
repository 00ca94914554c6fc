use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// The CatVod spider contract. Every content call returns the spider's raw
/// JSON document; normalization happens in [`crate::result`].
#[async_trait]
pub trait Spider: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, ext: &str) -> Result<()>;

    async fn home_content(&self, filter: bool) -> Result<String>;

    async fn home_video_content(&self) -> Result<String>;

    async fn category_content(&self, tid: &str, page: &str, filter: bool, extend: &HashMap<String, String>) -> Result<String>;

    async fn detail_content(&self, ids: &[String]) -> Result<String>;

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> Result<String>;

    async fn search_content(&self, key: &str, quick: bool) -> Result<String>;

    /// Whether a URL produced by this spider may be handed to callers.
    fn url_allowed(&self, _url: &str) -> bool { true }
}

/// Stands in for spiders that cannot run here (Python). Every call is empty.
pub struct NullSpider {
    name: String,
}

impl NullSpider {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into() } }
}

#[async_trait]
impl Spider for NullSpider {
    fn name(&self) -> &str { &self.name }
    async fn init(&self, _ext: &str) -> Result<()> { Ok(()) }
    async fn home_content(&self, _filter: bool) -> Result<String> { Ok(String::new()) }
    async fn home_video_content(&self) -> Result<String> { Ok(String::new()) }
    async fn category_content(&self, _tid: &str, _page: &str, _filter: bool, _extend: &HashMap<String, String>) -> Result<String> { Ok(String::new()) }
    async fn detail_content(&self, _ids: &[String]) -> Result<String> { Ok(String::new()) }
    async fn player_content(&self, _flag: &str, _id: &str, _vip_flags: &[String]) -> Result<String> { Ok(String::new()) }
    async fn search_content(&self, _key: &str, _quick: bool) -> Result<String> { Ok(String::new()) }
}
