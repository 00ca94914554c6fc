pub mod cache;
pub(crate) mod config;
mod host;
pub mod script;
pub mod spider;
pub mod wasm;

use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::http::{default_headers, HttpClient};
use crate::types::{Site, SpiderKind};
use crate::url_util::is_url;

pub use cache::SpiderCache;
pub use spider::{NullSpider, Spider};
pub use script::ScriptSpider;
pub use wasm::{SpiderEngine, WasmSpider};

use config::PluginConfig;
use wasm::PluginInstance;

// Host bindings for the guest world in plugin-interface
wasmtime::component::bindgen!({
    world: "spider-plugin",
    path: "plugin-interface/wit/",
});

const WASM_MAGIC: &[u8] = b"\0asm";
const ZIP_MAGIC: &[u8] = b"PK";

/// Turns a [`Site`] into a runnable [`Spider`].
pub struct SpiderLoader {
    http: Arc<dyn HttpClient>,
    config: Arc<ResolverConfig>,
    cache: SpiderCache,
    engine: Mutex<Option<Arc<SpiderEngine>>>,
}

impl SpiderLoader {
    pub fn new(http: Arc<dyn HttpClient>, config: Arc<ResolverConfig>) -> Self {
        let cache = SpiderCache::new(config.spider_cache_dir(), http.clone());
        Self { http, config, cache, engine: Mutex::new(None) }
    }

    pub fn cache(&self) -> &SpiderCache { &self.cache }

    pub async fn load(&self, site: &Site, kind: SpiderKind) -> Result<Arc<dyn Spider>> {
        let limits = PluginConfig::from_settings(&self.config.spider);
        match kind {
            SpiderKind::Python => {
                warn!("site {} is a Python spider; not supported", site.key);
                Ok(Arc::new(NullSpider::new(site.key.clone())))
            }
            SpiderKind::Script => {
                let source = match &site.script {
                    Some(code) => code.clone(),
                    None if is_url(&site.api) => self
                        .http
                        .get_text(&site.api, &default_headers(&self.config))
                        .await
                        .with_context(|| format!("fetching script {}", site.api))?,
                    None => site.api.clone(),
                };
                if source.trim().is_empty() {
                    return Err(anyhow!("script for {} is empty", site.key));
                }
                Ok(Arc::new(ScriptSpider::new(site.key.clone(), source, self.http.clone(), limits, self.config.user_agent.clone())))
            }
            SpiderKind::Plugin => {
                if site.jar.trim().is_empty() {
                    return Err(anyhow!("site {} names no spider artifact", site.key));
                }
                let bytes = self.cache.fetch(&site.jar).await?;
                let class = site.spider_class().unwrap_or(site.api.as_str()).to_string();
                let component = extract_component(&bytes, &class)?;

                let artifact = cache::ArtifactRef::parse(&site.jar);
                let limits = limits.with_override_file(&self.cache.path_for(&artifact.url).with_extension("toml"));
                let engine = self.engine()?;
                let name = site.key.clone();
                let instance = tokio::task::spawn_blocking(move || PluginInstance::new(&engine, &name, &component, limits))
                    .await
                    .map_err(|e| anyhow!("plugin load task failed: {}", e))??;
                Ok(Arc::new(WasmSpider::new(instance)))
            }
        }
    }

    // Created on first plugin load; script-only use never starts the ticker
    fn engine(&self) -> Result<Arc<SpiderEngine>> {
        let mut slot = self.engine.lock().map_err(|_| anyhow!("engine lock poisoned"))?;
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        let engine = Arc::new(SpiderEngine::new()?);
        *slot = Some(engine.clone());
        Ok(engine)
    }
}

/// The component for `class` inside a spider artifact. Accepts a bare
/// component or a zip bundle (JAR layout included).
pub fn extract_component(bytes: &[u8], class: &str) -> Result<Vec<u8>> {
    if bytes.starts_with(WASM_MAGIC) {
        return Ok(bytes.to_vec());
    }
    if !bytes.starts_with(ZIP_MAGIC) {
        return Err(anyhow!("spider artifact is neither a wasm component nor a zip bundle"));
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("opening spider bundle")?;
    let short = class.trim().trim_start_matches("csp_");
    let wanted = [
        format!("spider/{}.wasm", short),
        format!("{}.wasm", short),
        format!("com/github/catvod/spider/{}.wasm", short),
        format!("csp_{}.wasm", short),
    ];
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let pick = wanted
        .iter()
        .find(|w| names.iter().any(|n| n == *w))
        .cloned()
        .or_else(|| {
            let wasm: Vec<&String> = names.iter().filter(|n| n.ends_with(".wasm")).collect();
            (wasm.len() == 1).then(|| wasm[0].clone())
        });
    let Some(entry) = pick else {
        if names.iter().any(|n| n.ends_with(".class") || n.ends_with(".dex")) {
            return Err(anyhow!("spider bundle holds JVM bytecode only; {} cannot run here", class));
        }
        return Err(anyhow!("no component for {} in spider bundle", class));
    };
    debug!("using bundle entry {} for {}", entry, class);

    let mut file = archive.by_name(&entry)?;
    let mut out = Vec::new();
    file.read_to_end(&mut out)?;
    Ok(out)
}
