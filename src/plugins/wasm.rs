use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};
use wasmtime::{component::*, Config, Engine, Store};

use crate::plugins::config::PluginConfig;
use crate::plugins::host::Host;
use crate::plugins::spider::Spider;
use crate::plugins::SpiderPlugin;

const EPOCH_INTERVAL: Duration = Duration::from_millis(50);

/// Shared wasmtime engine plus the epoch ticker that enforces call deadlines.
pub struct SpiderEngine {
    engine: Engine,
    epoch_ticks: Arc<AtomicU64>,
    epoch_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl SpiderEngine {
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.wasm_component_model(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).context("creating wasm engine")?;

        let epoch_ticks = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        {
            let (engine, ticks, stop) = (engine.clone(), epoch_ticks.clone(), stop.clone());
            std::thread::Builder::new()
                .name("spider-epoch".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(EPOCH_INTERVAL);
                        engine.increment_epoch();
                        ticks.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .context("spawning epoch ticker")?;
        }
        Ok(Self { engine, epoch_ticks, epoch_interval: EPOCH_INTERVAL, stop })
    }
}

impl Drop for SpiderEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// One instantiated spider component. All calls are blocking.
pub(crate) struct PluginInstance {
    pub(crate) name: String,
    store: Store<Host>,
    bindings: SpiderPlugin,
    cfg: PluginConfig,
    slow_warn: Duration,
    last_call: Option<Instant>,
    epoch_ticks: Arc<AtomicU64>,
    epoch_interval: Duration,
    _instance: Instance,
    _component: Component,
}

/// A store capped at the spider's memory limit, with a far-future deadline
/// until a call sets a real one.
fn new_store(engine: &SpiderEngine, cfg: &PluginConfig) -> Store<Host> {
    let host = Host::new(cfg.allowed_hosts.as_deref(), cfg.memory_limit_bytes());
    let mut store = Store::new(&engine.engine, host);
    store.limiter(|h| &mut h.limits);
    let now = engine.epoch_ticks.load(Ordering::Relaxed);
    store.set_epoch_deadline(now.saturating_add(1_000_000_000));
    store
}

impl PluginInstance {
    pub(crate) fn new(engine: &SpiderEngine, name: &str, wasm: &[u8], cfg: PluginConfig) -> Result<Self> {
        let component = Component::from_binary(&engine.engine, wasm)
            .with_context(|| format!("compiling spider {}", name))?;

        let mut store = new_store(engine, &cfg);
        let mut linker = Linker::new(&engine.engine);
        wasmtime_wasi::p2::add_to_linker_sync(&mut linker)?;
        wasmtime_wasi_http::add_only_http_to_linker_sync(&mut linker)?;
        let instance = linker.instantiate(&mut store, &component)?;
        let bindings = SpiderPlugin::new(&mut store, &instance)?;

        Ok(Self {
            name: name.to_string(),
            store,
            bindings,
            cfg,
            slow_warn: Duration::from_secs(5),
            last_call: None,
            epoch_ticks: engine.epoch_ticks.clone(),
            epoch_interval: engine.epoch_interval,
            _instance: instance,
            _component: component,
        })
    }

    fn set_deadline(&mut self) {
        let now = self.epoch_ticks.load(Ordering::Relaxed);
        let per_tick_ms = self.epoch_interval.as_millis().max(1);
        let need = self.cfg.call_timeout().as_millis().div_ceil(per_tick_ms) as u64;
        self.store.set_epoch_deadline(now.saturating_add(need.max(1)));
    }

    fn clear_deadline(&mut self) {
        let now = self.epoch_ticks.load(Ordering::Relaxed);
        self.store.set_epoch_deadline(now.saturating_add(1_000_000_000));
    }

    fn throttle(&mut self) {
        let rate_limit = self.cfg.rate_limit();
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < rate_limit {
                std::thread::sleep(rate_limit - elapsed);
            }
        }
        self.last_call = Some(Instant::now());
    }

    fn warn_if_slow(&self, start: Instant, op: &str) {
        let elapsed = start.elapsed();
        if elapsed > self.slow_warn {
            warn!("spider {} {} took {:?}", self.name, op, elapsed);
        }
    }

    /// Run one export under a deadline. A trap fails at once; an error the
    /// guest reports itself is retried once.
    fn invoke<T, F>(&mut self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&SpiderPlugin, &mut Store<Host>) -> wasmtime::Result<std::result::Result<T, String>>,
    {
        if self.cfg.disabled() { return Err(anyhow!("spider {} has an empty host allow-list", self.name)); }
        self.throttle();
        let start = Instant::now();
        let mut outcome = Err(anyhow!("{} not attempted", op));
        for attempt in 0..2 {
            self.set_deadline();
            let res = f(&self.bindings, &mut self.store);
            self.clear_deadline();
            match res {
                Ok(Ok(v)) => { outcome = Ok(v); break; }
                Ok(Err(msg)) if attempt == 0 => {
                    debug!("spider {} {} failed: {}. Retrying...", self.name, op, msg);
                    std::thread::sleep(Duration::from_millis(200));
                }
                Ok(Err(msg)) => { outcome = Err(anyhow!("{} after retry: {}", op, msg)); }
                Err(trap) => { outcome = Err(anyhow!("{} trapped: {:#}", op, trap)); break; }
            }
        }
        self.warn_if_slow(start, op);
        outcome
    }

    pub(crate) fn init(&mut self, ext: &str) -> Result<()> {
        self.invoke("init", |b, s| b.call_init(s, ext))
    }

    pub(crate) fn home_content(&mut self, filter: bool) -> Result<String> {
        self.invoke("home-content", |b, s| b.call_home_content(s, filter))
    }

    pub(crate) fn home_video_content(&mut self) -> Result<String> {
        self.invoke("home-video-content", |b, s| b.call_home_video_content(s))
    }

    pub(crate) fn category_content(&mut self, tid: &str, page: &str, filter: bool, extend: &str) -> Result<String> {
        self.invoke("category-content", |b, s| b.call_category_content(s, tid, page, filter, extend))
    }

    pub(crate) fn detail_content(&mut self, ids: &[String]) -> Result<String> {
        self.invoke("detail-content", |b, s| b.call_detail_content(s, ids))
    }

    pub(crate) fn player_content(&mut self, flag: &str, id: &str, vip_flags: &[String]) -> Result<String> {
        self.invoke("player-content", |b, s| b.call_player_content(s, flag, id, vip_flags))
    }

    pub(crate) fn search_content(&mut self, key: &str, quick: bool) -> Result<String> {
        self.invoke("search-content", |b, s| b.call_search_content(s, key, quick))
    }
}

/// Async face of a [`PluginInstance`]; calls run on the blocking pool.
pub struct WasmSpider {
    name: String,
    inner: Arc<Mutex<PluginInstance>>,
    cfg: PluginConfig,
}

impl WasmSpider {
    pub(crate) fn new(instance: PluginInstance) -> Self {
        let cfg = instance.cfg.clone();
        Self { name: instance.name.clone(), inner: Arc::new(Mutex::new(instance)), cfg }
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PluginInstance) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| anyhow!("spider instance poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| anyhow!("spider task failed: {}", e))?
    }
}

#[async_trait]
impl Spider for WasmSpider {
    fn name(&self) -> &str { &self.name }

    async fn init(&self, ext: &str) -> Result<()> {
        let ext = ext.to_string();
        self.call(move |p| p.init(&ext)).await
    }

    async fn home_content(&self, filter: bool) -> Result<String> {
        self.call(move |p| p.home_content(filter)).await
    }

    async fn home_video_content(&self) -> Result<String> {
        self.call(|p| p.home_video_content()).await
    }

    async fn category_content(&self, tid: &str, page: &str, filter: bool, extend: &HashMap<String, String>) -> Result<String> {
        let (tid, page) = (tid.to_string(), page.to_string());
        let extend = serde_json::to_string(extend)?;
        self.call(move |p| p.category_content(&tid, &page, filter, &extend)).await
    }

    async fn detail_content(&self, ids: &[String]) -> Result<String> {
        let ids = ids.to_vec();
        self.call(move |p| p.detail_content(&ids)).await
    }

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> Result<String> {
        let (flag, id, vip) = (flag.to_string(), id.to_string(), vip_flags.to_vec());
        self.call(move |p| p.player_content(&flag, &id, &vip)).await
    }

    async fn search_content(&self, key: &str, quick: bool) -> Result<String> {
        let key = key.to_string();
        self.call(move |p| p.search_content(&key, quick)).await
    }

    fn url_allowed(&self, url: &str) -> bool {
        self.cfg.url_allowed(url)
    }
}
