use wasmtime::{StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::{ResourceTable, WasiCtx, WasiCtxBuilder, WasiCtxView, WasiView};
use wasmtime_wasi_http::{WasiHttpCtx, WasiHttpView};

/// Env var through which a guest learns which hosts it may return URLs for.
pub(crate) const ALLOWED_HOSTS_ENV: &str = "SPIDER_ALLOWED_HOSTS";

// Per-instance host state: WASI, outgoing HTTP and the memory cap
pub(crate) struct Host {
    pub(crate) wasi: WasiCtx,
    pub(crate) table: ResourceTable,
    pub(crate) http: WasiHttpCtx,
    pub(crate) limits: StoreLimits,
}

impl Host {
    pub(crate) fn new(allowed_hosts: Option<&[String]>, memory_limit_bytes: usize) -> Self {
        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdout().inherit_stderr();
        if let Some(list) = allowed_hosts {
            builder.env(ALLOWED_HOSTS_ENV, list.join(","));
        }
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory_limit_bytes)
            .trap_on_grow_failure(false)
            .build();
        Self { wasi: builder.build(), table: ResourceTable::new(), http: WasiHttpCtx::new(), limits }
    }
}

impl WasiView for Host {
    fn ctx(&mut self) -> WasiCtxView<'_> {
        WasiCtxView {
            ctx: &mut self.wasi,
            table: &mut self.table,
        }
    }
}

impl WasiHttpView for Host {
    fn ctx(&mut self) -> &mut WasiHttpCtx { &mut self.http }
    fn table(&mut self) -> &mut ResourceTable { &mut self.table }
}
