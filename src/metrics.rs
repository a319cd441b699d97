use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide request counters, exposed on `/metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub transforms: AtomicU64,
    pub errors: AtomicU64,
    pub upstream_passthroughs: AtomicU64,
    pub store_writes: AtomicU64,
    pub store_write_failures: AtomicU64,
    pub write_backs_dropped: AtomicU64,
}

impl Metrics {
    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> String {
        let counters = [
            ("thumbproxy_cache_hits_total", "Total number of cache hits", &self.cache_hits),
            ("thumbproxy_cache_misses_total", "Total number of cache misses", &self.cache_misses),
            ("thumbproxy_transforms_total", "Total number of image transformations", &self.transforms),
            ("thumbproxy_errors_total", "Total number of error responses", &self.errors),
            (
                "thumbproxy_upstream_passthroughs_total",
                "Total number of non-200 source responses relayed",
                &self.upstream_passthroughs,
            ),
            ("thumbproxy_store_writes_total", "Total number of derivatives stored", &self.store_writes),
            (
                "thumbproxy_store_write_failures_total",
                "Total number of failed store writes",
                &self.store_write_failures,
            ),
            (
                "thumbproxy_write_backs_dropped_total",
                "Total number of store writes dropped before running",
                &self.write_backs_dropped,
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}
