use std::time::Instant;
use tracing::trace;

// Request and upstream counters go out as trace events under `unimart.metrics`; the
// Prometheus handle in `main` renders only what the exporter tracks itself.

pub fn inc_requests(route: &'static str) {
    trace!(target = "unimart.metrics", route, "requests_total_inc");
}

/// Times one upstream call; `finish` emits the elapsed milliseconds and the outcome.
pub struct UpstreamTimer {
    service: &'static str,
    operation: &'static str,
    started: Instant,
}

impl UpstreamTimer {
    pub fn start(service: &'static str, operation: &'static str) -> Self {
        Self {
            service,
            operation,
            started: Instant::now(),
        }
    }

    pub fn finish(self, ok: bool) {
        trace!(
            target = "unimart.metrics",
            service = self.service,
            operation = self.operation,
            ok,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "upstream_elapsed"
        );
    }
}
