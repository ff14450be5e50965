use reqwest::Client;
use std::time::Duration;

/// Upstream timeouts. Calls are fail-fast: bounded by these and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Timeouts {
    pub fn from_env() -> Self {
        Self::parse(
            std::env::var("HTTP_TIMEOUT_SECS").ok().as_deref(),
            std::env::var("HTTP_CONNECT_TIMEOUT_SECS").ok().as_deref(),
        )
    }

    fn parse(request: Option<&str>, connect: Option<&str>) -> Self {
        let secs = |raw: Option<&str>, default: u64| {
            raw.and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        Self {
            request: Duration::from_secs(secs(request, 30)),
            connect: Duration::from_secs(secs(connect, 5)),
        }
    }
}

/// Client for one upstream (`media`, `mail`, `store`); the name ends up in the user agent.
pub fn build_client(upstream: &'static str) -> Client {
    let timeouts = Timeouts::from_env();
    Client::builder()
        .timeout(timeouts.request)
        .connect_timeout(timeouts.connect)
        .user_agent(format!(
            "unimart-api-rs/{} ({upstream})",
            env!("CARGO_PKG_VERSION")
        ))
        .build()
        .unwrap_or_else(|_| Client::new())
}
