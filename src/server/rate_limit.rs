//! Sliding-window rate limiter for synthesis requests.
//!
//! Each client key may issue at most `max_requests` requests within any `window`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ApiError;
use super::state::AppState;

/// Sliding-window limiter keyed by client.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize, // 0 disables limiting
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self { window, max_requests, clients: Mutex::new(HashMap::new()) }
    }

    /// Limiter that lets every request through.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Record a request for `key` if the window allows it.
    ///
    /// # Errors
    /// Returns the time until the oldest request leaves the window when the limit is reached.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        if self.max_requests == 0 {
            return Ok(());
        }

        let mut clients = self.clients.lock();
        let hits = clients.entry(key.to_string()).or_default();

        while hits.front().is_some_and(|&oldest| now.duration_since(oldest) >= self.window) {
            hits.pop_front();
        }

        if hits.len() >= self.max_requests {
            let oldest = hits.front().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now.duration_since(oldest)));
        }
        hits.push_back(now);

        Ok(())
    }

    /// Drop clients whose requests have all left the window.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) -> usize {
        let window = self.window;
        let mut clients = self.clients.lock();
        clients.retain(|_, hits| hits.back().is_some_and(|&last| now.duration_since(last) < window));
        clients.len()
    }

    /// Prune idle clients once per window until `shutdown` is cancelled.
    pub async fn run_pruner(self: Arc<Self>, shutdown: CancellationToken) {
        if self.max_requests == 0 {
            return;
        }

        let mut ticker = tokio::time::interval(self.window);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.prune(),
            }
        }
    }
}

/// Client key: first `X-Forwarded-For` entry, else the peer IP, else `"unknown"`.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware rejecting requests over the limit before the handler runs.
pub async fn limit_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    let key = client_key(request.headers(), peer);

    match state.limiter.check(&key) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            debug!("Rate limit exceeded for {}", key);
            ApiError::RateLimited { retry_after }.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_allows_up_to_limit_then_blocks() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 20);
        let start = Instant::now();

        for i in 0..20 {
            assert!(limiter.check_at("client", start + Duration::from_secs(i)).is_ok());
        }

        let retry = limiter.check_at("client", start + Duration::from_secs(30)).unwrap_err();
        assert_eq!(retry, Duration::from_secs(30));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        let start = Instant::now();

        assert!(limiter.check_at("client", start).is_ok());
        assert!(limiter.check_at("client", start + Duration::from_secs(10)).is_ok());
        assert!(limiter.check_at("client", start + Duration::from_secs(59)).is_err());
        // The first request has left the window; the second one still counts.
        assert!(limiter.check_at("client", start + Duration::from_secs(60)).is_ok());
        assert!(limiter.check_at("client", start + Duration::from_secs(61)).is_err());
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
        assert!(limiter.check("b").is_err());
    }

    #[test]
    fn test_prune_drops_idle_clients() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 5);
        let start = Instant::now();

        assert!(limiter.check_at("idle", start).is_ok());
        assert!(limiter.check_at("busy", start + Duration::from_secs(50)).is_ok());

        assert_eq!(limiter.prune_at(start + Duration::from_secs(30)), 2);
        assert_eq!(limiter.prune_at(start + Duration::from_secs(70)), 1);
        assert_eq!(limiter.prune_at(start + Duration::from_secs(120)), 0);
    }

    #[test]
    fn test_disabled_limiter() {
        let limiter = RateLimiter::disabled();
        for _ in 0..1000 {
            assert!(limiter.check("client").is_ok());
        }
    }

    #[test]
    fn test_client_key_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();

        assert_eq!(client_key(&headers, Some(peer)), "10.0.0.9");
        assert_eq!(client_key(&headers, None), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_key(&headers, Some(peer)), "203.0.113.7");
    }
}
