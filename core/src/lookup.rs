//! Lookup Client: image URL to detection result, at most one request per URL
//!
//! ```text
//!   resolve(url) ──► cache ──► Ready (fresh) ─────────────► Rc<LookupResult>
//!                      │
//!                      ├──► Pending(watch::Receiver) ───► wait ───┘
//!                      │
//!                      └──► miss ──► Pending marker ──► backend ──► parse
//!                                          │                          │
//!                                          └──── Ready ◄──────────────┘
//! ```
//!
//! The pending marker is a `watch` channel. Concurrent callers for the same
//! URL subscribe to it instead of issuing their own request, so a burst of
//! identical images costs a single round trip. If the fetching future is
//! dropped before completing, its [`PendingGuard`] removes the marker so the
//! next caller starts over instead of waiting forever.
//!
//! With a request timeout and a [`DeadlineTimer`] installed, a backend call
//! that outlives the deadline is dropped and the URL resolves to a cached
//! timeout failure.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use hashbrown::HashMap;
use iris_types::{EngineConfig, FailureCachePolicy};
use tokio::sync::watch;
use url::Url;

use crate::error::LookupError;
use crate::host::DeadlineTimer;
use crate::model::LookupResult;
use crate::wire::parse_payload;

/// Transport to the detection service. Returns the raw response body.
pub trait DetectionBackend: 'static {
    fn fetch_detections(&self, image_url: &str)
    -> impl Future<Output = Result<String, LookupError>>;
}

/// Build the detection request for `image_url`.
///
/// `base_url` may carry a path prefix; the endpoint is appended below it.
pub fn detection_request_url(config: &EngineConfig, image_url: &str) -> Result<Url, LookupError> {
    let mut base =
        Url::parse(&config.base_url).map_err(|e| LookupError::InvalidUrl(e.to_string()))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    let mut url = base
        .join(config.endpoint_path.trim_start_matches('/'))
        .map_err(|e| LookupError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("url", image_url)
        .append_pair("db_name", &config.db_name);
    Ok(url)
}

/// Strip query string and fragment so sizing variants share one cache entry.
pub fn normalize_image_url(image_url: &str) -> String {
    match Url::parse(image_url) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => image_url
            .split(['?', '#'])
            .next()
            .unwrap_or(image_url)
            .to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookupOptions {
    pub failure_cache: FailureCachePolicy,
    pub normalize_urls: bool,
    /// Upper bound on one backend call. Needs a [`DeadlineTimer`].
    pub request_timeout: Option<Duration>,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for LookupOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            failure_cache: config.failure_cache_policy(),
            normalize_urls: config.normalize_urls,
            request_timeout: config.request_timeout(),
        }
    }
}

enum CacheEntry {
    Ready {
        result: Rc<LookupResult>,
        stored_at: f64,
    },
    Pending {
        marker: u64,
        rx: watch::Receiver<Option<Rc<LookupResult>>>,
    },
}

impl CacheEntry {
    /// Pending marker whose fetch is still running
    fn is_live(&self) -> bool {
        matches!(self, Self::Pending { rx, .. } if rx.has_changed().is_ok())
    }
}

enum Slot {
    Hit(Rc<LookupResult>),
    Wait(watch::Receiver<Option<Rc<LookupResult>>>),
    Fetch {
        marker: u64,
        tx: watch::Sender<Option<Rc<LookupResult>>>,
    },
}

pub struct LookupClient<B> {
    backend: B,
    options: LookupOptions,
    clock: Box<dyn Fn() -> f64>,
    timer: Option<DeadlineTimer>,
    cache: RefCell<HashMap<String, CacheEntry>>,
    /// Bumped by `clear_cache`; completions from an older epoch are not stored
    epoch: Cell<u64>,
    next_marker: Cell<u64>,
    requests: Cell<u64>,
}

impl<B: DetectionBackend> LookupClient<B> {
    /// `clock` returns monotonic milliseconds and is only consulted for
    /// failure expiry.
    pub fn new(backend: B, options: LookupOptions, clock: Box<dyn Fn() -> f64>) -> Self {
        Self {
            backend,
            options,
            clock,
            timer: None,
            cache: RefCell::new(HashMap::new()),
            epoch: Cell::new(0),
            next_marker: Cell::new(0),
            requests: Cell::new(0),
        }
    }

    /// Enforce `request_timeout` with `timer`.
    pub fn with_timer(mut self, timer: DeadlineTimer) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Resolve an image URL to its detection result.
    ///
    /// Never fails: transport and parse errors come back as a failure result,
    /// which is cached like any other.
    pub async fn resolve(&self, image_url: &str) -> Rc<LookupResult> {
        let key = self.cache_key(image_url);

        match self.claim(&key) {
            Slot::Hit(result) => result,
            Slot::Wait(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(value) => value
                    .as_ref()
                    .map(Rc::clone)
                    .unwrap_or_else(|| Rc::new(LookupResult::failure(&LookupError::Abandoned))),
                Err(_) => Rc::new(LookupResult::failure(&LookupError::Abandoned)),
            },
            Slot::Fetch { marker, tx } => {
                let mut guard = PendingGuard {
                    cache: &self.cache,
                    key,
                    marker,
                    current_epoch: &self.epoch,
                    epoch: self.epoch.get(),
                    armed: true,
                };
                self.requests.set(self.requests.get() + 1);
                tracing::debug!(url = %image_url, "[LOOKUP] Requesting detections");

                let result = match self
                    .fetch_with_deadline(image_url)
                    .await
                    .and_then(|body| parse_payload(&body))
                {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!(url = %image_url, error = %err, "[LOOKUP] Lookup failed");
                        LookupResult::failure(&err)
                    }
                };

                let result = Rc::new(result);
                guard.complete(Rc::clone(&result), (self.clock)());
                tx.send_replace(Some(Rc::clone(&result)));
                result
            }
        }
    }

    async fn fetch_with_deadline(&self, image_url: &str) -> Result<String, LookupError> {
        let fetch = self.backend.fetch_detections(image_url);
        let (Some(timeout), Some(timer)) = (self.options.request_timeout, &self.timer) else {
            return fetch.await;
        };

        let deadline = timer(timeout);
        tokio::select! {
            biased;
            body = fetch => body,
            () = deadline => {
                let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                Err(LookupError::Timeout(millis))
            }
        }
    }

    /// Cached result for `image_url`, if one is stored and still fresh
    pub fn peek(&self, image_url: &str) -> Option<Rc<LookupResult>> {
        let key = self.cache_key(image_url);
        match self.cache.borrow().get(&key) {
            Some(CacheEntry::Ready { result, stored_at }) if self.is_fresh(result, *stored_at) => {
                Some(Rc::clone(result))
            }
            _ => None,
        }
    }

    pub fn is_in_flight(&self, image_url: &str) -> bool {
        let key = self.cache_key(image_url);
        self.cache
            .borrow()
            .get(&key)
            .is_some_and(CacheEntry::is_live)
    }

    /// Forget every cached result.
    ///
    /// Live pending markers survive, so a URL never has two requests in
    /// flight. Their fetches still deliver to every waiter, including ones
    /// that joined after the clear, but the result is not stored.
    pub fn clear_cache(&self) {
        let dropped = {
            let mut cache = self.cache.borrow_mut();
            let before = cache.len();
            cache.retain(|_, entry| entry.is_live());
            before - cache.len()
        };
        self.epoch.set(self.epoch.get() + 1);
        tracing::info!(entries = dropped, "[LOOKUP] Cache cleared");
    }

    /// Backend requests issued so far
    pub fn requests_issued(&self) -> u64 {
        self.requests.get()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn cache_key(&self, image_url: &str) -> String {
        if self.options.normalize_urls {
            normalize_image_url(image_url)
        } else {
            image_url.to_string()
        }
    }

    fn claim(&self, key: &str) -> Slot {
        let mut cache = self.cache.borrow_mut();
        if let Some(entry) = cache.get(key) {
            match entry {
                CacheEntry::Ready { result, stored_at } if self.is_fresh(result, *stored_at) => {
                    return Slot::Hit(Rc::clone(result));
                }
                // A marker whose sender is gone belongs to an abandoned fetch
                CacheEntry::Pending { rx, .. } if rx.has_changed().is_ok() => {
                    return Slot::Wait(rx.clone());
                }
                _ => {}
            }
        }

        let marker = self.next_marker.get() + 1;
        self.next_marker.set(marker);
        let (tx, rx) = watch::channel(None);
        cache.insert(key.to_string(), CacheEntry::Pending { marker, rx });
        Slot::Fetch { marker, tx }
    }

    fn is_fresh(&self, result: &LookupResult, stored_at: f64) -> bool {
        if !result.is_failure() {
            return true;
        }
        match self.options.failure_cache {
            FailureCachePolicy::Forever => true,
            FailureCachePolicy::RetryAfter(ttl) => {
                (self.clock)() - stored_at < ttl.as_millis() as f64
            }
        }
    }
}

/// Owns the pending marker for one in-flight fetch.
struct PendingGuard<'a> {
    cache: &'a RefCell<HashMap<String, CacheEntry>>,
    key: String,
    marker: u64,
    current_epoch: &'a Cell<u64>,
    epoch: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn owns_marker(&self) -> bool {
        matches!(
            self.cache.borrow().get(&self.key),
            Some(CacheEntry::Pending { marker, .. }) if *marker == self.marker
        )
    }

    /// Store `result` in place of our marker, unless the cache was cleared
    /// while we were fetching; then only the marker goes.
    fn complete(&mut self, result: Rc<LookupResult>, stored_at: f64) {
        self.armed = false;
        if !self.owns_marker() {
            return;
        }
        let mut cache = self.cache.borrow_mut();
        if self.current_epoch.get() == self.epoch {
            cache.insert(self.key.clone(), CacheEntry::Ready { result, stored_at });
        } else {
            cache.remove(&self.key);
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.owns_marker() {
            self.cache.borrow_mut().remove(&self.key);
            tracing::debug!(key = %self.key, "[LOOKUP] Abandoned in-flight lookup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::deadline_timer;
    use crate::testing::{TestBackend, TestHost};

    const URL: &str = "https://shop.example/look.jpg";
    const BODY: &str = r#"{"exists": true, "has_product_detections": true, "detections": [
        {"point": {"x": 0.2, "y": 0.8}, "product_predictions": [
            {"product_url": "/p/1", "product_title": "Shoe", "product_price": "$50"}
        ]}
    ]}"#;

    fn client(backend: &TestBackend) -> LookupClient<TestBackend> {
        LookupClient::new(backend.clone(), LookupOptions::default(), Box::new(|| 0.0))
    }

    #[tokio::test]
    async fn test_cached_result_short_circuits() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        let client = client(&backend);

        let first = client.resolve(URL).await;
        let second = client.resolve(URL).await;

        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(backend.call_count(), 1);
        assert_eq!(client.requests_issued(), 1);
        assert!(first.has_product_detections);
        assert!(client.peek(URL).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_request() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        backend.hold();
        let client = client(&backend);

        let release = async {
            tokio::task::yield_now().await;
            assert!(client.is_in_flight(URL));
            backend.release();
        };
        let (a, b, c, ()) = tokio::join!(
            client.resolve(URL),
            client.resolve(URL),
            client.resolve(URL),
            release
        );

        assert_eq!(backend.call_count(), 1);
        assert!(Rc::ptr_eq(&a, &b));
        assert!(Rc::ptr_eq(&b, &c));
        assert!(!client.is_in_flight(URL));
    }

    #[tokio::test]
    async fn test_failure_is_cached() {
        let backend = TestBackend::new();
        backend.fail(URL, LookupError::Status(503));
        let client = client(&backend);

        let first = client.resolve(URL).await;
        assert!(first.is_failure());
        assert!(!first.exists);

        // Backend recovered, but the default policy keeps the failure.
        backend.respond(URL, BODY);
        let second = client.resolve(URL).await;
        assert!(second.is_failure());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_retried_after_ttl() {
        let backend = TestBackend::new();
        backend.fail(URL, LookupError::Network("offline".to_string()));
        let now = Rc::new(Cell::new(0.0));
        let clock = Rc::clone(&now);
        let client = LookupClient::new(
            backend.clone(),
            LookupOptions {
                failure_cache: FailureCachePolicy::RetryAfter(Duration::from_millis(1000)),
                ..LookupOptions::default()
            },
            Box::new(move || clock.get()),
        );

        assert!(client.resolve(URL).await.is_failure());

        backend.respond(URL, BODY);
        now.set(500.0);
        assert!(client.resolve(URL).await.is_failure());
        assert_eq!(backend.call_count(), 1);

        now.set(1500.0);
        let recovered = client.resolve(URL).await;
        assert!(!recovered.is_failure());
        assert_eq!(backend.call_count(), 2);

        // Successes never expire
        now.set(1_000_000.0);
        client.resolve(URL).await;
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_body_becomes_failure() {
        let backend = TestBackend::new();
        backend.respond(URL, "<html>bad gateway</html>");
        let client = client(&backend);

        let result = client.resolve(URL).await;
        assert!(result.is_failure());
        assert!(
            result
                .error
                .as_deref()
                .unwrap_or_default()
                .starts_with("malformed detection payload")
        );
    }

    #[tokio::test]
    async fn test_sizing_parameters_share_an_entry() {
        let backend = TestBackend::new();
        let client = client(&backend);

        client.resolve("https://shop.example/look.jpg?w=400").await;
        client.resolve("https://shop.example/look.jpg?w=800#zoom").await;

        assert_eq!(backend.call_count(), 1);
        assert_eq!(backend.calls(), vec!["https://shop.example/look.jpg?w=400"]);
        assert_eq!(client.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_exact_urls_when_normalization_disabled() {
        let backend = TestBackend::new();
        let client = LookupClient::new(
            backend.clone(),
            LookupOptions {
                normalize_urls: false,
                ..LookupOptions::default()
            },
            Box::new(|| 0.0),
        );

        client.resolve("https://shop.example/look.jpg?w=400").await;
        client.resolve("https://shop.example/look.jpg?w=800").await;
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_fetch_does_not_poison_cache() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        backend.hold();
        let client = client(&backend);

        tokio::select! {
            biased;
            _ = client.resolve(URL) => panic!("held lookup completed"),
            _ = tokio::task::yield_now() => {}
        }

        assert!(!client.is_in_flight(URL));
        assert_eq!(client.cached_len(), 0);

        backend.release();
        let result = client.resolve(URL).await;
        assert!(result.exists);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_refetch() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        let client = client(&backend);

        client.resolve(URL).await;
        client.clear_cache();
        assert_eq!(client.cached_len(), 0);
        assert!(client.peek(URL).is_none());

        client.resolve(URL).await;
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_during_flight_is_not_stored() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        backend.hold();
        let client = client(&backend);

        let clear = async {
            tokio::task::yield_now().await;
            client.clear_cache();
            backend.release();
        };
        let (result, ()) = tokio::join!(client.resolve(URL), clear);

        assert!(result.exists);
        assert_eq!(client.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_clear_during_flight_keeps_single_request() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        backend.hold();
        let client = client(&backend);

        let after_clear = async {
            tokio::task::yield_now().await;
            client.clear_cache();
            assert!(client.is_in_flight(URL));
            client.resolve(URL).await
        };
        let release = async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            assert_eq!(backend.call_count(), 1);
            backend.release();
        };
        let (first, second, ()) = tokio::join!(client.resolve(URL), after_clear, release);

        assert_eq!(backend.call_count(), 1);
        assert!(Rc::ptr_eq(&first, &second));
        assert!(!client.is_in_flight(URL));
        assert_eq!(client.cached_len(), 0);

        // Nothing was stored, so the next resolve asks again
        client.resolve(URL).await;
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_keeps_in_flight_marker_only() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        let client = client(&backend);
        client.resolve("https://shop.example/other.jpg").await;
        backend.hold();

        let clear = async {
            tokio::task::yield_now().await;
            client.clear_cache();
            assert_eq!(client.cached_len(), 1);
            backend.release();
        };
        tokio::join!(client.resolve(URL), clear);
        assert_eq!(client.cached_len(), 0);
    }

    #[test]
    fn test_default_options_follow_engine_defaults() {
        let options = LookupOptions::default();
        assert!(options.normalize_urls);
        assert_eq!(options.failure_cache, FailureCachePolicy::Forever);
        assert_eq!(
            options.request_timeout,
            EngineConfig::default().request_timeout()
        );
    }

    #[tokio::test]
    async fn test_hung_request_times_out() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        backend.hold();
        let host = TestHost::new();
        let client = LookupClient::new(
            backend.clone(),
            LookupOptions {
                request_timeout: Some(Duration::from_millis(5000)),
                ..LookupOptions::default()
            },
            Box::new(|| 0.0),
        )
        .with_timer(deadline_timer(&host));

        let expire = async {
            tokio::task::yield_now().await;
            assert!(client.is_in_flight(URL));
            host.advance(4999.0);
            tokio::task::yield_now().await;
            assert!(client.is_in_flight(URL));
            host.advance(1.0);
        };
        let (result, ()) = tokio::join!(client.resolve(URL), expire);

        assert!(result.is_failure());
        assert_eq!(
            result.error.as_deref(),
            Some("request timed out after 5000 ms")
        );
        assert!(!client.is_in_flight(URL));
        assert!(client.peek(URL).is_some_and(|r| r.is_failure()));
    }

    #[tokio::test]
    async fn test_fast_response_beats_deadline() {
        let backend = TestBackend::new();
        backend.respond(URL, BODY);
        let host = TestHost::new();
        let client = LookupClient::new(backend.clone(), LookupOptions::default(), Box::new(|| 0.0))
            .with_timer(deadline_timer(&host));

        let result = client.resolve(URL).await;
        assert!(!result.is_failure());

        // The deadline firing later changes nothing
        host.advance(60_000.0);
        assert!(client.peek(URL).is_some_and(|r| !r.is_failure()));
    }

    #[test]
    fn test_request_url_shape() {
        let config = EngineConfig::default();
        let url = detection_request_url(&config, "https://shop.example/a.jpg?w=800").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:5000/get-detections?url=https%3A%2F%2Fshop.example%2Fa.jpg%3Fw%3D800&db_name=default"
        );
    }

    #[test]
    fn test_request_url_keeps_base_path() {
        let config = EngineConfig {
            base_url: "https://api.example/v2".to_string(),
            endpoint_path: "/get-detections".to_string(),
            db_name: "fashion".to_string(),
            ..EngineConfig::default()
        };
        let url = detection_request_url(&config, "https://shop.example/a.jpg").unwrap();
        assert!(url.as_str().starts_with("https://api.example/v2/get-detections?"));
        assert!(url.as_str().ends_with("db_name=fashion"));
    }

    #[test]
    fn test_normalize_image_url() {
        assert_eq!(
            normalize_image_url("https://shop.example/a.jpg?w=800&q=70#top"),
            "https://shop.example/a.jpg"
        );
        assert_eq!(normalize_image_url("/relative/a.jpg?w=1"), "/relative/a.jpg");
    }
}
