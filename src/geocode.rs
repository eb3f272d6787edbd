//! Reverse geocoding of cluster centroids.
//!
//! Lookups are cache-first: every resolved address is kept under its
//! `"lat, lon"` key in a [`GeocodeCache`] persisted through the key-value
//! store, so reruns only hit the network for new positions.
//!
//! - Dispatch spacing: request starts are spaced a fixed interval apart
//!   (150 ms by default) to stay within the public service's usage policy
//! - Retry with exponential backoff on 429
//! - On the first network failure the partial cache is written before the
//!   error is returned, so a rerun resumes where this one stopped

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::centroid::Centroid;
use crate::error::StoreError;
use crate::store::{KvStore, TypedStore};
use crate::GpsPoint;

/// Store key of the address cache.
pub const GEOCODE_CACHE_KEY: &str = "geocode";

const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DISPATCH_INTERVAL_MS: u64 = 150;
const MAX_RETRIES: u32 = 3;

/// Address components, e.g. `"road" -> "Tremont Street"`.
pub type Address = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("geocoder returned HTTP {0}")]
    Status(u16),

    #[error("no address for {lat}, {lon}: {message}")]
    NoAddress { lat: f64, lon: f64, message: String },

    #[error("gave up after {0} rate-limited attempts")]
    RetriesExceeded(u32),

    #[error("failed to persist geocode cache: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// Cache
// ============================================================================

/// Addresses keyed by `"lat, lon"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeocodeCache {
    entries: BTreeMap<String, Address>,
}

impl GeocodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(point: &GpsPoint) -> String {
        format!("{}, {}", point.latitude, point.longitude)
    }

    pub fn load<S: KvStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        let entries: BTreeMap<String, Address> = store.get(GEOCODE_CACHE_KEY)?.unwrap_or_default();
        info!("[Geocode] {} cached addresses", entries.len());
        Ok(Self { entries })
    }

    pub fn save<S: KvStore + ?Sized>(&self, store: &mut S) -> Result<(), StoreError> {
        store.put(GEOCODE_CACHE_KEY, &self.entries)
    }

    pub fn get(&self, point: &GpsPoint) -> Option<&Address> {
        self.entries.get(&Self::key(point))
    }

    pub fn insert(&mut self, point: &GpsPoint, address: Address) {
        self.entries.insert(Self::key(point), address);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Lookup service
// ============================================================================

/// A reverse-geocoding backend.
#[allow(async_fn_in_trait)]
pub trait AddressLookup {
    async fn reverse(&self, point: GpsPoint) -> Result<Address, GeocodeError>;
}

/// Spaces out when requests START. Each caller reserves the next slot, so the
/// dispatch rate never exceeds one request per interval.
struct DispatchRateLimiter {
    state: Mutex<DispatchState>,
    interval: Duration,
}

struct DispatchState {
    next_dispatch: Instant,
    dispatched: u32,
    consecutive_429s: u32,
}

impl DispatchRateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                next_dispatch: Instant::now(),
                dispatched: 0,
                consecutive_429s: 0,
            }),
            interval,
        }
    }

    async fn wait_for_dispatch_slot(&self) -> u32 {
        let (wait_duration, dispatch_num) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let dispatch_at = state.next_dispatch.max(now);
            state.next_dispatch = dispatch_at + self.interval;
            state.dispatched += 1;
            (dispatch_at.saturating_duration_since(now), state.dispatched)
        };

        // Wait outside the lock
        if !wait_duration.is_zero() {
            debug!("[Dispatch #{}] Waiting {:?} for slot", dispatch_num, wait_duration);
            tokio::time::sleep(wait_duration).await;
        }
        dispatch_num
    }

    async fn record_success(&self) {
        self.state.lock().await.consecutive_429s = 0;
    }

    async fn record_429(&self) -> Duration {
        let count = {
            let mut state = self.state.lock().await;
            state.consecutive_429s += 1;
            state.consecutive_429s
        };
        // Exponential backoff: 1s, 2s, 4s, 8s max
        let backoff = Duration::from_millis(500 * (1 << count.min(4)));
        warn!("[Geocode] Got 429, consecutive: {}, backing off {:?}", count, backoff);
        backoff
    }
}

/// Nominatim `/reverse` response; only the parts we read.
#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for a Nominatim-compatible reverse-geocoding service.
pub struct NominatimClient {
    client: Client,
    base_url: String,
    rate_limiter: DispatchRateLimiter,
}

impl NominatimClient {
    /// Client for the public OpenStreetMap instance.
    pub fn new(user_agent: &str) -> Result<Self, GeocodeError> {
        Self::with_base_url(
            DEFAULT_BASE_URL,
            user_agent,
            Duration::from_millis(DISPATCH_INTERVAL_MS),
        )
    }

    pub fn with_base_url(
        base_url: &str,
        user_agent: &str,
        dispatch_interval: Duration,
    ) -> Result<Self, GeocodeError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter: DispatchRateLimiter::new(dispatch_interval),
        })
    }
}

impl AddressLookup for NominatimClient {
    async fn reverse(&self, point: GpsPoint) -> Result<Address, GeocodeError> {
        let url = format!("{}/reverse", self.base_url);
        let query = [
            ("format", "jsonv2".to_string()),
            ("lat", point.latitude.to_string()),
            ("lon", point.longitude.to_string()),
            ("addressdetails", "1".to_string()),
        ];

        let mut retries = 0;
        loop {
            let dispatch_num = self.rate_limiter.wait_for_dispatch_slot().await;
            let resp = self.client.get(&url).query(&query).send().await?;
            let status = resp.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(GeocodeError::RetriesExceeded(retries - 1));
                }
                let wait = self.rate_limiter.record_429().await;
                tokio::time::sleep(wait).await;
                continue;
            }
            self.rate_limiter.record_success().await;

            if !status.is_success() {
                return Err(GeocodeError::Status(status.as_u16()));
            }

            let body: ReverseResponse = resp.json().await?;
            debug!("[Dispatch #{}] {}, {} answered", dispatch_num, point.latitude, point.longitude);

            let Some(fields) = body.address else {
                return Err(GeocodeError::NoAddress {
                    lat: point.latitude,
                    lon: point.longitude,
                    message: body.error.unwrap_or_else(|| "empty response".to_string()),
                });
            };

            return Ok(fields
                .into_iter()
                .filter_map(|(k, v)| match v {
                    serde_json::Value::String(s) => Some((k, s)),
                    serde_json::Value::Number(n) => Some((k, n.to_string())),
                    _ => None,
                })
                .collect());
        }
    }
}

// ============================================================================
// Geocoder
// ============================================================================

/// Result of resolving one position.
#[derive(Debug)]
pub enum GeocodeOutcome {
    CacheHit(Address),
    Fetched(Address),
    NetworkFailure(GeocodeError),
}

/// Cache-first resolver.
pub struct Geocoder<L: AddressLookup> {
    lookup: L,
    cache: GeocodeCache,
}

impl<L: AddressLookup> Geocoder<L> {
    pub fn new(lookup: L, cache: GeocodeCache) -> Self {
        Self { lookup, cache }
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub fn into_cache(self) -> GeocodeCache {
        self.cache
    }

    pub async fn resolve(&mut self, point: GpsPoint) -> GeocodeOutcome {
        if let Some(address) = self.cache.get(&point) {
            return GeocodeOutcome::CacheHit(address.clone());
        }
        match self.lookup.reverse(point).await {
            Ok(address) => {
                self.cache.insert(&point, address.clone());
                GeocodeOutcome::Fetched(address)
            }
            Err(e) => GeocodeOutcome::NetworkFailure(e),
        }
    }
}

/// Attach an address to every centroid, returning how many were fetched.
///
/// The cache is written to `store` when done, and also before a network
/// failure is returned.
pub async fn geocode_centroids<L, S>(
    centroids: &mut [Centroid],
    geocoder: &mut Geocoder<L>,
    store: &mut S,
) -> Result<usize, GeocodeError>
where
    L: AddressLookup,
    S: KvStore + ?Sized,
{
    let start = Instant::now();
    let mut fetched = 0;
    let mut hits = 0;

    for centroid in centroids.iter_mut() {
        let point = GpsPoint::new(centroid.geo.mean_lat, centroid.geo.mean_lng);
        match geocoder.resolve(point).await {
            GeocodeOutcome::CacheHit(address) => {
                hits += 1;
                centroid.address = Some(address);
            }
            GeocodeOutcome::Fetched(address) => {
                fetched += 1;
                centroid.address = Some(address);
            }
            GeocodeOutcome::NetworkFailure(e) => {
                warn!(
                    "[Geocode] Lookup for {} failed after {} fetches, saving cache: {}",
                    centroid.cluster_id, fetched, e
                );
                if let Err(store_err) = geocoder.cache().save(store) {
                    warn!("[Geocode] Could not save cache: {}", store_err);
                }
                return Err(e);
            }
        }
    }

    geocoder.cache().save(store)?;
    info!(
        "[Geocode] {} centroids: {} cached, {} fetched in {:.2}s",
        centroids.len(),
        hits,
        fetched,
        start.elapsed().as_secs_f64()
    );
    Ok(fetched)
}
