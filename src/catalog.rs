use std::collections::HashMap;
use std::io::Read;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Platform, Product, ProductId, TileId};
use crate::error::FlowError;
use crate::geometry::GeoBox;
use crate::query::Query;
use crate::store::Store;

pub const DEFAULT_CATALOG_URL: &str = "https://earth-search.aws.element84.com/v1";

/// Largest page requested when results are filtered client side.
const MAX_PAGE: usize = 250;

/// Archive bytes from the catalog. `resumed` is true when the server honoured
/// the requested byte offset; otherwise the stream starts at byte 0.
pub struct ArchiveStream {
    pub reader: Box<dyn Read + Send>,
    pub resumed: bool,
}

pub trait CatalogClient: Send + Sync {
    /// Products matching `query`, newest sensing date first, at most `query.max_rows`.
    fn search(&self, query: &Query) -> Result<Vec<Product>, FlowError>;
    fn download(&self, product: &Product, offset: u64) -> Result<ArchiveStream, FlowError>;
    fn is_offline(&self) -> bool {
        false
    }
}

/// Exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Same attempt count without sleeping between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        self.base_delay * self.factor.saturating_pow(attempt as u32)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, FlowError>
    where
        F: FnMut() -> Result<T, FlowError>,
    {
        let mut attempt = 0usize;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && err.is_transient() => {
                    let delay = self.delay(attempt);
                    warn!("{what} failed ({err}); retrying in {delay:?}");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// STAC item-search client.
#[derive(Clone)]
pub struct CatalogHttpClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
}

impl CatalogHttpClient {
    pub fn new(base_url: &str, credentials: Option<Credentials>) -> Result<Self, FlowError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sentinelflow/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| FlowError::Transport(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| FlowError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn authorize(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.credentials {
            Some(creds) => request.basic_auth(&creds.user, Some(&creds.password)),
            None => request,
        }
    }

    fn search_once(&self, body: &StacSearchRequest) -> Result<StacItemCollection, FlowError> {
        let response = self
            .authorize(self.client.post(format!("{}/search", self.base_url)))
            .timeout(Duration::from_secs(60))
            .json(body)
            .send()
            .map_err(|err| FlowError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalog search failed".to_string());
            return Err(FlowError::CatalogStatus { status, message });
        }
        response
            .json::<StacItemCollection>()
            .map_err(|err| FlowError::CatalogUnavailable(format!("malformed response: {err}")))
    }
}

impl CatalogClient for CatalogHttpClient {
    fn search(&self, query: &Query) -> Result<Vec<Product>, FlowError> {
        let limit = if query.tiles.is_empty() {
            query.max_rows
        } else {
            MAX_PAGE
        };
        let body = StacSearchRequest::from_query(query, limit);
        debug!(
            "POST {}/search collection={} datetime={}",
            self.base_url,
            query.platform.collection(),
            query.dates.to_interval()
        );
        let collection = self
            .retry
            .run("catalog search", || self.search_once(&body))
            .map_err(|err| match err {
                FlowError::CatalogUnavailable(_) => err,
                other => FlowError::CatalogUnavailable(other.to_string()),
            })?;

        let products = collection
            .features
            .into_iter()
            .filter_map(|item| {
                let id = item.id.clone();
                match item.into_product(query.platform) {
                    Ok(product) => Some(product),
                    Err(err) => {
                        warn!("skipping catalog item {id}: {err}");
                        None
                    }
                }
            })
            .collect();
        Ok(apply_filters(products, query))
    }

    fn download(&self, product: &Product, offset: u64) -> Result<ArchiveStream, FlowError> {
        let mut request = self.authorize(self.client.get(&product.url));
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .map_err(|err| FlowError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "archive download failed".to_string());
            return Err(FlowError::CatalogStatus {
                status: status.as_u16(),
                message,
            });
        }
        Ok(ArchiveStream {
            resumed: offset > 0 && status == StatusCode::PARTIAL_CONTENT,
            reader: Box::new(response),
        })
    }
}

/// Searches products previously recorded in the cache index. Never touches the network.
#[derive(Debug, Clone)]
pub struct OfflineCatalog {
    store: Store,
}

impl OfflineCatalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl CatalogClient for OfflineCatalog {
    fn search(&self, query: &Query) -> Result<Vec<Product>, FlowError> {
        let known = self
            .store
            .known_products()
            .into_iter()
            .filter(|product| product.platform == query.platform)
            .filter(|product| product.footprint.intersects(&query.footprint))
            .collect();
        // Archives already on disk outrank newer products that were never fetched.
        let mut matching = filter_and_sort(known, query);
        matching.sort_by_key(|product| !self.store.is_complete(&product.id));
        matching.truncate(query.max_rows);
        Ok(matching)
    }

    fn download(&self, product: &Product, _offset: u64) -> Result<ArchiveStream, FlowError> {
        Err(FlowError::ProductNotCached(product.id.to_string()))
    }

    fn is_offline(&self) -> bool {
        true
    }
}

/// Date, cloud and tile filters, newest first, truncated to the row cap.
pub fn apply_filters(products: Vec<Product>, query: &Query) -> Vec<Product> {
    let mut products = filter_and_sort(products, query);
    products.truncate(query.max_rows);
    products
}

fn filter_and_sort(mut products: Vec<Product>, query: &Query) -> Vec<Product> {
    products.retain(|product| {
        query.dates.contains(product.sensing_date())
            && product
                .cloud_cover
                .map(|cover| cover <= query.cloud_ceiling)
                .unwrap_or(true)
            && query.allows_tile(product.tile.as_ref())
    });
    products.sort_by(|a, b| b.sensed_at.cmp(&a.sensed_at).then_with(|| a.id.cmp(&b.id)));
    products
}

#[derive(Debug, Clone, Serialize)]
struct StacSearchRequest {
    bbox: [f64; 4],
    datetime: String,
    collections: Vec<String>,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<serde_json::Value>,
}

impl StacSearchRequest {
    fn from_query(query: &Query, limit: usize) -> Self {
        let cloud_filter = (query.platform.has_cloud_cover() && query.cloud_ceiling < 1.0).then(|| {
            serde_json::json!({ "eo:cloud_cover": { "lte": query.cloud_ceiling * 100.0 } })
        });
        Self {
            bbox: [
                query.footprint.west,
                query.footprint.south,
                query.footprint.east,
                query.footprint.north,
            ],
            datetime: query.dates.to_interval(),
            collections: vec![query.platform.collection().to_string()],
            limit,
            query: cloud_filter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct StacItemCollection {
    #[serde(default)]
    features: Vec<StacItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct StacItem {
    id: String,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
    properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    assets: HashMap<String, StacAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct StacAsset {
    href: String,
    #[serde(rename = "type", default)]
    media_type: Option<String>,
    #[serde(rename = "file:size", default)]
    size: Option<u64>,
    #[serde(rename = "file:checksum", default)]
    checksum: Option<String>,
}

impl StacItem {
    fn into_product(self, platform: Platform) -> Result<Product, FlowError> {
        let id: ProductId = self.id.parse()?;
        let bbox = self
            .bbox
            .filter(|bbox| bbox.len() == 4)
            .ok_or_else(|| FlowError::CatalogUnavailable(format!("item {id} has no bbox")))?;
        let footprint = GeoBox::new(bbox[0], bbox[1], bbox[2], bbox[3])?;
        let sensed_at = self
            .properties
            .get("datetime")
            .and_then(|value| value.as_str())
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.with_timezone(&Utc))
            .ok_or_else(|| FlowError::CatalogUnavailable(format!("item {id} has no datetime")))?;
        let cloud_cover = self
            .properties
            .get("eo:cloud_cover")
            .and_then(|value| value.as_f64())
            .map(|percent| (percent / 100.0).clamp(0.0, 1.0));
        let tile = self
            .properties
            .get("s2:mgrs_tile")
            .and_then(|value| value.as_str())
            .and_then(|value| value.parse::<TileId>().ok())
            .or_else(|| mgrs_from_parts(&self.properties))
            .or_else(|| id.embedded_tile());

        let (archive_key, archive) = self
            .assets
            .get_key_value("product")
            .or_else(|| {
                let mut zipped: Vec<_> = self
                    .assets
                    .iter()
                    .filter(|(_, asset)| {
                        asset
                            .media_type
                            .as_deref()
                            .map(|kind| kind.contains("zip"))
                            .unwrap_or(false)
                    })
                    .collect();
                zipped.sort_by(|a, b| a.0.cmp(b.0));
                zipped.into_iter().next()
            })
            .ok_or_else(|| {
                FlowError::CatalogUnavailable(format!("item {id} has no archive asset"))
            })?;
        let mut bands: Vec<String> = self
            .assets
            .keys()
            .filter(|key| *key != archive_key)
            .map(|key| key.to_uppercase())
            .filter(|key| is_band_name(key))
            .collect();
        bands.sort();

        Ok(Product {
            id,
            platform,
            sensed_at,
            footprint,
            cloud_cover: if platform.has_cloud_cover() {
                cloud_cover
            } else {
                None
            },
            tile,
            bands,
            url: archive.href.clone(),
            size: archive.size,
            checksum: archive.checksum.as_deref().and_then(sha256_from_multihash),
        })
    }
}

fn mgrs_from_parts(properties: &HashMap<String, serde_json::Value>) -> Option<TileId> {
    let zone = properties.get("mgrs:utm_zone")?.as_u64()?;
    let band = properties.get("mgrs:latitude_band")?.as_str()?;
    let square = properties.get("mgrs:grid_square")?.as_str()?;
    format!("{zone:02}{band}{square}").parse().ok()
}

fn is_band_name(key: &str) -> bool {
    let bytes = key.as_bytes();
    matches!(key, "VV" | "VH" | "HH" | "HV" | "B8A")
        || (bytes.len() == 3 && bytes[0] == b'B' && bytes[1..].iter().all(u8::is_ascii_digit))
}

/// Accepts a bare hex SHA-256 or a multihash with the `1220` SHA-256 prefix.
fn sha256_from_multihash(value: &str) -> Option<String> {
    let value = value.trim().to_ascii_lowercase();
    let hex = match value.len() {
        64 => value.as_str(),
        68 if value.starts_with("1220") => &value[4..],
        _ => return None,
    };
    hex.chars()
        .all(|c| c.is_ascii_hexdigit())
        .then(|| hex.to_string())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use assert_matches::assert_matches;
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::query::QueryBuilder;

    fn item_json() -> serde_json::Value {
        serde_json::json!({
            "type": "Feature",
            "id": "S2B_MSIL1C_20200720T102559_N0209_R108_T32TMS_20200720T123456",
            "bbox": [7.5, 45.9, 9.0, 46.9],
            "properties": {
                "datetime": "2020-07-20T10:25:59Z",
                "eo:cloud_cover": 35.0
            },
            "assets": {
                "product": {
                    "href": "https://example.org/S2B.zip",
                    "type": "application/zip",
                    "file:size": 1234,
                    "file:checksum": format!("1220{}", "ab".repeat(32))
                },
                "b04": { "href": "https://example.org/B04.tif" }
            }
        })
    }

    #[test]
    fn item_to_product() {
        let item: StacItem = serde_json::from_value(item_json()).unwrap();
        let product = item.into_product(Platform::Sentinel2).unwrap();
        assert_eq!(product.tile.as_ref().unwrap().as_str(), "32TMS");
        assert_eq!(product.cloud_cover, Some(0.35));
        assert_eq!(product.size, Some(1234));
        assert_eq!(product.checksum.as_deref(), Some("ab".repeat(32).as_str()));
        assert_eq!(product.bands, vec!["B04".to_string()]);
        assert_eq!(
            product.sensed_at,
            Utc.with_ymd_and_hms(2020, 7, 20, 10, 25, 59).unwrap()
        );
    }

    #[test]
    fn search_request_body() {
        let footprint = GeoBox::new(7.9, 46.4, 8.1, 46.5).unwrap();
        let query = QueryBuilder::new(footprint, NaiveDate::from_ymd_opt(2020, 8, 15).unwrap())
            .cloud_cover(Some("20"))
            .build()
            .unwrap();
        let body = serde_json::to_value(StacSearchRequest::from_query(&query, 10)).unwrap();
        assert_eq!(body["collections"][0], "sentinel-2-l1c");
        assert_eq!(body["query"]["eo:cloud_cover"]["lte"], 20.0);
        assert_eq!(body["datetime"], "2020-07-16T00:00:00Z/2020-08-15T23:59:59Z");
    }

    #[test]
    fn retry_gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: Result<(), FlowError> = RetryPolicy::immediate().run("test", || {
            calls.set(calls.get() + 1);
            Err(FlowError::CatalogStatus {
                status: 503,
                message: "busy".to_string(),
            })
        });
        assert_matches!(result, Err(FlowError::CatalogStatus { status: 503, .. }));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), FlowError> = RetryPolicy::immediate().run("test", || {
            calls.set(calls.get() + 1);
            Err(FlowError::CatalogStatus {
                status: 404,
                message: "missing".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }

    #[test]
    fn multihash_checksums() {
        assert_eq!(sha256_from_multihash("zz"), None);
        assert!(sha256_from_multihash(&"AB".repeat(32)).is_some());
    }
}
