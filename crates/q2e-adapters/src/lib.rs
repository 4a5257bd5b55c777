//! Remote system contracts (Quartzy inventory, eLabFTW items) + their reqwest implementations.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use q2e_core::SourceRecord;
use q2e_http::{
    build_client, expect_status, expect_success, location_id, read_json, HttpClientConfig,
    HttpError,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "q2e-adapters";

pub const DEFAULT_QUARTZY_INVENTORY_URL: &str = "https://api.quartzy.com/inventory-items";

/// Tag on every eLabFTW request so the traffic can be filtered in a proxy.
pub const PROXY_TRACE_HEADER: (&str, &str) = ("X-Proxy-Trace", "quartzy2elabftw");

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decoding {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

fn decode<T: DeserializeOwned>(value: JsonValue, context: &str) -> Result<T, AdapterError> {
    serde_json::from_value(value).map_err(|source| AdapterError::Decode {
        context: context.to_string(),
        source,
    })
}

/// One page of the inventory listing.
#[derive(Debug, Clone, PartialEq)]
pub enum InventoryPage {
    Items(Vec<JsonValue>),
    /// The endpoint answered with something other than a list (an error payload).
    Unexpected(JsonValue),
}

#[async_trait]
pub trait InventoryPager: Send + Sync {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<InventoryPage, AdapterError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationOptions {
    pub per_page: u32,
    /// Safety cap against an upstream that never returns an empty page.
    pub max_pages: u32,
    /// Pause between page requests; Quartzy answers 429 when hammered.
    pub delay: Duration,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        Self {
            per_page: 25,
            max_pages: 60,
            delay: Duration::from_millis(200),
        }
    }
}

/// Walks pages 1..=max_pages until an empty page. Any failure stops the walk and
/// keeps what was accumulated so far.
pub async fn fetch_all_raw(pager: &dyn InventoryPager, options: &PaginationOptions) -> Vec<JsonValue> {
    let mut all_items = Vec::new();
    let mut page = 1;

    while page <= options.max_pages {
        debug!(page, "fetching inventory page");
        match pager.fetch_page(page, options.per_page).await {
            Ok(InventoryPage::Items(items)) if items.is_empty() => {
                info!(page, "no more items to fetch");
                break;
            }
            Ok(InventoryPage::Items(items)) => {
                all_items.extend(items);
            }
            Ok(InventoryPage::Unexpected(payload)) => {
                error!(page, %payload, "unexpected response format");
                break;
            }
            Err(err) => {
                error!(page, error = %err, "failed to fetch inventory page");
                break;
            }
        }

        if page == options.max_pages {
            warn!(max_pages = options.max_pages, "page cap reached, inventory may be truncated");
            break;
        }
        page += 1;
        if !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
    }

    info!(total = all_items.len(), "inventory fetched");
    all_items
}

/// [`fetch_all_raw`] decoded into records. Items that fail to decode are logged and dropped.
pub async fn fetch_all_records(
    pager: &dyn InventoryPager,
    options: &PaginationOptions,
) -> Vec<SourceRecord> {
    fetch_all_raw(pager, options)
        .await
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<SourceRecord>(raw) {
            Ok(record) => Some(record),
            Err(err) => {
                error!(error = %err, "skipping undecodable inventory item");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct QuartzyConfig {
    pub inventory_url: String,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct QuartzyClient {
    client: reqwest::Client,
    inventory_url: String,
}

impl QuartzyClient {
    pub fn new(config: QuartzyConfig, http: HttpClientConfig) -> Result<Self> {
        let http = http
            .with_header("Access-Token", config.access_token)
            .with_header("Accept", "application/json");
        Ok(Self {
            client: build_client(&http)?,
            inventory_url: config.inventory_url,
        })
    }
}

#[async_trait]
impl InventoryPager for QuartzyClient {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<InventoryPage, AdapterError> {
        let response = self
            .client
            .get(&self.inventory_url)
            .query(&[("page", page), ("per_page", per_page)])
            .send()
            .await
            .map_err(HttpError::from)?;
        let response = expect_status(response, StatusCode::OK)?;
        Ok(match read_json(response).await? {
            JsonValue::Array(items) => InventoryPage::Items(items),
            other => InventoryPage::Unexpected(other),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RegistryInfo {
    #[serde(default)]
    pub elabftw_version: Option<String>,
    #[serde(default)]
    pub elabftw_version_int: Option<u64>,
}

/// An eLabFTW item type (resource category).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryItem {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    /// Raw metadata attribute: a JSON string, an embedded object, or null.
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemUpdate {
    pub title: String,
    pub body: String,
    /// Serialized metadata document.
    pub metadata: String,
}

#[async_trait]
pub trait ItemRegistry: Send + Sync {
    async fn info(&self) -> Result<RegistryInfo, AdapterError>;
    async fn list_categories(&self) -> Result<Vec<Category>, AdapterError>;
    /// Returns the new category id.
    async fn create_category(&self, title: &str, color: &str) -> Result<u64, AdapterError>;
    async fn list_items(&self, limit: usize) -> Result<Vec<RegistryItem>, AdapterError>;
    async fn get_item(&self, id: u64) -> Result<RegistryItem, AdapterError>;
    /// Returns the new item id.
    async fn create_item(&self, category_id: u64) -> Result<u64, AdapterError>;
    async fn update_item(&self, id: u64, update: &ItemUpdate) -> Result<(), AdapterError>;
    async fn lock_item(&self, id: u64) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone)]
pub struct ElabConfig {
    /// API root, e.g. `https://elab.example.org/api/v2`.
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct ElabClient {
    client: reqwest::Client,
    base_url: String,
}

impl ElabClient {
    pub fn new(config: ElabConfig, http: HttpClientConfig) -> Result<Self> {
        let http = http
            .with_header("Authorization", config.api_key)
            .with_header(PROXY_TRACE_HEADER.0, PROXY_TRACE_HEADER.1);
        Ok(Self {
            client: build_client(&http)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json(&self, path: &str) -> Result<JsonValue, AdapterError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(HttpError::from)?;
        Ok(read_json(expect_success(response)?).await?)
    }

    async fn patch(&self, id: u64, body: &impl Serialize) -> Result<(), AdapterError> {
        let response = self
            .client
            .patch(self.url(&format!("items/{id}")))
            .json(body)
            .send()
            .await
            .map_err(HttpError::from)?;
        expect_success(response)?;
        Ok(())
    }

    async fn post_for_id(&self, path: &str, body: &JsonValue) -> Result<u64, AdapterError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(HttpError::from)?;
        let response = expect_status(response, StatusCode::CREATED)?;
        Ok(location_id(&response)?)
    }
}

#[async_trait]
impl ItemRegistry for ElabClient {
    async fn info(&self) -> Result<RegistryInfo, AdapterError> {
        decode(self.get_json("info").await?, "info")
    }

    async fn list_categories(&self) -> Result<Vec<Category>, AdapterError> {
        decode(self.get_json("items_types").await?, "items_types")
    }

    async fn create_category(&self, title: &str, color: &str) -> Result<u64, AdapterError> {
        self.post_for_id("items_types", &json!({ "title": title, "color": color }))
            .await
    }

    async fn list_items(&self, limit: usize) -> Result<Vec<RegistryItem>, AdapterError> {
        decode(self.get_json(&format!("items?limit={limit}")).await?, "items")
    }

    async fn get_item(&self, id: u64) -> Result<RegistryItem, AdapterError> {
        decode(self.get_json(&format!("items/{id}")).await?, "item")
    }

    async fn create_item(&self, category_id: u64) -> Result<u64, AdapterError> {
        self.post_for_id("items", &json!({ "category_id": category_id }))
            .await
    }

    async fn update_item(&self, id: u64, update: &ItemUpdate) -> Result<(), AdapterError> {
        self.patch(id, update).await
    }

    async fn lock_item(&self, id: u64) -> Result<(), AdapterError> {
        self.patch(id, &json!({ "action": "forcelock" })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct ScriptedPager {
        pages: Vec<Result<InventoryPage, u16>>,
        requested: Mutex<Vec<u32>>,
    }

    impl ScriptedPager {
        fn new(pages: Vec<Result<InventoryPage, u16>>) -> Self {
            Self {
                pages,
                requested: Mutex::new(Vec::new()),
            }
        }

        fn sized(sizes: &[usize]) -> Self {
            let mut next_id = 0;
            let pages = sizes
                .iter()
                .map(|&size| {
                    let items = (0..size)
                        .map(|_| {
                            next_id += 1;
                            json!({ "id": format!("Q{next_id}"), "type": {"name": "Reagents"} })
                        })
                        .collect();
                    Ok(InventoryPage::Items(items))
                })
                .collect();
            Self::new(pages)
        }
    }

    #[async_trait]
    impl InventoryPager for ScriptedPager {
        async fn fetch_page(&self, page: u32, _per_page: u32) -> Result<InventoryPage, AdapterError> {
            self.requested.lock().await.push(page);
            match self.pages.get(page as usize - 1) {
                Some(Ok(p)) => Ok(p.clone()),
                Some(Err(status)) => Err(AdapterError::Http(HttpError::Status {
                    status: *status,
                    url: "https://api.quartzy.test/inventory-items".into(),
                })),
                None => Ok(InventoryPage::Items(Vec::new())),
            }
        }
    }

    fn no_delay() -> PaginationOptions {
        PaginationOptions {
            delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pagination_stops_at_first_empty_page() {
        let pager = ScriptedPager::sized(&[25, 25, 10, 0, 25]);
        let items = fetch_all_raw(&pager, &no_delay()).await;
        assert_eq!(items.len(), 60);
        assert_eq!(*pager.requested.lock().await, vec![1, 2, 3, 4]);
        assert_eq!(items[0]["id"], "Q1");
        assert_eq!(items[59]["id"], "Q60");
    }

    #[tokio::test]
    async fn error_status_keeps_partial_results() {
        let mut pages = ScriptedPager::sized(&[25, 25]).pages;
        pages.push(Err(500));
        pages.push(Ok(InventoryPage::Items(vec![json!({"id": "late"})])));
        let pager = ScriptedPager::new(pages);

        let items = fetch_all_raw(&pager, &no_delay()).await;
        assert_eq!(items.len(), 50);
        assert_eq!(*pager.requested.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn non_list_payload_aborts_pagination() {
        let mut pages = ScriptedPager::sized(&[3]).pages;
        pages.push(Ok(InventoryPage::Unexpected(json!({"error": "Unauthorized"}))));
        let pager = ScriptedPager::new(pages);

        let items = fetch_all_raw(&pager, &no_delay()).await;
        assert_eq!(items.len(), 3);
        assert_eq!(*pager.requested.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn page_cap_bounds_a_runaway_upstream() {
        let pager = ScriptedPager::sized(&[1; 10]);
        let options = PaginationOptions {
            max_pages: 4,
            ..no_delay()
        };
        let items = fetch_all_raw(&pager, &options).await;
        assert_eq!(items.len(), 4);
        assert_eq!(*pager.requested.lock().await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn records_are_decoded_in_order() {
        let pager = ScriptedPager::new(vec![Ok(InventoryPage::Items(vec![
            json!({"id": "Q1", "name": "Ethanol", "type": {"name": "Reagents"}}),
            json!({"id": 77, "name": "Tips", "type": null}),
        ]))]);
        let records = fetch_all_records(&pager, &no_delay()).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].category(), Some("Reagents"));
        assert_eq!(records[1].external_id().as_ref().map(|id| id.as_str()), Some("77"));
        assert_eq!(records[1].category(), None);
    }

    #[test]
    fn registry_items_accept_string_object_or_missing_metadata() {
        let items: Vec<RegistryItem> = serde_json::from_value(json!([
            {"id": 1, "title": "a", "metadata": "{\"extra_fields\":{}}"},
            {"id": 2, "title": "b", "metadata": {"extra_fields": {}}},
            {"id": 3, "title": "c", "metadata": null},
            {"id": 4, "category": 9}
        ]))
        .unwrap();
        assert_eq!(items.len(), 4);
        assert!(items[0].metadata.is_string());
        assert!(items[1].metadata.is_object());
        assert!(items[2].metadata.is_null());
        assert!(items[3].metadata.is_null());
        assert_eq!(items[3].title, None);
    }

    #[test]
    fn item_types_tolerate_a_missing_title() {
        let categories: Vec<Category> = serde_json::from_value(json!([
            {"id": 1, "title": "Reagents", "color": "29aeb9"},
            {"id": 2, "title": null},
            {"id": 3}
        ]))
        .unwrap();
        assert_eq!(categories[0].title.as_deref(), Some("Reagents"));
        assert_eq!(categories[1].title, None);
        assert_eq!(categories[2].title, None);
    }

    #[test]
    fn item_update_serializes_metadata_as_a_string() {
        let update = ItemUpdate {
            title: "Ethanol".into(),
            body: String::new(),
            metadata: "{\"extra_fields\":{}}".into(),
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"title": "Ethanol", "body": "", "metadata": "{\"extra_fields\":{}}"})
        );
    }

    #[test]
    fn registry_info_tolerates_missing_version() {
        let info: RegistryInfo =
            serde_json::from_value(json!({"elabftw_version": "5.2.4", "elabftw_version_int": 50204}))
                .unwrap();
        assert_eq!(info.elabftw_version_int, Some(50204));
        let empty: RegistryInfo = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty, RegistryInfo::default());
    }

    #[test]
    fn elab_client_normalizes_base_url() {
        let client = ElabClient::new(
            ElabConfig {
                base_url: "https://elab.example/api/v2/".into(),
                api_key: "key".into(),
            },
            HttpClientConfig::default(),
        )
        .unwrap();
        assert_eq!(client.url("items/3"), "https://elab.example/api/v2/items/3");
    }
}
