//! Sync pipeline: configuration, category reconciliation and item upsert.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use q2e_adapters::{
    fetch_all_raw, fetch_all_records, AdapterError, Category, ElabClient, ElabConfig, InventoryPager,
    ItemRegistry, ItemUpdate, PaginationOptions, QuartzyClient, QuartzyConfig, RegistryInfo,
    RegistryItem, DEFAULT_QUARTZY_INVENTORY_URL,
};
use q2e_core::{
    build_metadata, linked_identifier, parse_metadata_blob, technical_details_html, ExternalId,
    MappingError, SourceRecord,
};
use q2e_http::HttpClientConfig;
use rand::Rng;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "q2e-sync";

/// eLabFTW 5.3 reworked item types and templates.
pub const ITEM_TYPES_REWORK_VERSION: u64 = 50300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("failed to decode CATEGORIES environment variable: {0}")]
    InvalidCategories(#[source] serde_json::Error),
    #[error("CATEGORIES cannot be an empty array")]
    EmptyCategories,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub quartzy_token: String,
    pub inventory_url: String,
    /// Quartzy `type.name` labels to import; everything else is ignored.
    pub allowed_categories: Vec<String>,
    pub elab_base_url: String,
    pub elab_api_key: String,
    pub per_page: u32,
    pub max_pages: u32,
    pub page_delay_ms: u64,
    /// `limit` for the single eLabFTW item listing; must cover the whole synced corpus.
    pub items_limit: usize,
    pub proxy: Option<String>,
    pub ca_cert_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub insecure: bool,
}

impl SyncConfig {
    /// Reads `.env` (if any) then the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let quartzy_token = require("QUARTZY_TOKEN")?;
        let categories_raw = require("CATEGORIES")?;
        let allowed_categories: Vec<String> =
            serde_json::from_str(&categories_raw).map_err(ConfigError::InvalidCategories)?;
        if allowed_categories.is_empty() {
            return Err(ConfigError::EmptyCategories);
        }
        let elab_base_url = require("ELABFTW_HOST_URL")?;
        let elab_api_key = require("ELABFTW_API_KEY")?;

        let defaults = PaginationOptions::default();
        Ok(Self {
            quartzy_token,
            inventory_url: get("QUARTZY_API_INVENTORY_URL")
                .unwrap_or_else(|| DEFAULT_QUARTZY_INVENTORY_URL.to_string()),
            allowed_categories,
            elab_base_url,
            elab_api_key,
            per_page: get("QUARTZY_PER_PAGE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.per_page),
            max_pages: get("QUARTZY_MAX_PAGES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_pages),
            page_delay_ms: get("QUARTZY_PAGE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.delay.as_millis() as u64),
            items_limit: get("ELABFTW_ITEMS_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1500),
            proxy: get("HTTPS_PROXY").or_else(|| get("HTTP_PROXY")),
            ca_cert_path: get("CA_PATH")
                .or_else(|| get("REQUESTS_CA_BUNDLE"))
                .map(PathBuf::from),
            http_timeout_secs: get("Q2E_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            insecure: false,
        })
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            accept_invalid_certs: self.insecure,
            proxy: self.proxy.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            ..Default::default()
        }
    }

    pub fn pagination(&self) -> PaginationOptions {
        PaginationOptions {
            per_page: self.per_page,
            max_pages: self.max_pages,
            delay: Duration::from_millis(self.page_delay_ms),
        }
    }
}

/// Keeps the records whose category label is on the allow-list.
pub fn filter_allowed(records: Vec<SourceRecord>, allowed: &[String]) -> Vec<SourceRecord> {
    records
        .into_iter()
        .filter(|r| r.category().is_some_and(|c| allowed.iter().any(|a| a == c)))
        .collect()
}

/// Destination category title → item type id.
pub type CategoryMap = HashMap<String, u64>;

/// Indexes existing item types by title. Untitled ones cannot match a label and are skipped.
pub fn category_map(categories: Vec<Category>) -> CategoryMap {
    categories
        .into_iter()
        .filter_map(|c| match c.title {
            Some(title) if !title.is_empty() => Some((title, c.id)),
            _ => {
                debug!(id = c.id, "skipping untitled category");
                None
            }
        })
        .collect()
}

pub fn distinct_categories(records: &[SourceRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| r.category())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn random_color() -> String {
    format!("#{:06x}", rand::thread_rng().gen_range(0..=0xFF_FFFFu32))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub created: Vec<String>,
    pub failed: Vec<String>,
}

/// Creates every category referenced by `records` that `categories` lacks, recording
/// the new ids in place. Failures are logged; records in those categories get skipped later.
pub async fn reconcile_categories(
    registry: &dyn ItemRegistry,
    records: &[SourceRecord],
    categories: &mut CategoryMap,
) -> CategoryReport {
    let mut report = CategoryReport::default();

    for label in distinct_categories(records) {
        if categories.contains_key(&label) {
            debug!(category = %label, "category already exists");
            continue;
        }
        match registry.create_category(&label, &random_color()).await {
            Ok(id) => {
                debug!(category = %label, id, "created category");
                categories.insert(label.clone(), id);
                report.created.push(label);
            }
            Err(err) => {
                error!(category = %label, error = %err, "failed to create category");
                report.failed.push(label);
            }
        }
    }

    report
}

/// Maps each Quartzy ID found in destination metadata to its item id. Items without
/// metadata count as never synced; undecodable metadata is logged and skipped.
pub fn index_linked_items(items: &[RegistryItem]) -> HashMap<ExternalId, u64> {
    let mut linked = HashMap::new();
    for item in items {
        let metadata = match parse_metadata_blob(&item.metadata) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => continue,
            Err(err) => {
                error!(item_id = item.id, error = %err, "failed to parse metadata");
                continue;
            }
        };
        if let Some(qid) = linked_identifier(&metadata) {
            if let Some(previous) = linked.insert(qid.clone(), item.id) {
                warn!(%qid, previous, item_id = item.id, "Quartzy ID linked to several items");
            }
        }
    }
    linked
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingCategory(String),
    MissingIdentifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Created(u64),
    Updated(u64),
    Unchanged(u64),
    Skipped(SkipReason),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("metadata: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncStats {
    pub fn record(&mut self, result: &Result<SyncOutcome, SyncError>) {
        match result {
            Ok(SyncOutcome::Created(_)) => self.created += 1,
            Ok(SyncOutcome::Updated(_)) => self.updated += 1,
            Ok(SyncOutcome::Unchanged(_)) => self.unchanged += 1,
            Ok(SyncOutcome::Skipped(_)) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.skipped + self.failed
    }
}

pub struct UpsertEngine<'a> {
    registry: &'a dyn ItemRegistry,
    categories: &'a CategoryMap,
    linked: HashMap<ExternalId, u64>,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(
        registry: &'a dyn ItemRegistry,
        categories: &'a CategoryMap,
        linked: HashMap<ExternalId, u64>,
    ) -> Self {
        Self {
            registry,
            categories,
            linked,
        }
    }

    pub fn linked(&self) -> &HashMap<ExternalId, u64> {
        &self.linked
    }

    pub async fn sync_record(&mut self, record: &SourceRecord) -> Result<SyncOutcome, SyncError> {
        let label = record.category().unwrap_or_default();
        let Some(&category_id) = self.categories.get(label) else {
            warn!(item = record.display_name(), category = label, "no category mapping, skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::MissingCategory(label.to_string())));
        };
        let Some(qid) = record.external_id() else {
            warn!(item = record.display_name(), "skipping item (missing Quartzy ID)");
            return Ok(SyncOutcome::Skipped(SkipReason::MissingIdentifier));
        };

        let metadata = build_metadata(record)?;
        let update = ItemUpdate {
            title: record.display_name().to_string(),
            body: technical_details_html(record.technical_details_text().as_deref()),
            metadata: metadata.to_json_string()?,
        };

        if let Some(&item_id) = self.linked.get(&qid) {
            let existing = self.registry.get_item(item_id).await?;
            let existing = parse_metadata_blob(&existing.metadata)?;
            if !metadata.differs_from(existing.as_ref())? {
                return Ok(SyncOutcome::Unchanged(item_id));
            }
            self.registry.update_item(item_id, &update).await?;
            self.registry.lock_item(item_id).await?;
            debug!(item = %update.title, item_id, "updated item");
            return Ok(SyncOutcome::Updated(item_id));
        }

        let item_id = self.registry.create_item(category_id).await?;
        self.linked.insert(qid, item_id);
        self.registry.update_item(item_id, &update).await?;
        self.registry.lock_item(item_id).await?;
        debug!(item = %update.title, item_id, "created item");
        Ok(SyncOutcome::Created(item_id))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_items: usize,
    pub filtered_items: usize,
    pub categories: CategoryReport,
    pub stats: SyncStats,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn InventoryPager>,
    registry: Box<dyn ItemRegistry>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let source = QuartzyClient::new(
            QuartzyConfig {
                inventory_url: config.inventory_url.clone(),
                access_token: config.quartzy_token.clone(),
            },
            config.http_config(),
        )
        .context("building Quartzy client")?;
        let registry = ElabClient::new(
            ElabConfig {
                base_url: config.elab_base_url.clone(),
                api_key: config.elab_api_key.clone(),
            },
            config.http_config(),
        )
        .context("building eLabFTW client")?;
        Ok(Self::with_clients(config, Box::new(source), Box::new(registry)))
    }

    pub fn with_clients(
        config: SyncConfig,
        source: Box<dyn InventoryPager>,
        registry: Box<dyn ItemRegistry>,
    ) -> Self {
        Self {
            config,
            source,
            registry,
        }
    }

    pub async fn check_version(&self) -> Result<RegistryInfo> {
        let info = self.registry.info().await.context("reading eLabFTW info")?;
        let version = info.elabftw_version.as_deref().unwrap_or("unknown");
        let version_int = info.elabftw_version_int.unwrap_or(0);
        debug!(version, version_int, "eLabFTW version");
        if version_int >= ITEM_TYPES_REWORK_VERSION {
            warn!(version, "eLabFTW 5.3+ changed resource categories and templates");
        }
        Ok(info)
    }

    /// Complete, unfiltered Quartzy inventory as served.
    pub async fn dump_inventory(&self) -> Vec<JsonValue> {
        fetch_all_raw(self.source.as_ref(), &self.config.pagination()).await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let registry = self.registry.as_ref();
        debug!(categories = ?self.config.allowed_categories, "categories allowed");

        self.check_version().await?;

        let fetched = fetch_all_records(self.source.as_ref(), &self.config.pagination()).await;
        let fetched_items = fetched.len();
        let records = filter_allowed(fetched, &self.config.allowed_categories);
        debug!(filtered = records.len(), "filtered Quartzy items");

        let mut categories = category_map(
            registry
                .list_categories()
                .await
                .context("listing eLabFTW item types")?,
        );
        debug!("syncing resources categories");
        let category_report = reconcile_categories(registry, &records, &mut categories).await;

        let items = registry
            .list_items(self.config.items_limit)
            .await
            .context("listing eLabFTW items")?;
        let linked = index_linked_items(&items);
        debug!(linked = linked.len(), "found existing items with Quartzy ID");

        let mut engine = UpsertEngine::new(registry, &categories, linked);
        let mut stats = SyncStats::default();
        for record in &records {
            debug!(item = record.display_name(), "handling item");
            let result = engine.sync_record(record).await;
            if let Err(err) = &result {
                error!(item = record.display_name(), error = %err, "exception on item");
            }
            stats.record(&result);
        }

        log_totals(&stats, records.len());

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched_items,
            filtered_items: records.len(),
            categories: category_report,
            stats,
        })
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn log_totals(stats: &SyncStats, total: usize) {
    if stats.created == 0 {
        info!("Done: 0/{total} item{} needed import.", plural(total));
    } else {
        info!(
            "Done: {}/{total} item{} successfully imported.",
            stats.created,
            plural(stats.created)
        );
    }
    if stats.updated == 0 {
        info!("Done: 0/{total} item{} needed update.", plural(total));
    } else {
        info!(
            "Done: {}/{total} item{} successfully updated.",
            stats.updated,
            plural(stats.updated)
        );
    }
    if stats.skipped > 0 || stats.failed > 0 {
        warn!(skipped = stats.skipped, failed = stats.failed, "some items were not synced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("QUARTZY_TOKEN", "qt"),
        ("CATEGORIES", r#"["Reagents", "Antibodies"]"#),
        ("ELABFTW_HOST_URL", "https://elab.example/api/v2"),
        ("ELABFTW_API_KEY", "3-abc"),
    ];

    fn record(value: JsonValue) -> SourceRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn config_reads_required_and_defaults() {
        let config = SyncConfig::from_lookup(env(&REQUIRED)).unwrap();
        assert_eq!(config.allowed_categories, vec!["Reagents", "Antibodies"]);
        assert_eq!(config.inventory_url, DEFAULT_QUARTZY_INVENTORY_URL);
        assert_eq!(config.per_page, 25);
        assert_eq!(config.max_pages, 60);
        assert_eq!(config.page_delay_ms, 200);
        assert_eq!(config.items_limit, 1500);
        assert_eq!(config.proxy, None);
        assert!(!config.insecure);
    }

    #[test]
    fn config_picks_up_proxy_and_ca_fallbacks() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("HTTP_PROXY", "http://proxy:3128"));
        pairs.push(("REQUESTS_CA_BUNDLE", "/etc/ssl/lab-ca.pem"));
        pairs.push(("QUARTZY_MAX_PAGES", "80"));
        let config = SyncConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.ca_cert_path, Some(PathBuf::from("/etc/ssl/lab-ca.pem")));
        assert_eq!(config.max_pages, 80);
    }

    #[test]
    fn config_rejects_missing_or_malformed_values() {
        let missing_token: Vec<_> = REQUIRED[1..].to_vec();
        assert!(matches!(
            SyncConfig::from_lookup(env(&missing_token)),
            Err(ConfigError::Missing("QUARTZY_TOKEN"))
        ));

        let mut blank_key = REQUIRED.to_vec();
        blank_key[3] = ("ELABFTW_API_KEY", "  ");
        assert!(matches!(
            SyncConfig::from_lookup(env(&blank_key)),
            Err(ConfigError::Missing("ELABFTW_API_KEY"))
        ));

        let mut bad = REQUIRED.to_vec();
        bad[1] = ("CATEGORIES", "Reagents");
        assert!(matches!(
            SyncConfig::from_lookup(env(&bad)),
            Err(ConfigError::InvalidCategories(_))
        ));

        let mut empty = REQUIRED.to_vec();
        empty[1] = ("CATEGORIES", "[]");
        assert!(matches!(
            SyncConfig::from_lookup(env(&empty)),
            Err(ConfigError::EmptyCategories)
        ));
    }

    #[test]
    fn allow_list_filters_by_category_label() {
        let records = vec![
            record(json!({"id": "Q1", "type": {"name": "Reagents"}})),
            record(json!({"id": "Q2", "type": {"name": "Equipment"}})),
            record(json!({"id": "Q3"})),
            record(json!({"id": "Q4", "type": {"name": "Antibodies"}})),
        ];
        let allowed = vec!["Reagents".to_string(), "Antibodies".to_string()];
        let kept: Vec<_> = filter_allowed(records, &allowed)
            .into_iter()
            .filter_map(|r| r.external_id().map(|id| id.to_string()))
            .collect();
        assert_eq!(kept, vec!["Q1", "Q4"]);
    }

    #[test]
    fn distinct_categories_are_sorted() {
        let records = vec![
            record(json!({"type": {"name": "Reagents"}})),
            record(json!({"type": {"name": "Antibodies"}})),
            record(json!({"type": {"name": "Reagents"}})),
        ];
        assert_eq!(distinct_categories(&records), vec!["Antibodies", "Reagents"]);
    }

    #[test]
    fn untitled_categories_are_left_out_of_the_map() {
        let categories: Vec<Category> = serde_json::from_value(json!([
            {"id": 1, "title": "Reagents"},
            {"id": 2, "title": null},
            {"id": 3},
            {"id": 4, "title": ""}
        ]))
        .unwrap();
        let map = category_map(categories);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("Reagents"), Some(&1));
    }

    #[test]
    fn random_colors_are_hex_triplets() {
        for _ in 0..50 {
            let color = random_color();
            assert_eq!(color.len(), 7);
            assert!(color.starts_with('#'));
            assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn index_links_items_by_quartzy_id() {
        let items: Vec<RegistryItem> = serde_json::from_value(json!([
            {"id": 10, "metadata": "{\"extra_fields\":{\"Quartzy ID\":{\"type\":\"text\",\"value\":\"Q1\"}}}"},
            {"id": 11, "metadata": {"extra_fields": {"Quartzy ID": {"type": "text", "value": 42}}}},
            {"id": 12, "metadata": null},
            {"id": 13, "metadata": "{broken"},
            {"id": 14, "metadata": {"extra_fields": {"Name": {"type": "text", "value": "x"}}}}
        ]))
        .unwrap();
        let linked = index_linked_items(&items);
        assert_eq!(linked.len(), 2);
        assert_eq!(linked.get(&ExternalId::new("Q1").unwrap()), Some(&10));
        assert_eq!(linked.get(&ExternalId::new("42").unwrap()), Some(&11));
    }

    #[test]
    fn stats_aggregate_outcomes() {
        let mut stats = SyncStats::default();
        stats.record(&Ok(SyncOutcome::Created(1)));
        stats.record(&Ok(SyncOutcome::Updated(2)));
        stats.record(&Ok(SyncOutcome::Unchanged(3)));
        stats.record(&Ok(SyncOutcome::Skipped(SkipReason::MissingIdentifier)));
        stats.record(&Err(SyncError::Mapping(MappingError::EmptyMetadata {
            name: "x".into(),
        })));
        assert_eq!(
            stats,
            SyncStats {
                created: 1,
                updated: 1,
                unchanged: 1,
                skipped: 1,
                failed: 1,
            }
        );
        assert_eq!(stats.total(), 5);
    }
}
