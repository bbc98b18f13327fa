//! Ingestion pipeline: provider search, normalization, and per-record upserts,
//! plus the explicit application configuration shared by the binaries.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bizsync_adapters::{
    FixtureProvider, SearchProvider, SearchQuery, UnconfiguredProvider, UpstreamError,
    YelpClient, YelpClientConfig, DEFAULT_YELP_API_URL,
};
use bizsync_core::{normalize_batch, BusinessRecord, NormalizeError, RawBusiness, StoredBusiness};
use bizsync_storage::{BusinessStore, DuplicateReport, ListOrder, StoreConfig, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Application configuration, built once and handed to every component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub yelp_api_key: String,
    pub yelp_api_url: String,
    pub default_limit: u32,
    pub max_limit: u32,
    pub list_order: ListOrder,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparseable values fall
    /// back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/businesses.db".to_string()),
            db_max_connections: parse_or(lookup("BIZSYNC_DB_MAX_CONNECTIONS"), 5),
            yelp_api_key: lookup("YELP_API_KEY").unwrap_or_default(),
            yelp_api_url: lookup("YELP_API_URL")
                .unwrap_or_else(|| DEFAULT_YELP_API_URL.to_string()),
            default_limit: parse_or(lookup("DEFAULT_LIMIT"), 10),
            max_limit: parse_or(lookup("MAX_LIMIT"), 50),
            list_order: parse_or(lookup("BIZSYNC_LIST_ORDER"), ListOrder::default()),
            http_timeout_secs: parse_or(lookup("BIZSYNC_HTTP_TIMEOUT_SECS"), 30),
            user_agent: lookup("BIZSYNC_USER_AGENT")
                .unwrap_or_else(|| "bizsync/0.1".to_string()),
            web_port: parse_or(lookup("BIZSYNC_WEB_PORT"), 8000),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            max_connections: self.db_max_connections,
            list_order: self.list_order,
            ..Default::default()
        }
    }

    pub fn yelp_client_config(&self) -> YelpClientConfig {
        YelpClientConfig {
            api_key: self.yelp_api_key.clone(),
            api_url: self.yelp_api_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_limit: self.max_limit,
            ..Default::default()
        }
    }

    /// Requested page size, defaulted and clamped to `1..=max_limit`.
    pub fn clamp_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub has_next: bool,
}

impl Pagination {
    pub fn new(total: u64, limit: u64, offset: u64) -> Self {
        Self {
            total,
            limit,
            offset,
            has_next: offset.saturating_add(limit) < total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestFailure {
    /// Position of the record in the provider batch.
    pub index: usize,
    pub external_id: Option<String>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub failures: Vec<IngestFailure>,
}

impl IngestReport {
    pub fn saved(&self) -> usize {
        self.inserted + self.updated
    }

    fn record_failure(
        &mut self,
        index: usize,
        external_id: Option<String>,
        kind: &str,
        message: String,
    ) {
        self.failed += 1;
        self.failures.push(IngestFailure {
            index,
            external_id,
            kind: kind.to_string(),
            message,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchIngestResult {
    pub term: String,
    pub location: String,
    pub businesses: Vec<BusinessRecord>,
    pub pagination: Pagination,
    pub report: IngestReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusinessPage {
    pub businesses: Vec<StoredBusiness>,
    pub pagination: Pagination,
    pub search_term: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Upstream(_) => "upstream",
            Self::Store(err) => err.kind().as_str(),
        }
    }
}

pub struct IngestPipeline {
    config: AppConfig,
    store: BusinessStore,
    provider: Arc<dyn SearchProvider>,
}

impl IngestPipeline {
    pub fn new(config: AppConfig, store: BusinessStore, provider: Arc<dyn SearchProvider>) -> Self {
        Self {
            config,
            store,
            provider,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &BusinessStore {
        &self.store
    }

    /// Normalize and upsert every record independently. A failing record is
    /// logged and reported but never stops the rest of the batch.
    pub async fn ingest_batch(&self, raws: &[RawBusiness]) -> IngestReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_batch", %run_id, received = raws.len());
        self.ingest_normalized(run_id, normalize_batch(raws))
            .instrument(span)
            .await
    }

    /// Search the provider and persist the returned page. Nothing is written
    /// when the provider call itself fails.
    pub async fn search_and_ingest(
        &self,
        term: &str,
        location: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<SearchIngestResult, SyncError> {
        let term = term.trim();
        let location = location.trim();
        if term.is_empty() {
            return Err(SyncError::Validation(
                "the \"term\" parameter is required".to_string(),
            ));
        }
        if location.is_empty() {
            return Err(SyncError::Validation(
                "the \"location\" parameter is required".to_string(),
            ));
        }

        let query = SearchQuery {
            term: term.to_string(),
            location: location.to_string(),
            limit: self.config.clamp_limit(limit),
            offset: offset.unwrap_or(0),
        };
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "search_and_ingest",
            %run_id,
            provider = self.provider.provider_id(),
            term,
            location
        );

        async move {
            let page = self.provider.search(&query).await?;
            let normalized = normalize_batch(&page.businesses);
            let businesses = normalized
                .iter()
                .filter_map(|result| result.as_ref().ok().cloned())
                .collect::<Vec<_>>();
            let report = self.ingest_normalized(run_id, normalized).await;

            Ok::<_, SyncError>(SearchIngestResult {
                term: query.term.clone(),
                location: query.location.clone(),
                businesses,
                pagination: Pagination::new(
                    page.total,
                    u64::from(query.limit),
                    u64::from(query.offset),
                ),
                report,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn list_businesses(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
        search: Option<&str>,
    ) -> Result<BusinessPage, StoreError> {
        let limit = u64::from(self.config.clamp_limit(limit));
        let offset = u64::from(offset.unwrap_or(0));
        let search_term = search.map(str::trim).unwrap_or_default().to_string();
        let filter = Some(search_term.as_str()).filter(|term| !term.is_empty());

        let businesses = self.store.list(limit, offset, filter).await?;
        let total = self.store.count(filter).await?;
        Ok(BusinessPage {
            businesses,
            pagination: Pagination::new(total, limit, offset),
            search_term,
        })
    }

    async fn ingest_normalized(
        &self,
        run_id: Uuid,
        normalized: Vec<Result<BusinessRecord, NormalizeError>>,
    ) -> IngestReport {
        let started_at = Utc::now();
        let mut report = IngestReport {
            run_id,
            started_at,
            finished_at: started_at,
            received: normalized.len(),
            inserted: 0,
            updated: 0,
            failed: 0,
            failures: Vec::new(),
        };

        for (index, result) in normalized.into_iter().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    warn!(index, error = %err, "skipping provider record");
                    report.record_failure(index, None, "invalid_record", err.to_string());
                    continue;
                }
            };

            match self.store.upsert(&record).await {
                Ok(outcome) if outcome.was_insert => report.inserted += 1,
                Ok(_) => report.updated += 1,
                Err(err) => {
                    warn!(
                        index,
                        external_id = %record.external_id,
                        kind = err.kind().as_str(),
                        error = %err,
                        "failed to persist business"
                    );
                    report.record_failure(
                        index,
                        Some(record.external_id.clone()),
                        err.kind().as_str(),
                        err.to_string(),
                    );
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed,
            "ingest batch finished"
        );
        report
    }
}

/// Connect the store and the Yelp client described by `config`.
///
/// Missing credentials do not stop the pipeline from being built: reads and
/// duplicate maintenance keep working and provider searches fail with an
/// upstream configuration error.
pub async fn build_pipeline(config: AppConfig) -> anyhow::Result<IngestPipeline> {
    let store = open_store(&config).await?;
    let provider: Arc<dyn SearchProvider> = match YelpClient::new(config.yelp_client_config()) {
        Ok(client) => Arc::new(client),
        Err(UpstreamError::Configuration(reason)) => {
            warn!(%reason, "provider searches are disabled");
            Arc::new(UnconfiguredProvider::new(reason))
        }
        Err(err) => return Err(err).context("building Yelp client"),
    };
    Ok(IngestPipeline::new(config, store, provider))
}

/// Like [`build_pipeline`] but serving provider results from a captured JSON page.
pub async fn build_fixture_pipeline(
    config: AppConfig,
    fixture_path: impl AsRef<Path>,
) -> anyhow::Result<IngestPipeline> {
    let store = open_store(&config).await?;
    let provider = FixtureProvider::load(fixture_path)?;
    Ok(IngestPipeline::new(config, store, Arc::new(provider)))
}

pub async fn open_store(config: &AppConfig) -> anyhow::Result<BusinessStore> {
    BusinessStore::connect(&config.store_config())
        .await
        .with_context(|| format!("opening business store {}", config.database_url))
}

pub fn render_duplicate_report(report: &DuplicateReport) -> String {
    let mut lines = vec!["# Duplicate check".to_string(), String::new()];

    lines.push("## Identity duplicates (external_id)".to_string());
    if report.by_identity.is_empty() {
        lines.push("- none".to_string());
    }
    for group in &report.by_identity {
        lines.push(format!(
            "- `{}`: {} rows (ids {})",
            group.external_id,
            group.row_count,
            group
                .row_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    lines.push(String::new());

    lines.push("## Name + address matches (advisory)".to_string());
    if report.by_name_address.is_empty() {
        lines.push("- none".to_string());
    }
    for group in &report.by_name_address {
        lines.push(format!(
            "- {} @ {}: {} rows ({})",
            group.name,
            group.address,
            group.row_count,
            group.external_ids.join(", ")
        ));
    }
    lines.push(String::new());

    lines.push("## Statistics".to_string());
    lines.push(format!("- total rows: {}", report.total_rows));
    lines.push(format!(
        "- distinct external ids: {}",
        report.distinct_identity_count
    ));
    lines.push(format!(
        "- integrity: {}",
        if report.integrity_ok { "ok" } else { "MISMATCH" }
    ));
    lines.push(format!(
        "- unique index on external_id: {}",
        if report.identity_constraint_installed {
            "installed"
        } else {
            "missing"
        }
    ));

    lines.join("\n")
}
