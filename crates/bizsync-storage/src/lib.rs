//! SQLite persistence engine for bizsync: identity-keyed upserts, search,
//! and duplicate detection/reconciliation.
//!
//! The `businesses` table is keyed logically by `external_id` (unique index
//! `ux_businesses_external_id`) and physically by an autoincrement `id` that
//! doubles as the recency tie-breaker when identity duplicates exist.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bizsync_core::{BusinessRecord, Category, Coordinates, StoredBusiness};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub const SCHEMA_VERSION: i64 = 2;

const IDENTITY_INDEX_NAME: &str = "ux_businesses_external_id";

const CREATE_IDENTITY_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_businesses_external_id ON businesses (external_id)";

const BUSINESS_COLUMNS: &str = "id, external_id, name, address, phone, website, image_url, \
     rating, review_count, latitude, longitude, categories_json, ingest_count, created_at, updated_at";

/// `search_text` holds the lowercased name and address, so matching against a
/// lowercased pattern folds case beyond ASCII.
const SEARCH_FILTER: &str = r"(?1 IS NULL OR search_text LIKE ?1 ESCAPE '\')";

const UPSERT_SQL: &str = r#"
    INSERT INTO businesses (
        external_id, name, address, phone, website, image_url,
        rating, review_count, latitude, longitude, categories_json,
        search_text, ingest_count, created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13, ?13)
    ON CONFLICT(external_id) DO UPDATE SET
        name = excluded.name,
        address = excluded.address,
        phone = excluded.phone,
        website = excluded.website,
        image_url = excluded.image_url,
        rating = excluded.rating,
        review_count = excluded.review_count,
        latitude = excluded.latitude,
        longitude = excluded.longitude,
        categories_json = excluded.categories_json,
        search_text = excluded.search_text,
        ingest_count = businesses.ingest_count + 1,
        updated_at = MAX(excluded.updated_at, businesses.created_at)
    RETURNING id, ingest_count
"#;

/// Machine-readable failure category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Constraint,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Constraint => "constraint",
            Self::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("constraint error: {0}")]
    Constraint(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
    #[error("record could not be encoded for storage: {0}")]
    Encode(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Constraint(_) => ErrorKind::Constraint,
            Self::Storage(_)
            | Self::Decode(_)
            | Self::Encode(_)
            | Self::UnsupportedSchemaVersion { .. } => {
                ErrorKind::Storage
            }
        }
    }
}

/// Default ordering applied by [`BusinessStore::list`]. Both orders end on
/// `id DESC` so pages are stable for a fixed table state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    /// `rating DESC, review_count DESC, id DESC`
    #[default]
    Rating,
    /// `created_at DESC, id DESC`
    Recent,
}

impl ListOrder {
    fn order_by_sql(self) -> &'static str {
        match self {
            Self::Rating => "rating DESC, review_count DESC, id DESC",
            Self::Recent => "created_at DESC, id DESC",
        }
    }
}

impl FromStr for ListOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rating" => Ok(Self::Rating),
            "recent" => Ok(Self::Recent),
            other => Err(format!("unknown list order {other:?}, expected rating or recent")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
    pub list_order: ListOrder,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/businesses.db".to_string(),
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
            list_order: ListOrder::default(),
        }
    }
}

/// `rows_affected` is 1 when the statement returned the written row, else 0
/// (and `row_id` is then 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub was_insert: bool,
    pub rows_affected: u64,
    pub row_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityDuplicateGroup {
    pub external_id: String,
    pub row_count: u64,
    /// Ascending; the last entry is the row reconciliation keeps.
    pub row_ids: Vec<i64>,
}

/// Rows sharing an identical `(name, address)` pair. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameAddressDuplicateGroup {
    pub name: String,
    pub address: String,
    pub row_count: u64,
    pub external_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateReport {
    pub by_identity: Vec<IdentityDuplicateGroup>,
    pub by_name_address: Vec<NameAddressDuplicateGroup>,
    pub total_rows: u64,
    pub distinct_identity_count: u64,
    pub integrity_ok: bool,
    pub identity_constraint_installed: bool,
}

impl DuplicateReport {
    pub fn has_identity_duplicates(&self) -> bool {
        !self.by_identity.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BusinessStore {
    pool: SqlitePool,
    list_order: ListOrder,
}

impl BusinessStore {
    /// Open (creating if needed) the database and bring the schema up to date.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = sqlite_file_parent(&config.database_url) {
            fs::create_dir_all(&parent)
                .await
                .map_err(|err| StoreError::Storage(sqlx::Error::Io(err)))?;
        }

        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            list_order: config.list_order,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_list_order(mut self, list_order: ListOrder) -> Self {
        self.list_order = list_order;
        self
    }

    pub fn list_order(&self) -> ListOrder {
        self.list_order
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Create the table and indexes, then try to install the identity index.
    ///
    /// A table that already holds identity duplicates cannot take the unique
    /// index; the store then stays open in a degraded state where upserts fail
    /// with [`StoreError::Constraint`] until [`Self::reconcile_duplicates`] runs.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let current = self.schema_version().await?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            sqlx::raw_sql(include_str!("../migrations/0001_businesses.sql"))
                .execute(&self.pool)
                .await?;
            sqlx::query("PRAGMA user_version = 1")
                .execute(&self.pool)
                .await?;
        }

        if current < 2 {
            self.add_search_text_column().await?;
        }

        match sqlx::query(CREATE_IDENTITY_INDEX_SQL)
            .execute(&self.pool)
            .await
            .map_err(classify_write_error)
        {
            Ok(_) => Ok(()),
            Err(StoreError::Constraint(message)) => {
                warn!(
                    %message,
                    "identity duplicates block the unique index on external_id; upserts are disabled until reconciliation"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Schema 2 adds `search_text`. Existing rows are backfilled from Rust since
    /// SQLite's `lower()` only folds ASCII.
    async fn add_search_text_column(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(include_str!("../migrations/0002_search_text.sql"))
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query("SELECT id, name, address FROM businesses")
            .fetch_all(&mut *tx)
            .await?;
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            let address: String = row.try_get("address")?;
            sqlx::query("UPDATE businesses SET search_text = ?1 WHERE id = ?2")
                .bind(search_text(&name, &address))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("PRAGMA user_version = 2")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(backfilled = rows.len(), "added search_text column");
        Ok(())
    }

    /// Insert the record, or overwrite every mutable field of the row that
    /// already carries its `external_id`, in one statement.
    pub async fn upsert(&self, record: &BusinessRecord) -> Result<UpsertOutcome, StoreError> {
        if record.external_id.trim().is_empty() {
            return Err(StoreError::Validation(
                "external_id must not be empty".to_string(),
            ));
        }

        let categories_json = serde_json::to_string(&record.categories)
            .map_err(|err| StoreError::Encode(format!("categories: {err}")))?;
        let now = format_timestamp(Utc::now());

        let row = sqlx::query(UPSERT_SQL)
            .bind(&record.external_id)
            .bind(&record.name)
            .bind(&record.address)
            .bind(&record.phone)
            .bind(&record.website)
            .bind(&record.image_url)
            .bind(record.rating)
            .bind(record.review_count)
            .bind(record.coordinates.map(|c| c.latitude))
            .bind(record.coordinates.map(|c| c.longitude))
            .bind(categories_json)
            .bind(search_text(&record.name, &record.address))
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_write_error)?;

        let (row_id, ingest_count) = match &row {
            Some(row) => (row.try_get::<i64, _>("id")?, row.try_get::<i64, _>("ingest_count")?),
            None => (0, 0),
        };
        let outcome = UpsertOutcome {
            was_insert: ingest_count == 1,
            rows_affected: u64::from(row.is_some()),
            row_id,
        };
        debug!(
            external_id = %record.external_id,
            row_id,
            was_insert = outcome.was_insert,
            "upserted business"
        );
        Ok(outcome)
    }

    /// Page through businesses in the configured [`ListOrder`].
    ///
    /// `search` matches `name` or `address` as a case-insensitive substring;
    /// a blank term matches everything. `u64::MAX` as `limit` means no limit.
    pub async fn list(
        &self,
        limit: u64,
        offset: u64,
        search: Option<&str>,
    ) -> Result<Vec<StoredBusiness>, StoreError> {
        let sql = format!(
            "SELECT {BUSINESS_COLUMNS} FROM businesses WHERE {SEARCH_FILTER} ORDER BY {} LIMIT ?2 OFFSET ?3",
            self.list_order.order_by_sql()
        );
        let rows = sqlx::query(&sql)
            .bind(search_pattern(search))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(business_from_row).collect()
    }

    pub async fn count(&self, search: Option<&str>) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM businesses WHERE {SEARCH_FILTER}");
        let total: i64 = sqlx::query_scalar(&sql)
            .bind(search_pattern(search))
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }

    /// Newest row carrying `external_id`, if any.
    pub async fn get(&self, external_id: &str) -> Result<Option<StoredBusiness>, StoreError> {
        let sql = format!(
            "SELECT {BUSINESS_COLUMNS} FROM businesses WHERE external_id = ?1 ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(business_from_row).transpose()
    }

    /// Read-only duplicate diagnostics computed inside one read transaction.
    pub async fn detect_duplicates(&self) -> Result<DuplicateReport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let identity_rows = sqlx::query(
            r#"
            SELECT id, external_id
              FROM businesses
             WHERE external_id IN (
                   SELECT external_id
                     FROM businesses
                    GROUP BY external_id
                   HAVING COUNT(*) > 1)
             ORDER BY external_id, id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let name_address_rows = sqlx::query(
            r#"
            SELECT b.name, b.address, b.external_id
              FROM businesses AS b
              JOIN (SELECT name, address
                      FROM businesses
                     GROUP BY name, address
                    HAVING COUNT(*) > 1) AS d
                ON d.name = b.name AND d.address = b.address
             ORDER BY b.name, b.address, b.id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let totals = sqlx::query(
            "SELECT COUNT(*) AS total_rows, COUNT(DISTINCT external_id) AS distinct_ids FROM businesses",
        )
        .fetch_one(&mut *tx)
        .await?;

        let index_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
        )
        .bind(IDENTITY_INDEX_NAME)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut by_identity: Vec<IdentityDuplicateGroup> = Vec::new();
        for row in &identity_rows {
            let id: i64 = row.try_get("id")?;
            let external_id: String = row.try_get("external_id")?;
            match by_identity.last_mut() {
                Some(group) if group.external_id == external_id => {
                    group.row_ids.push(id);
                    group.row_count += 1;
                }
                _ => by_identity.push(IdentityDuplicateGroup {
                    external_id,
                    row_count: 1,
                    row_ids: vec![id],
                }),
            }
        }

        let mut by_name_address: Vec<NameAddressDuplicateGroup> = Vec::new();
        for row in &name_address_rows {
            let name: String = row.try_get("name")?;
            let address: String = row.try_get("address")?;
            let external_id: String = row.try_get("external_id")?;
            match by_name_address.last_mut() {
                Some(group) if group.name == name && group.address == address => {
                    group.row_count += 1;
                    if !group.external_ids.contains(&external_id) {
                        group.external_ids.push(external_id);
                    }
                }
                _ => by_name_address.push(NameAddressDuplicateGroup {
                    name,
                    address,
                    row_count: 1,
                    external_ids: vec![external_id],
                }),
            }
        }

        let total_rows: i64 = totals.try_get("total_rows")?;
        let distinct_ids: i64 = totals.try_get("distinct_ids")?;

        Ok(DuplicateReport {
            by_identity,
            by_name_address,
            total_rows: total_rows.max(0) as u64,
            distinct_identity_count: distinct_ids.max(0) as u64,
            integrity_ok: total_rows == distinct_ids,
            identity_constraint_installed: index_count > 0,
        })
    }

    /// Delete every identity duplicate except the row with the highest `id`,
    /// then (re)install the unique index, all in one transaction.
    ///
    /// Name/address matches are never touched. Returns the number of rows deleted.
    pub async fn reconcile_duplicates(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM businesses
             WHERE EXISTS (
                   SELECT 1
                     FROM businesses AS newer
                    WHERE newer.external_id = businesses.external_id
                      AND newer.id > businesses.id)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(classify_write_error)?
        .rows_affected();

        sqlx::query(CREATE_IDENTITY_INDEX_SQL)
            .execute(&mut *tx)
            .await
            .map_err(classify_write_error)?;

        tx.commit().await?;

        if deleted > 0 {
            info!(deleted, "reconciled identity duplicates");
        } else {
            debug!("no identity duplicates to reconcile");
        }
        Ok(deleted)
    }
}

fn classify_write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if matches!(
            db_err.kind(),
            sqlx::error::ErrorKind::UniqueViolation
                | sqlx::error::ErrorKind::CheckViolation
                | sqlx::error::ErrorKind::NotNullViolation
                | sqlx::error::ErrorKind::ForeignKeyViolation
        ) {
            return StoreError::Constraint(db_err.message().to_string());
        }
        if db_err
            .message()
            .contains("ON CONFLICT clause does not match any PRIMARY KEY or UNIQUE constraint")
        {
            return StoreError::Constraint(
                "unique index on external_id is missing; reconcile duplicates to restore it"
                    .to_string(),
            );
        }
    }
    StoreError::Storage(err)
}

fn business_from_row(row: &SqliteRow) -> Result<StoredBusiness, StoreError> {
    let categories_json: String = row.try_get("categories_json")?;
    let categories: Vec<Category> = serde_json::from_str(&categories_json)
        .map_err(|err| StoreError::Decode(format!("categories_json: {err}")))?;
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(StoredBusiness {
        row_id: row.try_get("id")?,
        record: BusinessRecord {
            external_id: row.try_get("external_id")?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            phone: row.try_get("phone")?,
            website: row.try_get("website")?,
            image_url: row.try_get("image_url")?,
            rating: row.try_get("rating")?,
            review_count: row.try_get("review_count")?,
            coordinates: match (latitude, longitude) {
                (Some(latitude), Some(longitude)) => Some(Coordinates {
                    latitude,
                    longitude,
                }),
                _ => None,
            },
            categories,
        },
        ingest_count: row.try_get("ingest_count")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Fixed-width UTC timestamps so text comparison in SQL matches time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Decode(format!("timestamp {raw:?}: {err}")))
}

fn search_text(name: &str, address: &str) -> String {
    format!("{name}\n{address}").to_lowercase()
}

fn search_pattern(search: Option<&str>) -> Option<String> {
    let term = search
        .map(str::trim)
        .filter(|term| !term.is_empty())?
        .to_lowercase();
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    Some(pattern)
}

/// Directory that must exist before SQLite can create the database file.
fn sqlite_file_parent(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    PathBuf::from(path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn search_pattern_escapes_like_wildcards() {
        assert_eq!(search_pattern(None), None);
        assert_eq!(search_pattern(Some("   ")), None);
        assert_eq!(search_pattern(Some(" main ")).as_deref(), Some("%main%"));
        assert_eq!(
            search_pattern(Some(r"50%_off\")).as_deref(),
            Some(r"%50\%\_off\\%")
        );
    }

    #[test]
    fn search_text_and_pattern_fold_non_ascii_case() {
        assert_eq!(search_pattern(Some("ÉTÉ")).as_deref(), Some("%été%"));
        assert_eq!(
            search_text("Café Été", "1 Rue ÉCOLE"),
            "café été\n1 rue école"
        );
    }

    #[test]
    fn list_order_parses_case_insensitively() {
        assert_eq!("Rating".parse::<ListOrder>(), Ok(ListOrder::Rating));
        assert_eq!(" recent ".parse::<ListOrder>(), Ok(ListOrder::Recent));
        assert!("newest".parse::<ListOrder>().is_err());
    }

    #[test]
    fn timestamps_are_fixed_width_and_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().expect("ts");
        let text = format_timestamp(ts);
        assert_eq!(text, "2026-02-24T12:00:00.000000Z");
        assert_eq!(parse_timestamp(&text).expect("parse"), ts);
    }

    #[test]
    fn database_parent_dir_is_derived_from_url() {
        assert_eq!(
            sqlite_file_parent("sqlite://data/businesses.db"),
            Some(PathBuf::from("data"))
        );
        assert_eq!(
            sqlite_file_parent("sqlite:/tmp/x/b.db?mode=rwc"),
            Some(PathBuf::from("/tmp/x"))
        );
        assert_eq!(sqlite_file_parent("sqlite::memory:"), None);
        assert_eq!(sqlite_file_parent("sqlite://businesses.db"), None);
    }

    #[test]
    fn error_kinds_are_machine_distinguishable() {
        assert_eq!(
            StoreError::Validation("x".into()).kind().as_str(),
            "validation"
        );
        assert_eq!(
            StoreError::Constraint("x".into()).kind(),
            ErrorKind::Constraint
        );
        assert_eq!(
            StoreError::Encode("x".into()).kind(),
            ErrorKind::Storage
        );
        assert!(StoreError::Encode("categories".into())
            .to_string()
            .starts_with("record could not be encoded"));
        assert_eq!(
            StoreError::Storage(sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::Storage
        );
    }
}
