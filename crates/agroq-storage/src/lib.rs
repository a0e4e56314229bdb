//! Quality-record persistence, directory lookups and HTTP client utilities for AGROQ.

use std::time::Duration;

use agroq_core::{
    ActorRef, CompanyRef, MappedQualityRecord, Measurements, Principal, QualityGrade,
    QualityStats, StoredQualityRecord,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "agroq-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// Shared reqwest client. Per-call deadlines are set on each request.
pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .connect_timeout(config.connect_timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("quality record {0} not found")]
    NotFound(Uuid),
    #[error("a record for {company_label} at {recorded_at} already exists")]
    Conflict {
        company_label: String,
        recorded_at: DateTime<Utc>,
    },
    #[error("corrupt quality record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[async_trait]
pub trait QualityStore: Send + Sync {
    /// Stored record of `company_label` whose extended attributes carry `record_id`.
    async fn find_by_external_id(
        &self,
        company_label: &str,
        record_id: &str,
    ) -> Result<Option<StoredQualityRecord>, StoreError>;

    /// Overwrite the mutable fields of an existing record.
    async fn update_record(&self, id: Uuid, mapped: &MappedQualityRecord) -> Result<(), StoreError>;

    /// Atomic get-or-create keyed by `(company_label, mapped.recorded_at)`. An existing
    /// row has its mutable fields overwritten; `actor` is only attached to new rows.
    async fn upsert_by_timestamp(
        &self,
        company_label: &str,
        mapped: &MappedQualityRecord,
        actor: Option<&ActorRef>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn records_for_company(
        &self,
        company_label: &str,
    ) -> Result<Vec<StoredQualityRecord>, StoreError>;

    async fn quality_stats(&self, company_label: Option<&str>) -> Result<QualityStats, StoreError>;
}

#[async_trait]
pub trait CompanyDirectory: Send + Sync {
    async fn find_company(&self, label: &str) -> Result<Option<CompanyRef>, StoreError>;
    async fn active_companies(&self) -> Result<Vec<CompanyRef>, StoreError>;
}

#[async_trait]
pub trait ActorDirectory: Send + Sync {
    async fn find_admin_by_email(&self, email: &str) -> Result<Option<ActorRef>, StoreError>;
    async fn any_admin(&self) -> Result<Option<ActorRef>, StoreError>;
}

#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, StoreError>;
}

/// First company by name whose name contains the label literally, ignoring case.
fn link_company<'a>(companies: &'a [CompanyRef], label: &str) -> Option<&'a CompanyRef> {
    let needle = label.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    companies
        .iter()
        .filter(|c| c.name.to_lowercase().contains(&needle))
        .min_by(|a, b| a.name.cmp(&b.name))
}

/// Store kept behind a single async mutex; writes are serialized.
#[derive(Debug, Default)]
pub struct MemoryQualityStore {
    rows: Mutex<Vec<StoredQualityRecord>>,
    companies: Vec<CompanyRef>,
}

impl MemoryQualityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_companies(companies: Vec<CompanyRef>) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            companies,
        }
    }

    pub async fn snapshot(&self) -> Vec<StoredQualityRecord> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl QualityStore for MemoryQualityStore {
    async fn find_by_external_id(
        &self,
        company_label: &str,
        record_id: &str,
    ) -> Result<Option<StoredQualityRecord>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|r| r.company_label == company_label && r.external_record_id() == Some(record_id))
            .cloned())
    }

    async fn update_record(&self, id: Uuid, mapped: &MappedQualityRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(index) = rows.iter().position(|r| r.id == id) else {
            return Err(StoreError::NotFound(id));
        };
        let company_label = rows[index].company_label.clone();
        let collides = rows.iter().any(|r| {
            r.id != id && r.company_label == company_label && r.recorded_at == mapped.recorded_at
        });
        if collides {
            return Err(StoreError::Conflict {
                company_label,
                recorded_at: mapped.recorded_at,
            });
        }
        rows[index].apply(mapped, Utc::now());
        Ok(())
    }

    async fn upsert_by_timestamp(
        &self,
        company_label: &str,
        mapped: &MappedQualityRecord,
        actor: Option<&ActorRef>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();
        if let Some(existing) = rows
            .iter_mut()
            .find(|r| r.company_label == company_label && r.recorded_at == mapped.recorded_at)
        {
            existing.apply(mapped, now);
            return Ok(UpsertOutcome::Updated);
        }

        let company_id = link_company(&self.companies, company_label).map(|c| c.id);
        rows.push(StoredQualityRecord::create(
            company_label,
            mapped,
            actor.map(|a| a.id),
            company_id,
            now,
        ));
        Ok(UpsertOutcome::Created)
    }

    async fn records_for_company(
        &self,
        company_label: &str,
    ) -> Result<Vec<StoredQualityRecord>, StoreError> {
        let rows = self.rows.lock().await;
        let mut out: Vec<_> = rows
            .iter()
            .filter(|r| r.company_label == company_label)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(out)
    }

    async fn quality_stats(&self, company_label: Option<&str>) -> Result<QualityStats, StoreError> {
        let rows = self.rows.lock().await;
        Ok(QualityStats::from_records(
            rows.iter()
                .filter(|r| company_label.map_or(true, |label| r.company_label == label)),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryUser {
    pub id: Uuid,
    pub email: String,
    pub company: Option<CompanyRef>,
    pub is_admin: bool,
    pub is_manager: bool,
    pub token: Option<String>,
}

/// Company, admin and principal lookups over fixed lists.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    pub companies: Vec<CompanyRef>,
    pub users: Vec<MemoryUser>,
}

#[async_trait]
impl CompanyDirectory for MemoryDirectory {
    async fn find_company(&self, label: &str) -> Result<Option<CompanyRef>, StoreError> {
        Ok(self.companies.iter().find(|c| c.name == label).cloned())
    }

    async fn active_companies(&self) -> Result<Vec<CompanyRef>, StoreError> {
        Ok(self.companies.iter().filter(|c| c.active).cloned().collect())
    }
}

#[async_trait]
impl ActorDirectory for MemoryDirectory {
    async fn find_admin_by_email(&self, email: &str) -> Result<Option<ActorRef>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.is_admin && u.email.eq_ignore_ascii_case(email))
            .map(|u| ActorRef {
                id: u.id,
                email: u.email.clone(),
            }))
    }

    async fn any_admin(&self) -> Result<Option<ActorRef>, StoreError> {
        Ok(self.users.iter().find(|u| u.is_admin).map(|u| ActorRef {
            id: u.id,
            email: u.email.clone(),
        }))
    }
}

#[async_trait]
impl PrincipalDirectory for MemoryDirectory {
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.token.as_deref() == Some(token))
            .map(|u| Principal {
                user_id: u.id,
                email: u.email.clone(),
                company: u.company.clone(),
                is_admin: u.is_admin,
                is_manager: u.is_manager,
            }))
    }
}

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

const RECORD_COLUMNS: &str = "id, company_label, recorded_at, temperature, humidity, ph, firmness, \
     soluble_solids, titratable_acidity, defect_percentage, defect_description, caliber, color, \
     quality_grade, approved, observations, processed_data, created_by, company_id, created_at, updated_at";

fn record_from_row(row: &PgRow) -> Result<StoredQualityRecord, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let grade_label: String = row.try_get("quality_grade")?;
    let quality_grade = QualityGrade::parse(&grade_label).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("unknown quality grade {grade_label:?}"),
    })?;
    Ok(StoredQualityRecord {
        id,
        company_label: row.try_get("company_label")?,
        recorded_at: row.try_get("recorded_at")?,
        measurements: Measurements {
            temperature: row.try_get("temperature")?,
            humidity: row.try_get("humidity")?,
            ph: row.try_get("ph")?,
            firmness: row.try_get("firmness")?,
            soluble_solids: row.try_get("soluble_solids")?,
            titratable_acidity: row.try_get("titratable_acidity")?,
        },
        defect_percentage: row.try_get("defect_percentage")?,
        defect_description: row.try_get("defect_description")?,
        caliber: row.try_get("caliber")?,
        color: row.try_get("color")?,
        quality_grade,
        approved: row.try_get("approved")?,
        observations: row.try_get("observations")?,
        processed_data: row.try_get::<JsonValue, _>("processed_data")?,
        created_by: row.try_get("created_by")?,
        company_id: row.try_get("company_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Postgres-backed store. Identity is enforced by `UNIQUE (company_label, recorded_at)`.
#[derive(Debug, Clone)]
pub struct PgQualityStore {
    pool: PgPool,
}

impl PgQualityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QualityStore for PgQualityStore {
    async fn find_by_external_id(
        &self,
        company_label: &str,
        record_id: &str,
    ) -> Result<Option<StoredQualityRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM quality_data \
              WHERE company_label = $1 \
                AND processed_data -> 'additional_info' ->> 'record_id' = $2 \
              ORDER BY created_at \
              LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(company_label)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn update_record(&self, id: Uuid, mapped: &MappedQualityRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE quality_data
               SET recorded_at = $2,
                   temperature = $3,
                   humidity = $4,
                   ph = $5,
                   firmness = $6,
                   soluble_solids = $7,
                   titratable_acidity = $8,
                   defect_percentage = $9,
                   defect_description = $10,
                   caliber = $11,
                   color = $12,
                   quality_grade = $13,
                   approved = $14,
                   observations = $15,
                   processed_data = $16,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(mapped.recorded_at)
        .bind(mapped.measurements.temperature)
        .bind(mapped.measurements.humidity)
        .bind(mapped.measurements.ph)
        .bind(mapped.measurements.firmness)
        .bind(mapped.measurements.soluble_solids)
        .bind(mapped.measurements.titratable_acidity)
        .bind(mapped.defect_percentage)
        .bind(&mapped.defect_description)
        .bind(&mapped.caliber)
        .bind(&mapped.color)
        .bind(mapped.quality_grade.as_str())
        .bind(mapped.approved)
        .bind(&mapped.observations)
        .bind(mapped.processed_data())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        debug!(%id, "quality record updated by external id");
        Ok(())
    }

    async fn upsert_by_timestamp(
        &self,
        company_label: &str,
        mapped: &MappedQualityRecord,
        actor: Option<&ActorRef>,
    ) -> Result<UpsertOutcome, StoreError> {
        // `xmax = 0` only holds for a freshly inserted tuple.
        let row = sqlx::query(
            r#"
            INSERT INTO quality_data (
                id, company_label, recorded_at, temperature, humidity, ph, firmness,
                soluble_solids, titratable_acidity, defect_percentage, defect_description,
                caliber, color, quality_grade, approved, observations, processed_data,
                created_by, company_id, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                (SELECT id FROM companies
                  WHERE $2 <> '' AND strpos(lower(name), lower($2)) > 0
                  ORDER BY name
                  LIMIT 1),
                now(), now()
            )
            ON CONFLICT (company_label, recorded_at) DO UPDATE SET
                temperature = EXCLUDED.temperature,
                humidity = EXCLUDED.humidity,
                ph = EXCLUDED.ph,
                firmness = EXCLUDED.firmness,
                soluble_solids = EXCLUDED.soluble_solids,
                titratable_acidity = EXCLUDED.titratable_acidity,
                defect_percentage = EXCLUDED.defect_percentage,
                defect_description = EXCLUDED.defect_description,
                caliber = EXCLUDED.caliber,
                color = EXCLUDED.color,
                quality_grade = EXCLUDED.quality_grade,
                approved = EXCLUDED.approved,
                observations = EXCLUDED.observations,
                processed_data = EXCLUDED.processed_data,
                updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(company_label)
        .bind(mapped.recorded_at)
        .bind(mapped.measurements.temperature)
        .bind(mapped.measurements.humidity)
        .bind(mapped.measurements.ph)
        .bind(mapped.measurements.firmness)
        .bind(mapped.measurements.soluble_solids)
        .bind(mapped.measurements.titratable_acidity)
        .bind(mapped.defect_percentage)
        .bind(&mapped.defect_description)
        .bind(&mapped.caliber)
        .bind(&mapped.color)
        .bind(mapped.quality_grade.as_str())
        .bind(mapped.approved)
        .bind(&mapped.observations)
        .bind(mapped.processed_data())
        .bind(actor.map(|a| a.id))
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn records_for_company(
        &self,
        company_label: &str,
    ) -> Result<Vec<StoredQualityRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM quality_data \
              WHERE company_label = $1 \
              ORDER BY recorded_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(company_label)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn quality_stats(&self, company_label: Option<&str>) -> Result<QualityStats, StoreError> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_records,
                   COUNT(*) FILTER (WHERE approved) AS approved_records,
                   AVG(temperature) AS avg_temperature,
                   AVG(humidity) AS avg_humidity,
                   AVG(ph) AS avg_ph,
                   COUNT(DISTINCT company_label) AS companies_count
              FROM quality_data
             WHERE ($1::text IS NULL OR company_label = $1)
            "#,
        )
        .bind(company_label)
        .fetch_one(&self.pool)
        .await?;

        let breakdown_rows = sqlx::query(
            r#"
            SELECT quality_grade, COUNT(*) AS n
              FROM quality_data
             WHERE ($1::text IS NULL OR company_label = $1)
             GROUP BY quality_grade
             ORDER BY quality_grade
            "#,
        )
        .bind(company_label)
        .fetch_all(&self.pool)
        .await?;

        let total_records = totals.try_get::<i64, _>("total_records")? as usize;
        let approved_records = totals.try_get::<i64, _>("approved_records")? as usize;
        let mut grade_breakdown = std::collections::BTreeMap::new();
        for row in breakdown_rows {
            let grade: String = row.try_get("quality_grade")?;
            let n: i64 = row.try_get("n")?;
            grade_breakdown.insert(grade, n as usize);
        }

        Ok(QualityStats {
            total_records,
            approved_records,
            rejected_records: total_records.saturating_sub(approved_records),
            avg_temperature: totals.try_get("avg_temperature")?,
            avg_humidity: totals.try_get("avg_humidity")?,
            avg_ph: totals.try_get("avg_ph")?,
            grade_breakdown,
            companies_count: totals.try_get::<i64, _>("companies_count")? as usize,
        })
    }
}

/// Company, admin and principal lookups against the platform's user tables.
#[derive(Debug, Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn company_from_row(row: &PgRow) -> Result<CompanyRef, StoreError> {
    Ok(CompanyRef {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        active: row.try_get("active")?,
    })
}

fn actor_from_row(row: &PgRow) -> Result<ActorRef, StoreError> {
    Ok(ActorRef {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
    })
}

#[async_trait]
impl CompanyDirectory for PgDirectory {
    async fn find_company(&self, label: &str) -> Result<Option<CompanyRef>, StoreError> {
        let row = sqlx::query("SELECT id, name, active FROM companies WHERE name = $1")
            .bind(label)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn active_companies(&self) -> Result<Vec<CompanyRef>, StoreError> {
        let rows = sqlx::query("SELECT id, name, active FROM companies WHERE active ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(company_from_row).collect()
    }
}

#[async_trait]
impl ActorDirectory for PgDirectory {
    async fn find_admin_by_email(&self, email: &str) -> Result<Option<ActorRef>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email FROM users WHERE lower(email) = lower($1) AND is_admin AND is_active",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(actor_from_row).transpose()
    }

    async fn any_admin(&self) -> Result<Option<ActorRef>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email FROM users WHERE is_admin AND is_active ORDER BY created_at LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(actor_from_row).transpose()
    }
}

#[async_trait]
impl PrincipalDirectory for PgDirectory {
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT u.id AS user_id, u.email, u.is_admin, u.is_manager,
                   c.id AS company_id, c.name AS company_name, c.active AS company_active
              FROM auth_tokens t
              JOIN users u ON u.id = t.user_id
              LEFT JOIN companies c ON c.id = u.company_id
             WHERE t.token = $1
               AND u.is_active
               AND (t.expires_at IS NULL OR t.expires_at > now())
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let company_id: Option<Uuid> = row.try_get("company_id")?;
        let company = match company_id {
            Some(id) => Some(CompanyRef {
                id,
                name: row.try_get("company_name")?,
                active: row.try_get("company_active")?,
            }),
            None => None,
        };
        Ok(Some(Principal {
            user_id: row.try_get("user_id")?,
            email: row.try_get("email")?,
            company,
            is_admin: row.try_get("is_admin")?,
            is_manager: row.try_get("is_manager")?,
        }))
    }
}
