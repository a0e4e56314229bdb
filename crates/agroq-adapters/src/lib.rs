//! External quality API client, page collector and field mapper.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use agroq_core::{is_approved, ExtendedAttributes, MappedQualityRecord, Measurements, QualityGrade};
use agroq_storage::{build_http_client, HttpClientConfig};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "agroq-adapters";

pub const LOGIN_PATH: &str = "/api/v1/auth/login";
pub const QUALITY_DATA_PATH: &str = "/api/v1/data/calidad-producto-terminado";

/// Lifetime granted to a session token on login.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 60);
/// Tokens this close to expiry are renewed before use.
pub const TOKEN_RENEWAL_MARGIN: Duration = Duration::from_secs(60);

const ERROR_BODY_PREVIEW_CHARS: usize = 512;

#[derive(Clone)]
pub struct ExternalApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub login_timeout: Duration,
    pub fetch_timeout: Duration,
    pub http: HttpClientConfig,
}

impl Default for ExternalApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            username: String::new(),
            password: String::new(),
            login_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
            http: HttpClientConfig::default(),
        }
    }
}

impl fmt::Debug for ExternalApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalApiConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("login_timeout", &self.login_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("http", &self.http)
            .finish()
    }
}

/// Bearer credential with an absolute expiry. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl SessionToken {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn issued_at(access_token: impl Into<String>, now: DateTime<Utc>) -> Self {
        let lifetime = chrono::Duration::from_std(TOKEN_LIFETIME).unwrap_or(chrono::Duration::zero());
        Self::new(access_token, now + lifetime)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// False once `now` is inside the renewal margin before expiry.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let margin =
            chrono::Duration::from_std(TOKEN_RENEWAL_MARGIN).unwrap_or(chrono::Duration::zero());
        now < self.expires_at - margin
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no valid session with the quality API")]
    Auth,
    #[error("quality API rejected the session again after re-authentication")]
    Unauthorized,
    #[error("quality API returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("quality API request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("quality API returned an unreadable page: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Anything that can serve pages of external quality records for a company.
#[async_trait]
pub trait QualityDataSource: Send {
    /// Make sure a usable session exists; false when login is impossible.
    async fn ensure_session(&mut self) -> bool;

    async fn fetch_page(
        &mut self,
        company_label: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<JsonValue>, FetchError>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

/// Client for the external quality API. Owns its session token; give each
/// execution context its own instance.
#[derive(Debug)]
pub struct ExternalApiClient {
    http: reqwest::Client,
    config: ExternalApiConfig,
    login_url: String,
    data_url: String,
    token: Option<SessionToken>,
}

impl ExternalApiClient {
    pub fn new(config: ExternalApiConfig) -> anyhow::Result<Self> {
        let http = build_http_client(&config.http)?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            login_url: format!("{base_url}{LOGIN_PATH}"),
            data_url: format!("{base_url}{QUALITY_DATA_PATH}"),
            config,
            token: None,
        })
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Log in and store a fresh token. On failure the current token is left as is.
    pub async fn authenticate(&mut self) -> bool {
        let request = LoginRequest {
            username: &self.config.username,
            password: &self.config.password,
        };
        debug!(stage = "login", username = %self.config.username, "logging in to quality API");

        let response = match self
            .http
            .post(&self.login_url)
            .timeout(self.config.login_timeout)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    stage = "login",
                    base_url = self.base_url(),
                    timeout = err.is_timeout(),
                    connect = err.is_connect(),
                    error = %err,
                    "quality API login request failed"
                );
                return false;
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            let body = error_body_preview(response).await;
            warn!(stage = "login", status = status.as_u16(), body = %body, "quality API login rejected");
            return false;
        }

        match response.json::<LoginResponse>().await {
            Ok(login) => {
                let token = SessionToken::issued_at(login.access_token, Utc::now());
                info!(stage = "login", expires_at = %token.expires_at(), "quality API session established");
                self.token = Some(token);
                true
            }
            Err(err) => {
                warn!(stage = "login", error = %err, "quality API login response had no access token");
                false
            }
        }
    }

    pub fn token_is_valid(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(|token| token.is_fresh_at(Utc::now()))
    }

    pub async fn ensure_valid_token(&mut self) -> bool {
        if self.token_is_valid() {
            return true;
        }
        debug!(stage = "login", "session missing or about to expire; renewing");
        self.authenticate().await
    }

    /// One filtered page. A 401 triggers a single re-login and retry.
    pub async fn fetch_page(
        &mut self,
        company_label: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<JsonValue>, FetchError> {
        if !self.ensure_valid_token().await {
            warn!(stage = "fetch", company = company_label, "no valid session; skipping fetch");
            return Err(FetchError::Auth);
        }

        let body = page_request_body(company_label, limit, offset);
        let mut renewed = false;

        loop {
            let access_token = match &self.token {
                Some(token) => token.access_token.clone(),
                None => return Err(FetchError::Auth),
            };
            debug!(stage = "fetch", company = company_label, offset, ?limit, "requesting quality page");

            let response = self
                .http
                .post(&self.data_url)
                .bearer_auth(&access_token)
                .timeout(self.config.fetch_timeout)
                .json(&body)
                .send()
                .await
                .map_err(|err| {
                    warn!(
                        stage = "fetch",
                        company = company_label,
                        timeout = err.is_timeout(),
                        connect = err.is_connect(),
                        error = %err,
                        "quality page request failed"
                    );
                    FetchError::Transport(err)
                })?;

            let status = response.status();
            if status == StatusCode::OK {
                let records: Vec<JsonValue> = response.json().await.map_err(FetchError::Decode)?;
                info!(stage = "fetch", company = company_label, offset, records = records.len(), "quality page received");
                return Ok(records);
            }

            if status == StatusCode::UNAUTHORIZED {
                if renewed {
                    warn!(stage = "fetch", company = company_label, "session rejected after renewal");
                    return Err(FetchError::Unauthorized);
                }
                warn!(stage = "fetch", company = company_label, "session rejected; re-authenticating once");
                self.token = None;
                if !self.authenticate().await {
                    return Err(FetchError::Auth);
                }
                renewed = true;
                continue;
            }

            let body = error_body_preview(response).await;
            warn!(stage = "fetch", company = company_label, status = status.as_u16(), body = %body, "quality page request rejected");
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
    }
}

#[async_trait]
impl QualityDataSource for ExternalApiClient {
    async fn ensure_session(&mut self) -> bool {
        ExternalApiClient::ensure_valid_token(self).await
    }

    async fn fetch_page(
        &mut self,
        company_label: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<JsonValue>, FetchError> {
        ExternalApiClient::fetch_page(self, company_label, limit, offset).await
    }
}

async fn error_body_preview(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(ERROR_BODY_PREVIEW_CHARS)
        .collect()
}

/// Request body for one page. Pagination is sent as offset, limit/page_size and
/// page number because the upstream convention is not fixed.
pub fn page_request_body(company_label: &str, limit: Option<usize>, offset: usize) -> JsonValue {
    let mut body = json!({
        "filters": {
            FIELD_COMPANY: company_label,
            FIELD_PRODUCER: company_label,
        }
    });
    if let Some(limit) = limit {
        let page = if offset > 0 { offset / limit.max(1) + 1 } else { 1 };
        body["limit"] = json!(limit);
        body["page_size"] = json!(limit);
        body["page"] = json!(page);
    }
    if offset > 0 {
        body["offset"] = json!(offset);
    }
    body
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationPolicy {
    pub page_size: usize,
    pub max_pages: usize,
    /// Optional cap on records kept per company.
    pub record_limit: Option<usize>,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 100,
            record_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    ShortPage,
    NoNewRecords,
    FetchFailed,
    PageCap,
    RecordLimit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub records: Vec<JsonValue>,
    pub pages_fetched: usize,
    pub stop_reason: StopReason,
}

/// Fetch every page for a company, dropping exact duplicates across pages.
///
/// A failed fetch keeps whatever was already collected; only a failure before
/// any record arrived is returned as an error.
pub async fn collect_all<S>(
    source: &mut S,
    company_label: &str,
    policy: &PaginationPolicy,
) -> Result<Collected, FetchError>
where
    S: QualityDataSource + ?Sized,
{
    let page_size = policy.page_size.max(1);
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut pages_fetched = 0usize;
    let mut stop_reason = StopReason::PageCap;

    for page_index in 1..=policy.max_pages {
        let offset = (page_index - 1) * page_size;
        let batch = match source.fetch_page(company_label, Some(page_size), offset).await {
            Ok(batch) => batch,
            Err(err) if records.is_empty() => return Err(err),
            Err(err) => {
                warn!(stage = "fetch", company = company_label, page_index, error = %err, "page fetch failed; keeping partial results");
                stop_reason = StopReason::FetchFailed;
                break;
            }
        };
        pages_fetched += 1;

        if batch.is_empty() {
            stop_reason = StopReason::Exhausted;
            break;
        }

        let batch_len = batch.len();
        let before = records.len();
        for record in batch {
            if seen.insert(dedup_key(&record)) {
                records.push(record);
            }
        }

        if records.len() == before {
            warn!(stage = "fetch", company = company_label, page_index, "page brought no new records; upstream may be ignoring pagination");
            stop_reason = StopReason::NoNewRecords;
            break;
        }

        if let Some(limit) = policy.record_limit {
            if records.len() >= limit {
                records.truncate(limit);
                stop_reason = StopReason::RecordLimit;
                break;
            }
        }

        if batch_len < page_size {
            stop_reason = StopReason::ShortPage;
            break;
        }
    }

    if stop_reason == StopReason::PageCap {
        warn!(stage = "fetch", company = company_label, max_pages = policy.max_pages, "page cap reached; stopping pagination");
    }
    info!(stage = "fetch", company = company_label, records = records.len(), pages_fetched, ?stop_reason, "collection finished");

    Ok(Collected {
        records,
        pages_fetched,
        stop_reason,
    })
}

fn id_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Upstream identity of a record: top-level `record_id` or `id`, else
/// `processed_data.record_id`.
pub fn external_record_id(record: &JsonValue) -> Option<String> {
    ["/record_id", "/id", "/processed_data/record_id"]
        .iter()
        .find_map(|pointer| record.pointer(pointer).and_then(id_text))
}

/// Dedup key: the upstream id when present, else a fingerprint of the business
/// fields the mapper reads. Wrapper metadata such as ingestion timestamps is
/// left out so re-served records still collapse.
pub fn dedup_key(record: &JsonValue) -> String {
    if let Some(id) = external_record_id(record) {
        return format!("id:{id}");
    }

    let payload = PayloadShape::resolve(record);
    let mut hasher = Sha256::new();
    for name in fingerprint_fields() {
        if let Some(value) = payload.field(name) {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b"\n");
        }
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub const FIELD_COMPANY: &str = "EMPRESA";
pub const FIELD_PRODUCER: &str = "PRODUCTOR";
pub const FIELD_RAW_MATERIAL_DATE: &str = "FECHA DE MP";
pub const FIELD_PROCESS_DATE: &str = "FECHA DE PROCESO";
pub const FIELD_TEMPERATURE: &str = "TEMPERATURA";
pub const FIELD_HUMIDITY: &str = "HUMEDAD";
pub const FIELD_PH: &str = "PH";
pub const FIELD_FIRMNESS: &str = "FIRMEZA";
pub const FIELD_BRIX: &str = "BRIX";
pub const FIELD_ACIDITY: &str = "ACIDEZ";
pub const FIELD_CALIBER: &str = "CALIBRE";
pub const FIELD_VARIETY: &str = "VARIEDAD";
pub const FIELD_OBSERVATIONS: &str = "OBSERVACIONES";
pub const FIELD_TOTAL_QUALITY_DEFECTS: &str = "TOTAL DE DEFECTOS DE CALIDAD";
pub const FIELD_TOTAL_NON_EXPORTABLE: &str = "TOTAL DE NO EXPORTABLE";
pub const FIELD_TOTAL_EXPORTABLE: &str = "TOTAL DE EXPORTABLE";
pub const FIELD_TOTAL_CONDITION: &str = "TOTAL DE CONDICION";

/// Defect categories reported as percentages, in description order.
pub const DEFECT_CATEGORIES: [&str; 34] = [
    "DESGARRO",
    "RESTOS FLORALES",
    "EXCRETA DE ABEJA",
    "HERIDA ABIERTA",
    "HERIDA CICATRIZADA",
    "FUMAGINA",
    "MACHUCON",
    "PICADO",
    "RUSSET",
    "QUERESA",
    "OTROS",
    "POLVO",
    "HONGOS",
    "OTROS2",
    "F.BLOOM",
    "EXUDACION",
    "F. MOJADA",
    "PUDRICION",
    "HALO VERDE",
    "SOBREMADURO",
    "BAJO CALIBRE",
    "BLANDA SEVERA",
    "BAYA COLAPSADA",
    "BAYA REVENTADA",
    "DAÑO DE TRIPS",
    "EXCRETA DE AVE",
    "FRUTOS ROJIZOS",
    "BLANDA MODERADO",
    "CHANCHITO BLANCO",
    "PRESENCIA DE LARVA",
    "DESHIDRATADO SEVERO",
    "FRUTOS CON PEDICELO",
    "DESHIDRATACIÓN  LEVE",
    "DESHIDRATACION MODERADO",
];

const SECONDARY_FIELDS: [&str; 16] = [
    "DESTINO",
    "PRESENTACION",
    "TIPO DE CAJA",
    "TIPO DE PRODUCTO",
    "TRAZABILIDAD",
    "PESO DE MUESTRA (g)",
    "EVALUADOR",
    "FUNDO",
    "LINEA",
    "MODULO",
    "TURNO",
    "VIAJE",
    "SEMANA",
    "HORA",
    "N° FCL",
    FIELD_TOTAL_CONDITION,
];

const PRIMARY_FIELDS: [&str; 17] = [
    FIELD_COMPANY,
    FIELD_PRODUCER,
    FIELD_RAW_MATERIAL_DATE,
    FIELD_PROCESS_DATE,
    FIELD_TEMPERATURE,
    FIELD_HUMIDITY,
    FIELD_PH,
    FIELD_FIRMNESS,
    FIELD_BRIX,
    FIELD_ACIDITY,
    FIELD_CALIBER,
    FIELD_VARIETY,
    FIELD_OBSERVATIONS,
    FIELD_TOTAL_QUALITY_DEFECTS,
    FIELD_TOTAL_NON_EXPORTABLE,
    FIELD_TOTAL_EXPORTABLE,
    FIELD_TOTAL_CONDITION,
];

fn fingerprint_fields() -> impl Iterator<Item = &'static str> {
    PRIMARY_FIELDS
        .into_iter()
        .chain(SECONDARY_FIELDS)
        .chain(DEFECT_CATEGORIES)
}

/// Where the business fields of an external record live.
#[derive(Debug, Clone, Copy)]
pub enum PayloadShape<'a> {
    /// `{"processed_data": {"data": {...}}}`
    Wrapped(&'a JsonMap<String, JsonValue>),
    /// `{"data": {...}}`
    Enveloped(&'a JsonMap<String, JsonValue>),
    /// Fields at the top level.
    Flat(&'a JsonMap<String, JsonValue>),
    /// Not an object at all.
    Opaque,
}

impl<'a> PayloadShape<'a> {
    pub fn resolve(record: &'a JsonValue) -> Self {
        if let Some(fields) = record
            .pointer("/processed_data/data")
            .and_then(JsonValue::as_object)
        {
            return Self::Wrapped(fields);
        }
        if let Some(fields) = record.get("data").and_then(JsonValue::as_object) {
            return Self::Enveloped(fields);
        }
        match record.as_object() {
            Some(fields) => Self::Flat(fields),
            None => Self::Opaque,
        }
    }

    pub fn fields(&self) -> Option<&'a JsonMap<String, JsonValue>> {
        match self {
            Self::Wrapped(fields) | Self::Enveloped(fields) | Self::Flat(fields) => Some(fields),
            Self::Opaque => None,
        }
    }

    /// Field value; JSON null counts as absent.
    pub fn field(&self, name: &str) -> Option<&'a JsonValue> {
        self.fields()?.get(name).filter(|v| !v.is_null())
    }

    fn raw(&self, name: &str) -> Option<JsonValue> {
        self.field(name).cloned()
    }

    fn decimal(&self, name: &str) -> Option<f64> {
        safe_decimal(self.field(name))
    }

    fn text(&self, name: &str) -> String {
        self.field(name).map(text_value).unwrap_or_default()
    }
}

/// Lenient numeric conversion: numbers and numeric strings parse, everything
/// else (empty, non-numeric, non-finite) becomes `None`.
pub fn safe_decimal(value: Option<&JsonValue>) -> Option<f64> {
    let parsed = match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn text_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Parse an upstream timestamp. A trailing `Z` is read as `+00:00`; naive
/// date-times and plain dates are taken as UTC.
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = match trimmed.strip_suffix('Z').or_else(|| trimmed.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => trimmed.to_string(),
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(parsed) = DateTime::parse_from_str(&normalized, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// False for values the upstream uses to mean "not filled in".
fn is_reported(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Positive defect categories, each rendered with the value as reported.
fn defect_description(payload: &PayloadShape<'_>) -> String {
    DEFECT_CATEGORIES
        .iter()
        .filter_map(|name| {
            let reported = payload.field(name)?;
            safe_decimal(Some(reported))
                .filter(|value| *value > 0.0)
                .map(|_| format!("{name}: {}%", text_value(reported).trim()))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Map one external record, using the current time when no source date parses.
pub fn map_record(record: &JsonValue) -> MappedQualityRecord {
    map_record_at(record, Utc::now())
}

/// Map one external record. Never fails: unreadable fields become `None` or
/// fall back to defaults.
pub fn map_record_at(record: &JsonValue, ingested_at: DateTime<Utc>) -> MappedQualityRecord {
    let payload = PayloadShape::resolve(record);

    let company_label = [FIELD_COMPANY, FIELD_PRODUCER]
        .iter()
        .map(|name| payload.text(name))
        .find(|label| !label.trim().is_empty())
        .unwrap_or_default();

    // Only the first reported date is consulted; an unparseable one yields the ingestion time.
    let recorded_at = [FIELD_RAW_MATERIAL_DATE, FIELD_PROCESS_DATE]
        .iter()
        .filter_map(|name| payload.field(name))
        .find(|value| is_reported(value))
        .and_then(|value| value.as_str().and_then(parse_source_timestamp));
    let recorded_at = match recorded_at {
        Some(ts) => ts,
        None => {
            debug!(stage = "map", company = %company_label, "no readable source date; using ingestion time");
            ingested_at
        }
    };

    let measurements = Measurements {
        temperature: payload.decimal(FIELD_TEMPERATURE),
        humidity: payload.decimal(FIELD_HUMIDITY),
        ph: payload.decimal(FIELD_PH),
        firmness: payload.decimal(FIELD_FIRMNESS),
        soluble_solids: payload.decimal(FIELD_BRIX),
        titratable_acidity: payload.decimal(FIELD_ACIDITY),
    };

    let defect_percentage = payload
        .decimal(FIELD_TOTAL_QUALITY_DEFECTS)
        .or_else(|| payload.decimal(FIELD_TOTAL_NON_EXPORTABLE));
    let exportable = payload.decimal(FIELD_TOTAL_EXPORTABLE);

    let extended_attributes = ExtendedAttributes {
        destination: payload.raw("DESTINO"),
        variety: payload.raw(FIELD_VARIETY),
        presentation: payload.raw("PRESENTACION"),
        box_type: payload.raw("TIPO DE CAJA"),
        product_type: payload.raw("TIPO DE PRODUCTO"),
        traceability: payload.raw("TRAZABILIDAD"),
        sample_weight_g: payload.raw("PESO DE MUESTRA (g)"),
        total_exportable: payload.raw(FIELD_TOTAL_EXPORTABLE),
        total_non_exportable: payload.raw(FIELD_TOTAL_NON_EXPORTABLE),
        total_condition: payload.raw(FIELD_TOTAL_CONDITION),
        evaluator: payload.raw("EVALUADOR"),
        farm: payload.raw("FUNDO"),
        line: payload.raw("LINEA"),
        module: payload.raw("MODULO"),
        shift: payload.raw("TURNO"),
        trip: payload.raw("VIAJE"),
        week: payload.raw("SEMANA"),
        hour: payload.raw("HORA"),
        container_number: payload.raw("N° FCL"),
        producer: payload.raw(FIELD_PRODUCER),
        raw_material_date: payload.raw(FIELD_RAW_MATERIAL_DATE),
        process_date: payload.raw(FIELD_PROCESS_DATE),
        record_id: external_record_id(record),
        row_index: record
            .pointer("/processed_data/row_index")
            .filter(|v| !v.is_null())
            .cloned(),
        processed_at: record
            .pointer("/processed_data/processed_at")
            .filter(|v| !v.is_null())
            .cloned(),
    };

    if measurements.is_empty() && defect_percentage.is_none() {
        debug!(stage = "map", company = %company_label, "record carries no measurements; defaults applied");
    }

    MappedQualityRecord {
        company_label,
        recorded_at,
        measurements,
        defect_percentage,
        defect_description: defect_description(&payload),
        caliber: payload.text(FIELD_CALIBER),
        color: payload.text(FIELD_VARIETY),
        quality_grade: QualityGrade::from_defect_percentage(defect_percentage),
        approved: is_approved(exportable, defect_percentage),
        observations: payload.text(FIELD_OBSERVATIONS),
        extended_attributes,
        original_payload: record.clone(),
    }
}
