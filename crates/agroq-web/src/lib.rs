//! HTTP endpoints for on-demand quality sync and statistics.

use std::sync::Arc;

use agroq_adapters::{ExternalApiClient, ExternalApiConfig, PaginationPolicy};
use agroq_core::Principal;
use agroq_storage::{connect, run_migrations, PgDirectory, PgQualityStore, PrincipalDirectory, QualityStore};
use agroq_sync::{maybe_build_scheduler, QualitySync, SyncConfig};
use anyhow::Context;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "agroq-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn QualityStore>,
    pub principals: Arc<dyn PrincipalDirectory>,
    pub api: ExternalApiConfig,
    pub pagination: PaginationPolicy,
}

impl AppState {
    pub fn new(
        store: Arc<dyn QualityStore>,
        principals: Arc<dyn PrincipalDirectory>,
        api: ExternalApiConfig,
        pagination: PaginationPolicy,
    ) -> Self {
        Self {
            store,
            principals,
            api,
            pagination,
        }
    }
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    message: String,
    records_processed: usize,
    records_created: usize,
    records_updated: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/quality-data/sync", post(sync_handler))
        .route("/api/quality-data/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pool = connect(&config.database_url)
        .await
        .context("connecting to database")?;
    run_migrations(&pool).await.context("running migrations")?;

    let state = AppState::new(
        Arc::new(PgQualityStore::new(pool.clone())),
        Arc::new(PgDirectory::new(pool)),
        config.api.clone(),
        config.pagination.clone(),
    );

    let scheduler = maybe_build_scheduler(&config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduled quality sync enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving quality data API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(principal) => principal,
        Err(resp) => return resp,
    };
    let Some(company) = principal.company.clone() else {
        return forbidden();
    };

    let client = match ExternalApiClient::new(state.api.clone()) {
        Ok(client) => client,
        Err(err) => return server_error(format!("sync failed: {err:#}")),
    };
    let mut sync = QualitySync::new(client, state.store.clone(), state.pagination.clone());
    let actor = principal.actor();
    let result = sync.sync_company(&company.name, Some(&actor)).await;

    if result.success {
        Json(SyncResponse {
            message: result.message,
            records_processed: result.records_processed,
            records_created: result.records_created,
            records_updated: result.records_updated,
        })
        .into_response()
    } else {
        server_error(result.message)
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(principal) => principal,
        Err(resp) => return resp,
    };
    let Some(company) = principal.company.as_ref() else {
        return forbidden();
    };

    match state.store.quality_stats(Some(&company.name)).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(format!("could not compute quality stats: {err}")),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "authentication credentials were not provided",
        ));
    };
    match state.principals.principal_for_token(token).await {
        Ok(Some(principal)) => Ok(principal),
        Ok(None) => {
            warn!("rejected request with unknown token");
            Err(error_response(StatusCode::UNAUTHORIZED, "invalid token"))
        }
        Err(err) => Err(server_error(format!("could not verify credentials: {err}"))),
    }
}

fn forbidden() -> Response {
    error_response(
        StatusCode::FORBIDDEN,
        "user must be authenticated and assigned to a company",
    )
}

fn server_error(message: String) -> Response {
    error!(%message, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &message)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use agroq_core::CompanyRef;
    use agroq_storage::{HttpClientConfig, MemoryDirectory, MemoryQualityStore, MemoryUser};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn directory() -> MemoryDirectory {
        let company = CompanyRef {
            id: Uuid::new_v4(),
            name: "ACME".into(),
            active: true,
        };
        MemoryDirectory {
            companies: vec![company.clone()],
            users: vec![
                MemoryUser {
                    id: Uuid::new_v4(),
                    email: "qa@acme.test".into(),
                    company: Some(company),
                    is_admin: false,
                    is_manager: true,
                    token: Some("acme-token".into()),
                },
                MemoryUser {
                    id: Uuid::new_v4(),
                    email: "drifter@agroq.test".into(),
                    company: None,
                    is_admin: false,
                    is_manager: false,
                    token: Some("loose-token".into()),
                },
            ],
        }
    }

    fn api_config(base_url: String) -> ExternalApiConfig {
        ExternalApiConfig {
            base_url,
            username: "sync".into(),
            password: "secret".into(),
            login_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(5),
            http: HttpClientConfig::default(),
        }
    }

    fn state_with(store: Arc<MemoryQualityStore>, base_url: String) -> AppState {
        AppState::new(
            store,
            Arc::new(directory()),
            api_config(base_url),
            PaginationPolicy {
                page_size: 10,
                max_pages: 3,
                record_limit: None,
            },
        )
    }

    fn request(method: &str, uri: &str, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn spawn_upstream(records: Vec<JsonValue>) -> String {
        let upstream = Router::new()
            .route(
                "/api/v1/auth/login",
                post(|| async { Json(json!({"access_token": "upstream-token"})) }),
            )
            .route(
                "/api/v1/data/calidad-producto-terminado",
                post(move |Json(body): Json<JsonValue>| {
                    let records = records.clone();
                    async move {
                        let offset = body["offset"].as_u64().unwrap_or(0) as usize;
                        Json(records.into_iter().skip(offset).collect::<Vec<_>>())
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn sync_requires_credentials() {
        let app = app(state_with(Arc::new(MemoryQualityStore::new()), "http://127.0.0.1:1".into()));
        let resp = app
            .clone()
            .oneshot(request("POST", "/api/quality-data/sync", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(request("POST", "/api/quality-data/sync", Some("nope")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn user_without_company_is_forbidden() {
        let app = app(state_with(Arc::new(MemoryQualityStore::new()), "http://127.0.0.1:1".into()));
        let resp = app
            .clone()
            .oneshot(request("POST", "/api/quality-data/sync", Some("loose-token")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .oneshot(request("GET", "/api/quality-data/stats", Some("loose-token")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_server_error() {
        let app = app(state_with(Arc::new(MemoryQualityStore::new()), "http://127.0.0.1:1".into()));
        let resp = app
            .oneshot(request("POST", "/api/quality-data/sync", Some("acme-token")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("authenticate"));
    }

    #[tokio::test]
    async fn sync_pulls_company_records_and_stats_reflect_them() {
        let records = vec![
            json!({"record_id": "a-1", "EMPRESA": "ACME", "FECHA DE MP": "2024-01-01T00:00:00Z", "TEMPERATURA": 2.0, "TOTAL DE DEFECTOS DE CALIDAD": 1}),
            json!({"record_id": "a-2", "EMPRESA": "ACME", "FECHA DE MP": "2024-01-02T00:00:00Z", "TEMPERATURA": 4.0, "TOTAL DE DEFECTOS DE CALIDAD": 12}),
        ];
        let base_url = spawn_upstream(records).await;
        let store = Arc::new(MemoryQualityStore::new());
        let app = app(state_with(store.clone(), base_url));

        let resp = app
            .clone()
            .oneshot(request("POST", "/api/quality-data/sync", Some("acme-token")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["records_processed"], json!(2));
        assert_eq!(body["records_created"], json!(2));
        assert_eq!(body["records_updated"], json!(0));
        assert_eq!(body["message"], json!("sync completed for ACME"));

        let rows = store.records_for_company("ACME").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.created_by.is_some()));

        let resp = app
            .oneshot(request("GET", "/api/quality-data/stats", Some("acme-token")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let stats = json_body(resp).await;
        assert_eq!(stats["total_records"], json!(2));
        assert_eq!(stats["approved_records"], json!(1));
        assert_eq!(stats["avg_temperature"], json!(3.0));
        assert_eq!(stats["grade_breakdown"]["excelente"], json!(1));
        assert_eq!(stats["grade_breakdown"]["mala"], json!(1));
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "bearer  ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
