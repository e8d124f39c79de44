//! JSON API for HIAP prioritization, GPC required rows and import mapping.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap},
    routing::{get, patch, post},
    Json, Router,
};
use catalyst_core::gpc::{GpcCatalog, GpcError, RequiredGpcRow};
use catalyst_core::import_mapping::{reconcile, ExtractedRow, ImportMapping};
use catalyst_core::{
    normalize_languages, ActionType, InventoryRecord, InventoryType, Language, RankedAction,
    Ranking,
};
use catalyst_hiap::{HiapService, PollSummary, PrioritizeRequest, PrioritizeSummary};
use catalyst_storage::RankingStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

mod error;

pub use error::{ApiError, ApiResult, DataResponse};
use error::data;

pub const CRATE_NAME: &str = "catalyst-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub public_base_url: String,
    pub cron_secret: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("CATALYST_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);
        Self {
            port,
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| format!("http://localhost:{port}")),
            cron_secret: std::env::var("CRON_SECRET").ok().filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RankingStore>,
    pub hiap: HiapService,
    pub catalog: Arc<GpcCatalog>,
    pub cron_secret: Option<String>,
    pub public_base_url: String,
}

impl AppState {
    pub fn new(store: Arc<dyn RankingStore>, hiap: HiapService, config: &WebConfig) -> Result<Self, GpcError> {
        Ok(Self {
            store,
            hiap,
            catalog: Arc::new(GpcCatalog::embedded()?),
            cron_secret: config.cron_secret.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v0/health", get(health_handler))
        .route("/api/v1/projects/{project_id}/hiap/prioritize", post(prioritize_handler))
        .route("/api/v1/inventory/{inventory_id}/hiap", get(inventory_rankings_handler))
        .route(
            "/api/v1/hiap/rankings/{ranking_id}/actions/{action_id}",
            patch(select_action_handler),
        )
        .route("/api/v1/cron/hiap-poll", post(cron_poll_handler))
        .route("/api/v1/gpc/required-rows", get(required_rows_handler))
        .route("/api/v1/inventory/{inventory_id}/import/mapping", post(import_mapping_handler))
        .route("/.well-known/oauth-authorization-server", get(oauth_metadata_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "catalyst web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid {what} id: {raw}")))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

async fn load_inventory(state: &AppState, inventory_id: Uuid) -> Result<InventoryRecord, ApiError> {
    state
        .store
        .inventory(inventory_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("inventory {inventory_id} not found")))
}

async fn health_handler() -> Json<DataResponse<Value>> {
    data(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrioritizeBody {
    year: i32,
    action_type: String,
    #[serde(default)]
    languages: Vec<String>,
}

async fn prioritize_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    body: Result<Json<PrioritizeBody>, JsonRejection>,
) -> ApiResult<PrioritizeSummary> {
    let project_id = parse_id(&project_id, "project")?;
    let body = json_body(body)?;
    let action_type =
        ActionType::from_str(&body.action_type).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let languages = if body.languages.is_empty() {
        vec![Language::english()]
    } else {
        normalize_languages(&body.languages).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let summary = state
        .hiap
        .orchestrator
        .prioritize_project(&PrioritizeRequest {
            project_id,
            year: body.year,
            action_type,
            languages,
        })
        .await?;
    Ok(data(summary))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RankingsQuery {
    action_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RankingView {
    #[serde(flatten)]
    ranking: Ranking,
    ranked_actions: Vec<RankedAction>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InventoryRankings {
    inventory_id: Uuid,
    locode: String,
    rankings: Vec<RankingView>,
}

async fn inventory_rankings_handler(
    State(state): State<Arc<AppState>>,
    Path(inventory_id): Path<String>,
    Query(query): Query<RankingsQuery>,
) -> ApiResult<InventoryRankings> {
    let inventory_id = parse_id(&inventory_id, "inventory")?;
    let action_type = query
        .action_type
        .as_deref()
        .map(ActionType::from_str)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let inventory = load_inventory(&state, inventory_id).await?;

    let mut rankings = Vec::new();
    for ranking in state.store.rankings_for_inventory(inventory_id).await? {
        if action_type.is_some_and(|t| t != ranking.action_type) {
            continue;
        }
        let ranked_actions = state.store.ranked_actions(ranking.id).await?;
        rankings.push(RankingView {
            ranking,
            ranked_actions,
        });
    }
    Ok(data(InventoryRankings {
        inventory_id,
        locode: inventory.locode,
        rankings,
    }))
}

#[derive(Debug, Deserialize)]
struct SelectBody {
    selected: bool,
}

async fn select_action_handler(
    State(state): State<Arc<AppState>>,
    Path((ranking_id, action_id)): Path<(String, String)>,
    body: Result<Json<SelectBody>, JsonRejection>,
) -> ApiResult<Value> {
    let ranking_id = parse_id(&ranking_id, "ranking")?;
    let body = json_body(body)?;
    if state.store.ranking(ranking_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("ranking {ranking_id} not found")));
    }
    let updated = state
        .store
        .select_action(ranking_id, &action_id, body.selected)
        .await?;
    if updated == 0 {
        return Err(ApiError::NotFound(format!(
            "action {action_id} is not ranked in {ranking_id}"
        )));
    }
    Ok(data(json!({
        "rankingId": ranking_id,
        "actionId": action_id,
        "selected": body.selected,
        "updated": updated,
    })))
}

fn check_cron_secret(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("missing or invalid cron secret".into()))
    }
}

async fn cron_poll_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<PollSummary> {
    check_cron_secret(state.cron_secret.as_deref(), &headers)?;
    let summary = state.hiap.poller.poll_once().await?;
    Ok(data(summary))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequiredRowsQuery {
    inventory_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequiredRows {
    inventory_type: InventoryType,
    rows: Vec<RequiredGpcRow>,
}

async fn required_rows_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RequiredRowsQuery>,
) -> ApiResult<RequiredRows> {
    let raw = query
        .inventory_type
        .ok_or_else(|| ApiError::BadRequest("inventoryType is required".into()))?;
    let inventory_type = InventoryType::from_str(&raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(data(RequiredRows {
        inventory_type,
        rows: state.catalog.required_rows(inventory_type),
    }))
}

#[derive(Debug, Deserialize)]
struct MappingBody {
    rows: Vec<ExtractedRow>,
}

async fn import_mapping_handler(
    State(state): State<Arc<AppState>>,
    Path(inventory_id): Path<String>,
    body: Result<Json<MappingBody>, JsonRejection>,
) -> ApiResult<ImportMapping> {
    let inventory_id = parse_id(&inventory_id, "inventory")?;
    let body = json_body(body)?;
    let inventory = load_inventory(&state, inventory_id).await?;
    let required = state.catalog.required_rows(inventory.inventory_type);
    let mapping = reconcile(inventory.inventory_type, &required, &body.rows);
    info!(
        %inventory_id,
        mapped = mapping.summary.mapped,
        unmapped = mapping.summary.unmapped,
        "import mapping computed"
    );
    Ok(data(mapping))
}

async fn oauth_metadata_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let base = &state.public_base_url;
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/api/v1/token"),
        "revocation_endpoint": format!("{base}/api/v1/token/revoke"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["client_secret_post", "none"],
        "scopes_supported": ["read", "write"],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use catalyst_adapters::{
        AdapterError, BulkPrioritizationRequest, BulkPrioritizationResult, CityContext,
        CityContextSource, CityPrioritization, Explanation, PrioritizationMetadata,
        PrioritizerApi, RankedItem, TaskProgress, TaskStatus,
    };
    use catalyst_core::gpc::gpc_id;
    use catalyst_storage::MemoryRankingStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Completes every job immediately with a single action per city.
    struct InstantPrioritizer;

    #[async_trait]
    impl PrioritizerApi for InstantPrioritizer {
        async fn start_bulk(&self, _request: &BulkPrioritizationRequest) -> Result<String, AdapterError> {
            Ok("job-1".into())
        }

        async fn check_progress(&self, _task_id: &str) -> Result<TaskProgress, AdapterError> {
            Ok(TaskProgress {
                status: TaskStatus::Completed,
                error: None,
            })
        }

        async fn bulk_result(&self, _task_id: &str) -> Result<BulkPrioritizationResult, AdapterError> {
            Ok(BulkPrioritizationResult {
                prioritizer_response_list: vec![CityPrioritization {
                    metadata: PrioritizationMetadata {
                        locode: "BR SAO".into(),
                        start_time: None,
                        end_time: None,
                    },
                    ranked_actions_mitigation: vec![RankedItem {
                        action_id: "c40_0001".into(),
                        rank: 1,
                        explanation: Explanation::Plain("cuts emissions".into()),
                    }],
                    ranked_actions_adaptation: vec![],
                }],
            })
        }
    }

    struct StaticContext;

    #[async_trait]
    impl CityContextSource for StaticContext {
        async fn city_context(&self, locode: &str) -> Result<CityContext, AdapterError> {
            Ok(CityContext {
                locode: locode.to_string(),
                ..Default::default()
            })
        }
    }

    struct Fixture {
        app: Router,
        project: Uuid,
        inventory: Uuid,
    }

    async fn fixture(cron_secret: Option<&str>) -> Fixture {
        let store = Arc::new(MemoryRankingStore::new());
        let project = store.add_project("pilot").await;
        let city = store.add_city(project, "BR SAO", "São Paulo").await;
        let inventory = store.add_inventory(city, 2024, InventoryType::GpcBasic).await;
        store.add_inventory_value(inventory, "I.1.1", 10.0).await;

        let hiap = HiapService::new(store.clone(), Arc::new(InstantPrioritizer), Arc::new(StaticContext), 5);
        let config = WebConfig {
            port: 0,
            public_base_url: "https://catalyst.example.org/".into(),
            cron_secret: cron_secret.map(str::to_string),
        };
        let state = AppState::new(store, hiap, &config).unwrap();
        Fixture {
            app: app(state),
            project,
            inventory,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let f = fixture(None).await;
        let (status, body) = call(&f.app, "GET", "/api/v0/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn prioritize_then_poll_then_select() {
        let f = fixture(None).await;
        let uri = format!("/api/v1/projects/{}/hiap/prioritize", f.project);
        let (status, body) = call(
            &f.app,
            "POST",
            &uri,
            Some(json!({ "year": 2024, "actionType": "mitigation", "languages": ["en", "es"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["batch"]["outcome"], "started");
        assert_eq!(body["data"]["rankings"].as_array().unwrap().len(), 1);

        let hiap_uri = format!("/api/v1/inventory/{}/hiap", f.inventory);
        let (_, body) = call(&f.app, "GET", &hiap_uri, None).await;
        assert_eq!(body["data"]["rankings"][0]["status"], "PENDING");

        let (status, body) = call(&f.app, "POST", "/api/v1/cron/hiap-poll", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["rankingsSucceeded"], 1);

        let (_, body) = call(&f.app, "GET", &hiap_uri, None).await;
        let ranking = &body["data"]["rankings"][0];
        assert_eq!(ranking["status"], "SUCCESS");
        assert_eq!(ranking["rankedActions"].as_array().unwrap().len(), 2);
        let ranking_id = ranking["id"].as_str().unwrap().to_string();

        let select_uri = format!("/api/v1/hiap/rankings/{ranking_id}/actions/c40_0001");
        let (status, body) = call(&f.app, "PATCH", &select_uri, Some(json!({ "selected": true }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["updated"], 2);

        let (_, body) = call(&f.app, "GET", &hiap_uri, None).await;
        let actions = body["data"]["rankings"][0]["rankedActions"].as_array().unwrap();
        assert!(actions.iter().all(|a| a["isSelected"] == true));

        let missing = format!("/api/v1/hiap/rankings/{ranking_id}/actions/c40_9999");
        let (status, _) = call(&f.app, "PATCH", &missing, Some(json!({ "selected": true }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prioritize_validates_input() {
        let f = fixture(None).await;
        let uri = format!("/api/v1/projects/{}/hiap/prioritize", f.project);
        let (status, body) = call(
            &f.app,
            "POST",
            &uri,
            Some(json!({ "year": 2024, "actionType": "resilience" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("resilience"));

        let (status, _) = call(
            &f.app,
            "POST",
            "/api/v1/projects/not-a-uuid/hiap/prioritize",
            Some(json!({ "year": 2024, "actionType": "mitigation" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&f.app, "POST", &uri, Some(json!({ "actionType": "mitigation" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn unknown_inventory_is_not_found() {
        let f = fixture(None).await;
        let uri = format!("/api/v1/inventory/{}/hiap", Uuid::new_v4());
        let (status, body) = call(&f.app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"]["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn cron_requires_secret_when_configured() {
        let f = fixture(Some("s3cret")).await;
        let (status, _) = call(&f.app, "POST", "/api/v1/cron/hiap-poll", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let resp = f
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/cron/hiap-poll")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn required_rows_follow_inventory_type() {
        let f = fixture(None).await;
        let (status, _) = call(&f.app, "GET", "/api/v1/gpc/required-rows", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&f.app, "GET", "/api/v1/gpc/required-rows?inventoryType=gpc_basic", None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body["data"]["rows"].as_array().unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| {
            let sector = r["sectorRefNo"].as_str().unwrap();
            sector != "IV" && sector != "V"
        }));
    }

    #[tokio::test]
    async fn import_mapping_reconciles_against_the_inventory_type() {
        let f = fixture(None).await;
        let uri = format!("/api/v1/inventory/{}/import/mapping", f.inventory);
        let rows = json!({
            "rows": [
                {
                    "rowIndex": 1,
                    "gpcRefNo": "I.1.1",
                    "sectorId": gpc_id("I"),
                    "subsectorId": gpc_id("I.1"),
                    "subcategoryId": gpc_id("I.1.1")
                },
                {
                    "rowIndex": 2,
                    "gpcRefNo": "I.1.2",
                    "sectorId": gpc_id("II"),
                    "subsectorId": gpc_id("I.1"),
                    "subcategoryId": gpc_id("I.1.2")
                }
            ]
        });
        let (status, body) = call(&f.app, "POST", &uri, Some(rows)).await;
        assert_eq!(status, StatusCode::OK);

        let mapped = body["data"]["rows"].as_array().unwrap();
        let status_of = |ref_no: &str| {
            mapped
                .iter()
                .find(|r| r["gpcRefNo"] == ref_no)
                .map(|r| r["status"].as_str().unwrap().to_string())
                .unwrap()
        };
        assert_eq!(status_of("I.1.1"), "mapped");
        assert_eq!(status_of("I.1.2"), "unmapped");
        assert_eq!(status_of("I.2.1"), "missing_from_ecrf");

        let missing = format!("/api/v1/inventory/{}/import/mapping", Uuid::new_v4());
        let (status, _) = call(&f.app, "POST", &missing, Some(json!({ "rows": [] }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oauth_metadata_uses_public_base_url() {
        let f = fixture(None).await;
        let (status, body) = call(&f.app, "GET", "/.well-known/oauth-authorization-server", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["issuer"], "https://catalyst.example.org");
        assert_eq!(body["authorization_endpoint"], "https://catalyst.example.org/authorize");
    }
}
