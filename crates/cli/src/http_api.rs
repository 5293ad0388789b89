use crate::wire::{
    export_filename, ExportRequest, HeatmapRequest, HeatmapResponse, SaveRulesRequest,
    TilesResponse,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tilescope_engine::{
    distribution, summary, CancellationToken, EngineError, ExportService, HeatmapAssembler,
    QueryEngine, QueryRequest, StatsAggregator,
};
use tilescope_protocol::{serialize_json, ErrorEnvelope, ExportLimits, HealthResponse, MessageResponse};
use tilescope_rules::{CompiledRuleSet, RuleError, RuleSetStore, SavePolicy};
use tilescope_store::TileStore;

pub(crate) struct AppState {
    pub store: Arc<TileStore>,
    pub rules: Arc<dyn RuleSetStore>,
    pub export_csv_limit: usize,
    pub max_grid_cells: u64,
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tiles", post(search_tiles))
        .route("/heatmap", post(generate_heatmap))
        .route("/tile_details", get(tile_details))
        .route("/source_files", get(source_files))
        .route("/heatmap/rules/save", post(save_rules))
        .route("/heatmap/rules/list", get(list_rules))
        .route("/heatmap/rules/load/:name", get(load_rules))
        .route("/heatmap/rules/delete/:name", delete(delete_rules))
        .route("/stats/summary", get(stats_summary))
        .route("/stats/distribution/:metric", get(stats_distribution))
        .route(
            "/stats/aggregate_heatmap_rules/:rule_name",
            get(aggregate_rules),
        )
        .route(
            "/stats/per_image_rule_report/:rule_name",
            get(per_image_report),
        )
        .route("/export/csv", post(export_csv))
        .route("/export/limits", get(export_limits))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    envelope: ErrorEnvelope,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            envelope: ErrorEnvelope::new(code, message),
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.envelope = self.envelope.with_hint(hint);
        self
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
            .hint("Verify the request body is valid JSON with the documented field names.")
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::Rules(err) => err.into(),
            EngineError::InvalidFilterKey(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_filter_key", message)
                    .hint("Use one of the tile field names, e.g. edge_density, sharpness, col.")
            }
            EngineError::InvalidOperator { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_operator", message)
                    .hint("Operators are == != < <= > >=; text fields accept only == and !=.")
            }
            EngineError::InvalidFilterValue { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_filter_value", message)
            }
            EngineError::InvalidPagination(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_pagination", message)
                    .hint("page starts at 1 and limit must be positive.")
            }
            EngineError::NonNumericMetric(_) => {
                Self::new(StatusCode::BAD_REQUEST, "non_numeric_metric", message)
            }
            EngineError::TileNotFoundAtCoordinates { .. } => {
                Self::new(StatusCode::NOT_FOUND, "tile_not_found", message)
            }
            EngineError::SourceFileNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "source_file_not_found", message)
                    .hint("GET /source_files lists ingested files.")
            }
            EngineError::ExportTooLarge { total, limit } => {
                let mut err = Self::new(StatusCode::PAYLOAD_TOO_LARGE, "export_too_large", message)
                    .hint("Narrow the filters; GET /export/limits shows the row cap.");
                err.envelope = err
                    .envelope
                    .with_details(serde_json::json!({ "total": total, "limit": limit }));
                err
            }
            EngineError::GridTooLarge { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "grid_too_large", message)
            }
            EngineError::Cancelled => {
                let mut err = Self::new(StatusCode::SERVICE_UNAVAILABLE, "cancelled", message);
                err.envelope = err.envelope.retryable(true);
                err
            }
            EngineError::Io(_) => Self::internal(message),
        }
    }
}

impl From<RuleError> for ApiError {
    fn from(err: RuleError) -> Self {
        let message = err.to_string();
        let retryable = err.is_retryable();
        let (status, code) = match err {
            RuleError::UnknownMetricKey { .. } => (StatusCode::BAD_REQUEST, "unknown_metric_key"),
            RuleError::InvalidOperator { .. } => (StatusCode::BAD_REQUEST, "invalid_operator"),
            RuleError::InvalidConditionValue { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_condition_value")
            }
            RuleError::InvalidLogicalOp { .. } => (StatusCode::BAD_REQUEST, "invalid_logical_op"),
            RuleError::InvalidRuleSetName(_) => {
                (StatusCode::BAD_REQUEST, "invalid_rule_set_name")
            }
            RuleError::RuleSetNotFound(_) => (StatusCode::NOT_FOUND, "rule_set_not_found"),
            RuleError::RuleSetNameCollision(_) => {
                (StatusCode::CONFLICT, "rule_set_name_collision")
            }
            RuleError::CorruptRuleSet { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "corrupt_rule_set")
            }
            RuleError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
        };
        let mut api = Self::new(status, code, message);
        api.envelope = api.envelope.retryable(retryable);
        match code {
            "rule_set_name_collision" => {
                api.hint("Choose another rule_name or send \"overwrite\": true.")
            }
            "store_unavailable" => api.hint("The rule store is busy or unreachable; retry shortly."),
            _ => api,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::warn!("{} {}: {}", self.status, self.envelope.code, self.envelope.message);
        } else {
            log::debug!("{} {}: {}", self.status, self.envelope.code, self.envelope.message);
        }
        let body = serialize_json(&self.envelope).unwrap_or_else(|_| {
            r#"{"code":"internal","message":"failed to encode error","hint":null,"retryable":false}"#
                .to_string()
        });
        (self.status, [(CONTENT_TYPE, "application/json")], body).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// An empty body decodes as `{}` so every field falls back to its default.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|err| ApiError::invalid_request(format!("Invalid JSON request: {err}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ApiError> {
    serde_json::to_vec(value).map_err(|err| ApiError::internal(format!("encode failed: {err}")))
}

fn json_bytes(bytes: Vec<u8>) -> Response {
    ([(CONTENT_TYPE, "application/json")], bytes).into_response()
}

fn json<T: Serialize>(value: &T) -> ApiResult {
    to_json(value).map(json_bytes)
}

/// Runs a store scan off the async workers. The drop guard cancels the scan
/// when the handler future is dropped, e.g. on client disconnect.
async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> Result<T, ApiError> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    tokio::task::spawn_blocking(move || work(&cancel))
        .await
        .map_err(|err| ApiError::internal(format!("worker task failed: {err}")))?
}

async fn search_tiles(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request: QueryRequest = parse_body(&body)?;
    let store = state.store.clone();
    let bytes = run_blocking(move |_| {
        let page = QueryEngine::new(&store).query(&request)?;
        to_json(&TilesResponse::from(page))
    })
    .await?;
    Ok(json_bytes(bytes))
}

async fn generate_heatmap(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request: HeatmapRequest = parse_body(&body)?;
    let rules = CompiledRuleSet::compile(&request.rules_config)?;
    let store = state.store.clone();
    let max_cells = state.max_grid_cells;
    let bytes = run_blocking(move |_| {
        let heatmap = HeatmapAssembler::new(&store)
            .with_max_cells(max_cells)
            .assemble_by_name(&request.json_filename, &rules)?;
        to_json(&HeatmapResponse::new(&heatmap, &rules))
    })
    .await?;
    Ok(json_bytes(bytes))
}

async fn tile_details(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let json_filename = params
        .get("json_filename")
        .ok_or_else(|| ApiError::invalid_request("Missing query parameter 'json_filename'"))?;
    let coordinate = |name: &str| -> Result<u32, ApiError> {
        let raw = params
            .get(name)
            .ok_or_else(|| ApiError::invalid_request(format!("Missing query parameter '{name}'")))?;
        raw.trim().parse().map_err(|_| {
            ApiError::invalid_request(format!("'{name}' must be a non-negative integer, got '{raw}'"))
        })
    };
    let (col, row) = (coordinate("col")?, coordinate("row")?);

    let tile = QueryEngine::new(&state.store).tile_at(json_filename, col, row)?;
    json(&tile)
}

async fn source_files(State(state): State<Arc<AppState>>) -> ApiResult {
    let names: Vec<&str> = state
        .store
        .source_files_by_name()
        .into_iter()
        .map(|s| s.json_filename.as_str())
        .collect();
    json(&names)
}

async fn save_rules(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request: SaveRulesRequest = parse_body(&body)?;
    let policy = if request.overwrite {
        SavePolicy::Overwrite
    } else {
        SavePolicy::Reject
    };
    state
        .rules
        .put(&request.rule_name, &request.rules_config, policy)
        .await?;
    json(&MessageResponse::new(format!(
        "Rule set '{}' saved.",
        request.rule_name
    )))
}

async fn list_rules(State(state): State<Arc<AppState>>) -> ApiResult {
    json(&state.rules.list().await?)
}

async fn load_rules(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    json(&state.rules.get(&name).await?)
}

async fn delete_rules(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    state.rules.delete(&name).await?;
    json(&MessageResponse::new(format!("Rule set '{name}' deleted.")))
}

async fn stats_summary(State(state): State<Arc<AppState>>) -> ApiResult {
    json(&summary(&state.store))
}

async fn stats_distribution(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
) -> ApiResult {
    let store = state.store.clone();
    let stats = run_blocking(move |_| Ok(distribution(&store, &metric)?)).await?;
    json(&stats)
}

async fn aggregate_rules(
    State(state): State<Arc<AppState>>,
    Path(rule_name): Path<String>,
) -> ApiResult {
    let rules = state.rules.load_compiled(&rule_name).await?;
    let store = state.store.clone();
    let bytes = run_blocking(move |cancel| {
        let report = StatsAggregator::new(&store).aggregate(&rules, cancel)?;
        to_json(&report)
    })
    .await?;
    Ok(json_bytes(bytes))
}

async fn per_image_report(
    State(state): State<Arc<AppState>>,
    Path(rule_name): Path<String>,
) -> ApiResult {
    let rules = state.rules.load_compiled(&rule_name).await?;
    let store = state.store.clone();
    let bytes = run_blocking(move |cancel| {
        let report = StatsAggregator::new(&store).per_image_report(&rules, cancel)?;
        to_json(&report)
    })
    .await?;
    Ok(json_bytes(bytes))
}

async fn export_csv(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request: ExportRequest = parse_body(&body)?;
    let store = state.store.clone();
    let limit = state.export_csv_limit;
    let csv = run_blocking(move |cancel| {
        Ok(ExportService::new(&store)
            .with_limit(limit)
            .export_csv(&request.filters, &request.sort, cancel)?)
    })
    .await?;

    let disposition = format!(
        "attachment; filename={}",
        export_filename(chrono::Local::now().date_naive())
    );
    Ok((
        [
            (CONTENT_TYPE, "text/csv".to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        csv,
    )
        .into_response())
}

async fn export_limits(State(state): State<Arc<AppState>>) -> ApiResult {
    json(&ExportLimits {
        export_csv_limit: state.export_csv_limit,
    })
}

async fn health(State(state): State<Arc<AppState>>) -> ApiResult {
    json(&HealthResponse {
        status: "ok".to_string(),
        tiles: state.store.len(),
        source_files: state.store.source_files().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tilescope_rules::MemoryRuleSetStore;
    use tilescope_store::{parse_producer_json, StoreBuilder};

    fn fixture_store() -> TileStore {
        let slide = serde_json::to_vec(&json!({
            "image_directory": "/data/slide",
            "tiles": {
                "a.webp": {"col": 0, "row": 0, "status": "success", "edge_density": 0.1, "max_subject_area": 1000.0},
                "b.webp": {"col": 1, "row": 0, "status": "success", "edge_density": 0.2, "max_subject_area": 100.0},
                "c.webp": {"col": 0, "row": 1, "status": "warning", "edge_density": 0.01},
                "d.webp": {"col": 2, "row": 1, "status": "success", "edge_density": 0.3},
                "e.webp": {"col": 2, "row": 0, "status": "error"}
            }
        }))
        .unwrap();
        let mut builder = StoreBuilder::new();
        builder
            .add_source(parse_producer_json("slide.json", &slide).unwrap())
            .unwrap();
        builder.build().unwrap()
    }

    struct TestServer {
        base: String,
        client: reqwest::Client,
    }

    impl TestServer {
        async fn start(export_csv_limit: usize) -> Self {
            let state = Arc::new(AppState {
                store: Arc::new(fixture_store()),
                rules: Arc::new(MemoryRuleSetStore::new()),
                export_csv_limit,
                max_grid_cells: 1_000,
            });
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router(state)).await.unwrap();
            });
            Self {
                base: format!("http://{addr}"),
                client: reqwest::Client::new(),
            }
        }

        async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let response = self
                .client
                .post(format!("{}{path}", self.base))
                .header("content-type", "application/json")
                .body(body.to_string())
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            let text = response.text().await.unwrap();
            (status, serde_json::from_str(&text).unwrap_or(Value::String(text)))
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let response = self
                .client
                .get(format!("{}{path}", self.base))
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, serde_json::from_str(&response.text().await.unwrap()).unwrap())
        }
    }

    fn subject_rules() -> Value {
        json!({
            "default_color": "#CCCCCC",
            "rules": [{
                "name": "subject",
                "color": "#0000ff",
                "rule_group": {"logical_op": "AND", "conditions": [
                    {"key": "max_subject_area", "op": ">=", "value": 456.0},
                    {"key": "edge_density", "op": ">=", "value": 0.01}
                ]}
            }]
        })
    }

    #[tokio::test]
    async fn tiles_endpoint_filters_sorts_and_paginates() {
        let server = TestServer::start(100).await;
        let (status, body) = server
            .post(
                "/tiles",
                json!({
                    "filters": [{"key": "edge_density", "op": ">", "value": 0.05}],
                    "sort": [{"key": "edge_density", "order": "asc"}],
                    "page": 1,
                    "limit": 2
                }),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["total_results"], 3);
        assert_eq!(body["page"], 1);
        assert_eq!(body["limit"], 2);
        let files: Vec<&str> = body["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["image_filename"].as_str().unwrap())
            .collect();
        assert_eq!(files, vec!["a.webp", "b.webp"]);
        assert_eq!(body["results"][0]["json_filename"], "slide.json");

        let (status, body) = server
            .post("/tiles", json!({"filters": [{"key": "nope", "op": ">", "value": 1}]}))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["code"], "invalid_filter_key");
        assert_eq!(body["retryable"], false);

        let (status, body) = server.post("/tiles", json!({"page": 0})).await;
        assert_eq!(status, 400);
        assert_eq!(body["code"], "invalid_pagination");
    }

    #[tokio::test]
    async fn heatmap_endpoint_renders_colors_and_counts() {
        let server = TestServer::start(100).await;
        let (status, body) = server
            .post(
                "/heatmap",
                json!({"json_filename": "slide.json", "rules_config": subject_rules()}),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["grid_width"], 3);
        assert_eq!(body["grid_height"], 2);
        assert_eq!(
            body["heatmap_data"],
            json!(["#0000ff", "#CCCCCC", "#CCCCCC", "#CCCCCC", "#CCCCCC", "#CCCCCC"])
        );
        assert_eq!(body["rule_match_counts"], json!({"0": 1, "default": 4}));
        assert_eq!(body["no_tile_count"], 1);
        assert_eq!(body["rules_config"], subject_rules());

        let (status, body) = server
            .post(
                "/heatmap",
                json!({"json_filename": "missing.json", "rules_config": subject_rules()}),
            )
            .await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "source_file_not_found");
    }

    #[tokio::test]
    async fn rule_set_lifecycle_over_http() {
        let server = TestServer::start(100).await;
        let save = json!({"rule_name": "qc", "rules_config": subject_rules()});

        let (status, body) = server.post("/heatmap/rules/save", save.clone()).await;
        assert_eq!(status, 200);
        assert_eq!(body["message"], "Rule set 'qc' saved.");

        let (status, body) = server.post("/heatmap/rules/save", save).await;
        assert_eq!(status, 409);
        assert_eq!(body["code"], "rule_set_name_collision");

        let (status, _) = server
            .post(
                "/heatmap/rules/save",
                json!({"rule_name": "qc", "rules_config": subject_rules(), "overwrite": true}),
            )
            .await;
        assert_eq!(status, 200);

        let bad = json!({"rule_name": "bad", "rules_config": {"default_color": "#000", "rules": [
            {"color": "#fff", "rule_group": {"logical_op": "AND", "conditions": [{"key": "blur", "op": ">", "value": 1}]}}
        ]}});
        let (status, body) = server.post("/heatmap/rules/save", bad).await;
        assert_eq!(status, 400);
        assert_eq!(body["code"], "unknown_metric_key");

        assert_eq!(server.get("/heatmap/rules/list").await.1, json!(["qc"]));
        assert_eq!(server.get("/heatmap/rules/load/qc").await.1, subject_rules());

        let (status, body) = server.get("/stats/aggregate_heatmap_rules/qc").await;
        assert_eq!(status, 200);
        assert_eq!(body["total_tiles_evaluated"], 5);
        assert_eq!(body["rule_match_counts"], json!({"0": 1, "default": 4}));
        assert_eq!(body["rule_match_percentages"]["0"], 20.0);

        let (status, body) = server.get("/stats/per_image_rule_report/qc").await;
        assert_eq!(status, 200);
        assert_eq!(body[0]["json_filename"], "slide.json");
        assert_eq!(body[0]["rule_match_details"][0]["rule_name"], "subject");

        let response = server
            .client
            .delete(format!("{}/heatmap/rules/delete/qc", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let (status, body) = server.get("/heatmap/rules/load/qc").await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "rule_set_not_found");
        assert_eq!(server.get("/stats/aggregate_heatmap_rules/qc").await.0, 404);
    }

    #[tokio::test]
    async fn tile_details_and_catalog_endpoints() {
        let server = TestServer::start(100).await;
        let (status, body) = server
            .get("/tile_details?json_filename=slide.json&col=2&row=1")
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["image_filename"], "d.webp");
        assert_eq!(body["json_filename"], "slide.json");

        let (status, body) = server
            .get("/tile_details?json_filename=slide.json&col=1&row=1")
            .await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "tile_not_found");

        let (status, _) = server.get("/tile_details?json_filename=slide.json&col=x&row=1").await;
        assert_eq!(status, 400);

        assert_eq!(server.get("/source_files").await.1, json!(["slide.json"]));
        assert_eq!(
            server.get("/stats/summary").await.1,
            json!({"total_source_files": 1, "total_image_tiles": 5})
        );
        let (_, dist) = server.get("/stats/distribution/edge_density").await;
        assert_eq!(dist["count"], 4);
        let (status, body) = server.get("/stats/distribution/status").await;
        assert_eq!(status, 400);
        assert_eq!(body["code"], "non_numeric_metric");
        assert_eq!(server.get("/health").await.1["tiles"], 5);
    }

    #[tokio::test]
    async fn export_respects_the_row_cap() {
        let server = TestServer::start(2).await;
        assert_eq!(
            server.get("/export/limits").await.1,
            json!({"export_csv_limit": 2})
        );

        let filters = json!({"filters": [{"key": "edge_density", "op": ">", "value": 0.05}]});
        let (status, body) = server.post("/export/csv", filters).await;
        assert_eq!(status, 413);
        assert_eq!(body["code"], "export_too_large");
        assert_eq!(body["details"], json!({"total": 3, "limit": 2}));

        let response = server
            .client
            .post(format!("{}/export/csv", server.base))
            .body(
                json!({"filters": [{"key": "edge_density", "op": ">", "value": 0.15}]})
                    .to_string(),
            )
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.headers()["content-type"], "text/csv");
        let disposition = response.headers()["content-disposition"].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment; filename=tile_export_"));
        let body = response.text().await.unwrap();
        assert_eq!(body.lines().count(), 3);
    }
}
