use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use metrics_ledger_api::{DeleteRequest, MetricsLedgerApi, API_CONTRACT_VERSION};
use metrics_ledger_core::{
    DailyMetrics, LedgerError, ListQuery, MetricsTable, PlanMetrics, SheetLayout,
};
use metrics_ledger_store::{open_store, StoreBackend, DEFAULT_HTTP_TIMEOUT_SECS};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: MetricsLedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %err, status = status.as_u16(), "request failed");
        } else {
            tracing::warn!(error = %err, status = status.as_u16(), "request rejected");
        }
        Self { status, error: err.user_message() }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    api_contract_version: &'static str,
}

#[derive(Debug, Clone, clap::Args)]
struct StoreArgs {
    /// Local JSON workbook, used when no spreadsheet id is configured.
    #[arg(long, env = "METRICS_LEDGER_WORKBOOK")]
    workbook: Option<PathBuf>,
    #[arg(long, env = "METRICS_LEDGER_SPREADSHEET_ID")]
    spreadsheet_id: Option<String>,
    #[arg(long, env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    #[arg(long, env = "METRICS_LEDGER_DAILY_TAB", default_value = "Comercial")]
    daily_tab: String,
    #[arg(long, env = "METRICS_LEDGER_PLAN_TAB", default_value = "app")]
    plan_tab: String,
    #[arg(long, env = "METRICS_LEDGER_UNITS_TAB", default_value = "Unidades")]
    units_tab: String,
    #[arg(long, env = "METRICS_LEDGER_HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_HTTP_TIMEOUT_SECS)]
    http_timeout_secs: u64,
}

impl StoreArgs {
    fn backend(&self) -> Result<StoreBackend> {
        StoreBackend::resolve(
            self.workbook.clone(),
            self.spreadsheet_id.clone(),
            self.access_token.clone(),
            self.http_timeout_secs,
        )
    }

    fn layout(&self) -> SheetLayout {
        SheetLayout {
            daily_tab: self.daily_tab.clone(),
            plan_tab: self.plan_tab.clone(),
            units_tab: self.units_tab.clone(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "metrics-ledger-service")]
#[command(about = "HTTP service for the metrics ledger")]
struct Args {
    #[arg(long, env = "METRICS_LEDGER_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[command(flatten)]
    store: StoreArgs,
}

fn table_routes<T: MetricsTable>(router: Router<ServiceState>, base: &str) -> Router<ServiceState> {
    router
        .route(
            base,
            get(list_records::<T>)
                .post(create_record::<T>)
                .put(update_record::<T>)
                .delete(delete_record::<T>),
        )
        .route(&format!("{base}/totals"), get(record_totals::<T>))
}

fn app(state: ServiceState) -> Router {
    let router = Router::new()
        .route("/api/health", get(health))
        .route("/api/openapi", get(openapi))
        .route("/api/units", get(list_units));
    let router = table_routes::<DailyMetrics>(router, "/api/daily-metrics");
    let router = table_routes::<PlanMetrics>(router, "/api/plan-metrics");
    router.with_state(state)
}

fn init_tracing() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let backend = args.store.backend()?;
    let description = backend.describe();
    // The Sheets client is blocking and must be built off the async workers.
    let store = tokio::task::spawn_blocking(move || open_store(&backend))
        .await
        .context("store setup task failed")??;

    let state = ServiceState { api: MetricsLedgerApi::new(store, args.store.layout()) };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, store = %description, "metrics ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Run a store-bound call on the blocking pool.
async fn run_blocking<F, R>(work: F) -> Result<R, LedgerError>
where
    F: FnOnce() -> Result<R, LedgerError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| LedgerError::Internal(format!("blocking task failed: {err}")))?
}

/// List endpoints answer server-side failures with an empty array so forms keep rendering.
fn empty_list_on_failure<T: Serialize>(result: Result<Vec<T>, LedgerError>) -> Response {
    match result {
        Ok(items) => Json(items).into_response(),
        Err(err) if err.status_code() >= 500 => {
            tracing::error!(error = %err, "list read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(Vec::<T>::new())).into_response()
        }
        Err(err) => ServiceError::from(err).into_response(),
    }
}

fn query_or_error(query: Result<Query<ListQuery>, QueryRejection>) -> Result<ListQuery, ServiceError> {
    query
        .map(|Query(query)| query)
        .map_err(|rejection| LedgerError::InvalidPayload(rejection.body_text()).into())
}

fn body_or_error<P>(payload: Result<Json<P>, JsonRejection>) -> Result<P, ServiceError> {
    payload
        .map(|Json(payload)| payload)
        .map_err(|rejection| LedgerError::InvalidPayload(rejection.body_text()).into())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
    })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn list_units(State(state): State<ServiceState>) -> Response {
    empty_list_on_failure(run_blocking(move || state.api.list_units()).await)
}

async fn list_records<T: MetricsTable>(
    State(state): State<ServiceState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Response {
    let query = match query_or_error(query) {
        Ok(query) => query,
        Err(err) => return err.into_response(),
    };
    empty_list_on_failure(run_blocking(move || state.api.list::<T>(&query)).await)
}

async fn record_totals<T: MetricsTable>(
    State(state): State<ServiceState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Response, ServiceError> {
    let query = query_or_error(query)?;
    let totals = run_blocking(move || state.api.totals::<T>(&query)).await?;
    Ok(Json(totals).into_response())
}

async fn create_record<T: MetricsTable>(
    State(state): State<ServiceState>,
    payload: Result<Json<T::Payload>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let payload = body_or_error(payload)?;
    let created = run_blocking(move || state.api.create::<T>(payload)).await?;
    Ok(Json(created).into_response())
}

async fn update_record<T: MetricsTable>(
    State(state): State<ServiceState>,
    payload: Result<Json<T::Payload>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let payload = body_or_error(payload)?;
    let ack = run_blocking(move || state.api.update::<T>(payload)).await?;
    Ok(Json(ack).into_response())
}

async fn delete_record<T: MetricsTable>(
    State(state): State<ServiceState>,
    request: Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let request = body_or_error(request)?;
    let ack = run_blocking(move || state.api.delete::<T>(&request)).await?;
    Ok(Json(ack).into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use metrics_ledger_store::{MemoryWorkbook, WorkbookData};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn seeded_state(daily_rows: &[&[&str]], unit_rows: &[&[&str]]) -> ServiceState {
        let layout = SheetLayout::default();
        let mut data = WorkbookData::with_layout(&layout);
        if let Err(err) = data.push_rows(&layout.daily_tab, daily_rows) {
            panic!("failed to seed daily rows: {err}");
        }
        if let Err(err) = data.push_rows(&layout.units_tab, unit_rows) {
            panic!("failed to seed units: {err}");
        }
        ServiceState { api: MetricsLedgerApi::new(Arc::new(MemoryWorkbook::new(data)), layout) }
    }

    fn empty_state() -> ServiceState {
        seeded_state(&[], &[])
    }

    fn broken_state() -> ServiceState {
        ServiceState {
            api: MetricsLedgerApi::new(
                Arc::new(MemoryWorkbook::new(WorkbookData::default())),
                SheetLayout::default(),
            ),
        }
    }

    async fn send(router: Router, method: &str, uri: &str, body: Option<String>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body)),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn send_json(router: Router, method: &str, uri: &str, body: &Value) -> Response {
        send(router, method, uri, Some(body.to_string())).await
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn error_text(value: &Value) -> Option<&str> {
        value.get("error").and_then(Value::as_str)
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = send(app(empty_state()), "GET", "/api/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(Value::as_str), Some("ok"));
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let response = send(app(empty_state()), "GET", "/api/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read openapi body: {err}"),
        };
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("openapi: 3.0.3"));
        assert!(text.contains("/api/daily-metrics"));
        assert!(text.contains("/api/plan-metrics"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn create_returns_row_then_duplicate_conflicts() {
        let router = app(empty_state());
        let payload = json!({
            "date": "2024-03-05",
            "unidade": "U1",
            "leadsRecebidos": "10",
            "vendas": 2
        });

        let first = send_json(router.clone(), "POST", "/api/daily-metrics", &payload).await;
        assert_eq!(first.status(), StatusCode::OK);
        let value = response_json(first).await;
        assert_eq!(value, json!({"success": true, "row": 2}));

        let second = send_json(router.clone(), "POST", "/api/daily-metrics", &payload).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let value = response_json(second).await;
        assert_eq!(error_text(&value), Some("Já existe um registro para esta data e unidade"));

        let listed = response_json(send(router, "GET", "/api/daily-metrics", None).await).await;
        let records = listed.as_array().map(Vec::len);
        assert_eq!(records, Some(1));
        assert_eq!(listed[0].get("rowIndex").and_then(Value::as_u64), Some(2));
        assert_eq!(listed[0].get("date").and_then(Value::as_str), Some("05/03/2024"));
        assert_eq!(listed[0].get("sales").and_then(Value::as_str), Some("2"));
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn malformed_and_unknown_bodies_are_bad_requests() {
        let router = app(empty_state());

        let malformed = send(router.clone(), "POST", "/api/plan-metrics", Some("{not json".to_string())).await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_text(&response_json(malformed).await), Some("Requisição inválida"));

        let unknown = send_json(
            router.clone(),
            "POST",
            "/api/plan-metrics",
            &json!({"date": "2024-03-05", "unitId": "U1", "surprise": 1}),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

        let negative = send_json(
            router,
            "POST",
            "/api/plan-metrics",
            &json!({"date": "2024-03-05", "unitId": "U1", "plano": -4}),
        )
        .await;
        assert_eq!(negative.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_text(&response_json(negative).await), Some("Valor inválido para o campo planCount"));
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn update_requires_row_index_and_existing_row() {
        let router = app(seeded_state(&[&["01/03/2024", "U1", "1"]], &[]));

        let missing = send_json(
            router.clone(),
            "PUT",
            "/api/daily-metrics",
            &json!({"date": "2024-03-01", "unitId": "U1"}),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_text(&response_json(missing).await), Some("Índice da linha é obrigatório"));

        let absent = send_json(
            router.clone(),
            "PUT",
            "/api/daily-metrics",
            &json!({"rowIndex": 9, "date": "2024-03-01", "unitId": "U1"}),
        )
        .await;
        assert_eq!(absent.status(), StatusCode::NOT_FOUND);

        let updated = send_json(
            router.clone(),
            "PUT",
            "/api/daily-metrics",
            &json!({"rowIndex": 2, "date": "2024-03-01", "unitId": "U1", "leadsReceived": 8}),
        )
        .await;
        assert_eq!(updated.status(), StatusCode::OK);
        assert_eq!(response_json(updated).await, json!({"success": true}));

        let listed = response_json(send(router, "GET", "/api/daily-metrics", None).await).await;
        assert_eq!(listed[0].get("leadsReceived").and_then(Value::as_str), Some("8"));
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn delete_removes_row_and_shifts_the_rest() {
        let router = app(seeded_state(
            &[
                &["01/03/2024", "U1"],
                &["02/03/2024", "U1"],
                &["03/03/2024", "U1"],
                &["04/03/2024", "U1"],
                &["05/03/2024", "U1"],
            ],
            &[],
        ));

        let deleted = send_json(router.clone(), "DELETE", "/api/daily-metrics", &json!({"rowIndex": 3})).await;
        assert_eq!(deleted.status(), StatusCode::OK);

        let listed = response_json(send(router.clone(), "GET", "/api/daily-metrics", None).await).await;
        let dates = listed
            .as_array()
            .map(|records| {
                records
                    .iter()
                    .filter_map(|record| record.get("date").and_then(Value::as_str))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        assert_eq!(dates, vec!["01/03/2024", "03/03/2024", "04/03/2024", "05/03/2024"]);

        let stale = send_json(
            router,
            "DELETE",
            "/api/daily-metrics",
            &json!({"rowIndex": 3, "date": "02/03/2024", "unitId": "U1"}),
        )
        .await;
        assert_eq!(stale.status(), StatusCode::CONFLICT);
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn list_filters_and_totals_follow_query() {
        let router = app(seeded_state(
            &[
                &["01/03/2024", "U1", "1"],
                &["02/03/2024", "U2", "5"],
                &["20/02/2024", "U1", "3"],
            ],
            &[],
        ));

        let listed = response_json(
            send(router.clone(), "GET", "/api/daily-metrics?unitId=U1&order=asc", None).await,
        )
        .await;
        let rows = listed
            .as_array()
            .map(|records| {
                records.iter().filter_map(|record| record.get("rowIndex").and_then(Value::as_u64)).collect::<Vec<_>>()
            })
            .unwrap_or_default();
        assert_eq!(rows, vec![4, 2]);

        let totals = response_json(
            send(router.clone(), "GET", "/api/daily-metrics/totals?from=2024-03-01&to=2024-03-31", None).await,
        )
        .await;
        assert_eq!(totals.get("leadsReceived").and_then(Value::as_u64), Some(6));

        let bad = send(router, "GET", "/api/daily-metrics?from=03-2024", None).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn units_endpoint_lists_complete_rows() {
        let router = app(seeded_state(&[], &[&["U1", "Centro"], &["U2"], &["U3", "Norte"]]));
        let response = send(router, "GET", "/api/units", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            json!([{"id": "U1", "displayName": "Centro"}, {"id": "U3", "displayName": "Norte"}])
        );
    }

    // Test IDs: TSVC-009
    #[tokio::test]
    async fn read_failures_degrade_to_empty_lists() {
        let router = app(broken_state());

        let units = send(router.clone(), "GET", "/api/units", None).await;
        assert_eq!(units.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response_json(units).await, json!([]));

        let records = send(router.clone(), "GET", "/api/plan-metrics", None).await;
        assert_eq!(records.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response_json(records).await, json!([]));

        let create = send_json(
            router,
            "POST",
            "/api/plan-metrics",
            &json!({"date": "2024-03-05", "unitId": "U1"}),
        )
        .await;
        assert_eq!(create.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_text(&response_json(create).await), Some("Erro ao ler dados da planilha"));
    }
}
