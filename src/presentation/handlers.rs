// HTTP request handlers
use crate::application::timeseries_service::MeasuredSeries;
use crate::domain::error::{ExecutionError, RuleId, StoreError};
use crate::domain::station::DisplayTimezone;
use crate::domain::timeseries::TimeseriesId;
use crate::infrastructure::chunked_text::{chunked_text_stream, record_chunks};
use crate::infrastructure::http_response::{accepts_brotli, text_response};
use crate::infrastructure::text_format::{format_record, format_records, parse_timestamp};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
pub struct DataQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TimezoneQuery {
    /// Zone of naive timestamps in the body; the group's when absent.
    pub timezone: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Store(StoreError),
    Execution(ExecutionError),
    Status(StatusCode),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::Store(error)
    }
}

impl From<ExecutionError> for ApiError {
    fn from(error: ExecutionError) -> Self {
        ApiError::Execution(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Store(error) => {
                let status = match &error {
                    StoreError::TimeseriesNotFound(_)
                    | StoreError::GroupNotFound(_)
                    | StoreError::StationNotFound(_) => StatusCode::NOT_FOUND,
                    StoreError::OutOfOrderAppend { .. }
                    | StoreError::DuplicateTimestamp { .. }
                    | StoreError::UniqueViolation { .. } => StatusCode::CONFLICT,
                    StoreError::MalformedTimestamp { .. } | StoreError::MalformedRecord { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    StoreError::Backend(_) => {
                        tracing::error!(%error, "storage backend failure");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, error.to_string())
            }
            ApiError::Execution(error) => {
                let status = match error {
                    ExecutionError::UnknownRule(_) => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, error.to_string())
            }
            ApiError::Status(status) => (status, status.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn parse_timezone(text: Option<&str>) -> Result<Option<DisplayTimezone>, ApiError> {
    text.map(|t| {
        DisplayTimezone::parse(t).ok_or_else(|| ApiError::BadRequest(format!("\"{}\" is not a valid time zone", t)))
    })
    .transpose()
}

/// A range bound; a bare date means its midnight.
fn parse_bound(text: Option<&str>, tz: FixedOffset) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(text) = text else {
        return Ok(None);
    };
    let text = text.trim();
    let timestamp = if text.len() == 10 {
        parse_timestamp(&format!("{} 00:00", text), tz, 0)
    } else {
        parse_timestamp(text, tz, 0)
    };
    timestamp
        .map(Some)
        .map_err(|_| ApiError::BadRequest(format!("\"{}\" is not a valid date", text)))
}

fn group_timezone(state: &AppState, id: TimeseriesId) -> Result<DisplayTimezone, ApiError> {
    let catalog = state.store.catalog();
    let timeseries = catalog.timeseries(id)?;
    Ok(catalog.group(timeseries.group_id)?.time_zone)
}

async fn load_series(
    state: &AppState,
    id: TimeseriesId,
    query: &DataQuery,
) -> Result<MeasuredSeries, ApiError> {
    let timezone = parse_timezone(query.timezone.as_deref())?;
    let range_tz = match &timezone {
        Some(tz) => tz.offset(),
        None => group_timezone(state, id)?.offset(),
    };
    let start = parse_bound(query.start_date.as_deref(), range_tz)?;
    let end = parse_bound(query.end_date.as_deref(), range_tz)?;
    Ok(state.store.get_data(id, start, end, timezone).await?)
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Records in the text format, in the requested (or the group's) time zone
pub async fn get_data(
    Path(id): Path<TimeseriesId>,
    Query(query): Query<DataQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let compress = accepts_brotli(&headers);
    let series = load_series(&state, id, &query).await?;
    let body = format_records(
        &series.data,
        series.metadata.timezone.offset(),
        series.metadata.precision,
    );
    text_response(body, compress).await.map_err(ApiError::Status)
}

/// Same records as `get_data`, streamed in chunks
pub async fn stream_data(
    Path(id): Path<TimeseriesId>,
    Query(query): Query<DataQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let series = load_series(&state, id, &query).await?;
    let chunks = record_chunks(
        series.data,
        series.metadata.timezone.offset(),
        series.metadata.precision,
    );
    chunked_text_stream(chunks).map_err(ApiError::Status)
}

/// The last record as a single line; empty when the series has none
pub async fn bottom(
    Path(id): Path<TimeseriesId>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let catalog = state.store.catalog();
    let group = catalog.group(catalog.timeseries(id)?.group_id)?;
    let body = match state.store.last_record(id).await? {
        Some(record) => format!("{}\r\n", format_record(&record, group.time_zone.offset(), group.precision)),
        None => String::new(),
    };
    text_response(body, false).await.map_err(ApiError::Status)
}

pub async fn append_data(
    Path(id): Path<TimeseriesId>,
    Query(query): Query<TimezoneQuery>,
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Response, ApiError> {
    let timezone = parse_timezone(query.timezone.as_deref())?;
    let count = state.store.append_data(id, body.as_str(), timezone.as_ref()).await?;
    Ok(Json(json!({ "count": count })).into_response())
}

pub async fn replace_data(
    Path(id): Path<TimeseriesId>,
    Query(query): Query<TimezoneQuery>,
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Response, ApiError> {
    let timezone = parse_timezone(query.timezone.as_deref())?;
    let count = state.store.set_data(id, body.as_str(), timezone.as_ref()).await?;
    Ok(Json(json!({ "count": count })).into_response())
}

/// External re-trigger of a rule; the run itself happens on the dispatcher
pub async fn execute_autoprocess(
    Path(id): Path<RuleId>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    state.dispatcher.schedule(id)?;
    tracing::info!(rule_id = id, "auto process execution requested");
    Ok((StatusCode::ACCEPTED, Json(json!({ "scheduled": id }))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::autoprocess::checks::{Checks, RangeCheck};
    use crate::application::autoprocess::registry::RuleRegistry;
    use crate::application::autoprocess::{AutoProcess, RuleKind};
    use crate::application::dispatcher::Dispatcher;
    use crate::application::timeseries_service::tests::store;
    use crate::domain::timeseries::{TimeseriesKey, TimeseriesType};
    use crate::presentation::router;
    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, TimeseriesId) {
        let store = store();
        let timeseries = store
            .ensure_timeseries(1, TimeseriesKey::stage(TimeseriesType::Initial))
            .unwrap();
        let registry = Arc::new(RuleRegistry::new());
        let checks = Checks::new(Some(RangeCheck::new(0.0, 10.0).unwrap()), None).unwrap();
        registry.insert(AutoProcess::new(1, 1, RuleKind::Checks(checks)));
        let (dispatcher, _failures) = Dispatcher::start(store.clone(), registry, 1, Duration::from_secs(10));
        (router(Arc::new(AppState { store, dispatcher })), timeseries.id)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri).body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_append_then_read_in_display_timezone() {
        let (app, id) = app();
        let (status, body) = send(
            &app,
            post(
                &format!("/timeseries/{}/data?timezone=UTC", id),
                "2019-05-21 10:00,1.5,\n2019-05-21 10:10,,SUSPECT\n",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"count":2}"#);

        let (status, body) = send(&app, get(&format!("/timeseries/{}/data", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "2019-05-21 12:00,1.50,\r\n2019-05-21 12:10,,SUSPECT\r\n");

        let uri = format!("/timeseries/{}/data?timezone=UTC&start_date=2019-05-21%2010:05", id);
        let (_, body) = send(&app, get(&uri)).await;
        assert_eq!(body, "2019-05-21 10:10,,SUSPECT\r\n");

        let (_, body) = send(&app, get(&format!("/timeseries/{}/bottom", id))).await;
        assert_eq!(body, "2019-05-21 12:10,,SUSPECT\r\n");
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let (app, id) = app();
        let uri = format!("/timeseries/{}/data", id);
        send(&app, post(&uri, "2019-05-21 10:00,1,\n")).await;

        let (status, body) = send(&app, post(&uri, "2019-05-21 09:00,1,\n")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.starts_with(r#"{"error":"cannot append time series"#));

        let (status, _) = send(&app, post(&uri, "yesterday,1,\n")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get("/timeseries/999/data")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, get(&format!("{}?timezone=Mars", uri))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_replace_data() {
        let (app, id) = app();
        let uri = format!("/timeseries/{}/data?timezone=UTC", id);
        send(&app, post(&uri, "2019-05-21 10:00,1,\n")).await;
        let request = Request::put(&uri)
            .body(Body::from("2019-05-20 10:00,3,\n"))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&app, get(&uri)).await;
        assert_eq!(body, "2019-05-20 10:00,3.00,\r\n");
    }

    #[tokio::test]
    async fn test_compressed_and_streamed_reads() {
        let (app, id) = app();
        let uri = format!("/timeseries/{}/data?timezone=UTC", id);
        send(&app, post(&uri, "2019-05-21 10:00,1,\n")).await;

        let request = Request::get(&uri)
            .header(header::ACCEPT_ENCODING, "br")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "br");

        let (status, body) = send(&app, get(&format!("/timeseries/{}/data/stream?timezone=UTC", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "2019-05-21 10:00,1.00,\r\n");
    }

    #[tokio::test]
    async fn test_execute_autoprocess() {
        let (app, _) = app();
        let (status, _) = send(&app, post("/autoprocesses/1/execute", "")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, body) = send(&app, post("/autoprocesses/7/execute", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, r#"{"error":"auto process with id=7 does not exist"}"#);
    }
}
