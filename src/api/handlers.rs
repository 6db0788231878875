//! HTTP endpoint handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::Error;
use crate::metadata::SuggestKind;
use crate::telnet::manager::TOTAL_CONNECTIONS_HEADER;
use crate::types::QueryPayload;

use super::{AppState, PROCESSED_BYTES_HEADER};

/// Error wrapper mapping the taxonomy to HTTP responses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Expression carried in a request body
#[derive(Debug, Deserialize)]
pub struct ExpressionBody {
    /// The expression string
    #[serde(default)]
    pub expression: String,
}

/// Expression parse request body
#[derive(Debug, Deserialize)]
pub struct ExpressionParseBody {
    /// The expression string
    #[serde(default)]
    pub expression: String,
    /// Keyset used when expanding
    #[serde(default)]
    pub ksid: String,
    /// Expand group-by filters into one payload per group
    #[serde(default)]
    pub expand: bool,
}

fn require_keyset(keyset: &str) -> ApiResult<()> {
    if keyset.is_empty() {
        return Err(Error::not_found("keyset cannot be empty").into());
    }
    Ok(())
}

fn parse_bool(params: &HashMap<String, String>, name: &str) -> ApiResult<bool> {
    match params.get(name) {
        None => Ok(false),
        Some(raw) if raw.is_empty() => Ok(false),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::validation(format!("invalid boolean for {name}: {raw}")).into()),
    }
}

fn with_processed_bytes(bytes: u64, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    if let Ok(value) = HeaderValue::from_str(&bytes.to_string()) {
        response.headers_mut().insert(PROCESSED_BYTES_HEADER, value);
    }
    response
}

// ============================================================================
// Query surface
// ============================================================================

/// `POST /keysets/:keyset/api/query`
pub async fn query(
    State(state): State<Arc<AppState>>,
    Path(keyset): Path<String>,
    Json(payload): Json<QueryPayload>,
) -> ApiResult<Response> {
    require_keyset(&keyset)?;
    let outcome = state.query.query(&keyset, payload).await?;
    Ok(with_processed_bytes(
        outcome.processed_bytes,
        Json(outcome.entries),
    ))
}

/// `GET /keysets/:keyset/query/expression?exp=…&tsuid=bool`
pub async fn expression_query_get(
    State(state): State<Arc<AppState>>,
    Path(keyset): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let expression = params.get("exp").cloned().unwrap_or_default();
    let show_tsuids = parse_bool(&params, "tsuid")?;
    expression_query(state, keyset, expression, show_tsuids).await
}

/// `POST /keysets/:keyset/query/expression?tsuid=bool`
pub async fn expression_query_post(
    State(state): State<Arc<AppState>>,
    Path(keyset): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<ExpressionBody>,
) -> ApiResult<Response> {
    let show_tsuids = parse_bool(&params, "tsuid")?;
    expression_query(state, keyset, body.expression, show_tsuids).await
}

async fn expression_query(
    state: Arc<AppState>,
    keyset: String,
    expression: String,
    show_tsuids: bool,
) -> ApiResult<Response> {
    require_keyset(&keyset)?;
    let mut payloads = state.query.parse_expression(&expression, false, None).await?;
    let mut payload = payloads.remove(0);
    payload.show_tsuids = show_tsuids;

    let outcome = state.query.query(&keyset, payload).await?;
    Ok(with_processed_bytes(
        outcome.processed_bytes,
        Json(outcome.entries),
    ))
}

/// `GET /api/query/expression/check?exp=…`
pub async fn expression_check_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    let expression = params.get("exp").cloned().unwrap_or_default();
    state.query.check(&expression)?;
    Ok(StatusCode::OK)
}

/// `POST /api/query/expression/check`
pub async fn expression_check_post(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExpressionBody>,
) -> ApiResult<StatusCode> {
    state.query.check(&body.expression)?;
    Ok(StatusCode::OK)
}

/// `GET /api/query/expression/parse?exp=…&ksid=…&expand=bool`
pub async fn expression_parse_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Vec<QueryPayload>>> {
    let expression = params.get("exp").cloned().unwrap_or_default();
    let ksid = params.get("ksid").cloned().unwrap_or_default();
    let expand = parse_bool(&params, "expand")?;
    expression_parse(state, expression, ksid, expand).await
}

/// `POST /api/query/expression/parse`
pub async fn expression_parse_post(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExpressionParseBody>,
) -> ApiResult<Json<Vec<QueryPayload>>> {
    expression_parse(state, body.expression, body.ksid, body.expand).await
}

async fn expression_parse(
    state: Arc<AppState>,
    expression: String,
    ksid: String,
    expand: bool,
) -> ApiResult<Json<Vec<QueryPayload>>> {
    let keyset = if ksid.is_empty() { None } else { Some(ksid.as_str()) };
    let payloads = state
        .query
        .parse_expression(&expression, expand, keyset)
        .await?;
    Ok(Json(payloads))
}

/// `POST /api/query/expression/compile`
pub async fn expression_compile(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QueryPayload>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.query.compile(&payload)?))
}

/// `GET /keysets/:keyset/expression/expand?exp=…`
pub async fn expression_expand_get(
    State(state): State<Arc<AppState>>,
    Path(keyset): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let expression = params.get("exp").cloned().unwrap_or_default();
    expression_expand(state, keyset, expression).await
}

/// `POST /keysets/:keyset/expression/expand`
pub async fn expression_expand_post(
    State(state): State<Arc<AppState>>,
    Path(keyset): Path<String>,
    Json(body): Json<ExpressionBody>,
) -> ApiResult<Response> {
    expression_expand(state, keyset, body.expression).await
}

async fn expression_expand(
    state: Arc<AppState>,
    keyset: String,
    expression: String,
) -> ApiResult<Response> {
    require_keyset(&keyset)?;
    let expressions = state.query.expand_expression(&keyset, &expression).await?;
    if expressions.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(expressions).into_response())
}

/// `GET /keysets/:keyset/api/search/lookup?m=metric{k=v,…}`
pub async fn lookup(
    State(state): State<Arc<AppState>>,
    Path(keyset): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    require_keyset(&keyset)?;
    let textual = params
        .get("m")
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::validation("missing query parameter \"m\""))?;

    let response = state.query.lookup(&keyset, textual).await?;
    Ok(Json(response).into_response())
}

/// `GET /keysets/:keyset/api/suggest?type=metrics|tagk|tagv&q=prefix&max=N`
pub async fn suggest(
    State(state): State<Arc<AppState>>,
    Path(keyset): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Vec<String>>> {
    require_keyset(&keyset)?;

    let kind = match params.get("type").map(String::as_str) {
        None | Some("") => return Err(Error::validation("type required").into()),
        Some("metrics") => SuggestKind::Metric,
        Some("tagk") => SuggestKind::TagKey,
        Some("tagv") => SuggestKind::TagValue,
        Some(other) => {
            return Err(Error::validation(format!("unsupported type: {other}")).into())
        }
    };

    let max = match params.get("max") {
        None => None,
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| Error::validation(format!("invalid max: {raw}")))?,
        ),
    };

    let prefix = params.get("q").cloned().unwrap_or_default();
    let names = state.query.suggest(&keyset, kind, &prefix, max).await?;
    Ok(Json(names))
}

// ============================================================================
// Fleet control surface
// ============================================================================

/// `HEAD /node/telnet/connections`
pub async fn connection_count(State(state): State<Arc<AppState>>) -> Response {
    let count = state.manager.connection_count();
    let mut response = StatusCode::OK.into_response();
    if let Ok(value) = HeaderValue::from_str(&count.to_string()) {
        response
            .headers_mut()
            .insert(TOTAL_CONNECTIONS_HEADER, value);
    }
    response
}

/// `HEAD /node/telnet/balancing/halt`
pub async fn halt_balancing(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.manager.halt() {
        StatusCode::OK
    } else {
        StatusCode::PROCESSING
    }
}
