use http_body_util::{BodyExt, Full, Limited};
use hyper::{
    Method, Request, Response, StatusCode,
    body::{Body, Bytes},
    header,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::convert::Infallible;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    AppState,
    error::{ApiError, Result},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Field-fill values are kept raw: any present, truthy value is accepted,
/// and only strings can ever name a tracked field.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackFieldFill {
    variant: Option<Value>,
    field_name: Option<Value>,
}

enum FillValue {
    Missing,
    Text(String),
    Other,
}

impl From<Option<Value>> for FillValue {
    fn from(value: Option<Value>) -> Self {
        match value {
            None | Some(Value::Null) | Some(Value::Bool(false)) => FillValue::Missing,
            Some(Value::String(s)) if s.is_empty() => FillValue::Missing,
            Some(Value::String(s)) => FillValue::Text(s),
            Some(Value::Number(n)) if n.as_f64() == Some(0.0) => FillValue::Missing,
            Some(_) => FillValue::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrackSubmission {
    variant: Option<String>,
}

#[derive(Serialize)]
struct Success {
    success: bool,
}

const SUCCESS: Success = Success { success: true };

pub async fn handle_request<B>(
    req: Request<B>,
    state: AppState,
) -> std::result::Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    state.metrics.record_request();

    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let result = match (&method, path.as_str()) {
        (&Method::GET, "/health") => {
            json(StatusCode::OK, &serde_json::json!({ "status": "healthy" }))
        }

        // Assign the next visitor to a form variant
        (&Method::POST, "/api/visitor") => {
            let assignment = state.experiment.assign_visitor();
            json(StatusCode::OK, &assignment)
        }

        (&Method::POST, "/api/track-field-fill") => track_field_fill(req, &state).await,

        (&Method::POST, "/api/track-submission") => track_submission(req, &state).await,

        (&Method::GET, "/api/stats") => json(StatusCode::OK, &state.experiment.stats()),

        (&Method::POST, "/api/stats/reset") => {
            state.experiment.reset();
            json(StatusCode::OK, &SUCCESS)
        }

        (&Method::GET, "/metrics") => json(StatusCode::OK, &state.metrics.snapshot()),

        _ => Err(ApiError::NotFound),
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            state.metrics.record_rejection();
            match &e {
                ApiError::Internal(detail) => error!("{} {} failed: {}", method, path, detail),
                ApiError::InvalidJson(detail) => {
                    warn!("{} {} invalid JSON: {}", method, path, detail)
                }
                ApiError::NotFound => info!("{} {} not found", method, path),
                _ => warn!("{} {} rejected: {}", method, path, e),
            }
            error_response(&e)
        }
    };

    Ok(response)
}

async fn track_field_fill<B>(req: Request<B>, state: &AppState) -> Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let body: TrackFieldFill = read_json(req, state.max_body_bytes).await?;

    match (FillValue::from(body.variant), FillValue::from(body.field_name)) {
        (FillValue::Missing, _) | (_, FillValue::Missing) => {
            return Err(ApiError::Validation(
                "Missing variant or fieldName".to_string(),
            ));
        }
        (FillValue::Text(variant), FillValue::Text(field_name)) => {
            state.experiment.record_field_fill(&variant, &field_name)?;
        }
        _ => debug!("ignoring fill with non-string variant or fieldName"),
    }

    json(StatusCode::OK, &SUCCESS)
}

async fn track_submission<B>(req: Request<B>, state: &AppState) -> Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let body: TrackSubmission = read_json(req, state.max_body_bytes).await?;
    let variant = body
        .variant
        .ok_or_else(|| ApiError::Validation("Missing variant".to_string()))?;

    state.experiment.record_submission(&variant)?;
    json(StatusCode::OK, &SUCCESS)
}

/// Collects a capped body and decodes it; an empty body reads as `{}`.
async fn read_json<T, B>(req: Request<B>, limit: usize) -> Result<T>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<BoxError>,
{
    let limited_body = Limited::new(req.into_body(), limit);
    let body_bytes = match limited_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            return Err(ApiError::PayloadTooLarge);
        }
        Err(e) => return Err(ApiError::Internal(format!("failed to read body: {e}"))),
    };

    if body_bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_slice(b"{}")?);
    }

    Ok(serde_json::from_slice(&body_bytes)?)
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(build(status, body))
}

fn error_response(err: &ApiError) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&err.body())
        .unwrap_or_else(|_| br#"{"error":"Internal error"}"#.to_vec());
    build(err.status(), body)
}

fn build(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

pub async fn shutdown_signal() {
    // Wait for the CTRL+C signal
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
}
